//! Tracked external process set
//!
//! Every spawned encoder registers here for its lifetime. Shutdown flips a
//! watch signal that each supervising task observes to kill its own child,
//! then waits for the set to drain so no encoder outlives the engine.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

/// How long shutdown waits for supervisors to reap their children.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ProcessRegistry {
    procs: DashMap<u32, Instant>,
    shutdown_tx: watch::Sender<bool>,
    drained: Notify,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            procs: DashMap::new(),
            shutdown_tx,
            drained: Notify::new(),
        }
    }

    /// Track one child process; dropping the guard untracks it.
    pub fn register(&self, pid: u32) -> ProcessGuard<'_> {
        self.procs.insert(pid, Instant::now());
        ProcessGuard {
            registry: self,
            pid,
        }
    }

    /// Signal observed by process supervisors; flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Number of live tracked processes.
    pub fn active(&self) -> usize {
        self.procs.len()
    }

    /// Kill every tracked encoder and wait for the set to drain.
    pub async fn shutdown(&self) {
        let active = self.procs.len();
        info!(active, "Terminating tracked encoder processes");
        let _ = self.shutdown_tx.send(true);

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.procs.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    stragglers = self.procs.len(),
                    "Encoder processes still tracked after drain timeout"
                );
                break;
            }
            let _ = tokio::time::timeout(remaining, self.drained.notified()).await;
        }
        self.procs.clear();
    }
}

/// RAII handle keeping one pid in the registry.
pub struct ProcessGuard<'a> {
    registry: &'a ProcessRegistry,
    pid: u32,
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        self.registry.procs.remove(&self.pid);
        if self.registry.procs.is_empty() {
            self.registry.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn guard_tracks_and_untracks() {
        let registry = ProcessRegistry::new();
        {
            let _a = registry.register(100);
            let _b = registry.register(200);
            assert_eq!(registry.active(), 2);
        }
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_drain() {
        let registry = Arc::new(ProcessRegistry::new());
        let mut signal = registry.shutdown_signal();

        let worker = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = registry.register(42);
                // Simulated supervisor: kill the child when signalled.
                signal.changed().await.unwrap();
            })
        };

        tokio::task::yield_now().await;
        registry.shutdown().await;
        worker.await.unwrap();
        assert_eq!(registry.active(), 0);
        assert!(registry.is_shutting_down());
    }
}
