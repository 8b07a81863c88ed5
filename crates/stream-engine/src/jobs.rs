//! In-flight transcode tracking
//!
//! Single-flight map keyed by `(media_id, quality, segment)`. The first
//! requester claims the key and runs the transcode; every later requester for
//! the same key awaits the stored result slot instead of spawning a second
//! encoder. Jobs deregister on every exit path, including task abort.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Uniqueness key for one transcode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub media_id: String,
    pub quality: String,
    pub segment: usize,
}

impl JobKey {
    pub fn new(media_id: impl Into<String>, quality: impl Into<String>, segment: usize) -> Self {
        Self {
            media_id: media_id.into(),
            quality: quality.into(),
            segment,
        }
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/segment {}", self.media_id, self.quality, self.segment)
    }
}

/// Error broadcast to every waiter of a failed job.
///
/// `Clone` and source-free; one result fans out to every coalesced
/// requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    TranscodeFailed { reason: String },
    ShuttingDown,
    Abandoned,
}

/// Outcome stored in the job's result slot.
pub type JobResult = Result<PathBuf, JobError>;

/// Map entry for one in-flight transcode.
struct TranscodingJob {
    is_prefetch: bool,
    started_at: Instant,
    rx: watch::Receiver<Option<JobResult>>,
}

/// Awaitable view of an in-flight job.
#[derive(Clone)]
pub struct JobWaiter {
    rx: watch::Receiver<Option<JobResult>>,
}

impl JobWaiter {
    /// Await the job's result; every waiter observes the same outcome.
    pub async fn wait(mut self) -> JobResult {
        loop {
            if let Some(result) = self.rx.borrow_and_update().as_ref() {
                return result.clone();
            }
            if self.rx.changed().await.is_err() {
                return Err(JobError::Abandoned);
            }
        }
    }
}

/// Exclusive right to run one transcode.
///
/// Created by [`JobTracker::claim`] for the first requester of a key. The job
/// stays registered until the handle is dropped; dropping without
/// [`JobHandle::finish`] broadcasts [`JobError::Abandoned`] so waiters never
/// hang.
pub struct JobHandle {
    key: JobKey,
    tx: watch::Sender<Option<JobResult>>,
    rx: watch::Receiver<Option<JobResult>>,
    jobs: Arc<DashMap<JobKey, TranscodingJob>>,
    finished: bool,
}

impl JobHandle {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// A waiter on this job, for the spawner itself.
    pub fn waiter(&self) -> JobWaiter {
        JobWaiter {
            rx: self.rx.clone(),
        }
    }

    /// Broadcast the result and deregister.
    pub fn finish(mut self, result: JobResult) {
        let _ = self.tx.send(Some(result));
        self.finished = true;
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.send(Some(Err(JobError::Abandoned)));
        }
        self.jobs.remove(&self.key);
    }
}

/// Result of claiming a key.
pub enum JobClaim {
    /// Someone else is already producing this segment
    Existing(JobWaiter),
    /// The caller owns the transcode
    New(JobHandle),
}

/// Point-in-time view of one tracked job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub media_id: String,
    pub quality: String,
    pub segment: usize,
    pub is_prefetch: bool,
    pub running_for_secs: f64,
}

/// Aggregate tracker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub active: usize,
    pub prefetch_active: usize,
    pub jobs: Vec<JobSnapshot>,
}

/// Process-wide single-flight registry of transcode jobs.
#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<DashMap<JobKey, TranscodingJob>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Awaitable view of an in-flight job, if any.
    pub fn get(&self, key: &JobKey) -> Option<JobWaiter> {
        self.jobs.get(key).map(|job| JobWaiter {
            rx: job.rx.clone(),
        })
    }

    /// Atomically observe-or-register a job for `key`.
    ///
    /// The check and the insert happen under one map-shard lock, which is
    /// what keeps concurrent requesters down to a single encoder.
    pub fn claim(&self, key: JobKey, is_prefetch: bool) -> JobClaim {
        match self.jobs.entry(key.clone()) {
            Entry::Occupied(entry) => JobClaim::Existing(JobWaiter {
                rx: entry.get().rx.clone(),
            }),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(TranscodingJob {
                    is_prefetch,
                    started_at: Instant::now(),
                    rx: rx.clone(),
                });
                JobClaim::New(JobHandle {
                    key,
                    tx,
                    rx,
                    jobs: self.jobs.clone(),
                    finished: false,
                })
            }
        }
    }

    /// Number of tracked jobs.
    pub fn active(&self) -> usize {
        self.jobs.len()
    }

    /// Number of tracked prefetch jobs.
    pub fn prefetch_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.is_prefetch).count()
    }

    pub fn stats(&self) -> TrackerStats {
        let jobs: Vec<JobSnapshot> = self
            .jobs
            .iter()
            .map(|entry| JobSnapshot {
                media_id: entry.key().media_id.clone(),
                quality: entry.key().quality.clone(),
                segment: entry.key().segment,
                is_prefetch: entry.is_prefetch,
                running_for_secs: entry.started_at.elapsed().as_secs_f64(),
            })
            .collect();
        TrackerStats {
            active: jobs.len(),
            prefetch_active: jobs.iter().filter(|j| j.is_prefetch).count(),
            jobs,
        }
    }

    /// Drop every tracked job; shutdown only.
    pub fn clear(&self) {
        self.jobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn second_claim_coalesces_onto_first() {
        let tracker = JobTracker::new();
        let key = JobKey::new("m", "720p", 3);

        let JobClaim::New(handle) = tracker.claim(key.clone(), false) else {
            panic!("first claim must be new");
        };
        let JobClaim::Existing(waiter) = tracker.claim(key.clone(), false) else {
            panic!("second claim must coalesce");
        };
        assert_eq!(tracker.active(), 1);

        let path = PathBuf::from("/hls/m/720p/segment_003.ts");
        handle.finish(Ok(path.clone()));

        assert_eq!(waiter.wait().await, Ok(path));
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn ten_concurrent_claims_yield_one_owner() {
        let tracker = JobTracker::new();
        let owners = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();

        for _ in 0..10 {
            let tracker = tracker.clone();
            let owners = owners.clone();
            tasks.push(tokio::spawn(async move {
                match tracker.claim(JobKey::new("m", "480p", 0), false) {
                    JobClaim::New(handle) => {
                        owners.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        handle.finish(Ok(PathBuf::from("/out.ts")));
                        PathBuf::from("/out.ts")
                    }
                    JobClaim::Existing(waiter) => waiter.wait().await.unwrap(),
                }
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), PathBuf::from("/out.ts"));
        }
        assert_eq!(owners.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn dropped_handle_broadcasts_abandoned() {
        let tracker = JobTracker::new();
        let key = JobKey::new("m", "360p", 9);

        let JobClaim::New(handle) = tracker.claim(key.clone(), false) else {
            panic!();
        };
        let waiter = tracker.get(&key).unwrap();
        drop(handle);

        assert_eq!(waiter.wait().await, Err(JobError::Abandoned));
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn failure_reaches_every_waiter() {
        let tracker = JobTracker::new();
        let key = JobKey::new("m", "720p", 1);

        let JobClaim::New(handle) = tracker.claim(key.clone(), false) else {
            panic!();
        };
        let first = tracker.get(&key).unwrap();
        let second = tracker.get(&key).unwrap();

        handle.finish(Err(JobError::TranscodeFailed {
            reason: "exit 1".into(),
        }));

        for waiter in [first, second] {
            assert_eq!(
                waiter.wait().await,
                Err(JobError::TranscodeFailed {
                    reason: "exit 1".into()
                })
            );
        }
    }

    #[test]
    fn prefetch_accounting() {
        let tracker = JobTracker::new();
        let _fg = tracker.claim(JobKey::new("m", "720p", 0), false);
        let _p1 = tracker.claim(JobKey::new("m", "720p", 1), true);
        let _p2 = tracker.claim(JobKey::new("m", "720p", 2), true);

        assert_eq!(tracker.active(), 3);
        assert_eq!(tracker.prefetch_count(), 2);

        let stats = tracker.stats();
        assert_eq!(stats.active, 3);
        assert_eq!(stats.prefetch_active, 2);

        tracker.clear();
        assert_eq!(tracker.active(), 0);
    }
}
