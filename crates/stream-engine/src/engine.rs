//! Streaming engine orchestration
//!
//! Owns the whole segment request path: metadata initialization, disk cache
//! lookup, in-flight coalescing, on-demand transcode dispatch with backend
//! fallback, prefetch fan-out, and process-group shutdown.

use crate::config::StreamConfig;
use crate::encoder::EncoderBackend;
use crate::errors::{StreamError, StreamResult};
use crate::jobs::{JobClaim, JobError, JobKey, JobResult, JobTracker, TrackerStats};
use crate::metadata::{MediaMetadata, MetadataCache};
use crate::playlist;
use crate::probe;
use crate::process::ProcessRegistry;
use crate::profiles::{self, QualityProfile};
use crate::segmenter::{self, SegmentPlan};
use crate::transcoder::{self, TranscodeOutcome, TranscodeSpec};
use dashmap::DashMap;
use media_catalog::MediaCatalog;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Diagnostic snapshot returned by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub jobs: TrackerStats,
    pub active_processes: usize,
    pub chosen_backend: Option<EncoderBackend>,
    pub cached_media: usize,
    pub shutting_down: bool,
}

/// Process-wide JIT streaming orchestrator.
///
/// Constructed once, shared behind an `Arc`, and shut down explicitly by the
/// owner. All state the engine mutates is owned here; nothing is global.
pub struct StreamingEngine {
    config: StreamConfig,
    catalog: Arc<dyn MediaCatalog>,
    metadata: MetadataCache,
    jobs: JobTracker,
    processes: Arc<ProcessRegistry>,
    /// Backend memoized after the first successful transcode, so an
    /// unavailable accelerator is not probed again on every segment.
    chosen_backend: RwLock<Option<EncoderBackend>>,
    /// Per-media critical sections for initialization.
    init_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl StreamingEngine {
    pub fn new(config: StreamConfig, catalog: Arc<dyn MediaCatalog>) -> Arc<Self> {
        Arc::new(Self {
            config,
            catalog,
            metadata: MetadataCache::new(),
            jobs: JobTracker::new(),
            processes: Arc::new(ProcessRegistry::new()),
            chosen_backend: RwLock::new(None),
            init_locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    pub async fn chosen_backend(&self) -> Option<EncoderBackend> {
        *self.chosen_backend.read().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.processes.is_shutting_down()
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            jobs: self.jobs.stats(),
            active_processes: self.processes.active(),
            chosen_backend: self.chosen_backend().await,
            cached_media: self.metadata.len(),
            shutting_down: self.is_shutting_down(),
        }
    }

    /// Prepare a media item for streaming and return its master playlist path.
    ///
    /// Idempotent with respect to the metadata cache; concurrent callers for
    /// the same media serialize on a per-media lock so only one probes and
    /// writes playlists. On-disk playlists are overwritten on a re-run.
    pub async fn initialize_streaming(&self, media_id: &str) -> StreamResult<PathBuf> {
        if self.is_shutting_down() {
            return Err(StreamError::ShuttingDown);
        }
        if self.metadata.has(media_id) {
            return Ok(self.config.master_playlist_path(media_id));
        }

        // Keyed critical section: initializing one media item must not block
        // requests for others.
        let lock = self
            .init_locks
            .entry(media_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.metadata.has(media_id) {
            return Ok(self.config.master_playlist_path(media_id));
        }

        let result = self.initialize_locked(media_id).await;
        if result.is_err() {
            // Roll back so a later request retries from scratch.
            self.metadata.delete(media_id);
        }
        result
    }

    async fn initialize_locked(&self, media_id: &str) -> StreamResult<PathBuf> {
        let record = self
            .catalog
            .find_media(media_id)
            .await?
            .ok_or_else(|| StreamError::NotFound {
                media_id: media_id.to_string(),
            })?;

        let source_exists = tokio::fs::metadata(&record.file_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !source_exists {
            warn!(media_id, path = %record.file_path.display(), "Source file missing");
            return Err(StreamError::NotFound {
                media_id: media_id.to_string(),
            });
        }

        info!(media_id, path = %record.file_path.display(), "Initializing streaming");

        let analysis = probe::analyze(
            &self.config.tools,
            &record.file_path,
            self.config.segment_duration,
        )
        .await?;

        let plan = match probe::analyze_keyframes(&self.config.tools, &record.file_path).await {
            Ok(keyframes) => {
                probe::validate_keyframe_structure(&record.file_path, &keyframes, analysis.duration);
                let segments = segmenter::plan_from_keyframes(
                    &keyframes,
                    self.config.segment_duration,
                    analysis.duration,
                );
                if segments.is_empty() {
                    warn!(media_id, "Keyframe plan came up empty, using uniform bins");
                    SegmentPlan::Approximate {
                        segments: segmenter::plan_uniform(
                            self.config.segment_duration,
                            analysis.duration,
                        ),
                    }
                } else {
                    segmenter::check_tiling(media_id, &segments, analysis.duration);
                    SegmentPlan::Accurate {
                        keyframes,
                        segments,
                    }
                }
            }
            Err(e) => {
                warn!(media_id, error = %e, "Keyframe probe failed, using uniform bins");
                SegmentPlan::Approximate {
                    segments: segmenter::plan_uniform(
                        self.config.segment_duration,
                        analysis.duration,
                    ),
                }
            }
        };

        let available_profiles = profiles::eligible_profiles(analysis.width, analysis.height);

        self.write_playlists(media_id, &available_profiles, plan.segments())
            .await?;

        let total_segments = plan.segments().len();
        let metadata = MediaMetadata {
            media_id: media_id.to_string(),
            media_path: record.file_path,
            duration: analysis.duration,
            segment_duration: self.config.segment_duration,
            total_segments,
            available_profiles,
            analysis,
            plan,
        };

        info!(
            media_id,
            total_segments,
            accurate = metadata.plan.is_accurate(),
            profiles = metadata.available_profiles.len(),
            "Streaming initialized"
        );
        self.metadata.set(metadata);

        Ok(self.config.master_playlist_path(media_id))
    }

    async fn write_playlists(
        &self,
        media_id: &str,
        available_profiles: &[QualityProfile],
        segments: &[segmenter::Segment],
    ) -> StreamResult<()> {
        let master = playlist::master_playlist(available_profiles);
        playlist::write_playlist(&self.config.master_playlist_path(media_id), &master).await?;

        let variant = playlist::variant_playlist(segments);
        for profile in available_profiles {
            playlist::write_playlist(
                &self.config.variant_playlist_path(media_id, &profile.name),
                &variant,
            )
            .await?;
        }
        Ok(())
    }

    /// Resolve one segment request to an on-disk file.
    ///
    /// Cache lookup, then in-flight coalescing, then a fresh foreground
    /// transcode. Every resolution fires the prefetch window for the
    /// following segments.
    pub async fn get_segment(
        self: &Arc<Self>,
        media_id: &str,
        quality: &str,
        file_name: &str,
    ) -> StreamResult<PathBuf> {
        // Name validation comes first: a malformed request must not touch
        // the catalog or filesystem.
        let segment_number = segmenter::parse_segment_file_name(file_name).ok_or_else(|| {
            StreamError::BadSegmentName {
                name: file_name.to_string(),
            }
        })?;

        if self.is_shutting_down() {
            return Err(StreamError::ShuttingDown);
        }

        self.initialize_streaming(media_id).await?;
        let meta = self
            .metadata
            .get(media_id)
            .ok_or_else(|| StreamError::NotFound {
                media_id: media_id.to_string(),
            })?;

        if segment_number >= meta.total_segments {
            return Err(StreamError::SegmentOutOfRange {
                segment: segment_number,
                total: meta.total_segments,
            });
        }
        let profile = meta
            .profile(quality)
            .ok_or_else(|| StreamError::UnknownQuality {
                quality: quality.to_string(),
            })?
            .clone();

        let path = self.config.segment_path(media_id, quality, file_name);
        if file_exists(&path).await {
            debug!(media_id, quality, segment_number, "Segment cache hit");
            self.fire_prefetch(meta, quality, segment_number);
            return Ok(path);
        }

        let key = JobKey::new(media_id, quality, segment_number);
        let waiter = match self.jobs.claim(key, false) {
            JobClaim::Existing(waiter) => {
                debug!(media_id, quality, segment_number, "Coalescing onto in-flight job");
                waiter
            }
            JobClaim::New(handle) => {
                let waiter = handle.waiter();
                let engine = self.clone();
                let meta = meta.clone();
                let profile = profile.clone();
                let output = path.clone();
                // The transcode runs detached: an aborted HTTP request must
                // not cancel work the next request will want anyway.
                tokio::spawn(async move {
                    let result = engine
                        .perform_jit(&meta, &profile, segment_number, &output)
                        .await;
                    handle.finish(result);
                });
                waiter
            }
        };

        match waiter.wait().await {
            Ok(path) => {
                self.fire_prefetch(meta, quality, segment_number);
                Ok(path)
            }
            Err(e) => Err(self.job_error(media_id, quality, segment_number, e)),
        }
    }

    fn job_error(
        &self,
        media_id: &str,
        quality: &str,
        segment: usize,
        error: JobError,
    ) -> StreamError {
        match error {
            JobError::ShuttingDown => StreamError::ShuttingDown,
            JobError::TranscodeFailed { reason } => StreamError::TranscodeFailed {
                media_id: media_id.to_string(),
                quality: quality.to_string(),
                segment,
                reason,
            },
            JobError::Abandoned => StreamError::TranscodeFailed {
                media_id: media_id.to_string(),
                quality: quality.to_string(),
                segment,
                reason: "transcode task aborted".to_string(),
            },
        }
    }

    /// Produce one segment, walking the backend fallback chain.
    async fn perform_jit(
        &self,
        meta: &MediaMetadata,
        profile: &QualityProfile,
        segment_number: usize,
        output_path: &Path,
    ) -> JobResult {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }

        let segment = meta
            .segment(segment_number)
            .ok_or_else(|| JobError::TranscodeFailed {
                reason: format!("segment {segment_number} not in plan"),
            })?;

        let preferred = self.chosen_backend().await;
        let chain = self.config.encoder.fallback_chain(preferred);
        let mut last_detail = String::from("no backend attempted");

        for backend in chain {
            let spec = TranscodeSpec {
                media_path: &meta.media_path,
                segment,
                profile,
                analysis: &meta.analysis,
                output_path,
                backend,
                speed: self.config.speed_preset,
            };
            match transcoder::transcode_segment(&self.config.tools, &spec, &self.processes).await {
                Ok(TranscodeOutcome::Success) => {
                    let mut chosen = self.chosen_backend.write().await;
                    if *chosen != Some(backend) {
                        info!(backend = %backend, "Encoder backend selected");
                        *chosen = Some(backend);
                    }
                    return Ok(output_path.to_path_buf());
                }
                Ok(TranscodeOutcome::Failed { failure, detail }) => {
                    warn!(
                        backend = %backend,
                        ?failure,
                        media_id = %meta.media_id,
                        segment = segment_number,
                        "Backend attempt failed"
                    );
                    last_detail = detail;
                }
                Err(StreamError::ShuttingDown) => return Err(JobError::ShuttingDown),
                Err(e) => {
                    warn!(backend = %backend, error = %e, "Encoder could not be run");
                    last_detail = e.to_string();
                }
            }
        }

        Err(JobError::TranscodeFailed {
            reason: last_detail,
        })
    }

    /// Launch the prefetch window after a foreground resolution.
    ///
    /// Fire-and-forget: nothing here may delay or fail the foreground
    /// request.
    fn fire_prefetch(self: &Arc<Self>, meta: Arc<MediaMetadata>, quality: &str, current: usize) {
        if !self.config.prefetch_enabled {
            return;
        }
        let engine = self.clone();
        let quality = quality.to_string();
        tokio::spawn(async move {
            engine.prefetch_window(meta, quality, current).await;
        });
    }

    async fn prefetch_window(self: Arc<Self>, meta: Arc<MediaMetadata>, quality: String, current: usize) {
        let Some(profile) = meta.profile(&quality).cloned() else {
            return;
        };

        for i in 1..=self.config.prefetch_count {
            let number = current + i;
            if number >= meta.total_segments || self.is_shutting_down() {
                break;
            }

            let file_name = segmenter::segment_file_name(number);
            let path = self
                .config
                .segment_path(&meta.media_id, &quality, &file_name);
            if file_exists(&path).await {
                // The window ahead is already materialized.
                break;
            }
            let key = JobKey::new(&*meta.media_id, &*quality, number);
            if self.jobs.get(&key).is_some() {
                break;
            }
            if self.jobs.prefetch_count() >= self.config.max_concurrent_prefetch {
                debug!(
                    media_id = %meta.media_id,
                    segment = number,
                    "Prefetch cap reached, skipping"
                );
                continue;
            }

            let JobClaim::New(handle) = self.jobs.claim(key, true) else {
                break;
            };
            debug!(media_id = %meta.media_id, %quality, segment = number, "Prefetching");

            let engine = self.clone();
            let meta = meta.clone();
            let profile = profile.clone();
            tokio::spawn(async move {
                let result = engine.perform_jit(&meta, &profile, number, &path).await;
                if let Err(e) = &result {
                    // Prefetch failures are advisory; the segment will be
                    // retried as a foreground job if anyone asks for it.
                    debug!(
                        media_id = %meta.media_id,
                        error = ?e,
                        "Prefetch transcode failed"
                    );
                }
                handle.finish(result);
            });
        }
    }

    /// Evict one media item: cache entry and on-disk artifacts.
    pub async fn evict(&self, media_id: &str) -> StreamResult<bool> {
        let had_entry = self.metadata.delete(media_id);
        let dir = self.config.media_dir(media_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(had_entry),
            Err(e) => Err(e.into()),
        }
    }

    /// Evict everything under the HLS root.
    pub async fn evict_all(&self) -> StreamResult<usize> {
        self.metadata.clear();
        let mut removed = 0usize;
        let mut entries = match tokio::fs::read_dir(&self.config.hls_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        info!(removed, "HLS cache cleared");
        Ok(removed)
    }

    /// Stop accepting work and terminate every tracked encoder.
    pub async fn shutdown(&self) {
        info!("Streaming engine shutting down");
        self.processes.shutdown().await;
        self.jobs.clear();
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
