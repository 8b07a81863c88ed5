//! Per-media metadata store
//!
//! Process-wide keyed store of analysis results and segment plans. Entries
//! are built once at initialization and replaced wholesale; eviction is an
//! explicit operator action, never a TTL. The dataset is bounded by the
//! library size and entries are small (mostly the keyframe list).

use crate::probe::MediaAnalysis;
use crate::profiles::QualityProfile;
use crate::segmenter::{Segment, SegmentPlan};
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything the engine knows about one initialized media item.
#[derive(Debug, Clone, Serialize)]
pub struct MediaMetadata {
    pub media_id: String,
    pub media_path: PathBuf,
    /// Container duration in seconds
    pub duration: f64,
    /// Target segment length used for the plan
    pub segment_duration: f64,
    pub total_segments: usize,
    /// Eligible quality ladder, highest first
    pub available_profiles: Vec<QualityProfile>,
    pub analysis: MediaAnalysis,
    pub plan: SegmentPlan,
}

impl MediaMetadata {
    pub fn segments(&self) -> &[Segment] {
        self.plan.segments()
    }

    pub fn segment(&self, number: usize) -> Option<&Segment> {
        self.segments().iter().find(|s| s.number == number)
    }

    pub fn profile(&self, quality: &str) -> Option<&QualityProfile> {
        self.available_profiles.iter().find(|p| p.name == quality)
    }
}

/// Keyed store `media_id -> MediaMetadata`.
#[derive(Clone, Default)]
pub struct MetadataCache {
    entries: Arc<DashMap<String, Arc<MediaMetadata>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, media_id: &str) -> bool {
        self.entries.contains_key(media_id)
    }

    pub fn get(&self, media_id: &str) -> Option<Arc<MediaMetadata>> {
        self.entries.get(media_id).map(|e| e.value().clone())
    }

    pub fn set(&self, metadata: MediaMetadata) -> Arc<MediaMetadata> {
        let shared = Arc::new(metadata);
        self.entries
            .insert(shared.media_id.clone(), shared.clone());
        shared
    }

    pub fn delete(&self, media_id: &str) -> bool {
        self.entries.remove(media_id).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_all(&self) -> Vec<Arc<MediaMetadata>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}
