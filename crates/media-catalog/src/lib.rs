//! Media catalog lookup
//!
//! The streaming engine resolves media ids through this crate. The catalog is
//! a read-only collaborator: it answers "where does this media id live on
//! disk, and what do we already know about it" and nothing else. Library
//! scanning and persistence live upstream and are not part of this crate.

pub mod errors;

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub use errors::CatalogError;

/// Everything the catalog knows about one media item.
///
/// All probe-derived fields are optional; the streaming engine runs its own
/// analysis and only relies on `file_path`.
#[derive(Debug, Clone, Serialize)]
pub struct MediaRecord {
    /// Stable identifier used in URLs and cache paths
    pub media_id: String,
    /// Absolute or root-relative path to the source file
    pub file_path: PathBuf,
    /// Video width in pixels, if known
    pub width: Option<u32>,
    /// Video height in pixels, if known
    pub height: Option<u32>,
    /// Container duration in seconds, if known
    pub duration: Option<f64>,
    /// Video codec tag, if known
    pub video_codec: Option<String>,
    /// Audio codec tag, if known
    pub audio_codec: Option<String>,
    /// Frame rate, if known
    pub fps: Option<f64>,
    /// Overall bitrate in bits per second, if known
    pub bitrate: Option<u64>,
}

impl MediaRecord {
    /// Create a record that carries only the id and path.
    pub fn bare(media_id: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            media_id: media_id.into(),
            file_path: file_path.into(),
            width: None,
            height: None,
            duration: None,
            video_codec: None,
            audio_codec: None,
            fps: None,
            bitrate: None,
        }
    }
}

/// Read-only media lookup used by the streaming engine.
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    /// Resolve a media id to its record, or `None` when the id is unknown.
    async fn find_media(&self, media_id: &str) -> Result<Option<MediaRecord>, CatalogError>;
}

/// Filesystem-backed catalog that resolves `media_id` directly to
/// `<root>/<media_id>.<ext>` for a fixed set of container extensions.
///
/// There is deliberately no directory walk here; resolution is a constant
/// number of stat calls per request.
pub struct FsCatalog {
    root: PathBuf,
    extensions: Vec<&'static str>,
}

/// Container extensions tried by [`FsCatalog`], in order.
const DEFAULT_EXTENSIONS: &[&str] = &["mp4", "mkv", "mov", "avi", "webm", "ts", "m4v"];

impl FsCatalog {
    /// Create a catalog rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.to_vec(),
        }
    }

    /// Root directory this catalog resolves against.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl MediaCatalog for FsCatalog {
    async fn find_media(&self, media_id: &str) -> Result<Option<MediaRecord>, CatalogError> {
        // Reject ids that could escape the media root.
        if media_id.is_empty()
            || media_id.contains(['/', '\\'])
            || media_id.contains("..")
        {
            return Err(CatalogError::InvalidMediaId {
                media_id: media_id.to_string(),
            });
        }

        for ext in &self.extensions {
            let candidate = self.root.join(format!("{media_id}.{ext}"));
            match tokio::fs::metadata(&candidate).await {
                Ok(meta) if meta.is_file() => {
                    debug!(media_id, path = %candidate.display(), "Resolved media file");
                    return Ok(Some(MediaRecord::bare(media_id, candidate)));
                }
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(CatalogError::Io {
                        path: candidate,
                        source: e,
                    })
                }
            }
        }

        Ok(None)
    }
}
