//! Error types for the streaming engine
//!
//! The engine surfaces a small typed taxonomy; the HTTP adapter maps each
//! variant onto a status code. Jobs broadcast a separate `Clone`-able error to
//! every coalesced waiter.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for engine operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Main error type for streaming operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Media id unknown to the catalog, or source file missing on disk
    #[error("media not found: {media_id}")]
    NotFound { media_id: String },

    /// Segment file name does not match `segment_<digits>.ts`
    #[error("invalid segment name: {name}")]
    BadSegmentName { name: String },

    /// Segment number outside `[0, total_segments)`
    #[error("segment {segment} out of range (media has {total} segments)")]
    SegmentOutOfRange { segment: usize, total: usize },

    /// Quality name not among the media's available profiles
    #[error("unknown quality: {quality}")]
    UnknownQuality { quality: String },

    /// ffprobe produced no usable data
    #[error("probe failed for {path}: {reason}")]
    ProbeFailed { path: PathBuf, reason: String },

    /// Playlist write failed during initialization
    #[error("failed to write playlist {path}: {source}")]
    PlaylistWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Encoder exited non-zero after all eligible backend attempts
    #[error("transcode failed for {media_id}/{quality} segment {segment}: {reason}")]
    TranscodeFailed {
        media_id: String,
        quality: String,
        segment: usize,
        reason: String,
    },

    /// Engine is refusing new work
    #[error("engine is shutting down")]
    ShuttingDown,

    /// ffmpeg/ffprobe binaries unavailable
    #[error("toolchain unavailable: {reason}")]
    Toolchain { reason: String },

    /// Catalog lookup failure
    #[error("catalog error: {0}")]
    Catalog(#[from] media_catalog::CatalogError),

    /// Any other filesystem failure
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// HTTP status the adapter reports for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::BadSegmentName { .. }
            | Self::SegmentOutOfRange { .. }
            | Self::UnknownQuality { .. } => StatusCode::BAD_REQUEST,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProbeFailed { .. }
            | Self::PlaylistWrite { .. }
            | Self::TranscodeFailed { .. }
            | Self::Toolchain { .. }
            | Self::Catalog(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            StreamError::NotFound {
                media_id: "x".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            StreamError::BadSegmentName { name: "x".into() }.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            StreamError::SegmentOutOfRange {
                segment: 9,
                total: 3
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            StreamError::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            StreamError::TranscodeFailed {
                media_id: "m".into(),
                quality: "720p".into(),
                segment: 0,
                reason: "boom".into()
            }
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
