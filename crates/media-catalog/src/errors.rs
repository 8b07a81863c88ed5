//! Error types for catalog lookups

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by [`crate::MediaCatalog`] implementations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Media id contains path separators or traversal components
    #[error("invalid media id: {media_id}")]
    InvalidMediaId { media_id: String },

    /// Filesystem error while resolving a candidate path
    #[error("catalog i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
