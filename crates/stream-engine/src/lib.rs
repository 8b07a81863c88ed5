//! Just-in-time HLS streaming engine
//!
//! Serves arbitrary local media to HLS players without pre-transcoding or
//! per-viewer sessions: each media item's segment structure is pre-declared
//! from its keyframe timeline, individual segments are produced on first
//! request, cached permanently on disk, and the next few segments are
//! prefetched opportunistically.

pub mod config;
pub mod encoder;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod metadata;
pub mod playlist;
pub mod probe;
pub mod process;
pub mod profiles;
pub mod routes;
pub mod segmenter;
pub mod transcoder;

pub use config::{FfmpegTools, StreamConfig};
pub use encoder::{EncoderBackend, EncoderMode};
pub use engine::StreamingEngine;
pub use errors::{StreamError, StreamResult};
pub use routes::hls_router;
