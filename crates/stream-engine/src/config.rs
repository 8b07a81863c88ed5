//! Engine configuration
//!
//! All knobs are read from the environment in one place. Unrecognized
//! variables are ignored; recognized variables with unparseable values fall
//! back to their defaults with a warning.

use crate::encoder::EncoderMode;
use crate::errors::{StreamError, StreamResult};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

/// Locations of the external ffmpeg/ffprobe binaries.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    /// Path to the ffmpeg binary
    pub ffmpeg: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe: PathBuf,
}

impl Default for FfmpegTools {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

impl FfmpegTools {
    /// Verify that both binaries are resolvable and runnable.
    ///
    /// Called once at startup; an error here is fatal for the server.
    pub async fn verify(&self) -> StreamResult<()> {
        for (name, path) in [("ffmpeg", &self.ffmpeg), ("ffprobe", &self.ffprobe)] {
            let output = Command::new(path)
                .arg("-version")
                .output()
                .await
                .map_err(|e| StreamError::Toolchain {
                    reason: format!("failed to execute {name} at {}: {e}", path.display()),
                })?;
            if !output.status.success() {
                return Err(StreamError::Toolchain {
                    reason: format!("{name} at {} exited with {}", path.display(), output.status),
                });
            }
        }
        info!("ffmpeg and ffprobe verified");
        Ok(())
    }
}

/// Runtime configuration for the streaming engine.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Root directory for playlists and cached segments (`HLS_TEMP_DIR`)
    pub hls_root: PathBuf,
    /// Encoder backend selection (`ENCODER`: auto | nvenc | qsv | cpu)
    pub encoder: EncoderMode,
    /// Whether prefetch jobs are dispatched at all (`PREFETCH_ENABLED`)
    pub prefetch_enabled: bool,
    /// How many consecutive future segments to consider (`PREFETCH_COUNT`)
    pub prefetch_count: usize,
    /// Process-wide cap on simultaneous prefetch jobs (`MAX_CONCURRENT_PREFETCH`)
    pub max_concurrent_prefetch: usize,
    /// Target segment length in seconds (`SEGMENT_DURATION_SECONDS`)
    pub segment_duration: f64,
    /// Trade quality for encode speed in the option builder
    pub speed_preset: bool,
    /// External tool locations (`FFMPEG_PATH`, `FFPROBE_PATH`)
    pub tools: FfmpegTools,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            hls_root: std::env::temp_dir().join("hls"),
            encoder: EncoderMode::Auto,
            prefetch_enabled: true,
            prefetch_count: 3,
            max_concurrent_prefetch: 4,
            segment_duration: 6.0,
            speed_preset: false,
            tools: FfmpegTools::default(),
        }
    }
}

impl StreamConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let hls_root = std::env::var("HLS_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.hls_root);

        let encoder = match std::env::var("ENCODER") {
            Ok(raw) => match raw.parse::<EncoderMode>() {
                Ok(mode) => mode,
                Err(_) => {
                    warn!(value = %raw, "Unrecognized ENCODER value, using auto");
                    EncoderMode::Auto
                }
            },
            Err(_) => defaults.encoder,
        };

        let prefetch_enabled = env_parse("PREFETCH_ENABLED", defaults.prefetch_enabled);
        let prefetch_count = env_parse("PREFETCH_COUNT", defaults.prefetch_count);
        let max_concurrent_prefetch =
            env_parse("MAX_CONCURRENT_PREFETCH", defaults.max_concurrent_prefetch);
        let segment_duration = env_parse::<u64>(
            "SEGMENT_DURATION_SECONDS",
            defaults.segment_duration as u64,
        ) as f64;

        let tools = FfmpegTools {
            ffmpeg: std::env::var("FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.tools.ffmpeg),
            ffprobe: std::env::var("FFPROBE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.tools.ffprobe),
        };

        Self {
            hls_root,
            encoder,
            prefetch_enabled,
            prefetch_count,
            max_concurrent_prefetch,
            segment_duration,
            speed_preset: defaults.speed_preset,
            tools,
        }
    }

    /// Directory holding everything for one media id.
    pub fn media_dir(&self, media_id: &str) -> PathBuf {
        self.hls_root.join(media_id)
    }

    /// Master playlist path for one media id.
    pub fn master_playlist_path(&self, media_id: &str) -> PathBuf {
        self.media_dir(media_id).join("master.m3u8")
    }

    /// Variant playlist path for one media id and quality name.
    pub fn variant_playlist_path(&self, media_id: &str, quality: &str) -> PathBuf {
        self.media_dir(media_id).join(quality).join("playlist.m3u8")
    }

    /// On-disk path of one segment.
    pub fn segment_path(&self, media_id: &str, quality: &str, file_name: &str) -> PathBuf {
        self.media_dir(media_id).join(quality).join(file_name)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = StreamConfig::default();
        assert_eq!(config.segment_duration, 6.0);
        assert_eq!(config.prefetch_count, 3);
        assert_eq!(config.max_concurrent_prefetch, 4);
        assert!(config.prefetch_enabled);
        assert_eq!(config.encoder, EncoderMode::Auto);
    }

    #[test]
    fn path_layout() {
        let config = StreamConfig {
            hls_root: PathBuf::from("/srv/hls"),
            ..StreamConfig::default()
        };
        assert_eq!(
            config.master_playlist_path("abc"),
            PathBuf::from("/srv/hls/abc/master.m3u8")
        );
        assert_eq!(
            config.variant_playlist_path("abc", "720p"),
            PathBuf::from("/srv/hls/abc/720p/playlist.m3u8")
        );
        assert_eq!(
            config.segment_path("abc", "720p", "segment_002.ts"),
            PathBuf::from("/srv/hls/abc/720p/segment_002.ts")
        );
    }
}
