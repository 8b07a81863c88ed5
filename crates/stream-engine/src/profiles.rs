//! Quality profile catalog
//!
//! Defines the preset ladder and derives the subset applicable to a given
//! source resolution. Bitrate fields are human-readable strings ("3M",
//! "128k") because they go straight into encoder argument vectors.

use serde::Serialize;

/// One transcoding quality target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityProfile {
    /// Quality name, also the per-variant directory name (e.g. "720p")
    pub name: String,
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    /// Target video bitrate (e.g. "3M")
    pub video_bitrate: String,
    /// Audio bitrate (e.g. "128k")
    pub audio_bitrate: String,
    /// Rate-control ceiling
    pub max_rate: String,
    /// Rate-control buffer size
    pub buf_size: String,
}

impl QualityProfile {
    fn new(
        name: &str,
        width: u32,
        height: u32,
        video_bitrate: &str,
        audio_bitrate: &str,
        max_rate: &str,
        buf_size: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            video_bitrate: video_bitrate.to_string(),
            audio_bitrate: audio_bitrate.to_string(),
            max_rate: max_rate.to_string(),
            buf_size: buf_size.to_string(),
        }
    }

    /// Resolution string for playlists.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// The standard ladder, highest first.
pub fn standard_profiles() -> Vec<QualityProfile> {
    vec![
        QualityProfile::new("1080p", 1920, 1080, "5M", "192k", "5350k", "7500k"),
        QualityProfile::new("720p", 1280, 720, "3M", "128k", "3210k", "4500k"),
        QualityProfile::new("480p", 854, 480, "1500k", "128k", "1605k", "2250k"),
        QualityProfile::new("360p", 640, 360, "800k", "96k", "856k", "1200k"),
    ]
}

/// The low-bandwidth floor every media item gets.
fn fallback_profile() -> QualityProfile {
    standard_profiles()
        .pop()
        .expect("standard ladder is non-empty")
}

/// Synthesize a profile at the source's own dimensions.
///
/// Only used for sources smaller than the 360p floor, where every standard
/// preset would upscale.
fn custom_profile(width: u32, height: u32) -> QualityProfile {
    QualityProfile::new(
        &format!("{height}p"),
        width,
        height,
        "600k",
        "96k",
        "642k",
        "900k",
    )
}

/// Profiles applicable to a source, highest to lowest.
///
/// A preset is eligible iff the source is at least as large in both
/// dimensions (no upscaling). 360p is always included for low-bandwidth
/// clients; a sub-360p source gets a custom profile at its own size plus the
/// 360p floor.
pub fn eligible_profiles(source_width: u32, source_height: u32) -> Vec<QualityProfile> {
    let fallback = fallback_profile();

    let mut eligible: Vec<QualityProfile> = standard_profiles()
        .into_iter()
        .filter(|p| p.width <= source_width && p.height <= source_height)
        .collect();

    if eligible.is_empty() {
        eligible.push(custom_profile(source_width, source_height));
    }

    if !eligible.iter().any(|p| p.name == fallback.name) {
        eligible.push(fallback);
    }

    eligible
}

/// GOP length in frames for a given frame rate and segment length.
pub fn gop_size(fps: f64, segment_duration: f64) -> u32 {
    (fps * segment_duration).round().max(1.0) as u32
}

/// ffmpeg `force_key_frames` expression pinning keyframes to segment starts.
pub fn keyframe_expr(segment_duration: f64) -> String {
    format!("expr:gte(t,n_forced*{})", format_seconds(segment_duration))
}

/// Format seconds without a trailing `.0` for whole values.
pub fn format_seconds(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(profiles: &[QualityProfile]) -> Vec<&str> {
        profiles.iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn full_ladder_for_1080p_source() {
        let profiles = eligible_profiles(1920, 1080);
        assert_eq!(names(&profiles), ["1080p", "720p", "480p", "360p"]);
    }

    #[test]
    fn no_upscaling_for_720p_source() {
        let profiles = eligible_profiles(1280, 720);
        assert_eq!(names(&profiles), ["720p", "480p", "360p"]);
    }

    #[test]
    fn exact_360p_source_gets_only_the_floor() {
        let profiles = eligible_profiles(640, 360);
        assert_eq!(names(&profiles), ["360p"]);
    }

    #[test]
    fn tiny_source_gets_custom_plus_floor() {
        let profiles = eligible_profiles(426, 240);
        assert_eq!(names(&profiles), ["240p", "360p"]);
        assert_eq!(profiles[0].width, 426);
        assert_eq!(profiles[0].height, 240);
    }

    #[test]
    fn odd_aspect_ratio_still_filters_both_dimensions() {
        // Wide but short: 1080p and 720p are too tall.
        let profiles = eligible_profiles(1920, 500);
        assert_eq!(names(&profiles), ["480p", "360p"]);
    }

    #[test]
    fn test_gop_size() {
        assert_eq!(gop_size(24.0, 6.0), 144);
        assert_eq!(gop_size(29.97, 6.0), 180);
        assert_eq!(gop_size(23.976, 6.0), 144);
        assert_eq!(gop_size(0.1, 1.0), 1);
    }

    #[test]
    fn test_keyframe_expr() {
        assert_eq!(keyframe_expr(6.0), "expr:gte(t,n_forced*6)");
        assert_eq!(keyframe_expr(4.5), "expr:gte(t,n_forced*4.5)");
    }
}
