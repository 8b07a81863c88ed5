//! Encoder backend selection and ffmpeg argument construction
//!
//! Three backends (CPU libx264, NVIDIA NVENC, Intel Quick Sync), each with a
//! balanced and a speed variant. The builder produces plain argument vectors;
//! process handling lives in the transcoder.

use crate::probe::MediaAnalysis;
use crate::profiles::{self, QualityProfile};
use serde::Serialize;
use std::str::FromStr;

/// Hardware/software encoder family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderBackend {
    Nvidia,
    Intel,
    Cpu,
}

impl EncoderBackend {
    /// ffmpeg encoder name for H.264 output.
    pub fn codec(&self) -> &'static str {
        match self {
            Self::Nvidia => "h264_nvenc",
            Self::Intel => "h264_qsv",
            Self::Cpu => "libx264",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Nvidia => "nvenc",
            Self::Intel => "qsv",
            Self::Cpu => "cpu",
        }
    }
}

impl std::fmt::Display for EncoderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Operator-facing backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderMode {
    /// Try accelerators in order, fall back to CPU
    Auto,
    /// Single attempt with the chosen backend, no fallback
    Forced(EncoderBackend),
}

impl FromStr for EncoderMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "nvenc" => Ok(Self::Forced(EncoderBackend::Nvidia)),
            "qsv" => Ok(Self::Forced(EncoderBackend::Intel)),
            "cpu" => Ok(Self::Forced(EncoderBackend::Cpu)),
            _ => Err(()),
        }
    }
}

impl EncoderMode {
    /// Backends to attempt, in order.
    ///
    /// `preferred` is the backend memoized from an earlier success; the chain
    /// resumes there so an unavailable accelerator is not retried on every
    /// segment.
    pub fn fallback_chain(&self, preferred: Option<EncoderBackend>) -> Vec<EncoderBackend> {
        match self {
            Self::Forced(backend) => vec![*backend],
            Self::Auto => {
                let full = [
                    EncoderBackend::Nvidia,
                    EncoderBackend::Intel,
                    EncoderBackend::Cpu,
                ];
                let skip = preferred
                    .and_then(|p| full.iter().position(|b| *b == p))
                    .unwrap_or(0);
                full[skip..].to_vec()
            }
        }
    }
}

/// Classified encoder initialization failure, parsed from stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderFailure {
    /// The accelerator hardware is not present
    NoDevice,
    /// Hardware exists but the driver stack is unusable
    DriverIssue,
    /// The encoder refused the configuration
    EncoderInitFailed,
}

/// Classify an encoder failure from its stderr tail.
///
/// Only initialization-class failures are recognized; anything else returns
/// `None` and is treated as a plain encode error.
pub fn classify_failure(stderr: &str) -> Option<EncoderFailure> {
    let lower = stderr.to_ascii_lowercase();

    const NO_DEVICE: &[&str] = &[
        "no nvenc capable devices",
        "cannot load libcuda",
        "cannot load nvcuda",
        "no capable devices found",
        "no device available",
        "no qsv device",
        "mfx session",
        "failed to create a vaapi device",
    ];
    const DRIVER: &[&str] = &[
        "driver does not support",
        "minimum required nvidia driver",
        "nvenc api version",
        "cuda_error",
        "failed to initialise",
        "error initializing the mfx",
    ];
    const INIT: &[&str] = &[
        "error initializing output stream",
        "error while opening encoder",
        "initializeencoder failed",
        "incompatible pixel format",
    ];

    if NO_DEVICE.iter().any(|p| lower.contains(p)) {
        Some(EncoderFailure::NoDevice)
    } else if DRIVER.iter().any(|p| lower.contains(p)) {
        Some(EncoderFailure::DriverIssue)
    } else if INIT.iter().any(|p| lower.contains(p)) {
        Some(EncoderFailure::EncoderInitFailed)
    } else {
        None
    }
}

/// Video encoder arguments for one backend/profile pair.
///
/// Includes the whole-asset `force_key_frames` expression; single-segment
/// runs rewrite it via [`rebase_keyframes_for_single_segment`].
pub fn video_args(
    backend: EncoderBackend,
    profile: &QualityProfile,
    analysis: &MediaAnalysis,
    speed: bool,
) -> Vec<String> {
    let gop = profiles::gop_size(analysis.fps, analysis.segment_duration).to_string();
    let keyframes = profiles::keyframe_expr(analysis.segment_duration);

    let mut args: Vec<String> = vec!["-c:v".into(), backend.codec().into()];

    match backend {
        EncoderBackend::Cpu => {
            args.extend(arg_pairs(&[
                ("-preset", if speed { "veryfast" } else { "medium" }),
                ("-b:v", &profile.video_bitrate),
                ("-maxrate", &profile.max_rate),
                ("-bufsize", &profile.buf_size),
                ("-g", &gop),
                ("-keyint_min", &gop),
                ("-sc_threshold", "0"),
                ("-force_key_frames", &keyframes),
                ("-profile:v", "high"),
                ("-level", "4.1"),
                ("-pix_fmt", "yuv420p"),
            ]));
            if speed {
                args.extend(arg_pairs(&[("-tune", "zerolatency")]));
            } else {
                args.extend(arg_pairs(&[("-aq-mode", "2")]));
            }
        }
        EncoderBackend::Nvidia => {
            args.extend(arg_pairs(&[
                ("-preset", if speed { "p1" } else { "p4" }),
                ("-rc", "vbr"),
                ("-b:v", &profile.video_bitrate),
                ("-maxrate", &profile.max_rate),
                ("-bufsize", &profile.buf_size),
                ("-g", &gop),
                ("-force_key_frames", &keyframes),
                ("-profile:v", "high"),
                ("-level", "4.1"),
                ("-pix_fmt", "yuv420p"),
                ("-spatial-aq", "1"),
            ]));
            if speed {
                args.extend(arg_pairs(&[("-rc-lookahead", "0"), ("-zerolatency", "1")]));
            } else {
                args.extend(arg_pairs(&[("-rc-lookahead", "20"), ("-temporal-aq", "1")]));
            }
        }
        EncoderBackend::Intel => {
            args.extend(arg_pairs(&[
                ("-preset", if speed { "veryfast" } else { "medium" }),
                ("-b:v", &profile.video_bitrate),
                ("-maxrate", &profile.max_rate),
                ("-bufsize", &profile.buf_size),
                ("-g", &gop),
                ("-force_key_frames", &keyframes),
                ("-profile:v", "high"),
                ("-pix_fmt", "nv12"),
            ]));
            if speed {
                args.extend(arg_pairs(&[("-look_ahead", "0")]));
            } else {
                args.extend(arg_pairs(&[("-look_ahead", "1")]));
            }
        }
    }

    args
}

/// Fixed audio encode: AAC, profile bitrate, 48 kHz stereo.
pub fn audio_args(profile: &QualityProfile) -> Vec<String> {
    arg_pairs(&[
        ("-c:a", "aac"),
        ("-b:a", &profile.audio_bitrate),
        ("-ar", "48000"),
        ("-ac", "2"),
    ])
}

/// Scaling filter, or `None` when the source already matches the target.
pub fn scale_filter(
    analysis: &MediaAnalysis,
    profile: &QualityProfile,
    speed: bool,
) -> Option<String> {
    if analysis.width == profile.width && analysis.height == profile.height {
        return None;
    }
    let flags = if speed { "fast_bilinear" } else { "lanczos" };
    Some(format!(
        "scale={}:{}:flags={}",
        profile.width, profile.height, flags
    ))
}

/// Input-side error resilience: decode through damage, regenerate timestamps.
pub fn error_resilience_args() -> Vec<String> {
    arg_pairs(&[("-err_detect", "ignore_err"), ("-fflags", "+genpts")])
}

/// Global process arguments.
pub fn global_args(speed: bool) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    if speed {
        args.extend(arg_pairs(&[
            ("-probesize", "1000000"),
            ("-analyzeduration", "1000000"),
        ]));
    }
    args
}

/// Rewrite `force_key_frames` for a single-segment encode.
///
/// A lone segment only needs its first frame forced; the per-asset expression
/// would force extra keyframes mid-segment when boundaries ran long.
pub fn rebase_keyframes_for_single_segment(args: &mut [String]) {
    let mut next_is_expr = false;
    for arg in args.iter_mut() {
        if next_is_expr {
            *arg = "expr:eq(n,0)".to_string();
            next_is_expr = false;
        } else if arg == "-force_key_frames" {
            next_is_expr = true;
        }
    }
}

fn arg_pairs(pairs: &[(&str, &str)]) -> Vec<String> {
    pairs
        .iter()
        .flat_map(|(k, v)| [k.to_string(), v.to_string()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(width: u32, height: u32) -> MediaAnalysis {
        MediaAnalysis {
            duration: 600.0,
            video_codec: "h264".into(),
            audio_codec: Some("aac".into()),
            width,
            height,
            fps: 24.0,
            segment_duration: 6.0,
            needs_video_transcode: false,
            needs_audio_transcode: false,
            has_audio: true,
        }
    }

    fn profile_720p() -> QualityProfile {
        crate::profiles::standard_profiles()
            .into_iter()
            .find(|p| p.name == "720p")
            .unwrap()
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("auto".parse::<EncoderMode>(), Ok(EncoderMode::Auto));
        assert_eq!(
            "nvenc".parse::<EncoderMode>(),
            Ok(EncoderMode::Forced(EncoderBackend::Nvidia))
        );
        assert_eq!(
            "QSV".parse::<EncoderMode>(),
            Ok(EncoderMode::Forced(EncoderBackend::Intel))
        );
        assert_eq!(
            "cpu".parse::<EncoderMode>(),
            Ok(EncoderMode::Forced(EncoderBackend::Cpu))
        );
        assert!("vaapi".parse::<EncoderMode>().is_err());
    }

    #[test]
    fn auto_chain_falls_back_to_cpu() {
        assert_eq!(
            EncoderMode::Auto.fallback_chain(None),
            vec![
                EncoderBackend::Nvidia,
                EncoderBackend::Intel,
                EncoderBackend::Cpu
            ]
        );
        // A memoized backend resumes the chain mid-way.
        assert_eq!(
            EncoderMode::Auto.fallback_chain(Some(EncoderBackend::Intel)),
            vec![EncoderBackend::Intel, EncoderBackend::Cpu]
        );
    }

    #[test]
    fn forced_mode_never_falls_back() {
        assert_eq!(
            EncoderMode::Forced(EncoderBackend::Nvidia).fallback_chain(Some(EncoderBackend::Cpu)),
            vec![EncoderBackend::Nvidia]
        );
    }

    #[test]
    fn cpu_args_cover_rate_control_and_gop() {
        let args = video_args(EncoderBackend::Cpu, &profile_720p(), &analysis(1920, 1080), false);
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-b:v 3M"));
        assert!(joined.contains("-maxrate 3210k"));
        assert!(joined.contains("-bufsize 4500k"));
        assert!(joined.contains("-g 144"));
        assert!(joined.contains("-force_key_frames expr:gte(t,n_forced*6)"));
        assert!(joined.contains("-pix_fmt yuv420p"));
    }

    #[test]
    fn nvenc_speed_variant_drops_lookahead() {
        let balanced = video_args(EncoderBackend::Nvidia, &profile_720p(), &analysis(1920, 1080), false);
        let speed = video_args(EncoderBackend::Nvidia, &profile_720p(), &analysis(1920, 1080), true);
        assert!(balanced.join(" ").contains("-rc-lookahead 20"));
        assert!(speed.join(" ").contains("-rc-lookahead 0"));
        assert!(speed.join(" ").contains("-zerolatency 1"));
        assert!(speed.join(" ").contains("-preset p1"));
    }

    #[test]
    fn audio_is_fixed_aac_stereo() {
        assert_eq!(
            audio_args(&profile_720p()),
            vec!["-c:a", "aac", "-b:a", "128k", "-ar", "48000", "-ac", "2"]
        );
    }

    #[test]
    fn scale_filter_pass_through_on_exact_match() {
        let p = profile_720p();
        assert_eq!(scale_filter(&analysis(1280, 720), &p, false), None);
        assert_eq!(
            scale_filter(&analysis(1920, 1080), &p, false).unwrap(),
            "scale=1280:720:flags=lanczos"
        );
        assert_eq!(
            scale_filter(&analysis(1920, 1080), &p, true).unwrap(),
            "scale=1280:720:flags=fast_bilinear"
        );
    }

    #[test]
    fn classifies_backend_failures() {
        assert_eq!(
            classify_failure("No NVENC capable devices found"),
            Some(EncoderFailure::NoDevice)
        );
        assert_eq!(
            classify_failure("The minimum required Nvidia driver for nvenc is 570.0"),
            Some(EncoderFailure::DriverIssue)
        );
        assert_eq!(
            classify_failure("Error while opening encoder for output stream #0:0"),
            Some(EncoderFailure::EncoderInitFailed)
        );
        assert_eq!(classify_failure("Invalid data found when processing input"), None);
    }

    #[test]
    fn single_segment_rebase_rewrites_expression() {
        let mut args = video_args(EncoderBackend::Cpu, &profile_720p(), &analysis(1920, 1080), false);
        rebase_keyframes_for_single_segment(&mut args);
        let joined = args.join(" ");
        assert!(joined.contains("-force_key_frames expr:eq(n,0)"));
        assert!(!joined.contains("n_forced"));
    }
}
