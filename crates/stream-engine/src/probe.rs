//! Media probing via ffprobe
//!
//! This module provides:
//! - Container/stream analysis (duration, codecs, dimensions, fps)
//! - Keyframe timeline extraction from the per-packet flag stream
//! - Non-fatal keyframe structure diagnostics

use crate::config::FfmpegTools;
use crate::errors::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Hard ceiling on a keyframe probe run.
const KEYFRAME_PROBE_TIMEOUT: Duration = Duration::from_secs(60);
/// Cap on the packet listing we are willing to buffer.
const KEYFRAME_PROBE_MAX_OUTPUT: usize = 10 * 1024 * 1024;

/// Fallback values when ffprobe leaves a field blank.
const DEFAULT_FPS: f64 = 24.0;
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;

/// Immutable per-media analysis produced once at initialization.
#[derive(Debug, Clone, Serialize)]
pub struct MediaAnalysis {
    /// Container duration in seconds
    pub duration: f64,
    /// Video codec tag (e.g. "h264", "hevc")
    pub video_codec: String,
    /// Audio codec tag, absent for silent sources
    pub audio_codec: Option<String>,
    /// Video width in pixels
    pub width: u32,
    /// Video height in pixels
    pub height: u32,
    /// Frame rate
    pub fps: f64,
    /// Target segment length in seconds
    pub segment_duration: f64,
    /// Source video stream cannot be served as-is
    pub needs_video_transcode: bool,
    /// Source audio stream cannot be served as-is
    pub needs_audio_transcode: bool,
    /// Source has at least one audio stream
    pub has_audio: bool,
}

/// One keyframe on the source timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Keyframe {
    /// Position in the sorted keyframe list
    pub index: usize,
    /// Presentation timestamp in seconds
    pub pts: f64,
}

/// ffprobe JSON output structures
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
}

/// Analyze a media file's container and streams.
///
/// Missing fields are defaulted (fps 24, 1280x720). A missing duration is
/// fatal; nothing downstream can segment without it.
pub async fn analyze(
    tools: &FfmpegTools,
    media_path: &Path,
    segment_duration: f64,
) -> StreamResult<MediaAnalysis> {
    debug!(path = %media_path.display(), "Probing media");

    let output = Command::new(&tools.ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(media_path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| StreamError::ProbeFailed {
            path: media_path.to_path_buf(),
            reason: format!("failed to execute ffprobe: {e}"),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StreamError::ProbeFailed {
            path: media_path.to_path_buf(),
            reason: format!("ffprobe exited with {}: {}", output.status, stderr.trim()),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let analysis = parse_analysis(&stdout, segment_duration).map_err(|reason| {
        StreamError::ProbeFailed {
            path: media_path.to_path_buf(),
            reason,
        }
    })?;

    info!(
        path = %media_path.display(),
        width = analysis.width,
        height = analysis.height,
        duration = analysis.duration,
        fps = analysis.fps,
        video_codec = %analysis.video_codec,
        has_audio = analysis.has_audio,
        "Media analyzed"
    );

    Ok(analysis)
}

/// Parse the ffprobe JSON document into a [`MediaAnalysis`].
fn parse_analysis(json: &str, segment_duration: f64) -> Result<MediaAnalysis, String> {
    let probe: FfprobeOutput =
        serde_json::from_str(json).map_err(|e| format!("unparseable ffprobe JSON: {e}"))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"));
    let audio = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_ref())
        .or_else(|| video.and_then(|v| v.duration.as_ref()))
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| *d > 0.0)
        .ok_or_else(|| "no usable duration".to_string())?;

    let video_codec = video
        .and_then(|v| v.codec_name.clone())
        .unwrap_or_else(|| "unknown".to_string());
    let audio_codec = audio.and_then(|a| a.codec_name.clone());
    let has_audio = audio.is_some();

    let width = video.and_then(|v| v.width).unwrap_or(DEFAULT_WIDTH);
    let height = video.and_then(|v| v.height).unwrap_or(DEFAULT_HEIGHT);
    let fps = video
        .and_then(|v| parse_frame_rate(v.r_frame_rate.as_ref().or(v.avg_frame_rate.as_ref())))
        .unwrap_or(DEFAULT_FPS);

    // Everything is re-encoded for segment-accurate output; the flags record
    // whether a passthrough would even have been possible.
    let needs_video_transcode = video_codec != "h264";
    let needs_audio_transcode = audio_codec.as_deref() != Some("aac");

    Ok(MediaAnalysis {
        duration,
        video_codec,
        audio_codec,
        width,
        height,
        fps,
        segment_duration,
        needs_video_transcode,
        needs_audio_transcode,
        has_audio,
    })
}

/// Extract the keyframe timeline of the first video stream.
///
/// Requests the per-packet flag stream, keeps packets flagged as key, and
/// returns them sorted by pts. Fails when no keyframe is found within the
/// timeout and buffer cap.
pub async fn analyze_keyframes(tools: &FfmpegTools, media_path: &Path) -> StreamResult<Vec<Keyframe>> {
    debug!(path = %media_path.display(), "Probing keyframes");

    let mut child = Command::new(&tools.ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "packet=pts_time,flags",
            "-of",
            "csv=print_section=0",
        ])
        .arg(media_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StreamError::ProbeFailed {
            path: media_path.to_path_buf(),
            reason: format!("failed to execute ffprobe: {e}"),
        })?;

    let mut stdout = child.stdout.take().expect("stdout piped");
    let read_all = async {
        let mut buf = Vec::new();
        // The take() bound keeps a pathological packet listing from eating
        // memory; anything past the cap is discarded.
        let mut limited = (&mut stdout).take(KEYFRAME_PROBE_MAX_OUTPUT as u64);
        limited.read_to_end(&mut buf).await?;
        let overflowed = buf.len() >= KEYFRAME_PROBE_MAX_OUTPUT;
        if overflowed {
            // The child would block on a full pipe; reap it and work with
            // what we have.
            let _ = child.kill().await;
        }
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((buf, status, overflowed))
    };

    let (buf, status, overflowed) = tokio::time::timeout(KEYFRAME_PROBE_TIMEOUT, read_all)
        .await
        .map_err(|_| StreamError::ProbeFailed {
            path: media_path.to_path_buf(),
            reason: format!(
                "keyframe probe timed out after {}s",
                KEYFRAME_PROBE_TIMEOUT.as_secs()
            ),
        })?
        .map_err(|e| StreamError::ProbeFailed {
            path: media_path.to_path_buf(),
            reason: format!("keyframe probe i/o failure: {e}"),
        })?;

    if overflowed {
        warn!(
            path = %media_path.display(),
            cap = KEYFRAME_PROBE_MAX_OUTPUT,
            "Keyframe listing truncated at buffer cap"
        );
    } else if !status.success() {
        return Err(StreamError::ProbeFailed {
            path: media_path.to_path_buf(),
            reason: format!("keyframe probe exited with {status}"),
        });
    }

    let keyframes = parse_keyframe_listing(&String::from_utf8_lossy(&buf));
    if keyframes.is_empty() {
        return Err(StreamError::ProbeFailed {
            path: media_path.to_path_buf(),
            reason: "no keyframes found".to_string(),
        });
    }

    info!(
        path = %media_path.display(),
        keyframes = keyframes.len(),
        "Keyframe timeline extracted"
    );
    Ok(keyframes)
}

/// Parse `pts_time,flags` CSV lines, retaining key-flagged packets sorted by pts.
fn parse_keyframe_listing(listing: &str) -> Vec<Keyframe> {
    let mut pts_values: Vec<f64> = listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split(',');
            let pts = fields.next()?.parse::<f64>().ok()?;
            let flags = fields.next()?;
            flags.contains('K').then_some(pts)
        })
        .collect();

    pts_values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    pts_values
        .into_iter()
        .enumerate()
        .map(|(index, pts)| Keyframe { index, pts })
        .collect()
}

/// Summary statistics used by [`validate_keyframe_structure`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyframeStats {
    pub average_gop: f64,
    pub per_minute: f64,
    pub first_pts: f64,
}

/// Compute GOP statistics over a sorted keyframe list.
pub fn keyframe_stats(keyframes: &[Keyframe], duration: f64) -> Option<KeyframeStats> {
    let first = keyframes.first()?;
    let average_gop = if keyframes.len() > 1 {
        let span = keyframes[keyframes.len() - 1].pts - first.pts;
        span / (keyframes.len() - 1) as f64
    } else {
        duration
    };
    let per_minute = if duration > 0.0 {
        keyframes.len() as f64 / (duration / 60.0)
    } else {
        0.0
    };
    Some(KeyframeStats {
        average_gop,
        per_minute,
        first_pts: first.pts,
    })
}

/// Warn (non-fatally) about keyframe layouts that will segment poorly.
pub fn validate_keyframe_structure(media_path: &Path, keyframes: &[Keyframe], duration: f64) {
    let Some(stats) = keyframe_stats(keyframes, duration) else {
        return;
    };

    if stats.average_gop > 10.0 {
        warn!(
            path = %media_path.display(),
            average_gop = stats.average_gop,
            "Sparse keyframes: segments will run long"
        );
    }
    if stats.per_minute < 2.0 {
        warn!(
            path = %media_path.display(),
            per_minute = stats.per_minute,
            "Keyframe density below 2/min"
        );
    }
    if stats.first_pts > 0.1 {
        warn!(
            path = %media_path.display(),
            first_pts = stats.first_pts,
            "First keyframe does not start near zero"
        );
    }
}

/// Parse a frame rate in ffprobe's ratio format (e.g. "30000/1001").
fn parse_frame_rate(rate: Option<&String>) -> Option<f64> {
    rate.and_then(|s| {
        if let Some((num, den)) = s.split_once('/') {
            let num = num.parse::<f64>().ok()?;
            let den = den.parse::<f64>().ok()?;
            (den > 0.0).then(|| num / den)
        } else {
            s.parse::<f64>().ok()
        }
    })
    .filter(|fps| fps.is_finite() && *fps > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {
                "codec_type": "video",
                "codec_name": "hevc",
                "width": 3840,
                "height": 2160,
                "r_frame_rate": "24000/1001"
            },
            {
                "codec_type": "audio",
                "codec_name": "ac3"
            }
        ],
        "format": { "duration": "5400.041000" }
    }"#;

    #[test]
    fn parses_full_analysis() {
        let analysis = parse_analysis(PROBE_JSON, 6.0).unwrap();
        assert_eq!(analysis.width, 3840);
        assert_eq!(analysis.height, 2160);
        assert!((analysis.duration - 5400.041).abs() < 1e-6);
        assert!((analysis.fps - 23.976).abs() < 0.001);
        assert_eq!(analysis.video_codec, "hevc");
        assert_eq!(analysis.audio_codec.as_deref(), Some("ac3"));
        assert!(analysis.has_audio);
        assert!(analysis.needs_video_transcode);
        assert!(analysis.needs_audio_transcode);
    }

    #[test]
    fn defaults_missing_fields() {
        let json = r#"{
            "streams": [ { "codec_type": "video", "codec_name": "h264" } ],
            "format": { "duration": "60.0" }
        }"#;
        let analysis = parse_analysis(json, 6.0).unwrap();
        assert_eq!(analysis.width, 1280);
        assert_eq!(analysis.height, 720);
        assert_eq!(analysis.fps, 24.0);
        assert!(!analysis.needs_video_transcode);
        assert!(!analysis.has_audio);
        assert!(analysis.needs_audio_transcode);
    }

    #[test]
    fn missing_duration_is_an_error() {
        let json = r#"{ "streams": [ { "codec_type": "video" } ], "format": {} }"#;
        assert!(parse_analysis(json, 6.0).is_err());
    }

    #[test]
    fn parses_keyframe_listing() {
        let listing = "0.000000,K__\n0.041708,___\n2.085417,K__\n1.001000,K__\nN/A,K__\n";
        let keyframes = parse_keyframe_listing(listing);
        assert_eq!(keyframes.len(), 3);
        assert_eq!(keyframes[0].pts, 0.0);
        assert_eq!(keyframes[1].pts, 1.001);
        assert_eq!(keyframes[2].pts, 2.085417);
        assert_eq!(keyframes[2].index, 2);
    }

    #[test]
    fn keyframe_stats_flag_sparse_layout() {
        let keyframes: Vec<Keyframe> = (0..5)
            .map(|i| Keyframe {
                index: i,
                pts: i as f64 * 15.0,
            })
            .collect();
        let stats = keyframe_stats(&keyframes, 60.0).unwrap();
        assert!(stats.average_gop > 10.0);
        assert_eq!(stats.first_pts, 0.0);
        assert_eq!(stats.per_minute, 5.0);
    }

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate(Some(&"30".to_string())), Some(30.0));
        let fps = parse_frame_rate(Some(&"30000/1001".to_string())).unwrap();
        assert!((fps - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate(Some(&"24/1".to_string())), Some(24.0));
        assert_eq!(parse_frame_rate(Some(&"0/0".to_string())), None);
        assert_eq!(parse_frame_rate(None), None);
        assert_eq!(parse_frame_rate(Some(&"invalid".to_string())), None);
    }
}
