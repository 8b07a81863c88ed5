//! Single-segment transcode execution
//!
//! Invokes ffmpeg for exactly one segment: fast-seek to the segment start
//! (frame-accurate because starts are keyframe pts by construction), encode
//! with the selected backend, rebase timestamps to zero, and emit MPEG-TS.

use crate::config::FfmpegTools;
use crate::encoder::{self, EncoderBackend, EncoderFailure};
use crate::errors::{StreamError, StreamResult};
use crate::probe::MediaAnalysis;
use crate::process::ProcessRegistry;
use crate::profiles::QualityProfile;
use crate::segmenter::Segment;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Kill a runaway encode after this long; one segment should take seconds.
const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(300);
/// Retained stderr for failure diagnosis.
const STDERR_TAIL_BYTES: usize = 1024;
/// Synthetic silent input for sources without an audio stream.
const SILENT_AUDIO_SOURCE: &str = "anullsrc=channel_layout=stereo:sample_rate=48000";

/// Everything needed to produce one segment file.
pub struct TranscodeSpec<'a> {
    pub media_path: &'a Path,
    pub segment: &'a Segment,
    pub profile: &'a QualityProfile,
    pub analysis: &'a MediaAnalysis,
    pub output_path: &'a Path,
    pub backend: EncoderBackend,
    pub speed: bool,
}

/// Result of one encode attempt.
#[derive(Debug)]
pub enum TranscodeOutcome {
    Success,
    Failed {
        failure: Option<EncoderFailure>,
        detail: String,
    },
}

/// Compose the full ffmpeg argument vector for one segment.
///
/// Structure:
/// - `-ss` before `-i` for fast seek; segment starts are keyframe pts, so
///   the seek is also accurate.
/// - a silent lavfi input is added and mapped when the source has no audio.
/// - the per-asset `force_key_frames` expression is rebased to
///   `expr:eq(n,0)`; a lone segment only needs its first frame forced.
/// - the mpegts flag cluster re-anchors PTS/DTS at zero so each segment
///   plays independently.
pub fn build_args(spec: &TranscodeSpec<'_>) -> Vec<String> {
    let mut args = encoder::global_args(spec.speed);
    args.extend(encoder::error_resilience_args());

    args.extend([
        "-ss".to_string(),
        format!("{:.3}", spec.segment.start_time),
        "-i".to_string(),
        spec.media_path.to_string_lossy().into_owned(),
    ]);

    if !spec.analysis.has_audio {
        args.extend([
            "-f".to_string(),
            "lavfi".to_string(),
            "-i".to_string(),
            SILENT_AUDIO_SOURCE.to_string(),
        ]);
    }

    args.extend(["-t".to_string(), format!("{:.3}", spec.segment.duration)]);

    args.extend(["-map".to_string(), "0:v:0".to_string()]);
    let audio_map = if spec.analysis.has_audio {
        "0:a:0"
    } else {
        "1:a:0"
    };
    args.extend(["-map".to_string(), audio_map.to_string()]);

    if let Some(filter) = encoder::scale_filter(spec.analysis, spec.profile, spec.speed) {
        args.extend(["-vf".to_string(), filter]);
    }

    let mut video = encoder::video_args(spec.backend, spec.profile, spec.analysis, spec.speed);
    encoder::rebase_keyframes_for_single_segment(&mut video);
    args.extend(video);
    args.extend(encoder::audio_args(spec.profile));

    args.extend(
        [
            "-avoid_negative_ts",
            "make_zero",
            "-start_at_zero",
            "-output_ts_offset",
            "0",
            "-mpegts_flags",
            "+resend_headers+initial_discontinuity",
            "-muxpreload",
            "0",
            "-muxdelay",
            "0",
            "-y",
            "-f",
            "mpegts",
        ]
        .map(str::to_string),
    );
    args.push(spec.output_path.to_string_lossy().into_owned());

    args
}

/// Run ffmpeg for one segment.
///
/// Returns `Ok(TranscodeOutcome)` for normal completion (success or encoder
/// failure), `Err` only for engine-level conditions (spawn failure,
/// shutdown).
pub async fn transcode_segment(
    tools: &FfmpegTools,
    spec: &TranscodeSpec<'_>,
    registry: &ProcessRegistry,
) -> StreamResult<TranscodeOutcome> {
    if let Some(parent) = spec.output_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let args = build_args(spec);
    debug!(
        backend = %spec.backend,
        segment = spec.segment.number,
        output = %spec.output_path.display(),
        "Spawning encoder"
    );

    let mut child = Command::new(&tools.ffmpeg)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id().unwrap_or_default();
    let _guard = registry.register(pid);

    let mut stderr = child.stderr.take().expect("stderr is piped");
    let stderr_task = tokio::spawn(async move { read_tail(&mut stderr).await });

    let mut shutdown = registry.shutdown_signal();
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = shutdown.changed() => {
            warn!(pid, "Killing encoder for shutdown");
            let _ = child.kill().await;
            return Err(StreamError::ShuttingDown);
        }
        _ = tokio::time::sleep(TRANSCODE_TIMEOUT) => {
            warn!(pid, segment = spec.segment.number, "Encoder timed out, killing");
            let _ = child.kill().await;
            return Ok(TranscodeOutcome::Failed {
                failure: None,
                detail: format!("encoder timed out after {}s", TRANSCODE_TIMEOUT.as_secs()),
            });
        }
    };

    let stderr_tail = stderr_task.await.unwrap_or_default();

    if status.success() {
        validate_output(tools, spec.output_path).await;
        info!(
            backend = %spec.backend,
            segment = spec.segment.number,
            "Segment transcoded"
        );
        return Ok(TranscodeOutcome::Success);
    }

    let failure = encoder::classify_failure(&stderr_tail);
    warn!(
        backend = %spec.backend,
        segment = spec.segment.number,
        ?failure,
        exit = %status,
        stderr = %stderr_tail.trim(),
        "Encoder failed"
    );
    Ok(TranscodeOutcome::Failed {
        failure,
        detail: stderr_tail.trim().to_string(),
    })
}

/// Probe the produced segment: video present, first packet a keyframe.
///
/// A validation miss is logged and swallowed.
async fn validate_output(tools: &FfmpegTools, output_path: &Path) {
    let result = Command::new(&tools.ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "packet=flags",
            "-of",
            "csv=print_section=0",
            "-read_intervals",
            "%+#1",
        ])
        .arg(output_path)
        .stdin(Stdio::null())
        .output()
        .await;

    match result {
        Ok(output) if output.status.success() => {
            let first = String::from_utf8_lossy(&output.stdout);
            let first = first.lines().next().unwrap_or("");
            if !first.contains('K') {
                warn!(
                    path = %output_path.display(),
                    flags = first,
                    "Produced segment does not start on a keyframe"
                );
            }
        }
        Ok(output) => {
            warn!(
                path = %output_path.display(),
                exit = %output.status,
                "Post-transcode validation probe failed"
            );
        }
        Err(e) => {
            warn!(path = %output_path.display(), error = %e, "Could not run validation probe");
        }
    }
}

/// Read a stream to completion, retaining only the last kilobyte.
async fn read_tail<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let cut = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..cut);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}
