//! Segment boundary calculation
//!
//! Converts a keyframe timeline and a target segment length into an ordered
//! list of keyframe-aligned segments. Every segment start is a keyframe pts,
//! which is what later makes `-ss` before `-i` frame-accurate.

use crate::probe::Keyframe;
use serde::Serialize;
use tracing::{debug, warn};

/// Shortest segment worth emitting.
const MIN_SEGMENT_DURATION: f64 = 0.5;
/// Tiling tolerances for the post-condition check.
const MAX_GAP: f64 = 0.1;
const MAX_OVERLAP: f64 = 0.01;

/// One planned media segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    /// Zero-based segment number
    pub number: usize,
    /// Start of the segment on the source timeline (seconds)
    pub start_time: f64,
    /// Exclusive end of the segment (seconds)
    pub end_time: f64,
    /// `end_time - start_time`
    pub duration: f64,
    /// Index of the keyframe this segment starts on (accurate plans only)
    pub start_keyframe: Option<usize>,
    /// Index of the keyframe this segment ends on, absent for the tail
    pub end_keyframe: Option<usize>,
    /// On-disk file name, `segment_NNN.ts`
    pub file_name: String,
}

impl Segment {
    fn new(
        number: usize,
        start_time: f64,
        end_time: f64,
        start_keyframe: Option<usize>,
        end_keyframe: Option<usize>,
    ) -> Self {
        Self {
            number,
            start_time,
            end_time,
            duration: end_time - start_time,
            start_keyframe,
            end_keyframe,
            file_name: segment_file_name(number),
        }
    }
}

/// Canonical segment file name, zero-padded to at least three digits.
pub fn segment_file_name(number: usize) -> String {
    format!("segment_{number:03}.ts")
}

/// Parse a segment file name back to its number.
///
/// Accepts exactly `segment_` + three or more digits + `.ts`.
pub fn parse_segment_file_name(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("segment_")?.strip_suffix(".ts")?;
    if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// The segment plan carried by one media item.
///
/// Exactly one representation exists per media: keyframe-accurate when the
/// keyframe probe succeeded, uniform bins otherwise.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SegmentPlan {
    /// Boundaries aligned to real keyframes
    Accurate {
        keyframes: Vec<Keyframe>,
        segments: Vec<Segment>,
    },
    /// Uniform target-length bins (keyframe probe failed)
    Approximate { segments: Vec<Segment> },
}

impl SegmentPlan {
    pub fn segments(&self) -> &[Segment] {
        match self {
            Self::Accurate { segments, .. } => segments,
            Self::Approximate { segments } => segments,
        }
    }

    pub fn is_accurate(&self) -> bool {
        matches!(self, Self::Accurate { .. })
    }
}

/// Compute keyframe-aligned segments.
///
/// Walks a cursor from zero; each step starts on the first keyframe at or
/// after the cursor and ends on the keyframe nearest `start + target` (the
/// nearer of the last keyframe before the target and the first at or after
/// it), so boundaries hug the target length instead of always overshooting.
/// When no keyframe remains at or past the target, the segment is the tail
/// and ends at the container duration. Pieces shorter than half a second are
/// skipped rather than emitted.
pub fn plan_from_keyframes(
    keyframes: &[Keyframe],
    target: f64,
    total_duration: f64,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut cursor = 0.0f64;
    let mut number = 0usize;

    loop {
        let Some(start) = keyframes.iter().find(|k| k.pts >= cursor) else {
            break;
        };
        if start.pts >= total_duration {
            break;
        }

        let end_target = cursor + target;
        let above = keyframes.iter().find(|k| k.pts >= end_target);
        let below = keyframes
            .iter()
            .rev()
            .find(|k| k.pts < end_target && k.index > start.index);

        let (end_time, end_keyframe, is_tail) = match (below, above) {
            (_, None) => (total_duration, None, true),
            (None, Some(a)) if a.index == start.index => (total_duration, None, true),
            (None, Some(a)) => (a.pts, Some(a.index), false),
            (Some(b), Some(a)) => {
                if end_target - b.pts < a.pts - end_target {
                    (b.pts, Some(b.index), false)
                } else {
                    (a.pts, Some(a.index), false)
                }
            }
        };

        let duration = end_time - start.pts;
        if duration >= MIN_SEGMENT_DURATION {
            segments.push(Segment::new(
                number,
                start.pts,
                end_time,
                Some(start.index),
                end_keyframe,
            ));
            number += 1;
        } else {
            debug!(
                start = start.pts,
                end = end_time,
                duration,
                "Skipping sub-minimum segment"
            );
        }

        if is_tail || end_time <= cursor {
            break;
        }
        cursor = end_time;
    }

    segments
}

/// Uniform fallback segmentation when no keyframe timeline is available.
///
/// Bins are `{n*target, min(target, duration - n*target)}`; boundary
/// alignment is lost but the rest of the pipeline is unchanged.
pub fn plan_uniform(target: f64, total_duration: f64) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut number = 0usize;

    loop {
        let start = number as f64 * target;
        if start >= total_duration {
            break;
        }
        let duration = target.min(total_duration - start);
        segments.push(Segment::new(number, start, start + duration, None, None));
        number += 1;
    }

    segments
}

/// Post-condition check: segments must tile `[0, total_duration)`.
///
/// Returns the list of violations; callers log them and carry on.
pub fn tiling_violations(segments: &[Segment], total_duration: f64) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(first) = segments.first() else {
        violations.push("empty segment plan".to_string());
        return violations;
    };

    if first.start_time > MAX_GAP {
        violations.push(format!("leading gap of {:.3}s", first.start_time));
    }

    for pair in segments.windows(2) {
        let delta = pair[1].start_time - pair[0].end_time;
        if delta > MAX_GAP {
            violations.push(format!(
                "gap of {:.3}s between segments {} and {}",
                delta, pair[0].number, pair[1].number
            ));
        } else if delta < -MAX_OVERLAP {
            violations.push(format!(
                "overlap of {:.3}s between segments {} and {}",
                -delta, pair[0].number, pair[1].number
            ));
        }
    }

    let last = segments.last().expect("checked non-empty");
    let tail_gap = total_duration - last.end_time;
    if tail_gap > MAX_GAP {
        violations.push(format!("trailing gap of {tail_gap:.3}s"));
    }

    violations
}

/// Run the tiling check and log any violations.
pub fn check_tiling(media_id: &str, segments: &[Segment], total_duration: f64) {
    for violation in tiling_violations(segments, total_duration) {
        warn!(media_id, %violation, "Segment plan does not tile cleanly");
    }
}
