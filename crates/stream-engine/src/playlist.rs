//! HLS playlist synthesis
//!
//! Emits the master playlist and per-variant VOD playlists from a segment
//! plan. Playlists are written once at initialization and never touched
//! again; segment files referenced here are produced lazily.

use crate::errors::{StreamError, StreamResult};
use crate::profiles::QualityProfile;
use crate::segmenter::Segment;
use std::fmt::Write as _;
use std::path::Path;
use tracing::debug;

/// Safety margin added to every advertised segment duration.
///
/// The encoder closes each segment on a GOP boundary, which can run slightly
/// past the planned duration; HLS requires EXTINF to upper-bound the real
/// duration, so every advertised value carries this pad.
const EXTINF_MARGIN: f64 = 0.05;

/// Parse a human-readable bitrate string ("3M", "128k", "800000") to bits/s.
pub fn parse_bitrate(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (number, multiplier) = match trimmed.chars().last()? {
        'k' | 'K' => (&trimmed[..trimmed.len() - 1], 1_000.0),
        'm' | 'M' => (&trimmed[..trimmed.len() - 1], 1_000_000.0),
        _ => (trimmed, 1.0),
    };
    let value = number.parse::<f64>().ok()?;
    (value >= 0.0).then(|| (value * multiplier) as u64)
}

/// Total advertised bandwidth of one profile in bits per second.
pub fn profile_bandwidth(profile: &QualityProfile) -> u64 {
    parse_bitrate(&profile.video_bitrate).unwrap_or(0)
        + parse_bitrate(&profile.audio_bitrate).unwrap_or(0)
}

/// Build the master playlist, variants sorted by descending height.
pub fn master_playlist(profiles: &[QualityProfile]) -> String {
    let mut ordered: Vec<&QualityProfile> = profiles.iter().collect();
    ordered.sort_by(|a, b| b.height.cmp(&a.height));

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for profile in ordered {
        writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={},NAME=\"{}\"",
            profile_bandwidth(profile),
            profile.resolution(),
            profile.name
        )
        .unwrap();
        writeln!(out, "{}/playlist.m3u8", profile.name).unwrap();
    }
    out
}

/// Build one variant's VOD playlist.
pub fn variant_playlist(segments: &[Segment]) -> String {
    let max_duration = segments
        .iter()
        .map(|s| s.duration)
        .fold(0.0f64, f64::max);
    let target_duration = (max_duration + EXTINF_MARGIN).ceil() as u64;

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    out.push_str("#EXT-X-INDEPENDENT-SEGMENTS\n");
    writeln!(out, "#EXT-X-TARGETDURATION:{target_duration}")
        .unwrap();
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");

    for (i, segment) in segments.iter().enumerate() {
        // Each segment is an independent encode with its own timestamp base.
        if i > 0 {
            out.push_str("#EXT-X-DISCONTINUITY\n");
        }
        writeln!(out, "#EXTINF:{:.3},", segment.duration + EXTINF_MARGIN)
            .unwrap();
        writeln!(out, "{}", segment.file_name).unwrap();
    }

    out.push_str("#EXT-X-ENDLIST\n");
    out
}

/// Write one playlist file, surfacing failures as [`StreamError::PlaylistWrite`].
pub async fn write_playlist(path: &Path, contents: &str) -> StreamResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StreamError::PlaylistWrite {
                path: path.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| StreamError::PlaylistWrite {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), "Playlist written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Keyframe;
    use crate::segmenter::plan_from_keyframes;

    fn profile(name: &str, width: u32, height: u32, video: &str, audio: &str) -> QualityProfile {
        QualityProfile {
            name: name.to_string(),
            width,
            height,
            video_bitrate: video.to_string(),
            audio_bitrate: audio.to_string(),
            max_rate: video.to_string(),
            buf_size: video.to_string(),
        }
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate("3M"), Some(3_000_000));
        assert_eq!(parse_bitrate("1.5M"), Some(1_500_000));
        assert_eq!(parse_bitrate("128k"), Some(128_000));
        assert_eq!(parse_bitrate("856K"), Some(856_000));
        assert_eq!(parse_bitrate("800000"), Some(800_000));
        assert_eq!(parse_bitrate(""), None);
        assert_eq!(parse_bitrate("fast"), None);
    }

    #[test]
    fn master_sorted_by_descending_height() {
        let profiles = vec![
            profile("360p", 640, 360, "800k", "96k"),
            profile("1080p", 1920, 1080, "5M", "192k"),
            profile("720p", 1280, 720, "3M", "128k"),
        ];
        let master = master_playlist(&profiles);

        let expected = "#EXTM3U\n\
            #EXT-X-VERSION:3\n\
            #EXT-X-STREAM-INF:BANDWIDTH=5192000,RESOLUTION=1920x1080,NAME=\"1080p\"\n\
            1080p/playlist.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=3128000,RESOLUTION=1280x720,NAME=\"720p\"\n\
            720p/playlist.m3u8\n\
            #EXT-X-STREAM-INF:BANDWIDTH=896000,RESOLUTION=640x360,NAME=\"360p\"\n\
            360p/playlist.m3u8\n";
        assert_eq!(master, expected);
    }

    #[test]
    fn variant_round_trip_from_keyframe_plan() {
        let keyframes: Vec<Keyframe> = [0.0, 2.1, 5.9, 8.0, 12.0, 14.5]
            .iter()
            .enumerate()
            .map(|(index, &pts)| Keyframe { index, pts })
            .collect();
        let segments = plan_from_keyframes(&keyframes, 6.0, 14.5);
        let playlist = variant_playlist(&segments);

        assert!(playlist.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(playlist.contains("#EXT-X-INDEPENDENT-SEGMENTS\n"));
        assert!(playlist.contains("#EXT-X-TARGETDURATION:7\n"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(playlist.contains("#EXT-X-PLAYLIST-TYPE:VOD\n"));
        assert!(playlist.contains("#EXTINF:5.950,\nsegment_000.ts\n"));
        assert!(playlist.contains("#EXTINF:6.150,\nsegment_001.ts\n"));
        assert!(playlist.contains("#EXTINF:2.550,\nsegment_002.ts\n"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));

        // Discontinuity between segments, never before the first.
        assert_eq!(playlist.matches("#EXT-X-DISCONTINUITY\n").count(), 2);
        assert!(!playlist.contains("PLAYLIST-TYPE:VOD\n#EXT-X-DISCONTINUITY"));
    }

    #[test]
    fn extinf_upper_bounds_target_duration() {
        let keyframes: Vec<Keyframe> = (0..20)
            .map(|i| Keyframe {
                index: i,
                pts: i as f64 * 3.7,
            })
            .collect();
        let segments = plan_from_keyframes(&keyframes, 6.0, 70.0);
        let playlist = variant_playlist(&segments);

        let target: f64 = playlist
            .lines()
            .find_map(|l| l.strip_prefix("#EXT-X-TARGETDURATION:"))
            .unwrap()
            .parse()
            .unwrap();
        for line in playlist.lines() {
            if let Some(value) = line.strip_prefix("#EXTINF:") {
                let extinf: f64 = value.trim_end_matches(',').parse().unwrap();
                assert!(extinf <= target, "EXTINF {extinf} exceeds target {target}");
            }
        }
    }

    #[tokio::test]
    async fn write_failure_maps_to_playlist_write() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        tokio::fs::write(&blocker, "x").await.unwrap();

        // Parent path is a regular file, create_dir_all must fail.
        let target = blocker.join("nested/playlist.m3u8");
        let err = write_playlist(&target, "#EXTM3U\n").await.unwrap_err();
        assert!(matches!(err, StreamError::PlaylistWrite { .. }));
    }
}
