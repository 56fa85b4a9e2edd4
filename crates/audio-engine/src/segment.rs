//! Frame ranges of the source stream.
//!
//! A standalone helper for callers that drive a frame-addressed output (seek-by-frame) instead of
//! [`BufferScheduler`](crate::scheduler::BufferScheduler). The scheduler itself works from
//! decoded PCM and never builds segments.

use crate::session::PlaybackSession;

/// Shortest segment the output primitive is ever asked to play.
pub const MIN_FRAMES: u32 = 2;

/// One contiguous frame range `[first_frame, last_frame]` of a source stream.
#[derive(Clone, Debug, PartialEq)]
pub struct PlaybackSegment {
    pub session: PlaybackSession,
    pub first_frame: i64,
    pub last_frame: i64,
    pub frame_count: u32,
    pub start_time: f64,
    pub end_time: f64,
}

/// What a segment is cut from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentSource {
    pub sample_rate: u32,
    pub total_frames: i64,
    pub duration: f64,
}

fn frame_position(time: f64, sample_rate: u32) -> i64 {
    (time * sample_rate as f64).round() as i64
}

/// Compute the segment playing `start_time..end_time` (or to the end of the stream).
///
/// An exact `start_frame` overrides `start_time`. Segments shorter than [`MIN_FRAMES`] are
/// widened by pulling the first frame back, never by extending past the requested end.
/// Returns `None` for invalid times or a stream too short to hold a minimum segment.
pub fn compute_segment(
    session: &PlaybackSession,
    source: &SegmentSource,
    start_time: f64,
    end_time: Option<f64>,
    start_frame: Option<i64>,
) -> Option<PlaybackSegment> {
    let valid = match end_time {
        Some(end) => start_time >= 0.0 && end >= 0.0 && start_time <= end,
        None => start_time >= 0.0,
    };
    if !valid || source.sample_rate == 0 || source.total_frames < MIN_FRAMES as i64 {
        return None;
    }

    let last_frame_in_stream = source.total_frames - 1;
    let mut first_frame = start_frame.unwrap_or_else(|| frame_position(start_time, source.sample_rate));

    let (last_frame, segment_end_time) = match end_time {
        Some(end) => (
            frame_position(end, source.sample_rate).min(last_frame_in_stream),
            end,
        ),
        None => (last_frame_in_stream, source.duration),
    };

    let mut frame_count = last_frame - first_frame + 1;
    if frame_count < MIN_FRAMES as i64 {
        frame_count = MIN_FRAMES as i64;
        first_frame = last_frame - frame_count + 1;
    }

    let segment_start_time = match start_frame {
        Some(frame) => frame as f64 / source.sample_rate as f64,
        None => start_time,
    };

    Some(PlaybackSegment {
        session: session.clone(),
        first_frame,
        last_frame,
        frame_count: u32::try_from(frame_count).unwrap_or(u32::MAX),
        start_time: segment_start_time,
        end_time: segment_end_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;

    fn source() -> SegmentSource {
        SegmentSource {
            sample_rate: 44_100,
            total_frames: 441_000,
            duration: 10.0,
        }
    }

    #[test]
    fn open_ended_segment_runs_to_last_frame() {
        let s = SessionRegistry::new().start("t");
        let seg = compute_segment(&s, &source(), 2.0, None, None).unwrap();
        assert_eq!(seg.first_frame, 88_200);
        assert_eq!(seg.last_frame, 440_999);
        assert_eq!(seg.frame_count, 352_800);
        assert_eq!(seg.end_time, 10.0);
    }

    #[test]
    fn seek_to_last_frame_pulls_start_back() {
        let s = SessionRegistry::new().start("t");
        let seg = compute_segment(&s, &source(), 10.0, None, None).unwrap();
        assert_eq!(seg.frame_count, MIN_FRAMES);
        assert_eq!(seg.last_frame, 440_999);
        assert_eq!(seg.first_frame, 440_998);
    }

    #[test]
    fn bounded_segment_is_clamped_to_stream() {
        let s = SessionRegistry::new().start("t");
        let seg = compute_segment(&s, &source(), 9.0, Some(12.0), Some(396_900)).unwrap();
        assert_eq!(seg.last_frame, 440_999);
        assert_eq!(seg.start_time, 9.0);
        assert_eq!(seg.end_time, 12.0);
        assert!(compute_segment(&s, &source(), 5.0, Some(4.0), None).is_none());
        assert!(compute_segment(&s, &source(), -1.0, None, None).is_none());
    }

    #[test]
    fn every_segment_meets_the_floor() {
        let s = SessionRegistry::new().start("t");
        for start in [0.0, 4.99999, 5.0, 9.99999, 10.0, 30.0] {
            for end in [None, Some(5.0), Some(10.0)] {
                if let Some(seg) = compute_segment(&s, &source(), start, end, None) {
                    assert!(seg.frame_count >= MIN_FRAMES, "{start} {end:?}");
                    assert!(seg.last_frame - seg.first_frame + 1 == seg.frame_count as i64);
                }
            }
        }
    }
}
