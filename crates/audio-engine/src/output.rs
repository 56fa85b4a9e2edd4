//! Output sink: buffer scheduling on the host audio primitive plus seek-position tracking.

use std::sync::{Arc, Mutex, PoisonError};

use crate::frame::{OutputFormat, PcmBuffer};
use crate::session::{PlaybackLoop, PlaybackSession};

/// How a scheduled buffer left the output queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferOutcome {
    /// Every sample was rendered.
    Played,
    /// Dropped by [`OutputBackend::stop`] before it finished.
    Flushed,
}

/// Called exactly once per scheduled buffer, on a backend thread.
pub type BufferCompletion = Box<dyn FnOnce(BufferOutcome) + Send>;

/// The platform audio-output primitive.
///
/// Buffers play back to back in submission order and complete in that order.
pub trait OutputBackend: Send + Sync {
    /// Format every scheduled buffer must already be in.
    fn format(&self) -> OutputFormat;

    /// Queue `buffer` after everything already scheduled.
    fn schedule(&self, buffer: PcmBuffer, on_done: BufferCompletion);

    fn play(&self);

    /// Stop rendering without dropping scheduled buffers.
    fn pause(&self);

    /// Stop rendering, flush scheduled buffers (completing them as [`BufferOutcome::Flushed`])
    /// and reset the render clock.
    fn stop(&self);

    fn is_playing(&self) -> bool;

    /// Frames rendered since the last `play` after a `stop`, or `None` while stopped.
    fn sample_time(&self) -> Option<i64>;
}

#[derive(Debug, Default)]
struct PositionState {
    /// Output frame position (at the output rate) the current segment started at.
    start_frame: i64,
    /// Backend sample time at the moment the current segment began rendering.
    frames_correction: i64,
    correction_applied: bool,
    /// Last computed position; reported while the backend has no render clock.
    cached: f64,
}

/// Thin wrapper over an [`OutputBackend`] that knows where playback is.
pub struct OutputSink {
    backend: Arc<dyn OutputBackend>,
    position: Mutex<PositionState>,
}

impl OutputSink {
    pub fn new(backend: Arc<dyn OutputBackend>) -> Self {
        Self {
            backend,
            position: Mutex::new(PositionState::default()),
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.backend.format()
    }

    pub fn is_playing(&self) -> bool {
        self.backend.is_playing()
    }

    /// Hand `buffer` to the backend.
    ///
    /// An immediate buffer with a known `start_time` becomes the new seek-position baseline;
    /// deferred buffers have not started playing yet and leave the position alone.
    pub fn schedule_buffer<F>(
        &self,
        buffer: PcmBuffer,
        session: &PlaybackSession,
        on_done: F,
        start_time: Option<f64>,
        immediate: bool,
    ) where
        F: FnOnce(PlaybackSession, BufferOutcome) + Send + 'static,
    {
        if immediate {
            if let Some(start_time) = start_time {
                let rate = self.backend.format().sample_rate as f64;
                let mut pos = self.lock_position();
                pos.cached = start_time;
                pos.start_frame = (start_time * rate).round() as i64;
                pos.correction_applied = false;
            }
        }
        let session = session.clone();
        self.backend
            .schedule(buffer, Box::new(move |outcome| on_done(session, outcome)));
    }

    pub fn play(&self) {
        self.backend.play();
        let mut pos = self.lock_position();
        if !pos.correction_applied {
            pos.frames_correction = self.backend.sample_time().unwrap_or(0);
            pos.correction_applied = true;
        }
    }

    pub fn pause(&self) {
        let current = self.raw_position();
        self.lock_position().cached = current;
        self.backend.pause();
    }

    pub fn stop(&self) {
        self.backend.stop();
    }

    /// Re-baseline the position, e.g. at a gapless track boundary.
    pub fn reset_seek_position_state(&self, start_frame: i64, start_time: f64) {
        let mut pos = self.lock_position();
        pos.start_frame = start_frame;
        pos.cached = start_time;
        pos.correction_applied = false;
        if self.backend.is_playing() {
            if let Some(sample_time) = self.backend.sample_time() {
                pos.frames_correction = sample_time;
                pos.correction_applied = true;
            }
        }
    }

    /// Report the end of the track without scheduling anything (seek landed past the end).
    pub fn seek_to_end_of_track(&self, duration: f64) {
        let rate = self.backend.format().sample_rate as f64;
        let mut pos = self.lock_position();
        pos.cached = duration;
        pos.start_frame = (duration * rate).round() as i64;
        pos.correction_applied = false;
    }

    /// Current playback position in seconds, clamped to the loop if one is active, otherwise to
    /// `[0, duration]`. An open loop only raises the lower bound.
    pub fn seek_position(&self, duration: f64, playback_loop: Option<PlaybackLoop>) -> f64 {
        let raw = self.raw_position();
        let duration = duration.max(0.0);
        match playback_loop {
            Some(PlaybackLoop {
                start_time,
                end_time: Some(end_time),
            }) => raw.clamp(start_time, end_time),
            Some(PlaybackLoop {
                start_time,
                end_time: None,
            }) => raw.clamp(start_time.min(duration), duration),
            None => raw.clamp(0.0, duration),
        }
    }

    fn raw_position(&self) -> f64 {
        let rate = self.backend.format().sample_rate;
        let mut pos = self.lock_position();
        if rate > 0 {
            if let Some(sample_time) = self.backend.sample_time() {
                let correction = if pos.correction_applied {
                    pos.frames_correction
                } else {
                    sample_time
                };
                pos.cached = (pos.start_frame + sample_time - correction) as f64 / rate as f64;
            }
        }
        pos.cached
    }

    fn lock_position(&self) -> std::sync::MutexGuard<'_, PositionState> {
        self.position.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use crate::test_support::ManualBackend;

    fn sink() -> (OutputSink, Arc<ManualBackend>) {
        let backend = Arc::new(ManualBackend::new(1_000, 2));
        (OutputSink::new(backend.clone()), backend)
    }

    fn pcm(frames: usize) -> PcmBuffer {
        PcmBuffer::new(vec![0.0; frames * 2], 2, 1_000)
    }

    #[test]
    fn position_follows_render_clock_from_buffer_start() {
        let (sink, backend) = sink();
        let session = SessionRegistry::new().start("t");
        backend.set_sample_time(Some(250));
        sink.schedule_buffer(pcm(100), &session, |_, _| {}, Some(3.0), true);
        assert_eq!(sink.seek_position(10.0, None), 3.0);

        sink.play();
        backend.advance(500);
        assert!((sink.seek_position(10.0, None) - 3.5).abs() < 1e-9);
    }

    #[test]
    fn deferred_buffers_do_not_move_the_baseline() {
        let (sink, backend) = sink();
        let session = SessionRegistry::new().start("t");
        sink.schedule_buffer(pcm(100), &session, |_, _| {}, Some(1.0), true);
        sink.play();
        sink.schedule_buffer(pcm(100), &session, |_, _| {}, Some(6.0), false);
        backend.advance(100);
        assert!((sink.seek_position(10.0, None) - 1.1).abs() < 1e-9);
        assert_eq!(backend.scheduled_count(), 2);
    }

    #[test]
    fn stopped_backend_reports_cached_position() {
        let (sink, backend) = sink();
        let session = SessionRegistry::new().start("t");
        sink.schedule_buffer(pcm(100), &session, |_, _| {}, Some(2.0), true);
        sink.play();
        backend.advance(1_000);
        sink.pause();
        sink.stop();
        assert_eq!(backend.sample_time(), None);
        assert!((sink.seek_position(10.0, None) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn position_is_clamped_to_loop_or_duration() {
        let (sink, backend) = sink();
        let session = SessionRegistry::new().start("t");
        sink.schedule_buffer(pcm(100), &session, |_, _| {}, Some(3.9), true);
        sink.play();
        backend.advance(500);
        let lp = PlaybackLoop::bounded(2.0, 4.0);
        assert_eq!(sink.seek_position(10.0, lp), 4.0);
        assert_eq!(sink.seek_position(4.2, None), 4.2);

        sink.seek_to_end_of_track(7.5);
        backend.stop();
        assert_eq!(sink.seek_position(7.5, None), 7.5);
    }

    #[test]
    fn open_loop_raises_only_the_lower_bound() {
        let (sink, backend) = sink();
        let session = SessionRegistry::new().start("t");
        sink.schedule_buffer(pcm(100), &session, |_, _| {}, Some(1.0), true);
        sink.play();
        let open = PlaybackLoop::open(2.0);
        assert_eq!(sink.seek_position(10.0, open), 2.0);

        backend.advance(3_000);
        assert_eq!(sink.seek_position(10.0, open), 4.0);
        backend.advance(10_000);
        assert_eq!(sink.seek_position(10.0, open), 10.0);
    }

    #[test]
    fn reset_while_playing_rebases_on_current_clock() {
        let (sink, backend) = sink();
        let session = SessionRegistry::new().start("t");
        sink.schedule_buffer(pcm(100), &session, |_, _| {}, Some(0.0), true);
        sink.play();
        backend.advance(4_000);
        sink.reset_seek_position_state(0, 0.0);
        backend.advance(250);
        assert!((sink.seek_position(100.0, None) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn completion_carries_the_session() {
        let (sink, backend) = sink();
        let session = SessionRegistry::new().start("t");
        let (tx, rx) = std::sync::mpsc::channel();
        sink.schedule_buffer(
            pcm(10),
            &session,
            move |s, outcome| tx.send((s, outcome)).unwrap(),
            None,
            false,
        );
        backend.complete_next();
        let (s, outcome) = rx.recv().unwrap();
        assert_eq!(s, session);
        assert_eq!(outcome, BufferOutcome::Played);
    }
}
