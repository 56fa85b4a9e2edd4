//! A-B loop playback.
//!
//! Loop buffers are decoded with [`StreamDecoder::decode_bounded`](crate::decoder::StreamDecoder::decode_bounded),
//! so nothing past the loop end is ever scheduled. When the last loop buffer has played the loop
//! starts over: the decoder is re-seeked to the loop start and decoding begins again.

use super::{BufferScheduler, Inner, Mode, PlaybackEvent, ScheduleState};
use crate::error::EngineError;
use crate::session::{PlaybackLoop, PlaybackSession};

impl BufferScheduler {
    /// Play the session's loop from its start. No-op unless the session has a complete loop.
    pub fn play_loop(&self, session: &PlaybackSession, begin_playback: bool) -> Result<(), EngineError> {
        let _control = self.inner.lock_control();
        self.inner.start_loop(session, None, begin_playback).map(drop)
    }

    /// Play the session's loop from `start_time` (the loop start if `start_time` is outside it).
    pub fn play_loop_from(
        &self,
        session: &PlaybackSession,
        start_time: f64,
        begin_playback: bool,
    ) -> Result<(), EngineError> {
        let _control = self.inner.lock_control();
        self.inner
            .start_loop(session, Some(start_time), begin_playback)
            .map(drop)
    }

    /// Drop the loop boundary and keep playing to the end of the track.
    ///
    /// `session` takes over the running playback (typically the caller's loop-less replacement
    /// for the loop session). Audio past the loop end that was already decoded is played, not
    /// skipped.
    pub fn end_loop(&self, session: &PlaybackSession, loop_end_time: f64) -> Result<(), EngineError> {
        let _control = self.inner.lock_control();
        let mut st = self.inner.lock_state();
        let Mode::Loop { end_time } = st.mode else {
            tracing::debug!(session = session.id(), "end_loop without an active loop");
            return Ok(());
        };
        let ctx = st.context.as_mut().ok_or(EngineError::NoActiveContext)?;
        ctx.decoder.end_loop();
        let duration = ctx.duration;
        tracing::debug!(
            session = session.id(),
            loop_end_time,
            end_time,
            "loop removed; continuing to the end of the track"
        );

        st.handed_over = st.session.replace(session.clone());
        st.mode = Mode::Track;
        self.inner.set_info(duration, None);

        if st.decoding_finished() {
            if st.current_count() == 0 {
                self.inner.signal_track_completed(&mut st);
            }
            return Ok(());
        }
        self.inner.schedule_deferred_async(&st);
        self.inner.schedule_deferred_async(&st);
        Ok(())
    }
}

impl Inner {
    /// Start (or restart) loop playback. Caller holds the control lock, not the state lock.
    ///
    /// Returns `true` if loop audio was scheduled. A loop that yields no audio (it starts past
    /// the end of the stream, or decoding already failed for good) completes the track instead.
    pub(super) fn start_loop(
        &self,
        session: &PlaybackSession,
        start_time: Option<f64>,
        begin_playback: bool,
    ) -> Result<bool, EngineError> {
        let Some(playback_loop) = session.playback_loop().filter(PlaybackLoop::is_complete) else {
            tracing::debug!(session = session.id(), "session has no complete loop");
            return Ok(false);
        };
        let Some(end_time) = playback_loop.end_time else {
            return Ok(false);
        };

        self.halt();
        let mut st = self.lock_state();
        if st.context.is_none() {
            return Err(EngineError::NoActiveContext);
        }
        self.begin_attempt(&mut st, session, Mode::Loop { end_time }, 1);

        let start = start_time
            .filter(|t| playback_loop.contains(*t))
            .unwrap_or(playback_loop.start_time);
        let Some(ctx) = st.context.as_mut() else {
            return Err(EngineError::NoActiveContext);
        };
        ctx.started = true;
        ctx.decoder.loop_completed();
        self.set_info(ctx.duration, Some(playback_loop));
        ctx.decoder.seek(start)?;
        if ctx.decoder.eof() {
            let duration = ctx.duration;
            tracing::warn!(session = session.id(), start, duration, "loop starts past the end");
            self.set_info(duration, None);
            self.sink.seek_to_end_of_track(duration);
            if begin_playback {
                self.signal_track_completed(&mut st);
            } else {
                st.completed_while_paused = true;
            }
            return Ok(false);
        }

        tracing::debug!(session = session.id(), start, end_time, "loop scheduling");
        self.schedule_one(&mut st, true, Some(start));
        self.schedule_deferred_async(&st);

        if st.current_count() > 0 {
            if begin_playback {
                self.sink.play();
            }
            return Ok(true);
        }
        tracing::warn!(session = session.id(), start, end_time, "loop produced no audio");
        if st.decoding_finished() {
            self.signal_track_completed(&mut st);
            return Ok(false);
        }
        // A deferred buffer is still on its way.
        Ok(true)
    }

    /// Loop completion cascade. Returns the session to restart once the loop has fully played.
    pub(super) fn loop_buffer_completed(&self, st: &mut ScheduleState) -> Option<PlaybackSession> {
        if !st.decoding_finished() {
            self.schedule_deferred_async(st);
            return None;
        }
        if st.current_count() == 0 {
            return st.session.clone();
        }
        None
    }

    /// Jump back to the loop start. Caller holds the control lock, not the state lock.
    pub(super) fn restart_loop(&self, session: &PlaybackSession) {
        let Some(start_time) = session.playback_loop().map(|l| l.start_time) else {
            return;
        };
        match self.start_loop(session, None, true) {
            Ok(true) => self.emit(PlaybackEvent::LoopRestarted {
                session: session.clone(),
                start_time,
            }),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(session = session.id(), "loop restart failed: {e}");
                let mut st = self.lock_state();
                if st.session.as_ref() == Some(session) {
                    self.signal_track_completed(&mut st);
                }
            }
        }
    }
}
