//! Gapless playback of a sequence of prepared tracks.
//!
//! All tracks share one session and one deferred-scheduling chain. When the current decoder
//! reaches EOF the next context is swapped in on the background queue, so its first buffer is
//! queued behind the previous track's last one. Every track keeps its own buffer count; a
//! track is finished once its decoder is exhausted and its count drops to zero.

use std::collections::VecDeque;

use super::{BufferCount, BufferScheduler, Inner, Mode, PlaybackContext, PlaybackEvent, ScheduleState};
use crate::error::EngineError;
use crate::session::PlaybackSession;

impl BufferScheduler {
    /// Play `contexts` back to back, replacing whatever was loaded.
    ///
    /// Emits [`PlaybackEvent::GaplessTrackCompleted`] per track and a final
    /// [`PlaybackEvent::TrackCompleted`] after the last one.
    pub fn play_gapless(
        &self,
        session: &PlaybackSession,
        contexts: Vec<PlaybackContext>,
    ) -> Result<(), EngineError> {
        let mut contexts: VecDeque<PlaybackContext> = contexts.into();
        let Some(first) = contexts.pop_front() else {
            return Err(EngineError::NoActiveContext);
        };
        let tracks = contexts.len() + 1;

        let _control = self.inner.lock_control();
        self.inner.halt();
        let mut st = self.inner.lock_state();
        let format = self.inner.sink.format();
        for ctx in contexts.iter_mut() {
            ctx.decoder.set_output_format(format);
        }
        let seek = first.started.then_some(0.0);
        let duration = first.duration;
        if let Some(mut previous) = st.context.replace(first) {
            previous.decoder.stop();
        }
        st.upcoming = contexts;
        self.inner.begin_attempt(&mut st, session, Mode::Gapless, tracks);
        self.inner.set_info(duration, None);
        tracing::debug!(session = session.id(), tracks, "gapless playback");
        self.inner.initiate(&mut st, seek, true)
    }
}

impl Inner {
    /// Swap in the next track once the current decoder is exhausted.
    pub(super) fn advance_gapless_track(&self, st: &mut ScheduleState) {
        if !st.context.as_ref().is_some_and(|c| c.decoder.at_end()) {
            return;
        }
        let Some(mut next) = st.upcoming.pop_front() else {
            return;
        };
        next.decoder.set_output_format(self.sink.format());
        next.started = true;
        let next_label = next.label.clone();
        if let Some(mut previous) = st.context.replace(next) {
            previous.decoder.stop();
            tracing::debug!(finished = %previous.label, next = %next_label, "gapless track boundary");
        }

        let previous_index = st.track_index;
        st.track_index += 1;
        // A track that never got a buffer scheduled has nothing left to wait for.
        if st.counts.get(previous_index).is_some_and(BufferCount::is_zero) {
            self.finish_gapless_track(st, previous_index);
        }
    }

    pub(super) fn gapless_buffer_completed(&self, st: &mut ScheduleState, track_index: usize) {
        let exhausted = track_index < st.track_index
            || st.context.as_ref().is_none_or(|c| c.decoder.at_end());
        if exhausted && st.counts.get(track_index).is_none_or(BufferCount::is_zero) {
            self.finish_gapless_track(st, track_index);
        }
        self.schedule_deferred_async(st);
    }

    fn finish_gapless_track(&self, st: &mut ScheduleState, track_index: usize) {
        let Some(done) = st.signaled.get_mut(track_index) else {
            return;
        };
        if std::mem::replace(done, true) {
            return;
        }
        let Some(session) = st.session.clone() else {
            return;
        };

        // The next track's first buffer starts rendering now.
        self.sink.reset_seek_position_state(0, 0.0);
        if st.track_index > track_index {
            self.set_info(super::ctx_duration(st), None);
        }

        tracing::info!(session = session.id(), track_index, "gapless track completed");
        self.emit(PlaybackEvent::GaplessTrackCompleted {
            session: session.clone(),
            track_index,
        });
        if track_index + 1 == st.counts.len() {
            self.emit(PlaybackEvent::TrackCompleted { session });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::Rig;
    use super::*;
    use crate::config::EngineConfig;
    use crate::test_support::FakeSource;

    fn small_buffers() -> EngineConfig {
        EngineConfig {
            immediate_buffer_seconds: 0.25,
            deferred_buffer_seconds: 0.5,
            ..EngineConfig::default()
        }
    }

    fn one_second(rig: &Rig) -> PlaybackContext {
        rig.context(FakeSource::new(44_100, 2, 1_152, 44_100))
    }

    #[test]
    fn tracks_play_back_to_back_without_a_gap() {
        let rig = Rig::new(small_buffers());
        let session = rig.registry.start("album");
        let tracks = vec![one_second(&rig), one_second(&rig)];

        rig.scheduler.play_gapless(&session, tracks).unwrap();
        rig.scheduler.settle();
        assert_eq!(rig.backend.history().len(), 2);
        assert_eq!(rig.backend.play_calls(), 1);

        for _ in 0..3 {
            assert!(rig.backend.complete_next());
            rig.scheduler.settle();
        }
        assert_eq!(
            rig.drain_events(),
            vec![PlaybackEvent::GaplessTrackCompleted {
                session: session.clone(),
                track_index: 0
            }]
        );
        rig.backend.advance(4_410);
        assert!((rig.scheduler.seek_position() - 0.1).abs() < 1e-9);

        rig.play_out(20);
        assert_eq!(
            rig.drain_events(),
            vec![
                PlaybackEvent::GaplessTrackCompleted {
                    session: session.clone(),
                    track_index: 1
                },
                PlaybackEvent::TrackCompleted { session },
            ]
        );

        let channel0: Vec<f32> = rig
            .backend
            .history()
            .iter()
            .flat_map(|b| b.samples.iter().step_by(2).copied().collect::<Vec<_>>())
            .collect();
        assert_eq!(channel0.len(), 88_200);
        assert_eq!(channel0[44_099], 44_099.0);
        assert_eq!(channel0[44_100], 0.0);
        assert_eq!(channel0[88_199], 44_099.0);
    }

    #[test]
    fn empty_sequence_is_rejected() {
        let rig = Rig::new(small_buffers());
        let session = rig.registry.start("nothing");
        assert!(matches!(
            rig.scheduler.play_gapless(&session, Vec::new()),
            Err(EngineError::NoActiveContext)
        ));
    }
}
