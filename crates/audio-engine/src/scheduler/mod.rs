//! Buffer scheduler: keeps the output sink fed from a [`StreamDecoder`].
//!
//! Every play attempt schedules one small buffer synchronously (fast start) and hands a second,
//! larger one to a serial background queue. Each completed buffer schedules the next, so one
//! buffer is always decoded ahead of the one playing.
//!
//! Completions arrive on backend threads. They are forwarded over a channel to a dispatcher
//! thread, which runs the completion cascade under the same control lock the public operations
//! take. Each play attempt bumps an epoch; completions from an older epoch, or for a session the
//! caller no longer considers current, are ignored.

mod gapless;
mod looping;
mod serial_queue;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};

use crate::config::EngineConfig;
use crate::convert::SampleConverter;
use crate::decoder::StreamDecoder;
use crate::demux;
use crate::error::EngineError;
use crate::output::{BufferOutcome, OutputBackend, OutputSink};
use crate::session::{PlaybackLoop, PlaybackSession, SessionQuery};

use serial_queue::SerialQueue;

/// Notifications for the track-sequencing layer, delivered on the scheduler's event channel.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaybackEvent {
    /// Every buffer of the track has played. Sent at most once per play attempt.
    TrackCompleted { session: PlaybackSession },
    /// A loop reached its end and playback jumped back to `start_time`.
    LoopRestarted {
        session: PlaybackSession,
        start_time: f64,
    },
    /// Track `track_index` of a gapless sequence has finished playing.
    GaplessTrackCompleted {
        session: PlaybackSession,
        track_index: usize,
    },
}

/// One opened track, ready to be scheduled.
pub struct PlaybackContext {
    label: String,
    decoder: StreamDecoder,
    duration: f64,
    immediate_sample_count: usize,
    deferred_sample_count: usize,
    /// The decoder has been read from since it was opened.
    started: bool,
}

impl PlaybackContext {
    pub fn new(label: impl Into<String>, decoder: StreamDecoder, config: &EngineConfig) -> Self {
        let rate = decoder.sample_rate();
        Self {
            label: label.into(),
            duration: decoder.duration().unwrap_or(0.0),
            immediate_sample_count: config.immediate_sample_count(rate),
            deferred_sample_count: config.deferred_sample_count(rate),
            decoder,
            started: false,
        }
    }

    /// Probe and open `path` with the Symphonia-backed source and codec.
    pub fn open(path: &Path, config: &EngineConfig) -> Result<Self> {
        let (source, codec, info) =
            demux::open_file(path).with_context(|| format!("open {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            codec = info.codec.as_deref(),
            sample_rate = info.sample_rate,
            channels = info.channels,
            duration = ?info.duration,
            "track opened"
        );
        let decoder = StreamDecoder::new(Box::new(source), Box::new(codec), config);
        Ok(Self::new(path.display().to_string(), decoder, config))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Track duration in seconds (0 when the container does not say).
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn decoder(&self) -> &StreamDecoder {
        &self.decoder
    }

    pub fn sample_rate(&self) -> u32 {
        self.decoder.sample_rate()
    }
}

/// Buffers handed to the sink and not yet completed, for one track.
#[derive(Debug, Default)]
struct BufferCount(AtomicUsize);

impl BufferCount {
    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn is_zero(&self) -> bool {
        self.get() == 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Mode {
    Track,
    Loop { end_time: f64 },
    Gapless,
}

struct ScheduleState {
    context: Option<PlaybackContext>,
    session: Option<PlaybackSession>,
    /// Session whose buffers were handed over to `session` by `end_loop`.
    handed_over: Option<PlaybackSession>,
    epoch: u64,
    mode: Mode,
    converter: Box<dyn SampleConverter>,
    /// Per-track buffer counts; index 0 unless playing gapless.
    counts: Vec<BufferCount>,
    /// Completion already signaled, per track.
    signaled: Vec<bool>,
    /// Index of the track the decoder is currently reading.
    track_index: usize,
    upcoming: VecDeque<PlaybackContext>,
    /// A seek landed past the end while paused; `resume` reports the completion.
    completed_while_paused: bool,
}

impl ScheduleState {
    fn reset_counts(&mut self, tracks: usize) {
        self.counts = (0..tracks.max(1)).map(|_| BufferCount::default()).collect();
        self.signaled = vec![false; tracks.max(1)];
        self.track_index = 0;
    }

    fn current_count(&self) -> usize {
        self.counts.get(self.track_index).map_or(0, BufferCount::get)
    }

    /// Nothing more will be decoded for the current play attempt.
    fn decoding_finished(&self) -> bool {
        let Some(ctx) = self.context.as_ref() else {
            return true;
        };
        match self.mode {
            Mode::Loop { .. } => ctx.decoder.end_of_loop() || ctx.decoder.has_fatal_error(),
            Mode::Track => ctx.decoder.at_end(),
            Mode::Gapless => ctx.decoder.at_end() && self.upcoming.is_empty(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct TrackInfo {
    duration: f64,
    playback_loop: Option<PlaybackLoop>,
}

enum Notice {
    /// A scheduled buffer left the sink.
    BufferDone {
        session: PlaybackSession,
        epoch: u64,
        track_index: usize,
        outcome: BufferOutcome,
    },
    /// A background task found nothing left to schedule while no buffer was outstanding.
    Exhausted { epoch: u64, track_index: usize },
}

struct Inner {
    me: Weak<Inner>,
    sink: OutputSink,
    sessions: Arc<dyn SessionQuery>,
    control: Mutex<()>,
    state: Mutex<ScheduleState>,
    info: Mutex<TrackInfo>,
    queue: SerialQueue,
    notices: Sender<Notice>,
    /// Notices sent and not yet handled by the dispatcher.
    pending_notices: Arc<AtomicUsize>,
    events: Sender<PlaybackEvent>,
}

/// Double-buffering scheduler over one [`OutputSink`].
pub struct BufferScheduler {
    inner: Arc<Inner>,
}

impl BufferScheduler {
    /// Create a scheduler playing through `backend`.
    ///
    /// `sessions` decides which session is current; events are delivered on the returned
    /// receiver, from the scheduler's dispatcher thread.
    pub fn new(
        backend: Arc<dyn OutputBackend>,
        sessions: Arc<dyn SessionQuery>,
        converter: Box<dyn SampleConverter>,
    ) -> Result<(Self, Receiver<PlaybackEvent>)> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (notice_tx, notice_rx) = crossbeam_channel::unbounded();
        let queue = SerialQueue::new("audio-scheduling")?;

        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            sink: OutputSink::new(backend),
            sessions,
            control: Mutex::new(()),
            state: Mutex::new(ScheduleState {
                context: None,
                session: None,
                handed_over: None,
                epoch: 0,
                mode: Mode::Track,
                converter,
                counts: vec![BufferCount::default()],
                signaled: vec![false],
                track_index: 0,
                upcoming: VecDeque::new(),
                completed_while_paused: false,
            }),
            info: Mutex::new(TrackInfo::default()),
            queue,
            notices: notice_tx,
            pending_notices: Arc::new(AtomicUsize::new(0)),
            events: events_tx,
        });

        let weak = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("audio-dispatch".to_string())
            .spawn(move || dispatcher_main(weak, notice_rx))
            .context("spawn scheduler dispatcher")?;

        Ok((Self { inner }, events_rx))
    }

    /// Make `context` the active track, replacing (and stopping) whatever was loaded.
    pub fn load(&self, mut context: PlaybackContext) {
        let _control = self.inner.lock_control();
        self.inner.halt();
        context.decoder.set_output_format(self.inner.sink.format());
        self.inner.set_info(context.duration, None);
        tracing::debug!(track = %context.label, duration = context.duration, "context loaded");
        self.inner.lock_state().context = Some(context);
    }

    /// Stop and drop the active track.
    pub fn unload(&self) -> Option<PlaybackContext> {
        let _control = self.inner.lock_control();
        self.inner.halt();
        self.inner.lock_state().context.take()
    }

    /// Start playing the loaded track from `start_position` seconds.
    ///
    /// A start past the end signals [`PlaybackEvent::TrackCompleted`] without scheduling.
    pub fn play_track(&self, session: &PlaybackSession, start_position: f64) -> Result<(), EngineError> {
        let _control = self.inner.lock_control();
        self.inner.halt();
        let mut st = self.inner.lock_state();
        let ctx = st.context.as_ref().ok_or(EngineError::NoActiveContext)?;
        let seek = (start_position > 0.0 || ctx.started).then_some(start_position.max(0.0));
        self.inner.begin_attempt(&mut st, session, Mode::Track, 1);
        self.inner.set_info(ctx_duration(&st), open_loop(session));
        self.inner.initiate(&mut st, seek, true)
    }

    /// Restart the current session from `time` seconds.
    ///
    /// A session with a complete loop restarts loop playback from `time`. Playback (re)starts
    /// only if `begin_playback` is set and at least one buffer was scheduled.
    pub fn seek_to_time(
        &self,
        session: &PlaybackSession,
        time: f64,
        begin_playback: bool,
    ) -> Result<(), EngineError> {
        let _control = self.inner.lock_control();
        if session.has_complete_loop() {
            return self.inner.start_loop(session, Some(time), begin_playback).map(drop);
        }
        self.inner.halt();
        let mut st = self.inner.lock_state();
        if st.context.is_none() {
            return Err(EngineError::NoActiveContext);
        }
        self.inner.begin_attempt(&mut st, session, Mode::Track, 1);
        self.inner.set_info(ctx_duration(&st), open_loop(session));
        self.inner.initiate(&mut st, Some(time.max(0.0)), begin_playback)
    }

    pub fn pause(&self) {
        let _control = self.inner.lock_control();
        self.inner.sink.pause();
    }

    /// Resume after [`pause`](Self::pause), or report a completion that happened while paused.
    pub fn resume(&self) {
        let _control = self.inner.lock_control();
        let mut st = self.inner.lock_state();
        if std::mem::take(&mut st.completed_while_paused) {
            self.inner.signal_track_completed(&mut st);
            return;
        }
        drop(st);
        self.inner.sink.play();
    }

    /// Cancel pending scheduling (blocking until in-flight tasks finish) and stop the sink.
    pub fn stop(&self) {
        let _control = self.inner.lock_control();
        self.inner.halt();
    }

    /// Playback position in seconds.
    pub fn seek_position(&self) -> f64 {
        let info = *self.inner.lock_info();
        self.inner.sink.seek_position(info.duration, info.playback_loop)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.sink.is_playing()
    }

    /// Buffers of the current track handed to the sink and not yet completed.
    pub fn scheduled_buffer_count(&self) -> usize {
        self.inner.lock_state().current_count()
    }

    /// Block until no background task or completion is pending.
    #[cfg(test)]
    pub(crate) fn settle(&self) {
        let inner = &self.inner;
        let idle = crate::test_support::wait_until(std::time::Duration::from_secs(5), || {
            inner.queue.operation_count() == 0 && inner.pending_notices.load(Ordering::Acquire) == 0
        });
        assert!(idle, "scheduler did not settle");
    }
}

impl Drop for BufferScheduler {
    fn drop(&mut self) {
        let _control = self.inner.lock_control();
        self.inner.halt();
    }
}

fn ctx_duration(st: &ScheduleState) -> f64 {
    st.context.as_ref().map_or(0.0, |c| c.duration)
}

/// A loop start without an end still bounds the reported position from below.
fn open_loop(session: &PlaybackSession) -> Option<PlaybackLoop> {
    session.playback_loop().filter(|lp| !lp.is_complete())
}

impl Inner {
    fn lock_control(&self) -> MutexGuard<'_, ()> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_info(&self) -> MutexGuard<'_, TrackInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_info(&self, duration: f64, playback_loop: Option<PlaybackLoop>) {
        *self.lock_info() = TrackInfo {
            duration,
            playback_loop,
        };
    }

    /// Abandon the current play attempt. Caller holds the control lock, not the state lock.
    fn halt(&self) {
        self.lock_state().epoch += 1;
        self.queue.cancel_all_and_wait();
        self.sink.stop();

        let mut st = self.lock_state();
        if let Some(ctx) = st.context.as_mut() {
            ctx.decoder.stop();
        }
        st.converter.reset();
        st.reset_counts(1);
        st.upcoming.clear();
        st.completed_while_paused = false;
    }

    /// Adopt `session` for a fresh play attempt of `tracks` tracks.
    fn begin_attempt(&self, st: &mut ScheduleState, session: &PlaybackSession, mode: Mode, tracks: usize) {
        st.session = Some(session.clone());
        st.handed_over = None;
        st.mode = mode;
        st.reset_counts(tracks);
        let format = self.sink.format();
        if let Some(ctx) = st.context.as_mut() {
            ctx.decoder.set_output_format(format);
        }
    }

    /// Seek (optionally), schedule the immediate buffer, queue the first deferred one, and start
    /// the sink if anything was scheduled.
    fn initiate(
        &self,
        st: &mut ScheduleState,
        seek: Option<f64>,
        begin_playback: bool,
    ) -> Result<(), EngineError> {
        let Some(ctx) = st.context.as_mut() else {
            return Err(EngineError::NoActiveContext);
        };
        ctx.started = true;
        if let Some(time) = seek {
            ctx.decoder.seek(time)?;
            if ctx.decoder.eof() {
                let duration = ctx.duration;
                tracing::debug!(time, track = %ctx.label, "seek landed past the end");
                self.sink.seek_to_end_of_track(duration);
                if begin_playback {
                    self.signal_track_completed(st);
                } else {
                    st.completed_while_paused = true;
                }
                return Ok(());
            }
        }

        self.schedule_one(st, true, Some(seek.unwrap_or(0.0)));
        self.schedule_deferred_async(st);

        if st.current_count() > 0 {
            if begin_playback {
                self.sink.play();
            }
        } else {
            tracing::warn!("no buffers scheduled; cannot begin playback");
            if st.decoding_finished() {
                self.signal_track_completed(st);
            }
        }
        Ok(())
    }

    /// Decode one buffer for the current mode and hand it to the sink.
    ///
    /// Returns `false` if nothing was scheduled.
    fn schedule_one(&self, st: &mut ScheduleState, immediate: bool, start_time: Option<f64>) -> bool {
        let target = self.sink.format();
        let mode = st.mode;
        let track_index = st.track_index;
        let epoch = st.epoch;
        let Some(session) = st.session.clone() else {
            return false;
        };
        let Some(ctx) = st.context.as_mut() else {
            return false;
        };

        let buffer = match mode {
            Mode::Loop { end_time } => {
                if ctx.decoder.end_of_loop() {
                    return false;
                }
                let max = if immediate {
                    ctx.immediate_sample_count
                } else {
                    ctx.deferred_sample_count
                };
                ctx.decoder.decode_bounded(max, end_time)
            }
            Mode::Track | Mode::Gapless => {
                if ctx.decoder.at_end() {
                    return false;
                }
                let max = if immediate {
                    ctx.immediate_sample_count
                } else {
                    ctx.deferred_sample_count
                };
                ctx.decoder.decode(max)
            }
        };

        if buffer.is_empty() {
            if ctx.decoder.has_fatal_error() {
                tracing::error!(track = %ctx.label, "track is no longer readable");
            }
            return false;
        }

        let pcm = if buffer.needs_format_conversion() {
            st.converter.convert(&buffer, &target)
        } else {
            buffer.copy_samples()
        };
        if pcm.is_empty() {
            // Resampler still priming.
            return false;
        }

        tracing::trace!(
            session = session.id(),
            epoch,
            track_index,
            immediate,
            frames = pcm.frames(),
            start = ?buffer.start_time(),
            terminal = buffer.is_terminal(),
            "scheduling buffer"
        );

        if let Some(count) = st.counts.get(track_index) {
            count.increment();
        }
        let notices = self.notices.clone();
        let pending = self.pending_notices.clone();
        self.sink.schedule_buffer(
            pcm,
            &session,
            move |session, outcome| {
                pending.fetch_add(1, Ordering::AcqRel);
                let notice = Notice::BufferDone {
                    session,
                    epoch,
                    track_index,
                    outcome,
                };
                if notices.send(notice).is_err() {
                    pending.fetch_sub(1, Ordering::AcqRel);
                }
            },
            start_time,
            immediate,
        );
        true
    }

    /// Queue one deferred buffer on the background queue.
    fn schedule_deferred_async(&self, st: &ScheduleState) {
        if st.decoding_finished() {
            return;
        }
        let epoch = st.epoch;
        let me = self.me.clone();
        self.queue.add_operation(move || {
            if let Some(inner) = me.upgrade() {
                inner.run_deferred(epoch);
            }
        });
    }

    /// Background task body.
    fn run_deferred(&self, epoch: u64) {
        let mut st = self.lock_state();
        if st.epoch != epoch {
            return;
        }
        if !st.session.as_ref().is_some_and(|s| self.sessions.is_current(s)) {
            tracing::trace!(epoch, "deferred task for a stale session");
            return;
        }
        if st.mode == Mode::Gapless {
            self.advance_gapless_track(&mut st);
        }
        if !self.schedule_one(&mut st, false, None) && st.current_count() == 0 {
            // Nothing in flight will ever complete; let the dispatcher finish the attempt.
            self.notify(Notice::Exhausted {
                epoch,
                track_index: st.track_index,
            });
        }
    }

    fn notify(&self, notice: Notice) {
        self.pending_notices.fetch_add(1, Ordering::AcqRel);
        if self.notices.send(notice).is_err() {
            self.pending_notices.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn emit(&self, event: PlaybackEvent) {
        tracing::debug!(?event, "playback event");
        let _ = self.events.send(event);
    }

    fn signal_track_completed(&self, st: &mut ScheduleState) {
        let index = st.track_index;
        let Some(done) = st.signaled.get_mut(index) else {
            return;
        };
        if std::mem::replace(done, true) {
            return;
        }
        if let Some(session) = st.session.clone() {
            tracing::info!(session = session.id(), "track playback completed");
            self.emit(PlaybackEvent::TrackCompleted { session });
        }
    }

    /// Completion cascade; runs on the dispatcher thread.
    fn handle_notice(&self, notice: Notice) {
        let _control = self.lock_control();
        let mut st = self.lock_state();

        let (epoch, track_index, outcome) = match &notice {
            Notice::BufferDone {
                epoch,
                track_index,
                outcome,
                ..
            } => (*epoch, *track_index, Some(*outcome)),
            Notice::Exhausted { epoch, track_index } => (*epoch, *track_index, None),
        };
        if epoch != st.epoch {
            tracing::trace!(epoch, current = st.epoch, "stale completion");
            return;
        }
        let Some(active) = st.session.clone() else {
            return;
        };
        if let Notice::BufferDone { session, .. } = &notice {
            if *session != active && st.handed_over.as_ref() != Some(session) {
                tracing::trace!(session = session.id(), "completion for a replaced session");
                return;
            }
        }
        if !self.sessions.is_current(&active) {
            tracing::trace!(session = active.id(), "completion for a session that is no longer current");
            return;
        }

        if let Some(outcome) = outcome {
            if let Some(count) = st.counts.get(track_index) {
                count.decrement();
            }
            if outcome == BufferOutcome::Flushed {
                return;
            }
        }

        match st.mode {
            Mode::Track => self.track_buffer_completed(&mut st),
            Mode::Loop { .. } => {
                if let Some(restart) = self.loop_buffer_completed(&mut st) {
                    drop(st);
                    self.restart_loop(&restart);
                }
            }
            Mode::Gapless => self.gapless_buffer_completed(&mut st, track_index),
        }
    }

    fn track_buffer_completed(&self, st: &mut ScheduleState) {
        if !st.decoding_finished() {
            self.schedule_deferred_async(st);
        } else if st.counts.get(st.track_index).is_none_or(BufferCount::is_zero) {
            self.signal_track_completed(st);
        }
    }
}

fn dispatcher_main(inner: Weak<Inner>, notices: Receiver<Notice>) {
    while let Ok(notice) = notices.recv() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_notice(notice);
        inner.pending_notices.fetch_sub(1, Ordering::AcqRel);
    }
    tracing::debug!("scheduler dispatcher exiting");
}
