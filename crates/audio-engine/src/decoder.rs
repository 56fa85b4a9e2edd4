//! Pull-based stream decoder.
//!
//! [`StreamDecoder`] owns one opened stream ([`PacketSource`] + [`Codec`]) and hands out decoded
//! audio in [`FrameBuffer`]s sized by the caller. It is not safe for concurrent pulls; the
//! scheduler keeps it behind a single lock.

use crate::config::EngineConfig;
use crate::error::{DecoderError, FrameError, PacketReadError};
use crate::frame::{Frame, OutputFormat, StreamFormat};
use crate::frame_buffer::FrameBuffer;
use crate::frame_queue::FrameQueue;
use crate::source::{Codec, Packet, PacketSource};

pub struct StreamDecoder {
    source: Box<dyn PacketSource>,
    codec: Box<dyn Codec>,
    frame_queue: FrameQueue,
    output_format: OutputFormat,

    /// Set when the stream is exhausted. Only a successful seek clears it.
    eof: bool,
    /// Set when a bounded decode reached the loop end (or EOF). Cleared by
    /// [`loop_completed`](Self::loop_completed) / [`end_loop`](Self::end_loop).
    end_of_loop: bool,
    /// Sticky: too many consecutive frame pulls failed.
    fatal_error: bool,
    recurring_errors: u32,
    max_recurring_errors: u32,
    seek_tolerance: f64,
    /// End timestamp of the last frame that went through the queue; used to stamp frames whose
    /// packet carried no usable timestamp (drained frames, extra frames of one packet).
    next_start_time: f64,
}

impl StreamDecoder {
    pub fn new(source: Box<dyn PacketSource>, codec: Box<dyn Codec>, config: &EngineConfig) -> Self {
        let format = codec.format();
        Self {
            source,
            codec,
            frame_queue: FrameQueue::new(),
            output_format: OutputFormat {
                sample_rate: format.sample_rate,
                channels: format.channels,
            },
            eof: false,
            end_of_loop: false,
            fatal_error: false,
            recurring_errors: 0,
            max_recurring_errors: config.max_recurring_decode_errors.max(1),
            seek_tolerance: config.seek_tolerance_seconds.max(0.0),
            next_start_time: 0.0,
        }
    }

    /// Format the decoded buffers will be converted to; decides `needs_format_conversion`.
    pub fn set_output_format(&mut self, format: OutputFormat) {
        self.output_format = format;
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    pub fn format(&self) -> StreamFormat {
        self.codec.format()
    }

    pub fn sample_rate(&self) -> u32 {
        self.codec.format().sample_rate
    }

    pub fn duration(&self) -> Option<f64> {
        self.source.duration()
    }

    pub fn eof(&self) -> bool {
        self.eof
    }

    pub fn end_of_loop(&self) -> bool {
        self.end_of_loop
    }

    pub fn has_fatal_error(&self) -> bool {
        self.fatal_error
    }

    /// Nothing more will come out of [`decode`](Self::decode).
    pub fn at_end(&self) -> bool {
        self.eof || self.fatal_error
    }

    /// Decode up to `max_sample_count` samples (per channel).
    ///
    /// At EOF the queued and codec-internal frames are flushed as terminal frames, which may
    /// push the buffer past its budget.
    pub fn decode(&mut self, max_sample_count: usize) -> FrameBuffer {
        self.decode_until(max_sample_count, None)
    }

    /// Like [`decode`](Self::decode) but stops exactly at `loop_end_time`.
    ///
    /// A frame crossing the loop end is cut there; the head is appended as terminal and the
    /// remainder stays queued. `end_of_loop` is set on truncation or on natural EOF.
    pub fn decode_bounded(&mut self, max_sample_count: usize, loop_end_time: f64) -> FrameBuffer {
        self.decode_until(max_sample_count, Some(loop_end_time))
    }

    fn decode_until(&mut self, max_sample_count: usize, loop_end: Option<f64>) -> FrameBuffer {
        let mut buffer = FrameBuffer::new(self.codec.format(), &self.output_format, max_sample_count);
        if loop_end.is_some() && self.end_of_loop {
            return buffer;
        }

        while !self.eof && !self.fatal_error {
            match self.fill_queue() {
                Ok(()) => self.recurring_errors = 0,
                Err(e) if e.is_eof() => {
                    self.eof = true;
                    break;
                }
                Err(e) => {
                    self.record_failure(&e);
                    continue;
                }
            }

            let Some(frame) = self.frame_queue.peek() else {
                continue;
            };
            if let Some(end) = loop_end {
                if crosses(frame, end) {
                    if let Some(mut frame) = self.frame_queue.dequeue() {
                        if let Some(rest) = cut_at(&mut frame, end) {
                            self.frame_queue.push_front(rest);
                        }
                        buffer.append_terminal_frame(frame);
                    }
                    self.end_of_loop = true;
                    tracing::trace!(loop_end = end, samples = buffer.sample_count(), "loop end reached");
                    return buffer;
                }
            }
            if !buffer.can_accept(frame) {
                break;
            }
            if let Some(frame) = self.frame_queue.dequeue() {
                buffer.append_frame(frame);
            }
        }

        if self.eof {
            let mut terminal = self.frame_queue.dequeue_all();
            let drained = self.codec.drain();
            for mut frame in drained {
                self.stamp(&mut frame, None);
                terminal.push(frame);
            }
            if let Some(end) = loop_end {
                terminal = self.bound_terminal_frames(terminal, end);
                self.end_of_loop = true;
            }
            buffer.append_terminal_frames(terminal);
        }
        buffer
    }

    /// Cut terminal frames at `end`, re-queueing whatever lies past it.
    fn bound_terminal_frames(&mut self, frames: Vec<Frame>, end: f64) -> Vec<Frame> {
        let mut kept = Vec::with_capacity(frames.len());
        let mut frames = frames.into_iter();
        for mut frame in frames.by_ref() {
            if crosses(&frame, end) {
                let rest = cut_at(&mut frame, end);
                kept.push(frame);
                self.frame_queue.enqueue_all(rest);
                break;
            }
            kept.push(frame);
        }
        self.frame_queue.enqueue_all(frames);
        kept
    }

    /// Head of the frame queue, decoding packets until one is available.
    ///
    /// The frame stays queued; callers dequeue it once consumed, so a frame rejected by a full
    /// buffer is retried on the next pull without decoding it again.
    pub fn next_frame(&mut self) -> Result<&Frame, FrameError> {
        self.fill_queue()?;
        self.frame_queue
            .peek()
            .ok_or_else(|| FrameError::Read(PacketReadError::eof()))
    }

    fn fill_queue(&mut self) -> Result<(), FrameError> {
        while self.frame_queue.is_empty() {
            let packet = self.source.read_packet()?;
            let frames = self.codec.decode(&packet)?;
            let start = self.packet_time(&packet);
            self.enqueue_decoded(frames, Some(start));
        }
        Ok(())
    }

    fn enqueue_decoded(&mut self, frames: Vec<Frame>, packet_start: Option<f64>) {
        let mut packet_start = packet_start;
        for mut frame in frames {
            self.stamp(&mut frame, packet_start.take());
            if !frame.is_empty() {
                self.frame_queue.enqueue(frame);
            }
        }
    }

    /// Give `frame` a start time if the codec did not, and advance the running timestamp.
    fn stamp(&mut self, frame: &mut Frame, packet_start: Option<f64>) {
        if frame.start_time().is_none() {
            frame.set_start_time(packet_start.unwrap_or(self.next_start_time));
        }
        if let Some(end) = frame.end_time() {
            self.next_start_time = end;
        }
    }

    fn packet_time(&self, packet: &Packet) -> f64 {
        packet.pts as f64 * self.source.time_base()
    }

    fn record_failure(&mut self, e: &FrameError) {
        self.recurring_errors += 1;
        if self.recurring_errors >= self.max_recurring_errors {
            tracing::error!(
                errors = self.recurring_errors,
                "too many consecutive decode errors; giving up on stream: {e}"
            );
            self.fatal_error = true;
        } else {
            tracing::warn!(errors = self.recurring_errors, "skipping undecodable packet: {e}");
        }
    }

    /// Reposition decoding at `time` seconds.
    ///
    /// Container seeks are approximate, so for compressed streams a correction pass decodes
    /// forward from the landing point and trims leading audio until the first queued sample is
    /// within the seek tolerance of `time`. Seeking at or past the end sets `eof` and is not an
    /// error.
    pub fn seek(&mut self, time: f64) -> Result<(), DecoderError> {
        self.frame_queue.clear();
        self.codec.flush_buffers();

        if let Err(e) = self.source.seek(time) {
            if e.is_eof {
                tracing::debug!(time, "seek past end of stream");
                self.eof = true;
                return Ok(());
            }
            tracing::warn!(time, code = e.code, "seek failed: {}", e.message);
            return Err(e.into());
        }

        self.eof = false;
        self.fatal_error = false;
        self.recurring_errors = 0;
        self.next_start_time = time.max(0.0);

        if !self.source.is_raw_audio() {
            self.correct_seek(time);
        }
        Ok(())
    }

    fn correct_seek(&mut self, time: f64) {
        let mut packets: Vec<(Packet, f64)> = Vec::new();
        let mut failures = 0;
        let first_after = loop {
            match self.source.read_packet() {
                Ok(packet) => {
                    let ts = self.packet_time(&packet);
                    packets.push((packet, ts));
                    if ts > time {
                        break Some(packets.len() - 1);
                    }
                }
                Err(e) if e.is_eof => break None,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(time, "packet read failed while correcting seek: {e}");
                    if failures >= self.max_recurring_errors {
                        break None;
                    }
                }
            }
        };

        let Some(first_after) = first_after else {
            if failures < self.max_recurring_errors {
                tracing::debug!(time, "stream ended before seek target");
                self.eof = true;
            }
            return;
        };

        let first_usable = first_after.saturating_sub(1);
        for (packet, _) in &packets[..first_usable] {
            if let Err(e) = self.codec.decode_and_drop(packet) {
                tracing::trace!("dropped packet failed to decode: {e}");
            }
        }

        let mut frames = Vec::new();
        for (packet, ts) in &packets[first_usable..] {
            match self.codec.decode(packet) {
                Ok(decoded) => {
                    let mut packet_start = Some(*ts);
                    for mut frame in decoded {
                        self.stamp(&mut frame, packet_start.take());
                        frames.push(frame);
                    }
                }
                Err(e) => tracing::warn!("packet after seek failed to decode: {e}"),
            }
        }

        let landed = frames.first().and_then(Frame::start_time).unwrap_or(time);
        if time - landed > self.seek_tolerance {
            trim_before(&mut frames, time);
            tracing::debug!(time, landed, "trimmed leading samples after seek");
        }
        self.frame_queue
            .enqueue_all(frames.into_iter().filter(|f| !f.is_empty()));
    }

    /// Clear queued frames (playback halted). The codec is flushed by the next seek.
    pub fn stop(&mut self) {
        self.frame_queue.clear();
    }

    /// Prepare for the next loop iteration.
    pub fn loop_completed(&mut self) {
        self.end_of_loop = false;
    }

    /// The loop was removed; continue decoding past the former loop end.
    pub fn end_loop(&mut self) {
        self.end_of_loop = false;
    }

    pub fn queued_frame_count(&self) -> usize {
        self.frame_queue.len()
    }
}

fn crosses(frame: &Frame, end: f64) -> bool {
    frame.end_time().is_some_and(|frame_end| frame_end > end)
}

/// Keep the part of `frame` before `end`; returns the part at or after it.
fn cut_at(frame: &mut Frame, end: f64) -> Option<Frame> {
    let start = frame.start_time()?;
    let keep = ((end - start) * frame.sample_rate() as f64).round().max(0.0) as usize;
    frame.split_off(keep.min(frame.sample_count()))
}

/// Drop samples timestamped before `time` from the front of `frames`.
fn trim_before(frames: &mut Vec<Frame>, time: f64) {
    let mut drop_whole = 0;
    for frame in frames.iter_mut() {
        let (Some(start), Some(end)) = (frame.start_time(), frame.end_time()) else {
            break;
        };
        if end <= time {
            drop_whole += 1;
            continue;
        }
        if start < time {
            let keep = ((end - time) * frame.sample_rate() as f64).round() as usize;
            frame.keep_last(keep);
        }
        break;
    }
    frames.drain(..drop_whole);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeSource, first_sample, last_sample};

    const RATE: u32 = 44_100;

    fn decoder(source: FakeSource) -> StreamDecoder {
        let codec = source.codec();
        StreamDecoder::new(Box::new(source), Box::new(codec), &EngineConfig::default())
    }

    fn delayed_decoder(source: FakeSource) -> StreamDecoder {
        let codec = source.codec().delayed();
        StreamDecoder::new(Box::new(source), Box::new(codec), &EngineConfig::default())
    }

    fn ten_seconds() -> StreamDecoder {
        decoder(FakeSource::new(RATE, 1, 1_152, RATE as usize * 10))
    }

    #[test]
    fn decode_respects_budget_until_eof() {
        let mut d = decoder(FakeSource::new(1_000, 1, 100, 1_050));
        let buf = d.decode(250);
        assert_eq!(buf.sample_count(), 200);
        assert!(!buf.is_terminal());
        assert_eq!(buf.start_time(), Some(0.0));

        let buf = d.decode(250);
        assert_eq!(first_sample(&buf), Some(200.0));
        assert_eq!(buf.sample_count(), 200);

        let mut total = 400;
        loop {
            let buf = d.decode(250);
            total += buf.sample_count();
            if d.eof() {
                assert!(buf.is_terminal());
                break;
            }
            assert!(buf.sample_count() <= 250);
        }
        assert_eq!(total, 1_050);
    }

    #[test]
    fn rejected_frame_is_not_lost() {
        let mut d = decoder(FakeSource::new(1_000, 2, 300, 900));
        let a = d.decode(400);
        let b = d.decode(400);
        assert_eq!(a.sample_count(), 300);
        assert_eq!(first_sample(&b), Some(300.0));
    }

    #[test]
    fn frames_of_one_packet_are_chained_in_time() {
        let source = FakeSource::new(1_000, 1, 100, 300);
        let codec = source.codec().split_into(4);
        let mut d = StreamDecoder::new(Box::new(source), Box::new(codec), &EngineConfig::default());
        let head = d.next_frame().unwrap();
        assert_eq!(head.sample_count(), 25);
        assert_eq!(head.start_time(), Some(0.0));

        let buf = d.decode(1_000);
        assert_eq!(buf.frames().len(), 12);
        assert!((buf.frames()[5].start_time().unwrap() - 0.125).abs() < 1e-9);
    }

    #[test]
    fn eof_flushes_drained_frames_as_terminal() {
        let mut d = delayed_decoder(FakeSource::new(1_000, 1, 100, 500));
        let buf = d.decode(10_000);
        assert!(d.eof());
        assert!(buf.is_terminal());
        assert_eq!(buf.sample_count(), 500);
        assert_eq!(last_sample(&buf), Some(499.0));
    }

    #[test]
    fn bad_packet_is_skipped() {
        let mut d = decoder(FakeSource::new(1_000, 1, 100, 500).with_bad_packets(&[2]));
        let buf = d.decode(10_000);
        assert!(d.eof());
        assert!(!d.has_fatal_error());
        assert_eq!(buf.sample_count(), 400);
    }

    #[test]
    fn recurring_errors_become_fatal() {
        let bad: Vec<usize> = (1..20).collect();
        let mut d = decoder(FakeSource::new(1_000, 1, 100, 3_000).with_bad_packets(&bad));
        let buf = d.decode(10_000);
        assert!(d.has_fatal_error());
        assert!(d.at_end());
        assert!(!d.eof());
        assert_eq!(buf.sample_count(), 100);
        assert!(d.decode(10_000).is_empty());
    }

    #[test]
    fn seek_lands_within_tolerance() {
        for target in [0.5, 1.234, 3.0001, 7.77] {
            let mut d = ten_seconds();
            d.seek(target).unwrap();
            assert!(!d.eof());
            let buf = d.decode(4_096);
            let first = first_sample(&buf).unwrap() as f64 / RATE as f64;
            assert!((first - target).abs() <= 0.01, "target {target} landed {first}");
            let stamped = buf.start_time().unwrap();
            assert!((stamped - first).abs() < 1e-6);
        }
    }

    #[test]
    fn seek_with_delayed_codec_still_lands_on_target() {
        let mut d = delayed_decoder(FakeSource::new(RATE, 2, 1_024, RATE as usize * 4));
        d.seek(2.5).unwrap();
        let buf = d.decode(4_096);
        let first = first_sample(&buf).unwrap() as f64 / RATE as f64;
        assert!((first - 2.5).abs() <= 0.01);
    }

    #[test]
    fn seek_near_end_sets_eof() {
        let mut d = ten_seconds();
        d.seek(9.99).unwrap();
        assert!(d.eof());
        assert_eq!(d.queued_frame_count(), 0);
    }

    #[test]
    fn seek_past_end_sets_eof_and_successful_seek_clears_it() {
        let mut d = ten_seconds();
        d.seek(12.0).unwrap();
        assert!(d.eof());
        d.seek(1.0).unwrap();
        assert!(!d.eof());
    }

    #[test]
    fn seek_failure_is_surfaced_and_decoder_stays_usable() {
        let mut d = decoder(FakeSource::new(1_000, 1, 100, 1_000).with_seek_failure(7));
        let err = d.seek(0.5).unwrap_err();
        assert_eq!(err.code, 7);
        assert!(!d.eof());
        assert_eq!(d.decode(100).sample_count(), 100);
    }

    #[test]
    fn raw_audio_skips_correction() {
        let mut d = decoder(FakeSource::new(1_000, 1, 100, 1_000).raw().with_seek_slop(3));
        d.seek(0.55).unwrap();
        // Raw sources are trusted; the fake lands 3 packets early and nothing corrects it.
        assert_eq!(first_sample(&d.decode(100)), Some(200.0));
    }

    #[test]
    fn bounded_decode_stops_exactly_at_loop_end() {
        let mut d = decoder(FakeSource::new(RATE, 2, 1_152, RATE as usize * 10));
        d.seek(2.0).unwrap();
        let mut last = 0.0;
        while !d.end_of_loop() {
            let buf = d.decode_bounded(20_000, 4.0);
            if let Some(s) = last_sample(&buf) {
                last = s;
            }
        }
        assert_eq!(last as usize, 4 * RATE as usize - 1);

        // The remainder stays queued for when the loop is removed.
        d.end_loop();
        assert_eq!(first_sample(&d.decode(1_000)), Some((4 * RATE) as f32));
    }

    #[test]
    fn bounded_decode_sets_end_of_loop_on_natural_eof() {
        let mut d = decoder(FakeSource::new(1_000, 1, 100, 1_000));
        d.seek(0.5).unwrap();
        let buf = d.decode_bounded(10_000, 5.0);
        assert!(d.eof());
        assert!(d.end_of_loop());
        assert_eq!(last_sample(&buf), Some(999.0));
        assert!(d.decode_bounded(10_000, 5.0).is_empty());
        d.loop_completed();
        assert!(!d.end_of_loop());
    }

    #[test]
    fn trim_before_drops_whole_and_partial_frames() {
        use crate::frame::SampleData;
        let mk = |start: usize| {
            Frame::new(SampleData::F32((start..start + 10).map(|i| i as f32).collect()), 1, 100)
                .with_start_time(start as f64 / 100.0)
        };
        let mut frames = vec![mk(0), mk(10), mk(20)];
        trim_before(&mut frames, 0.13);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].f32_samples().unwrap()[0], 13.0);
    }
}
