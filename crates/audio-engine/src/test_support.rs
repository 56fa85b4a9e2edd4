//! Synthetic collaborators for unit tests.
//!
//! Every decoded sample carries its own sample index as its value (on every channel), so tests
//! can tell exactly which part of the stream ended up in a buffer.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CODE_DECODE, DecoderError, PacketReadError, SeekError};
use crate::frame::{Frame, OutputFormat, PcmBuffer, SampleData, SampleFormat, StreamFormat};
use crate::frame_buffer::FrameBuffer;
use crate::output::{BufferCompletion, BufferOutcome, OutputBackend};
use crate::source::{Codec, Packet, PacketSource};

const HEADER_LEN: usize = 13;

fn encode_packet(first: u64, count: u32, bad: bool) -> Box<[u8]> {
    let mut data = Vec::with_capacity(HEADER_LEN);
    data.extend_from_slice(&first.to_le_bytes());
    data.extend_from_slice(&count.to_le_bytes());
    data.push(u8::from(bad));
    data.into_boxed_slice()
}

fn decode_packet(data: &[u8]) -> Option<(u64, u32, bool)> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let first = u64::from_le_bytes(data[0..8].try_into().ok()?);
    let count = u32::from_le_bytes(data[8..12].try_into().ok()?);
    Some((first, count, data[12] != 0))
}

/// Packet source over a virtual stream of `total_samples` samples.
///
/// Seeks land `seek_slop` packets before the target packet, like a coarse container index.
pub(crate) struct FakeSource {
    rate: u32,
    channels: usize,
    packet_samples: usize,
    total_samples: usize,
    next_packet: usize,
    seek_slop: usize,
    raw: bool,
    bad_packets: HashSet<usize>,
    seek_failure: Option<i32>,
}

impl FakeSource {
    pub fn new(rate: u32, channels: usize, packet_samples: usize, total_samples: usize) -> Self {
        Self {
            rate,
            channels,
            packet_samples: packet_samples.max(1),
            total_samples,
            next_packet: 0,
            seek_slop: 3,
            raw: false,
            bad_packets: HashSet::new(),
            seek_failure: None,
        }
    }

    pub fn with_bad_packets(mut self, packets: &[usize]) -> Self {
        self.bad_packets.extend(packets.iter().copied());
        self
    }

    pub fn with_seek_slop(mut self, packets: usize) -> Self {
        self.seek_slop = packets;
        self
    }

    pub fn with_seek_failure(mut self, code: i32) -> Self {
        self.seek_failure = Some(code);
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    /// A codec producing this source's format.
    pub fn codec(&self) -> FakeCodec {
        FakeCodec::new(self.rate, self.channels)
    }

    fn packet_count(&self) -> usize {
        self.total_samples.div_ceil(self.packet_samples)
    }
}

impl PacketSource for FakeSource {
    fn read_packet(&mut self) -> Result<Packet, PacketReadError> {
        if self.next_packet >= self.packet_count() {
            return Err(PacketReadError::eof());
        }
        let index = self.next_packet;
        self.next_packet += 1;
        let first = index * self.packet_samples;
        let count = self.packet_samples.min(self.total_samples - first);
        Ok(Packet {
            pts: first as i64,
            duration: count as u64,
            trim_start: 0,
            trim_end: 0,
            data: encode_packet(first as u64, count as u32, self.bad_packets.contains(&index)),
        })
    }

    fn seek(&mut self, time: f64) -> Result<(), SeekError> {
        if let Some(code) = self.seek_failure {
            return Err(SeekError::other(code, "index unavailable"));
        }
        let target_sample = (time.max(0.0) * self.rate as f64) as usize;
        if target_sample >= self.total_samples {
            return Err(SeekError::eof());
        }
        let target_packet = target_sample / self.packet_samples;
        self.next_packet = target_packet.saturating_sub(self.seek_slop);
        Ok(())
    }

    fn is_raw_audio(&self) -> bool {
        self.raw
    }

    fn time_base(&self) -> f64 {
        1.0 / self.rate as f64
    }

    fn duration(&self) -> Option<f64> {
        Some(self.total_samples as f64 / self.rate as f64)
    }
}

/// Codec for [`FakeSource`] packets.
///
/// In delayed mode each packet's audio comes out one `decode` call late (with its own
/// timestamp) and the last packet only comes out of `drain`, like codecs with lookahead.
pub(crate) struct FakeCodec {
    format: StreamFormat,
    delayed: bool,
    pending: Option<Frame>,
    split: usize,
}

impl FakeCodec {
    pub fn new(rate: u32, channels: usize) -> Self {
        Self {
            format: StreamFormat {
                sample_rate: rate,
                channels,
                sample_format: SampleFormat::F32,
            },
            delayed: false,
            pending: None,
            split: 1,
        }
    }

    pub fn delayed(mut self) -> Self {
        self.delayed = true;
        self
    }

    /// Emit each packet as `parts` frames.
    pub fn split_into(mut self, parts: usize) -> Self {
        self.split = parts.max(1);
        self
    }
}

impl Codec for FakeCodec {
    fn format(&self) -> StreamFormat {
        self.format
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, DecoderError> {
        let (first, count, bad) = decode_packet(&packet.data)
            .ok_or_else(|| DecoderError::new(CODE_DECODE, "truncated packet"))?;
        if bad {
            return Err(DecoderError::new(CODE_DECODE, "corrupt packet"));
        }
        let channels = self.format.channels;
        let samples: Vec<f32> = (first..first + count as u64)
            .flat_map(|i| std::iter::repeat_n(i as f32, channels))
            .collect();
        let mut frame = Frame::new(SampleData::F32(samples), channels, self.format.sample_rate);

        if self.delayed {
            frame.set_start_time(first as f64 / self.format.sample_rate as f64);
            return Ok(self.pending.replace(frame).into_iter().collect());
        }

        let mut frames = Vec::with_capacity(self.split);
        let part = (count as usize).div_ceil(self.split).max(1);
        while let Some(rest) = frame.split_off(part) {
            frames.push(frame);
            frame = rest;
        }
        frames.push(frame);
        Ok(frames)
    }

    fn drain(&mut self) -> Vec<Frame> {
        self.pending.take().into_iter().collect()
    }

    fn flush_buffers(&mut self) {
        self.pending = None;
    }
}

struct ManualState {
    queue: VecDeque<(PcmBuffer, BufferCompletion)>,
    history: Vec<PcmBuffer>,
    playing: bool,
    sample_time: Option<i64>,
    play_calls: usize,
}

/// Output backend whose buffers only complete when the test says so.
pub(crate) struct ManualBackend {
    format: OutputFormat,
    state: Mutex<ManualState>,
}

impl ManualBackend {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            format: OutputFormat {
                sample_rate,
                channels,
            },
            state: Mutex::new(ManualState {
                queue: VecDeque::new(),
                history: Vec::new(),
                playing: false,
                sample_time: None,
                play_calls: 0,
            }),
        }
    }

    pub fn set_sample_time(&self, time: Option<i64>) {
        self.state.lock().unwrap().sample_time = time;
    }

    /// Advance the render clock by `frames` if it is running.
    pub fn advance(&self, frames: i64) {
        if let Some(t) = self.state.lock().unwrap().sample_time.as_mut() {
            *t += frames;
        }
    }

    /// Buffers scheduled and not yet completed.
    pub fn scheduled_count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// Every buffer ever scheduled, in order.
    pub fn history(&self) -> Vec<PcmBuffer> {
        self.state.lock().unwrap().history.clone()
    }

    pub fn play_calls(&self) -> usize {
        self.state.lock().unwrap().play_calls
    }

    /// Finish the oldest scheduled buffer. Returns `false` if nothing was scheduled.
    pub fn complete_next(&self) -> bool {
        let next = self.state.lock().unwrap().queue.pop_front();
        match next {
            Some((_, on_done)) => {
                on_done(BufferOutcome::Played);
                true
            }
            None => false,
        }
    }
}

impl OutputBackend for ManualBackend {
    fn format(&self) -> OutputFormat {
        self.format
    }

    fn schedule(&self, buffer: PcmBuffer, on_done: BufferCompletion) {
        let mut st = self.state.lock().unwrap();
        st.history.push(buffer.clone());
        st.queue.push_back((buffer, on_done));
    }

    fn play(&self) {
        let mut st = self.state.lock().unwrap();
        st.playing = true;
        st.play_calls += 1;
        st.sample_time.get_or_insert(0);
    }

    fn pause(&self) {
        self.state.lock().unwrap().playing = false;
    }

    fn stop(&self) {
        let flushed: Vec<_> = {
            let mut st = self.state.lock().unwrap();
            st.playing = false;
            st.sample_time = None;
            st.queue.drain(..).collect()
        };
        for (_, on_done) in flushed {
            on_done(BufferOutcome::Flushed);
        }
    }

    fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    fn sample_time(&self) -> Option<i64> {
        self.state.lock().unwrap().sample_time
    }
}

pub(crate) fn manual_backend(sample_rate: u32, channels: usize) -> Arc<ManualBackend> {
    Arc::new(ManualBackend::new(sample_rate, channels))
}

pub(crate) fn first_sample(buffer: &FrameBuffer) -> Option<f32> {
    buffer
        .frames()
        .first()
        .and_then(|f| f.f32_samples())
        .and_then(|s| s.first().copied())
}

pub(crate) fn last_sample(buffer: &FrameBuffer) -> Option<f32> {
    buffer
        .frames()
        .last()
        .and_then(|f| f.f32_samples())
        .and_then(|s| s.last().copied())
}

/// Poll `cond` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
