//! Decoded PCM frames and the formats they travel in.
//!
//! A [`Frame`] is one unit of decoded audio as produced by a codec. Samples are stored
//! **interleaved** in the codec's native sample format:
//! `sample0[ch0], sample0[ch1], ..., sample1[ch0], sample1[ch1], ...`
//!
//! "Sample count" throughout the engine means samples **per channel** (i.e. frames in the
//! audio-hardware sense), matching how buffer budgets are expressed.

/// Native sample format of decoded data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    F32,
    S16,
    S32,
}

/// Interleaved sample storage.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleData {
    F32(Vec<f32>),
    S16(Vec<i16>),
    S32(Vec<i32>),
}

impl SampleData {
    pub fn format(&self) -> SampleFormat {
        match self {
            SampleData::F32(_) => SampleFormat::F32,
            SampleData::S16(_) => SampleFormat::S16,
            SampleData::S32(_) => SampleFormat::S32,
        }
    }

    /// Total number of interleaved values.
    pub fn len(&self) -> usize {
        match self {
            SampleData::F32(v) => v.len(),
            SampleData::S16(v) => v.len(),
            SampleData::S32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slice(&self, start: usize, end: usize) -> SampleData {
        match self {
            SampleData::F32(v) => SampleData::F32(v[start..end].to_vec()),
            SampleData::S16(v) => SampleData::S16(v[start..end].to_vec()),
            SampleData::S32(v) => SampleData::S32(v[start..end].to_vec()),
        }
    }

    /// Append `[start, end)` to `out`, converted to `f32` in `[-1.0, 1.0]`.
    fn extend_f32(&self, start: usize, end: usize, out: &mut Vec<f32>) {
        match self {
            SampleData::F32(v) => out.extend_from_slice(&v[start..end]),
            SampleData::S16(v) => out.extend(v[start..end].iter().map(|s| *s as f32 / 32_768.0)),
            SampleData::S32(v) => out.extend(
                v[start..end]
                    .iter()
                    .map(|s| (*s as f64 / 2_147_483_648.0) as f32),
            ),
        }
    }
}

/// Format of the decoded stream as reported by the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: usize,
    pub sample_format: SampleFormat,
}

/// Format required by the output sink: interleaved `f32` at a fixed rate/channel count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: usize,
}

impl OutputFormat {
    /// Whether audio in `stream` must be converted before it can be handed to the sink.
    pub fn needs_conversion_from(&self, stream: &StreamFormat) -> bool {
        stream.sample_format != SampleFormat::F32
            || stream.channels != self.channels
            || stream.sample_rate != self.sample_rate
    }
}

/// One unit of decoded PCM produced by a codec.
///
/// Frames can be truncated at either end without copying: only the window
/// `[first_sample_index, first_sample_index + sample_count)` is used downstream.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: SampleData,
    channels: usize,
    sample_rate: u32,
    first_sample_index: usize,
    sample_count: usize,
    start_time: Option<f64>,
}

impl Frame {
    /// Wrap interleaved samples. Trailing values that do not form a whole sample are ignored.
    pub fn new(data: SampleData, channels: usize, sample_rate: u32) -> Self {
        let channels = channels.max(1);
        let sample_count = data.len() / channels;
        Self {
            data,
            channels,
            sample_rate,
            first_sample_index: 0,
            sample_count,
            start_time: None,
        }
    }

    pub fn with_start_time(mut self, start_time: f64) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn format(&self) -> SampleFormat {
        self.data.format()
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Effective samples per channel after truncation.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Samples per channel as decoded, ignoring truncation.
    pub fn actual_sample_count(&self) -> usize {
        self.data.len() / self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// Presentation time of the first effective sample, in seconds.
    pub fn start_time(&self) -> Option<f64> {
        self.start_time
    }

    pub fn set_start_time(&mut self, start_time: f64) {
        self.start_time = Some(start_time);
    }

    /// Effective duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_count as f64 / self.sample_rate as f64
    }

    /// Presentation time just past the last effective sample, in seconds.
    pub fn end_time(&self) -> Option<f64> {
        self.start_time.map(|t| t + self.duration())
    }

    /// Keep only the first `count` effective samples.
    pub fn keep_first(&mut self, count: usize) {
        if count < self.sample_count {
            self.sample_count = count;
        }
    }

    /// Keep only the last `count` effective samples, advancing the start time accordingly.
    pub fn keep_last(&mut self, count: usize) {
        if count < self.sample_count {
            let dropped = self.sample_count - count;
            self.first_sample_index += dropped;
            self.sample_count = count;
            if let Some(t) = self.start_time.as_mut() {
                if self.sample_rate > 0 {
                    *t += dropped as f64 / self.sample_rate as f64;
                }
            }
        }
    }

    /// Split off everything after the first `count` effective samples.
    ///
    /// `self` keeps the head; the returned frame holds the tail (with its own start time), or
    /// `None` if there is no tail.
    pub fn split_off(&mut self, count: usize) -> Option<Frame> {
        if count >= self.sample_count {
            return None;
        }
        let tail_first = self.first_sample_index + count;
        let tail_end = self.first_sample_index + self.sample_count;
        let mut tail = Frame::new(
            self.data
                .slice(tail_first * self.channels, tail_end * self.channels),
            self.channels,
            self.sample_rate,
        );
        if let Some(t) = self.start_time {
            if self.sample_rate > 0 {
                tail.start_time = Some(t + count as f64 / self.sample_rate as f64);
            }
        }
        self.sample_count = count;
        Some(tail)
    }

    /// Effective interleaved samples, if stored as `f32`.
    pub fn f32_samples(&self) -> Option<&[f32]> {
        match &self.data {
            SampleData::F32(v) => {
                let (start, end) = self.value_range();
                Some(&v[start..end])
            }
            _ => None,
        }
    }

    /// Append the effective interleaved samples to `out`, converted to `f32`.
    pub fn extend_f32(&self, out: &mut Vec<f32>) {
        let (start, end) = self.value_range();
        self.data.extend_f32(start, end, out);
    }

    fn value_range(&self) -> (usize, usize) {
        let start = self.first_sample_index * self.channels;
        (start, start + self.sample_count * self.channels)
    }
}

/// A buffer of interleaved `f32` samples in the output format, ready to be scheduled.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, channels: usize, sample_rate: u32) -> Self {
        Self {
            samples,
            channels: channels.max(1),
            sample_rate,
        }
    }

    /// Number of samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}
