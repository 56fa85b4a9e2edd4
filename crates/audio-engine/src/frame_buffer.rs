//! Budgeted accumulator of decoded frames.

use crate::frame::{Frame, OutputFormat, PcmBuffer, StreamFormat};

/// Decoded frames collected up to a maximum sample count.
///
/// Normal appends are rejected once they would overflow the budget. Terminal appends (frames
/// flushed at end of stream or at a loop boundary) always succeed and may push the buffer
/// slightly past its budget.
#[derive(Debug)]
pub struct FrameBuffer {
    max_sample_count: usize,
    frames: Vec<Frame>,
    sample_count: usize,
    terminal: bool,
    format: StreamFormat,
    needs_format_conversion: bool,
}

impl FrameBuffer {
    pub fn new(format: StreamFormat, target: &OutputFormat, max_sample_count: usize) -> Self {
        Self {
            max_sample_count,
            frames: Vec::new(),
            sample_count: 0,
            terminal: false,
            format,
            needs_format_conversion: target.needs_conversion_from(&format),
        }
    }

    /// Whether `frame` fits within the remaining budget.
    ///
    /// An empty buffer accepts any frame so an oversize codec frame cannot stall decoding.
    pub fn can_accept(&self, frame: &Frame) -> bool {
        self.frames.is_empty() || self.sample_count + frame.sample_count() <= self.max_sample_count
    }

    /// Append `frame` if it fits; returns `false` (and leaves the buffer untouched) otherwise.
    pub fn append_frame(&mut self, frame: Frame) -> bool {
        if !self.can_accept(&frame) {
            return false;
        }
        self.push(frame);
        true
    }

    /// Append a frame flushed at end of stream or loop end, ignoring the budget.
    pub fn append_terminal_frame(&mut self, frame: Frame) {
        self.terminal = true;
        self.push(frame);
    }

    pub fn append_terminal_frames(&mut self, frames: impl IntoIterator<Item = Frame>) {
        self.terminal = true;
        for frame in frames {
            self.push(frame);
        }
    }

    fn push(&mut self, frame: Frame) {
        if frame.is_empty() {
            return;
        }
        self.sample_count += frame.sample_count();
        self.frames.push(frame);
    }

    pub fn max_sample_count(&self) -> usize {
        self.max_sample_count
    }

    /// Accumulated samples per channel.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    pub fn is_full(&self) -> bool {
        self.sample_count >= self.max_sample_count
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn needs_format_conversion(&self) -> bool {
        self.needs_format_conversion
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Presentation time of the first sample, if known.
    pub fn start_time(&self) -> Option<f64> {
        self.frames.first().and_then(Frame::start_time)
    }

    /// Presentation time just past the last sample, if known.
    pub fn end_time(&self) -> Option<f64> {
        self.frames.last().and_then(Frame::end_time)
    }

    /// Concatenate all frames into one interleaved `f32` buffer in the stream's own layout.
    pub fn copy_samples(&self) -> PcmBuffer {
        let mut samples = Vec::with_capacity(self.sample_count * self.format.channels);
        for frame in &self.frames {
            frame.extend_f32(&mut samples);
        }
        PcmBuffer::new(samples, self.format.channels, self.format.sample_rate)
    }
}
