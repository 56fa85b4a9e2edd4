//! Adapting decoded audio to the output format.
//!
//! The default converter turns whatever the codec produced (S16/S32/F32, any channel count,
//! any rate) into interleaved `f32` at the sink's rate and channel count:
//! - sample format: integer samples are scaled to `[-1.0, 1.0]`
//! - channels: mono→stereo duplicates, stereo→mono averages, other layouts clamp
//! - rate: Rubato's streaming sinc resampler, kept across the buffers of one play attempt

use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::frame::{OutputFormat, PcmBuffer};
use crate::frame_buffer::FrameBuffer;

/// Converts a decoded [`FrameBuffer`] into a PCM buffer in the sink's format.
pub trait SampleConverter: Send {
    fn convert(&mut self, buffer: &FrameBuffer, target: &OutputFormat) -> PcmBuffer;

    /// Forget any state carried between buffers (new play attempt, seek, stop).
    fn reset(&mut self) {}
}

/// Format, channel and rate conversion in one pass.
pub struct DefaultSampleConverter {
    chunk_frames: usize,
    resampler: Option<StreamResampler>,
}

impl DefaultSampleConverter {
    pub fn new(chunk_frames: usize) -> Self {
        Self {
            chunk_frames: chunk_frames.max(1),
            resampler: None,
        }
    }
}

impl Default for DefaultSampleConverter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl SampleConverter for DefaultSampleConverter {
    fn convert(&mut self, buffer: &FrameBuffer, target: &OutputFormat) -> PcmBuffer {
        let source = buffer.copy_samples();
        let samples = map_channels(&source.samples, source.channels, target.channels);

        if source.sample_rate == target.sample_rate || source.sample_rate == 0 {
            return PcmBuffer::new(samples, target.channels, target.sample_rate);
        }

        let reuse = self.resampler.as_ref().is_some_and(|r| {
            r.from_rate == source.sample_rate
                && r.to_rate == target.sample_rate
                && r.channels == target.channels
        });
        if !reuse {
            self.resampler = StreamResampler::new(
                source.sample_rate,
                target.sample_rate,
                target.channels,
                self.chunk_frames,
            );
        }

        let out = match self.resampler.as_mut() {
            Some(r) => {
                let out = r.process(&samples, buffer.is_terminal());
                if buffer.is_terminal() {
                    self.resampler = None;
                }
                out
            }
            // Resampler could not be built; play at the wrong rate rather than not at all.
            None => samples,
        };
        PcmBuffer::new(out, target.channels, target.sample_rate)
    }

    fn reset(&mut self) {
        self.resampler = None;
    }
}

/// Remap interleaved samples from `src_channels` to `dst_channels`.
pub fn map_channels(samples: &[f32], src_channels: usize, dst_channels: usize) -> Vec<f32> {
    let src_channels = src_channels.max(1);
    let dst_channels = dst_channels.max(1);
    if src_channels == dst_channels {
        return samples.to_vec();
    }

    let frames = samples.len() / src_channels;
    let mut out = Vec::with_capacity(frames * dst_channels);
    for frame in samples.chunks_exact(src_channels) {
        for dst_ch in 0..dst_channels {
            let s = match (src_channels, dst_channels) {
                (2, 1) => 0.5 * (frame[0] + frame[1]),
                (1, _) => frame[0],
                _ => frame[dst_ch.min(src_channels - 1)],
            };
            out.push(s);
        }
    }
    out
}

/// Streaming sinc resampler over interleaved `f32`.
///
/// Input that does not fill a whole chunk is held until the next call. On a terminal buffer the
/// held input and the filter delay are flushed, and output is cut to the exact expected length.
struct StreamResampler {
    from_rate: u32,
    to_rate: u32,
    channels: usize,
    chunk_frames: usize,
    resampler: Async<f32>,
    pending: Vec<f32>,
    out_scratch: Vec<f32>,
    /// Output frames still to discard to compensate the filter delay.
    delay_to_skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    fn new(from_rate: u32, to_rate: u32, channels: usize, chunk_frames: usize) -> Option<Self> {
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };
        let ratio = to_rate as f64 / from_rate as f64;
        let resampler = match Async::<f32>::new_sinc(
            ratio,
            1.1,
            &params,
            chunk_frames,
            channels,
            FixedAsync::Input,
        ) {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("resampler init error: {e:#}");
                return None;
            }
        };
        let delay_to_skip = resampler.output_delay();
        let out_scratch = vec![0.0f32; resampler.output_frames_max() * channels];
        tracing::debug!(from_rate, to_rate, channels, "resampler created");
        Some(Self {
            from_rate,
            to_rate,
            channels,
            chunk_frames,
            resampler,
            pending: Vec::new(),
            out_scratch,
            delay_to_skip,
            frames_in: 0,
            frames_out: 0,
        })
    }

    fn process(&mut self, samples: &[f32], terminal: bool) -> Vec<f32> {
        self.pending.extend_from_slice(samples);
        self.frames_in += (samples.len() / self.channels) as u64;

        let mut out = Vec::new();
        let chunk_len = self.chunk_frames * self.channels;
        let mut consumed = 0;
        while self.pending.len() - consumed >= chunk_len {
            let chunk = self.pending[consumed..consumed + chunk_len].to_vec();
            if !self.run(&chunk, None, &mut out) {
                break;
            }
            consumed += chunk_len;
        }
        self.pending.drain(..consumed);

        if terminal {
            let tail = std::mem::take(&mut self.pending);
            let tail_frames = tail.len() / self.channels;
            if tail_frames > 0 {
                self.run(&tail, Some(tail_frames), &mut out);
            }
            let expected = (self.frames_in as f64 * self.to_rate as f64 / self.from_rate as f64)
                .round() as u64;
            let silence = vec![0.0f32; chunk_len];
            let mut flushes = 0;
            while self.frames_out < expected && flushes < 8 {
                if !self.run(&silence, None, &mut out) {
                    break;
                }
                flushes += 1;
            }
            if self.frames_out > expected {
                let excess = (self.frames_out - expected) as usize * self.channels;
                out.truncate(out.len().saturating_sub(excess));
                self.frames_out = expected;
            }
        }
        out
    }

    /// Resample one chunk into `out`. Returns `false` if Rubato rejected it.
    fn run(&mut self, input: &[f32], partial_len: Option<usize>, out: &mut Vec<f32>) -> bool {
        let channels = self.channels;
        let in_frames = input.len() / channels;
        let input_adapter = match InterleavedSlice::new(input, channels, in_frames) {
            Ok(a) => a,
            Err(e) => {
                tracing::error!("interleaved slice (input) error: {e:#}");
                return false;
            }
        };
        let out_capacity_frames = self.out_scratch.len() / channels;
        let mut output_adapter =
            match InterleavedSlice::new_mut(&mut self.out_scratch, channels, out_capacity_frames) {
                Ok(a) => a,
                Err(e) => {
                    tracing::error!("interleaved slice (output) error: {e:#}");
                    return false;
                }
            };
        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) =
            match self
                .resampler
                .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            {
                Ok(x) => x,
                Err(e) => {
                    tracing::error!("resampler process error: {e:#}");
                    return false;
                }
            };

        let skip = self.delay_to_skip.min(nbr_out);
        self.delay_to_skip -= skip;
        let produced = &self.out_scratch[skip * channels..nbr_out * channels];
        out.extend_from_slice(produced);
        self.frames_out += (nbr_out - skip) as u64;
        true
    }
}
