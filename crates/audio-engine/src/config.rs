use serde::{Deserialize, Serialize};

/// Engine tuning parameters shared by the decoder, converter, scheduler and output stages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Duration of the buffer scheduled synchronously when playback starts.
    ///
    /// Smaller values reduce start latency.
    pub immediate_buffer_seconds: f64,
    /// Duration of each buffer decoded ahead of time on the background queue.
    pub deferred_buffer_seconds: f64,
    /// Maximum distance between a requested seek target and the first decoded sample.
    pub seek_tolerance_seconds: f64,
    /// Consecutive failed frame pulls tolerated before decoding of a file is abandoned.
    pub max_recurring_decode_errors: u32,
    /// Resampler input chunk size in frames.
    pub resample_chunk_frames: usize,
    /// Max frames copied per output callback refill step.
    pub refill_max_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            immediate_buffer_seconds: 5.0,
            deferred_buffer_seconds: 10.0,
            seek_tolerance_seconds: 0.01,
            max_recurring_decode_errors: 5,
            resample_chunk_frames: 1024,
            refill_max_frames: 4096,
        }
    }
}

impl EngineConfig {
    /// Sample budget (per channel) of the immediate buffer for a stream at `sample_rate`.
    pub fn immediate_sample_count(&self, sample_rate: u32) -> usize {
        sample_count_for(self.immediate_buffer_seconds, sample_rate, 5.0)
    }

    /// Sample budget (per channel) of a deferred buffer for a stream at `sample_rate`.
    pub fn deferred_sample_count(&self, sample_rate: u32) -> usize {
        sample_count_for(self.deferred_buffer_seconds, sample_rate, 10.0)
    }
}

/// Convert a duration to a per-channel sample count.
///
/// Non-finite or non-positive durations fall back to `fallback_seconds`. Never returns 0.
fn sample_count_for(seconds: f64, sample_rate: u32, fallback_seconds: f64) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        fallback_seconds
    };
    ((secs * sample_rate as f64).ceil() as usize).max(1)
}
