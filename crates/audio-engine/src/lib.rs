//! Streaming decode-and-schedule engine.
//!
//! Turns a compressed audio stream into a continuous sequence of PCM buffers handed to an
//! output sink:
//! - [`decoder::StreamDecoder`] pulls packets, decodes them and aggregates frames up to a budget
//! - [`convert`] adapts decoded frames to the output format
//! - [`output::OutputSink`] schedules buffers on the host audio primitive and reports position
//! - [`scheduler::BufferScheduler`] keeps the sink fed with an immediate + deferred buffer
//!   policy, supports A-B loops and gapless track transitions
//!
//! [`segment`] is a standalone frame-range helper for frame-addressed outputs; the scheduler does
//! not use it.

pub mod config;
pub mod convert;
pub mod cpal_output;
pub mod decoder;
pub mod demux;
pub mod error;
pub mod frame;
pub mod frame_buffer;
pub mod frame_queue;
pub mod output;
pub mod scheduler;
pub mod segment;
pub mod session;
pub mod source;

#[cfg(test)]
pub(crate) mod test_support;
