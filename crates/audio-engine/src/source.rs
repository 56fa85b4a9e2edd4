//! Contracts of the demuxer and codec the decoder pulls from.
//!
//! [`crate::demux`] implements both on top of Symphonia; tests use synthetic implementations.

use crate::error::{DecoderError, PacketReadError, SeekError};
use crate::frame::{Frame, StreamFormat};

/// A compressed, timestamped unit of container data for one audio stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Packet {
    /// Presentation timestamp in [`PacketSource::time_base`] units.
    pub pts: i64,
    /// Duration in time-base units.
    pub duration: u64,
    /// Samples to drop from the start of the decoded audio (encoder delay).
    pub trim_start: u32,
    /// Samples to drop from the end of the decoded audio (padding).
    pub trim_end: u32,
    pub data: Box<[u8]>,
}

/// Demuxes one audio stream of a container into packets.
pub trait PacketSource: Send {
    /// Read the next packet of the audio stream.
    ///
    /// Reaching the end of the stream is reported as a [`PacketReadError`] with `is_eof` set.
    fn read_packet(&mut self) -> Result<Packet, PacketReadError>;

    /// Position the source near `time` (seconds). Container seeks may land early.
    fn seek(&mut self, time: f64) -> Result<(), SeekError>;

    /// Uncompressed containers seek exactly and need no correction pass.
    fn is_raw_audio(&self) -> bool;

    /// Seconds per timestamp tick.
    fn time_base(&self) -> f64;

    /// Stream duration in seconds, if the container reports one.
    fn duration(&self) -> Option<f64>;
}

/// Decodes packets into PCM frames.
pub trait Codec: Send {
    /// Format of the frames this codec produces.
    fn format(&self) -> StreamFormat;

    /// Decode one packet. A packet may yield zero, one or several frames.
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Frame>, DecoderError>;

    /// Feed a packet through the codec and discard its output, keeping codec state primed.
    fn decode_and_drop(&mut self, packet: &Packet) -> Result<(), DecoderError> {
        self.decode(packet).map(|_| ())
    }

    /// Return frames the codec still holds internally after the last packet.
    fn drain(&mut self) -> Vec<Frame> {
        Vec::new()
    }

    /// Discard internal state, e.g. before a seek.
    fn flush_buffers(&mut self);
}
