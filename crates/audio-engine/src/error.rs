//! Error taxonomy for the engine.
//!
//! End of stream is not an error for control-flow purposes: it travels as the `is_eof` flag on
//! [`PacketReadError`] / [`SeekError`] and ends up as a state flag on the decoder.

use thiserror::Error;

/// Generic failure code used when a collaborator does not supply a more specific one.
pub const CODE_UNKNOWN: i32 = -1;
/// A packet was read but the codec could not decode it.
pub const CODE_DECODE: i32 = -2;
/// The container could not seek to the requested position.
pub const CODE_SEEK: i32 = -3;
/// The codec needs to be reset before it can continue.
pub const CODE_RESET_REQUIRED: i32 = -4;
/// The source ended while the codec was still being drained.
pub const CODE_DRAIN: i32 = -5;

/// Failure to read the next packet from a [`PacketSource`](crate::source::PacketSource).
#[derive(Debug, Clone, Error, PartialEq)]
#[error("packet read failed: {message}")]
pub struct PacketReadError {
    /// The read failed because the stream is exhausted.
    pub is_eof: bool,
    pub message: String,
}

impl PacketReadError {
    pub fn eof() -> Self {
        Self {
            is_eof: true,
            message: "end of stream".to_string(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            is_eof: false,
            message: message.into(),
        }
    }
}

/// Failure of a container-level seek.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("seek failed (code {code}): {message}")]
pub struct SeekError {
    /// The seek target lies at or past the end of the stream.
    pub is_eof: bool,
    pub code: i32,
    pub message: String,
}

impl SeekError {
    pub fn eof() -> Self {
        Self {
            is_eof: true,
            code: CODE_SEEK,
            message: "seek target past end of stream".to_string(),
        }
    }

    pub fn other(code: i32, message: impl Into<String>) -> Self {
        Self {
            is_eof: false,
            code,
            message: message.into(),
        }
    }
}

/// Codec failure, or a non-EOF seek failure surfaced by the decoder.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("decoder error (code {code}): {message}")]
pub struct DecoderError {
    pub code: i32,
    pub message: String,
}

impl DecoderError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<SeekError> for DecoderError {
    fn from(e: SeekError) -> Self {
        Self {
            code: e.code,
            message: e.message,
        }
    }
}

/// Failure to produce the next decoded frame.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FrameError {
    #[error(transparent)]
    Read(#[from] PacketReadError),
    #[error(transparent)]
    Decode(#[from] DecoderError),
}

impl FrameError {
    /// Whether this error only signals the end of the stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Read(e) if e.is_eof)
    }
}

/// Errors surfaced by the scheduler's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no playback context is loaded")]
    NoActiveContext,
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    #[error("audio output error: {0}")]
    Output(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_error_converts_to_decoder_error_keeping_code() {
        let err: DecoderError = SeekError::other(42, "bad index").into();
        assert_eq!(err.code, 42);
        assert_eq!(err.message, "bad index");
    }

    #[test]
    fn frame_error_eof_detection() {
        assert!(FrameError::from(PacketReadError::eof()).is_eof());
        assert!(!FrameError::from(PacketReadError::other("io")).is_eof());
        assert!(!FrameError::from(DecoderError::new(CODE_DECODE, "bad")).is_eof());
    }
}
