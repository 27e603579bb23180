//! Error types for the protocol crate.

use thiserror::Error;

/// Errors produced while encoding or decoding multiplexed frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Not enough bytes buffered yet to hold a complete frame.
    ///
    /// This is the normal condition for a streaming reader: buffer more
    /// bytes and retry.
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete {
        /// Total bytes required to finish the current frame.
        needed: usize,
        /// Bytes currently available.
        available: usize,
    },

    /// The message type byte does not name a known frame kind.
    #[error("unknown frame type: {0:#04x}")]
    UnknownKind(u8),

    /// Payload exceeds the maximum allowed size.
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Payload bytes could not be interpreted for the frame's kind.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Failed to serialize a structured payload.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl FrameError {
    /// Returns true if the error only means more input is required.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::Incomplete { .. })
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, FrameError>;

impl From<rmp_serde::encode::Error> for FrameError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        FrameError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FrameError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        FrameError::MalformedPayload(err.to_string())
    }
}
