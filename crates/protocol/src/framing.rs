//! Frame codec for multiplexing many sessions over one transport.
//!
//! # Frame Format
//!
//! Each frame consists of a fixed 21-byte header followed by the payload:
//! - 1 byte: message type (see [`FrameKind`])
//! - 16 bytes: session identifier (UUID, big-endian byte order)
//! - 4 bytes: payload length (little-endian)
//! - N bytes: payload
//!
//! Frames for one session keep their production order; frames of different
//! sessions may interleave freely.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::messages::SessionId;

/// Header size: 1 (type) + 16 (session id) + 4 (length) = 21 bytes.
pub const FRAME_HEADER_SIZE: usize = 21;

/// Size of the session identifier field.
pub const SESSION_ID_SIZE: usize = 16;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Message type carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// PTY output data (daemon -> client).
    Output = 0x01,
    /// Terminal resize notification.
    Resize = 0x02,
    /// Acknowledgment of input bytes written to the PTY.
    InputAck = 0x03,
    /// Session lifecycle state change.
    StateChange = 0x04,
    /// Input data for the PTY (client -> daemon).
    Input = 0x05,
    /// A client request was rejected (daemon -> client).
    Error = 0x06,
}

impl FrameKind {
    /// Returns the wire byte for this kind.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(FrameKind::Output),
            0x02 => Ok(FrameKind::Resize),
            0x03 => Ok(FrameKind::InputAck),
            0x04 => Ok(FrameKind::StateChange),
            0x05 => Ok(FrameKind::Input),
            0x06 => Ok(FrameKind::Error),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A single self-delimited unit of the multiplexed wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type.
    pub kind: FrameKind,
    /// Session this frame belongs to.
    pub session_id: SessionId,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, session_id: SessionId, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            session_id,
            payload: payload.into(),
        }
    }

    /// Total encoded size of this frame in bytes.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(frame.encoded_len());
        self.encode_into(frame, &mut output)?;
        Ok(output)
    }

    /// Encode a frame, appending to an existing buffer.
    pub fn encode_into(&self, frame: &Frame, output: &mut Vec<u8>) -> Result<()> {
        let len = frame.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        output.reserve(FRAME_HEADER_SIZE + len);
        output.push(frame.kind.as_byte());
        output.extend_from_slice(frame.session_id.as_bytes());
        output.extend_from_slice(&(len as u32).to_le_bytes());
        output.extend_from_slice(&frame.payload);
        Ok(())
    }

    /// Decode a frame from the front of `data`.
    ///
    /// Returns the decoded frame and the number of bytes consumed. Fails with
    /// [`FrameError::Incomplete`] when `data` holds only part of a frame.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Incomplete {
                needed: FRAME_HEADER_SIZE,
                available: data.len(),
            });
        }

        let kind = FrameKind::try_from(data[0])?;

        let mut id_bytes = [0u8; SESSION_ID_SIZE];
        id_bytes.copy_from_slice(&data[1..1 + SESSION_ID_SIZE]);
        let session_id = SessionId::from_bytes(id_bytes);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[17..FRAME_HEADER_SIZE]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total = FRAME_HEADER_SIZE + len;
        if data.len() < total {
            return Err(FrameError::Incomplete {
                needed: total,
                available: data.len(),
            });
        }

        let payload = Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..total]);
        Ok((
            Frame {
                kind,
                session_id,
                payload,
            },
            total,
        ))
    }

    /// Try to decode a frame, returning None if there isn't enough data yet.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        match self.decode(data) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Streaming decoder that accumulates transport reads and yields whole frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// A malformed header is a hard error: the stream cannot be resynchronized,
    /// so the caller should drop the transport.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.codec.try_decode(&self.buffer)? {
            Some((frame, consumed)) => {
                self.buffer.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}
