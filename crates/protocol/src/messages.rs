//! Message definitions carried inside frames.
//!
//! Each frame kind maps to exactly one [`Message`] variant. Raw data
//! (output, input) travels as-is; structured payloads are MessagePack.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FrameError, Result};
use crate::framing::{Frame, FrameKind};

/// Unique identifier for a session.
pub type SessionId = Uuid;

/// Lifecycle state of a terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Spawn requested, PTY not yet confirmed live.
    Initializing,
    /// Process is running and output is being read.
    Running,
    /// Process stopped by an explicit suspend.
    Suspended,
    /// Process exited on its own.
    Exited,
    /// Process was forcibly terminated.
    Killed,
    /// Spawn or PTY I/O failed.
    Error,
    /// Loaded from storage after a restart, liveness not yet evaluated.
    Restored,
}

impl SessionState {
    /// All states, in declaration order.
    pub const ALL: [SessionState; 7] = [
        SessionState::Initializing,
        SessionState::Running,
        SessionState::Suspended,
        SessionState::Exited,
        SessionState::Killed,
        SessionState::Error,
        SessionState::Restored,
    ];

    /// Returns true for states no transition ever leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Exited | SessionState::Killed | SessionState::Error
        )
    }

    /// Returns true for states whose process is believed alive.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Suspended)
    }

    /// Stable lowercase name, used in storage and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Initializing => "initializing",
            SessionState::Running => "running",
            SessionState::Suspended => "suspended",
            SessionState::Exited => "exited",
            SessionState::Killed => "killed",
            SessionState::Error => "error",
            SessionState::Restored => "restored",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SessionState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown session state: {}", s))
    }
}

/// Terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
    /// Width in pixels (0 if unknown).
    #[serde(default)]
    pub pixel_width: u16,
    /// Height in pixels (0 if unknown).
    #[serde(default)]
    pub pixel_height: u16,
}

impl TerminalSize {
    /// Size with the given rows and columns and no pixel information.
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

/// Session state change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State the session moved into.
    pub state: SessionState,
    /// Exit code, present only for exits.
    pub exit_code: Option<i32>,
}

/// Acknowledgment that input reached the PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputAck {
    /// Number of bytes written.
    pub bytes_written: u64,
}

/// Why a client request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No session with the frame's id.
    UnknownSession,
    /// The process did not accept the input.
    WriteFailed,
    /// The terminal could not be resized.
    ResizeFailed,
    /// The payload did not decode.
    MalformedFrame,
    /// The frame kind is never sent by clients.
    UnexpectedFrame,
    /// Any other failure.
    Internal,
}

/// Rejection of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Kind of the rejected frame, as its wire byte.
    pub request: u8,
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

/// Closed set of messages carried over the multiplexed transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// PTY output chunk.
    Output(Bytes),
    /// Terminal was resized.
    Resize(TerminalSize),
    /// Input was written.
    InputAck(InputAck),
    /// Lifecycle state changed.
    StateChange(StateChange),
    /// Input for the PTY.
    Input(Bytes),
    /// An inbound frame was rejected.
    Error(ErrorReply),
}

impl Message {
    /// Frame kind used for this message.
    pub fn kind(&self) -> FrameKind {
        match self {
            Message::Output(_) => FrameKind::Output,
            Message::Resize(_) => FrameKind::Resize,
            Message::InputAck(_) => FrameKind::InputAck,
            Message::StateChange(_) => FrameKind::StateChange,
            Message::Input(_) => FrameKind::Input,
            Message::Error(_) => FrameKind::Error,
        }
    }

    /// Wrap this message in a frame addressed to `session_id`.
    pub fn into_frame(self, session_id: SessionId) -> Result<Frame> {
        let kind = self.kind();
        let payload = match self {
            Message::Output(data) | Message::Input(data) => data,
            Message::Resize(size) => Bytes::from(rmp_serde::to_vec(&size)?),
            Message::InputAck(ack) => Bytes::from(rmp_serde::to_vec(&ack)?),
            Message::StateChange(change) => Bytes::from(rmp_serde::to_vec(&change)?),
            Message::Error(reply) => Bytes::from(rmp_serde::to_vec(&reply)?),
        };
        Ok(Frame::new(kind, session_id, payload))
    }

    /// Interpret a frame's payload according to its kind.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let message = match frame.kind {
            FrameKind::Output => Message::Output(frame.payload.clone()),
            FrameKind::Input => Message::Input(frame.payload.clone()),
            FrameKind::Resize => Message::Resize(decode_payload(&frame.payload)?),
            FrameKind::InputAck => Message::InputAck(decode_payload(&frame.payload)?),
            FrameKind::StateChange => Message::StateChange(decode_payload(&frame.payload)?),
            FrameKind::Error => Message::Error(decode_payload(&frame.payload)?),
        };
        Ok(message)
    }
}

fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    if payload.is_empty() {
        return Err(FrameError::MalformedPayload("empty payload".to_string()));
    }
    Ok(rmp_serde::from_slice(payload)?)
}
