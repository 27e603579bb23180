//! # ptykeeper Protocol Library
//!
//! Wire vocabulary shared by the ptykeeper daemon and its remote clients.
//!
//! ## Overview
//!
//! - **Identifiers and states**: [`SessionId`], [`SessionState`], [`TerminalSize`]
//! - **Messages**: the closed [`Message`] enum, one variant per frame kind
//! - **Frame Codec**: fixed 21-byte header framing for multiplexing many
//!   sessions over one transport, plus a streaming [`FrameDecoder`]
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Messages                  │  raw bytes / MessagePack
//! ├─────────────────────────────────────────┤
//! │               Framing                   │  type | session id | len LE
//! ├─────────────────────────────────────────┤
//! │         Transport (any byte stream)     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use bytes::Bytes;
//! use protocol::{FrameCodec, FrameDecoder, Message};
//! use uuid::Uuid;
//!
//! let session_id = Uuid::new_v4();
//! let frame = Message::Output(Bytes::from_static(b"hello"))
//!     .into_frame(session_id)
//!     .unwrap();
//!
//! let wire = FrameCodec::new().encode(&frame).unwrap();
//!
//! let mut decoder = FrameDecoder::new();
//! decoder.feed(&wire);
//! let decoded = decoder.next_frame().unwrap().unwrap();
//! assert_eq!(Message::from_frame(&decoded).unwrap(), Message::Output(Bytes::from_static(b"hello")));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Message and state definitions
//! - [`framing`]: Frame codec
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{FrameError, Result};
pub use framing::{
    Frame, FrameCodec, FrameDecoder, FrameKind, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE,
    SESSION_ID_SIZE,
};
pub use messages::{
    ErrorCode, ErrorReply, InputAck, Message, SessionId, SessionState, StateChange, TerminalSize,
};
