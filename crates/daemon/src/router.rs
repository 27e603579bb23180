//! Frame router between the multiplexed transport and the session manager.
//!
//! Inbound frames from a remote client are dispatched to the session they
//! address; session events are encoded into outbound frames. Sessions share
//! one transport, so ordering holds per session but not across sessions.

use std::sync::Arc;

use bytes::Bytes;
use protocol::{
    ErrorCode, ErrorReply, Frame, FrameCodec, FrameDecoder, FrameError, FrameKind, InputAck,
    Message, SessionId, StateChange,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::session::{SessionError, SessionEvent, SessionManager, Subscription};

/// Largest payload put in one replay frame.
const REPLAY_CHUNK_SIZE: usize = 64 * 1024;

/// Result type for router operations.
pub type RouterResult = Result<Option<Frame>, RouterError>;

/// Errors that can occur during frame routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Malformed frame or payload.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The frame kind is only ever sent by the daemon.
    #[error("unexpected inbound frame: {0:?}")]
    Unexpected(FrameKind),

    /// The outbound channel was closed.
    #[error("outbound transport closed")]
    Closed,
}

/// Dispatches inbound frames to a [`SessionManager`].
pub struct FrameRouter<S: SessionManager> {
    session_manager: Arc<S>,
    codec: FrameCodec,
}

impl<S: SessionManager> FrameRouter<S> {
    pub fn new(session_manager: Arc<S>) -> Self {
        Self {
            session_manager,
            codec: FrameCodec::new(),
        }
    }

    /// Handles one inbound frame. Returns the reply frame, if any.
    pub async fn route(&self, frame: Frame) -> RouterResult {
        let session_id = frame.session_id;
        debug!(session_id = %session_id, kind = ?frame.kind, "Routing frame");

        match Message::from_frame(&frame)? {
            Message::Input(data) => {
                let written = self
                    .session_manager
                    .write_input(&session_id, &data)
                    .await?;
                let ack = Message::InputAck(InputAck {
                    bytes_written: written as u64,
                });
                Ok(Some(ack.into_frame(session_id)?))
            }
            Message::Resize(size) => {
                self.session_manager
                    .resize_session(&session_id, size)
                    .await?;
                Ok(None)
            }
            message @ (Message::Output(_)
            | Message::InputAck(_)
            | Message::StateChange(_)
            | Message::Error(_)) => Err(RouterError::Unexpected(message.kind())),
        }
    }

    /// Feeds transport bytes and routes every frame completed by them.
    ///
    /// Returns the encoded replies in order. A frame that fails to route
    /// gets an `Error` reply and does not stop the frames after it; a
    /// malformed header is returned because the stream cannot be
    /// resynchronized.
    pub async fn route_bytes(
        &self,
        decoder: &mut FrameDecoder,
        data: &[u8],
    ) -> Result<Vec<Vec<u8>>, RouterError> {
        decoder.feed(data);
        let mut replies = Vec::new();

        while let Some(frame) = decoder.next_frame()? {
            let session_id = frame.session_id;
            let kind = frame.kind;
            match self.route(frame).await {
                Ok(Some(reply)) => replies.push(self.codec.encode(&reply)?),
                Ok(None) => {}
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to route frame");
                    let reply = error_frame(session_id, kind, &e)?;
                    replies.push(self.codec.encode(&reply)?);
                }
            }
        }

        Ok(replies)
    }

    /// Attaches a remote client to a session.
    ///
    /// Sends the buffered output since `offset` as `Output` frames, then
    /// forwards live events with no gap in between.
    pub async fn attach_remote(
        &self,
        session_id: &SessionId,
        offset: u64,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Result<JoinHandle<()>, RouterError> {
        let (replay, subscription) = self.session_manager.attach(session_id, offset).await?;
        if replay.truncated {
            debug!(session_id = %session_id, offset, "Replay truncated by buffer eviction");
        }

        for chunk in replay.bytes.chunks(REPLAY_CHUNK_SIZE) {
            let frame = Message::Output(Bytes::copy_from_slice(chunk)).into_frame(*session_id)?;
            outbound
                .send(self.codec.encode(&frame)?)
                .await
                .map_err(|_| RouterError::Closed)?;
        }

        Ok(spawn_forwarder(subscription, outbound))
    }
}

/// Frame carrying one session event.
pub fn event_frame(session_id: SessionId, event: SessionEvent) -> Result<Frame, FrameError> {
    let message = match event {
        SessionEvent::Output(data) => Message::Output(data),
        SessionEvent::Resized(size) => Message::Resize(size),
        SessionEvent::StateChanged { state, exit_code } => {
            Message::StateChange(StateChange { state, exit_code })
        }
    };
    message.into_frame(session_id)
}

/// Frame telling the client why its `request` frame was rejected.
pub fn error_frame(
    session_id: SessionId,
    request: FrameKind,
    error: &RouterError,
) -> Result<Frame, FrameError> {
    let code = match error {
        RouterError::Session(SessionError::NotFound(_)) => ErrorCode::UnknownSession,
        RouterError::Session(SessionError::WriteFailed(_)) => ErrorCode::WriteFailed,
        RouterError::Session(SessionError::ResizeFailed(_)) => ErrorCode::ResizeFailed,
        RouterError::Frame(_) => ErrorCode::MalformedFrame,
        RouterError::Unexpected(_) => ErrorCode::UnexpectedFrame,
        _ => ErrorCode::Internal,
    };
    Message::Error(ErrorReply {
        request: request.as_byte(),
        code,
        message: error.to_string(),
    })
    .into_frame(session_id)
}

/// Encodes a subscription's events onto the outbound transport.
///
/// Stops when the subscription ends or the transport goes away; dropping
/// the subscription then unsubscribes it.
pub fn spawn_forwarder(
    mut subscription: Subscription,
    outbound: mpsc::Sender<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let codec = FrameCodec::new();
        let session_id = subscription.session_id();

        while let Some(event) = subscription.recv().await {
            let encoded = event_frame(session_id, event).and_then(|frame| codec.encode(&frame));
            let bytes = match encoded {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Failed to encode event");
                    continue;
                }
            };
            if outbound.send(bytes).await.is_err() {
                debug!(session_id = %session_id, "Outbound transport closed");
                break;
            }
        }

        debug!(
            session_id = %session_id,
            subscriber_id = subscription.id(),
            "Forwarder stopped"
        );
    })
}
