//! Session management module.
//!
//! This module provides PTY spawning and session lifecycle management.
//! Sessions can be created, written to, resized, suspended, terminated,
//! subscribed to and replayed from.

pub mod attention;
pub mod buffer;
pub mod entry;
pub mod manager;
pub mod multiplexer;
pub mod pty;
pub mod registry;
pub mod state;

pub use attention::{
    AttentionLevel, AttentionMonitor, AttentionNotifier, AttentionThresholds, AttentionTracker,
    LogNotifier,
};
pub use buffer::{Replay, SessionBuffer};
pub use entry::{Liveness, Session};
pub use manager::{
    CreateOptions, ManagerEvent, ManagerSettings, SessionInfo, SessionManager,
    SessionManagerImpl, SessionSummary,
};
pub use multiplexer::{OutputBroadcaster, SessionEvent, SubscriberId, Subscription};
pub use pty::{PtyProcess, SessionError, SignalKind, SpawnError, SpawnOptions};
pub use registry::SessionRegistry;
pub use state::{Lifecycle, TransitionError, KILLED_EXIT_CODE};
