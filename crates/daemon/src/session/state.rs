//! Session lifecycle state machine.
//!
//! Transitions are validated against a fixed table; terminal states
//! (`Exited`, `Killed`, `Error`) are never left.

use std::time::{SystemTime, UNIX_EPOCH};

use protocol::SessionState;
use thiserror::Error;

/// Exit code recorded when a session is forcibly killed (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal transition from {from} to {to}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

/// Returns whether `from -> to` appears in the transition table.
pub fn is_legal_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    match (from, to) {
        (Initializing, Running) | (Initializing, Error) => true,
        (Running, Suspended) | (Suspended, Running) => true,
        (Running | Suspended, Exited | Killed | Error) => true,
        (Restored, Running | Exited | Error) => true,
        _ => false,
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Lifecycle of one session: state, exit code and last update time.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: SessionState,
    exit_code: Option<i32>,
    updated_at: i64,
}

impl Lifecycle {
    /// A fresh session, before its PTY is confirmed live.
    pub fn new() -> Self {
        Self::with_state(SessionState::Initializing)
    }

    /// A lifecycle entered directly in `state` (used for restoration).
    pub fn with_state(state: SessionState) -> Self {
        Self {
            state,
            exit_code: None,
            updated_at: now_millis(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }

    /// Refresh `updated_at` without changing state.
    pub fn touch(&mut self) -> i64 {
        self.updated_at = now_millis().max(self.updated_at);
        self.updated_at
    }

    /// Move to `to`, recording `exit_code` only for exits and kills.
    pub fn transition(
        &mut self,
        to: SessionState,
        exit_code: Option<i32>,
    ) -> Result<(), TransitionError> {
        if !is_legal_transition(self.state, to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }

        self.state = to;
        self.exit_code = match to {
            SessionState::Exited | SessionState::Killed => exit_code,
            _ => None,
        };
        self.touch();
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
