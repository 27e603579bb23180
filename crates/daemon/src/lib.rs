//! # ptykeeper Daemon Library
//!
//! This crate supervises long-lived pseudo-terminal sessions: it spawns
//! shells on PTYs, keeps a bounded output history per session, fans output
//! out to live subscribers and persists every session so history survives
//! a restart.
//!
//! ## Overview
//!
//! - **Sessions**: PTY process handle, bounded output buffer, lifecycle
//!   state machine and per-subscriber bounded delivery queues
//! - **Persistence**: periodic and terminal-state flushes to SQLite
//! - **Health**: reconciliation of recorded states with real process liveness
//! - **Attention**: advisory alerts for sessions that have gone quiet
//! - **Routing**: binary frames for remote clients multiplexed on one transport
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │ Persistence  │  │    Health    │  │      Attention       │   │
//! │  │    timer     │  │  reconciler  │  │       monitor        │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────┬───────────┘   │
//! │         └─────────────────┼─────────────────────┘               │
//! │                  ┌────────┴─────────┐    ┌──────────────────┐   │
//! │                  │ Session Registry │◄───│  Session Manager │   │
//! │                  └──────────────────┘    └────────┬─────────┘   │
//! │                                          ┌────────┴─────────┐   │
//! │                                          │   Frame Router   │   │
//! │                                          └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Sessions are now supervised until shutdown...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions, buffers, broadcaster and manager
//! - [`persistence`]: Session store and flush scheduling
//! - [`health`]: Process liveness reconciliation
//! - [`router`]: Frame routing for remote clients
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod health;
pub mod orchestrator;
pub mod persistence;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    CreateOptions, ManagerEvent, SessionError, SessionInfo, SessionManager, SessionManagerImpl,
};

// Re-export persistence types for convenience
pub use persistence::{Persistence, SessionRecord, SessionStore, SqliteSessionStore};

// Re-export health types for convenience
pub use health::{HealthCheck, HealthReconciler, HealthSeverity, ReconcileReport};

// Re-export router types for convenience
pub use router::{FrameRouter, RouterError, RouterResult};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
