//! Session manager for supervising multiple PTY sessions.
//!
//! This module provides the command surface for sessions: creation, input,
//! resize, suspend/resume, termination, subscription and replay. The
//! manager is the only component that inserts into or removes from the
//! [`SessionRegistry`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use protocol::{SessionId, SessionState, TerminalSize};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use super::attention::AttentionLevel;
use super::buffer::{Replay, SessionBuffer};
use super::entry::{Session, SessionHooks, SessionInit};
use super::multiplexer::{SubscriberId, Subscription};
use super::pty::{PtyProcess, SessionError, SpawnOptions};
use super::registry::SessionRegistry;
use super::state::{now_millis, Lifecycle};
use crate::config::SessionConfig;
use crate::health::HealthCheck;
use crate::persistence::{Persistence, SessionRecord};

/// Capacity of the manager-wide event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Manager-wide notifications for UI layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A session changed lifecycle state.
    StateChanged {
        session_id: SessionId,
        from: SessionState,
        to: SessionState,
        exit_code: Option<i32>,
    },
    /// A session's attention level changed.
    Attention {
        session_id: SessionId,
        level: AttentionLevel,
    },
    /// A subscriber was dropped for falling behind.
    SubscriberDropped {
        session_id: SessionId,
        subscriber_id: SubscriberId,
    },
}

/// Status of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub state: SessionState,
    /// Present only after the process exited or was killed.
    pub exit_code: Option<i32>,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
    pub pid: Option<u32>,
    pub working_directory: PathBuf,
    pub size: TerminalSize,
    /// Number of live subscribers.
    pub subscribers: usize,
    pub attention: AttentionLevel,
    /// Live output is held back from subscribers.
    pub output_paused: bool,
    /// Bytes currently retained in the buffer.
    pub buffered_bytes: usize,
    /// Offset the next output byte will get.
    pub current_offset: u64,
}

/// Entry of [`SessionManager::list_sessions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub state: SessionState,
}

/// Parameters for [`SessionManager::create_session`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Shell to run. Falls back to the configured default shell.
    pub shell: Option<String>,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    /// Environment overrides for the child.
    pub environment: BTreeMap<String, String>,
    /// Initial size. Falls back to the configured default size.
    pub size: Option<TerminalSize>,
}

impl CreateOptions {
    /// Default shell in `working_directory`.
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            working_directory: working_directory.into(),
            environment: BTreeMap::new(),
            size: None,
        }
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, size: TerminalSize) -> Self {
        self.size = Some(size);
        self
    }
}

/// Limits and defaults applied to every session.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub default_shell: String,
    pub default_size: TerminalSize,
    pub max_sessions: usize,
    pub buffer_capacity: usize,
    pub subscriber_queue_depth: usize,
    pub terminate_grace: Duration,
}

impl From<&SessionConfig> for ManagerSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            default_shell: config.default_shell.clone(),
            default_size: TerminalSize::new(config.default_rows, config.default_cols),
            max_sessions: config.max_sessions,
            buffer_capacity: config.buffer_capacity,
            subscriber_queue_depth: config.subscriber_queue_depth,
            terminate_grace: config.terminate_grace(),
        }
    }
}

/// Trait for session management operations.
///
/// Implementations must be thread-safe and suitable for concurrent access.
/// Every command addressed to an unknown id fails with
/// [`SessionError::NotFound`] and changes nothing.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Spawns a new session. On failure no session is registered.
    async fn create_session(&self, options: CreateOptions) -> Result<SessionId, SessionError>;

    /// Forwards input to the session's process. Returns the bytes written.
    async fn write_input(&self, session_id: &SessionId, data: &[u8])
        -> Result<usize, SessionError>;

    /// Applies new terminal dimensions. Identical dimensions are a no-op.
    async fn resize_session(
        &self,
        session_id: &SessionId,
        size: TerminalSize,
    ) -> Result<(), SessionError>;

    /// Stops the process and moves the session to `Suspended`.
    async fn suspend_session(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Continues a suspended session.
    async fn resume_session(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Requests graceful termination, escalating to kill after the grace period.
    async fn terminate_session(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Kills the process immediately.
    async fn kill_session(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Sends Ctrl+C (ETX) to the session's terminal.
    async fn interrupt_session(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Stops delivering live output to subscribers. Output is still buffered.
    async fn pause_output(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Delivers live output again. Output produced while paused is only
    /// available through replay.
    async fn resume_output(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Most recent reconciliation checks of a session, oldest first.
    async fn health_history(&self, session_id: &SessionId)
        -> Result<Vec<HealthCheck>, SessionError>;

    /// Subscribes to live events from now on.
    fn subscribe(&self, session_id: &SessionId) -> Result<Subscription, SessionError>;

    /// Removes a subscriber. Returns whether it was still subscribed.
    fn unsubscribe(
        &self,
        session_id: &SessionId,
        subscriber_id: SubscriberId,
    ) -> Result<bool, SessionError>;

    /// Replay since `offset` plus a subscription continuing right after it.
    async fn attach(
        &self,
        session_id: &SessionId,
        offset: u64,
    ) -> Result<(Replay, Subscription), SessionError>;

    /// Buffered output written at or after `offset`.
    async fn replay_since(&self, session_id: &SessionId, offset: u64)
        -> Result<Replay, SessionError>;

    /// Current status of one session.
    async fn get_session_state(&self, session_id: &SessionId) -> Result<SessionInfo, SessionError>;

    /// Every registered session with its state.
    fn list_sessions(&self) -> Vec<SessionSummary>;

    /// Destroys a session that reached a terminal state.
    async fn close_session(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Closes every terminal session. Returns how many were closed.
    async fn cleanup_terminated(&self) -> usize;
}

/// Session manager backed by a shared [`SessionRegistry`].
pub struct SessionManagerImpl {
    registry: Arc<SessionRegistry>,
    /// Creates that hold a slot but are not registered yet.
    pending_creates: Mutex<usize>,
    persistence: Persistence,
    events: broadcast::Sender<ManagerEvent>,
    settings: ManagerSettings,
}

impl SessionManagerImpl {
    /// Creates a manager with an empty registry.
    pub fn new(settings: ManagerSettings, persistence: Persistence) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry: Arc::new(SessionRegistry::new()),
            pending_creates: Mutex::new(0),
            persistence,
            events,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Sender side of the manager event stream, for timers that publish.
    pub fn event_sender(&self) -> broadcast::Sender<ManagerEvent> {
        self.events.clone()
    }

    /// Receives manager events published from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Observes the lifecycle state of one session.
    pub fn watch_state(
        &self,
        session_id: &SessionId,
    ) -> Result<watch::Receiver<SessionState>, SessionError> {
        Ok(self.lookup(session_id)?.watch_state())
    }

    /// Registers persisted records as `Restored` sessions.
    ///
    /// No PTY handle survives a restart; the health reconciler decides what
    /// each restored session becomes. Returns the number registered.
    pub fn restore_sessions(&self, records: Vec<SessionRecord>) -> usize {
        let mut restored = 0;

        for record in records {
            if self.registry.contains(&record.session_id) {
                continue;
            }

            let session = Session::new(
                SessionInit {
                    id: record.session_id,
                    working_directory: record.working_directory,
                    environment: record.environment,
                    created_at: record.created_at,
                    size: self.settings.default_size,
                    pid: record.process_pid,
                    pid_started_at: record.process_started_at,
                    lifecycle: Lifecycle::with_state(SessionState::Restored),
                    buffer: SessionBuffer::from_log(
                        self.settings.buffer_capacity,
                        &record.output_log,
                        record.output_offset,
                    ),
                    queue_depth: self.settings.subscriber_queue_depth,
                },
                self.hooks(),
            );

            tracing::info!(
                session_id = %record.session_id,
                previous_state = %record.state,
                pid = ?record.process_pid,
                "Restored session"
            );
            self.registry.insert(Arc::new(session));
            restored += 1;
        }

        restored
    }

    /// Final flush of every session, then releases all PTY handles.
    pub async fn shutdown(&self) {
        let sessions = self.registry.snapshot();
        tracing::info!(sessions = sessions.len(), "Shutting down session manager");

        for session in sessions {
            self.persistence.flush(&session).await;
            session.release().await;
            self.registry.remove(&session.id());
        }
    }

    /// Claims one of the `max_sessions` slots for a create in progress.
    fn reserve_slot(&self) -> Result<SlotReservation<'_>, SessionError> {
        let mut pending = lock_count(&self.pending_creates);
        if self.registry.len() + *pending >= self.settings.max_sessions {
            return Err(SessionError::LimitReached(self.settings.max_sessions));
        }
        *pending += 1;
        Ok(SlotReservation {
            pending: &self.pending_creates,
            committed: false,
        })
    }

    fn hooks(&self) -> SessionHooks {
        SessionHooks {
            persistence: self.persistence.clone(),
            events: self.events.clone(),
        }
    }

    fn lookup(&self, session_id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.registry
            .get(session_id)
            .ok_or(SessionError::NotFound(*session_id))
    }
}

/// A slot taken by [`SessionManagerImpl::reserve_slot`].
///
/// Dropping it without [`commit`](Self::commit) gives the slot back.
struct SlotReservation<'a> {
    pending: &'a Mutex<usize>,
    committed: bool,
}

impl SlotReservation<'_> {
    /// Registers `session`, turning the reserved slot into a registry entry.
    fn commit(mut self, registry: &SessionRegistry, session: Arc<Session>) {
        let mut pending = lock_count(self.pending);
        registry.insert(session);
        *pending -= 1;
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            *lock_count(self.pending) -= 1;
        }
    }
}

fn lock_count(count: &Mutex<usize>) -> MutexGuard<'_, usize> {
    count.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager for SessionManagerImpl {
    async fn create_session(&self, options: CreateOptions) -> Result<SessionId, SessionError> {
        let slot = self.reserve_slot()?;

        let session_id = Uuid::new_v4();
        let size = options.size.unwrap_or(self.settings.default_size);
        let session = Arc::new(Session::new(
            SessionInit {
                id: session_id,
                working_directory: options.working_directory.clone(),
                environment: options.environment.clone(),
                created_at: now_millis(),
                size,
                pid: None,
                pid_started_at: None,
                lifecycle: Lifecycle::new(),
                buffer: SessionBuffer::new(self.settings.buffer_capacity),
                queue_depth: self.settings.subscriber_queue_depth,
            },
            self.hooks(),
        ));

        let spawned = PtyProcess::spawn(SpawnOptions {
            shell: options
                .shell
                .unwrap_or_else(|| self.settings.default_shell.clone()),
            args: options.args,
            working_directory: options.working_directory,
            environment: options.environment,
            size,
        });

        let process = match spawned {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to spawn session");
                if let Err(e) = session.finish(SessionState::Error, None).await {
                    tracing::debug!(session_id = %session_id, error = %e, "Spawn failure not recorded");
                }
                return Err(e.into());
            }
        };

        let output = session.attach_process(process).await;
        session.finish(SessionState::Running, None).await?;
        slot.commit(&self.registry, Arc::clone(&session));

        if let Some(output) = output {
            session.start_read_loop(output);
        }
        self.persistence.flush(&session).await;

        tracing::info!(
            session_id = %session_id,
            pid = ?session.pid(),
            rows = size.rows,
            cols = size.cols,
            "Created new session"
        );

        Ok(session_id)
    }

    async fn write_input(
        &self,
        session_id: &SessionId,
        data: &[u8],
    ) -> Result<usize, SessionError> {
        self.lookup(session_id)?.write(data).await
    }

    async fn resize_session(
        &self,
        session_id: &SessionId,
        size: TerminalSize,
    ) -> Result<(), SessionError> {
        self.lookup(session_id)?.resize(size).await
    }

    async fn suspend_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        self.lookup(session_id)?.suspend().await
    }

    async fn resume_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        self.lookup(session_id)?.resume().await
    }

    async fn terminate_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        self.lookup(session_id)?
            .terminate(self.settings.terminate_grace)
            .await
    }

    async fn kill_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        self.lookup(session_id)?.kill().await
    }

    async fn interrupt_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        self.lookup(session_id)?.interrupt().await
    }

    async fn pause_output(&self, session_id: &SessionId) -> Result<(), SessionError> {
        if self.lookup(session_id)?.pause_output().await {
            tracing::info!(session_id = %session_id, "Paused session output");
        }
        Ok(())
    }

    async fn resume_output(&self, session_id: &SessionId) -> Result<(), SessionError> {
        if self.lookup(session_id)?.resume_output().await {
            tracing::info!(session_id = %session_id, "Resumed session output");
        }
        Ok(())
    }

    async fn health_history(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<HealthCheck>, SessionError> {
        Ok(self.lookup(session_id)?.health_history().await)
    }

    fn subscribe(&self, session_id: &SessionId) -> Result<Subscription, SessionError> {
        let subscription = self.lookup(session_id)?.subscribe();
        tracing::debug!(
            session_id = %session_id,
            subscriber_id = subscription.id(),
            "Subscriber attached"
        );
        Ok(subscription)
    }

    fn unsubscribe(
        &self,
        session_id: &SessionId,
        subscriber_id: SubscriberId,
    ) -> Result<bool, SessionError> {
        Ok(self
            .lookup(session_id)?
            .broadcaster()
            .unsubscribe(subscriber_id))
    }

    async fn attach(
        &self,
        session_id: &SessionId,
        offset: u64,
    ) -> Result<(Replay, Subscription), SessionError> {
        Ok(self.lookup(session_id)?.attach(offset).await)
    }

    async fn replay_since(
        &self,
        session_id: &SessionId,
        offset: u64,
    ) -> Result<Replay, SessionError> {
        Ok(self.lookup(session_id)?.replay_since(offset).await)
    }

    async fn get_session_state(&self, session_id: &SessionId) -> Result<SessionInfo, SessionError> {
        Ok(self.lookup(session_id)?.info().await)
    }

    fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|session| (session.created_at(), SessionSummary {
                session_id: session.id(),
                state: session.state(),
            }))
            .collect();
        sessions.sort_by_key(|(created_at, _)| *created_at);
        sessions.into_iter().map(|(_, summary)| summary).collect()
    }

    async fn close_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let session = self.lookup(session_id)?;
        if !session.state().is_terminal() {
            return Err(SessionError::NotTerminal(*session_id));
        }

        if session.flush_pending() {
            self.persistence.flush(&session).await;
        }
        self.registry.remove(session_id);
        session.release().await;

        tracing::info!(session_id = %session_id, "Closed session");
        Ok(())
    }

    async fn cleanup_terminated(&self) -> usize {
        let mut closed = 0;
        for session in self.registry.snapshot() {
            if !session.state().is_terminal() {
                continue;
            }
            if self.close_session(&session.id()).await.is_ok() {
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(closed, "Cleaned up terminated sessions");
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::testing::FlakyStore;
    use crate::persistence::{SessionStore, SqliteSessionStore};
    use crate::session::multiplexer::SessionEvent;
    use crate::session::pty::SpawnError;
    use crate::session::state::KILLED_EXIT_CODE;
    use bytes::Bytes;
    use tokio::time::timeout;

    fn settings() -> ManagerSettings {
        ManagerSettings {
            default_shell: "/bin/sh".to_string(),
            default_size: TerminalSize::new(24, 80),
            max_sessions: 4,
            buffer_capacity: 64 * 1024,
            subscriber_queue_depth: 1024,
            terminate_grace: Duration::from_secs(5),
        }
    }

    fn manager() -> (SessionManagerImpl, Arc<SqliteSessionStore>) {
        let store = Arc::new(SqliteSessionStore::open_in_memory().unwrap());
        let manager = SessionManagerImpl::new(settings(), Persistence::new(store.clone()));
        (manager, store)
    }

    async fn wait_for(manager: &SessionManagerImpl, id: &SessionId, state: SessionState) {
        let mut rx = manager.watch_state(id).unwrap();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    #[tokio::test]
    async fn test_manager_create_session() {
        let (manager, store) = manager();

        let id = manager
            .create_session(CreateOptions::new("/tmp").size(TerminalSize::new(40, 120)))
            .await
            .unwrap();

        let info = manager.get_session_state(&id).await.unwrap();
        assert_eq!(info.state, SessionState::Running);
        assert_eq!(info.exit_code, None);
        assert_eq!(info.size, TerminalSize::new(40, 120));
        assert_eq!(info.working_directory, PathBuf::from("/tmp"));
        assert!(info.pid.is_some());
        assert!(info.created_at <= info.updated_at);

        // The first flush happens right after creation.
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Running);

        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_create_with_invalid_directory() {
        let (manager, store) = manager();

        let result = manager
            .create_session(CreateOptions::new("/nonexistent/ptykeeper/dir"))
            .await;

        assert!(matches!(
            result,
            Err(SessionError::Spawn(SpawnError::InvalidWorkingDirectory(_)))
        ));
        assert!(manager.list_sessions().is_empty());

        let history = store.list().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, SessionState::Error);
    }

    #[tokio::test]
    async fn test_manager_create_with_missing_shell() {
        let (manager, _) = manager();

        let result = manager
            .create_session(CreateOptions::new("/tmp").shell("ptykeeper-no-such-shell"))
            .await;

        assert!(matches!(
            result,
            Err(SessionError::Spawn(SpawnError::ShellNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_manager_unknown_session() {
        let (manager, _) = manager();
        let id = Uuid::new_v4();

        assert!(matches!(
            manager.write_input(&id, b"x").await,
            Err(SessionError::NotFound(missing)) if missing == id
        ));
        assert!(matches!(
            manager.resize_session(&id, TerminalSize::new(1, 1)).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            manager.kill_session(&id).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            manager.subscribe(&id),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            manager.replay_since(&id, 0).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            manager.get_session_state(&id).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manager_output_roundtrip() {
        let (manager, _) = manager();
        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();
        let mut sub = manager.subscribe(&id).unwrap();

        let written = manager
            .write_input(&id, b"echo roundtrip_$((6*7))\n")
            .await
            .unwrap();
        assert_eq!(written, 24);

        let mut seen = Vec::new();
        let found = timeout(Duration::from_secs(5), async {
            while let Some(event) = sub.recv().await {
                if let SessionEvent::Output(bytes) = event {
                    seen.extend_from_slice(&bytes);
                    if String::from_utf8_lossy(&seen).contains("roundtrip_42") {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found, "did not receive expected output");

        let replay = manager.replay_since(&id, 0).await.unwrap();
        assert!(String::from_utf8_lossy(&replay.bytes).contains("roundtrip_42"));
        assert!(!replay.truncated);

        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_kill_keeps_history() {
        let (manager, store) = manager();
        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();
        let mut events = manager.subscribe_events();

        manager.kill_session(&id).await.unwrap();

        let info = manager.get_session_state(&id).await.unwrap();
        assert_eq!(info.state, SessionState::Killed);
        assert_eq!(info.exit_code, Some(KILLED_EXIT_CODE));
        assert!(matches!(
            events.recv().await.unwrap(),
            ManagerEvent::StateChanged {
                to: SessionState::Killed,
                ..
            }
        ));

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Killed);
        assert_eq!(record.exit_code, Some(KILLED_EXIT_CODE));

        // Terminal sessions reject further commands.
        assert!(manager.write_input(&id, b"x").await.is_err());
        assert!(matches!(
            manager.kill_session(&id).await,
            Err(SessionError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_manager_exit_is_observed() {
        let (manager, store) = manager();
        let id = manager
            .create_session(CreateOptions::new("/tmp").args(["-c", "exit 3"]))
            .await
            .unwrap();

        wait_for(&manager, &id, SessionState::Exited).await;

        let info = manager.get_session_state(&id).await.unwrap();
        assert_eq!(info.exit_code, Some(3));
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Exited);
        assert_eq!(record.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_manager_suspend_resume() {
        let (manager, _) = manager();
        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();

        assert!(matches!(
            manager.resume_session(&id).await,
            Err(SessionError::InvalidTransition(_))
        ));

        manager.suspend_session(&id).await.unwrap();
        assert_eq!(
            manager.get_session_state(&id).await.unwrap().state,
            SessionState::Suspended
        );

        manager.resume_session(&id).await.unwrap();
        assert_eq!(
            manager.get_session_state(&id).await.unwrap().state,
            SessionState::Running
        );

        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_resize_publishes_once() {
        let (manager, _) = manager();
        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();
        let mut sub = manager.subscribe(&id).unwrap();

        let size = TerminalSize::new(50, 132);
        manager.resize_session(&id, size).await.unwrap();
        manager.resize_session(&id, size).await.unwrap();
        assert_eq!(manager.get_session_state(&id).await.unwrap().size, size);

        let mut resizes = 0;
        while let Some(event) = sub.try_recv() {
            if event == SessionEvent::Resized(size) {
                resizes += 1;
            }
        }
        assert_eq!(resizes, 1);

        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_close_and_cleanup() {
        let (manager, _) = manager();
        let live = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();
        let dead = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();

        assert!(matches!(
            manager.close_session(&live).await,
            Err(SessionError::NotTerminal(_))
        ));

        manager.kill_session(&dead).await.unwrap();
        assert_eq!(manager.cleanup_terminated().await, 1);

        let listed = manager.list_sessions();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, live);
        assert_eq!(listed[0].state, SessionState::Running);

        manager.kill_session(&live).await.unwrap();
        manager.close_session(&live).await.unwrap();
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_manager_close_retries_failed_flush() {
        let store = Arc::new(FlakyStore::new());
        let manager = SessionManagerImpl::new(settings(), Persistence::new(store.clone()));
        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();

        store.fail_next(1);
        manager.kill_session(&id).await.unwrap();
        assert_eq!(
            store.get(&id).unwrap().unwrap().state,
            SessionState::Running
        );

        manager.close_session(&id).await.unwrap();
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Killed);
        assert_eq!(record.exit_code, Some(KILLED_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_manager_session_limit() {
        let (manager, _) = manager();
        let mut ids = Vec::new();
        for _ in 0..settings().max_sessions {
            ids.push(manager.create_session(CreateOptions::new("/tmp")).await.unwrap());
        }

        assert!(matches!(
            manager.create_session(CreateOptions::new("/tmp")).await,
            Err(SessionError::LimitReached(4))
        ));

        // Closing a finished session frees a slot.
        manager.kill_session(&ids[0]).await.unwrap();
        manager.close_session(&ids[0]).await.unwrap();
        ids[0] = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();

        for id in &ids {
            manager.kill_session(id).await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_manager_concurrent_creates_respect_limit() {
        let store = Arc::new(SqliteSessionStore::open_in_memory().unwrap());
        let manager = Arc::new(SessionManagerImpl::new(
            ManagerSettings {
                max_sessions: 2,
                ..settings()
            },
            Persistence::new(store),
        ));

        let mut creates = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            creates.spawn(async move {
                manager
                    .create_session(CreateOptions::new("/tmp").args(["-c", "exec sleep 30"]))
                    .await
            });
        }

        let mut created = Vec::new();
        let mut rejected = 0;
        while let Some(result) = creates.join_next().await {
            match result.unwrap() {
                Ok(id) => created.push(id),
                Err(SessionError::LimitReached(2)) => rejected += 1,
                Err(e) => panic!("unexpected create error: {e}"),
            }
        }

        assert_eq!(created.len(), 2);
        assert_eq!(rejected, 6);
        assert_eq!(manager.registry().len(), 2);

        for id in &created {
            manager.kill_session(id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_manager_failed_create_releases_slot() {
        let store = Arc::new(SqliteSessionStore::open_in_memory().unwrap());
        let manager = SessionManagerImpl::new(
            ManagerSettings {
                max_sessions: 1,
                ..settings()
            },
            Persistence::new(store),
        );

        assert!(manager
            .create_session(CreateOptions::new("/nonexistent/ptykeeper/dir"))
            .await
            .is_err());

        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();
        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_interrupt_stops_foreground_command() {
        let (manager, _) = manager();
        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();
        let mut sub = manager.subscribe(&id).unwrap();

        manager.write_input(&id, b"sleep 30\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.interrupt_session(&id).await.unwrap();
        manager
            .write_input(&id, b"echo after_$((3*5))\n")
            .await
            .unwrap();

        let mut seen = Vec::new();
        let found = timeout(Duration::from_secs(5), async {
            while let Some(event) = sub.recv().await {
                if let SessionEvent::Output(bytes) = event {
                    seen.extend_from_slice(&bytes);
                    if String::from_utf8_lossy(&seen).contains("after_15") {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found, "shell did not return to the prompt after interrupt");
        assert_eq!(
            manager.get_session_state(&id).await.unwrap().state,
            SessionState::Running
        );

        manager.kill_session(&id).await.unwrap();
        assert!(matches!(
            manager.interrupt_session(&id).await,
            Err(SessionError::WriteFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_manager_pause_output_keeps_buffering() {
        let (manager, _) = manager();
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            created_at: 0,
            updated_at: 0,
            state: SessionState::Running,
            exit_code: None,
            working_directory: PathBuf::from("/tmp"),
            environment: BTreeMap::new(),
            process_pid: None,
            process_started_at: None,
            output_offset: 0,
            output_log: Vec::new(),
        };
        let id = record.session_id;
        manager.restore_sessions(vec![record]);
        let session = manager.registry().get(&id).unwrap();
        let mut sub = manager.subscribe(&id).unwrap();

        manager.pause_output(&id).await.unwrap();
        manager.pause_output(&id).await.unwrap();
        assert!(manager.get_session_state(&id).await.unwrap().output_paused);
        session.ingest(Bytes::from_static(b"hidden")).await;
        assert_eq!(sub.try_recv(), None);

        manager.resume_output(&id).await.unwrap();
        assert!(!manager.get_session_state(&id).await.unwrap().output_paused);
        session.ingest(Bytes::from_static(b"+shown")).await;
        assert_eq!(
            sub.try_recv(),
            Some(SessionEvent::Output(Bytes::from_static(b"+shown")))
        );

        let replay = manager.replay_since(&id, 0).await.unwrap();
        assert_eq!(replay.bytes, b"hidden+shown");

        assert!(matches!(
            manager.pause_output(&Uuid::new_v4()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manager_health_history_starts_empty() {
        let (manager, _) = manager();
        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();

        assert!(manager.health_history(&id).await.unwrap().is_empty());
        assert!(matches!(
            manager.health_history(&Uuid::new_v4()).await,
            Err(SessionError::NotFound(_))
        ));

        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_unsubscribe() {
        let (manager, _) = manager();
        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();

        let sub = manager.subscribe(&id).unwrap();
        assert_eq!(manager.get_session_state(&id).await.unwrap().subscribers, 1);
        assert!(manager.unsubscribe(&id, sub.id()).unwrap());
        assert!(!manager.unsubscribe(&id, sub.id()).unwrap());
        assert_eq!(manager.get_session_state(&id).await.unwrap().subscribers, 0);

        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_manager_restore_sessions() {
        let (manager, _) = manager();
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            created_at: 10,
            updated_at: 20,
            state: SessionState::Running,
            exit_code: None,
            working_directory: PathBuf::from("/srv"),
            environment: BTreeMap::from([("A".to_string(), "1".to_string())]),
            process_pid: None,
            process_started_at: None,
            output_offset: 0,
            output_log: b"before restart".to_vec(),
        };

        assert_eq!(manager.restore_sessions(vec![record.clone()]), 1);
        // Already registered ids are skipped.
        assert_eq!(manager.restore_sessions(vec![record.clone()]), 0);

        let info = manager.get_session_state(&record.session_id).await.unwrap();
        assert_eq!(info.state, SessionState::Restored);
        assert_eq!(info.created_at, 10);
        assert_eq!(info.working_directory, PathBuf::from("/srv"));

        let replay = manager.replay_since(&record.session_id, 0).await.unwrap();
        assert_eq!(replay.bytes, b"before restart");
        assert_eq!(replay.next_offset, 14);
    }

    #[tokio::test]
    async fn test_manager_restore_keeps_client_offsets() {
        let (manager, _) = manager();
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            created_at: 10,
            updated_at: 20,
            state: SessionState::Running,
            exit_code: None,
            working_directory: PathBuf::from("/srv"),
            environment: BTreeMap::new(),
            process_pid: None,
            process_started_at: None,
            output_offset: 5000,
            output_log: b"tail of a long log".to_vec(),
        };
        manager.restore_sessions(vec![record.clone()]);

        // A client that had read up to 4990 gets exactly what it missed.
        let replay = manager.replay_since(&record.session_id, 4990).await.unwrap();
        assert_eq!(replay.bytes, b"a long log");
        assert!(!replay.truncated);
        assert_eq!(replay.next_offset, 5000);

        // An offset older than the saved tail is reported as truncated.
        let replay = manager.replay_since(&record.session_id, 0).await.unwrap();
        assert!(replay.truncated);
        assert_eq!(replay.bytes, b"tail of a long log");

        let info = manager.get_session_state(&record.session_id).await.unwrap();
        assert_eq!(info.current_offset, 5000);
    }

    #[tokio::test]
    async fn test_manager_shutdown_flushes_and_clears() {
        let (manager, store) = manager();
        let id = manager.create_session(CreateOptions::new("/tmp")).await.unwrap();

        manager.shutdown().await;

        assert!(manager.list_sessions().is_empty());
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Running);
    }
}
