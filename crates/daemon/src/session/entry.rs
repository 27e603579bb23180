//! One supervised session.
//!
//! A [`Session`] owns its PTY handle, output buffer, broadcaster, lifecycle
//! and attention tracker. Locks are always taken in the order
//! `flush_lock -> lifecycle -> process -> buffer -> attention`, and a
//! terminal flush is only started after the lifecycle lock is released.
//! The health history lock is never held together with another.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::{SessionId, SessionState, TerminalSize};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::attention::AttentionTracker;
use super::buffer::{Replay, SessionBuffer};
use super::manager::{ManagerEvent, SessionInfo};
use super::multiplexer::{OutputBroadcaster, PublishReport, SessionEvent, Subscription};
use super::pty::{
    process_matches, process_start_time, signal_pid, OutputStream, PtyProcess, SessionError,
    SignalKind,
};
use super::state::{is_legal_transition, Lifecycle, TransitionError, KILLED_EXIT_CODE};
use crate::health::{HealthCheck, HEALTH_HISTORY_LEN};
use crate::persistence::{Persistence, SessionRecord};

/// How often the read loop polls for an exit status after output ends.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Polls before the read loop gives up and defers to reconciliation.
const EXIT_POLL_ATTEMPTS: usize = 20;

/// End-of-text, what a terminal sends for Ctrl+C.
const ETX: u8 = 0x03;

/// Shared collaborators every session reports to.
#[derive(Clone)]
pub struct SessionHooks {
    pub persistence: Persistence,
    pub events: broadcast::Sender<ManagerEvent>,
}

/// Construction parameters for a [`Session`].
pub struct SessionInit {
    pub id: SessionId,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub created_at: i64,
    pub size: TerminalSize,
    pub pid: Option<u32>,
    /// Kernel start time of `pid`, used to recognise a recycled pid.
    pub pid_started_at: Option<u64>,
    pub lifecycle: Lifecycle,
    pub buffer: SessionBuffer,
    pub queue_depth: usize,
}

/// What a liveness probe found out about a session's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// The process is still running.
    Alive,
    /// The process is gone; the code is known only for our own children.
    Exited(Option<i32>),
    /// There is neither a handle nor a recorded pid to check.
    Unknown,
}

struct ProcessSlot {
    handle: Option<PtyProcess>,
    size: TerminalSize,
}

/// A supervised terminal session.
pub struct Session {
    id: SessionId,
    working_directory: PathBuf,
    environment: BTreeMap<String, String>,
    created_at: i64,
    /// 0 when unknown.
    pid: AtomicU32,
    /// 0 when unknown.
    pid_started_at: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<SessionState>,
    process: Mutex<ProcessSlot>,
    buffer: RwLock<SessionBuffer>,
    broadcaster: OutputBroadcaster,
    attention: Mutex<AttentionTracker>,
    /// Live output delivery is held back while set; the buffer still records.
    output_paused: AtomicBool,
    health: Mutex<VecDeque<HealthCheck>>,
    cancel: CancellationToken,
    flush_lock: Mutex<()>,
    flush_pending: AtomicBool,
    hooks: SessionHooks,
}

impl Session {
    pub fn new(init: SessionInit, hooks: SessionHooks) -> Self {
        let (state_tx, _) = watch::channel(init.lifecycle.state());

        Self {
            id: init.id,
            working_directory: init.working_directory,
            environment: init.environment,
            created_at: init.created_at,
            pid: AtomicU32::new(init.pid.unwrap_or(0)),
            pid_started_at: AtomicU64::new(init.pid_started_at.unwrap_or(0)),
            lifecycle: Mutex::new(init.lifecycle),
            state_tx,
            process: Mutex::new(ProcessSlot {
                handle: None,
                size: init.size,
            }),
            buffer: RwLock::new(init.buffer),
            broadcaster: OutputBroadcaster::new(init.id, init.queue_depth),
            attention: Mutex::new(AttentionTracker::new(Instant::now())),
            output_paused: AtomicBool::new(false),
            health: Mutex::new(VecDeque::with_capacity(HEALTH_HISTORY_LEN)),
            cancel: CancellationToken::new(),
            flush_lock: Mutex::new(()),
            flush_pending: AtomicBool::new(false),
            hooks,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Start time recorded for [`Session::pid`].
    pub fn pid_started_at(&self) -> Option<u64> {
        match self.pid_started_at.load(Ordering::Relaxed) {
            0 => None,
            started_at => Some(started_at),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn broadcaster(&self) -> &OutputBroadcaster {
        &self.broadcaster
    }

    pub fn attention(&self) -> &Mutex<AttentionTracker> {
        &self.attention
    }

    /// Installs a freshly spawned process and returns its output stream.
    pub async fn attach_process(&self, mut process: PtyProcess) -> Option<OutputStream> {
        let output = process.take_output();
        let pid = process.pid();
        self.pid.store(pid.unwrap_or(0), Ordering::Relaxed);
        self.pid_started_at.store(
            pid.and_then(process_start_time).unwrap_or(0),
            Ordering::Relaxed,
        );

        let mut slot = self.process.lock().await;
        slot.size = process.size();
        slot.handle = Some(process);
        output
    }

    /// Spawns the task that moves PTY output into the buffer and subscribers.
    pub fn start_read_loop(self: &Arc<Self>, mut output: OutputStream) -> JoinHandle<()> {
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let failure = loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => {
                        tracing::debug!(session_id = %session.id, "Read loop cancelled");
                        return;
                    }
                    chunk = output.next_chunk() => match chunk {
                        Some(Ok(bytes)) => session.ingest(bytes).await,
                        Some(Err(e)) => break Some(e),
                        None => break None,
                    }
                }
            };

            session.observe_output_end(failure).await;
        })
    }

    /// Appends a chunk to the buffer and publishes it, in one critical section.
    ///
    /// While output is paused the chunk is only buffered.
    pub async fn ingest(&self, chunk: Bytes) {
        let report = {
            let mut buffer = self.buffer.write().await;
            buffer.push(&chunk);
            if self.output_paused() {
                None
            } else {
                Some(self.broadcaster.publish(SessionEvent::Output(chunk)))
            }
        };
        let cleared = self.attention.lock().await.record_output(Instant::now());
        if let Some(report) = report {
            self.report_dropped(report);
        }
        if let Some(change) = cleared {
            let _ = self.hooks.events.send(ManagerEvent::Attention {
                session_id: self.id,
                level: change.level,
            });
        }
    }

    pub fn output_paused(&self) -> bool {
        self.output_paused.load(Ordering::Acquire)
    }

    /// Stops publishing output to subscribers. Returns whether this call
    /// changed anything.
    ///
    /// Output keeps going into the buffer, so a subscriber can catch up
    /// with [`replay_since`](Self::replay_since) after resuming.
    pub async fn pause_output(&self) -> bool {
        // Taken so no publish is in flight while the flag flips.
        let _order = self.buffer.write().await;
        let changed = !self.output_paused.swap(true, Ordering::AcqRel);
        if changed {
            tracing::debug!(session_id = %self.id, "Output paused");
        }
        changed
    }

    /// Publishes output to subscribers again. Returns whether this call
    /// changed anything.
    pub async fn resume_output(&self) -> bool {
        let _order = self.buffer.write().await;
        let changed = self.output_paused.swap(false, Ordering::AcqRel);
        if changed {
            tracing::debug!(session_id = %self.id, "Output resumed");
        }
        changed
    }

    /// Decides the final state once the output stream has ended.
    async fn observe_output_end(&self, failure: Option<io::Error>) {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            if self.state().is_terminal() {
                return;
            }
            if let Some(code) = self.try_wait().await {
                if let Err(e) = self.finish(SessionState::Exited, Some(code)).await {
                    tracing::debug!(session_id = %self.id, error = %e, "Exit already recorded");
                }
                return;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        match failure {
            Some(e) => {
                tracing::error!(session_id = %self.id, error = %e, "PTY read failed");
                if let Err(e) = self.finish(SessionState::Error, None).await {
                    tracing::debug!(session_id = %self.id, error = %e, "Failure already recorded");
                }
            }
            None => {
                tracing::debug!(
                    session_id = %self.id,
                    "Output ended while process is alive, deferring to reconciliation"
                );
            }
        }
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    /// Returns the replay since `offset` and a subscription that starts
    /// exactly where the replay ends.
    pub async fn attach(&self, offset: u64) -> (Replay, Subscription) {
        let buffer = self.buffer.read().await;
        let replay = buffer.slice_since(offset);
        let subscription = self.broadcaster.subscribe();
        (replay, subscription)
    }

    /// Bytes written at or after `offset`.
    pub async fn replay_since(&self, offset: u64) -> Replay {
        self.buffer.read().await.slice_since(offset)
    }

    /// Writes input to the process. Returns the number of bytes written.
    pub async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        let mut slot = self.process.lock().await;
        let process = slot
            .handle
            .as_mut()
            .ok_or_else(|| SessionError::WriteFailed("no process attached".to_string()))?;
        process.write(data)
    }

    /// Sends an interrupt (Ctrl+C) to the foreground process.
    pub async fn interrupt(&self) -> Result<(), SessionError> {
        self.write(&[ETX]).await?;
        tracing::debug!(session_id = %self.id, "Interrupt sent");
        Ok(())
    }

    /// Applies a new terminal size and publishes it when it changed.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        let mut slot = self.process.lock().await;
        let process = slot
            .handle
            .as_mut()
            .ok_or_else(|| SessionError::ResizeFailed("no process attached".to_string()))?;
        process.resize(size)?;

        if slot.size != size {
            slot.size = size;
            let report = {
                let _order = self.buffer.write().await;
                self.broadcaster.publish(SessionEvent::Resized(size))
            };
            self.report_dropped(report);
        }
        Ok(())
    }

    /// Stops the process and moves to `Suspended`.
    pub async fn suspend(&self) -> Result<(), SessionError> {
        let mut lifecycle = self.lifecycle.lock().await;
        ensure_transition(lifecycle.state(), SessionState::Suspended)?;
        self.send_signal(SignalKind::Stop).await?;
        self.apply(&mut lifecycle, SessionState::Suspended, None)
            .await?;
        Ok(())
    }

    /// Continues the process and moves back to `Running`.
    pub async fn resume(&self) -> Result<(), SessionError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state() != SessionState::Suspended {
            return Err(TransitionError {
                from: lifecycle.state(),
                to: SessionState::Running,
            }
            .into());
        }
        self.send_signal(SignalKind::Continue).await?;
        self.apply(&mut lifecycle, SessionState::Running, None)
            .await?;
        Ok(())
    }

    /// Sends a graceful termination request and arms the kill escalation.
    ///
    /// If the session has not reached a terminal state after `grace`, it is
    /// killed.
    pub async fn terminate(self: &Arc<Self>, grace: Duration) -> Result<(), SessionError> {
        {
            let lifecycle = self.lifecycle.lock().await;
            let state = lifecycle.state();
            ensure_transition(state, SessionState::Killed)?;
            self.send_signal(SignalKind::Terminate).await?;
            if state == SessionState::Suspended {
                // A stopped process only acts on SIGTERM once continued.
                self.send_signal(SignalKind::Continue).await?;
            }
        }

        tracing::info!(
            session_id = %self.id,
            grace_ms = grace.as_millis() as u64,
            "Terminating session"
        );

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut state_rx = session.watch_state();
            if tokio::time::timeout(grace, wait_until_terminal(&mut state_rx))
                .await
                .is_ok()
            {
                return;
            }

            tracing::warn!(
                session_id = %session.id,
                "Session ignored termination, escalating to kill"
            );
            if let Err(e) = session.kill().await {
                tracing::debug!(session_id = %session.id, error = %e, "Escalation skipped");
            }
        });

        Ok(())
    }

    /// Forcibly terminates the process and moves to `Killed`.
    pub async fn kill(&self) -> Result<(), SessionError> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            ensure_transition(lifecycle.state(), SessionState::Killed)?;
            if let Err(e) = self.send_signal(SignalKind::Kill).await {
                // The process may already be gone; the session still ends Killed.
                tracing::debug!(session_id = %self.id, error = %e, "Kill signal not delivered");
            }
            self.apply(&mut lifecycle, SessionState::Killed, Some(KILLED_EXIT_CODE))
                .await?;
        }
        self.hooks.persistence.flush(self).await;
        Ok(())
    }

    /// Transitions to `to`, flushing immediately when `to` is terminal.
    pub async fn finish(
        &self,
        to: SessionState,
        exit_code: Option<i32>,
    ) -> Result<(), TransitionError> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            self.apply(&mut lifecycle, to, exit_code).await?;
        }
        if to.is_terminal() {
            self.hooks.persistence.flush(self).await;
        }
        Ok(())
    }

    /// Performs one transition and its in-memory side effects.
    ///
    /// The caller holds the lifecycle lock. Entering a terminal state stops
    /// the read loop and releases the PTY handle.
    async fn apply(
        &self,
        lifecycle: &mut Lifecycle,
        to: SessionState,
        exit_code: Option<i32>,
    ) -> Result<(), TransitionError> {
        let from = lifecycle.state();
        lifecycle.transition(to, exit_code)?;
        let exit_code = lifecycle.exit_code();
        self.state_tx.send_replace(to);

        tracing::info!(
            session_id = %self.id,
            from = %from,
            to = %to,
            exit_code = ?exit_code,
            "Session state changed"
        );

        let report = {
            let _order = self.buffer.write().await;
            self.broadcaster
                .publish(SessionEvent::StateChanged { state: to, exit_code })
        };
        self.report_dropped(report);

        let _ = self.hooks.events.send(ManagerEvent::StateChanged {
            session_id: self.id,
            from,
            to,
            exit_code,
        });

        if to.is_terminal() {
            self.cancel.cancel();
            if let Some(mut process) = self.process.lock().await.handle.take() {
                process.close();
            }
        }
        Ok(())
    }

    async fn send_signal(&self, kind: SignalKind) -> Result<(), SessionError> {
        let mut slot = self.process.lock().await;
        match (slot.handle.as_mut(), self.pid()) {
            (Some(process), _) => process.signal(kind),
            (None, Some(pid)) => signal_pid(pid, self.pid_started_at(), kind),
            (None, None) => Err(SessionError::SignalFailed(
                "no process attached".to_string(),
            )),
        }
    }

    /// Non-blocking exit check on the owned process.
    pub async fn try_wait(&self) -> Option<i32> {
        let mut slot = self.process.lock().await;
        let process = slot.handle.as_mut()?;
        match process.try_wait() {
            Ok(code) => code,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "Failed to poll process status");
                None
            }
        }
    }

    /// Checks whether the session's process still exists.
    pub async fn probe(&self) -> Liveness {
        {
            let mut slot = self.process.lock().await;
            if let Some(process) = slot.handle.as_mut() {
                return match process.try_wait() {
                    Ok(Some(code)) => Liveness::Exited(Some(code)),
                    Ok(None) => Liveness::Alive,
                    Err(e) => {
                        tracing::warn!(session_id = %self.id, error = %e, "Failed to poll process status");
                        Liveness::Alive
                    }
                };
            }
        }

        // A recorded pid only counts when it still names the same process.
        match self.pid() {
            Some(pid) if process_matches(pid, self.pid_started_at()) => Liveness::Alive,
            Some(_) => Liveness::Exited(None),
            None => Liveness::Unknown,
        }
    }

    /// Appends a reconciliation result, dropping the oldest past the limit.
    pub async fn record_health(&self, check: HealthCheck) {
        let mut history = self.health.lock().await;
        if history.len() == HEALTH_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(check);
    }

    /// Recent reconciliation results, oldest first.
    pub async fn health_history(&self) -> Vec<HealthCheck> {
        self.health.lock().await.iter().copied().collect()
    }

    /// Builds the durable record, refreshing `updated_at`.
    pub async fn snapshot(&self) -> SessionRecord {
        let (state, exit_code, updated_at) = {
            let mut lifecycle = self.lifecycle.lock().await;
            let updated_at = lifecycle.touch();
            (lifecycle.state(), lifecycle.exit_code(), updated_at)
        };
        let (output_log, output_offset) = {
            let buffer = self.buffer.read().await;
            (buffer.contents(), buffer.current_offset())
        };

        SessionRecord {
            session_id: self.id,
            created_at: self.created_at,
            updated_at,
            state,
            exit_code,
            working_directory: self.working_directory.clone(),
            environment: self.environment.clone(),
            process_pid: self.pid(),
            process_started_at: self.pid_started_at(),
            output_offset,
            output_log,
        }
    }

    /// Current externally visible status.
    pub async fn info(&self) -> SessionInfo {
        let (state, exit_code, updated_at) = {
            let lifecycle = self.lifecycle.lock().await;
            (
                lifecycle.state(),
                lifecycle.exit_code(),
                lifecycle.updated_at(),
            )
        };
        let size = self.process.lock().await.size;
        let (buffered_bytes, current_offset) = {
            let buffer = self.buffer.read().await;
            (buffer.len(), buffer.current_offset())
        };
        let attention = self.attention.lock().await.level();

        SessionInfo {
            session_id: self.id,
            state,
            exit_code,
            created_at: self.created_at,
            updated_at,
            pid: self.pid(),
            working_directory: self.working_directory.clone(),
            size,
            subscribers: self.broadcaster.subscriber_count(),
            attention,
            output_paused: self.output_paused(),
            buffered_bytes,
            current_offset,
        }
    }

    pub(crate) async fn flush_guard(&self) -> MutexGuard<'_, ()> {
        self.flush_lock.lock().await
    }

    pub(crate) fn flush_pending(&self) -> bool {
        self.flush_pending.load(Ordering::Relaxed)
    }

    pub(crate) fn set_flush_pending(&self, pending: bool) {
        self.flush_pending.store(pending, Ordering::Relaxed);
    }

    /// Stops the read loop, closes the PTY and ends every subscription.
    pub async fn release(&self) {
        self.cancel.cancel();
        if let Some(mut process) = self.process.lock().await.handle.take() {
            process.close();
        }
        self.broadcaster.close();
    }

    fn report_dropped(&self, report: PublishReport) {
        for subscriber_id in report.dropped {
            let _ = self.hooks.events.send(ManagerEvent::SubscriberDropped {
                session_id: self.id,
                subscriber_id,
            });
        }
    }
}

fn ensure_transition(from: SessionState, to: SessionState) -> Result<(), TransitionError> {
    if is_legal_transition(from, to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

async fn wait_until_terminal(state_rx: &mut watch::Receiver<SessionState>) {
    loop {
        if state_rx.borrow_and_update().is_terminal() {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{SessionStore, SqliteSessionStore};
    use uuid::Uuid;

    fn hooks() -> (SessionHooks, Arc<SqliteSessionStore>) {
        let store = Arc::new(SqliteSessionStore::open_in_memory().unwrap());
        let (events, _) = broadcast::channel(64);
        let hooks = SessionHooks {
            persistence: Persistence::new(store.clone()),
            events,
        };
        (hooks, store)
    }

    fn detached_session(state: SessionState, pid: Option<u32>, hooks: SessionHooks) -> Session {
        restored_session(state, pid, pid.and_then(process_start_time), hooks)
    }

    fn restored_session(
        state: SessionState,
        pid: Option<u32>,
        pid_started_at: Option<u64>,
        hooks: SessionHooks,
    ) -> Session {
        Session::new(
            SessionInit {
                id: Uuid::new_v4(),
                working_directory: PathBuf::from("/tmp"),
                environment: BTreeMap::new(),
                created_at: 1,
                size: TerminalSize::default(),
                pid,
                pid_started_at,
                lifecycle: Lifecycle::with_state(state),
                buffer: SessionBuffer::new(1024),
                queue_depth: 16,
            },
            hooks,
        )
    }

    #[tokio::test]
    async fn test_ingest_feeds_buffer_and_subscribers_in_order() {
        let (hooks, _) = hooks();
        let session = detached_session(SessionState::Running, None, hooks);
        let mut sub = session.subscribe();

        session.ingest(Bytes::from_static(b"one ")).await;
        session.ingest(Bytes::from_static(b"two")).await;

        assert_eq!(session.replay_since(0).await.bytes, b"one two");
        assert_eq!(
            sub.recv().await,
            Some(SessionEvent::Output(Bytes::from_static(b"one ")))
        );
        assert_eq!(
            sub.recv().await,
            Some(SessionEvent::Output(Bytes::from_static(b"two")))
        );
    }

    #[tokio::test]
    async fn test_attach_has_no_gap_or_duplicate() {
        let (hooks, _) = hooks();
        let session = detached_session(SessionState::Running, None, hooks);
        session.ingest(Bytes::from_static(b"history")).await;

        let (replay, mut sub) = session.attach(3).await;
        assert_eq!(replay.bytes, b"tory");
        assert_eq!(replay.next_offset, 7);

        session.ingest(Bytes::from_static(b"+live")).await;
        assert_eq!(
            sub.recv().await,
            Some(SessionEvent::Output(Bytes::from_static(b"+live")))
        );
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_terminal_transition_flushes_and_publishes() {
        let (hooks, store) = hooks();
        let mut events = hooks.events.subscribe();
        let session = detached_session(SessionState::Running, None, hooks);
        let mut sub = session.subscribe();
        session.ingest(Bytes::from_static(b"bye")).await;

        session.finish(SessionState::Exited, Some(7)).await.unwrap();

        assert_eq!(session.state(), SessionState::Exited);
        let _ = sub.recv().await;
        assert_eq!(
            sub.recv().await,
            Some(SessionEvent::StateChanged {
                state: SessionState::Exited,
                exit_code: Some(7)
            })
        );
        assert!(matches!(
            events.recv().await,
            Ok(ManagerEvent::StateChanged {
                to: SessionState::Exited,
                exit_code: Some(7),
                ..
            })
        ));

        let record = store.get(&session.id()).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Exited);
        assert_eq!(record.exit_code, Some(7));
        assert_eq!(record.output_log, b"bye");
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let (hooks, _) = hooks();
        let session = detached_session(SessionState::Running, None, hooks);
        session.finish(SessionState::Error, None).await.unwrap();

        assert!(session.finish(SessionState::Running, None).await.is_err());
        assert!(session.finish(SessionState::Exited, Some(0)).await.is_err());
        assert!(matches!(
            session.kill().await,
            Err(SessionError::InvalidTransition(_))
        ));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_commands_without_process() {
        let (hooks, _) = hooks();
        let session = detached_session(SessionState::Running, None, hooks);

        assert!(matches!(
            session.write(b"ls\n").await,
            Err(SessionError::WriteFailed(_))
        ));
        assert!(matches!(
            session.resize(TerminalSize::new(10, 10)).await,
            Err(SessionError::ResizeFailed(_))
        ));
        assert!(matches!(
            session.suspend().await,
            Err(SessionError::SignalFailed(_))
        ));
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_probe_without_handle() {
        let (hooks, _) = hooks();
        let own = detached_session(SessionState::Restored, Some(std::process::id()), hooks.clone());
        assert_eq!(own.probe().await, Liveness::Alive);

        let gone = detached_session(SessionState::Restored, Some(i32::MAX as u32), hooks.clone());
        assert_eq!(gone.probe().await, Liveness::Exited(None));

        let unknown = detached_session(SessionState::Restored, None, hooks);
        assert_eq!(unknown.probe().await, Liveness::Unknown);
    }

    #[tokio::test]
    async fn test_recycled_pid_is_not_adopted() {
        let (hooks, _) = hooks();
        let mut stranger = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = stranger.id();
        let started_at = process_start_time(pid).unwrap();

        for recorded in [None, Some(started_at + 1)] {
            let session =
                restored_session(SessionState::Restored, Some(pid), recorded, hooks.clone());
            assert_eq!(session.probe().await, Liveness::Exited(None));

            // Kill still ends the session but never reaches the stranger.
            session.kill().await.unwrap();
            assert_eq!(session.state(), SessionState::Killed);
        }
        assert!(stranger.try_wait().unwrap().is_none());

        let own = restored_session(SessionState::Restored, Some(pid), Some(started_at), hooks);
        assert_eq!(own.probe().await, Liveness::Alive);
        stranger.kill().unwrap();
        stranger.wait().unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_refreshes_updated_at() {
        let (hooks, _) = hooks();
        let session = detached_session(SessionState::Running, Some(99), hooks);
        let before = session.info().await.updated_at;

        let record = session.snapshot().await;
        assert!(record.updated_at >= before);
        assert_eq!(record.process_pid, Some(99));
        assert_eq!(record.created_at, 1);
        assert_eq!(record.state, SessionState::Running);
    }
}
