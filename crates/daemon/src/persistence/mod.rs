//! Session persistence.
//!
//! Snapshots every live session on a fixed interval and once more as soon
//! as a session reaches a terminal state. Flush failures are logged and
//! retried on the next tick; they never reach session callers.

pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::session::{Session, SessionRegistry};

pub use store::{
    RecordSummary, SessionRecord, SessionStore, SqliteSessionStore, StorageError, StorageResult,
};

/// Outcome of one [`Persistence::flush_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    pub failed: usize,
}

/// Async front end over a blocking [`SessionStore`].
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn SessionStore>,
}

impl Persistence {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Writes one record on the blocking pool.
    pub async fn write(&self, record: SessionRecord) -> StorageResult<()> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.upsert(&record))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Loads records that were live at their last flush.
    pub async fn load_restorable(&self) -> StorageResult<Vec<SessionRecord>> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.load_restorable())
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Snapshots and writes one session. Returns whether the write succeeded.
    ///
    /// Flushes of the same session are serialized, so an older snapshot can
    /// never overwrite a newer one.
    pub async fn flush(&self, session: &Session) -> bool {
        let _guard = session.flush_guard().await;
        let record = session.snapshot().await;
        let state = record.state;
        let bytes = record.output_log.len();

        match self.write(record).await {
            Ok(()) => {
                session.set_flush_pending(false);
                tracing::trace!(
                    session_id = %session.id(),
                    state = %state,
                    bytes,
                    "Flushed session"
                );
                true
            }
            Err(e) => {
                session.set_flush_pending(true);
                tracing::warn!(
                    session_id = %session.id(),
                    error = %e,
                    "Session flush failed, will retry"
                );
                false
            }
        }
    }

    /// Flushes every non-terminal session and any session whose last flush failed.
    pub async fn flush_all(&self, registry: &SessionRegistry) -> FlushReport {
        let mut report = FlushReport::default();

        for session in registry.snapshot() {
            if session.state().is_terminal() && !session.flush_pending() {
                continue;
            }
            if self.flush(&session).await {
                report.flushed += 1;
            } else {
                report.failed += 1;
            }
        }

        report
    }

    /// Runs [`flush_all`](Self::flush_all) every `period` until cancelled.
    pub async fn run(
        self,
        registry: Arc<SessionRegistry>,
        period: Duration,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.flush_all(&registry).await;
                    if report.failed > 0 {
                        tracing::warn!(
                            flushed = report.flushed,
                            failed = report.failed,
                            "Periodic flush incomplete"
                        );
                    }
                }
            }
        }

        tracing::debug!("Persistence loop stopped");
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FlakyStore;
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use bytes::Bytes;
    use protocol::{SessionState, TerminalSize};
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use crate::session::entry::{SessionHooks, SessionInit};
    use crate::session::{Lifecycle, SessionBuffer};

    fn session(persistence: &Persistence, state: SessionState) -> Arc<Session> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Session::new(
            SessionInit {
                id: Uuid::new_v4(),
                working_directory: PathBuf::from("/tmp"),
                environment: BTreeMap::new(),
                created_at: 0,
                size: TerminalSize::default(),
                pid: None,
                pid_started_at: None,
                lifecycle: Lifecycle::with_state(state),
                buffer: SessionBuffer::new(64),
                queue_depth: 8,
            },
            SessionHooks {
                persistence: persistence.clone(),
                events,
            },
        ))
    }

    #[tokio::test]
    async fn test_failed_terminal_flush_is_retried() {
        let store = Arc::new(FlakyStore::new());
        let persistence = Persistence::new(store.clone());
        let registry = SessionRegistry::new();
        let session = session(&persistence, SessionState::Running);
        registry.insert(Arc::clone(&session));
        session.ingest(Bytes::from_static(b"last words")).await;

        store.fail_next(2);
        session.finish(SessionState::Exited, Some(0)).await.unwrap();

        assert_eq!(session.state(), SessionState::Exited);
        assert!(session.flush_pending());
        assert!(store.get(&session.id()).unwrap().is_none());

        let report = persistence.flush_all(&registry).await;
        assert_eq!(report, FlushReport { flushed: 0, failed: 1 });
        assert!(session.flush_pending());

        let report = persistence.flush_all(&registry).await;
        assert_eq!(report, FlushReport { flushed: 1, failed: 0 });
        assert!(!session.flush_pending());

        let record = store.get(&session.id()).unwrap().unwrap();
        assert_eq!(record.state, SessionState::Exited);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(record.output_log, b"last words");

        // Flushed terminal sessions are left alone afterwards.
        let report = persistence.flush_all(&registry).await;
        assert_eq!(report, FlushReport::default());
    }

    #[tokio::test]
    async fn test_flush_all_keeps_going_after_a_failure() {
        let store = Arc::new(FlakyStore::new());
        let persistence = Persistence::new(store.clone());
        let registry = SessionRegistry::new();
        let first = session(&persistence, SessionState::Running);
        let second = session(&persistence, SessionState::Suspended);
        registry.insert(Arc::clone(&first));
        registry.insert(Arc::clone(&second));

        store.fail_next(1);
        let report = persistence.flush_all(&registry).await;

        assert_eq!(report, FlushReport { flushed: 1, failed: 1 });
        assert_eq!(store.list().unwrap().len(), 1);

        let report = persistence.flush_all(&registry).await;
        assert_eq!(report, FlushReport { flushed: 2, failed: 0 });
        assert_eq!(
            store.get(&second.id()).unwrap().unwrap().state,
            SessionState::Suspended
        );
    }

    #[tokio::test]
    async fn test_flush_reports_outcome() {
        let store = Arc::new(FlakyStore::new());
        let persistence = Persistence::new(store.clone());
        let session = session(&persistence, SessionState::Running);

        store.fail_next(1);
        assert!(!persistence.flush(&session).await);
        assert!(session.flush_pending());

        assert!(persistence.flush(&session).await);
        assert!(!session.flush_pending());
        assert_eq!(
            store.get(&session.id()).unwrap().unwrap().state,
            SessionState::Running
        );
    }
}
