//! Process liveness reconciliation.
//!
//! A PTY reader can miss or misorder end-of-stream relative to the actual
//! process exit. The reconciler periodically probes every non-terminal
//! session and corrects its recorded state to match the process.

use std::sync::Arc;
use std::time::Duration;

use protocol::{SessionId, SessionState};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::session::state::now_millis;
use crate::session::{Liveness, Session, SessionRegistry};

/// Checks kept per session; older ones are dropped first.
pub const HEALTH_HISTORY_LEN: usize = 10;

/// How concerning one check was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSeverity {
    /// The process matched the recorded state.
    Good,
    /// The state had to be corrected but the process is alive.
    Warning,
    /// The process is gone or could not be checked.
    Critical,
}

/// Result of probing one session during a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Milliseconds since the Unix epoch.
    pub checked_at: i64,
    /// State before the check.
    pub state: SessionState,
    pub liveness: Liveness,
    pub severity: HealthSeverity,
    /// State the session was moved to, if the check corrected it.
    pub correction: Option<SessionState>,
}

/// One state correction made by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correction {
    pub session_id: SessionId,
    pub from: SessionState,
    pub to: SessionState,
    pub exit_code: Option<i32>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sessions probed.
    pub checked: usize,
    pub corrections: Vec<Correction>,
}

/// Periodically aligns session states with process liveness.
pub struct HealthReconciler {
    registry: Arc<SessionRegistry>,
}

impl HealthReconciler {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Probes every non-terminal session once.
    ///
    /// Running the pass twice with no process change in between makes no
    /// correction the second time.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for session in self.registry.snapshot() {
            let from = session.state();
            if from.is_terminal() || from == SessionState::Initializing {
                continue;
            }
            report.checked += 1;

            let liveness = session.probe().await;
            let target = correction_for(from, liveness);
            let mut check = HealthCheck {
                checked_at: now_millis(),
                state: from,
                liveness,
                severity: severity_for(target),
                correction: None,
            };

            if let Some((to, exit_code)) = target {
                if let Some(correction) = apply(&session, from, to, exit_code).await {
                    check.correction = Some(correction.to);
                    report.corrections.push(correction);
                }
            }
            session.record_health(check).await;
        }

        report
    }

    /// Runs [`reconcile_once`](Self::reconcile_once) every `period` until cancelled.
    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.reconcile_once().await;
                    tracing::trace!(
                        checked = report.checked,
                        corrected = report.corrections.len(),
                        "Reconciliation pass complete"
                    );
                }
            }
        }

        tracing::debug!("Health reconciler stopped");
    }
}

/// Target state for a session in `from` whose process probed as `liveness`.
fn correction_for(from: SessionState, liveness: Liveness) -> Option<(SessionState, Option<i32>)> {
    match (from, liveness) {
        (_, Liveness::Exited(code)) => Some((SessionState::Exited, code)),
        (SessionState::Restored, Liveness::Alive) => Some((SessionState::Running, None)),
        (_, Liveness::Alive) => None,
        (_, Liveness::Unknown) => Some((SessionState::Error, None)),
    }
}

fn severity_for(target: Option<(SessionState, Option<i32>)>) -> HealthSeverity {
    match target {
        None => HealthSeverity::Good,
        Some((SessionState::Running, _)) => HealthSeverity::Warning,
        Some(_) => HealthSeverity::Critical,
    }
}

async fn apply(
    session: &Session,
    from: SessionState,
    to: SessionState,
    exit_code: Option<i32>,
) -> Option<Correction> {
    match session.finish(to, exit_code).await {
        Ok(()) => {
            tracing::warn!(
                session_id = %session.id(),
                from = %from,
                to = %to,
                exit_code = ?exit_code,
                "Reconciled session state"
            );
            Some(Correction {
                session_id: session.id(),
                from,
                to,
                exit_code,
            })
        }
        Err(e) => {
            // The read loop or a command got there first.
            tracing::debug!(session_id = %session.id(), error = %e, "Reconciliation skipped");
            None
        }
    }
}
