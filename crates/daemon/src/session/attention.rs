//! Output inactivity alerts.
//!
//! Each running session tracks how long it has been silent. Crossing the
//! idle threshold raises an `Idle` alert, crossing the longer threshold
//! raises `NeedsAttention` plus a one-time notification. Any output resets
//! the session to `None`. Alerts are advisory and never change the
//! session lifecycle.

use std::sync::Arc;
use std::time::Duration;

use protocol::{SessionId, SessionState};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::manager::ManagerEvent;
use super::registry::SessionRegistry;
use crate::config::AttentionConfig;

/// Advisory alert level derived from output silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionLevel {
    None,
    Idle,
    NeedsAttention,
}

/// Silence thresholds for the two alert levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionThresholds {
    pub idle_after: Duration,
    pub needs_attention_after: Duration,
}

impl Default for AttentionThresholds {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(30),
            needs_attention_after: Duration::from_secs(120),
        }
    }
}

impl From<&AttentionConfig> for AttentionThresholds {
    fn from(config: &AttentionConfig) -> Self {
        Self {
            idle_after: config.idle_after(),
            needs_attention_after: config.needs_attention_after(),
        }
    }
}

/// A level change produced by [`AttentionTracker::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionChange {
    pub level: AttentionLevel,
    /// Set the first time `NeedsAttention` is reached since the last output.
    pub notify: bool,
}

/// Per-session silence tracker.
#[derive(Debug, Clone)]
pub struct AttentionTracker {
    last_output: Instant,
    level: AttentionLevel,
    notified: bool,
}

impl AttentionTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            last_output: now,
            level: AttentionLevel::None,
            notified: false,
        }
    }

    /// Current alert level.
    pub fn level(&self) -> AttentionLevel {
        self.level
    }

    /// Time since the last output byte.
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_output)
    }

    /// Records new output, clearing any alert and re-arming both thresholds.
    ///
    /// Returns the change when an alert was cleared.
    pub fn record_output(&mut self, now: Instant) -> Option<AttentionChange> {
        self.last_output = now;
        self.notified = false;
        if self.level == AttentionLevel::None {
            return None;
        }
        self.level = AttentionLevel::None;
        Some(AttentionChange {
            level: AttentionLevel::None,
            notify: false,
        })
    }

    /// Recomputes the level. Returns the change, if any.
    pub fn evaluate(
        &mut self,
        now: Instant,
        thresholds: &AttentionThresholds,
    ) -> Option<AttentionChange> {
        let silent = self.silent_for(now);
        let level = if silent >= thresholds.needs_attention_after {
            AttentionLevel::NeedsAttention
        } else if silent >= thresholds.idle_after {
            AttentionLevel::Idle
        } else {
            AttentionLevel::None
        };

        if level == self.level {
            return None;
        }
        self.level = level;

        let notify = level == AttentionLevel::NeedsAttention && !self.notified;
        if notify {
            self.notified = true;
        }
        Some(AttentionChange { level, notify })
    }
}

/// Side effect fired once when a session first needs attention.
pub trait AttentionNotifier: Send + Sync {
    fn notify(&self, session_id: SessionId, silent_for: Duration);
}

/// Notifier that writes a warning to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl AttentionNotifier for LogNotifier {
    fn notify(&self, session_id: SessionId, silent_for: Duration) {
        tracing::warn!(
            session_id = %session_id,
            silent_secs = silent_for.as_secs(),
            "Session needs attention"
        );
    }
}

/// Periodically evaluates every running session's tracker.
pub struct AttentionMonitor {
    registry: Arc<SessionRegistry>,
    thresholds: AttentionThresholds,
    notifier: Arc<dyn AttentionNotifier>,
    events: broadcast::Sender<ManagerEvent>,
}

impl AttentionMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        thresholds: AttentionThresholds,
        notifier: Arc<dyn AttentionNotifier>,
        events: broadcast::Sender<ManagerEvent>,
    ) -> Self {
        Self {
            registry,
            thresholds,
            notifier,
            events,
        }
    }

    /// Evaluates every running session once. Returns the number of level changes.
    pub async fn tick(&self) -> usize {
        let now = Instant::now();
        let mut changes = 0;

        for session in self.registry.snapshot() {
            if session.state() != SessionState::Running {
                continue;
            }

            let (change, silent_for) = {
                let mut tracker = session.attention().lock().await;
                (tracker.evaluate(now, &self.thresholds), tracker.silent_for(now))
            };
            let Some(change) = change else {
                continue;
            };
            changes += 1;

            tracing::debug!(
                session_id = %session.id(),
                level = ?change.level,
                "Attention level changed"
            );
            let _ = self.events.send(ManagerEvent::Attention {
                session_id: session.id(),
                level: change.level,
            });

            if change.notify {
                self.notifier.notify(session.id(), silent_for);
            }
        }

        changes
    }

    /// Runs [`tick`](Self::tick) every `period` until cancelled.
    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        tracing::debug!("Attention monitor stopped");
    }
}
