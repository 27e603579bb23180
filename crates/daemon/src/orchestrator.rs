//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! manager, the session store and the three periodic tasks (persistence,
//! health reconciliation and attention monitoring).

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::health::HealthReconciler;
use crate::persistence::{Persistence, SessionStore, SqliteSessionStore};
use crate::router::FrameRouter;
use crate::session::{
    AttentionMonitor, AttentionThresholds, LogNotifier, ManagerSettings, SessionManagerImpl,
};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Restoring sessions and starting timers.
    Starting,
    /// Running and supervising sessions.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// Persisted sessions were registered at startup.
    SessionsRestored { restored: usize, corrected: usize },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session manager for PTY sessions.
    session_manager: Arc<SessionManagerImpl>,
    /// Frame router for remote clients.
    router: Arc<FrameRouter<SessionManagerImpl>>,
    /// Cancellation token for the periodic tasks.
    shutdown_token: CancellationToken,
    /// Periodic tasks started by `start`.
    tasks: Vec<JoinHandle<()>>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator backed by the configured SQLite database.
    pub fn new(config: Config) -> Result<Self> {
        let path = config.database_path();
        let store = SqliteSessionStore::open(&path)
            .with_context(|| format!("Failed to open session database: {}", path.display()))?;
        Self::with_store(config, Arc::new(store))
    }

    /// Creates an orchestrator backed by an existing store.
    pub fn with_store(config: Config, store: Arc<dyn SessionStore>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let session_manager = Arc::new(SessionManagerImpl::new(
            ManagerSettings::from(&config.session),
            Persistence::new(store),
        ));
        let router = Arc::new(FrameRouter::new(Arc::clone(&session_manager)));
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            session_manager,
            router,
            shutdown_token: CancellationToken::new(),
            tasks: Vec::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the daemon orchestrator.
    ///
    /// Restores persisted sessions, runs one reconciliation pass so no
    /// session stays `Restored`, then starts the periodic tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let persistence = self.session_manager.persistence().clone();
        let records = match persistence.load_restorable().await {
            Ok(records) => records,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                return Err(e).context("Failed to load persisted sessions");
            }
        };
        let restored = self.session_manager.restore_sessions(records);

        let registry = Arc::clone(self.session_manager.registry());
        let report = HealthReconciler::new(Arc::clone(&registry))
            .reconcile_once()
            .await;
        if restored > 0 {
            info!(
                restored,
                corrected = report.corrections.len(),
                "Restored persisted sessions"
            );
        }
        self.emit_event(OrchestratorEvent::SessionsRestored {
            restored,
            corrected: report.corrections.len(),
        });

        self.shutdown_token = CancellationToken::new();
        let token = &self.shutdown_token;

        self.tasks.push(tokio::spawn(persistence.run(
            Arc::clone(&registry),
            self.config.persistence.flush_interval(),
            token.clone(),
        )));
        debug!("Started persistence task");

        self.tasks.push(tokio::spawn(
            HealthReconciler::new(Arc::clone(&registry))
                .run(self.config.health.reconcile_interval(), token.clone()),
        ));
        debug!("Started health reconciler");

        let monitor = AttentionMonitor::new(
            registry,
            AttentionThresholds::from(&self.config.attention),
            Arc::new(LogNotifier),
            self.session_manager.event_sender(),
        );
        self.tasks
            .push(tokio::spawn(monitor.run(self.config.attention.tick(), token.clone())));
        debug!("Started attention monitor");

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    /// Stops the periodic tasks, flushes every session and releases all PTYs.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Running {
                anyhow::bail!("Orchestrator is not running");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Periodic task ended abnormally: {}", e);
            }
        }

        self.session_manager.shutdown().await;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManagerImpl> {
        &self.session_manager
    }

    /// Returns the frame router.
    pub fn router(&self) -> &Arc<FrameRouter<SessionManagerImpl>> {
        &self.router
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
