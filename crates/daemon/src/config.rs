//! Configuration management for the ptykeeper daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ptykeeper/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default byte capacity of a session's output buffer (32 MiB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 32 * 1024 * 1024;

/// Default number of pending events a subscriber may hold before it is dropped.
pub const DEFAULT_SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

/// Upper bound on the flush interval; bounds the data loss window.
pub const MAX_FLUSH_INTERVAL_SECS: u64 = 10;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("buffer_capacity must be greater than 0")]
    InvalidBufferCapacity,

    #[error("subscriber_queue_depth must be greater than 0")]
    InvalidQueueDepth,

    #[error("default terminal size must be non-zero, got {rows}x{cols}")]
    InvalidTerminalSize { rows: u16, cols: u16 },

    #[error("flush_interval_secs must be between 1 and 10, got {0}")]
    InvalidFlushInterval(u64),

    #[error("reconcile_interval_secs must be greater than 0")]
    InvalidReconcileInterval,

    #[error("needs_attention_after_secs ({needs_attention}) must exceed idle_after_secs ({idle})")]
    InvalidAttentionThresholds { idle: u64, needs_attention: u64 },

    #[error("attention tick_millis must be greater than 0")]
    InvalidAttentionTick,

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the ptykeeper daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Durable storage configuration.
    pub persistence: PersistenceConfig,

    /// Health reconciliation configuration.
    pub health: HealthConfig,

    /// Output inactivity alerting.
    pub attention: AttentionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for storing daemon data (session database).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Output bytes retained per session.
    pub buffer_capacity: usize,

    /// Pending events per subscriber before the subscriber is dropped.
    pub subscriber_queue_depth: usize,

    /// Rows used when a create request omits a size.
    pub default_rows: u16,

    /// Columns used when a create request omits a size.
    pub default_cols: u16,

    /// Seconds between SIGTERM and SIGKILL escalation.
    pub terminate_grace_secs: u64,
}

/// Durable storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// SQLite database file. Relative paths resolve against `daemon.data_dir`.
    pub database_file: PathBuf,

    /// Seconds between periodic flushes of live sessions.
    pub flush_interval_secs: u64,
}

/// Health reconciliation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    /// Seconds between reconciliation passes.
    pub reconcile_interval_secs: u64,
}

/// Output inactivity alerting configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AttentionConfig {
    /// Silence before a session is marked idle.
    pub idle_after_secs: u64,

    /// Silence before a session needs attention.
    pub needs_attention_after_secs: u64,

    /// Monitor tick period in milliseconds.
    pub tick_millis: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            max_sessions: 32,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            subscriber_queue_depth: DEFAULT_SUBSCRIBER_QUEUE_DEPTH,
            default_rows: 24,
            default_cols: 80,
            terminate_grace_secs: 5,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_file: PathBuf::from("sessions.db"),
            flush_interval_secs: MAX_FLUSH_INTERVAL_SECS,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 5,
        }
    }
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            idle_after_secs: 30,
            needs_attention_after_secs: 120,
            tick_millis: 1000,
        }
    }
}

impl SessionConfig {
    /// Grace period between terminate and kill.
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

impl PersistenceConfig {
    /// Periodic flush cadence.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

impl HealthConfig {
    /// Reconciliation cadence.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl AttentionConfig {
    /// Silence before the idle alert.
    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    /// Silence before the needs-attention alert.
    pub fn needs_attention_after(&self) -> Duration {
        Duration::from_secs(self.needs_attention_after_secs)
    }

    /// Monitor tick period.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptykeeper")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ptykeeper")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PTYKEEPER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PTYKEEPER_DATA_DIR: Override the data directory
    /// - PTYKEEPER_SHELL: Override the default shell
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PTYKEEPER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("PTYKEEPER_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }

        if let Ok(shell) = std::env::var("PTYKEEPER_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding default_shell from environment: {}", shell);
                self.session.default_shell = shell;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.buffer_capacity == 0 {
            return Err(ConfigError::InvalidBufferCapacity);
        }

        if self.session.subscriber_queue_depth == 0 {
            return Err(ConfigError::InvalidQueueDepth);
        }

        if self.session.default_rows == 0 || self.session.default_cols == 0 {
            return Err(ConfigError::InvalidTerminalSize {
                rows: self.session.default_rows,
                cols: self.session.default_cols,
            });
        }

        let flush = self.persistence.flush_interval_secs;
        if flush < 1 || flush > MAX_FLUSH_INTERVAL_SECS {
            return Err(ConfigError::InvalidFlushInterval(flush));
        }

        if self.health.reconcile_interval_secs == 0 {
            return Err(ConfigError::InvalidReconcileInterval);
        }

        if self.attention.needs_attention_after_secs <= self.attention.idle_after_secs {
            return Err(ConfigError::InvalidAttentionThresholds {
                idle: self.attention.idle_after_secs,
                needs_attention: self.attention.needs_attention_after_secs,
            });
        }

        if self.attention.tick_millis == 0 {
            return Err(ConfigError::InvalidAttentionTick);
        }

        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() {
            if !shell_path.exists() {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        } else if which::which(&self.session.default_shell).is_err() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Resolved path of the session database.
    pub fn database_path(&self) -> PathBuf {
        if self.persistence.database_file.is_absolute() {
            self.persistence.database_file.clone()
        } else {
            self.daemon.data_dir.join(&self.persistence.database_file)
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
