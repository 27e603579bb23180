//! ptykeeper daemon
//!
//! Supervises PTY sessions in the foreground and inspects persisted history.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::persistence::{RecordSummary, SessionStore, SqliteSessionStore};
use daemon::session::ManagerEvent;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// ptykeeper - supervised, persistent PTY sessions.
#[derive(Parser, Debug)]
#[command(name = "ptykeeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the session supervisor in the foreground until interrupted
    Start,

    /// Inspect persisted session history
    #[command(subcommand)]
    History(HistoryCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for persisted history.
#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommands {
    /// List every persisted session
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show one persisted session
    Show {
        /// Session ID to show
        session_id: String,

        /// Write the captured output to stdout instead of the summary
        #[arg(long)]
        output: bool,
    },

    /// Delete one persisted session
    Delete {
        /// Session ID to delete
        session_id: String,
    },
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = init_logging(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Start => run_foreground(config).await?,
        Commands::History(command) => run_history(&config, command)?,
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
    }

    Ok(())
}

/// Installs the tracing subscriber.
///
/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
/// With `daemon.log_dir` set, logs are also written to a daily file.
fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(log_dir) = &config.daemon.log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "ptykeeper.log"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(Some(guard))
}

/// Runs the orchestrator until SIGINT or SIGTERM.
async fn run_foreground(config: Config) -> anyhow::Result<()> {
    let mut orchestrator = DaemonOrchestrator::new(config)?;

    let mut orchestrator_events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = orchestrator_events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::SessionsRestored {
                    restored,
                    corrected,
                } => {
                    tracing::info!(restored, corrected, "Startup restoration finished");
                }
            }
        }
    });

    orchestrator.start().await?;

    let mut manager_events = orchestrator.session_manager().subscribe_events();
    tokio::spawn(async move {
        loop {
            match manager_events.recv().await {
                Ok(event) => log_manager_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Manager event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    wait_for_shutdown_signal().await?;
    orchestrator.stop().await?;

    Ok(())
}

fn log_manager_event(event: &ManagerEvent) {
    match event {
        ManagerEvent::StateChanged {
            session_id,
            from,
            to,
            exit_code,
        } => {
            tracing::debug!(
                session_id = %session_id,
                from = %from,
                to = %to,
                exit_code = ?exit_code,
                "Session event"
            );
        }
        ManagerEvent::Attention { session_id, level } => {
            tracing::info!(session_id = %session_id, level = ?level, "Attention changed");
        }
        ManagerEvent::SubscriberDropped {
            session_id,
            subscriber_id,
        } => {
            tracing::info!(
                session_id = %session_id,
                subscriber_id,
                "Slow subscriber dropped"
            );
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

fn run_history(config: &Config, command: HistoryCommands) -> anyhow::Result<()> {
    let path = config.database_path();
    let store = SqliteSessionStore::open(&path)
        .with_context(|| format!("Failed to open session database: {}", path.display()))?;

    match command {
        HistoryCommands::List { json } => {
            let records = store.list()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_history_table(&records);
            }
        }
        HistoryCommands::Show { session_id, output } => {
            let id = parse_session_id(&session_id)?;
            let record = store
                .get(&id)?
                .with_context(|| format!("No persisted session {}", id))?;
            if output {
                std::io::stdout().write_all(&record.output_log)?;
            } else {
                println!("{}", serde_json::to_string_pretty(&record)?);
                println!("output: {} bytes", record.output_log.len());
            }
        }
        HistoryCommands::Delete { session_id } => {
            let id = parse_session_id(&session_id)?;
            if !store.delete(&id)? {
                anyhow::bail!("No persisted session {}", id);
            }
            println!("Deleted {}", id);
        }
    }

    Ok(())
}

fn parse_session_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid session ID: {}", raw))
}

/// Print history in a formatted ASCII table.
fn print_history_table(records: &[RecordSummary]) {
    if records.is_empty() {
        println!("No persisted sessions.");
        return;
    }

    let dir_width = records
        .iter()
        .map(|r| r.working_directory.display().to_string().len())
        .max()
        .unwrap_or(9)
        .clamp(9, 40);

    println!(
        "{:<36}  {:<12}  {:>5}  {:<dir_width$}  {:>10}  {:>12}",
        "ID",
        "STATE",
        "EXIT",
        "DIRECTORY",
        "OUTPUT",
        "UPDATED",
        dir_width = dir_width
    );
    println!("{}", "-".repeat(36 + 12 + 5 + dir_width + 10 + 12 + 10));

    for record in records {
        let exit = record
            .exit_code
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<12}  {:>5}  {:<dir_width$}  {:>10}  {:>12}",
            record.session_id,
            record.state,
            exit,
            truncate_str(&record.working_directory.display().to_string(), dir_width),
            format_bytes(record.output_bytes),
            format_relative_time(record.updated_at),
            dir_width = dir_width
        );
    }

    println!();
    println!("Total: {} session(s)", records.len());
}

/// Format a Unix timestamp in milliseconds as relative time (e.g., "5m ago").
fn format_relative_time(timestamp_ms: i64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let elapsed = (now - timestamp_ms).max(0) / 1000;

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;

    if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
