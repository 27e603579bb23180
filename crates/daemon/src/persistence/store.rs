//! Durable session records backed by SQLite.
//!
//! One table, one row per session. Every write is a single
//! `INSERT ... ON CONFLICT DO UPDATE` statement, so readers observe either
//! the previous record or the new one, never a mix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use protocol::{SessionId, SessionState};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Environment map could not be encoded or decoded.
    #[error("invalid environment encoding: {0}")]
    Environment(#[from] serde_json::Error),

    /// A stored row holds a value the daemon does not understand.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Path error.
    #[error("invalid database path: {0}")]
    InvalidPath(String),

    /// The blocking storage task did not complete.
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable counterpart of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub updated_at: i64,
    pub state: SessionState,
    pub exit_code: Option<i32>,
    pub working_directory: PathBuf,
    pub environment: BTreeMap<String, String>,
    pub process_pid: Option<u32>,
    /// Kernel start time of `process_pid`, in clock ticks since boot.
    pub process_started_at: Option<u64>,
    /// Buffer offset just past the last byte of `output_log`.
    pub output_offset: u64,
    #[serde(skip)]
    pub output_log: Vec<u8>,
}

/// Record metadata without the output log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub session_id: SessionId,
    pub state: SessionState,
    pub exit_code: Option<i32>,
    pub created_at: i64,
    pub updated_at: i64,
    pub working_directory: PathBuf,
    pub output_bytes: u64,
}

/// Durable storage for session records.
///
/// Implementations are synchronous; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait SessionStore: Send + Sync {
    /// Inserts or replaces the record for `record.session_id` atomically.
    fn upsert(&self, record: &SessionRecord) -> StorageResult<()>;

    /// Returns every record last flushed as `Running` or `Suspended`.
    fn load_restorable(&self) -> StorageResult<Vec<SessionRecord>>;

    /// Returns one record.
    fn get(&self, id: &SessionId) -> StorageResult<Option<SessionRecord>>;

    /// Lists every record, most recently updated first.
    fn list(&self) -> StorageResult<Vec<RecordSummary>>;

    /// Deletes one record. Returns whether it existed.
    fn delete(&self, id: &SessionId) -> StorageResult<bool>;
}

/// Current schema version.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const RECORD_COLUMNS: &str = "session_id, created_at, updated_at, status, exit_code, \
     working_directory, environment_vars, process_pid, output_log, process_started_at, \
     output_offset";

/// SQLite implementation of [`SessionStore`].
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open or create a database at the given path.
    ///
    /// Pending migrations are applied on open.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::InvalidPath(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        Self::with_connection(Connection::open(path)?)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> StorageResult<Self> {
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> StorageResult<i32> {
        let conn = self.lock()?;
        let version = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Task("database connection lock poisoned".to_string()))
    }
}

/// Run all pending migrations.
fn run_migrations(conn: &mut Connection) -> StorageResult<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration to version 1: Initial schema.
fn migrate_v1(conn: &mut Connection) -> StorageResult<()> {
    let tx = conn.transaction()?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS terminal_sessions (
            session_id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            exit_code INTEGER,
            working_directory TEXT NOT NULL,
            environment_vars TEXT NOT NULL DEFAULT '{}',
            process_pid INTEGER,
            output_log BLOB NOT NULL DEFAULT x''
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE INDEX IF NOT EXISTS idx_terminal_sessions_status
        ON terminal_sessions(status)
        "#,
        [],
    )?;

    tx.execute("PRAGMA user_version = 1", [])?;

    tx.commit()?;
    Ok(())
}

/// Migration to version 2: process identity and output offset.
fn migrate_v2(conn: &mut Connection) -> StorageResult<()> {
    let tx = conn.transaction()?;

    tx.execute(
        "ALTER TABLE terminal_sessions ADD COLUMN process_started_at INTEGER",
        [],
    )?;
    tx.execute(
        "ALTER TABLE terminal_sessions ADD COLUMN output_offset INTEGER NOT NULL DEFAULT 0",
        [],
    )?;

    tx.execute("PRAGMA user_version = 2", [])?;

    tx.commit()?;
    Ok(())
}

fn parse_id(raw: &str) -> StorageResult<SessionId> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Corrupt(format!("session id {}: {}", raw, e)))
}

fn parse_state(raw: &str) -> StorageResult<SessionState> {
    raw.parse().map_err(StorageError::Corrupt)
}

/// Raw column values; converted outside the rusqlite row closure so
/// domain errors keep their own variants.
struct RawRecord {
    session_id: String,
    created_at: i64,
    updated_at: i64,
    status: String,
    exit_code: Option<i32>,
    working_directory: String,
    environment_vars: String,
    process_pid: Option<u32>,
    output_log: Vec<u8>,
    process_started_at: Option<i64>,
    output_offset: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            created_at: row.get(1)?,
            updated_at: row.get(2)?,
            status: row.get(3)?,
            exit_code: row.get(4)?,
            working_directory: row.get(5)?,
            environment_vars: row.get(6)?,
            process_pid: row.get(7)?,
            output_log: row.get(8)?,
            process_started_at: row.get(9)?,
            output_offset: row.get(10)?,
        })
    }

    fn into_record(self) -> StorageResult<SessionRecord> {
        Ok(SessionRecord {
            session_id: parse_id(&self.session_id)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            state: parse_state(&self.status)?,
            exit_code: self.exit_code,
            working_directory: PathBuf::from(self.working_directory),
            environment: serde_json::from_str(&self.environment_vars)?,
            process_pid: self.process_pid,
            process_started_at: self.process_started_at.map(|ticks| ticks.max(0) as u64),
            output_offset: self.output_offset.max(0) as u64,
            output_log: self.output_log,
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn upsert(&self, record: &SessionRecord) -> StorageResult<()> {
        let environment = serde_json::to_string(&record.environment)?;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO terminal_sessions (
                session_id, created_at, updated_at, status, exit_code,
                working_directory, environment_vars, process_pid, output_log,
                process_started_at, output_offset
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(session_id) DO UPDATE SET
                updated_at = excluded.updated_at,
                status = excluded.status,
                exit_code = excluded.exit_code,
                process_pid = excluded.process_pid,
                output_log = excluded.output_log,
                process_started_at = excluded.process_started_at,
                output_offset = excluded.output_offset
            "#,
            params![
                record.session_id.to_string(),
                record.created_at,
                record.updated_at,
                record.state.as_str(),
                record.exit_code,
                record.working_directory.to_string_lossy().into_owned(),
                environment,
                record.process_pid,
                record.output_log,
                record.process_started_at.map(|ticks| ticks as i64),
                record.output_offset as i64,
            ],
        )?;
        Ok(())
    }

    fn load_restorable(&self) -> StorageResult<Vec<SessionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM terminal_sessions WHERE status IN (?1, ?2) ORDER BY created_at",
            RECORD_COLUMNS
        ))?;

        let rows = stmt
            .query_map(
                params![
                    SessionState::Running.as_str(),
                    SessionState::Suspended.as_str()
                ],
                RawRecord::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawRecord::into_record).collect()
    }

    fn get(&self, id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM terminal_sessions WHERE session_id = ?1",
                    RECORD_COLUMNS
                ),
                params![id.to_string()],
                RawRecord::from_row,
            )
            .optional()?;

        raw.map(RawRecord::into_record).transpose()
    }

    fn list(&self) -> StorageResult<Vec<RecordSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, status, exit_code, created_at, updated_at,
                   working_directory, length(output_log)
            FROM terminal_sessions
            ORDER BY updated_at DESC
            "#,
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i32>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(id, status, exit_code, created_at, updated_at, cwd, output_bytes)| {
                    Ok(RecordSummary {
                        session_id: parse_id(&id)?,
                        state: parse_state(&status)?,
                        exit_code,
                        created_at,
                        updated_at,
                        working_directory: PathBuf::from(cwd),
                        output_bytes: output_bytes.max(0) as u64,
                    })
                },
            )
            .collect()
    }

    fn delete(&self, id: &SessionId) -> StorageResult<bool> {
        let conn = self.lock()?;
        let rows_affected = conn.execute(
            "DELETE FROM terminal_sessions WHERE session_id = ?1",
            params![id.to_string()],
        )?;
        Ok(rows_affected > 0)
    }
}
