//! PTY process handle.
//!
//! This module wraps one pseudo-terminal and the child process attached to
//! it. Output is read on a dedicated OS thread and handed to async code as
//! an [`OutputStream`]; everything else (write, resize, signal, try_wait) is
//! short and non-blocking.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::{SessionId, TerminalSize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::state::TransitionError;

/// Bytes requested per read from the PTY master.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Chunks queued between the reader thread and the session read loop.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur while creating a PTY process.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The working directory does not exist or is not a directory.
    #[error("invalid working directory: {}", .0.display())]
    InvalidWorkingDirectory(PathBuf),

    /// The shell could not be resolved to an executable.
    #[error("shell not found: {0}")]
    ShellNotFound(String),

    /// Opening the PTY pair or spawning the child failed.
    #[error("failed to spawn PTY: {0}")]
    Pty(String),
}

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Creating the PTY process failed.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to deliver a signal to the process.
    #[error("failed to signal process: {0}")]
    SignalFailed(String),

    /// The command is not valid in the session's current state.
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    /// Only sessions in a terminal state can be closed.
    #[error("session is still live: {0}")]
    NotTerminal(SessionId),

    /// The configured session limit has been reached.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Signals a session can deliver to its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Graceful termination (SIGTERM).
    Terminate,
    /// Forced termination (SIGKILL).
    Kill,
    /// Stop the process (SIGSTOP).
    Stop,
    /// Continue a stopped process (SIGCONT).
    Continue,
}

impl SignalKind {
    fn as_signal(self) -> Signal {
        match self {
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
            SignalKind::Stop => Signal::SIGSTOP,
            SignalKind::Continue => Signal::SIGCONT,
        }
    }
}

/// Parameters for [`PtyProcess::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell name or path; resolved through `PATH` when relative.
    pub shell: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Working directory of the child.
    pub working_directory: PathBuf,
    /// Environment overrides applied on top of the terminal defaults.
    pub environment: BTreeMap<String, String>,
    /// Initial terminal size.
    pub size: TerminalSize,
}

/// Stream of output chunks produced by the reader thread.
///
/// Ends when the process exits or the PTY is closed. A read error is
/// delivered once as `Err` and ends the stream.
pub struct OutputStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl OutputStream {
    /// Waits for the next chunk. Returns `None` at end of output.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.rx.recv().await
    }
}

/// One pseudo-terminal and the child process attached to it.
pub struct PtyProcess {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    output: Option<OutputStream>,
    pid: Option<u32>,
    size: TerminalSize,
    exit_code: Option<i32>,
}

impl PtyProcess {
    /// Spawns a child process attached to a new PTY.
    ///
    /// The child inherits the daemon's environment with `TERM` and
    /// `COLORTERM` set for a 256-color terminal; `options.environment`
    /// overrides any of them.
    pub fn spawn(options: SpawnOptions) -> Result<Self, SpawnError> {
        if !options.working_directory.is_dir() {
            return Err(SpawnError::InvalidWorkingDirectory(
                options.working_directory,
            ));
        }

        let shell = resolve_shell(&options.shell)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(to_pty_size(options.size))
            .map_err(|e| SpawnError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell);
        cmd.args(&options.args);
        cmd.cwd(&options.working_directory);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &options.environment {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::Pty(e.to_string()))?;
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError::Pty(e.to_string()))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || read_until_closed(reader, tx))
            .map_err(|e| SpawnError::Pty(e.to_string()))?;

        tracing::debug!(
            shell = %shell.display(),
            pid = ?pid,
            rows = options.size.rows,
            cols = options.size.cols,
            "Spawned PTY process"
        );

        Ok(Self {
            master: Some(pair.master),
            writer: Some(writer),
            child: Some(child),
            output: Some(OutputStream { rx }),
            pid,
            size: options.size,
            exit_code: None,
        })
    }

    /// Takes the output stream. Returns `None` after the first call.
    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    /// Returns the OS process id of the child, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Returns whether the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.master.is_none()
    }

    /// Writes data to the process's input.
    ///
    /// Returns the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        if let Some(code) = self.try_wait()? {
            return Err(SessionError::WriteFailed(format!(
                "process exited with code {}",
                code
            )));
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SessionError::WriteFailed("PTY is closed".to_string()))?;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;

        Ok(data.len())
    }

    /// Applies new terminal dimensions. Identical dimensions are a no-op.
    pub fn resize(&mut self, size: TerminalSize) -> Result<(), SessionError> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| SessionError::ResizeFailed("PTY is closed".to_string()))?;

        if size == self.size {
            return Ok(());
        }

        master
            .resize(to_pty_size(size))
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        self.size = size;

        tracing::debug!(rows = size.rows, cols = size.cols, "Resized PTY");
        Ok(())
    }

    /// Delivers `kind` to the child process.
    pub fn signal(&mut self, kind: SignalKind) -> Result<(), SessionError> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| SessionError::SignalFailed("PTY is closed".to_string()))?;

        match self.pid {
            Some(pid) => send_signal(pid, kind),
            None if kind == SignalKind::Kill => child
                .kill()
                .map_err(|e| SessionError::SignalFailed(e.to_string())),
            None => Err(SessionError::SignalFailed(
                "process id unavailable".to_string(),
            )),
        }
    }

    /// Non-blocking poll: `Some(code)` once the child has exited.
    pub fn try_wait(&mut self) -> Result<Option<i32>, SessionError> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };

        if let Some(status) = child.try_wait()? {
            self.exit_code = Some(status.exit_code() as i32);
        }
        Ok(self.exit_code)
    }

    /// Releases the PTY and the process. Safe to call more than once.
    ///
    /// A still-running child is killed and reaped in the background.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }

        let still_running = matches!(self.try_wait(), Ok(None));

        self.writer = None;
        self.master = None;
        self.output = None;

        if let Some(mut child) = self.child.take() {
            if still_running {
                if let Some(pid) = self.pid {
                    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                } else {
                    let _ = child.kill();
                }
                let _ = std::thread::Builder::new()
                    .name("pty-reaper".to_string())
                    .spawn(move || {
                        let _ = child.wait();
                    });
            }
        }

        tracing::debug!(pid = ?self.pid, "Closed PTY process");
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.close();
    }
}

/// Delivers `kind` to a recorded process that has no PTY handle.
///
/// The signal is only sent when `pid` still names the process that was
/// started at `started_at`; a recycled pid is refused.
pub fn signal_pid(pid: u32, started_at: Option<u64>, kind: SignalKind) -> Result<(), SessionError> {
    if !process_matches(pid, started_at) {
        return Err(SessionError::SignalFailed(format!(
            "process {pid} is no longer the recorded process"
        )));
    }
    send_signal(pid, kind)
}

fn send_signal(pid: u32, kind: SignalKind) -> Result<(), SessionError> {
    signal::kill(Pid::from_raw(pid as i32), kind.as_signal())
        .map_err(|e| SessionError::SignalFailed(e.to_string()))
}

/// Returns whether a process with `pid` exists (signal 0 probe).
pub fn pid_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Kernel start time of `pid` in clock ticks since boot.
///
/// Read from field 22 of `/proc/<pid>/stat`. `None` when the process is
/// gone or the platform has no procfs.
pub fn process_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_start_time(&stat)
}

fn parse_start_time(stat: &str) -> Option<u64> {
    // The command name may contain spaces and parentheses; fields resume
    // after the last ')', starting with field 3 (state).
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Returns whether `pid` is alive and is the same process that was
/// recorded with `started_at`.
///
/// A missing start time never matches: without it a reused pid cannot be
/// told apart from the original process.
pub fn process_matches(pid: u32, started_at: Option<u64>) -> bool {
    match started_at {
        Some(expected) => pid_alive(pid) && process_start_time(pid) == Some(expected),
        None => false,
    }
}

fn to_pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: size.pixel_width,
        pixel_height: size.pixel_height,
    }
}

/// Resolves a shell name or path to an executable.
fn resolve_shell(shell: &str) -> Result<PathBuf, SpawnError> {
    let path = Path::new(shell);
    if path.is_absolute() {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(SpawnError::ShellNotFound(shell.to_string()));
    }

    which::which(shell).map_err(|_| SpawnError::ShellNotFound(shell.to_string()))
}

/// Reader thread body: forwards chunks until EOF, error, or the receiver goes away.
fn read_until_closed(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<io::Result<Bytes>>) {
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx
                    .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n])))
                    .is_err()
                {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
}
