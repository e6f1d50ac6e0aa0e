//! Managed Process - server process spawning with stdio capture
//!
//! A launched notebook server is observed through [`ProcessHandle`]:
//! - Ordered stdout/stderr lines, buffered so late subscribers see the backlog
//! - A single-fire exit notification carrying the exit code
//!
//! The waiter only reads from a handle. Killing the process is up to its owner.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot, watch};
use serde::{Serialize, Deserialize};
use anyhow::Result;

/// Maximum number of output lines kept for late subscribers.
const DEFAULT_OUTPUT_BUFFER: usize = 10_000;

const BROADCAST_CAPACITY: usize = 2048;

// ─── Output Types ────────────────────────────────────────────

/// A single line of console output from the process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    /// Sequential ID, in arrival order across both streams
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    /// Where the line came from
    pub source: LogSource,
    /// Raw text content
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Messages from the launcher itself
    System,
}

#[derive(Debug, Clone)]
pub enum OutputEvent {
    Line(OutputLine),
    /// Every output stream has ended.
    Closed,
}

/// How the process ended. `code` is `None` when killed by a signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

// ─── Output Buffer ───────────────────────────────────────────

/// Ring buffer that stores recent output lines with sequential IDs.
struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    next_id: u64,
    max_size: usize,
    open_streams: usize,
}

impl OutputBuffer {
    fn with_capacity(max_size: usize, open_streams: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            next_id: 0,
            max_size,
            open_streams,
        }
    }

    /// Push a new line and return the created `OutputLine`.
    fn push(&mut self, source: LogSource, content: String) -> OutputLine {
        let line = OutputLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// Get the most recent `count` lines.
    fn get_recent(&self, count: usize) -> Vec<OutputLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }

    fn is_closed(&self) -> bool {
        self.open_streams == 0
    }
}

// ─── Process Handle ──────────────────────────────────────────

/// Read-only view of a running process.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Buffered backlog followed by live lines, in order.
    fn subscribe_output(&self) -> OutputSubscription;

    /// `None` while running, `Some` once the process has exited.
    fn subscribe_exit(&self) -> watch::Receiver<Option<ProcessExit>>;
}

/// Cursor over a process's output.
pub struct OutputSubscription {
    backlog: VecDeque<OutputLine>,
    closed: bool,
    live: broadcast::Receiver<OutputEvent>,
}

impl OutputSubscription {
    /// Next line, or `None` once every stream has ended. Cancel-safe.
    pub async fn next(&mut self) -> Option<OutputLine> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(line);
        }
        if self.closed {
            return None;
        }
        loop {
            match self.live.recv().await {
                Ok(OutputEvent::Line(line)) => return Some(line),
                Ok(OutputEvent::Closed) | Err(RecvError::Closed) => {
                    self.closed = true;
                    return None;
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Output subscriber lagged, {} lines skipped", skipped);
                }
            }
        }
    }

    /// Next line that is already available, without waiting.
    pub fn try_next(&mut self) -> Option<OutputLine> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(line);
        }
        if self.closed {
            return None;
        }
        loop {
            match self.live.try_recv() {
                Ok(OutputEvent::Line(line)) => return Some(line),
                Ok(OutputEvent::Closed) | Err(TryRecvError::Closed) => {
                    self.closed = true;
                    return None;
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
    }
}

/// Output buffer, live broadcast and exit watch shared by a process's
/// reader tasks and its observers. Cheap to clone.
#[derive(Clone)]
pub struct ProcessEvents {
    buffer: Arc<Mutex<OutputBuffer>>,
    broadcast: broadcast::Sender<OutputEvent>,
    exit_tx: Arc<watch::Sender<Option<ProcessExit>>>,
}

impl ProcessEvents {
    /// `streams` is how many producers must call [`close_stream`](Self::close_stream)
    /// before the output counts as ended.
    pub fn new(streams: usize) -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (exit_tx, _) = watch::channel(None);
        Self {
            buffer: Arc::new(Mutex::new(OutputBuffer::with_capacity(DEFAULT_OUTPUT_BUFFER, streams))),
            broadcast,
            exit_tx: Arc::new(exit_tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputBuffer> {
        // a poisoned buffer still holds valid lines
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a line. Lines after the output has closed are dropped.
    pub fn push_line(&self, source: LogSource, content: impl Into<String>) {
        let mut buf = self.lock();
        if buf.is_closed() && source != LogSource::System {
            return;
        }
        let line = buf.push(source, content.into());
        // sent under the lock so a subscriber sees each line exactly once
        let _ = self.broadcast.send(OutputEvent::Line(line));
    }

    /// One producer finished. The last one closes the output.
    pub fn close_stream(&self) {
        let mut buf = self.lock();
        if buf.open_streams == 0 {
            return;
        }
        buf.open_streams -= 1;
        if buf.is_closed() {
            let _ = self.broadcast.send(OutputEvent::Closed);
        }
    }

    /// Publish the exit. Only the first call has any effect.
    pub fn record_exit(&self, code: Option<i32>) {
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(ProcessExit { code });
            true
        });
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_tx.borrow()
    }

    /// Most recent `count` lines, oldest first.
    pub fn recent_output(&self, count: usize) -> Vec<OutputLine> {
        self.lock().get_recent(count)
    }
}

impl ProcessHandle for ProcessEvents {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn subscribe_output(&self) -> OutputSubscription {
        let buf = self.lock();
        OutputSubscription {
            backlog: buf.lines.iter().cloned().collect(),
            closed: buf.is_closed(),
            live: self.broadcast.subscribe(),
        }
    }

    fn subscribe_exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_tx.subscribe()
    }
}

// ─── Managed Process ─────────────────────────────────────────

/// A server process spawned by the launcher.
pub struct ManagedProcess {
    /// Process PID
    pub pid: u32,
    events: ProcessEvents,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ManagedProcess {
    /// Spawn `program` with piped stdout/stderr.
    ///
    /// # Arguments
    /// * `program` - Executable to run (e.g., a python interpreter)
    /// * `args` - Command-line arguments
    /// * `working_dir` - Working directory
    /// * `env_vars` - Extra environment variables
    pub async fn spawn(
        program: &Path,
        args: &[String],
        working_dir: &Path,
        env_vars: Vec<(String, String)>,
    ) -> Result<Self> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        for (key, value) in &env_vars {
            cmd.env(key, value);
        }

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn process '{}': {}", program.display(), e))?;

        let pid = child.id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned process"))?;

        let events = ProcessEvents::new(2);
        events.push_line(LogSource::System, format!("Process started with PID {}", pid));

        // ── stdout / stderr readers ──────────────────────────
        match child.stdout.take() {
            Some(stdout) => spawn_reader(stdout, LogSource::Stdout, events.clone()),
            None => events.close_stream(),
        }
        match child.stderr.take() {
            Some(stderr) => spawn_reader(stderr, LogSource::Stderr, events.clone()),
            None => events.close_stream(),
        }

        // ── process waiter ───────────────────────────────────
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        {
            let events = events.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    Ok(()) = kill_rx => {
                        if let Err(e) = child.kill().await {
                            tracing::warn!("Failed to kill PID {}: {}", pid, e);
                        }
                        child.wait().await
                    }
                };
                let code = match status {
                    Ok(status) => {
                        events.push_line(LogSource::System, format!("Process exited with {}", status));
                        status.code()
                    }
                    Err(e) => {
                        events.push_line(LogSource::System, format!("Failed to wait for process: {}", e));
                        None
                    }
                };
                tracing::info!("Process {} exited (code: {:?})", pid, code);
                events.record_exit(code);
            });
        }

        Ok(Self {
            pid,
            events,
            kill_tx: Mutex::new(Some(kill_tx)),
        })
    }

    /// Launch `python -m jupyter notebook` serving `notebook_dir`.
    pub async fn spawn_notebook(
        python: &Path,
        notebook_dir: &Path,
        extra_args: &[String],
    ) -> Result<Self> {
        // cwd and --notebook-dir must name the same directory
        let notebook_dir = crate::utils::absolute_path(notebook_dir)?;
        let mut args = notebook_args(&notebook_dir);
        args.extend(extra_args.iter().cloned());
        tracing::info!("Launching notebook server in {}", notebook_dir.display());
        Self::spawn(
            python,
            &args,
            &notebook_dir,
            vec![("PYTHONIOENCODING".to_string(), "utf-8".to_string())],
        )
        .await
    }

    /// Ask the process to die. Later calls do nothing.
    pub fn kill(&self) {
        let sender = self.kill_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.events.exit().is_none()
    }

    /// Wait until the process exits.
    pub async fn wait_for_exit(&self) -> Option<ProcessExit> {
        let mut rx = self.events.subscribe_exit();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit
    }

    /// Most recent `count` lines of output.
    pub fn recent_output(&self, count: usize) -> Vec<OutputLine> {
        self.events.recent_output(count)
    }
}

impl ProcessHandle for ManagedProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn subscribe_output(&self) -> OutputSubscription {
        self.events.subscribe_output()
    }

    fn subscribe_exit(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.events.subscribe_exit()
    }
}

// ─── Helpers ─────────────────────────────────────────────────

fn spawn_reader<R>(pipe: R, source: LogSource, events: ProcessEvents)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(pipe);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            events.push_line(source, line);
        }
        events.close_stream();
    });
}

fn notebook_args(notebook_dir: &Path) -> Vec<String> {
    vec![
        "-m".to_string(),
        "jupyter".to_string(),
        "notebook".to_string(),
        "--no-browser".to_string(),
        format!("--notebook-dir={}", notebook_dir.display()),
    ]
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────
