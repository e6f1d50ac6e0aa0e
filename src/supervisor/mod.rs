//! Connection Waiter: turns a freshly launched notebook server process into
//! a live [`Connection`].
//!
//! The wait races four things and the first to settle wins:
//! - the listening announcement on stdout/stderr, followed by a registry lookup
//! - the launch timeout, started on entry
//! - the process exiting (or its output ending)
//! - the caller's cancellation token
//!
//! Losing subscriptions and timers are dropped as soon as the wait settles.

pub mod enumerator;
pub mod error;
pub mod listening;
pub mod managed_process;
pub mod state_machine;

use std::path::Path;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::utils::absolute_path;

use enumerator::{ServerDescriptor, ServerEnumerator};
use error::LaunchError;
use listening::{ListeningAnnouncement, ListeningPattern};
use managed_process::{LogSource, ManagedProcess, OutputSubscription, ProcessExit, ProcessHandle};
use state_machine::{StateMachine, WaitState};

/// 기본 서버 기동 타임아웃
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Output ended; how long to wait for the exit code before giving up on it.
pub const DEFAULT_STREAM_END_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WaiterConfig {
    pub launch_timeout: Duration,
    pub stream_end_grace: Duration,
    pub listening_pattern: ListeningPattern,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            stream_end_grace: DEFAULT_STREAM_END_GRACE,
            listening_pattern: ListeningPattern::default(),
        }
    }
}

/// A resolved session with a running server.
///
/// The disconnect notification fires at most once, when the server process
/// terminates. Dropping the connection releases the exit subscription.
pub struct Connection {
    pub id: Uuid,
    pub base_url: String,
    pub hostname: String,
    pub token: String,
    /// `true` when the server was launched by this process.
    pub local_launch: bool,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    disconnected: Option<oneshot::Receiver<ProcessExit>>,
    _exit_watch: DropGuard,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("base_url", &self.base_url)
            .field("hostname", &self.hostname)
            .field("local_launch", &self.local_launch)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn local(descriptor: ServerDescriptor, mut exit: watch::Receiver<Option<ProcessExit>>) -> Self {
        let (tx, rx) = oneshot::channel();
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let url = descriptor.url.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = stopped.cancelled() => {}
                exit = process_exit(&mut exit) => {
                    tracing::info!("Server at {} went away (exit code: {:?})", url, exit.code);
                    let _ = tx.send(exit);
                }
            }
        });

        Self {
            id: Uuid::new_v4(),
            base_url: descriptor.url,
            hostname: descriptor.hostname,
            token: descriptor.token,
            local_launch: true,
            pid: descriptor.pid,
            port: descriptor.port,
            disconnected: Some(rx),
            _exit_watch: stop.drop_guard(),
        }
    }

    /// Resolves with the exit once the server process terminates. Every call
    /// after that (or after the watch was released) returns `None` at once.
    /// Cancel-safe.
    pub async fn disconnected(&mut self) -> Option<ProcessExit> {
        let rx = self.disconnected.as_mut()?;
        let result = rx.await;
        self.disconnected = None;
        result.ok()
    }

    /// Release the process-exit subscription.
    pub fn dispose(self) {}
}

pub struct ConnectionWaiter {
    config: WaiterConfig,
}

impl ConnectionWaiter {
    pub fn new(config: WaiterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WaiterConfig {
        &self.config
    }

    /// Wait for `process` to announce itself, then pick the server that
    /// serves exactly `target_dir` from `enumerator`.
    pub async fn wait_for_connection<P, E>(
        &self,
        process: &P,
        target_dir: &Path,
        enumerator: &E,
        cancel: Option<&CancellationToken>,
    ) -> Result<Connection, LaunchError>
    where
        P: ProcessHandle + ?Sized,
        E: ServerEnumerator + ?Sized,
    {
        let cancel = cancel.cloned().unwrap_or_default();
        let timeout = self.config.launch_timeout;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut output = process.subscribe_output();
        let mut exit = process.subscribe_exit();
        let mut machine = StateMachine::new();
        let mut last_output: Option<String> = None;
        let mut output_ended: Option<Instant> = None;

        tracing::info!(
            "Waiting up to {:?} for server (pid {:?}) in {}",
            timeout,
            process.pid(),
            target_dir.display()
        );

        // ── Listening ────────────────────────────────────────
        let announcement: ListeningAnnouncement = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(settle(&mut machine, LaunchError::Cancelled));
                }
                exit = process_exit(&mut exit) => {
                    let err = LaunchError::ProcessCrashed {
                        exit_code: exit.code,
                        last_output: drain_last_output(&mut output, last_output),
                    };
                    return Err(settle(&mut machine, err));
                }
                _ = &mut deadline => {
                    return Err(settle(&mut machine, LaunchError::LaunchTimeout { timeout }));
                }
                _ = tokio::time::sleep_until(output_ended.unwrap_or_else(Instant::now)), if output_ended.is_some() => {
                    // output is gone and no exit code showed up in time
                    let err = LaunchError::ProcessCrashed {
                        exit_code: exit.borrow().and_then(|e| e.code),
                        last_output,
                    };
                    return Err(settle(&mut machine, err));
                }
                line = output.next(), if output_ended.is_none() => match line {
                    Some(line) if line.source == LogSource::System => {}
                    Some(line) => {
                        if let Some(found) = self.config.listening_pattern.find(&line.content) {
                            break found;
                        }
                        tracing::trace!("server output: {}", line.content);
                        last_output = Some(line.content);
                    }
                    None => {
                        tracing::debug!("Server output ended before it announced itself");
                        output_ended = Some(Instant::now() + self.config.stream_end_grace);
                    }
                },
            }
        };

        // ── Resolving ────────────────────────────────────────
        machine.transition(WaitState::Resolving)?;
        tracing::info!(
            "Server announced {}:{}, looking it up",
            announcement.host,
            announcement.port
        );

        let listed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(settle(&mut machine, LaunchError::Cancelled));
            }
            exit = process_exit(&mut exit) => {
                let err = LaunchError::ProcessCrashed { exit_code: exit.code, last_output: Some(announcement.line) };
                return Err(settle(&mut machine, err));
            }
            _ = &mut deadline => {
                return Err(settle(&mut machine, LaunchError::LaunchTimeout { timeout }));
            }
            listed = enumerator.list_servers(&cancel) => listed,
        };

        let servers = match listed {
            Ok(servers) => servers.unwrap_or_default(),
            Err(_) if cancel.is_cancelled() => {
                return Err(settle(&mut machine, LaunchError::Cancelled));
            }
            Err(e) => {
                return Err(settle(&mut machine, LaunchError::EnumerationFailed(format!("{:#}", e))));
            }
        };

        let advertised = servers.len();
        let Some(descriptor) = servers.into_iter().find(|s| s.serves(target_dir)) else {
            let err = LaunchError::NoMatchingServer {
                directory: target_dir.to_path_buf(),
                announcement: announcement.line,
                advertised,
            };
            return Err(settle(&mut machine, err));
        };

        // ── Connected ────────────────────────────────────────
        machine.transition(WaitState::Connected)?;
        tracing::info!("Connected to {} (pid {:?})", descriptor.url, descriptor.pid);
        Ok(Connection::local(descriptor, exit))
    }

    /// Spawn `python -m jupyter notebook` for `notebook_dir` and wait for it.
    /// A relative `notebook_dir` is resolved against the current directory.
    /// The process is killed when the wait fails.
    pub async fn launch_notebook<E>(
        &self,
        python: &Path,
        notebook_dir: &Path,
        extra_args: &[String],
        enumerator: &E,
        cancel: Option<&CancellationToken>,
    ) -> Result<(ManagedProcess, Connection), LaunchError>
    where
        E: ServerEnumerator + ?Sized,
    {
        let notebook_dir = absolute_path(notebook_dir).map_err(|e| {
            LaunchError::SpawnFailed(format!("cannot resolve {}: {}", notebook_dir.display(), e))
        })?;
        let process = ManagedProcess::spawn_notebook(python, &notebook_dir, extra_args)
            .await
            .map_err(|e| LaunchError::SpawnFailed(format!("{:#}", e)))?;

        match self.wait_for_connection(&process, &notebook_dir, enumerator, cancel).await {
            Ok(connection) => Ok((process, connection)),
            Err(e) => {
                tracing::warn!("Launch failed ({}), stopping PID {}", e.error_code(), process.pid);
                process.kill();
                Err(e)
            }
        }
    }
}

impl Default for ConnectionWaiter {
    fn default() -> Self {
        Self::new(WaiterConfig::default())
    }
}

/// Record the state `err` settles the wait in; the state machine only
/// refuses if the wait already settled, which would be a bug here.
fn settle(machine: &mut StateMachine, err: LaunchError) -> LaunchError {
    let Some(to) = err.settled_state() else {
        return err;
    };
    match machine.transition(to) {
        Ok(()) => {
            tracing::warn!("Server wait ended ({:?}): {}", to, err);
            err
        }
        Err(e) => e.into(),
    }
}

/// Last server line among the output that is already buffered.
fn drain_last_output(output: &mut OutputSubscription, mut last: Option<String>) -> Option<String> {
    while let Some(line) = output.try_next() {
        if line.source != LogSource::System {
            last = Some(line.content);
        }
    }
    last
}

/// Resolves with the exit once it is published. Never resolves if the
/// publisher goes away without one.
async fn process_exit(rx: &mut watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    loop {
        if let Some(exit) = *rx.borrow_and_update() {
            return exit;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use managed_process::ProcessEvents;

    #[test]
    fn test_lookup_failures_settle_the_wait() {
        for err in [
            LaunchError::EnumerationFailed("registry unreadable".into()),
            LaunchError::NoMatchingServer {
                directory: "/work".into(),
                announcement: "http://localhost:8888/".into(),
                advertised: 0,
            },
        ] {
            let mut machine = StateMachine::new();
            machine.transition(WaitState::Resolving).unwrap();
            let err = settle(&mut machine, err);
            assert_eq!(machine.state, WaitState::Unresolved);
            assert_ne!(err.error_code(), "INTERNAL_ERROR");
        }
    }

    #[test]
    fn test_settle_twice_is_internal_error() {
        let mut machine = StateMachine::new();
        settle(&mut machine, LaunchError::Cancelled);
        assert_eq!(machine.state, WaitState::Cancelled);
        let err = settle(&mut machine, LaunchError::LaunchTimeout { timeout: Duration::from_secs(1) });
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_process_exit_sees_existing_value() {
        let events = ProcessEvents::new(1);
        events.record_exit(Some(4));
        let mut rx = events.subscribe_exit();
        assert_eq!(process_exit(&mut rx).await.code, Some(4));
    }

    #[tokio::test]
    async fn test_process_exit_pending_when_publisher_dropped() {
        let (tx, mut rx) = watch::channel::<Option<ProcessExit>>(None);
        drop(tx);
        let waited = tokio::time::timeout(Duration::from_millis(20), process_exit(&mut rx)).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_connection_disposed_without_exit() {
        let events = ProcessEvents::new(1);
        let descriptor = ServerDescriptor {
            url: "http://localhost:8888/".into(),
            base_url: "/".into(),
            hostname: "localhost".into(),
            notebook_dir: "/work".into(),
            secure: false,
            token: "t".into(),
            pid: Some(42),
            port: Some(8888),
        };
        let mut conn = Connection::local(descriptor, events.subscribe_exit());
        assert!(conn.local_launch);
        assert_eq!(conn.port, Some(8888));

        // no exit yet: nothing fires
        let pending = tokio::time::timeout(Duration::from_millis(20), conn.disconnected()).await;
        assert!(pending.is_err());

        events.record_exit(Some(0));
        assert_eq!(conn.disconnected().await, Some(ProcessExit { code: Some(0) }));
        assert_eq!(conn.disconnected().await, None);
        conn.dispose();
    }
}
