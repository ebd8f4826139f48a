//! Server process host.
//!
//! [`ServerTransport`] is the trait seam between the proxy engine and the
//! mechanism that produces a running server. Production code uses
//! [`ProcessTransport`], which spawns the configured command with piped
//! stdio (container label injection included). [`MockTransport`] is an
//! in-memory test double that supports repeated spawns, so restart cycles
//! can be driven without real processes.
//!
//! The transport hands back raw byte streams plus a [`ProcessControl`];
//! the engine owns line framing, routing, and the kill escalation policy.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::config::ProxyConfig;
use crate::labels;

#[cfg(unix)]
const SIGNAL_GRACEFUL: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGNAL_FORCE: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGNAL_GRACEFUL: i32 = 15;
#[cfg(not(unix))]
const SIGNAL_FORCE: i32 = 9;

/// Error spawning the server process.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The executable could not be started (missing, not executable, …).
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

/// How a server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// A zero exit code with no terminating signal.
    pub fn clean(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Out-of-band control over a spawned server.
///
/// Both operations are non-blocking; the exit itself is observed through
/// [`ChildIo::exit_rx`].
pub trait ProcessControl: Send {
    /// Ask the server to stop (SIGTERM). Idempotent; returns `false` when
    /// the process is already gone.
    fn signal_graceful(&mut self) -> bool;

    /// Kill the server outright (SIGKILL).
    fn force_kill(&mut self);
}

/// Raw I/O produced by a successful [`ServerTransport::spawn`] call.
///
/// `stdin`/`stdout`/`stderr` are boxed trait objects so non-process
/// transports can provide in-memory implementations. `exit_rx` resolves
/// exactly once, when the server ends.
pub struct ChildIo {
    pub pid: Option<u32>,
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub control: Box<dyn ProcessControl>,
    pub exit_rx: oneshot::Receiver<ExitOutcome>,
}

/// Abstracts how the proxy obtains a running server.
///
/// `spawn` may be called repeatedly; each call produces a fresh server
/// generation.
#[async_trait]
pub trait ServerTransport: Send + Sync + fmt::Debug {
    /// Start a new server and return its raw I/O handles.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`] when the underlying process (or equivalent)
    /// cannot be started.
    async fn spawn(&self) -> Result<ChildIo, SpawnError>;
}

// ─── ProcessTransport ────────────────────────────────────────────────────────

/// Spawns the configured command as a real child process with piped stdio.
#[derive(Debug)]
pub struct ProcessTransport {
    config: ProxyConfig,
}

impl ProcessTransport {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ServerTransport for ProcessTransport {
    async fn spawn(&self) -> Result<ChildIo, SpawnError> {
        let started_ms = chrono::Utc::now().timestamp_millis();
        let args = labels::inject_session_labels(
            &self.config.command,
            &self.config.args,
            &self.config.session_id,
            std::process::id(),
            started_ms,
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args)
            .envs(&self.config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            command: self.config.command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().expect("child stdin is piped");
        let stdout = child.stdout.take().expect("child stdout is piped");
        let stderr = child.stderr.take();
        let pid = child.id();

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => exit_outcome(status),
                Err(e) => {
                    tracing::error!("error waiting for server process: {e}");
                    ExitOutcome {
                        code: None,
                        signal: None,
                    }
                }
            };
            let _ = exit_tx.send(outcome);
        });

        Ok(ChildIo {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>),
            control: Box::new(PidControl { pid }),
            exit_rx,
        })
    }
}

fn exit_outcome(status: std::process::ExitStatus) -> ExitOutcome {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;
    ExitOutcome {
        code: status.code(),
        signal,
    }
}

/// Signals a process by pid. The child itself lives in the wait task, so
/// delivery does not contend with `wait()`.
struct PidControl {
    pid: Option<u32>,
}

impl ProcessControl for PidControl {
    fn signal_graceful(&mut self) -> bool {
        send_signal(self.pid, SIGNAL_GRACEFUL)
    }

    fn force_kill(&mut self) {
        send_signal(self.pid, SIGNAL_FORCE);
    }
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, signal: i32) -> bool {
    match pid {
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, signal) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: Option<u32>, _signal: i32) -> bool {
    // Non-unix platforms rely on kill_on_drop when the handle is released.
    false
}

// ─── MockTransport ───────────────────────────────────────────────────────────

/// Handle to one spawned mock server generation.
///
/// Tests inject "server stdout" lines via [`Self::stdout_tx`], observe the
/// frames the proxy wrote to "server stdin" on [`Self::stdin_rx`], and can
/// end the generation via [`Self::exit_tx`].
pub struct MockChild {
    /// Inject pre-scripted JSON-RPC lines as server stdout.
    pub stdout_tx: mpsc::UnboundedSender<String>,
    /// Observe the JSON-RPC lines the proxy wrote to server stdin.
    pub stdin_rx: mpsc::UnboundedReceiver<String>,
    /// End this server generation with the given outcome.
    pub exit_tx: mpsc::UnboundedSender<ExitOutcome>,
    /// Set once the proxy asked this generation to stop gracefully.
    pub graceful_signaled: Arc<AtomicBool>,
}

/// Channel-based companion handle for [`MockTransport`].
pub struct MockTransportHandle {
    /// Yields a [`MockChild`] for every `spawn` call, in order.
    pub spawned_rx: mpsc::UnboundedReceiver<MockChild>,
    /// Number of upcoming `spawn` calls that should fail.
    pub fail_spawns: Arc<AtomicUsize>,
    /// When set, a graceful signal does not end the generation; only
    /// `force_kill` does. Models a server that ignores SIGTERM.
    pub ignore_graceful: Arc<AtomicBool>,
}

/// In-memory test double; no process is spawned.
///
/// Every `spawn` call creates a fresh in-memory generation and announces it
/// on the handle, so restart cycles are fully scriptable. By default a
/// graceful signal ends the generation immediately, like a well-behaved
/// server honoring SIGTERM.
#[derive(Debug)]
pub struct MockTransport {
    spawned_tx: mpsc::UnboundedSender<MockChild>,
    fail_spawns: Arc<AtomicUsize>,
    ignore_graceful: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create the transport and its companion handle.
    pub fn new_with_handle() -> (Self, MockTransportHandle) {
        let (spawned_tx, spawned_rx) = mpsc::unbounded_channel();
        let fail_spawns = Arc::new(AtomicUsize::new(0));
        let ignore_graceful = Arc::new(AtomicBool::new(false));
        (
            Self {
                spawned_tx,
                fail_spawns: Arc::clone(&fail_spawns),
                ignore_graceful: Arc::clone(&ignore_graceful),
            },
            MockTransportHandle {
                spawned_rx,
                fail_spawns,
                ignore_graceful,
            },
        )
    }
}

impl fmt::Debug for MockChild {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChild")
            .field("graceful_signaled", &self.graceful_signaled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ServerTransport for MockTransport {
    async fn spawn(&self) -> Result<ChildIo, SpawnError> {
        if self.fail_spawns.load(Ordering::SeqCst) > 0 {
            self.fail_spawns.fetch_sub(1, Ordering::SeqCst);
            return Err(SpawnError::Spawn {
                command: "mock-server".to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }

        // Server stdout: lines injected on the channel appear on the duplex
        // read half handed to the proxy.
        let (stdout_tx, mut stdout_rx) = mpsc::unbounded_channel::<String>();
        let (mut stdout_write, stdout_read) = tokio::io::duplex(65_536);
        tokio::spawn(async move {
            while let Some(line) = stdout_rx.recv().await {
                let bytes = format!("{line}\n");
                if stdout_write.write_all(bytes.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // Server stdin: captured line-by-line for test assertions.
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();

        // Exit: both the control (kill paths) and the test handle can end
        // the generation; only the first outcome counts.
        let (exit_any_tx, mut exit_any_rx) = mpsc::unbounded_channel::<ExitOutcome>();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            if let Some(outcome) = exit_any_rx.recv().await {
                let _ = exit_tx.send(outcome);
            }
        });

        let graceful_signaled = Arc::new(AtomicBool::new(false));
        let control = MockControl {
            graceful_signaled: Arc::clone(&graceful_signaled),
            ignore_graceful: Arc::clone(&self.ignore_graceful),
            exit_tx: exit_any_tx.clone(),
        };

        let _ = self.spawned_tx.send(MockChild {
            stdout_tx,
            stdin_rx,
            exit_tx: exit_any_tx,
            graceful_signaled,
        });

        Ok(ChildIo {
            pid: None,
            stdin: Box::new(SniffWriter::new(stdin_tx)),
            stdout: Box::new(stdout_read),
            stderr: None,
            control: Box::new(control),
            exit_rx,
        })
    }
}

struct MockControl {
    graceful_signaled: Arc<AtomicBool>,
    ignore_graceful: Arc<AtomicBool>,
    exit_tx: mpsc::UnboundedSender<ExitOutcome>,
}

impl ProcessControl for MockControl {
    fn signal_graceful(&mut self) -> bool {
        let first = !self.graceful_signaled.swap(true, Ordering::SeqCst);
        if !self.ignore_graceful.load(Ordering::SeqCst) {
            let _ = self.exit_tx.send(ExitOutcome {
                code: None,
                signal: Some(SIGNAL_GRACEFUL),
            });
        }
        first
    }

    fn force_kill(&mut self) {
        let _ = self.exit_tx.send(ExitOutcome {
            code: None,
            signal: Some(SIGNAL_FORCE),
        });
    }
}

// ─── SniffWriter ─────────────────────────────────────────────────────────────

/// An [`AsyncWrite`] that accumulates bytes, splits on `\n`, and forwards
/// each complete line to an unbounded channel. Used by [`MockTransport`]
/// to expose "server stdin" to tests.
struct SniffWriter {
    tx: mpsc::UnboundedSender<String>,
    buf: Vec<u8>,
}

impl SniffWriter {
    fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx, buf: Vec::new() }
    }
}

impl AsyncWrite for SniffWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let s = String::from_utf8_lossy(&line).trim().to_string();
            if !s.is_empty() {
                let _ = self.tx.send(s);
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::write_line;

    #[tokio::test]
    async fn mock_spawn_announces_each_generation() {
        let (transport, mut handle) = MockTransport::new_with_handle();
        let _first = transport.spawn().await.unwrap();
        let _second = transport.spawn().await.unwrap();
        assert!(handle.spawned_rx.recv().await.is_some());
        assert!(handle.spawned_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn mock_stdin_lines_are_observable() {
        let (transport, mut handle) = MockTransport::new_with_handle();
        let mut io = transport.spawn().await.unwrap();
        let mut child = handle.spawned_rx.recv().await.unwrap();

        write_line(&mut io.stdin, r#"{"id":1}"#).await.unwrap();
        assert_eq!(child.stdin_rx.recv().await.unwrap(), r#"{"id":1}"#);
    }

    #[tokio::test]
    async fn mock_graceful_signal_ends_generation() {
        let (transport, mut handle) = MockTransport::new_with_handle();
        let mut io = transport.spawn().await.unwrap();
        let child = handle.spawned_rx.recv().await.unwrap();

        assert!(io.control.signal_graceful());
        assert!(child.graceful_signaled.load(Ordering::SeqCst));
        let outcome = io.exit_rx.await.unwrap();
        assert_eq!(outcome.signal, Some(SIGNAL_GRACEFUL));
    }

    #[tokio::test]
    async fn mock_ignoring_graceful_requires_force_kill() {
        let (transport, handle) = MockTransport::new_with_handle();
        handle.ignore_graceful.store(true, Ordering::SeqCst);
        let mut io = transport.spawn().await.unwrap();

        io.control.signal_graceful();
        io.control.force_kill();
        let outcome = io.exit_rx.await.unwrap();
        assert_eq!(outcome.signal, Some(SIGNAL_FORCE));
    }

    #[tokio::test]
    async fn mock_scripted_spawn_failure() {
        let (transport, handle) = MockTransport::new_with_handle();
        handle.fail_spawns.store(1, Ordering::SeqCst);
        assert!(transport.spawn().await.is_err());
        assert!(transport.spawn().await.is_ok());
    }

    #[test]
    fn exit_outcome_display() {
        let by_code = ExitOutcome { code: Some(3), signal: None };
        let by_signal = ExitOutcome { code: None, signal: Some(9) };
        assert_eq!(by_code.to_string(), "exit code 3");
        assert_eq!(by_signal.to_string(), "signal 9");
        assert!(ExitOutcome { code: Some(0), signal: None }.clean());
        assert!(!by_signal.clean());
    }
}
