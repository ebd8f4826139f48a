//! Proxy engine: child lifecycle, restart state machine, message pumps.
//!
//! [`ProxyEngine`] sits between an MCP client (on its own stdin/stdout) and
//! a single server child process, both speaking newline-delimited JSON-RPC.
//! It:
//!
//! - Relays traffic in both directions through the [`crate::interceptor`]
//! - Restarts the server when watched files change, after a debounce
//! - Escalates SIGTERM to SIGKILL when a server will not stop
//! - Buffers client traffic during a restart and replays the captured
//!   `initialize` handshake to the new server before draining it
//! - Notifies the client of the new tool set after every restart
//! - Survives server crashes, spawn failures, and garbage output
//!
//! # Concurrency
//!
//! The engine is one cooperative task. Reader and wait tasks feed per-child
//! channels, but every piece of proxy state — the restart state, the
//! buffer, the interceptor, the child slot — is owned and mutated here, in
//! one `select!` loop. The client's stdout has exactly one writer: this
//! task.

use std::future;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::buffer::MessageBuffer;
use crate::config::ProxyConfig;
use crate::framing::{self, NdjsonReader};
use crate::interceptor::{ClientAction, Interceptor, InternalKind, ServerAction};
use crate::logger;
use crate::protocol::{JSONRPC_VERSION, LogLevel};
use crate::transport::{ChildIo, ExitOutcome, ProcessControl, ServerTransport, SpawnError};
use crate::watcher::ChangeEvent;

/// Capacity of the per-child event channel feeding the engine loop.
const CHILD_EVENT_CAPACITY: usize = 256;

/// The initialize replay must complete within this many readiness delays.
const READY_DEADLINE_MULTIPLIER: u32 = 3;

/// JSON-RPC error code for a reload request while a restart is in flight.
pub const ERR_RELOAD_IN_PROGRESS: i64 = -32000;

/// Restart controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    /// Not started yet.
    Idle,
    /// First spawn in progress.
    Starting,
    /// Server up, traffic flowing.
    Running,
    /// Change seen; waiting out the quiet period.
    DebouncingRestart,
    /// Server asked to stop; grace timer running.
    Killing,
    /// New server spawned; handshake replay in flight.
    StartingAfterRestart,
    /// Server could not be started; waiting for a retry trigger.
    Failed,
    /// Shutting down.
    Terminated,
}

/// Events from the current server generation, funneled through one channel
/// so the loop has a single suspension point per child.
#[derive(Debug)]
enum ChildEvent {
    Line(String),
    Exited(ExitOutcome),
}

/// The one live server generation.
struct ChildHandle {
    generation: u64,
    pid: Option<u32>,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    control: Box<dyn ProcessControl>,
    /// `None` once the event channel has been fully drained.
    events_rx: Option<mpsc::Receiver<ChildEvent>>,
    alive: bool,
}

/// One loop turn's worth of input.
enum Tick {
    Shutdown,
    ClientLine(Option<String>),
    Child(Option<ChildEvent>),
    Change(Option<ChangeEvent>),
    DebounceElapsed,
    KillGraceElapsed,
    ReplayTimedOut,
    RetryElapsed,
}

/// The proxy engine. Construct with [`ProxyEngine::new`], then drive with
/// [`ProxyEngine::run`].
pub struct ProxyEngine {
    config: ProxyConfig,
    transport: Box<dyn ServerTransport>,
    change_rx: mpsc::Receiver<ChangeEvent>,
    changes_open: bool,
    cancel: CancellationToken,
    interceptor: Interceptor,
    buffer: MessageBuffer,
    state: RestartState,
    child: Option<ChildHandle>,
    client_out: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    generation: u64,
    last_exit: Option<ExitOutcome>,
    /// A change arrived while killing or replaying; restart again once
    /// Running is reached.
    pending_change: bool,
    /// Replay retries used in the current restart cycle.
    replay_attempts: u32,
    /// Whether the single spawn retry has been used since the last trigger.
    spawn_retried: bool,
    debounce_deadline: Option<Instant>,
    kill_deadline: Option<Instant>,
    replay_deadline: Option<Instant>,
    retry_deadline: Option<Instant>,
    shutdown_requested: bool,
}

impl ProxyEngine {
    /// Create an engine over the given transport and change-event source.
    pub fn new(
        config: ProxyConfig,
        transport: Box<dyn ServerTransport>,
        change_rx: mpsc::Receiver<ChangeEvent>,
    ) -> Self {
        Self {
            config,
            transport,
            change_rx,
            changes_open: true,
            cancel: CancellationToken::new(),
            interceptor: Interceptor::new(),
            buffer: MessageBuffer::new(),
            state: RestartState::Idle,
            child: None,
            client_out: None,
            generation: 0,
            last_exit: None,
            pending_change: false,
            replay_attempts: 0,
            spawn_retried: false,
            debounce_deadline: None,
            kill_deadline: None,
            replay_deadline: None,
            retry_deadline: None,
            shutdown_requested: false,
        }
    }

    /// Token cancelled when the engine shuts down; cancelling it from the
    /// outside requests shutdown. Safe to trigger any number of times.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown. Idempotent; completes within the kill grace delay
    /// plus loop overhead.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the proxy until the client disconnects or shutdown is requested.
    ///
    /// Returns the process exit code: 0 on requested shutdown, otherwise
    /// the last server exit code.
    ///
    /// # Errors
    ///
    /// Returns an error on unrecoverable I/O failures on the client side.
    /// Server-side trouble (crashes, spawn failures, garbage output) is
    /// handled internally.
    pub async fn run<R, W>(mut self, client_in: R, client_out: W) -> anyhow::Result<i32>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.client_out = Some(Box::new(client_out));
        let mut client_reader = NdjsonReader::new(client_in);

        tracing::info!(
            command = %self.config.command,
            session = %self.config.session_id,
            watching = self.config.watch_targets.len(),
            "proxy starting"
        );
        self.start_initial().await?;

        loop {
            let tick = {
                let debounce_at = deadline_or_far(self.debounce_deadline);
                let kill_at = deadline_or_far(self.kill_deadline);
                let replay_at = deadline_or_far(self.replay_deadline);
                let retry_at = deadline_or_far(self.retry_deadline);
                let child_events = self.child.as_mut().and_then(|c| c.events_rx.as_mut());

                tokio::select! {
                    _ = self.cancel.cancelled() => Tick::Shutdown,
                    line = client_reader.next_line() => Tick::ClientLine(line?),
                    ev = async {
                        match child_events {
                            Some(rx) => rx.recv().await,
                            None => future::pending().await,
                        }
                    } => Tick::Child(ev),
                    ev = self.change_rx.recv(), if self.changes_open => Tick::Change(ev),
                    _ = tokio::time::sleep_until(debounce_at), if self.debounce_deadline.is_some() => Tick::DebounceElapsed,
                    _ = tokio::time::sleep_until(kill_at), if self.kill_deadline.is_some() => Tick::KillGraceElapsed,
                    _ = tokio::time::sleep_until(replay_at), if self.replay_deadline.is_some() => Tick::ReplayTimedOut,
                    _ = tokio::time::sleep_until(retry_at), if self.retry_deadline.is_some() => Tick::RetryElapsed,
                }
            };

            match tick {
                Tick::Shutdown => {
                    self.shutdown_requested = true;
                    break;
                }
                Tick::ClientLine(None) => {
                    tracing::info!("client closed stdin; shutting down");
                    self.shutdown_requested = true;
                    break;
                }
                Tick::ClientLine(Some(line)) => self.handle_client_line(line).await?,
                Tick::Child(None) => {
                    if let Some(child) = self.child.as_mut() {
                        child.events_rx = None;
                    }
                }
                Tick::Child(Some(event)) => self.handle_child_event(event).await?,
                Tick::Change(None) => {
                    self.changes_open = false;
                }
                Tick::Change(Some(event)) => self.handle_change(event),
                Tick::DebounceElapsed => {
                    self.debounce_deadline = None;
                    if self.state == RestartState::DebouncingRestart {
                        self.begin_restart_now().await?;
                    }
                }
                Tick::KillGraceElapsed => self.on_kill_grace_elapsed().await?,
                Tick::ReplayTimedOut => self.on_replay_timeout().await?,
                Tick::RetryElapsed => self.on_retry_elapsed().await?,
            }
        }

        self.state = RestartState::Terminated;
        self.cancel.cancel();
        self.shutdown_child().await;
        let code = if self.shutdown_requested {
            0
        } else {
            self.last_exit.and_then(|e| e.code).unwrap_or(0)
        };
        tracing::info!(exit = ?self.last_exit, "proxy stopped");
        Ok(code)
    }

    // ─── Client → server ─────────────────────────────────────────────────

    async fn handle_client_line(&mut self, line: String) -> anyhow::Result<()> {
        let msg: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("discarding unparseable client line: {e}");
                return Ok(());
            }
        };

        match self.interceptor.on_client_message(&msg) {
            ClientAction::Respond(response) => {
                let line = serde_json::to_string(&response)?;
                self.send_client_line(&line).await?;
            }
            ClientAction::TriggerReload { id } => self.handle_reload_call(id).await?,
            ClientAction::Forward => {
                if self.state == RestartState::Running && self.child_alive() {
                    self.write_child_line(&line).await;
                } else {
                    self.buffer.push(line);
                }
            }
        }
        Ok(())
    }

    async fn handle_reload_call(&mut self, id: Value) -> anyhow::Result<()> {
        match self.state {
            RestartState::Running | RestartState::Failed => {
                let response = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": id,
                    "result": {"content": [{"type": "text", "text": "reload triggered"}]}
                });
                self.send_client_line(&serde_json::to_string(&response)?).await?;
                tracing::info!("manual reload requested");
                self.begin_restart_now().await
            }
            _ => {
                let response = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": id,
                    "error": {
                        "code": ERR_RELOAD_IN_PROGRESS,
                        "message": "reload already in progress"
                    }
                });
                self.send_client_line(&serde_json::to_string(&response)?).await
            }
        }
    }

    // ─── Server → client ─────────────────────────────────────────────────

    async fn handle_child_event(&mut self, event: ChildEvent) -> anyhow::Result<()> {
        match event {
            ChildEvent::Line(line) => {
                let msg: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("discarding unparseable server line: {e}");
                        return Ok(());
                    }
                };
                match self.interceptor.on_server_message(&msg) {
                    ServerAction::Forward => self.send_client_line(&line).await,
                    ServerAction::ForwardMutated(mutated) => {
                        let line = serde_json::to_string(&mutated)?;
                        self.send_client_line(&line).await
                    }
                    ServerAction::Drop => Ok(()),
                    ServerAction::Internal { kind, ok } => {
                        self.handle_internal_response(kind, ok).await
                    }
                }
            }
            ChildEvent::Exited(outcome) => self.handle_child_exit(outcome).await,
        }
    }

    async fn handle_internal_response(&mut self, kind: InternalKind, ok: bool) -> anyhow::Result<()> {
        match kind {
            InternalKind::InitializeReplay => {
                if self.state != RestartState::StartingAfterRestart {
                    return Ok(());
                }
                self.replay_deadline = None;
                if ok {
                    if let Some(request) = self.interceptor.restore_log_level_request() {
                        let line = serde_json::to_string(&request)?;
                        self.write_child_line(&line).await;
                    }
                    self.finish_restart().await
                } else {
                    self.retry_replay_or_fail("server rejected the replayed initialize")
                        .await
                }
            }
            InternalKind::ToolsRefetch => {
                let note = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "method": "notifications/tools/list_changed"
                });
                self.send_client_line(&serde_json::to_string(&note)?).await
            }
            InternalKind::SetLevelRestore => {
                if !ok {
                    tracing::debug!("server rejected the restored log level");
                }
                Ok(())
            }
        }
    }

    async fn handle_child_exit(&mut self, outcome: ExitOutcome) -> anyhow::Result<()> {
        if let Some(child) = self.child.as_mut() {
            child.alive = false;
        }
        self.last_exit = Some(outcome);

        match self.state {
            RestartState::Running => {
                tracing::warn!(%outcome, "server exited unexpectedly; restarting");
                self.emit_client_log(
                    LogLevel::Warning,
                    &format!("server exited unexpectedly ({outcome}); restarting"),
                )
                .await?;
                self.replay_attempts = 0;
                self.spawn_retried = false;
                self.respawn().await
            }
            RestartState::Killing => {
                self.kill_deadline = None;
                self.respawn().await
            }
            RestartState::DebouncingRestart => {
                // The debounce keeps running; with the server already gone
                // the kill step is skipped when it elapses.
                tracing::debug!(%outcome, "server exited during debounce");
                Ok(())
            }
            RestartState::StartingAfterRestart => {
                self.replay_deadline = None;
                self.interceptor.abort_replay();
                self.retry_replay_or_fail("server exited during the handshake replay")
                    .await
            }
            RestartState::Idle
            | RestartState::Starting
            | RestartState::Failed
            | RestartState::Terminated => Ok(()),
        }
    }

    // ─── Restart controller ──────────────────────────────────────────────

    fn handle_change(&mut self, event: ChangeEvent) {
        tracing::debug!(path = %event.path.display(), kind = ?event.kind, "change detected");
        match self.state {
            RestartState::Running | RestartState::Failed => {
                self.state = RestartState::DebouncingRestart;
                self.retry_deadline = None;
                self.debounce_deadline = Some(Instant::now() + self.config.debounce);
            }
            RestartState::DebouncingRestart => {
                self.debounce_deadline = Some(Instant::now() + self.config.debounce);
            }
            RestartState::Killing | RestartState::StartingAfterRestart => {
                self.pending_change = true;
            }
            RestartState::Idle | RestartState::Starting | RestartState::Terminated => {}
        }
    }

    /// Begin a restart immediately: kill a live server, or go straight to
    /// the respawn when there is nothing to kill.
    async fn begin_restart_now(&mut self) -> anyhow::Result<()> {
        self.debounce_deadline = None;
        self.retry_deadline = None;
        self.replay_attempts = 0;
        self.spawn_retried = false;
        if self.child_alive() {
            self.enter_killing();
            Ok(())
        } else {
            self.respawn().await
        }
    }

    fn enter_killing(&mut self) {
        self.state = RestartState::Killing;
        if let Some(child) = self.child.as_mut() {
            tracing::info!(pid = ?child.pid, generation = child.generation, "stopping server");
            child.control.signal_graceful();
        }
        self.kill_deadline = Some(Instant::now() + self.config.kill_grace);
    }

    async fn on_kill_grace_elapsed(&mut self) -> anyhow::Result<()> {
        self.kill_deadline = None;
        if self.state != RestartState::Killing {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            if child.alive {
                tracing::warn!(pid = ?child.pid, "server ignored graceful stop; force killing");
                child.control.force_kill();
            }
        }
        self.respawn().await
    }

    /// Spawn the replacement server and start the handshake replay.
    async fn respawn(&mut self) -> anyhow::Result<()> {
        self.state = RestartState::StartingAfterRestart;
        self.child = None;
        match self.transport.spawn().await {
            Ok(io) => {
                self.install_child(io);
                match self.interceptor.replay_initialize_request() {
                    Some(request) => {
                        let line = serde_json::to_string(&request)?;
                        self.write_child_line(&line).await;
                        self.replay_deadline = Some(
                            Instant::now()
                                + self.config.ready_delay * READY_DEADLINE_MULTIPLIER,
                        );
                        Ok(())
                    }
                    // No client handshake yet; nothing to replay.
                    None => self.finish_restart().await,
                }
            }
            Err(e) => self.on_spawn_failure(e).await,
        }
    }

    /// Completion of a restart cycle: drain buffered traffic, refetch the
    /// tool list, resume Running, and honor changes seen meanwhile.
    async fn finish_restart(&mut self) -> anyhow::Result<()> {
        let (messages, dropped) = self.buffer.drain();
        for line in &messages {
            self.write_child_line(line).await;
        }
        if dropped > 0 {
            self.emit_client_log(
                LogLevel::Warning,
                &format!("{dropped} buffered client message(s) dropped during restart"),
            )
            .await?;
        }

        if !self.interceptor.snapshot().is_empty() {
            let request = self.interceptor.tools_refetch_request();
            let line = serde_json::to_string(&request)?;
            self.write_child_line(&line).await;
        }

        self.state = RestartState::Running;
        self.replay_attempts = 0;
        self.spawn_retried = false;
        tracing::info!(generation = self.generation, "server ready");

        if self.pending_change {
            self.pending_change = false;
            self.state = RestartState::DebouncingRestart;
            self.debounce_deadline = Some(Instant::now() + self.config.debounce);
        }
        Ok(())
    }

    async fn on_replay_timeout(&mut self) -> anyhow::Result<()> {
        self.replay_deadline = None;
        if self.state != RestartState::StartingAfterRestart {
            return Ok(());
        }
        self.interceptor.abort_replay();
        if let Some(child) = self.child.as_mut() {
            if child.alive {
                child.control.force_kill();
            }
        }
        self.retry_replay_or_fail("server did not answer initialize before the deadline")
            .await
    }

    async fn retry_replay_or_fail(&mut self, reason: &str) -> anyhow::Result<()> {
        if self.replay_attempts < 1 {
            self.replay_attempts += 1;
            tracing::warn!("{reason}; retrying once");
            self.respawn().await
        } else {
            self.enter_failed(reason).await
        }
    }

    async fn on_spawn_failure(&mut self, error: SpawnError) -> anyhow::Result<()> {
        tracing::error!("failed to start server: {error}");
        self.state = RestartState::Failed;
        if !self.spawn_retried {
            self.spawn_retried = true;
            self.retry_deadline = Some(Instant::now() + self.config.debounce);
            Ok(())
        } else {
            self.enter_failed(&format!("failed to start server: {error}")).await
        }
    }

    async fn on_retry_elapsed(&mut self) -> anyhow::Result<()> {
        self.retry_deadline = None;
        if self.state != RestartState::Failed {
            return Ok(());
        }
        tracing::info!("retrying server start");
        self.respawn().await
    }

    async fn enter_failed(&mut self, reason: &str) -> anyhow::Result<()> {
        self.state = RestartState::Failed;
        tracing::error!("{reason}; waiting for the next change before retrying");
        self.emit_client_log(LogLevel::Error, reason).await
    }

    // ─── Child plumbing ──────────────────────────────────────────────────

    async fn start_initial(&mut self) -> anyhow::Result<()> {
        self.state = RestartState::Starting;
        match self.transport.spawn().await {
            Ok(io) => {
                self.install_child(io);
                self.state = RestartState::Running;
                Ok(())
            }
            Err(e) => self.on_spawn_failure(e).await,
        }
    }

    /// Wire a freshly spawned server into the loop: one reader task for
    /// stdout lines, one waiter for the exit, one drain for stderr. All
    /// three feed (or log) independently; replacing the handle silently
    /// detaches the previous generation.
    fn install_child(&mut self, io: ChildIo) {
        self.generation += 1;
        let (event_tx, event_rx) = mpsc::channel(CHILD_EVENT_CAPACITY);

        let line_tx = event_tx.clone();
        let mut stdout_reader = NdjsonReader::new(io.stdout);
        tokio::spawn(async move {
            loop {
                match stdout_reader.next_line().await {
                    Ok(Some(line)) => {
                        if line_tx.send(ChildEvent::Line(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("server stdout read error: {e}");
                        break;
                    }
                }
            }
        });

        let exit_rx = io.exit_rx;
        tokio::spawn(async move {
            if let Ok(outcome) = exit_rx.await {
                let _ = event_tx.send(ChildEvent::Exited(outcome)).await;
            }
        });

        if let Some(stderr) = io.stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "mcpmon::server", "{line}");
                }
            });
        }

        self.child = Some(ChildHandle {
            generation: self.generation,
            pid: io.pid,
            stdin: io.stdin,
            control: io.control,
            events_rx: Some(event_rx),
            alive: true,
        });
    }

    fn child_alive(&self) -> bool {
        self.child.as_ref().is_some_and(|c| c.alive)
    }

    async fn write_child_line(&mut self, line: &str) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if let Err(e) = framing::write_line(&mut child.stdin, line).await {
            // Folded into crash handling: the exit event follows shortly.
            tracing::warn!("failed to write to server stdin: {e}");
        }
    }

    async fn send_client_line(&mut self, line: &str) -> anyhow::Result<()> {
        let out = self
            .client_out
            .as_mut()
            .expect("client_out is installed before the loop starts");
        framing::write_line(out, line)
            .await
            .map_err(|e| anyhow::anyhow!("client write failed: {e}"))
    }

    async fn emit_client_log(&mut self, level: LogLevel, message: &str) -> anyhow::Result<()> {
        if !logger::should_emit(level, self.interceptor.log_level()) {
            return Ok(());
        }
        let frame = logger::notification_frame(level, message, None);
        self.send_client_line(&serde_json::to_string(&frame)?).await
    }

    /// Stop the current server with the SIGTERM → grace → SIGKILL chain.
    async fn shutdown_child(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if !child.alive {
            return;
        }
        child.control.signal_graceful();

        let grace = tokio::time::sleep(self.config.kill_grace);
        tokio::pin!(grace);
        let mut events = child.events_rx.take();
        loop {
            tokio::select! {
                ev = async {
                    match events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => future::pending().await,
                    }
                } => match ev {
                    Some(ChildEvent::Exited(outcome)) => {
                        self.last_exit = Some(outcome);
                        return;
                    }
                    Some(ChildEvent::Line(_)) => continue,
                    None => break,
                },
                _ = &mut grace => break,
            }
        }
        tracing::warn!("server ignored graceful stop during shutdown; force killing");
        child.control.force_kill();
    }
}

fn deadline_or_far(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn test_config() -> ProxyConfig {
        let mut config = ProxyConfig::new("mock-server", vec![]);
        config.debounce = Duration::from_millis(50);
        config.kill_grace = Duration::from_millis(100);
        config.ready_delay = Duration::from_millis(200);
        config
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_before_run() {
        let (transport, _handle) = MockTransport::new_with_handle();
        let (_change_tx, change_rx) = mpsc::channel(8);
        let engine = ProxyEngine::new(test_config(), Box::new(transport), change_rx);
        engine.shutdown();
        engine.shutdown();
        assert!(engine.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn run_exits_cleanly_on_client_eof() {
        let (transport, _handle) = MockTransport::new_with_handle();
        let (_change_tx, change_rx) = mpsc::channel(8);
        let engine = ProxyEngine::new(test_config(), Box::new(transport), change_rx);

        let (client_in, _keep) = tokio::io::duplex(1024);
        let (client_out, _sink) = tokio::io::duplex(1024);
        drop(_keep);
        let code = engine.run(client_in, client_out).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn run_exits_on_cancellation() {
        let (transport, _handle) = MockTransport::new_with_handle();
        let (_change_tx, change_rx) = mpsc::channel(8);
        let engine = ProxyEngine::new(test_config(), Box::new(transport), change_rx);
        let cancel = engine.cancel_token();

        let (client_in, _keep_in) = tokio::io::duplex(1024);
        let (client_out, _keep_out) = tokio::io::duplex(1024);
        let task = tokio::spawn(engine.run(client_in, client_out));
        cancel.cancel();
        let code = task.await.unwrap().unwrap();
        assert_eq!(code, 0);
    }
}
