//! mcpmon — transparent hot-reload proxy for MCP stdio servers.
//!
//! A client launches `mcpmon <command> [args…]` instead of the server; the
//! proxy spawns the server as a child, relays NDJSON JSON-RPC both ways,
//! and restarts the child when watched paths change while keeping the
//! client connection open.

use std::process::ExitCode;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mcpmon::cli::Cli;
use mcpmon::logging;
use mcpmon::proxy::ProxyEngine;
use mcpmon::transport::ProcessTransport;
use mcpmon::watcher;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = cli.verbose
        || std::env::var("MCPMON_VERBOSE").is_ok_and(|v| !v.is_empty() && v != "0");
    logging::init(verbose);

    let config = cli.into_config();
    let (change_tx, change_rx) = mpsc::channel(64);
    let transport = ProcessTransport::new(config.clone());
    let engine = ProxyEngine::new(config.clone(), Box::new(transport), change_rx);
    let cancel = engine.cancel_token();

    // The watcher outlives every server generation; dropping the guard
    // would stop event delivery.
    let _watch_guard = watcher::spawn_watcher(
        &config.watch_targets,
        config.data_dir.as_deref(),
        change_tx,
        cancel.clone(),
    );

    tokio::spawn(handle_signals(cancel));

    match engine.run(tokio::io::stdin(), tokio::io::stdout()).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            tracing::error!("proxy terminated: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn handle_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    cancel.cancel();
}
