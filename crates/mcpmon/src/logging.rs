//! Proxy-side diagnostic logging.
//!
//! Diagnostics go to **stderr**; stdout belongs to the JSON-RPC stream and
//! must never carry log lines.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level() -> tracing::Level {
    match std::env::var("MCPMON_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_ascii_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output from `MCPMON_LOG`.
///
/// `verbose` raises the floor to debug regardless of the environment. Safe
/// to call multiple times; only the first call installs the subscriber.
pub fn init(verbose: bool) {
    if INIT.get().is_some() {
        return;
    }
    let mut level = parse_level();
    if verbose && level < tracing::Level::DEBUG {
        level = tracing::Level::DEBUG;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}
