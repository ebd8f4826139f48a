//! Proxy configuration.
//!
//! [`ProxyConfig`] is the single typed record the engine consumes. The
//! launcher ([`crate::cli`]) assembles it from flags; environment variables
//! override flags so client configuration files can tune a proxy they do
//! not control the argv of.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default quiet period after the last change event before a restart begins.
pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE_MS: u64 = 1000;

/// Default readiness delay for a freshly spawned server.
pub const DEFAULT_READY_DELAY_MS: u64 = 2000;

/// Immutable configuration for one proxy run.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable, before label injection.
    pub args: Vec<String>,
    /// Files and directories whose changes trigger a restart.
    pub watch_targets: Vec<PathBuf>,
    /// Quiet period after the last change event before restarting.
    pub debounce: Duration,
    /// How long a SIGTERM'd server may linger before SIGKILL.
    pub kill_grace: Duration,
    /// Readiness allowance for a respawned server; the initialize replay
    /// deadline is a small multiple of this.
    pub ready_delay: Duration,
    /// Extra environment for the server process.
    pub env: HashMap<String, String>,
    /// Proxy-owned directory, excluded from watching so the proxy cannot
    /// retrigger itself.
    pub data_dir: Option<PathBuf>,
    /// Identity of this proxy run, propagated into container labels.
    pub session_id: String,
}

impl ProxyConfig {
    /// A config with default timings and a fresh session id.
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            watch_targets: Vec::new(),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            ready_delay: Duration::from_millis(DEFAULT_READY_DELAY_MS),
            env: HashMap::new(),
            data_dir: None,
            session_id: generate_session_id(),
        }
    }

    /// Apply `MCPMON_*` environment overrides on top of the current values.
    ///
    /// - `MCPMON_WATCH`: comma-separated watch paths, replacing the list
    /// - `MCPMON_DEBOUNCE_MS`: restart debounce in milliseconds
    /// - `MCPMON_DATA_DIR`: proxy data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = std::env::var("MCPMON_WATCH") {
            let paths: Vec<PathBuf> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
            if !paths.is_empty() {
                self.watch_targets = paths;
            }
        }
        if let Ok(raw) = std::env::var("MCPMON_DEBOUNCE_MS") {
            if let Ok(ms) = raw.trim().parse::<u64>() {
                self.debounce = Duration::from_millis(ms);
            }
        }
        if let Ok(raw) = std::env::var("MCPMON_DATA_DIR") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.data_dir = Some(PathBuf::from(trimmed));
            }
        }
    }
}

/// A session id of the form `mcpmon-<epoch-ms>`, unique enough to correlate
/// one proxy run with the containers it started.
pub fn generate_session_id() -> String {
    format!("mcpmon-{}", chrono::Utc::now().timestamp_millis())
}
