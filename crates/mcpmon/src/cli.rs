//! CLI argument types for the mcpmon launcher.
//!
//! The launcher's only job is to assemble a [`ProxyConfig`]; the engine
//! never reads flags or the environment itself.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::config::ProxyConfig;

/// Transparent hot-reload proxy for MCP servers on stdio
#[derive(Parser, Debug)]
#[command(name = "mcpmon", version, about)]
pub struct Cli {
    /// Paths to watch for changes (repeatable or comma-separated)
    #[arg(long, short = 'w', value_delimiter = ',')]
    pub watch: Vec<PathBuf>,

    /// Milliseconds of quiet after the last change before restarting
    #[arg(long)]
    pub debounce_ms: Option<u64>,

    /// Milliseconds a stopped server may linger before being force-killed
    #[arg(long)]
    pub kill_grace_ms: Option<u64>,

    /// Milliseconds allowed for a respawned server to become ready
    #[arg(long)]
    pub ready_delay_ms: Option<u64>,

    /// Proxy-owned data directory, excluded from watching
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Raise proxy diagnostics on stderr to debug level
    #[arg(long, short)]
    pub verbose: bool,

    /// Server command followed by its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Fold flags and `MCPMON_*` environment overrides into a [`ProxyConfig`].
    pub fn into_config(self) -> ProxyConfig {
        let mut parts = self.command.into_iter();
        let command = parts.next().unwrap_or_default();
        let mut config = ProxyConfig::new(command, parts.collect());
        config.watch_targets = self.watch;
        if let Some(ms) = self.debounce_ms {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = self.kill_grace_ms {
            config.kill_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ready_delay_ms {
            config.ready_delay = Duration::from_millis(ms);
        }
        config.data_dir = self.data_dir;
        config.apply_env_overrides();
        config
    }
}
