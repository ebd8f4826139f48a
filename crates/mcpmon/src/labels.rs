//! Session labels for containerized servers.
//!
//! When the configured command is a container runtime `run` invocation, the
//! proxy tags the container with its session identity so an external cleanup
//! utility can find containers whose owning proxy has died. The transform is
//! purely on the argument vector; nothing else about the command changes.

use std::path::Path;

/// Container runtimes whose `run` subcommand accepts `--label`.
const CONTAINER_RUNTIMES: [&str; 3] = ["docker", "podman", "nerdctl"];

/// Inject `--label mcpmon.*` pairs into a container `run` invocation.
///
/// The labels land directly after `run`, before any flag that could consume
/// a positional argument. Commands that are not a container runtime, or
/// runtime invocations whose first argument is not `run`, are returned
/// unchanged.
pub fn inject_session_labels(
    command: &str,
    args: &[String],
    session_id: &str,
    proxy_pid: u32,
    started_ms: i64,
) -> Vec<String> {
    if !is_container_run(command, args) {
        return args.to_vec();
    }

    let labels = [
        ("managed", "true".to_string()),
        ("session", session_id.to_string()),
        ("pid", proxy_pid.to_string()),
        ("started", started_ms.to_string()),
    ];

    let mut out = Vec::with_capacity(args.len() + labels.len() * 2);
    out.push(args[0].clone());
    for (key, value) in labels {
        out.push("--label".to_string());
        out.push(format!("mcpmon.{key}={value}"));
    }
    out.extend(args[1..].iter().cloned());
    out
}

fn is_container_run(command: &str, args: &[String]) -> bool {
    let name = Path::new(command)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(command);
    let name = name.strip_suffix(".exe").unwrap_or(name);
    CONTAINER_RUNTIMES.contains(&name) && args.first().map(String::as_str) == Some("run")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn docker_run_gets_labels_after_run() {
        let out = inject_session_labels(
            "docker",
            &args(&["run", "-d", "my-mcp-server:latest"]),
            "mcpmon-1710000000000",
            4242,
            1710000000000,
        );
        assert_eq!(
            out,
            args(&[
                "run",
                "--label",
                "mcpmon.managed=true",
                "--label",
                "mcpmon.session=mcpmon-1710000000000",
                "--label",
                "mcpmon.pid=4242",
                "--label",
                "mcpmon.started=1710000000000",
                "-d",
                "my-mcp-server:latest",
            ])
        );
    }

    #[test]
    fn podman_and_full_paths_are_recognized() {
        let out = inject_session_labels(
            "/usr/local/bin/podman",
            &args(&["run", "img"]),
            "mcpmon-1",
            1,
            2,
        );
        assert_eq!(out[1], "--label");
        assert_eq!(out[2], "mcpmon.managed=true");
    }

    #[test]
    fn non_runtime_command_is_untouched() {
        let original = args(&["server.js"]);
        let out = inject_session_labels("node", &original, "mcpmon-1", 1, 2);
        assert_eq!(out, original);
    }

    #[test]
    fn runtime_without_run_is_untouched() {
        let original = args(&["ps", "-a"]);
        let out = inject_session_labels("docker", &original, "mcpmon-1", 1, 2);
        assert_eq!(out, original);
    }

    #[test]
    fn empty_args_are_untouched() {
        let out = inject_session_labels("docker", &[], "mcpmon-1", 1, 2);
        assert!(out.is_empty());
    }
}
