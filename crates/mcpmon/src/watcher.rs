//! Filesystem change source for restart triggers.
//!
//! One [`notify`] watcher persists for the proxy's lifetime, surviving every
//! server restart. Watch errors are reported once and do not abort startup:
//! a proxy with zero active watchers is still a valid message relay. Raw
//! events are filtered down to [`ChangeEvent`]s on watched targets — noise
//! from unrelated siblings and from the proxy's own data directory never
//! reaches the restart controller.

use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// A relevant filesystem change on a watched target.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// A successfully registered watch target. Directory targets match any
/// descendant path; file targets match exactly.
#[derive(Debug, Clone)]
struct WatchTarget {
    path: PathBuf,
    recursive: bool,
}

/// Keeps the underlying watcher alive; dropping it stops event delivery.
pub struct WatchGuard {
    _watcher: RecommendedWatcher,
}

/// Start watching `targets`, delivering filtered events on `event_tx`.
///
/// Directories are watched recursively. Paths that cannot be watched are
/// logged once and skipped. Returns `None` when the watcher itself cannot
/// be created or no target could be registered; the proxy keeps running
/// either way.
pub fn spawn_watcher(
    targets: &[PathBuf],
    exclude: Option<&Path>,
    event_tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
) -> Option<WatchGuard> {
    if targets.is_empty() {
        return None;
    }

    let (raw_tx, raw_rx) = channel();
    let mut watcher: RecommendedWatcher =
        match notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(e) => {
                tracing::error!("file watcher error: {e}");
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                tracing::error!("failed to create file watcher: {e}");
                return None;
            }
        };

    let mut watched = Vec::new();
    for path in targets {
        let recursive = path.is_dir();
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        match watcher.watch(path, mode) {
            Ok(()) => watched.push(WatchTarget {
                path: path.clone(),
                recursive,
            }),
            Err(e) => tracing::warn!("cannot watch {}: {e}", path.display()),
        }
    }
    if watched.is_empty() {
        tracing::warn!("no watch targets could be registered; running as a plain relay");
        return None;
    }
    tracing::info!(
        "watching {} path(s) for changes",
        watched.len()
    );

    let exclude = exclude.map(Path::to_path_buf);
    tokio::task::spawn_blocking(move || {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            // recv_timeout rather than recv so cancellation is noticed.
            match raw_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    for change in map_event(&watched, exclude.as_deref(), event) {
                        if event_tx.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    Some(WatchGuard { _watcher: watcher })
}

/// Translate a raw notify event into zero or more [`ChangeEvent`]s on
/// watched targets.
fn map_event(targets: &[WatchTarget], exclude: Option<&Path>, event: Event) -> Vec<ChangeEvent> {
    let kind = match event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Removed,
        _ => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .filter(|path| is_relevant(targets, exclude, path))
        .map(|path| ChangeEvent { kind, path })
        .collect()
}

fn is_relevant(targets: &[WatchTarget], exclude: Option<&Path>, path: &Path) -> bool {
    if let Some(excluded) = exclude {
        if path.starts_with(excluded) {
            return false;
        }
    }
    targets.iter().any(|target| {
        if target.recursive {
            path.starts_with(&target.path)
        } else {
            path == target.path.as_path()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, ModifyKind, RemoveKind};

    fn targets() -> Vec<WatchTarget> {
        vec![
            WatchTarget {
                path: PathBuf::from("/w/src"),
                recursive: true,
            },
            WatchTarget {
                path: PathBuf::from("/w/server.js"),
                recursive: false,
            },
        ]
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        Event {
            kind,
            paths: paths.iter().map(PathBuf::from).collect(),
            attrs: Default::default(),
        }
    }

    #[test]
    fn modify_under_directory_target_is_relevant() {
        let ev = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Any)),
            &["/w/src/lib/util.js"],
        );
        let changes = map_event(&targets(), None, ev);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[0].path, PathBuf::from("/w/src/lib/util.js"));
    }

    #[test]
    fn exact_file_target_matches_only_itself() {
        let hit = event(
            EventKind::Create(CreateKind::File),
            &["/w/server.js"],
        );
        assert_eq!(map_event(&targets(), None, hit).len(), 1);

        let sibling = event(
            EventKind::Create(CreateKind::File),
            &["/w/server.js.swp"],
        );
        assert!(map_event(&targets(), None, sibling).is_empty());
    }

    #[test]
    fn remove_maps_to_removed() {
        let ev = event(EventKind::Remove(RemoveKind::File), &["/w/src/a.js"]);
        let changes = map_event(&targets(), None, ev);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
    }

    #[test]
    fn access_events_are_ignored() {
        let ev = event(EventKind::Access(notify::event::AccessKind::Any), &["/w/src/a.js"]);
        assert!(map_event(&targets(), None, ev).is_empty());
    }

    #[test]
    fn data_dir_is_excluded() {
        let ev = event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any)),
            &["/w/src/.mcpmon/state.json"],
        );
        let exclude = PathBuf::from("/w/src/.mcpmon");
        assert!(map_event(&targets(), Some(&exclude), ev).is_empty());
    }

    #[test]
    fn multiple_paths_fan_out() {
        let ev = event(
            EventKind::Create(CreateKind::File),
            &["/w/src/a.js", "/w/src/b.js", "/elsewhere/c.js"],
        );
        let changes = map_event(&targets(), None, ev);
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn nonexistent_targets_yield_no_watcher() {
        let (tx, _rx) = mpsc::channel(4);
        let guard = spawn_watcher(
            &[PathBuf::from("/definitely/not/a/real/path/4f2c")],
            None,
            tx,
            CancellationToken::new(),
        );
        assert!(guard.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn real_file_changes_reach_the_channel() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let guard = spawn_watcher(&[root.clone()], None, tx, cancel.clone());
        let _guard = match guard {
            Some(g) => g,
            None => return, // platform without a usable watcher backend
        };
        // Give the backend a moment to register the watch.
        tokio::time::sleep(Duration::from_millis(250)).await;

        std::fs::write(root.join("server.js"), b"console.log('hi')").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change event arrived")
            .expect("watcher channel closed");
        assert!(event.path.starts_with(&root));
        cancel.cancel();
    }
}
