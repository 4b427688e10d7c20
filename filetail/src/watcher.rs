//! The Filesystem Watcher adapter.
//!
//! Wraps a single `notify::RecommendedWatcher` instance behind
//! `add`/`remove`/`events`/`errors`/`close`. The underlying task forwards
//! raw `notify` callbacks onto an `mpsc` channel so the rest of the crate
//! only ever deals with plain async channel reads.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::{EventKind, RecursiveMode, Watcher as NotifyWatcherTrait};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The kind of change observed for a path, collapsed from `notify`'s
/// richer event taxonomy onto the five kinds the Target cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
}

#[derive(Debug, Clone)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
}

fn classify(kind: &EventKind) -> Option<FsEventKind> {
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Create),
        EventKind::Modify(notify::event::ModifyKind::Data(_)) => Some(FsEventKind::Write),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => Some(FsEventKind::Rename),
        EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => Some(FsEventKind::Chmod),
        EventKind::Remove(_) => Some(FsEventKind::Remove),
        _ => None,
    }
}

/// Adapter over `notify`'s recommended platform watcher.
///
/// Owns the set of watched directories; `add`/`remove` are idempotent
/// no-ops when the directory is already (not) watched. Dropping the
/// adapter closes the underlying watcher and aborts the forwarding task.
pub struct Watcher {
    inner: notify::RecommendedWatcher,
    watched: HashSet<PathBuf>,
    events_rx: mpsc::Receiver<FsEvent>,
    errors_rx: mpsc::Receiver<notify::Error>,
    // kept alive so the receivers above block rather than close while the
    // watcher is live.
    _events_tx: mpsc::Sender<FsEvent>,
    _errors_tx: mpsc::Sender<notify::Error>,
}

impl Watcher {
    pub fn new() -> notify::Result<Self> {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let (errors_tx, errors_rx) = mpsc::channel(64);

        let fwd_events = events_tx.clone();
        let fwd_errors = errors_tx.clone();
        let inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if let Some(kind) = classify(&event.kind) {
                        for path in event.paths {
                            let _ = fwd_events.try_send(FsEvent {
                                path,
                                kind,
                            });
                        }
                    }
                }
                Err(err) => {
                    let _ = fwd_errors.try_send(err);
                }
            }
        })?;

        Ok(Self {
            inner,
            watched: HashSet::new(),
            events_rx,
            errors_rx,
            _events_tx: events_tx,
            _errors_tx: errors_tx,
        })
    }

    /// Register a directory with the underlying notifier. No-op if
    /// already watched.
    pub fn add(&mut self, dir: &Path) -> notify::Result<()> {
        if self.watched.contains(dir) {
            return Ok(());
        }
        // Canonicalize so events reported by the platform notifier (which
        // may resolve symlinks, e.g. macOS FSEvents on /tmp) match the
        // path we recorded as watched.
        let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        self.inner.watch(&canonical, RecursiveMode::NonRecursive)?;
        self.watched.insert(canonical);
        info!("watching directory {}", dir.display());
        Ok(())
    }

    /// Unregister a directory. No-op if not currently watched.
    pub fn remove(&mut self, dir: &Path) -> notify::Result<()> {
        let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        if !self.watched.remove(&canonical) {
            return Ok(());
        }
        self.inner.unwatch(&canonical)?;
        info!("stopped watching directory {}", dir.display());
        Ok(())
    }

    pub fn watched_dirs(&self) -> &HashSet<PathBuf> {
        &self.watched
    }

    pub async fn next_event(&mut self) -> Option<FsEvent> {
        self.events_rx.recv().await
    }

    pub async fn next_error(&mut self) -> Option<notify::Error> {
        self.errors_rx.recv().await
    }

    /// Unregister every directory. Dropping the `Watcher` after this is
    /// sufficient to release the underlying OS watch handles.
    pub fn close(&mut self) {
        for dir in self.watched.drain().collect::<Vec<_>>() {
            if let Err(err) = self.inner.unwatch(&dir) {
                warn!("error while closing watch on {}: {}", dir.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    #[tokio::test]
    async fn detects_file_creation_in_watched_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();

        // Give the native watcher a moment to install before writing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        fs::write(dir.path().join("new.log"), b"hello").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), watcher.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        assert_eq!(event.kind, FsEventKind::Create);
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();
        watcher.add(dir.path()).unwrap();
        assert_eq!(watcher.watched_dirs().len(), 1);
    }

    #[tokio::test]
    async fn remove_unknown_dir_is_noop() {
        let mut watcher = Watcher::new().unwrap();
        assert!(watcher.remove(Path::new("/not/watched")).is_ok());
    }

    #[tokio::test]
    async fn remove_stops_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::new().unwrap();
        watcher.add(dir.path()).unwrap();
        watcher.remove(dir.path()).unwrap();
        assert!(watcher.watched_dirs().is_empty());
    }
}
