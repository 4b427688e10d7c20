//! The Positions Store: durable `path -> offset` map.
//!
//! The on-disk format is a private implementation detail of
//! [`FilePositionsStore`] — external callers depend only on the
//! [`PositionsStore`] trait. Writes follow a lock-then-temp-file-then-rename
//! pattern, guarded with `fd-lock` in case two processes are mistakenly
//! pointed at the same file.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use fd_lock::RwLock as FileRwLock;
use tracing::{debug, warn};

/// Durable map from file path to last-acknowledged byte offset.
///
/// `get`/`put`/`remove` are synchronous and cheap — implementations are
/// expected to keep an in-memory copy and flush to durable storage on
/// their own schedule, independent of the Target's sync period.
pub trait PositionsStore: Send + Sync {
    fn get(&self, path: &Path) -> u64;
    fn put(&self, path: &Path, offset: u64);
    fn remove(&self, path: &Path);
}

/// An in-memory positions store that never persists. Useful for tests and
/// for embedding agents that don't need tailing to survive a restart.
#[derive(Debug, Default)]
pub struct MemoryPositionsStore {
    offsets: Mutex<HashMap<PathBuf, u64>>,
}

impl MemoryPositionsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionsStore for MemoryPositionsStore {
    fn get(&self, path: &Path) -> u64 {
        self.offsets.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn put(&self, path: &Path, offset: u64) {
        self.offsets.lock().unwrap().insert(path.to_path_buf(), offset);
    }

    fn remove(&self, path: &Path) {
        self.offsets.lock().unwrap().remove(path);
    }
}

/// JSON-backed positions store. Keeps an in-memory map for the hot path
/// and mirrors it to disk on its own ticker (`sync_period`) and on
/// explicit `flush`/`shutdown`.
pub struct FilePositionsStore {
    offsets: Mutex<HashMap<PathBuf, u64>>,
    file_path: PathBuf,
}

impl FilePositionsStore {
    /// Load an existing positions file (if any) and return a store backed
    /// by `file_path`. A missing or corrupt file starts from an empty map
    /// rather than failing construction — stale/lost offsets are
    /// recoverable (they just re-tail from 0).
    pub fn open(file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        let offsets = Self::load(&file_path).unwrap_or_default();
        Self {
            offsets: Mutex::new(offsets),
            file_path,
        }
    }

    fn load(file_path: &Path) -> Option<HashMap<PathBuf, u64>> {
        let contents = std::fs::read(file_path).ok()?;
        match serde_json::from_slice(&contents) {
            Ok(map) => Some(map),
            Err(err) => {
                warn!(
                    "positions file {} is corrupt, starting fresh: {}",
                    file_path.display(),
                    err
                );
                None
            }
        }
    }

    /// Spawn a background task that flushes to disk every `sync_period`
    /// until `shutdown` is cancelled. Independent of the Target's own
    /// sync period.
    pub fn spawn_flush_loop(
        self: std::sync::Arc<Self>,
        sync_period: Duration,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sync_period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.flush(),
                    _ = shutdown.cancelled() => {
                        self.flush();
                        break;
                    }
                }
            }
        })
    }

    /// Write the current in-memory map to disk via a locked temp-file
    /// rename. Errors are logged, never propagated — a failed flush just
    /// means offsets may be stale on the next restart.
    pub fn flush(&self) {
        let snapshot = self.offsets.lock().unwrap().clone();
        if let Err(err) = self.write_snapshot(&snapshot) {
            warn!(
                "failed to flush positions file {}: {}",
                self.file_path.display(),
                err
            );
        } else {
            debug!(
                "flushed {} position(s) to {}",
                snapshot.len(),
                self.file_path.display()
            );
        }
    }

    fn write_snapshot(&self, snapshot: &HashMap<PathBuf, u64>) -> std::io::Result<()> {
        if let Some(parent) = self.file_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.file_path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(snapshot)?;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut lock = FileRwLock::new(file);
        {
            let mut guard = lock.write()?;
            guard.write_all(&json)?;
            guard.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.file_path)
    }
}

impl PositionsStore for FilePositionsStore {
    fn get(&self, path: &Path) -> u64 {
        self.offsets.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    fn put(&self, path: &Path, offset: u64) {
        self.offsets.lock().unwrap().insert(path.to_path_buf(), offset);
    }

    fn remove(&self, path: &Path) {
        self.offsets.lock().unwrap().remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_defaults_to_zero() {
        let store = MemoryPositionsStore::new();
        assert_eq!(store.get(Path::new("/does/not/exist")), 0);
    }

    #[test]
    fn memory_store_put_get_remove() {
        let store = MemoryPositionsStore::new();
        let path = Path::new("/var/log/app.log");
        store.put(path, 42);
        assert_eq!(store.get(path), 42);
        store.remove(path);
        assert_eq!(store.get(path), 0);
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let positions_path = dir.path().join("positions.json");
        let path = Path::new("/var/log/app.log");

        {
            let store = FilePositionsStore::open(&positions_path);
            store.put(path, 123);
            store.flush();
        }

        let reopened = FilePositionsStore::open(&positions_path);
        assert_eq!(reopened.get(path), 123);
    }

    #[test]
    fn file_store_survives_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let positions_path = dir.path().join("nope").join("positions.json");
        let store = FilePositionsStore::open(&positions_path);
        assert_eq!(store.get(Path::new("/a")), 0);
    }

    #[test]
    fn file_store_survives_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let positions_path = dir.path().join("positions.json");
        std::fs::write(&positions_path, b"not json").unwrap();

        let store = FilePositionsStore::open(&positions_path);
        assert_eq!(store.get(Path::new("/a")), 0);
    }
}
