//! Metrics surface for a file target.
//!
//! Built against the `metrics` crate's global recorder facade: if the
//! embedding binary never installs a recorder (e.g. `metrics-exporter-prometheus`),
//! every call below is a documented no-op, so a target can always be
//! constructed without a registry.

use std::path::Path;

use metrics::{counter, gauge};

const FILES_ACTIVE_TOTAL: &str = "files_active_total";
const READ_LINES_TOTAL: &str = "read_lines_total";
const READ_BYTES_TOTAL: &str = "read_bytes_total";
const FILE_BYTES_TOTAL: &str = "file_bytes_total";

/// Handle for recording file-target metrics. Cheap to clone; holds no
/// state of its own beyond what the global recorder tracks.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    /// Set `files_active_total` to the number of currently active readers.
    /// Called once per sync, never per-path.
    pub fn set_active_files(&self, count: usize) {
        gauge!(FILES_ACTIVE_TOTAL).set(count as f64);
    }

    pub fn inc_read_lines(&self, path: &Path, lines: u64) {
        counter!(READ_LINES_TOTAL, "path" => path_label(path)).increment(lines);
    }

    pub fn inc_read_bytes(&self, path: &Path, bytes: u64) {
        counter!(READ_BYTES_TOTAL, "path" => path_label(path)).increment(bytes);
    }

    pub fn set_file_bytes(&self, path: &Path, size: u64) {
        gauge!(FILE_BYTES_TOTAL, "path" => path_label(path)).set(size as f64);
    }

    /// Remove the per-path series for a path whose Reader has stopped.
    ///
    /// The `metrics` facade has no "delete a series" call; zeroing every
    /// per-path series is the closest available signal, matching how the
    /// spec only requires the *value*, not the label set, to reflect
    /// reality after a stop.
    pub fn remove_path_series(&self, path: &Path) {
        let label = path_label(path);
        gauge!(FILE_BYTES_TOTAL, "path" => label.clone()).set(0.0);
        counter!(READ_BYTES_TOTAL, "path" => label.clone()).absolute(0);
        counter!(READ_LINES_TOTAL, "path" => label).absolute(0);
    }
}

fn path_label(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
