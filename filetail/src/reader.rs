//! The `Reader` capability: a tagged enum over the two Reader variants.
//!
//! A tagged enum with an inherent method per capability, rather than a
//! trait object, since there is no plugin point and exactly two variants
//! exist: a live-follow Tailer and a one-shot Decompressor.

use std::path::Path;

use crate::decompressor::Decompressor;
use crate::tailer::Tailer;

/// A running worker for one file: either a live-follow [`Tailer`] or a
/// one-shot [`Decompressor`]. Selected by `DecompressionConfig::enabled`
/// at the Target's call site.
pub enum Reader {
    Tailer(Tailer),
    Decompressor(Decompressor),
}

impl Reader {
    pub fn path(&self) -> &Path {
        match self {
            Reader::Tailer(t) => t.path(),
            Reader::Decompressor(d) => d.path(),
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Reader::Tailer(t) => t.is_running(),
            Reader::Decompressor(d) => d.is_running(),
        }
    }

    pub fn offset(&self) -> u64 {
        match self {
            Reader::Tailer(t) => t.offset(),
            Reader::Decompressor(d) => d.offset(),
        }
    }

    /// Stat the file, update `file_bytes_total`, and persist the current
    /// offset, regardless of which variant is running underneath.
    pub async fn mark_position_and_size(&self) {
        match self {
            Reader::Tailer(t) => t.mark_position_and_size().await,
            Reader::Decompressor(d) => d.mark_position_and_size().await,
        }
    }

    /// Signal the worker to stop and wait for its `done`/`posdone` (Tailer)
    /// or `done` (Decompressor) signals to fire.
    pub async fn stop(self) {
        match self {
            Reader::Tailer(t) => t.stop().await,
            Reader::Decompressor(d) => d.stop().await,
        }
    }

    #[cfg(test)]
    pub(crate) fn kill_for_test(&self) {
        match self {
            Reader::Tailer(t) => t.kill_for_test(),
            Reader::Decompressor(_) => unreachable!("only Tailer death is exercised by tests"),
        }
    }
}
