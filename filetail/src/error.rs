use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Errors surfaced by the [`Target`](crate::target::Target) reconciler.
///
/// Only construction-time errors (`InvalidGlob`) propagate out of
/// `Target::new`; every other variant is logged by the event loop and
/// retried on the next sync tick.
#[derive(Debug, Error, Diagnostic)]
pub enum TargetError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to expand glob against the filesystem: {0}")]
    GlobExpansion(#[source] std::io::Error),

    #[error("failed to start tailer for {path}: {source}")]
    TailerStart {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to add watch for directory {path}: {source}")]
    WatcherAdd {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("failed to remove watch for directory {path}: {source}")]
    WatcherRemove {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

pub type TargetResult<T> = std::result::Result<T, TargetError>;

/// Errors a [`Sink`](crate::sink::Sink) implementation may return.
///
/// Never fatal to a Tailer: errors are logged and dropped.
#[derive(Debug, Error, Diagnostic)]
pub enum SinkError {
    #[error("sink channel closed")]
    Closed,

    #[error("sink rejected line: {0}")]
    Rejected(String),
}
