//! Glob-discovered, durably-tailed file target for a log-shipping agent.
//!
//! A [`Target`] discovers files matching an include/exclude glob pair,
//! keeps a [`Tailer`](tailer::Tailer) (or, for compressed snapshots, a
//! [`Decompressor`](decompressor::Decompressor)) on each, and checkpoints
//! progress through an injected [`PositionsStore`](positions::PositionsStore)
//! while forwarding lines to an injected [`Sink`](sink::Sink). Directory
//! watches and per-file readers are reconciled by [`Target::sync`] against
//! a live filesystem scan, with a filesystem-event fast path in between
//! reconciliation ticks.

pub mod config;
pub mod decompressor;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod positions;
pub mod reader;
pub mod sink;
pub mod tailer;
pub mod target;
pub mod watcher;

pub use config::{CompressionFormat, DecompressionConfig, Encoding, TargetConfig, WatchConfig};
pub use decompressor::Decompressor;
pub use error::{SinkError, TargetError, TargetResult};
pub use manager::{WatchEvent, WatchEventKind};
pub use metrics::Metrics;
pub use positions::{FilePositionsStore, MemoryPositionsStore, PositionsStore};
pub use reader::Reader;
pub use sink::{ChannelSink, LogLine, Sink};
pub use tailer::Tailer;
pub use target::Target;
pub use watcher::{FsEvent, FsEventKind, Watcher};
