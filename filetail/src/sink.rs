//! The Sink: the opaque downstream consumer of emitted log lines.
//!
//! The real parsing/labelling pipeline and remote forwarder live outside
//! this crate. [`ChannelSink`] is a reference implementation used by tests
//! and by any binary that just wants to observe what the Target reads.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SinkError;

/// One line read from a tailed file, labelled with the Target's static
/// labels plus its own path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub labels: BTreeMap<String, String>,
    pub path: PathBuf,
    pub line: String,
    pub read_at: SystemTime,
}

/// Downstream consumer of tailed lines.
///
/// Must be safe under concurrent senders: multiple Tailers call `send_line`
/// on the same `Sink` instance concurrently.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send_line(&self, line: LogLine) -> Result<(), SinkError>;
}

/// Reference `Sink` that forwards every line onto a bounded async channel.
///
/// Never blocks a Tailer indefinitely: `try_send` behaves like a
/// best-effort forward, and a full channel yields
/// `SinkError::Rejected` rather than awaiting forever, since a slow or
/// gone consumer must never wedge a Reader's read loop.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<LogLine>,
}

impl ChannelSink {
    /// Create a sink paired with a receiver of the given channel capacity.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LogLine>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn send_line(&self, line: LogLine) -> Result<(), SinkError> {
        self.tx.try_send(line).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                SinkError::Rejected("channel sink backlog full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_forwards_lines() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.send_line(LogLine {
            labels: BTreeMap::new(),
            path: PathBuf::from("/var/log/app.log"),
            line: "hello".to_string(),
            read_at: SystemTime::now(),
        })
        .await
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.line, "hello");
    }

    #[tokio::test]
    async fn channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);

        let result = sink
            .send_line(LogLine {
                labels: BTreeMap::new(),
                path: PathBuf::from("/var/log/app.log"),
                line: "hello".to_string(),
                read_at: SystemTime::now(),
            })
            .await;

        assert!(matches!(result, Err(SinkError::Closed)));
    }
}
