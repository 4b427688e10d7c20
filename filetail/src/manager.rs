//! The Target Manager channel contract.
//!
//! Only the message shape and delivery guarantee matter here — the actual
//! Target Manager (which tracks watched directories across many Targets)
//! lives in the enclosing agent, not in this crate.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::warn;

/// Which way a directory watch transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    WatchStart,
    WatchStop,
}

/// A single watch transition, sent to the Target Manager channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
}

impl WatchEvent {
    pub fn start(path: PathBuf) -> Self {
        Self {
            kind: WatchEventKind::WatchStart,
            path,
        }
    }

    pub fn stop(path: PathBuf) -> Self {
        Self {
            kind: WatchEventKind::WatchStop,
            path,
        }
    }
}

/// Send a [`WatchEvent`], retrying with a short backoff if the channel is
/// momentarily full instead of dropping it.
pub async fn emit(tx: &mpsc::Sender<WatchEvent>, event: WatchEvent) {
    let mut delay = std::time::Duration::from_millis(10);
    loop {
        match tx.try_send(event.clone()) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("target manager channel closed, dropping {:?}", event);
                return;
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(std::time::Duration::from_secs(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(4);
        emit(&tx, WatchEvent::start(PathBuf::from("/a"))).await;
        emit(&tx, WatchEvent::stop(PathBuf::from("/a"))).await;

        assert_eq!(rx.recv().await.unwrap().kind, WatchEventKind::WatchStart);
        assert_eq!(rx.recv().await.unwrap().kind, WatchEventKind::WatchStop);
    }

    #[tokio::test]
    async fn emit_retries_when_full_then_delivers() {
        let (tx, mut rx) = mpsc::channel(1);
        emit(&tx, WatchEvent::start(PathBuf::from("/a"))).await;

        let tx2 = tx.clone();
        let sender = tokio::spawn(async move {
            emit(&tx2, WatchEvent::start(PathBuf::from("/b"))).await;
        });

        // Drain the first message; the retrying send should then succeed.
        assert_eq!(rx.recv().await.unwrap().path, PathBuf::from("/a"));
        sender.await.unwrap();
        assert_eq!(rx.recv().await.unwrap().path, PathBuf::from("/b"));
    }
}
