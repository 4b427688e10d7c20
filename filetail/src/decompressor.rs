//! The Decompressor: a one-shot Reader variant for compressed snapshots.
//!
//! Follows the Tailer's idiom of two cooperating tasks sharing atomics and
//! a `CancellationToken`, but runs end-to-end exactly once instead of
//! following forever.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bzip2::read::BzDecoder;
use flate2::read::{GzDecoder, ZlibDecoder};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CompressionFormat;
use crate::error::{TargetError, TargetResult};
use crate::metrics::Metrics;
use crate::positions::PositionsStore;
use crate::sink::{LogLine, Sink};

/// Reads a compressed snapshot exactly once, end to end, then reports
/// `is_running() == false`. The "offset" it tracks is the number of
/// decompressed bytes consumed so far, monotonically increasing.
pub struct Decompressor {
    path: PathBuf,
    offset: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    positions: Arc<dyn PositionsStore>,
    metrics: Metrics,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    done_rx: oneshot::Receiver<()>,
}

impl Decompressor {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        path: PathBuf,
        format: CompressionFormat,
        initial_delay: Duration,
        sink: Arc<dyn Sink>,
        positions: Arc<dyn PositionsStore>,
        metrics: Metrics,
        labels: BTreeMap<String, String>,
    ) -> TargetResult<Self> {
        if !path.exists() {
            return Err(TargetError::TailerStart {
                path: path.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let offset = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        let task = tokio::spawn(decompress_once(
            path.clone(),
            format,
            initial_delay,
            offset.clone(),
            running.clone(),
            cancel.clone(),
            sink,
            positions.clone(),
            metrics.clone(),
            labels,
            done_tx,
        ));

        Ok(Self {
            path,
            offset,
            running,
            positions,
            metrics,
            cancel,
            task,
            done_rx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Stat the file, update `file_bytes_total`, and persist the current
    /// offset. The worker already does this once at EOF; exposed so
    /// callers can force the same checkpoint out of band, matching the
    /// capability the Tailer variant exposes.
    pub async fn mark_position_and_size(&self) {
        let offset = self.offset();
        if let Ok(meta) = tokio::fs::metadata(&self.path).await {
            self.metrics.set_file_bytes(&self.path, meta.len());
        }
        self.positions.put(&self.path, offset);
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        let _ = self.task.await;
        let _ = (&mut self.done_rx).await;
    }
}

fn open_decoder(path: &Path, format: CompressionFormat) -> std::io::Result<Box<dyn Read + Send>> {
    let file = std::fs::File::open(path)?;
    Ok(match format {
        CompressionFormat::Gz => Box::new(GzDecoder::new(file)),
        CompressionFormat::Z => Box::new(ZlibDecoder::new(file)),
        CompressionFormat::Bz2 => Box::new(BzDecoder::new(file)),
    })
}

#[allow(clippy::too_many_arguments)]
async fn decompress_once(
    path: PathBuf,
    format: CompressionFormat,
    initial_delay: Duration,
    offset: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
    sink: Arc<dyn Sink>,
    positions: Arc<dyn PositionsStore>,
    metrics: Metrics,
    labels: BTreeMap<String, String>,
    done_tx: oneshot::Sender<()>,
) {
    tokio::select! {
        _ = tokio::time::sleep(initial_delay) => {}
        _ = cancel.cancelled() => {
            running.store(false, Ordering::Release);
            let _ = done_tx.send(());
            return;
        }
    }

    // Decompression is synchronous (no async gzip reader in the
    // dependency set), so it runs on a blocking thread and the lines are
    // handed back over a channel for the async sink/positions calls.
    let (lines_tx, mut lines_rx) = tokio::sync::mpsc::channel::<String>(256);
    let blocking_path = path.clone();
    let blocking = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let decoder = open_decoder(&blocking_path, format)?;
        let reader = std::io::BufReader::new(decoder);
        for line in std::io::BufRead::lines(reader) {
            let line = line?;
            if lines_tx.blocking_send(line).is_err() {
                break;
            }
        }
        Ok(())
    });

    loop {
        tokio::select! {
            maybe_line = lines_rx.recv() => {
                match maybe_line {
                    Some(line) => {
                        let bytes = line.len() as u64 + 1;
                        offset.fetch_add(bytes, Ordering::AcqRel);
                        metrics.inc_read_lines(&path, 1);
                        metrics.inc_read_bytes(&path, bytes);

                        let log_line = LogLine {
                            labels: labels.clone(),
                            path: path.clone(),
                            line,
                            read_at: SystemTime::now(),
                        };
                        if let Err(err) = sink.send_line(log_line).await {
                            debug!("sink rejected decompressed line from {}: {}", path.display(), err);
                        }
                    }
                    None => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    if let Err(err) = blocking.await {
        debug!("decompression task for {} ended abnormally: {}", path.display(), err);
    }

    let final_offset = offset.load(Ordering::Acquire);
    positions.put(&path, final_offset);
    metrics.set_file_bytes(&path, final_offset);

    running.store(false, Ordering::Release);
    let _ = done_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::MemoryPositionsStore;
    use crate::sink::ChannelSink;
    use std::io::Write as _;

    #[tokio::test]
    async fn reads_gzipped_snapshot_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.log.gz");

        {
            let file = std::fs::File::create(&path).unwrap();
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            writeln!(encoder, "line one").unwrap();
            writeln!(encoder, "line two").unwrap();
            encoder.finish().unwrap();
        }

        let (sink, mut rx) = ChannelSink::new(16);
        let positions = Arc::new(MemoryPositionsStore::new());
        let decompressor = Decompressor::start(
            path.clone(),
            CompressionFormat::Gz,
            Duration::ZERO,
            Arc::new(sink),
            positions.clone(),
            Metrics::new(),
            BTreeMap::new(),
        )
        .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.line, "line one");
        assert_eq!(second.line, "line two");

        // Drain to EOF so the background task flips `running` to false.
        tokio::time::timeout(Duration::from_secs(5), async {
            while decompressor.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(!decompressor.is_running());
        assert!(positions.get(&path) > 0);

        decompressor.stop().await;
    }

    #[tokio::test]
    async fn missing_file_fails_fast() {
        let positions = Arc::new(MemoryPositionsStore::new());
        let (sink, _rx) = ChannelSink::new(4);
        let result = Decompressor::start(
            PathBuf::from("/does/not/exist.gz"),
            CompressionFormat::Gz,
            Duration::ZERO,
            Arc::new(sink),
            positions,
            Metrics::new(),
            BTreeMap::new(),
        );
        assert!(result.is_err());
    }
}
