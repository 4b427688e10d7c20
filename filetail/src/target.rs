//! The Target: the reconciler that diffs the filesystem against the live
//! set of watches and readers.
//!
//! A single long-running task owns all mutable state behind a
//! `CancellationToken` and reconciles it on a `tokio::select!` loop driven
//! by a ticker, the filesystem watcher, and an external command channel.
//! Glob discovery combines `globset` (matching) with `walkdir`
//! (enumeration), the pattern `globset`'s own docs recommend.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use globset::{GlobBuilder, GlobMatcher};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::{DecompressionConfig, Encoding, TargetConfig, WatchConfig};
use crate::decompressor::Decompressor;
use crate::error::{TargetError, TargetResult};
use crate::manager::{self, WatchEvent};
use crate::metrics::Metrics;
use crate::positions::PositionsStore;
use crate::reader::Reader;
use crate::sink::Sink;
use crate::tailer::Tailer;
use crate::watcher::{FsEvent, FsEventKind, Watcher};

/// A live Reader plus the replacement-identity counter the self-heal path
/// and the replacement-distinctness tests rely on.
struct ReaderEntry {
    reader: Reader,
    generation: u64,
}

/// Either the real `notify`-backed [`Watcher`], or a test-injected event
/// stream that stands in for it. `add`/`remove` on the injected variant
/// only track Target-local state and never touch the filesystem, so tests
/// can drive the event-handling path deterministically without a real
/// notifier.
enum EventSource {
    Real(Watcher),
    Injected { rx: mpsc::Receiver<FsEvent> },
}

/// What a single `EventSource::recv` produced, folded into one type so the
/// run loop's `select!` only ever needs one branch over `event_source`
/// (calling both `next_event` and `next_error` as separate branches would
/// require two simultaneous mutable borrows of the same field).
enum SourceSignal {
    Event(FsEvent),
    Error(notify::Error),
    Closed,
}

impl EventSource {
    fn add(&mut self, dir: &Path) -> TargetResult<()> {
        match self {
            EventSource::Real(w) => w.add(dir).map_err(|source| TargetError::WatcherAdd {
                path: dir.to_path_buf(),
                source,
            }),
            EventSource::Injected { .. } => Ok(()),
        }
    }

    fn remove(&mut self, dir: &Path) -> TargetResult<()> {
        match self {
            EventSource::Real(w) => w.remove(dir).map_err(|source| TargetError::WatcherRemove {
                path: dir.to_path_buf(),
                source,
            }),
            EventSource::Injected { .. } => Ok(()),
        }
    }

    async fn recv(&mut self) -> SourceSignal {
        match self {
            EventSource::Real(w) => {
                tokio::select! {
                    event = w.next_event() => match event {
                        Some(e) => SourceSignal::Event(e),
                        None => closed_backoff().await,
                    },
                    err = w.next_error() => match err {
                        Some(e) => SourceSignal::Error(e),
                        None => closed_backoff().await,
                    },
                }
            }
            EventSource::Injected { rx } => match rx.recv().await {
                Some(e) => SourceSignal::Event(e),
                None => closed_backoff().await,
            },
        }
    }

    fn close(&mut self) {
        if let EventSource::Real(w) = self {
            w.close();
        }
    }
}

/// A closed channel is re-polled every loop iteration otherwise, spinning
/// the run loop at 100% CPU; back off instead.
async fn closed_backoff() -> SourceSignal {
    tokio::time::sleep(Duration::from_secs(1)).await;
    SourceSignal::Closed
}

/// Messages understood by the run loop besides its own ticker/event
/// source. `ManualSync` lets [`Target::sync`] drive an immediate
/// reconciliation out-of-band from the ticker, useful when callers run
/// with a long sync period but still want a deterministic sync point.
enum Command {
    ManualSync(oneshot::Sender<TargetResult<()>>),
}

/// The file-discovery-and-tailing reconciler for one include/exclude glob
/// pair.
///
/// `Target` itself is a thin handle: the mutable `watches`/`readers` state
/// lives entirely inside the run loop task spawned by `new`, which is the
/// sole mutator of that state.
pub struct Target {
    ready: Arc<AtomicBool>,
    details: Arc<Mutex<HashMap<PathBuf, u64>>>,
    shutdown: CancellationToken,
    commands: mpsc::Sender<Command>,
    loop_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Target {
    /// Construct a Target and launch its run loop as a background task.
    ///
    /// `fs_events` may be supplied to replace the real `notify`-backed
    /// Watcher with an injected event stream for deterministic tests.
    #[allow(clippy::too_many_arguments)]
    #[instrument(
        name = "target_new",
        skip(metrics, sink, positions, labels, target_events, fs_events),
        fields(include = include_glob, exclude = ?exclude_glob)
    )]
    pub async fn new(
        metrics: Metrics,
        sink: Arc<dyn Sink>,
        positions: Arc<dyn PositionsStore>,
        include_glob: &str,
        exclude_glob: Option<&str>,
        labels: BTreeMap<String, String>,
        config: TargetConfig,
        watch_config: WatchConfig,
        target_events: mpsc::Sender<WatchEvent>,
        decompression_cfg: DecompressionConfig,
        encoding: Option<Encoding>,
        fs_events: Option<mpsc::Receiver<FsEvent>>,
    ) -> TargetResult<Self> {
        let include = compile_glob(include_glob)?;
        let exclude = exclude_glob.map(compile_glob).transpose()?;
        let root = literal_root(include_glob);

        let event_source = match fs_events {
            Some(rx) => EventSource::Injected { rx },
            None => {
                let watcher = Watcher::new().map_err(|source| TargetError::WatcherAdd {
                    path: root.clone(),
                    source,
                })?;
                EventSource::Real(watcher)
            }
        };

        let ready = Arc::new(AtomicBool::new(false));
        let details = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let state = RunState {
            include,
            exclude,
            root,
            readers: HashMap::new(),
            watches: HashSet::new(),
            event_source,
            next_generation: 0,
            metrics,
            sink,
            positions,
            labels,
            config,
            watch_config,
            target_events,
            decompression_cfg,
            encoding,
            ready: ready.clone(),
            details: details.clone(),
            shutdown: shutdown.clone(),
        };

        let loop_task = tokio::spawn(run_loop(state, commands_rx));

        Ok(Self {
            ready,
            details,
            shutdown,
            commands: commands_tx,
            loop_task: Mutex::new(Some(loop_task)),
        })
    }

    /// True iff at least one Reader is currently active.
    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Snapshot of path -> current offset for introspection.
    pub fn details(&self) -> HashMap<PathBuf, u64> {
        self.details.lock().unwrap().clone()
    }

    /// Drive one reconciliation pass immediately, out of band from the
    /// sync ticker, and return the result the run loop's `sync()`
    /// produced.
    pub async fn sync(&self) -> TargetResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::ManualSync(reply_tx)).await.is_err() {
            // Run loop already exited (e.g. concurrent stop()).
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    /// Idempotent graceful shutdown: stops all Readers, emits a final
    /// `WatchStop` per directory, and closes the Watcher adapter. Resolves
    /// once the run loop task has fully exited.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.loop_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct RunState {
    include: GlobMatcher,
    exclude: Option<GlobMatcher>,
    root: PathBuf,
    readers: HashMap<PathBuf, ReaderEntry>,
    watches: HashSet<PathBuf>,
    event_source: EventSource,
    next_generation: u64,
    metrics: Metrics,
    sink: Arc<dyn Sink>,
    positions: Arc<dyn PositionsStore>,
    labels: BTreeMap<String, String>,
    config: TargetConfig,
    watch_config: WatchConfig,
    target_events: mpsc::Sender<WatchEvent>,
    decompression_cfg: DecompressionConfig,
    encoding: Option<Encoding>,
    ready: Arc<AtomicBool>,
    details: Arc<Mutex<HashMap<PathBuf, u64>>>,
    shutdown: CancellationToken,
}

/// The run loop itself: a `select!` that only ever decides *which kind* of
/// signal arrived, then reacts to it outside the `select!` so the
/// reconciliation/event-handling methods are free to borrow `state`
/// mutably without tripping over a sibling branch's borrow of one of its
/// fields.
async fn run_loop(mut state: RunState, mut commands: mpsc::Receiver<Command>) {
    let mut ticker = tokio::time::interval(state.config.sync_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; consume it so the *next* tick
    // lands a full `sync_period` after construction rather than at once.
    ticker.tick().await;

    loop {
        enum Signal {
            Tick,
            Source(SourceSignal),
            Command(Command),
            Shutdown,
        }

        let signal = tokio::select! {
            _ = ticker.tick() => Signal::Tick,
            sig = state.event_source.recv() => Signal::Source(sig),
            Some(cmd) = commands.recv() => Signal::Command(cmd),
            _ = state.shutdown.cancelled() => Signal::Shutdown,
        };

        match signal {
            Signal::Tick => {
                if let Err(err) = state.sync().await {
                    warn!("sync failed: {}", err);
                }
            }
            Signal::Source(SourceSignal::Event(event)) => state.handle_fs_event(event).await,
            Signal::Source(SourceSignal::Error(err)) => warn!("watcher error: {}", err),
            Signal::Source(SourceSignal::Closed) => {}
            Signal::Command(Command::ManualSync(reply)) => {
                let result = state.sync().await;
                let _ = reply.send(result);
            }
            Signal::Shutdown => break,
        }
    }

    state.shutdown_all().await;
}

impl RunState {
    async fn handle_fs_event(&mut self, event: FsEvent) {
        match event.kind {
            FsEventKind::Create => {
                if self.matches(&event.path) && !self.readers.contains_key(&event.path) {
                    self.start_reader(event.path).await;
                    self.refresh_gauges();
                }
            }
            FsEventKind::Remove | FsEventKind::Rename => {
                if let Some(entry) = self.readers.remove(&event.path) {
                    entry.reader.stop().await;
                    self.positions.remove(&event.path);
                    self.metrics.remove_path_series(&event.path);
                    self.refresh_gauges();
                }
            }
            FsEventKind::Write | FsEventKind::Chmod => {
                // The Tailer handles continuous reads on its own.
            }
        }
    }

    fn matches(&self, path: &Path) -> bool {
        self.include.is_match(path) && !self.exclude.as_ref().is_some_and(|e| e.is_match(path))
    }

    /// Re-diff the filesystem against the live reader/watch sets: reap
    /// dead readers, expand the glob, start/stop readers, add/remove
    /// directory watches, and refresh the gauges.
    #[instrument(name = "target_sync", skip(self), fields(root = %self.root.display()))]
    async fn sync(&mut self) -> TargetResult<()> {
        // Reap dead readers first so a live-but-crashed Tailer is treated
        // as "missing from readers" for the rest of this pass, causing it
        // to be recreated at its last checkpointed offset rather than
        // torn down for good.
        let dead: Vec<PathBuf> = self
            .readers
            .iter()
            .filter(|(_, entry)| !entry.reader.is_running())
            .map(|(path, _)| path.clone())
            .collect();
        for path in dead {
            if let Some(entry) = self.readers.remove(&path) {
                entry.reader.stop().await;
            }
        }

        let matches = discover_matches(&self.root, &self.include, self.exclude.as_ref())?;

        let desired_dirs: HashSet<PathBuf> =
            matches.iter().filter_map(|p| p.parent().map(Path::to_path_buf)).collect();

        let matches_vec: Vec<PathBuf> = matches.iter().cloned().collect();
        for path in to_stop_tailing(&matches_vec, &self.readers) {
            if let Some(entry) = self.readers.remove(&path) {
                entry.reader.stop().await;
            }
            self.positions.remove(&path);
            self.metrics.remove_path_series(&path);
        }

        for path in matches.iter() {
            if !self.readers.contains_key(path) {
                self.start_reader(path.clone()).await;
            }
        }

        for dir in missing(&self.watches, &desired_dirs) {
            match self.event_source.add(&dir) {
                Ok(()) => {
                    self.watches.insert(dir.clone());
                    manager::emit(&self.target_events, WatchEvent::start(dir)).await;
                }
                Err(err) => warn!("failed to add watch: {}", err),
            }
        }
        for dir in missing(&desired_dirs, &self.watches) {
            match self.event_source.remove(&dir) {
                Ok(()) => {
                    self.watches.remove(&dir);
                    manager::emit(&self.target_events, WatchEvent::stop(dir)).await;
                }
                Err(err) => warn!("failed to remove watch: {}", err),
            }
        }

        self.refresh_gauges();
        Ok(())
    }

    async fn start_reader(&mut self, path: PathBuf) {
        let initial_offset = self.positions.get(&path);
        let generation = self.next_generation;
        self.next_generation += 1;

        let started: TargetResult<Reader> = if self.decompression_cfg.enabled {
            Decompressor::start(
                path.clone(),
                self.decompression_cfg.format,
                self.decompression_cfg.initial_delay,
                self.sink.clone(),
                self.positions.clone(),
                self.metrics.clone(),
                self.labels.clone(),
            )
            .map(Reader::Decompressor)
        } else {
            Tailer::start(
                path.clone(),
                initial_offset,
                self.encoding,
                self.sink.clone(),
                self.positions.clone(),
                self.metrics.clone(),
                self.config,
                self.watch_config,
                self.labels.clone(),
            )
            .await
            .map(Reader::Tailer)
        };

        match started {
            Ok(reader) => {
                debug!("started reader for {}", path.display());
                self.readers.insert(path, ReaderEntry { reader, generation });
            }
            Err(err) => {
                warn!("failed to start reader for {}: {}", path.display(), err);
            }
        }
    }

    fn refresh_gauges(&self) {
        self.metrics.set_active_files(self.readers.len());
        self.ready.store(!self.readers.is_empty(), Ordering::Release);
        let mut details = self.details.lock().unwrap();
        details.clear();
        for (path, entry) in &self.readers {
            details.insert(path.clone(), entry.reader.offset());
        }
    }

    async fn shutdown_all(&mut self) {
        for (_, entry) in self.readers.drain().collect::<Vec<_>>() {
            entry.reader.stop().await;
        }
        for dir in self.watches.drain().collect::<Vec<_>>() {
            manager::emit(&self.target_events, WatchEvent::stop(dir)).await;
        }
        self.event_source.close();
        self.ready.store(false, Ordering::Release);
        self.metrics.set_active_files(0);
        info!("target stopped");
    }
}

/// `existing.keys() \ new_targets` — the set of paths with an active
/// Reader that should be stopped because they no longer match. Order is
/// unspecified; callers that need a stable order should sort the result
/// themselves.
pub fn to_stop_tailing<V>(new_targets: &[PathBuf], existing: &HashMap<PathBuf, V>) -> Vec<PathBuf> {
    let new_set: HashSet<&PathBuf> = new_targets.iter().collect();
    existing.keys().filter(|p| !new_set.contains(p)).cloned().collect()
}

/// `b \ a` — what is in `b` but not in `a`. Note the argument order.
pub fn missing(a: &HashSet<PathBuf>, b: &HashSet<PathBuf>) -> HashSet<PathBuf> {
    b.difference(a).cloned().collect()
}

fn compile_glob(pattern: &str) -> TargetResult<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|source| TargetError::InvalidGlob {
            pattern: pattern.to_string(),
            source,
        })
}

/// The longest path prefix of `pattern` containing no glob metacharacters,
/// used as the `walkdir` root so discovery doesn't have to enumerate the
/// whole filesystem for a pattern like `/var/log/app/*.log`.
fn literal_root(pattern: &str) -> PathBuf {
    let mut root = PathBuf::new();
    for component in Path::new(pattern).components() {
        let piece = component.as_os_str().to_string_lossy();
        if piece.contains(['*', '?', '[', '{']) {
            break;
        }
        root.push(component);
    }
    if root.as_os_str().is_empty() { PathBuf::from(".") } else { root }
}

/// Expand the include glob against the live filesystem, rooted at the
/// pattern's literal prefix, dropping anything matched by the exclude
/// glob. A missing root directory is "no matches", not an error — the
/// directory may simply not have been created yet.
fn discover_matches(
    root: &Path,
    include: &GlobMatcher,
    exclude: Option<&GlobMatcher>,
) -> TargetResult<BTreeSet<PathBuf>> {
    if !root.exists() {
        return Ok(BTreeSet::new());
    }

    let mut matches = BTreeSet::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|err| TargetError::GlobExpansion(std::io::Error::other(err)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if include.is_match(path) && !exclude.is_some_and(|e| e.is_match(path)) {
            matches.insert(path.to_path_buf());
        }
    }
    Ok(matches)
}
