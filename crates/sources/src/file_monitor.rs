use std::{
    collections::{
        HashMap,
        HashSet,
        VecDeque,
    },
    fs::File,
    io::{
        BufRead,
        BufReader,
        Seek,
        SeekFrom,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use config::schema::{
    DropPolicy,
    FileMonitorConfig,
    SeekStrategy,
};
use core_types::{
    Position,
    SourceKind,
};
use dispatcher::{
    DispatcherHandle,
    HandleOutcome,
};
use parking_lot::Mutex;
use runtime::{
    Runtime,
    SpawnHandle,
};
use tokio_util::sync::CancellationToken;

use crate::position_store::PositionStore;

/// How often a reader task polls a file it believes is at EOF for new
/// bytes, and how often the watch bridge drains the `notify` channel.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Discovers log files from static paths and glob patterns, tails each one
/// with its own reader task, and persists read offsets through a
/// [`PositionStore`]. New files matching a watched directory are picked up
/// via `notify`; a periodic rescan is the fallback in case an event is
/// missed.
pub struct FileMonitor<RT: Runtime> {
    runtime: RT,
    config: FileMonitorConfig,
    dispatcher: DispatcherHandle,
    position_store: Arc<PositionStore>,
    started_at: chrono::DateTime<Utc>,
    cancellation: CancellationToken,
    readers: Mutex<HashMap<PathBuf, Box<dyn SpawnHandle>>>,
    watch_handle: Mutex<Option<Box<dyn SpawnHandle>>>,
    rescan_handle: Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl<RT: Runtime> FileMonitor<RT> {
    pub fn start(
        runtime: RT,
        config: FileMonitorConfig,
        dispatcher: DispatcherHandle,
        position_store: Arc<PositionStore>,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            runtime: runtime.clone(),
            config,
            dispatcher,
            position_store,
            started_at: Utc::now(),
            cancellation: CancellationToken::new(),
            readers: Mutex::new(HashMap::new()),
            watch_handle: Mutex::new(None),
            rescan_handle: Mutex::new(None),
        });

        monitor.reconcile();

        let (watch_tx, mut watch_rx) = tokio::sync::mpsc::channel::<notify::Event>(256);
        let watch_dirs = monitor.watched_directories();
        let watch_handle = runtime.spawn("file_monitor_watch_bridge", watch_bridge(runtime.clone(), watch_dirs, watch_tx));
        *monitor.watch_handle.lock() = Some(watch_handle);

        let rescan_monitor = monitor.clone();
        let rescan_cancellation = monitor.cancellation.clone();
        let rescan_handle = runtime.spawn("file_monitor_rescan", async move {
            loop {
                tokio::select! {
                    biased;
                    () = rescan_cancellation.cancelled() => break,
                    event = watch_rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        rescan_monitor.reconcile();
                    },
                    () = tokio::time::sleep(Duration::from_secs(30)) => {
                        rescan_monitor.reconcile();
                    },
                }
            }
        });
        *monitor.rescan_handle.lock() = Some(rescan_handle);

        monitor
    }

    pub async fn stop(&self) {
        self.cancellation.cancel();
        if let Some(mut handle) = self.watch_handle.lock().take() {
            handle.shutdown();
            let _ = handle.join().await;
        }
        if let Some(mut handle) = self.rescan_handle.lock().take() {
            let _ = handle.join().await;
        }
        let readers = std::mem::take(&mut *self.readers.lock());
        for (_, mut handle) in readers {
            let _ = handle.join().await;
        }
    }

    /// Number of files currently being tailed. Used by the admin health
    /// endpoint; zero doesn't necessarily mean unhealthy (no matching files
    /// may simply exist yet), just idle.
    pub fn tracked_count(&self) -> usize {
        self.readers.lock().len()
    }

    fn watched_directories(&self) -> Vec<PathBuf> {
        let mut dirs = HashSet::new();
        for pattern in &self.config.paths {
            let base = glob_base_dir(pattern);
            dirs.insert(base);
        }
        dirs.into_iter().collect()
    }

    /// Expands configured paths/globs, starts a reader for every file not
    /// already being tailed, and drops readers for files that vanished.
    fn reconcile(self: &Arc<Self>) {
        let discovered = discover_files(&self.config.paths);
        let mut readers = self.readers.lock();

        readers.retain(|path, _| discovered.contains(path));

        for path in discovered {
            if readers.contains_key(&path) {
                continue;
            }
            if self.config.ignore_old_timestamps && file_is_stale(&path, self.started_at) {
                tracing::debug!(path = %path.display(), "skipping file older than monitor startup");
                continue;
            }
            let reader_runtime = self.runtime.clone();
            let reader_config = self.config.clone();
            let reader_dispatcher = self.dispatcher.clone();
            let reader_position_store = self.position_store.clone();
            let reader_cancellation = self.cancellation.clone();
            let reader_path = path.clone();
            let handle = self.runtime.spawn(
                "file_monitor_reader",
                run_reader(
                    reader_runtime,
                    reader_path,
                    reader_config,
                    reader_dispatcher,
                    reader_position_store,
                    reader_cancellation,
                ),
            );
            readers.insert(path, handle);
        }

        crate::metrics::set_files_tracked(readers.len());
    }
}

fn glob_base_dir(pattern: &str) -> PathBuf {
    let path = Path::new(pattern);
    let mut base = PathBuf::new();
    for component in path.components() {
        let s = component.as_os_str().to_string_lossy();
        if s.contains(['*', '?', '[']) {
            break;
        }
        base.push(component);
    }
    if base.as_os_str().is_empty() {
        PathBuf::from(".")
    } else if base.is_file() {
        base.parent().map(Path::to_path_buf).unwrap_or(base)
    } else {
        base
    }
}

fn discover_files(patterns: &[String]) -> HashSet<PathBuf> {
    let mut files = HashSet::new();
    for pattern in patterns {
        if !pattern.contains(['*', '?', '[']) {
            let path = PathBuf::from(pattern);
            if path.is_file() {
                files.insert(path);
            }
            continue;
        }
        match glob::glob(pattern) {
            Ok(paths) => {
                for entry in paths.flatten() {
                    if entry.is_file() {
                        files.insert(entry);
                    }
                }
            },
            Err(e) => tracing::warn!(pattern, error = %e, "invalid file monitor glob pattern"),
        }
    }
    files
}

fn file_is_stale(path: &Path, started_at: chrono::DateTime<Utc>) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| chrono::DateTime::<Utc>::from(modified) < started_at)
        .unwrap_or(false)
}

#[cfg(unix)]
fn file_inode(metadata: &std::fs::Metadata) -> u64 {
    std::os::unix::fs::MetadataExt::ino(metadata)
}

#[cfg(not(unix))]
fn file_inode(metadata: &std::fs::Metadata) -> u64 {
    // No stable inode off Unix; file identity degrades to "same path",
    // which still lets rotation-by-shrink detection work.
    let _ = metadata;
    0
}

struct PendingRecord {
    message: Vec<u8>,
    timestamp: chrono::DateTime<Utc>,
}

/// Per-file bounded backlog for records the dispatcher rejected with
/// `Full`. Retried with its own backoff, distinct from the dispatcher's
/// or a sink's: this is purely local-queue pressure, not a downstream
/// fault, so it shouldn't open any circuit breaker.
struct RetryQueue {
    items: VecDeque<PendingRecord>,
    capacity: usize,
    drop_policy: DropPolicy,
    next_delay: Duration,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
}

const SOURCE_KIND_LABEL: &str = "file";

impl RetryQueue {
    fn new(config: &config::schema::RetryQueueConfig, capacity: usize) -> Self {
        let initial_delay = Duration::from_millis(config.initial_delay_ms);
        Self {
            items: VecDeque::new(),
            capacity,
            drop_policy: config.drop_policy,
            next_delay: initial_delay,
            initial_delay,
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
        }
    }

    fn push(&mut self, record: PendingRecord) {
        crate::metrics::record_retried(SOURCE_KIND_LABEL);
        if self.items.len() >= self.capacity {
            crate::metrics::record_dropped(SOURCE_KIND_LABEL);
            match self.drop_policy {
                DropPolicy::Oldest => {
                    self.items.pop_front();
                },
                DropPolicy::Newest => return,
                DropPolicy::Random => {
                    let idx = rand::random::<usize>() % self.items.len();
                    self.items.remove(idx);
                },
            }
        }
        self.items.push_back(record);
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn on_retry_failure(&mut self) {
        self.next_delay = Duration::from_secs_f64((self.next_delay.as_secs_f64() * self.multiplier).min(self.max_delay.as_secs_f64()));
    }

    fn reset_delay(&mut self) {
        self.next_delay = self.initial_delay;
    }
}

async fn run_reader<RT: Runtime>(
    runtime: RT,
    path: PathBuf,
    config: FileMonitorConfig,
    dispatcher: DispatcherHandle,
    position_store: Arc<PositionStore>,
    cancellation: CancellationToken,
) {
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to open file for tailing");
            return;
        },
    };
    let metadata = match file.metadata() {
        Ok(m) => m,
        Err(_) => return,
    };
    let mut inode = file_inode(&metadata);
    let source_id = path.to_string_lossy().into_owned();

    let start_offset = match position_store.get(&source_id, inode) {
        Some(position) => position.offset,
        None => initial_offset(&config.seek_strategy, config.seek_recent_bytes, metadata.len()),
    };
    if file.seek(SeekFrom::Start(start_offset)).is_err() {
        let _ = file.seek(SeekFrom::Start(0));
    }

    let mut reader = BufReader::new(file);
    let mut offset = start_offset;
    let mut retry_queue = RetryQueue::new(&config.retry, config.max_retry_queue_size);
    let mut line = Vec::new();

    loop {
        if cancellation.is_cancelled() {
            return;
        }

        drain_retry_queue(&runtime, &dispatcher, &mut retry_queue, &source_id).await;

        line.clear();
        let read = reader.read_until(b'\n', &mut line);
        match read {
            Ok(0) => {
                match check_rotation(&path, inode) {
                    RotationCheck::Rotated(new_metadata) => {
                        position_store.record(Position::new(source_id.clone(), inode).advance(offset, Utc::now()).unwrap_or(Position::new(source_id.clone(), inode)));
                        inode = file_inode(&new_metadata);
                        match File::open(&path) {
                            Ok(new_file) => {
                                reader = BufReader::new(new_file);
                                offset = 0;
                            },
                            Err(e) => {
                                tracing::warn!(path = %path.display(), error = %e, "failed to reopen rotated file");
                                return;
                            },
                        }
                        continue;
                    },
                    RotationCheck::Gone => return,
                    RotationCheck::Unchanged => {},
                }
                tokio::select! {
                    biased;
                    () = cancellation.cancelled() => return,
                    () = tokio::time::sleep(POLL_INTERVAL) => {},
                }
            },
            Ok(n) => {
                offset += n as u64;
                let mut message = std::mem::take(&mut line);
                if message.last() == Some(&b'\n') {
                    message.pop();
                    if message.last() == Some(&b'\r') {
                        message.pop();
                    }
                }
                let now = Utc::now();
                crate::metrics::record_read(SOURCE_KIND_LABEL);
                dispatch_or_queue(&dispatcher, &mut retry_queue, &source_id, message, now);
                if let Some(position) = position_store.get(&source_id, inode).unwrap_or(Position::new(source_id.clone(), inode)).advance(offset, now) {
                    position_store.record(position);
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "error reading tailed file");
                return;
            },
        }
    }
}

fn dispatch_or_queue(dispatcher: &DispatcherHandle, retry_queue: &mut RetryQueue, source_id: &str, message: Vec<u8>, timestamp: chrono::DateTime<Utc>) {
    let outcome = dispatcher.handle(SourceKind::File, source_id, message.clone(), HashMap::new(), timestamp, Utc::now());
    match outcome {
        HandleOutcome::Accepted => {},
        HandleOutcome::Full => retry_queue.push(PendingRecord { message, timestamp }),
        HandleOutcome::ShuttingDown => {},
    }
}

async fn drain_retry_queue<RT: Runtime>(runtime: &RT, dispatcher: &DispatcherHandle, retry_queue: &mut RetryQueue, source_id: &str) {
    if retry_queue.is_empty() {
        return;
    }
    runtime.wait(retry_queue.next_delay).await;
    let mut redelivered_all = true;
    let pending: Vec<PendingRecord> = retry_queue.items.drain(..).collect();
    for record in pending {
        match dispatcher.handle(SourceKind::File, source_id, record.message.clone(), HashMap::new(), record.timestamp, Utc::now()) {
            HandleOutcome::Accepted => {},
            HandleOutcome::Full => {
                redelivered_all = false;
                retry_queue.items.push_back(record);
            },
            HandleOutcome::ShuttingDown => {
                retry_queue.items.push_back(record);
            },
        }
    }
    if redelivered_all {
        retry_queue.reset_delay();
    } else {
        retry_queue.on_retry_failure();
    }
}

enum RotationCheck {
    Unchanged,
    Rotated(std::fs::Metadata),
    Gone,
}

fn check_rotation(path: &Path, current_inode: u64) -> RotationCheck {
    match std::fs::metadata(path) {
        Ok(metadata) => {
            if file_inode(&metadata) != current_inode {
                RotationCheck::Rotated(metadata)
            } else {
                RotationCheck::Unchanged
            }
        },
        Err(_) => RotationCheck::Gone,
    }
}

fn initial_offset(strategy: &SeekStrategy, seek_recent_bytes: u64, file_len: u64) -> u64 {
    match strategy {
        SeekStrategy::Beginning => 0,
        SeekStrategy::End => file_len,
        SeekStrategy::Recent => file_len.saturating_sub(seek_recent_bytes),
    }
}

/// Bridges `notify`'s callback-based watcher into the async world without
/// ever blocking inside a task the executor might be asked to run
/// cooperatively: the watcher's callback does a non-blocking `try_send`
/// into a std channel, and this task drains that channel with `try_recv`
/// on a short poll loop rather than a blocking `recv`.
async fn watch_bridge<RT: Runtime>(runtime: RT, directories: Vec<PathBuf>, tx: tokio::sync::mpsc::Sender<notify::Event>) {
    use notify::Watcher;

    let (std_tx, std_rx) = std::sync::mpsc::channel();
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            let _ = std_tx.send(event);
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to start file watcher, falling back to periodic rescan only");
            return;
        },
    };

    for dir in &directories {
        if let Err(e) = watcher.watch(dir, notify::RecursiveMode::NonRecursive) {
            tracing::debug!(dir = %dir.display(), error = %e, "could not watch directory");
        }
    }

    loop {
        match std_rx.try_recv() {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    return;
                }
            },
            Err(std::sync::mpsc::TryRecvError::Empty) => {
                runtime.wait(POLL_INTERVAL).await;
            },
            Err(std::sync::mpsc::TryRecvError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use config::schema::RetryQueueConfig;
    use runtime::testing::TestRuntime;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn retry_queue_drops_oldest_when_full() {
        let mut queue = RetryQueue::new(
            &RetryQueueConfig {
                initial_delay_ms: 10,
                max_delay_ms: 100,
                multiplier: 2.0,
                drop_policy: DropPolicy::Oldest,
            },
            2,
        );
        queue.push(PendingRecord { message: b"a".to_vec(), timestamp: Utc::now() });
        queue.push(PendingRecord { message: b"b".to_vec(), timestamp: Utc::now() });
        queue.push(PendingRecord { message: b"c".to_vec(), timestamp: Utc::now() });
        assert_eq!(queue.items.len(), 2);
        assert_eq!(queue.items[0].message, b"b");
        assert_eq!(queue.items[1].message, b"c");
    }

    #[tokio::test(start_paused = true)]
    async fn reader_tails_appended_lines() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let log_path = dir.path().join("app.log");
        {
            let mut f = File::create(&log_path)?;
            writeln!(f, "first line")?;
        }

        let rt = TestRuntime::new(0);
        let position_store = PositionStore::start(rt.clone(), dir.path().join("positions.json"), Duration::from_secs(5))?;
        let sinks = Arc::new(parking_lot::RwLock::new(std::collections::BTreeMap::new()));
        let dispatcher = DispatcherHandle::start(rt.clone(), config::schema::DispatcherConfig::default(), sinks);

        let config = FileMonitorConfig {
            enabled: true,
            paths: vec![log_path.to_string_lossy().into_owned()],
            seek_strategy: SeekStrategy::Beginning,
            ..Default::default()
        };
        let monitor = FileMonitor::start(rt, config, dispatcher.clone(), position_store);
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&log_path)?;
            writeln!(f, "second line")?;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(dispatcher.total_processed() >= 1);
        monitor.stop().await;
        Ok(())
    }
}
