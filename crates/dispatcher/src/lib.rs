//! The single entry point records flow through on their way from a source
//! monitor to every enabled sink: a bounded, sharded queue; a fixed worker
//! pool that accumulates and fans batches out; back-pressure signaling when
//! the queue fills; and a cooperative, timed shutdown that drains in flight
//! before stopping every sink.
use std::{
    collections::{
        hash_map::DefaultHasher,
        BTreeMap,
    },
    hash::{
        Hash,
        Hasher,
    },
    sync::{
        atomic::{
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use chrono::{
    DateTime,
    Utc,
};
use config::schema::DispatcherConfig;
use core_types::{
    Record,
    Sink,
    SourceKind,
};
use parking_lot::RwLock;
use runtime::{
    Runtime,
    SpawnHandle,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod metrics;
mod worker;

/// Result of a call to [`DispatcherHandle::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Accepted,
    /// The hard back-pressure threshold was hit; the caller should retry,
    /// queue locally, or drop per its own policy.
    Full,
    ShuttingDown,
}

struct Inner {
    shards: Vec<mpsc::Sender<Arc<Record>>>,
    shard_capacity: usize,
    queue_depth: Arc<AtomicUsize>,
    total_processed: AtomicU64,
    total_dropped: AtomicU64,
    backpressure_soft: f64,
    backpressure_hard: f64,
    /// Set at the start of shutdown so `handle()` rejects new records
    /// immediately. Distinct from `cancellation`, which forcibly stops the
    /// worker pool only after the drain grace period -- conflating the two
    /// would make workers abandon the drain the instant shutdown begins.
    stopping: std::sync::atomic::AtomicBool,
    cancellation: CancellationToken,
    sinks: Arc<RwLock<BTreeMap<String, Arc<dyn Sink>>>>,
    worker_handles: parking_lot::Mutex<Vec<Box<dyn SpawnHandle>>>,
    shutdown_grace: Duration,
}

/// A cheaply-clonable front door to the dispatcher. Source monitors call
/// [`handle`](Self::handle); nothing else about the dispatcher's internals
/// needs to be visible to them.
#[derive(Clone)]
pub struct DispatcherHandle {
    inner: Arc<Inner>,
}

impl DispatcherHandle {
    /// Starts the worker pool and returns a handle. `sinks` is consulted in
    /// its (lexicographic, i.e. `BTreeMap`) key order on every fan-out, so
    /// fan-out order is deterministic across restarts given the same sink
    /// names.
    pub fn start<RT: Runtime>(
        runtime: RT,
        config: DispatcherConfig,
        sinks: Arc<RwLock<BTreeMap<String, Arc<dyn Sink>>>>,
    ) -> Self {
        let worker_count = config.worker_count.max(1) as usize;
        let shard_capacity = (config.queue_size / worker_count).max(1);
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let cancellation = CancellationToken::new();

        let mut shards = Vec::with_capacity(worker_count);
        let mut worker_handles: Vec<Box<dyn SpawnHandle>> = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel(shard_capacity);
            shards.push(tx);
            let worker_runtime = runtime.clone();
            let worker_sinks = sinks.clone();
            let worker_batch_processor = config.batch_processor.clone();
            let worker_send_timeout = config.send_timeout();
            let worker_queue_depth = queue_depth.clone();
            let worker_cancellation = cancellation.clone();
            let handle = runtime.spawn(
                "dispatcher_worker",
                worker::run(
                    worker_runtime,
                    rx,
                    worker_sinks,
                    worker_batch_processor,
                    worker_send_timeout,
                    worker_queue_depth,
                    worker_cancellation,
                ),
            );
            worker_handles.push(handle);
        }

        DispatcherHandle {
            inner: Arc::new(Inner {
                shards,
                shard_capacity,
                queue_depth,
                total_processed: AtomicU64::new(0),
                total_dropped: AtomicU64::new(0),
                backpressure_soft: config.backpressure.soft,
                backpressure_hard: config.backpressure.hard,
                stopping: std::sync::atomic::AtomicBool::new(false),
                cancellation,
                sinks,
                worker_handles: parking_lot::Mutex::new(worker_handles),
                shutdown_grace: config.shutdown_grace(),
            }),
        }
    }

    /// Accepts one record for dispatch, hashing `source_id` to a shard so
    /// records from the same source are always handled by the same worker
    /// (preserving their arrival order end to end).
    pub fn handle(
        &self,
        source_kind: SourceKind,
        source_id: &str,
        message: Vec<u8>,
        labels: std::collections::HashMap<String, String>,
        timestamp: DateTime<Utc>,
        ingested_at: DateTime<Utc>,
    ) -> HandleOutcome {
        if self.inner.stopping.load(Ordering::Relaxed) {
            return HandleOutcome::ShuttingDown;
        }

        let capacity = self.inner.shards.len() * self.inner.shard_capacity;
        let depth = self.inner.queue_depth.load(Ordering::Relaxed);
        let fill_ratio = depth as f64 / capacity.max(1) as f64;
        if fill_ratio >= self.inner.backpressure_hard {
            self.inner.total_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_dropped(1);
            return HandleOutcome::Full;
        }
        if fill_ratio >= self.inner.backpressure_soft {
            tracing::debug!(fill_ratio, "dispatcher queue above soft back-pressure threshold");
        }

        let mut record = Record::new(source_kind, source_id, message, timestamp, ingested_at);
        record.labels = labels;

        let shard = shard_for(source_id, self.inner.shards.len());
        match self.inner.shards[shard].try_send(Arc::new(record)) {
            Ok(()) => {
                self.inner.queue_depth.fetch_add(1, Ordering::Relaxed);
                self.inner.total_processed.fetch_add(1, Ordering::Relaxed);
                metrics::record_accepted();
                metrics::set_queue_depth(self.inner.queue_depth.load(Ordering::Relaxed));
                HandleOutcome::Accepted
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.total_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_dropped(1);
                HandleOutcome::Full
            },
            Err(mpsc::error::TrySendError::Closed(_)) => HandleOutcome::ShuttingDown,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue_depth.load(Ordering::Relaxed)
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.shards.len() * self.inner.shard_capacity
    }

    pub fn total_processed(&self) -> u64 {
        self.inner.total_processed.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.inner.total_dropped.load(Ordering::Relaxed)
    }

    /// Snapshot of every currently registered sink, in fan-out order. Used
    /// by the admin health endpoint to report per-sink status.
    pub fn sinks(&self) -> Vec<(String, Arc<dyn Sink>)> {
        self.inner.sinks.read().iter().map(|(name, sink)| (name.clone(), sink.clone())).collect()
    }

    /// Stops accepting new records, gives queued ones `shutdown_grace` to
    /// drain through the worker pool, then cancels any workers still
    /// running and stops every sink in parallel (itself bounded by each
    /// sink's own `stop()` behavior).
    pub async fn shutdown(&self) {
        tracing::info!("dispatcher shutting down, draining queue");
        self.inner.stopping.store(true, Ordering::Relaxed);

        // Workers keep draining already-queued records (their select! isn't
        // cancelled yet) for up to the configured grace period.
        let grace = self.inner.shutdown_grace;
        let drained = tokio::time::timeout(grace, self.wait_for_empty_queue());
        if drained.await.is_err() {
            tracing::warn!("dispatcher shutdown grace period elapsed with records still queued");
        }
        self.inner.cancellation.cancel();

        let mut handles = self.inner.worker_handles.lock();
        for handle in handles.iter_mut() {
            handle.shutdown();
        }
        for mut handle in std::mem::take(&mut *handles) {
            if let Err(e) = handle.join().await {
                tracing::warn!(error = %e, "dispatcher worker did not shut down cleanly");
            }
        }
        drop(handles);

        let sinks: Vec<Arc<dyn Sink>> = self.inner.sinks.read().values().cloned().collect();
        let stops = sinks.into_iter().map(|sink| async move {
            if let Err(e) = sink.stop().await {
                tracing::warn!(sink = sink.name(), error = %e, "sink failed to stop cleanly");
            }
        });
        futures::future::join_all(stops).await;
    }

    async fn wait_for_empty_queue(&self) {
        while self.inner.queue_depth.load(Ordering::Relaxed) > 0 {
            tokio::task::yield_now().await;
        }
    }
}

fn shard_for(source_id: &str, num_shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    source_id.hash(&mut hasher);
    (hasher.finish() as usize) % num_shards.max(1)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex as StdMutex,
    };

    use async_trait::async_trait;
    use config::schema::{
        BackpressureConfig,
        BatchProcessorConfig,
    };
    use core_types::SinkSendError;
    use runtime::testing::TestRuntime;

    use super::*;

    struct CollectingSink {
        name: String,
        received: Arc<StdMutex<Vec<Arc<Record>>>>,
    }

    #[async_trait]
    impl Sink for CollectingSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, records: Vec<Arc<Record>>) -> Result<(), SinkSendError> {
            self.received.lock().unwrap().extend(records);
            Ok(())
        }

        async fn stop(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn healthy(&self) -> bool {
            true
        }
    }

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            queue_size: 100,
            worker_count: 2,
            batch_processor: BatchProcessorConfig {
                enabled: true,
                max_size: 4,
                flush_interval_ms: 50,
            },
            backpressure: BackpressureConfig {
                soft: 0.7,
                hard: 1.0,
            },
            send_timeout_ms: 1_000,
            shutdown_grace_ms: 1_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_records_reach_the_sink() {
        let rt = TestRuntime::new(7);
        let received = Arc::new(StdMutex::new(Vec::new()));
        let mut sinks = BTreeMap::new();
        sinks.insert(
            "collector".to_string(),
            Arc::new(CollectingSink {
                name: "collector".to_string(),
                received: received.clone(),
            }) as Arc<dyn Sink>,
        );
        let sinks = Arc::new(RwLock::new(sinks));

        let dispatcher = DispatcherHandle::start(rt.clone(), test_config(), sinks);
        for i in 0..4 {
            let outcome = dispatcher.handle(
                SourceKind::File,
                "source-a",
                format!("line {i}").into_bytes(),
                HashMap::new(),
                Utc::now(),
                Utc::now(),
            );
            assert_eq!(outcome, HandleOutcome::Accepted);
        }

        // Batch seals at max_size = 4 without waiting for the flush interval.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(received.lock().unwrap().len(), 4);

        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn hard_threshold_rejects_new_records() {
        let rt = TestRuntime::new(3);
        let sinks = Arc::new(RwLock::new(BTreeMap::new()));
        let mut config = test_config();
        config.queue_size = 2;
        config.worker_count = 1;
        config.backpressure.hard = 0.5;
        let dispatcher = DispatcherHandle::start(rt, config, sinks);

        let first = dispatcher.handle(
            SourceKind::File,
            "source-a",
            b"x".to_vec(),
            HashMap::new(),
            Utc::now(),
            Utc::now(),
        );
        assert_eq!(first, HandleOutcome::Accepted);

        let second = dispatcher.handle(
            SourceKind::File,
            "source-a",
            b"y".to_vec(),
            HashMap::new(),
            Utc::now(),
            Utc::now(),
        );
        assert_eq!(second, HandleOutcome::Full);

        dispatcher.shutdown().await;
    }

    #[test]
    fn same_source_id_always_shards_the_same_way() {
        let a = shard_for("container-123", 8);
        let b = shard_for("container-123", 8);
        assert_eq!(a, b);
    }
}
