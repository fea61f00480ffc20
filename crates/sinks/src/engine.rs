use std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Instant,
};

use async_trait::async_trait;
use config::schema::SinkConfig;
use core_types::{
    DlqEntry,
    Record,
    Sink,
    SinkSendError,
};
use dlq::DlqWriter;
use parking_lot::Mutex as SyncMutex;
use runtime::{
    Backoff,
    Runtime,
    SpawnHandle,
};
use tokio::sync::{
    mpsc,
    Mutex as AsyncMutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    circuit::CircuitBreaker,
    metrics,
    transport::{
        Transport,
        TransportError,
    },
};

type SealedBatch = Vec<Arc<Record>>;

/// Matches the resource cap the design assigns to per-sink shutdown.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(60);

async fn wait_for_empty_queue(queue_depth: &AtomicUsize) {
    while queue_depth.load(Ordering::Relaxed) > 0 {
        tokio::task::yield_now().await;
    }
}

/// The generic batching sink loop described by the design: an accumulator
/// that seals batches by size or time, a fixed worker pool that sends sealed
/// batches through a [`Transport`] with retry-then-DLQ, and a circuit
/// breaker gating every send attempt. A concrete sink type is just this
/// engine plus a `Transport` impl.
pub struct SinkEngine {
    name: String,
    record_tx: mpsc::Sender<Arc<Record>>,
    queue_depth: Arc<AtomicUsize>,
    queue_capacity: usize,
    stopping: Arc<AtomicBool>,
    cancellation: CancellationToken,
    circuit: Arc<CircuitBreaker>,
    transport: Arc<dyn TransportObj>,
    accumulator_handle: SyncMutex<Option<Box<dyn SpawnHandle>>>,
    worker_handles: SyncMutex<Vec<Box<dyn SpawnHandle>>>,
}

/// Object-safe erasure of `Transport` so `SinkEngine` itself doesn't need a
/// generic parameter once it's built (workers and `stop()` only need
/// `dyn`-callable `send_batch`/`close`/`name`).
trait TransportObj: Send + Sync {
    fn name(&self) -> &str;
    fn send_batch<'a>(
        &'a self,
        records: &'a [Arc<Record>],
    ) -> futures::future::BoxFuture<'a, Result<(), TransportError>>;
    fn close(&self) -> futures::future::BoxFuture<'_, anyhow::Result<()>>;
}

impl<T: Transport> TransportObj for T {
    fn name(&self) -> &str {
        Transport::name(self)
    }

    fn send_batch<'a>(
        &'a self,
        records: &'a [Arc<Record>],
    ) -> futures::future::BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(Transport::send_batch(self, records))
    }

    fn close(&self) -> futures::future::BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(Transport::close(self))
    }
}

impl SinkEngine {
    pub fn start<RT: Runtime, T: Transport>(
        runtime: RT,
        transport: T,
        config: SinkConfig,
        dlq: Option<Arc<dyn DlqWriter>>,
    ) -> Arc<Self> {
        let transport: Arc<dyn TransportObj> = Arc::new(transport);
        let name = transport.name().to_string();
        let circuit = Arc::new(CircuitBreaker::new(&name, config.circuit));
        let queue_capacity = config.queue_size;
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let stopping = Arc::new(AtomicBool::new(false));
        let cancellation = CancellationToken::new();

        let (record_tx, record_rx) = mpsc::channel(config.queue_size.max(1));
        let worker_count = config.worker_count.max(1) as usize;
        let (sealed_tx, sealed_rx) = mpsc::channel::<SealedBatch>(worker_count * 2);
        let sealed_rx = Arc::new(AsyncMutex::new(sealed_rx));

        let accumulator_handle = runtime.spawn(
            "sink_accumulator",
            run_accumulator(
                runtime.clone(),
                record_rx,
                sealed_tx,
                config.max_batch_size,
                config.flush_interval(),
                queue_depth.clone(),
                name.clone(),
                circuit.clone(),
                cancellation.child_token(),
            ),
        );

        let mut worker_handles: Vec<Box<dyn SpawnHandle>> = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let handle = runtime.spawn(
                "sink_worker",
                run_worker(
                    runtime.clone(),
                    sealed_rx.clone(),
                    transport.clone(),
                    circuit.clone(),
                    dlq.clone(),
                    config.retry,
                    name.clone(),
                ),
            );
            worker_handles.push(handle);
        }

        Arc::new(Self {
            name,
            record_tx,
            queue_depth,
            queue_capacity,
            stopping,
            cancellation,
            circuit,
            transport,
            accumulator_handle: SyncMutex::new(Some(accumulator_handle)),
            worker_handles: SyncMutex::new(worker_handles),
        })
    }
}

#[async_trait]
impl Sink for SinkEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, records: Vec<Arc<Record>>) -> Result<(), SinkSendError> {
        if self.stopping.load(Ordering::Relaxed) {
            return Err(SinkSendError::Stopped);
        }
        let depth = self.queue_depth.load(Ordering::Relaxed);
        if depth.saturating_add(records.len()) > self.queue_capacity {
            metrics::records_dropped(&self.name, records.len() as u64);
            return Err(SinkSendError::Full);
        }
        for record in records {
            match self.record_tx.try_send(record) {
                Ok(()) => {
                    self.queue_depth.fetch_add(1, Ordering::Relaxed);
                },
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::records_dropped(&self.name, 1);
                    return Err(SinkSendError::Full);
                },
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(SinkSendError::Stopped),
            }
        }
        metrics::set_queue_depth(&self.name, self.queue_depth.load(Ordering::Relaxed));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stopping.store(true, Ordering::Relaxed);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, wait_for_empty_queue(&self.queue_depth));
        if drained.await.is_err() {
            tracing::warn!(sink = %self.name, "sink shutdown grace period elapsed with records still queued");
        }
        // Tells the accumulator to seal whatever remains and return; once it
        // returns, `sealed_tx` drops and workers drain the last sealed
        // batches before their own `recv()` sees the channel close.
        self.cancellation.cancel();

        if let Some(mut handle) = self.accumulator_handle.lock().take() {
            let _ = handle.join().await;
        }
        let handles = std::mem::take(&mut *self.worker_handles.lock());
        for mut handle in handles {
            let _ = handle.join().await;
        }

        self.transport.close().await
    }

    fn healthy(&self) -> bool {
        self.circuit.healthy()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_accumulator<RT: Runtime>(
    runtime: RT,
    mut record_rx: mpsc::Receiver<Arc<Record>>,
    sealed_tx: mpsc::Sender<SealedBatch>,
    max_batch_size: usize,
    flush_interval: std::time::Duration,
    queue_depth: Arc<AtomicUsize>,
    sink_name: String,
    circuit: Arc<CircuitBreaker>,
    cancellation: CancellationToken,
) {
    let mut batch: SealedBatch = Vec::new();
    loop {
        let cap = circuit.max_batch_size(max_batch_size);
        let flush_wait = runtime.wait(flush_interval);
        tokio::select! {
            biased;
            () = cancellation.cancelled() => {
                if !batch.is_empty() {
                    let _ = sealed_tx.send(std::mem::take(&mut batch)).await;
                }
                return;
            },
            item = record_rx.recv() => {
                match item {
                    None => {
                        if !batch.is_empty() {
                            let _ = sealed_tx.send(std::mem::take(&mut batch)).await;
                        }
                        return;
                    },
                    Some(record) => {
                        queue_depth.fetch_sub(1, Ordering::Relaxed);
                        metrics::set_queue_depth(&sink_name, queue_depth.load(Ordering::Relaxed));
                        batch.push(record);
                        if batch.len() >= cap {
                            let sealed = std::mem::take(&mut batch);
                            if sealed_tx.send(sealed).await.is_err() {
                                return;
                            }
                        }
                    },
                }
            },
            _ = flush_wait => {
                if !batch.is_empty() {
                    let sealed = std::mem::take(&mut batch);
                    if sealed_tx.send(sealed).await.is_err() {
                        return;
                    }
                }
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker<RT: Runtime>(
    runtime: RT,
    sealed_rx: Arc<AsyncMutex<mpsc::Receiver<SealedBatch>>>,
    transport: Arc<dyn TransportObj>,
    circuit: Arc<CircuitBreaker>,
    dlq: Option<Arc<dyn DlqWriter>>,
    retry: config::schema::SinkRetryConfig,
    sink_name: String,
) {
    loop {
        let batch = {
            let mut rx = sealed_rx.lock().await;
            rx.recv().await
        };
        let Some(records) = batch else { return };
        if records.is_empty() {
            continue;
        }

        if !circuit.allow_request() {
            dlq_all(&dlq, &sink_name, &records, "CircuitOpen", "circuit breaker is open").await;
            continue;
        }

        let mut backoff = Backoff::new(
            std::time::Duration::from_millis(retry.initial_delay_ms),
            std::time::Duration::from_millis(retry.max_delay_ms),
        );
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = transport.send_batch(&records).await;
            metrics::record_send_latency(&sink_name, start.elapsed());

            match result {
                Ok(()) => {
                    circuit.record_success();
                    metrics::batch_sent(&sink_name);
                    metrics::records_sent(&sink_name, records.len() as u64);
                    break;
                },
                Err(e) => {
                    circuit.record_failure();
                    let permanent = e.is_permanent();
                    if permanent || attempt >= retry.max_attempts {
                        metrics::batch_failed(&sink_name);
                        tracing::warn!(
                            sink = %sink_name,
                            attempt,
                            permanent,
                            error = %e,
                            "sink giving up on batch, spilling to dead-letter queue"
                        );
                        dlq_all(&dlq, &sink_name, &records, "SendFailed", &e.to_string()).await;
                        break;
                    }
                    let delay = runtime.with_rng(|rng| backoff.fail(rng));
                    tracing::debug!(sink = %sink_name, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying sink batch");
                    runtime.wait(delay).await;
                },
            }
        }
    }
}

async fn dlq_all(
    dlq: &Option<Arc<dyn DlqWriter>>,
    sink_name: &str,
    records: &[Arc<Record>],
    error_kind: &str,
    error_message: &str,
) {
    let Some(dlq) = dlq else {
        metrics::records_dropped(sink_name, records.len() as u64);
        return;
    };
    for record in records {
        let entry = DlqEntry::new(record.as_ref().clone(), sink_name, error_kind, error_message);
        if let Err(e) = dlq.add_entry(entry).await {
            tracing::error!(sink = %sink_name, error = %e, "failed to spill record to dead-letter queue");
        }
    }
    metrics::records_dlqed(sink_name, records.len() as u64);
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicU32,
        time::Duration,
    };

    use chrono::Utc;
    use config::schema::{
        CircuitConfig,
        SinkKind,
        SinkRetryConfig,
    };
    use core_types::SourceKind;
    use runtime::testing::TestRuntime;
    use tokio::sync::Mutex as TokioMutex;

    use super::*;

    struct FlakyTransport {
        failures_remaining: AtomicU32,
        received: Arc<TokioMutex<Vec<Arc<Record>>>>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn name(&self) -> &str {
            "test_sink"
        }

        async fn send_batch(&self, records: &[Arc<Record>]) -> Result<(), TransportError> {
            if self.failures_remaining.load(Ordering::Relaxed) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::Relaxed);
                return Err(TransportError::Transient(anyhow::anyhow!("not yet")));
            }
            self.received.lock().await.extend(records.iter().cloned());
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct RejectingTransport;

    #[async_trait]
    impl Transport for RejectingTransport {
        fn name(&self) -> &str {
            "test_sink"
        }

        async fn send_batch(&self, _records: &[Arc<Record>]) -> Result<(), TransportError> {
            Err(TransportError::Permanent(anyhow::anyhow!("bad request")))
        }

        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingDlq {
        entries: TokioMutex<Vec<DlqEntry>>,
    }

    #[async_trait]
    impl DlqWriter for CollectingDlq {
        async fn add_entry(&self, entry: DlqEntry) -> anyhow::Result<()> {
            self.entries.lock().await.push(entry);
            Ok(())
        }
    }

    fn test_config() -> SinkConfig {
        SinkConfig {
            kind: SinkKind::HttpStream,
            enabled: true,
            max_batch_size: 10,
            flush_interval_ms: 50,
            queue_size: 100,
            worker_count: 1,
            max_open_files: 10,
            circuit: CircuitConfig {
                failure_threshold: 10,
                open_duration_secs: 30,
                max_open_duration_secs: 600,
            },
            retry: SinkRetryConfig {
                max_attempts: 3,
                initial_delay_ms: 1,
                max_delay_ms: 5,
            },
            options: Default::default(),
        }
    }

    fn sample_record() -> Arc<Record> {
        Arc::new(Record::new(SourceKind::File, "/a.log", b"hi".to_vec(), Utc::now(), Utc::now()))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds_within_the_attempt_budget() -> anyhow::Result<()> {
        let rt = TestRuntime::new(0);
        let received = Arc::new(TokioMutex::new(Vec::new()));
        let transport = FlakyTransport {
            failures_remaining: AtomicU32::new(1),
            received: received.clone(),
        };
        let engine = SinkEngine::start(rt, transport, test_config(), None);
        engine.send(vec![sample_record()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(received.lock().await.len(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_spills_straight_to_the_dlq() -> anyhow::Result<()> {
        let rt = TestRuntime::new(0);
        let dlq = Arc::new(CollectingDlq::default());
        let engine = SinkEngine::start(rt, RejectingTransport, test_config(), Some(dlq.clone() as Arc<dyn DlqWriter>));
        engine.send(vec![sample_record()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(dlq.entries.lock().await.len(), 1);
        Ok(())
    }
}
