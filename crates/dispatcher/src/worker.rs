use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use config::schema::BatchProcessorConfig;
use core_types::{
    Batch,
    Record,
    Sink,
};
use parking_lot::RwLock;
use runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// One worker owns a single shard of the dispatcher's queue end to end:
/// dequeue, optional accumulation, fan-out to every enabled sink. Workers
/// never share a receiver, so a given `source_id` (consistently hashed to
/// one shard) is always processed by the same worker and its records keep
/// arrival order all the way to the sinks.
pub async fn run<RT: Runtime>(
    runtime: RT,
    mut rx: mpsc::Receiver<Arc<Record>>,
    sinks: Arc<RwLock<BTreeMap<String, Arc<dyn Sink>>>>,
    batch_processor: BatchProcessorConfig,
    send_timeout: Duration,
    queue_depth: Arc<AtomicUsize>,
    cancellation: CancellationToken,
) {
    if batch_processor.enabled {
        run_batched(
            runtime,
            rx,
            sinks,
            batch_processor,
            send_timeout,
            queue_depth,
            cancellation,
        )
        .await;
    } else {
        loop {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => return,
                item = rx.recv() => {
                    match item {
                        None => return,
                        Some(record) => {
                            queue_depth.fetch_sub(1, Ordering::Relaxed);
                            fan_out(&sinks, vec![record], send_timeout).await;
                        },
                    }
                }
            }
        }
    }
}

async fn run_batched<RT: Runtime>(
    runtime: RT,
    mut rx: mpsc::Receiver<Arc<Record>>,
    sinks: Arc<RwLock<BTreeMap<String, Arc<dyn Sink>>>>,
    batch_processor: BatchProcessorConfig,
    send_timeout: Duration,
    queue_depth: Arc<AtomicUsize>,
    cancellation: CancellationToken,
) {
    let mut batch = Batch::new();
    loop {
        let flush_wait = runtime.wait(batch_processor.flush_interval());
        tokio::select! {
            biased;
            () = cancellation.cancelled() => {
                if !batch.is_empty() {
                    fan_out(&sinks, batch.into_records(), send_timeout).await;
                }
                return;
            },
            item = rx.recv() => {
                match item {
                    None => {
                        if !batch.is_empty() {
                            fan_out(&sinks, batch.into_records(), send_timeout).await;
                        }
                        return;
                    },
                    Some(record) => {
                        queue_depth.fetch_sub(1, Ordering::Relaxed);
                        batch.push(record);
                        if batch.len() >= batch_processor.max_size {
                            let sealed = std::mem::take(&mut batch);
                            fan_out(&sinks, sealed.into_records(), send_timeout).await;
                        }
                    },
                }
            },
            _ = flush_wait => {
                if !batch.is_empty() {
                    let sealed = std::mem::take(&mut batch);
                    fan_out(&sinks, sealed.into_records(), send_timeout).await;
                }
            },
        }
    }
}

/// Fans a sealed group of records out to every enabled sink, in the sinks'
/// deterministic (lexicographic name) order. A `send` failure or timeout on
/// one sink never blocks or skips another -- each sink owns its own
/// retry/DLQ path once a batch has been handed to it.
async fn fan_out(
    sinks: &Arc<RwLock<BTreeMap<String, Arc<dyn Sink>>>>,
    records: Vec<Arc<Record>>,
    send_timeout: Duration,
) {
    if records.is_empty() {
        return;
    }
    let targets: Vec<Arc<dyn Sink>> = sinks.read().values().cloned().collect();
    for sink in targets {
        match tokio::time::timeout(send_timeout, sink.send(records.clone())).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                metrics::record_fanout_error();
                tracing::warn!(sink = sink.name(), error = %e, "sink rejected a batch during fan-out");
            },
            Err(_) => {
                metrics::record_fanout_error();
                tracing::warn!(sink = sink.name(), "sink.send timed out during fan-out");
            },
        }
    }
}
