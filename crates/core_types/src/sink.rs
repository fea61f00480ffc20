use std::sync::Arc;

use async_trait::async_trait;

use crate::record::Record;

/// Why a [`Sink::send`] call was rejected. `Full` is the expected,
/// non-fatal case (the caller should hold the records or retry); anything
/// else means the sink gave up on this batch outright.
#[derive(thiserror::Error, Debug)]
pub enum SinkSendError {
    /// The sink's internal queue is saturated; try again later.
    #[error("sink queue is full")]
    Full,
    /// The sink has been stopped and will not accept more records.
    #[error("sink is stopped")]
    Stopped,
    /// Some other failure constructing/enqueuing the send.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The contract every sink implementation (`http_stream`, `message_bus`,
/// `local_file`, ...) exposes to the dispatcher. `send` is a non-blocking
/// enqueue into the sink's own accumulator/queue, not a synchronous wire
/// write -- the actual batching, retrying, and DLQ spillover happens inside
/// the sink's own batch loop, off the dispatcher's hot path.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, records: Vec<Arc<Record>>) -> Result<(), SinkSendError>;

    /// Flush and release resources. Called once during shutdown; further
    /// `send` calls after this resolves should return `Stopped`.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Whether the sink's circuit breaker is currently `closed` or
    /// `half-open` (i.e. not flatly rejecting everything). Used by
    /// `/health` and by the dispatcher's deterministic fan-out order, which
    /// skips sinks known to be fully open to avoid needless channel sends.
    fn healthy(&self) -> bool;
}
