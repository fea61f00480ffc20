use std::sync::Arc;

use async_trait::async_trait;
use core_types::Record;

/// A transient error is worth retrying (network blip, 5xx, broker
/// unavailable); a permanent one (4xx, malformed payload, unknown topic)
/// skips straight to the DLQ since retrying it would only waste attempts.
pub enum TransportError {
    Transient(anyhow::Error),
    Permanent(anyhow::Error),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Permanent(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Transient(e) => write!(f, "{e}"),
            TransportError::Permanent(e) => write!(f, "{e}"),
        }
    }
}

/// The wire-format-specific half of a sink: everything about batching,
/// retry, circuit breaking, and DLQ handoff is shared by [`crate::engine::SinkEngine`];
/// a concrete sink only needs to know how to serialize and transmit one
/// sealed batch.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn send_batch(&self, records: &[Arc<Record>]) -> Result<(), TransportError>;

    /// Release any held resources (connections, file handles). Called once
    /// during sink shutdown, after the engine's workers have drained.
    async fn close(&self) -> anyhow::Result<()>;
}
