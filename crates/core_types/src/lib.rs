//! Data model shared across the agent: the [`Record`] that flows from
//! sources through the dispatcher to sinks, the [`Position`] a file monitor
//! persists, the [`Batch`] a sink accumulates, [`DlqEntry`]/[`CircuitState`]
//! for sink resiliency bookkeeping.
mod batch;
mod circuit;
mod dlq_entry;
mod position;
mod record;
mod sink;

pub use batch::Batch;
pub use circuit::{
    CircuitState,
    CircuitStatus,
};
pub use dlq_entry::DlqEntry;
pub use position::Position;
pub use record::{
    Record,
    SourceKind,
};
pub use sink::{
    Sink,
    SinkSendError,
};
