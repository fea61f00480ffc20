//! Per-sink dead-letter storage: records a sink's retry loop gave up on are
//! appended here instead of being dropped, and a background reprocessing
//! pass redelivers them once the target sink looks healthy again.
mod metrics;
mod store;

pub use store::{
    DlqWriter,
    FileDlqStore,
};
