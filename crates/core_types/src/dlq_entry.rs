use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::record::Record;

/// A record that a sink couldn't deliver, persisted as one JSON line in that
/// sink's DLQ file. Removed from the file on successful reprocessing (by
/// rewriting the segment without it, since DLQ files are append-only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub record: Record,
    pub origin_sink: String,
    pub error_kind: String,
    pub error_message: String,
    pub first_failed_at: DateTime<Utc>,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DlqEntry {
    pub fn new(
        record: Record,
        origin_sink: impl Into<String>,
        error_kind: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            record,
            origin_sink: origin_sink.into(),
            error_kind: error_kind.into(),
            error_message: error_message.into(),
            first_failed_at: now,
            attempt_count: 1,
            next_retry_at: None,
        }
    }
}
