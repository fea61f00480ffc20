use std::{
    collections::HashMap,
    sync::Arc,
};

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Container,
    File,
}

/// The unit of transport from a source to a sink.
///
/// `labels` and `fields` are immutable once a record has entered the
/// dispatcher's queue: the dispatcher hands every sink the same
/// `Arc<Record>` rather than deep-cloning per fan-out, so no sink may ever
/// observe a mutation made by another. A sink that needs to transform a
/// record (e.g. redact a field) must clone the `Record` out of the `Arc`
/// first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Wall-clock instant the line was observed at the source, UTC.
    pub timestamp: DateTime<Utc>,
    /// Instant the dispatcher accepted the record.
    pub ingested_at: DateTime<Utc>,
    pub source_kind: SourceKind,
    /// Stable identifier: container id, or canonical file path.
    pub source_id: String,
    pub message: Vec<u8>,
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl Record {
    pub fn new(
        source_kind: SourceKind,
        source_id: impl Into<String>,
        message: Vec<u8>,
        timestamp: DateTime<Utc>,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            ingested_at,
            source_kind,
            source_id: source_id.into(),
            message,
            labels: HashMap::new(),
            fields: HashMap::new(),
            trace_id: None,
            span_id: None,
        }
    }

    /// Wraps the record for read-only fan-out to multiple sinks without a
    /// deep clone per sink.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn message_len(&self) -> usize {
        self.message.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let record = Record::new(
            SourceKind::File,
            "/var/log/app.log",
            b"hello".to_vec(),
            Utc::now(),
            Utc::now(),
        );
        let encoded = serde_json::to_vec(&record).unwrap();
        let decoded: Record = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn sharing_does_not_clone_message() {
        let record = Record::new(
            SourceKind::Container,
            "abc123",
            vec![0u8; 1024],
            Utc::now(),
            Utc::now(),
        );
        let shared = record.into_shared();
        let a = Arc::clone(&shared);
        let b = Arc::clone(&shared);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
