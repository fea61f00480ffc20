use std::{
    sync::Arc,
    time::Instant,
};

use crate::record::Record;

/// An ordered list of records bound to exactly one sink. Sealed when either
/// `len() >= max_batch_size` or `age() >= flush_interval`; the sink's batch
/// loop owns it exclusively until the send resolves (success, retry, or
/// spill to DLQ).
#[derive(Debug)]
pub struct Batch {
    records: Vec<Arc<Record>>,
    created_at: Instant,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn push(&mut self, record: Arc<Record>) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn records(&self) -> &[Arc<Record>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Arc<Record>> {
        self.records
    }

    /// Byte size of the contained messages, used to adapt batch size to
    /// recent send latency.
    pub fn byte_size(&self) -> usize {
        self.records.iter().map(|r| r.message_len()).sum()
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::record::SourceKind;

    #[test]
    fn tracks_len_and_byte_size() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());
        batch.push(Arc::new(Record::new(
            SourceKind::File,
            "/a.log",
            b"hello".to_vec(),
            Utc::now(),
            Utc::now(),
        )));
        batch.push(Arc::new(Record::new(
            SourceKind::File,
            "/a.log",
            b"world!".to_vec(),
            Utc::now(),
            Utc::now(),
        )));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.byte_size(), 11);
    }
}
