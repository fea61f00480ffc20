use std::{
    collections::HashMap,
    io::Write,
    num::NonZeroUsize,
    path::PathBuf,
    sync::{
        Arc,
        Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use core_types::Record;
use lru::LruCache;
use parking_lot::Mutex;

use crate::transport::{
    Transport,
    TransportError,
};

/// Appends newline-delimited JSON to one file per stream key under a
/// directory, with an LRU-capped pool of open descriptors. Generalizes the
/// teacher's single-fixed-path local sink to many stream keys (derived from
/// a record's `stream` label, falling back to `source_id`), which is what
/// makes the fd cap necessary in the first place.
///
/// Lock discipline: `file_handle` only ever holds the map lock long enough
/// to look up or open a handle; the write and `fsync` happen against the
/// per-file `Mutex` after the map lock has been released, so one slow disk
/// write never blocks lookups for other stream keys.
pub struct LocalFileTransport {
    name: String,
    directory: PathBuf,
    handles: Mutex<LruCache<String, Arc<StdMutex<std::fs::File>>>>,
}

impl LocalFileTransport {
    pub fn new(name: impl Into<String>, directory: PathBuf, max_open_files: usize) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            name: name.into(),
            directory,
            handles: Mutex::new(LruCache::new(NonZeroUsize::new(max_open_files.max(1)).expect("nonzero"))),
        })
    }

    fn stream_key(record: &Record) -> String {
        record.labels.get("stream").cloned().unwrap_or_else(|| record.source_id.clone())
    }

    fn file_handle(&self, key: &str) -> anyhow::Result<Arc<StdMutex<std::fs::File>>> {
        let mut handles = self.handles.lock();
        if let Some(existing) = handles.get(key) {
            return Ok(existing.clone());
        }
        let path = self.directory.join(sanitize_key(key)).with_extension("jsonl");
        let file = std::fs::OpenOptions::new().append(true).create(true).open(&path)?;
        let handle = Arc::new(StdMutex::new(file));
        handles.put(key.to_string(), handle.clone());
        Ok(handle)
    }
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl Transport for LocalFileTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_batch(&self, records: &[Arc<Record>]) -> Result<(), TransportError> {
        let mut by_key: HashMap<String, Vec<&Arc<Record>>> = HashMap::new();
        for record in records {
            by_key.entry(Self::stream_key(record)).or_default().push(record);
        }

        for (key, group) in by_key {
            let handle = self.file_handle(&key).map_err(TransportError::Permanent)?;
            let mut file = handle.lock().expect("local_file sink fd mutex poisoned");
            for record in group {
                let mut line = serde_json::to_vec(record.as_ref()).map_err(|e| TransportError::Permanent(e.into()))?;
                line.push(b'\n');
                file.write_all(&line).map_err(|e| TransportError::Transient(e.into()))?;
            }
            file.sync_all().map_err(|e| TransportError::Transient(e.into()))?;
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.handles.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use core_types::SourceKind;
    use tempfile::TempDir;

    use super::*;

    fn record_with_stream(stream: &str) -> Arc<Record> {
        let mut record = Record::new(SourceKind::File, "/a.log", b"hi".to_vec(), Utc::now(), Utc::now());
        record.labels.insert("stream".to_string(), stream.to_string());
        Arc::new(record)
    }

    #[tokio::test]
    async fn records_land_in_per_stream_files() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let transport = LocalFileTransport::new("local_file", dir.path().to_owned(), 8)?;
        transport
            .send_batch(&[record_with_stream("a"), record_with_stream("b"), record_with_stream("a")])
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let a_contents = std::fs::read_to_string(dir.path().join("a.jsonl"))?;
        let b_contents = std::fs::read_to_string(dir.path().join("b.jsonl"))?;
        assert_eq!(a_contents.lines().count(), 2);
        assert_eq!(b_contents.lines().count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn lru_cap_evicts_the_least_recently_used_handle() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let transport = LocalFileTransport::new("local_file", dir.path().to_owned(), 1)?;
        transport.send_batch(&[record_with_stream("a")]).await.unwrap();
        transport.send_batch(&[record_with_stream("b")]).await.unwrap();
        // With a cap of 1, "a"'s handle was evicted; writing to it again must
        // reopen (append) rather than fail.
        transport.send_batch(&[record_with_stream("a")]).await.unwrap();

        let a_contents = std::fs::read_to_string(dir.path().join("a.jsonl"))?;
        assert_eq!(a_contents.lines().count(), 2);
        Ok(())
    }
}
