use std::{
    io::{
        BufRead,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use config::schema::RetentionConfig;
use core_types::DlqEntry;
use flate2::{
    read::GzDecoder,
    write::GzEncoder,
    Compression,
};
use futures::future::BoxFuture;
use runtime::{
    Runtime,
    SpawnHandle,
};
use tokio::sync::mpsc;

use crate::metrics;

/// Anything that can accept a failed record for later redelivery. Sinks
/// depend on this trait, not on [`FileDlqStore`] directly, so a sink's unit
/// tests can substitute an in-memory fake.
#[async_trait]
pub trait DlqWriter: Send + Sync {
    async fn add_entry(&self, entry: DlqEntry) -> anyhow::Result<()>;
}

/// Segments larger than this are rotated; the just-closed segment is
/// gzip-compressed in the background so the active segment is always a
/// plain, cheaply-appendable file.
const MAX_SEGMENT_BYTES: u64 = 64 * 1024 * 1024;

/// Per-sink, append-only, on-disk dead-letter queue. One background task
/// owns the active segment file and batches writes; `add_entry` just
/// enqueues onto its channel, so callers (sink retry loops) never block on
/// disk I/O.
pub struct FileDlqStore {
    sink_name: String,
    directory: PathBuf,
    entry_tx: mpsc::Sender<DlqEntry>,
    writer_handle: parking_lot::Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl FileDlqStore {
    pub fn start<RT: Runtime>(
        runtime: RT,
        sink_name: impl Into<String>,
        directory: PathBuf,
        flush_interval: Duration,
        retention: RetentionConfig,
    ) -> anyhow::Result<Arc<Self>> {
        let sink_name = sink_name.into();
        std::fs::create_dir_all(&directory)?;

        let (entry_tx, entry_rx) = mpsc::channel(1_024);
        let writer_runtime = runtime.clone();
        let writer_sink_name = sink_name.clone();
        let writer_directory = directory.clone();
        let handle = runtime.spawn(
            "dlq_writer",
            writer_loop(
                writer_runtime,
                writer_sink_name,
                writer_directory,
                entry_rx,
                flush_interval,
                retention,
            ),
        );

        Ok(Arc::new(Self {
            sink_name,
            directory,
            entry_tx,
            writer_handle: parking_lot::Mutex::new(Some(handle)),
        }))
    }

    /// Scans closed (non-active) segments oldest first and invokes
    /// `callback` for every entry. An entry the callback accepts is dropped
    /// from the rewritten segment; one it rejects is kept. Skips the whole
    /// pass if `should_run` returns false (e.g. the target sink's circuit
    /// is open).
    pub async fn reprocess(
        &self,
        rate_limit: u32,
        should_run: impl Fn() -> bool,
        callback: impl Fn(DlqEntry) -> BoxFuture<'static, anyhow::Result<()>>,
    ) -> anyhow::Result<usize> {
        if !should_run() {
            return Ok(0);
        }
        let mut processed = 0usize;
        for segment in closed_segments(&self.directory)? {
            if processed >= rate_limit as usize {
                break;
            }
            let entries = read_segment(&segment)?;
            let mut remaining = Vec::with_capacity(entries.len());
            for entry in entries {
                if processed >= rate_limit as usize {
                    remaining.push(entry);
                    continue;
                }
                match callback(entry.clone()).await {
                    Ok(()) => {
                        metrics::entry_reprocessed(&self.sink_name);
                        processed += 1;
                    },
                    Err(_) => remaining.push(entry),
                }
            }
            rewrite_or_remove_segment(&segment, &remaining)?;
        }
        Ok(processed)
    }

    /// Total entries across every closed segment plus the active one's
    /// approximate count (exact count of the active segment requires a
    /// read we avoid on the hot path; callers needing precision should use
    /// `/health`'s periodically-refreshed gauge instead).
    pub fn depth(&self) -> anyhow::Result<u64> {
        let mut count = 0u64;
        for segment in closed_segments(&self.directory)? {
            count += read_segment(&segment)?.len() as u64;
        }
        if let Ok(active) = active_segment_path(&self.directory) {
            if active.exists() {
                count += std::fs::read(&active)?.lines_count();
            }
        }
        Ok(count)
    }
}

trait CountLines {
    fn lines_count(&self) -> u64;
}

impl CountLines for Vec<u8> {
    fn lines_count(&self) -> u64 {
        self.iter().filter(|b| **b == b'\n').count() as u64
    }
}

#[async_trait]
impl DlqWriter for FileDlqStore {
    async fn add_entry(&self, entry: DlqEntry) -> anyhow::Result<()> {
        self.entry_tx
            .send(entry)
            .await
            .map_err(|_| anyhow::anyhow!("dlq writer task for sink {} has stopped", self.sink_name))?;
        metrics::entry_written(&self.sink_name);
        Ok(())
    }
}

impl Drop for FileDlqStore {
    fn drop(&mut self) {
        if let Some(mut handle) = self.writer_handle.lock().take() {
            handle.shutdown();
        }
    }
}

async fn writer_loop<RT: Runtime>(
    runtime: RT,
    sink_name: String,
    directory: PathBuf,
    mut entry_rx: mpsc::Receiver<DlqEntry>,
    flush_interval: Duration,
    retention: RetentionConfig,
) {
    let mut active = match open_active_segment(&directory) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(sink = %sink_name, error = %e, "could not open dlq segment, dlq disabled for this sink");
            return;
        },
    };
    let mut pending = 0u32;
    loop {
        let tick = runtime.wait(flush_interval);
        tokio::select! {
            biased;
            entry = entry_rx.recv() => {
                match entry {
                    None => break,
                    Some(entry) => {
                        if let Err(e) = append_entry(&mut active, &entry) {
                            tracing::error!(sink = %sink_name, error = %e, "failed to write dlq entry");
                            continue;
                        }
                        pending += 1;
                        if active.bytes_written >= MAX_SEGMENT_BYTES {
                            rotate(&runtime, &directory, &mut active);
                        }
                    },
                }
            },
            _ = tick => {
                if pending > 0 {
                    let _ = active.file.flush();
                    let _ = active.file.get_ref().sync_data();
                    pending = 0;
                }
                if let Err(e) = enforce_retention(&directory, &sink_name, &retention) {
                    tracing::warn!(sink = %sink_name, error = %e, "dlq retention sweep failed");
                }
            },
        }
    }
    let _ = active.file.flush();
    let _ = active.file.get_ref().sync_data();
}

struct ActiveSegment {
    file: std::io::BufWriter<std::fs::File>,
    bytes_written: u64,
}

fn active_segment_path(directory: &Path) -> anyhow::Result<PathBuf> {
    Ok(directory.join("active.jsonl"))
}

fn open_active_segment(directory: &Path) -> anyhow::Result<ActiveSegment> {
    std::fs::create_dir_all(directory)?;
    let path = active_segment_path(directory)?;
    let file = std::fs::OpenOptions::new().append(true).create(true).open(&path)?;
    let bytes_written = file.metadata()?.len();
    Ok(ActiveSegment {
        file: std::io::BufWriter::new(file),
        bytes_written,
    })
}

fn append_entry(active: &mut ActiveSegment, entry: &DlqEntry) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    active.file.write_all(&line)?;
    active.bytes_written += line.len() as u64;
    Ok(())
}

/// Closes out the active segment under a uniquely-named file and opens a
/// fresh one, then compresses the closed segment in place.
fn rotate<RT: Runtime>(runtime: &RT, directory: &Path, active: &mut ActiveSegment) {
    let _ = active.file.flush();
    let active_path = directory.join("active.jsonl");
    let closed_name = format!("segment-{}.jsonl", runtime.new_uuid_v4());
    let closed_path = directory.join(&closed_name);
    if std::fs::rename(&active_path, &closed_path).is_ok() {
        compress_segment(&closed_path);
    }
    match open_active_segment(directory) {
        Ok(fresh) => *active = fresh,
        Err(e) => tracing::error!(error = %e, "failed to reopen dlq active segment after rotation"),
    }
}

fn compress_segment(path: &Path) {
    let gz_path = path.with_extension("jsonl.gz");
    let result = (|| -> anyhow::Result<()> {
        let input = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(input);
        let output = std::fs::File::create(&gz_path)?;
        let mut encoder = GzEncoder::new(output, Compression::default());
        std::io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;
        std::fs::remove_file(path)?;
        Ok(())
    })();
    if let Err(e) = result {
        tracing::warn!(error = %e, path = %path.display(), "failed to compress closed dlq segment");
    }
}

fn closed_segments(directory: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !directory.exists() {
        return Ok(Vec::new());
    }
    let mut segments: Vec<PathBuf> = std::fs::read_dir(directory)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("segment-"))
        })
        .collect();
    segments.sort();
    Ok(segments)
}

fn read_segment(path: &Path) -> anyhow::Result<Vec<DlqEntry>> {
    let is_gz = path.extension().is_some_and(|e| e == "gz");
    let raw: Box<dyn std::io::Read> = if is_gz {
        Box::new(GzDecoder::new(std::fs::File::open(path)?))
    } else {
        Box::new(std::fs::File::open(path)?)
    };
    let reader = std::io::BufReader::new(raw);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

/// Compaction: a segment with no surviving entries is deleted outright;
/// otherwise it's rewritten (uncompressed -- it'll be re-gzipped on the
/// next rotation sweep only if it's ever reopened as active, which it
/// isn't, so closed segments that still have content just stay plain).
fn rewrite_or_remove_segment(path: &Path, remaining: &[DlqEntry]) -> anyhow::Result<()> {
    if remaining.is_empty() {
        std::fs::remove_file(path)?;
        return Ok(());
    }
    let tmp_path = path.with_extension("jsonl.tmp");
    {
        let file = std::fs::File::create(&tmp_path)?;
        let mut writer = std::io::BufWriter::new(file);
        for entry in remaining {
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            writer.write_all(&line)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn enforce_retention(directory: &Path, sink_name: &str, retention: &RetentionConfig) -> anyhow::Result<()> {
    let mut segments: Vec<(PathBuf, std::fs::Metadata)> = closed_segments(directory)?
        .into_iter()
        .filter_map(|p| std::fs::metadata(&p).ok().map(|m| (p, m)))
        .collect();
    segments.sort_by_key(|(_, m)| m.modified().ok());

    let mut total_size: u64 = segments.iter().map(|(_, m)| m.len()).sum();
    let mut total_entries: u64 = 0;
    for (path, _) in &segments {
        total_entries += read_segment(path)?.len() as u64;
    }

    let max_age = Duration::from_secs(retention.max_age_secs);
    let now = std::time::SystemTime::now();
    let mut evicted = 0u64;

    for (path, meta) in segments {
        let too_old = meta.modified().ok().and_then(|m| now.duration_since(m).ok()).is_some_and(|age| age >= max_age);
        let too_big = total_size > retention.max_size_bytes;
        let too_many = total_entries > retention.max_entries;
        if too_old || too_big || too_many {
            let entries_in_segment = read_segment(&path)?.len() as u64;
            std::fs::remove_file(&path)?;
            total_size = total_size.saturating_sub(meta.len());
            total_entries = total_entries.saturating_sub(entries_in_segment);
            evicted += entries_in_segment;
        }
    }
    if evicted > 0 {
        metrics::entries_evicted(sink_name, evicted);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use core_types::{
        Record,
        SourceKind,
    };
    use runtime::testing::TestRuntime;
    use tempfile::TempDir;

    use super::*;

    fn sample_entry() -> DlqEntry {
        DlqEntry::new(
            Record::new(SourceKind::File, "/a.log", b"boom".to_vec(), Utc::now(), Utc::now()),
            "http_stream",
            "Unavailable",
            "connection refused",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn add_entry_persists_to_the_active_segment() -> anyhow::Result<()> {
        let rt = TestRuntime::new(1);
        let dir = TempDir::new()?;
        let store = FileDlqStore::start(
            rt,
            "http_stream",
            dir.path().to_owned(),
            Duration::from_millis(10),
            RetentionConfig {
                max_age_secs: 3600,
                max_size_bytes: 1024 * 1024,
                max_entries: 1000,
            },
        )?;
        store.add_entry(sample_entry()).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let contents = std::fs::read_to_string(dir.path().join("active.jsonl"))?;
        assert_eq!(contents.lines().count(), 1);
        Ok(())
    }

    #[test]
    fn rewrite_or_remove_drops_fully_reprocessed_segments() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("segment-test.jsonl");
        rewrite_or_remove_segment(&path, &[])?;
        assert!(!path.exists());

        let entries = vec![sample_entry()];
        rewrite_or_remove_segment(&path, &entries)?;
        assert!(path.exists());
        let read_back = read_segment(&path)?;
        assert_eq!(read_back.len(), 1);
        Ok(())
    }
}
