use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
};

use core_types::Position;
use parking_lot::RwLock;
use runtime::{
    Runtime,
    SpawnHandle,
};
use tokio::sync::mpsc;

/// Single-writer, single-file JSON persistence of every tracked file's
/// [`Position`]. The File Monitor is the only writer; readers (the admin
/// surface, tests) go through [`PositionStore::snapshot`]. On startup a
/// corrupt file is logged and treated as empty -- losing positions is
/// preferable to refusing to start.
pub struct PositionStore {
    cache: Arc<RwLock<HashMap<(String, u64), Position>>>,
    update_tx: mpsc::Sender<Position>,
    writer_handle: parking_lot::Mutex<Option<Box<dyn SpawnHandle>>>,
}

impl PositionStore {
    pub fn start<RT: Runtime>(runtime: RT, path: PathBuf, flush_interval: std::time::Duration) -> anyhow::Result<Arc<Self>> {
        let loaded = load(&path);
        let cache = Arc::new(RwLock::new(loaded));
        let (update_tx, update_rx) = mpsc::channel(4_096);

        let writer_cache = cache.clone();
        let handle = runtime.spawn("position_store_writer", writer_loop(runtime, path, writer_cache, update_rx, flush_interval));

        Ok(Arc::new(Self {
            cache,
            update_tx,
            writer_handle: parking_lot::Mutex::new(Some(handle)),
        }))
    }

    /// Called by a file reader after every successful read. Non-blocking:
    /// the in-memory cache is updated immediately (so a concurrent
    /// `get`/`snapshot` sees the latest value) and the on-disk write is
    /// batched by the writer task.
    pub fn record(&self, position: Position) {
        self.cache.write().insert((position.path.clone(), position.inode), position.clone());
        let _ = self.update_tx.try_send(position);
    }

    pub fn get(&self, path: &str, inode: u64) -> Option<Position> {
        self.cache.read().get(&(path.to_string(), inode)).cloned()
    }

    pub fn snapshot(&self) -> Vec<Position> {
        self.cache.read().values().cloned().collect()
    }

    /// Flushes one final time and stops the writer task. Safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        if let Some(mut handle) = self.writer_handle.lock().take() {
            handle.shutdown();
            let _ = handle.join().await;
        }
    }
}

fn load(path: &PathBuf) -> HashMap<(String, u64), Position> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read position store, starting empty");
            return HashMap::new();
        },
    };
    match serde_json::from_str::<Vec<Position>>(&contents) {
        Ok(positions) => positions.into_iter().map(|p| ((p.path.clone(), p.inode), p)).collect(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "position store file is corrupt, starting empty");
            HashMap::new()
        },
    }
}

async fn writer_loop<RT: Runtime>(
    runtime: RT,
    path: PathBuf,
    cache: Arc<RwLock<HashMap<(String, u64), Position>>>,
    mut update_rx: mpsc::Receiver<Position>,
    flush_interval: std::time::Duration,
) {
    let mut dirty = false;
    loop {
        let tick = runtime.wait(flush_interval);
        tokio::select! {
            biased;
            update = update_rx.recv() => {
                match update {
                    None => break,
                    Some(_) => dirty = true,
                }
            },
            _ = tick => {
                if dirty {
                    flush(&path, &cache);
                    dirty = false;
                }
            },
        }
    }
    flush(&path, &cache);
}

fn flush(path: &PathBuf, cache: &Arc<RwLock<HashMap<(String, u64), Position>>>) {
    let positions: Vec<Position> = cache.read().values().cloned().collect();
    let result = (|| -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_vec(&positions)?;
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if let Err(e) = result {
        tracing::error!(path = %path.display(), error = %e, "failed to persist position store");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use runtime::testing::TestRuntime;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn records_survive_a_restart() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("positions.json");

        let rt = TestRuntime::new(0);
        let store = PositionStore::start(rt.clone(), path.clone(), std::time::Duration::from_millis(10))?;
        store.record(Position {
            path: "/var/log/app.log".to_string(),
            inode: 42,
            offset: 100,
            last_read_at: Utc::now(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        store.shutdown().await;

        let reopened = PositionStore::start(rt, path, std::time::Duration::from_secs(5))?;
        let position = reopened.get("/var/log/app.log", 42).expect("position persisted");
        assert_eq!(position.offset, 100);
        Ok(())
    }

    #[test]
    fn corrupt_file_loads_as_empty() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("positions.json");
        std::fs::write(&path, b"not json")?;
        assert!(load(&path).is_empty());
        Ok(())
    }
}
