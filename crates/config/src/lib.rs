//! Loads the agent's configuration file from disk at startup and reloads it
//! on `SIGHUP` (or a manual trigger, used in tests).
use std::path::PathBuf;

use anyhow::Context;
use decoding::ConfigDecoder;
use errors::report_error;
use futures::{
    Stream,
    StreamExt,
};
use runtime::{
    Runtime,
    SpawnHandle,
};
use tokio::{
    signal::unix::SignalKind,
    sync::watch,
};
use tokio_stream::wrappers::{
    ReceiverStream,
    SignalStream,
    WatchStream,
};

pub mod decoding;
pub mod schema;

pub use schema::AgentConfig;

/// Loads a config file from disk on creation and again whenever a reload is
/// triggered. Subscribers get a stream of decoded updates over a
/// `tokio::sync::watch` channel; decoding happens once per update regardless
/// of subscriber count, and the output is only cloned when a subscriber asks
/// for ownership.
///
/// Requires running inside a Tokio runtime (uses `tokio::fs`).
pub struct ConfigLoader<D: ConfigDecoder + Send + 'static> {
    config_rx: watch::Receiver<D::Output>,
    reload_tx: tokio::sync::mpsc::Sender<()>,
    handle: Box<dyn SpawnHandle>,
}

impl<D: ConfigDecoder + Send + 'static> ConfigLoader<D> {
    pub async fn new<RT: Runtime>(
        rt: RT,
        signal_kind: SignalKind,
        config_path: PathBuf,
        decoder: D,
    ) -> anyhow::Result<Self> {
        // Install the signal handler before spawning the reload task so we
        // can't miss a SIGHUP delivered right after the initial read.
        let signal_fut =
            tokio::signal::unix::signal(signal_kind).context("couldn't install signal handler")?;
        let initial_value = decoder
            .decode(tokio::fs::read(&config_path).await.with_context(|| {
                format!("couldn't read config file {}", config_path.display())
            })?)
            .with_context(|| format!("couldn't parse config file {}", config_path.display()))?;
        let (config_tx, config_rx) = watch::channel(initial_value);
        let task_decoder = decoder.clone();
        let (reload_tx, reload_rx) = tokio::sync::mpsc::channel(1);
        let handle = rt.spawn("config_loader", async move {
            let config_path = config_path;
            let decoder = task_decoder;
            tracing::info!(path = %config_path.display(), "watching config file for reload signals");
            let mut stream = futures::stream::select(
                SignalStream::new(signal_fut),
                ReceiverStream::new(reload_rx),
            );
            loop {
                let () = stream.select_next_some().await;
                match tokio::fs::read(&config_path)
                    .await
                    .map_err(anyhow::Error::from)
                    .and_then(|s| decoder.decode(s))
                    .with_context(|| format!("failed to reload config from {config_path:?}"))
                {
                    Ok(config) => {
                        tracing::info!(path = %config_path.display(), "reloaded config");
                        config_tx.send_if_modified(|old_config| {
                            if old_config != &config {
                                *old_config = config;
                                true
                            } else {
                                false
                            }
                        });
                    },
                    Err(mut e) => {
                        report_error(&mut e).await;
                        continue;
                    },
                }
            }
        });
        Ok(ConfigLoader {
            handle,
            config_rx,
            reload_tx,
        })
    }

    /// A stream of updates to the config file. Starts blocked; use
    /// [`ConfigLoader::get_config`] to read the current value immediately.
    /// Only emits when the decoded result actually changes.
    pub fn subscribe(&self) -> impl Stream<Item = D::Output> + Unpin {
        let mut rx = self.config_rx.clone();
        rx.mark_unchanged();
        WatchStream::from_changes(rx)
    }

    /// The current decoded config.
    pub fn get_config(&self) -> D::Output {
        self.config_rx.borrow().clone()
    }

    /// Manually trigger a reload, bypassing the signal handler. Used by
    /// tests and by an admin endpoint that wants to force a reload.
    pub fn reload(&self) {
        let _ = self.reload_tx.try_send(());
    }
}

impl<D: ConfigDecoder + Send> Drop for ConfigLoader<D> {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{
        Seek,
        Write,
    };

    use futures::FutureExt;
    use runtime::testing::TestRuntime;
    use tokio::signal::unix::SignalKind;

    use crate::{
        decoding::TomlDecoder,
        schema::AgentConfig,
        ConfigLoader,
    };

    #[tokio::test(start_paused = true)]
    async fn reload_picks_up_changed_file() -> anyhow::Result<()> {
        let rt = TestRuntime::new(1);
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(sample_config(6).as_bytes())?;
        let loader = ConfigLoader::new(
            rt,
            SignalKind::user_defined1(),
            file.path().to_owned(),
            TomlDecoder::<AgentConfig>::new(),
        )
        .await?;
        assert_eq!(loader.get_config().dispatcher.worker_count, 6);

        let mut subscription = loader.subscribe().fuse();
        assert!(subscription.next().now_or_never().is_none());

        file.as_file().set_len(0)?;
        file.seek(std::io::SeekFrom::Start(0))?;
        file.write_all(sample_config(9).as_bytes())?;
        loader.reload();

        let next = subscription.select_next_some().await;
        assert_eq!(next.dispatcher.worker_count, 9);
        assert_eq!(loader.get_config().dispatcher.worker_count, 9);
        Ok(())
    }

    fn sample_config(worker_count: u32) -> String {
        format!(
            r#"
            [dispatcher]
            queue_size = 50000
            worker_count = {worker_count}

            [dispatcher.batch_processor]
            enabled = true
            max_size = 500
            flush_interval_ms = 1000

            [dispatcher.backpressure]
            soft = 0.7
            hard = 0.95

            [file_monitor]
            enabled = true
            paths = ["/var/log/app/*.log"]

            [container_monitor]
            enabled = false

            [dlq]
            enabled = true
            directory = "/var/lib/agent/dlq"

            [position_store]
            path = "/var/lib/agent/positions.json"

            [logging]
            level = "info"

            [admin]
            enabled = true
            bind_addr = "127.0.0.1:9000"
            "#
        )
    }
}
