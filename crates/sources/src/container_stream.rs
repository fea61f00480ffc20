use std::time::Duration;

use bollard::{
    container::LogsOptions,
    Docker,
};
use bytes::Bytes;
use futures::{
    Stream,
    StreamExt,
};

/// One chunk read from a container's log stream, or a timeout signal. A
/// timeout is not an error: callers treat it as the expected way a
/// `ManagedStream` read gets unblocked so cancellation can be observed (see
/// [`ManagedStream::next`]).
pub enum StreamItem {
    Chunk(Bytes),
    Timeout,
}

/// Wraps a container's log stream so every read races against a deadline.
/// `bollard`'s underlying Hyper connection exposes no raw socket-timeout
/// knob reachable mid-stream, so the deadline is enforced at this layer: each
/// `next().await` races the inner stream against `tokio::time::sleep`, and a
/// `Timeout` is surfaced instead of blocking forever. This is the mechanism
/// that actually unblocks a stuck read; a cancellation token alone is not
/// sufficient since the inner Hyper future doesn't poll its own cancellation
/// source.
pub struct ManagedStream {
    inner: std::pin::Pin<Box<dyn Stream<Item = Result<Bytes, bollard::errors::Error>> + Send>>,
    read_deadline: Duration,
}

impl ManagedStream {
    pub fn open(docker: &Docker, container_id: &str, read_deadline: Duration) -> Self {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: "0".to_string(),
            ..Default::default()
        };
        let inner = docker
            .logs(container_id, Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(log_output) => Some(Ok(log_output.into_bytes())),
                    Err(e) => Some(Err(e)),
                }
            })
            .boxed();
        Self { inner, read_deadline }
    }

    /// `None` means the stream ended (container stopped, connection closed).
    pub async fn next(&mut self) -> Option<Result<StreamItem, bollard::errors::Error>> {
        tokio::select! {
            biased;
            item = self.inner.next() => {
                item.map(|r| r.map(StreamItem::Chunk))
            },
            () = tokio::time::sleep(self.read_deadline) => {
                Some(Ok(StreamItem::Timeout))
            },
        }
    }
}
