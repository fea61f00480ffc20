//! Runtime abstraction over OS-esque concerns (clock, spawning, randomness)
//! so the rest of the agent can be parameterized by a given runtime
//! implementation rather than calling `tokio::spawn`/`Instant::now`/etc.
//! directly. [`prod::ProdRuntime`] is the real thing; [`testing::TestRuntime`]
//! runs on a paused Tokio clock so timing-dependent tests (backoff, batch
//! flush intervals, circuit breaker recovery) are deterministic and instant.
use std::{
    future::Future,
    ops::{
        Add,
        Sub,
    },
    pin::Pin,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use async_trait::async_trait;
use futures::future::{
    BoxFuture,
    FusedFuture,
};
use rand::RngCore;
use serde::Serialize;
use uuid::Uuid;

mod backoff;
pub mod prod;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backoff::Backoff;

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("task canceled")]
    Canceled,
    #[error("task panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(anyhow::anyhow!("{e}"))
        }
    }
}

/// A handle to a spawned task. Cooperative: `shutdown` just requests
/// cancellation (aborts the underlying Tokio task, or signals a spawned
/// thread to check its cancellation flag); the caller must still `join` to
/// observe completion. Distinct shutdown/join steps, rather than a shared
/// wait-group across tasks, keep an unrelated task's lifetime from being
/// accidentally tied to this one's.
pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Shut down the given task and wait for it to finish, treating a clean
/// cancellation as success.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    match handle.join().await {
        Ok(()) | Err(JoinError::Canceled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub trait RuntimeInstant:
    Copy + Send + Sync + Sub<Self, Output = Duration> + Add<Duration, Output = Self>
{
    fn elapsed(&self) -> Duration;
}

/// An operating-system abstraction: functionality like time, randomness, and
/// task spawning that should behave differently between tests and
/// production. Application code is generic over `R: Runtime` rather than
/// calling `tokio`/`std::time` directly, so tests can run on a virtual clock.
#[async_trait]
pub trait Runtime: Clone + Sync + Send + 'static {
    type Instant: RuntimeInstant;
    type Rng: RngCore;

    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Spawn a future on a reserved OS thread, for blocking work (e.g. a
    /// synchronous file read loop) that shouldn't tie up the async executor.
    #[must_use = "threads are canceled when their `SpawnHandle` is dropped"]
    fn spawn_thread<Fut: Future<Output = ()>, F: FnOnce() -> Fut + Send + 'static>(
        &self,
        f: F,
    ) -> Box<dyn SpawnHandle>;

    /// A potentially-virtualized reading of wall-clock time.
    fn system_time(&self) -> SystemTime;

    fn unix_timestamp(&self) -> UnixTimestamp {
        UnixTimestamp(
            self.system_time()
                .duration_since(UNIX_EPOCH)
                .expect("system clock is before the Unix epoch"),
        )
    }

    /// A potentially-virtualized reading from a monotonic clock, for
    /// measuring elapsed durations (never for wall-clock comparisons).
    fn monotonic_now(&self) -> Self::Instant;

    fn with_rng<T>(&self, f: impl FnOnce(&mut Self::Rng) -> T) -> T;

    fn new_uuid_v4(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        self.with_rng(|rng| rng.fill_bytes(&mut bytes));
        uuid::Builder::from_random_bytes(bytes).into_uuid()
    }
}

/// A Unix timestamp, stored as a duration since the epoch. Only meaningful
/// for times at or after `UNIX_EPOCH`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub struct UnixTimestamp(Duration);

impl UnixTimestamp {
    pub fn from_secs_f64(secs: f64) -> Self {
        UnixTimestamp(Duration::from_secs_f64(secs))
    }

    pub fn from_millis(ms: u64) -> Self {
        UnixTimestamp(Duration::from_millis(ms))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn as_system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.0
    }

    pub fn checked_sub(&self, rhs: UnixTimestamp) -> Option<Duration> {
        self.0.checked_sub(rhs.0)
    }
}

impl Sub<UnixTimestamp> for UnixTimestamp {
    type Output = Duration;

    fn sub(self, rhs: UnixTimestamp) -> Duration {
        self.0 - rhs.0
    }
}

impl Add<Duration> for UnixTimestamp {
    type Output = UnixTimestamp;

    fn add(self, rhs: Duration) -> UnixTimestamp {
        UnixTimestamp(self.0 + rhs)
    }
}
