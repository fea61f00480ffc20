//! Deterministic runtime for tests: built on `tokio::time::pause()` rather
//! than a bespoke executor, so `wait`/timeouts advance instantly and in lock
//! step with each other instead of sleeping real wall-clock time. Must be
//! constructed inside a `#[tokio::test(start_paused = true)]` (or after
//! calling `tokio::time::pause()` manually) to take effect.
use std::{
    future::Future,
    ops::{
        Add,
        Sub,
    },
    pin::Pin,
    sync::{
        Arc,
        Mutex,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use async_trait::async_trait;
use futures::future::{
    BoxFuture,
    FusedFuture,
    FutureExt,
};
use rand::{
    rngs::StdRng,
    SeedableRng,
};
use tokio::time::{
    sleep,
    Instant as TokioInstant,
};

use crate::{
    JoinError,
    Runtime,
    RuntimeInstant,
    SpawnHandle,
};

pub struct TestFutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for TestFutureHandle {
    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        (&mut self.handle).map(|r| r.map_err(JoinError::from)).boxed()
    }
}

#[derive(Clone)]
pub struct TestRuntime {
    start_instant: TokioInstant,
    start_system_time: SystemTime,
    rng: Arc<Mutex<StdRng>>,
}

impl TestRuntime {
    /// `seed` makes jittered backoff/retry timing reproducible across runs of
    /// the same test.
    pub fn new(seed: u64) -> Self {
        Self {
            start_instant: TokioInstant::now(),
            start_system_time: SystemTime::now(),
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl Runtime for TestRuntime {
    type Instant = TestInstant;
    type Rng = StdRng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(TestFutureHandle {
            handle: tokio::spawn(f),
        })
    }

    fn spawn_thread<Fut: Future<Output = ()>, F: FnOnce() -> Fut + Send + 'static>(
        &self,
        f: F,
    ) -> Box<dyn SpawnHandle> {
        // No real OS thread in tests: spawning on the paused executor keeps
        // the whole test deterministic.
        Box::new(TestFutureHandle {
            handle: tokio::spawn(f()),
        })
    }

    fn system_time(&self) -> SystemTime {
        self.start_system_time + (TokioInstant::now() - self.start_instant)
    }

    fn monotonic_now(&self) -> TestInstant {
        TestInstant(TokioInstant::now())
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut Self::Rng) -> T) -> T {
        let mut rng = self.rng.lock().expect("test rng poisoned");
        f(&mut rng)
    }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct TestInstant(TokioInstant);

impl Sub for TestInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0 - rhs.0
    }
}

impl Add<Duration> for TestInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

impl RuntimeInstant for TestInstant {
    fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_advances_virtual_clock_instantly() {
        let rt = TestRuntime::new(42);
        let before = rt.monotonic_now();
        rt.wait(Duration::from_secs(3600)).await;
        let after = rt.monotonic_now();
        assert!(after - before >= Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn rng_is_reproducible_for_a_fixed_seed() {
        let rt_a = TestRuntime::new(7);
        let rt_b = TestRuntime::new(7);
        let a: u64 = rt_a.with_rng(rand::Rng::gen);
        let b: u64 = rt_b.with_rng(rand::Rng::gen);
        assert_eq!(a, b);
    }
}
