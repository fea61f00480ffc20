//! Production implementation of the [`crate::Runtime`] trait: real wall
//! clock, real OS threads, Tokio's multi-threaded executor.
use std::{
    future::Future,
    ops::{
        Add,
        Sub,
    },
    pin::Pin,
    sync::LazyLock,
    thread,
    time::{
        Instant,
        SystemTime,
    },
};

use async_trait::async_trait;
use futures::{
    channel::oneshot,
    future::{
        BoxFuture,
        FusedFuture,
    },
    FutureExt,
};
use rand::rngs::ThreadRng;
use tokio::{
    runtime::{
        Builder,
        Handle as TokioRuntimeHandle,
        Runtime as TokioRuntime,
    },
    time::sleep,
};

use crate::{
    JoinError,
    Runtime,
    RuntimeInstant,
    SpawnHandle,
};

static INSTANT_EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Twice Rust's default thread stack size; `spawn_thread` is used for
/// synchronous file-tailing loops that can recurse through fairly deep
/// `notify`/std::fs call stacks.
pub const STACK_SIZE: usize = 4 * 1024 * 1024;

pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for FutureHandle {
    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        (&mut self.handle).map(|r| r.map_err(JoinError::from)).boxed()
    }
}

pub struct ThreadHandle {
    cancel: Option<oneshot::Sender<()>>,
    done: Option<oneshot::Receiver<bool>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SpawnHandle for ThreadHandle {
    fn shutdown(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        async move {
            let done = self.done.take().expect("join() called twice");
            if let Ok(was_canceled) = done.await {
                return if was_canceled {
                    Err(JoinError::Canceled)
                } else {
                    Ok(())
                };
            }
            let join_r = self.handle.take().expect("future completed twice?").join();
            let join_err = join_r.expect_err("thread didn't exit cleanly but didn't panic?");
            Err(JoinError::Panicked(anyhow::anyhow!("{join_err:?}")))
        }
        .boxed()
    }
}

impl ThreadHandle {
    fn spawn<Fut, F>(tokio_handle: TokioRuntimeHandle, f: F) -> Self
    where
        Fut: Future<Output = ()>,
        F: FnOnce() -> Fut + Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let thread_handle = thread::Builder::new()
            .stack_size(STACK_SIZE)
            .spawn(move || {
                let _guard = tokio_handle.enter();
                let thread_body = async move {
                    let future = f();
                    let was_canceled = futures::select! {
                        _ = cancel_rx => true,
                        _ = future.fuse() => false,
                    };
                    let _ = done_tx.send(was_canceled);
                };
                tokio_handle.block_on(thread_body);
            })
            .expect("failed to spawn OS thread");
        ThreadHandle {
            handle: Some(thread_handle),
            cancel: Some(cancel_tx),
            done: Some(done_rx),
        }
    }
}

/// Runs against wall-clock time with no mocked-out functionality.
#[derive(Clone)]
pub struct ProdRuntime {
    rt: TokioRuntimeHandle,
}

impl ProdRuntime {
    pub fn init_tokio(worker_threads: Option<usize>) -> anyhow::Result<TokioRuntime> {
        assert!(
            TokioRuntimeHandle::try_current().is_err(),
            "tried to create a ProdRuntime from within an existing Tokio context"
        );
        let mut builder = Builder::new_multi_thread();
        builder.thread_stack_size(STACK_SIZE);
        if let Some(n) = worker_threads {
            builder.worker_threads(n);
        }
        Ok(builder.enable_all().build()?)
    }

    /// `tokio_rt` must outlive every `ProdRuntime` handle derived from it;
    /// using a handle after the runtime is dropped panics.
    pub fn new(tokio_rt: &TokioRuntime) -> Self {
        Self {
            rt: tokio_rt.handle().clone(),
        }
    }

    pub fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.rt.block_on(f)
    }
}

#[async_trait]
impl Runtime for ProdRuntime {
    type Instant = ProdInstant;
    type Rng = ThreadRng;

    fn wait(&self, duration: std::time::Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(FutureHandle {
            handle: self.rt.spawn(f),
        })
    }

    fn spawn_thread<Fut: Future<Output = ()>, F: FnOnce() -> Fut + Send + 'static>(
        &self,
        f: F,
    ) -> Box<dyn SpawnHandle> {
        Box::new(ThreadHandle::spawn(self.rt.clone(), f))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> ProdInstant {
        LazyLock::force(&INSTANT_EPOCH);
        ProdInstant(Instant::now())
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut Self::Rng) -> T) -> T {
        let mut rng = rand::thread_rng();
        f(&mut rng)
    }
}

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct ProdInstant(Instant);

impl Sub for ProdInstant {
    type Output = std::time::Duration;

    fn sub(self, rhs: Self) -> std::time::Duration {
        self.0 - rhs.0
    }
}

impl Add<std::time::Duration> for ProdInstant {
    type Output = Self;

    fn add(self, rhs: std::time::Duration) -> Self {
        Self(self.0 + rhs)
    }
}

impl RuntimeInstant for ProdInstant {
    fn elapsed(&self) -> std::time::Duration {
        self.0.elapsed()
    }
}
