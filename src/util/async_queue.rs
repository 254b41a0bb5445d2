use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{cancelled, failed_precondition, unavailable, FirestoreErrorCode, FirestoreResult};
use crate::platform::runtime;
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

type Job = BoxFuture<'static, ()>;

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;

/// How the queue retries operations whose persistence layer failed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            backoff: BackoffConfig {
                initial_delay: std::time::Duration::from_millis(100),
                backoff_factor: 1.5,
                max_delay: std::time::Duration::from_secs(2),
            },
        }
    }
}

/// Serial executor shared by the local store, the sync engine and the remote
/// store.
///
/// Operations run one at a time in the order they were enqueued. An operation
/// must never enqueue another one and wait for it: the second operation can only
/// start once the first has finished.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

struct AsyncQueueInner {
    sender: Sender<Job>,
    shutting_down: AtomicBool,
    retry: RetryPolicy,
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry: RetryPolicy) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        runtime::spawn_detached(run_worker(receiver));
        Self {
            inner: Arc::new(AsyncQueueInner {
                sender,
                shutting_down: AtomicBool::new(false),
                retry,
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Runs `operation` after every previously enqueued operation and returns its
    /// result.
    pub async fn enqueue<F, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        self.push(operation).await
    }

    /// Schedules `operation` without waiting for it.
    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            log::debug!("dropping operation enqueued after shutdown");
            return;
        }
        if self.inner.sender.try_send(operation.boxed()).is_err() {
            log::debug!("async queue worker is gone, dropping operation");
        }
    }

    /// Like [`enqueue`](Self::enqueue), but reruns the whole operation with
    /// backoff while it fails with an `Unavailable` error. Once the attempts are
    /// exhausted the failure is reported as unavailable persistence.
    pub async fn enqueue_retryable<F, Fut, T>(&self, label: &'static str, operation: F) -> FirestoreResult<T>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let policy = self.inner.retry;
        self.enqueue(async move { retry_unavailable(policy, label, operation).await })
            .await
    }

    /// Runs `operation` in place with the queue's retry policy. Meant for
    /// operations that already run on the queue.
    pub async fn run_retryable<F, Fut, T>(&self, label: &'static str, operation: F) -> FirestoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = FirestoreResult<T>>,
    {
        retry_unavailable(self.inner.retry, label, operation).await
    }

    /// Marks the queue as shutting down and runs `operation` as its final
    /// operation. Later calls to `enqueue` fail with `FailedPrecondition`.
    pub async fn enqueue_and_initiate_shutdown<F, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Err(failed_precondition("The client has already been terminated."));
        }
        let result = self.push(operation).await;
        self.inner.sender.close();
        result
    }

    /// Waits until every operation enqueued before this call has finished.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.push(async { Ok(()) }).await
    }

    async fn push<F, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = async_channel::bounded(1);
        let job = async move {
            let result = operation.await;
            let _ = result_tx.send(result).await;
        }
        .boxed();
        self.inner
            .sender
            .send(job)
            .await
            .map_err(|_| failed_precondition("The client has already been terminated."))?;
        result_rx
            .recv()
            .await
            .map_err(|_| cancelled("queued operation was dropped before completing"))?
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn retry_unavailable<F, Fut, T>(policy: RetryPolicy, label: &'static str, operation: F) -> FirestoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
{
    let mut backoff = ExponentialBackoff::new(policy.backoff);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Err(err) if err.code == FirestoreErrorCode::Unavailable => {
                if attempt >= policy.max_attempts {
                    log::warn!("operation '{label}' failed after {attempt} attempts: {err}");
                    return Err(unavailable(format!("persistence unavailable: {}", err.message())));
                }
                log::debug!("retrying operation '{label}' after failure: {err}");
                runtime::sleep(backoff.next_delay()).await;
            }
            other => return other,
        }
    }
}

async fn run_worker(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv().await {
        job.await;
    }
    log::debug!("async queue worker stopped");
}
