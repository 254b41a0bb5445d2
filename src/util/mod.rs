pub mod async_queue;
pub mod backoff;

pub use async_queue::{AsyncQueue, RetryPolicy, DEFAULT_MAX_RETRY_ATTEMPTS};
pub use backoff::{BackoffConfig, ExponentialBackoff};
