use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};

static BACKGROUND_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    match Builder::new_multi_thread().worker_threads(1).enable_all().build() {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            log::warn!("failed to build background tokio runtime: {err}");
            None
        }
    }
});

/// Spawns a task that runs in the background, on the ambient tokio runtime when
/// there is one.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    } else {
        log::warn!("dropping background task: no runtime available");
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn detached_task_runs() {
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = async_channel::bounded(1);
        let task_flag = Arc::clone(&flag);
        spawn_detached(async move {
            task_flag.store(true, Ordering::SeqCst);
            let _ = tx.send(()).await;
        });
        rx.recv().await.unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
