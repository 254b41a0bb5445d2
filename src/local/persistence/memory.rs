use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{failed_precondition, FirestoreResult};
use crate::local::persistence::{apply_writes, scan_store, Persistence, StoreMap, StoreName, WriteRecord};

/// Keeps all stores in process memory. State is lost when the client shuts down.
#[derive(Default)]
pub struct MemoryPersistence {
    stores: Mutex<StoreMap>,
    shut_down: AtomicBool,
    #[cfg(test)]
    failures: std::sync::atomic::AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with an unavailable error.
    #[cfg(test)]
    pub(crate) fn fail_next_commits(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn ensure_running(&self) -> FirestoreResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(failed_precondition("The client has already been shut down."));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPersistence").finish()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, store: StoreName, key: &str) -> FirestoreResult<Option<JsonValue>> {
        self.ensure_running()?;
        let stores = self.stores.lock().unwrap();
        Ok(stores.get(&store).and_then(|entries| entries.get(key)).cloned())
    }

    async fn scan(&self, store: StoreName, prefix: &str) -> FirestoreResult<Vec<(String, JsonValue)>> {
        self.ensure_running()?;
        let stores = self.stores.lock().unwrap();
        Ok(scan_store(&stores, store, prefix))
    }

    async fn commit(&self, writes: Vec<WriteRecord>) -> FirestoreResult<()> {
        self.ensure_running()?;
        #[cfg(test)]
        {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(crate::error::unavailable("injected commit failure"));
            }
        }
        let mut stores = self.stores.lock().unwrap();
        apply_writes(&mut stores, &writes);
        Ok(())
    }

    async fn shutdown(&self) -> FirestoreResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn rejects_use_after_shutdown() {
        let persistence = MemoryPersistence::new();
        persistence
            .commit(vec![WriteRecord::Put {
                store: StoreName::Metadata,
                key: "k".into(),
                value: json!(true),
            }])
            .await
            .unwrap();
        persistence.shutdown().await.unwrap();
        let err = persistence.get(StoreName::Metadata, "k").await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }
}
