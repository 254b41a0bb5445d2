//! Storage backends for the local caches.
//!
//! Every cache is a typed view over a handful of ordered key-value stores. A
//! [`PersistenceTransaction`] buffers the writes of one local-store operation and
//! hands them to the backend in a single [`Persistence::commit`] call, so a remote
//! event or a local write is either fully visible or not at all.

mod durable;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{internal_error, FirestoreResult};

pub use durable::{DurablePersistence, DEFAULT_COMPACTION_THRESHOLD};
pub use memory::MemoryPersistence;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreName {
    Mutations,
    DocumentOverlays,
    RemoteDocuments,
    Targets,
    TargetDocuments,
    CollectionParents,
    Metadata,
}

impl StoreName {
    pub const ALL: [StoreName; 7] = [
        StoreName::Mutations,
        StoreName::DocumentOverlays,
        StoreName::RemoteDocuments,
        StoreName::Targets,
        StoreName::TargetDocuments,
        StoreName::CollectionParents,
        StoreName::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Mutations => "mutations",
            StoreName::DocumentOverlays => "documentOverlays",
            StoreName::RemoteDocuments => "remoteDocuments",
            StoreName::Targets => "targets",
            StoreName::TargetDocuments => "targetDocuments",
            StoreName::CollectionParents => "collectionParents",
            StoreName::Metadata => "metadata",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|store| store.as_str() == name)
    }
}

/// One buffered change to a store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum WriteRecord {
    Put {
        store: StoreName,
        key: String,
        value: JsonValue,
    },
    Delete {
        store: StoreName,
        key: String,
    },
}

/// Backend holding the persisted local state.
///
/// Implementations must apply the writes passed to `commit` atomically: after a
/// failed commit none of them may be visible.
#[async_trait]
pub trait Persistence: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, store: StoreName, key: &str) -> FirestoreResult<Option<JsonValue>>;

    /// Entries whose key starts with `prefix`, in key order.
    async fn scan(&self, store: StoreName, prefix: &str) -> FirestoreResult<Vec<(String, JsonValue)>>;

    async fn commit(&self, writes: Vec<WriteRecord>) -> FirestoreResult<()>;

    async fn shutdown(&self) -> FirestoreResult<()>;
}

pub type PersistenceArc = Arc<dyn Persistence>;

/// Buffers the writes of one unit of work and reads through them.
pub struct PersistenceTransaction {
    persistence: PersistenceArc,
    label: &'static str,
    pending: BTreeMap<(StoreName, String), Option<JsonValue>>,
}

impl PersistenceTransaction {
    pub fn new(persistence: PersistenceArc, label: &'static str) -> Self {
        Self {
            persistence,
            label,
            pending: BTreeMap::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub async fn get(&self, store: StoreName, key: &str) -> FirestoreResult<Option<JsonValue>> {
        if let Some(buffered) = self.pending.get(&(store, key.to_string())) {
            return Ok(buffered.clone());
        }
        self.persistence.get(store, key).await
    }

    pub async fn scan(&self, store: StoreName, prefix: &str) -> FirestoreResult<Vec<(String, JsonValue)>> {
        let mut merged: BTreeMap<String, JsonValue> = self.persistence.scan(store, prefix).await?.into_iter().collect();
        for ((pending_store, key), value) in self.pending.range((store, prefix.to_string())..) {
            if *pending_store != store || !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub fn put(&mut self, store: StoreName, key: impl Into<String>, value: JsonValue) {
        self.pending.insert((store, key.into()), Some(value));
    }

    pub fn delete(&mut self, store: StoreName, key: impl Into<String>) {
        self.pending.insert((store, key.into()), None);
    }

    pub async fn get_record<T: DeserializeOwned>(&self, store: StoreName, key: &str) -> FirestoreResult<Option<T>> {
        match self.get(store, key).await? {
            Some(value) => decode_record(store, key, value).map(Some),
            None => Ok(None),
        }
    }

    pub async fn scan_records<T: DeserializeOwned>(
        &self,
        store: StoreName,
        prefix: &str,
    ) -> FirestoreResult<Vec<(String, T)>> {
        self.scan(store, prefix)
            .await?
            .into_iter()
            .map(|(key, value)| decode_record(store, &key, value).map(|record| (key, record)))
            .collect()
    }

    pub fn put_record<T: Serialize>(&mut self, store: StoreName, key: impl Into<String>, record: &T) -> FirestoreResult<()> {
        let key = key.into();
        let value = serde_json::to_value(record).map_err(|err| {
            internal_error(format!("Failed to encode {} record {key}: {err}", store.as_str()))
        })?;
        self.put(store, key, value);
        Ok(())
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.pending.is_empty()
    }

    pub async fn commit(self) -> FirestoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let writes = self
            .pending
            .into_iter()
            .map(|((store, key), value)| match value {
                Some(value) => WriteRecord::Put { store, key, value },
                None => WriteRecord::Delete { store, key },
            })
            .collect::<Vec<_>>();
        log::debug!("committing transaction '{}' with {} writes", self.label, writes.len());
        self.persistence.commit(writes).await
    }
}

fn decode_record<T: DeserializeOwned>(store: StoreName, key: &str, value: JsonValue) -> FirestoreResult<T> {
    serde_json::from_value(value)
        .map_err(|err| internal_error(format!("Corrupt {} record {key}: {err}", store.as_str())))
}

/// In-memory ordered store shared by both backends.
pub(crate) type StoreMap = BTreeMap<StoreName, BTreeMap<String, JsonValue>>;

pub(crate) fn apply_writes(stores: &mut StoreMap, writes: &[WriteRecord]) {
    for write in writes {
        match write {
            WriteRecord::Put { store, key, value } => {
                stores.entry(*store).or_default().insert(key.clone(), value.clone());
            }
            WriteRecord::Delete { store, key } => {
                if let Some(entries) = stores.get_mut(store) {
                    entries.remove(key);
                }
            }
        }
    }
}

pub(crate) fn scan_store(stores: &StoreMap, store: StoreName, prefix: &str) -> Vec<(String, JsonValue)> {
    let Some(entries) = stores.get(&store) else {
        return Vec::new();
    };
    entries
        .range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn transaction_reads_its_own_writes() {
        let persistence: PersistenceArc = Arc::new(MemoryPersistence::new());
        let mut seed = PersistenceTransaction::new(persistence.clone(), "seed");
        seed.put(StoreName::RemoteDocuments, "a/1", json!(1));
        seed.put(StoreName::RemoteDocuments, "a/2", json!(2));
        seed.commit().await.unwrap();

        let mut txn = PersistenceTransaction::new(persistence.clone(), "test");
        txn.delete(StoreName::RemoteDocuments, "a/1");
        txn.put(StoreName::RemoteDocuments, "a/3", json!(3));
        txn.put(StoreName::Targets, "a/4", json!(4));

        let scanned = txn.scan(StoreName::RemoteDocuments, "a/").await.unwrap();
        let keys: Vec<_> = scanned.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["a/2", "a/3"]);

        // Nothing is visible outside the transaction before commit.
        assert!(persistence.get(StoreName::RemoteDocuments, "a/3").await.unwrap().is_none());
        txn.commit().await.unwrap();
        assert!(persistence.get(StoreName::RemoteDocuments, "a/1").await.unwrap().is_none());
        assert_eq!(persistence.get(StoreName::Targets, "a/4").await.unwrap(), Some(json!(4)));
    }
}
