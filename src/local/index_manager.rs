use std::collections::BTreeSet;

use serde_json::json;

use crate::error::FirestoreResult;
use crate::local::persistence::{PersistenceTransaction, StoreName};
use crate::model::ResourcePath;

/// Tracks the parents of every collection id seen so collection-group queries
/// know which collections to scan.
#[derive(Clone, Debug, Default)]
pub struct IndexManager;

impl IndexManager {
    pub fn new() -> Self {
        Self
    }

    /// Records `collection_path` under its collection id. Root collections have
    /// an empty parent.
    pub async fn add_to_collection_parent_index(
        &self,
        txn: &mut PersistenceTransaction,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        let key = parent_key(collection_id, &collection_path.without_last());
        if txn.get(StoreName::CollectionParents, &key).await?.is_none() {
            txn.put(StoreName::CollectionParents, key, json!(true));
        }
        Ok(())
    }

    pub async fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction,
        collection_id: &str,
    ) -> FirestoreResult<BTreeSet<ResourcePath>> {
        let prefix = format!("{collection_id}|");
        let mut parents = BTreeSet::new();
        for (key, _) in txn.scan(StoreName::CollectionParents, &prefix).await? {
            let parent = &key[prefix.len()..];
            if parent.is_empty() {
                parents.insert(ResourcePath::root());
            } else {
                parents.insert(ResourcePath::from_string(parent)?);
            }
        }
        Ok(parents)
    }
}

fn parent_key(collection_id: &str, parent: &ResourcePath) -> String {
    format!("{collection_id}|{}", parent.canonical_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::{MemoryPersistence, PersistenceArc};
    use std::sync::Arc;

    #[tokio::test]
    async fn collects_parents_per_collection_id() {
        let persistence: PersistenceArc = Arc::new(MemoryPersistence::new());
        let index = IndexManager::new();
        let mut txn = PersistenceTransaction::new(persistence.clone(), "index");
        for path in ["messages", "rooms/a/messages", "rooms/b/messages", "rooms"] {
            index
                .add_to_collection_parent_index(&mut txn, &ResourcePath::from_string(path).unwrap())
                .await
                .unwrap();
        }
        txn.commit().await.unwrap();

        let txn = PersistenceTransaction::new(persistence, "read");
        let parents = index.get_collection_parents(&txn, "messages").await.unwrap();
        let rendered: Vec<_> = parents.iter().map(ResourcePath::canonical_string).collect();
        assert_eq!(rendered, vec!["", "rooms/a", "rooms/b"]);
        assert_eq!(index.get_collection_parents(&txn, "rooms").await.unwrap().len(), 1);
    }
}
