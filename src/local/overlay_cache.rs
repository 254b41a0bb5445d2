use std::collections::{BTreeMap, BTreeSet};

use crate::error::FirestoreResult;
use crate::local::local_serializer::{DbDocumentOverlay, LocalSerializer};
use crate::local::persistence::{PersistenceTransaction, StoreName};
use crate::model::{DocumentKey, Mutation, Overlay, ResourcePath};

/// Overlays keyed by document.
pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;

/// Stores, per document, the single mutation that turns the remote document into
/// its local view.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    serializer: LocalSerializer,
}

impl DocumentOverlayCache {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    pub async fn get_overlay(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<Option<Overlay>> {
        let record = txn
            .get_record::<DbDocumentOverlay>(StoreName::DocumentOverlays, &overlay_key(key))
            .await?;
        record
            .map(|record| self.serializer.from_db_document_overlay(&record))
            .transpose()
    }

    pub async fn get_overlays(
        &self,
        txn: &PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<OverlayMap> {
        let mut overlays = OverlayMap::new();
        for key in keys {
            if let Some(overlay) = self.get_overlay(txn, key).await? {
                overlays.insert(key.clone(), overlay);
            }
        }
        Ok(overlays)
    }

    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        largest_batch_id: i32,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        for (key, mutation) in overlays {
            let overlay = Overlay::new(largest_batch_id, mutation.clone());
            let record = self.serializer.to_db_document_overlay(&overlay);
            txn.put_record(StoreName::DocumentOverlays, overlay_key(key), &record)?;
        }
        Ok(())
    }

    pub fn remove_overlay(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) {
        txn.delete(StoreName::DocumentOverlays, overlay_key(key));
    }

    /// Drops the overlays of `keys` that were last written by `batch_id`.
    pub async fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
        batch_id: i32,
    ) -> FirestoreResult<()> {
        for key in keys {
            let store_key = overlay_key(key);
            let record = txn
                .get_record::<DbDocumentOverlay>(StoreName::DocumentOverlays, &store_key)
                .await?;
            if record.is_some_and(|record| record.largest_batch_id == batch_id) {
                txn.delete(StoreName::DocumentOverlays, store_key);
            }
        }
        Ok(())
    }

    /// Overlays of documents directly inside `collection` written after
    /// `since_batch_id`.
    pub async fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> FirestoreResult<OverlayMap> {
        let prefix = collection_prefix(collection);
        let mut overlays = OverlayMap::new();
        for (_, record) in txn
            .scan_records::<DbDocumentOverlay>(StoreName::DocumentOverlays, &prefix)
            .await?
        {
            if record.largest_batch_id <= since_batch_id || record.collection_path != collection.canonical_string() {
                continue;
            }
            let overlay = self.serializer.from_db_document_overlay(&record)?;
            overlays.insert(overlay.key().clone(), overlay);
        }
        Ok(overlays)
    }

    /// Overlays in any collection named `collection_group`, newer than
    /// `since_batch_id`. Whole batches are returned in batch order until at least
    /// `count` overlays were collected.
    pub async fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction,
        collection_group: &str,
        since_batch_id: i32,
        count: usize,
    ) -> FirestoreResult<OverlayMap> {
        let mut by_batch: BTreeMap<i32, Vec<Overlay>> = BTreeMap::new();
        for (_, record) in txn
            .scan_records::<DbDocumentOverlay>(StoreName::DocumentOverlays, "")
            .await?
        {
            if record.collection_group != collection_group || record.largest_batch_id <= since_batch_id {
                continue;
            }
            let overlay = self.serializer.from_db_document_overlay(&record)?;
            by_batch.entry(record.largest_batch_id).or_default().push(overlay);
        }

        let mut overlays = OverlayMap::new();
        for batch in by_batch.into_values() {
            if overlays.len() >= count {
                break;
            }
            for overlay in batch {
                overlays.insert(overlay.key().clone(), overlay);
            }
        }
        Ok(overlays)
    }
}

fn overlay_key(key: &DocumentKey) -> String {
    key.path().canonical_string()
}

fn collection_prefix(collection: &ResourcePath) -> String {
    if collection.is_empty() {
        String::new()
    } else {
        format!("{}/", collection.canonical_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::{MemoryPersistence, PersistenceArc};
    use crate::model::DatabaseId;
    use crate::remote::JsonProtoSerializer;
    use crate::value::MapValue;
    use std::sync::Arc;

    fn cache() -> (PersistenceArc, DocumentOverlayCache) {
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)")));
        (Arc::new(MemoryPersistence::new()), DocumentOverlayCache::new(serializer))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    async fn save(persistence: &PersistenceArc, cache: &DocumentOverlayCache, batch_id: i32, paths: &[&str]) {
        let mut txn = PersistenceTransaction::new(persistence.clone(), "save");
        let overlays = paths
            .iter()
            .map(|path| (key(path), Mutation::set(key(path), MapValue::empty())))
            .collect();
        cache.save_overlays(&mut txn, batch_id, &overlays).unwrap();
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn collection_scan_skips_nested_and_older_overlays() {
        let (persistence, cache) = cache();
        save(&persistence, &cache, 1, &["rooms/a", "rooms/a/messages/m1"]).await;
        save(&persistence, &cache, 2, &["rooms/b", "roomsX/c"]).await;

        let txn = PersistenceTransaction::new(persistence, "read");
        let rooms = ResourcePath::from_string("rooms").unwrap();
        let all = cache.get_overlays_for_collection(&txn, &rooms, -1).await.unwrap();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/a"), key("rooms/b")]);

        let newer = cache.get_overlays_for_collection(&txn, &rooms, 1).await.unwrap();
        assert_eq!(newer.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
    }

    #[tokio::test]
    async fn collection_group_returns_whole_batches() {
        let (persistence, cache) = cache();
        save(&persistence, &cache, 1, &["a/1/messages/x", "b/1/messages/y"]).await;
        save(&persistence, &cache, 2, &["c/1/messages/z"]).await;

        let txn = PersistenceTransaction::new(persistence, "read");
        let overlays = cache
            .get_overlays_for_collection_group(&txn, "messages", -1, 1)
            .await
            .unwrap();
        assert_eq!(overlays.len(), 2);
        assert!(overlays.values().all(|overlay| overlay.largest_batch_id == 1));
    }

    #[tokio::test]
    async fn removal_only_touches_overlays_of_that_batch() {
        let (persistence, cache) = cache();
        save(&persistence, &cache, 1, &["docs/a"]).await;
        save(&persistence, &cache, 2, &["docs/b"]).await;

        let mut txn = PersistenceTransaction::new(persistence, "remove");
        let keys = BTreeSet::from([key("docs/a"), key("docs/b")]);
        cache.remove_overlays_for_batch_id(&mut txn, &keys, 1).await.unwrap();
        let remaining = cache.get_overlays(&txn, &keys).await.unwrap();
        assert_eq!(remaining.keys().cloned().collect::<Vec<_>>(), vec![key("docs/b")]);
    }
}
