use std::collections::{BTreeMap, BTreeSet};

use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::index_manager::IndexManager;
use crate::local::mutation_queue::MutationQueue;
use crate::local::overlay_cache::{DocumentOverlayCache, OverlayMap};
use crate::local::persistence::PersistenceTransaction;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{
    calculate_overlay_mutation, DocumentKey, DocumentMap, FieldMask, MutableDocument, Mutation, OverlayedDocument,
    SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// Read side of the local store: remote documents with their overlays applied.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlays: DocumentOverlayCache,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        overlays: DocumentOverlayCache,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlays,
            index_manager,
        }
    }

    /// Local view of `key`. Invalid when neither the cache nor a pending write
    /// knows the document.
    pub async fn get_document(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let mut document = self.remote_documents.get_entry(txn, key).await?;
        if let Some(overlay) = self.overlays.get_overlay(txn, key).await? {
            overlay
                .mutation
                .apply_to_local_view(&mut document, overlay.mutation.field_mask().cloned(), Timestamp::now());
        }
        Ok(document)
    }

    pub async fn get_documents(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let documents = self.remote_documents.get_entries(txn, keys).await?;
        self.get_local_view_of_documents(txn, documents, &BTreeSet::new())
            .await
    }

    /// Applies the stored overlays to `documents`. Keys in
    /// `existence_state_changed` whose overlay depends on the base document get
    /// their overlays recomputed first.
    pub async fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction,
        documents: DocumentMap,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let keys = documents.keys().cloned().collect();
        let overlays = self.overlays.get_overlays(txn, &keys).await?;
        let views = self
            .compute_views(txn, documents, &overlays, existence_state_changed)
            .await?;
        Ok(views
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Like [`get_local_view_of_documents`](Self::get_local_view_of_documents) but
    /// keeps the mask of fields each overlay touched.
    pub async fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction,
        documents: DocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let keys = documents.keys().cloned().collect();
        let overlays = self.overlays.get_overlays(txn, &keys).await?;
        self.compute_views(txn, documents, &overlays, &BTreeSet::new())
            .await
    }

    async fn compute_views(
        &self,
        txn: &mut PersistenceTransaction,
        mut documents: DocumentMap,
        overlays: &OverlayMap,
        existence_state_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut recalculate = DocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let depends_on_base = overlay.map_or(true, |overlay| matches!(overlay.mutation, Mutation::Patch { .. }));
            if existence_state_changed.contains(key) && depends_on_base {
                recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask().cloned();
                overlay
                    .mutation
                    .apply_to_local_view(document, mask.clone(), Timestamp::now());
                mutated_fields.insert(key.clone(), mask);
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        let recalculated = self.recalculate_and_save_overlays(txn, recalculate).await?;
        let mut results = BTreeMap::new();
        for (key, document) in documents {
            let (document, mask) = match recalculated.get(&key) {
                Some(overlayed) => (overlayed.document.clone(), overlayed.mutated_fields.clone()),
                None => (document, mutated_fields.remove(&key).flatten()),
            };
            results.insert(
                key,
                OverlayedDocument {
                    document,
                    mutated_fields: mask,
                },
            );
        }
        Ok(results)
    }

    /// Replays every queued batch touching `documents` and stores the resulting
    /// overlays. Each key's overlay is written under the newest batch affecting it.
    pub async fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction,
        mut documents: DocumentMap,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        if documents.is_empty() {
            return Ok(BTreeMap::new());
        }
        let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, &keys)
            .await?;

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch: BTreeMap<i32, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let previous = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                masks.insert(key.clone(), batch.apply_to_local_view(document, previous));
                documents_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, batch_keys) in documents_by_batch.iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in batch_keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let mask = masks.get(key).cloned().unwrap_or_else(|| Some(FieldMask::empty()));
                match documents
                    .get(key)
                    .and_then(|document| calculate_overlay_mutation(document, mask.as_ref()))
                {
                    Some(mutation) => {
                        overlays.insert(key.clone(), mutation);
                    }
                    None => self.overlays.remove_overlay(txn, key),
                }
            }
            self.overlays.save_overlays(txn, *batch_id, &overlays)?;
        }

        Ok(documents
            .into_iter()
            .map(|(key, document)| {
                let mutated_fields = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
                (
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields,
                    },
                )
            })
            .collect())
    }

    /// Recomputes overlays for `keys` from the remote cache and the queue.
    pub async fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let documents = self.remote_documents.get_entries(txn, keys).await?;
        self.recalculate_and_save_overlays(txn, documents).await?;
        Ok(())
    }

    /// Local view of every document matching `query`, considering only remote
    /// documents read after `since_read_time` plus every document with an overlay.
    pub async fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.get_document(txn, &key).await?;
            let mut result = DocumentMap::new();
            if query.matches(&document) {
                result.insert(key, document);
            }
            return Ok(result);
        }

        if let Some(group) = query.collection_group_id() {
            let mut result = DocumentMap::new();
            for parent in self.index_manager.get_collection_parents(txn, group).await? {
                if !query.path().is_prefix_of(&parent) {
                    continue;
                }
                let collection_query = query.as_collection_query_at_path(parent.child([group]));
                result.extend(
                    self.get_documents_matching_collection_query(txn, &collection_query, since_read_time)
                        .await?,
                );
            }
            return Ok(result);
        }

        self.get_documents_matching_collection_query(txn, query, since_read_time)
            .await
    }

    async fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let overlays = self
            .overlays
            .get_overlays_for_collection(txn, query.path(), BATCH_ID_UNKNOWN)
            .await?;
        let overlay_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut result = self
            .remote_documents
            .get_documents_matching_query(txn, query, since_read_time, &overlay_keys, None)
            .await?;

        let mut bases = self.remote_documents.get_entries(txn, &overlay_keys).await?;
        for (key, overlay) in &overlays {
            let Some(document) = bases.get_mut(key) else {
                continue;
            };
            overlay
                .mutation
                .apply_to_local_view(document, overlay.mutation.field_mask().cloned(), Timestamp::now());
        }
        result.extend(bases.into_iter().filter(|(_, document)| query.matches(document)));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::local_serializer::LocalSerializer;
    use crate::local::persistence::{MemoryPersistence, PersistenceArc};
    use crate::model::{DatabaseId, FieldPath, FieldTransform};
    use crate::remote::JsonProtoSerializer;
    use crate::value::{FirestoreValue, MapValue};
    use std::sync::Arc;

    struct Fixture {
        persistence: PersistenceArc,
        view: LocalDocumentsView,
        remote: RemoteDocumentCache,
        queue: MutationQueue,
    }

    fn fixture() -> Fixture {
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)")));
        let index = IndexManager::new();
        let remote = RemoteDocumentCache::new(serializer.clone(), index.clone());
        let queue = MutationQueue::new(serializer.clone());
        let view = LocalDocumentsView::new(
            remote.clone(),
            queue.clone(),
            DocumentOverlayCache::new(serializer),
            index,
        );
        Fixture {
            persistence: Arc::new(MemoryPersistence::new()),
            view,
            remote,
            queue,
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn count(value: i64) -> MapValue {
        MapValue::new(BTreeMap::from([("count".to_string(), FirestoreValue::from_integer(value))]))
    }

    async fn write(fixture: &Fixture, mutation: Mutation) {
        let mut txn = PersistenceTransaction::new(fixture.persistence.clone(), "write");
        fixture
            .queue
            .add_mutation_batch(&mut txn, Timestamp::now(), Vec::new(), vec![mutation.clone()])
            .await
            .unwrap();
        let keys = BTreeSet::from([mutation.key().clone()]);
        fixture
            .view
            .recalculate_and_save_overlays_for_document_keys(&mut txn, &keys)
            .await
            .unwrap();
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn overlays_fold_every_pending_batch() {
        let fixture = fixture();
        let increment = || {
            Mutation::patch(key("counters/c"), MapValue::empty()).with_transform(
                FieldTransform::increment(FieldPath::from_dot_separated("count").unwrap(), FirestoreValue::from_integer(1))
                    .unwrap(),
            )
        };
        write(&fixture, Mutation::set(key("counters/c"), count(5))).await;
        write(&fixture, increment()).await;
        write(&fixture, increment()).await;

        let txn = PersistenceTransaction::new(fixture.persistence.clone(), "read");
        let document = fixture.view.get_document(&txn, &key("counters/c")).await.unwrap();
        assert!(document.has_local_mutations());
        assert_eq!(
            document.field(&FieldPath::from_dot_separated("count").unwrap()),
            Some(&FirestoreValue::from_integer(7))
        );
    }

    #[tokio::test]
    async fn query_includes_local_only_documents() {
        let fixture = fixture();
        let mut txn = PersistenceTransaction::new(fixture.persistence.clone(), "seed");
        let mut buffer = fixture.remote.new_change_buffer();
        let mut remote = MutableDocument::new_found_document(
            key("docs/remote"),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            count(1),
        );
        remote.set_read_time(SnapshotVersion::new(Timestamp::new(1, 0)));
        buffer.add_entry(remote);
        buffer.apply(&mut txn).await.unwrap();
        txn.commit().await.unwrap();

        write(&fixture, Mutation::set(key("docs/local"), count(2))).await;
        write(&fixture, Mutation::delete(key("docs/remote"))).await;

        let txn = PersistenceTransaction::new(fixture.persistence.clone(), "read");
        let documents = fixture
            .view
            .get_documents_matching_query(&txn, &Query::collection("docs").unwrap(), SnapshotVersion::min())
            .await
            .unwrap();
        assert_eq!(documents.keys().cloned().collect::<Vec<_>>(), vec![key("docs/local")]);
    }
}
