use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug, Formatter};

use async_lock::Mutex;

use crate::core::{Query, Target};
use crate::error::{assertion_failure, FirestoreResult};
use crate::local::index_manager::IndexManager;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::local_serializer::LocalSerializer;
use crate::local::mutation_queue::MutationQueue;
use crate::local::overlay_cache::DocumentOverlayCache;
use crate::local::persistence::{PersistenceArc, PersistenceTransaction};
use crate::local::query_engine::QueryEngine;
use crate::local::remote_document_cache::{RemoteDocumentCache, RemoteDocumentChangeBuffer};
use crate::local::target_cache::TargetCache;
use crate::local::{TargetData, TargetPurpose};
use crate::model::{
    DocumentKey, DocumentMap, MutableDocument, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion, Timestamp,
};
use crate::remote::{JsonProtoSerializer, RemoteEvent, TargetChange};

/// Resume tokens older than this are persisted even when nothing else changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

/// Result of [`LocalStore::local_write`].
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

/// Result of [`LocalStore::execute_query`].
#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported as matching the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Keys a view added or removed in its last snapshot.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: i32,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

#[derive(Default)]
struct LocalStoreState {
    target_data_by_target: BTreeMap<i32, TargetData>,
    target_id_by_canonical_id: HashMap<String, i32>,
    last_sequence_number: i64,
}

impl LocalStoreState {
    fn next_sequence_number(&mut self) -> i64 {
        self.last_sequence_number += 1;
        self.last_sequence_number
    }
}

/// Owns the local caches and runs every change to them in one transaction.
///
/// Callers serialize access through the client's async queue; the internal lock
/// only protects the in-memory target bookkeeping.
pub struct LocalStore {
    persistence: PersistenceArc,
    mutation_queue: MutationQueue,
    remote_documents: RemoteDocumentCache,
    overlays: DocumentOverlayCache,
    target_cache: TargetCache,
    index_manager: IndexManager,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
    state: Mutex<LocalStoreState>,
}

impl Debug for LocalStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("persistence", &self.persistence.name())
            .finish()
    }
}

impl LocalStore {
    pub fn new(persistence: PersistenceArc, serializer: JsonProtoSerializer) -> Self {
        let serializer = LocalSerializer::new(serializer);
        let index_manager = IndexManager::new();
        let mutation_queue = MutationQueue::new(serializer.clone());
        let remote_documents = RemoteDocumentCache::new(serializer.clone(), index_manager.clone());
        let overlays = DocumentOverlayCache::new(serializer.clone());
        let target_cache = TargetCache::new(serializer);
        let local_documents = LocalDocumentsView::new(
            remote_documents.clone(),
            mutation_queue.clone(),
            overlays.clone(),
            index_manager.clone(),
        );
        let query_engine = QueryEngine::new(local_documents.clone());
        Self {
            persistence,
            mutation_queue,
            remote_documents,
            overlays,
            target_cache,
            index_manager,
            local_documents,
            query_engine,
            state: Mutex::new(LocalStoreState::default()),
        }
    }

    fn transaction(&self, label: &'static str) -> PersistenceTransaction {
        PersistenceTransaction::new(self.persistence.clone(), label)
    }

    /// Restores the listen sequence counter from storage.
    pub async fn start(&self) -> FirestoreResult<()> {
        let txn = self.transaction("Start LocalStore");
        let highest = self.target_cache.get_highest_sequence_number(&txn).await?;
        let mut state = self.state.lock().await;
        state.last_sequence_number = state.last_sequence_number.max(highest);
        Ok(())
    }

    /// Queues `mutations` as a new batch and returns the resulting local view.
    pub async fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|mutation| mutation.key().clone()).collect();
        let mut txn = self.transaction("Locally write mutations");

        let remote_documents = self.remote_documents.get_entries(&txn, &keys).await?;
        let documents_without_remote_version: BTreeSet<DocumentKey> = remote_documents
            .iter()
            .filter(|(_, document)| !document.is_valid_document())
            .map(|(key, _)| key.clone())
            .collect();
        let mut overlayed = self
            .local_documents
            .get_overlayed_documents(&mut txn, remote_documents)
            .await?;

        // Non-idempotent transforms need the value they started from so later
        // recomputations of the local view reproduce the same result.
        let mut base_mutations = Vec::new();
        for mutation in &mutations {
            let Some(overlayed_document) = overlayed.get(mutation.key()) else {
                continue;
            };
            if let Some(base_value) = mutation.extract_transform_base_value(&overlayed_document.document) {
                base_mutations.push(Mutation::patch(mutation.key().clone(), base_value));
            }
        }

        let batch = self
            .mutation_queue
            .add_mutation_batch(&mut txn, local_write_time, base_mutations, mutations)
            .await?;
        let overlays = batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
        self.overlays.save_overlays(&mut txn, batch.batch_id, &overlays)?;
        for key in &keys {
            self.index_manager
                .add_to_collection_parent_index(&mut txn, &key.collection_path())
                .await?;
        }
        txn.commit().await?;

        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes: overlayed
                .into_iter()
                .map(|(key, overlayed)| (key, overlayed.document))
                .collect(),
        })
    }

    /// Applies the backend's acknowledgement of a batch and returns the new local
    /// view of the affected documents.
    pub async fn acknowledge_batch(&self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let mut txn = self.transaction("Acknowledge batch");
        let batch = &batch_result.batch;
        let affected = batch.keys();

        let mut buffer = self.remote_documents.new_change_buffer();
        self.apply_write_to_remote_document_cache(&mut txn, batch_result, &mut buffer)
            .await?;
        buffer.apply(&mut txn).await?;
        self.mutation_queue
            .acknowledge_batch(&mut txn, batch, &batch_result.stream_token)
            .await?;
        self.overlays
            .remove_overlays_for_batch_id(&mut txn, &affected, batch.batch_id)
            .await?;
        self.local_documents
            .recalculate_and_save_overlays_for_document_keys(&mut txn, &affected)
            .await?;
        let changes = self.local_documents.get_documents(&mut txn, &affected).await?;
        txn.commit().await?;
        Ok(changes)
    }

    async fn apply_write_to_remote_document_cache(
        &self,
        txn: &mut PersistenceTransaction,
        batch_result: &MutationBatchResult,
        buffer: &mut RemoteDocumentChangeBuffer,
    ) -> FirestoreResult<()> {
        let batch = &batch_result.batch;
        for key in batch.keys() {
            let mut document = buffer.get_entry(txn, &key).await?;
            let Some(ack_version) = batch_result.doc_versions.get(&key) else {
                return Err(assertion_failure(format!("No committed version for {key}")));
            };
            // A newer remote version may already have arrived through watch.
            if document.version() < *ack_version {
                batch.apply_to_remote_document(&mut document, batch_result);
                if document.is_valid_document() {
                    document.set_read_time(batch_result.commit_version);
                    buffer.add_entry(document);
                }
            }
        }
        self.mutation_queue.remove_mutation_batch(txn, batch).await
    }

    /// Drops a batch the backend refused and returns the recomputed local view.
    pub async fn reject_batch(&self, batch_id: i32) -> FirestoreResult<DocumentMap> {
        let mut txn = self.transaction("Reject batch");
        let Some(batch) = self.mutation_queue.lookup_mutation_batch(&txn, batch_id).await? else {
            return Err(assertion_failure(format!("Attempt to reject nonexistent batch {batch_id}")));
        };
        let affected = batch.keys();
        self.mutation_queue.remove_mutation_batch(&mut txn, &batch).await?;
        self.overlays
            .remove_overlays_for_batch_id(&mut txn, &affected, batch_id)
            .await?;
        self.local_documents
            .recalculate_and_save_overlays_for_document_keys(&mut txn, &affected)
            .await?;
        let changes = self.local_documents.get_documents(&mut txn, &affected).await?;
        txn.commit().await?;
        Ok(changes)
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<i32> {
        let txn = self.transaction("Get highest unacknowledged batch id");
        self.mutation_queue.get_highest_unacknowledged_batch_id(&txn).await
    }

    /// First queued batch after `after_batch_id`, or the head of the queue.
    pub async fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> FirestoreResult<Option<MutationBatch>> {
        let txn = self.transaction("Get next mutation batch");
        let after = after_batch_id.unwrap_or(crate::model::BATCH_ID_UNKNOWN);
        self.mutation_queue
            .get_next_mutation_batch_after_batch_id(&txn, after)
            .await
    }

    pub async fn has_pending_writes(&self) -> FirestoreResult<bool> {
        let txn = self.transaction("Has pending writes");
        Ok(!self.mutation_queue.is_empty(&txn).await?)
    }

    pub async fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let txn = self.transaction("Get last stream token");
        self.mutation_queue.get_last_stream_token(&txn).await
    }

    pub async fn set_last_stream_token(&self, token: &[u8]) -> FirestoreResult<()> {
        let mut txn = self.transaction("Set last stream token");
        self.mutation_queue.set_last_stream_token(&mut txn, token).await?;
        txn.commit().await
    }

    pub async fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let txn = self.transaction("Get last remote snapshot version");
        self.target_cache.get_last_remote_snapshot_version(&txn).await
    }

    /// Applies a consistent watch snapshot. Returns the local view of every
    /// document whose remote state changed.
    ///
    /// Re-applying an event that was already applied changes nothing.
    pub async fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let mut state = self.state.lock().await;
        let remote_version = event.snapshot_version;
        let mut txn = self.transaction("Apply remote event");
        let sequence_number = state.next_sequence_number();
        let mut updated_targets = BTreeMap::new();

        for (target_id, change) in &event.target_changes {
            let Some(old) = state.target_data_by_target.get(target_id) else {
                continue;
            };
            self.target_cache
                .remove_matching_keys(&mut txn, &change.removed_documents, *target_id);
            self.target_cache
                .add_matching_keys(&mut txn, &change.added_documents, *target_id);

            let mut updated = old.clone().with_sequence_number(sequence_number);
            if event.target_mismatches.contains_key(target_id) {
                updated = updated
                    .with_resume_token(Vec::new(), SnapshotVersion::min())
                    .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
            } else if !change.resume_token.is_empty() {
                updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
            }

            if should_persist_target_data(old, &updated, change) {
                self.target_cache.update_target_data(&mut txn, &updated).await?;
            }
            updated_targets.insert(*target_id, updated);
        }

        let mut buffer = self.remote_documents.new_change_buffer();
        let keys: BTreeSet<DocumentKey> = event.document_updates.keys().cloned().collect();
        let existing = buffer.get_entries(&txn, &keys).await?;
        let mut changed = DocumentMap::new();
        let mut existence_changed = BTreeSet::new();
        for (key, document) in &event.document_updates {
            let Some(cached) = existing.get(key) else {
                continue;
            };
            if document.is_found_document() != cached.is_found_document() {
                existence_changed.insert(key.clone());
            }

            if document.is_no_document() && document.version().is_min() {
                // Deleted without a known version, e.g. after a target reset.
                buffer.remove_entry(key);
                changed.insert(key.clone(), document.clone());
            } else if !cached.is_valid_document()
                || document.version() > cached.version()
                || (document.version() == cached.version() && cached.has_pending_writes())
                || (document.is_no_document()
                    && event.resolved_limbo_documents.contains(key)
                    && !cached.is_no_document())
            {
                let mut document = document.clone();
                document.set_read_time(remote_version);
                buffer.add_entry(document.clone());
                changed.insert(key.clone(), document);
            } else {
                log::debug!(
                    "ignoring outdated watch update for {key}: current version {:?}, watch version {:?}",
                    cached.version(),
                    document.version()
                );
            }
        }

        if !remote_version.is_min() {
            let last = self.target_cache.get_last_remote_snapshot_version(&txn).await?;
            if remote_version < last {
                return Err(assertion_failure(format!(
                    "Watch stream reverted to previous snapshot ({remote_version:?} < {last:?})"
                )));
            }
            self.target_cache
                .set_target_metadata(&mut txn, sequence_number, remote_version)
                .await?;
        }

        buffer.apply(&mut txn).await?;
        let changes = self
            .local_documents
            .get_local_view_of_documents(&mut txn, changed, &existence_changed)
            .await?;
        txn.commit().await?;

        state.target_data_by_target.extend(updated_targets);
        Ok(changes)
    }

    /// Records the versions at which views became limbo free, so a later
    /// listen (or a reopened store) can replay the previous results.
    pub async fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let mut advanced = Vec::new();
        for change in view_changes {
            if change.from_cache {
                continue;
            }
            let Some(target_data) = state.target_data_by_target.get(&change.target_id) else {
                continue;
            };
            if target_data.last_limbo_free_snapshot_version != target_data.snapshot_version {
                let version = target_data.snapshot_version;
                advanced.push(target_data.clone().with_last_limbo_free_snapshot_version(version));
            }
        }
        if advanced.is_empty() {
            return Ok(());
        }

        let mut txn = self.transaction("Notify local view changes");
        for target_data in &advanced {
            self.target_cache.update_target_data(&mut txn, target_data).await?;
        }
        txn.commit().await?;
        for target_data in advanced {
            state.target_data_by_target.insert(target_data.target_id, target_data);
        }
        Ok(())
    }

    /// Assigns a target id to `target`, reusing persisted data (and its resume
    /// token) when the target was listened to before.
    pub async fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut state = self.state.lock().await;
        let canonical_id = target.canonical_id();
        if let Some(target_data) = state
            .target_id_by_canonical_id
            .get(&canonical_id)
            .and_then(|target_id| state.target_data_by_target.get(target_id))
        {
            return Ok(target_data.clone());
        }

        let mut txn = self.transaction("Allocate target");
        let sequence_number = state.next_sequence_number();
        let target_data = match self.target_cache.get_target_data(&txn, &target).await? {
            Some(existing) => {
                let updated = existing.with_sequence_number(sequence_number);
                self.target_cache.update_target_data(&mut txn, &updated).await?;
                updated
            }
            None => {
                let target_id = self.target_cache.allocate_target_id(&mut txn).await?;
                let created = TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
                self.target_cache.add_target_data(&mut txn, &created).await?;
                created
            }
        };
        txn.commit().await?;

        state
            .target_id_by_canonical_id
            .insert(canonical_id, target_data.target_id);
        state
            .target_data_by_target
            .insert(target_data.target_id, target_data.clone());
        Ok(target_data)
    }

    /// Stops tracking `target_id` in memory. The persisted target keeps its
    /// latest resume token so a later listen can resume from it.
    pub async fn release_target(&self, target_id: i32) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(target_data) = state.target_data_by_target.get(&target_id).cloned() else {
            return Err(assertion_failure(format!("Tried to release nonexistent target {target_id}")));
        };
        let mut txn = self.transaction("Release target");
        self.target_cache.update_target_data(&mut txn, &target_data).await?;
        txn.commit().await?;

        state.target_data_by_target.remove(&target_id);
        state
            .target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    pub async fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        {
            let state = self.state.lock().await;
            if let Some(target_data) = state
                .target_id_by_canonical_id
                .get(&target.canonical_id())
                .and_then(|target_id| state.target_data_by_target.get(target_id))
            {
                return Ok(Some(target_data.clone()));
            }
        }
        let txn = self.transaction("Get target data");
        self.target_cache.get_target_data(&txn, target).await
    }

    pub async fn get_remote_document_keys(&self, target_id: i32) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let txn = self.transaction("Remote document keys");
        self.target_cache
            .get_matching_keys_for_target_id(&txn, target_id)
            .await
    }

    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let txn = self.transaction("Read document");
        self.local_documents.get_document(&txn, key).await
    }

    /// Runs `query` against the cache. With `use_previous_results` the query
    /// engine may start from the target's last limbo-free result set.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target()).await?;
        let mut txn = self.transaction("Execute query");
        let (last_limbo_free, remote_keys) = match &target_data {
            Some(target_data) => (
                target_data.last_limbo_free_snapshot_version,
                self.target_cache
                    .get_matching_keys_for_target_id(&txn, target_data.target_id)
                    .await?,
            ),
            None => (SnapshotVersion::min(), BTreeSet::new()),
        };

        let documents = if use_previous_results {
            self.query_engine
                .get_documents_matching_query(&mut txn, query, last_limbo_free, &remote_keys)
                .await?
        } else {
            self.query_engine
                .get_documents_matching_query(&mut txn, query, SnapshotVersion::min(), &BTreeSet::new())
                .await?
        };
        txn.commit().await?;
        Ok(QueryResult {
            documents,
            remote_keys,
        })
    }

    /// Same as [`execute_query`](Self::execute_query) with previous results.
    pub async fn get_documents_matching_query(&self, query: &Query) -> FirestoreResult<QueryResult> {
        self.execute_query(query, true).await
    }
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() || new.resume_token.is_empty() {
        return old.resume_token != new.resume_token || change.document_change_count() > 0;
    }
    let age = micros(new.snapshot_version) - micros(old.snapshot_version);
    age >= RESUME_TOKEN_MAX_AGE_MICROS || change.document_change_count() > 0
}

fn micros(version: SnapshotVersion) -> i64 {
    let timestamp = version.timestamp();
    timestamp.seconds * 1_000_000 + i64::from(timestamp.nanos) / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FilterOperator;
    use crate::local::persistence::MemoryPersistence;
    use crate::model::{DatabaseId, FieldPath, FieldTransform, MutationResult};
    use crate::value::{FirestoreValue, MapValue};
    use std::sync::Arc;

    fn store() -> LocalStore {
        LocalStore::new(
            Arc::new(MemoryPersistence::new()),
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
        )
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn count(value: i64) -> MapValue {
        MapValue::new(BTreeMap::from([("count".to_string(), FirestoreValue::from_integer(value))]))
    }

    fn count_of(document: &MutableDocument) -> Option<FirestoreValue> {
        document.field(&FieldPath::from_dot_separated("count").unwrap()).cloned()
    }

    fn increment(path: &str) -> Mutation {
        Mutation::patch(key(path), MapValue::empty()).with_transform(
            FieldTransform::increment(FieldPath::from_dot_separated("count").unwrap(), FirestoreValue::from_integer(1))
                .unwrap(),
        )
    }

    async fn ack(store: &LocalStore, at: i64) -> DocumentMap {
        let batch = store.next_mutation_batch(None).await.unwrap().unwrap();
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(version(at), Vec::new()))
            .collect();
        let result = MutationBatchResult::from(batch, version(at), results, b"token".to_vec()).unwrap();
        store.acknowledge_batch(&result).await.unwrap()
    }

    #[tokio::test]
    async fn offline_write_is_visible_and_settles_on_ack() {
        let store = store();
        let written = store
            .local_write(vec![Mutation::set(key("docs/a"), count(1))])
            .await
            .unwrap();
        assert_eq!(written.batch_id, 1);
        let local = &written.changes[&key("docs/a")];
        assert!(local.is_found_document() && local.has_local_mutations());

        let settled = ack(&store, 10).await;
        let document = &settled[&key("docs/a")];
        assert!(!document.has_local_mutations());
        assert!(document.has_committed_mutations());
        assert_eq!(document.version(), version(10));
        assert!(!store.has_pending_writes().await.unwrap());
        assert_eq!(store.get_last_stream_token().await.unwrap(), b"token".to_vec());
    }

    #[tokio::test]
    async fn increments_stack_on_the_last_write() {
        let store = store();
        store
            .local_write(vec![Mutation::set(key("counters/c"), count(5))])
            .await
            .unwrap();
        store.local_write(vec![increment("counters/c")]).await.unwrap();
        let written = store.local_write(vec![increment("counters/c")]).await.unwrap();
        assert_eq!(
            count_of(&written.changes[&key("counters/c")]),
            Some(FirestoreValue::from_integer(7))
        );

        // Acknowledging the set keeps both increments applied on top.
        ack(&store, 1).await;
        let document = store.read_document(&key("counters/c")).await.unwrap();
        assert_eq!(count_of(&document), Some(FirestoreValue::from_integer(7)));
        assert!(document.has_local_mutations());
    }

    #[tokio::test]
    async fn rejected_batch_disappears_from_the_local_view() {
        let store = store();
        let written = store
            .local_write(vec![Mutation::set(key("docs/a"), count(1))])
            .await
            .unwrap();
        let changes = store.reject_batch(written.batch_id).await.unwrap();
        assert!(!changes[&key("docs/a")].is_found_document());
        assert!(store.reject_batch(written.batch_id).await.is_err());
    }

    #[tokio::test]
    async fn remote_events_are_idempotent() {
        let store = store();
        let query = Query::collection("docs").unwrap();
        let target = store.allocate_target(query.to_target()).await.unwrap();

        let mut event = RemoteEvent {
            snapshot_version: version(3),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            target.target_id,
            TargetChange {
                resume_token: b"r1".to_vec(),
                current: true,
                added_documents: BTreeSet::from([key("docs/a")]),
                ..TargetChange::default()
            },
        );
        event.document_updates.insert(
            key("docs/a"),
            MutableDocument::new_found_document(key("docs/a"), version(2), count(1)),
        );

        let first = store.apply_remote_event(&event).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.apply_remote_event(&event).await.unwrap();
        assert!(second.is_empty());

        let result = store.execute_query(&query, true).await.unwrap();
        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.remote_keys, BTreeSet::from([key("docs/a")]));
        assert_eq!(store.get_last_remote_snapshot_version().await.unwrap(), version(3));
    }

    #[tokio::test]
    async fn released_targets_resume_from_the_persisted_token() {
        let store = store();
        let target = Query::collection("docs").unwrap().to_target();
        let allocated = store.allocate_target(target.clone()).await.unwrap();

        let mut event = RemoteEvent {
            snapshot_version: version(4),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            allocated.target_id,
            TargetChange::create_synthesized_target_change_for_current_change(true, b"resume".to_vec()),
        );
        store.apply_remote_event(&event).await.unwrap();
        store.release_target(allocated.target_id).await.unwrap();

        let again = store.allocate_target(target).await.unwrap();
        assert_eq!(again.target_id, allocated.target_id);
        assert_eq!(again.resume_token, b"resume".to_vec());
        assert_eq!(again.snapshot_version, version(4));
    }

    #[tokio::test]
    async fn stale_watch_updates_are_ignored() {
        let store = store();
        let target = store
            .allocate_target(Query::collection("docs").unwrap().to_target())
            .await
            .unwrap();
        let event_at = |at: i64, doc_version: i64, value: i64| {
            let mut event = RemoteEvent {
                snapshot_version: version(at),
                ..RemoteEvent::default()
            };
            event.target_changes.insert(target.target_id, TargetChange::default());
            event.document_updates.insert(
                key("docs/a"),
                MutableDocument::new_found_document(key("docs/a"), version(doc_version), count(value)),
            );
            event
        };

        store.apply_remote_event(&event_at(5, 5, 2)).await.unwrap();
        let ignored = store.apply_remote_event(&event_at(6, 4, 1)).await.unwrap();
        assert!(ignored.is_empty());
        let document = store.read_document(&key("docs/a")).await.unwrap();
        assert_eq!(count_of(&document), Some(FirestoreValue::from_integer(2)));
    }

    #[tokio::test]
    async fn limbo_free_version_survives_a_reopen_and_enables_result_replay() {
        let persistence: PersistenceArc = Arc::new(MemoryPersistence::new());
        let serializer = JsonProtoSerializer::new(DatabaseId::new("p", "(default)"));
        let first = LocalStore::new(Arc::clone(&persistence), serializer.clone());
        first.start().await.unwrap();

        // docs/b reaches the cache through an unrelated target before the query syncs.
        let everything = first
            .allocate_target(Query::collection("docs").unwrap().to_target())
            .await
            .unwrap();
        let mut event = RemoteEvent {
            snapshot_version: version(2),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            everything.target_id,
            TargetChange {
                added_documents: BTreeSet::from([key("docs/b")]),
                ..TargetChange::default()
            },
        );
        event.document_updates.insert(
            key("docs/b"),
            MutableDocument::new_found_document(key("docs/b"), version(2), count(1)),
        );
        first.apply_remote_event(&event).await.unwrap();

        let query = Query::collection("docs")
            .unwrap()
            .with_filter("count", FilterOperator::GreaterThanOrEqual, FirestoreValue::from_integer(1))
            .unwrap();
        let filtered = first.allocate_target(query.to_target()).await.unwrap();
        let mut event = RemoteEvent {
            snapshot_version: version(3),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            filtered.target_id,
            TargetChange {
                resume_token: b"r3".to_vec(),
                current: true,
                added_documents: BTreeSet::from([key("docs/a")]),
                ..TargetChange::default()
            },
        );
        event.document_updates.insert(
            key("docs/a"),
            MutableDocument::new_found_document(key("docs/a"), version(3), count(1)),
        );
        first.apply_remote_event(&event).await.unwrap();
        first
            .notify_local_view_changes(&[LocalViewChanges {
                target_id: filtered.target_id,
                from_cache: false,
                added_keys: BTreeSet::from([key("docs/a")]),
                removed_keys: BTreeSet::new(),
            }])
            .await
            .unwrap();

        let reopened = LocalStore::new(persistence, serializer);
        reopened.start().await.unwrap();
        let restored = reopened.allocate_target(query.to_target()).await.unwrap();
        assert_eq!(restored.last_limbo_free_snapshot_version, version(3));

        // The replay reads the synced keys plus later changes; a full scan would
        // also pick up docs/b.
        let replayed = reopened.execute_query(&query, true).await.unwrap();
        assert_eq!(replayed.documents.keys().cloned().collect::<Vec<_>>(), vec![key("docs/a")]);
        let scanned = reopened.execute_query(&query, false).await.unwrap();
        assert_eq!(scanned.documents.len(), 2);
    }
}
