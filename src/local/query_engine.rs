use std::collections::BTreeSet;

use crate::core::{LimitType, Query};
use crate::error::FirestoreResult;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{DocumentKey, DocumentMap, MutableDocument, SnapshotVersion};

/// Answers queries from the local cache, choosing the cheapest strategy that
/// still yields the complete result.
///
/// In order of preference: a single document lookup, a client-side index (none
/// are maintained, so this always declines), replaying the previous result set
/// plus everything changed since the last limbo-free snapshot, and finally a
/// full scan of the collection.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    local_documents: LocalDocumentsView,
}

impl QueryEngine {
    pub fn new(local_documents: LocalDocumentsView) -> Self {
        Self { local_documents }
    }

    /// Matching documents, sorted and limited by the query.
    pub async fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        let documents = if query.is_document_query() {
            self.local_documents
                .get_documents_matching_query(txn, query, SnapshotVersion::min())
                .await?
        } else if let Some(documents) = self.perform_query_using_index(query) {
            documents
        } else if let Some(documents) = self
            .perform_query_using_remote_keys(txn, query, remote_keys, last_limbo_free_snapshot_version)
            .await?
        {
            documents
        } else {
            self.execute_full_collection_scan(txn, query).await?
        };

        Ok(query
            .apply_order_and_limit(documents.into_values().collect())
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect())
    }

    fn perform_query_using_index(&self, _query: &Query) -> Option<DocumentMap> {
        None
    }

    async fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<Option<DocumentMap>> {
        // Scanning everything is as cheap as the replay for unfiltered queries.
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }

        let documents = self.local_documents.get_documents(txn, remote_keys).await?;
        let previous_results = query.apply_order_and_limit(
            documents
                .into_values()
                .filter(|document| query.matches(document))
                .collect(),
        );

        if query.has_limit()
            && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version)
        {
            return Ok(None);
        }

        log::debug!(
            "re-using previous result from {:?} to execute query {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        );

        let mut updated = self
            .local_documents
            .get_documents_matching_query(txn, query, last_limbo_free_snapshot_version)
            .await?;
        for document in previous_results {
            updated.entry(document.key().clone()).or_insert(document);
        }
        Ok(Some(updated))
    }

    async fn execute_full_collection_scan(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<DocumentMap> {
        log::debug!("using full collection scan to execute query {}", query.canonical_id());
        self.local_documents
            .get_documents_matching_query(txn, query, SnapshotVersion::min())
            .await
    }
}

/// Whether a limit query's previous results can no longer be trusted to hold
/// the first (or last) documents: a result dropped out, or the document at the
/// edge of the limit changed after the snapshot the results came from.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[MutableDocument],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => document.has_pending_writes() || document.version() > limbo_free_snapshot_version,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Direction, FilterOperator};
    use crate::local::index_manager::IndexManager;
    use crate::local::local_serializer::LocalSerializer;
    use crate::local::mutation_queue::MutationQueue;
    use crate::local::overlay_cache::DocumentOverlayCache;
    use crate::local::persistence::{MemoryPersistence, PersistenceArc};
    use crate::local::remote_document_cache::RemoteDocumentCache;
    use crate::model::{DatabaseId, Timestamp};
    use crate::remote::JsonProtoSerializer;
    use crate::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, rank: i64, at: i64) -> MutableDocument {
        let data = MapValue::new(BTreeMap::from([("rank".to_string(), FirestoreValue::from_integer(rank))]));
        let mut document = MutableDocument::new_found_document(key(path), version(at), data);
        document.set_read_time(version(at));
        document
    }

    struct Fixture {
        persistence: PersistenceArc,
        remote: RemoteDocumentCache,
        engine: QueryEngine,
    }

    fn fixture() -> Fixture {
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("p", "(default)")));
        let index = IndexManager::new();
        let remote = RemoteDocumentCache::new(serializer.clone(), index.clone());
        let view = LocalDocumentsView::new(
            remote.clone(),
            MutationQueue::new(serializer.clone()),
            DocumentOverlayCache::new(serializer),
            index,
        );
        Fixture {
            persistence: Arc::new(MemoryPersistence::new()),
            remote,
            engine: QueryEngine::new(view),
        }
    }

    async fn seed(fixture: &Fixture, documents: Vec<MutableDocument>) {
        let mut txn = PersistenceTransaction::new(fixture.persistence.clone(), "seed");
        let mut buffer = fixture.remote.new_change_buffer();
        for document in documents {
            buffer.add_entry(document);
        }
        buffer.apply(&mut txn).await.unwrap();
        txn.commit().await.unwrap();
    }

    fn ranked() -> Query {
        Query::collection("items")
            .unwrap()
            .with_filter("rank", FilterOperator::GreaterThanOrEqual, FirestoreValue::from_integer(0))
            .unwrap()
    }

    #[tokio::test]
    async fn replay_merges_previous_results_with_newer_documents() {
        let fixture = fixture();
        seed(&fixture, vec![doc("items/a", 1, 1), doc("items/b", 2, 5)]).await;

        // Only `items/a` was part of the results at version 2; `items/b` changed later.
        let mut txn = PersistenceTransaction::new(fixture.persistence.clone(), "query");
        let result = fixture
            .engine
            .get_documents_matching_query(&mut txn, &ranked(), version(2), &BTreeSet::from([key("items/a")]))
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
    }

    #[tokio::test]
    async fn replay_ignores_unchanged_documents_outside_previous_results() {
        let fixture = fixture();
        // Written before the limbo-free version and not part of the previous
        // results, so the replay path does not see it.
        seed(&fixture, vec![doc("items/a", 1, 1), doc("items/stale", 3, 1)]).await;

        let mut txn = PersistenceTransaction::new(fixture.persistence.clone(), "query");
        let replayed = fixture
            .engine
            .get_documents_matching_query(&mut txn, &ranked(), version(2), &BTreeSet::from([key("items/a")]))
            .await
            .unwrap();
        assert_eq!(replayed.keys().cloned().collect::<Vec<_>>(), vec![key("items/a")]);

        let scanned = fixture
            .engine
            .get_documents_matching_query(&mut txn, &ranked(), SnapshotVersion::min(), &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(scanned.len(), 2);
    }

    #[tokio::test]
    async fn limit_queries_fall_back_when_a_result_was_removed() {
        let fixture = fixture();
        seed(&fixture, vec![doc("items/a", 1, 1), doc("items/b", 2, 1), doc("items/c", 3, 1)]).await;

        let query = ranked().order_by("rank", Direction::Ascending).unwrap().limit_to_first(2);
        let mut txn = PersistenceTransaction::new(fixture.persistence.clone(), "query");
        // `items/gone` was a previous result but no longer exists locally.
        let remote_keys = BTreeSet::from([key("items/a"), key("items/gone")]);
        let result = fixture
            .engine
            .get_documents_matching_query(&mut txn, &query, version(2), &remote_keys)
            .await
            .unwrap();
        assert_eq!(result.keys().cloned().collect::<Vec<_>>(), vec![key("items/a"), key("items/b")]);
    }
}
