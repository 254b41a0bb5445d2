use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{assertion_failure, FirestoreResult};
use crate::local::{TargetData, TargetPurpose};
use crate::model::{DatabaseId, DocumentKey, DocumentMap, MutableDocument, SnapshotVersion};
use crate::remote::bloom_filter::BloomFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// Provides metadata about active targets so the aggregator can reason about
/// existing documents.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the local store last synced for the target.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// Target data for a target the remote store is currently listening to.
    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData>;

    fn database_id(&self) -> &DatabaseId;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    FalsePositive,
}

struct TargetState {
    /// Outstanding watch/unwatch requests; the target ignores updates while
    /// this is non-zero.
    pending_responses: usize,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified => change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses = self.pending_responses.saturating_sub(1);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes between consistent snapshots and turns them into
/// a [`RemoteEvent`].
pub struct WatchChangeAggregator<P>
where
    P: TargetMetadataProvider,
{
    metadata: Arc<P>,
    target_states: BTreeMap<i32, TargetState>,
    pending_document_updates: DocumentMap,
    pending_document_updates_by_target: BTreeMap<i32, BTreeSet<DocumentKey>>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<i32>>,
    pending_target_resets: BTreeMap<i32, TargetPurpose>,
}

impl<P> WatchChangeAggregator<P>
where
    P: TargetMetadataProvider,
{
    pub fn new(metadata: Arc<P>) -> Self {
        Self {
            metadata,
            target_states: BTreeMap::new(),
            pending_document_updates: DocumentMap::new(),
            pending_document_updates_by_target: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange) {
        let found = change
            .new_document
            .as_ref()
            .filter(|document| document.is_found_document())
            .cloned();

        for target_id in &change.updated_target_ids {
            match &found {
                Some(document) => self.add_document_to_target(*target_id, document.clone()),
                None => self.remove_document_from_target(*target_id, &change.key, change.new_document.clone()),
            }
        }

        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.new_document.clone());
        }
    }

    /// Target ids in the change, or every active target for a change that
    /// names none.
    fn targets_for_change(&self, change: &WatchTargetChange) -> Vec<i32> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id))
            .collect()
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        for target_id in self.targets_for_change(change) {
            self.ensure_target_state(target_id);
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.state_mut(target_id).update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    let state = self.state_mut(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A fresh ADD replaces whatever the previous listen accumulated.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.state_mut(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    if change.cause.is_some() {
                        log::debug!("watch target {target_id} removed with an error");
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        let state = self.state_mut(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        self.reset_target(target_id);
                        self.state_mut(target_id).update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    pub fn handle_existence_filter(&mut self, filter: ExistenceFilterChange) -> FirestoreResult<()> {
        let target_id = filter.target_id;
        let Ok(expected_count) = usize::try_from(filter.count) else {
            log::warn!("ignoring existence filter for target {target_id} with count {}", filter.count);
            return Ok(());
        };
        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return Ok(());
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted without the backend sending a delete.
                let key = DocumentKey::from_path(target_data.target.path().clone())?;
                let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(target_id, &key, Some(deleted));
            } else if expected_count != 1 {
                return Err(assertion_failure(format!(
                    "Single document existence filter with count: {expected_count}"
                )));
            }
            return Ok(());
        }

        let current_count = self.current_document_count_for_target(target_id);
        if current_count == expected_count {
            return Ok(());
        }

        let application = match self.parse_bloom_filter(&filter) {
            Some(bloom_filter) => self.apply_bloom_filter(&bloom_filter, target_id, expected_count, current_count),
            None => None,
        };

        if application != Some(BloomFilterApplication::Success) {
            log::debug!(
                "existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}"
            );
            self.reset_target(target_id);
            let purpose = match application {
                Some(BloomFilterApplication::FalsePositive) => TargetPurpose::ExistenceFilterMismatchBloom,
                _ => TargetPurpose::ExistenceFilterMismatch,
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
        Ok(())
    }

    fn parse_bloom_filter(&self, filter: &ExistenceFilterChange) -> Option<BloomFilter> {
        let bits = filter.unchanged_names.as_ref()?;
        match BloomFilter::new(bits.bitmap.clone(), bits.padding, bits.hash_count) {
            Ok(bloom_filter) if bloom_filter.bit_count() > 0 => Some(bloom_filter),
            Ok(_) => None,
            Err(err) => {
                log::warn!("ignoring malformed bloom filter: {err}");
                None
            }
        }
    }

    fn apply_bloom_filter(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: i32,
        expected_count: usize,
        current_count: usize,
    ) -> Option<BloomFilterApplication> {
        let removed = self.filter_removed_documents(bloom_filter, target_id);
        if expected_count.checked_add(removed) == Some(current_count) {
            Some(BloomFilterApplication::Success)
        } else {
            Some(BloomFilterApplication::FalsePositive)
        }
    }

    /// Removes every synced key the bloom filter does not contain and returns how
    /// many were removed.
    fn filter_removed_documents(&mut self, bloom_filter: &BloomFilter, target_id: i32) -> usize {
        let database_id = self.metadata.database_id().clone();
        let mut removed = 0;
        for key in self.metadata.get_remote_keys_for_target(target_id) {
            let name = format!(
                "projects/{}/databases/{}/documents/{}",
                database_id.project_id(),
                database_id.database(),
                key.path().canonical_string()
            );
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    fn current_document_count_for_target(&self, target_id: i32) -> usize {
        let change = self
            .target_states
            .get(&target_id)
            .map(TargetState::to_target_change)
            .unwrap_or_default();
        let remote = self.metadata.get_remote_keys_for_target(target_id).len();
        (remote + change.added_documents.len()).saturating_sub(change.removed_documents.len())
    }

    /// Converts everything accumulated so far into an event at
    /// `snapshot_version` and resets the pending state.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<i32> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };

            let current = self.target_states.get(&target_id).is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    // A current document target that never saw its document means
                    // the document does not exist.
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key)
                    {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }

        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(&mut self, target_id: i32, document: MutableDocument) {
        if !self.is_active_target(target_id) {
            return;
        }

        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.state_mut(target_id).add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(target_id)
            .or_default()
            .insert(key.clone());
        self.pending_document_target_mapping.entry(key).or_default().insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: i32,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }

        let contained = self.target_contains_document(target_id, key);
        let state = self.state_mut(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The target never reported the document; drop any pending add.
            state.remove_document_change(key);
        }

        self.pending_document_updates_by_target
            .entry(target_id)
            .or_default()
            .insert(key.clone());
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);

        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    pub fn remove_target(&mut self, target_id: i32) {
        self.target_states.remove(&target_id);
    }

    /// Called by the remote store for every watch or unwatch request it sends.
    pub fn record_pending_target_request(&mut self, target_id: i32) {
        self.ensure_target_state(target_id);
        self.state_mut(target_id).record_pending_target_request();
    }

    fn ensure_target_state(&mut self, target_id: i32) {
        self.target_states.entry(target_id).or_insert_with(TargetState::new);
    }

    fn state_mut(&mut self, target_id: i32) -> &mut TargetState {
        self.target_states.entry(target_id).or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: i32) -> bool {
        let active = self.target_data_for_active_target(target_id).is_some();
        if !active {
            log::debug!("detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(&self, target_id: i32) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata.get_target_data_for_target(target_id),
        }
    }

    /// Drops everything the target accumulated and removes its synced keys, so
    /// the next snapshot rebuilds the result set from scratch.
    fn reset_target(&mut self, target_id: i32) {
        self.target_states.insert(target_id, TargetState::new());
        for key in self.metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None);
        }
    }

    fn target_contains_document(&self, target_id: i32, key: &DocumentKey) -> bool {
        self.metadata.get_remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::model::Timestamp;
    use crate::remote::watch_change::BloomFilterBits;
    use crate::value::{FirestoreValue, MapValue};
    use std::sync::Mutex;

    struct TestMetadata {
        database_id: DatabaseId,
        targets: Mutex<BTreeMap<i32, TargetData>>,
        remote_keys: Mutex<BTreeMap<i32, BTreeSet<DocumentKey>>>,
    }

    impl TestMetadata {
        fn new() -> Self {
            Self {
                database_id: DatabaseId::new("p", "(default)"),
                targets: Mutex::new(BTreeMap::new()),
                remote_keys: Mutex::new(BTreeMap::new()),
            }
        }

        fn with_target(self, target_id: i32, query: Query, purpose: TargetPurpose) -> Self {
            let data = TargetData::new(query.to_target(), target_id, purpose, 1);
            self.targets.lock().unwrap().insert(target_id, data);
            self
        }

        fn with_remote_keys(self, target_id: i32, keys: &[&str]) -> Self {
            let keys = keys.iter().map(|path| key(path)).collect();
            self.remote_keys.lock().unwrap().insert(target_id, keys);
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
            self.remote_keys.lock().unwrap().get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
            self.targets.lock().unwrap().get(&target_id).cloned()
        }

        fn database_id(&self) -> &DatabaseId {
            &self.database_id
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64) -> MutableDocument {
        let mut fields = BTreeMap::new();
        fields.insert("v".to_string(), FirestoreValue::from_integer(seconds));
        MutableDocument::new_found_document(key(path), version(seconds), MapValue::new(fields))
    }

    fn target_change(state: TargetChangeState, target_ids: Vec<i32>, token: &[u8]) -> WatchTargetChange {
        WatchTargetChange {
            state,
            target_ids,
            resume_token: token.to_vec(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }

    fn document_change(updated: Vec<i32>, removed: Vec<i32>, document: MutableDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated,
            removed_target_ids: removed,
            key: document.key().clone(),
            new_document: Some(document),
        }
    }

    fn collection(path: &str) -> Query {
        Query::collection(path).unwrap()
    }

    #[test]
    fn aggregates_document_changes() {
        let metadata = Arc::new(
            TestMetadata::new()
                .with_target(2, collection("docs"), TargetPurpose::Listen)
                .with_remote_keys(2, &["docs/b"]),
        );
        let mut aggregator = WatchChangeAggregator::new(metadata);

        aggregator.record_pending_target_request(2);
        aggregator.handle_target_change(&target_change(TargetChangeState::Added, vec![2], &[]));
        aggregator.handle_document_change(document_change(vec![2], vec![], doc("docs/a", 1)));
        aggregator.handle_document_change(document_change(vec![2], vec![], doc("docs/b", 1)));
        aggregator.handle_target_change(&target_change(TargetChangeState::Current, vec![2], &[7]));

        let event = aggregator.create_remote_event(version(3));
        let change = event.target_changes.get(&2).unwrap();
        assert!(change.current);
        assert_eq!(change.resume_token, vec![7]);
        assert!(change.added_documents.contains(&key("docs/a")));
        assert!(change.modified_documents.contains(&key("docs/b")));
        assert_eq!(event.document_updates.len(), 2);
        assert!(event
            .document_updates
            .values()
            .all(|document| document.read_time() == version(3)));
        assert!(event.resolved_limbo_documents.is_empty());

        let next = aggregator.create_remote_event(version(4));
        assert!(next.target_changes.is_empty());
        assert!(next.document_updates.is_empty());
    }

    #[test]
    fn ignores_changes_while_target_is_pending() {
        let metadata = Arc::new(TestMetadata::new().with_target(2, collection("docs"), TargetPurpose::Listen));
        let mut aggregator = WatchChangeAggregator::new(metadata);

        // Listen, unlisten and listen again: two responses are still outstanding
        // after the first ADD.
        aggregator.record_pending_target_request(2);
        aggregator.record_pending_target_request(2);
        aggregator.record_pending_target_request(2);
        aggregator.handle_target_change(&target_change(TargetChangeState::Added, vec![2], &[]));
        aggregator.handle_document_change(document_change(vec![2], vec![], doc("docs/stale", 1)));
        aggregator.handle_target_change(&target_change(TargetChangeState::Removed, vec![2], &[]));
        aggregator.handle_target_change(&target_change(TargetChangeState::Added, vec![2], &[]));
        aggregator.handle_document_change(document_change(vec![2], vec![], doc("docs/fresh", 1)));

        let event = aggregator.create_remote_event(version(2));
        let change = event.target_changes.get(&2).unwrap();
        assert_eq!(change.added_documents, BTreeSet::from([key("docs/fresh")]));
        assert!(!event.document_updates.contains_key(&key("docs/stale")));
    }

    #[test]
    fn global_target_change_updates_every_active_target() {
        let metadata = Arc::new(
            TestMetadata::new()
                .with_target(2, collection("a"), TargetPurpose::Listen)
                .with_target(4, collection("b"), TargetPurpose::Listen),
        );
        let mut aggregator = WatchChangeAggregator::new(metadata);
        for target_id in [2, 4] {
            aggregator.record_pending_target_request(target_id);
            aggregator.handle_target_change(&target_change(TargetChangeState::Added, vec![target_id], &[]));
        }
        aggregator.handle_target_change(&target_change(TargetChangeState::NoChange, vec![], &[9, 9]));

        let event = aggregator.create_remote_event(version(5));
        assert_eq!(event.target_changes[&2].resume_token, vec![9, 9]);
        assert_eq!(event.target_changes[&4].resume_token, vec![9, 9]);
    }

    #[test]
    fn existence_filter_resolved_by_bloom_filter() {
        let metadata = Arc::new(
            TestMetadata::new()
                .with_target(2, collection("docs"), TargetPurpose::Listen)
                .with_remote_keys(2, &["docs/a", "docs/b", "docs/c"]),
        );
        let mut aggregator = WatchChangeAggregator::new(metadata);
        aggregator.handle_target_change(&target_change(TargetChangeState::Current, vec![2], &[1]));

        let mut bloom_filter = BloomFilter::with_bit_count(256, 5).unwrap();
        for path in ["docs/a", "docs/b"] {
            bloom_filter.insert(&format!("projects/p/databases/(default)/documents/{path}"));
        }
        assert!(!bloom_filter.might_contain("projects/p/databases/(default)/documents/docs/c"));

        aggregator
            .handle_existence_filter(ExistenceFilterChange {
                target_id: 2,
                count: 2,
                unchanged_names: Some(BloomFilterBits {
                    bitmap: bloom_filter.bitmap().to_vec(),
                    padding: bloom_filter.padding(),
                    hash_count: bloom_filter.hash_count(),
                }),
            })
            .unwrap();

        let event = aggregator.create_remote_event(version(2));
        assert!(event.target_mismatches.is_empty());
        assert_eq!(
            event.target_changes[&2].removed_documents,
            BTreeSet::from([key("docs/c")])
        );
    }

    #[test]
    fn existence_filter_without_bloom_filter_resets_target() {
        let metadata = Arc::new(
            TestMetadata::new()
                .with_target(2, collection("docs"), TargetPurpose::Listen)
                .with_remote_keys(2, &["docs/a", "docs/b"]),
        );
        let mut aggregator = WatchChangeAggregator::new(metadata);

        aggregator
            .handle_existence_filter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            })
            .unwrap();

        let event = aggregator.create_remote_event(version(2));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        let change = &event.target_changes[&2];
        assert!(!change.current);
        assert_eq!(change.removed_documents.len(), 2);
    }

    #[test]
    fn matching_existence_filter_is_a_no_op() {
        let metadata = Arc::new(
            TestMetadata::new()
                .with_target(2, collection("docs"), TargetPurpose::Listen)
                .with_remote_keys(2, &["docs/a"]),
        );
        let mut aggregator = WatchChangeAggregator::new(metadata);
        aggregator
            .handle_existence_filter(ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            })
            .unwrap();
        let event = aggregator.create_remote_event(version(2));
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn negative_existence_filter_count_is_ignored() {
        let metadata = Arc::new(
            TestMetadata::new()
                .with_target(2, collection("docs"), TargetPurpose::Listen)
                .with_remote_keys(2, &["docs/a"]),
        );
        let mut aggregator = WatchChangeAggregator::new(metadata);
        aggregator
            .handle_existence_filter(ExistenceFilterChange {
                target_id: 2,
                count: -1,
                unchanged_names: Some(BloomFilterBits {
                    bitmap: vec![0xff],
                    padding: 0,
                    hash_count: 1,
                }),
            })
            .unwrap();
        let event = aggregator.create_remote_event(version(2));
        assert!(event.target_mismatches.is_empty());
        assert!(event.target_changes.get(&2).map_or(true, |change| change.removed_documents.is_empty()));
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_delete() {
        let missing = key("docs/missing");
        let metadata = Arc::new(TestMetadata::new().with_target(
            1,
            Query::document(&missing),
            TargetPurpose::LimboResolution,
        ));
        let mut aggregator = WatchChangeAggregator::new(metadata);
        aggregator.record_pending_target_request(1);
        aggregator.handle_target_change(&target_change(TargetChangeState::Added, vec![1], &[]));
        aggregator.handle_target_change(&target_change(TargetChangeState::Current, vec![1], &[3]));

        let event = aggregator.create_remote_event(version(6));
        let document = &event.document_updates[&missing];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(6));
        assert!(event.resolved_limbo_documents.contains(&missing));
    }

    #[test]
    fn document_target_with_zero_count_is_deleted() {
        let existing = key("docs/a");
        let metadata = Arc::new(
            TestMetadata::new()
                .with_target(2, Query::document(&existing), TargetPurpose::Listen)
                .with_remote_keys(2, &["docs/a"]),
        );
        let mut aggregator = WatchChangeAggregator::new(metadata);
        aggregator
            .handle_existence_filter(ExistenceFilterChange {
                target_id: 2,
                count: 0,
                unchanged_names: None,
            })
            .unwrap();

        let event = aggregator.create_remote_event(version(2));
        assert!(event.document_updates[&existing].is_no_document());
        assert!(event.target_changes[&2].removed_documents.contains(&existing));
        assert!(event.resolved_limbo_documents.is_empty());
    }
}
