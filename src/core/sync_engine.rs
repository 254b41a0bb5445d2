use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_channel::Sender;

use crate::core::settings::DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS;
use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::core::Query;
use crate::error::{assertion_failure, failed_precondition, FirestoreError, FirestoreResult};
use crate::local::{LocalStore, LocalViewChanges, TargetData, TargetPurpose};
use crate::model::{
    DocumentKey, DocumentMap, MutableDocument, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};
use crate::remote::{
    box_remote_store_future, OnlineState, RemoteEvent, RemoteStore, RemoteStoreFuture, RemoteSyncer, TargetChange,
};

/// Resolves once a write batch was acknowledged or rejected.
pub type WriteCallback = Sender<FirestoreResult<()>>;

/// Sequence number of targets the local store does not track.
const INVALID_SEQUENCE_NUMBER: i64 = -1;

/// Receives what the sync engine computed for the registered queries.
///
/// Calls are made on the async queue and never while the engine holds its
/// internal lock.
pub trait SyncEngineListener: Send + Sync + 'static {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The backend rejected the query's target; the query is no longer listened.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

struct QueryView {
    query: Query,
    target_id: i32,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Set once the limbo target delivered the document, so the aggregator can
    /// tell a delete from a document that was never there.
    received_document: bool,
}

/// Remote work decided while the state lock was held.
#[derive(Default)]
struct LimboActions {
    listen: Vec<TargetData>,
    unlisten: Vec<i32>,
}

struct SyncEngineState {
    query_views: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<i32, Vec<String>>,
    /// Limbo keys waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, i32>,
    active_limbo_resolutions_by_target: BTreeMap<i32, LimboResolution>,
    /// Which listen targets currently see each limbo key.
    limbo_document_refs: BTreeMap<DocumentKey, BTreeSet<i32>>,
    write_callbacks: BTreeMap<i32, WriteCallback>,
    pending_writes_callbacks: BTreeMap<i32, Vec<WriteCallback>>,
    next_limbo_target_id: i32,
    online_state: OnlineState,
}

impl SyncEngineState {
    fn new() -> Self {
        Self {
            query_views: HashMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: BTreeMap::new(),
            write_callbacks: BTreeMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            next_limbo_target_id: 1,
            online_state: OnlineState::Unknown,
        }
    }

    /// Limbo targets take odd ids so they never collide with the even ids the
    /// local store hands out.
    fn allocate_limbo_target_id(&mut self) -> i32 {
        let target_id = self.next_limbo_target_id;
        self.next_limbo_target_id += 2;
        target_id
    }

    fn update_tracked_limbos(&mut self, target_id: i32, changes: Vec<LimboDocumentChange>, actions: &mut LimboActions) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs
                        .entry(key.clone())
                        .or_default()
                        .insert(target_id);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document {key} no longer in limbo for target {target_id}");
                    let unreferenced = match self.limbo_document_refs.get_mut(&key) {
                        Some(targets) => {
                            targets.remove(&target_id);
                            targets.is_empty()
                        }
                        None => true,
                    };
                    if unreferenced {
                        self.limbo_document_refs.remove(&key);
                        self.remove_limbo_target(&key, actions);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if !self.active_limbo_targets_by_key.contains_key(&key) && !self.enqueued_limbo_resolutions.contains(&key) {
            log::debug!("new document in limbo: {key}");
            self.enqueued_limbo_resolutions.push_back(key);
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, actions: &mut LimboActions) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(target_id) = self.active_limbo_targets_by_key.remove(key) {
            self.active_limbo_resolutions_by_target.remove(&target_id);
            actions.unlisten.push(target_id);
        }
    }

    /// Drops every limbo reference held by `target_id`.
    fn release_limbo_refs(&mut self, target_id: i32, actions: &mut LimboActions) {
        let keys: Vec<DocumentKey> = self
            .limbo_document_refs
            .iter()
            .filter(|(_, targets)| targets.contains(&target_id))
            .map(|(key, _)| key.clone())
            .collect();
        self.update_tracked_limbos(
            target_id,
            keys.into_iter().map(LimboDocumentChange::Removed).collect(),
            actions,
        );
    }

    fn pump_enqueued_limbo_resolutions(&mut self, max_concurrent: usize, actions: &mut LimboActions) {
        while self.active_limbo_targets_by_key.len() < max_concurrent {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.allocate_limbo_target_id();
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            actions.listen.push(TargetData::new(
                Query::document(&key).to_target(),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            ));
        }
    }

    /// Removes every query of `target_id`, returning them.
    fn remove_target_queries(&mut self, target_id: i32, actions: &mut LimboActions) -> Vec<Query> {
        let canonical_ids = self.queries_by_target.remove(&target_id).unwrap_or_default();
        let queries = canonical_ids
            .iter()
            .filter_map(|canonical_id| self.query_views.remove(canonical_id))
            .map(|query_view| query_view.query)
            .collect();
        self.release_limbo_refs(target_id, actions);
        queries
    }
}

/// Ties local views to the local store and the remote store: computes view
/// snapshots, tracks limbo documents and hands write results back to callers.
///
/// Every method must run on the client's async queue.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    /// Set once after construction; cleared on shutdown to break the reference
    /// cycle with the remote store.
    remote_store: StdMutex<Option<RemoteStore>>,
    listener: StdMutex<Option<Arc<dyn SyncEngineListener>>>,
    max_concurrent_limbo_resolutions: usize,
    state: StdMutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(local_store: Arc<LocalStore>, max_concurrent_limbo_resolutions: usize) -> Self {
        Self {
            local_store,
            remote_store: StdMutex::new(None),
            listener: StdMutex::new(None),
            max_concurrent_limbo_resolutions: max_concurrent_limbo_resolutions.max(1),
            state: StdMutex::new(SyncEngineState::new()),
        }
    }

    pub fn with_defaults(local_store: Arc<LocalStore>) -> Self {
        Self::new(local_store, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS)
    }

    pub fn set_remote_store(&self, remote_store: RemoteStore) {
        *lock(&self.remote_store) = Some(remote_store);
    }

    pub fn set_listener(&self, listener: Arc<dyn SyncEngineListener>) {
        *lock(&self.listener) = Some(listener);
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.local_store
    }

    fn remote_store(&self) -> FirestoreResult<RemoteStore> {
        lock(&self.remote_store)
            .clone()
            .ok_or_else(|| failed_precondition("The client has already been terminated."))
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        lock(&self.listener).clone()
    }

    fn state(&self) -> MutexGuard<'_, SyncEngineState> {
        lock(&self.state)
    }

    /// Starts listening to `query` and returns its first snapshot, computed
    /// from the cache. The first query of a target also starts the remote watch.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if self.state().query_views.contains_key(&canonical_id) {
            return Err(assertion_failure(format!("query {canonical_id} is already listened")));
        }

        let target_data = self.local_store.allocate_target(query.to_target()).await?;
        let target_id = target_data.target_id;
        let (listen_remotely, current) = {
            let state = self.state();
            match state.queries_by_target.get(&target_id) {
                Some(existing) => {
                    let current = existing
                        .first()
                        .and_then(|canonical_id| state.query_views.get(canonical_id))
                        .is_some_and(|query_view| query_view.view.is_current());
                    (false, current)
                }
                None => (true, false),
            }
        };

        let snapshot = self
            .initialize_view_and_compute_snapshot(query, target_id, current)
            .await?;
        if listen_remotely {
            self.remote_store()?.listen(target_data).await?;
        }
        Ok(snapshot)
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        query: Query,
        target_id: i32,
        current: bool,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(&query, true).await?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None);

        let mut actions = LimboActions::default();
        let snapshot = {
            let mut state = self.state();
            let synthesized = TargetChange::create_synthesized_target_change_for_current_change(
                current && state.online_state != OnlineState::Offline,
                Vec::new(),
            );
            let view_change = view.apply_changes(changes, true, Some(&synthesized), false);
            state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);
            state.pump_enqueued_limbo_resolutions(self.max_concurrent_limbo_resolutions, &mut actions);

            let canonical_id = query.canonical_id();
            state
                .queries_by_target
                .entry(target_id)
                .or_default()
                .push(canonical_id.clone());
            state.query_views.insert(
                canonical_id,
                QueryView {
                    query: query.clone(),
                    target_id,
                    view,
                },
            );
            view_change.snapshot
        };
        self.apply_limbo_actions(actions).await?;

        snapshot.ok_or_else(|| assertion_failure("first view change must produce a snapshot"))
    }

    /// Stops listening to `query`. The last query of a target releases the
    /// target locally and stops its remote watch.
    pub async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let mut actions = LimboActions::default();
        let target_id = {
            let mut state = self.state();
            let Some(query_view) = state.query_views.remove(&canonical_id) else {
                return Err(assertion_failure(format!("Trying to unlisten on query not found: {canonical_id}")));
            };
            let target_id = query_view.target_id;
            let remaining = match state.queries_by_target.get_mut(&target_id) {
                Some(queries) => {
                    queries.retain(|existing| existing != &canonical_id);
                    queries.len()
                }
                None => 0,
            };
            if remaining > 0 {
                return Ok(());
            }
            state.remove_target_queries(target_id, &mut actions);
            state.pump_enqueued_limbo_resolutions(self.max_concurrent_limbo_resolutions, &mut actions);
            target_id
        };

        self.local_store.release_target(target_id).await?;
        self.remote_store()?.unlisten(target_id).await?;
        self.apply_limbo_actions(actions).await
    }

    /// Applies `mutations` locally, raises the optimistic snapshots and hands
    /// the batch to the write pipeline. `callback` resolves once the backend
    /// acknowledged or rejected the batch.
    pub async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<i32> {
        let result = match self.local_store.local_write(mutations).await {
            Ok(result) => result,
            Err(err) => {
                log::warn!("dropping user write: {err}");
                return Err(err);
            }
        };
        self.state().write_callbacks.insert(result.batch_id, callback);
        self.emit_new_snaps_and_notify_local_store(result.changes, None).await?;
        self.remote_store()?.fill_write_pipeline().await?;
        Ok(result.batch_id)
    }

    /// Resolves `callback` once every batch queued so far is acknowledged or
    /// rejected.
    pub async fn register_pending_writes_callback(&self, callback: WriteCallback) -> FirestoreResult<()> {
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id().await?;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = callback.try_send(Ok(()));
            return Ok(());
        }
        self.state()
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
        Ok(())
    }

    /// Fails every outstanding callback and detaches from the remote store.
    pub fn shutdown(&self) {
        let (write_callbacks, pending_callbacks) = {
            let mut state = self.state();
            (
                std::mem::take(&mut state.write_callbacks),
                std::mem::take(&mut state.pending_writes_callbacks),
            )
        };
        let error = failed_precondition("The client has already been terminated.");
        for callback in write_callbacks.into_values().chain(pending_callbacks.into_values().flatten()) {
            let _ = callback.try_send(Err(error.clone()));
        }
        lock(&self.remote_store).take();
        lock(&self.listener).take();
    }

    /// Recomputes every view with `changes` and `remote_event`, raises the
    /// resulting snapshots and starts or stops limbo resolutions.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let canonical_ids: Vec<String> = self.state().query_views.keys().cloned().collect();
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut actions = LimboActions::default();

        for canonical_id in canonical_ids {
            let computed = {
                let state = self.state();
                let Some(query_view) = state.query_views.get(&canonical_id) else {
                    continue;
                };
                let computed = query_view.view.compute_doc_changes(&changes, None);
                if computed.needs_refill {
                    Err((query_view.query.clone(), computed))
                } else {
                    Ok(computed)
                }
            };
            let computed = match computed {
                Ok(computed) => computed,
                Err((query, previous)) => {
                    // The limit edge moved; rerun the query without previous
                    // results and fold the full result in.
                    let result = self.local_store.execute_query(&query, false).await?;
                    let state = self.state();
                    let Some(query_view) = state.query_views.get(&canonical_id) else {
                        continue;
                    };
                    query_view.view.compute_doc_changes(&result.documents, Some(&previous))
                }
            };

            let mut state = self.state();
            let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                continue;
            };
            let target_id = query_view.target_id;
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let target_is_pending_reset =
                remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let view_change = query_view
                .view
                .apply_changes(computed, true, target_change, target_is_pending_reset);
            state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(local_view_changes(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }
        self.state()
            .pump_enqueued_limbo_resolutions(self.max_concurrent_limbo_resolutions, &mut actions);

        if !snapshots.is_empty() {
            if let Some(listener) = self.listener() {
                listener.on_watch_change(snapshots);
            }
        }
        self.local_store.notify_local_view_changes(&view_changes).await?;
        self.apply_limbo_actions(actions).await
    }

    async fn apply_limbo_actions(&self, actions: LimboActions) -> FirestoreResult<()> {
        if actions.listen.is_empty() && actions.unlisten.is_empty() {
            return Ok(());
        }
        let remote_store = self.remote_store()?;
        for target_id in actions.unlisten {
            remote_store.unlisten(target_id).await?;
        }
        for target_data in actions.listen {
            log::debug!(
                "resolving limbo document with target {}",
                target_data.target_id
            );
            remote_store.listen(target_data).await?;
        }
        Ok(())
    }

    fn process_user_callback(&self, batch_id: i32, result: FirestoreResult<()>) {
        let callback = self.state().write_callbacks.remove(&batch_id);
        if let Some(callback) = callback {
            let _ = callback.try_send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: i32) {
        let callbacks = self.state().pending_writes_callbacks.remove(&batch_id);
        for callback in callbacks.into_iter().flatten() {
            let _ = callback.try_send(Ok(()));
        }
    }

    async fn handle_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        {
            let mut state = self.state();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                if change.document_change_count() > 1 {
                    return Err(assertion_failure(
                        "Limbo resolution for a single document contained multiple changes",
                    ));
                }
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(assertion_failure("Received change for limbo target document without add"));
                    }
                } else if !change.removed_documents.is_empty() {
                    resolution.received_document = false;
                }
            }
        }

        let changes = self.local_store.apply_remote_event(&event).await?;
        self.emit_new_snaps_and_notify_local_store(changes, Some(&event)).await
    }

    async fn handle_rejected_listen(&self, target_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = {
            let mut state = self.state();
            let key = state
                .active_limbo_resolutions_by_target
                .remove(&target_id)
                .map(|resolution| resolution.key);
            if let Some(key) = &key {
                state.active_limbo_targets_by_key.remove(key);
            }
            key
        };

        if let Some(key) = limbo_key {
            log::debug!("limbo resolution for {key} was rejected: {error}");
            // Treat the document as deleted; the view drops it and leaves limbo.
            let mut actions = LimboActions::default();
            self.state()
                .pump_enqueued_limbo_resolutions(self.max_concurrent_limbo_resolutions, &mut actions);
            self.apply_limbo_actions(actions).await?;

            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event
                .document_updates
                .insert(key.clone(), MutableDocument::new_no_document(key.clone(), SnapshotVersion::min()));
            event.resolved_limbo_documents.insert(key);
            return self.handle_remote_event(event).await;
        }

        self.local_store.release_target(target_id).await?;
        let mut actions = LimboActions::default();
        let queries = {
            let mut state = self.state();
            let queries = state.remove_target_queries(target_id, &mut actions);
            state.pump_enqueued_limbo_resolutions(self.max_concurrent_limbo_resolutions, &mut actions);
            queries
        };
        if let Some(listener) = self.listener() {
            for query in &queries {
                listener.on_watch_error(query, error.clone());
            }
        }
        self.apply_limbo_actions(actions).await
    }

    async fn handle_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result).await?;
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None).await
    }

    async fn handle_failed_write(&self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id).await?;
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None).await
    }

    fn handle_online_state_change(&self, online_state: OnlineState) {
        let snapshots: Vec<ViewSnapshot> = {
            let mut state = self.state();
            state.online_state = online_state;
            state
                .query_views
                .values_mut()
                .filter_map(|query_view| {
                    let change = query_view.view.apply_online_state_change(online_state);
                    debug_assert!(change.limbo_changes.is_empty());
                    change.snapshot
                })
                .collect()
        };
        if let Some(listener) = self.listener() {
            if !snapshots.is_empty() {
                listener.on_watch_change(snapshots);
            }
            listener.on_online_state_change(online_state);
        }
    }

    /// Whether a synced view vouches for the current state of `key`.
    pub fn is_document_synced(&self, key: &DocumentKey) -> bool {
        self.state().query_views.values().any(|query_view| {
            query_view.view.is_synced()
                && (query_view.view.document_set().contains(key)
                    || (query_view.query.is_document_query() && query_view.query.matches_path(key)))
        })
    }

    /// Keys the backend last reported for `target_id`.
    fn remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        let state = self.state();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            return if resolution.received_document {
                BTreeSet::from([resolution.key.clone()])
            } else {
                BTreeSet::new()
            };
        }
        let Some(canonical_ids) = state.queries_by_target.get(&target_id) else {
            return BTreeSet::new();
        };
        canonical_ids
            .iter()
            .filter_map(|canonical_id| state.query_views.get(canonical_id))
            .flat_map(|query_view| query_view.view.synced_documents().iter().cloned())
            .collect()
    }

    #[cfg(test)]
    fn active_limbo_keys(&self) -> BTreeMap<DocumentKey, i32> {
        self.state().active_limbo_targets_by_key.clone()
    }

    #[cfg(test)]
    fn enqueued_limbo_keys(&self) -> Vec<DocumentKey> {
        self.state().enqueued_limbo_resolutions.iter().cloned().collect()
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_remote_event(event))
    }

    fn reject_listen(&self, target_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_rejected_listen(target_id, error))
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_successful_write(result))
    }

    fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_failed_write(batch_id, error))
    }

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()> {
        box_remote_store_future(async move { self.handle_online_state_change(online_state) })
    }

    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.remote_keys_for_target(target_id)
    }

    fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>> {
        box_remote_store_future(self.local_store.next_mutation_batch(after_batch_id))
    }

    fn get_last_remote_snapshot_version(&self) -> RemoteStoreFuture<'_, FirestoreResult<SnapshotVersion>> {
        box_remote_store_future(self.local_store.get_last_remote_snapshot_version())
    }

    fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move { self.local_store.set_last_stream_token(&token).await })
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn local_view_changes(target_id: i32, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = BTreeSet::new();
    let mut removed_keys = BTreeSet::new();
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{permission_denied, FirestoreErrorCode};
    use crate::local::MemoryPersistence;
    use crate::model::{DatabaseId, Timestamp};
    use crate::remote::{
        InMemoryTransport, JsonProtoSerializer, MultiplexedConnection, NetworkLayer, NoopTokenProvider,
        RemoteStoreOptions, StreamingDatastore, StreamingDatastoreImpl, TokenProviderArc,
    };
    use crate::util::AsyncQueue;
    use crate::value::{FirestoreValue, MapValue};

    #[derive(Default)]
    struct RecordingListener {
        snapshots: StdMutex<Vec<ViewSnapshot>>,
        errors: StdMutex<Vec<(String, FirestoreErrorCode)>>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push((query.canonical_id(), error.code));
        }

        fn on_online_state_change(&self, _online_state: OnlineState) {}
    }

    impl RecordingListener {
        fn last_snapshot(&self) -> ViewSnapshot {
            self.snapshots.lock().unwrap().last().cloned().unwrap()
        }
    }

    /// An engine whose remote store runs with the network disabled, so remote
    /// events are injected directly.
    async fn offline_engine(max_concurrent_limbo_resolutions: usize) -> (Arc<SyncEngine>, Arc<RecordingListener>) {
        let serializer = JsonProtoSerializer::new(DatabaseId::new("test", "(default)"));
        let local_store = Arc::new(LocalStore::new(Arc::new(MemoryPersistence::new()), serializer.clone()));
        local_store.start().await.unwrap();
        let engine = Arc::new(SyncEngine::new(local_store, max_concurrent_limbo_resolutions));
        let listener = Arc::new(RecordingListener::default());
        engine.set_listener(Arc::clone(&listener) as Arc<dyn SyncEngineListener>);

        let (client_transport, _server_transport) = InMemoryTransport::pair();
        let connection = Arc::new(MultiplexedConnection::new(client_transport));
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(connection));
        let network = NetworkLayer::builder(datastore, Arc::new(NoopTokenProvider) as TokenProviderArc).build();
        let remote_store = RemoteStore::new(
            network,
            serializer,
            Arc::clone(&engine) as Arc<dyn RemoteSyncer>,
            AsyncQueue::new(),
            RemoteStoreOptions::default(),
        );
        remote_store.disable_network().await.unwrap();
        engine.set_remote_store(remote_store);
        (engine, listener)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn room(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::new_found_document(key(path), version(seconds), MapValue::empty())
    }

    /// Makes `rooms/a` and `rooms/b` visible to the `rooms` query, then drops
    /// them from the target so both end up in limbo.
    async fn put_two_rooms_in_limbo(engine: &SyncEngine) -> Query {
        let query = Query::collection("rooms").unwrap();
        engine.listen(query.clone()).await.unwrap();

        let mut event = RemoteEvent {
            snapshot_version: version(1),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            2,
            TargetChange {
                resume_token: b"token-1".to_vec(),
                current: true,
                added_documents: BTreeSet::from([key("rooms/a"), key("rooms/b")]),
                ..TargetChange::default()
            },
        );
        event.document_updates.insert(key("rooms/a"), room("rooms/a", 1));
        event.document_updates.insert(key("rooms/b"), room("rooms/b", 1));
        engine.apply_remote_event(event).await.unwrap();

        let mut event = RemoteEvent {
            snapshot_version: version(2),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            2,
            TargetChange {
                current: true,
                removed_documents: BTreeSet::from([key("rooms/a"), key("rooms/b")]),
                ..TargetChange::default()
            },
        );
        engine.apply_remote_event(event).await.unwrap();
        query
    }

    #[tokio::test]
    async fn limbo_resolutions_are_capped_and_use_odd_target_ids() {
        let (engine, listener) = offline_engine(1).await;
        put_two_rooms_in_limbo(&engine).await;

        assert_eq!(engine.active_limbo_keys(), BTreeMap::from([(key("rooms/a"), 1)]));
        assert_eq!(engine.enqueued_limbo_keys(), vec![key("rooms/b")]);
        assert_eq!(listener.last_snapshot().docs.len(), 2);

        // The limbo target reports the document as gone.
        let mut event = RemoteEvent {
            snapshot_version: version(3),
            ..RemoteEvent::default()
        };
        event.target_changes.insert(
            1,
            TargetChange {
                current: true,
                ..TargetChange::default()
            },
        );
        event
            .document_updates
            .insert(key("rooms/a"), MutableDocument::new_no_document(key("rooms/a"), version(3)));
        event.resolved_limbo_documents.insert(key("rooms/a"));
        engine.apply_remote_event(event).await.unwrap();

        assert_eq!(engine.active_limbo_keys(), BTreeMap::from([(key("rooms/b"), 3)]));
        assert!(engine.enqueued_limbo_keys().is_empty());
        let snapshot = listener.last_snapshot();
        assert_eq!(snapshot.docs.len(), 1);
        assert!(snapshot.docs.contains(&key("rooms/b")));
    }

    #[tokio::test]
    async fn rejected_limbo_listen_removes_the_document() {
        let (engine, listener) = offline_engine(10).await;
        put_two_rooms_in_limbo(&engine).await;
        assert_eq!(
            engine.active_limbo_keys(),
            BTreeMap::from([(key("rooms/a"), 1), (key("rooms/b"), 3)])
        );

        engine
            .reject_listen(1, permission_denied("limbo read denied"))
            .await
            .unwrap();

        assert_eq!(engine.active_limbo_keys(), BTreeMap::from([(key("rooms/b"), 3)]));
        let snapshot = listener.last_snapshot();
        assert!(!snapshot.docs.contains(&key("rooms/a")));
        assert!(snapshot.docs.contains(&key("rooms/b")));
        assert!(listener.errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_query_listen_reports_the_error_and_releases_limbo_keys() {
        let (engine, listener) = offline_engine(10).await;
        let query = put_two_rooms_in_limbo(&engine).await;

        engine.reject_listen(2, permission_denied("denied")).await.unwrap();

        assert_eq!(
            *listener.errors.lock().unwrap(),
            vec![(query.canonical_id(), FirestoreErrorCode::PermissionDenied)]
        );
        assert!(engine.active_limbo_keys().is_empty());
        // The query is gone, so listening again is allowed.
        engine.listen(query).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_listen_is_rejected() {
        let (engine, _listener) = offline_engine(10).await;
        let query = Query::collection("rooms").unwrap();
        engine.listen(query.clone()).await.unwrap();
        assert!(engine.listen(query.clone()).await.is_err());
        engine.unlisten(&query).await.unwrap();
        assert!(engine.unlisten(&query).await.is_err());
    }

    #[tokio::test]
    async fn local_write_raises_optimistic_snapshot_and_shutdown_fails_callbacks() {
        let (engine, listener) = offline_engine(10).await;
        let query = Query::collection("rooms").unwrap();
        engine.listen(query).await.unwrap();

        let (callback, result) = async_channel::bounded(1);
        let data = MapValue::new(BTreeMap::from([("n".to_string(), FirestoreValue::from_integer(1))]));
        let batch_id = engine
            .write(vec![Mutation::set(key("rooms/a"), data)], callback)
            .await
            .unwrap();
        assert_eq!(batch_id, 1);

        let snapshot = listener.last_snapshot();
        assert!(snapshot.has_pending_writes);
        assert!(snapshot.has_pending_writes_for(&key("rooms/a")));

        let (pending, pending_result) = async_channel::bounded(1);
        engine.register_pending_writes_callback(pending).await.unwrap();
        assert!(pending_result.try_recv().is_err());

        engine.shutdown();
        let error = result.recv().await.unwrap().unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::FailedPrecondition);
        assert!(pending_result.recv().await.unwrap().is_err());
    }
}
