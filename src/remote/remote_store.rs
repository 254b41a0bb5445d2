use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;

use crate::error::{internal_error, FirestoreError, FirestoreResult};
use crate::local::TargetData;
use crate::model::{DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::platform::runtime;
use crate::remote::network::NetworkLayer;
use crate::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::streams::{
    ListenStream, ListenStreamDelegate, WriteResponse, WriteStream, WriteStreamDelegate,
};
use crate::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::util::AsyncQueue;

pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reasons the remote store keeps its streams closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteStoreOptions {
    /// Batches sent to the backend but not yet acknowledged.
    pub max_pending_writes: usize,
    /// How long the watch stream may stay `Unknown` before the client reports
    /// itself offline.
    pub online_state_timeout: Duration,
}

impl Default for RemoteStoreOptions {
    fn default() -> Self {
        Self {
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
        }
    }
}

type ListenTargets = Arc<StdMutex<BTreeMap<i32, TargetData>>>;

fn lock_targets(targets: &ListenTargets) -> MutexGuard<'_, BTreeMap<i32, TargetData>> {
    targets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Answers the aggregator's questions from the remote store's listen targets
/// and the syncer's remote keys.
struct RemoteTargetMetadata {
    listen_targets: ListenTargets,
    syncer: Arc<dyn RemoteSyncer>,
    database_id: DatabaseId,
}

impl TargetMetadataProvider for RemoteTargetMetadata {
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: i32) -> Option<TargetData> {
        lock_targets(&self.listen_targets).get(&target_id).cloned()
    }

    fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }
}

struct RemoteStoreState {
    watch_stream: Option<Arc<ListenStream<RemoteListenDelegate>>>,
    watch_stream_open: bool,
    watch_generation: Option<u64>,
    watch_aggregator: Option<WatchChangeAggregator<RemoteTargetMetadata>>,
    write_stream: Option<Arc<WriteStream<RemoteWriteDelegate>>>,
    write_generation: Option<u64>,
    write_handshake_complete: bool,
    /// Batches handed to the write stream, oldest first. The head is the next
    /// batch the backend acknowledges.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    online_state: OnlineStateTracker,
    next_generation: u64,
}

impl RemoteStoreState {
    fn new() -> Self {
        Self {
            watch_stream: None,
            watch_stream_open: false,
            watch_generation: None,
            watch_aggregator: None,
            write_stream: None,
            write_generation: None,
            write_handshake_complete: false,
            write_pipeline: VecDeque::new(),
            offline_causes: BTreeSet::new(),
            online_state: OnlineStateTracker::new(),
            next_generation: 1,
        }
    }

    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn allocate_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn take_streams(
        &mut self,
    ) -> (
        Option<Arc<ListenStream<RemoteListenDelegate>>>,
        Option<Arc<WriteStream<RemoteWriteDelegate>>>,
    ) {
        let watch = self.take_watch_stream();
        let write = self.write_stream.take();
        self.write_generation = None;
        self.write_handshake_complete = false;
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "dropping {} batches from the write pipeline; they stay queued locally",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        (watch, write)
    }

    fn take_watch_stream(&mut self) -> Option<Arc<ListenStream<RemoteListenDelegate>>> {
        self.watch_generation = None;
        self.watch_stream_open = false;
        self.watch_aggregator = None;
        self.watch_stream.take()
    }
}

/// Owns the watch and write streams and keeps them in step with the targets
/// and batches the sync engine hands it.
///
/// Every method must be called from an operation running on the client's
/// [`AsyncQueue`]. Stream callbacks are enqueued onto the same queue and are
/// dropped when they belong to a stream generation that has since been
/// replaced.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        network_layer: NetworkLayer,
        serializer: JsonProtoSerializer,
        remote_syncer: Arc<dyn RemoteSyncer>,
        queue: AsyncQueue,
        options: RemoteStoreOptions,
    ) -> Self {
        let listen_targets: ListenTargets = Arc::new(StdMutex::new(BTreeMap::new()));
        let metadata = Arc::new(RemoteTargetMetadata {
            listen_targets: Arc::clone(&listen_targets),
            syncer: Arc::clone(&remote_syncer),
            database_id: serializer.database_id().clone(),
        });
        let inner = Arc::new(RemoteStoreInner {
            state: Mutex::new(RemoteStoreState::new()),
            listen_targets,
            metadata,
            network_layer,
            serializer,
            remote_syncer,
            queue,
            options,
        });
        Self { inner }
    }

    /// Starts the streams unless the network was disabled.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.inner.enable_network().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner.enable_network().await
    }

    /// Closes both streams and reports the client offline until
    /// [`enable_network`](Self::enable_network).
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner.disable_network().await
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.inner.shutdown().await
    }

    /// Starts watching a target. Listening to a target that is already
    /// watched does nothing.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.inner.listen(target_data).await
    }

    pub async fn unlisten(&self, target_id: i32) -> FirestoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Moves queued batches into the write pipeline, up to the pipeline limit.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts both streams so they authenticate again.
    pub async fn handle_credential_change(&self) -> FirestoreResult<()> {
        self.inner.handle_credential_change().await
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.state.lock().await.online_state.state()
    }
}

struct RemoteStoreInner {
    state: Mutex<RemoteStoreState>,
    /// Shared with the aggregator's metadata provider, which reads it
    /// synchronously.
    listen_targets: ListenTargets,
    metadata: Arc<RemoteTargetMetadata>,
    network_layer: NetworkLayer,
    serializer: JsonProtoSerializer,
    remote_syncer: Arc<dyn RemoteSyncer>,
    queue: AsyncQueue,
    options: RemoteStoreOptions,
}

impl RemoteStoreInner {
    fn new_aggregator(&self) -> WatchChangeAggregator<RemoteTargetMetadata> {
        WatchChangeAggregator::new(Arc::clone(&self.metadata))
    }

    fn has_listen_targets(&self) -> bool {
        !lock_targets(&self.listen_targets).is_empty()
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && state.watch_stream.is_none() && self.has_listen_targets()
    }

    fn should_start_write_stream(state: &RemoteStoreState) -> bool {
        state.can_use_network() && state.write_stream.is_none() && !state.write_pipeline.is_empty()
    }

    async fn broadcast(&self, change: Option<OnlineState>) {
        if let Some(online_state) = change {
            log::debug!("online state changed to {online_state:?}");
            self.remote_syncer.apply_online_state_change(online_state).await;
        }
    }

    async fn set_online_state(&self, online_state: OnlineState) {
        let changed = self.state.lock().await.online_state.set(online_state);
        self.broadcast(changed).await;
    }

    async fn enable_network(self: &Arc<Self>) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.offline_causes.remove(&OfflineCause::UserDisabled);
        }
        self.enable_network_internal().await
    }

    async fn enable_network_internal(self: &Arc<Self>) -> FirestoreResult<()> {
        let start_watch = {
            let state = self.state.lock().await;
            if !state.can_use_network() {
                return Ok(());
            }
            self.should_start_watch_stream(&state)
        };

        if start_watch {
            self.start_watch_stream().await;
        } else {
            self.set_online_state(OnlineState::Unknown).await;
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network(self: &Arc<Self>) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::UserDisabled);
        }
        self.disable_network_internal().await;
        // Views fall back to cache right away instead of waiting for a timeout.
        self.set_online_state(OnlineState::Offline).await;
        Ok(())
    }

    async fn disable_network_internal(&self) {
        let (watch, write) = {
            let mut state = self.state.lock().await;
            state.take_streams()
        };
        if let Some(stream) = write {
            stream.stop();
        }
        if let Some(stream) = watch {
            stream.stop();
        }
    }

    async fn shutdown(self: &Arc<Self>) -> FirestoreResult<()> {
        log::debug!("remote store shutting down");
        {
            let mut state = self.state.lock().await;
            state.offline_causes.insert(OfflineCause::Shutdown);
        }
        self.disable_network_internal().await;
        // Unknown rather than Offline so cached data is not raised as a last
        // snapshot.
        self.set_online_state(OnlineState::Unknown).await;
        Ok(())
    }

    async fn handle_credential_change(self: &Arc<Self>) -> FirestoreResult<()> {
        let was_enabled = {
            let mut state = self.state.lock().await;
            let was_enabled = state.can_use_network();
            if was_enabled {
                state.offline_causes.insert(OfflineCause::CredentialChange);
            }
            was_enabled
        };
        if !was_enabled {
            return Ok(());
        }

        log::debug!("restarting streams for new credentials");
        self.disable_network_internal().await;
        self.set_online_state(OnlineState::Unknown).await;
        {
            let mut state = self.state.lock().await;
            state.offline_causes.remove(&OfflineCause::CredentialChange);
        }
        self.enable_network_internal().await
    }

    async fn listen(self: &Arc<Self>, target_data: TargetData) -> FirestoreResult<()> {
        {
            let mut targets = lock_targets(&self.listen_targets);
            if targets.contains_key(&target_data.target_id) {
                return Ok(());
            }
            targets.insert(target_data.target_id, target_data.clone());
        }

        let (start, open) = {
            let state = self.state.lock().await;
            (self.should_start_watch_stream(&state), state.watch_stream_open)
        };
        if start {
            self.start_watch_stream().await;
        } else if open {
            self.send_watch_request(target_data).await;
        }
        Ok(())
    }

    async fn unlisten(self: &Arc<Self>, target_id: i32) -> FirestoreResult<()> {
        let remaining = {
            let mut targets = lock_targets(&self.listen_targets);
            targets.remove(&target_id);
            targets.len()
        };

        let open = self.state.lock().await.watch_stream_open;
        if open {
            self.send_unwatch_request(target_id).await;
        }

        if remaining == 0 {
            let (stream, can_use_network) = {
                let mut state = self.state.lock().await;
                (state.take_watch_stream(), state.can_use_network())
            };
            if let Some(stream) = stream {
                log::debug!("no more listen targets, closing watch stream");
                stream.stop();
            }
            if can_use_network {
                self.set_online_state(OnlineState::Unknown).await;
            }
        }
        Ok(())
    }

    async fn start_watch_stream(self: &Arc<Self>) {
        let (changed, timer) = {
            let mut state = self.state.lock().await;
            let generation = state.allocate_generation();
            let delegate = Arc::new(RemoteListenDelegate {
                inner: Arc::downgrade(self),
                queue: self.queue.clone(),
                generation,
            });
            let stream = ListenStream::new(&self.network_layer, self.serializer.clone(), delegate);
            state.watch_stream = Some(Arc::new(stream));
            state.watch_generation = Some(generation);
            state.watch_stream_open = false;
            state.watch_aggregator = Some(self.new_aggregator());
            state.online_state.handle_watch_stream_start()
        };
        self.broadcast(changed).await;
        if let Some(timer_id) = timer {
            self.arm_online_state_timer(timer_id);
        }
    }

    fn arm_online_state_timer(self: &Arc<Self>, timer_id: u64) {
        let inner = Arc::downgrade(self);
        let queue = self.queue.clone();
        let timeout = self.options.online_state_timeout;
        runtime::spawn_detached(async move {
            runtime::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                queue.enqueue_and_forget(async move {
                    let changed = inner.state.lock().await.online_state.handle_timeout(timer_id);
                    inner.broadcast(changed).await;
                });
            }
        });
    }

    async fn send_watch_request(&self, target_data: TargetData) {
        let target_id = target_data.target_id;
        let stream = {
            let mut state = self.state.lock().await;
            let Some(stream) = state.watch_stream.clone() else {
                return;
            };
            if let Some(aggregator) = state.watch_aggregator.as_mut() {
                aggregator.record_pending_target_request(target_id);
            }
            stream
        };

        let mut request = target_data;
        if !request.resume_token.is_empty() || !request.snapshot_version.is_min() {
            let expected_count = self.remote_syncer.get_remote_keys_for_target(target_id).len();
            request = request.with_expected_count(expected_count as i32);
        }
        if let Err(err) = stream.watch(&request).await {
            log::debug!("failed to send watch request for target {target_id}: {err}");
        }
    }

    async fn send_unwatch_request(&self, target_id: i32) {
        let stream = {
            let mut state = self.state.lock().await;
            let Some(stream) = state.watch_stream.clone() else {
                return;
            };
            if let Some(aggregator) = state.watch_aggregator.as_mut() {
                aggregator.record_pending_target_request(target_id);
            }
            stream
        };
        if let Err(err) = stream.unwatch(target_id).await {
            log::debug!("failed to send unwatch request for target {target_id}: {err}");
        }
    }

    async fn on_watch_stream_open(&self, generation: u64) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if state.watch_generation != Some(generation) {
                return Ok(());
            }
            state.watch_stream_open = true;
        }
        let targets: Vec<TargetData> = lock_targets(&self.listen_targets).values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(target_data).await;
        }
        Ok(())
    }

    async fn on_watch_change(
        &self,
        generation: u64,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let changed = {
            let mut state = self.state.lock().await;
            if state.watch_generation != Some(generation) {
                return Ok(());
            }
            state.online_state.set(OnlineState::Online)
        };
        self.broadcast(changed).await;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Removed && target_change.cause.is_some() {
                return self.handle_target_error(target_change).await;
            }
        }

        {
            let mut state = self.state.lock().await;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            match change {
                WatchChange::DocumentChange(document_change) => aggregator.handle_document_change(document_change),
                WatchChange::TargetChange(target_change) => aggregator.handle_target_change(&target_change),
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(filter)?,
            }
        }

        if !snapshot_version.is_min() {
            let last_remote_snapshot_version = self.remote_syncer.get_last_remote_snapshot_version().await?;
            if snapshot_version >= last_remote_snapshot_version {
                self.raise_watch_snapshot(snapshot_version).await?;
            }
        }
        Ok(())
    }

    async fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(cause) = change.cause.clone() else {
            return Ok(());
        };
        for target_id in &change.target_ids {
            let removed = lock_targets(&self.listen_targets).remove(target_id).is_some();
            if !removed {
                continue;
            }
            {
                let mut state = self.state.lock().await;
                if let Some(aggregator) = state.watch_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
            }
            log::debug!("watch target {target_id} rejected: {cause}");
            self.remote_syncer.reject_listen(*target_id, cause.clone()).await?;
        }
        Ok(())
    }

    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let event = {
            let mut state = self.state.lock().await;
            let Some(aggregator) = state.watch_aggregator.as_mut() else {
                return Ok(());
            };
            aggregator.create_remote_event(snapshot_version)
        };

        for (target_id, purpose) in &event.target_mismatches {
            let target_data = {
                let mut targets = lock_targets(&self.listen_targets);
                let Some(target_data) = targets.get_mut(target_id) else {
                    continue;
                };
                // The cached results are discarded, so resuming would skip documents.
                *target_data = target_data
                    .clone()
                    .with_resume_token(Vec::new(), target_data.snapshot_version);
                target_data.clone()
            };
            self.send_unwatch_request(*target_id).await;
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(request).await;
        }

        let resume_tokens: Vec<(i32, Vec<u8>)> = event
            .target_changes
            .iter()
            .filter(|(target_id, change)| {
                !change.resume_token.is_empty() && !event.target_mismatches.contains_key(target_id)
            })
            .map(|(target_id, change)| (*target_id, change.resume_token.clone()))
            .collect();

        self.remote_syncer.apply_remote_event(event).await?;

        // Resume tokens only move forward once the event is persisted; a
        // reconnect before that resumes from the previous snapshot.
        let mut targets = lock_targets(&self.listen_targets);
        for (target_id, resume_token) in resume_tokens {
            if let Some(target_data) = targets.get_mut(&target_id) {
                *target_data = target_data.clone().with_resume_token(resume_token, snapshot_version);
            }
        }
        Ok(())
    }

    async fn on_watch_stream_error(self: &Arc<Self>, generation: u64, error: FirestoreError) {
        let (stream, failure, restart, timer) = {
            let mut state = self.state.lock().await;
            if state.watch_generation != Some(generation) {
                return;
            }
            state.watch_stream_open = false;
            state.watch_aggregator = Some(self.new_aggregator());

            if !state.can_use_network() || !self.has_listen_targets() {
                let stream = state.take_watch_stream();
                let changed = state.online_state.set(OnlineState::Unknown);
                (stream, changed, None, None)
            } else {
                let failure = state.online_state.handle_watch_stream_failure(&error.to_string());
                // The stream reconnects on its own after backing off.
                let (restart, timer) = state.online_state.handle_watch_stream_start();
                (None, failure, restart, timer)
            }
        };

        log::debug!("watch stream failed: {error}");
        if let Some(stream) = stream {
            stream.stop();
        }
        self.broadcast(failure).await;
        self.broadcast(restart).await;
        if let Some(timer_id) = timer {
            self.arm_online_state_timer(timer_id);
        }
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> FirestoreResult<()> {
        loop {
            let (can_add, last_batch_id) = {
                let state = self.state.lock().await;
                (
                    state.can_use_network() && state.write_pipeline.len() < self.options.max_pending_writes,
                    state.write_pipeline.back().map(|batch| batch.batch_id),
                )
            };
            if !can_add {
                break;
            }

            let Some(batch) = self.remote_syncer.next_mutation_batch(last_batch_id).await? else {
                break;
            };

            let (stream, handshake_complete) = {
                let mut state = self.state.lock().await;
                state.write_pipeline.push_back(batch.clone());
                (state.write_stream.clone(), state.write_handshake_complete)
            };
            if let (Some(stream), true) = (stream, handshake_complete) {
                Self::send_batch(&stream, &batch).await;
            }
        }

        let start = {
            let state = self.state.lock().await;
            Self::should_start_write_stream(&state)
        };
        if start {
            self.start_write_stream().await;
        }
        Ok(())
    }

    async fn send_batch(stream: &WriteStream<RemoteWriteDelegate>, batch: &MutationBatch) {
        if let Err(err) = stream.write_mutations(&batch.mutations).await {
            // The batch stays in the pipeline and is resent after the next handshake.
            log::debug!("failed to send batch {}: {err}", batch.batch_id);
        }
    }

    async fn start_write_stream(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        let generation = state.allocate_generation();
        let delegate = Arc::new(RemoteWriteDelegate {
            inner: Arc::downgrade(self),
            queue: self.queue.clone(),
            generation,
        });
        let stream = WriteStream::new(&self.network_layer, self.serializer.clone(), delegate);
        state.write_stream = Some(Arc::new(stream));
        state.write_generation = Some(generation);
        state.write_handshake_complete = false;
    }

    async fn on_write_handshake_complete(&self, generation: u64, stream_token: Vec<u8>) -> FirestoreResult<()> {
        if self.state.lock().await.write_generation != Some(generation) {
            return Ok(());
        }
        self.remote_syncer.set_last_stream_token(stream_token).await?;

        let (stream, batches) = {
            let mut state = self.state.lock().await;
            state.write_handshake_complete = true;
            (
                state.write_stream.clone(),
                state.write_pipeline.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(stream) = stream {
            for batch in &batches {
                Self::send_batch(&stream, batch).await;
            }
        }
        Ok(())
    }

    async fn on_write_response(self: &Arc<Self>, generation: u64, response: WriteResponse) -> FirestoreResult<()> {
        let batch = {
            let state = self.state.lock().await;
            if state.write_generation != Some(generation) {
                return Ok(());
            }
            state
                .write_pipeline
                .front()
                .cloned()
                .ok_or_else(|| internal_error("Got a write response with an empty write pipeline"))?
        };

        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            response.results,
            response.stream_token,
        )?;
        let syncer = Arc::clone(&self.remote_syncer);
        self.queue
            .run_retryable("apply successful write", move || {
                let syncer = Arc::clone(&syncer);
                let result = result.clone();
                async move { syncer.apply_successful_write(result).await }
            })
            .await?;

        self.state.lock().await.write_pipeline.pop_front();
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_error(
        self: &Arc<Self>,
        generation: u64,
        error: FirestoreError,
        handshake_complete: bool,
    ) -> FirestoreResult<()> {
        let pipeline_empty = {
            let mut state = self.state.lock().await;
            if state.write_generation != Some(generation) {
                return Ok(());
            }
            state.write_handshake_complete = false;
            state.write_pipeline.is_empty()
        };
        log::debug!("write stream failed: {error}");

        if !pipeline_empty {
            if handshake_complete {
                self.handle_write_error(error).await?;
            } else if error.is_permanent_error() {
                log::debug!("permanent error during the write handshake, resetting the stream token");
                self.remote_syncer.set_last_stream_token(Vec::new()).await?;
            }
        }

        // An idle write stream is not kept alive; the next batch starts a new one.
        let stream = {
            let mut state = self.state.lock().await;
            if state.write_generation == Some(generation) && state.write_pipeline.is_empty() {
                state.write_generation = None;
                state.write_stream.take()
            } else {
                None
            }
        };
        if let Some(stream) = stream {
            stream.stop();
        }
        Ok(())
    }

    async fn handle_write_error(self: &Arc<Self>, error: FirestoreError) -> FirestoreResult<()> {
        if !error.is_permanent_write_error() {
            return Ok(());
        }
        let (batch, stream) = {
            let mut state = self.state.lock().await;
            (state.write_pipeline.pop_front(), state.write_stream.clone())
        };
        let Some(batch) = batch else {
            return Ok(());
        };
        // The rejection is not a connectivity problem, so reconnect right away.
        if let Some(stream) = stream {
            stream.inhibit_backoff();
        }
        log::debug!("batch {} rejected: {error}", batch.batch_id);
        self.remote_syncer.reject_failed_write(batch.batch_id, error).await?;
        self.fill_write_pipeline().await
    }
}

struct RemoteListenDelegate {
    inner: Weak<RemoteStoreInner>,
    queue: AsyncQueue,
    generation: u64,
}

#[async_trait]
impl ListenStreamDelegate for RemoteListenDelegate {
    async fn on_open(&self) -> FirestoreResult<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let generation = self.generation;
        self.queue
            .enqueue(async move { inner.on_watch_stream_open(generation).await })
            .await
    }

    async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let generation = self.generation;
        self.queue
            .enqueue(async move { inner.on_watch_change(generation, change, snapshot_version).await })
            .await
    }

    async fn on_stream_error(&self, error: FirestoreError) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let generation = self.generation;
        let result = self
            .queue
            .enqueue(async move {
                inner.on_watch_stream_error(generation, error).await;
                Ok(())
            })
            .await;
        if let Err(err) = result {
            log::debug!("dropping watch stream error: {err}");
        }
    }
}

struct RemoteWriteDelegate {
    inner: Weak<RemoteStoreInner>,
    queue: AsyncQueue,
    generation: u64,
}

#[async_trait]
impl WriteStreamDelegate for RemoteWriteDelegate {
    async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let generation = self.generation;
        self.queue
            .enqueue(async move { inner.on_write_handshake_complete(generation, stream_token).await })
            .await
    }

    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        let generation = self.generation;
        self.queue
            .enqueue(async move { inner.on_write_response(generation, response).await })
            .await
    }

    async fn on_stream_error(&self, error: FirestoreError, handshake_complete: bool) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let generation = self.generation;
        let result = self
            .queue
            .enqueue(async move { inner.on_write_stream_error(generation, error, handshake_complete).await })
            .await;
        if let Err(err) = result {
            log::debug!("failed to handle write stream error: {err}");
        }
    }
}
