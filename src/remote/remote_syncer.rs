use std::collections::BTreeSet;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::remote_event::RemoteEvent;

pub type RemoteStoreFuture<'a, T> = BoxFuture<'a, T>;

pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Callbacks from the remote store into the component that owns local state.
///
/// Every method runs on the client's async queue. Implementations may call
/// back into the remote store (for example to listen to limbo targets) but
/// must never enqueue work and wait for it.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies one consistent snapshot from the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend refused to listen to a target; the target is already
    /// removed from the watch stream.
    fn reject_listen(&self, target_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend permanently rejected the batch.
    fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_online_state_change(&self, online_state: OnlineState) -> RemoteStoreFuture<'_, ()>;

    /// Keys the local store last synced for the target.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;

    /// The first queued batch with an id greater than `after_batch_id`.
    fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> RemoteStoreFuture<'_, FirestoreResult<Option<MutationBatch>>>;

    fn get_last_remote_snapshot_version(&self) -> RemoteStoreFuture<'_, FirestoreResult<SnapshotVersion>>;

    /// Persists the write stream token. An empty token resets the stream.
    fn set_last_stream_token(&self, token: Vec<u8>) -> RemoteStoreFuture<'_, FirestoreResult<()>>;
}
