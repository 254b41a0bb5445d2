use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::error::{internal_error, FirestoreError, FirestoreResult};
use crate::local::TargetData;
use crate::model::SnapshotVersion;
use crate::remote::datastore::StreamHandle;
use crate::remote::network::{NetworkLayer, NetworkStreamHandler, StreamCredentials};
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::stream::{PersistentStreamHandle, StreamState};
use crate::remote::watch_change::{decode_watch_change, WatchChange};

#[async_trait]
pub trait ListenStreamDelegate: Send + Sync + 'static {
    /// The stream (re)connected; targets must be sent again.
    async fn on_open(&self) -> FirestoreResult<()>;

    async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> FirestoreResult<()>;

    async fn on_stream_error(&self, error: FirestoreError);
}

/// The watch stream: sends `addTarget`/`removeTarget` requests and decodes
/// listen responses into [`WatchChange`]s.
pub struct ListenStream<D>
where
    D: ListenStreamDelegate,
{
    handler: Arc<ListenStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> ListenStream<D>
where
    D: ListenStreamDelegate,
{
    pub fn new(layer: &NetworkLayer, serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        let handler = Arc::new(ListenStreamHandler {
            serializer,
            delegate,
            stream: Mutex::new(None),
        });
        let handle = layer.listen(Arc::clone(&handler));
        Self { handler, handle }
    }

    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = json!({
            "database": self.handler.serializer.database_name(),
            "addTarget": self.handler.serializer.encode_target(target_data),
        });
        self.handler.send(request).await
    }

    pub async fn unwatch(&self, target_id: i32) -> FirestoreResult<()> {
        let request = json!({
            "database": self.handler.serializer.database_name(),
            "removeTarget": target_id,
        });
        self.handler.send(request).await
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }
}

struct ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    serializer: JsonProtoSerializer,
    delegate: Arc<D>,
    stream: Mutex<Option<Arc<dyn StreamHandle>>>,
}

impl<D> ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    async fn send(&self, request: JsonValue) -> FirestoreResult<()> {
        let Some(stream) = self.stream.lock().await.clone() else {
            log::debug!("watch stream not open, request will be sent on reconnect");
            return Ok(());
        };
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("Failed to encode listen request: {err}")))?;
        stream.send(bytes).await
    }
}

#[async_trait]
impl<D> NetworkStreamHandler for ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    fn label(&self) -> &'static str {
        "listen"
    }

    async fn on_open(&self, stream: Arc<dyn StreamHandle>, _credentials: StreamCredentials) -> FirestoreResult<()> {
        *self.stream.lock().await = Some(stream);
        self.delegate.on_open().await
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let value: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| internal_error(format!("Failed to decode listen response: {err}")))?;

        match decode_watch_change(&self.serializer, &value)? {
            Some(change) => {
                let snapshot_version = change.snapshot_version();
                self.delegate.on_watch_change(change, snapshot_version).await
            }
            None => {
                log::debug!("ignoring unrecognized listen response");
                Ok(())
            }
        }
    }

    async fn on_error(&self, error: FirestoreError) {
        self.stream.lock().await.take();
        self.delegate.on_stream_error(error).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::TargetPurpose;
    use crate::model::DatabaseId;
    use crate::remote::datastore::{NoopTokenProvider, StreamingDatastore, StreamingDatastoreImpl, TokenProviderArc};
    use crate::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::remote::watch_change::TargetChangeState;

    struct TestDelegate {
        opened: async_channel::Sender<()>,
        changes: async_channel::Sender<(WatchChange, SnapshotVersion)>,
    }

    #[async_trait]
    impl ListenStreamDelegate for TestDelegate {
        async fn on_open(&self) -> FirestoreResult<()> {
            let _ = self.opened.send(()).await;
            Ok(())
        }

        async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
            let _ = self.changes.send((change, snapshot_version)).await;
            Ok(())
        }

        async fn on_stream_error(&self, _error: FirestoreError) {}
    }

    #[tokio::test]
    async fn sends_targets_and_decodes_changes() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::new(left_transport));
        let server = Arc::new(MultiplexedConnection::new(right_transport));
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(client));
        let layer = NetworkLayer::builder(datastore, Arc::new(NoopTokenProvider) as TokenProviderArc).build();
        let serializer = JsonProtoSerializer::new(DatabaseId::new("test", "(default)"));

        let (opened_tx, opened_rx) = async_channel::unbounded();
        let (changes_tx, changes_rx) = async_channel::unbounded();
        let stream = ListenStream::new(
            &layer,
            serializer,
            Arc::new(TestDelegate {
                opened: opened_tx,
                changes: changes_tx,
            }),
        );

        let peer = server.accept_stream().await.unwrap();
        opened_rx.recv().await.unwrap();

        let target = TargetData::new(Query::collection("cities").unwrap().to_target(), 2, TargetPurpose::Listen, 1);
        stream.watch(&target).await.unwrap();
        let request: JsonValue = serde_json::from_slice(&peer.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(request["addTarget"]["targetId"], json!(2));
        assert!(request["addTarget"]["query"]["structuredQuery"].is_object());

        stream.unwatch(2).await.unwrap();
        let request: JsonValue = serde_json::from_slice(&peer.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(request["removeTarget"], json!(2));

        let response = json!({ "targetChange": { "readTime": "1970-01-01T00:00:03Z" } });
        peer.send(serde_json::to_vec(&response).unwrap()).await.unwrap();
        let (change, version) = changes_rx.recv().await.unwrap();
        assert!(!version.is_min());
        match change {
            WatchChange::TargetChange(change) => assert_eq!(change.state, TargetChangeState::NoChange),
            other => panic!("unexpected change: {other:?}"),
        }
        stream.stop();
    }
}
