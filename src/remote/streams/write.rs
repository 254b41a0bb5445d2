use std::sync::Arc;

use async_lock::Mutex;
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::error::{failed_precondition, internal_error, FirestoreError, FirestoreResult};
use crate::model::{Mutation, MutationResult, SnapshotVersion};
use crate::remote::datastore::StreamHandle;
use crate::remote::network::{NetworkLayer, NetworkStreamHandler, StreamCredentials};
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::stream::{PersistentStreamHandle, StreamState};

/// A decoded write stream response that acknowledges one batch.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub results: Vec<MutationResult>,
}

#[async_trait]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    /// The backend answered the handshake; batches may now be sent.
    async fn on_handshake_complete(&self, stream_token: Vec<u8>) -> FirestoreResult<()>;

    async fn on_write_response(&self, response: WriteResponse) -> FirestoreResult<()>;

    /// `handshake_complete` tells whether the failed stream got past its
    /// handshake, which decides how a permanent error is handled.
    async fn on_stream_error(&self, error: FirestoreError, handshake_complete: bool);
}

pub struct WriteStream<D>
where
    D: WriteStreamDelegate,
{
    handler: Arc<WriteStreamHandler<D>>,
    handle: PersistentStreamHandle,
}

impl<D> WriteStream<D>
where
    D: WriteStreamDelegate,
{
    pub fn new(layer: &NetworkLayer, serializer: JsonProtoSerializer, delegate: Arc<D>) -> Self {
        let handler = Arc::new(WriteStreamHandler {
            serializer,
            delegate,
            state: Mutex::new(WriteStreamState::default()),
        });
        let handle = layer.write(Arc::clone(&handler));
        Self { handler, handle }
    }

    /// Sends one batch. Fails with `FailedPrecondition` before the handshake
    /// completed; the caller keeps the batch and resends it after the next
    /// handshake.
    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let (stream, token) = {
            let state = self.handler.state.lock().await;
            match (&state.stream, state.handshake_complete) {
                (Some(stream), true) => (Arc::clone(stream), state.last_stream_token.clone()),
                _ => return Err(failed_precondition("write stream handshake has not completed")),
            }
        };

        let serializer = &self.handler.serializer;
        let writes: Vec<JsonValue> = mutations.iter().map(|mutation| serializer.encode_mutation(mutation)).collect();
        let request = json!({
            "streamToken": serializer.encode_bytes(&token),
            "writes": writes,
        });
        let bytes = serde_json::to_vec(&request)
            .map_err(|err| internal_error(format!("Failed to encode write request: {err}")))?;
        stream.send(bytes).await
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn inhibit_backoff(&self) {
        self.handle.inhibit_backoff();
    }

    pub fn state(&self) -> StreamState {
        self.handle.state()
    }
}

#[derive(Default)]
struct WriteStreamState {
    stream: Option<Arc<dyn StreamHandle>>,
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

struct WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    serializer: JsonProtoSerializer,
    delegate: Arc<D>,
    state: Mutex<WriteStreamState>,
}

impl<D> WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn decode_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = self.serializer.decode_bytes(value.get("streamToken"))?;
        let commit_version = self.serializer.decode_version(value.get("commitTime"))?;
        let results = match value.get("writeResults") {
            Some(JsonValue::Array(entries)) => entries
                .iter()
                .map(|entry| self.serializer.decode_mutation_result(entry, commit_version))
                .collect::<FirestoreResult<Vec<_>>>()?,
            Some(JsonValue::Null) | None => Vec::new(),
            Some(_) => return Err(internal_error("writeResults must be an array")),
        };
        Ok(WriteResponse {
            stream_token,
            commit_version,
            results,
        })
    }
}

#[async_trait]
impl<D> NetworkStreamHandler for WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn label(&self) -> &'static str {
        "write"
    }

    async fn on_open(&self, stream: Arc<dyn StreamHandle>, _credentials: StreamCredentials) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            state.stream = Some(Arc::clone(&stream));
            state.handshake_complete = false;
        }
        let handshake = json!({ "database": self.serializer.database_name() });
        let bytes = serde_json::to_vec(&handshake)
            .map_err(|err| internal_error(format!("Failed to encode write handshake: {err}")))?;
        stream.send(bytes).await
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let value: JsonValue = serde_json::from_slice(&payload)
            .map_err(|err| internal_error(format!("Failed to decode write response: {err}")))?;
        let response = self.decode_response(&value)?;

        let was_handshake = {
            let mut state = self.state.lock().await;
            state.last_stream_token = response.stream_token.clone();
            let was_handshake = !state.handshake_complete;
            state.handshake_complete = true;
            was_handshake
        };

        if was_handshake {
            if !response.results.is_empty() {
                return Err(internal_error("write handshake response must not carry results"));
            }
            self.delegate.on_handshake_complete(response.stream_token).await
        } else {
            self.delegate.on_write_response(response).await
        }
    }

    async fn on_error(&self, error: FirestoreError) {
        let handshake_complete = {
            let mut state = self.state.lock().await;
            state.stream = None;
            std::mem::take(&mut state.handshake_complete)
        };
        self.delegate.on_stream_error(error, handshake_complete).await;
    }
}
