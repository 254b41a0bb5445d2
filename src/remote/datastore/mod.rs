use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::FirestoreResult;

pub mod streaming;

pub use streaming::{box_stream_future, StreamingDatastoreImpl, StreamingHandleImpl};

pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;

/// One open bidirectional stream to the backend.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Next payload, an error the backend closed the stream with, or `None`
    /// after a clean close.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the two long-lived streams the remote store runs on.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(&self) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
    fn open_write_stream(&self) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Drops any cached token so the next `get_token` fetches a fresh one.
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;
