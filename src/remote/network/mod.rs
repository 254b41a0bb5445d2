use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::remote::datastore::{box_stream_future, StreamHandle, StreamingDatastore, StreamingFuture, TokenProviderArc};
use crate::remote::stream::{PersistentStream, PersistentStreamDelegate, PersistentStreamHandle, StreamKind};
use crate::util::backoff::BackoffConfig;

pub use crate::remote::stream::StreamCredentials;

/// The watch or write protocol spoken over a reconnecting stream.
///
/// `on_open` runs for every new underlying stream with freshly fetched
/// credentials, so handlers send their opening request (the write handshake,
/// or the current watch targets) from there.
#[async_trait]
pub trait NetworkStreamHandler: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    async fn on_open(&self, stream: Arc<dyn StreamHandle>, credentials: StreamCredentials) -> FirestoreResult<()>;

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()>;

    async fn on_error(&self, error: FirestoreError);
}

/// Adapts a [`NetworkStreamHandler`] to the reconnect loop and owns the token
/// lifecycle: fetch before every attempt, invalidate on `UNAUTHENTICATED`.
struct AuthenticatedStream<H> {
    handler: Arc<H>,
    tokens: TokenProviderArc,
}

impl<H> PersistentStreamDelegate for AuthenticatedStream<H>
where
    H: NetworkStreamHandler,
{
    fn stream_label(&self) -> &'static str {
        self.handler.label()
    }

    fn get_credentials(&self) -> StreamingFuture<'_, FirestoreResult<StreamCredentials>> {
        box_stream_future(async move {
            let auth_token = self.tokens.get_token().await?;
            Ok(StreamCredentials { auth_token })
        })
    }

    fn on_stream_open(
        &self,
        stream: Arc<dyn StreamHandle>,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(self.handler.on_open(stream, credentials))
    }

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(self.handler.on_message(message))
    }

    fn on_stream_error(&self, error: FirestoreError) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            if error.code == FirestoreErrorCode::Unauthenticated {
                log::debug!("{} stream rejected its token", self.handler.label());
                self.tokens.invalidate_token();
            }
            self.handler.on_error(error).await;
        })
    }
}

/// Opens the client's watch and write streams against one datastore, with a
/// shared token provider and reconnect backoff.
#[derive(Clone)]
pub struct NetworkLayer {
    datastore: Arc<dyn StreamingDatastore>,
    tokens: TokenProviderArc,
    backoff: BackoffConfig,
}

impl NetworkLayer {
    /// A layer with the default backoff. See [`NetworkLayerBuilder`] to tune it.
    pub fn new(datastore: Arc<dyn StreamingDatastore>, tokens: TokenProviderArc) -> Self {
        Self {
            datastore,
            tokens,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn builder(datastore: Arc<dyn StreamingDatastore>, tokens: TokenProviderArc) -> NetworkLayerBuilder {
        NetworkLayerBuilder {
            layer: Self::new(datastore, tokens),
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    pub fn listen<H>(&self, handler: Arc<H>) -> PersistentStreamHandle
    where
        H: NetworkStreamHandler,
    {
        self.start(StreamKind::Listen, handler)
    }

    pub fn write<H>(&self, handler: Arc<H>) -> PersistentStreamHandle
    where
        H: NetworkStreamHandler,
    {
        self.start(StreamKind::Write, handler)
    }

    fn start<H>(&self, kind: StreamKind, handler: Arc<H>) -> PersistentStreamHandle
    where
        H: NetworkStreamHandler,
    {
        let delegate = Arc::new(AuthenticatedStream {
            handler,
            tokens: Arc::clone(&self.tokens),
        });
        PersistentStream::new(Arc::clone(&self.datastore), delegate, self.backoff, kind).start()
    }
}

pub struct NetworkLayerBuilder {
    layer: NetworkLayer,
}

impl NetworkLayerBuilder {
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.layer.backoff = backoff;
        self
    }

    pub fn build(self) -> NetworkLayer {
        self.layer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unauthenticated;
    use crate::remote::datastore::{StreamingDatastoreImpl, TokenProvider};
    use crate::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct CountingTokens {
        fetches: AtomicUsize,
        invalidated: AtomicBool,
    }

    #[async_trait]
    impl TokenProvider for CountingTokens {
        async fn get_token(&self) -> FirestoreResult<Option<String>> {
            let fetch = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Some(format!("token-{fetch}")))
        }

        fn invalidate_token(&self) {
            self.invalidated.store(true, Ordering::SeqCst);
        }
    }

    struct RecordingHandler {
        credentials: Mutex<Vec<StreamCredentials>>,
        messages: async_channel::Sender<Vec<u8>>,
        errors: async_channel::Sender<FirestoreError>,
    }

    #[async_trait]
    impl NetworkStreamHandler for RecordingHandler {
        fn label(&self) -> &'static str {
            "recording"
        }

        async fn on_open(&self, stream: Arc<dyn StreamHandle>, credentials: StreamCredentials) -> FirestoreResult<()> {
            self.credentials.lock().unwrap().push(credentials);
            stream.send(b"hello".to_vec()).await
        }

        async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
            let _ = self.messages.send(payload).await;
            Ok(())
        }

        async fn on_error(&self, error: FirestoreError) {
            let _ = self.errors.send(error).await;
        }
    }

    #[tokio::test]
    async fn rejected_token_is_invalidated_and_refetched_on_reconnect() {
        let (client_transport, server_transport) = InMemoryTransport::pair();
        let server = MultiplexedConnection::new(server_transport);
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(Arc::new(
            MultiplexedConnection::new(client_transport),
        )));

        let tokens = Arc::new(CountingTokens {
            fetches: AtomicUsize::new(0),
            invalidated: AtomicBool::new(false),
        });
        let layer = NetworkLayer::builder(datastore, Arc::clone(&tokens) as TokenProviderArc)
            .with_backoff(BackoffConfig {
                initial_delay: Duration::from_millis(1),
                backoff_factor: 1.5,
                max_delay: Duration::from_millis(5),
            })
            .build();

        let (messages_tx, messages_rx) = async_channel::unbounded();
        let (errors_tx, errors_rx) = async_channel::unbounded();
        let handler = Arc::new(RecordingHandler {
            credentials: Mutex::new(Vec::new()),
            messages: messages_tx,
            errors: errors_tx,
        });
        let handle = layer.listen(Arc::clone(&handler));

        let first = server.accept_stream().await.unwrap();
        assert_eq!(first.next().await.unwrap().unwrap(), b"hello");
        first.fail(unauthenticated("expired")).await.unwrap();
        assert_eq!(errors_rx.recv().await.unwrap().code, FirestoreErrorCode::Unauthenticated);
        assert!(tokens.invalidated.load(Ordering::SeqCst));

        let second = server.accept_stream().await.unwrap();
        assert_eq!(second.next().await.unwrap().unwrap(), b"hello");
        second.send(b"payload".to_vec()).await.unwrap();
        assert_eq!(messages_rx.recv().await.unwrap(), b"payload");
        handle.stop();

        let tokens_seen: Vec<Option<String>> = handler
            .credentials
            .lock()
            .unwrap()
            .iter()
            .map(|credentials| credentials.auth_token.clone())
            .collect();
        assert_eq!(tokens_seen, vec![Some("token-0".to_string()), Some("token-1".to_string())]);
    }

    #[tokio::test]
    async fn builder_overrides_only_the_backoff() {
        let (client_transport, _server_transport) = InMemoryTransport::pair();
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(Arc::new(
            MultiplexedConnection::new(client_transport),
        )));
        let tokens: TokenProviderArc = Arc::new(crate::remote::datastore::NoopTokenProvider);
        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(8),
        };

        assert_eq!(NetworkLayer::new(Arc::clone(&datastore), Arc::clone(&tokens)).backoff(), BackoffConfig::default());
        assert_eq!(NetworkLayer::builder(datastore, tokens).with_backoff(backoff).build().backoff(), backoff);
    }
}
