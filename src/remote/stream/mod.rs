use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

pub mod persistent;

pub use persistent::{
    PersistentStream, PersistentStreamDelegate, PersistentStreamHandle, StreamCredentials, StreamKind, StreamState,
};

/// Identifies a logical stream within one connection.
pub type StreamId = u32;

/// What a transport carries: an event on one logical stream.
#[derive(Clone, Debug)]
pub enum TransportFrame {
    Open { stream: StreamId },
    Data { stream: StreamId, payload: Vec<u8> },
    Close { stream: StreamId },
    Error { stream: StreamId, error: FirestoreError },
}

impl TransportFrame {
    pub fn stream(&self) -> StreamId {
        match self {
            TransportFrame::Open { stream }
            | TransportFrame::Data { stream, .. }
            | TransportFrame::Close { stream }
            | TransportFrame::Error { stream, .. } => *stream,
        }
    }
}

/// A bidirectional frame pipe shared by every logical stream of a connection.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

/// Delivered to the reading half of a [`MultiplexedStream`].
enum Inbound {
    Payload(Vec<u8>),
    Finished(Option<FirestoreError>),
}

#[derive(Default)]
struct StreamRegistry {
    readers: Mutex<HashMap<StreamId, Sender<Inbound>>>,
}

impl StreamRegistry {
    fn readers(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, Sender<Inbound>>> {
        self.readers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: StreamId) -> Receiver<Inbound> {
        let (tx, rx) = async_channel::unbounded();
        self.readers().insert(id, tx);
        rx
    }

    fn reader(&self, id: StreamId) -> Option<Sender<Inbound>> {
        self.readers().get(&id).cloned()
    }

    fn forget(&self, id: StreamId) {
        self.readers().remove(&id);
    }
}

/// Runs many logical streams over a single [`StreamTransport`].
///
/// Locally opened streams are numbered from a counter. When the peer opens a
/// stream this side has not seen, it is queued for
/// [`accept_stream`](Self::accept_stream); a scripted backend in tests uses
/// that to pick up the client's listen and write streams.
pub struct MultiplexedConnection {
    next_id: AtomicU32,
    outbound: Sender<TransportFrame>,
    registry: Arc<StreamRegistry>,
    accepted: Receiver<MultiplexedStream>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted) = async_channel::unbounded();
        let registry = Arc::new(StreamRegistry::default());

        runtime::spawn_detached(pump_outbound(Arc::clone(&transport), outbound_rx));
        runtime::spawn_detached(pump_inbound(
            transport,
            Arc::clone(&registry),
            outbound.clone(),
            accepted_tx,
        ));

        Self {
            next_id: AtomicU32::new(1),
            outbound,
            registry,
            accepted,
        }
    }

    pub async fn open_stream(&self) -> FirestoreResult<MultiplexedStream> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let inbound = self.registry.register(id);
        self.outbound
            .send(TransportFrame::Open { stream: id })
            .await
            .map_err(|err| internal_error(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream::new(id, self.outbound.clone(), inbound, Arc::clone(&self.registry)))
    }

    /// Waits for the next stream the peer opened.
    pub async fn accept_stream(&self) -> FirestoreResult<MultiplexedStream> {
        self.accepted
            .recv()
            .await
            .map_err(|_| unavailable("connection closed"))
    }
}

async fn pump_outbound(transport: Arc<dyn StreamTransport>, frames: Receiver<TransportFrame>) {
    while let Ok(frame) = frames.recv().await {
        if let Err(err) = transport.send(frame).await {
            log::warn!("connection writer stopped: {err}");
            return;
        }
    }
}

async fn pump_inbound(
    transport: Arc<dyn StreamTransport>,
    registry: Arc<StreamRegistry>,
    outbound: Sender<TransportFrame>,
    accepted: Sender<MultiplexedStream>,
) {
    loop {
        let frame = match transport.next().await {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("connection reader stopped: {err}");
                return;
            }
        };
        let id = frame.stream();
        let reader = registry.reader(id);

        match frame {
            TransportFrame::Open { .. } => {
                if reader.is_some() {
                    continue;
                }
                let inbound = registry.register(id);
                let stream = MultiplexedStream::new(id, outbound.clone(), inbound, Arc::clone(&registry));
                if accepted.send(stream).await.is_err() {
                    log::debug!("no acceptor for stream {id}");
                }
            }
            TransportFrame::Data { payload, .. } => match reader {
                Some(reader) => {
                    if reader.send(Inbound::Payload(payload)).await.is_err() {
                        log::debug!("stream {id} is no longer read, dropping payload");
                    }
                }
                None => log::debug!("payload for unknown stream {id}"),
            },
            TransportFrame::Close { .. } => finish_reader(&registry, id, reader, None).await,
            TransportFrame::Error { error, .. } => finish_reader(&registry, id, reader, Some(error)).await,
        }
    }
}

async fn finish_reader(
    registry: &StreamRegistry,
    id: StreamId,
    reader: Option<Sender<Inbound>>,
    error: Option<FirestoreError>,
) {
    if let Some(reader) = reader {
        let _ = reader.send(Inbound::Finished(error)).await;
        registry.forget(id);
    }
}

/// One logical stream of a [`MultiplexedConnection`]. Dropping it closes it.
pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<Inbound>,
    registry: Arc<StreamRegistry>,
    closed: AtomicBool,
}

impl MultiplexedStream {
    fn new(
        id: StreamId,
        outbound: Sender<TransportFrame>,
        inbound: Receiver<Inbound>,
        registry: Arc<StreamRegistry>,
    ) -> Self {
        Self {
            id,
            outbound,
            inbound,
            registry,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(unavailable("stream is closed"));
        }
        self.outbound
            .send(TransportFrame::Data {
                stream: self.id,
                payload,
            })
            .await
            .map_err(|err| internal_error(format!("failed to queue payload: {err}")))
    }

    /// Next payload from the peer; `None` once either side closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        match self.inbound.recv().await.ok()? {
            Inbound::Payload(payload) => Some(Ok(payload)),
            Inbound::Finished(Some(error)) => Some(Err(error)),
            Inbound::Finished(None) => None,
        }
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.finish(TransportFrame::Close { stream: self.id });
        Ok(())
    }

    /// Ends the stream with `error`, which the peer reads from `next`.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.finish(TransportFrame::Error { stream: self.id, error });
        Ok(())
    }

    fn finish(&self, frame: TransportFrame) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.try_send(frame);
        self.registry.forget(self.id);
        self.inbound.close();
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.finish(TransportFrame::Close { stream: self.id });
    }
}

/// Two transports wired to each other in memory.
pub struct InMemoryTransport {
    incoming: Receiver<TransportFrame>,
    outgoing: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (to_right, right_incoming) = async_channel::unbounded();
        let (to_left, left_incoming) = async_channel::unbounded();
        (
            Arc::new(Self {
                incoming: left_incoming,
                outgoing: to_right,
            }),
            Arc::new(Self {
                incoming: right_incoming,
                outgoing: to_left,
            }),
        )
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| unavailable("in-memory peer went away"))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.incoming
            .recv()
            .await
            .map_err(|_| unavailable("in-memory peer went away"))
    }
}
