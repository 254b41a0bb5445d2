use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::platform::runtime;
use crate::remote::datastore::{StreamHandle, StreamingDatastore, StreamingFuture};
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

/// Lifecycle of a [`PersistentStream`].
///
/// `Initial -> Auth -> Open`, and on failure `Error -> Backoff -> Auth` again
/// until the stream is stopped, which moves it to `Closed` for good.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    Auth,
    Open,
    Error,
    Backoff,
    Closed,
}

/// Tokens attached to a stream when it opens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
}

pub trait PersistentStreamDelegate: Send + Sync + 'static {
    fn stream_label(&self) -> &'static str;

    /// Called in the `Auth` state. The underlying stream is only opened once
    /// this succeeds.
    fn get_credentials(&self) -> StreamingFuture<'_, FirestoreResult<StreamCredentials>>;

    /// Called once per underlying stream, before any message is read.
    fn on_stream_open(
        &self,
        stream: Arc<dyn StreamHandle>,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<()>>;

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Called after the underlying stream failed, before backing off. Never
    /// called once the stream has been stopped.
    fn on_stream_error(&self, error: FirestoreError) -> StreamingFuture<'_, ()>;
}

struct StreamShared {
    running: AtomicBool,
    inhibit_backoff: AtomicBool,
    state: Mutex<StreamState>,
    current: Mutex<Option<Arc<dyn StreamHandle>>>,
}

impl StreamShared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn state(&self) -> StreamState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn set_current(&self, stream: Option<Arc<dyn StreamHandle>>) {
        *self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = stream;
    }

    fn take_current(&self) -> Option<Arc<dyn StreamHandle>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }
}

/// A stream that reopens itself with exponential backoff until stopped.
pub struct PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    datastore: Arc<dyn StreamingDatastore>,
    delegate: Arc<D>,
    backoff: BackoffConfig,
    kind: StreamKind,
    shared: Arc<StreamShared>,
}

impl<D> PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    pub fn new(datastore: Arc<dyn StreamingDatastore>, delegate: Arc<D>, backoff: BackoffConfig, kind: StreamKind) -> Self {
        Self {
            datastore,
            delegate,
            backoff,
            kind,
            shared: Arc::new(StreamShared {
                running: AtomicBool::new(true),
                inhibit_backoff: AtomicBool::new(false),
                state: Mutex::new(StreamState::Initial),
                current: Mutex::new(None),
            }),
        }
    }

    pub fn start(self) -> PersistentStreamHandle {
        let shared = Arc::clone(&self.shared);
        runtime::spawn_detached(async move {
            self.run().await;
        });
        PersistentStreamHandle { shared }
    }

    async fn run(self) {
        let label = self.delegate.stream_label();
        let mut backoff = ExponentialBackoff::new(self.backoff);

        while self.shared.is_running() {
            if self.shared.inhibit_backoff.swap(false, Ordering::SeqCst) {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            if !delay.is_zero() {
                self.shared.set_state(StreamState::Backoff);
                log::debug!("{label} stream backing off for {delay:?}");
                runtime::sleep(delay).await;
                if !self.shared.is_running() {
                    break;
                }
            }

            self.shared.set_state(StreamState::Auth);
            let failure = match self.open().await {
                Ok(stream) => self.process_stream(stream, &mut backoff).await,
                Err(err) => Some(err),
            };

            if let Some(error) = failure {
                if !self.shared.is_running() {
                    break;
                }
                self.shared.set_state(StreamState::Error);
                if error.code == FirestoreErrorCode::ResourceExhausted {
                    backoff.reset_to_max();
                }
                log::debug!("{label} stream failed: {error}");
                self.delegate.on_stream_error(error).await;
            }
        }

        self.shared.set_current(None);
        self.shared.set_state(StreamState::Closed);
        log::debug!("{label} stream closed");
    }

    async fn open(&self) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let credentials = self.delegate.get_credentials().await?;
        if !self.shared.is_running() {
            return Err(unavailable("stream stopped while authenticating"));
        }
        let stream = match self.kind {
            StreamKind::Listen => self.datastore.open_listen_stream().await?,
            StreamKind::Write => self.datastore.open_write_stream().await?,
        };
        self.shared.set_current(Some(Arc::clone(&stream)));
        if !self.shared.is_running() {
            let _ = stream.close().await;
            return Err(unavailable("stream stopped while opening"));
        }
        if let Err(err) = self.delegate.on_stream_open(Arc::clone(&stream), credentials).await {
            let _ = stream.close().await;
            return Err(err);
        }
        Ok(stream)
    }

    /// Reads until the stream ends. Returns the failure to report, or `None`
    /// when the stream was stopped.
    async fn process_stream(&self, stream: Arc<dyn StreamHandle>, backoff: &mut ExponentialBackoff) -> Option<FirestoreError> {
        self.shared.set_state(StreamState::Open);
        let mut received = false;
        loop {
            if !self.shared.is_running() {
                let _ = stream.close().await;
                return None;
            }

            match stream.next().await {
                Some(Ok(payload)) => {
                    if !received {
                        received = true;
                        backoff.reset();
                    }
                    if let Err(err) = self.delegate.on_stream_message(payload).await {
                        let _ = stream.close().await;
                        return Some(err);
                    }
                }
                Some(Err(err)) => {
                    let _ = stream.close().await;
                    return Some(err);
                }
                None => {
                    if !self.shared.is_running() {
                        return None;
                    }
                    return Some(unavailable(format!(
                        "{} stream closed by the backend",
                        self.delegate.stream_label()
                    )));
                }
            }
        }
    }
}

/// Controls a started [`PersistentStream`].
#[derive(Clone)]
pub struct PersistentStreamHandle {
    shared: Arc<StreamShared>,
}

impl PersistentStreamHandle {
    /// Stops the stream for good and closes the underlying stream, if any.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(stream) = self.shared.take_current() {
            runtime::spawn_detached(async move {
                let _ = stream.close().await;
            });
        }
    }

    /// Makes the next reconnect attempt skip its backoff delay.
    pub fn inhibit_backoff(&self) {
        self.shared.inhibit_backoff.store(true, Ordering::SeqCst);
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }
}
