use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::event_manager::{EventManager, ListenOptions, QueryObserver};
use crate::core::settings::{FirestoreSettings, PersistenceSettings};
use crate::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::core::view::View;
use crate::core::view_snapshot::ViewSnapshot;
use crate::core::Query;
use crate::error::{assertion_failure, cancelled, failed_precondition, FirestoreResult};
use crate::local::{DurablePersistence, LocalStore, MemoryPersistence, PersistenceArc};
use crate::model::{DocumentKey, MutableDocument, Mutation};
use crate::remote::{
    JsonProtoSerializer, NetworkLayer, OnlineState, RemoteStore, RemoteStoreOptions, RemoteSyncer,
    StreamingDatastore, TargetChange, TokenProviderArc,
};
use crate::util::AsyncQueue;
use crate::value::MapValue;

/// A document read from the local cache.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    key: DocumentKey,
    document: Option<MutableDocument>,
    from_cache: bool,
    has_pending_writes: bool,
}

impl DocumentSnapshot {
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn exists(&self) -> bool {
        self.document.is_some()
    }

    pub fn data(&self) -> Option<&MapValue> {
        self.document.as_ref().map(MutableDocument::data)
    }

    pub fn document(&self) -> Option<&MutableDocument> {
        self.document.as_ref()
    }

    /// False only while an active, synced listen covers the document.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

/// The handle that owns every subsystem of one database client.
///
/// All work runs on a single [`AsyncQueue`]; the public methods enqueue an
/// operation and wait for its result. After [`shutdown`](Self::shutdown)
/// every method fails with `FailedPrecondition`.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    settings: FirestoreSettings,
    queue: AsyncQueue,
    persistence: PersistenceArc,
    local_store: Arc<LocalStore>,
    sync_engine: Arc<SyncEngine>,
    remote_store: RemoteStore,
    event_manager: Arc<EventManager>,
    terminated: AtomicBool,
}

impl FirestoreClient {
    /// Opens persistence, restores the local store and starts the network.
    pub async fn new(
        settings: FirestoreSettings,
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
    ) -> FirestoreResult<Self> {
        let persistence: PersistenceArc = match settings.persistence() {
            PersistenceSettings::Memory => Arc::new(MemoryPersistence::new()),
            PersistenceSettings::Durable {
                directory,
                compaction_threshold,
            } => Arc::new(DurablePersistence::open_with_compaction_threshold(
                directory,
                *compaction_threshold,
            )?),
        };
        let serializer = JsonProtoSerializer::new(settings.database_id().clone());
        let queue = AsyncQueue::with_retry_policy(settings.persistence_retry());
        let local_store = Arc::new(LocalStore::new(Arc::clone(&persistence), serializer.clone()));
        let sync_engine = Arc::new(SyncEngine::new(
            Arc::clone(&local_store),
            settings.max_concurrent_limbo_resolutions(),
        ));

        let network = NetworkLayer::builder(datastore, token_provider)
            .with_backoff(settings.stream_backoff())
            .build();
        let remote_store = RemoteStore::new(
            network,
            serializer,
            Arc::clone(&sync_engine) as Arc<dyn RemoteSyncer>,
            queue.clone(),
            RemoteStoreOptions {
                max_pending_writes: settings.max_pending_writes(),
                online_state_timeout: settings.online_state_timeout(),
            },
        );
        sync_engine.set_remote_store(remote_store.clone());
        let event_manager = Arc::new(EventManager::new());
        sync_engine.set_listener(Arc::clone(&event_manager) as Arc<dyn SyncEngineListener>);

        let store = Arc::clone(&local_store);
        queue
            .enqueue_retryable("Start local store", move || {
                let store = Arc::clone(&store);
                async move { store.start().await }
            })
            .await?;
        let remote = remote_store.clone();
        queue.enqueue(async move { remote.start().await }).await?;
        log::debug!("client for {} started", settings.database_id().database_name());

        Ok(Self {
            inner: Arc::new(ClientInner {
                settings,
                queue,
                persistence,
                local_store,
                sync_engine,
                remote_store,
                event_manager,
                terminated: AtomicBool::new(false),
            }),
        })
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.inner.settings
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.inner.terminated.load(Ordering::SeqCst) {
            return Err(failed_precondition("The client has already been terminated."));
        }
        Ok(())
    }

    /// Calls `observer` with the query's snapshots until the returned
    /// registration is detached or dropped.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: QueryObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        self.verify_not_terminated()?;
        let active = Arc::new(AtomicBool::new(true));
        let event_manager = Arc::clone(&self.inner.event_manager);
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        let listened = query.clone();
        let listener_active = Arc::clone(&active);
        let id = self
            .inner
            .queue
            .enqueue(async move {
                event_manager
                    .listen(&sync_engine, listened, options, observer, listener_active)
                    .await
            })
            .await?;
        Ok(ListenerRegistration {
            client: self.clone(),
            query,
            id: Some(id),
            active,
        })
    }

    /// Applies `mutations` as one batch. Resolves once the backend acknowledged
    /// the batch and fails with the rejection error otherwise.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        if mutations.is_empty() {
            return Ok(());
        }
        let (callback, result) = async_channel::bounded(1);
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { sync_engine.write(mutations, callback).await })
            .await?;
        result
            .recv()
            .await
            .map_err(|_| cancelled("write was abandoned before it completed"))?
    }

    /// Reads `key` from the local cache, including pending local writes.
    pub async fn get_document(&self, key: &DocumentKey) -> FirestoreResult<DocumentSnapshot> {
        self.verify_not_terminated()?;
        let local_store = Arc::clone(&self.inner.local_store);
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        let key = key.clone();
        self.inner
            .queue
            .enqueue_retryable("Read document", move || {
                let local_store = Arc::clone(&local_store);
                let sync_engine = Arc::clone(&sync_engine);
                let key = key.clone();
                async move {
                    let document = local_store.read_document(&key).await?;
                    let has_pending_writes = document.has_local_mutations();
                    let from_cache = !sync_engine.is_document_synced(&key);
                    Ok(DocumentSnapshot {
                        document: document.is_found_document().then_some(document),
                        key,
                        from_cache,
                        has_pending_writes,
                    })
                }
            })
            .await
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        self.verify_not_terminated()?;
        let local_store = Arc::clone(&self.inner.local_store);
        let query = query.clone();
        self.inner
            .queue
            .enqueue_retryable("Execute query", move || {
                let local_store = Arc::clone(&local_store);
                let query = query.clone();
                async move {
                    let result = local_store.execute_query(&query, true).await?;
                    let mut view = View::new(query, result.remote_keys);
                    let changes = view.compute_doc_changes(&result.documents, None);
                    let not_current =
                        TargetChange::create_synthesized_target_change_for_current_change(false, Vec::new());
                    view.apply_changes(changes, false, Some(&not_current), false)
                        .snapshot
                        .ok_or_else(|| assertion_failure("cache query produced no snapshot"))
                }
            })
            .await
    }

    /// Resolves once every write queued before the call was acknowledged or
    /// rejected. Does not resolve while offline.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let (callback, result) = async_channel::bounded(1);
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { sync_engine.register_pending_writes_callback(callback).await })
            .await?;
        result
            .recv()
            .await
            .map_err(|_| cancelled("pending writes wait was abandoned"))?
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move { remote_store.enable_network().await })
            .await
    }

    /// Stops both streams. Listeners are raised from cache and writes stay
    /// queued until [`enable_network`](Self::enable_network).
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move { remote_store.disable_network().await })
            .await
    }

    /// Restarts the streams after the credentials behind the token provider
    /// changed.
    pub async fn handle_credential_change(&self) -> FirestoreResult<()> {
        self.verify_not_terminated()?;
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move { remote_store.handle_credential_change().await })
            .await
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.event_manager.online_state()
    }

    /// Stops the network, fails outstanding write callbacks and closes
    /// persistence. Calling it again does nothing.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let remote_store = self.inner.remote_store.clone();
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        let persistence = Arc::clone(&self.inner.persistence);
        self.inner
            .queue
            .enqueue_and_initiate_shutdown(async move {
                remote_store.shutdown().await?;
                sync_engine.shutdown();
                persistence.shutdown().await
            })
            .await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }
}

/// Keeps a query listen alive. Detaching or dropping it stops notifications
/// right away and releases the listen on the queue.
pub struct ListenerRegistration {
    client: FirestoreClient,
    query: Query,
    id: Option<u64>,
    active: Arc<AtomicBool>,
}

impl ListenerRegistration {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn detach(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        self.active.store(false, Ordering::SeqCst);
        if self.client.is_terminated() {
            return;
        }
        let event_manager = Arc::clone(&self.client.inner.event_manager);
        let sync_engine = Arc::clone(&self.client.inner.sync_engine);
        let query = self.query.clone();
        self.client.inner.queue.enqueue_and_forget(async move {
            if let Err(err) = event_manager.unlisten(&sync_engine, &query, id).await {
                log::warn!("failed to unlisten {}: {err}", query.canonical_id());
            }
        });
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove();
    }
}
