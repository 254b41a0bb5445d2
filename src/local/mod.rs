//! Local persistence: the mutation queue, overlays, the remote document and
//! target caches, and the [`LocalStore`] that composes them.

mod index_manager;
mod local_documents_view;
pub mod local_serializer;
mod local_store;
mod mutation_queue;
mod overlay_cache;
pub mod persistence;
mod query_engine;
mod remote_document_cache;
mod target_cache;
mod target_data;

pub use index_manager::IndexManager;
pub use local_documents_view::LocalDocumentsView;
pub use local_serializer::LocalSerializer;
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
pub use mutation_queue::MutationQueue;
pub use overlay_cache::{DocumentOverlayCache, OverlayMap};
pub use persistence::{
    DurablePersistence, MemoryPersistence, Persistence, PersistenceArc, PersistenceTransaction, StoreName,
};
pub use query_engine::QueryEngine;
pub use remote_document_cache::{RemoteDocumentCache, RemoteDocumentChangeBuffer};
pub use target_cache::TargetCache;
pub use target_data::{TargetData, TargetPurpose};
