//! The client core: queries, views, the sync engine that reconciles local and
//! remote state, and the [`FirestoreClient`] handle that owns it all.

mod event_manager;
mod firestore_client;
mod query;
pub mod settings;
mod sync_engine;
mod view;
mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, QueryObserver};
pub use firestore_client::{DocumentSnapshot, FirestoreClient, ListenerRegistration};
pub use query::{Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query, Target};
pub use settings::{FirestoreSettings, PersistenceSettings};
pub use sync_engine::{SyncEngine, SyncEngineListener, WriteCallback};
pub use view::{LimboDocumentChange, SyncState, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentSet, DocumentViewChange, ViewSnapshot};
