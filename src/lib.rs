//! A local-first document store client.
//!
//! Writes apply to a local cache immediately and are sent to the backend in
//! order over a write stream. Query listeners are served from the cache and
//! kept in sync through a watch stream; documents whose state the client can
//! no longer prove are resolved individually ("limbo" resolution).
//!
//! The entry point is [`core::FirestoreClient`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use firestore_sync::core::{FirestoreClient, FirestoreSettings, ListenOptions, Query, ViewSnapshot};
//! use firestore_sync::error::FirestoreResult;
//! use firestore_sync::model::DatabaseId;
//! use firestore_sync::remote::{InMemoryTransport, MultiplexedConnection, NoopTokenProvider, StreamingDatastoreImpl};
//!
//! # async fn run() -> FirestoreResult<()> {
//! let (transport, _backend) = InMemoryTransport::pair();
//! let connection = Arc::new(MultiplexedConnection::new(transport));
//! let datastore = Arc::new(StreamingDatastoreImpl::new(connection));
//! let settings = FirestoreSettings::new(DatabaseId::default("demo-project"));
//! let client = FirestoreClient::new(settings, datastore, Arc::new(NoopTokenProvider)).await?;
//!
//! let registration = client
//!     .listen(
//!         Query::collection("rooms")?,
//!         ListenOptions::default(),
//!         Arc::new(|snapshot: FirestoreResult<ViewSnapshot>| {
//!             println!("{:?}", snapshot.map(|s| s.docs.len()))
//!         }),
//!     )
//!     .await?;
//! registration.detach();
//! client.shutdown().await
//! # }
//! ```

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;
pub mod util;
pub mod value;
