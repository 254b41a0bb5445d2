//! The remote half of the client: wire serialization, the multiplexed stream
//! transport, the watch and write streams, and the [`RemoteStore`] that drives
//! them.

pub mod bloom_filter;
pub mod datastore;
pub mod network;
mod online_state_tracker;
mod remote_event;
mod remote_store;
mod remote_syncer;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod watch_change;
mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use datastore::{
    NoopTokenProvider, StreamHandle, StreamingDatastore, StreamingDatastoreImpl, TokenProvider, TokenProviderArc,
};
pub use network::{NetworkLayer, NetworkLayerBuilder};
pub use online_state_tracker::{OnlineState, OnlineStateTracker};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, RemoteStoreOptions, DEFAULT_MAX_PENDING_WRITES, DEFAULT_ONLINE_STATE_TIMEOUT};
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use serializer::JsonProtoSerializer;
pub use stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamTransport};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
