//! Connection to the remote authority: the multiplexed transport, the
//! listen and write streams, and the aggregation of listen changes into
//! remote events.

pub mod datastore;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use datastore::{
    NoopTokenProvider, StreamCredentials, StreamHandle, StreamingDatastore, StreamingDatastoreImpl,
    TokenProvider, TokenProviderArc,
};
pub use online_state_tracker::{OnlineStateHandler, OnlineStateTracker};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use serializer::{JsonSerializer, WriteResponse};
pub use stream::{
    InMemoryTransport, MultiplexedConnection, MultiplexedStream, OpenRequest, StreamKind, StreamTransport,
};
pub use watch_change::{
    encode_watch_change, BloomFilterPayload, DocumentWatchChange, ExistenceFilterChange, WatchChange,
    WatchTargetChange, WatchTargetChangeState,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
