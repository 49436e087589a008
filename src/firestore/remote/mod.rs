//! Everything that talks to the backend: the two persistent streams, the
//! aggregation of watch changes into remote events and the write pipeline.

pub mod datastore;
mod online_state_tracker;
mod remote_event;
mod remote_store;
mod remote_syncer;
pub mod stream;
pub mod streams;
mod watch_change;
mod watch_change_aggregator;

pub use datastore::{
    Connection, Datastore, InMemoryConnection, ListenRequest, ListenResponse, MockBackend,
    StaticTokenProvider, TokenProviderArc, WriteRequest, WriteResponse,
};
pub use online_state_tracker::{OnlineStateHandler, OnlineStateTracker};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, MAX_PENDING_WRITES};
pub use remote_syncer::RemoteSyncer;
pub use watch_change::{
    DocumentChange, ExistenceFilterChange, TargetChangeState, WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
