mod document_set;
mod event_manager;
mod filter;
mod firestore_client;
mod listen_sequence;
mod online_state;
mod query;
pub mod settings;
mod sync_engine;
mod target;
mod target_id_generator;
mod user;
mod view;
mod view_snapshot;

pub use document_set::DocumentSet;
pub use event_manager::{
    EventManager, ListenOptions, QueryListener, SnapshotObserver, SnapshotsInSyncObserver,
};
pub use filter::{Bound, CompositeOperator, Direction, FieldFilter, Filter, Operator, OrderBy};
pub(crate) use filter::field_value;
pub use firestore_client::{ComponentConfiguration, FirestoreClient};
pub use listen_sequence::{ListenSequence, INVALID_SEQUENCE_NUMBER};
pub use online_state::{OnlineState, OnlineStateSource};
pub use query::{DocumentComparator, LimitType, Query};
pub use settings::{
    BackoffSettings, FirestoreSettings, LruParams, PersistenceSettings, CACHE_SIZE_UNLIMITED,
};
pub use sync_engine::{SyncEngine, SyncEngineListener, WriteCallback};
pub use target::Target;
pub use target_id_generator::TargetIdGenerator;
pub use user::User;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot};
