//! Local persistence and the local store built on top of it.
//!
//! Everything in here runs inside synchronous persistence transactions; no
//! future is ever awaited while a transaction is open.

mod bundle_cache;
pub(crate) mod encoded;
mod index_manager;
pub mod kv;
mod local_documents_view;
mod local_store;
mod lru_garbage_collector;
mod mutation_queue;
pub(crate) mod persistence;
mod query_engine;
mod reference_delegate;
mod reference_set;
mod remote_document_cache;
mod shared_client_state;
pub mod sqlite;
pub(crate) mod target_cache;
mod target_data;

#[doc(inline)]
pub use bundle_cache::{BundleCache, BundleMetadata, NamedQuery};
#[doc(inline)]
pub use index_manager::IndexManager;
#[doc(inline)]
pub use kv::{KvStore, KvTransaction, MemoryKvStore};
#[doc(inline)]
pub use local_documents_view::LocalDocumentsView;
#[doc(inline)]
pub use local_store::{
    DocumentMap, LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult,
};
#[doc(inline)]
pub use lru_garbage_collector::{LruGarbageCollector, LruResults, LruScheduler};
#[doc(inline)]
pub use mutation_queue::MutationQueue;
#[doc(inline)]
pub use persistence::{
    generate_client_id, ClientMetadata, DurableOptions, Persistence, PersistenceTransaction,
    PrimaryStateListener, TransactionMode,
};
#[doc(inline)]
pub use query_engine::QueryEngine;
#[doc(inline)]
pub use reference_delegate::ReferenceDelegate;
#[doc(inline)]
pub use reference_set::ReferenceSet;
#[doc(inline)]
pub use remote_document_cache::{RemoteDocumentCache, RemoteDocumentChangeBuffer};
#[doc(inline)]
pub use shared_client_state::{
    ClientStateEvent, MemorySharedClientState, MultiClientSharedClientState, MutationBatchState,
    QueryTargetState, SharedClientState, SharedClientStateSyncer, SharedStateBus,
};
#[doc(inline)]
pub use sqlite::SqliteKvStore;
#[doc(inline)]
pub use target_cache::{TargetCache, TargetGlobal};
#[doc(inline)]
pub use target_data::{TargetData, TargetPurpose};
