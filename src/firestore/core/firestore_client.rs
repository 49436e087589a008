use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio::sync::oneshot;

use crate::firestore::core::event_manager::{
    EventManager, ListenOptions, QueryListener, SnapshotObserver, SnapshotsInSyncObserver,
};
use crate::firestore::core::sync_engine::SyncEngine;
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::core::{FirestoreSettings, PersistenceSettings, Query, User};
use crate::firestore::error::{cancelled, unavailable, FirestoreResult};
use crate::firestore::local::{
    DurableOptions, LocalStore, LruGarbageCollector, LruScheduler, MemorySharedClientState,
    MultiClientSharedClientState, Persistence, QueryEngine, SharedClientState,
    SharedClientStateSyncer, SharedStateBus,
};
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation};
use crate::firestore::remote::{Connection, Datastore, RemoteStore, RemoteSyncer, TokenProviderArc};
use crate::firestore::util::AsyncQueue;

const LOG_TARGET: &str = "FirestoreClient";

/// Everything needed to assemble a [`FirestoreClient`].
#[derive(Clone)]
pub struct ComponentConfiguration {
    pub settings: FirestoreSettings,
    pub connection: Arc<dyn Connection>,
    pub credentials: TokenProviderArc,
    pub initial_user: User,
    /// Fixed client id for durable persistence; generated when `None`.
    pub client_id: Option<String>,
    /// Medium shared with the other clients of the same durable store.
    /// Only used with `synchronize_tabs`.
    pub shared_state_bus: Option<Arc<SharedStateBus>>,
}

impl ComponentConfiguration {
    pub fn new(settings: FirestoreSettings, connection: Arc<dyn Connection>, credentials: TokenProviderArc) -> Self {
        Self {
            settings,
            connection,
            credentials,
            initial_user: User::unauthenticated(),
            client_id: None,
            shared_state_bus: None,
        }
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.initial_user = user;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_shared_state_bus(mut self, bus: Arc<SharedStateBus>) -> Self {
        self.shared_state_bus = Some(bus);
        self
    }
}

/// One client instance: persistence, local and remote stores, the sync
/// engine and the event manager, all driven by a single [`AsyncQueue`].
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<FirestoreClientInner>,
}

struct FirestoreClientInner {
    queue: AsyncQueue,
    persistence: Arc<Persistence>,
    shared_client_state: Arc<dyn SharedClientState>,
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    gc_scheduler: Option<Arc<LruScheduler>>,
}

impl FirestoreClient {
    pub async fn new(
        settings: FirestoreSettings,
        connection: Arc<dyn Connection>,
        credentials: TokenProviderArc,
    ) -> FirestoreResult<Self> {
        Self::from_configuration(ComponentConfiguration::new(settings, connection, credentials)).await
    }

    /// Builds the component graph and starts it on a fresh queue.
    pub async fn from_configuration(config: ComponentConfiguration) -> FirestoreResult<Self> {
        let ComponentConfiguration {
            settings,
            connection,
            credentials,
            initial_user,
            client_id,
            shared_state_bus,
        } = config;
        let queue = AsyncQueue::new();

        let (persistence, synchronize_tabs) = match &settings.persistence {
            PersistenceSettings::Memory => (Persistence::memory(), false),
            PersistenceSettings::Durable { path, synchronize_tabs } => {
                let options = DurableOptions {
                    client_id,
                    lru_params: settings.lru_params(),
                    allow_tab_synchronization: *synchronize_tabs,
                };
                (Persistence::durable(path, options)?, *synchronize_tabs)
            }
        };

        let shared_client_state: Arc<dyn SharedClientState> = if synchronize_tabs {
            Arc::new(MultiClientSharedClientState::new(
                shared_state_bus.unwrap_or_else(SharedStateBus::new),
                queue.clone(),
                persistence.client_id(),
                initial_user.clone(),
            ))
        } else {
            Arc::new(MemorySharedClientState::new())
        };

        let local_store = LocalStore::new(Arc::clone(&persistence), QueryEngine::new(), initial_user.clone());
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            Datastore::new(connection, credentials),
            queue.clone(),
            settings.backoff,
        );
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            Arc::clone(&shared_client_state),
            initial_user,
            settings.max_concurrent_limbo_resolutions,
        );
        let weak_engine: Weak<SyncEngine> = Arc::downgrade(&sync_engine);
        let remote_syncer: Weak<dyn RemoteSyncer> = weak_engine.clone();
        remote_store.set_syncer(remote_syncer);
        let shared_syncer: Weak<dyn SharedClientStateSyncer> = weak_engine;
        shared_client_state.set_syncer(shared_syncer);
        let event_manager = EventManager::new(Arc::clone(&sync_engine));
        let gc_scheduler = persistence.is_durable().then(|| {
            LruScheduler::new(
                LruGarbageCollector::new(settings.lru_params()),
                queue.clone(),
                &local_store,
            )
        });

        let client = Self {
            inner: Arc::new(FirestoreClientInner {
                queue,
                persistence,
                shared_client_state,
                local_store,
                remote_store,
                sync_engine,
                event_manager,
                gc_scheduler,
            }),
        };
        client.start().await?;
        Ok(client)
    }

    async fn start(&self) -> FirestoreResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue(async move {
                inner.persistence.start(&inner.queue)?;
                inner.local_store.start()?;
                inner.shared_client_state.start()?;
                inner
                    .sync_engine
                    .apply_primary_state(inner.persistence.is_primary())
                    .await?;

                let engine = Arc::downgrade(&inner.sync_engine);
                inner.persistence.set_primary_state_listener(Arc::new(move |is_primary| {
                    let engine = engine.clone();
                    async move {
                        match engine.upgrade() {
                            Some(engine) => engine.apply_primary_state(is_primary).await,
                            None => Ok(()),
                        }
                    }
                    .boxed()
                }));
                if let Some(scheduler) = &inner.gc_scheduler {
                    scheduler.start();
                }
                log::debug!(target: LOG_TARGET, "client {} started", inner.persistence.client_id());
                Ok(())
            })
            .await
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    pub fn client_id(&self) -> &str {
        self.inner.persistence.client_id()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.queue.is_shutting_down()
    }

    /// Starts a listener on `query`; snapshots and errors go to `observer`.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> FirestoreResult<Arc<QueryListener>> {
        let listener = QueryListener::new(query, options, observer);
        let event_manager = Arc::clone(&self.inner.event_manager);
        let registered = Arc::clone(&listener);
        self.inner
            .queue
            .enqueue(async move { event_manager.listen(registered).await })
            .await?;
        Ok(listener)
    }

    pub async fn unlisten(&self, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let event_manager = Arc::clone(&self.inner.event_manager);
        self.inner
            .queue
            .enqueue(async move { event_manager.unlisten(&listener).await })
            .await
    }

    pub async fn add_snapshots_in_sync_listener(&self, observer: SnapshotsInSyncObserver) -> FirestoreResult<()> {
        let event_manager = Arc::clone(&self.inner.event_manager);
        self.inner
            .queue
            .enqueue(async move {
                event_manager.add_snapshots_in_sync_listener(observer);
                Ok(())
            })
            .await
    }

    pub async fn remove_snapshots_in_sync_listener(&self, observer: SnapshotsInSyncObserver) -> FirestoreResult<()> {
        let event_manager = Arc::clone(&self.inner.event_manager);
        self.inner
            .queue
            .enqueue(async move {
                event_manager.remove_snapshots_in_sync_listener(&observer);
                Ok(())
            })
            .await
    }

    /// Applies `mutations` as one batch. Resolves once the backend accepted
    /// the batch, or fails with its rejection.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { sync_engine.write(mutations, sender).await })
            .await?;
        receiver
            .await
            .unwrap_or_else(|_| Err(cancelled("The write was dropped before it completed")))
    }

    /// Resolves once every write issued so far was acknowledged or
    /// rejected by the backend.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        self.inner
            .queue
            .enqueue(async move { sync_engine.register_pending_writes_callback(sender).await })
            .await?;
        receiver
            .await
            .unwrap_or_else(|_| Err(cancelled("Waiting for pending writes was interrupted")))
    }

    /// The cached state of `key`, `None` when the cache knows it does not
    /// exist.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<Option<MutableDocument>> {
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue(async move {
                let document = local_store.read_document(&key)?;
                if document.is_found_document() {
                    Ok(Some(document))
                } else if document.is_no_document() {
                    Ok(None)
                } else {
                    Err(unavailable(
                        "Failed to get document from cache. (However, this document may exist on the server.)",
                    ))
                }
            })
            .await
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue(async move {
                let query_result = local_store.execute_query(&query, true)?;
                let mut view = View::new(query, query_result.remote_keys);
                let doc_changes = view.compute_doc_changes(&query_result.documents, None)?;
                let view_change = view.apply_changes(doc_changes, false, None, false);
                Ok(view_change
                    .snapshot
                    .unwrap_or_else(|| view.compute_initial_snapshot()))
            })
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue(async move {
                inner.persistence.set_network_enabled(true)?;
                inner.remote_store.enable_network().await
            })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue(async move {
                inner.persistence.set_network_enabled(false)?;
                inner.remote_store.disable_network().await
            })
            .await
    }

    /// Switches to `user`: pending writes of the previous user are hidden
    /// and the streams reconnect with the new credentials.
    pub async fn set_user(&self, user: User) -> FirestoreResult<()> {
        let remote_store = self.inner.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move { remote_store.handle_credential_change(user).await })
            .await
    }

    /// Stops the client for good. Later calls fail with `Cancelled`.
    pub async fn shutdown(&self) -> FirestoreResult<()> {
        self.inner.queue.enter_restricted_mode();
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue_even_while_restricted(async move {
                inner.remote_store.shutdown().await?;
                if let Some(scheduler) = &inner.gc_scheduler {
                    scheduler.stop();
                }
                inner.shared_client_state.shutdown();
                inner.persistence.shutdown()?;
                log::debug!(target: LOG_TARGET, "client {} terminated", inner.persistence.client_id());
                Ok(())
            })
            .await
    }
}
