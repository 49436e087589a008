use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::core::{
    OnlineState, OnlineStateSource, Query, Target, TargetIdGenerator, User, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    DocumentMap, LocalStore, LocalViewChanges, MutationBatchState, QueryTargetState, ReferenceSet,
    SharedClientState, SharedClientStateSyncer, TargetData, TargetPurpose,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatchResult, SnapshotVersion, TargetId,
    Timestamp, BATCHID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, RemoteStore, RemoteSyncer, TargetChange};
use crate::firestore::util::async_queue::lock;
use crate::util::hard_assert;

const LOG_TARGET: &str = "SyncEngine";

/// Completion of a user write or of a wait for pending writes.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

/// Receiver of the snapshots the sync engine raises. Implemented by the
/// event manager; calls are synchronous and never re-enter the engine.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The listen for `query` failed for good.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// An outstanding single-document listen for a key in limbo.
struct LimboResolution {
    key: DocumentKey,
    /// Set once watch reported the document in the limbo target; until then
    /// the target's remote keys are empty.
    received_document: bool,
}

struct SyncEngineState {
    /// Views keyed by the canonical id of their query.
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Keys waiting for a free limbo resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    enqueued_limbo_keys: BTreeSet<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views hold which limbo keys.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    /// Completion of each pending write, per user.
    mutation_user_callbacks: HashMap<String, BTreeMap<BatchId, WriteCallback>>,
    /// Waiters keyed by the highest batch that was pending when they
    /// registered.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    online_state: OnlineState,
    is_primary: Option<bool>,
    current_user: User,
    /// Targets whose entry in the published remote keys is out of date.
    stale_remote_keys: BTreeSet<TargetId>,
}

impl SyncEngineState {
    fn is_primary_client(&self) -> bool {
        self.is_primary == Some(true)
    }

    fn mark_remote_keys_stale(&mut self, target_id: TargetId) {
        self.stale_remote_keys.insert(target_id);
    }
}

/// Glue between the local store, the remote store and the views.
///
/// Owns one [`View`] per active query, applies remote events and write
/// results to the local store and raises the resulting snapshots to its
/// [`SyncEngineListener`]. Also tracks limbo documents and resolves them
/// with dedicated single-document targets.
///
/// Every method runs on the client's async queue.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: RemoteStore,
    shared_client_state: Arc<dyn SharedClientState>,
    max_concurrent_limbo_resolutions: usize,
    listener: StdMutex<Option<Weak<dyn SyncEngineListener>>>,
    /// Per-target keys as of the last raised snapshot, readable without
    /// the async lock.
    remote_keys: StdMutex<BTreeMap<TargetId, BTreeSet<DocumentKey>>>,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: RemoteStore,
        shared_client_state: Arc<dyn SharedClientState>,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_store,
            remote_store,
            shared_client_state,
            max_concurrent_limbo_resolutions,
            listener: StdMutex::new(None),
            remote_keys: StdMutex::new(BTreeMap::new()),
            state: Mutex::new(SyncEngineState {
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                enqueued_limbo_keys: BTreeSet::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                mutation_user_callbacks: HashMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                online_state: OnlineState::Unknown,
                is_primary: None,
                current_user,
                stale_remote_keys: BTreeSet::new(),
            }),
        })
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *lock(&self.listener) = Some(listener);
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        lock(&self.listener).as_ref().and_then(Weak::upgrade)
    }

    fn raise_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        if let Some(listener) = self.listener() {
            listener.on_watch_change(snapshots);
        }
    }

    /// Starts watching `query` and returns its first snapshot, computed
    /// from the cache.
    pub async fn listen(&self, query: Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let mut state = self.state.lock().await;
        if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
            // another client may have registered the same query
            self.shared_client_state
                .add_local_query_target(query_view.target_id, true);
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let status = self
            .shared_client_state
            .add_local_query_target(target_data.target_id, should_listen_to_remote);
        let snapshot = self
            .initialize_view_and_compute_snapshot(
                &mut state,
                query,
                target_data.target_id,
                status == QueryTargetState::Current,
                target_data.resume_token.clone(),
            )
            .await?;
        self.publish_remote_keys(&mut state);
        if should_listen_to_remote && state.is_primary_client() {
            self.remote_store.listen(target_data).await?;
        }
        Ok(snapshot)
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        state: &mut SyncEngineState,
        query: Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys.clone());
        let doc_changes = view.compute_doc_changes(&query_result.documents, None)?;
        let synthesized = TargetChange::synthesized_for_current_change(current, resume_token);
        let view_change = view.apply_changes(doc_changes, state.is_primary_client(), Some(&synthesized), false);
        self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
            .await?;

        let snapshot = view_change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot());
        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        state.mark_remote_keys_stale(target_id);
        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query,
                target_id,
                view,
            },
        );
        Ok(snapshot)
    }

    /// Stops watching `query`. The target is released once no query and no
    /// other client uses it.
    pub async fn unlisten(&self, query: &Query, should_unlisten_from_remote: bool) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let canonical_id = query.canonical_id();
        let Some(target_id) = state.query_views.get(&canonical_id).map(|view| view.target_id) else {
            return Err(internal_error(format!("Trying to unlisten on query not found: {canonical_id}")));
        };

        let shared = state
            .queries_by_target
            .get(&target_id)
            .map(|queries| queries.len() > 1)
            .unwrap_or(false);
        if shared {
            if let Some(queries) = state.queries_by_target.get_mut(&target_id) {
                queries.retain(|other| other.canonical_id() != canonical_id);
            }
            state.query_views.remove(&canonical_id);
            state.mark_remote_keys_stale(target_id);
            self.publish_remote_keys(&mut state);
            return Ok(());
        }

        if state.is_primary_client() {
            self.shared_client_state.remove_local_query_target(target_id);
            if !self.shared_client_state.is_active_query_target(target_id) {
                match self.local_store.release_target(target_id, false) {
                    Ok(()) => {
                        self.shared_client_state.clear_query_state(target_id);
                        if should_unlisten_from_remote {
                            self.remote_store.unlisten(target_id).await?;
                        }
                        self.remove_and_cleanup_target(&mut state, target_id, None)
                            .await?;
                    }
                    Err(err) => ignore_if_primary_lease_loss(err)?,
                }
            }
        } else {
            self.remove_and_cleanup_target(&mut state, target_id, None)
                .await?;
            self.local_store.release_target(target_id, true)?;
        }
        self.publish_remote_keys(&mut state);
        Ok(())
    }

    /// Applies `mutations` locally, raises the optimistic snapshots and
    /// hands the batch to the write pipeline. `callback` resolves once the
    /// backend accepted or rejected the batch.
    pub async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let result = match self.local_store.write_locally(mutations, Timestamp::now()) {
            Ok(result) => result,
            Err(err) => {
                log::warn!(target: LOG_TARGET, "Failed to persist write: {err}");
                let _ = callback.send(Err(err));
                return Ok(());
            }
        };
        self.shared_client_state.add_pending_mutation(result.batch_id);
        let user_key = state.current_user.to_key().to_string();
        state
            .mutation_user_callbacks
            .entry(user_key)
            .or_default()
            .insert(result.batch_id, callback);
        self.emit_new_snaps_and_notify_local_store(&mut state, &result.changes, None)
            .await?;
        self.publish_remote_keys(&mut state);
        self.remote_store.fill_write_pipeline().await
    }

    /// Resolves `callback` once every write pending right now has been
    /// acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self, callback: WriteCallback) -> FirestoreResult<()> {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                target: LOG_TARGET,
                "The network is disabled. Waiting for pending writes will not complete until the network is enabled."
            );
        }
        let highest = match self.local_store.get_highest_unacknowledged_batch_id() {
            Ok(highest) => highest,
            Err(err) => {
                let _ = callback.send(Err(err));
                return Ok(());
            }
        };
        if highest == BATCHID_UNKNOWN {
            let _ = callback.send(Ok(()));
            return Ok(());
        }
        self.state
            .lock()
            .await
            .pending_writes_callbacks
            .entry(highest)
            .or_default()
            .push(callback);
        Ok(())
    }

    /// Takes over or hands off the network and the views' limbo tracking.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if is_primary && state.is_primary != Some(true) {
            log::debug!(target: LOG_TARGET, "Becoming primary client");
            let active_targets: Vec<TargetId> = self
                .shared_client_state
                .get_all_active_query_targets()
                .into_iter()
                .collect();
            let active_queries = self
                .synchronize_query_views_and_raise_snapshots(&mut state, &active_targets, true)
                .await?;
            state.is_primary = Some(true);
            self.publish_remote_keys(&mut state);
            self.remote_store.apply_primary_state(true).await?;
            for target_data in active_queries {
                self.remote_store.listen(target_data).await?;
            }
        } else if !is_primary && state.is_primary != Some(false) {
            log::debug!(target: LOG_TARGET, "Becoming secondary client");
            let mut active_targets = Vec::new();
            let target_ids: Vec<TargetId> = state.queries_by_target.keys().copied().collect();
            for target_id in target_ids {
                if self.shared_client_state.is_local_query_target(target_id) {
                    active_targets.push(target_id);
                } else {
                    self.remove_and_cleanup_target(&mut state, target_id, None)
                        .await?;
                    self.local_store.release_target(target_id, true)?;
                }
                self.remote_store.unlisten(target_id).await?;
            }
            self.synchronize_query_views_and_raise_snapshots(&mut state, &active_targets, false)
                .await?;
            self.reset_limbo_documents(&mut state).await?;
            state.is_primary = Some(false);
            self.publish_remote_keys(&mut state);
            self.remote_store.apply_primary_state(false).await?;
        }
        Ok(())
    }

    /// Keys currently being resolved, mapped to their limbo target.
    pub async fn get_active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.state.lock().await.active_limbo_targets_by_key.clone()
    }

    /// Keys waiting for a resolution slot, oldest first.
    pub async fn get_enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.state
            .lock()
            .await
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    async fn synchronize_query_views_and_raise_snapshots(
        &self,
        state: &mut SyncEngineState,
        targets: &[TargetId],
        transition_to_primary: bool,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active_queries = Vec::new();
        let mut snapshots = Vec::new();
        for &target_id in targets {
            let queries = state
                .queries_by_target
                .get(&target_id)
                .cloned()
                .unwrap_or_default();
            let target_data = if let Some(first) = queries.first() {
                let target_data = self.local_store.allocate_target(first.to_target())?;
                for query in &queries {
                    let Some(query_view) = state.query_views.get_mut(&query.canonical_id()) else {
                        continue;
                    };
                    let query_result = self.local_store.execute_query(&query_view.query, true)?;
                    let view_change = query_view.view.synchronize_with_persisted_state(query_result)?;
                    state.mark_remote_keys_stale(target_id);
                    if transition_to_primary {
                        self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
                            .await?;
                    }
                    snapshots.extend(view_change.snapshot);
                }
                target_data
            } else {
                let target = self.cached_target(target_id)?;
                let target_data = self.local_store.allocate_target(target.clone())?;
                self.initialize_view_and_compute_snapshot(
                    state,
                    Query::from_target(&target),
                    target_id,
                    false,
                    target_data.resume_token.clone(),
                )
                .await?;
                target_data
            };
            active_queries.push(target_data);
        }
        self.raise_snapshots(snapshots);
        Ok(active_queries)
    }

    fn cached_target(&self, target_id: TargetId) -> FirestoreResult<Target> {
        self.local_store
            .get_cached_target_by_id(target_id)?
            .ok_or_else(|| internal_error(format!("No cached target for id {target_id}")))
    }

    async fn reset_limbo_documents(&self, state: &mut SyncEngineState) -> FirestoreResult<()> {
        let limbo_targets: Vec<TargetId> = state
            .active_limbo_resolutions_by_target
            .keys()
            .copied()
            .collect();
        for target_id in limbo_targets {
            state.mark_remote_keys_stale(target_id);
            self.remote_store.unlisten(target_id).await?;
        }
        state.limbo_document_refs.remove_all_references();
        state.active_limbo_resolutions_by_target.clear();
        state.active_limbo_targets_by_key.clear();
        Ok(())
    }

    async fn apply_remote_event_locked(
        &self,
        state: &mut SyncEngineState,
        event: RemoteEvent,
    ) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            state.stale_remote_keys.insert(*target_id);
            hard_assert(
                change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len() <= 1,
                "Limbo resolution for single document contains multiple changes.",
            );
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "Received change for limbo target document without add.",
                );
            } else if !change.removed_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "Received remove for limbo target document without add.",
                );
                resolution.received_document = false;
            }
        }

        let changes = match self.local_store.apply_remote_event(&event) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(err),
        };
        self.emit_new_snaps_and_notify_local_store(state, &changes, Some(&event))
            .await?;
        self.publish_remote_keys(state);
        Ok(())
    }

    /// Runs every view over `changes`, raises the resulting snapshots and
    /// tells the local store which documents the views now hold.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        state: &mut SyncEngineState,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        if state.query_views.is_empty() {
            return Ok(());
        }
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let canonical_ids: Vec<String> = state.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let is_primary = state.is_primary_client();
            let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                continue;
            };
            let target_id = query_view.target_id;

            let mut doc_changes = query_view.view.compute_doc_changes(changes, None)?;
            if doc_changes.needs_refill {
                // the limit lost a document; the next candidates are only
                // known to the local store
                let query_result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&query_result.documents, Some(doc_changes))?;
            }
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset = remote_event
                .map(|event| event.target_mismatches.contains_key(&target_id))
                .unwrap_or(false);
            let view_change = query_view
                .view
                .apply_changes(doc_changes, is_primary, target_change, pending_reset);
            if target_change.is_some() {
                state.mark_remote_keys_stale(target_id);
            }
            self.update_tracked_limbos(state, target_id, view_change.limbo_changes)
                .await?;

            if is_primary && (view_change.snapshot.is_some() || remote_event.is_some()) {
                let current = match &view_change.snapshot {
                    Some(snapshot) => !snapshot.from_cache,
                    None => target_change.map(|change| change.current).unwrap_or(false),
                };
                let query_state = if current {
                    QueryTargetState::Current
                } else {
                    QueryTargetState::NotCurrent
                };
                self.shared_client_state
                    .update_query_state(target_id, query_state, None);
            }
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(local_view_changes(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        self.raise_snapshots(snapshots);
        self.local_store.notify_local_view_changes(&view_changes)
    }

    async fn update_tracked_limbos(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) -> FirestoreResult<()> {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    state.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(state, key).await?;
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!(
                        target: LOG_TARGET,
                        "Document no longer in limbo: {}",
                        key.path().canonical_string()
                    );
                    state.limbo_document_refs.remove_reference(&key, target_id);
                    if !state.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(state, &key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn track_limbo_change(&self, state: &mut SyncEngineState, key: DocumentKey) -> FirestoreResult<()> {
        if state.active_limbo_targets_by_key.contains_key(&key)
            || state.enqueued_limbo_keys.contains(&key)
        {
            return Ok(());
        }
        log::debug!(
            target: LOG_TARGET,
            "New document in limbo: {}",
            key.path().canonical_string()
        );
        state.enqueued_limbo_keys.insert(key.clone());
        state.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(state).await
    }

    /// Starts limbo listens for queued keys while slots are free.
    async fn pump_enqueued_limbo_resolutions(&self, state: &mut SyncEngineState) -> FirestoreResult<()> {
        while state.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            state.enqueued_limbo_keys.remove(&key);
            let limbo_target_id = state.limbo_target_id_generator.next_id();
            state.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            state
                .active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            state.mark_remote_keys_stale(limbo_target_id);
            let target_data = TargetData::new(
                Query::for_document(&key).to_target(),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            );
            self.publish_remote_keys(state);
            self.remote_store.listen(target_data).await?;
        }
        Ok(())
    }

    async fn remove_limbo_target(&self, state: &mut SyncEngineState, key: &DocumentKey) -> FirestoreResult<()> {
        if state.enqueued_limbo_keys.remove(key) {
            state.enqueued_limbo_resolutions.retain(|queued| queued != key);
        }
        let Some(limbo_target_id) = state.active_limbo_targets_by_key.remove(key) else {
            return Ok(());
        };
        state.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        state.mark_remote_keys_stale(limbo_target_id);
        self.remote_store.unlisten(limbo_target_id).await?;
        self.pump_enqueued_limbo_resolutions(state).await
    }

    async fn remove_and_cleanup_target(
        &self,
        state: &mut SyncEngineState,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        self.shared_client_state.remove_local_query_target(target_id);
        let queries = state.queries_by_target.remove(&target_id).unwrap_or_default();
        state.mark_remote_keys_stale(target_id);
        let listener = self.listener();
        for query in &queries {
            state.query_views.remove(&query.canonical_id());
            if let (Some(error), Some(listener)) = (&error, &listener) {
                listener.on_watch_error(query, error.clone());
            }
        }

        if state.is_primary_client() {
            let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
            for key in limbo_keys {
                if !state.limbo_document_refs.contains_key(&key) {
                    self.remove_limbo_target(state, &key).await?;
                }
            }
        }
        Ok(())
    }

    fn process_user_callback(state: &mut SyncEngineState, batch_id: BatchId, result: FirestoreResult<()>) {
        let user_key = state.current_user.to_key().to_string();
        let callback = state
            .mutation_user_callbacks
            .get_mut(&user_key)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(state: &mut SyncEngineState, batch_id: BatchId) {
        for callback in state
            .pending_writes_callbacks
            .remove(&batch_id)
            .unwrap_or_default()
        {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(state: &mut SyncEngineState, message: &str) {
        for callback in std::mem::take(&mut state.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            let _ = callback.send(Err(cancelled(message)));
        }
    }

    async fn apply_online_state(
        &self,
        state: &mut SyncEngineState,
        online_state: OnlineState,
        source: OnlineStateSource,
    ) {
        let accepted = match source {
            OnlineStateSource::RemoteStore => state.is_primary_client(),
            OnlineStateSource::SharedClientState => !state.is_primary_client(),
        };
        if !accepted {
            return;
        }
        let mut snapshots = Vec::new();
        for query_view in state.query_views.values_mut() {
            let view_change = query_view.view.apply_online_state_change(online_state);
            hard_assert(
                view_change.limbo_changes.is_empty(),
                "OnlineState should not affect limbo documents.",
            );
            snapshots.extend(view_change.snapshot);
        }
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            listener.on_watch_change(snapshots);
        }
        state.online_state = online_state;
        if state.is_primary_client() {
            self.shared_client_state.set_online_state(online_state);
        }
    }

    /// Refreshes the entries of stale targets in the remote keys read by
    /// [`RemoteSyncer::get_remote_keys_for_target`].
    fn publish_remote_keys(&self, state: &mut SyncEngineState) {
        if state.stale_remote_keys.is_empty() {
            return;
        }
        let stale = std::mem::take(&mut state.stale_remote_keys);
        let mut remote_keys = lock(&self.remote_keys);
        for target_id in stale {
            let keys = if let Some(queries) = state.queries_by_target.get(&target_id) {
                let mut keys = BTreeSet::new();
                for query in queries {
                    if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                        keys.extend(query_view.view.synced_documents().iter().cloned());
                    }
                }
                Some(keys)
            } else {
                state
                    .active_limbo_resolutions_by_target
                    .get(&target_id)
                    .map(|resolution| {
                        let mut keys = BTreeSet::new();
                        if resolution.received_document {
                            keys.insert(resolution.key.clone());
                        }
                        keys
                    })
            };
            match keys {
                Some(keys) => {
                    remote_keys.insert(target_id, keys);
                }
                None => {
                    remote_keys.remove(&target_id);
                }
            }
        }
    }
}

#[async_trait]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        self.apply_remote_event_locked(&mut state, event).await
    }

    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected, Some(error.clone()));

        if let Some(resolution) = state.active_limbo_resolutions_by_target.remove(&target_id) {
            state.mark_remote_keys_stale(target_id);
            // The listen for a single document was rejected: treat the
            // document as deleted so the views drop it.
            let limbo_key = resolution.key;
            log::debug!(
                target: LOG_TARGET,
                "Limbo resolution for {} rejected: {error}",
                limbo_key.path().canonical_string()
            );
            state.active_limbo_targets_by_key.remove(&limbo_key);
            self.pump_enqueued_limbo_resolutions(&mut state).await?;

            let mut document_updates = BTreeMap::new();
            document_updates.insert(
                limbo_key.clone(),
                MutableDocument::new_no_document(limbo_key.clone(), SnapshotVersion::min()),
            );
            let event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                document_updates,
                resolved_limbo_documents: [limbo_key].into_iter().collect(),
                ..RemoteEvent::default()
            };
            return self.apply_remote_event_locked(&mut state, event).await;
        }

        match self.local_store.release_target(target_id, false) {
            Ok(()) => {
                self.remove_and_cleanup_target(&mut state, target_id, Some(error))
                    .await?
            }
            Err(err) => ignore_if_primary_lease_loss(err)?,
        }
        self.publish_remote_keys(&mut state);
        Ok(())
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let batch_id = result.batch.batch_id;
        let changes = match self.local_store.acknowledge_batch(&result) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(err),
        };
        // Resolve the user callback before raising snapshots so a snapshot
        // without pending writes never precedes it.
        Self::process_user_callback(&mut state, batch_id, Ok(()));
        Self::trigger_pending_writes_callbacks(&mut state, batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
        self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None)
            .await?;
        self.publish_remote_keys(&mut state);
        Ok(())
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let changes = match self.local_store.reject_batch(batch_id) {
            Ok(changes) => changes,
            Err(err) => return ignore_if_primary_lease_loss(err),
        };
        Self::process_user_callback(&mut state, batch_id, Err(error.clone()));
        Self::trigger_pending_writes_callbacks(&mut state, batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Rejected, Some(error));
        self.emit_new_snaps_and_notify_local_store(&mut state, &changes, None)
            .await?;
        self.publish_remote_keys(&mut state);
        Ok(())
    }

    async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        self.apply_online_state(&mut state, online_state, OnlineStateSource::RemoteStore)
            .await;
        Ok(())
    }

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if state.current_user == user {
            return Ok(());
        }
        log::debug!(target: LOG_TARGET, "User change. New user: {user}");
        let result = self.local_store.handle_user_change(user.clone())?;
        state.current_user = user.clone();
        Self::reject_outstanding_pending_writes_callbacks(
            &mut state,
            "Waiting for pending writes was cancelled by a user change.",
        );
        self.shared_client_state.handle_user_change(
            &user,
            &result.removed_batch_ids,
            &result.added_batch_ids,
        );
        self.emit_new_snaps_and_notify_local_store(&mut state, &result.affected_documents, None)
            .await?;
        self.publish_remote_keys(&mut state);
        Ok(())
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        lock(&self.remote_keys)
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SharedClientStateSyncer for SyncEngine {
    async fn apply_batch_state(
        &self,
        batch_id: BatchId,
        batch_state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let Some(documents) = self.local_store.lookup_mutation_documents(batch_id)? else {
            // the batch was already removed by this client
            log::debug!(target: LOG_TARGET, "Cannot apply mutation batch with id: {batch_id}");
            return Ok(());
        };
        match batch_state {
            MutationBatchState::Pending => {
                // the batch came from a secondary client
                self.remote_store.fill_write_pipeline().await?;
            }
            MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                let result = match error {
                    Some(error) => Err(error),
                    None => Ok(()),
                };
                Self::process_user_callback(&mut state, batch_id, result);
                Self::trigger_pending_writes_callbacks(&mut state, batch_id);
            }
        }
        self.emit_new_snaps_and_notify_local_store(&mut state, &documents, None)
            .await?;
        self.publish_remote_keys(&mut state);
        Ok(())
    }

    async fn apply_target_state(
        &self,
        target_id: TargetId,
        target_state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if state.is_primary_client() {
            log::debug!(target: LOG_TARGET, "Ignoring unexpected query state notification.");
            return Ok(());
        }
        let Some(query) = state
            .queries_by_target
            .get(&target_id)
            .and_then(|queries| queries.first())
            .cloned()
        else {
            return Ok(());
        };
        match target_state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let changes = self
                    .local_store
                    .get_new_document_changes(&query_collection_group(&query))?;
                let event = RemoteEvent::synthesized_for_current_change(
                    target_id,
                    target_state == QueryTargetState::Current,
                    Vec::new(),
                );
                self.emit_new_snaps_and_notify_local_store(&mut state, &changes, Some(&event))
                    .await?;
            }
            QueryTargetState::Rejected => {
                self.local_store.release_target(target_id, true)?;
                self.remove_and_cleanup_target(&mut state, target_id, error)
                    .await?;
            }
        }
        self.publish_remote_keys(&mut state);
        Ok(())
    }

    async fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        if !state.is_primary_client() {
            return Ok(());
        }
        for target_id in added {
            if state.queries_by_target.contains_key(&target_id) {
                log::debug!(target: LOG_TARGET, "Adding an already active target {target_id}");
                continue;
            }
            let target = self.cached_target(target_id)?;
            let target_data = self.local_store.allocate_target(target.clone())?;
            self.initialize_view_and_compute_snapshot(
                &mut state,
                Query::from_target(&target),
                target_data.target_id,
                false,
                target_data.resume_token.clone(),
            )
            .await?;
            self.publish_remote_keys(&mut state);
            self.remote_store.listen(target_data).await?;
        }
        for target_id in removed {
            // only clean up targets this client knows about
            if !state.queries_by_target.contains_key(&target_id) {
                continue;
            }
            match self.local_store.release_target(target_id, false) {
                Ok(()) => {
                    self.remote_store.unlisten(target_id).await?;
                    self.remove_and_cleanup_target(&mut state, target_id, None)
                        .await?;
                }
                Err(err) => ignore_if_primary_lease_loss(err)?,
            }
        }
        self.publish_remote_keys(&mut state);
        Ok(())
    }

    async fn apply_shared_online_state(&self, online_state: OnlineState) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        self.apply_online_state(&mut state, online_state, OnlineStateSource::SharedClientState)
            .await;
        Ok(())
    }
}

fn ignore_if_primary_lease_loss(err: FirestoreError) -> FirestoreResult<()> {
    if err.is_primary_lease_lost() {
        log::debug!(target: LOG_TARGET, "Unexpectedly lost primary lease");
        Ok(())
    } else {
        Err(err)
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = BTreeSet::new();
    let mut removed_keys = BTreeSet::new();
    for change in &snapshot.document_changes {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}

/// Collection group whose documents a query can match.
fn query_collection_group(query: &Query) -> String {
    if let Some(group) = query.collection_group_id() {
        return group.to_string();
    }
    let path = query.path();
    let index = if path.len() % 2 == 1 {
        path.len() - 1
    } else {
        path.len().saturating_sub(2)
    };
    path.segment(index).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::BoxFuture;
    use futures::FutureExt;

    use super::*;
    use crate::firestore::core::BackoffSettings;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::{MemorySharedClientState, Persistence, QueryEngine};
    use crate::firestore::model::{FieldPath, MutationResult, ObjectValue, ResourcePath};
    use crate::firestore::remote::datastore::{
        Datastore, ListenRequest, ListenResponse, MockBackend, StaticTokenProvider, WriteResponse,
    };
    use crate::firestore::remote::{
        DocumentChange, TargetChangeState, WatchChange, WatchTargetChange,
    };
    use crate::firestore::util::AsyncQueue;
    use crate::firestore::value::FirestoreValue;

    #[derive(Default)]
    struct RecordingListener {
        snapshots: StdMutex<Vec<ViewSnapshot>>,
        errors: StdMutex<Vec<(String, FirestoreErrorCode)>>,
        online_states: StdMutex<Vec<OnlineState>>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push((query.canonical_id(), error.code));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        backend: MockBackend,
        local_store: Arc<LocalStore>,
        sync_engine: Arc<SyncEngine>,
        listener: Arc<RecordingListener>,
    }

    fn fixture(max_limbo: usize) -> Fixture {
        let queue = AsyncQueue::new();
        let backend = MockBackend::new();
        let datastore = Datastore::new(backend.connection(), Arc::new(StaticTokenProvider::new(None)));
        let local_store = LocalStore::new(Persistence::memory(), QueryEngine::new(), User::unauthenticated());
        local_store.start().unwrap();
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            datastore,
            queue.clone(),
            BackoffSettings::default(),
        );
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store.clone(),
            Arc::new(MemorySharedClientState::new()),
            User::unauthenticated(),
            max_limbo,
        );
        let syncer: Weak<SyncEngine> = Arc::downgrade(&sync_engine);
        remote_store.set_syncer(syncer);
        let listener = Arc::new(RecordingListener::default());
        let weak: Weak<RecordingListener> = Arc::downgrade(&listener);
        sync_engine.set_listener(weak);
        Fixture {
            queue,
            backend,
            local_store,
            sync_engine,
            listener,
        }
    }

    async fn settle(queue: &AsyncQueue) {
        for _ in 0..8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            queue.drain().await.unwrap();
        }
    }

    async fn run<T, F>(fixture: &Fixture, op: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(Arc<SyncEngine>) -> BoxFuture<'static, FirestoreResult<T>>,
    {
        let result = fixture
            .queue
            .enqueue(op(Arc::clone(&fixture.sync_engine)))
            .await
            .unwrap();
        settle(&fixture.queue).await;
        result
    }

    async fn started(max_limbo: usize) -> Fixture {
        let fixture = fixture(max_limbo);
        run(&fixture, |engine| async move { engine.apply_primary_state(true).await }.boxed()).await;
        fixture
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn data(score: i64) -> ObjectValue {
        let mut value = ObjectValue::empty();
        value.set(&FieldPath::from_segment("score"), FirestoreValue::from_integer(score));
        value
    }

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_segments(["rooms"]))
    }

    fn target_change(state: TargetChangeState, ids: Vec<TargetId>) -> ListenResponse {
        ListenResponse::new(WatchChange::Target(WatchTargetChange::new(state, ids)))
    }

    fn global_snapshot(seconds: i64) -> ListenResponse {
        ListenResponse::at_version(
            WatchChange::Target(WatchTargetChange::new(TargetChangeState::NoChange, vec![])),
            version(seconds),
        )
    }

    fn document(target_id: TargetId, path: &str, seconds: i64, score: i64) -> ListenResponse {
        ListenResponse::new(WatchChange::Document(DocumentChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: vec![],
            key: key(path),
            document: Some(MutableDocument::new_found_document(key(path), version(seconds), data(score))),
        }))
    }

    fn added_target_ids(backend: &MockBackend) -> Vec<TargetData> {
        backend
            .listen_requests()
            .into_iter()
            .filter_map(|request| match request {
                ListenRequest::AddTarget(data) => Some(data),
                ListenRequest::RemoveTarget(_) => None,
            })
            .collect()
    }

    fn last_snapshot(fixture: &Fixture) -> ViewSnapshot {
        fixture.listener.snapshots.lock().unwrap().last().cloned().unwrap()
    }

    #[tokio::test]
    async fn listen_raises_synced_snapshot_once_current() {
        let fixture = started(100).await;
        let initial = run(&fixture, |engine| async move { engine.listen(rooms(), true).await }.boxed()).await;
        assert!(initial.from_cache);
        assert!(initial.documents.is_empty());
        let target_id = added_target_ids(&fixture.backend)[0].target_id;

        fixture.backend.send_listen_response(target_change(TargetChangeState::Added, vec![target_id]));
        fixture.backend.send_listen_response(document(target_id, "rooms/a", 2, 1));
        fixture.backend.send_listen_response(target_change(TargetChangeState::Current, vec![target_id]));
        fixture.backend.send_listen_response(global_snapshot(2));
        settle(&fixture.queue).await;

        let snapshot = last_snapshot(&fixture);
        assert!(!snapshot.from_cache);
        assert_eq!(snapshot.documents.len(), 1);
        assert_eq!(
            fixture.sync_engine.get_remote_keys_for_target(target_id),
            [key("rooms/a")].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn write_raises_optimistic_snapshot_and_resolves_on_ack() {
        let fixture = started(100).await;
        run(&fixture, |engine| async move { engine.listen(rooms(), true).await.map(|_| ()) }.boxed()).await;

        let (sender, receiver) = oneshot::channel();
        run(&fixture, move |engine| {
            async move { engine.write(vec![Mutation::set(key("rooms/a"), data(5))], sender).await }.boxed()
        })
        .await;
        let optimistic = last_snapshot(&fixture);
        assert!(optimistic.has_pending_writes());
        assert_eq!(optimistic.documents.len(), 1);

        // handshake, then the batch
        fixture.backend.send_write_response(WriteResponse {
            stream_token: b"t1".to_vec(),
            commit_version: SnapshotVersion::min(),
            write_results: vec![],
        });
        settle(&fixture.queue).await;
        fixture.backend.send_write_response(WriteResponse {
            stream_token: b"t2".to_vec(),
            commit_version: version(3),
            write_results: vec![MutationResult::new(version(3), Vec::new())],
        });
        settle(&fixture.queue).await;

        assert_eq!(receiver.await.unwrap(), Ok(()));
        let acknowledged = fixture.local_store.read_document(&key("rooms/a")).unwrap();
        assert_eq!(acknowledged.version(), version(3));
        assert!(acknowledged.has_committed_mutations());
    }

    #[tokio::test]
    async fn pending_writes_callback_resolves_immediately_without_writes() {
        let fixture = started(100).await;
        let (sender, receiver) = oneshot::channel();
        run(&fixture, move |engine| {
            async move { engine.register_pending_writes_callback(sender).await }.boxed()
        })
        .await;
        assert_eq!(receiver.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn cached_document_missing_from_current_target_is_resolved_through_limbo() {
        let fixture = started(100).await;
        // seed the cache with a document from an earlier session
        fixture
            .local_store
            .apply_remote_event(&RemoteEvent {
                snapshot_version: version(1),
                document_updates: [(
                    key("rooms/ghost"),
                    MutableDocument::new_found_document(key("rooms/ghost"), version(1), data(1)),
                )]
                .into_iter()
                .collect(),
                ..RemoteEvent::default()
            })
            .unwrap();

        let initial = run(&fixture, |engine| async move { engine.listen(rooms(), true).await }.boxed()).await;
        assert_eq!(initial.documents.len(), 1);
        let target_id = added_target_ids(&fixture.backend)[0].target_id;

        fixture.backend.send_listen_response(target_change(TargetChangeState::Added, vec![target_id]));
        fixture.backend.send_listen_response(target_change(TargetChangeState::Current, vec![target_id]));
        fixture.backend.send_listen_response(global_snapshot(2));
        settle(&fixture.queue).await;

        let active = fixture.sync_engine.get_active_limbo_document_resolutions().await;
        let limbo_target = active[&key("rooms/ghost")];
        let limbo_listen = added_target_ids(&fixture.backend)
            .into_iter()
            .find(|data| data.target_id == limbo_target)
            .unwrap();
        assert_eq!(limbo_listen.purpose, TargetPurpose::LimboResolution);
        assert!(last_snapshot(&fixture).from_cache);

        // the server confirms the document is gone
        fixture.backend.send_listen_response(target_change(TargetChangeState::Added, vec![limbo_target]));
        fixture.backend.send_listen_response(target_change(TargetChangeState::Current, vec![limbo_target]));
        fixture.backend.send_listen_response(global_snapshot(3));
        settle(&fixture.queue).await;

        let snapshot = last_snapshot(&fixture);
        assert!(snapshot.documents.is_empty());
        assert!(!snapshot.from_cache);
        assert!(fixture.sync_engine.get_active_limbo_document_resolutions().await.is_empty());
    }

    #[tokio::test]
    async fn limbo_resolutions_beyond_the_cap_wait_in_line() {
        let fixture = started(1).await;
        let documents: BTreeMap<DocumentKey, MutableDocument> = ["rooms/a", "rooms/b"]
            .into_iter()
            .map(|path| {
                (
                    key(path),
                    MutableDocument::new_found_document(key(path), version(1), data(1)),
                )
            })
            .collect();
        fixture
            .local_store
            .apply_remote_event(&RemoteEvent {
                snapshot_version: version(1),
                document_updates: documents,
                ..RemoteEvent::default()
            })
            .unwrap();

        run(&fixture, |engine| async move { engine.listen(rooms(), true).await.map(|_| ()) }.boxed()).await;
        let target_id = added_target_ids(&fixture.backend)[0].target_id;
        fixture.backend.send_listen_response(target_change(TargetChangeState::Added, vec![target_id]));
        fixture.backend.send_listen_response(target_change(TargetChangeState::Current, vec![target_id]));
        fixture.backend.send_listen_response(global_snapshot(2));
        settle(&fixture.queue).await;

        assert_eq!(fixture.sync_engine.get_active_limbo_document_resolutions().await.len(), 1);
        assert_eq!(
            fixture.sync_engine.get_enqueued_limbo_document_resolutions().await,
            vec![key("rooms/b")]
        );

        let limbo_target = fixture.sync_engine.get_active_limbo_document_resolutions().await[&key("rooms/a")];
        fixture.backend.send_listen_response(target_change(TargetChangeState::Added, vec![limbo_target]));
        fixture.backend.send_listen_response(target_change(TargetChangeState::Current, vec![limbo_target]));
        fixture.backend.send_listen_response(global_snapshot(3));
        settle(&fixture.queue).await;

        let active = fixture.sync_engine.get_active_limbo_document_resolutions().await;
        assert_eq!(active.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
        assert!(fixture.sync_engine.get_enqueued_limbo_document_resolutions().await.is_empty());
    }

    #[tokio::test]
    async fn remote_keys_follow_the_synced_documents_of_each_target() {
        let fixture = started(100).await;
        run(&fixture, |engine| async move { engine.listen(rooms(), true).await.map(|_| ()) }.boxed()).await;
        let target_id = added_target_ids(&fixture.backend)[0].target_id;
        assert!(fixture.sync_engine.get_remote_keys_for_target(target_id).is_empty());

        fixture.backend.send_listen_response(target_change(TargetChangeState::Added, vec![target_id]));
        fixture.backend.send_listen_response(document(target_id, "rooms/a", 2, 1));
        fixture.backend.send_listen_response(target_change(TargetChangeState::Current, vec![target_id]));
        fixture.backend.send_listen_response(global_snapshot(2));
        settle(&fixture.queue).await;
        assert_eq!(
            fixture.sync_engine.get_remote_keys_for_target(target_id),
            [key("rooms/a")].into_iter().collect()
        );

        run(&fixture, |engine| async move { engine.unlisten(&rooms(), true).await }.boxed()).await;
        assert!(fixture.sync_engine.get_remote_keys_for_target(target_id).is_empty());
    }

    #[tokio::test]
    async fn rejected_listen_reports_error_and_drops_the_view() {
        let fixture = started(100).await;
        run(&fixture, |engine| async move { engine.listen(rooms(), true).await.map(|_| ()) }.boxed()).await;
        let target_id = added_target_ids(&fixture.backend)[0].target_id;
        fixture.backend.send_listen_response(ListenResponse::new(WatchChange::Target(
            WatchTargetChange::new(TargetChangeState::Removed, vec![target_id])
                .with_cause(permission_denied("no access")),
        )));
        settle(&fixture.queue).await;

        let errors = fixture.listener.errors.lock().unwrap().clone();
        assert_eq!(errors, vec![(rooms().canonical_id(), FirestoreErrorCode::PermissionDenied)]);
        assert!(fixture.sync_engine.get_remote_keys_for_target(target_id).is_empty());
    }

    #[tokio::test]
    async fn unlisten_releases_the_remote_target() {
        let fixture = started(100).await;
        run(&fixture, |engine| async move { engine.listen(rooms(), true).await.map(|_| ()) }.boxed()).await;
        let target_id = added_target_ids(&fixture.backend)[0].target_id;
        run(&fixture, |engine| async move { engine.unlisten(&rooms(), true).await }.boxed()).await;
        assert!(fixture
            .backend
            .listen_requests()
            .contains(&ListenRequest::RemoveTarget(target_id)));
    }

    async fn secondary(max_limbo: usize) -> Fixture {
        let fixture = fixture(max_limbo);
        run(&fixture, |engine| async move { engine.apply_primary_state(false).await }.boxed()).await;
        fixture
    }

    #[tokio::test]
    async fn secondary_client_leaves_watch_targets_to_the_primary() {
        let fixture = secondary(100).await;
        run(&fixture, |engine| async move { engine.listen(rooms(), true).await.map(|_| ()) }.boxed()).await;
        assert!(fixture.sync_engine.remote_store.listen_target_ids().await.is_empty());

        run(&fixture, |engine| async move { engine.unlisten(&rooms(), true).await }.boxed()).await;
        run(&fixture, |engine| async move { engine.apply_primary_state(true).await }.boxed()).await;
        assert!(fixture.sync_engine.remote_store.listen_target_ids().await.is_empty());
        assert!(added_target_ids(&fixture.backend).is_empty());
    }

    #[tokio::test]
    async fn promoted_client_listens_to_its_active_queries() {
        let fixture = secondary(100).await;
        run(&fixture, |engine| async move { engine.listen(rooms(), true).await.map(|_| ()) }.boxed()).await;
        run(&fixture, |engine| async move { engine.apply_primary_state(true).await }.boxed()).await;

        let listened = fixture.sync_engine.remote_store.listen_target_ids().await;
        assert_eq!(listened.len(), 1);
        let added = added_target_ids(&fixture.backend);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].target_id, listened[0]);
    }

    #[test]
    fn collection_group_of_collection_and_document_paths() {
        assert_eq!(query_collection_group(&rooms()), "rooms");
        assert_eq!(query_collection_group(&Query::for_document(&key("rooms/a"))), "rooms");
        assert_eq!(query_collection_group(&Query::collection_group("messages")), "messages");
    }
}
