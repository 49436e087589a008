use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::core::{BackoffSettings, OnlineState, User};
use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, unavailable, FirestoreError,
    FirestoreResult,
};
use crate::firestore::local::{LocalStore, TargetData};
use crate::firestore::model::{
    DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion, TargetId,
};
use crate::firestore::remote::datastore::{Datastore, ListenResponse};
use crate::firestore::remote::online_state_tracker::OnlineStateTracker;
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::stream::StreamListener;
use crate::firestore::remote::streams::{ListenStream, WriteStream, WriteStreamListener};
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::util::async_queue::lock;
use crate::firestore::util::AsyncQueue;

const LOG_TARGET: &str = "RemoteStore";

/// Batches allowed in flight on the write stream at once.
pub const MAX_PENDING_WRITES: usize = 10;

/// Reasons the network is switched off. The network is usable only while
/// the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    StorageFailure,
    CredentialChange,
    Shutdown,
    IsSecondary,
}

type RecoveryOp = Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

struct RemoteStoreState {
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Only present while the watch stream is started.
    watch_aggregator: Option<WatchChangeAggregator>,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

/// Owns the listen and write streams and keeps them in line with what the
/// sync engine wants: every listened target watched, every pending batch
/// written.
///
/// All methods must be called from the async queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct RemoteStoreInner {
    weak_self: Weak<RemoteStoreInner>,
    local_store: Arc<LocalStore>,
    queue: AsyncQueue,
    watch_stream: ListenStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
    syncer: StdMutex<Option<Weak<dyn RemoteSyncer>>>,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<LocalStore>,
        datastore: Datastore,
        queue: AsyncQueue,
        backoff: BackoffSettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let handler_target = weak.clone();
            let handler_queue = queue.clone();
            let online_state_tracker = OnlineStateTracker::new(
                queue.clone(),
                Arc::new(move |online_state| {
                    let Some(syncer) = handler_target.upgrade().and_then(|inner| inner.syncer()) else {
                        return;
                    };
                    handler_queue.enqueue_and_forget(async move {
                        syncer.apply_online_state_change(online_state).await
                    });
                }),
            );
            RemoteStoreInner {
                weak_self: weak.clone(),
                local_store,
                queue: queue.clone(),
                watch_stream: ListenStream::new(
                    queue.clone(),
                    datastore.clone(),
                    backoff,
                    Arc::new(WatchDelegate { store: weak.clone() }),
                ),
                write_stream: WriteStream::new(
                    queue.clone(),
                    datastore,
                    backoff,
                    Arc::new(WriteDelegate { store: weak.clone() }),
                ),
                online_state_tracker,
                syncer: StdMutex::new(None),
                state: Mutex::new(RemoteStoreState {
                    listen_targets: BTreeMap::new(),
                    watch_aggregator: None,
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::new(),
                }),
            }
        });
        Self { inner }
    }

    /// Wires up the receiver of remote events. Held weakly; the syncer owns
    /// the remote store.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        *lock(&self.inner.syncer) = Some(syncer);
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    /// Starts the streams that currently have work.
    pub async fn start(&self) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.enable_network_internal(&mut state)
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        state.offline_causes.remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal(&mut state)
    }

    /// Stops both streams and reports Offline until the network is enabled
    /// again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        state.offline_causes.insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal(&mut state);
        self.inner.online_state_tracker.set(OnlineState::Offline);
        Ok(())
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!(target: LOG_TARGET, "shutting down");
        let mut state = self.inner.state.lock().await;
        state.offline_causes.insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal(&mut state);
        // Unknown rather than Offline, so listeners do not see a spurious
        // offline snapshot during teardown.
        self.inner.online_state_tracker.set(OnlineState::Unknown);
        Ok(())
    }

    /// Tears the streams down, lets the syncer switch users, then brings
    /// the streams back with fresh credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        log::debug!(target: LOG_TARGET, "received new credentials for {user}");
        let used_network = {
            let mut state = self.inner.state.lock().await;
            let used_network = state.can_use_network();
            state.offline_causes.insert(OfflineCause::CredentialChange);
            self.inner.disable_network_internal(&mut state);
            used_network
        };
        if used_network {
            self.inner.online_state_tracker.set(OnlineState::Unknown);
        }
        if let Some(syncer) = self.inner.syncer() {
            syncer.handle_credential_change(user).await?;
        }
        let mut state = self.inner.state.lock().await;
        state.offline_causes.remove(&OfflineCause::CredentialChange);
        self.inner.enable_network_internal(&mut state)
    }

    /// Only the primary client talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        if is_primary {
            state.offline_causes.remove(&OfflineCause::IsSecondary);
            self.inner.enable_network_internal(&mut state)
        } else {
            state.offline_causes.insert(OfflineCause::IsSecondary);
            self.inner.disable_network_internal(&mut state);
            self.inner.online_state_tracker.set(OnlineState::Unknown);
            Ok(())
        }
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.can_use_network()
    }

    /// Starts watching `target_data`. Listening to the same target twice is
    /// a no-op.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.listen_targets.contains_key(&target_data.target_id) {
            return Ok(());
        }
        state
            .listen_targets
            .insert(target_data.target_id, target_data.clone());
        if self.inner.should_start_watch_stream(&state) {
            self.inner.start_watch_stream(&mut state);
        } else if self.inner.watch_stream.is_open() {
            self.inner.send_watch_request(&mut state, target_data)?;
        }
        Ok(())
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        state.listen_targets.remove(&target_id);
        if self.inner.watch_stream.is_open() {
            self.inner.send_unwatch_request(&mut state, target_id)?;
        }
        if state.listen_targets.is_empty() {
            if self.inner.watch_stream.is_open() {
                self.inner.watch_stream.mark_idle();
            } else if state.can_use_network() {
                // without a listen to send, the stream cannot prove itself
                // healthy
                self.inner.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    /// Pulls pending batches from the local store into the write pipeline
    /// and starts the write stream when there is something to send.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut state = self.inner.state.lock().await;
        self.inner.fill_write_pipeline(&mut state)
    }

    pub async fn listen_target_ids(&self) -> Vec<TargetId> {
        self.inner.state.lock().await.listen_targets.keys().copied().collect()
    }

    pub async fn pending_write_count(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }
}

/// Metadata view handed to the aggregator while the state lock is held.
struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: Option<&'a dyn RemoteSyncer>,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

impl RemoteStoreInner {
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        lock(&self.syncer).as_ref().and_then(Weak::upgrade)
    }

    fn enable_network_internal(&self, state: &mut RemoteStoreState) -> FirestoreResult<()> {
        if !state.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream(state) {
            self.start_watch_stream(state);
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        self.fill_write_pipeline(state)
    }

    fn disable_network_internal(&self, state: &mut RemoteStoreState) {
        self.write_stream.stop();
        self.watch_stream.stop();
        if !state.write_pipeline.is_empty() {
            log::debug!(
                target: LOG_TARGET,
                "stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.watch_aggregator = None;
    }

    /// Takes the network down after a storage failure and probes the local
    /// store with retryable operations until it works again. Any other
    /// error is returned as is.
    fn disable_network_until_recovery(
        &self,
        state: &mut RemoteStoreState,
        error: FirestoreError,
        op: Option<RecoveryOp>,
    ) -> FirestoreResult<()> {
        if !error.is_storage_failure() {
            return Err(error);
        }
        log::debug!(target: LOG_TARGET, "disabling network until storage recovers: {error}");
        state.offline_causes.insert(OfflineCause::StorageFailure);
        self.disable_network_internal(state);
        self.online_state_tracker.set(OnlineState::Offline);

        let op = op.unwrap_or_else(|| {
            let local_store = Arc::clone(&self.local_store);
            Arc::new(move || {
                let local_store = Arc::clone(&local_store);
                async move { local_store.get_last_remote_snapshot_version().map(|_| ()) }.boxed()
            })
        });
        let store = self.weak_self.clone();
        self.queue.enqueue_retryable(move || {
            let op = Arc::clone(&op);
            let store = store.clone();
            async move {
                log::debug!(target: LOG_TARGET, "retrying storage access");
                op().await?;
                match store.upgrade() {
                    Some(inner) => enable_after_recovery(inner).await,
                    None => Ok(()),
                }
            }
            .boxed()
        });
        Ok(())
    }

    /// Runs `op`; a storage failure disables the network and retries `op`
    /// until it succeeds.
    async fn execute_with_recovery(&self, op: RecoveryOp) -> FirestoreResult<()> {
        if let Err(error) = op().await {
            let mut state = self.state.lock().await;
            self.disable_network_until_recovery(&mut state, error, Some(op))?;
        }
        Ok(())
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && !self.watch_stream.is_started() && !state.listen_targets.is_empty()
    }

    fn start_watch_stream(&self, state: &mut RemoteStoreState) {
        state.watch_aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    fn send_watch_request(&self, state: &mut RemoteStoreState, target_data: TargetData) -> FirestoreResult<()> {
        let target_data = if !target_data.resume_token.is_empty()
            || target_data.snapshot_version > SnapshotVersion::min()
        {
            let expected = self
                .syncer()
                .map(|syncer| syncer.get_remote_keys_for_target(target_data.target_id).len())
                .unwrap_or(0);
            target_data.with_expected_count(expected as i32)
        } else {
            target_data
        };
        if let Some(aggregator) = state.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        self.watch_stream.watch(&target_data)
    }

    fn send_unwatch_request(&self, state: &mut RemoteStoreState, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(aggregator) = state.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id)
    }

    async fn on_watch_open(&self) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(&mut state, target_data)?;
        }
        Ok(())
    }

    async fn on_watch_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let mut state = self.state.lock().await;
        state.watch_aggregator = None;
        if self.should_start_watch_stream(&state) {
            let error = error.unwrap_or_else(|| unavailable("watch stream closed"));
            self.online_state_tracker.handle_watch_stream_failure(&error);
            self.start_watch_stream(&mut state);
        } else {
            // nothing to listen to, so there is no connection attempt whose
            // outcome could be reported
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        Ok(())
    }

    async fn on_watch_change(&self, response: ListenResponse) -> FirestoreResult<()> {
        self.online_state_tracker.set(OnlineState::Online);
        let syncer = self.syncer();

        if let WatchChange::Target(change) = &response.change {
            if change.state == TargetChangeState::Removed && change.cause.is_some() {
                if let Err(error) = self.handle_target_error(change, syncer.as_deref()).await {
                    log::debug!(target: LOG_TARGET, "failed to remove targets {:?}: {error}", change.target_ids);
                    let mut state = self.state.lock().await;
                    self.disable_network_until_recovery(&mut state, error, None)?;
                }
                return Ok(());
            }
        }

        let global_snapshot = matches!(
            &response.change,
            WatchChange::Target(change)
                if change.state == TargetChangeState::NoChange && change.target_ids.is_empty()
        ) && response.snapshot_version > SnapshotVersion::min();

        let event = {
            let mut state = self.state.lock().await;
            let RemoteStoreState {
                listen_targets,
                watch_aggregator,
                ..
            } = &mut *state;
            let Some(aggregator) = watch_aggregator.as_mut() else {
                return Ok(());
            };
            let meta = ListenTargetMetadata {
                listen_targets,
                syncer: syncer.as_deref(),
            };
            match response.change {
                WatchChange::Document(change) => aggregator.handle_document_change(change, &meta),
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(filter, &meta),
                WatchChange::Target(change) => aggregator.handle_target_change(&change, &meta),
            }
            if !global_snapshot {
                return Ok(());
            }
            let last_remote_version = match self.local_store.get_last_remote_snapshot_version() {
                Ok(version) => version,
                Err(error) => {
                    log::debug!(target: LOG_TARGET, "failed to raise snapshot: {error}");
                    return self.disable_network_until_recovery(&mut state, error, None);
                }
            };
            if response.snapshot_version < last_remote_version {
                return Ok(());
            }
            self.raise_watch_snapshot(&mut state, response.snapshot_version, syncer.as_deref())?
        };

        let Some(syncer) = syncer else {
            return Ok(());
        };
        if let Err(error) = syncer.apply_remote_event(event).await {
            log::debug!(target: LOG_TARGET, "failed to apply remote event: {error}");
            let mut state = self.state.lock().await;
            self.disable_network_until_recovery(&mut state, error, None)?;
        }
        Ok(())
    }

    /// Builds the remote event for `snapshot_version`, refreshing resume
    /// tokens and re-listening targets whose existence filter mismatched.
    fn raise_watch_snapshot(
        &self,
        state: &mut RemoteStoreState,
        snapshot_version: SnapshotVersion,
        syncer: Option<&dyn RemoteSyncer>,
    ) -> FirestoreResult<RemoteEvent> {
        let event = {
            let RemoteStoreState {
                listen_targets,
                watch_aggregator,
                ..
            } = &mut *state;
            let Some(aggregator) = watch_aggregator.as_mut() else {
                return Err(internal_error("watch snapshot without an active aggregator"));
            };
            let meta = ListenTargetMetadata {
                listen_targets,
                syncer,
            };
            aggregator.create_remote_event(snapshot_version, &meta)
        };

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = state.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = state.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // known mismatch: drop the resume token and ask for everything
            state.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Vec::new(), target_data.snapshot_version),
            );
            self.send_unwatch_request(state, *target_id)?;
            // the purpose only tags this one request, not the stored target
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(state, request)?;
        }
        Ok(event)
    }

    async fn handle_target_error(
        &self,
        change: &WatchTargetChange,
        syncer: Option<&dyn RemoteSyncer>,
    ) -> FirestoreResult<()> {
        let Some(cause) = change.cause.clone() else {
            return Ok(());
        };
        for target_id in &change.target_ids {
            if !self.state.lock().await.listen_targets.contains_key(target_id) {
                continue;
            }
            if let Some(syncer) = syncer {
                syncer.reject_listen(*target_id, cause.clone()).await?;
            }
            let mut state = self.state.lock().await;
            state.listen_targets.remove(target_id);
            if let Some(aggregator) = state.watch_aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
        }
        Ok(())
    }

    fn fill_write_pipeline(&self, state: &mut RemoteStoreState) -> FirestoreResult<()> {
        let mut last_batch_id = state.write_pipeline.back().map(|batch| batch.batch_id);
        while state.can_add_to_write_pipeline() {
            match self.local_store.next_mutation_batch(last_batch_id) {
                Ok(Some(batch)) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(state, batch)?;
                }
                Ok(None) => {
                    if state.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
                Err(error) => {
                    self.disable_network_until_recovery(state, error, None)?;
                }
            }
        }
        if self.should_start_write_stream(state) {
            self.write_stream.start();
        }
        Ok(())
    }

    fn add_to_write_pipeline(&self, state: &mut RemoteStoreState, batch: MutationBatch) -> FirestoreResult<()> {
        let send_now = self.write_stream.is_open() && self.write_stream.handshake_complete();
        let mutations = send_now.then(|| batch.mutations.clone());
        state.write_pipeline.push_back(batch);
        if let Some(mutations) = mutations {
            self.write_stream.write_mutations(mutations)?;
        }
        Ok(())
    }

    fn should_start_write_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && !self.write_stream.is_started() && !state.write_pipeline.is_empty()
    }

    async fn on_write_open(&self) -> FirestoreResult<()> {
        let token = match self.local_store.get_last_stream_token() {
            Ok(token) => token,
            Err(error) => {
                log::warn!(target: LOG_TARGET, "could not read the last stream token: {error}");
                Vec::new()
            }
        };
        self.write_stream.write_handshake(token)
    }

    async fn on_handshake_complete(&self) -> FirestoreResult<()> {
        let token = self.write_stream.last_stream_token();
        if let Err(error) = self.local_store.set_last_stream_token(token) {
            if !error.is_primary_lease_lost() {
                return Err(error);
            }
            log::debug!(target: LOG_TARGET, "unexpectedly lost primary lease");
        }
        let state = self.state.lock().await;
        for batch in &state.write_pipeline {
            self.write_stream.write_mutations(batch.mutations.clone())?;
        }
        Ok(())
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let batch = self
            .state
            .lock()
            .await
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("mutation result without a pending batch"))?;
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        )?;
        if let Some(syncer) = self.syncer() {
            self.execute_with_recovery(Arc::new(move || {
                let syncer = Arc::clone(&syncer);
                let result = result.clone();
                async move { syncer.apply_successful_write(result).await }.boxed()
            }))
            .await?;
        }
        let mut state = self.state.lock().await;
        self.fill_write_pipeline(&mut state)
    }

    async fn on_write_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(error) = error {
            if self.write_stream.handshake_complete() {
                self.handle_write_error(error).await?;
            } else {
                self.handle_handshake_error(error)?;
            }
        }
        let state = self.state.lock().await;
        if self.should_start_write_stream(&state) {
            self.write_stream.start();
        }
        Ok(())
    }

    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        // transient errors are left to the stream's own retry
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return Ok(());
        };
        log::debug!(
            target: LOG_TARGET,
            "batch {} rejected by the backend: {error}",
            batch.batch_id
        );
        // the request was bad, not the server
        self.write_stream.inhibit_backoff();
        if let Some(syncer) = self.syncer() {
            let batch_id = batch.batch_id;
            self.execute_with_recovery(Arc::new(move || {
                let syncer = Arc::clone(&syncer);
                let error = error.clone();
                async move { syncer.reject_failed_write(batch_id, error).await }.boxed()
            }))
            .await?;
        }
        let mut state = self.state.lock().await;
        self.fill_write_pipeline(&mut state)
    }

    /// A permanent error before the handshake means the stream token is no
    /// longer valid.
    fn handle_handshake_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_error(error.code) {
            return Ok(());
        }
        log::debug!(target: LOG_TARGET, "error before completed handshake, resetting stream token: {error}");
        match self.local_store.set_last_stream_token(Vec::new()) {
            Err(error) if !error.is_primary_lease_lost() => Err(error),
            _ => Ok(()),
        }
    }
}

/// Clears the storage-failure cause once a probe succeeded.
fn enable_after_recovery(inner: Arc<RemoteStoreInner>) -> BoxFuture<'static, FirestoreResult<()>> {
    async move {
        let mut state = inner.state.lock().await;
        state.offline_causes.remove(&OfflineCause::StorageFailure);
        inner.enable_network_internal(&mut state)
    }
    .boxed()
}

struct WatchDelegate {
    store: Weak<RemoteStoreInner>,
}

#[async_trait]
impl StreamListener<ListenResponse> for WatchDelegate {
    async fn on_open(&self) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_watch_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: ListenResponse) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_watch_change(message).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_watch_close(error).await,
            None => Ok(()),
        }
    }
}

struct WriteDelegate {
    store: Weak<RemoteStoreInner>,
}

#[async_trait]
impl WriteStreamListener for WriteDelegate {
    async fn on_write_open(&self) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_write_open().await,
            None => Ok(()),
        }
    }

    async fn on_handshake_complete(&self) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_handshake_complete().await,
            None => Ok(()),
        }
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_mutation_result(commit_version, results).await,
            None => Ok(()),
        }
    }

    async fn on_write_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_write_close(error).await,
            None => Ok(()),
        }
    }
}
