use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::firestore::core::{Query, Target, User};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::{
    BundleCache, BundleMetadata, LocalDocumentsView, LruGarbageCollector, LruResults,
    MutationQueue, NamedQuery, Persistence, QueryEngine, RemoteDocumentCache,
    RemoteDocumentChangeBuffer, TargetCache, TargetData, TargetPurpose, TransactionMode,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, TargetId, Timestamp, BATCHID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};
use crate::firestore::util::async_queue::lock;

const LOG_TARGET: &str = "LocalStore";

/// Resume tokens older than this are persisted even without other changes.
const RESUME_TOKEN_MAX_AGE: Duration = Duration::from_secs(5 * 60);

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Outcome of [`LocalStore::write_locally`].
#[derive(Debug, Clone)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: DocumentMap,
}

/// Outcome of [`LocalStore::handle_user_change`].
#[derive(Debug, Clone)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Outcome of [`LocalStore::execute_query`].
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Keys a view started or stopped showing, reported back so garbage
/// collection keeps what is on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

struct LocalStoreState {
    user: User,
    local_documents: LocalDocumentsView,
    /// Targets with an active listen, keyed by id.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: HashMap<String, TargetId>,
    /// Read time up to which each collection group was handed to
    /// [`LocalStore::get_new_document_changes`].
    last_document_change_read_time: HashMap<String, SnapshotVersion>,
    document_change_baseline: SnapshotVersion,
}

/// Local half of the client: owns persistence, turns writes into batches,
/// applies remote events and answers queries from the cache.
///
/// Every method runs one persistence transaction and is called from the
/// client's async queue.
pub struct LocalStore {
    persistence: Arc<Persistence>,
    query_engine: QueryEngine,
    state: StdMutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, query_engine: QueryEngine, initial_user: User) -> Arc<Self> {
        let mutation_queue = MutationQueue::new(initial_user.to_key());
        Arc::new(Self {
            persistence,
            query_engine,
            state: StdMutex::new(LocalStoreState {
                user: initial_user,
                local_documents: LocalDocumentsView::new(mutation_queue),
                target_data_by_target: BTreeMap::new(),
                target_id_by_canonical_id: HashMap::new(),
                last_document_change_read_time: HashMap::new(),
                document_change_baseline: SnapshotVersion::min(),
            }),
        })
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    fn mutation_queue(&self) -> MutationQueue {
        lock(&self.state).local_documents.mutation_queue().clone()
    }

    fn local_documents(&self) -> LocalDocumentsView {
        lock(&self.state).local_documents.clone()
    }

    /// Registers the current user's queue and remembers the snapshot from
    /// which secondary clients read document changes.
    pub fn start(&self) -> FirestoreResult<()> {
        let queue = self.mutation_queue();
        let baseline = self.persistence.run_transaction("Start LocalStore", TransactionMode::ReadWrite, |txn| {
            queue.start(txn)?;
            TargetCache::get_last_remote_snapshot_version(txn)
        })?;
        lock(&self.state).document_change_baseline = baseline;
        Ok(())
    }

    pub fn current_user(&self) -> User {
        lock(&self.state).user.clone()
    }

    /// Switches to `user`'s mutation queue and reports which documents look
    /// different now.
    pub fn handle_user_change(&self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_queue = self.mutation_queue();
        let new_queue = MutationQueue::new(user.to_key());
        let new_view = LocalDocumentsView::new(new_queue.clone());

        let result = self.persistence.run_transaction("Handle user change", TransactionMode::ReadWrite, |txn| {
            let old_batches = old_queue.get_all_mutation_batches(txn)?;
            new_queue.start(txn)?;
            let new_batches = new_queue.get_all_mutation_batches(txn)?;

            let changed_keys: BTreeSet<DocumentKey> = old_batches
                .iter()
                .chain(new_batches.iter())
                .flat_map(MutationBatch::keys)
                .collect();
            let affected_documents = new_view.get_documents(txn, &changed_keys)?;
            Ok(UserChangeResult {
                affected_documents,
                removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
            })
        })?;

        let mut state = lock(&self.state);
        state.user = user;
        state.local_documents = new_view;
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the new local view of the
    /// documents they touch.
    pub fn write_locally(&self, mutations: Vec<Mutation>, local_write_time: Timestamp) -> FirestoreResult<LocalWriteResult> {
        let view = self.local_documents();
        self.persistence.run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
            let keys: BTreeSet<DocumentKey> = mutations.iter().map(|mutation| mutation.key.clone()).collect();
            let mut existing = view.get_documents(txn, &keys)?;

            // Transforms that depend on the previous value (increments) are
            // pinned to the value seen now, so later remote changes to the
            // base do not change their local result.
            let mut base_mutations = Vec::new();
            for mutation in &mutations {
                let Some(document) = existing.get(&mutation.key) else {
                    continue;
                };
                if let Some(base_value) = mutation.extract_transform_base_value(document) {
                    let mask = base_value.field_mask();
                    base_mutations.push(Mutation::patch(mutation.key.clone(), base_value, mask));
                }
            }

            let batch = view
                .mutation_queue()
                .add_mutation_batch(txn, local_write_time, base_mutations, mutations)?;
            batch.apply_to_local_document_set(&mut existing);
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes: existing,
            })
        })
    }

    /// Applies an acknowledged batch to the remote documents and drops it
    /// from the queue.
    pub fn acknowledge_batch(&self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let view = self.local_documents();
        self.persistence.run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
            let queue = view.mutation_queue();
            let batch = &batch_result.batch;
            let mut buffer = RemoteDocumentChangeBuffer::new();
            for key in batch.keys() {
                let mut document = buffer.get_entry(txn, &key)?;
                let Some(ack_version) = batch_result.doc_versions.get(&key) else {
                    return Err(internal_error("doc_versions should contain every acknowledged key"));
                };
                if document.version() < *ack_version {
                    batch.apply_to_remote_document(&mut document, batch_result)?;
                    if document.is_valid_document() {
                        document.set_read_time(batch_result.commit_version);
                        buffer.add_entry(document);
                    }
                }
            }
            buffer.apply(txn)?;
            queue.acknowledge_batch(txn, batch, batch_result.stream_token.clone())?;
            queue.remove_mutation_batch(txn, batch)?;
            view.get_documents(txn, &batch.keys())
        })
    }

    /// Drops a batch the backend refused.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let view = self.local_documents();
        self.persistence.run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
            let queue = view.mutation_queue();
            let batch = queue
                .lookup_mutation_batch(txn, batch_id)?
                .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
            queue.remove_mutation_batch(txn, &batch)?;
            view.get_documents(txn, &batch.keys())
        })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let queue = self.mutation_queue();
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
                queue.get_highest_unacknowledged_batch_id(txn)
            })
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                TargetCache::get_last_remote_snapshot_version(txn)
            })
    }

    pub fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let queue = self.mutation_queue();
        self.persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| queue.get_last_stream_token(txn))
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let queue = self.mutation_queue();
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                queue.set_last_stream_token(txn, stream_token)
            })
    }

    /// Applies a watch snapshot to the target and document caches and
    /// returns the new local view of every changed document.
    pub fn apply_remote_event(&self, remote_event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let remote_version = remote_event.snapshot_version;
        let (view, mut targets) = {
            let state = lock(&self.state);
            (state.local_documents.clone(), state.target_data_by_target.clone())
        };

        let changed = self.persistence.run_transaction("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
            for (target_id, change) in &remote_event.target_changes {
                let Some(old_target_data) = targets.get(target_id).cloned() else {
                    continue;
                };
                TargetCache::remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                TargetCache::add_matching_keys(txn, &change.added_documents, *target_id)?;

                let mut new_target_data = old_target_data.with_sequence_number(txn.current_sequence_number());
                if remote_event.target_mismatches.contains_key(target_id) {
                    new_target_data = new_target_data
                        .with_resume_token(Vec::new(), SnapshotVersion::min())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                } else if !change.resume_token.is_empty() {
                    new_target_data = new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                }

                if should_persist_target_data(&old_target_data, &new_target_data, change) {
                    TargetCache::update_target_data(txn, &new_target_data)?;
                }
                targets.insert(*target_id, new_target_data);
            }

            let delegate = txn.reference_delegate();
            for key in remote_event.document_updates.keys() {
                if remote_event.resolved_limbo_documents.contains(key) {
                    delegate.update_limbo_document(txn, key)?;
                }
            }

            let mut buffer = RemoteDocumentChangeBuffer::new();
            let changed = populate_document_change_buffer(txn, &mut buffer, &remote_event.document_updates, remote_version)?;

            if !remote_version.is_min() {
                let last_remote_version = TargetCache::get_last_remote_snapshot_version(txn)?;
                if remote_version < last_remote_version {
                    return Err(internal_error(format!(
                        "Watch stream reverted to previous snapshot ({remote_version} < {last_remote_version})"
                    )));
                }
                let sequence_number = txn.current_sequence_number();
                let highest = TargetCache::get_highest_sequence_number(txn)?.max(sequence_number);
                TargetCache::set_target_global(txn, highest, remote_version)?;
            }

            buffer.apply(txn)?;
            view.get_local_view_of_documents(txn, changed)
        })?;

        lock(&self.state).target_data_by_target = targets;
        Ok(changed)
    }

    /// Pins what views show and records limbo-free snapshots of synced views.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let result = self
            .persistence
            .run_transaction("notifyLocalViewChanges", TransactionMode::ReadWrite, |txn| {
                let delegate = txn.reference_delegate();
                for change in view_changes {
                    {
                        let mut pins = lock(txn.in_memory_pins());
                        pins.add_references(change.added_keys.iter().cloned(), change.target_id);
                        pins.remove_references(change.removed_keys.iter(), change.target_id);
                    }
                    for key in &change.added_keys {
                        delegate.add_reference(txn, change.target_id, key)?;
                    }
                    for key in &change.removed_keys {
                        delegate.remove_reference(txn, change.target_id, key)?;
                    }
                }
                Ok(())
            });
        if let Err(err) = result {
            if !err.is_storage_failure() {
                return Err(err);
            }
            // only sequence numbers were lost; the pins themselves are in memory
            log::debug!(target: LOG_TARGET, "Failed to update sequence numbers: {err}");
        }

        let mut state = lock(&self.state);
        for change in view_changes.iter().filter(|change| !change.from_cache) {
            if let Some(target_data) = state.target_data_by_target.get(&change.target_id) {
                let updated = target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                state.target_data_by_target.insert(change.target_id, updated);
            }
        }
        Ok(())
    }

    /// The oldest pending batch after `after_batch_id`.
    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let queue = self.mutation_queue();
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                queue.get_next_mutation_batch_after_batch_id(txn, after_batch_id.unwrap_or(BATCHID_UNKNOWN))
            })
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let view = self.local_documents();
        self.persistence
            .run_transaction("read document", TransactionMode::ReadOnly, |txn| view.get_document(txn, key))
    }

    /// Target data for `target`, reusing the cached id when it was listened
    /// to before.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self.persistence.run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
            if let Some(cached) = TargetCache::get_target_data(txn, &target)? {
                return Ok(cached);
            }
            let target_id = TargetCache::allocate_target_id(txn)?;
            let target_data = TargetData::new(target.clone(), target_id, TargetPurpose::Listen, txn.current_sequence_number());
            TargetCache::add_target_data(txn, &target_data)?;
            Ok(target_data)
        })?;

        let mut state = lock(&self.state);
        let keep_cached = state
            .target_data_by_target
            .get(&target_data.target_id)
            .map(|cached| cached.snapshot_version >= target_data.snapshot_version)
            .unwrap_or(false);
        if !keep_cached {
            state.target_data_by_target.insert(target_data.target_id, target_data.clone());
            state
                .target_id_by_canonical_id
                .insert(target_data.target.canonical_id(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// Active target data for `target`, if it is being listened to.
    pub fn get_local_target_data(&self, target: &Target) -> Option<TargetData> {
        let state = lock(&self.state);
        state
            .target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| state.target_data_by_target.get(target_id))
            .filter(|target_data| &target_data.target == target)
            .cloned()
    }

    /// Target data from memory or, failing that, from the target cache.
    pub fn get_cached_target(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self.get_local_target_data(target) {
            return Ok(Some(target_data));
        }
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                TargetCache::get_target_data(txn, target)
            })
    }

    /// Persisted target behind `target_id`, for targets another client
    /// started.
    pub fn get_cached_target_by_id(&self, target_id: TargetId) -> FirestoreResult<Option<Target>> {
        if let Some(target_data) = lock(&self.state).target_data_by_target.get(&target_id) {
            return Ok(Some(target_data.target.clone()));
        }
        let target_data = self
            .persistence
            .run_transaction("Get target data by id", TransactionMode::ReadOnly, |txn| {
                TargetCache::get_target_data_by_id(txn, target_id)
            })?;
        Ok(target_data.map(|target_data| target_data.target))
    }

    /// Stops tracking `target_id`. Unless `keep_persisted_target_data` is set
    /// the reference delegate may collect the target.
    pub fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let target_data = lock(&self.state)
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .ok_or_else(|| internal_error(format!("Tried to release nonexistent target: {target_id}")))?;
        let mode = if keep_persisted_target_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };

        let result = self.persistence.run_transaction("Release target", mode, |txn| {
            let delegate = txn.reference_delegate();
            let removed = lock(txn.in_memory_pins()).remove_references_for_id(target_id);
            for key in &removed {
                delegate.remove_reference(txn, target_id, key)?;
            }
            if !keep_persisted_target_data {
                delegate.remove_target(txn, &target_data)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(err) if err.is_storage_failure() || err.is_primary_lease_lost() => {
                log::debug!(target: LOG_TARGET, "Failed to update sequence numbers for target {target_id}: {err}");
            }
            Err(err) => return Err(err),
        }

        let mut state = lock(&self.state);
        state.target_data_by_target.remove(&target_id);
        state.target_id_by_canonical_id.remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the cache, reusing the previous results of its
    /// target when `use_previous_results` is set.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let local_target_data = self.get_local_target_data(&target);
        let view = self.local_documents();
        self.persistence.run_transaction("Execute query", TransactionMode::ReadOnly, |txn| {
            let target_data = match local_target_data {
                Some(target_data) => Some(target_data),
                None => TargetCache::get_target_data(txn, &target)?,
            };
            let (last_limbo_free, remote_keys) = match &target_data {
                Some(target_data) => (
                    target_data.last_limbo_free_snapshot_version,
                    TargetCache::get_matching_keys_for_target_id(txn, target_data.target_id)?,
                ),
                None => (SnapshotVersion::min(), BTreeSet::new()),
            };
            let documents = if use_previous_results {
                self.query_engine
                    .get_documents_matching_query(txn, &view, query, last_limbo_free, &remote_keys)?
            } else {
                self.query_engine.get_documents_matching_query(
                    txn,
                    &view,
                    query,
                    SnapshotVersion::min(),
                    &BTreeSet::new(),
                )?
            };
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    pub fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                TargetCache::get_matching_keys_for_target_id(txn, target_id)
            })
    }

    /// Local view of the documents a batch touches; `None` once the batch is gone.
    pub fn lookup_mutation_documents(&self, batch_id: BatchId) -> FirestoreResult<Option<DocumentMap>> {
        let view = self.local_documents();
        self.persistence
            .run_transaction("Lookup mutation documents", TransactionMode::ReadOnly, |txn| {
                match view.mutation_queue().lookup_mutation_batch(txn, batch_id)? {
                    Some(batch) => Ok(Some(view.get_documents(txn, &batch.keys())?)),
                    None => Ok(None),
                }
            })
    }

    /// Documents of `collection_group` written to the cache since the last
    /// call, used by secondary clients to follow the primary.
    pub fn get_new_document_changes(&self, collection_group: &str) -> FirestoreResult<DocumentMap> {
        let since = {
            let state = lock(&self.state);
            state
                .last_document_change_read_time
                .get(collection_group)
                .copied()
                .unwrap_or(state.document_change_baseline)
        };
        let (changes, latest) = self
            .persistence
            .run_transaction("Get new document changes", TransactionMode::ReadOnly, |txn| {
                RemoteDocumentCache::get_new_document_changes(txn, collection_group, since)
            })?;
        lock(&self.state)
            .last_document_change_read_time
            .insert(collection_group.to_string(), latest);
        Ok(changes)
    }

    /// Ids of targets with an active listen.
    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        lock(&self.state).target_data_by_target.keys().copied().collect()
    }

    pub fn collect_garbage(&self, collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let active = self.active_target_ids();
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| collector.collect(txn, &active))
    }

    /// Whether a bundle at least as new as `metadata` was already loaded.
    pub fn has_newer_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<bool> {
        self.persistence
            .run_transaction("Has newer bundle", TransactionMode::ReadOnly, |txn| {
                Ok(BundleCache::get_bundle_metadata(txn, &metadata.id)?
                    .map(|cached| cached.create_time >= metadata.create_time)
                    .unwrap_or(false))
            })
    }

    pub fn save_bundle(&self, metadata: &BundleMetadata) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save bundle", TransactionMode::ReadWrite, |txn| {
                BundleCache::save_bundle_metadata(txn, metadata)
            })
    }

    pub fn get_named_query(&self, name: &str) -> FirestoreResult<Option<NamedQuery>> {
        self.persistence
            .run_transaction("Get named query", TransactionMode::ReadOnly, |txn| {
                BundleCache::get_named_query(txn, name)
            })
    }

    pub fn save_named_query(&self, query: &NamedQuery) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Save named query", TransactionMode::ReadWrite, |txn| {
                BundleCache::save_named_query(txn, query)
            })
    }
}

/// Persisting every resume token would write on every snapshot, so only
/// fresh tokens, old tokens and real changes are written.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let age_micros = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if age_micros >= RESUME_TOKEN_MAX_AGE.as_micros() as i64 {
        return true;
    }
    change.current || change.membership_changed()
}

fn populate_document_change_buffer(
    txn: &mut crate::firestore::local::PersistenceTransaction<'_>,
    buffer: &mut RemoteDocumentChangeBuffer,
    documents: &DocumentMap,
    remote_version: SnapshotVersion,
) -> FirestoreResult<DocumentMap> {
    let mut changed = DocumentMap::new();
    let existing = buffer.get_entries(txn, documents.keys())?;
    for (key, document) in documents {
        let Some(existing_document) = existing.get(key) else {
            continue;
        };
        if document.is_no_document() && document.version().is_min() {
            // manufactured by the client after losing access; drop it
            buffer.remove_entry(key.clone(), remote_version);
            changed.insert(key.clone(), document.clone());
        } else if !existing_document.is_valid_document()
            || document.version() > existing_document.version()
            || (document.version() == existing_document.version() && existing_document.has_pending_writes())
        {
            let mut updated = document.clone();
            updated.set_read_time(remote_version);
            buffer.add_entry(updated.clone());
            changed.insert(key.clone(), updated);
        } else {
            log::debug!(
                target: LOG_TARGET,
                "Ignoring outdated watch update for {key}. Current version: {}  Watch version: {}",
                existing_document.version(),
                document.version()
            );
        }
    }
    Ok(changed)
}
