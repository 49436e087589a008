use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::firestore::core::settings::{
    CLIENT_METADATA_REFRESH_INTERVAL, MAX_CLIENT_AGE, MAX_PRIMARY_LEASE_AGE,
};
use crate::firestore::core::{ListenSequence, LruParams, INVALID_SEQUENCE_NUMBER};
use crate::firestore::error::{
    failed_precondition, internal_error, primary_lease_lost, FirestoreResult,
};
use crate::firestore::local::encoded::{prefix_end, KeyBuilder};
use crate::firestore::local::kv::{KvStore, KvTransaction, MemoryKvStore};
use crate::firestore::local::sqlite::SqliteKvStore;
use crate::firestore::local::{ReferenceDelegate, ReferenceSet, TargetCache};
use crate::firestore::model::{DocumentKey, ListenSequenceNumber};
use crate::firestore::util::async_queue::lock;
use crate::firestore::util::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TARGET: &str = "Persistence";

/// Bumped whenever the stored record layout changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, and only while this client holds the primary lease.
    ReadWritePrimary,
}

type CommitListener = Box<dyn FnOnce()>;

/// Handle passed to the body of [`Persistence::run_transaction`].
///
/// Everything done through one handle commits atomically. The body is
/// synchronous: no await may happen between open and commit.
pub struct PersistenceTransaction<'a> {
    kv: Box<dyn KvTransaction + 'a>,
    mode: TransactionMode,
    sequence_number: ListenSequenceNumber,
    delegate: &'a ReferenceDelegate,
    pins: &'a StdMutex<ReferenceSet>,
    orphaned_documents: BTreeSet<DocumentKey>,
    on_committed: Vec<CommitListener>,
}

impl<'a> PersistenceTransaction<'a> {
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// LRU sequence number stamped on everything this transaction touches.
    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    /// Runs `listener` once after a successful commit; never on rollback.
    pub fn add_on_committed_listener(&mut self, listener: impl FnOnce() + 'static) {
        self.on_committed.push(Box::new(listener));
    }

    pub fn reference_delegate(&self) -> &'a ReferenceDelegate {
        self.delegate
    }

    pub(crate) fn in_memory_pins(&self) -> &'a StdMutex<ReferenceSet> {
        self.pins
    }

    pub(crate) fn mark_orphaned(&mut self, key: DocumentKey) {
        self.orphaned_documents.insert(key);
    }

    pub(crate) fn unmark_orphaned(&mut self, key: &DocumentKey) {
        self.orphaned_documents.remove(key);
    }

    pub(crate) fn take_orphaned(&mut self) -> BTreeSet<DocumentKey> {
        std::mem::take(&mut self.orphaned_documents)
    }

    pub(crate) fn get_raw(&mut self, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>> {
        self.kv.get(key)
    }

    pub(crate) fn put_raw(&mut self, key: &[u8], value: &[u8]) -> FirestoreResult<()> {
        self.kv.put(key, value)
    }

    pub(crate) fn delete(&mut self, key: &[u8]) -> FirestoreResult<()> {
        self.kv.delete(key)
    }

    pub(crate) fn delete_prefix(&mut self, prefix: &[u8]) -> FirestoreResult<()> {
        self.kv.delete_range(prefix, &prefix_end(prefix))
    }

    pub(crate) fn get_json<T: DeserializeOwned>(&mut self, key: &[u8]) -> FirestoreResult<Option<T>> {
        match self.kv.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn put_json<T: Serialize>(&mut self, key: &[u8], value: &T) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.kv.put(key, &bytes)
    }

    /// Every record whose key starts with `prefix`, in key order.
    pub(crate) fn scan_json<T: DeserializeOwned>(
        &mut self,
        prefix: &[u8],
    ) -> FirestoreResult<Vec<(Vec<u8>, T)>> {
        self.scan_range_json(prefix, &prefix_end(prefix))
    }

    pub(crate) fn scan_range_json<T: DeserializeOwned>(
        &mut self,
        start: &[u8],
        end: &[u8],
    ) -> FirestoreResult<Vec<(Vec<u8>, T)>> {
        self.kv
            .scan(start, end)?
            .into_iter()
            .map(|(key, bytes)| Ok((key, serde_json::from_slice(&bytes)?)))
            .collect()
    }

    pub(crate) fn has_prefix(&mut self, prefix: &[u8]) -> FirestoreResult<bool> {
        Ok(!self.kv.scan(prefix, &prefix_end(prefix))?.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct OwnerRecord {
    owner_id: String,
    lease_timestamp_ms: i64,
    allow_tab_synchronization: bool,
}

/// Liveness record every durable client refreshes periodically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

#[derive(Serialize, Deserialize)]
struct SchemaRecord {
    version: u32,
}

/// Options for a durable persistence.
#[derive(Clone, Debug)]
pub struct DurableOptions {
    pub client_id: Option<String>,
    pub lru_params: LruParams,
    pub allow_tab_synchronization: bool,
}

impl Default for DurableOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            lru_params: LruParams::default(),
            allow_tab_synchronization: false,
        }
    }
}

pub type PrimaryStateListener =
    Arc<dyn Fn(bool) -> BoxFuture<'static, FirestoreResult<()>> + Send + Sync>;

struct LeaseState {
    allow_tab_synchronization: bool,
    network_enabled: bool,
    in_foreground: bool,
    refresh: Option<DelayedOperation>,
    listener: Option<PrimaryStateListener>,
    queue: Option<AsyncQueue>,
}

/// Transactional storage for one client.
///
/// The memory flavour has no lease and collects garbage eagerly; the durable
/// flavour arbitrates a primary lease between clients sharing its store and
/// collects garbage by LRU.
pub struct Persistence {
    kv: Arc<dyn KvStore>,
    delegate: ReferenceDelegate,
    client_id: String,
    durable: bool,
    started: AtomicBool,
    is_primary: AtomicBool,
    listen_sequence: ListenSequence,
    local_view_references: StdMutex<ReferenceSet>,
    lease: StdMutex<LeaseState>,
}

pub fn generate_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn owner_key() -> Vec<u8> {
    KeyBuilder::table("owner").build()
}

fn client_metadata_prefix() -> Vec<u8> {
    KeyBuilder::table("client_metadata").build()
}

fn client_metadata_key(client_id: &str) -> Vec<u8> {
    KeyBuilder::table("client_metadata").string(client_id).build()
}

impl Persistence {
    /// In-memory persistence with eager garbage collection. Always primary.
    pub fn memory() -> Arc<Self> {
        Arc::new(Self::build(
            Arc::new(MemoryKvStore::new()),
            ReferenceDelegate::Eager,
            generate_client_id(),
            false,
            false,
        ))
    }

    /// SQLite-backed persistence at `path`.
    pub fn durable(path: impl AsRef<Path>, options: DurableOptions) -> FirestoreResult<Arc<Self>> {
        let store = SqliteKvStore::open(path)?;
        Self::durable_with_store(Arc::new(store), options)
    }

    /// Durable semantics over an arbitrary store, which several clients may share.
    pub fn durable_with_store(
        store: Arc<dyn KvStore>,
        options: DurableOptions,
    ) -> FirestoreResult<Arc<Self>> {
        let persistence = Self::build(
            store,
            ReferenceDelegate::Lru(options.lru_params),
            options.client_id.unwrap_or_else(generate_client_id),
            true,
            options.allow_tab_synchronization,
        );
        persistence.check_schema()?;
        let highest = persistence.run_transaction("getHighestListenSequenceNumber", TransactionMode::ReadOnly, |txn| {
            Ok(TargetCache::get_target_global(txn)?.highest_listen_sequence_number)
        })?;
        persistence.listen_sequence.observe(highest);
        Ok(Arc::new(persistence))
    }

    fn build(
        kv: Arc<dyn KvStore>,
        delegate: ReferenceDelegate,
        client_id: String,
        durable: bool,
        allow_tab_synchronization: bool,
    ) -> Self {
        Self {
            kv,
            delegate,
            client_id,
            durable,
            started: AtomicBool::new(false),
            is_primary: AtomicBool::new(!durable),
            listen_sequence: ListenSequence::new(0),
            local_view_references: StdMutex::new(ReferenceSet::new()),
            lease: StdMutex::new(LeaseState {
                allow_tab_synchronization,
                network_enabled: true,
                in_foreground: true,
                refresh: None,
                listener: None,
                queue: None,
            }),
        }
    }

    fn check_schema(&self) -> FirestoreResult<()> {
        self.run_transaction("checkSchema", TransactionMode::ReadWrite, |txn| {
            let key = KeyBuilder::table("schema_version").build();
            if let Some(existing) = txn.get_json::<SchemaRecord>(&key)? {
                if existing.version > SCHEMA_VERSION {
                    return Err(failed_precondition(format!(
                        "Store was written by a newer client (schema {}, supported {})",
                        existing.version, SCHEMA_VERSION
                    )));
                }
            }
            txn.put_json(&key, &SchemaRecord { version: SCHEMA_VERSION })
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn reference_delegate(&self) -> &ReferenceDelegate {
        &self.delegate
    }

    pub fn listen_sequence(&self) -> &ListenSequence {
        &self.listen_sequence
    }

    /// Documents pinned by active local views; the garbage collector never
    /// removes them.
    pub fn local_view_references(&self) -> &StdMutex<ReferenceSet> {
        &self.local_view_references
    }

    /// Runs `body` in one storage transaction.
    ///
    /// Commit listeners fire only after a successful commit. In
    /// `ReadWritePrimary` mode a durable persistence first verifies (and
    /// extends) its primary lease and fails with the lease-lost error otherwise.
    pub fn run_transaction<T, F>(&self, action: &str, mode: TransactionMode, body: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        log::debug!(target: LOG_TARGET, "Starting transaction: {action}");
        let readonly = mode == TransactionMode::ReadOnly;
        let sequence_number = if !readonly && self.delegate.is_lru() {
            self.listen_sequence.next()
        } else {
            INVALID_SEQUENCE_NUMBER
        };
        let mut txn = PersistenceTransaction {
            kv: self.kv.begin(readonly)?,
            mode,
            sequence_number,
            delegate: &self.delegate,
            pins: &self.local_view_references,
            orphaned_documents: BTreeSet::new(),
            on_committed: Vec::new(),
        };

        if mode == TransactionMode::ReadWritePrimary && self.durable {
            if !self.verify_primary_lease(&mut txn)? {
                log::debug!(target: LOG_TARGET, "Failed to obtain primary lease for action '{action}'");
                self.set_primary(false);
                return Err(primary_lease_lost());
            }
            self.acquire_or_extend_primary_lease(&mut txn)?;
        }

        let result = body(&mut txn)?;
        self.delegate.on_transaction_committing(&mut txn)?;

        let PersistenceTransaction {
            kv, on_committed, ..
        } = txn;
        kv.commit()?;
        for listener in on_committed {
            listener();
        }
        Ok(result)
    }

    /// Starts lease arbitration (durable only) and the periodic metadata refresh.
    pub fn start(self: &Arc<Self>, queue: &AsyncQueue) -> FirestoreResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        lock(&self.lease).queue = Some(queue.clone());
        if !self.durable {
            return Ok(());
        }
        self.check_exclusive_access()?;
        self.update_client_metadata_and_try_become_primary()?;
        self.schedule_client_metadata_refresh(queue);
        Ok(())
    }

    fn check_exclusive_access(&self) -> FirestoreResult<()> {
        let allow = lock(&self.lease).allow_tab_synchronization;
        let client_id = self.client_id.clone();
        self.run_transaction("checkExclusiveAccess", TransactionMode::ReadOnly, |txn| {
            let Some(owner) = txn.get_json::<OwnerRecord>(&owner_key())? else {
                return Ok(());
            };
            let active = now_ms() - owner.lease_timestamp_ms < MAX_PRIMARY_LEASE_AGE.as_millis() as i64;
            if active && owner.owner_id != client_id && !(allow && owner.allow_tab_synchronization) {
                return Err(failed_precondition(
                    "Another client has exclusive access to the persistence layer; enable tab synchronization on every client to share it.",
                ));
            }
            Ok(())
        })
    }

    fn schedule_client_metadata_refresh(self: &Arc<Self>, queue: &AsyncQueue) {
        let weak = Arc::downgrade(self);
        let refresh_queue = queue.clone();
        let operation = queue.enqueue_after_delay(
            TimerId::ClientMetadataRefresh,
            CLIENT_METADATA_REFRESH_INTERVAL,
            move || {
                async move {
                    let Some(persistence) = weak.upgrade() else {
                        return Ok(());
                    };
                    if !persistence.is_started() {
                        return Ok(());
                    }
                    let result = persistence.update_client_metadata_and_try_become_primary();
                    persistence.schedule_client_metadata_refresh(&refresh_queue);
                    result
                }
                .boxed()
            },
        );
        lock(&self.lease).refresh = Some(operation);
    }

    /// Writes this client's metadata, prunes stale clients and re-evaluates
    /// the lease, notifying the primary-state listener on change.
    pub fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<()> {
        if !self.durable {
            return Ok(());
        }
        let (network_enabled, in_foreground) = {
            let lease = lock(&self.lease);
            (lease.network_enabled, lease.in_foreground)
        };
        let client_id = self.client_id.clone();
        let is_primary = self.run_transaction("updateClientMetadataAndTryBecomePrimary", TransactionMode::ReadWrite, |txn| {
            let now = now_ms();
            txn.put_json(
                &client_metadata_key(&client_id),
                &ClientMetadata {
                    client_id: client_id.clone(),
                    update_time_ms: now,
                    network_enabled,
                    in_foreground,
                },
            )?;
            for (key, metadata) in txn.scan_json::<ClientMetadata>(&client_metadata_prefix())? {
                if now - metadata.update_time_ms > MAX_CLIENT_AGE.as_millis() as i64 {
                    txn.delete(&key)?;
                }
            }
            if self.can_act_as_primary(txn)? {
                self.acquire_or_extend_primary_lease(txn)?;
                Ok(true)
            } else {
                Ok(false)
            }
        })?;
        self.set_primary(is_primary);
        Ok(())
    }

    fn can_act_as_primary(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<bool> {
        let Some(owner) = txn.get_json::<OwnerRecord>(&owner_key())? else {
            return Ok(true);
        };
        if owner.owner_id == self.client_id {
            return Ok(true);
        }
        let lease_age = now_ms() - owner.lease_timestamp_ms;
        Ok(lease_age > MAX_PRIMARY_LEASE_AGE.as_millis() as i64)
    }

    fn verify_primary_lease(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<bool> {
        let Some(owner) = txn.get_json::<OwnerRecord>(&owner_key())? else {
            return Ok(false);
        };
        Ok(owner.owner_id == self.client_id)
    }

    fn acquire_or_extend_primary_lease(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let allow = lock(&self.lease).allow_tab_synchronization;
        txn.put_json(
            &owner_key(),
            &OwnerRecord {
                owner_id: self.client_id.clone(),
                lease_timestamp_ms: now_ms(),
                allow_tab_synchronization: allow,
            },
        )
    }

    fn set_primary(&self, is_primary: bool) {
        let previous = self.is_primary.swap(is_primary, Ordering::SeqCst);
        if previous == is_primary {
            return;
        }
        log::debug!(
            target: LOG_TARGET,
            "Client {} {} the primary lease",
            self.client_id,
            if is_primary { "acquired" } else { "lost" }
        );
        self.notify_primary_state(is_primary);
    }

    fn notify_primary_state(&self, is_primary: bool) {
        let (listener, queue) = {
            let lease = lock(&self.lease);
            (lease.listener.clone(), lease.queue.clone())
        };
        if let (Some(listener), Some(queue)) = (listener, queue) {
            queue.enqueue_retryable(move || listener(is_primary));
        }
    }

    /// Registers the callback told about primary-state changes; it is also
    /// called with the current state.
    pub fn set_primary_state_listener(&self, listener: PrimaryStateListener) {
        lock(&self.lease).listener = Some(listener);
        self.notify_primary_state(self.is_primary());
    }

    pub fn set_network_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        let changed = {
            let mut lease = lock(&self.lease);
            let changed = lease.network_enabled != enabled;
            lease.network_enabled = enabled;
            changed
        };
        if changed && self.is_started() {
            self.update_client_metadata_and_try_become_primary()?;
        }
        Ok(())
    }

    /// Ids of clients whose metadata is fresh, this client included.
    pub fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        self.run_transaction("getActiveClients", TransactionMode::ReadOnly, |txn| {
            let now = now_ms();
            Ok(txn
                .scan_json::<ClientMetadata>(&client_metadata_prefix())?
                .into_iter()
                .filter(|(_, metadata)| now - metadata.update_time_ms <= MAX_CLIENT_AGE.as_millis() as i64)
                .map(|(_, metadata)| metadata.client_id)
                .collect())
        })
    }

    /// Releases the lease and this client's metadata.
    pub fn shutdown(&self) -> FirestoreResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let refresh = lock(&self.lease).refresh.take();
        if let Some(refresh) = refresh {
            refresh.cancel();
        }
        if !self.durable {
            return Ok(());
        }
        let client_id = self.client_id.clone();
        self.run_transaction("shutdown", TransactionMode::ReadWrite, |txn| {
            if let Some(owner) = txn.get_json::<OwnerRecord>(&owner_key())? {
                if owner.owner_id == client_id {
                    txn.delete(&owner_key())?;
                }
            }
            txn.delete(&client_metadata_key(&client_id))
        })?;
        self.is_primary.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("client_id", &self.client_id)
            .field("durable", &self.durable)
            .field("is_primary", &self.is_primary())
            .finish()
    }
}

pub(crate) fn ensure(condition: bool, message: &str) -> FirestoreResult<()> {
    if condition {
        Ok(())
    } else {
        Err(internal_error(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn commit_listeners_fire_only_on_success() {
        let persistence = Persistence::memory();
        let fired = Rc::new(Cell::new(0));

        let counter = Rc::clone(&fired);
        persistence
            .run_transaction("ok", TransactionMode::ReadWrite, |txn| {
                txn.add_on_committed_listener(move || counter.set(counter.get() + 1));
                txn.put_raw(b"k", b"v")
            })
            .unwrap();

        let counter = Rc::clone(&fired);
        let result: FirestoreResult<()> =
            persistence.run_transaction("fails", TransactionMode::ReadWrite, |txn| {
                txn.add_on_committed_listener(move || counter.set(counter.get() + 10));
                txn.put_raw(b"k2", b"v")?;
                Err(internal_error("boom"))
            });
        assert!(result.is_err());
        assert_eq!(fired.get(), 1);

        let missing = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| txn.get_raw(b"k2"))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn memory_persistence_ignores_primary_mode() {
        let persistence = Persistence::memory();
        assert!(persistence.is_primary());
        persistence
            .run_transaction("primary", TransactionMode::ReadWritePrimary, |txn| {
                txn.put_raw(b"k", b"v")
            })
            .unwrap();
    }

    #[tokio::test]
    async fn only_one_durable_client_holds_the_lease() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let options = DurableOptions {
            allow_tab_synchronization: true,
            ..DurableOptions::default()
        };
        let queue = AsyncQueue::new();
        let first = Persistence::durable_with_store(Arc::clone(&store), options.clone()).unwrap();
        let second = Persistence::durable_with_store(Arc::clone(&store), options).unwrap();
        first.start(&queue).unwrap();
        second.start(&queue).unwrap();

        assert!(first.is_primary());
        assert!(!second.is_primary());
        let err = second
            .run_transaction("write", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .unwrap_err();
        assert!(err.is_primary_lease_lost());
        assert_eq!(first.get_active_clients().unwrap().len(), 2);

        first.shutdown().unwrap();
        second.update_client_metadata_and_try_become_primary().unwrap();
        assert!(second.is_primary());
    }

    #[tokio::test]
    async fn exclusive_access_without_tab_synchronization() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let queue = AsyncQueue::new();
        let first = Persistence::durable_with_store(Arc::clone(&store), DurableOptions::default()).unwrap();
        first.start(&queue).unwrap();
        let second = Persistence::durable_with_store(store, DurableOptions::default()).unwrap();
        let err = second.start(&queue).unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }

    #[test]
    fn newer_schema_is_rejected() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let mut txn = store.begin(false).unwrap();
            txn.put(
                &KeyBuilder::table("schema_version").build(),
                &serde_json::to_vec(&SchemaRecord { version: SCHEMA_VERSION + 1 }).unwrap(),
            )
            .unwrap();
            txn.commit().unwrap();
        }
        let err = Persistence::durable_with_store(store, DurableOptions::default()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
    }
}
