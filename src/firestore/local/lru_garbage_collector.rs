use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::FutureExt;

use crate::firestore::core::settings::{LRU_INITIAL_GC_DELAY, LRU_REGULAR_GC_DELAY};
use crate::firestore::core::LruParams;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{LocalStore, PersistenceTransaction};
use crate::firestore::model::TargetId;
use crate::firestore::util::async_queue::lock;
use crate::firestore::util::{AsyncQueue, DelayedOperation, TimerId};

const LOG_TARGET: &str = "LruGarbageCollector";

/// Outcome of one collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: u64,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    fn skipped() -> Self {
        Self::default()
    }
}

/// Removes the least recently used targets and orphaned documents once the
/// cache outgrows its threshold.
#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// How many sequence numbers make up `percentile` percent of the cache.
    pub fn calculate_target_count(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        percentile: u32,
    ) -> FirestoreResult<u64> {
        let count = txn.reference_delegate().get_sequence_number_count(txn)?;
        Ok(count * u64::from(percentile) / 100)
    }

    /// Collects unless collection is disabled or the cache is below its threshold.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        if self.params.is_disabled() {
            log::debug!(target: LOG_TARGET, "Garbage collection skipped; disabled");
            return Ok(LruResults::skipped());
        }
        let cache_size = txn.reference_delegate().get_cache_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                target: LOG_TARGET,
                "Garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::skipped());
        }
        self.run_garbage_collection(txn, active_target_ids)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<LruResults> {
        let delegate = txn.reference_delegate();
        let mut to_collect = self.calculate_target_count(txn, self.params.percentile_to_collect)?;
        if to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                target: LOG_TARGET,
                "Capping sequence numbers to collect down to the maximum of {} from {to_collect}",
                self.params.maximum_sequence_numbers_to_collect
            );
            to_collect = self.params.maximum_sequence_numbers_to_collect;
        }
        let upper_bound = delegate.nth_sequence_number(txn, to_collect)?;
        let targets_removed = delegate.remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = delegate.remove_orphaned_documents(txn, upper_bound)?;
        log::debug!(
            target: LOG_TARGET,
            "LRU garbage collection: counted {to_collect} sequence numbers, removed {targets_removed} targets and {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        })
    }
}

/// Runs [`LocalStore::collect_garbage`] on the async queue: first after
/// [`LRU_INITIAL_GC_DELAY`], then every [`LRU_REGULAR_GC_DELAY`].
pub struct LruScheduler {
    collector: LruGarbageCollector,
    queue: AsyncQueue,
    local_store: Weak<LocalStore>,
    state: StdMutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    has_run: bool,
    task: Option<DelayedOperation>,
}

impl LruScheduler {
    pub fn new(collector: LruGarbageCollector, queue: AsyncQueue, local_store: &Arc<LocalStore>) -> Arc<Self> {
        Arc::new(Self {
            collector,
            queue,
            local_store: Arc::downgrade(local_store),
            state: StdMutex::new(SchedulerState::default()),
        })
    }

    pub fn is_started(&self) -> bool {
        lock(&self.state).task.is_some()
    }

    pub fn start(self: &Arc<Self>) {
        if self.collector.params().is_disabled() {
            return;
        }
        self.schedule();
    }

    pub fn stop(&self) {
        if let Some(task) = lock(&self.state).task.take() {
            task.cancel();
        }
    }

    fn schedule(self: &Arc<Self>) {
        let delay = if lock(&self.state).has_run {
            LRU_REGULAR_GC_DELAY
        } else {
            LRU_INITIAL_GC_DELAY
        };
        log::debug!(target: LOG_TARGET, "Garbage collection scheduled in {}ms", delay.as_millis());
        let weak = Arc::downgrade(self);
        let task = self.queue.enqueue_after_delay(TimerId::GarbageCollection, delay, move || {
            async move {
                let Some(scheduler) = weak.upgrade() else {
                    return Ok(());
                };
                scheduler.run_once();
                scheduler.schedule();
                Ok(())
            }
            .boxed()
        });
        lock(&self.state).task = Some(task);
    }

    fn run_once(&self) {
        {
            let mut state = lock(&self.state);
            state.task = None;
            state.has_run = true;
        }
        let Some(local_store) = self.local_store.upgrade() else {
            return;
        };
        match local_store.collect_garbage(&self.collector) {
            Ok(_) => {}
            Err(err) if err.is_primary_lease_lost() => {
                log::debug!(target: LOG_TARGET, "Ignoring garbage collection on a secondary client");
            }
            Err(err) if err.is_storage_failure() => {
                log::debug!(target: LOG_TARGET, "Ignoring storage failure during garbage collection: {err}");
            }
            Err(err) => {
                log::error!(target: LOG_TARGET, "Garbage collection failed: {err}");
            }
        }
    }
}
