use std::collections::BTreeSet;

use crate::firestore::core::{LruParams, INVALID_SEQUENCE_NUMBER};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::target_cache::SENTINEL_TARGET_ID;
use crate::firestore::local::{
    MutationQueue, PersistenceTransaction, RemoteDocumentCache, TargetCache, TargetData,
};
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, TargetId};
use crate::firestore::util::async_queue::lock;

/// Garbage-collection strategy of a [`Persistence`](super::Persistence).
///
/// Documents are referenced by targets, by pending mutations and by the
/// local-view pins of active queries. `Eager` deletes a cached document in
/// the transaction that drops its last reference. `Lru` stamps every touch
/// with the transaction's sequence number and leaves removal to the
/// [`LruGarbageCollector`](super::LruGarbageCollector).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReferenceDelegate {
    Eager,
    Lru(LruParams),
}

impl ReferenceDelegate {
    pub fn is_lru(&self) -> bool {
        matches!(self, ReferenceDelegate::Lru(_))
    }

    pub fn lru_params(&self) -> Option<LruParams> {
        match self {
            ReferenceDelegate::Lru(params) => Some(*params),
            ReferenceDelegate::Eager => None,
        }
    }

    pub fn add_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        match self {
            ReferenceDelegate::Eager => {
                txn.unmark_orphaned(key);
                Ok(())
            }
            ReferenceDelegate::Lru(_) => write_sentinel(txn, key),
        }
    }

    pub fn remove_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.touch(txn, key)
    }

    pub fn remove_mutation_reference(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.touch(txn, key)
    }

    /// Called when a limbo resolution settles `key`.
    pub fn update_limbo_document(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.touch(txn, key)
    }

    fn touch(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        match self {
            ReferenceDelegate::Eager => {
                txn.mark_orphaned(key.clone());
                Ok(())
            }
            ReferenceDelegate::Lru(_) => write_sentinel(txn, key),
        }
    }

    /// A target is no longer listened to. Eager collection drops it with its
    /// keys; LRU only refreshes its sequence number.
    pub fn remove_target(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target_data: &TargetData,
    ) -> FirestoreResult<()> {
        match self {
            ReferenceDelegate::Eager => {
                for key in TargetCache::get_matching_keys_for_target_id(txn, target_data.target_id)? {
                    txn.mark_orphaned(key);
                }
                TargetCache::remove_target_data(txn, target_data)
            }
            ReferenceDelegate::Lru(_) => {
                let updated = target_data.with_sequence_number(txn.current_sequence_number());
                TargetCache::update_target_data(txn, &updated)
            }
        }
    }

    /// Runs right before commit; eager collection prunes what lost its last
    /// reference during the transaction.
    pub(crate) fn on_transaction_committing(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        if let ReferenceDelegate::Eager = self {
            for key in txn.take_orphaned() {
                if !is_referenced(txn, &key)? {
                    RemoteDocumentCache::remove_entry(txn, &key)?;
                }
            }
        }
        Ok(())
    }

    /// Targets plus orphaned documents: everything the LRU collector ranks.
    pub fn get_sequence_number_count(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<u64> {
        let targets = TargetCache::get_target_count(txn)?;
        let orphaned = orphaned_sequence_numbers(txn)?.len() as u64;
        Ok(targets + orphaned)
    }

    /// The `n`-th smallest sequence number among targets and orphaned documents.
    pub fn nth_sequence_number(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        n: u64,
    ) -> FirestoreResult<ListenSequenceNumber> {
        if n == 0 {
            return Ok(INVALID_SEQUENCE_NUMBER);
        }
        let mut numbers: Vec<ListenSequenceNumber> = TargetCache::get_all_target_data(txn)?
            .into_iter()
            .map(|target_data| target_data.sequence_number)
            .collect();
        numbers.extend(orphaned_sequence_numbers(txn)?);
        numbers.sort_unstable();
        let index = usize::try_from(n - 1).unwrap_or(usize::MAX).min(numbers.len().saturating_sub(1));
        Ok(numbers.get(index).copied().unwrap_or(INVALID_SEQUENCE_NUMBER))
    }

    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        TargetCache::remove_targets(txn, upper_bound, active_target_ids)
    }

    /// Deletes documents no target, mutation or pin references whose last
    /// touch is at or below `upper_bound`.
    pub fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for row in TargetCache::sentinel_rows(txn)? {
            let sequence_number = row.sequence_number.unwrap_or(INVALID_SEQUENCE_NUMBER);
            if sequence_number > upper_bound || is_referenced(txn, &row.key)? {
                continue;
            }
            RemoteDocumentCache::remove_entry(txn, &row.key)?;
            TargetCache::delete_row(txn, SENTINEL_TARGET_ID, &row.key)?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn get_cache_size(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        RemoteDocumentCache::byte_size(txn)
    }
}

fn write_sentinel(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
    let sequence_number = txn.current_sequence_number();
    TargetCache::put_row(txn, SENTINEL_TARGET_ID, key, Some(sequence_number))
}

fn is_pinned(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
    if lock(txn.in_memory_pins()).contains_key(key) {
        return Ok(true);
    }
    MutationQueue::any_queue_contains_key(txn, key)
}

fn is_referenced(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
    Ok(TargetCache::contains_key(txn, key)? || is_pinned(txn, key)?)
}

/// Sentinel sequence numbers of documents no real target contains.
fn orphaned_sequence_numbers(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<Vec<ListenSequenceNumber>> {
    let mut numbers = Vec::new();
    for row in TargetCache::sentinel_rows(txn)? {
        if !TargetCache::contains_key(txn, &row.key)? {
            numbers.push(row.sequence_number.unwrap_or(INVALID_SEQUENCE_NUMBER));
        }
    }
    Ok(numbers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::{Persistence, TargetPurpose, TransactionMode};
    use crate::firestore::model::{MutableDocument, ObjectValue, ResourcePath, SnapshotVersion, Timestamp};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn cached(txn: &mut PersistenceTransaction<'_>, path: &str) -> FirestoreResult<()> {
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        let document = MutableDocument::new_found_document(key(path), version, ObjectValue::empty());
        RemoteDocumentCache::add_entry(txn, &document, version)
    }

    #[test]
    fn eager_delegate_prunes_unreferenced_documents_at_commit() {
        let persistence = Persistence::memory();
        let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
        let target_data = TargetData::new(target, 2, TargetPurpose::Listen, 0);

        persistence
            .run_transaction("add", TransactionMode::ReadWrite, |txn| {
                cached(txn, "rooms/a")?;
                cached(txn, "rooms/b")?;
                TargetCache::add_target_data(txn, &target_data)?;
                TargetCache::add_matching_keys(txn, [&key("rooms/a"), &key("rooms/b")], 2)
            })
            .unwrap();
        lock(persistence.local_view_references()).add_reference(key("rooms/b"), 2);

        persistence
            .run_transaction("release", TransactionMode::ReadWrite, |txn| {
                txn.reference_delegate().remove_target(txn, &target_data)
            })
            .unwrap();

        persistence
            .run_transaction("check", TransactionMode::ReadOnly, |txn| {
                assert!(!RemoteDocumentCache::get_entry(txn, &key("rooms/a"))?.is_valid_document());
                assert!(RemoteDocumentCache::get_entry(txn, &key("rooms/b"))?.is_found_document());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn lru_delegate_counts_and_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::durable(dir.path().join("lru.sqlite"), Default::default()).unwrap();
        let delegate = *persistence.reference_delegate();
        assert!(delegate.is_lru());

        persistence
            .run_transaction("orphan", TransactionMode::ReadWrite, |txn| {
                cached(txn, "rooms/a")?;
                delegate.update_limbo_document(txn, &key("rooms/a"))
            })
            .unwrap();
        persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                assert_eq!(delegate.get_sequence_number_count(txn)?, 1);
                let upper = delegate.nth_sequence_number(txn, 1)?;
                assert_eq!(delegate.remove_orphaned_documents(txn, upper)?, 1);
                assert_eq!(delegate.get_cache_size(txn)?, 0);
                Ok(())
            })
            .unwrap();
    }
}
