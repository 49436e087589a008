use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::{Target, TargetIdGenerator};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded::KeyBuilder;
use crate::firestore::local::{PersistenceTransaction, TargetData};
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Target id under which the LRU delegate records per-document sequence numbers.
pub(crate) const SENTINEL_TARGET_ID: TargetId = 0;

/// Singleton metadata record of the target cache.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct TargetDocumentRow {
    pub key: DocumentKey,
    /// Only set on sentinel rows.
    #[serde(default)]
    pub sequence_number: Option<ListenSequenceNumber>,
}

fn global_key() -> Vec<u8> {
    KeyBuilder::table("target_global").build()
}

fn target_key(target_id: TargetId) -> Vec<u8> {
    KeyBuilder::table("targets").i32(target_id).build()
}

fn targets_prefix() -> Vec<u8> {
    KeyBuilder::table("targets").build()
}

fn canonical_prefix(canonical_id: &str) -> Vec<u8> {
    KeyBuilder::table("target_canonical").string(canonical_id).build()
}

fn canonical_key(canonical_id: &str, target_id: TargetId) -> Vec<u8> {
    KeyBuilder::table("target_canonical")
        .string(canonical_id)
        .i32(target_id)
        .build()
}

pub(crate) fn target_documents_prefix(target_id: TargetId) -> Vec<u8> {
    KeyBuilder::table("target_documents").i32(target_id).build()
}

pub(crate) fn target_document_key(target_id: TargetId, key: &DocumentKey) -> Vec<u8> {
    KeyBuilder::table("target_documents")
        .i32(target_id)
        .document_key(key)
        .build()
}

fn document_targets_prefix(key: &DocumentKey) -> Vec<u8> {
    KeyBuilder::table("document_targets").document_key(key).build()
}

fn document_target_key(key: &DocumentKey, target_id: TargetId) -> Vec<u8> {
    KeyBuilder::table("document_targets")
        .document_key(key)
        .i32(target_id)
        .build()
}

/// Persisted targets, the global target metadata and the matching keys of
/// every target.
///
/// Membership rows are kept in two indexes, `target -> documents` and
/// `document -> targets`, written together.
pub struct TargetCache;

impl TargetCache {
    pub fn get_target_global(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<TargetGlobal> {
        Ok(txn.get_json(&global_key())?.unwrap_or_default())
    }

    fn save_target_global(txn: &mut PersistenceTransaction<'_>, global: &TargetGlobal) -> FirestoreResult<()> {
        txn.put_json(&global_key(), global)
    }

    /// Next free even target id; the returned id is reserved even if the
    /// target is never added.
    pub fn allocate_target_id(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<TargetId> {
        let mut global = Self::get_target_global(txn)?;
        let target_id = TargetIdGenerator::for_target_cache_after(global.highest_target_id).next_id();
        global.highest_target_id = target_id;
        Self::save_target_global(txn, &global)?;
        Ok(target_id)
    }

    pub fn get_highest_sequence_number(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<ListenSequenceNumber> {
        Ok(Self::get_target_global(txn)?.highest_listen_sequence_number)
    }

    pub fn get_last_remote_snapshot_version(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<SnapshotVersion> {
        Ok(Self::get_target_global(txn)?.last_remote_snapshot_version)
    }

    pub fn set_target_global(
        txn: &mut PersistenceTransaction<'_>,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let mut global = Self::get_target_global(txn)?;
        global.highest_listen_sequence_number = highest_listen_sequence_number;
        global.last_remote_snapshot_version = last_remote_snapshot_version;
        Self::save_target_global(txn, &global)
    }

    pub fn get_target_count(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<u64> {
        Ok(Self::get_target_global(txn)?.target_count)
    }

    pub fn add_target_data(txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        Self::save_target_data(txn, target_data)?;
        let mut global = Self::get_target_global(txn)?;
        global.target_count += 1;
        Self::update_global_from_target(&mut global, target_data);
        Self::save_target_global(txn, &global)
    }

    pub fn update_target_data(txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        Self::save_target_data(txn, target_data)?;
        let mut global = Self::get_target_global(txn)?;
        if Self::update_global_from_target(&mut global, target_data) {
            Self::save_target_global(txn, &global)?;
        }
        Ok(())
    }

    fn save_target_data(txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        txn.put_json(&target_key(target_data.target_id), target_data)?;
        txn.put_json(
            &canonical_key(&target_data.target.canonical_id(), target_data.target_id),
            &target_data.target_id,
        )
    }

    fn update_global_from_target(global: &mut TargetGlobal, target_data: &TargetData) -> bool {
        let mut updated = false;
        if target_data.target_id > global.highest_target_id {
            global.highest_target_id = target_data.target_id;
            updated = true;
        }
        if target_data.sequence_number > global.highest_listen_sequence_number {
            global.highest_listen_sequence_number = target_data.sequence_number;
            updated = true;
        }
        updated
    }

    /// Removes the target and its matching keys without consulting the
    /// reference delegate.
    pub fn remove_target_data(txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        Self::remove_matching_keys_for_target_id(txn, target_data.target_id)?;
        txn.delete(&target_key(target_data.target_id))?;
        txn.delete(&canonical_key(&target_data.target.canonical_id(), target_data.target_id))?;
        let mut global = Self::get_target_global(txn)?;
        global.target_count = global.target_count.saturating_sub(1);
        Self::save_target_global(txn, &global)
    }

    /// The cached target equal to `target`, if any.
    pub fn get_target_data(
        txn: &mut PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let canonical_id = target.canonical_id();
        for (_, target_id) in txn.scan_json::<TargetId>(&canonical_prefix(&canonical_id))? {
            if let Some(target_data) = Self::get_target_data_by_id(txn, target_id)? {
                // canonical ids may collide; confirm the target itself
                if &target_data.target == target {
                    return Ok(Some(target_data));
                }
            }
        }
        Ok(None)
    }

    pub fn get_target_data_by_id(
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        txn.get_json(&target_key(target_id))
    }

    pub fn get_all_target_data(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<Vec<TargetData>> {
        Ok(txn
            .scan_json::<TargetData>(&targets_prefix())?
            .into_iter()
            .map(|(_, target_data)| target_data)
            .collect())
    }

    /// Removes every target with a sequence number at or below `upper_bound`
    /// that is not in `active_target_ids`. Returns how many were removed.
    pub fn remove_targets(
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for target_data in Self::get_all_target_data(txn)? {
            if target_data.sequence_number <= upper_bound
                && !active_target_ids.contains(&target_data.target_id)
            {
                Self::remove_target_data(txn, &target_data)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn add_matching_keys<'k, I>(
        txn: &mut PersistenceTransaction<'_>,
        keys: I,
        target_id: TargetId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let delegate = txn.reference_delegate();
        for key in keys {
            Self::put_row(txn, target_id, key, None)?;
            delegate.add_reference(txn, target_id, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k, I>(
        txn: &mut PersistenceTransaction<'_>,
        keys: I,
        target_id: TargetId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let delegate = txn.reference_delegate();
        for key in keys {
            Self::delete_row(txn, target_id, key)?;
            delegate.remove_reference(txn, target_id, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target_id(
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in Self::get_matching_keys_for_target_id(txn, target_id)? {
            Self::delete_row(txn, target_id, &key)?;
        }
        Ok(())
    }

    pub fn get_matching_keys_for_target_id(
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        Ok(txn
            .scan_json::<TargetDocumentRow>(&target_documents_prefix(target_id))?
            .into_iter()
            .map(|(_, row)| row.key)
            .collect())
    }

    /// Whether any real target (not the sentinel) contains `key`.
    pub fn contains_key(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(txn
            .scan_json::<TargetId>(&document_targets_prefix(key))?
            .into_iter()
            .any(|(_, target_id)| target_id != SENTINEL_TARGET_ID))
    }

    pub(crate) fn put_row(
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
        key: &DocumentKey,
        sequence_number: Option<ListenSequenceNumber>,
    ) -> FirestoreResult<()> {
        txn.put_json(
            &target_document_key(target_id, key),
            &TargetDocumentRow {
                key: key.clone(),
                sequence_number,
            },
        )?;
        txn.put_json(&document_target_key(key, target_id), &target_id)
    }

    pub(crate) fn delete_row(
        txn: &mut PersistenceTransaction<'_>,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        txn.delete(&target_document_key(target_id, key))?;
        txn.delete(&document_target_key(key, target_id))
    }

    pub(crate) fn sentinel_rows(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<Vec<TargetDocumentRow>> {
        Ok(txn
            .scan_json::<TargetDocumentRow>(&target_documents_prefix(SENTINEL_TARGET_ID))?
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }
}
