use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{DocumentSet, Query};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Removals first, then additions, then modifications.
    fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }

    pub(crate) fn compare(self, other: ChangeType) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: MutableDocument,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: MutableDocument) -> Self {
        Self {
            change_type,
            document,
        }
    }
}

/// Per-key accumulator folding successive changes into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) -> FirestoreResult<()> {
        use ChangeType::*;

        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return Ok(());
        };
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(DocumentViewChange::new(new_type, change.document)),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange::new(old_type, change.document)),
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.document)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.document)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.document)),
            (old_type, new_type) => {
                return Err(internal_error(format!(
                    "unsupported combination of changes {new_type:?} after {old_type:?} for {}",
                    key.path().canonical_string()
                )))
            }
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    /// Tracked changes in key order.
    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Whether a view is in line with the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Results may lag the server: the target is not current or documents
    /// are in limbo.
    Local,
    Synced,
}

/// One consistent state of a query's results together with the changes
/// that led to it.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub document_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot reporting every document of `documents` as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(ChangeType::Added, document.clone()))
            .collect();
        Self {
            query,
            old_documents: documents.empty_like(),
            documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: true,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// The same snapshot without metadata-only changes.
    pub fn without_metadata_changes(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot
            .document_changes
            .retain(|change| change.change_type != ChangeType::Metadata);
        snapshot.excludes_metadata_changes = true;
        snapshot
    }
}

impl PartialEq for ViewSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.from_cache == other.from_cache
            && self.has_cached_results == other.has_cached_results
            && self.sync_state_changed == other.sync_state_changed
            && self.mutated_keys == other.mutated_keys
            && self.query == other.query
            && self.documents == other.documents
            && self.old_documents == other.old_documents
            && self.document_changes == other.document_changes
    }
}
