use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::core::{DocumentComparator, DocumentSet, LimitType, OnlineState, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{DocumentMap, QueryResult};
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::remote::TargetChange;

/// A document entering or leaving limbo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Result of [`View::compute_doc_changes`], applied with
/// [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// A full limit lost a document; the caller has to re-run the query
    /// against the local store and feed the result back in.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// The results of one query, reconciled against the server's view of the
/// target and the client's pending writes.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    /// Whether the target is current with the backend.
    current: bool,
    document_set: DocumentSet,
    /// Keys the server says belong to the target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
    has_cached_results: bool,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
            has_cached_results: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Diffs `doc_changes` against the current results without modifying
    /// the view. Pass the previous result as `previous` when feeding back a
    /// refill query.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> FirestoreResult<ViewDocumentChanges> {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        // The old boundary of a full limit. Edits that push a document past
        // it, or deletes, may let some other cached document take its place.
        let full = self.query.limit().map(|limit| old_document_set.len() == limit as usize) == Some(true);
        let last_in_limit = (full && self.query.limit_type() == LimitType::First)
            .then(|| old_document_set.last().cloned())
            .flatten();
        let first_in_limit = (full && self.query.limit_type() == LimitType::Last)
            .then(|| old_document_set.first().cloned())
            .flatten();

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);
            let old_had_pending = old_doc
                .map(|doc| self.mutated_keys.contains(doc.key()))
                .unwrap_or(false);
            let new_has_pending = new_doc
                .map(|doc| {
                    doc.has_local_mutations()
                        || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new_doc.clone()))?;
                            change_applied = true;
                            let past_last = last_in_limit
                                .as_ref()
                                .map(|last| (self.comparator)(new_doc, last) == Ordering::Greater)
                                .unwrap_or(false);
                            let before_first = first_in_limit
                                .as_ref()
                                .map(|first| (self.comparator)(new_doc, first) == Ordering::Less)
                                .unwrap_or(false);
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new_doc.clone()))?;
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()))?;
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()))?;
                    change_applied = true;
                    if last_in_limit.is_some() || first_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.insert(new_doc.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while document_set.len() > limit as usize {
                let dropped = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(dropped) = dropped else {
                    break;
                };
                document_set.remove(dropped.key());
                mutated_keys.remove(dropped.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, dropped))?;
            }
        }

        Ok(ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        })
    }

    /// Commits `doc_changes` and the server's `target_change` to the view.
    /// Yields a snapshot only when the documents or the sync state changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .compare(right.change_type)
                .then_with(|| (self.comparator)(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        let has_cached_results = target_change
            .map(|change| !change.resume_token.is_empty())
            .unwrap_or(false);
        self.has_cached_results = self.has_cached_results || has_cached_results;
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.document_set.clone(),
                old_documents,
                document_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
                has_cached_results,
            }),
            limbo_changes,
        }
    }

    /// Going offline drops a current view back to Local; coming back
    /// online waits for the next target change instead.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if !(self.current && online_state == OnlineState::Offline) {
            return ViewChange::default();
        }
        self.current = false;
        let unchanged = ViewDocumentChanges {
            document_set: self.document_set.clone(),
            change_set: DocumentChangeSet::new(),
            mutated_keys: self.mutated_keys.clone(),
            needs_refill: false,
        };
        self.apply_changes(unchanged, false, None, false)
    }

    /// Rebuilds the view from what is persisted, as done when a client
    /// becomes primary.
    pub fn synchronize_with_persisted_state(&mut self, query_result: QueryResult) -> FirestoreResult<ViewChange> {
        self.synced_documents = query_result.remote_keys;
        self.limbo_documents.clear();
        let doc_changes = self.compute_doc_changes(&query_result.documents, None)?;
        Ok(self.apply_changes(doc_changes, true, None, false))
    }

    /// Snapshot of the current results as a first event.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            self.has_cached_results,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // local changes may explain why the server does not list it
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // limbo can only be judged against a current target
        if !self.current {
            return Vec::new();
        }
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();
        let old_limbo = std::mem::replace(&mut self.limbo_documents, new_limbo);

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&self.limbo_documents)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            self.limbo_documents
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        changes
    }
}

/// A write acknowledgement can change a document (server transforms) right
/// before watch sends the same state again; the intermediate event is
/// suppressed.
fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}
