use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

const LOG_TARGET: &str = "WatchChangeAggregator";

/// What the aggregator needs to know about the targets the client listens to.
pub trait TargetMetadataProvider {
    /// Keys the target contained as of the last raised snapshot.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data of an active listen, `None` once the target was removed.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug)]
struct TargetState {
    /// Acks still owed by the server for add/remove requests.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // a fresh target always raises an initial change
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => change.added_documents.insert(key.clone()),
                ChangeType::Modified => change.modified_documents.insert(key.clone()),
                ChangeType::Removed => change.removed_documents.insert(key.clone()),
            };
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        if self.pending_responses < 0 {
            log::error!(target: LOG_TARGET, "received more target acks than requests");
            self.pending_responses = 0;
        }
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds watch changes into per-target state until the server declares a
/// consistent snapshot, then emits everything as one [`RemoteEvent`].
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_document_change(&mut self, change: DocumentChange, meta: &dyn TargetMetadataProvider) {
        for target_id in &change.updated_target_ids {
            match &change.document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone(), meta)
                }
                other => self.remove_document_from_target(*target_id, &change.key, other.clone(), meta),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.document.clone(), meta);
        }
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange, meta: &dyn TargetMetadataProvider) {
        for target_id in self.targets_of(change, meta) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, meta) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // a re-added target starts from scratch
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, meta) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, meta) {
                        self.reset_target(target_id, meta);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the server's count with the local one and resets the target
    /// on disagreement.
    pub fn handle_existence_filter(&mut self, filter: ExistenceFilterChange, meta: &dyn TargetMetadataProvider) {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id, meta) else {
            return;
        };
        if target_data.target.is_document_target() {
            if filter.count == 0 {
                // the document is gone; delete it now so no other query keeps showing it
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, &key, Some(deleted), meta);
                }
            } else if filter.count != 1 {
                log::error!(
                    target: LOG_TARGET,
                    "single document existence filter with count {}",
                    filter.count
                );
            }
            return;
        }

        let current_size = self.current_document_count_for_target(target_id, meta);
        if current_size != i64::from(filter.count) {
            log::debug!(
                target: LOG_TARGET,
                "existence filter mismatch for target {target_id}: expected {}, have {current_size}",
                filter.count
            );
            self.reset_target(target_id, meta);
            self.pending_target_resets
                .insert(target_id, TargetPurpose::ExistenceFilterMismatch);
        }
    }

    /// Turns the accumulated changes into a [`RemoteEvent`] at
    /// `snapshot_version` and starts accumulating afresh.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        meta: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, meta) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // an empty document target means the document does not exist
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let updated = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .map(|targets| targets.contains(&target_id))
                        .unwrap_or(false);
                    if !updated && !self.target_contains_document(target_id, &key, meta) {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted), meta);
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, meta)
                    .map(|data| data.purpose == TargetPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Every add or remove request sent for `target_id` owes one ack.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn targets_of(&self, change: &WatchTargetChange, meta: &dyn TargetMetadataProvider) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        let mut targets: Vec<TargetId> = self
            .target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, meta))
            .collect();
        targets.sort_unstable();
        targets
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MutableDocument,
        meta: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, meta) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, meta) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
        meta: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, meta) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, meta);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // entered and left again before a snapshot was raised
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId, meta: &dyn TargetMetadataProvider) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        meta.get_remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId, meta: &dyn TargetMetadataProvider) -> bool {
        let active = self.target_data_for_active_target(target_id, meta).is_some();
        if !active {
            log::debug!(target: LOG_TARGET, "detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        meta: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => meta.get_target_data_for_target(target_id),
        }
    }

    /// Starts the target over and synthesizes removes for everything it held;
    /// the server re-adds what still matches before the next snapshot.
    fn reset_target(&mut self, target_id: TargetId, meta: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::default());
        for key in meta.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, meta);
        }
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        meta: &dyn TargetMetadataProvider,
    ) -> bool {
        meta.get_remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, Target};
    use crate::firestore::model::{ObjectValue, ResourcePath, Timestamp};

    #[derive(Default)]
    struct Targets {
        data: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl Targets {
        fn listen(&mut self, target_id: TargetId, target: Target, purpose: TargetPurpose) {
            self.data
                .insert(target_id, TargetData::new(target, target_id, purpose, 1));
        }
    }

    impl TargetMetadataProvider for Targets {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.data.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            key(path),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::empty(),
        )
    }

    fn rooms() -> Target {
        Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn added(target_id: TargetId, path: &str) -> DocumentChange {
        DocumentChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            key: key(path),
            document: Some(doc(path)),
        }
    }

    #[test]
    fn removal_waits_for_outstanding_acks() {
        let mut targets = Targets::default();
        targets.listen(2, rooms(), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator.record_pending_target_request(2);
        aggregator.record_pending_target_request(2);

        let removed = WatchTargetChange::new(TargetChangeState::Removed, vec![2]);
        aggregator.handle_target_change(&removed, &targets);
        assert!(aggregator.target_states.contains_key(&2));

        let ack = WatchTargetChange::new(TargetChangeState::Added, vec![2]);
        aggregator.handle_target_change(&ack, &targets);
        aggregator.handle_document_change(added(2, "rooms/ignored"), &targets);
        assert!(aggregator.pending_document_updates.is_empty());

        aggregator.handle_target_change(&ack, &targets);
        aggregator.handle_document_change(added(2, "rooms/a"), &targets);
        let event = aggregator.create_remote_event(version(3), &targets);
        assert!(event.target_changes[&2].added_documents.contains(&key("rooms/a")));
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(3));
    }

    #[test]
    fn removed_ack_drops_target_state() {
        let mut targets = Targets::default();
        targets.listen(2, rooms(), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Removed, vec![2]), &targets);
        assert!(!aggregator.target_states.contains_key(&2));
    }

    #[test]
    fn current_document_target_without_document_synthesizes_delete() {
        let mut targets = Targets::default();
        targets.listen(3, Target::for_document(&key("rooms/gone")), TargetPurpose::LimboResolution);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Current, vec![3]), &targets);

        let event = aggregator.create_remote_event(version(4), &targets);
        let deleted = &event.document_updates[&key("rooms/gone")];
        assert!(deleted.is_no_document());
        assert_eq!(deleted.version(), version(4));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/gone")));
        assert!(event.target_changes[&3].current);
    }

    #[test]
    fn existence_filter_mismatch_resets_target() {
        let mut targets = Targets::default();
        targets.listen(2, rooms(), TargetPurpose::Listen);
        targets
            .remote_keys
            .insert(2, [key("rooms/a"), key("rooms/b")].into_iter().collect());
        let mut aggregator = WatchChangeAggregator::new();

        aggregator.handle_existence_filter(ExistenceFilterChange { target_id: 2, count: 2 }, &targets);
        assert!(aggregator.pending_target_resets.is_empty());

        aggregator.handle_existence_filter(ExistenceFilterChange { target_id: 2, count: 1 }, &targets);
        let event = aggregator.create_remote_event(version(5), &targets);
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents.len(), 2);
        assert!(!change.current);
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn global_resume_token_reaches_active_targets_only() {
        let mut targets = Targets::default();
        targets.listen(2, rooms(), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator.record_pending_target_request(4);
        aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Added, vec![2]), &targets);

        let no_change = WatchTargetChange::new(TargetChangeState::NoChange, vec![]).with_resume_token(vec![9]);
        aggregator.handle_target_change(&no_change, &targets);
        let event = aggregator.create_remote_event(version(6), &targets);
        assert_eq!(event.target_changes[&2].resume_token, vec![9]);
        assert!(!event.target_changes.contains_key(&4));
    }
}
