use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};

/// Everything the watch stream reported up to one consistent snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter disagreed with the local count, with
    /// the purpose to re-listen under.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Updated documents whose only targets are limbo resolutions.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    /// Event for a target that became current without a watch snapshot,
    /// used when the primary client's state reaches a secondary.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Self::default()
        }
    }
}

/// Membership and resume-token changes of one target within a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn membership_changed(&self) -> bool {
        !self.added_documents.is_empty()
            || !self.modified_documents.is_empty()
            || !self.removed_documents.is_empty()
    }
}
