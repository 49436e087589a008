use serde::{Deserialize, Serialize};

use crate::firestore::core::Target;
use crate::firestore::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPurpose {
    /// A regular, user-visible listen.
    Listen,
    /// Re-listen after the server's count disagreed with the cached result.
    ExistenceFilterMismatch,
    /// Single-document listen that settles whether a limbo document exists.
    LimboResolution,
}

/// Persisted state of a target the client is (or was) listening to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Latest snapshot version seen for this target.
    pub snapshot_version: SnapshotVersion,
    /// Version at which the target was last consistent with no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque token to resume the listen; empty when none is known.
    pub resume_token: Vec<u8>,
    /// Documents the server should report when resuming, if known.
    #[serde(default)]
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// New resume point; clears any expected count.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}
