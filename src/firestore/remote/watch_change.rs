use crate::firestore::error::FirestoreError;
use crate::firestore::model::{DocumentKey, MutableDocument, TargetId};

/// One message of the listen stream, already decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    Document(DocumentChange),
    Target(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

/// A document entered, changed in or left a set of targets.
///
/// `document` is a found document for updates, a no-document for deletes
/// and `None` when the document merely left the targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub document: Option<MutableDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means every target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    /// Set when the server removed the targets because of an error.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// The server's document count for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: i32,
}
