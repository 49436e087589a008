use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::firestore::core::{OnlineState, User};
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatchResult, TargetId};
use crate::firestore::remote::RemoteEvent;

/// Receiver of everything the remote store learns from the backend.
///
/// Implemented by the sync engine. Calls arrive on the async queue; the
/// remote store never holds its own lock while calling in, so
/// implementations may call back into it.
#[async_trait]
pub trait RemoteSyncer: Send + Sync + 'static {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend removed `target_id` because of `error`.
    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()>;

    /// Switches local state over to `user` while the streams are down.
    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()>;

    /// Documents the target contained as of the last raised snapshot.
    /// Answered synchronously from the syncer's own cache.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;
}
