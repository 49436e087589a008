use std::ops::Deref;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::firestore::core::BackoffSettings;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::TargetData;
use crate::firestore::model::TargetId;
use crate::firestore::remote::datastore::{Datastore, ListenRequest, ListenResponse};
use crate::firestore::remote::stream::{ListenKind, PersistentStream, StreamListener};
use crate::firestore::util::AsyncQueue;

/// The watch stream: targets go in, watch changes come out.
pub struct ListenStream {
    stream: PersistentStream<ListenKind>,
}

impl ListenStream {
    pub fn new(
        queue: AsyncQueue,
        datastore: Datastore,
        backoff: BackoffSettings,
        listener: Arc<dyn StreamListener<ListenResponse>>,
    ) -> Self {
        Self {
            stream: PersistentStream::new(queue, datastore, backoff, listener),
        }
    }

    /// Asks the server to start watching `target_data`, resuming from its
    /// resume token when it has one.
    pub fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        if target_data.resume_token.is_empty() {
            log::debug!(target: "ListenStream", "watch target {}", target_data.target_id);
        } else {
            log::debug!(
                target: "ListenStream",
                "watch target {} resuming from {}",
                target_data.target_id,
                BASE64_STANDARD.encode(&target_data.resume_token)
            );
        }
        self.stream
            .send(ListenRequest::AddTarget(target_data.clone()))
    }

    pub fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        log::debug!(target: "ListenStream", "unwatch target {target_id}");
        self.stream.send(ListenRequest::RemoveTarget(target_id))
    }
}

impl Deref for ListenStream {
    type Target = PersistentStream<ListenKind>;

    fn deref(&self) -> &Self::Target {
        &self.stream
    }
}
