use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

/// Mutations committed atomically under one batch id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Applied before `mutations` in the local view only; never sent.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the acknowledged results of every mutation in this batch that
    /// targets `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        let results = &batch_result.mutation_results;
        if results.len() != self.mutations.len() {
            return Err(internal_error(format!(
                "mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                results.len()
            )));
        }
        for (mutation, result) in self.mutations.iter().zip(results) {
            if &mutation.key == document.key() {
                mutation.apply_to_remote_document(document, result)?;
            }
        }
        Ok(())
    }

    pub fn apply_to_local_view(&self, document: &mut MutableDocument) {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if &mutation.key == document.key() {
                mutation.apply_to_local_view(document, self.local_write_time);
            }
        }
    }

    /// Applies the batch to every document it touches that is present in `documents`.
    pub fn apply_to_local_document_set(&self, documents: &mut BTreeMap<DocumentKey, MutableDocument>) {
        for key in self.keys() {
            if let Some(document) = documents.get_mut(&key) {
                self.apply_to_local_view(document);
            }
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key.clone()).collect()
    }

    pub fn touches(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|m| &m.key == key)
    }
}

/// Backend acknowledgement of a [`MutationBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each touched document reached with this commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key.clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
