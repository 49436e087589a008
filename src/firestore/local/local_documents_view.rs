use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{IndexManager, MutationQueue, PersistenceTransaction, RemoteDocumentCache};
use crate::firestore::model::{DocumentKey, MutableDocument, MutationBatch, SnapshotVersion};

/// Documents as the user sees them: remote state with every pending
/// mutation batch applied in batch order.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    mutation_queue: MutationQueue,
}

impl LocalDocumentsView {
    pub fn new(mutation_queue: MutationQueue) -> Self {
        Self { mutation_queue }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    /// The local view of `key`; invalid when neither the cache nor a
    /// mutation knows it.
    pub fn get_document(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<MutableDocument> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_key(txn, key)?;
        let mut document = RemoteDocumentCache::get_entry(txn, key)?;
        for batch in &batches {
            batch.apply_to_local_view(&mut document);
        }
        Ok(document)
    }

    pub fn get_documents<'k, I>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: I,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let base = RemoteDocumentCache::get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, base)
    }

    /// Applies pending batches to documents already read from the cache.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        mut documents: BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, documents.keys())?;
        for batch in &batches {
            batch.apply_to_local_document_set(&mut documents);
        }
        Ok(documents)
    }

    /// Documents matching `query`, reading only cache entries newer than
    /// `since_read_time` (all of them for `SnapshotVersion::min()`).
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query)
        } else if let Some(collection_id) = query.collection_group_id() {
            self.get_documents_matching_collection_group_query(txn, query, collection_id, since_read_time)
        } else {
            self.get_documents_matching_collection_query(txn, query, since_read_time)
        }
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut result = BTreeMap::new();
        let key = DocumentKey::from_path(query.path().clone())?;
        let document = self.get_document(txn, &key)?;
        if document.is_found_document() {
            result.insert(key, document);
        }
        Ok(result)
    }

    fn get_documents_matching_collection_group_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        collection_id: &str,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut result = BTreeMap::new();
        for parent in IndexManager::get_collection_parents(txn, collection_id)? {
            let collection_query = query.as_collection_query_at_path(parent.child([collection_id]));
            result.extend(self.get_documents_matching_collection_query(txn, &collection_query, since_read_time)?);
        }
        Ok(result)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let mut results = RemoteDocumentCache::get_documents_matching_query(txn, query, since_read_time)?;
        let batches = self.mutation_queue.get_all_mutation_batches_affecting_query(txn, query)?;
        self.add_missing_base_documents(txn, &batches, &mut results)?;

        for batch in &batches {
            for mutation in &batch.mutations {
                let key = &mutation.key;
                if !query.path().is_immediate_parent_of(key.path()) {
                    continue;
                }
                let document = results
                    .entry(key.clone())
                    .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
                mutation.apply_to_local_view(document, batch.local_write_time);
                if !document.is_found_document() {
                    results.remove(key);
                }
            }
        }

        results.retain(|_, document| query.matches(document));
        Ok(results)
    }

    /// Patches need their base document even when the cache scan skipped it
    /// as unchanged.
    fn add_missing_base_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batches: &[MutationBatch],
        existing: &mut BTreeMap<DocumentKey, MutableDocument>,
    ) -> FirestoreResult<()> {
        let missing: BTreeSet<DocumentKey> = batches
            .iter()
            .flat_map(|batch| batch.mutations.iter())
            .filter(|mutation| mutation.is_patch() && !existing.contains_key(&mutation.key))
            .map(|mutation| mutation.key.clone())
            .collect();
        for (key, document) in RemoteDocumentCache::get_entries(txn, &missing)? {
            if document.is_found_document() {
                existing.insert(key, document);
            }
        }
        Ok(())
    }
}
