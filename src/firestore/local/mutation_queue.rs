use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::encoded::KeyBuilder;
use crate::firestore::local::persistence::ensure;
use crate::firestore::local::{IndexManager, PersistenceTransaction};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCHID_UNKNOWN,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct MutationQueueMeta {
    uid: String,
    last_acknowledged_batch_id: BatchId,
    #[serde(default)]
    last_stream_token: Vec<u8>,
}

fn meta_prefix() -> Vec<u8> {
    KeyBuilder::table("mutation_queue_meta").build()
}

fn batch_counter_key() -> Vec<u8> {
    KeyBuilder::table("mutation_batch_counter").build()
}

/// Pending writes of one user, ordered by batch id.
///
/// Batch ids come from a counter shared by every user's queue and are never
/// reused. A `document -> batch` index keeps per-document lookups cheap.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    uid: String,
}

impl MutationQueue {
    /// Queue for the user with `uid`; the unauthenticated user has an empty uid.
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: uid.into() }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    fn meta_key(&self) -> Vec<u8> {
        KeyBuilder::table("mutation_queue_meta").string(&self.uid).build()
    }

    fn batches_prefix(&self) -> Vec<u8> {
        KeyBuilder::table("mutations").string(&self.uid).build()
    }

    fn batch_key(&self, batch_id: BatchId) -> Vec<u8> {
        KeyBuilder::table("mutations").string(&self.uid).i32(batch_id).build()
    }

    fn document_mutation_key(&self, key: &DocumentKey, batch_id: BatchId) -> Vec<u8> {
        KeyBuilder::table("document_mutations")
            .string(&self.uid)
            .document_key(key)
            .i32(batch_id)
            .build()
    }

    fn document_mutations_prefix(&self, key: &DocumentKey) -> Vec<u8> {
        KeyBuilder::table("document_mutations")
            .string(&self.uid)
            .document_key(key)
            .build()
    }

    fn load_meta(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<MutationQueueMeta> {
        Ok(txn.get_json(&self.meta_key())?.unwrap_or_else(|| MutationQueueMeta {
            uid: self.uid.clone(),
            last_acknowledged_batch_id: BATCHID_UNKNOWN,
            last_stream_token: Vec::new(),
        }))
    }

    /// Creates the metadata record on first use so GC can find this queue.
    pub fn start(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let meta = self.load_meta(txn)?;
        txn.put_json(&self.meta_key(), &meta)
    }

    pub fn check_empty(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<bool> {
        Ok(!txn.has_prefix(&self.batches_prefix())?)
    }

    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut meta = self.load_meta(txn)?;
        ensure(
            batch.batch_id > meta.last_acknowledged_batch_id,
            "Mutation batch ids must be acknowledged in order",
        )?;
        meta.last_acknowledged_batch_id = batch.batch_id;
        meta.last_stream_token = stream_token;
        txn.put_json(&self.meta_key(), &meta)
    }

    pub fn get_last_stream_token(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<Vec<u8>> {
        Ok(self.load_meta(txn)?.last_stream_token)
    }

    pub fn set_last_stream_token(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut meta = self.load_meta(txn)?;
        meta.last_stream_token = stream_token;
        txn.put_json(&self.meta_key(), &meta)
    }

    /// Persists a new batch under the next batch id and indexes its keys.
    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let last: BatchId = txn.get_json(&batch_counter_key())?.unwrap_or(BATCHID_UNKNOWN);
        let batch_id = last.max(0) + 1;
        txn.put_json(&batch_counter_key(), &batch_id)?;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        txn.put_json(&self.batch_key(batch_id), &batch)?;
        for mutation in &batch.mutations {
            txn.put_json(&self.document_mutation_key(&mutation.key, batch_id), &batch_id)?;
            IndexManager::add_to_collection_parent_index(txn, &mutation.key.collection_path())?;
        }
        self.start(txn)?;
        Ok(batch)
    }

    /// `None` for unknown or already removed batches.
    pub fn lookup_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        txn.get_json(&self.batch_key(batch_id))
    }

    /// The first batch with an id greater than `batch_id`, skipping batches
    /// already acknowledged.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let meta = self.load_meta(txn)?;
        let after = batch_id.max(meta.last_acknowledged_batch_id).saturating_add(1);
        let start = KeyBuilder::table("mutations").string(&self.uid).i32(after).build();
        let end = crate::firestore::local::encoded::prefix_end(&self.batches_prefix());
        Ok(txn
            .scan_range_json::<MutationBatch>(&start, &end)?
            .into_iter()
            .next()
            .map(|(_, batch)| batch))
    }

    pub fn get_highest_unacknowledged_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
    ) -> FirestoreResult<BatchId> {
        Ok(self
            .get_all_mutation_batches(txn)?
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCHID_UNKNOWN))
    }

    pub fn get_all_mutation_batches(
        &self,
        txn: &mut PersistenceTransaction<'_>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(txn
            .scan_json::<MutationBatch>(&self.batches_prefix())?
            .into_iter()
            .map(|(_, batch)| batch)
            .collect())
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        self.get_all_mutation_batches_affecting_document_keys(txn, std::iter::once(key))
    }

    /// Batches touching any of `keys`, in batch-id order, each once.
    pub fn get_all_mutation_batches_affecting_document_keys<'k, I>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: I,
    ) -> FirestoreResult<Vec<MutationBatch>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            for (_, batch_id) in txn.scan_json::<BatchId>(&self.document_mutations_prefix(key))? {
                batch_ids.insert(batch_id);
            }
        }
        self.load_batches(txn, batch_ids)
    }

    /// Batches touching a document directly inside the query's collection.
    /// Collection-group queries are resolved per parent by the caller.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let prefix = KeyBuilder::table("document_mutations")
            .string(&self.uid)
            .path_prefix(query.path())
            .build();
        let path_len = query.path().len();
        let mut batch_ids = BTreeSet::new();
        for (_, batch_id) in txn.scan_json::<BatchId>(&prefix)? {
            batch_ids.insert(batch_id);
        }
        let batches = self.load_batches(txn, batch_ids)?;
        Ok(batches
            .into_iter()
            .filter(|batch| {
                batch.mutations.iter().any(|mutation| {
                    let path = mutation.key.path();
                    path.len() == path_len + 1 && query.path().is_prefix_of(path)
                })
            })
            .collect())
    }

    fn load_batches(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_ids: BTreeSet<BatchId>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            let batch = self
                .lookup_mutation_batch(txn, batch_id)?
                .ok_or_else(|| internal_error(format!("Dangling document-mutation reference to batch {batch_id}")))?;
            batches.push(batch);
        }
        Ok(batches)
    }

    /// Removes `batch`, which must be the oldest batch in the queue.
    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let oldest = txn
            .scan_json::<MutationBatch>(&self.batches_prefix())?
            .into_iter()
            .next()
            .map(|(_, oldest)| oldest.batch_id);
        ensure(
            oldest == Some(batch.batch_id),
            "Can only remove the first entry of the mutation queue",
        )?;

        txn.delete(&self.batch_key(batch.batch_id))?;
        let delegate = txn.reference_delegate();
        for mutation in &batch.mutations {
            txn.delete(&self.document_mutation_key(&mutation.key, batch.batch_id))?;
            delegate.remove_mutation_reference(txn, &mutation.key)?;
        }
        Ok(())
    }

    /// Whether this queue holds a batch touching `key`.
    pub fn contains_key(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        txn.has_prefix(&self.document_mutations_prefix(key))
    }

    /// Whether any user's queue holds a batch touching `key`.
    pub fn any_queue_contains_key(
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<bool> {
        for (_, meta) in txn.scan_json::<MutationQueueMeta>(&meta_prefix())? {
            if MutationQueue::new(meta.uid).contains_key(txn, key)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::{Persistence, TransactionMode};
    use crate::firestore::model::{FieldMask, FieldPath, ObjectValue, ResourcePath};
    use crate::firestore::value::FirestoreValue;
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set(path: &str, field: &str, value: i64) -> Mutation {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), FirestoreValue::from_integer(value));
        Mutation::set(key(path), ObjectValue::from_map(fields))
    }

    fn patch(path: &str, field: &str, value: i64) -> Mutation {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), FirestoreValue::from_integer(value));
        let mask = FieldMask::new([FieldPath::from_segment(field)]);
        Mutation::patch(key(path), ObjectValue::from_map(fields), mask)
    }

    #[test]
    fn batches_are_indexed_and_removed_in_order() {
        let persistence = Persistence::memory();
        let queue = MutationQueue::new("alice");
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                assert!(queue.check_empty(txn)?);
                let first = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("rooms/a", "n", 1)])?;
                let second = queue.add_mutation_batch(
                    txn,
                    Timestamp::now(),
                    vec![],
                    vec![patch("rooms/a", "n", 2), set("rooms/b", "n", 3)],
                )?;
                assert_eq!((first.batch_id, second.batch_id), (1, 2));
                assert_eq!(queue.get_highest_unacknowledged_batch_id(txn)?, 2);

                let affecting = queue.get_all_mutation_batches_affecting_document_key(txn, &key("rooms/a"))?;
                assert_eq!(affecting.len(), 2);
                let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
                assert_eq!(queue.get_all_mutation_batches_affecting_query(txn, &query)?.len(), 2);

                assert!(queue.remove_mutation_batch(txn, &second).is_err());
                queue.remove_mutation_batch(txn, &first)?;
                assert!(queue.lookup_mutation_batch(txn, first.batch_id)?.is_none());
                assert_eq!(
                    queue.get_all_mutation_batches_affecting_document_key(txn, &key("rooms/a"))?,
                    vec![second.clone()]
                );
                assert!(MutationQueue::any_queue_contains_key(txn, &key("rooms/b"))?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn next_batch_skips_acknowledged_batches() {
        let persistence = Persistence::memory();
        let queue = MutationQueue::new("");
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                let first = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("c/a", "n", 1)])?;
                let second = queue.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("c/b", "n", 1)])?;

                let next = queue.get_next_mutation_batch_after_batch_id(txn, BATCHID_UNKNOWN)?;
                assert_eq!(next.map(|b| b.batch_id), Some(first.batch_id));

                queue.acknowledge_batch(txn, &first, b"token".to_vec())?;
                assert_eq!(queue.get_last_stream_token(txn)?, b"token".to_vec());
                let next = queue.get_next_mutation_batch_after_batch_id(txn, BATCHID_UNKNOWN)?;
                assert_eq!(next.map(|b| b.batch_id), Some(second.batch_id));
                assert!(queue.get_next_mutation_batch_after_batch_id(txn, second.batch_id)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn batch_ids_are_shared_across_users() {
        let persistence = Persistence::memory();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                let alice = MutationQueue::new("alice");
                let bob = MutationQueue::new("bob");
                let a = alice.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("c/a", "n", 1)])?;
                let b = bob.add_mutation_batch(txn, Timestamp::now(), vec![], vec![set("c/a", "n", 2)])?;
                assert!(b.batch_id > a.batch_id);
                assert!(!alice.contains_key(txn, &key("c/b"))?);
                Ok(())
            })
            .unwrap();
    }
}
