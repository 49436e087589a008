use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded::{prefix_end, KeyBuilder};
use crate::firestore::local::{IndexManager, PersistenceTransaction};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
struct RemoteDocumentGlobal {
    byte_size: i64,
}

fn document_key(key: &DocumentKey) -> Vec<u8> {
    KeyBuilder::table("remote_documents").document_key(key).build()
}

fn read_time_key(key: &DocumentKey, read_time: SnapshotVersion) -> Vec<u8> {
    KeyBuilder::table("remote_document_read_time")
        .string(key.collection_group())
        .version(read_time)
        .document_key(key)
        .build()
}

fn global_key() -> Vec<u8> {
    KeyBuilder::table("remote_document_global").build()
}

/// Last known server state of every cached document, keyed by path, with a
/// secondary `(collection group, read time, path)` index for incremental scans.
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    fn read(
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<(MutableDocument, i64)>> {
        match txn.get_raw(&document_key(key))? {
            Some(bytes) => {
                let document = serde_json::from_slice(&bytes)?;
                Ok(Some((document, bytes.len() as i64)))
            }
            None => Ok(None),
        }
    }

    fn adjust_byte_size(txn: &mut PersistenceTransaction<'_>, delta: i64) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut global: RemoteDocumentGlobal = txn.get_json(&global_key())?.unwrap_or_default();
        global.byte_size += delta;
        txn.put_json(&global_key(), &global)
    }

    /// Stores `document` as of `read_time`. Prefer writing through a
    /// [`RemoteDocumentChangeBuffer`].
    pub fn add_entry(
        txn: &mut PersistenceTransaction<'_>,
        document: &MutableDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let key = document.key().clone();
        let previous = Self::read(txn, &key)?;
        if let Some((old, _)) = &previous {
            txn.delete(&read_time_key(&key, old.read_time()))?;
        }

        let mut stored = document.clone();
        stored.set_read_time(read_time);
        let bytes = serde_json::to_vec(&stored)?;
        txn.put_raw(&document_key(&key), &bytes)?;
        txn.put_json(&read_time_key(&key, read_time), &key)?;
        IndexManager::add_to_collection_parent_index(txn, &key.collection_path())?;

        let old_size = previous.map(|(_, size)| size).unwrap_or(0);
        Self::adjust_byte_size(txn, bytes.len() as i64 - old_size)
    }

    pub fn remove_entry(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
        if let Some((old, size)) = Self::read(txn, key)? {
            txn.delete(&document_key(key))?;
            txn.delete(&read_time_key(key, old.read_time()))?;
            Self::adjust_byte_size(txn, -size)?;
        }
        Ok(())
    }

    /// The cached document, or an invalid document when nothing is cached.
    pub fn get_entry(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        Ok(Self::read(txn, key)?
            .map(|(document, _)| document)
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone())))
    }

    pub fn get_entries<'k, I>(
        txn: &mut PersistenceTransaction<'_>,
        keys: I,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut documents = BTreeMap::new();
        for key in keys {
            documents.insert(key.clone(), Self::get_entry(txn, key)?);
        }
        Ok(documents)
    }

    /// Documents directly inside the query's collection with a read time
    /// after `since_read_time`. Query filters are not applied here.
    pub fn get_documents_matching_query(
        txn: &mut PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        let collection = query.path();
        let mut documents = BTreeMap::new();
        if since_read_time.is_min() {
            let prefix = KeyBuilder::table("remote_documents").path_prefix(collection).build();
            for (_, document) in txn.scan_json::<MutableDocument>(&prefix)? {
                if document.key().path().len() == collection.len() + 1 {
                    documents.insert(document.key().clone(), document);
                }
            }
            return Ok(documents);
        }

        let Some(collection_id) = collection.last_segment() else {
            return Ok(documents);
        };
        for (key, document) in Self::changed_since(txn, collection_id, since_read_time)? {
            if collection.is_immediate_parent_of(key.path()) {
                documents.insert(key, document);
            }
        }
        Ok(documents)
    }

    /// Every document of `collection_group` read after `since_read_time`,
    /// plus the latest read time among them. Lets secondary clients catch up
    /// on what the primary wrote.
    pub fn get_new_document_changes(
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<(BTreeMap<DocumentKey, MutableDocument>, SnapshotVersion)> {
        let mut latest = since_read_time;
        let mut documents = BTreeMap::new();
        for (key, document) in Self::changed_since(txn, collection_group, since_read_time)? {
            latest = latest.max(document.read_time());
            documents.insert(key, document);
        }
        Ok((documents, latest))
    }

    fn changed_since(
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<Vec<(DocumentKey, MutableDocument)>> {
        let group = KeyBuilder::table("remote_document_read_time").string(collection_group);
        let end = prefix_end(&group.clone().build());
        let start = group.version(since_read_time).build();
        let mut changed = Vec::new();
        for (_, key) in txn.scan_range_json::<DocumentKey>(&start, &end)? {
            let document = Self::get_entry(txn, &key)?;
            if document.read_time() > since_read_time {
                changed.push((key, document));
            }
        }
        Ok(changed)
    }

    /// Approximate size of all cached documents in bytes.
    pub fn byte_size(txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        Ok(txn
            .get_json::<RemoteDocumentGlobal>(&global_key())?
            .unwrap_or_default()
            .byte_size)
    }
}

/// Collects document changes and writes them to the cache in one go.
///
/// Reads see changes added earlier to the same buffer.
#[derive(Debug, Default)]
pub struct RemoteDocumentChangeBuffer {
    /// Invalid documents stand for removals.
    changes: BTreeMap<DocumentKey, MutableDocument>,
}

impl RemoteDocumentChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `document`; its read time must already be set.
    pub fn add_entry(&mut self, document: MutableDocument) {
        self.changes.insert(document.key().clone(), document);
    }

    pub fn remove_entry(&mut self, key: DocumentKey, read_time: SnapshotVersion) {
        let mut removed = MutableDocument::new_invalid_document(key.clone());
        removed.set_read_time(read_time);
        self.changes.insert(key, removed);
    }

    pub fn get_entry(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<MutableDocument> {
        match self.changes.get(key) {
            Some(document) => Ok(document.clone()),
            None => RemoteDocumentCache::get_entry(txn, key),
        }
    }

    pub fn get_entries<'k, I>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: I,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut documents = BTreeMap::new();
        for key in keys {
            documents.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(documents)
    }

    pub fn apply(self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        for (key, document) in self.changes {
            if document.is_valid_document() {
                let read_time = document.read_time();
                RemoteDocumentCache::add_entry(txn, &document, read_time)?;
            } else {
                RemoteDocumentCache::remove_entry(txn, &key)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::{Persistence, TransactionMode};
    use crate::firestore::model::{ObjectValue, ResourcePath, Timestamp};

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, at: i64) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            version(at),
            ObjectValue::empty(),
        )
    }

    #[test]
    fn collection_scan_excludes_subcollections_and_respects_read_time() {
        let persistence = Persistence::memory();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                RemoteDocumentCache::add_entry(txn, &doc("rooms/a", 1), version(1))?;
                RemoteDocumentCache::add_entry(txn, &doc("rooms/b", 2), version(2))?;
                RemoteDocumentCache::add_entry(txn, &doc("rooms/a/messages/m", 3), version(3))?;
                RemoteDocumentCache::add_entry(txn, &doc("roomsx/c", 3), version(3))?;

                let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
                let all = RemoteDocumentCache::get_documents_matching_query(txn, &query, SnapshotVersion::min())?;
                assert_eq!(all.len(), 2);

                let recent = RemoteDocumentCache::get_documents_matching_query(txn, &query, version(1))?;
                let keys: Vec<String> = recent.keys().map(|k| k.to_string()).collect();
                assert_eq!(keys, vec!["rooms/b".to_string()]);

                let (changes, latest) = RemoteDocumentCache::get_new_document_changes(txn, "messages", version(0))?;
                assert_eq!(changes.len(), 1);
                assert_eq!(latest, version(3));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn byte_size_tracks_adds_and_removes() {
        let persistence = Persistence::memory();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                let key = DocumentKey::from_string("rooms/a").unwrap();
                let mut buffer = RemoteDocumentChangeBuffer::new();
                let mut document = doc("rooms/a", 1);
                document.set_read_time(version(1));
                buffer.add_entry(document);
                assert!(buffer.get_entry(txn, &key)?.is_found_document());
                buffer.apply(txn)?;
                assert!(RemoteDocumentCache::byte_size(txn)? > 0);

                RemoteDocumentCache::remove_entry(txn, &key)?;
                assert_eq!(RemoteDocumentCache::byte_size(txn)?, 0);
                assert!(!RemoteDocumentCache::get_entry(txn, &key)?.is_valid_document());
                Ok(())
            })
            .unwrap();
    }
}
