use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex as StdMutex, MutexGuard};

use crate::firestore::error::{internal_error, FirestoreResult};

pub type KvPair = (Vec<u8>, Vec<u8>);

/// One transaction over an ordered byte-keyed store.
///
/// Reads observe the transaction's own writes. Dropping a transaction without
/// calling [`commit`](KvTransaction::commit) discards its writes.
pub trait KvTransaction {
    fn get(&mut self, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> FirestoreResult<()>;

    fn delete(&mut self, key: &[u8]) -> FirestoreResult<()>;

    /// Entries with `start <= key < end`, in key order.
    fn scan(&mut self, start: &[u8], end: &[u8]) -> FirestoreResult<Vec<KvPair>>;

    fn commit(self: Box<Self>) -> FirestoreResult<()>;

    fn delete_range(&mut self, start: &[u8], end: &[u8]) -> FirestoreResult<()> {
        for (key, _) in self.scan(start, end)? {
            self.delete(&key)?;
        }
        Ok(())
    }
}

/// Storage engine behind [`Persistence`](super::Persistence).
pub trait KvStore: Send + Sync {
    fn begin(&self, readonly: bool) -> FirestoreResult<Box<dyn KvTransaction + '_>>;
}

/// Process-local store; a transaction holds the store lock until it ends.
#[derive(Default)]
pub struct MemoryKvStore {
    data: StdMutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn begin(&self, readonly: bool) -> FirestoreResult<Box<dyn KvTransaction + '_>> {
        let data = self
            .data
            .lock()
            .map_err(|_| internal_error("memory store lock poisoned"))?;
        Ok(Box::new(MemoryKvTransaction {
            data,
            staged: BTreeMap::new(),
            readonly,
        }))
    }
}

struct MemoryKvTransaction<'a> {
    data: MutexGuard<'a, BTreeMap<Vec<u8>, Vec<u8>>>,
    /// `None` marks a staged delete.
    staged: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    readonly: bool,
}

impl MemoryKvTransaction<'_> {
    fn check_writable(&self) -> FirestoreResult<()> {
        if self.readonly {
            return Err(internal_error("write attempted in a read-only transaction"));
        }
        Ok(())
    }
}

impl KvTransaction for MemoryKvTransaction<'_> {
    fn get(&mut self, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> FirestoreResult<()> {
        self.check_writable()?;
        self.staged.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> FirestoreResult<()> {
        self.check_writable()?;
        self.staged.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan(&mut self, start: &[u8], end: &[u8]) -> FirestoreResult<Vec<KvPair>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let range = (Bound::Included(start.to_vec()), Bound::Excluded(end.to_vec()));
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .data
            .range::<Vec<u8>, _>(range.clone())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in self.staged.range::<Vec<u8>, _>(range) {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn commit(mut self: Box<Self>) -> FirestoreResult<()> {
        let staged = std::mem::take(&mut self.staged);
        for (key, value) in staged {
            match value {
                Some(value) => {
                    self.data.insert(key, value);
                }
                None => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_own_writes_and_rolls_back_on_drop() {
        let store = MemoryKvStore::new();
        {
            let mut txn = store.begin(false).unwrap();
            txn.put(b"a", b"1").unwrap();
            assert_eq!(txn.get(b"a").unwrap(), Some(b"1".to_vec()));
        }
        let mut txn = store.begin(true).unwrap();
        assert_eq!(txn.get(b"a").unwrap(), None);
    }

    #[test]
    fn scan_merges_staged_writes() {
        let store = MemoryKvStore::new();
        let mut txn = store.begin(false).unwrap();
        txn.put(b"a", b"1").unwrap();
        txn.put(b"b", b"2").unwrap();
        txn.commit().unwrap();

        let mut txn = store.begin(false).unwrap();
        txn.delete(b"a").unwrap();
        txn.put(b"c", b"3").unwrap();
        let keys: Vec<Vec<u8>> = txn.scan(b"a", b"z").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn readonly_rejects_writes() {
        let store = MemoryKvStore::new();
        let mut txn = store.begin(true).unwrap();
        assert!(txn.put(b"a", b"1").is_err());
    }
}
