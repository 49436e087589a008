use std::path::Path;
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::kv::{KvPair, KvStore, KvTransaction};

/// How long a writer waits for another connection's transaction to finish.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable [`KvStore`] backed by a single SQLite table.
pub struct SqliteKvStore {
    conn: StdMutex<Connection>,
}

impl SqliteKvStore {
    /// Opens or creates the store at `path` with WAL journaling.
    pub fn open(path: impl AsRef<Path>) -> FirestoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    pub fn open_in_memory() -> FirestoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> FirestoreResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }
}

impl KvStore for SqliteKvStore {
    fn begin(&self, readonly: bool) -> FirestoreResult<Box<dyn KvTransaction + '_>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| internal_error("sqlite connection lock poisoned"))?;
        conn.execute_batch(if readonly { "BEGIN DEFERRED" } else { "BEGIN IMMEDIATE" })?;
        Ok(Box::new(SqliteKvTransaction {
            conn,
            readonly,
            finished: false,
        }))
    }
}

struct SqliteKvTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    readonly: bool,
    finished: bool,
}

impl SqliteKvTransaction<'_> {
    fn check_writable(&self) -> FirestoreResult<()> {
        if self.readonly {
            return Err(internal_error("write attempted in a read-only transaction"));
        }
        Ok(())
    }
}

impl KvTransaction for SqliteKvTransaction<'_> {
    fn get(&mut self, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>> {
        let value = self
            .conn
            .prepare_cached("SELECT value FROM kv WHERE key = ?1")?
            .query_row(params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> FirestoreResult<()> {
        self.check_writable()?;
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO kv(key, value) VALUES (?1, ?2)")?
            .execute(params![key, value])?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> FirestoreResult<()> {
        self.check_writable()?;
        self.conn
            .prepare_cached("DELETE FROM kv WHERE key = ?1")?
            .execute(params![key])?;
        Ok(())
    }

    fn scan(&mut self, start: &[u8], end: &[u8]) -> FirestoreResult<Vec<KvPair>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key ASC")?;
        let rows = stmt.query_map(params![start, end], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn delete_range(&mut self, start: &[u8], end: &[u8]) -> FirestoreResult<()> {
        self.check_writable()?;
        self.conn
            .prepare_cached("DELETE FROM kv WHERE key >= ?1 AND key < ?2")?
            .execute(params![start, end])?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> FirestoreResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteKvTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                log::warn!(target: "Persistence", "failed to roll back transaction: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.sqlite");
        {
            let store = SqliteKvStore::open(&path).unwrap();
            let mut txn = store.begin(false).unwrap();
            txn.put(b"k1", b"v1").unwrap();
            txn.put(b"k2", b"v2").unwrap();
            txn.commit().unwrap();

            let mut txn = store.begin(false).unwrap();
            txn.put(b"k3", b"v3").unwrap();
            // dropped without commit
        }
        let store = SqliteKvStore::open(&path).unwrap();
        let mut txn = store.begin(true).unwrap();
        let keys: Vec<Vec<u8>> = txn
            .scan(b"k", b"l")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"k1".to_vec(), b"k2".to_vec()]);
    }

    #[test]
    fn delete_range_removes_bounded_keys() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let mut txn = store.begin(false).unwrap();
        for key in [b"a1", b"a2", b"b1"] {
            txn.put(key, b"x").unwrap();
        }
        txn.delete_range(b"a", b"b").unwrap();
        assert_eq!(txn.scan(b"a", b"z").unwrap().len(), 1);
        txn.commit().unwrap();
    }
}
