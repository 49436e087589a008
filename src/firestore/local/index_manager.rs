use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded::KeyBuilder;
use crate::firestore::local::PersistenceTransaction;
use crate::firestore::model::ResourcePath;

/// Collection-parent index: for every collection id, the parent paths under
/// which a collection with that id has held documents. Collection-group
/// queries fan out over these parents.
pub struct IndexManager;

impl IndexManager {
    /// Records `collection_path` (which must be a collection) and, recursively,
    /// its ancestors' collections.
    pub fn add_to_collection_parent_index(
        txn: &mut PersistenceTransaction<'_>,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        let parent = collection_path.without_last();
        let key = KeyBuilder::table("collection_parents")
            .string(collection_id)
            .path(&parent)
            .build();
        if txn.get_raw(&key)?.is_some() {
            return Ok(());
        }
        txn.put_json(&key, &parent)?;
        if parent.len() >= 2 {
            Self::add_to_collection_parent_index(txn, &parent.without_last())?;
        }
        Ok(())
    }

    pub fn get_collection_parents(
        txn: &mut PersistenceTransaction<'_>,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        let prefix = KeyBuilder::table("collection_parents").string(collection_id).build();
        Ok(txn
            .scan_json::<ResourcePath>(&prefix)?
            .into_iter()
            .map(|(_, parent)| parent)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::{Persistence, TransactionMode};

    fn path(value: &str) -> ResourcePath {
        ResourcePath::from_string(value).unwrap()
    }

    #[test]
    fn nested_collections_register_every_ancestor() {
        let persistence = Persistence::memory();
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                IndexManager::add_to_collection_parent_index(txn, &path("rooms/a/messages"))?;
                IndexManager::add_to_collection_parent_index(txn, &path("users/u/messages"))?;
                IndexManager::add_to_collection_parent_index(txn, &path("rooms/a/messages"))?;

                assert_eq!(
                    IndexManager::get_collection_parents(txn, "messages")?,
                    vec![path("rooms/a"), path("users/u")]
                );
                assert_eq!(IndexManager::get_collection_parents(txn, "rooms")?, vec![ResourcePath::root()]);
                assert!(IndexManager::get_collection_parents(txn, "unknown")?.is_empty());
                Ok(())
            })
            .unwrap();
    }
}
