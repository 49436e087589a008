use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded::KeyBuilder;
use crate::firestore::local::PersistenceTransaction;
use crate::firestore::model::SnapshotVersion;

/// Metadata of a loaded bundle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub id: String,
    pub version: i32,
    pub create_time: SnapshotVersion,
    pub total_documents: u32,
    pub total_bytes: u64,
}

/// A query saved by name from a bundle, with the read time of its results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedQuery {
    pub name: String,
    pub query: Query,
    pub read_time: SnapshotVersion,
}

pub struct BundleCache;

impl BundleCache {
    pub fn get_bundle_metadata(
        txn: &mut PersistenceTransaction<'_>,
        bundle_id: &str,
    ) -> FirestoreResult<Option<BundleMetadata>> {
        txn.get_json(&KeyBuilder::table("bundles").string(bundle_id).build())
    }

    pub fn save_bundle_metadata(
        txn: &mut PersistenceTransaction<'_>,
        metadata: &BundleMetadata,
    ) -> FirestoreResult<()> {
        txn.put_json(&KeyBuilder::table("bundles").string(&metadata.id).build(), metadata)
    }

    pub fn get_named_query(
        txn: &mut PersistenceTransaction<'_>,
        name: &str,
    ) -> FirestoreResult<Option<NamedQuery>> {
        txn.get_json(&KeyBuilder::table("named_queries").string(name).build())
    }

    pub fn save_named_query(txn: &mut PersistenceTransaction<'_>, query: &NamedQuery) -> FirestoreResult<()> {
        txn.put_json(&KeyBuilder::table("named_queries").string(&query.name).build(), query)
    }
}
