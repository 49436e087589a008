use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::{LocalDocumentsView, PersistenceTransaction};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

const LOG_TARGET: &str = "QueryEngine";

/// Answers queries from the cache, reusing the previous result set of a
/// target when that is provably complete.
///
/// The previous results are the documents the server last reported for the
/// target (`remote_keys`) as of its last limbo-free snapshot. Only documents
/// changed after that snapshot are scanned on top of them.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return self.execute_full_collection_scan(txn, view, query);
        }

        let documents = view.get_documents(txn, remote_keys)?;
        let previous_results = apply_query(query, documents);

        if query.limit().is_some()
            && needs_refill(
                query.limit_type(),
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return self.execute_full_collection_scan(txn, view, query);
        }

        log::debug!(
            target: LOG_TARGET,
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        );
        let mut updated = view.get_documents_matching_query(txn, query, last_limbo_free_snapshot_version)?;
        for document in previous_results {
            updated.insert(document.key().clone(), document);
        }
        Ok(updated)
    }

    pub fn execute_full_collection_scan(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<BTreeMap<DocumentKey, MutableDocument>> {
        log::debug!(target: LOG_TARGET, "Using full collection scan to execute query: {}", query.canonical_id());
        view.get_documents_matching_query(txn, query, SnapshotVersion::min())
    }
}

/// Matching documents in query order.
fn apply_query(query: &Query, documents: BTreeMap<DocumentKey, MutableDocument>) -> Vec<MutableDocument> {
    let comparator = query.comparator();
    let mut results: Vec<MutableDocument> = documents
        .into_values()
        .filter(|document| query.matches(document))
        .collect();
    results.sort_by(|left, right| comparator(left, right));
    results
}

/// A limit query must be recomputed from scratch when a previous result
/// dropped out or when the document at the limit boundary may have been
/// displaced by a newer or locally modified one.
fn needs_refill(
    limit_type: LimitType,
    sorted_previous_results: &[MutableDocument],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match limit_type {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::OrderBy;
    use crate::firestore::local::{MutationQueue, Persistence, RemoteDocumentCache, TransactionMode};
    use crate::firestore::model::{FieldPath, ObjectValue, ResourcePath, Timestamp};
    use crate::firestore::value::FirestoreValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn scored(path: &str, score: i64, at: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_segment("score"), FirestoreValue::from_integer(score));
        let mut document = MutableDocument::new_found_document(key(path), version(at), data);
        document.set_read_time(version(at));
        document
    }

    #[test]
    fn reuses_previous_results_and_adds_newer_documents() {
        let persistence = Persistence::memory();
        let view = LocalDocumentsView::new(MutationQueue::new(""));
        let engine = QueryEngine::new();
        let query = Query::at_path(ResourcePath::from_string("games").unwrap())
            .with_order_by(OrderBy::desc(FieldPath::from_segment("score")));
        persistence
            .run_transaction("test", TransactionMode::ReadWrite, |txn| {
                for document in [scored("games/a", 10, 1), scored("games/b", 8, 1), scored("games/c", 9, 5)] {
                    let read_time = document.read_time();
                    RemoteDocumentCache::add_entry(txn, &document, read_time)?;
                }
                let remote_keys = BTreeSet::from([key("games/a"), key("games/b")]);
                let results = engine.get_documents_matching_query(txn, &view, &query, version(2), &remote_keys)?;
                assert_eq!(results.len(), 3);

                let full = engine.execute_full_collection_scan(txn, &view, &query)?;
                assert_eq!(results, full);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn limit_query_refills_when_boundary_document_changed() {
        let edge = scored("games/b", 8, 7);
        let previous = vec![scored("games/a", 10, 1), edge];
        let keys = BTreeSet::from([key("games/a"), key("games/b")]);
        assert!(needs_refill(LimitType::First, &previous, &keys, version(2)));
        assert!(!needs_refill(LimitType::Last, &previous, &keys, version(2)));

        let shrunk = BTreeSet::from([key("games/a"), key("games/b"), key("games/z")]);
        assert!(needs_refill(LimitType::First, &previous[..1], &shrunk, version(9)));
    }
}
