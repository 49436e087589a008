use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use proptest::prelude::*;

use firestore_sync::firestore::core::{OrderBy, ViewSnapshot};
use firestore_sync::firestore::local::{
    DocumentMap, LocalStore, LocalViewChanges, Persistence, QueryEngine,
};
use firestore_sync::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, Mutation, ObjectValue, ResourcePath,
    SnapshotVersion, Timestamp,
};
use firestore_sync::firestore::remote::{
    DocumentChange, ListenRequest, ListenResponse, MockBackend, RemoteEvent, StaticTokenProvider,
    TargetChange, TargetChangeState, WatchChange, WatchTargetChange,
};
use firestore_sync::firestore::value::FirestoreValue;
use firestore_sync::firestore::{
    FirestoreClient, FirestoreError, FirestoreSettings, ListenOptions, Query, User,
};
use firestore_sync::util::PartialObserver;

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

fn score(value: i64) -> ObjectValue {
    let mut data = ObjectValue::empty();
    data.set(&FieldPath::from_segment("score"), FirestoreValue::from_integer(value));
    data
}

fn scored(path: &str, value: i64, seconds: i64) -> MutableDocument {
    let mut document = MutableDocument::new_found_document(key(path), version(seconds), score(value));
    document.set_read_time(version(seconds));
    document
}

fn top_scores(limit: u32) -> Query {
    Query::at_path(ResourcePath::from_segments(["players"]))
        .with_order_by(OrderBy::desc(FieldPath::from_segment("score")))
        .with_limit_to_first(limit)
}

fn rescore(path: &str, value: i64) -> Mutation {
    Mutation::patch(key(path), score(value), FieldMask::new([FieldPath::from_segment("score")]))
}

/// The first `limit` keys of `documents` in query order.
fn ranked(query: &Query, documents: DocumentMap) -> Vec<DocumentKey> {
    let comparator = query.comparator();
    let mut documents: Vec<MutableDocument> = documents
        .into_values()
        .filter(|document| query.matches(document))
        .collect();
    documents.sort_by(|left, right| comparator(left, right));
    documents
        .into_iter()
        .take(query.limit().unwrap_or(u32::MAX) as usize)
        .map(|document| document.key().clone())
        .collect()
}

/// A local store whose target for `query` was synced at version 2 with the
/// top `limit` of `scores` in its result set; every document is cached.
fn synced_store(query: &Query, scores: &[i64]) -> Arc<LocalStore> {
    let local_store = LocalStore::new(Persistence::memory(), QueryEngine::new(), User::unauthenticated());
    local_store.start().unwrap();
    let target_data = local_store.allocate_target(query.to_target()).unwrap();

    let documents: DocumentMap = scores
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let document = scored(&format!("players/p{index}"), *value, 2);
            (document.key().clone(), document)
        })
        .collect();
    let synced_keys: BTreeSet<DocumentKey> = ranked(query, documents.clone()).into_iter().collect();

    let mut target_changes = BTreeMap::new();
    target_changes.insert(
        target_data.target_id,
        TargetChange {
            resume_token: b"resume".to_vec(),
            current: true,
            added_documents: synced_keys.clone(),
            ..TargetChange::default()
        },
    );
    local_store
        .apply_remote_event(&RemoteEvent {
            snapshot_version: version(2),
            target_changes,
            document_updates: documents,
            ..RemoteEvent::default()
        })
        .unwrap();
    local_store
        .notify_local_view_changes(&[LocalViewChanges {
            target_id: target_data.target_id,
            from_cache: false,
            added_keys: synced_keys,
            removed_keys: BTreeSet::new(),
        }])
        .unwrap();
    local_store
}

#[test]
fn edit_pushing_the_last_result_out_matches_a_full_scan() {
    let query = top_scores(2);
    let local_store = synced_store(&query, &[10, 8, 6]);
    local_store
        .write_locally(vec![rescore("players/p1", 1)], Timestamp::now())
        .unwrap();

    let reused = ranked(&query, local_store.execute_query(&query, true).unwrap().documents);
    let scanned = ranked(&query, local_store.execute_query(&query, false).unwrap().documents);
    assert_eq!(reused, scanned);
    assert_eq!(reused, vec![key("players/p0"), key("players/p2")]);
}

proptest! {
    #[test]
    fn refill_agrees_with_full_scan(
        scores in proptest::collection::vec(-50i64..50, 2..7),
        limit in 1u32..4,
        edited in 0usize..7,
        new_score in -60i64..60,
    ) {
        let query = top_scores(limit);
        let local_store = synced_store(&query, &scores);
        let edited = edited % scores.len();
        local_store
            .write_locally(vec![rescore(&format!("players/p{edited}"), new_score)], Timestamp::now())
            .unwrap();

        let reused = ranked(&query, local_store.execute_query(&query, true).unwrap().documents);
        let scanned = ranked(&query, local_store.execute_query(&query, false).unwrap().documents);
        prop_assert_eq!(reused, scanned);
    }
}

async fn settle(client: &FirestoreClient) {
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        client.queue().drain().await.unwrap();
    }
}

#[tokio::test]
async fn local_edits_reorder_a_limit_listener_without_a_round_trip() {
    let backend = MockBackend::new();
    let client = FirestoreClient::new(
        FirestoreSettings::default(),
        backend.connection(),
        Arc::new(StaticTokenProvider::new(None)),
    )
    .await
    .unwrap();

    let snapshots = Arc::new(Mutex::new(Vec::<ViewSnapshot>::new()));
    let sink = Arc::clone(&snapshots);
    let observer = PartialObserver::<ViewSnapshot, FirestoreError>::new()
        .with_next(move |snapshot| sink.lock().unwrap().push(snapshot.clone()));
    let query = top_scores(1);
    client
        .listen(query, ListenOptions::default(), Arc::new(observer))
        .await
        .unwrap();
    settle(&client).await;

    let target_id = backend
        .listen_requests()
        .into_iter()
        .find_map(|request| match request {
            ListenRequest::AddTarget(data) => Some(data.target_id),
            ListenRequest::RemoveTarget(_) => None,
        })
        .expect("target sent to the backend");
    let target = |state| ListenResponse::new(WatchChange::Target(WatchTargetChange::new(state, vec![target_id])));
    backend.send_listen_response(target(TargetChangeState::Added));
    backend.send_listen_response(ListenResponse::new(WatchChange::Document(DocumentChange {
        updated_target_ids: vec![target_id],
        removed_target_ids: Vec::new(),
        key: key("players/a"),
        document: Some(scored("players/a", 10, 2)),
    })));
    backend.send_listen_response(target(TargetChangeState::Current));
    backend.send_listen_response(ListenResponse::at_version(
        WatchChange::Target(WatchTargetChange::new(TargetChangeState::NoChange, Vec::new())),
        version(2),
    ));
    settle(&client).await;
    {
        let synced = snapshots.lock().unwrap().last().cloned().unwrap();
        assert!(!synced.from_cache);
        assert_eq!(synced.documents.keys().cloned().collect::<Vec<_>>(), vec![key("players/a")]);
    }

    let writer = client.clone();
    tokio::spawn(async move {
        writer
            .write(vec![
                rescore("players/a", 5),
                Mutation::set(key("players/b"), score(8)),
            ])
            .await
    });
    settle(&client).await;

    let edited = snapshots.lock().unwrap().last().cloned().unwrap();
    assert_eq!(edited.documents.keys().cloned().collect::<Vec<_>>(), vec![key("players/b")]);
    assert!(edited.has_pending_writes());
    assert!(backend.listen_requests().is_empty());
}
