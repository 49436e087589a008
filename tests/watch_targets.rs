use std::collections::{BTreeMap, BTreeSet};

use firestore_sync::firestore::core::Query;
use firestore_sync::firestore::local::{
    LocalStore, Persistence, QueryEngine, TargetData, TargetPurpose,
};
use firestore_sync::firestore::model::{
    DocumentKey, FieldPath, MutableDocument, ObjectValue, ResourcePath, SnapshotVersion, TargetId,
    Timestamp,
};
use firestore_sync::firestore::remote::{
    DocumentChange, RemoteEvent, TargetChangeState, TargetMetadataProvider, WatchChangeAggregator,
    WatchTargetChange,
};
use firestore_sync::firestore::value::FirestoreValue;
use firestore_sync::firestore::User;

#[derive(Default)]
struct ListenedTargets {
    data: BTreeMap<TargetId, TargetData>,
}

impl TargetMetadataProvider for ListenedTargets {
    fn get_remote_keys_for_target(&self, _target_id: TargetId) -> BTreeSet<DocumentKey> {
        BTreeSet::new()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.data.get(&target_id).cloned()
    }
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

fn document(path: &str, value: i64, seconds: i64) -> MutableDocument {
    let mut data = ObjectValue::empty();
    data.set(&FieldPath::from_segment("value"), FirestoreValue::from_integer(value));
    MutableDocument::new_found_document(key(path), version(seconds), data)
}

fn added(target_id: TargetId, path: &str) -> DocumentChange {
    DocumentChange {
        updated_target_ids: vec![target_id],
        removed_target_ids: Vec::new(),
        key: key(path),
        document: Some(document(path, 1, 2)),
    }
}

#[test]
fn removal_is_ignored_until_outstanding_adds_are_acknowledged() {
    let rooms = Query::at_path(ResourcePath::from_segments(["rooms"])).to_target();
    let mut targets = ListenedTargets::default();
    targets
        .data
        .insert(4, TargetData::new(rooms, 4, TargetPurpose::Listen, 1));

    // listen, unlisten and listen again before the server answered any of them
    let mut aggregator = WatchChangeAggregator::new();
    for _ in 0..3 {
        aggregator.record_pending_target_request(4);
    }

    aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Removed, vec![4]), &targets);
    aggregator.handle_document_change(added(4, "rooms/early"), &targets);
    let while_pending = aggregator.create_remote_event(version(2), &targets);
    assert!(while_pending.target_changes.is_empty());
    assert!(while_pending.document_updates.is_empty());

    let ack = WatchTargetChange::new(TargetChangeState::Added, vec![4]);
    aggregator.handle_target_change(&ack, &targets);
    aggregator.handle_document_change(added(4, "rooms/stale"), &targets);
    assert!(aggregator
        .create_remote_event(version(2), &targets)
        .document_updates
        .is_empty());

    aggregator.handle_target_change(&ack, &targets);
    aggregator.handle_document_change(added(4, "rooms/a"), &targets);
    aggregator.handle_target_change(&WatchTargetChange::new(TargetChangeState::Current, vec![4]), &targets);
    let event = aggregator.create_remote_event(version(3), &targets);

    let change = &event.target_changes[&4];
    assert!(change.current);
    assert_eq!(change.added_documents, [key("rooms/a")].into_iter().collect());
    assert_eq!(event.document_updates.len(), 1);
    assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(3));
}

fn event_with(snapshot_version: SnapshotVersion, documents: Vec<MutableDocument>) -> RemoteEvent {
    RemoteEvent {
        snapshot_version,
        document_updates: documents
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect(),
        ..RemoteEvent::default()
    }
}

#[test]
fn outdated_watch_updates_never_move_a_document_backwards() {
    let local_store = LocalStore::new(Persistence::memory(), QueryEngine::new(), User::unauthenticated());
    local_store.start().unwrap();

    let current = document("rooms/a", 3, 3);
    let changed = local_store
        .apply_remote_event(&event_with(version(3), vec![current.clone()]))
        .unwrap();
    assert_eq!(changed.len(), 1);

    let replayed = local_store
        .apply_remote_event(&event_with(version(3), vec![current.clone()]))
        .unwrap();
    assert!(replayed.is_empty());

    let outdated = local_store
        .apply_remote_event(&event_with(version(4), vec![document("rooms/a", 2, 2)]))
        .unwrap();
    assert!(outdated.is_empty());

    let cached = local_store.read_document(&key("rooms/a")).unwrap();
    assert_eq!(cached.version(), version(3));
    assert_eq!(cached.data(), current.data());
}
