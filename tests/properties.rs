use std::collections::BTreeMap;

use proptest::prelude::*;

use firestore_sync::firestore::local::{LocalStore, Persistence, QueryEngine};
use firestore_sync::firestore::model::{
    DocumentKey, FieldMask, FieldPath, GeoPoint, MutableDocument, Mutation, ObjectValue,
    Precondition, SnapshotVersion, Timestamp,
};
use firestore_sync::firestore::remote::RemoteEvent;
use firestore_sync::firestore::value::{BytesValue, FirestoreValue};
use firestore_sync::firestore::User;

fn leaf() -> impl Strategy<Value = FirestoreValue> {
    prop_oneof![
        Just(FirestoreValue::null()),
        any::<bool>().prop_map(FirestoreValue::from_bool),
        any::<i64>().prop_map(FirestoreValue::from_integer),
        (-1_000_000i64..1_000_000).prop_map(|eighths| FirestoreValue::from_double(eighths as f64 / 8.0)),
        (0i64..4_000_000_000, 0i32..1_000_000_000)
            .prop_map(|(seconds, nanos)| FirestoreValue::from_timestamp(Timestamp::new(seconds, nanos))),
        "[a-z ]{0,8}".prop_map(FirestoreValue::from_string),
        proptest::collection::vec(any::<u8>(), 0..8)
            .prop_map(|bytes| FirestoreValue::from_bytes(BytesValue::new(bytes))),
        (-90i32..=90, -180i32..=180).prop_map(|(lat, lng)| {
            FirestoreValue::from_geo_point(GeoPoint::new(lat as f64, lng as f64).unwrap())
        }),
    ]
}

fn value() -> impl Strategy<Value = FirestoreValue> {
    leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..4).prop_map(FirestoreValue::from_array),
            proptest::collection::btree_map("[a-d]{1,2}", inner, 0..4).prop_map(FirestoreValue::from_map),
        ]
    })
}

fn object() -> impl Strategy<Value = ObjectValue> {
    proptest::collection::btree_map("[a-d]{1,2}", value(), 0..5).prop_map(ObjectValue::from_map)
}

#[derive(Clone, Debug)]
enum Edit {
    Set(i64),
    Patch(&'static str, i64),
    Delete,
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0i64..10).prop_map(Edit::Set),
        (prop_oneof![Just("a"), Just("b")], 0i64..10).prop_map(|(field, value)| Edit::Patch(field, value)),
        Just(Edit::Delete),
    ]
}

fn key() -> DocumentKey {
    DocumentKey::from_string("items/x").unwrap()
}

fn single(field: &str, value: i64) -> ObjectValue {
    let mut data = ObjectValue::empty();
    data.set(&FieldPath::from_segment(field), FirestoreValue::from_integer(value));
    data
}

fn to_mutation(edit: &Edit, unconditional: bool) -> Mutation {
    match edit {
        Edit::Set(value) => Mutation::set(key(), single("a", *value)),
        Edit::Patch(field, value) => {
            let patch = Mutation::patch(
                key(),
                single(field, *value),
                FieldMask::new([FieldPath::from_segment(*field)]),
            );
            if unconditional {
                patch.with_precondition(Precondition::None)
            } else {
                patch
            }
        }
        Edit::Delete => Mutation::delete(key()),
    }
}

proptest! {
    #[test]
    fn object_values_survive_serialization(object in object()) {
        let encoded = serde_json::to_string(&object).unwrap();
        let decoded: ObjectValue = serde_json::from_str(&encoded).unwrap();
        prop_assert!(decoded.is_equal(&object));
        prop_assert_eq!(decoded, object);
    }

    #[test]
    fn patch_with_the_full_field_mask_rebuilds_the_object(object in object()) {
        let patch = Mutation::patch(key(), object.clone(), object.field_mask())
            .with_precondition(Precondition::None);
        let mut document = MutableDocument::new_found_document(
            key(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            ObjectValue::empty(),
        );
        patch.apply_to_local_view(&mut document, Timestamp::new(2, 0));
        prop_assert!(document.data().is_equal(&object));
    }

    #[test]
    fn local_reads_apply_batches_in_batch_order(
        base in proptest::option::of(0i64..10),
        edits in proptest::collection::vec((edit(), any::<bool>()), 1..8),
    ) {
        let local_store = LocalStore::new(Persistence::memory(), QueryEngine::new(), User::unauthenticated());
        local_store.start().unwrap();

        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        let mut expected = match base {
            Some(value) => {
                let mut document = MutableDocument::new_found_document(key(), version, single("a", value));
                document.set_read_time(version);
                let mut document_updates = BTreeMap::new();
                document_updates.insert(key(), document.clone());
                local_store
                    .apply_remote_event(&RemoteEvent {
                        snapshot_version: version,
                        document_updates,
                        ..RemoteEvent::default()
                    })
                    .unwrap();
                document
            }
            None => MutableDocument::new_invalid_document(key()),
        };

        let write_time = Timestamp::new(5, 0);
        for (edit, unconditional) in &edits {
            let mutation = to_mutation(edit, *unconditional);
            mutation.apply_to_local_view(&mut expected, write_time);
            local_store.write_locally(vec![mutation], write_time).unwrap();
        }

        let actual = local_store.read_document(&key()).unwrap();
        prop_assert_eq!(actual.is_found_document(), expected.is_found_document());
        prop_assert_eq!(actual.is_no_document(), expected.is_no_document());
        if expected.is_found_document() {
            prop_assert!(actual.data().is_equal(expected.data()));
        }
    }
}
