use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, ObjectValue, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{values_equal, FirestoreValue, ValueKind};

/// Condition a document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// Server-side transform applied to a single field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Local estimate of the transform's outcome.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                numeric_increment(self.compute_base_value(previous), operand)
            }
        }
    }

    /// Final value once the backend acknowledged the write. Array transforms
    /// are recomputed against the committed base; the others take the value
    /// reported by the server.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: &FirestoreValue,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                server_result.clone()
            }
        }
    }

    /// Base value a non-idempotent transform must be pinned to, if any.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FirestoreValue::from_integer(0)),
            },
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: ObjectValue },
    /// Writes the masked fields; masked paths absent from `data` are deleted.
    Patch { data: ObjectValue, mask: FieldMask },
    Delete,
    /// Only checks the precondition.
    Verify,
}

/// One document change plus its precondition and field transforms.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: DocumentKey,
    pub precondition: Precondition,
    pub field_transforms: Vec<FieldTransform>,
    pub kind: MutationKind,
}

/// Result of applying a single mutation on the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    /// Commit version for sets/patches, or the delete time.
    pub version: SnapshotVersion,
    /// One entry per field transform, in order.
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Self {
            key,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
            kind: MutationKind::Set { value },
        }
    }

    pub fn patch(key: DocumentKey, data: ObjectValue, mask: FieldMask) -> Self {
        Self {
            key,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
            kind: MutationKind::Patch { data, mask },
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
            kind: MutationKind::Delete,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            precondition,
            field_transforms: Vec::new(),
            kind: MutationKind::Verify,
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn is_patch(&self) -> bool {
        matches!(self.kind, MutationKind::Patch { .. })
    }

    /// Applies the acknowledged result of this mutation to `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(document, result)?;
                let mut data = value.clone();
                data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The base document changed underneath us; we know a write
                    // happened at this version but not what the document holds.
                    document.convert_to_unknown_document(result.version);
                    return Ok(());
                }
                let transform_results = self.server_transform_results(document, result)?;
                let mut new_data = document.data().clone();
                new_data.set_all(patch_field_values(data, mask));
                new_data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {
                if !self.precondition.is_valid_for(document) {
                    document.convert_to_unknown_document(result.version);
                }
            }
        }
        Ok(())
    }

    /// Applies this mutation optimistically. A failed precondition leaves the
    /// document untouched.
    pub fn apply_to_local_view(&self, document: &mut MutableDocument, local_write_time: Timestamp) {
        if !self.precondition.is_valid_for(document) {
            return;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, data)
                    .set_has_local_mutations();
            }
            MutationKind::Patch { data, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut new_data = document.data().clone();
                new_data.set_all(patch_field_values(data, mask));
                new_data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Pins non-idempotent transforms (increments) to the value they read,
    /// so re-applying the batch later yields the same local result.
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<ObjectValue> {
        let mut base = ObjectValue::empty();
        for transform in &self.field_transforms {
            let existing = document.field(&transform.field);
            if let Some(coerced) = transform.operation.compute_base_value(existing) {
                base.set(&transform.field, coerced);
            }
        }
        if base.is_empty() {
            None
        } else {
            Some(base)
        }
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(&transform.field);
                let value = transform
                    .operation
                    .apply_to_local_view(previous, local_write_time);
                (transform.field.clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<BTreeMap<FieldPath, Option<FirestoreValue>>> {
        if result.transform_results.len() != self.field_transforms.len() {
            return Err(internal_error(format!(
                "server transform result count ({}) should match field transform count ({})",
                result.transform_results.len(),
                self.field_transforms.len()
            )));
        }
        Ok(self
            .field_transforms
            .iter()
            .zip(&result.transform_results)
            .map(|(transform, server_value)| {
                let previous = document.field(&transform.field);
                let value = transform
                    .operation
                    .apply_to_remote_document(previous, server_value);
                (transform.field.clone(), Some(value))
            })
            .collect())
    }
}

fn patch_field_values(
    data: &ObjectValue,
    mask: &FieldMask,
) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
    mask.fields()
        .map(|path| (path.clone(), data.get(path).cloned()))
        .collect()
}

fn coerced_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    match previous.and_then(FirestoreValue::as_array) {
        Some(array) => array.values().to_vec(),
        None => Vec::new(),
    }
}

fn array_union(previous: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerced_array(previous);
    for element in additions {
        if !values.iter().any(|candidate| values_equal(candidate, element)) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = coerced_array(previous)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| values_equal(needle, candidate)))
        .collect();
    FirestoreValue::from_array(values)
}

/// Integer sums saturate at the i64 bounds; any double operand yields a double.
fn numeric_increment(base: Option<FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = base.unwrap_or_else(|| FirestoreValue::from_integer(0));
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        _ => operand.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn object(entries: &[(&str, FirestoreValue)]) -> ObjectValue {
        let mut value = ObjectValue::empty();
        for (path, v) in entries {
            value.set(&field(path), v.clone());
        }
        value
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn set_overwrites_local_document() {
        let mut document = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            object(&[("old", FirestoreValue::from_bool(true))]),
        );
        let mutation = Mutation::set(key("rooms/a"), object(&[("a", 1.into())]));
        mutation.apply_to_local_view(&mut document, Timestamp::new(2, 0));
        assert!(document.has_local_mutations());
        assert!(document.field(&field("old")).is_none());
        assert_eq!(document.field(&field("a")), Some(&FirestoreValue::from_integer(1)));
    }

    #[test]
    fn patch_requires_existing_document_locally() {
        let mut document = MutableDocument::new_no_document(key("rooms/a"), version(1));
        let mutation = Mutation::patch(
            key("rooms/a"),
            object(&[("b", 2.into())]),
            FieldMask::new([field("b")]),
        );
        mutation.apply_to_local_view(&mut document, Timestamp::new(2, 0));
        assert!(document.is_no_document());
        assert!(!document.has_local_mutations());
    }

    #[test]
    fn patch_deletes_masked_fields_missing_from_data() {
        let mut document = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            object(&[("a", 1.into()), ("b", 2.into())]),
        );
        let mutation = Mutation::patch(
            key("rooms/a"),
            ObjectValue::empty(),
            FieldMask::new([field("b")]),
        );
        mutation.apply_to_local_view(&mut document, Timestamp::new(2, 0));
        assert!(document.field(&field("b")).is_none());
        assert_eq!(document.field(&field("a")), Some(&FirestoreValue::from_integer(1)));
    }

    #[test]
    fn acknowledged_patch_on_missing_document_becomes_unknown() {
        let mut document = MutableDocument::new_invalid_document(key("rooms/a"));
        let mutation = Mutation::patch(
            key("rooms/a"),
            object(&[("b", 2.into())]),
            FieldMask::new([field("b")]),
        );
        mutation
            .apply_to_remote_document(&mut document, &MutationResult::new(version(7), vec![]))
            .unwrap();
        assert!(document.is_unknown_document());
        assert_eq!(document.version(), version(7));
    }

    #[test]
    fn increment_pins_base_value() {
        let document = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            object(&[("count", FirestoreValue::from_string("not a number"))]),
        );
        let mutation = Mutation::patch(key("rooms/a"), ObjectValue::empty(), FieldMask::empty())
            .with_transforms(vec![FieldTransform::new(
                field("count"),
                TransformOperation::NumericIncrement(5.into()),
            )]);
        let base = mutation.extract_transform_base_value(&document).unwrap();
        assert_eq!(base.get(&field("count")), Some(&FirestoreValue::from_integer(0)));
    }

    #[test]
    fn transforms_apply_locally() {
        let mut document = MutableDocument::new_found_document(
            key("rooms/a"),
            version(1),
            object(&[
                ("count", 1.into()),
                ("tags", FirestoreValue::from_array(vec!["a".into(), "b".into()])),
            ]),
        );
        let mutation = Mutation::patch(key("rooms/a"), ObjectValue::empty(), FieldMask::empty())
            .with_transforms(vec![
                FieldTransform::new(field("count"), TransformOperation::NumericIncrement(2.5.into())),
                FieldTransform::new(
                    field("tags"),
                    TransformOperation::ArrayUnion(vec!["b".into(), "c".into()]),
                ),
                FieldTransform::new(field("touched"), TransformOperation::ServerTimestamp),
            ]);
        mutation.apply_to_local_view(&mut document, Timestamp::new(9, 0));
        assert_eq!(document.field(&field("count")), Some(&FirestoreValue::from_double(3.5)));
        assert_eq!(
            document.field(&field("tags")),
            Some(&FirestoreValue::from_array(vec!["a".into(), "b".into(), "c".into()]))
        );
        assert!(matches!(
            document.field(&field("touched")).map(FirestoreValue::kind),
            Some(ValueKind::ServerTimestamp(_))
        ));
    }

    #[test]
    fn integer_increment_saturates() {
        let result = numeric_increment(Some(i64::MAX.into()), &FirestoreValue::from_integer(1));
        assert_eq!(result, FirestoreValue::from_integer(i64::MAX));
    }
}
