use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{FieldMask, FieldPath};
use crate::firestore::value::{maps_equal, FirestoreValue, MapValue, ValueKind};

/// The field data of a document: a nested map addressed by [`FieldPath`]s.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectValue {
    root: MapValue,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(root: MapValue) -> Self {
        Self { root }
    }

    pub fn from_map(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self::new(MapValue::new(fields))
    }

    pub fn map_value(&self) -> &MapValue {
        &self.root
    }

    pub fn into_map_value(self) -> MapValue {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.root;
        for segment in parents {
            match current.get(segment).map(FirestoreValue::kind) {
                Some(ValueKind::Map(child)) => current = child,
                _ => return None,
            }
        }
        current.get(last)
    }

    /// Writes `value` at `path`, replacing any non-map value along the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let parent = Self::parent_map_mut(&mut self.root, parents);
        parent.fields_mut().insert(last.clone(), value);
    }

    /// Removes the value at `path`; missing intermediate maps are left alone.
    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.root;
        for segment in parents {
            match current.fields_mut().get_mut(segment) {
                Some(value) => match value.as_map_mut() {
                    Some(child) => current = child,
                    None => return,
                },
                None => return,
            }
        }
        current.fields_mut().remove(last);
    }

    /// Applies a batch of writes; `None` deletes the field.
    pub fn set_all(&mut self, data: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in data {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Every leaf path in the object. Empty maps are leaves so a patch built
    /// from this mask recreates them.
    pub fn field_mask(&self) -> FieldMask {
        let mut mask = FieldMask::empty();
        collect_mask(&self.root, None, &mut mask);
        mask
    }

    /// Value equality (NaN equals NaN, integers differ from doubles).
    pub fn is_equal(&self, other: &ObjectValue) -> bool {
        maps_equal(&self.root, &other.root)
    }

    fn parent_map_mut<'a>(root: &'a mut MapValue, parents: &[String]) -> &'a mut MapValue {
        let mut current = root;
        for segment in parents {
            let entry = current
                .fields_mut()
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map(BTreeMap::new());
            }
            current = match entry.as_map_mut() {
                Some(map) => map,
                None => unreachable!("entry was just replaced with a map"),
            };
        }
        current
    }
}

fn collect_mask(map: &MapValue, prefix: Option<&FieldPath>, mask: &mut FieldMask) {
    for (key, value) in map.fields() {
        let path = match prefix {
            Some(prefix) => prefix.child(key.clone()),
            None => FieldPath::from_segment(key.clone()),
        };
        match value.as_map() {
            Some(child) if !child.is_empty() => collect_mask(child, Some(&path), mask),
            _ => mask.insert(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> FieldPath {
        FieldPath::from_dot_separated(s).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        assert_eq!(
            object.get(&path("a.b.c")),
            Some(&FirestoreValue::from_integer(1))
        );
        assert!(object.get(&path("a.b")).and_then(|v| v.as_map()).is_some());
    }

    #[test]
    fn set_overwrites_scalar_parents() {
        let mut object = ObjectValue::empty();
        object.set(&path("a"), FirestoreValue::from_string("leaf"));
        object.set(&path("a.b"), FirestoreValue::from_bool(true));
        assert_eq!(object.get(&path("a.b")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn delete_leaves_siblings() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("a.c"), FirestoreValue::from_integer(2));
        object.delete(&path("a.b"));
        object.delete(&path("missing.path"));
        assert!(object.get(&path("a.b")).is_none());
        assert_eq!(object.get(&path("a.c")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn field_mask_keeps_empty_maps() {
        let mut object = ObjectValue::empty();
        object.set(&path("a.b"), FirestoreValue::from_integer(1));
        object.set(&path("empty"), FirestoreValue::from_map(BTreeMap::new()));
        let mask = object.field_mask();
        let fields: Vec<String> = mask.fields().map(|f| f.canonical_string()).collect();
        assert_eq!(fields, vec!["a.b".to_string(), "empty".to_string()]);
    }
}
