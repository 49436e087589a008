use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;

/// Set of field paths a patch is allowed to touch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(&mut self, field: FieldPath) {
        self.fields.insert(field);
    }

    /// True when `path` equals or lies beneath one of the masked fields.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        Self {
            fields: self.fields.union(&other.fields).cloned().collect(),
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
    fn covers_nested_paths() {
        let mask = FieldMask::new([path("a.b"), path("c")]);
        assert!(mask.covers(&path("a.b.c")));
        assert!(mask.covers(&path("c")));
        assert!(!mask.covers(&path("a")));
        assert!(!mask.covers(&path("a.bc")));
    }
}
