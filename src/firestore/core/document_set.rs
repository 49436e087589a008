use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::firestore::core::DocumentComparator;
use crate::firestore::model::{DocumentKey, MutableDocument};

/// Documents of a view, sorted by the query's comparator and indexed by key.
///
/// Ties under the comparator are broken by key, so the order is total.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Set ordered by key only.
    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|_, _| Ordering::Equal))
    }

    /// An empty set sharing this set's ordering.
    pub fn empty_like(&self) -> Self {
        Self::new(Arc::clone(&self.comparator))
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    /// Position of `key` in sort order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let existing = self.by_key.get(key)?;
        let index = self.position(existing).ok()?;
        self.by_key.remove(key);
        Some(self.sorted.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    pub fn to_vec(&self) -> Vec<MutableDocument> {
        self.sorted.clone()
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        (self.comparator)(left, right).then_with(|| left.key().cmp(right.key()))
    }

    fn position(&self, document: &MutableDocument) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|probe| self.compare(probe, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted.len() == other.sorted.len()
            && self
                .sorted
                .iter()
                .zip(&other.sorted)
                .all(|(left, right)| left.is_equal(right))
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|document| document.key().path().canonical_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Direction, OrderBy, Query};
    use crate::firestore::model::{FieldPath, ObjectValue, ResourcePath, SnapshotVersion, Timestamp};
    use crate::firestore::value::FirestoreValue;

    fn doc(path: &str, score: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_segment("score"), FirestoreValue::from_integer(score));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn by_score_desc() -> DocumentSet {
        let query = Query::at_path(ResourcePath::from_segments(["games"]))
            .with_order_by(OrderBy::new(FieldPath::from_segment("score"), Direction::Descending));
        DocumentSet::new(query.comparator())
    }

    #[test]
    fn keeps_comparator_order() {
        let mut set = by_score_desc();
        set.insert(doc("games/a", 1));
        set.insert(doc("games/b", 3));
        set.insert(doc("games/c", 2));
        let keys: Vec<String> = set.keys().map(|key| key.id().to_string()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
        assert_eq!(set.first().unwrap().key().id(), "b");
        assert_eq!(set.last().unwrap().key().id(), "a");
        assert_eq!(set.index_of(&DocumentKey::from_string("games/c").unwrap()), Some(1));
    }

    #[test]
    fn reinserting_a_key_moves_it() {
        let mut set = by_score_desc();
        set.insert(doc("games/a", 1));
        set.insert(doc("games/b", 3));
        set.insert(doc("games/a", 5));
        assert_eq!(set.len(), 2);
        assert_eq!(set.first().unwrap().key().id(), "a");
        assert!(set.remove(&DocumentKey::from_string("games/a").unwrap()).is_some());
        assert!(!set.contains(&DocumentKey::from_string("games/a").unwrap()));
        assert_eq!(set.len(), 1);
    }
}
