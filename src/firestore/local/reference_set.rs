use std::collections::BTreeSet;

use crate::firestore::model::{DocumentKey, TargetId};

/// Collection of (document key, id) references, indexed both ways.
///
/// Used for the local-view pins of each target and for limbo-resolution
/// bookkeeping. Ids are target ids or batch ids depending on the owner.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, TargetId)>,
    by_id: BTreeSet<(TargetId, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: TargetId) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<I: IntoIterator<Item = DocumentKey>>(&mut self, keys: I, id: TargetId) {
        for key in keys {
            self.add_reference(key, id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: TargetId) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references<'a, I>(&mut self, keys: I, id: TargetId)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the released keys.
    pub fn remove_references_for_id(&mut self, id: TargetId) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.references_for_id(id).into_iter().collect();
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) -> Vec<DocumentKey> {
        let keys = self.by_key.iter().map(|(key, _)| key.clone()).collect();
        self.by_key.clear();
        self.by_id.clear();
        keys
    }

    pub fn references_for_id(&self, id: TargetId) -> BTreeSet<DocumentKey> {
        self.by_id
            .iter()
            .skip_while(|(candidate, _)| *candidate < id)
            .take_while(|(candidate, _)| *candidate == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), TargetId::MIN)..)
            .next()
            .map(|(candidate, _)| candidate == key)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_by_id_and_key() {
        let mut set = ReferenceSet::new();
        set.add_reference(key("rooms/a"), 1);
        set.add_reference(key("rooms/b"), 1);
        set.add_reference(key("rooms/a"), 2);

        assert_eq!(set.references_for_id(1).len(), 2);
        assert!(set.contains_key(&key("rooms/a")));

        let released = set.remove_references_for_id(1);
        assert_eq!(released.len(), 2);
        assert!(set.contains_key(&key("rooms/a")));
        assert!(!set.contains_key(&key("rooms/b")));
        assert_eq!(set.remove_all_references(), vec![key("rooms/a")]);
        assert!(set.is_empty());
    }
}
