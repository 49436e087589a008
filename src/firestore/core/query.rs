use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::firestore::core::{Bound, Direction, Filter, OrderBy, Target};
use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// Shared document ordering for a query.
pub type DocumentComparator =
    Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// A collection, collection-group or single-document query as seen by the
/// sync engine. Built from the public API by the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the collection (or single document) at `path`.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Query over every collection named `collection_id` below the root.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    /// Rebuilds a limit-to-first query from a persisted target. Used for
    /// targets another client started listening to.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path.clone(),
            collection_group: target.collection_group.clone(),
            filters: target.filters.clone(),
            explicit_order_by: target.order_by.clone(),
            limit: target.limit,
            limit_type: LimitType::First,
            start_at: target.start_at.clone(),
            end_at: target.end_at.clone(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn without_limit(mut self) -> Self {
        self.limit = None;
        self
    }

    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns every document of its collection in key
    /// order, so the cache can answer it with a plain scan.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Same query re-rooted at a concrete collection, used to fan a
    /// collection-group query out over its parents.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Query {
        Query {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    /// Fields constrained by inequality filters, sorted.
    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| filter.op.is_inequality())
            .map(|filter| filter.field.clone())
            .collect()
    }

    /// Explicit order-bys, then every inequality field not yet ordered, then
    /// the key. Implicit orderings follow the direction of the last explicit one.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|o| o.field.clone()).collect();
        let last_direction = self
            .explicit_order_by
            .last()
            .map(|o| o.direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.matches_filters(document)
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &MutableDocument) -> bool {
        let document_path = document.key().path();
        match &self.collection_group {
            Some(group) => {
                document.key().has_collection_id(group) && self.path.is_prefix_of(document_path)
            }
            None if DocumentKey::is_document_key(&self.path) => &self.path == document_path,
            None => self.path.is_immediate_parent_of(document_path),
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_filters(&self, document: &MutableDocument) -> bool {
        self.filters.iter().all(|filter| filter.matches(document))
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            if !bound.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if !bound.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Ordering of documents in this query's results.
    pub fn comparator(&self) -> DocumentComparator {
        let order_by = self.normalized_order_by();
        Arc::new(move |left, right| {
            for order in &order_by {
                let ordering = order.compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
    }

    /// Limit-to-last queries are sent with a flipped ordering and swapped
    /// bounds; the view re-applies the original ordering.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        if self.limit_type == LimitType::Last {
            let flipped = order_by
                .into_iter()
                .map(|order| {
                    let direction = match order.direction {
                        Direction::Ascending => Direction::Descending,
                        Direction::Descending => Direction::Ascending,
                    };
                    OrderBy::new(order.field, direction)
                })
                .collect();
            Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by: flipped,
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            }
        } else {
            Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "F",
            LimitType::Last => "L",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), limit_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Operator;
    use crate::firestore::model::{ObjectValue, SnapshotVersion};
    use crate::firestore::value::FirestoreValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, score: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&field("score"), FirestoreValue::from_integer(score));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    #[test]
    fn matches_only_immediate_children() {
        let query = rooms();
        assert!(query.matches(&doc("rooms/a", 1)));
        assert!(!query.matches(&doc("rooms/a/messages/b", 1)));
        assert!(!query.matches(&doc("other/a", 1)));
    }

    #[test]
    fn collection_group_matches_nested_documents() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/a/messages/b", 1)));
        assert!(!query.matches(&doc("rooms/a", 1)));
    }

    #[test]
    fn normalized_order_adds_inequality_and_key() {
        let query = rooms().with_filter(Filter::field(field("score"), Operator::GreaterThan, 1.into()));
        let order: Vec<String> = query
            .normalized_order_by()
            .iter()
            .map(OrderBy::canonical_id)
            .collect();
        assert_eq!(order, vec!["scoreasc", "__name__asc"]);
    }

    #[test]
    fn order_by_requires_field() {
        let query = rooms().with_order_by(OrderBy::asc(field("missing")));
        assert!(!query.matches(&doc("rooms/a", 1)));
    }

    #[test]
    fn comparator_uses_direction_then_key() {
        let query = rooms().with_order_by(OrderBy::desc(field("score")));
        let compare = query.comparator();
        assert_eq!(compare(&doc("rooms/a", 10), &doc("rooms/b", 8)), Ordering::Less);
        assert_eq!(compare(&doc("rooms/b", 8), &doc("rooms/a", 8)), Ordering::Greater);
    }

    #[test]
    fn limit_to_last_flips_target() {
        let query = rooms()
            .with_order_by(OrderBy::asc(field("score")))
            .with_limit_to_last(2)
            .starting_at(Bound::new(vec![1.into()], true));
        let target = query.to_target();
        assert_eq!(target.order_by[0].direction, Direction::Descending);
        assert!(target.start_at.is_none());
        assert!(target.end_at.is_some());
        assert_ne!(query.canonical_id(), query.clone().with_limit_to_first(2).canonical_id());
    }
}
