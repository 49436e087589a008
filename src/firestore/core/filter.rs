use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument};
use crate::firestore::value::{canonical_id, compare_values, type_order, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: FirestoreValue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Field(FieldFilter),
    Composite {
        op: CompositeOperator,
        filters: Vec<Filter>,
    },
}

impl Filter {
    pub fn field(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Filter::Field(FieldFilter { field, op, value })
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::And,
            filters,
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::Or,
            filters,
        }
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite {
                op: CompositeOperator::And,
                filters,
            } => filters.iter().all(|f| f.matches(document)),
            Filter::Composite {
                op: CompositeOperator::Or,
                filters,
            } => filters.iter().any(|f| f.matches(document)),
        }
    }

    /// Every field filter nested in this filter.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite { filters, .. } => {
                filters.iter().flat_map(|f| f.flattened()).collect()
            }
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => format!(
                "{}{}{}",
                filter.field.canonical_string(),
                filter.op.as_str(),
                canonical_id(&filter.value)
            ),
            Filter::Composite { op, filters } => {
                let label = match op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                let inner: Vec<String> = filters.iter().map(Filter::canonical_id).collect();
                format!("{label}({})", inner.join(","))
            }
        }
    }
}

impl FieldFilter {
    pub fn matches(&self, document: &MutableDocument) -> bool {
        let other = field_value(document, &self.field);
        match self.op {
            Operator::NotEqual => match &other {
                Some(value) if !value.is_null() => {
                    self.op.matches_comparison(compare_values(value, &self.value))
                }
                _ => false,
            },
            Operator::ArrayContains => match other.as_ref().and_then(FirestoreValue::as_array) {
                Some(array) => array.contains(&self.value),
                None => false,
            },
            Operator::ArrayContainsAny => {
                let (Some(array), Some(needles)) = (
                    other.as_ref().and_then(FirestoreValue::as_array),
                    self.value.as_array(),
                ) else {
                    return false;
                };
                array.values().iter().any(|value| needles.contains(value))
            }
            Operator::In => match (other, self.value.as_array()) {
                (Some(value), Some(candidates)) => candidates.contains(&value),
                _ => false,
            },
            Operator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(value) => !value.is_null() && !candidates.contains(&value),
                    None => false,
                }
            }
            _ => match other {
                Some(value) => {
                    type_order(&value) == type_order(&self.value)
                        && self.op.matches_comparison(compare_values(&value, &self.value))
                }
                None => false,
            },
        }
    }
}

/// Reads a field for query evaluation; `__name__` resolves to the key.
pub(crate) fn field_value(document: &MutableDocument, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_key_field() {
        return Some(key_reference(document.key()));
    }
    document.field(field).cloned()
}

pub(crate) fn key_reference(key: &DocumentKey) -> FirestoreValue {
    FirestoreValue::from_reference(key.path().canonical_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn asc(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn desc(field: FieldPath) -> Self {
        Self::new(field, Direction::Descending)
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    pub fn canonical_id(&self) -> String {
        let suffix = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), suffix)
    }
}

/// Cursor position: one value per order-by, plus inclusivity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                compare_values(component, &key_reference(document.key()))
            } else {
                match document.field(&order.field) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// True when a start bound admits `document`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// True when an end bound admits `document`.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub fn canonical_id(&self) -> String {
        let mut out = String::from(if self.inclusive { "b:" } else { "a:" });
        for (index, value) in self.position.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}", canonical_id(value));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ObjectValue, SnapshotVersion};

    fn doc(path: &str, entries: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = ObjectValue::empty();
        for (field, value) in entries {
            data.set(&FieldPath::from_dot_separated(field).unwrap(), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
        )
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn comparisons_require_matching_types() {
        let document = doc("rooms/a", &[("n", 5.into())]);
        assert!(Filter::field(field("n"), Operator::GreaterThan, 4.5.into()).matches(&document));
        assert!(!Filter::field(field("n"), Operator::GreaterThan, "a".into()).matches(&document));
        assert!(!Filter::field(field("missing"), Operator::LessThan, 1.into()).matches(&document));
    }

    #[test]
    fn not_equal_skips_null_and_missing() {
        let with_null = doc("rooms/a", &[("n", FirestoreValue::null())]);
        let without = doc("rooms/b", &[]);
        let filter = Filter::field(field("n"), Operator::NotEqual, 1.into());
        assert!(!filter.matches(&with_null));
        assert!(!filter.matches(&without));
        assert!(filter.matches(&doc("rooms/c", &[("n", "x".into())])));
    }

    #[test]
    fn array_operators() {
        let document = doc(
            "rooms/a",
            &[("tags", FirestoreValue::from_array(vec!["a".into(), "b".into()]))],
        );
        assert!(Filter::field(field("tags"), Operator::ArrayContains, "b".into()).matches(&document));
        assert!(Filter::field(
            field("tags"),
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec!["z".into(), "a".into()])
        )
        .matches(&document));
        let in_filter = Filter::field(
            field("tags"),
            Operator::NotIn,
            FirestoreValue::from_array(vec![FirestoreValue::null()]),
        );
        assert!(!in_filter.matches(&document));
    }

    #[test]
    fn composite_or() {
        let document = doc("rooms/a", &[("n", 1.into())]);
        let filter = Filter::or(vec![
            Filter::field(field("n"), Operator::Equal, 2.into()),
            Filter::field(field("n"), Operator::In, FirestoreValue::from_array(vec![1.into()])),
        ]);
        assert!(filter.matches(&document));
        assert_eq!(filter.canonical_id(), "or(n==2,nin[1])");
    }

    #[test]
    fn bounds_respect_inclusivity() {
        let order = vec![OrderBy::asc(field("n"))];
        let document = doc("rooms/a", &[("n", 5.into())]);
        assert!(Bound::new(vec![5.into()], true).sorts_before_document(&order, &document));
        assert!(!Bound::new(vec![5.into()], false).sorts_before_document(&order, &document));
        assert!(Bound::new(vec![6.into()], false).sorts_after_document(&order, &document));
    }
}
