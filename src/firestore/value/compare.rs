use std::cmp::Ordering;

use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

/// Position of a value's type in the cross-type sort order.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp(_) => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
    }
}

/// Equality as the backend defines it: integers and doubles never compare
/// equal to each other, NaN equals NaN and `-0.0` differs from `0.0`.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a == b,
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a == b,
        (ValueKind::Double(a), ValueKind::Double(b)) => {
            (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
        }
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a == b,
        (ValueKind::ServerTimestamp(a), ValueKind::ServerTimestamp(b)) => {
            a.local_write_time == b.local_write_time
        }
        (ValueKind::String(a), ValueKind::String(b)) => a == b,
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a == b,
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a == b,
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b) == Ordering::Equal,
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a.values()
                    .iter()
                    .zip(b.values())
                    .all(|(l, r)| values_equal(l, r))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => maps_equal(a, b),
        _ => false,
    }
}

pub fn maps_equal(left: &MapValue, right: &MapValue) -> bool {
    left.len() == right.len()
        && left.fields().iter().all(|(key, value)| {
            right
                .get(key)
                .map(|other| values_equal(value, other))
                .unwrap_or(false)
        })
}

/// Total order over values; different types order by [`type_order`].
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_doubles(*a as f64, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_doubles(*a, *b as f64),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::ServerTimestamp(a), ValueKind::ServerTimestamp(b)) => {
            a.local_write_time.cmp(&b.local_write_time)
        }
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => compare_arrays(a, b),
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// NaN sorts before every other number.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let mut left_segments = left.split('/');
    let mut right_segments = right.split('/');
    loop {
        match (left_segments.next(), right_segments.next()) {
            (Some(l), Some(r)) => match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_arrays(left: &ArrayValue, right: &ArrayValue) -> Ordering {
    for (l, r) in left.values().iter().zip(right.values()) {
        let ordering = compare_values(l, r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.values().len().cmp(&right.values().len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((lk, lv), (rk, rv)) in left.fields().iter().zip(right.fields()) {
        let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

/// Stable textual form used to build target canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        ValueKind::Integer(i) => out.push_str(&i.to_string()),
        ValueKind::Double(d) => out.push_str(&format!("{d:?}")),
        ValueKind::Timestamp(ts) => out.push_str(&format!("time({},{})", ts.seconds, ts.nanos)),
        ValueKind::ServerTimestamp(st) => out.push_str(&format!(
            "serverTimestamp({},{})",
            st.local_write_time.seconds, st.local_write_time.nanos
        )),
        ValueKind::String(s) => out.push_str(s),
        ValueKind::Bytes(b) => out.push_str(&b.to_base64()),
        ValueKind::Reference(r) => out.push_str(r),
        ValueKind::GeoPoint(g) => {
            out.push_str(&format!("geo({},{})", g.latitude(), g.longitude()))
        }
        ValueKind::Array(array) => {
            out.push('[');
            for (index, item) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, item)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_double(2.5),
            FirestoreValue::from_timestamp(Timestamp::new(10, 0)),
            FirestoreValue::server_timestamp(Timestamp::new(1, 0), None),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_reference("a/b"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                compare_values(&pair[0], &pair[1]),
                Ordering::Less,
                "{:?} < {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn integers_and_doubles_compare_numerically_but_are_not_equal() {
        let one = FirestoreValue::from_integer(1);
        let one_double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&one, &one_double), Ordering::Equal);
        assert!(!values_equal(&one, &one_double));
    }

    #[test]
    fn canonical_id_for_nested_values() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), FirestoreValue::from_integer(2));
        map.insert(
            "a".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::from_bool(true)]),
        );
        assert_eq!(
            canonical_id(&FirestoreValue::from_map(map)),
            "{a:[true],b:2}"
        );
    }
}
