use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Placeholder produced when a server-timestamp transform is applied locally.
///
/// The placeholder remembers when the write happened and what the field held
/// before, so snapshots can surface either the estimate or the previous value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerTimestampValue {
    pub local_write_time: Timestamp,
    pub previous_value: Option<Box<FirestoreValue>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(#[serde(with = "double_repr")] f64),
    Timestamp(Timestamp),
    ServerTimestamp(ServerTimestampValue),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn from_kind(kind: ValueKind) -> Self {
        Self { kind }
    }

    pub fn null() -> Self {
        Self::from_kind(ValueKind::Null)
    }

    pub fn from_bool(value: bool) -> Self {
        Self::from_kind(ValueKind::Boolean(value))
    }

    pub fn from_integer(value: i64) -> Self {
        Self::from_kind(ValueKind::Integer(value))
    }

    pub fn from_double(value: f64) -> Self {
        Self::from_kind(ValueKind::Double(value))
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self::from_kind(ValueKind::Timestamp(value))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::String(value.into()))
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self::from_kind(ValueKind::Bytes(value))
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self::from_kind(ValueKind::Reference(path.into()))
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self::from_kind(ValueKind::GeoPoint(value))
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Array(ArrayValue::new(values)))
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self::from_kind(ValueKind::Map(MapValue::new(map)))
    }

    pub fn server_timestamp(
        local_write_time: Timestamp,
        previous_value: Option<FirestoreValue>,
    ) -> Self {
        // Chained server timestamps keep the oldest real value.
        let previous_value = match previous_value {
            Some(FirestoreValue {
                kind: ValueKind::ServerTimestamp(inner),
            }) => inner.previous_value,
            other => other.map(Box::new),
        };
        Self::from_kind(ValueKind::ServerTimestamp(ServerTimestampValue {
            local_write_time,
            previous_value,
        }))
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }
}

impl From<i64> for FirestoreValue {
    fn from(value: i64) -> Self {
        Self::from_integer(value)
    }
}

impl From<f64> for FirestoreValue {
    fn from(value: f64) -> Self {
        Self::from_double(value)
    }
}

impl From<bool> for FirestoreValue {
    fn from(value: bool) -> Self {
        Self::from_bool(value)
    }
}

impl From<&str> for FirestoreValue {
    fn from(value: &str) -> Self {
        Self::from_string(value)
    }
}

impl From<String> for FirestoreValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

/// JSON has no literal for NaN or the infinities; those travel as strings.
mod double_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Finite(f64),
        Special(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            Repr::Special("NaN".into()).serialize(serializer)
        } else if value.is_infinite() {
            let label = if *value > 0.0 { "Infinity" } else { "-Infinity" };
            Repr::Special(label.into()).serialize(serializer)
        } else {
            Repr::Finite(*value).serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Finite(value) => Ok(value),
            Repr::Special(label) => match label.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "unexpected double literal {other}"
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        match v.kind() {
            ValueKind::String(value) => assert_eq!(value, "hello"),
            _ => panic!("unexpected kind"),
        }
    }

    #[test]
    fn special_doubles_survive_json() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.5] {
            let encoded = serde_json::to_string(&FirestoreValue::from_double(value)).unwrap();
            let decoded: FirestoreValue = serde_json::from_str(&encoded).unwrap();
            match decoded.kind() {
                ValueKind::Double(back) if value.is_nan() => assert!(back.is_nan()),
                ValueKind::Double(back) => assert_eq!(*back, value),
                other => panic!("unexpected kind {other:?}"),
            }
        }
    }

    #[test]
    fn chained_server_timestamps_keep_original_previous_value() {
        let first = FirestoreValue::server_timestamp(
            Timestamp::new(1, 0),
            Some(FirestoreValue::from_integer(7)),
        );
        let second = FirestoreValue::server_timestamp(Timestamp::new(2, 0), Some(first));
        match second.kind() {
            ValueKind::ServerTimestamp(inner) => {
                assert_eq!(inner.local_write_time, Timestamp::new(2, 0));
                assert_eq!(
                    inner.previous_value.as_deref(),
                    Some(&FirestoreValue::from_integer(7))
                );
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
