use serde::{Deserialize, Serialize};

use crate::firestore::value::{values_equal, FirestoreValue};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<FirestoreValue> {
        self.values
    }

    /// Membership using value equality (so `1` and `1.0` are distinct, NaN matches NaN).
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values.iter().any(|value| values_equal(value, needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_uses_value_equality() {
        let array = ArrayValue::new(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_double(f64::NAN),
        ]);
        assert!(array.contains(&FirestoreValue::from_integer(1)));
        assert!(array.contains(&FirestoreValue::from_double(f64::NAN)));
        assert!(!array.contains(&FirestoreValue::from_double(1.0)));
    }
}
