use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Version of a document or a watch snapshot as reported by the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// Sentinel for "never synced"; sorts before every real version.
    pub fn min() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn max() -> Self {
        Self(Timestamp::new(253_402_300_799, 999_999_999))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn to_micros(&self) -> i64 {
        self.0.to_micros()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({}.{:09})", self.0.seconds, self.0.nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_sorts_first() {
        let version = SnapshotVersion::new(Timestamp::new(0, 1));
        assert!(SnapshotVersion::min() < version);
        assert!(version < SnapshotVersion::max());
        assert!(SnapshotVersion::min().is_min());
    }
}
