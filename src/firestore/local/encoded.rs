//! Order-preserving byte encoding for storage keys.
//!
//! Strings are escaped (`0x00` becomes `0x00 0xFF`) and terminated with
//! `0x00 0x01`, so comparing encodings compares the strings. A resource path
//! is its segments followed by `0x00 0x00`, which makes a path sort before its
//! descendants and keeps `a` from matching `a/b` in a prefix scan. Integers
//! are big-endian with the sign bit flipped.

use crate::firestore::model::{DocumentKey, ResourcePath, SnapshotVersion};

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;
const SEGMENT_END: u8 = 0x01;
const PATH_END: u8 = 0x00;

#[derive(Clone, Debug, Default)]
pub struct KeyBuilder {
    buf: Vec<u8>,
}

impl KeyBuilder {
    /// Starts a key in the given table namespace.
    pub fn table(name: &str) -> Self {
        Self::default().string(name)
    }

    pub fn string(mut self, value: &str) -> Self {
        for byte in value.bytes() {
            if byte == ESCAPE {
                self.buf.push(ESCAPE);
                self.buf.push(ESCAPED_NUL);
            } else {
                self.buf.push(byte);
            }
        }
        self.buf.push(ESCAPE);
        self.buf.push(SEGMENT_END);
        self
    }

    /// The full path; keys for `a` never share a prefix with keys for `a/b`.
    pub fn path(self, path: &ResourcePath) -> Self {
        let mut builder = self.path_prefix(path);
        builder.buf.push(ESCAPE);
        builder.buf.push(PATH_END);
        builder
    }

    /// Only the segments; as a scan prefix this matches the path and all descendants.
    pub fn path_prefix(mut self, path: &ResourcePath) -> Self {
        for segment in path.iter() {
            self = self.string(segment);
        }
        self
    }

    pub fn document_key(self, key: &DocumentKey) -> Self {
        self.path(key.path())
    }

    pub fn i64(mut self, value: i64) -> Self {
        let flipped = (value as u64) ^ (1 << 63);
        self.buf.extend_from_slice(&flipped.to_be_bytes());
        self
    }

    pub fn i32(self, value: i32) -> Self {
        self.i64(i64::from(value))
    }

    pub fn version(self, version: SnapshotVersion) -> Self {
        let timestamp = version.timestamp();
        self.i64(timestamp.seconds).i32(timestamp.nanos)
    }

    pub fn build(self) -> Vec<u8> {
        self.buf
    }
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last != u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // every byte was 0xFF: no finite upper bound below "infinity"
    vec![u8::MAX; prefix.len() + 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn path_key(path: &str) -> Vec<u8> {
        KeyBuilder::default()
            .path(&ResourcePath::from_string(path).unwrap())
            .build()
    }

    #[test]
    fn path_encoding_orders_segment_wise() {
        let mut paths = vec!["a/b", "a", "a/b/c", "ab", "a\u{0}/z", "b"];
        let mut encoded: Vec<(Vec<u8>, &str)> = paths.iter().map(|p| (path_key(p), *p)).collect();
        encoded.sort();
        paths.sort_by(|l, r| {
            let l: Vec<&str> = l.split('/').collect();
            let r: Vec<&str> = r.split('/').collect();
            l.cmp(&r)
        });
        let by_encoding: Vec<&str> = encoded.into_iter().map(|(_, p)| p).collect();
        assert_eq!(by_encoding, paths);
    }

    #[test]
    fn path_key_does_not_prefix_descendants() {
        let parent = path_key("rooms/a");
        let child = path_key("rooms/a/messages/m");
        assert!(!child.starts_with(&parent));
        let prefix = KeyBuilder::default()
            .path_prefix(&ResourcePath::from_string("rooms/a").unwrap())
            .build();
        assert!(child.starts_with(&prefix));
        assert!(parent.starts_with(&prefix));
    }

    #[test]
    fn integers_sort_numerically() {
        let values = [i64::MIN, -5, -1, 0, 1, 300, i64::MAX];
        let encoded: Vec<Vec<u8>> = values
            .iter()
            .map(|v| KeyBuilder::default().i64(*v).build())
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn versions_sort_chronologically() {
        let early = KeyBuilder::default()
            .version(SnapshotVersion::new(Timestamp::new(1, 999)))
            .build();
        let late = KeyBuilder::default()
            .version(SnapshotVersion::new(Timestamp::new(2, 0)))
            .build();
        assert!(early < late);
    }

    #[test]
    fn prefix_end_bounds_all_extensions() {
        let prefix = vec![0x01, 0xFF];
        let end = prefix_end(&prefix);
        assert_eq!(end, vec![0x02]);
        assert!(vec![0x01, 0xFF, 0xFF, 0xFF] < end);
    }
}
