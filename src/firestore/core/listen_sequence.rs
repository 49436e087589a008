use std::sync::atomic::{AtomicI64, Ordering};

use crate::firestore::model::ListenSequenceNumber;

/// Sentinel for "no sequence number assigned".
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Monotonic source of LRU sequence numbers.
///
/// Seeded from the highest number found in the target cache and advanced
/// past numbers other clients report.
#[derive(Debug)]
pub struct ListenSequence {
    previous: AtomicI64,
}

impl ListenSequence {
    pub fn new(previous: ListenSequenceNumber) -> Self {
        Self {
            previous: AtomicI64::new(previous),
        }
    }

    pub fn next(&self) -> ListenSequenceNumber {
        self.previous.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> ListenSequenceNumber {
        self.previous.load(Ordering::SeqCst)
    }

    /// Makes sure future numbers exceed `observed`.
    pub fn observe(&self, observed: ListenSequenceNumber) {
        self.previous.fetch_max(observed, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_numbers_move_sequence_forward() {
        let sequence = ListenSequence::new(5);
        assert_eq!(sequence.next(), 6);
        sequence.observe(20);
        assert_eq!(sequence.next(), 21);
        sequence.observe(3);
        assert_eq!(sequence.next(), 22);
    }
}
