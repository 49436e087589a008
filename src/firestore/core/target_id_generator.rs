use crate::firestore::model::TargetId;

/// Hands out target ids from one of two disjoint sequences: even ids for
/// query targets stored in the target cache, odd ids for limbo-resolution
/// targets owned by the sync engine.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// First id returned is 2, then every following even id.
    pub fn for_target_cache() -> Self {
        Self { last_id: 0 }
    }

    /// First id returned is 1, then every following odd id.
    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    /// Continues the even sequence after `highest`, the largest id seen so far.
    pub fn for_target_cache_after(highest: TargetId) -> Self {
        let mut generator = Self::for_target_cache();
        if highest > generator.last_id {
            generator.last_id = highest + (highest % 2);
        }
        generator
    }

    pub fn next_id(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_do_not_overlap() {
        let mut cache = TargetIdGenerator::for_target_cache();
        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!((cache.next_id(), cache.next_id()), (2, 4));
        assert_eq!((sync.next_id(), sync.next_id()), (1, 3));
    }

    #[test]
    fn resumes_after_highest_id() {
        assert_eq!(TargetIdGenerator::for_target_cache_after(6).next_id(), 8);
        assert_eq!(TargetIdGenerator::for_target_cache_after(7).next_id(), 10);
    }
}
