use crate::model::target::TargetId;

/// Allocates target ids from one of two disjoint parity classes so query
/// targets and limbo-resolution targets never collide: query targets get
/// even ids, limbo targets odd ids.
#[derive(Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

const QUERY_TARGET_ID_START: TargetId = 2;
const LIMBO_TARGET_ID_START: TargetId = 1;

impl TargetIdGenerator {
    /// Generator for query targets, continuing after the highest id the
    /// target cache has seen.
    pub fn for_query_targets(highest_existing_id: TargetId) -> Self {
        let mut next_id = QUERY_TARGET_ID_START.max(highest_existing_id + 1);
        if next_id % 2 != 0 {
            next_id += 1;
        }
        Self { next_id }
    }

    pub fn for_limbo_resolution() -> Self {
        Self {
            next_id: LIMBO_TARGET_ID_START,
        }
    }

    pub fn next_id(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_ids_are_even_and_increasing() {
        let mut generator = TargetIdGenerator::for_query_targets(0);
        assert_eq!(generator.next_id(), 2);
        assert_eq!(generator.next_id(), 4);
    }

    #[test]
    fn query_ids_continue_past_existing() {
        let mut generator = TargetIdGenerator::for_query_targets(5);
        assert_eq!(generator.next_id(), 6);
        let mut generator = TargetIdGenerator::for_query_targets(6);
        assert_eq!(generator.next_id(), 8);
    }

    #[test]
    fn limbo_ids_are_odd() {
        let mut generator = TargetIdGenerator::for_limbo_resolution();
        assert_eq!(generator.next_id(), 1);
        assert_eq!(generator.next_id(), 3);
    }
}
