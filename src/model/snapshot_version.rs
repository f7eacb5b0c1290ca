use crate::model::Timestamp;

/// A version of a document in Firestore, represented as the timestamp the
/// server assigned to the change that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// The smallest possible version. Documents carrying local mutations sit
    /// at this version until the server acknowledges the write.
    pub fn min() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_min(&self) -> bool {
        self.0 == Timestamp::new(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_sorts_before_everything() {
        let min = SnapshotVersion::min();
        let real = SnapshotVersion::new(Timestamp::new(100, 0));
        assert!(min < real);
        assert!(min.is_min());
        assert!(!real.is_min());
    }
}
