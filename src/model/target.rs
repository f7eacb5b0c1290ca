use crate::model::SnapshotVersion;
use crate::query::Query;

/// Server-side listen target identifier. Even ids are allocated to user
/// queries, odd ids to limbo resolution listens.
pub type TargetId = i32;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPurpose {
    /// A user-issued listen.
    Listen,
    /// Re-listen issued to recover from a failed existence filter.
    ExistenceFilterMismatch,
    /// Single-document listen resolving a limbo key.
    LimboResolution,
}

/// The query shape sent to the backend for a listen.
#[derive(Clone, Debug, PartialEq)]
pub struct Target {
    query: Query,
}

impl Target {
    pub fn new(query: Query) -> Self {
        Self { query }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn canonical_id(&self) -> String {
        self.query.canonical_id()
    }

    pub fn is_document_target(&self) -> bool {
        self.query.is_document_query()
    }
}

/// Everything the target cache tracks for one active target.
#[derive(Clone, Debug)]
pub struct TargetData {
    target: Target,
    target_id: TargetId,
    purpose: TargetPurpose,
    sequence_number: i64,
    snapshot_version: SnapshotVersion,
    last_limbo_free_snapshot_version: SnapshotVersion,
    resume_token: Vec<u8>,
    expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: i64,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    pub fn purpose(&self) -> TargetPurpose {
        self.purpose
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn snapshot_version(&self) -> SnapshotVersion {
        self.snapshot_version
    }

    pub fn last_limbo_free_snapshot_version(&self) -> SnapshotVersion {
        self.last_limbo_free_snapshot_version
    }

    pub fn resume_token(&self) -> &[u8] {
        &self.resume_token
    }

    /// Count of documents the backend believes match, carried alongside the
    /// resume token so resumed listens can be existence-filter checked.
    pub fn expected_count(&self) -> Option<i32> {
        self.expected_count
    }

    pub fn with_resume_token(
        mut self,
        resume_token: Vec<u8>,
        snapshot_version: SnapshotVersion,
    ) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        // A new token invalidates any previously reported count.
        self.expected_count = None;
        self
    }

    pub fn with_sequence_number(mut self, sequence_number: i64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_expected_count(mut self, expected_count: Option<i32>) -> Self {
        self.expected_count = expected_count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourcePath, Timestamp};

    fn target() -> Target {
        Target::new(Query::at_path(
            ResourcePath::from_string("rooms").unwrap(),
        ))
    }

    #[test]
    fn new_target_data_starts_unresumed() {
        let data = TargetData::new(target(), 2, TargetPurpose::Listen, 1);
        assert!(data.resume_token().is_empty());
        assert!(data.snapshot_version().is_min());
        assert_eq!(data.expected_count(), None);
    }

    #[test]
    fn resume_token_update_clears_expected_count() {
        let data = TargetData::new(target(), 2, TargetPurpose::Listen, 1)
            .with_expected_count(Some(5))
            .with_resume_token(vec![1, 2], SnapshotVersion::new(Timestamp::new(4, 0)));
        assert_eq!(data.resume_token(), &[1, 2]);
        assert_eq!(data.expected_count(), None);
        assert_eq!(
            data.snapshot_version(),
            SnapshotVersion::new(Timestamp::new(4, 0))
        );
    }
}
