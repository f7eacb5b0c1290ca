use std::collections::{BTreeMap, BTreeSet};

use crate::model::target::{TargetId, TargetPurpose};
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// The net effect of a watch snapshot on one target.
#[derive(Clone, Debug, Default)]
pub struct TargetChange {
    /// Opaque cursor for resuming this target. Empty means unchanged.
    pub resume_token: Vec<u8>,
    /// Whether the backend has declared the target up to date with this
    /// snapshot.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// A change carrying only current/resume-token state, used when a target
    /// had no document-level activity in the snapshot.
    pub fn synthesized(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }
}

/// Atomic unit of remote state applied per watch snapshot boundary.
///
/// Everything in one event is applied under a single persistence transaction
/// so listeners never observe a torn snapshot.
#[derive(Clone, Debug)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter mismatched and must be re-listened
    /// from scratch, with the purpose the re-listen should carry.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Limbo documents this event definitively resolved.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}
