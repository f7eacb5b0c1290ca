use crate::error::SyncError;
use crate::model::target::TargetId;
use crate::model::{DocumentKey, MutableDocument};
use crate::remote::existence_filter::ExistenceFilter;

/// State transitions the backend reports for listen targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// A target-level message from the watch stream. An empty `target_ids` list
/// addresses every active target.
#[derive(Clone, Debug)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub cause: Option<SyncError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(mut self, cause: SyncError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// One decoded message from the watch stream.
#[derive(Clone, Debug)]
pub enum WatchChange {
    /// A document entered, changed within, or left some targets. A `None`
    /// document means a delete or removal without new contents.
    Document {
        updated_target_ids: Vec<TargetId>,
        removed_target_ids: Vec<TargetId>,
        key: DocumentKey,
        new_document: Option<MutableDocument>,
    },
    Target(WatchTargetChange),
    ExistenceFilter {
        target_id: TargetId,
        filter: ExistenceFilter,
    },
}
