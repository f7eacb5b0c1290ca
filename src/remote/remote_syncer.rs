use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::model::mutation_batch::{BatchId, MutationBatchResult};
use crate::model::target::TargetId;
use crate::model::DocumentKey;
use crate::remote::remote_event::RemoteEvent;

/// Connectivity as surfaced to listeners. `Unknown` is the optimistic
/// startup state; `Offline` is only entered after repeated failures or an
/// explicit disable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    Unknown,
    Online,
    Offline,
}

/// Upcalls from the remote store into the sync engine. The remote store
/// never touches local state directly; everything flows through these.
#[async_trait]
pub trait RemoteSyncer: Send + Sync {
    async fn apply_remote_event(&self, event: RemoteEvent) -> SyncResult<()>;

    /// A single target was rejected by the backend; other targets on the
    /// shared stream are unaffected.
    async fn reject_listen(&self, target_id: TargetId, error: SyncError) -> SyncResult<()>;

    async fn apply_successful_write(&self, result: MutationBatchResult) -> SyncResult<()>;

    async fn reject_failed_write(&self, batch_id: BatchId, error: SyncError) -> SyncResult<()>;

    async fn handle_online_state_change(&self, state: OnlineState);

    /// Keys the local store tracks for the target, consulted during watch
    /// change aggregation.
    async fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;
}
