use std::collections::BTreeMap;
use std::sync::Arc;

use async_lock::Mutex;
use log::{debug, warn};

use crate::error::{SyncErrorCode, SyncResult};
use crate::local::mutation_queue::MutationQueue;
use crate::local::overlay_cache::DocumentOverlayCache;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetCache;

const MAX_TRANSACTION_ATTEMPTS: usize = 3;

/// Write state owned by a single user identity.
#[derive(Debug, Default)]
pub struct UserStore {
    pub mutation_queue: MutationQueue,
    pub overlays: DocumentOverlayCache,
}

/// All in-memory persistence state.
///
/// The mutation queue and overlays belong to the active user; document and
/// target caches are shared across identities.
#[derive(Debug)]
pub struct PersistenceState {
    user: String,
    pub mutation_queue: MutationQueue,
    pub overlays: DocumentOverlayCache,
    pub remote_documents: RemoteDocumentCache,
    pub target_cache: TargetCache,
    suspended_users: BTreeMap<String, UserStore>,
}

impl PersistenceState {
    fn new(user: String) -> Self {
        Self {
            user,
            mutation_queue: MutationQueue::new(),
            overlays: DocumentOverlayCache::new(),
            remote_documents: RemoteDocumentCache::new(),
            target_cache: TargetCache::new(),
            suspended_users: BTreeMap::new(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Swaps the per-user stores when the signed-in user changes. The old
    /// user's pending writes stay parked until that user signs back in.
    pub fn switch_user(&mut self, user: &str) {
        if user == self.user {
            return;
        }
        let incoming = self.suspended_users.remove(user).unwrap_or_default();
        let outgoing = UserStore {
            mutation_queue: std::mem::replace(&mut self.mutation_queue, incoming.mutation_queue),
            overlays: std::mem::replace(&mut self.overlays, incoming.overlays),
        };
        self.suspended_users
            .insert(std::mem::replace(&mut self.user, user.to_string()), outgoing);
    }
}

/// In-memory persistence guarded by one async mutex.
///
/// Holding a single lock across an entire transaction gives the same
/// all-or-nothing visibility a storage transaction would: no reader ever
/// observes a half-applied batch.
pub struct MemoryPersistence {
    state: Mutex<PersistenceState>,
}

impl MemoryPersistence {
    pub fn new(user: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PersistenceState::new(user.into())),
        })
    }

    /// Runs `op` with exclusive access to the state. Transactions failing
    /// with `Aborted` are retried a bounded number of times; any other error
    /// propagates immediately.
    pub async fn run_transaction<T>(
        &self,
        label: &str,
        mut op: impl FnMut(&mut PersistenceState) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let mut state = self.state.lock().await;
        let mut attempt = 1;
        loop {
            debug!("transaction '{label}' attempt {attempt}");
            match op(&mut state) {
                Err(err)
                    if err.code == SyncErrorCode::Aborted
                        && attempt < MAX_TRANSACTION_ATTEMPTS =>
                {
                    warn!("transaction '{label}' aborted, retrying: {err}");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::aborted;
    use crate::model::{Mutation, ObjectValue, Timestamp};

    #[tokio::test]
    async fn aborted_transactions_are_retried() {
        let persistence = MemoryPersistence::new("alice");
        let mut attempts = 0;
        let result = persistence
            .run_transaction("flaky", |_state| {
                attempts += 1;
                if attempts < 3 {
                    Err(aborted("try again"))
                } else {
                    Ok(attempts)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn aborted_transactions_eventually_fail() {
        let persistence = MemoryPersistence::new("alice");
        let result: SyncResult<()> = persistence
            .run_transaction("hopeless", |_state| Err(aborted("never")))
            .await;
        assert_eq!(result.unwrap_err().code, SyncErrorCode::Aborted);
    }

    #[tokio::test]
    async fn switching_users_parks_pending_writes() {
        let persistence = MemoryPersistence::new("alice");
        persistence
            .run_transaction("write", |state| {
                state.mutation_queue.add_mutation_batch(
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![Mutation::set(
                        crate::model::DocumentKey::from_string("rooms/a").unwrap(),
                        ObjectValue::empty(),
                    )],
                );
                Ok(())
            })
            .await
            .unwrap();
        persistence
            .run_transaction("switch", |state| {
                state.switch_user("bob");
                assert!(state.mutation_queue.is_empty());
                state.switch_user("alice");
                assert!(!state.mutation_queue.is_empty());
                Ok(())
            })
            .await
            .unwrap();
    }
}
