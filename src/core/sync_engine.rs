use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, OnceLock, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::channel::oneshot;
use log::{debug, warn};

use crate::core::target_id_generator::TargetIdGenerator;
use crate::core::view::{View, ViewSnapshot};
use crate::error::{SyncError, SyncResult};
use crate::local::{LocalStore, LocalViewChanges};
use crate::model::mutation_batch::{BatchId, MutationBatchResult};
use crate::model::target::{Target, TargetData, TargetId, TargetPurpose};
use crate::model::{DocumentKey, MutableDocument, Mutation, SnapshotVersion};
use crate::query::Query;
use crate::remote::remote_event::RemoteEvent;
use crate::remote::remote_store::RemoteStore;
use crate::remote::remote_syncer::{OnlineState, RemoteSyncer};

/// Bound on simultaneously in-flight single-document limbo listens.
pub const MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// Receives everything the sync engine produces for the listener layer.
#[async_trait]
pub trait SyncEngineObserver: Send + Sync {
    async fn on_view_snapshots(&self, snapshots: Vec<ViewSnapshot>);
    async fn on_query_error(&self, query: Query, error: SyncError);
    async fn on_online_state_change(&self, state: OnlineState);
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the backend has sent any document for this key. Until then
    /// the key is not reported as remotely known, so a current target with
    /// no update synthesizes the deletion.
    received_document: bool,
}

struct SyncEngineState {
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, String>,
    limbo_refs: BTreeMap<DocumentKey, usize>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    limbo_target_id_generator: TargetIdGenerator,
    pending_writes: BTreeMap<BatchId, oneshot::Sender<SyncResult<()>>>,
    online_state: OnlineState,
}

/// Binds queries to watch targets, routes writes, and resolves limbo
/// documents. Owns one [`View`] per active query.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: Arc<RemoteStore>,
    observer: OnceLock<Weak<dyn SyncEngineObserver>>,
    max_concurrent_limbo_resolutions: usize,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(local_store: Arc<LocalStore>, remote_store: Arc<RemoteStore>) -> Arc<Self> {
        Arc::new(Self {
            local_store,
            remote_store,
            observer: OnceLock::new(),
            max_concurrent_limbo_resolutions: MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            state: Mutex::new(SyncEngineState {
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                limbo_refs: BTreeMap::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                limbo_target_id_generator: TargetIdGenerator::for_limbo_resolution(),
                pending_writes: BTreeMap::new(),
                online_state: OnlineState::Unknown,
            }),
        })
    }

    pub fn set_observer(&self, observer: Weak<dyn SyncEngineObserver>) {
        let _ = self.observer.set(observer);
    }

    fn observer(&self) -> Option<Arc<dyn SyncEngineObserver>> {
        self.observer.get().and_then(Weak::upgrade)
    }

    /// Starts listening to `query`, emitting an initial snapshot from local
    /// state. Returns the target id backing the query.
    pub async fn listen(&self, query: Query) -> SyncResult<TargetId> {
        let canonical_id = query.canonical_id();
        {
            let state = self.state.lock().await;
            if let Some(existing) = state.query_views.get(&canonical_id) {
                return Ok(existing.target_id);
            }
        }

        let target_data = self
            .local_store
            .allocate_target(Target::new(query.clone()))
            .await?;
        let target_id = target_data.target_id();
        let query_result = self.local_store.execute_query(&query, true).await?;

        let mut view = View::new(query.clone(), query_result.remote_keys);
        let computed = view.compute_changes(&query_result.documents);
        let view_change = view.apply_changes(computed, None);
        debug_assert!(view_change.limbo_changes.is_empty());

        {
            let mut state = self.state.lock().await;
            state.query_views.insert(
                canonical_id.clone(),
                QueryView {
                    query,
                    target_id,
                    view,
                },
            );
            state.queries_by_target.insert(target_id, canonical_id);
        }

        self.remote_store.listen(target_data).await;
        if let Some(snapshot) = view_change.snapshot {
            if let Some(observer) = self.observer() {
                observer.on_view_snapshots(vec![snapshot]).await;
            }
        }
        Ok(target_id)
    }

    pub async fn unlisten(&self, query: &Query) -> SyncResult<()> {
        let canonical_id = query.canonical_id();
        let (target_id, limbo_keys) = {
            let mut state = self.state.lock().await;
            let Some(query_view) = state.query_views.remove(&canonical_id) else {
                return Ok(());
            };
            state.queries_by_target.remove(&query_view.target_id);
            let limbo_keys: Vec<DocumentKey> =
                query_view.view.limbo_documents().iter().cloned().collect();
            (query_view.target_id, limbo_keys)
        };

        let stops = {
            let mut state = self.state.lock().await;
            let mut stops = Vec::new();
            for key in limbo_keys {
                if let Some(stopped) = release_limbo_ref(&mut state, &key) {
                    stops.push(stopped);
                }
            }
            stops
        };
        for limbo_target_id in stops {
            self.remote_store.unlisten(limbo_target_id).await;
        }

        self.local_store.release_target(target_id).await?;
        self.remote_store.unlisten(target_id).await;
        Ok(())
    }

    /// Applies the mutations locally and queues them for the backend. The
    /// returned receiver resolves when the backend acknowledges or rejects
    /// the batch.
    pub async fn write(
        &self,
        mutations: Vec<Mutation>,
    ) -> SyncResult<oneshot::Receiver<SyncResult<()>>> {
        let (batch_id, changes) = self.local_store.write_locally(mutations).await?;
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.pending_writes.insert(batch_id, sender);
        }
        self.emit_new_snapshots(changes, None).await?;
        self.remote_store.fill_write_pipeline().await;
        Ok(receiver)
    }

    /// Switches the active user: pending writes for the old user are parked
    /// and views are recomputed against the new user's mutations.
    pub async fn handle_user_change(&self, user: &str) -> SyncResult<()> {
        let changes = self.local_store.handle_user_change(user).await?;
        {
            let mut state = self.state.lock().await;
            // Writes in flight for the previous user never resolve here.
            state.pending_writes.clear();
        }
        self.emit_new_snapshots(changes, None).await?;
        self.remote_store.fill_write_pipeline().await;
        Ok(())
    }

    /// Re-runs every affected view over `changes` and delivers the
    /// resulting snapshots. `remote_event` carries per-target metadata when
    /// the changes came from the watch stream.
    async fn emit_new_snapshots(
        &self,
        changes: BTreeMap<DocumentKey, MutableDocument>,
        remote_event: Option<&RemoteEvent>,
    ) -> SyncResult<()> {
        let mut snapshots = Vec::new();
        let mut view_change_notifications = Vec::new();
        let mut limbo_stops = Vec::new();
        let limbo_starts;

        {
            let mut state = self.state.lock().await;
            let canonical_ids: Vec<String> = state.query_views.keys().cloned().collect();
            for canonical_id in canonical_ids {
                let (query, target_id, computed) = {
                    let query_view = state
                        .query_views
                        .get(&canonical_id)
                        .expect("view present for id");
                    (
                        query_view.query.clone(),
                        query_view.target_id,
                        query_view.view.compute_changes(&changes),
                    )
                };

                let computed = if computed.needs_refill {
                    // The limit view lost a member; only a full query knows
                    // the replacement.
                    let result = self.local_store.execute_query(&query, false).await?;
                    let query_view = state
                        .query_views
                        .get(&canonical_id)
                        .expect("view present for id");
                    query_view.view.compute_changes(&result.documents)
                } else {
                    computed
                };

                let target_change =
                    remote_event.and_then(|event| event.target_changes.get(&target_id));
                let query_view = state
                    .query_views
                    .get_mut(&canonical_id)
                    .expect("view present for id");
                let view_change = query_view.view.apply_changes(computed, target_change);

                for limbo_change in view_change.limbo_changes {
                    if limbo_change.added {
                        acquire_limbo_ref(&mut state, limbo_change.key);
                    } else if let Some(stopped) =
                        release_limbo_ref(&mut state, &limbo_change.key)
                    {
                        limbo_stops.push(stopped);
                    }
                }

                if let Some(snapshot) = view_change.snapshot {
                    view_change_notifications.push(LocalViewChanges {
                        target_id,
                        from_cache: snapshot.from_cache,
                    });
                    snapshots.push(snapshot);
                }
            }
            limbo_starts = pump_limbo_queue(&mut state, self.max_concurrent_limbo_resolutions);
        }

        for target_id in limbo_stops {
            self.remote_store.unlisten(target_id).await;
        }
        for target_data in limbo_starts {
            debug!(
                "starting limbo resolution for {}",
                target_data.target().query().path().canonical_string()
            );
            self.remote_store.listen(target_data).await;
        }

        self.local_store
            .notify_local_view_changes(view_change_notifications)
            .await?;
        if !snapshots.is_empty() {
            if let Some(observer) = self.observer() {
                observer.on_view_snapshots(snapshots).await;
            }
        }
        Ok(())
    }

    async fn complete_pending_write(&self, batch_id: BatchId, result: SyncResult<()>) {
        let sender = {
            let mut state = self.state.lock().await;
            state.pending_writes.remove(&batch_id)
        };
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

fn acquire_limbo_ref(state: &mut SyncEngineState, key: DocumentKey) {
    let refs = state.limbo_refs.entry(key.clone()).or_insert(0);
    *refs += 1;
    if *refs > 1 {
        return;
    }
    if state.active_limbo_targets_by_key.contains_key(&key)
        || state.enqueued_limbo_resolutions.contains(&key)
    {
        return;
    }
    state.enqueued_limbo_resolutions.push_back(key);
}

/// Drops one reference; returns the limbo target to unlisten when the last
/// reference went away while a resolution was active.
fn release_limbo_ref(state: &mut SyncEngineState, key: &DocumentKey) -> Option<TargetId> {
    let refs = state.limbo_refs.get_mut(key)?;
    *refs = refs.saturating_sub(1);
    if *refs > 0 {
        return None;
    }
    state.limbo_refs.remove(key);
    if let Some(target_id) = state.active_limbo_targets_by_key.remove(key) {
        state.active_limbo_resolutions_by_target.remove(&target_id);
        return Some(target_id);
    }
    state.enqueued_limbo_resolutions.retain(|queued| queued != key);
    None
}

/// Starts queued resolutions up to the concurrency cap. Returns the targets
/// to listen to once the state lock is released.
fn pump_limbo_queue(state: &mut SyncEngineState, cap: usize) -> Vec<TargetData> {
    let mut started = Vec::new();
    while state.active_limbo_resolutions_by_target.len() < cap {
        let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
            break;
        };
        let target_id = state.limbo_target_id_generator.next_id();
        state
            .active_limbo_targets_by_key
            .insert(key.clone(), target_id);
        state.active_limbo_resolutions_by_target.insert(
            target_id,
            LimboResolution {
                key: key.clone(),
                received_document: false,
            },
        );
        started.push(TargetData::new(
            Target::new(Query::for_document(&key)),
            target_id,
            TargetPurpose::LimboResolution,
            0,
        ));
    }
    started
}

#[async_trait]
impl RemoteSyncer for SyncEngine {
    async fn apply_remote_event(&self, event: RemoteEvent) -> SyncResult<()> {
        {
            let mut state = self.state.lock().await;
            for (target_id, change) in &event.target_changes {
                let Some(resolution) =
                    state.active_limbo_resolutions_by_target.get_mut(target_id)
                else {
                    continue;
                };
                if change.added_documents.contains(&resolution.key)
                    || change.modified_documents.contains(&resolution.key)
                {
                    resolution.received_document = true;
                } else if change.removed_documents.contains(&resolution.key) {
                    resolution.received_document = false;
                }
            }
        }
        let changes = self.local_store.apply_remote_event(event.clone()).await?;
        self.emit_new_snapshots(changes, Some(&event)).await
    }

    async fn reject_listen(&self, target_id: TargetId, error: SyncError) -> SyncResult<()> {
        let limbo_key = {
            let mut state = self.state.lock().await;
            state
                .active_limbo_resolutions_by_target
                .remove(&target_id)
                .map(|resolution| {
                    state.active_limbo_targets_by_key.remove(&resolution.key);
                    resolution.key
                })
        };

        if let Some(key) = limbo_key {
            // The backend refused the single-document listen; treat the
            // document as deleted so the views release it.
            warn!(
                "limbo resolution for {} failed: {}",
                key.path().canonical_string(),
                error
            );
            let mut changes = BTreeMap::new();
            changes.insert(
                key.clone(),
                MutableDocument::no_document(key, SnapshotVersion::min()),
            );
            return self.emit_new_snapshots(changes, None).await;
        }

        let (query, limbo_keys) = {
            let mut state = self.state.lock().await;
            let Some(canonical_id) = state.queries_by_target.remove(&target_id) else {
                return Ok(());
            };
            let Some(query_view) = state.query_views.remove(&canonical_id) else {
                return Ok(());
            };
            let limbo_keys: Vec<DocumentKey> =
                query_view.view.limbo_documents().iter().cloned().collect();
            (query_view.query, limbo_keys)
        };
        let stops = {
            let mut state = self.state.lock().await;
            let mut stops = Vec::new();
            for key in limbo_keys {
                if let Some(stopped) = release_limbo_ref(&mut state, &key) {
                    stops.push(stopped);
                }
            }
            stops
        };
        for limbo_target_id in stops {
            self.remote_store.unlisten(limbo_target_id).await;
        }
        self.local_store.release_target(target_id).await?;
        if let Some(observer) = self.observer() {
            observer.on_query_error(query, error).await;
        }
        Ok(())
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> SyncResult<()> {
        let batch_id = result.batch_id();
        let changes = self.local_store.acknowledge_batch(result).await?;
        self.complete_pending_write(batch_id, Ok(())).await;
        self.emit_new_snapshots(changes, None).await
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: SyncError) -> SyncResult<()> {
        let changes = self.local_store.reject_batch(batch_id).await?;
        self.complete_pending_write(batch_id, Err(error)).await;
        self.emit_new_snapshots(changes, None).await
    }

    async fn handle_online_state_change(&self, online_state: OnlineState) {
        let mut snapshots = Vec::new();
        {
            let mut state = self.state.lock().await;
            state.online_state = online_state;
            if online_state == OnlineState::Offline {
                for query_view in state.query_views.values_mut() {
                    let view_change = query_view.view.apply_offline();
                    if let Some(snapshot) = view_change.snapshot {
                        snapshots.push(snapshot);
                    }
                }
            }
        }
        if !snapshots.is_empty() {
            if let Some(observer) = self.observer() {
                observer.on_view_snapshots(snapshots).await;
            }
        }
        if let Some(observer) = self.observer() {
            observer.on_online_state_change(online_state).await;
        }
    }

    async fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        {
            let state = self.state.lock().await;
            if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
                let mut keys = BTreeSet::new();
                if resolution.received_document {
                    keys.insert(resolution.key.clone());
                }
                return keys;
            }
        }
        self.local_store
            .get_remote_keys_for_target(target_id)
            .await
            .unwrap_or_default()
    }
}
