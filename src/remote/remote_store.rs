use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, OnceLock, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, warn};
use serde_json::Value as Json;

use crate::error::{unavailable, SyncError, SyncErrorCode, SyncResult};
use crate::local::LocalStore;
use crate::model::mutation_batch::MutationBatch;
use crate::model::target::{TargetData, TargetId, TargetPurpose};
use crate::model::{DatabaseId, DocumentKey, MutationBatchResult, SnapshotVersion};
use crate::remote::credentials::CredentialsProvider;
use crate::remote::datastore::{ConnectionTokens, Datastore, WireStream};
use crate::remote::remote_syncer::{OnlineState, RemoteSyncer};
use crate::remote::serializer::{
    decode_watch_message, decode_write_response, encode_listen_request, encode_unlisten_request,
    encode_write_handshake, encode_write_request,
};
use crate::remote::watch_change::{WatchChange, WatchTargetChangeState};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};
use crate::util::runtime::{sleep, spawn_detached};

/// Upper bound on writes in flight on the write stream.
pub const MAX_PENDING_WRITES: usize = 10;

/// Consecutive watch stream failures before the client reports Offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 2;

struct RemoteStoreState {
    network_enabled: bool,
    listen_targets: BTreeMap<TargetId, TargetData>,
    online_state: OnlineState,
    watch_stream: Option<Arc<dyn WireStream>>,
    watch_running: bool,
    watch_generation: u64,
    watch_failures: u32,
    watch_backoff: ExponentialBackoff,
    write_stream: Option<Arc<dyn WireStream>>,
    write_running: bool,
    write_generation: u64,
    write_handshake_complete: bool,
    write_backoff: ExponentialBackoff,
    write_pipeline: VecDeque<MutationBatch>,
}

impl RemoteStoreState {
    fn new(backoff: BackoffConfig) -> Self {
        Self {
            network_enabled: false,
            listen_targets: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            watch_stream: None,
            watch_running: false,
            watch_generation: 0,
            watch_failures: 0,
            watch_backoff: ExponentialBackoff::new(backoff.clone()),
            write_stream: None,
            write_running: false,
            write_generation: 0,
            write_handshake_complete: false,
            write_backoff: ExponentialBackoff::new(backoff),
            write_pipeline: VecDeque::new(),
        }
    }
}

/// Owns the listen and write streams and the online-state machine.
///
/// All local state changes are routed through the [`RemoteSyncer`] delegate;
/// the remote store itself never touches persistence beyond stream tokens
/// and pipeline batches read via the local store.
pub struct RemoteStore {
    datastore: Arc<dyn Datastore>,
    auth_credentials: Arc<dyn CredentialsProvider>,
    app_check_credentials: Arc<dyn CredentialsProvider>,
    local_store: Arc<LocalStore>,
    database_id: DatabaseId,
    syncer: OnceLock<Weak<dyn RemoteSyncer>>,
    state: Mutex<RemoteStoreState>,
    // Aggregator callbacks re-enter `state` through the metadata provider,
    // so `state` must never be held while taking this lock.
    aggregator: Mutex<Option<WatchChangeAggregator>>,
}

/// Aggregator-facing view of the remote store's target bookkeeping.
struct RemoteStoreMetadata {
    store: Weak<RemoteStore>,
}

#[async_trait]
impl TargetMetadataProvider for RemoteStoreMetadata {
    async fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        let Some(store) = self.store.upgrade() else {
            return BTreeSet::new();
        };
        match store.syncer() {
            Some(syncer) => syncer.get_remote_keys_for_target(target_id).await,
            None => BTreeSet::new(),
        }
    }

    async fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        let store = self.store.upgrade()?;
        let state = store.state.lock().await;
        state.listen_targets.get(&target_id).cloned()
    }
}

impl RemoteStore {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        auth_credentials: Arc<dyn CredentialsProvider>,
        app_check_credentials: Arc<dyn CredentialsProvider>,
        local_store: Arc<LocalStore>,
        database_id: DatabaseId,
        backoff: BackoffConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            datastore,
            auth_credentials,
            app_check_credentials,
            local_store,
            database_id,
            syncer: OnceLock::new(),
            state: Mutex::new(RemoteStoreState::new(backoff)),
            aggregator: Mutex::new(None),
        })
    }

    /// Wires in the sync engine. Must be called once before the network is
    /// enabled; stored weak so shutdown can drop the engine cleanly.
    pub fn set_remote_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        let _ = self.syncer.set(syncer);
    }

    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer.get().and_then(Weak::upgrade)
    }

    pub async fn enable_network(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            state.network_enabled = true;
        }
        self.start_watch_stream_if_needed().await;
        self.fill_write_pipeline().await;
    }

    pub async fn disable_network(self: &Arc<Self>) {
        let (watch, write) = {
            let mut state = self.state.lock().await;
            state.network_enabled = false;
            state.watch_generation += 1;
            state.write_generation += 1;
            state.write_handshake_complete = false;
            (state.watch_stream.take(), state.write_stream.take())
        };
        if let Some(stream) = watch {
            stream.close();
        }
        if let Some(stream) = write {
            stream.close();
        }
        *self.aggregator.lock().await = None;
        self.set_online_state(OnlineState::Offline).await;
    }

    pub async fn shutdown(self: &Arc<Self>) {
        self.disable_network().await;
    }

    pub async fn online_state(&self) -> OnlineState {
        self.state.lock().await.online_state
    }

    /// Starts listening to a target. Idempotent per target id.
    pub async fn listen(self: &Arc<Self>, target_data: TargetData) {
        let target_id = target_data.target_id();
        let stream_open = {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains_key(&target_id) {
                return;
            }
            state.listen_targets.insert(target_id, target_data.clone());
            state.network_enabled && state.watch_stream.is_some()
        };
        if stream_open {
            self.send_watch_request(&target_data).await;
        } else {
            self.start_watch_stream_if_needed().await;
        }
    }

    pub async fn unlisten(self: &Arc<Self>, target_id: TargetId) {
        let stream = {
            let mut state = self.state.lock().await;
            if state.listen_targets.remove(&target_id).is_none() {
                return;
            }
            state.watch_stream.clone()
        };
        {
            let mut aggregator = self.aggregator.lock().await;
            if let Some(aggregator) = aggregator.as_mut() {
                aggregator.record_pending_target_request(target_id);
                aggregator.remove_target(target_id);
            }
        }
        if let Some(stream) = stream {
            let _ = stream
                .send(encode_unlisten_request(&self.database_id, target_id))
                .await;
        }
    }

    async fn send_watch_request(&self, target_data: &TargetData) {
        {
            let mut aggregator = self.aggregator.lock().await;
            if let Some(aggregator) = aggregator.as_mut() {
                aggregator.record_pending_target_request(target_data.target_id());
            }
        }
        let stream = self.state.lock().await.watch_stream.clone();
        if let Some(stream) = stream {
            let _ = stream
                .send(encode_listen_request(&self.database_id, target_data))
                .await;
        }
    }

    async fn start_watch_stream_if_needed(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock().await;
            if !state.network_enabled
                || state.watch_running
                || state.listen_targets.is_empty()
            {
                return;
            }
            state.watch_running = true;
            state.watch_generation += 1;
            state.watch_generation
        };
        let store = self.clone();
        spawn_detached(async move {
            let mut generation = generation;
            loop {
                store.run_watch_stream(generation).await;
                let mut state = store.state.lock().await;
                if !state.network_enabled || state.listen_targets.is_empty() {
                    state.watch_running = false;
                    return;
                }
                // The network was re-enabled while this task was winding
                // down; take over the fresh generation instead of leaking
                // the stream.
                state.watch_generation += 1;
                generation = state.watch_generation;
            }
        });
    }

    async fn run_watch_stream(self: &Arc<Self>, generation: u64) {
        loop {
            let delay = {
                let mut state = self.state.lock().await;
                if !state.network_enabled
                    || state.watch_generation != generation
                    || state.listen_targets.is_empty()
                {
                    return;
                }
                state.watch_backoff.next_delay()
            };
            sleep(delay).await;

            let tokens = match self.fetch_tokens().await {
                Ok(tokens) => tokens,
                Err(err) => {
                    if !self.handle_watch_failure(generation, err).await {
                        return;
                    }
                    continue;
                }
            };
            let stream = match self.datastore.open_watch_stream(&tokens).await {
                Ok(stream) => stream,
                Err(err) => {
                    if !self.handle_watch_failure(generation, err).await {
                        return;
                    }
                    continue;
                }
            };

            let requests = {
                let mut state = self.state.lock().await;
                if state.watch_generation != generation || !state.network_enabled {
                    stream.close();
                    return;
                }
                state.watch_stream = Some(stream.clone());
                state
                    .listen_targets
                    .values()
                    .map(|data| encode_listen_request(&self.database_id, data))
                    .collect::<Vec<_>>()
            };
            {
                let provider = Arc::new(RemoteStoreMetadata {
                    store: Arc::downgrade(self),
                });
                let mut aggregator =
                    WatchChangeAggregator::new(provider, self.database_id.clone());
                let state = self.state.lock().await;
                for target_id in state.listen_targets.keys() {
                    aggregator.record_pending_target_request(*target_id);
                }
                drop(state);
                *self.aggregator.lock().await = Some(aggregator);
            }
            for request in requests {
                if stream.send(request).await.is_err() {
                    break;
                }
            }

            loop {
                match stream.recv().await {
                    Some(Ok(message)) => {
                        if !self.on_watch_message(generation, message).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        if !self.handle_watch_failure(generation, err).await {
                            return;
                        }
                        break;
                    }
                    None => {
                        let err = unavailable("watch stream closed");
                        if !self.handle_watch_failure(generation, err).await {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Processes one watch message. Returns false when the stream should be
    /// torn down.
    async fn on_watch_message(self: &Arc<Self>, generation: u64, message: Json) -> bool {
        let (change, snapshot_version) =
            match decode_watch_message(&self.database_id, &message) {
                Ok(decoded) => decoded,
                Err(err) => {
                    error!("undecodable watch message: {err}");
                    return self.handle_watch_failure(generation, err).await;
                }
            };

        {
            let mut state = self.state.lock().await;
            if state.watch_generation != generation {
                return false;
            }
            state.watch_backoff.reset();
            state.watch_failures = 0;
        }
        self.set_online_state(OnlineState::Online).await;

        match change {
            WatchChange::Target(target_change) => {
                if target_change.state == WatchTargetChangeState::Removed {
                    if let Some(cause) = target_change.cause.clone() {
                        // Target-level rejection: only the named targets are
                        // affected, the stream stays healthy.
                        for target_id in &target_change.target_ids {
                            self.state.lock().await.listen_targets.remove(target_id);
                            let mut aggregator = self.aggregator.lock().await;
                            if let Some(aggregator) = aggregator.as_mut() {
                                aggregator.remove_target(*target_id);
                            }
                            drop(aggregator);
                            if let Some(syncer) = self.syncer() {
                                let _ = syncer.reject_listen(*target_id, cause.clone()).await;
                            }
                        }
                        return true;
                    }
                }
                {
                    let mut aggregator = self.aggregator.lock().await;
                    if let Some(aggregator) = aggregator.as_mut() {
                        aggregator.handle_target_change(&target_change).await;
                    }
                }
                let is_snapshot_boundary = target_change.state
                    == WatchTargetChangeState::NoChange
                    && target_change.target_ids.is_empty()
                    && !snapshot_version.is_min();
                if is_snapshot_boundary {
                    self.raise_watch_snapshot(snapshot_version).await;
                }
            }
            WatchChange::Document {
                updated_target_ids,
                removed_target_ids,
                key,
                new_document,
            } => {
                let mut aggregator = self.aggregator.lock().await;
                if let Some(aggregator) = aggregator.as_mut() {
                    aggregator
                        .handle_document_change(
                            &updated_target_ids,
                            &removed_target_ids,
                            &key,
                            new_document.as_ref(),
                        )
                        .await;
                }
            }
            WatchChange::ExistenceFilter { target_id, filter } => {
                let mut aggregator = self.aggregator.lock().await;
                if let Some(aggregator) = aggregator.as_mut() {
                    aggregator.handle_existence_filter(target_id, &filter).await;
                }
            }
        }
        true
    }

    /// Closes the snapshot at `snapshot_version` and hands the resulting
    /// event to the sync engine. Mismatched targets are re-listened with
    /// fresh state.
    async fn raise_watch_snapshot(self: &Arc<Self>, snapshot_version: SnapshotVersion) {
        let event = {
            let mut aggregator = self.aggregator.lock().await;
            let Some(aggregator) = aggregator.as_mut() else {
                return;
            };
            aggregator.create_remote_event(snapshot_version).await
        };

        // Keep our copies of the resume tokens fresh so a reconnect resumes
        // from this snapshot instead of replaying it.
        {
            let mut state = self.state.lock().await;
            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(data) = state.listen_targets.get(target_id).cloned() {
                    state.listen_targets.insert(
                        *target_id,
                        data.with_resume_token(change.resume_token.clone(), snapshot_version),
                    );
                }
            }
        }

        let mismatched: Vec<(TargetId, TargetPurpose)> = event
            .target_mismatches
            .iter()
            .map(|(target_id, purpose)| (*target_id, *purpose))
            .collect();
        for (target_id, purpose) in mismatched {
            let relisten = {
                let mut state = self.state.lock().await;
                state.listen_targets.get(&target_id).cloned().map(|data| {
                    let data = TargetData::new(
                        data.target().clone(),
                        target_id,
                        purpose,
                        data.sequence_number(),
                    );
                    state.listen_targets.insert(target_id, data.clone());
                    data
                })
            };
            if let Some(data) = relisten {
                debug!("re-listening to mismatched target {target_id}");
                {
                    let mut aggregator = self.aggregator.lock().await;
                    if let Some(aggregator) = aggregator.as_mut() {
                        aggregator.record_pending_target_request(target_id);
                    }
                }
                let stream = self.state.lock().await.watch_stream.clone();
                if let Some(stream) = stream {
                    let _ = stream
                        .send(encode_unlisten_request(&self.database_id, target_id))
                        .await;
                }
                self.send_watch_request(&data).await;
            }
        }

        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.apply_remote_event(event).await {
                error!("failed to apply remote event: {err}");
            }
        }
    }

    /// Returns false when the stream task should stop for good.
    async fn handle_watch_failure(self: &Arc<Self>, generation: u64, err: SyncError) -> bool {
        if err.code == SyncErrorCode::Unauthenticated {
            self.auth_credentials.invalidate_token();
            self.app_check_credentials.invalidate_token();
        }
        let go_offline = {
            let mut state = self.state.lock().await;
            if state.watch_generation != generation {
                return false;
            }
            state.watch_stream = None;
            if err.code == SyncErrorCode::ResourceExhausted {
                state.watch_backoff.reset_to_max();
            }
            state.watch_failures += 1;
            state.watch_failures >= MAX_WATCH_STREAM_FAILURES
        };
        *self.aggregator.lock().await = None;
        warn!("watch stream failure: {err}");
        if go_offline {
            self.set_online_state(OnlineState::Offline).await;
        }
        !err.is_permanent_stream_error()
    }

    /// Loads batches into the write pipeline up to the cap and starts the
    /// write stream when there is work.
    ///
    /// Boxed because the write stream task calls back into this method,
    /// which would otherwise make the spawned future's type recursive.
    pub fn fill_write_pipeline(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let store = Arc::clone(self);
        async move {
            loop {
                let after_batch_id = {
                    let state = store.state.lock().await;
                    if !state.network_enabled || state.write_pipeline.len() >= MAX_PENDING_WRITES
                    {
                        break;
                    }
                    match state.write_pipeline.back() {
                        Some(batch) => Some(batch.batch_id()),
                        None => None,
                    }
                };
                let after_batch_id = match after_batch_id {
                    Some(id) => id,
                    // Empty pipeline resumes from whatever was already
                    // acknowledged.
                    None => 0,
                };
                let batch = match store.local_store.next_mutation_batch(after_batch_id).await {
                    Ok(Some(batch)) => batch,
                    Ok(None) => break,
                    Err(err) => {
                        error!("failed to read next mutation batch: {err}");
                        break;
                    }
                };
                let send_now = {
                    let mut state = store.state.lock().await;
                    state.write_pipeline.push_back(batch.clone());
                    state.write_handshake_complete && state.write_stream.is_some()
                };
                if send_now {
                    store.send_write_request(&batch).await;
                }
            }
            store.start_write_stream_if_needed().await;
        }
        .boxed()
    }

    async fn send_write_request(&self, batch: &MutationBatch) {
        let token = self
            .local_store
            .get_last_stream_token()
            .await
            .unwrap_or_default();
        let stream = self.state.lock().await.write_stream.clone();
        if let Some(stream) = stream {
            let _ = stream
                .send(encode_write_request(&self.database_id, batch, &token))
                .await;
        }
    }

    async fn start_write_stream_if_needed(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock().await;
            if !state.network_enabled
                || state.write_running
                || state.write_pipeline.is_empty()
            {
                return;
            }
            state.write_running = true;
            state.write_generation += 1;
            state.write_generation
        };
        let store = self.clone();
        spawn_detached(async move {
            let mut generation = generation;
            loop {
                store.run_write_stream(generation).await;
                let mut state = store.state.lock().await;
                if !state.network_enabled || state.write_pipeline.is_empty() {
                    state.write_running = false;
                    return;
                }
                state.write_generation += 1;
                generation = state.write_generation;
            }
        });
    }

    async fn run_write_stream(self: &Arc<Self>, generation: u64) {
        loop {
            let delay = {
                let mut state = self.state.lock().await;
                if !state.network_enabled
                    || state.write_generation != generation
                    || state.write_pipeline.is_empty()
                {
                    return;
                }
                state.write_backoff.next_delay()
            };
            sleep(delay).await;

            let tokens = match self.fetch_tokens().await {
                Ok(tokens) => tokens,
                Err(err) => {
                    if !self.handle_write_failure(generation, err).await {
                        return;
                    }
                    continue;
                }
            };
            let stream = match self.datastore.open_write_stream(&tokens).await {
                Ok(stream) => stream,
                Err(err) => {
                    if !self.handle_write_failure(generation, err).await {
                        return;
                    }
                    continue;
                }
            };

            {
                let mut state = self.state.lock().await;
                if state.write_generation != generation || !state.network_enabled {
                    stream.close();
                    return;
                }
                state.write_stream = Some(stream.clone());
                state.write_handshake_complete = false;
            }
            if stream
                .send(encode_write_handshake(&self.database_id))
                .await
                .is_err()
            {
                let err = unavailable("write handshake send failed");
                if !self.handle_write_failure(generation, err).await {
                    return;
                }
                continue;
            }

            loop {
                match stream.recv().await {
                    Some(Ok(message)) => {
                        if !self.on_write_message(generation, message).await {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        if !self.handle_write_failure(generation, err).await {
                            return;
                        }
                        break;
                    }
                    None => {
                        let err = unavailable("write stream closed");
                        if !self.handle_write_failure(generation, err).await {
                            return;
                        }
                        break;
                    }
                }
            }
        }
    }

    async fn on_write_message(self: &Arc<Self>, generation: u64, message: Json) -> bool {
        let response = match decode_write_response(&message) {
            Ok(response) => response,
            Err(err) => {
                error!("undecodable write response: {err}");
                return self.handle_write_failure(generation, err).await;
            }
        };

        let handshake = {
            let mut state = self.state.lock().await;
            if state.write_generation != generation {
                return false;
            }
            state.write_backoff.reset();
            if state.write_handshake_complete {
                false
            } else {
                state.write_handshake_complete = true;
                true
            }
        };
        self.set_online_state(OnlineState::Online).await;

        if handshake {
            if let Err(err) = self
                .local_store
                .set_last_stream_token(response.stream_token.clone())
                .await
            {
                error!("failed to persist stream token: {err}");
            }
            // Flush everything already queued now that the stream is ready.
            let pending: Vec<MutationBatch> = {
                let state = self.state.lock().await;
                state.write_pipeline.iter().cloned().collect()
            };
            for batch in pending {
                self.send_write_request(&batch).await;
            }
            return true;
        }

        let batch = {
            let mut state = self.state.lock().await;
            state.write_pipeline.pop_front()
        };
        let Some(batch) = batch else {
            error!("write response without a pending batch");
            return true;
        };
        let result = MutationBatchResult::new(
            batch,
            response.commit_version,
            response.results,
            response.stream_token,
        );
        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.apply_successful_write(result).await {
                error!("failed to apply write acknowledgement: {err}");
            }
        }
        self.fill_write_pipeline().await;
        true
    }

    async fn handle_write_failure(self: &Arc<Self>, generation: u64, err: SyncError) -> bool {
        if err.code == SyncErrorCode::Unauthenticated {
            self.auth_credentials.invalidate_token();
            self.app_check_credentials.invalidate_token();
        }
        let (handshake_complete, rejected) = {
            let mut state = self.state.lock().await;
            if state.write_generation != generation {
                return false;
            }
            state.write_stream = None;
            if err.code == SyncErrorCode::ResourceExhausted {
                state.write_backoff.reset_to_max();
            }
            let handshake_complete = state.write_handshake_complete;
            state.write_handshake_complete = false;
            let rejected = if handshake_complete && err.is_permanent_stream_error() {
                state.write_pipeline.pop_front()
            } else {
                None
            };
            (handshake_complete, rejected)
        };
        warn!("write stream failure (handshake done: {handshake_complete}): {err}");

        if let Some(batch) = rejected {
            // The batch itself was refused; surface it and keep the stream.
            if let Some(syncer) = self.syncer() {
                let _ = syncer
                    .reject_failed_write(batch.batch_id(), err.clone())
                    .await;
            }
            return true;
        }
        !err.is_permanent_stream_error()
    }

    async fn set_online_state(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.state.lock().await;
            if state.online_state == new_state {
                false
            } else {
                state.online_state = new_state;
                true
            }
        };
        if changed {
            if let Some(syncer) = self.syncer() {
                syncer.handle_online_state_change(new_state).await;
            }
        }
    }

    async fn fetch_tokens(&self) -> SyncResult<ConnectionTokens> {
        let (auth, app_check) = futures::join!(
            self.auth_credentials.get_token(),
            self.app_check_credentials.get_token()
        );
        Ok(ConnectionTokens {
            auth: auth?,
            app_check: app_check?,
        })
    }
}
