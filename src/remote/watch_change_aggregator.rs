use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::model::target::{TargetData, TargetId, TargetPurpose};
use crate::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion};
use crate::remote::existence_filter::ExistenceFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::serializer::document_name;
use crate::remote::watch_change::{WatchTargetChange, WatchTargetChangeState};

/// Read access to target metadata the aggregator needs while folding watch
/// changes. Backed by the local store via the sync engine.
#[async_trait]
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the backend has previously told us match the target.
    async fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data for an active listen, `None` once the target was removed.
    async fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Accumulated, not yet emitted state for one target.
#[derive(Debug, Default)]
struct TargetState {
    /// Outstanding AddTarget/RemoveTarget requests the backend has not yet
    /// acknowledged. Changes arriving while pending belong to a previous
    /// incarnation of the target and are ignored.
    pending_responses: i32,
    resume_token: Vec<u8>,
    current: bool,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    has_pending_changes: bool,
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses > 0
    }

    fn update_resume_token(&mut self, token: &[u8]) {
        if !token.is_empty() {
            self.resume_token = token.to_vec();
            self.has_pending_changes = true;
        }
    }

    fn mark_current(&mut self) {
        self.current = true;
        self.has_pending_changes = true;
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.document_changes.insert(key, change_type);
        self.has_pending_changes = true;
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.document_changes.remove(key);
        self.has_pending_changes = true;
    }

    fn clear_pending_changes(&mut self) {
        self.document_changes.clear();
        self.has_pending_changes = false;
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => {
                    change.added_documents.insert(key.clone());
                }
                ChangeType::Modified => {
                    change.modified_documents.insert(key.clone());
                }
                ChangeType::Removed => {
                    change.removed_documents.insert(key.clone());
                }
            }
        }
        change
    }
}

/// Folds the raw watch stream into coherent [`RemoteEvent`]s at snapshot
/// boundaries.
pub struct WatchChangeAggregator {
    provider: Arc<dyn TargetMetadataProvider>,
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_document_target_mappings: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(provider: Arc<dyn TargetMetadataProvider>, database_id: DatabaseId) -> Self {
        Self {
            provider,
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mappings: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    /// Called when the client sends an AddTarget or RemoveTarget request;
    /// the next matching target-change message settles it.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.target_states.entry(target_id).or_default().pending_responses += 1;
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
        self.pending_target_resets.remove(&target_id);
    }

    pub async fn handle_document_change(
        &mut self,
        updated_target_ids: &[TargetId],
        removed_target_ids: &[TargetId],
        key: &DocumentKey,
        new_document: Option<&MutableDocument>,
    ) {
        for target_id in updated_target_ids {
            if !self.is_active_target(*target_id).await {
                continue;
            }
            match new_document {
                Some(doc) if doc.is_found_document() => {
                    self.add_document_to_target(*target_id, doc.clone()).await;
                }
                Some(doc) => {
                    self.remove_document_from_target(*target_id, key, Some(doc.clone()))
                        .await;
                }
                None => {
                    self.remove_document_from_target(*target_id, key, None).await;
                }
            }
        }
        for target_id in removed_target_ids {
            if self.is_active_target(*target_id).await {
                self.remove_document_from_target(*target_id, key, new_document.cloned())
                    .await;
            }
        }
    }

    pub async fn handle_target_change(&mut self, change: &WatchTargetChange) {
        for target_id in self.effective_target_ids(change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    let state = self.target_states.entry(target_id).or_default();
                    if !state.is_pending() {
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    // Acknowledges our AddTarget request.
                    let state = self.target_states.entry(target_id).or_default();
                    if state.is_pending() {
                        state.pending_responses -= 1;
                    }
                    if !state.is_pending() {
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Removed => {
                    // Acknowledges our RemoveTarget request. A removal with a
                    // cause is surfaced by the stream layer, not here.
                    let state = self.target_states.entry(target_id).or_default();
                    if state.is_pending() {
                        state.pending_responses -= 1;
                    }
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    let active = self
                        .provider
                        .target_data_for_target(target_id)
                        .await
                        .is_some();
                    let state = self.target_states.entry(target_id).or_default();
                    if active && !state.is_pending() {
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    let active = self
                        .provider
                        .target_data_for_target(target_id)
                        .await
                        .is_some();
                    if active {
                        self.reset_target(target_id).await;
                        let state = self.target_states.entry(target_id).or_default();
                        state.update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Checks the backend's matching-document count against the local view
    /// of the target. On mismatch, a bloom filter over unchanged names can
    /// narrow the removals; otherwise the whole target is re-listened.
    pub async fn handle_existence_filter(&mut self, target_id: TargetId, filter: &ExistenceFilter) {
        let Some(target_data) = self.provider.target_data_for_target(target_id).await else {
            return;
        };

        if target_data.target().is_document_target() {
            if filter.count == 0 {
                // The lone document was deleted while we were not looking.
                let key = DocumentKey::from_path(target_data.target().query().path().clone())
                    .expect("document target has a document path");
                self.remove_document_from_target(
                    target_id,
                    &key,
                    Some(MutableDocument::no_document(
                        key.clone(),
                        SnapshotVersion::min(),
                    )),
                )
                .await;
            }
            return;
        }

        let current_count = self.current_document_count(target_id).await;
        if current_count == filter.count as usize {
            return;
        }

        let removed = match &filter.unchanged_names {
            Some(bloom) => self.apply_bloom_filter(target_id, bloom, filter.count).await,
            None => None,
        };
        match removed {
            Some(removed_count) => {
                debug!(
                    "existence filter mismatch on target {target_id} narrowed by bloom filter, \
                     removed {removed_count} keys"
                );
            }
            None => {
                debug!("existence filter mismatch on target {target_id}, full re-listen");
                self.reset_target(target_id).await;
                self.pending_target_resets
                    .insert(target_id, TargetPurpose::ExistenceFilterMismatch);
            }
        }
    }

    /// Removes every tracked key the bloom filter proves absent. Returns
    /// `None` when the filter cannot reconcile the count, which forces a
    /// full re-listen.
    async fn apply_bloom_filter(
        &mut self,
        target_id: TargetId,
        bloom: &crate::remote::existence_filter::BloomFilter,
        expected_count: i32,
    ) -> Option<usize> {
        if bloom.bit_count() == 0 {
            return None;
        }
        let existing = self.provider.remote_keys_for_target(target_id).await;
        let mut removed = 0;
        for key in existing.iter() {
            let name = document_name(&self.database_id, key);
            if !bloom.might_contain(&name) {
                self.remove_document_from_target(target_id, key, None).await;
                removed += 1;
            }
        }
        let remaining = self.current_document_count(target_id).await;
        if remaining == expected_count as usize {
            Some(removed)
        } else {
            None
        }
    }

    /// Closes the current snapshot: emits one event covering every dirty
    /// target and clears the per-snapshot accumulators.
    pub async fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();

        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.provider.target_data_for_target(target_id).await else {
                continue;
            };
            let state = self.target_states.get(&target_id).expect("state exists");
            if state.is_pending() {
                continue;
            }
            if !state.has_pending_changes {
                continue;
            }

            let mut change = state.to_target_change();

            // A current single-document target with no update for its key
            // means the backend saw no such document; synthesize the delete
            // so limbo resolution converges.
            if target_data.target().is_document_target() && state.current {
                let key = DocumentKey::from_path(target_data.target().query().path().clone())
                    .expect("document target has a document path");
                let known_remotely = self
                    .provider
                    .remote_keys_for_target(target_id)
                    .await
                    .contains(&key);
                let updated = self.pending_document_updates.contains_key(&key);
                if !known_remotely && !updated {
                    self.pending_document_updates.insert(
                        key.clone(),
                        MutableDocument::no_document(key.clone(), snapshot_version),
                    );
                    change.removed_documents.insert(key);
                }
            }

            if self.pending_target_resets.contains_key(&target_id) {
                // The reset invalidates membership wholesale; report every
                // previously known key as removed.
                change.removed_documents = self.provider.remote_keys_for_target(target_id).await;
                change.added_documents.clear();
                change.modified_documents.clear();
                change.current = false;
            }

            target_changes.insert(target_id, change);
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, target_ids) in &self.pending_document_target_mappings {
            for target_id in target_ids {
                if let Some(data) = self.provider.target_data_for_target(*target_id).await {
                    if data.purpose() == TargetPurpose::LimboResolution {
                        resolved_limbo_documents.insert(key.clone());
                        break;
                    }
                }
            }
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents,
        };
        self.pending_document_target_mappings.clear();
        for state in self.target_states.values_mut() {
            state.clear_pending_changes();
        }
        event
    }

    async fn add_document_to_target(&mut self, target_id: TargetId, doc: MutableDocument) {
        let change_type = if self.target_contains_document(target_id, doc.key()).await {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        let key = doc.key().clone();
        self.target_states
            .entry(target_id)
            .or_default()
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), doc);
        self.pending_document_target_mappings
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    async fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        update: Option<MutableDocument>,
    ) {
        if !self.target_contains_document(target_id, key).await {
            return;
        }
        self.target_states
            .entry(target_id)
            .or_default()
            .add_document_change(key.clone(), ChangeType::Removed);
        if let Some(doc) = update {
            self.pending_document_updates.insert(key.clone(), doc);
        }
        self.pending_document_target_mappings
            .entry(key.clone())
            .or_default()
            .remove(&target_id);
    }

    async fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        if let Some(state) = self.target_states.get(&target_id) {
            match state.document_changes.get(key) {
                Some(ChangeType::Added) | Some(ChangeType::Modified) => return true,
                Some(ChangeType::Removed) => return false,
                None => {}
            }
        }
        self.provider
            .remote_keys_for_target(target_id)
            .await
            .contains(key)
    }

    async fn current_document_count(&self, target_id: TargetId) -> usize {
        let remote = self.provider.remote_keys_for_target(target_id).await;
        let mut count = remote.len();
        if let Some(state) = self.target_states.get(&target_id) {
            for (key, change_type) in &state.document_changes {
                match change_type {
                    ChangeType::Added if !remote.contains(key) => count += 1,
                    ChangeType::Removed if remote.contains(key) => count -= 1,
                    _ => {}
                }
            }
        }
        count
    }

    async fn reset_target(&mut self, target_id: TargetId) {
        let state = self.target_states.entry(target_id).or_default();
        state.clear_pending_changes();
        state.current = false;
        state.resume_token = Vec::new();
        state.has_pending_changes = true;
    }

    async fn is_active_target(&self, target_id: TargetId) -> bool {
        let pending = self
            .target_states
            .get(&target_id)
            .map(|state| state.is_pending())
            .unwrap_or(false);
        !pending
            && self
                .provider
                .target_data_for_target(target_id)
                .await
                .is_some()
    }

    fn effective_target_ids(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            // An empty id list addresses every target we know about.
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }
}
