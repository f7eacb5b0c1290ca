use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;

use crate::core::target_id_generator::TargetIdGenerator;
use crate::error::SyncResult;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::persistence::{MemoryPersistence, PersistenceState};
use crate::local::query_engine::QueryEngine;
use crate::model::mutation::{calculate_overlay_mutation, extract_transform_base_value};
use crate::model::mutation_batch::{BatchId, MutationBatch, MutationBatchResult};
use crate::model::target::{Target, TargetData, TargetId, TargetPurpose};
use crate::model::{
    DocumentKey, FieldMask, MutableDocument, Mutation, Precondition, SnapshotVersion, Timestamp,
    TransformOperation,
};
use crate::query::Query;
use crate::remote::remote_event::RemoteEvent;

/// Documents matching a query plus the keys the backend reports for the
/// query's target.
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// What a view reported back after processing changes, fed into the target
/// cache so later query executions know when results were last complete.
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
}

/// Single owner of the persistence state.
///
/// Everything the rest of the engine knows about local documents flows
/// through these methods; nothing else touches the caches directly.
pub struct LocalStore {
    persistence: Arc<MemoryPersistence>,
}

impl LocalStore {
    pub fn new(persistence: Arc<MemoryPersistence>) -> Self {
        Self { persistence }
    }

    /// Swaps per-user state and reports every document whose local view may
    /// have changed because pending writes appeared or disappeared.
    pub async fn handle_user_change(
        &self,
        user: &str,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("handle user change", |state| {
                let mut affected = all_queued_keys(state);
                state.switch_user(user);
                affected.extend(all_queued_keys(state));
                Ok(recalculate_overlays(state, &affected))
            })
            .await
    }

    /// Queues a batch of mutations and applies them to the local view.
    /// Returns the batch id and the changed documents.
    pub async fn write_locally(
        &self,
        mutations: Vec<Mutation>,
    ) -> SyncResult<(BatchId, BTreeMap<DocumentKey, MutableDocument>)> {
        self.persistence
            .run_transaction("write locally", |state| {
                let keys: BTreeSet<DocumentKey> =
                    mutations.iter().map(|m| m.key().clone()).collect();

                // Base mutations pin the pre-transform numeric values so a
                // resent batch yields the same result.
                let mut base_mutations = Vec::new();
                {
                    let view = LocalDocumentsView::new(state);
                    for mutation in &mutations {
                        let doc = view.get_document(mutation.key());
                        if let Some(base_value) = extract_transform_base_value(mutation, &doc) {
                            let mask = FieldMask::new(
                                mutation
                                    .field_transforms()
                                    .iter()
                                    .filter(|t| {
                                        matches!(t.operation(), TransformOperation::Increment(_))
                                    })
                                    .map(|t| t.field().clone()),
                            );
                            base_mutations.push(Mutation::Patch {
                                key: mutation.key().clone(),
                                data: base_value,
                                field_mask: mask,
                                precondition: Precondition::exists(true),
                                field_transforms: Vec::new(),
                            });
                        }
                    }
                }

                let batch = state.mutation_queue.add_mutation_batch(
                    Timestamp::now(),
                    base_mutations,
                    mutations.clone(),
                );
                let changed = recalculate_overlays(state, &keys);
                Ok((batch.batch_id(), changed))
            })
            .await
    }

    /// Applies a backend acknowledgement: updates the remote cache with the
    /// committed versions, drops the batch, and rebuilds overlays.
    pub async fn acknowledge_batch(
        &self,
        result: MutationBatchResult,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("acknowledge batch", |state| {
                let batch = state.mutation_queue.remove_mutation_batch(result.batch_id())?;
                for (key, version) in result.doc_versions() {
                    let mut doc = state.remote_documents.get_entry(key);
                    if doc.version() < *version {
                        batch.apply_to_remote_document(&mut doc, &result);
                        state
                            .remote_documents
                            .add_entry(doc, result.commit_version());
                    }
                }
                state
                    .mutation_queue
                    .set_last_stream_token(result.stream_token().to_vec());
                Ok(recalculate_overlays(state, &batch.keys()))
            })
            .await
    }

    /// Drops a batch the backend rejected. The local view reverts to the
    /// remaining batches over the cached remote state.
    pub async fn reject_batch(
        &self,
        batch_id: BatchId,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("reject batch", |state| {
                let batch = state.mutation_queue.remove_mutation_batch(batch_id)?;
                Ok(recalculate_overlays(state, &batch.keys()))
            })
            .await
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> SyncResult<BatchId> {
        self.persistence
            .run_transaction("highest batch id", |state| {
                Ok(state.mutation_queue.highest_unacknowledged_batch_id())
            })
            .await
    }

    pub async fn next_mutation_batch(
        &self,
        after_batch_id: BatchId,
    ) -> SyncResult<Option<MutationBatch>> {
        self.persistence
            .run_transaction("next batch", |state| {
                Ok(state
                    .mutation_queue
                    .next_mutation_batch_after_batch_id(after_batch_id)
                    .cloned())
            })
            .await
    }

    pub async fn get_last_stream_token(&self) -> SyncResult<Vec<u8>> {
        self.persistence
            .run_transaction("get stream token", |state| {
                Ok(state.mutation_queue.last_stream_token().to_vec())
            })
            .await
    }

    pub async fn set_last_stream_token(&self, token: Vec<u8>) -> SyncResult<()> {
        self.persistence
            .run_transaction("set stream token", |state| {
                state.mutation_queue.set_last_stream_token(token.clone());
                Ok(())
            })
            .await
    }

    pub async fn read_document(&self, key: &DocumentKey) -> SyncResult<MutableDocument> {
        self.persistence
            .run_transaction("read document", |state| {
                Ok(LocalDocumentsView::new(state).get_document(key))
            })
            .await
    }

    /// Returns target data for `target`, creating it with a fresh even id on
    /// first allocation. Repeated allocation of the same target returns the
    /// cached entry.
    pub async fn allocate_target(&self, target: Target) -> SyncResult<TargetData> {
        self.persistence
            .run_transaction("allocate target", |state| {
                if let Some(existing) = state.target_cache.get_target_data(&target) {
                    return Ok(existing.clone());
                }
                let target_id =
                    TargetIdGenerator::for_query_targets(state.target_cache.highest_target_id())
                        .next_id();
                let sequence_number = state.target_cache.next_sequence_number();
                let data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    sequence_number,
                );
                state.target_cache.add_target_data(data.clone());
                Ok(data)
            })
            .await
    }

    pub async fn release_target(&self, target_id: TargetId) -> SyncResult<()> {
        self.persistence
            .run_transaction("release target", |state| {
                state.target_cache.remove_target_data(target_id);
                Ok(())
            })
            .await
    }

    pub async fn get_target_data(&self, target: &Target) -> SyncResult<Option<TargetData>> {
        self.persistence
            .run_transaction("get target data", |state| {
                Ok(state.target_cache.get_target_data(target).cloned())
            })
            .await
    }

    pub async fn get_remote_keys_for_target(
        &self,
        target_id: TargetId,
    ) -> SyncResult<BTreeSet<DocumentKey>> {
        self.persistence
            .run_transaction("remote keys", |state| {
                Ok(state.target_cache.get_matching_keys(target_id))
            })
            .await
    }

    /// Applies one coherent remote snapshot: target membership and resume
    /// tokens first, then document contents under the version-monotonic
    /// acceptance rule, then the global snapshot watermark.
    pub async fn apply_remote_event(
        &self,
        event: RemoteEvent,
    ) -> SyncResult<BTreeMap<DocumentKey, MutableDocument>> {
        self.persistence
            .run_transaction("apply remote event", |state| {
                let event_version = event.snapshot_version;

                for (target_id, change) in &event.target_changes {
                    let Some(data) = state.target_cache.get_target_data_by_id(*target_id).cloned()
                    else {
                        continue;
                    };
                    state
                        .target_cache
                        .remove_matching_keys(*target_id, &change.removed_documents);
                    state
                        .target_cache
                        .add_matching_keys(*target_id, &change.added_documents);

                    let sequence_number = state.target_cache.next_sequence_number();
                    let mut data = data.with_sequence_number(sequence_number);
                    if event.target_mismatches.contains_key(target_id) {
                        // The filter told us our view of this target is
                        // wrong; restart it from zero state.
                        state.target_cache.remove_all_matching_keys(*target_id);
                        data = data.with_resume_token(Vec::new(), SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        data = data.with_resume_token(change.resume_token.clone(), event_version);
                    }
                    state.target_cache.update_target_data(data);
                }

                let mut changed_keys = BTreeSet::new();
                for (key, doc) in &event.document_updates {
                    let existing = state.remote_documents.get_entry(key);
                    let accept = !existing.is_valid_document()
                        || doc.version() > existing.version()
                        || (doc.version() == existing.version()
                            && existing.has_committed_mutations());
                    if accept {
                        state.remote_documents.add_entry(doc.clone(), event_version);
                        changed_keys.insert(key.clone());
                    } else {
                        debug!(
                            "ignoring stale watch update for {} at {:?} (cached {:?})",
                            key.path().canonical_string(),
                            doc.version(),
                            existing.version()
                        );
                    }
                }

                if !event_version.is_min()
                    && event_version > state.target_cache.last_remote_snapshot_version()
                {
                    state
                        .target_cache
                        .set_last_remote_snapshot_version(event_version);
                }

                let view = LocalDocumentsView::new(state);
                Ok(view.get_documents(&changed_keys))
            })
            .await
    }

    /// Runs `query` against the local caches. `use_previous_results` enables
    /// the limit-query optimization keyed on the last limbo-free snapshot.
    pub async fn execute_query(
        &self,
        query: &Query,
        use_previous_results: bool,
    ) -> SyncResult<QueryResult> {
        self.persistence
            .run_transaction("execute query", |state| {
                let target = Target::new(query.clone());
                let (last_limbo_free, remote_keys) =
                    match state.target_cache.get_target_data(&target) {
                        Some(data) => (
                            data.last_limbo_free_snapshot_version(),
                            state.target_cache.get_matching_keys(data.target_id()),
                        ),
                        None => (SnapshotVersion::min(), BTreeSet::new()),
                    };
                let effective_version = if use_previous_results {
                    last_limbo_free
                } else {
                    SnapshotVersion::min()
                };
                let view = LocalDocumentsView::new(state);
                let documents = QueryEngine::get_documents_matching_query(
                    &view,
                    query,
                    effective_version,
                    &remote_keys,
                );
                Ok(QueryResult {
                    documents,
                    remote_keys: remote_keys.clone(),
                })
            })
            .await
    }

    /// Records which targets delivered a consistent (not from-cache)
    /// snapshot, advancing their last limbo-free version so limit queries
    /// can reuse results.
    pub async fn notify_local_view_changes(
        &self,
        changes: Vec<LocalViewChanges>,
    ) -> SyncResult<()> {
        self.persistence
            .run_transaction("notify view changes", |state| {
                for change in &changes {
                    if change.from_cache {
                        continue;
                    }
                    let Some(data) =
                        state.target_cache.get_target_data_by_id(change.target_id).cloned()
                    else {
                        continue;
                    };
                    let version = state.target_cache.last_remote_snapshot_version();
                    state
                        .target_cache
                        .update_target_data(data.with_last_limbo_free_snapshot_version(version));
                }
                Ok(())
            })
            .await
    }
}

fn all_queued_keys(state: &PersistenceState) -> BTreeSet<DocumentKey> {
    let mut keys = BTreeSet::new();
    let mut batch_id = 0;
    while let Some(batch) = state.mutation_queue.next_mutation_batch_after_batch_id(batch_id) {
        keys.extend(batch.keys());
        batch_id = batch.batch_id();
    }
    keys
}

/// Rebuilds overlays for `keys` by replaying every remaining batch in id
/// order over the cached remote state, and returns the resulting local
/// views.
fn recalculate_overlays(
    state: &mut PersistenceState,
    keys: &BTreeSet<DocumentKey>,
) -> BTreeMap<DocumentKey, MutableDocument> {
    let mut views = BTreeMap::new();
    let mut new_overlays: Vec<(BatchId, DocumentKey, Option<Mutation>)> = Vec::new();

    for key in keys {
        let mut doc = state.remote_documents.get_entry(key);
        let batches = state
            .mutation_queue
            .all_mutation_batches_affecting_document_key(key);
        let largest_batch_id = batches.last().map(|b| b.batch_id()).unwrap_or(0);
        let mut mutated_fields = Some(FieldMask::empty());
        for batch in batches {
            mutated_fields = batch.apply_to_local_view(&mut doc, mutated_fields);
        }
        let overlay = calculate_overlay_mutation(&doc, mutated_fields.as_ref());
        new_overlays.push((largest_batch_id, key.clone(), overlay));
        views.insert(key.clone(), doc);
    }

    for (largest_batch_id, key, overlay) in new_overlays {
        state
            .overlays
            .save_overlays(largest_batch_id, BTreeMap::from([(key, overlay)]));
    }
    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldPath, ObjectValue, ResourcePath, Value};
    use crate::remote::remote_event::TargetChange;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn store() -> LocalStore {
        LocalStore::new(MemoryPersistence::new("alice"))
    }

    fn set_mutation(path: &str, entries: &[(&str, i64)]) -> Mutation {
        let mut data = ObjectValue::empty();
        for (name, value) in entries {
            data.set(&field(name), Value::Integer(*value));
        }
        Mutation::set(key(path), data)
    }

    fn remote_event_with_doc(doc: MutableDocument, event_seconds: i64) -> RemoteEvent {
        RemoteEvent {
            snapshot_version: version(event_seconds),
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeMap::new(),
            document_updates: BTreeMap::from([(doc.key().clone(), doc)]),
            resolved_limbo_documents: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn local_write_is_immediately_visible() {
        let store = store();
        let (batch_id, changed) = store
            .write_locally(vec![set_mutation("rooms/a", &[("x", 1)])])
            .await
            .unwrap();
        assert_eq!(batch_id, 1);
        let doc = changed.get(&key("rooms/a")).unwrap();
        assert!(doc.has_local_mutations());
        assert_eq!(doc.data().field(&field("x")), Some(&Value::Integer(1)));

        let read = store.read_document(&key("rooms/a")).await.unwrap();
        assert!(read.has_local_mutations());
    }

    #[tokio::test]
    async fn acknowledgement_commits_and_clears_overlay() {
        let store = store();
        let (batch_id, _) = store
            .write_locally(vec![set_mutation("rooms/a", &[("x", 1)])])
            .await
            .unwrap();
        let batch = store.next_mutation_batch(0).await.unwrap().unwrap();
        let result = MutationBatchResult::new(
            batch,
            version(7),
            vec![crate::model::MutationResult {
                version: version(7),
                transform_results: Vec::new(),
            }],
            b"token".to_vec(),
        );
        let changed = store.acknowledge_batch(result).await.unwrap();
        let doc = changed.get(&key("rooms/a")).unwrap();
        assert!(doc.has_committed_mutations());
        assert_eq!(store.get_last_stream_token().await.unwrap(), b"token");
        assert_eq!(batch_id, 1);

        // Watch catches up at the committed version; the synced copy wins.
        let mut data = ObjectValue::empty();
        data.set(&field("x"), Value::Integer(1));
        let synced = MutableDocument::found_document(key("rooms/a"), version(7), data);
        let changed = store.apply_remote_event(remote_event_with_doc(synced, 8)).await.unwrap();
        assert!(!changed.get(&key("rooms/a")).unwrap().has_pending_writes());
    }

    #[tokio::test]
    async fn rejection_reverts_local_view() {
        let store = store();
        store
            .apply_remote_event(remote_event_with_doc(
                MutableDocument::found_document(key("rooms/a"), version(1), {
                    let mut data = ObjectValue::empty();
                    data.set(&field("x"), Value::Integer(1));
                    data
                }),
                1,
            ))
            .await
            .unwrap();
        let (batch_id, _) = store
            .write_locally(vec![set_mutation("rooms/a", &[("x", 99)])])
            .await
            .unwrap();
        let changed = store.reject_batch(batch_id).await.unwrap();
        let doc = changed.get(&key("rooms/a")).unwrap();
        assert!(!doc.has_pending_writes());
        assert_eq!(doc.data().field(&field("x")), Some(&Value::Integer(1)));
    }

    #[tokio::test]
    async fn stale_watch_updates_are_dropped() {
        let store = store();
        store
            .apply_remote_event(remote_event_with_doc(
                MutableDocument::found_document(key("rooms/a"), version(5), ObjectValue::empty()),
                5,
            ))
            .await
            .unwrap();
        let changed = store
            .apply_remote_event(remote_event_with_doc(
                MutableDocument::found_document(key("rooms/a"), version(3), ObjectValue::empty()),
                6,
            ))
            .await
            .unwrap();
        assert!(changed.is_empty());
        let doc = store.read_document(&key("rooms/a")).await.unwrap();
        assert_eq!(doc.version(), version(5));
    }

    #[tokio::test]
    async fn allocate_target_is_idempotent_and_even() {
        let store = store();
        let target = Target::new(Query::at_path(ResourcePath::from_string("rooms").unwrap()));
        let first = store.allocate_target(target.clone()).await.unwrap();
        let second = store.allocate_target(target).await.unwrap();
        assert_eq!(first.target_id(), second.target_id());
        assert_eq!(first.target_id() % 2, 0);
    }

    #[tokio::test]
    async fn mismatched_target_loses_resume_token_and_keys() {
        let store = store();
        let target = Target::new(Query::at_path(ResourcePath::from_string("rooms").unwrap()));
        let data = store.allocate_target(target.clone()).await.unwrap();
        let target_id = data.target_id();

        let mut change = TargetChange::synthesized(true, b"rt1".to_vec());
        change.added_documents.insert(key("rooms/a"));
        let event = RemoteEvent {
            snapshot_version: version(4),
            target_changes: BTreeMap::from([(target_id, change)]),
            target_mismatches: BTreeMap::new(),
            document_updates: BTreeMap::new(),
            resolved_limbo_documents: BTreeSet::new(),
        };
        store.apply_remote_event(event).await.unwrap();
        assert_eq!(
            store.get_remote_keys_for_target(target_id).await.unwrap().len(),
            1
        );

        let event = RemoteEvent {
            snapshot_version: version(5),
            target_changes: BTreeMap::from([(target_id, TargetChange::default())]),
            target_mismatches: BTreeMap::from([(
                target_id,
                TargetPurpose::ExistenceFilterMismatch,
            )]),
            document_updates: BTreeMap::new(),
            resolved_limbo_documents: BTreeSet::new(),
        };
        store.apply_remote_event(event).await.unwrap();
        assert!(store.get_remote_keys_for_target(target_id).await.unwrap().is_empty());
        let data = store.get_target_data(&target).await.unwrap().unwrap();
        assert!(data.resume_token().is_empty());
    }

    #[tokio::test]
    async fn user_change_parks_and_restores_mutations() {
        let store = store();
        store
            .write_locally(vec![set_mutation("rooms/a", &[("x", 1)])])
            .await
            .unwrap();
        let changed = store.handle_user_change("bob").await.unwrap();
        assert!(!changed.get(&key("rooms/a")).unwrap().has_pending_writes());
        let changed = store.handle_user_change("alice").await.unwrap();
        assert!(changed.get(&key("rooms/a")).unwrap().has_local_mutations());
    }
}
