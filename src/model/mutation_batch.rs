use std::collections::{BTreeMap, BTreeSet};

use crate::model::mutation::{
    apply_mutation_to_local_view, apply_mutation_to_remote_document, Mutation, MutationResult,
};
use crate::model::{DocumentKey, FieldMask, MutableDocument, SnapshotVersion, Timestamp};

pub type BatchId = i32;

/// An atomic group of mutations written in one user call.
///
/// `base_mutations` hold pre-transform field snapshots so replaying the batch
/// after a reconnect stays idempotent; they never leave the client.
#[derive(Clone, Debug)]
pub struct MutationBatch {
    batch_id: BatchId,
    local_write_time: Timestamp,
    base_mutations: Vec<Mutation>,
    mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    pub fn base_mutations(&self) -> &[Mutation] {
        &self.base_mutations
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    /// Applies every mutation in this batch that targets `doc`, threading the
    /// changed-field mask through so overlay recomputation sees the combined
    /// effect.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == doc.key() {
                mutated_fields = apply_mutation_to_local_view(
                    mutation,
                    doc,
                    mutated_fields,
                    self.local_write_time,
                );
            }
        }
        mutated_fields
    }

    /// Applies the backend's acknowledgement of this batch to `doc`.
    pub fn apply_to_remote_document(&self, doc: &mut MutableDocument, result: &MutationBatchResult) {
        debug_assert_eq!(self.batch_id, result.batch_id());
        for (mutation, mutation_result) in self.mutations.iter().zip(result.mutation_results()) {
            if mutation.key() == doc.key() {
                apply_mutation_to_remote_document(mutation, doc, mutation_result);
            }
        }
    }
}

/// A successfully committed batch together with the versions the backend
/// assigned.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    batch: MutationBatch,
    commit_version: SnapshotVersion,
    mutation_results: Vec<MutationResult>,
    stream_token: Vec<u8>,
    doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn new(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> Self {
        debug_assert_eq!(batch.mutations().len(), mutation_results.len());
        let doc_versions = batch
            .mutations()
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }

    pub fn batch(&self) -> &MutationBatch {
        &self.batch
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch.batch_id()
    }

    pub fn commit_version(&self) -> SnapshotVersion {
        self.commit_version
    }

    pub fn mutation_results(&self) -> &[MutationResult] {
        &self.mutation_results
    }

    pub fn stream_token(&self) -> &[u8] {
        &self.stream_token
    }

    pub fn doc_versions(&self) -> &BTreeMap<DocumentKey, SnapshotVersion> {
        &self.doc_versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldPath, ObjectValue, Value};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn batch_applies_only_matching_mutations() {
        let mut data = ObjectValue::empty();
        data.set(&field("x"), Value::Integer(1));
        let batch = MutationBatch::new(
            7,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![
                Mutation::set(key("rooms/alpha"), data),
                Mutation::delete(key("rooms/beta")),
            ],
        );
        let mut doc = MutableDocument::invalid(key("rooms/alpha"));
        batch.apply_to_local_view(&mut doc, None);
        assert!(doc.is_found_document());
        assert_eq!(doc.data().field(&field("x")), Some(&Value::Integer(1)));
    }

    #[test]
    fn result_maps_versions_by_key() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![
                Mutation::set(key("rooms/alpha"), ObjectValue::empty()),
                Mutation::delete(key("rooms/beta")),
            ],
        );
        let result = MutationBatchResult::new(
            batch,
            SnapshotVersion::new(Timestamp::new(9, 0)),
            vec![
                MutationResult {
                    version: SnapshotVersion::new(Timestamp::new(8, 0)),
                    transform_results: Vec::new(),
                },
                MutationResult {
                    version: SnapshotVersion::new(Timestamp::new(9, 0)),
                    transform_results: Vec::new(),
                },
            ],
            Vec::new(),
        );
        assert_eq!(
            result.doc_versions().get(&key("rooms/alpha")),
            Some(&SnapshotVersion::new(Timestamp::new(8, 0)))
        );
        assert_eq!(result.doc_versions().len(), 2);
    }
}
