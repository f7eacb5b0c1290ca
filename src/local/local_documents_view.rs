use std::collections::{BTreeMap, BTreeSet};

use crate::local::mutation_queue::MutationQueue;
use crate::local::overlay_cache::DocumentOverlayCache;
use crate::local::persistence::PersistenceState;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::mutation::apply_mutation_to_local_view;
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion, Timestamp};
use crate::query::Query;

/// Read-side merge of the remote document cache with pending-write overlays.
///
/// Borrowed from the persistence state for the duration of one transaction;
/// it never mutates anything, the latency-compensated view is derived fresh
/// on every read.
pub struct LocalDocumentsView<'a> {
    remote_documents: &'a RemoteDocumentCache,
    mutation_queue: &'a MutationQueue,
    overlays: &'a DocumentOverlayCache,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(state: &'a PersistenceState) -> Self {
        Self {
            remote_documents: &state.remote_documents,
            mutation_queue: &state.mutation_queue,
            overlays: &state.overlays,
        }
    }

    /// The local view of one document: the cached remote state with this
    /// key's overlay applied on top.
    pub fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let mut doc = self.remote_documents.get_entry(key);
        if let Some(overlay) = self.overlays.get_overlay(key) {
            apply_mutation_to_local_view(overlay.mutation(), &mut doc, None, Timestamp::now());
        }
        doc
    }

    /// Local views for each requested key. Missing documents come back as
    /// invalid entries so callers see every key they asked for.
    pub fn get_documents(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter()
            .map(|key| (key.clone(), self.get_document(key)))
            .collect()
    }

    /// Documents matching `query`, overlay-applied, restricted to remote
    /// entries read after `since_read_time`. Documents that only exist as
    /// overlays (local creations) are always considered.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())
                .expect("document query path is a document key");
            let doc = self.get_document(&key);
            return if query.matches(&doc) {
                BTreeMap::from([(key, doc)])
            } else {
                BTreeMap::new()
            };
        }

        let mut results = BTreeMap::new();
        let remote = self
            .remote_documents
            .get_all_from_collection(query.path(), since_read_time);
        let overlay_keys: BTreeSet<DocumentKey> = self
            .overlays
            .get_overlays_for_collection(query.path(), 0)
            .into_keys()
            .collect();

        let mut candidates: BTreeSet<DocumentKey> = remote.into_keys().collect();
        candidates.extend(overlay_keys);

        for key in candidates {
            let doc = self.get_document(&key);
            if query.matches(&doc) {
                results.insert(key, doc);
            }
        }
        results
    }

    /// Whether any queued batch still touches `key`. Distinguishes a clean
    /// cache miss from a pending creation.
    pub fn has_pending_mutations(&self, key: &DocumentKey) -> bool {
        !self
            .mutation_queue
            .all_mutation_batches_affecting_document_key(key)
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::MemoryPersistence;
    use crate::model::{FieldPath, Mutation, ObjectValue, Value};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[tokio::test]
    async fn overlay_is_applied_on_top_of_remote_state() {
        let persistence = MemoryPersistence::new("alice");
        persistence
            .run_transaction("seed", |state| {
                let mut data = ObjectValue::empty();
                data.set(&field("x"), Value::Integer(1));
                state.remote_documents.add_entry(
                    MutableDocument::found_document(key("rooms/a"), version(1), data),
                    version(1),
                );
                let mut patched = ObjectValue::empty();
                patched.set(&field("x"), Value::Integer(9));
                state.overlays.save_overlays(
                    1,
                    BTreeMap::from([(key("rooms/a"), Some(Mutation::set(key("rooms/a"), patched)))]),
                );
                let view = LocalDocumentsView::new(state);
                let doc = view.get_document(&key("rooms/a"));
                assert_eq!(doc.data().field(&field("x")), Some(&Value::Integer(9)));
                assert!(doc.has_local_mutations());
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn query_sees_locally_created_documents() {
        let persistence = MemoryPersistence::new("alice");
        persistence
            .run_transaction("seed", |state| {
                state.overlays.save_overlays(
                    1,
                    BTreeMap::from([(
                        key("rooms/new"),
                        Some(Mutation::set(key("rooms/new"), ObjectValue::empty())),
                    )]),
                );
                let view = LocalDocumentsView::new(state);
                let query = Query::at_path(crate::model::ResourcePath::from_string("rooms").unwrap());
                let results = view.get_documents_matching_query(&query, SnapshotVersion::min());
                assert!(results.contains_key(&key("rooms/new")));
                Ok(())
            })
            .await
            .unwrap();
    }
}
