use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::local::local_documents_view::LocalDocumentsView;
use crate::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::query::{LimitType, Query};

/// Plans local query execution.
///
/// Without a full index the only options are a full collection scan or, for
/// limit queries that produced a complete result at a known snapshot,
/// re-checking the previous result set and merging in documents edited since
/// that snapshot.
pub struct QueryEngine;

impl QueryEngine {
    /// Returns every document matching `query`, unordered; the view layer
    /// applies ordering and limits.
    pub fn get_documents_matching_query(
        view: &LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if !query.has_limit() || last_limbo_free_snapshot_version.is_min() {
            return view.get_documents_matching_query(query, SnapshotVersion::min());
        }

        // Re-check the previous result set first: a document the backend
        // removed no longer matches and falls out here.
        let previous = view.get_documents(remote_keys);
        let mut still_matching: Vec<MutableDocument> = previous
            .into_values()
            .filter(|doc| query.matches(doc))
            .collect();

        let limit = query.limit().unwrap_or(usize::MAX);
        if still_matching.len() < limit {
            // The previous result no longer fills the limit; a document
            // outside the tracked set may now belong, so scan everything.
            debug!(
                "limit query underflowed previous results ({} < {limit}), full scan",
                still_matching.len()
            );
            return view.get_documents_matching_query(query, SnapshotVersion::min());
        }

        still_matching.sort_by(|a, b| match query.limit_type() {
            LimitType::First => query.compare(a, b),
            LimitType::Last => query.compare(b, a),
        });

        // The boundary document defines what could have sorted into the
        // result; anything edited after the limbo-free snapshot (or pending
        // locally) needs re-evaluation, which the merge below provides.
        let mut results: BTreeMap<DocumentKey, MutableDocument> = still_matching
            .into_iter()
            .map(|doc| (doc.key().clone(), doc))
            .collect();
        let updated =
            view.get_documents_matching_query(query, last_limbo_free_snapshot_version);
        results.extend(updated);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::persistence::MemoryPersistence;
    use crate::model::{FieldPath, ObjectValue, ResourcePath, Timestamp, Value};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64, size: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("size").unwrap(), Value::Integer(size));
        MutableDocument::found_document(key(path), version(seconds), data)
    }

    #[tokio::test]
    async fn unlimited_query_always_scans() {
        let persistence = MemoryPersistence::new("alice");
        persistence
            .run_transaction("seed", |state| {
                state.remote_documents.add_entry(doc("rooms/a", 1, 1), version(1));
                state.remote_documents.add_entry(doc("rooms/b", 1, 2), version(1));
                let view = LocalDocumentsView::new(state);
                let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
                let results = QueryEngine::get_documents_matching_query(
                    &view,
                    &query,
                    version(5),
                    &BTreeSet::new(),
                );
                assert_eq!(results.len(), 2);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn limit_query_reuses_previous_results_and_merges_updates() {
        let persistence = MemoryPersistence::new("alice");
        persistence
            .run_transaction("seed", |state| {
                state.remote_documents.add_entry(doc("rooms/a", 1, 1), version(1));
                state.remote_documents.add_entry(doc("rooms/b", 1, 2), version(1));
                // Edited after the limbo-free snapshot.
                state.remote_documents.add_entry(doc("rooms/c", 9, 0), version(9));
                let view = LocalDocumentsView::new(state);
                let query = Query::at_path(ResourcePath::from_string("rooms").unwrap())
                    .with_limit_to_first(2);
                let remote_keys = BTreeSet::from([key("rooms/a"), key("rooms/b")]);
                let results = QueryEngine::get_documents_matching_query(
                    &view,
                    &query,
                    version(5),
                    &remote_keys,
                );
                assert!(results.contains_key(&key("rooms/c")));
                assert_eq!(results.len(), 3);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn limit_query_falls_back_when_previous_results_underflow() {
        let persistence = MemoryPersistence::new("alice");
        persistence
            .run_transaction("seed", |state| {
                state.remote_documents.add_entry(doc("rooms/a", 1, 1), version(1));
                state.remote_documents.add_entry(doc("rooms/b", 1, 2), version(1));
                let view = LocalDocumentsView::new(state);
                let query = Query::at_path(ResourcePath::from_string("rooms").unwrap())
                    .with_limit_to_first(2);
                // Previous result set tracked only one key.
                let remote_keys = BTreeSet::from([key("rooms/a")]);
                let results = QueryEngine::get_documents_matching_query(
                    &view,
                    &query,
                    version(5),
                    &remote_keys,
                );
                assert_eq!(results.len(), 2);
                Ok(())
            })
            .await
            .unwrap();
    }
}
