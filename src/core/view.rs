use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, MutableDocument};
use crate::query::{LimitType, Query};
use crate::remote::remote_event::TargetChange;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Debug)]
pub struct DocumentViewChange {
    pub change_type: DocumentChangeType,
    pub document: MutableDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    None,
    Local,
    Synced,
}

/// What a query result looks like to a listener at one point in time.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: Vec<MutableDocument>,
    pub document_changes: Vec<DocumentViewChange>,
    pub from_cache: bool,
    pub has_pending_writes: bool,
    pub sync_state_changed: bool,
}

/// Intermediate result of [`View::compute_changes`], applied separately so
/// a refill query can run in between.
pub struct DocumentChanges {
    document_set: Vec<MutableDocument>,
    change_set: BTreeMap<DocumentKey, DocumentViewChange>,
    mutated_keys: BTreeSet<DocumentKey>,
    /// A limit view lost a document and cannot know its replacement without
    /// re-running the query.
    pub needs_refill: bool,
}

/// One limbo membership transition, keyed by document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimboChange {
    pub key: DocumentKey,
    pub added: bool,
}

pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboChange>,
}

/// Materialized query results plus the bookkeeping needed to diff
/// successive versions and to track limbo documents.
pub struct View {
    query: Query,
    sync_state: SyncState,
    current: bool,
    document_set: Vec<MutableDocument>,
    mutated_keys: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    /// Keys the backend has confirmed as matching this query.
    synced_documents: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, remote_keys: BTreeSet<DocumentKey>) -> Self {
        Self {
            query,
            sync_state: SyncState::None,
            current: false,
            document_set: Vec::new(),
            mutated_keys: BTreeSet::new(),
            limbo_documents: BTreeSet::new(),
            synced_documents: remote_keys,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    fn position_of(&self, set: &[MutableDocument], key: &DocumentKey) -> Option<usize> {
        set.iter().position(|doc| doc.key() == key)
    }

    fn insert_sorted(&self, set: &mut Vec<MutableDocument>, doc: MutableDocument) {
        let index = set
            .binary_search_by(|probe| {
                self.query
                    .compare(probe, &doc)
                    .then_with(|| probe.key().cmp(doc.key()))
            })
            .unwrap_or_else(|index| index);
        set.insert(index, doc);
    }

    /// Diffs the given documents against the current result set. Callers
    /// pass every document that may have changed; unmentioned documents are
    /// assumed unchanged.
    pub fn compute_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, MutableDocument>,
    ) -> DocumentChanges {
        let mut document_set = self.document_set.clone();
        let mut change_set: BTreeMap<DocumentKey, DocumentViewChange> = BTreeMap::new();
        let mut mutated_keys = self.mutated_keys.clone();
        let mut needs_refill = false;

        let limit = self.query.limit();
        let was_full = limit.is_some_and(|limit| self.document_set.len() >= limit);

        for (key, new_doc) in doc_changes {
            let old_index = self.position_of(&document_set, key);
            let new_doc = if new_doc.is_found_document() && self.query.matches(new_doc) {
                Some(new_doc.clone())
            } else {
                None
            };

            match (old_index, new_doc) {
                (Some(index), Some(doc)) => {
                    let old_doc = &document_set[index];
                    let unchanged = old_doc.version() == doc.version()
                        && old_doc.data() == doc.data()
                        && old_doc.has_local_mutations() == doc.has_local_mutations();
                    if doc.has_local_mutations() {
                        mutated_keys.insert(key.clone());
                    } else {
                        mutated_keys.remove(key);
                    }
                    if unchanged {
                        continue;
                    }
                    document_set.remove(index);
                    self.insert_sorted(&mut document_set, doc.clone());
                    change_set.insert(
                        key.clone(),
                        DocumentViewChange {
                            change_type: DocumentChangeType::Modified,
                            document: doc,
                        },
                    );
                }
                (None, Some(doc)) => {
                    if doc.has_local_mutations() {
                        mutated_keys.insert(key.clone());
                    }
                    self.insert_sorted(&mut document_set, doc.clone());
                    change_set.insert(
                        key.clone(),
                        DocumentViewChange {
                            change_type: DocumentChangeType::Added,
                            document: doc,
                        },
                    );
                }
                (Some(index), None) => {
                    let old_doc = document_set.remove(index);
                    mutated_keys.remove(key);
                    change_set.insert(
                        key.clone(),
                        DocumentViewChange {
                            change_type: DocumentChangeType::Removed,
                            document: old_doc,
                        },
                    );
                    if was_full {
                        // The evicted slot may have a replacement we never
                        // saw; only a fresh query can tell.
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }
        }

        // A full limit view drops the overflow from the far end.
        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.pop(),
                    LimitType::Last => Some(document_set.remove(0)),
                };
                if let Some(evicted) = evicted {
                    mutated_keys.remove(evicted.key());
                    change_set.insert(
                        evicted.key().clone(),
                        DocumentViewChange {
                            change_type: DocumentChangeType::Removed,
                            document: evicted,
                        },
                    );
                }
            }
        }

        DocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Commits computed changes and folds in target metadata, producing the
    /// snapshot (if anything listener-visible happened) and limbo deltas.
    pub fn apply_changes(
        &mut self,
        changes: DocumentChanges,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        debug_assert!(!changes.needs_refill, "refill before applying changes");
        self.document_set = changes.document_set;
        self.mutated_keys = changes.mutated_keys;

        if let Some(target_change) = target_change {
            for key in &target_change.added_documents {
                self.synced_documents.insert(key.clone());
            }
            for key in &target_change.modified_documents {
                self.synced_documents.insert(key.clone());
            }
            for key in &target_change.removed_documents {
                self.synced_documents.remove(key);
            }
            if target_change.current {
                self.current = true;
            }
        }

        let limbo_changes = if self.current {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let new_sync_state = if self.current && self.limbo_documents.is_empty() {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = new_sync_state != self.sync_state;
        self.sync_state = new_sync_state;

        let mut document_changes: Vec<DocumentViewChange> =
            changes.change_set.into_values().collect();
        // Listener ordering follows the view order, removals first.
        document_changes.sort_by(|a, b| {
            change_rank(a.change_type)
                .cmp(&change_rank(b.change_type))
                .then_with(|| {
                    self.query
                        .compare(&a.document, &b.document)
                        .then_with(|| a.document.key().cmp(b.document.key()))
                })
        });

        let snapshot = if document_changes.is_empty() && !sync_state_changed {
            None
        } else {
            Some(ViewSnapshot {
                query: self.query.clone(),
                documents: self.document_set.clone(),
                document_changes,
                from_cache: new_sync_state == SyncState::Local,
                has_pending_writes: !self.mutated_keys.is_empty(),
                sync_state_changed,
            })
        };

        ViewChange {
            snapshot,
            limbo_changes,
        }
    }

    /// Connectivity loss demotes the view to cached until the target becomes
    /// current again.
    pub fn apply_offline(&mut self) -> ViewChange {
        self.current = false;
        let changes = self.compute_changes(&BTreeMap::new());
        self.apply_changes(changes, None)
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboChange> {
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        for doc in &self.document_set {
            if doc.has_local_mutations() {
                continue;
            }
            if self.synced_documents.contains(doc.key()) {
                continue;
            }
            self.limbo_documents.insert(doc.key().clone());
        }

        let mut changes = Vec::new();
        for key in &old_limbo {
            if !self.limbo_documents.contains(key) {
                changes.push(LimboChange {
                    key: key.clone(),
                    added: false,
                });
            }
        }
        for key in &self.limbo_documents {
            if !old_limbo.contains(key) {
                changes.push(LimboChange {
                    key: key.clone(),
                    added: true,
                });
            }
        }
        changes
    }
}

fn change_rank(change_type: DocumentChangeType) -> u8 {
    match change_type {
        DocumentChangeType::Removed => 0,
        DocumentChangeType::Added => 1,
        DocumentChangeType::Modified => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectValue, ResourcePath, SnapshotVersion, Timestamp, Value};
    use crate::query::{Direction, FieldFilter, FilterOperator, OrderBy, Query};
    use crate::model::FieldPath;

    fn doc(path: &str, seconds: i64, rank: i64) -> MutableDocument {
        let key = DocumentKey::from_string(path).unwrap();
        let mut data = ObjectValue::empty();
        data.set(
            &FieldPath::from_dot_separated("rank").unwrap(),
            Value::Integer(rank),
        );
        MutableDocument::found_document(
            key,
            SnapshotVersion::new(Timestamp::new(seconds, 0)),
            data,
        )
    }

    fn rooms_query() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    #[test]
    fn add_and_modify_produce_snapshots() {
        let mut view = View::new(rooms_query(), BTreeSet::new());

        let d1 = doc("rooms/a", 1, 1);
        let mut changes = BTreeMap::new();
        changes.insert(d1.key().clone(), d1.clone());
        let computed = view.compute_changes(&changes);
        assert!(!computed.needs_refill);
        let result = view.apply_changes(computed, None);
        let snapshot = result.snapshot.expect("snapshot");
        assert_eq!(snapshot.documents.len(), 1);
        assert_eq!(
            snapshot.document_changes[0].change_type,
            DocumentChangeType::Added
        );
        assert!(snapshot.from_cache);

        let d1b = doc("rooms/a", 2, 5);
        let mut changes = BTreeMap::new();
        changes.insert(d1b.key().clone(), d1b);
        let computed = view.compute_changes(&changes);
        let result = view.apply_changes(computed, None);
        let snapshot = result.snapshot.expect("snapshot");
        assert_eq!(
            snapshot.document_changes[0].change_type,
            DocumentChangeType::Modified
        );
    }

    #[test]
    fn unchanged_document_produces_no_snapshot() {
        let mut view = View::new(rooms_query(), BTreeSet::new());
        let d1 = doc("rooms/a", 1, 1);
        let mut changes = BTreeMap::new();
        changes.insert(d1.key().clone(), d1.clone());
        let computed = view.compute_changes(&changes);
        view.apply_changes(computed, None);

        let computed = view.compute_changes(&changes);
        let result = view.apply_changes(computed, None);
        assert!(result.snapshot.is_none());
    }

    #[test]
    fn limit_view_evicts_overflow_and_flags_refill() {
        let query = rooms_query()
            .with_order_by(OrderBy::new(
                FieldPath::from_dot_separated("rank").unwrap(),
                Direction::Ascending,
            ))
            .with_limit_to_first(2);
        let mut view = View::new(query, BTreeSet::new());

        let mut changes = BTreeMap::new();
        for (path, rank) in [("rooms/a", 1), ("rooms/b", 2), ("rooms/c", 3)] {
            let d = doc(path, 1, rank);
            changes.insert(d.key().clone(), d);
        }
        let computed = view.compute_changes(&changes);
        let result = view.apply_changes(computed, None);
        let snapshot = result.snapshot.expect("snapshot");
        assert_eq!(snapshot.documents.len(), 2);
        assert_eq!(snapshot.documents[0].key().path().canonical_string(), "rooms/a");

        // Dropping a member of a full limit view requires a requery.
        let gone = MutableDocument::no_document(
            DocumentKey::from_string("rooms/a").unwrap(),
            SnapshotVersion::new(Timestamp::new(2, 0)),
        );
        let mut changes = BTreeMap::new();
        changes.insert(gone.key().clone(), gone);
        let computed = view.compute_changes(&changes);
        assert!(computed.needs_refill);
    }

    #[test]
    fn limit_to_last_keeps_largest_in_ascending_order() {
        let query = rooms_query()
            .with_order_by(OrderBy::new(
                FieldPath::from_dot_separated("rank").unwrap(),
                Direction::Ascending,
            ))
            .with_limit_to_last(2);
        let mut view = View::new(query, BTreeSet::new());

        let mut changes = BTreeMap::new();
        for (path, rank) in [("rooms/a", 1), ("rooms/b", 2), ("rooms/c", 3)] {
            let d = doc(path, 1, rank);
            changes.insert(d.key().clone(), d);
        }
        let computed = view.compute_changes(&changes);
        let result = view.apply_changes(computed, None);
        let snapshot = result.snapshot.expect("snapshot");
        let paths: Vec<String> = snapshot
            .documents
            .iter()
            .map(|d| d.key().path().canonical_string())
            .collect();
        assert_eq!(paths, vec!["rooms/b", "rooms/c"]);
    }

    #[test]
    fn current_target_moves_view_out_of_cache() {
        let mut view = View::new(rooms_query(), BTreeSet::new());
        let d1 = doc("rooms/a", 1, 1);
        let mut changes = BTreeMap::new();
        changes.insert(d1.key().clone(), d1.clone());
        let computed = view.compute_changes(&changes);

        let mut target_change = TargetChange::default();
        target_change.current = true;
        target_change.added_documents.insert(d1.key().clone());
        let result = view.apply_changes(computed, Some(&target_change));
        let snapshot = result.snapshot.expect("snapshot");
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(result.limbo_changes.is_empty());
    }

    #[test]
    fn unsynced_document_in_current_view_enters_limbo() {
        let mut view = View::new(rooms_query(), BTreeSet::new());
        let d1 = doc("rooms/a", 1, 1);
        let mut changes = BTreeMap::new();
        changes.insert(d1.key().clone(), d1.clone());
        let computed = view.compute_changes(&changes);

        let mut target_change = TargetChange::default();
        target_change.current = true;
        let result = view.apply_changes(computed, Some(&target_change));
        assert_eq!(
            result.limbo_changes,
            vec![LimboChange {
                key: d1.key().clone(),
                added: true
            }]
        );
        // Unresolved limbo keeps the snapshot cached.
        assert!(result.snapshot.expect("snapshot").from_cache);
    }

    #[test]
    fn locally_mutated_document_never_enters_limbo() {
        let mut view = View::new(rooms_query(), BTreeSet::new());
        let mut d1 = doc("rooms/a", 1, 1);
        d1.set_has_local_mutations();
        let mut changes = BTreeMap::new();
        changes.insert(d1.key().clone(), d1);
        let computed = view.compute_changes(&changes);

        let mut target_change = TargetChange::default();
        target_change.current = true;
        let result = view.apply_changes(computed, Some(&target_change));
        assert!(result.limbo_changes.is_empty());
        let snapshot = result.snapshot.expect("snapshot");
        assert!(snapshot.has_pending_writes);
    }

    #[test]
    fn offline_demotes_to_cache() {
        let mut view = View::new(rooms_query(), BTreeSet::new());
        let d1 = doc("rooms/a", 1, 1);
        let mut changes = BTreeMap::new();
        changes.insert(d1.key().clone(), d1);
        let computed = view.compute_changes(&changes);
        let mut target_change = TargetChange::default();
        target_change.current = true;
        target_change.added_documents.insert(
            DocumentKey::from_string("rooms/a").unwrap(),
        );
        view.apply_changes(computed, Some(&target_change));

        let result = view.apply_offline();
        let snapshot = result.snapshot.expect("snapshot");
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn filtered_document_is_removed_from_view() {
        let query = rooms_query().with_filter(FieldFilter::new(
            FieldPath::from_dot_separated("rank").unwrap(),
            FilterOperator::GreaterThan,
            Value::Integer(0),
        ));
        let mut view = View::new(query, BTreeSet::new());
        let d1 = doc("rooms/a", 1, 5);
        let mut changes = BTreeMap::new();
        changes.insert(d1.key().clone(), d1.clone());
        let computed = view.compute_changes(&changes);
        view.apply_changes(computed, None);

        let d1b = doc("rooms/a", 2, -1);
        let mut changes = BTreeMap::new();
        changes.insert(d1b.key().clone(), d1b);
        let computed = view.compute_changes(&changes);
        let result = view.apply_changes(computed, None);
        let snapshot = result.snapshot.expect("snapshot");
        assert_eq!(
            snapshot.document_changes[0].change_type,
            DocumentChangeType::Removed
        );
        assert!(snapshot.documents.is_empty());
    }
}
