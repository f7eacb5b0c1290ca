use std::collections::{BTreeMap, BTreeSet};

use crate::model::{DocumentKey, MutableDocument, ResourcePath, SnapshotVersion};

/// Cache of documents as last reported by the backend.
///
/// Entries are stored without local mutations applied; the local view is
/// always derived by layering overlays on top of these entries.
#[derive(Debug, Default)]
pub struct RemoteDocumentCache {
    docs: BTreeMap<DocumentKey, MutableDocument>,
}

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, mut doc: MutableDocument, read_time: SnapshotVersion) {
        doc.set_read_time(read_time);
        self.docs.insert(doc.key().clone(), doc);
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) {
        self.docs.remove(key);
    }

    /// Returns the cached entry, or an invalid placeholder when the cache
    /// knows nothing about the key.
    pub fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        self.docs
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::invalid(key.clone()))
    }

    pub fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, MutableDocument> {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    /// All found documents that are immediate children of `collection` with
    /// read time greater than `since_read_time`.
    pub fn get_all_from_collection(
        &self,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        self.docs
            .iter()
            .filter(|(key, doc)| {
                collection.is_immediate_parent_of(key.path())
                    && doc.is_found_document()
                    && doc.read_time() > since_read_time
            })
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectValue, Timestamp};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn missing_entry_is_invalid() {
        let cache = RemoteDocumentCache::new();
        assert!(!cache.get_entry(&key("rooms/a")).is_valid_document());
    }

    #[test]
    fn add_entry_stamps_read_time() {
        let mut cache = RemoteDocumentCache::new();
        let doc = MutableDocument::found_document(key("rooms/a"), version(1), ObjectValue::empty());
        cache.add_entry(doc, version(5));
        assert_eq!(cache.get_entry(&key("rooms/a")).read_time(), version(5));
    }

    #[test]
    fn collection_scan_skips_deletes_and_old_read_times() {
        let mut cache = RemoteDocumentCache::new();
        cache.add_entry(
            MutableDocument::found_document(key("rooms/a"), version(1), ObjectValue::empty()),
            version(1),
        );
        cache.add_entry(
            MutableDocument::found_document(key("rooms/b"), version(4), ObjectValue::empty()),
            version(4),
        );
        cache.add_entry(MutableDocument::no_document(key("rooms/c"), version(6)), version(6));
        let rooms = ResourcePath::from_string("rooms").unwrap();
        let found = cache.get_all_from_collection(&rooms, version(2));
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&key("rooms/b")));
    }
}
