use std::collections::{BTreeMap, BTreeSet};

use crate::model::mutation_batch::BatchId;
use crate::model::{DocumentKey, Mutation, ResourcePath};

/// A memoized merge of every pending mutation for one key.
///
/// `largest_batch_id` is the newest batch contributing to the overlay; it
/// tells readers which writes are already reflected.
#[derive(Clone, Debug)]
pub struct Overlay {
    largest_batch_id: BatchId,
    mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn largest_batch_id(&self) -> BatchId {
        self.largest_batch_id
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// Per-key overlay storage with a reverse index by batch id.
#[derive(Debug, Default)]
pub struct DocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl DocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    /// Replaces the overlays for the given keys. A `None` mutation means the
    /// key no longer has any net local change and its overlay is dropped.
    pub fn save_overlays(
        &mut self,
        largest_batch_id: BatchId,
        overlays: BTreeMap<DocumentKey, Option<Mutation>>,
    ) {
        for (key, mutation) in overlays {
            self.remove_overlay(&key);
            if let Some(mutation) = mutation {
                self.keys_by_batch
                    .entry(largest_batch_id)
                    .or_default()
                    .insert(key.clone());
                self.overlays
                    .insert(key, Overlay::new(largest_batch_id, mutation));
            }
        }
    }

    pub fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) -> BTreeSet<DocumentKey> {
        let keys = self.keys_by_batch.remove(&batch_id).unwrap_or_default();
        for key in &keys {
            self.overlays.remove(key);
        }
        keys
    }

    /// Overlays for immediate children of `collection` whose largest batch id
    /// exceeds `since_batch_id`, used by the query engine to find documents
    /// with newer local edits.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                overlay.largest_batch_id() > since_batch_id
                    && collection.is_immediate_parent_of(key.path())
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    fn remove_overlay(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.overlays.remove(key) {
            if let Some(keys) = self.keys_by_batch.get_mut(&existing.largest_batch_id()) {
                keys.remove(key);
                if keys.is_empty() {
                    self.keys_by_batch.remove(&existing.largest_batch_id());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn set(path: &str) -> Mutation {
        Mutation::set(key(path), ObjectValue::empty())
    }

    #[test]
    fn save_and_get_overlay() {
        let mut cache = DocumentOverlayCache::new();
        cache.save_overlays(
            3,
            BTreeMap::from([(key("rooms/a"), Some(set("rooms/a")))]),
        );
        let overlay = cache.get_overlay(&key("rooms/a")).unwrap();
        assert_eq!(overlay.largest_batch_id(), 3);
    }

    #[test]
    fn none_mutation_clears_overlay() {
        let mut cache = DocumentOverlayCache::new();
        cache.save_overlays(
            3,
            BTreeMap::from([(key("rooms/a"), Some(set("rooms/a")))]),
        );
        cache.save_overlays(4, BTreeMap::from([(key("rooms/a"), None)]));
        assert!(cache.get_overlay(&key("rooms/a")).is_none());
        assert!(cache.remove_overlays_for_batch_id(3).is_empty());
    }

    #[test]
    fn resave_moves_key_between_batches() {
        let mut cache = DocumentOverlayCache::new();
        cache.save_overlays(
            1,
            BTreeMap::from([(key("rooms/a"), Some(set("rooms/a")))]),
        );
        cache.save_overlays(
            2,
            BTreeMap::from([(key("rooms/a"), Some(set("rooms/a")))]),
        );
        assert!(cache.remove_overlays_for_batch_id(1).is_empty());
        let removed = cache.remove_overlays_for_batch_id(2);
        assert!(removed.contains(&key("rooms/a")));
        assert!(cache.get_overlay(&key("rooms/a")).is_none());
    }

    #[test]
    fn collection_lookup_respects_batch_floor() {
        let mut cache = DocumentOverlayCache::new();
        cache.save_overlays(
            1,
            BTreeMap::from([(key("rooms/a"), Some(set("rooms/a")))]),
        );
        cache.save_overlays(
            5,
            BTreeMap::from([
                (key("rooms/b"), Some(set("rooms/b"))),
                (key("halls/c"), Some(set("halls/c"))),
            ]),
        );
        let rooms = ResourcePath::from_string("rooms").unwrap();
        let found = cache.get_overlays_for_collection(&rooms, 1);
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&key("rooms/b")));
    }
}
