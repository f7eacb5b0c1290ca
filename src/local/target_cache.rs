use std::collections::{BTreeMap, BTreeSet};

use crate::model::target::{Target, TargetData, TargetId};
use crate::model::{DocumentKey, SnapshotVersion};

/// Cache of active listen targets and the keys the backend reports for them.
#[derive(Debug)]
pub struct TargetCache {
    targets: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, TargetId>,
    matching_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    highest_target_id: TargetId,
    highest_sequence_number: i64,
    last_remote_snapshot_version: SnapshotVersion,
}

impl Default for TargetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetCache {
    pub fn new() -> Self {
        Self {
            targets: BTreeMap::new(),
            target_ids_by_canonical_id: BTreeMap::new(),
            matching_keys: BTreeMap::new(),
            highest_target_id: 0,
            highest_sequence_number: 0,
            last_remote_snapshot_version: SnapshotVersion::min(),
        }
    }

    pub fn add_target_data(&mut self, data: TargetData) {
        self.highest_target_id = self.highest_target_id.max(data.target_id());
        self.highest_sequence_number = self.highest_sequence_number.max(data.sequence_number());
        self.target_ids_by_canonical_id
            .insert(data.target().canonical_id(), data.target_id());
        self.targets.insert(data.target_id(), data);
    }

    pub fn update_target_data(&mut self, data: TargetData) {
        self.targets.insert(data.target_id(), data);
    }

    pub fn remove_target_data(&mut self, target_id: TargetId) {
        if let Some(data) = self.targets.remove(&target_id) {
            self.target_ids_by_canonical_id
                .remove(&data.target().canonical_id());
        }
        self.matching_keys.remove(&target_id);
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        self.target_ids_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.targets.get(target_id))
    }

    pub fn get_target_data_by_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn add_matching_keys(&mut self, target_id: TargetId, keys: &BTreeSet<DocumentKey>) {
        self.matching_keys
            .entry(target_id)
            .or_default()
            .extend(keys.iter().cloned());
    }

    pub fn remove_matching_keys(&mut self, target_id: TargetId, keys: &BTreeSet<DocumentKey>) {
        if let Some(tracked) = self.matching_keys.get_mut(&target_id) {
            for key in keys {
                tracked.remove(key);
            }
        }
    }

    pub fn remove_all_matching_keys(&mut self, target_id: TargetId) {
        self.matching_keys.remove(&target_id);
    }

    pub fn get_matching_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.matching_keys
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.matching_keys.values().any(|keys| keys.contains(key))
    }

    pub fn next_sequence_number(&mut self) -> i64 {
        self.highest_sequence_number += 1;
        self.highest_sequence_number
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
    }
}
