use std::collections::BTreeSet;

use crate::error::{failed_precondition, SyncResult};
use crate::model::mutation_batch::{BatchId, MutationBatch};
use crate::model::{DocumentKey, Mutation, Timestamp};

/// Ordered queue of pending write batches for one user.
///
/// Batch ids are assigned from a monotonic counter starting at 1 and are
/// never reused, so ascending id order is chronological write order.
#[derive(Debug, Default)]
pub struct MutationQueue {
    next_batch_id: BatchId,
    batches: Vec<MutationBatch>,
    last_stream_token: Vec<u8>,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self {
            next_batch_id: 1,
            batches: Vec::new(),
            last_stream_token: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        self.batches.push(batch.clone());
        batch
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches
            .iter()
            .find(|batch| batch.batch_id() == batch_id)
    }

    /// The next batch to send after `batch_id`, used to walk the queue when
    /// filling the write pipeline.
    pub fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches
            .iter()
            .find(|batch| batch.batch_id() > batch_id)
    }

    /// Largest id ever assigned, regardless of acknowledgement. Returns 0
    /// when no batch was ever written.
    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.next_batch_id - 1
    }

    /// All queued batches touching any of `keys`, ascending by batch id.
    /// Callers replay these in order, so the sort is part of the contract.
    pub fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<&MutationBatch> {
        self.batches
            .iter()
            .filter(|batch| {
                batch
                    .mutations()
                    .iter()
                    .any(|mutation| keys.contains(mutation.key()))
            })
            .collect()
    }

    pub fn all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<&MutationBatch> {
        self.batches
            .iter()
            .filter(|batch| batch.mutations().iter().any(|mutation| mutation.key() == key))
            .collect()
    }

    /// Removes an acknowledged or rejected batch. Batches resolve in queue
    /// order, so only the oldest batch can be removed.
    pub fn remove_mutation_batch(&mut self, batch_id: BatchId) -> SyncResult<MutationBatch> {
        match self.batches.first() {
            Some(first) if first.batch_id() == batch_id => Ok(self.batches.remove(0)),
            Some(first) => Err(failed_precondition(format!(
                "can only remove the oldest mutation batch (oldest {}, got {})",
                first.batch_id(),
                batch_id
            ))),
            None => Err(failed_precondition("mutation queue is empty")),
        }
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
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
    fn batch_ids_start_at_one_and_increase() {
        let mut queue = MutationQueue::new();
        let a = queue.add_mutation_batch(Timestamp::new(1, 0), Vec::new(), vec![set("rooms/a")]);
        let b = queue.add_mutation_batch(Timestamp::new(2, 0), Vec::new(), vec![set("rooms/b")]);
        assert_eq!(a.batch_id(), 1);
        assert_eq!(b.batch_id(), 2);
        assert_eq!(queue.highest_unacknowledged_batch_id(), 2);
    }

    #[test]
    fn affecting_batches_are_ascending_by_id() {
        let mut queue = MutationQueue::new();
        queue.add_mutation_batch(Timestamp::new(1, 0), Vec::new(), vec![set("rooms/a")]);
        queue.add_mutation_batch(Timestamp::new(2, 0), Vec::new(), vec![set("rooms/b")]);
        queue.add_mutation_batch(Timestamp::new(3, 0), Vec::new(), vec![set("rooms/a")]);
        let keys = BTreeSet::from([key("rooms/a")]);
        let affecting = queue.all_mutation_batches_affecting_document_keys(&keys);
        let ids: Vec<_> = affecting.iter().map(|batch| batch.batch_id()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn only_oldest_batch_can_be_removed() {
        let mut queue = MutationQueue::new();
        queue.add_mutation_batch(Timestamp::new(1, 0), Vec::new(), vec![set("rooms/a")]);
        queue.add_mutation_batch(Timestamp::new(2, 0), Vec::new(), vec![set("rooms/b")]);
        assert!(queue.remove_mutation_batch(2).is_err());
        assert!(queue.remove_mutation_batch(1).is_ok());
        assert!(queue.remove_mutation_batch(2).is_ok());
        assert!(queue.is_empty());
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let mut queue = MutationQueue::new();
        queue.add_mutation_batch(Timestamp::new(1, 0), Vec::new(), vec![set("rooms/a")]);
        queue.remove_mutation_batch(1).unwrap();
        let next = queue.add_mutation_batch(Timestamp::new(2, 0), Vec::new(), vec![set("rooms/a")]);
        assert_eq!(next.batch_id(), 2);
    }
}
