use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::{BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};

/// Ordered queue of locally written batches awaiting acknowledgement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutationQueue {
    batches: BTreeMap<BatchId, MutationBatch>,
    batches_by_key: BTreeSet<(DocumentKey, BatchId)>,
    next_batch_id: BatchId,
    last_stream_token: Vec<u8>,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self {
            batches: BTreeMap::new(),
            batches_by_key: BTreeSet::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
        }
    }
}

impl MutationQueue {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Appends a batch. Ids only ever grow, even across removals.
    pub(crate) fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for key in batch.keys() {
            self.batches_by_key.insert((key, batch_id));
        }
        self.batches.insert(batch_id, batch.clone());
        batch
    }

    pub fn lookup(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// First batch with an id strictly greater than `batch_id`.
    pub fn next_batch_after(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches
            .range(batch_id.saturating_add(1)..)
            .next()
            .map(|(_, batch)| batch)
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches
            .keys()
            .next_back()
            .copied()
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_batches(&self) -> Vec<MutationBatch> {
        self.batches.values().cloned().collect()
    }

    /// Batches touching any of `keys`, in batch order.
    pub fn all_batches_affecting_keys<'a, I>(&self, keys: I) -> Vec<MutationBatch>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let mut ids = BTreeSet::new();
        for key in keys {
            let start = (key.clone(), BatchId::MIN);
            for (entry_key, batch_id) in self.batches_by_key.range(start..) {
                if entry_key != key {
                    break;
                }
                ids.insert(*batch_id);
            }
        }
        ids.into_iter()
            .filter_map(|id| self.batches.get(&id).cloned())
            .collect()
    }

    pub(crate) fn remove_mutation_batch(&mut self, batch: &MutationBatch) {
        for key in batch.keys() {
            self.batches_by_key.remove(&(key, batch.batch_id()));
        }
        self.batches.remove(&batch.batch_id());
    }

    /// True while any pending batch references `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_key
            .range((key.clone(), BatchId::MIN)..)
            .next()
            .map(|(entry_key, _)| entry_key == key)
            .unwrap_or(false)
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub(crate) fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn batch_ids_are_never_reused() {
        let mut queue = MutationQueue::default();
        let first = queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![Mutation::delete(key("c/a"))]);
        assert_eq!(first.batch_id(), 1);
        queue.remove_mutation_batch(&first);
        let second = queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![Mutation::delete(key("c/a"))]);
        assert_eq!(second.batch_id(), 2);
        assert_eq!(queue.highest_unacknowledged_batch_id(), 2);
    }

    #[test]
    fn finds_batches_by_key_and_successor() {
        let mut queue = MutationQueue::default();
        queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![Mutation::delete(key("c/a"))]);
        queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![Mutation::delete(key("c/b"))]);
        queue.add_mutation_batch(Timestamp::now(), Vec::new(), vec![Mutation::delete(key("c/a"))]);

        let affecting: Vec<_> = queue
            .all_batches_affecting_keys([&key("c/a")])
            .iter()
            .map(|b| b.batch_id())
            .collect();
        assert_eq!(affecting, vec![1, 3]);
        assert_eq!(queue.next_batch_after(1).map(|b| b.batch_id()), Some(2));
        assert_eq!(queue.next_batch_after(BATCH_ID_UNKNOWN).map(|b| b.batch_id()), Some(1));
        assert!(queue.next_batch_after(3).is_none());
        assert!(queue.contains_key(&key("c/b")));
        assert!(!queue.contains_key(&key("c/z")));
    }

    #[test]
    fn empty_queue_reports_unknown_batch() {
        let queue = MutationQueue::default();
        assert_eq!(queue.highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);
        assert!(queue.is_empty());
    }
}
