use std::collections::BTreeSet;

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, ResourcePath, Timestamp,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::util::{SortedMap, SortedSet};

/// The queue of batches one user wrote that the backend has not yet
/// acknowledged.
///
/// Batches are kept in a persistent map by id, so copies made by a
/// transaction share structure with the committed queue. A secondary
/// `(key, batch id)` index answers which batches touch a document.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    uid: String,
    batches: SortedMap<BatchId, MutationBatch>,
    batches_by_key: SortedSet<(DocumentKey, BatchId)>,
    next_batch_id: BatchId,
    last_acknowledged_batch_id: BatchId,
    last_stream_token: Vec<u8>,
    pub(crate) dirty_batches: BTreeSet<BatchId>,
    pub(crate) metadata_dirty: bool,
}

impl MutationQueue {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            batches: SortedMap::new(),
            batches_by_key: SortedSet::new(),
            next_batch_id: 1,
            last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            last_stream_token: Vec::new(),
            dirty_batches: BTreeSet::new(),
            metadata_dirty: false,
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) {
        self.last_stream_token = token;
        self.metadata_dirty = true;
    }

    pub fn last_acknowledged_batch_id(&self) -> BatchId {
        self.last_acknowledged_batch_id
    }

    /// Records that the backend accepted `batch_id`. The batch stays queued
    /// until [`MutationQueue::remove_mutation_batch`].
    pub fn acknowledge_batch(
        &mut self,
        batch_id: BatchId,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let (_, head) = self
            .batches
            .first()
            .ok_or_else(|| internal_error("Cannot acknowledge a batch on an empty queue"))?;
        if head.batch_id != batch_id {
            return Err(internal_error(format!(
                "Can only acknowledge the first batch in the queue (expected {}, got {batch_id})",
                head.batch_id
            )));
        }
        self.last_acknowledged_batch_id = batch_id;
        self.set_last_stream_token(stream_token);
        Ok(())
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
        self.insert_batch(batch.clone());
        self.dirty_batches.insert(batch_id);
        batch
    }

    fn insert_batch(&mut self, batch: MutationBatch) {
        for mutation in &batch.mutations {
            self.batches_by_key = self
                .batches_by_key
                .insert((mutation.key().clone(), batch.batch_id));
        }
        self.batches = self.batches.insert(batch.batch_id, batch);
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// First batch with an id greater than `batch_id`.
    pub fn next_mutation_batch_after(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches
            .iter_from(&batch_id.saturating_add(1))
            .next()
            .map(|(_, batch)| batch)
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches.last_key().copied().unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn all_mutation_batches(&self) -> impl Iterator<Item = &MutationBatch> {
        self.batches.values()
    }

    pub fn all_mutation_batches_affecting_document_key(
        &self,
        key: &DocumentKey,
    ) -> Vec<&MutationBatch> {
        self.batches_by_key
            .iter_from(&(key.clone(), BatchId::MIN))
            .take_while(|(indexed, _)| indexed == key)
            .filter_map(|(_, batch_id)| self.lookup_mutation_batch(*batch_id))
            .collect()
    }

    pub fn all_mutation_batches_affecting_document_keys(
        &self,
        keys: &DocumentKeySet,
    ) -> Vec<&MutationBatch> {
        let ids: BTreeSet<BatchId> = keys
            .iter()
            .flat_map(|key| {
                self.batches_by_key
                    .iter_from(&(key.clone(), BatchId::MIN))
                    .take_while(move |(indexed, _)| indexed == key)
                    .map(|(_, batch_id)| *batch_id)
            })
            .collect();
        ids.into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id))
            .collect()
    }

    /// Batches touching any document the query could match, in batch order.
    pub fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<&MutationBatch> {
        let prefix = query.path();
        let matches_path = |path: &ResourcePath| -> bool {
            if let Some(group) = query.collection_group_id() {
                prefix.is_prefix_of(path)
                    && path.len() >= 2
                    && path.segment(path.len() - 2) == Some(group)
            } else {
                prefix.is_immediate_parent_of(path)
            }
        };

        let start = DocumentKey::first_under(prefix);
        let ids: BTreeSet<BatchId> = self
            .batches_by_key
            .iter_from(&(start, BatchId::MIN))
            .take_while(|(key, _)| prefix.is_prefix_of(key.path()))
            .filter(|(key, _)| matches_path(key.path()))
            .map(|(_, batch_id)| *batch_id)
            .collect();
        ids.into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(batch_id))
            .collect()
    }

    /// Removes `batch`, which must be the head of the queue.
    pub fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()> {
        let head_id = self.batches.first_key().copied();
        if head_id != Some(batch.batch_id) {
            return Err(internal_error(format!(
                "Can only remove the first batch in the queue (head {head_id:?}, got {})",
                batch.batch_id
            )));
        }
        self.batches = self.batches.remove(&batch.batch_id);
        for mutation in &batch.mutations {
            self.batches_by_key = self
                .batches_by_key
                .remove(&(mutation.key().clone(), batch.batch_id));
        }
        self.dirty_batches.insert(batch.batch_id);
        Ok(())
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batches_by_key
            .iter_from(&(key.clone(), BatchId::MIN))
            .next()
            .is_some_and(|(indexed, _)| indexed == key)
    }

    pub(crate) fn restore(
        &mut self,
        batches: Vec<MutationBatch>,
        last_acknowledged_batch_id: BatchId,
        last_stream_token: Vec<u8>,
    ) {
        let mut batches = batches;
        batches.sort_by_key(|batch| batch.batch_id);
        for batch in batches {
            self.next_batch_id = self.next_batch_id.max(batch.batch_id + 1);
            self.insert_batch(batch);
        }
        self.next_batch_id = self.next_batch_id.max(last_acknowledged_batch_id + 1);
        self.last_acknowledged_batch_id = last_acknowledged_batch_id;
        self.last_stream_token = last_stream_token;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty_batches.clear();
        self.metadata_dirty = false;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.metadata_dirty || !self.dirty_batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn add(queue: &mut MutationQueue, paths: &[&str]) -> MutationBatch {
        let mutations = paths
            .iter()
            .map(|path| Mutation::set(key(path), MapValue::empty()))
            .collect();
        queue.add_mutation_batch(Timestamp::new(1, 0), Vec::new(), mutations)
    }

    #[test]
    fn batch_ids_are_dense_and_increasing() {
        let mut queue = MutationQueue::new("");
        let first = add(&mut queue, &["rooms/1"]);
        let second = add(&mut queue, &["rooms/2"]);
        assert_eq!((first.batch_id, second.batch_id), (1, 2));
        assert_eq!(queue.lookup_mutation_batch(2), Some(&second));
        assert_eq!(queue.next_mutation_batch_after(BATCH_ID_UNKNOWN), Some(&first));
        assert_eq!(queue.next_mutation_batch_after(1), Some(&second));
        assert!(queue.next_mutation_batch_after(2).is_none());
        assert_eq!(queue.highest_unacknowledged_batch_id(), 2);
    }

    #[test]
    fn finds_batches_by_document_and_by_query() {
        let mut queue = MutationQueue::new("");
        add(&mut queue, &["rooms/1", "users/a"]);
        add(&mut queue, &["rooms/2"]);
        add(&mut queue, &["rooms/1/messages/m"]);

        let by_key = queue.all_mutation_batches_affecting_document_key(&key("rooms/1"));
        assert_eq!(by_key.len(), 1);

        let keys = DocumentKeySet::new().insert(key("rooms/1")).insert(key("rooms/2"));
        let ids: Vec<BatchId> = queue
            .all_mutation_batches_affecting_document_keys(&keys)
            .iter()
            .map(|batch| batch.batch_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        let rooms = Query::at_path("rooms").unwrap();
        let ids: Vec<BatchId> = queue
            .all_mutation_batches_affecting_query(&rooms)
            .iter()
            .map(|batch| batch.batch_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);

        let messages = Query::collection_group("messages");
        let ids: Vec<BatchId> = queue
            .all_mutation_batches_affecting_query(&messages)
            .iter()
            .map(|batch| batch.batch_id)
            .collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn only_the_head_can_be_removed() {
        let mut queue = MutationQueue::new("");
        let first = add(&mut queue, &["rooms/1"]);
        let second = add(&mut queue, &["rooms/1"]);
        assert!(queue.remove_mutation_batch(&second).is_err());
        assert!(queue.acknowledge_batch(2, Vec::new()).is_err());

        queue.acknowledge_batch(1, b"token".to_vec()).unwrap();
        queue.remove_mutation_batch(&first).unwrap();
        assert_eq!(queue.last_stream_token(), b"token");
        assert_eq!(queue.last_acknowledged_batch_id(), 1);
        assert_eq!(queue.lookup_mutation_batch(2), Some(&second));
        assert!(queue.lookup_mutation_batch(1).is_none());
        assert!(queue.contains_key(&key("rooms/1")));
    }

    #[test]
    fn working_copies_leave_the_original_queue_alone() {
        let mut committed = MutationQueue::new("");
        let first = add(&mut committed, &["rooms/1"]);

        let mut working = committed.clone();
        let second = add(&mut working, &["rooms/2"]);
        working.acknowledge_batch(1, Vec::new()).unwrap();
        working.remove_mutation_batch(&first).unwrap();
        assert_eq!(working.next_mutation_batch_after(BATCH_ID_UNKNOWN), Some(&second));

        assert_eq!(committed.len(), 1);
        assert_eq!(committed.lookup_mutation_batch(1), Some(&first));
        assert!(committed.lookup_mutation_batch(2).is_none());
        assert_eq!(committed.highest_unacknowledged_batch_id(), 1);
    }

    #[test]
    fn restored_queues_continue_numbering() {
        let mut original = MutationQueue::new("alice");
        let batch = add(&mut original, &["rooms/1"]);

        let mut restored = MutationQueue::new("alice");
        restored.restore(vec![batch], BATCH_ID_UNKNOWN, vec![1]);
        let next = add(&mut restored, &["rooms/2"]);
        assert_eq!(next.batch_id, 2);
        assert_eq!(restored.lookup_mutation_batch(2), Some(&next));
        assert_eq!(restored.len(), 2);
        assert!(!restored.dirty_batches.contains(&1));
    }
}
