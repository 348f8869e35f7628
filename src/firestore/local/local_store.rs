use std::collections::BTreeMap;

use crate::firestore::core::{Query, Target, TargetId};
use crate::firestore::error::{internal_error, not_found, FirestoreResult};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::remote_document_cache::RemoteDocumentChangeBuffer;
use crate::firestore::local::target_cache::{QueryPurpose, TargetData};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, MaybeDocument,
    MaybeDocumentMap, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};

/// Resume tokens older than this are persisted even when nothing changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

const LOG_TARGET: &str = "firestore::local_store";

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: MaybeDocumentMap,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: DocumentKeySet,
}

/// What changed when the active user switched.
#[derive(Clone, Debug)]
pub struct UserChangeResult {
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
    pub affected_documents: MaybeDocumentMap,
}

/// A view raised a snapshot for `target_id`. Only snapshots that are not
/// from cache move the target's limbo-free version forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
}

/// The local half of the client: owns persistence and turns writes, watch
/// events and acknowledgements into transactions against it.
pub struct LocalStore {
    persistence: Persistence,
    query_engine: QueryEngine,
    /// Targets with an active listener, by id.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
}

impl LocalStore {
    pub fn new(persistence: Persistence) -> Self {
        Self {
            persistence,
            query_engine: QueryEngine::new(),
            target_data_by_target: BTreeMap::new(),
        }
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn current_uid(&self) -> &str {
        self.persistence.current_uid()
    }

    /// Switches to `uid`'s mutation queue and reports the documents whose
    /// local view may differ as a result.
    pub fn handle_user_change(&mut self, uid: &str) -> FirestoreResult<UserChangeResult> {
        let old_batches: Vec<MutationBatch> = self
            .persistence
            .mutation_queue()
            .all_mutation_batches()
            .cloned()
            .collect();
        self.persistence.set_user(uid);

        self.persistence
            .run_transaction("Handle user change", TransactionMode::ReadOnly, |txn| {
                let new_batches: Vec<&MutationBatch> =
                    txn.mutation_queue().all_mutation_batches().collect();
                let changed_keys = old_batches
                    .iter()
                    .chain(new_batches.iter().copied())
                    .fold(DocumentKeySet::new(), |keys, batch| keys.union(&batch.keys()));
                let view = local_view(txn);
                Ok(UserChangeResult {
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                    affected_documents: view.get_documents(&changed_keys),
                })
            })
    }

    /// Queues `mutations` as one batch and returns the new local view of the
    /// documents it touches.
    pub fn local_write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations.iter().map(|m| m.key().clone()).collect();

        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let existing_docs = local_view(txn).get_documents(&keys);

                // Transforms that are not idempotent need the value they
                // started from, so later recomputation gives the same result.
                let base_mutations: Vec<Mutation> = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let base_value =
                            mutation.extract_base_value(existing_docs.get(mutation.key()))?;
                        let mask = FieldMask::new(base_value.field_mask());
                        Some(Mutation::patch(mutation.key().clone(), base_value, mask))
                    })
                    .collect();

                let batch = txn.mutation_queue_mut().add_mutation_batch(
                    local_write_time,
                    base_mutations,
                    mutations,
                );
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: batch.apply_to_local_document_set(&existing_docs),
                })
            })
    }

    /// Applies an acknowledged batch to the remote document cache and drops
    /// it from the queue. Returns the new local view of its documents.
    pub fn acknowledge_batch(
        &mut self,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<MaybeDocumentMap> {
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = &batch_result.batch;
                txn.mutation_queue_mut()
                    .acknowledge_batch(batch.batch_id, batch_result.stream_token.clone())?;

                let mut buffer = RemoteDocumentChangeBuffer::new(txn.remote_documents());
                for key in batch.keys().iter() {
                    let remote_doc = buffer.get_entry(key);
                    let ack_version = batch_result
                        .doc_versions
                        .get(key)
                        .copied()
                        .ok_or_else(|| internal_error(format!("No ack version for {key}")))?;
                    let outdated = remote_doc
                        .as_ref()
                        .map_or(true, |doc| doc.version() < ack_version);
                    if outdated {
                        match batch.apply_to_remote_document(key, remote_doc, batch_result)? {
                            Some(doc) => buffer.add_entry(doc, batch_result.commit_version),
                            None => buffer.remove_entry(key.clone()),
                        }
                    }
                }
                buffer.apply(txn.remote_documents_mut());
                txn.mutation_queue_mut().remove_mutation_batch(batch)?;

                Ok(local_view(txn).get_documents(&batch.keys()))
            })
    }

    /// Drops a batch the backend rejected. Returns the new local view of its
    /// documents.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<MaybeDocumentMap> {
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = txn
                    .mutation_queue()
                    .lookup_mutation_batch(batch_id)
                    .cloned()
                    .ok_or_else(|| not_found(format!("Unknown mutation batch {batch_id}")))?;
                txn.mutation_queue_mut().remove_mutation_batch(&batch)?;
                Ok(local_view(txn).get_documents(&batch.keys()))
            })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.persistence
            .mutation_queue()
            .highest_unacknowledged_batch_id()
    }

    pub fn get_last_stream_token(&self) -> Vec<u8> {
        self.persistence.mutation_queue().last_stream_token().to_vec()
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                txn.mutation_queue_mut().set_last_stream_token(token);
                Ok(())
            })
    }

    pub fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.persistence.target_cache().last_remote_snapshot_version()
    }

    /// Merges a watch snapshot into the caches. Returns the new local view
    /// of every document the event changed.
    pub fn apply_remote_event(
        &mut self,
        remote_event: &RemoteEvent,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let remote_version = remote_event.snapshot_version;
        let mut new_target_data = self.target_data_by_target.clone();
        let active_targets = &self.target_data_by_target;

        let changed_docs = self.persistence.run_transaction(
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let sequence_number = txn.target_cache_mut().next_sequence_number();
                for (target_id, change) in &remote_event.target_changes {
                    let Some(old_target_data) = active_targets.get(target_id) else {
                        continue;
                    };
                    let cache = txn.target_cache_mut();
                    cache.remove_matching_keys(change.removed_documents.iter(), *target_id);
                    cache.add_matching_keys(change.added_documents.iter(), *target_id);

                    if remote_event.target_mismatches.contains(target_id) {
                        // Mismatched targets are queried again from scratch.
                        let reset = old_target_data
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min())
                            .with_sequence_number(sequence_number);
                        cache.update_target_data(reset.clone());
                        new_target_data.insert(*target_id, reset);
                        continue;
                    }
                    if change.resume_token.is_empty() {
                        continue;
                    }
                    let updated = old_target_data
                        .with_resume_token(change.resume_token.clone(), remote_version)
                        .with_sequence_number(sequence_number);
                    if should_persist_target_data(old_target_data, &updated, change) {
                        cache.update_target_data(updated.clone());
                    }
                    new_target_data.insert(*target_id, updated);
                }

                let mut buffer = RemoteDocumentChangeBuffer::new(txn.remote_documents());
                let updated_keys: DocumentKeySet =
                    remote_event.document_updates.keys().cloned().collect();
                let existing_docs = buffer.get_entries(&updated_keys);
                let mut changed_docs = MaybeDocumentMap::new();
                for (key, doc) in remote_event.document_updates.iter() {
                    let existing = existing_docs.get(key);
                    // A NoDocument at version zero comes from a rejected
                    // limbo resolution and never enters the cache.
                    if doc.is_no_document() && doc.version().is_min() {
                        buffer.remove_entry(key.clone());
                        changed_docs = changed_docs.insert(key.clone(), doc.clone());
                    } else if is_newer(doc, existing) {
                        buffer.add_entry(doc.clone(), remote_version);
                        changed_docs = changed_docs.insert(key.clone(), doc.clone());
                    } else {
                        log::debug!(
                            target: LOG_TARGET,
                            "ignoring outdated watch update for {key}: have {:?}, got {:?}",
                            existing.map(MaybeDocument::version),
                            doc.version()
                        );
                    }
                }

                if !remote_version.is_min() {
                    let last_remote_version = txn.target_cache().last_remote_snapshot_version();
                    if remote_version < last_remote_version {
                        return Err(internal_error(format!(
                            "Watch stream reverted to {remote_version:?} \
                             from {last_remote_version:?}"
                        )));
                    }
                    txn.target_cache_mut()
                        .set_last_remote_snapshot_version(remote_version);
                }

                buffer.apply(txn.remote_documents_mut());
                Ok(local_view(txn).get_local_view_of_documents(&changed_docs))
            },
        )?;

        self.target_data_by_target = new_target_data;
        Ok(changed_docs)
    }

    /// Advances the limbo-free version of targets whose views caught up.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) {
        for change in view_changes.iter().filter(|change| !change.from_cache) {
            if let Some(target_data) = self.target_data_by_target.get_mut(&change.target_id) {
                *target_data =
                    target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
            }
        }
    }

    /// First queued batch after `after_batch_id`, or the head of the queue.
    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> Option<MutationBatch> {
        self.persistence
            .mutation_queue()
            .next_mutation_batch_after(after_batch_id.unwrap_or(BATCH_ID_UNKNOWN))
            .cloned()
    }

    pub fn read_document(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        LocalDocumentsView::new(
            self.persistence.remote_documents(),
            self.persistence.mutation_queue(),
        )
        .get_document(key)
    }

    /// Returns the target data for `target`, assigning a new target id if
    /// the target was never listened to.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self.persistence.run_transaction(
            "Allocate target",
            TransactionMode::ReadWrite,
            |txn| {
                if let Some(cached) = txn.target_cache().get_target_data(&target) {
                    return Ok(cached.clone());
                }
                let cache = txn.target_cache_mut();
                let target_id = cache.allocate_target_id();
                let sequence_number = cache.next_sequence_number();
                let target_data =
                    TargetData::new(target, target_id, QueryPurpose::Listen, sequence_number);
                cache.add_target_data(target_data.clone());
                Ok(target_data)
            },
        )?;

        let active = self
            .target_data_by_target
            .entry(target_data.target_id)
            .or_insert(target_data);
        Ok(active.clone())
    }

    /// Active or persisted target data for `target`.
    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.target_data_by_target
            .values()
            .find(|data| &data.target == target)
            .or_else(|| self.persistence.target_cache().get_target_data(target))
            .cloned()
    }

    pub fn target_data_for_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_target.get(&target_id)
    }

    /// Drops `target_id` along with its cached data and matching keys. A
    /// later listen to the same target starts over with a new id.
    pub fn release_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        let Some(target_data) = self.target_data_by_target.get(&target_id).cloned() else {
            return Err(internal_error(format!(
                "Tried to release nonexistent target {target_id}"
            )));
        };
        self.persistence
            .run_transaction("Release target", TransactionMode::ReadWrite, |txn| {
                txn.target_cache_mut().remove_target_data(&target_data);
                Ok(())
            })?;
        self.target_data_by_target.remove(&target_id);
        Ok(())
    }

    /// Runs `query` against the local view. With `use_previous_results`, the
    /// last synced result of the query's target seeds the execution.
    pub fn execute_query(
        &self,
        query: &Query,
        use_previous_results: bool,
    ) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target());
        let (last_limbo_free, remote_keys) = match &target_data {
            Some(data) => (
                data.last_limbo_free_snapshot_version,
                self.persistence
                    .target_cache()
                    .get_matching_keys_for_target_id(data.target_id),
            ),
            None => (SnapshotVersion::min(), DocumentKeySet::new()),
        };

        let view = LocalDocumentsView::new(
            self.persistence.remote_documents(),
            self.persistence.mutation_queue(),
        );
        let documents = if use_previous_results {
            self.query_engine
                .get_documents_matching_query(&view, query, last_limbo_free, &remote_keys)
        } else {
            self.query_engine.get_documents_matching_query(
                &view,
                query,
                SnapshotVersion::min(),
                &DocumentKeySet::new(),
            )
        };
        Ok(QueryResult {
            documents,
            remote_keys,
        })
    }

    /// Writes a no-op record to find out whether storage works again.
    pub fn probe_storage(&mut self) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Probe storage", TransactionMode::ReadWrite, |txn| {
                let version = txn.target_cache().last_remote_snapshot_version();
                txn.target_cache_mut()
                    .set_last_remote_snapshot_version(version);
                Ok(())
            })
    }
}

fn local_view(txn: &PersistenceTransaction) -> LocalDocumentsView<'_> {
    LocalDocumentsView::new(txn.remote_documents(), txn.mutation_queue())
}

/// Whether a watch update should replace the cached state. An equal version
/// replaces a document that still carries pending writes.
fn is_newer(doc: &MaybeDocument, existing: Option<&MaybeDocument>) -> bool {
    match existing {
        None => true,
        Some(existing) => {
            doc.version() > existing.version()
                || (doc.version() == existing.version() && existing.has_pending_writes())
        }
    }
}

fn should_persist_target_data(
    old_target_data: &TargetData,
    new_target_data: &TargetData,
    change: &TargetChange,
) -> bool {
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let age = new_target_data.snapshot_version.to_micros()
        - old_target_data.snapshot_version.to_micros();
    if age >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.document_change_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::local_serializer::LocalSerializer;
    use crate::firestore::local::persistence::{FailingStorageEngine, MemoryStorageEngine};
    use crate::firestore::model::{
        DatabaseId, Document, FieldPath, FieldTransform, MutationResult, NoDocument,
        TransformOperation,
    };
    use crate::firestore::remote::JsonProtoSerializer;
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::sync::Arc;

    fn serializer() -> LocalSerializer {
        LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("project", "(default)")))
    }

    fn store() -> LocalStore {
        LocalStore::new(Persistence::new_in_memory(serializer(), ""))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    fn data(field: &str, value: FirestoreValue) -> MapValue {
        MapValue::new(BTreeMap::from([(field.to_string(), value)]))
    }

    fn name(value: &str) -> MapValue {
        data("name", FirestoreValue::from_string(value))
    }

    fn ack(store: &LocalStore, batch_id: BatchId, at: i64) -> MutationBatchResult {
        let batch = store
            .persistence()
            .mutation_queue()
            .lookup_mutation_batch(batch_id)
            .cloned()
            .unwrap();
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(version(at), None))
            .collect();
        MutationBatchResult::from(batch, version(at), results, vec![1]).unwrap()
    }

    fn remote_event(at: i64, target_id: TargetId, docs: Vec<MaybeDocument>) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(at));
        let mut change = TargetChange {
            resume_token: vec![at as u8],
            current: true,
            ..TargetChange::default()
        };
        for doc in docs {
            change.added_documents = change.added_documents.insert(doc.key().clone());
            event.document_updates = event.document_updates.insert(doc.key().clone(), doc);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[test]
    fn local_writes_are_visible_until_acknowledged() {
        let mut store = store();
        let result = store
            .local_write(vec![Mutation::set(key("rooms/1"), name("a"))])
            .unwrap();
        let doc = result.changes.get(&key("rooms/1")).unwrap();
        assert!(doc.has_pending_writes());
        assert_eq!(store.get_highest_unacknowledged_batch_id(), result.batch_id);

        let batch_result = ack(&store, result.batch_id, 5);
        let changes = store.acknowledge_batch(&batch_result).unwrap();
        let doc = changes.get(&key("rooms/1")).unwrap();
        assert!(!doc.has_pending_writes());
        assert_eq!(doc.version(), version(5));
        assert_eq!(store.get_last_stream_token(), vec![1]);
        assert_eq!(store.get_highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);
    }

    #[test]
    fn rejected_batches_revert_the_local_view() {
        let mut store = store();
        let result = store
            .local_write(vec![Mutation::set(key("rooms/1"), name("a"))])
            .unwrap();
        let changes = store.reject_batch(result.batch_id).unwrap();
        assert!(changes.get(&key("rooms/1")).unwrap().is_no_document());
        assert!(store.read_document(&key("rooms/1")).is_none());
        assert!(store.reject_batch(result.batch_id).is_err());
    }

    #[test]
    fn increments_capture_their_base_value() {
        let mut store = store();
        let target = store
            .allocate_target(Query::at_path("rooms").unwrap().to_target())
            .unwrap();
        let doc = Document::new(
            key("rooms/1"),
            version(1),
            data("count", FirestoreValue::from_integer(1)),
        );
        store
            .apply_remote_event(&remote_event(1, target.target_id, vec![doc.into()]))
            .unwrap();

        let transform = FieldTransform::new(
            FieldPath::from_dot_separated("count").unwrap(),
            TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)),
        );
        store
            .local_write(vec![Mutation::transform(key("rooms/1"), vec![transform])])
            .unwrap();
        let batch = store.next_mutation_batch(None).unwrap();
        assert_eq!(batch.base_mutations.len(), 1);

        let local = store.read_document(&key("rooms/1")).unwrap();
        assert_eq!(
            local
                .as_document()
                .unwrap()
                .field(&FieldPath::from_dot_separated("count").unwrap()),
            Some(&FirestoreValue::from_integer(3))
        );
    }

    #[test]
    fn outdated_watch_updates_are_ignored() {
        let mut store = store();
        let target = store
            .allocate_target(Query::at_path("rooms").unwrap().to_target())
            .unwrap();
        let newer = Document::new(key("rooms/1"), version(5), name("new"));
        store
            .apply_remote_event(&remote_event(5, target.target_id, vec![newer.clone().into()]))
            .unwrap();
        let older = Document::new(key("rooms/1"), version(3), name("old"));
        let changes = store
            .apply_remote_event(&remote_event(6, target.target_id, vec![older.into()]))
            .unwrap();
        assert!(changes.is_empty());
        assert_eq!(store.read_document(&key("rooms/1")), Some(newer.into()));
    }

    #[test]
    fn version_zero_deletes_remove_the_cache_entry() {
        let mut store = store();
        let target = store
            .allocate_target(Query::at_path("rooms").unwrap().to_target())
            .unwrap();
        let doc = Document::new(key("rooms/1"), version(1), name("a"));
        store
            .apply_remote_event(&remote_event(1, target.target_id, vec![doc.into()]))
            .unwrap();

        let mut event = RemoteEvent::new(version(2));
        event.document_updates = event.document_updates.insert(
            key("rooms/1"),
            NoDocument::new(key("rooms/1"), SnapshotVersion::min()).into(),
        );
        store.apply_remote_event(&event).unwrap();
        assert!(store.persistence().remote_documents().is_empty());
    }

    #[test]
    fn resume_tokens_persist_when_documents_change() {
        let mut store = store();
        let target = Query::at_path("rooms").unwrap().to_target();
        let allocated = store.allocate_target(target.clone()).unwrap();
        let doc = Document::new(key("rooms/1"), version(1), name("a"));
        store
            .apply_remote_event(&remote_event(1, allocated.target_id, vec![doc.into()]))
            .unwrap();
        let persisted = store.persistence().target_cache().get_target_data(&target).unwrap();
        assert_eq!(persisted.resume_token, vec![1]);

        // Same documents, fresh token and no document changes.
        store
            .apply_remote_event(&remote_event(2, allocated.target_id, Vec::new()))
            .unwrap();
        let persisted = store.persistence().target_cache().get_target_data(&target).unwrap();
        assert_eq!(persisted.resume_token, vec![1]);
        assert_eq!(
            store.target_data_for_id(allocated.target_id).unwrap().resume_token,
            vec![2]
        );
    }

    #[test]
    fn execute_query_uses_previous_results_once_limbo_free() {
        let mut store = store();
        let query = Query::at_path("rooms").unwrap();
        let allocated = store.allocate_target(query.to_target()).unwrap();
        let doc = Document::new(key("rooms/1"), version(1), name("a"));
        store
            .apply_remote_event(&remote_event(1, allocated.target_id, vec![doc.into()]))
            .unwrap();
        store.notify_local_view_changes(&[LocalViewChanges {
            target_id: allocated.target_id,
            from_cache: false,
        }]);
        assert_eq!(
            store
                .target_data_for_id(allocated.target_id)
                .unwrap()
                .last_limbo_free_snapshot_version,
            version(1)
        );

        let result = store.execute_query(&query, true).unwrap();
        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.remote_keys.len(), 1);
    }

    #[test]
    fn released_targets_leave_the_target_cache() {
        let mut store = store();
        let target = Query::at_path("rooms").unwrap().to_target();
        let allocated = store.allocate_target(target.clone()).unwrap();
        let doc = Document::new(key("rooms/1"), version(1), name("a"));
        store
            .apply_remote_event(&remote_event(1, allocated.target_id, vec![doc.into()]))
            .unwrap();
        store.release_target(allocated.target_id).unwrap();
        assert!(store.target_data_for_id(allocated.target_id).is_none());

        let cache = store.persistence().target_cache();
        assert!(cache.get_target_data(&target).is_none());
        assert!(cache.target_data_for_id(allocated.target_id).is_none());
        assert!(cache
            .get_matching_keys_for_target_id(allocated.target_id)
            .is_empty());
        assert!(store.read_document(&key("rooms/1")).is_some());

        let again = store.allocate_target(target).unwrap();
        assert!(again.target_id > allocated.target_id);
        assert!(again.resume_token.is_empty());
    }

    #[test]
    fn user_changes_swap_mutation_queues() {
        let mut store = store();
        store
            .local_write(vec![Mutation::set(key("rooms/1"), name("a"))])
            .unwrap();
        let change = store.handle_user_change("bob").unwrap();
        assert_eq!(change.removed_batch_ids, vec![1]);
        assert!(change.added_batch_ids.is_empty());
        assert!(change
            .affected_documents
            .get(&key("rooms/1"))
            .unwrap()
            .is_no_document());
    }

    #[test]
    fn storage_failures_leave_the_store_unchanged() {
        let engine = FailingStorageEngine::new(MemoryStorageEngine::new());
        let persistence = Persistence::open(Arc::new(engine.clone()), serializer(), "").unwrap();
        let mut store = LocalStore::new(persistence);
        engine.fail_next_commits(2);

        let err = store
            .local_write(vec![Mutation::set(key("rooms/1"), name("a"))])
            .unwrap_err();
        assert!(err.is_retryable_storage_error());
        assert!(store.read_document(&key("rooms/1")).is_none());
        assert!(store.probe_storage().is_err());
        assert!(store.probe_storage().is_ok());
    }
}
