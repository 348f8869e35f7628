use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::local_serializer::{DbTargetGlobal, LocalSerializer};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::{BatchId, DocumentKey, MutationBatch, BATCH_ID_UNKNOWN};

const TARGET_GLOBAL_KEY: &str = "targetGlobal";
const MUTATION_QUEUE_PREFIX: &str = "mutationQueue|";

/// Object stores of the durable engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreName {
    Documents,
    Mutations,
    Targets,
    TargetDocuments,
    Globals,
}

impl StoreName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Documents => "remoteDocuments",
            StoreName::Mutations => "mutations",
            StoreName::Targets => "targets",
            StoreName::TargetDocuments => "targetDocuments",
            StoreName::Globals => "globals",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StorageRecord {
    pub store: StoreName,
    pub key: String,
    pub value: JsonValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StorageWrite {
    Put(StorageRecord),
    Delete { store: StoreName, key: String },
}

/// Durable key-value engine behind [`Persistence`].
pub trait StorageEngine: Send + Sync {
    fn load(&self) -> FirestoreResult<Vec<StorageRecord>>;

    /// Writes all of `writes` or none of them.
    fn commit(&self, label: &str, writes: &[StorageWrite]) -> FirestoreResult<()>;
}

/// Storage engine keeping its records in process memory. Clones share the
/// same records, so a clone can be reopened to simulate a restart.
#[derive(Clone, Default)]
pub struct MemoryStorageEngine {
    records: Arc<Mutex<BTreeMap<(StoreName, String), JsonValue>>>,
}

impl MemoryStorageEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self, store: StoreName) -> usize {
        self.records
            .lock()
            .map(|records| records.keys().filter(|(name, _)| *name == store).count())
            .unwrap_or_default()
    }
}

impl fmt::Debug for MemoryStorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorageEngine").finish_non_exhaustive()
    }
}

impl StorageEngine for MemoryStorageEngine {
    fn load(&self) -> FirestoreResult<Vec<StorageRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| internal_error("Storage engine lock poisoned"))?;
        Ok(records
            .iter()
            .map(|((store, key), value)| StorageRecord {
                store: *store,
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    fn commit(&self, _label: &str, writes: &[StorageWrite]) -> FirestoreResult<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| internal_error("Storage engine lock poisoned"))?;
        for write in writes {
            match write {
                StorageWrite::Put(record) => {
                    records.insert((record.store, record.key.clone()), record.value.clone());
                }
                StorageWrite::Delete { store, key } => {
                    records.remove(&(*store, key.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Engine that rejects the next `n` commits with a retryable storage error
/// before delegating to an in-memory engine.
#[derive(Clone, Debug, Default)]
pub struct FailingStorageEngine {
    inner: MemoryStorageEngine,
    failures_remaining: Arc<AtomicUsize>,
}

impl FailingStorageEngine {
    pub fn new(inner: MemoryStorageEngine) -> Self {
        Self {
            inner,
            failures_remaining: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &MemoryStorageEngine {
        &self.inner
    }
}

impl StorageEngine for FailingStorageEngine {
    fn load(&self) -> FirestoreResult<Vec<StorageRecord>> {
        self.inner.load()
    }

    fn commit(&self, label: &str, writes: &[StorageWrite]) -> FirestoreResult<()> {
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if failed {
            return Err(FirestoreError::storage_unavailable(format!(
                "Simulated storage failure in '{label}'"
            )));
        }
        self.inner.commit(label, writes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    ReadWritePrimary,
}

/// Everything the local store caches, for one user at a time.
#[derive(Clone, Debug)]
pub struct PersistenceState {
    mutation_queue: MutationQueue,
    other_queues: BTreeMap<String, MutationQueue>,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
}

impl PersistenceState {
    fn new(uid: &str) -> Self {
        Self {
            mutation_queue: MutationQueue::new(uid),
            other_queues: BTreeMap::new(),
            remote_documents: RemoteDocumentCache::new(),
            target_cache: TargetCache::new(),
        }
    }

    fn switch_user(&mut self, uid: &str) {
        if self.mutation_queue.uid() == uid {
            return;
        }
        let next = self
            .other_queues
            .remove(uid)
            .unwrap_or_else(|| MutationQueue::new(uid));
        let previous = std::mem::replace(&mut self.mutation_queue, next);
        self.other_queues
            .insert(previous.uid().to_string(), previous);
    }

    fn queues(&self) -> impl Iterator<Item = &MutationQueue> {
        std::iter::once(&self.mutation_queue).chain(self.other_queues.values())
    }

    fn is_dirty(&self) -> bool {
        self.queues().any(MutationQueue::is_dirty)
            || self.remote_documents.is_dirty()
            || self.target_cache.is_dirty()
    }

    fn clear_dirty(&mut self) {
        self.mutation_queue.clear_dirty();
        for queue in self.other_queues.values_mut() {
            queue.clear_dirty();
        }
        self.remote_documents.clear_dirty();
        self.target_cache.clear_dirty();
    }
}

/// Working copy handed to a transaction function. Changes become visible
/// once the transaction commits.
pub struct PersistenceTransaction {
    state: PersistenceState,
    mode: TransactionMode,
}

impl PersistenceTransaction {
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.state.mutation_queue
    }

    pub fn mutation_queue_mut(&mut self) -> &mut MutationQueue {
        &mut self.state.mutation_queue
    }

    pub fn remote_documents(&self) -> &RemoteDocumentCache {
        &self.state.remote_documents
    }

    pub fn remote_documents_mut(&mut self) -> &mut RemoteDocumentCache {
        &mut self.state.remote_documents
    }

    pub fn target_cache(&self) -> &TargetCache {
        &self.state.target_cache
    }

    pub fn target_cache_mut(&mut self) -> &mut TargetCache {
        &mut self.state.target_cache
    }
}

/// Owns the cached state and commits transactions against it.
pub struct Persistence {
    state: PersistenceState,
    engine: Option<Arc<dyn StorageEngine>>,
    serializer: LocalSerializer,
}

impl Persistence {
    /// Persistence without durable storage; state is lost with the process.
    pub fn new_in_memory(serializer: LocalSerializer, uid: &str) -> Self {
        Self {
            state: PersistenceState::new(uid),
            engine: None,
            serializer,
        }
    }

    /// Rebuilds the caches from the records in `engine`.
    pub fn open(
        engine: Arc<dyn StorageEngine>,
        serializer: LocalSerializer,
        uid: &str,
    ) -> FirestoreResult<Self> {
        let mut state = PersistenceState::new(uid);
        let mut batches: BTreeMap<String, Vec<MutationBatch>> = BTreeMap::new();
        let mut queue_metadata: BTreeMap<String, (BatchId, Vec<u8>)> = BTreeMap::new();
        let mut target_global = None;
        let mut matching_keys = Vec::new();

        for record in engine.load()? {
            match record.store {
                StoreName::Documents => {
                    let entry = serializer.decode_remote_document(&record.value)?;
                    state.remote_documents.restore_entry(entry.doc, entry.read_time);
                }
                StoreName::Mutations => {
                    let (owner, batch) = serializer.decode_mutation_batch(&record.value)?;
                    batches.entry(owner).or_default().push(batch);
                }
                StoreName::Targets => {
                    let target_data = serializer.decode_target_data(&record.value)?;
                    state.target_cache.add_target_data(target_data);
                }
                StoreName::TargetDocuments => {
                    matching_keys.push(decode_target_document(&record.value)?);
                }
                StoreName::Globals if record.key == TARGET_GLOBAL_KEY => {
                    target_global = Some(serializer.decode_target_global(&record.value)?);
                }
                StoreName::Globals => {
                    if let Some(owner) = record.key.strip_prefix(MUTATION_QUEUE_PREFIX) {
                        let metadata = serializer.decode_queue_metadata(&record.value)?;
                        queue_metadata.insert(owner.to_string(), metadata);
                    }
                }
            }
        }

        for (target_id, key) in matching_keys {
            state.target_cache.add_matching_keys([&key], target_id);
        }
        if let Some(global) = target_global {
            state.target_cache.restore_metadata(
                global.highest_target_id,
                global.highest_listen_sequence_number,
                global.last_remote_snapshot_version.into(),
            );
        }

        let owners: BTreeSet<String> = batches
            .keys()
            .chain(queue_metadata.keys())
            .cloned()
            .collect();
        for owner in owners {
            let (last_acknowledged, token) = queue_metadata
                .remove(&owner)
                .unwrap_or((BATCH_ID_UNKNOWN, Vec::new()));
            let mut queue = MutationQueue::new(owner.as_str());
            queue.restore(
                batches.remove(&owner).unwrap_or_default(),
                last_acknowledged,
                token,
            );
            if owner == uid {
                state.mutation_queue = queue;
            } else {
                state.other_queues.insert(owner, queue);
            }
        }
        state.clear_dirty();

        log::debug!(
            target: "firestore::local_store",
            "opened persistence with {} documents, {} targets and {} pending batches",
            state.remote_documents.len(),
            state.target_cache.target_count(),
            state.mutation_queue.len()
        );

        Ok(Self {
            state,
            engine: Some(engine),
            serializer,
        })
    }

    pub fn current_uid(&self) -> &str {
        self.state.mutation_queue.uid()
    }

    /// Makes `uid`'s mutation queue the active one.
    pub fn set_user(&mut self, uid: &str) {
        self.state.switch_user(uid);
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.state.mutation_queue
    }

    pub fn remote_documents(&self) -> &RemoteDocumentCache {
        &self.state.remote_documents
    }

    pub fn target_cache(&self) -> &TargetCache {
        &self.state.target_cache
    }

    /// Runs `f` against a working copy of the state. The copy replaces the
    /// current state only if `f` succeeds and its writes were committed.
    pub fn run_transaction<T, F>(
        &mut self,
        label: &str,
        mode: TransactionMode,
        f: F,
    ) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction) -> FirestoreResult<T>,
    {
        let mut txn = PersistenceTransaction {
            state: self.state.clone(),
            mode,
        };
        let result = f(&mut txn)?;

        if txn.state.is_dirty() {
            if mode == TransactionMode::ReadOnly {
                return Err(internal_error(format!(
                    "Read-only transaction '{label}' attempted to write"
                )));
            }
            if let Some(engine) = &self.engine {
                let writes = self.collect_writes(&txn.state);
                engine.commit(label, &writes)?;
            }
            txn.state.clear_dirty();
        }
        self.state = txn.state;
        Ok(result)
    }

    fn collect_writes(&self, state: &PersistenceState) -> Vec<StorageWrite> {
        let mut writes = Vec::new();

        for key in &state.remote_documents.dirty_keys {
            let record_key = key.path().canonical_string();
            writes.push(match state.remote_documents.entry(key) {
                Some(entry) => put(
                    StoreName::Documents,
                    record_key,
                    self.serializer.encode_remote_document(entry),
                ),
                None => delete(StoreName::Documents, record_key),
            });
        }

        for queue in state.queues() {
            for batch_id in &queue.dirty_batches {
                let record_key = format!("{}|{batch_id}", queue.uid());
                writes.push(match queue.lookup_mutation_batch(*batch_id) {
                    Some(batch) => put(
                        StoreName::Mutations,
                        record_key,
                        self.serializer.encode_mutation_batch(queue.uid(), batch),
                    ),
                    None => delete(StoreName::Mutations, record_key),
                });
            }
            if queue.metadata_dirty {
                writes.push(put(
                    StoreName::Globals,
                    format!("{MUTATION_QUEUE_PREFIX}{}", queue.uid()),
                    self.serializer.encode_queue_metadata(
                        queue.last_acknowledged_batch_id(),
                        queue.last_stream_token(),
                    ),
                ));
            }
        }

        let targets = &state.target_cache;
        for target_id in &targets.dirty_targets {
            let record_key = target_id.to_string();
            writes.push(match targets.target_data_for_id(*target_id) {
                Some(data) => put(
                    StoreName::Targets,
                    record_key,
                    self.serializer.encode_target_data(data),
                ),
                None => delete(StoreName::Targets, record_key),
            });
        }
        for (target_id, key) in &targets.dirty_matches {
            let path = key.path().canonical_string();
            let record_key = format!("{target_id}|{path}");
            writes.push(if targets.is_match(*target_id, key) {
                put(
                    StoreName::TargetDocuments,
                    record_key,
                    json!({ "targetId": target_id, "path": path }),
                )
            } else {
                delete(StoreName::TargetDocuments, record_key)
            });
        }
        if targets.metadata_dirty {
            let global = DbTargetGlobal {
                highest_target_id: targets.highest_target_id(),
                highest_listen_sequence_number: targets.highest_listen_sequence_number(),
                last_remote_snapshot_version: targets.last_remote_snapshot_version().into(),
            };
            writes.push(put(
                StoreName::Globals,
                TARGET_GLOBAL_KEY.to_string(),
                self.serializer.encode_target_global(&global),
            ));
        }

        writes
    }
}

fn put(store: StoreName, key: String, value: JsonValue) -> StorageWrite {
    StorageWrite::Put(StorageRecord { store, key, value })
}

fn delete(store: StoreName, key: String) -> StorageWrite {
    StorageWrite::Delete { store, key }
}

fn decode_target_document(value: &JsonValue) -> FirestoreResult<(i32, DocumentKey)> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| internal_error("Target document record missing targetId"))?;
    let path = value
        .get("path")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| internal_error("Target document record missing path"))?;
    let target_id = i32::try_from(target_id)
        .map_err(|_| internal_error(format!("Target id {target_id} out of range")))?;
    Ok((target_id, DocumentKey::from_string(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::local::target_cache::{QueryPurpose, TargetData};
    use crate::firestore::model::{DatabaseId, Document, Mutation, SnapshotVersion, Timestamp};
    use crate::firestore::remote::JsonProtoSerializer;
    use crate::firestore::value::MapValue;

    fn serializer() -> LocalSerializer {
        LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::new("project", "(default)")))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn write_everything(persistence: &mut Persistence) {
        persistence
            .run_transaction("write", TransactionMode::ReadWrite, |txn| {
                txn.mutation_queue_mut().add_mutation_batch(
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![Mutation::set(key("rooms/1"), MapValue::empty())],
                );
                let version = SnapshotVersion::from_micros(5);
                txn.remote_documents_mut().add_entry(
                    Document::new(key("rooms/2"), version, MapValue::empty()).into(),
                    version,
                );
                let target_id = txn.target_cache_mut().allocate_target_id();
                let target = Query::at_path("rooms").unwrap().to_target();
                txn.target_cache_mut().add_target_data(TargetData::new(
                    target,
                    target_id,
                    QueryPurpose::Listen,
                    1,
                ));
                txn.target_cache_mut()
                    .add_matching_keys([&key("rooms/2")], target_id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn reopening_restores_committed_state() {
        let engine = MemoryStorageEngine::new();
        let mut persistence =
            Persistence::open(Arc::new(engine.clone()), serializer(), "alice").unwrap();
        write_everything(&mut persistence);
        assert_eq!(engine.record_count(StoreName::Mutations), 1);

        let reopened = Persistence::open(Arc::new(engine), serializer(), "alice").unwrap();
        assert_eq!(reopened.mutation_queue().len(), 1);
        assert!(reopened.remote_documents().get_entry(&key("rooms/2")).is_some());
        assert_eq!(reopened.target_cache().highest_target_id(), 2);
        assert!(reopened.target_cache().is_match(2, &key("rooms/2")));
    }

    #[test]
    fn failed_commits_leave_state_untouched() {
        let engine = FailingStorageEngine::new(MemoryStorageEngine::new());
        let mut persistence =
            Persistence::open(Arc::new(engine.clone()), serializer(), "alice").unwrap();
        engine.fail_next_commits(1);

        let err = persistence
            .run_transaction("write", TransactionMode::ReadWrite, |txn| {
                let version = SnapshotVersion::from_micros(1);
                txn.remote_documents_mut().add_entry(
                    Document::new(key("rooms/1"), version, MapValue::empty()).into(),
                    version,
                );
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_retryable_storage_error());
        assert!(persistence.remote_documents().is_empty());

        write_everything(&mut persistence);
        assert!(!persistence.remote_documents().is_empty());
    }

    #[test]
    fn read_only_transactions_cannot_write() {
        let mut persistence = Persistence::new_in_memory(serializer(), "alice");
        let result = persistence.run_transaction("read", TransactionMode::ReadOnly, |txn| {
            txn.target_cache_mut().next_sequence_number();
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(persistence.target_cache().highest_listen_sequence_number(), 0);
    }

    #[test]
    fn each_user_keeps_a_separate_queue() {
        let engine = MemoryStorageEngine::new();
        let mut persistence =
            Persistence::open(Arc::new(engine.clone()), serializer(), "alice").unwrap();
        write_everything(&mut persistence);

        persistence.set_user("bob");
        assert!(persistence.mutation_queue().is_empty());
        persistence.set_user("alice");
        assert_eq!(persistence.mutation_queue().len(), 1);

        let as_bob = Persistence::open(Arc::new(engine), serializer(), "bob").unwrap();
        assert!(as_bob.mutation_queue().is_empty());
    }
}
