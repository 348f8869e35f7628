use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentVersionMap, MaybeDocument, MaybeDocumentMap, Mutation,
    MutationResult, SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations written together by the user, applied atomically.
///
/// `base_mutations` capture the pre-write values of non-idempotent
/// transforms. They are applied before the user mutations whenever the local
/// view is rebuilt, so a batch keeps producing the same result even when it
/// is recomputed after restart.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the acknowledged mutations for `key` to the cached document.
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        if batch_result.mutation_results.len() != self.mutations.len() {
            return Err(internal_error(format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                batch_result.mutation_results.len()
            )));
        }

        let mut current = maybe_doc;
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key() == key {
                current = mutation.apply_to_remote_document(current.as_ref(), result);
            }
        }
        Ok(current)
    }

    /// Applies this batch's mutations for `key` on top of `maybe_doc`.
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        let mut current = maybe_doc;
        for mutation in self.base_mutations.iter().filter(|m| m.key() == key) {
            current = mutation.apply_to_local_view(
                current.as_ref(),
                current.as_ref(),
                self.local_write_time,
            );
        }

        let base_doc = current.clone();
        for mutation in self.mutations.iter().filter(|m| m.key() == key) {
            current = mutation.apply_to_local_view(
                current.as_ref(),
                base_doc.as_ref(),
                self.local_write_time,
            );
        }
        current
    }

    /// Applies the batch to every document in `docs` it touches.
    pub fn apply_to_local_document_set(&self, docs: &MaybeDocumentMap) -> MaybeDocumentMap {
        let mut result = docs.clone();
        for key in self.keys().iter() {
            let current = result.get(key).cloned();
            match self.apply_to_local_view(key, current) {
                Some(doc) => result = result.insert(key.clone(), doc),
                None => result = result.remove(key),
            }
        }
        result
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .fold(DocumentKeySet::new(), |keys, mutation| {
                keys.insert(mutation.key().clone())
            })
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Outcome of a batch the backend accepted.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document had once the batch committed.
    pub doc_versions: DocumentVersionMap,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }

        let mut doc_versions = DocumentVersionMap::new();
        for (mutation, result) in batch.mutations.iter().zip(&mutation_results) {
            let version = if result.version.is_min() {
                commit_version
            } else {
                result.version
            };
            doc_versions = doc_versions.insert(mutation.key().clone(), version);
        }

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
