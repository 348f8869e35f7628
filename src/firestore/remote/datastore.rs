use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::firestore::core::Query;
use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreResult};
use crate::firestore::model::{
    Document, DocumentKey, MaybeDocument, Mutation, MutationResult, NoDocument,
    SnapshotVersion, Timestamp,
};

/// Unary calls to the backend, used by transactions and server reads.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// Current server state of `keys`, in request order. Missing documents
    /// come back as [`NoDocument`] at the read version.
    async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>>;

    /// Applies `mutations` atomically.
    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<Vec<MutationResult>>;

    async fn run_query(&self, query: Query) -> FirestoreResult<Vec<Document>>;
}

#[derive(Default)]
struct FakeState {
    documents: BTreeMap<DocumentKey, Document>,
    version: i64,
    commit_failures: Vec<FirestoreError>,
    commits: usize,
    lookups: usize,
}

impl FakeState {
    fn next_version(&mut self) -> SnapshotVersion {
        self.version += 1;
        SnapshotVersion::from_micros(self.version * 1_000_000)
    }

    fn current_version(&self) -> SnapshotVersion {
        SnapshotVersion::from_micros(self.version * 1_000_000)
    }
}

/// In-memory backend with real precondition checks. Each commit advances
/// the server clock by one second.
#[derive(Clone, Default)]
pub struct FakeDatastore {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `doc` as if another client had written it.
    pub fn put(&self, doc: Document) {
        let mut state = self.lock();
        let version = state.next_version();
        let doc = Document::new(doc.key().clone(), version, doc.data().clone());
        state.documents.insert(doc.key().clone(), doc);
    }

    pub fn get(&self, key: &DocumentKey) -> Option<Document> {
        self.lock().documents.get(key).cloned()
    }

    /// Makes the next commit fail with `error` instead of applying.
    pub fn fail_next_commit(&self, error: FirestoreError) {
        self.lock().commit_failures.push(error);
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn lookup_count(&self) -> usize {
        self.lock().lookups
    }
}

#[async_trait]
impl Datastore for FakeDatastore {
    async fn lookup(&self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>> {
        let mut state = self.lock();
        state.lookups += 1;
        let read_version = state.current_version();
        Ok(keys
            .into_iter()
            .map(|key| match state.documents.get(&key) {
                Some(doc) => doc.clone().into(),
                None => NoDocument::new(key, read_version).into(),
            })
            .collect())
    }

    async fn commit(&self, mutations: Vec<Mutation>) -> FirestoreResult<Vec<MutationResult>> {
        let mut state = self.lock();
        state.commits += 1;
        if !state.commit_failures.is_empty() {
            return Err(state.commit_failures.remove(0));
        }

        let mut staged = state.documents.clone();
        for mutation in &mutations {
            let existing: Option<MaybeDocument> =
                staged.get(mutation.key()).cloned().map(Into::into);
            if !mutation.precondition().is_valid_for(existing.as_ref()) {
                return Err(failed_precondition(format!(
                    "Precondition failed for {}",
                    mutation.key()
                )));
            }
            let updated = mutation.apply_to_local_view(
                existing.as_ref(),
                existing.as_ref(),
                Timestamp::now(),
            );
            match updated {
                Some(MaybeDocument::Document(doc)) => {
                    staged.insert(mutation.key().clone(), doc);
                }
                Some(_) => {
                    staged.remove(mutation.key());
                }
                None => {}
            }
        }

        let commit_version = state.next_version();
        for (key, doc) in staged.iter_mut() {
            if doc.has_local_mutations() {
                *doc = Document::new(key.clone(), commit_version, doc.data().clone());
            }
        }
        state.documents = staged;
        Ok(mutations
            .iter()
            .map(|_| MutationResult::new(commit_version, None))
            .collect())
    }

    async fn run_query(&self, query: Query) -> FirestoreResult<Vec<Document>> {
        let state = self.lock();
        let mut docs: Vec<Document> = state
            .documents
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();
        let comparator = query.comparator();
        docs.sort_by(|left, right| comparator(left, right));
        if let Some(limit) = query.limit() {
            let limit = limit as usize;
            if query.has_limit_to_last() {
                let skip = docs.len().saturating_sub(limit);
                docs.drain(..skip);
            } else {
                docs.truncate(limit);
            }
        }
        Ok(docs)
    }
}
