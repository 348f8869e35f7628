//! Optimistic read-write transactions against the backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::firestore::error::{
    aborted, failed_precondition, invalid_argument, is_permanent_error, FirestoreError,
    FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::{
    DocumentKey, FieldMask, MaybeDocument, Mutation, Precondition, SnapshotVersion,
};
use crate::firestore::remote::Datastore;
use crate::firestore::value::MapValue;
use crate::platform::runtime;
use crate::util::{BackoffSettings, ExponentialBackoff};

const LOG_TARGET: &str = "firestore::transaction";

/// Buffers the reads and writes of one transaction attempt.
///
/// Every read records the version it saw; the commit sends the buffered
/// writes with preconditions on those versions, so it fails if another
/// client changed a read document in between.
pub struct Transaction {
    datastore: Arc<dyn Datastore>,
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    mutations: Vec<Mutation>,
    written_docs: BTreeSet<DocumentKey>,
    /// A write that could not be buffered fails the commit.
    last_write_error: Option<FirestoreError>,
    committed: bool,
}

impl Transaction {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            read_versions: BTreeMap::new(),
            mutations: Vec::new(),
            written_docs: BTreeSet::new(),
            last_write_error: None,
            committed: false,
        }
    }

    /// Reads `keys` from the backend. All reads must happen before the first
    /// write.
    pub async fn lookup(&mut self, keys: Vec<DocumentKey>) -> FirestoreResult<Vec<MaybeDocument>> {
        self.ensure_commit_not_called()?;
        if !self.mutations.is_empty() {
            return Err(invalid_argument(
                "Firestore transactions require all reads to be executed before all writes.",
            ));
        }
        let docs = self.datastore.lookup(keys).await?;
        for doc in &docs {
            self.record_version(doc)?;
        }
        Ok(docs)
    }

    pub fn set(&mut self, key: DocumentKey, data: MapValue) {
        let precondition = self.precondition(&key);
        self.write(Mutation::set(key, data).with_precondition(precondition));
    }

    /// Patches the fields in `mask`. The document has to exist.
    pub fn update(&mut self, key: DocumentKey, data: MapValue, mask: FieldMask) {
        match self.precondition_for_update(&key) {
            Ok(precondition) => {
                self.write(Mutation::patch(key, data, mask).with_precondition(precondition))
            }
            Err(err) => self.last_write_error = Some(err),
        }
    }

    pub fn delete(&mut self, key: DocumentKey) {
        let precondition = self.precondition(&key);
        self.write(Mutation::delete(key).with_precondition(precondition));
    }

    /// Sends the buffered writes, verifying documents that were read but not
    /// written.
    pub async fn commit(&mut self) -> FirestoreResult<()> {
        self.ensure_commit_not_called()?;
        self.committed = true;
        if let Some(err) = self.last_write_error.take() {
            return Err(err);
        }

        let unwritten: Vec<DocumentKey> = self
            .read_versions
            .keys()
            .filter(|key| !self.written_docs.contains(*key))
            .cloned()
            .collect();
        for key in unwritten {
            let precondition = self.precondition(&key);
            self.mutations.push(Mutation::verify(key, precondition));
        }

        let mutations = std::mem::take(&mut self.mutations);
        self.datastore.commit(mutations).await?;
        Ok(())
    }

    fn write(&mut self, mutation: Mutation) {
        self.written_docs.insert(mutation.key().clone());
        self.mutations.push(mutation);
    }

    fn record_version(&mut self, doc: &MaybeDocument) -> FirestoreResult<()> {
        let version = match doc {
            MaybeDocument::Document(doc) => doc.version(),
            MaybeDocument::NoDocument(_) => SnapshotVersion::min(),
            MaybeDocument::Unknown(_) => {
                return Err(invalid_argument(format!(
                    "Document {} has an unknown state in a transaction read",
                    doc.key()
                )))
            }
        };
        match self.read_versions.get(doc.key()) {
            Some(existing) if *existing != version => {
                Err(aborted("Document version changed between two reads."))
            }
            Some(_) => Ok(()),
            None => {
                self.read_versions.insert(doc.key().clone(), version);
                Ok(())
            }
        }
    }

    /// A document read as missing must still be missing; a read document
    /// must still have the version that was read. Only the first write to a
    /// key carries the check.
    fn precondition(&self, key: &DocumentKey) -> Precondition {
        match self.unwritten_read_version(key) {
            Some(version) if version.is_min() => Precondition::Exists(false),
            Some(version) => Precondition::UpdateTime(*version),
            None => Precondition::None,
        }
    }

    fn precondition_for_update(&self, key: &DocumentKey) -> FirestoreResult<Precondition> {
        match self.unwritten_read_version(key) {
            Some(version) if version.is_min() => {
                Err(invalid_argument("Can't update a document that doesn't exist."))
            }
            Some(version) => Ok(Precondition::UpdateTime(*version)),
            None => Ok(Precondition::Exists(true)),
        }
    }

    fn unwritten_read_version(&self, key: &DocumentKey) -> Option<&SnapshotVersion> {
        if self.written_docs.contains(key) {
            None
        } else {
            self.read_versions.get(key)
        }
    }

    fn ensure_commit_not_called(&self) -> FirestoreResult<()> {
        if self.committed {
            Err(failed_precondition(
                "A transaction object cannot be used after its update callback has been invoked.",
            ))
        } else {
            Ok(())
        }
    }
}

/// Contention shows up as these codes; anything transient is retried too.
fn is_retryable_transaction_error(err: &FirestoreError) -> bool {
    matches!(
        err.code,
        FirestoreErrorCode::Aborted
            | FirestoreErrorCode::FailedPrecondition
            | FirestoreErrorCode::AlreadyExists
    ) || !is_permanent_error(err.code)
}

/// Runs `update_fn` in a fresh [`Transaction`] and commits it, retrying with
/// backoff while attempts remain and the failure looks like contention.
pub async fn run_transaction<T, F>(
    datastore: Arc<dyn Datastore>,
    backoff: BackoffSettings,
    max_attempts: u32,
    mut update_fn: F,
) -> FirestoreResult<T>
where
    F: for<'a> FnMut(&'a mut Transaction) -> BoxFuture<'a, FirestoreResult<T>>,
{
    let mut backoff = ExponentialBackoff::new(backoff);
    let mut attempts_remaining = max_attempts.max(1);
    loop {
        attempts_remaining -= 1;
        let mut transaction = Transaction::new(Arc::clone(&datastore));
        let outcome = match update_fn(&mut transaction).await {
            Ok(value) => transaction.commit().await.map(|()| value),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if attempts_remaining > 0 && is_retryable_transaction_error(&err) => {
                let delay = backoff.next_delay();
                log::debug!(
                    target: LOG_TARGET,
                    "transaction failed with {err}, {attempts_remaining} attempts left, \
                     retrying in {delay:?}"
                );
                runtime::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
