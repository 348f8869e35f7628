use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::firestore::core::event_manager::{ListenOptions, ListenerId, SnapshotObserver};
use crate::firestore::core::sync_engine::SyncEngine;
use crate::firestore::core::transaction::{self, Transaction};
use crate::firestore::core::{Query, ViewSnapshot};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::Persistence;
use crate::firestore::model::{Document, DocumentKey, MaybeDocument, Mutation};
use crate::firestore::remote::{Connection, CredentialsProvider, Datastore};
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::util::{deferred, AsyncQueue};

const LOG_TARGET: &str = "firestore::client";

/// Handle to a running sync engine.
///
/// The engine lives on its own queue worker; every method here submits an
/// operation to that queue and resolves once it ran. Cloning the client
/// shares the engine.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    queue: AsyncQueue<SyncEngine>,
    datastore: Arc<dyn Datastore>,
    settings: FirestoreSettings,
}

impl FirestoreClient {
    /// Starts the engine on a new queue worker. Must be called from within
    /// the async runtime that drives the worker.
    pub fn new(
        settings: FirestoreSettings,
        persistence: Persistence,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        datastore: Arc<dyn Datastore>,
    ) -> FirestoreResult<Self> {
        settings.validate()?;
        let (queue, runner) = AsyncQueue::new_live(settings.storage_retry_backoff.clone());
        let engine = SyncEngine::new(
            settings.clone(),
            persistence,
            connection,
            Arc::clone(&credentials),
            queue.clone(),
        );
        runner.spawn(engine);

        let user_queue = queue.clone();
        credentials.set_change_listener(Arc::new(move |user| {
            user_queue.enqueue_and_forget(move |engine: &mut SyncEngine| {
                if let Err(err) = engine.handle_credential_change(user) {
                    log::warn!(target: LOG_TARGET, "credential change failed: {err}");
                }
            });
        }));

        Ok(Self {
            inner: Arc::new(ClientInner {
                queue,
                datastore,
                settings,
            }),
        })
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.inner.settings
    }

    /// Whether [`terminate`](Self::terminate) was called.
    pub fn is_terminated(&self) -> bool {
        self.inner.queue.is_terminated()
    }

    /// Registers `observer` for snapshots of `query` until the returned
    /// registration is dropped.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> FirestoreResult<ListenerRegistration> {
        let id = self
            .inner
            .queue
            .enqueue(move |engine: &mut SyncEngine| engine.listen(query, options, observer))
            .await?;
        Ok(ListenerRegistration {
            queue: self.inner.queue.clone(),
            id: Some(id),
        })
    }

    /// Applies `mutations` locally right away; the returned future resolves
    /// when the backend acknowledges or rejects them.
    pub fn write(
        &self,
        mutations: Vec<Mutation>,
    ) -> impl Future<Output = FirestoreResult<()>> + Send + 'static {
        let (callback, pending) = deferred();
        self.inner
            .queue
            .enqueue_and_forget(move |engine: &mut SyncEngine| engine.write(mutations, callback));
        pending.wait()
    }

    /// Resolves once every write issued so far has been acknowledged or
    /// rejected.
    pub fn wait_for_pending_writes(
        &self,
    ) -> impl Future<Output = FirestoreResult<()>> + Send + 'static {
        let (callback, pending) = deferred();
        self.inner.queue.enqueue_and_forget(move |engine: &mut SyncEngine| {
            engine.register_pending_writes_callback(callback)
        });
        pending.wait()
    }

    pub async fn get_document_from_cache(
        &self,
        key: DocumentKey,
    ) -> FirestoreResult<Option<Document>> {
        self.inner
            .queue
            .enqueue(move |engine: &mut SyncEngine| engine.get_document_from_cache(&key))
            .await
    }

    pub async fn get_documents_from_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.inner
            .queue
            .enqueue(move |engine: &mut SyncEngine| engine.get_documents_from_cache(&query))
            .await
    }

    /// Reads `key` from the backend. The result is not cached.
    pub async fn get_document_from_server(
        &self,
        key: DocumentKey,
    ) -> FirestoreResult<Option<Document>> {
        self.ensure_running()?;
        let docs = self.inner.datastore.lookup(vec![key.clone()]).await?;
        match docs.into_iter().next() {
            Some(MaybeDocument::Document(doc)) => Ok(Some(doc)),
            Some(MaybeDocument::NoDocument(_)) => Ok(None),
            _ => Err(internal_error(format!("Lookup of {key} returned no document state"))),
        }
    }

    pub async fn get_documents_from_server(&self, query: Query) -> FirestoreResult<Vec<Document>> {
        self.ensure_running()?;
        self.inner.datastore.run_query(query).await
    }

    /// Runs `update_fn` as a transaction, retrying on contention up to the
    /// configured number of attempts.
    pub async fn run_transaction<T, F>(&self, update_fn: F) -> FirestoreResult<T>
    where
        F: for<'a> FnMut(&'a mut Transaction) -> BoxFuture<'a, FirestoreResult<T>>,
    {
        self.ensure_running()?;
        transaction::run_transaction(
            Arc::clone(&self.inner.datastore),
            self.inner.settings.backoff.clone(),
            self.inner.settings.max_transaction_attempts,
            update_fn,
        )
        .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner
            .queue
            .enqueue(|engine: &mut SyncEngine| engine.enable_network())
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner
            .queue
            .enqueue(|engine: &mut SyncEngine| engine.disable_network())
            .await
    }

    /// Shuts the engine down after the operations already queued. Later
    /// calls fail with `Cancelled`.
    pub fn terminate(&self) {
        self.inner
            .queue
            .enqueue_and_initiate_shutdown(|engine: &mut SyncEngine| engine.shutdown());
    }

    fn ensure_running(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            Err(crate::firestore::error::cancelled(
                "The client has already been terminated.",
            ))
        } else {
            Ok(())
        }
    }
}

/// Keeps a snapshot listener attached; dropping it removes the listener.
pub struct ListenerRegistration {
    queue: AsyncQueue<SyncEngine>,
    id: Option<ListenerId>,
}

impl ListenerRegistration {
    pub fn id(&self) -> Option<ListenerId> {
        self.id
    }

    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(id) = self.id.take() {
            self.queue.enqueue_and_forget(move |engine: &mut SyncEngine| {
                if let Err(err) = engine.unlisten(id) {
                    log::warn!(target: LOG_TARGET, "failed to remove listener {id}: {err}");
                }
            });
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}
