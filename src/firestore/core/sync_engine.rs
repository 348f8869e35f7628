//! Orchestrates the local store, the remote store and the listeners.
//!
//! The sync engine is the state owned by the client's [`AsyncQueue`]: every
//! user operation, stream callback and timer runs as a queue operation with
//! `&mut SyncEngine`, so none of the state below needs locking.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::firestore::core::event_manager::{
    EventManager, ListenOptions, ListenerId, QueryListener, SnapshotObserver,
};
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::{Query, TargetId, TargetIdGenerator, ViewSnapshot};
use crate::firestore::error::{
    cancelled, internal_error, unavailable, FirestoreError, FirestoreResult,
};
use crate::firestore::local::{
    LocalSerializer, LocalStore, LocalViewChanges, Persistence, QueryPurpose, ReferenceSet,
    TargetData,
};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument,
    MaybeDocumentMap, Mutation, MutationBatch, MutationBatchResult, NoDocument,
    SnapshotVersion, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{
    Connection, CredentialsProvider, JsonProtoSerializer, OfflineCause, OnlineState,
    RemoteEvent, RemoteInput, RemoteInputHandler, RemoteStore, RemoteStoreEvent, RemoteSyncer,
    TargetChange, User,
};
use crate::firestore::settings::FirestoreSettings;
use crate::firestore::util::{AsyncQueue, Deferred, DelayedOperation, TimerId};

const LOG_TARGET: &str = "firestore::sync_engine";

/// Sequence number of limbo resolution targets, which never reach the
/// target cache.
const LIMBO_SEQUENCE_NUMBER: i64 = -1;

/// A listened query and the view computing its snapshots.
struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Set once the resolution target reported the document, so the remote
    /// keys of the target contain it.
    received_document: bool,
}

/// Limbo documents are resolved by listening to them one by one, with at
/// most `max_concurrent` such listens active.
struct LimboTracker {
    max_concurrent: usize,
    enqueued: VecDeque<DocumentKey>,
    active_by_key: BTreeMap<DocumentKey, TargetId>,
    active_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets consider each key to be in limbo.
    document_refs: ReferenceSet,
    target_ids: TargetIdGenerator,
}

impl LimboTracker {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            enqueued: VecDeque::new(),
            active_by_key: BTreeMap::new(),
            active_by_target: BTreeMap::new(),
            document_refs: ReferenceSet::new(),
            target_ids: TargetIdGenerator::for_sync_engine(),
        }
    }
}

/// The local state the remote store reads, borrowed field by field so the
/// remote store itself can be borrowed mutably at the same time.
struct SyncerView<'a> {
    local_store: &'a LocalStore,
    query_views: &'a HashMap<String, QueryView>,
    queries_by_target: &'a BTreeMap<TargetId, Vec<Query>>,
    limbo_targets: &'a BTreeMap<TargetId, LimboResolution>,
}

impl RemoteSyncer for SyncerView<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(resolution) = self.limbo_targets.get(&target_id) {
            return if resolution.received_document {
                DocumentKeySet::new().insert(resolution.key.clone())
            } else {
                DocumentKeySet::new()
            };
        }
        let Some(queries) = self.queries_by_target.get(&target_id) else {
            return DocumentKeySet::new();
        };
        queries
            .iter()
            .filter_map(|query| self.query_views.get(&query.canonical_id()))
            .fold(DocumentKeySet::new(), |keys, query_view| {
                keys.union(query_view.view.synced_documents())
            })
    }

    fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> Option<MutationBatch> {
        self.local_store.next_mutation_batch(after_batch_id)
    }

    fn last_stream_token(&self) -> Vec<u8> {
        self.local_store.get_last_stream_token()
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.local_store.get_last_remote_snapshot_version()
    }
}

pub struct SyncEngine {
    settings: FirestoreSettings,
    queue: AsyncQueue<SyncEngine>,
    local_store: LocalStore,
    remote_store: RemoteStore,
    event_manager: EventManager,
    query_views: HashMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    limbo: LimboTracker,
    mutation_callbacks: BTreeMap<BatchId, Deferred<()>>,
    /// Waiters for all writes up to and including the batch id.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<Deferred<()>>>,
    current_user: User,
    credentials_initialized: bool,
    online_state: OnlineState,
    storage_probe: Option<DelayedOperation>,
    pending_remote_events: VecDeque<RemoteStoreEvent>,
    draining: bool,
    terminated: bool,
}

impl SyncEngine {
    /// Builds the engine that `queue` runs operations against. Remote
    /// callbacks are delivered through the same queue.
    pub fn new(
        settings: FirestoreSettings,
        persistence: Persistence,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        queue: AsyncQueue<SyncEngine>,
    ) -> Self {
        let current_user = match persistence.current_uid() {
            "" => User::unauthenticated(),
            uid => User::new(uid),
        };
        let remote_store = RemoteStore::new(
            &settings,
            connection,
            credentials,
            Arc::new(queue.clone()),
        );
        Self {
            limbo: LimboTracker::new(settings.max_concurrent_limbo_resolutions),
            settings,
            queue,
            local_store: LocalStore::new(persistence),
            remote_store,
            event_manager: EventManager::new(),
            query_views: HashMap::new(),
            queries_by_target: BTreeMap::new(),
            mutation_callbacks: BTreeMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            current_user,
            credentials_initialized: false,
            online_state: OnlineState::Unknown,
            storage_probe: None,
            pending_remote_events: VecDeque::new(),
            draining: false,
            terminated: false,
        }
    }

    /// An engine over in-memory persistence for the unauthenticated user.
    pub fn in_memory(
        settings: FirestoreSettings,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        queue: AsyncQueue<SyncEngine>,
    ) -> Self {
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(
            settings.database_id.clone(),
        ));
        let persistence = Persistence::new_in_memory(serializer, "");
        Self::new(settings, persistence, connection, credentials, queue)
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.settings
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Target ids of the documents currently being resolved out of limbo.
    pub fn active_limbo_targets(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.limbo.active_by_key.clone()
    }

    pub fn enqueued_limbo_resolutions(&self) -> Vec<DocumentKey> {
        self.limbo.enqueued.iter().cloned().collect()
    }

    /// Adds a listener for `query`. The first listener of a query allocates
    /// its target and starts listening to it remotely.
    pub fn listen(
        &mut self,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> FirestoreResult<ListenerId> {
        self.ensure_running()?;
        let initial_snapshot = if self.event_manager.is_listening(&query) {
            None
        } else {
            Some(self.listen_to_query(&query)?)
        };
        let listener_id = self.event_manager.next_listener_id();
        let listener = QueryListener::new(listener_id, query, options, observer);
        self.event_manager.add_listener(listener, initial_snapshot);
        self.drain_remote_events();
        Ok(listener_id)
    }

    /// Removes a listener. The query's target is released once no listener
    /// and no other query uses it.
    pub fn unlisten(&mut self, listener_id: ListenerId) -> FirestoreResult<()> {
        let Some(query) = self.event_manager.remove_listener(listener_id) else {
            return Ok(());
        };
        self.stop_listening_to_query(&query)
    }

    /// Queues `mutations` as one batch. `callback` settles when the server
    /// accepts or rejects the batch.
    pub fn write(&mut self, mutations: Vec<Mutation>, callback: Deferred<()>) {
        if let Err(err) = self.ensure_running() {
            callback.reject(err);
            return;
        }
        let result = match self.local_store.local_write(mutations) {
            Ok(result) => result,
            Err(err) => {
                callback.reject(self.observe_storage_error("Locally write mutations", err));
                return;
            }
        };
        log::debug!(target: LOG_TARGET, "queued write batch {}", result.batch_id);
        self.mutation_callbacks.insert(result.batch_id, callback);
        self.emit_new_snaps_and_notify_local_store(&result.changes, None);
        self.fill_write_pipeline();
    }

    /// Settles `callback` once every batch queued so far is acknowledged or
    /// rejected.
    pub fn register_pending_writes_callback(&mut self, callback: Deferred<()>) {
        if !self.remote_store.can_use_network() {
            log::debug!(
                target: LOG_TARGET,
                "the network is disabled; pending writes wait until it is enabled"
            );
        }
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id();
        if highest_batch_id == BATCH_ID_UNKNOWN {
            callback.resolve(());
            return;
        }
        self.pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(callback);
    }

    /// The cached document, `None` if it is known not to exist.
    pub fn get_document_from_cache(&self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        match self.local_store.read_document(key) {
            Some(MaybeDocument::Document(doc)) => Ok(Some(doc)),
            Some(MaybeDocument::NoDocument(_)) => Ok(None),
            _ => Err(unavailable(
                "Failed to get document from cache. (However, this document may exist on \
                 the server. Run again without reading from the cache to attempt to \
                 retrieve the document from the server.)",
            )),
        }
    }

    /// Runs `query` against the local cache, without listening to it.
    pub fn get_documents_from_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&as_maybe_documents(&result.documents), None);
        view.apply_changes(changes, false, None)
            .snapshot
            .ok_or_else(|| internal_error("A fresh view did not produce a snapshot"))
    }

    pub fn enable_network(&mut self) -> FirestoreResult<()> {
        self.ensure_running()?;
        self.with_remote(|remote, syncer| {
            remote.enable_network(OfflineCause::UserDisabled, syncer)
        });
        Ok(())
    }

    pub fn disable_network(&mut self) -> FirestoreResult<()> {
        self.ensure_running()?;
        self.with_remote(|remote, _| remote.disable_network(OfflineCause::UserDisabled));
        Ok(())
    }

    /// Restarts the streams with the new user's credentials and, when the
    /// user actually changed, switches to their mutation queue.
    pub fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()> {
        if self.terminated {
            return Ok(());
        }
        let user_changed = self.current_user != user;
        if !self.credentials_initialized {
            self.credentials_initialized = true;
            if !user_changed {
                return Ok(());
            }
        }
        log::debug!(target: LOG_TARGET, "credential change to {user}");
        self.current_user = user.clone();
        self.with_remote(|remote, _| remote.begin_credential_change());

        let mut outcome = Ok(());
        if user_changed {
            self.fail_pending_writes_callbacks(cancelled(
                "'waitForPendingWrites' promise is rejected due to a user change.",
            ));
            match self.local_store.handle_user_change(user.storage_key()) {
                Ok(result) => {
                    log::debug!(
                        target: LOG_TARGET,
                        "user change removed batches {:?}, added {:?}",
                        result.removed_batch_ids,
                        result.added_batch_ids
                    );
                    self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None);
                }
                Err(err) => outcome = Err(self.observe_storage_error("Handle user change", err)),
            }
        }

        self.with_remote(|remote, syncer| remote.finish_credential_change(syncer));
        outcome
    }

    /// Stops the network and cancels timers. Further operations fail.
    pub fn shutdown(&mut self) {
        if self.terminated {
            return;
        }
        log::debug!(target: LOG_TARGET, "shutting down");
        if let Some(probe) = self.storage_probe.take() {
            probe.cancel();
        }
        let events = self.remote_store.shutdown();
        log::debug!(
            target: LOG_TARGET,
            "dropping {} remote events on shutdown",
            events.len()
        );
        self.terminated = true;
    }

    fn ensure_running(&self) -> FirestoreResult<()> {
        if self.terminated {
            Err(cancelled("The client has already been terminated."))
        } else {
            Ok(())
        }
    }

    fn listen_to_query(&mut self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
            return Ok(query_view.view.compute_initial_snapshot());
        }
        let target_data = match self.local_store.allocate_target(query.to_target()) {
            Ok(target_data) => target_data,
            Err(err) => return Err(self.observe_storage_error("Allocate target", err)),
        };
        let snapshot = self.initialize_view_and_compute_snapshot(query, target_data.target_id)?;
        self.with_remote(|remote, _| remote.listen(target_data));
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: &Query,
        target_id: TargetId,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&as_maybe_documents(&result.documents), None);
        let synthesized = TargetChange {
            current: false,
            ..TargetChange::default()
        };
        let change = view.apply_changes(doc_changes, true, Some(&synthesized));
        self.update_tracked_limbos(target_id, change.limbo_changes);

        self.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        change
            .snapshot
            .ok_or_else(|| internal_error("A new view did not produce a snapshot"))
    }

    fn stop_listening_to_query(&mut self, query: &Query) -> FirestoreResult<()> {
        let Some(query_view) = self.query_views.remove(&query.canonical_id()) else {
            return Ok(());
        };
        let target_id = query_view.target_id;
        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|other| other != query);
                return Ok(());
            }
        }

        let released = self.local_store.release_target(target_id);
        self.with_remote(|remote, _| remote.unlisten(target_id));
        self.remove_and_cleanup_target(target_id, None);
        released.map_err(|err| self.observe_storage_error("Release target", err))
    }

    fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<FirestoreError>) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.event_manager.on_listen_error(&query, error.clone());
            }
        }

        for key in self.limbo.document_refs.remove_references_for_id(target_id) {
            if !self.limbo.document_refs.contains_key(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    fn fill_write_pipeline(&mut self) {
        self.with_remote(|remote, syncer| {
            let mut events = Vec::new();
            remote.fill_write_pipeline(syncer, &mut events);
            events
        });
    }

    /// Runs `op` against the remote store and processes what it raised.
    fn with_remote<F>(&mut self, op: F)
    where
        F: FnOnce(&mut RemoteStore, &dyn RemoteSyncer) -> Vec<RemoteStoreEvent>,
    {
        let syncer = SyncerView {
            local_store: &self.local_store,
            query_views: &self.query_views,
            queries_by_target: &self.queries_by_target,
            limbo_targets: &self.limbo.active_by_target,
        };
        let events = op(&mut self.remote_store, &syncer);
        self.pending_remote_events.extend(events);
        self.drain_remote_events();
    }

    /// Handles remote store events in order. Events raised while handling
    /// one are appended and handled by the outermost call.
    fn drain_remote_events(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        while let Some(event) = self.pending_remote_events.pop_front() {
            self.handle_remote_store_event(event);
        }
        self.draining = false;
    }

    fn handle_remote_store_event(&mut self, event: RemoteStoreEvent) {
        match event {
            RemoteStoreEvent::RemoteEvent(event) => self.apply_remote_event(event),
            RemoteStoreEvent::ListenRejected { target_id, error } => {
                self.reject_listen(target_id, error)
            }
            RemoteStoreEvent::WriteAcknowledged(result) => self.apply_successful_write(result),
            RemoteStoreEvent::WriteRejected { batch_id, error } => {
                self.reject_failed_write(batch_id, error)
            }
            RemoteStoreEvent::OnlineStateChanged(state) => self.apply_online_state_change(state),
            RemoteStoreEvent::StreamTokenChanged(token) => {
                if let Err(err) = self.local_store.set_last_stream_token(token) {
                    self.observe_storage_error("Set last stream token", err);
                }
            }
        }
    }

    fn apply_remote_event(&mut self, event: RemoteEvent) {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.limbo.active_by_target.get_mut(target_id) else {
                continue;
            };
            if change.document_change_count() > 1 {
                log::error!(
                    target: LOG_TARGET,
                    "limbo resolution target {target_id} changed more than one document"
                );
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    log::error!(
                        target: LOG_TARGET,
                        "limbo document {} modified before it was received",
                        resolution.key
                    );
                }
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }

        match self.local_store.apply_remote_event(&event) {
            Ok(changes) => self.emit_new_snaps_and_notify_local_store(&changes, Some(&event)),
            Err(err) => {
                self.observe_storage_error("Apply remote event", err);
            }
        }
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) {
        if let Some(key) = self
            .limbo
            .active_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone())
        {
            // The document could not be resolved, most likely for lack of
            // permission. Treat it as deleted so it leaves limbo.
            log::debug!(
                target: LOG_TARGET,
                "limbo resolution for {key} rejected: {error}"
            );
            self.remove_limbo_target(&key);
            let mut event = RemoteEvent::new(SnapshotVersion::min());
            event.document_updates = MaybeDocumentMap::new().insert(
                key.clone(),
                MaybeDocument::NoDocument(NoDocument::new(key.clone(), SnapshotVersion::min())),
            );
            event.resolved_limbo_documents = DocumentKeySet::new().insert(key);
            self.apply_remote_event(event);
            return;
        }

        if let Err(err) = self.local_store.release_target(target_id) {
            self.observe_storage_error("Release rejected target", err);
        }
        self.remove_and_cleanup_target(target_id, Some(error));
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) {
        let batch_id = result.batch.batch_id;
        match self.local_store.acknowledge_batch(&result) {
            Ok(changes) => {
                self.settle_user_callback(batch_id, Ok(()));
                self.trigger_pending_writes_callbacks(batch_id);
                self.emit_new_snaps_and_notify_local_store(&changes, None);

                // The batch has left the queue, so the freed slot takes the next one.
                self.fill_write_pipeline();
            }
            Err(err) => {
                self.observe_storage_error("Acknowledge batch", err);
            }
        }
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) {
        match self.local_store.reject_batch(batch_id) {
            Ok(changes) => {
                self.settle_user_callback(batch_id, Err(error));
                self.trigger_pending_writes_callbacks(batch_id);
                self.emit_new_snaps_and_notify_local_store(&changes, None);

                self.fill_write_pipeline();
            }
            Err(err) => {
                self.observe_storage_error("Reject batch", err);
            }
        }
    }

    fn settle_user_callback(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        match self.mutation_callbacks.remove(&batch_id) {
            Some(callback) => callback.settle(result),
            None => log::debug!(
                target: LOG_TARGET,
                "no callback for batch {batch_id}, it was written by an earlier session"
            ),
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        let later = self.pending_writes_callbacks.split_off(&(batch_id + 1));
        let settled = std::mem::replace(&mut self.pending_writes_callbacks, later);
        for callback in settled.into_values().flatten() {
            callback.resolve(());
        }
    }

    fn fail_pending_writes_callbacks(&mut self, error: FirestoreError) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            callback.reject(error.clone());
        }
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        let mut snapshots = Vec::new();
        for query_view in self.query_views.values_mut() {
            let change = query_view.view.apply_online_state_change(online_state);
            if !change.limbo_changes.is_empty() {
                log::debug!(
                    target: LOG_TARGET,
                    "online state change produced limbo changes for target {}",
                    query_view.target_id
                );
            }
            snapshots.extend(change.snapshot);
        }
        self.event_manager.on_view_snapshots(snapshots);
        self.event_manager.handle_online_state_change(online_state);
    }

    /// Recomputes every view against `changes` and raises the resulting
    /// snapshots.
    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        changes: &MaybeDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut limbo_changes = Vec::new();

        for query_view in self.query_views.values_mut() {
            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                // The limit window lost documents; recompute from the whole
                // cache instead of the documents that changed.
                match self.local_store.execute_query(&query_view.query, false) {
                    Ok(result) => {
                        doc_changes = query_view.view.compute_doc_changes(
                            &as_maybe_documents(&result.documents),
                            Some(doc_changes),
                        );
                    }
                    Err(err) => {
                        log::error!(
                            target: LOG_TARGET,
                            "refilling {} failed: {err}",
                            query_view.query.canonical_id()
                        );
                        continue;
                    }
                }
            }
            let target_change =
                remote_event.and_then(|event| event.target_changes.get(&query_view.target_id));
            let change = query_view.view.apply_changes(doc_changes, true, target_change);
            limbo_changes.push((query_view.target_id, change.limbo_changes));
            if let Some(snapshot) = change.snapshot {
                view_changes.push(LocalViewChanges {
                    target_id: query_view.target_id,
                    from_cache: snapshot.from_cache,
                });
                snapshots.push(snapshot);
            }
        }

        self.event_manager.on_view_snapshots(snapshots);
        self.local_store.notify_local_view_changes(&view_changes);
        for (target_id, changes) in limbo_changes {
            self.update_tracked_limbos(target_id, changes);
        }
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo.document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!(target: LOG_TARGET, "document {key} left limbo");
                    self.limbo.document_refs.remove_reference(&key, target_id);
                    if !self.limbo.document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.limbo.active_by_key.contains_key(&key) || self.limbo.enqueued.contains(&key) {
            return;
        }
        log::debug!(target: LOG_TARGET, "new document in limbo: {key}");
        self.limbo.enqueued.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    /// Starts queued limbo resolutions while below the concurrency limit.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.limbo.active_by_key.len() < self.limbo.max_concurrent {
            let Some(key) = self.limbo.enqueued.pop_front() else {
                break;
            };
            let target_id = self.limbo.target_ids.next();
            self.limbo.active_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.limbo.active_by_key.insert(key.clone(), target_id);
            let target = Query::new(key.path().clone()).to_target();
            let target_data = TargetData::new(
                target,
                target_id,
                QueryPurpose::LimboResolution,
                LIMBO_SEQUENCE_NUMBER,
            );
            self.with_remote(|remote, _| remote.listen(target_data));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.limbo.enqueued.retain(|queued| queued != key);
        let Some(target_id) = self.limbo.active_by_key.remove(key) else {
            return;
        };
        self.limbo.active_by_target.remove(&target_id);
        self.with_remote(|remote, _| remote.unlisten(target_id));
        self.pump_enqueued_limbo_resolutions();
    }

    /// Logs a failed local store operation. A retryable storage failure takes
    /// the client offline until storage works again. Returns the error for
    /// callers that report it.
    fn observe_storage_error(&mut self, operation: &str, err: FirestoreError) -> FirestoreError {
        if err.is_retryable_storage_error() {
            log::warn!(
                target: LOG_TARGET,
                "{operation} failed, it had no effect: {err}"
            );
            self.degrade_to_offline();
        } else {
            log::error!(target: LOG_TARGET, "{operation} failed: {err}");
        }
        err
    }

    fn degrade_to_offline(&mut self) {
        if self.remote_store.is_offline_because(OfflineCause::StorageFailed) {
            return;
        }
        log::warn!(
            target: LOG_TARGET,
            "storage is unavailable, disabling the network until it recovers"
        );
        self.with_remote(|remote, _| remote.disable_network(OfflineCause::StorageFailed));
        self.storage_probe = Some(self.queue.enqueue_after_delay(
            TimerId::StorageProbe,
            self.settings.storage_probe_interval,
            |engine: &mut SyncEngine| {
                let queue = engine.queue.clone();
                queue.enqueue_retryable(SyncEngine::probe_storage);
            },
        ));
    }

    /// Fails with the storage error while storage is still unavailable, so
    /// the queue retries it with backoff.
    fn probe_storage(&mut self) -> FirestoreResult<()> {
        if self.terminated {
            return Ok(());
        }
        self.local_store.probe_storage()?;
        log::warn!(target: LOG_TARGET, "storage is available again, re-enabling the network");
        self.storage_probe = None;
        self.with_remote(|remote, syncer| {
            remote.enable_network(OfflineCause::StorageFailed, syncer)
        });
        Ok(())
    }
}

impl RemoteInputHandler for SyncEngine {
    fn handle_remote_input(&mut self, input: RemoteInput) {
        if self.terminated {
            log::debug!(target: LOG_TARGET, "ignoring remote input after shutdown");
            return;
        }
        self.with_remote(|remote, syncer| remote.handle_remote_input(input, syncer));
    }
}

fn as_maybe_documents(documents: &DocumentMap) -> MaybeDocumentMap {
    documents
        .iter()
        .map(|(key, doc)| (key.clone(), MaybeDocument::Document(doc.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{FilterOperator, OrderDirection};
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::{FailingStorageEngine, MemoryStorageEngine};
    use crate::firestore::model::FieldPath;
    use crate::firestore::remote::{
        EmptyCredentialsProvider, MockConnection, MockStream, StreamKind,
    };
    use crate::firestore::util::{deferred, ManualDriver, Pending};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use serde_json::{json, Value as JsonValue};
    use std::sync::Mutex;

    type Received = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

    struct Harness {
        engine: SyncEngine,
        driver: ManualDriver<SyncEngine>,
        connection: MockConnection,
        serializer: JsonProtoSerializer,
    }

    impl Harness {
        fn new() -> Self {
            let settings = FirestoreSettings::default();
            let serializer = LocalSerializer::new(JsonProtoSerializer::new(
                settings.database_id.clone(),
            ));
            Self::with_persistence(settings, Persistence::new_in_memory(serializer, ""))
        }

        fn with_persistence(settings: FirestoreSettings, persistence: Persistence) -> Self {
            let (queue, driver) = AsyncQueue::manual(settings.storage_retry_backoff.clone());
            let connection = MockConnection::new();
            let serializer = JsonProtoSerializer::new(settings.database_id.clone());
            let engine = SyncEngine::new(
                settings,
                persistence,
                Arc::new(connection.clone()),
                Arc::new(EmptyCredentialsProvider::new()),
                queue,
            );
            Self {
                engine,
                driver,
                connection,
                serializer,
            }
        }

        fn run(&mut self) {
            self.driver.run_pending(&mut self.engine);
        }

        fn listen(&mut self, query: &Query, options: ListenOptions) -> (ListenerId, Received) {
            let received: Received = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&received);
            let observer: SnapshotObserver =
                Arc::new(move |result| sink.lock().unwrap().push(result));
            let id = self.engine.listen(query.clone(), options, observer).unwrap();
            self.run();
            (id, received)
        }

        fn write(&mut self, mutation: Mutation) -> Pending<()> {
            let (callback, pending) = deferred();
            self.engine.write(vec![mutation], callback);
            self.run();
            pending
        }

        /// Opens the most recent stream of `kind`.
        fn open(&mut self, kind: StreamKind) -> MockStream {
            self.run();
            let stream = self.connection.last_stream(kind).unwrap();
            stream.open();
            self.run();
            stream
        }

        fn respond(&mut self, stream: &MockStream, messages: Vec<JsonValue>) {
            for message in messages {
                stream.respond(message);
            }
            self.run();
        }

        fn doc_message(&self, path: &str, x: i64, micros: i64, targets: &[TargetId]) -> JsonValue {
            json!({"documentChange": {
                "document": {
                    "name": self.serializer.document_name(&key(path)),
                    "fields": {"x": {"integerValue": x.to_string()}},
                    "updateTime": timestamp(micros),
                },
                "targetIds": targets,
            }})
        }

        fn remove_message(&self, path: &str, targets: &[TargetId]) -> JsonValue {
            json!({"documentRemove": {
                "document": self.serializer.document_name(&key(path)),
                "removedTargetIds": targets,
            }})
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn timestamp(micros: i64) -> String {
        let seconds = micros / 1_000_000;
        format!("1970-01-01T00:00:{seconds:02}Z")
    }

    fn data(field: &str, value: FirestoreValue) -> MapValue {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), value);
        data
    }

    fn target_message(kind: &str, targets: &[TargetId]) -> JsonValue {
        json!({"targetChange": {"targetChangeType": kind, "targetIds": targets}})
    }

    fn current_message(targets: &[TargetId]) -> JsonValue {
        json!({"targetChange": {
            "targetChangeType": "CURRENT",
            "targetIds": targets,
            "resumeToken": "AQ=="
        }})
    }

    fn global_snapshot(micros: i64) -> JsonValue {
        json!({"targetChange": {"readTime": timestamp(micros)}})
    }

    fn keys_of(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot
            .docs
            .keys()
            .map(|key| key.path().canonical_string())
            .collect()
    }

    fn last_snapshot(received: &Received) -> ViewSnapshot {
        received
            .lock()
            .unwrap()
            .last()
            .unwrap()
            .as_ref()
            .unwrap()
            .clone()
    }

    fn sent_targets(stream: &MockStream, field: &str) -> Vec<JsonValue> {
        stream
            .sent()
            .iter()
            .filter_map(|frame| frame.get(field).cloned())
            .collect()
    }

    /// Listens to `rooms` and serves `docs` as its synced result.
    fn serve_rooms(
        harness: &mut Harness,
        docs: &[(&str, i64)],
    ) -> (ListenerId, Received, MockStream) {
        let query = Query::at_path("rooms").unwrap();
        let options = ListenOptions::default().with_metadata_changes();
        let (id, received) = harness.listen(&query, options);
        let stream = harness.open(StreamKind::Watch);
        let mut messages = vec![target_message("ADD", &[2])];
        for (path, x) in docs {
            messages.push(harness.doc_message(path, *x, 1_000_000, &[2]));
        }
        messages.push(current_message(&[2]));
        messages.push(global_snapshot(2_000_000));
        harness.respond(&stream, messages);
        (id, received, stream)
    }

    #[test]
    fn offline_writes_are_visible_and_acknowledged_on_reconnect() {
        let mut harness = Harness::new();
        harness.engine.disable_network().unwrap();

        let rooms_1 = key("rooms/1");
        let pending = harness.write(Mutation::set(
            rooms_1.clone(),
            data("name", FirestoreValue::from_string("a")),
        ));
        let local = harness.engine.get_document_from_cache(&rooms_1).unwrap().unwrap();
        assert_eq!(
            local.field(&FieldPath::from_dot_separated("name").unwrap()),
            Some(&FirestoreValue::from_string("a"))
        );
        assert!(local.has_local_mutations());
        assert_eq!(harness.connection.open_count(StreamKind::Write), 0);

        harness.engine.enable_network().unwrap();
        let stream = harness.open(StreamKind::Write);
        harness.respond(&stream, vec![json!({"streamToken": "AQ=="})]);
        assert!(stream.sent().iter().any(|frame| frame.get("writes").is_some()));

        harness.respond(
            &stream,
            vec![json!({
                "streamToken": "Ag==",
                "commitTime": timestamp(5_000_000),
                "writeResults": [{}]
            })],
        );
        assert!(matches!(pending.try_take(), Some(Ok(()))));

        let acked = harness.engine.get_document_from_cache(&rooms_1).unwrap().unwrap();
        assert!(!acked.has_local_mutations());
        assert_eq!(acked.version(), SnapshotVersion::from_micros(5_000_000));
        assert_eq!(harness.engine.local_store().get_last_stream_token(), vec![2u8]);
    }

    #[test]
    fn limited_queries_ignore_writes_outside_the_window() {
        let mut harness = Harness::new();
        let docs = [("rooms/a", 1), ("rooms/b", 4), ("rooms/c", 5), ("rooms/d", 9)];
        serve_rooms(&mut harness, &docs);

        let limited = Query::at_path("rooms")
            .unwrap()
            .filter("x", FilterOperator::GreaterThan, FirestoreValue::from_integer(3))
            .unwrap()
            .order_by("x", OrderDirection::Ascending)
            .unwrap()
            .limit_to_first(2)
            .unwrap();
        let (_, received) = harness.listen(&limited, ListenOptions::default());
        assert_eq!(keys_of(&last_snapshot(&received)), vec!["rooms/b", "rooms/c"]);
        let raised = received.lock().unwrap().len();

        harness.write(Mutation::set(
            key("rooms/d"),
            data("x", FirestoreValue::from_integer(2)),
        ));
        assert_eq!(received.lock().unwrap().len(), raised);
    }

    #[test]
    fn existence_filter_mismatch_resets_the_target() {
        let mut harness = Harness::new();
        let (_, received, stream) = serve_rooms(&mut harness, &[("rooms/a", 1), ("rooms/b", 2)]);
        let synced = last_snapshot(&received);
        assert!(!synced.from_cache);
        assert_eq!(synced.docs.len(), 2);
        let before = harness.engine.local_store().target_data_for_id(2).unwrap();
        assert_eq!(before.resume_token, vec![1u8]);
        assert!(!before.last_limbo_free_snapshot_version.is_min());

        harness.respond(
            &stream,
            vec![
                json!({"filter": {"targetId": 2, "count": 1}}),
                global_snapshot(3_000_000),
            ],
        );
        let reset = last_snapshot(&received);
        assert!(reset.from_cache);
        let active = harness.engine.local_store().target_data_for_id(2).unwrap();
        assert!(active.resume_token.is_empty());
        assert!(active.last_limbo_free_snapshot_version.is_min());
        let cached = harness
            .engine
            .local_store()
            .persistence()
            .target_cache()
            .target_data_for_id(2)
            .unwrap();
        assert!(cached.resume_token.is_empty());
        // The target is listened to again from scratch.
        assert_eq!(sent_targets(&stream, "addTarget").len(), 2);
        assert_eq!(sent_targets(&stream, "removeTarget"), vec![json!(2)]);
    }

    #[test]
    fn listeners_on_the_same_query_share_a_target() {
        let mut harness = Harness::new();
        let query = Query::at_path("rooms").unwrap();
        let (first, first_received) = harness.listen(&query, ListenOptions::default());
        let (second, second_received) = harness.listen(&query, ListenOptions::default());
        let stream = harness.open(StreamKind::Watch);
        assert_eq!(sent_targets(&stream, "addTarget").len(), 1);

        harness.engine.unlisten(first).unwrap();
        harness.run();
        assert!(sent_targets(&stream, "removeTarget").is_empty());

        let messages = vec![
            target_message("ADD", &[2]),
            harness.doc_message("rooms/a", 1, 1_000_000, &[2]),
            current_message(&[2]),
            global_snapshot(2_000_000),
        ];
        harness.respond(&stream, messages);
        assert!(first_received.lock().unwrap().is_empty());
        assert_eq!(keys_of(&last_snapshot(&second_received)), vec!["rooms/a"]);

        harness.engine.unlisten(second).unwrap();
        harness.run();
        assert_eq!(sent_targets(&stream, "removeTarget"), vec![json!(2)]);
        assert!(harness.engine.local_store().target_data_for_id(2).is_none());
        let cache = harness.engine.local_store().persistence().target_cache();
        assert!(cache.target_data_for_id(2).is_none());
        assert!(cache.get_matching_keys_for_target_id(2).is_empty());
    }

    #[test]
    fn limbo_documents_are_resolved_with_document_targets() {
        let mut harness = Harness::new();
        let (_, received, stream) = serve_rooms(&mut harness, &[("rooms/a", 1), ("rooms/b", 2)]);

        let messages = vec![
            harness.remove_message("rooms/b", &[2]),
            global_snapshot(3_000_000),
        ];
        harness.respond(&stream, messages);
        assert!(last_snapshot(&received).from_cache);
        let limbo_target = harness.engine.active_limbo_targets()[&key("rooms/b")];
        assert_eq!(limbo_target % 2, 1);
        let added = sent_targets(&stream, "addTarget");
        assert_eq!(added.last().unwrap()["targetId"], json!(limbo_target));
        assert!(added.last().unwrap().get("documents").is_some());

        harness.respond(
            &stream,
            vec![
                target_message("ADD", &[limbo_target]),
                current_message(&[limbo_target]),
                global_snapshot(4_000_000),
            ],
        );
        let resolved = last_snapshot(&received);
        assert_eq!(keys_of(&resolved), vec!["rooms/a"]);
        assert!(!resolved.from_cache);
        assert!(harness.engine.active_limbo_targets().is_empty());
        assert!(sent_targets(&stream, "removeTarget").contains(&json!(limbo_target)));
    }

    #[test]
    fn limbo_resolutions_respect_the_concurrency_limit() {
        let settings = FirestoreSettings::default().with_max_concurrent_limbo_resolutions(1);
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(
            settings.database_id.clone(),
        ));
        let persistence = Persistence::new_in_memory(serializer, "");
        let mut harness = Harness::with_persistence(settings, persistence);
        let (_, _, stream) = serve_rooms(
            &mut harness,
            &[("rooms/a", 1), ("rooms/b", 2), ("rooms/c", 3)],
        );

        let messages = vec![
            harness.remove_message("rooms/b", &[2]),
            harness.remove_message("rooms/c", &[2]),
            global_snapshot(3_000_000),
        ];
        harness.respond(&stream, messages);
        assert_eq!(harness.engine.active_limbo_targets().len(), 1);
        assert_eq!(harness.engine.enqueued_limbo_resolutions().len(), 1);
    }

    #[test]
    fn rejected_listens_fail_their_listeners() {
        let mut harness = Harness::new();
        let query = Query::at_path("rooms").unwrap();
        let (_, received) = harness.listen(&query, ListenOptions::default());
        let stream = harness.open(StreamKind::Watch);

        harness.respond(
            &stream,
            vec![json!({"targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": {"code": 7, "message": "denied"}
            }})],
        );
        let received = received.lock().unwrap();
        let error = received.last().unwrap().as_ref().unwrap_err();
        assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
        assert!(harness.engine.local_store().target_data_for_id(2).is_none());
    }

    #[test]
    fn rejected_writes_are_reverted() {
        let mut harness = Harness::new();
        let query = Query::at_path("rooms").unwrap();
        let (_, received) = harness.listen(&query, ListenOptions::default());
        let pending = harness.write(Mutation::set(
            key("rooms/a"),
            data("x", FirestoreValue::from_integer(1)),
        ));
        assert_eq!(keys_of(&last_snapshot(&received)), vec!["rooms/a"]);

        let stream = harness.open(StreamKind::Write);
        harness.respond(&stream, vec![json!({"streamToken": "AQ=="})]);
        stream.fail(Some(permission_denied("no writes")));
        harness.run();

        let Some(Err(error)) = pending.try_take() else {
            panic!("the write should have been rejected");
        };
        assert_eq!(error.code, FirestoreErrorCode::PermissionDenied);
        assert!(keys_of(&last_snapshot(&received)).is_empty());
    }

    #[test]
    fn pending_writes_waiters_resolve_after_acknowledgement() {
        let mut harness = Harness::new();
        let (callback, idle) = deferred();
        harness.engine.register_pending_writes_callback(callback);
        assert!(matches!(idle.try_take(), Some(Ok(()))));

        harness.write(Mutation::set(key("rooms/a"), MapValue::empty()));
        let (callback, waiting) = deferred();
        harness.engine.register_pending_writes_callback(callback);
        assert!(waiting.try_take().is_none());

        let stream = harness.open(StreamKind::Write);
        harness.respond(
            &stream,
            vec![
                json!({"streamToken": "AQ=="}),
                json!({
                    "streamToken": "Ag==",
                    "commitTime": timestamp(5_000_000),
                    "writeResults": [{}]
                }),
            ],
        );
        assert!(matches!(waiting.try_take(), Some(Ok(()))));
    }

    #[test]
    fn acknowledged_writes_are_sent_once() {
        let mut harness = Harness::new();
        let pending = harness.write(Mutation::set(
            key("rooms/a"),
            data("x", FirestoreValue::from_integer(1)),
        ));
        let stream = harness.open(StreamKind::Write);
        harness.respond(&stream, vec![json!({"streamToken": "AQ=="})]);
        assert_eq!(sent_targets(&stream, "writes").len(), 1);

        harness.respond(
            &stream,
            vec![json!({
                "streamToken": "Ag==",
                "commitTime": timestamp(5_000_000),
                "writeResults": [{}]
            })],
        );
        assert!(matches!(pending.try_take(), Some(Ok(()))));
        assert_eq!(sent_targets(&stream, "writes").len(), 1);
        assert_eq!(harness.engine.remote_store().pending_write_count(), 0);

        // A later batch follows the acknowledged one, not a copy of it.
        harness.write(Mutation::set(
            key("rooms/b"),
            data("x", FirestoreValue::from_integer(2)),
        ));
        let writes = sent_targets(&stream, "writes");
        assert_eq!(writes.len(), 2);
        assert!(writes[1][0]["update"]["name"]
            .as_str()
            .unwrap()
            .ends_with("rooms/b"));
    }

    #[test]
    fn user_changes_reject_pending_writes_waiters() {
        let mut harness = Harness::new();
        harness.engine.handle_credential_change(User::unauthenticated()).unwrap();
        harness.write(Mutation::set(key("rooms/a"), MapValue::empty()));
        let (callback, waiting) = deferred();
        harness.engine.register_pending_writes_callback(callback);

        harness.engine.handle_credential_change(User::new("ada")).unwrap();
        harness.run();
        let Some(Err(error)) = waiting.try_take() else {
            panic!("the waiter should have been rejected");
        };
        assert_eq!(error.code, FirestoreErrorCode::Cancelled);
        assert_eq!(harness.engine.local_store().current_uid(), "ada");
        // Ada has no queued writes.
        assert!(harness
            .engine
            .get_document_from_cache(&key("rooms/a"))
            .is_err());
    }

    #[test]
    fn storage_failures_take_the_client_offline_until_a_probe_succeeds() {
        let settings = FirestoreSettings::default();
        let engine = Arc::new(FailingStorageEngine::new(MemoryStorageEngine::new()));
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(
            settings.database_id.clone(),
        ));
        let persistence = Persistence::open(engine.clone(), serializer, "").unwrap();
        let mut harness = Harness::with_persistence(settings, persistence);

        let query = Query::at_path("rooms").unwrap();
        let (_, received) = harness.listen(&query, ListenOptions::default());
        let stream = harness.open(StreamKind::Watch);
        engine.fail_next_commits(2);
        let messages = vec![
            target_message("ADD", &[2]),
            harness.doc_message("rooms/a", 1, 1_000_000, &[2]),
            current_message(&[2]),
            global_snapshot(2_000_000),
        ];
        harness.respond(&stream, messages);

        assert!(harness
            .engine
            .remote_store()
            .is_offline_because(OfflineCause::StorageFailed));
        assert_eq!(harness.engine.online_state(), OnlineState::Offline);
        assert!(received.lock().unwrap().iter().all(|result| result
            .as_ref()
            .map_or(false, |snapshot| snapshot.docs.is_empty())));

        // The first probe fails and is retried with backoff.
        assert!(harness.driver.run_delayed(&mut harness.engine, TimerId::StorageProbe));
        assert!(!harness.engine.remote_store().can_use_network());
        harness
            .driver
            .run_delayed(&mut harness.engine, TimerId::AsyncQueueRetry);
        assert!(harness.engine.remote_store().can_use_network());
    }

    #[test]
    fn cache_reads_distinguish_missing_and_unknown_documents() {
        let mut harness = Harness::new();
        assert!(harness
            .engine
            .get_document_from_cache(&key("rooms/unknown"))
            .is_err());

        harness.write(Mutation::delete(key("rooms/gone")));
        assert_eq!(
            harness.engine.get_document_from_cache(&key("rooms/gone")).unwrap(),
            None
        );

        harness.write(Mutation::set(
            key("rooms/a"),
            data("x", FirestoreValue::from_integer(1)),
        ));
        let snapshot = harness
            .engine
            .get_documents_from_cache(&Query::at_path("rooms").unwrap())
            .unwrap();
        assert_eq!(keys_of(&snapshot), vec!["rooms/a"]);
        assert!(snapshot.from_cache);
        assert!(snapshot.has_pending_writes());
    }

    #[test]
    fn shutdown_rejects_further_operations() {
        let mut harness = Harness::new();
        harness.engine.shutdown();
        assert!(harness.engine.is_terminated());
        let (callback, pending) = deferred();
        harness.engine.write(vec![Mutation::delete(key("rooms/a"))], callback);
        let Some(Err(error)) = pending.try_take() else {
            panic!("writes after shutdown should fail");
        };
        assert_eq!(error.code, FirestoreErrorCode::Cancelled);
    }
}
