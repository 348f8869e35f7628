//! Watch and write stream orchestration.
//!
//! The remote store keeps the set of targets the client listens to and the
//! pipeline of batches sent to the backend. It owns both streams and turns
//! their traffic into [`RemoteStoreEvent`]s for the sync engine. It runs on
//! the client's serial queue and never blocks.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::firestore::core::TargetId;
use crate::firestore::error::{
    is_permanent_error, is_permanent_write_error, unavailable, FirestoreError,
};
use crate::firestore::local::{QueryPurpose, TargetData};
use crate::firestore::model::{
    DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::connection::{Connection, StreamKind};
use crate::firestore::remote::credentials::CredentialsProvider;
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::persistent_stream::{
    PersistentStream, RemoteInput, RemoteScheduler, RemoteTimer, StreamSignal, StreamState,
    WatchStream, WriteStream, WriteStreamResponse,
};
use crate::firestore::remote::remote_syncer::{RemoteStoreEvent, RemoteSyncer};
use crate::firestore::remote::serializer::{JsonProtoSerializer, WriteResponse};
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{
    TargetMetadataProvider, WatchChangeAggregator,
};
use crate::firestore::settings::FirestoreSettings;

const LOG_TARGET: &str = "firestore::remote_store";

/// Why the network is currently disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OfflineCause {
    UserDisabled,
    /// Local storage failed; the client probes it until it recovers.
    StorageFailed,
    CredentialChange,
    Shutdown,
}

struct ListenTargets<'a> {
    targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargets<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer.remote_keys_for_target(target_id)
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }
}

pub struct RemoteStore {
    listen_targets: BTreeMap<TargetId, TargetData>,
    aggregator: WatchChangeAggregator,
    write_pipeline: VecDeque<MutationBatch>,
    max_pending_writes: usize,
    offline_causes: BTreeSet<OfflineCause>,
    online_state_tracker: OnlineStateTracker,
    watch_stream: WatchStream,
    write_stream: WriteStream,
}

impl RemoteStore {
    pub fn new(
        settings: &FirestoreSettings,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        scheduler: Arc<dyn RemoteScheduler>,
    ) -> Self {
        let serializer = JsonProtoSerializer::new(settings.database_id.clone());
        let stream = |kind| {
            PersistentStream::new(
                kind,
                Arc::clone(&connection),
                Arc::clone(&credentials),
                Arc::clone(&scheduler),
                settings.backoff.clone(),
                settings.stream_idle_timeout,
            )
        };
        Self {
            listen_targets: BTreeMap::new(),
            aggregator: WatchChangeAggregator::new(),
            write_pipeline: VecDeque::new(),
            max_pending_writes: settings.max_pending_writes,
            offline_causes: BTreeSet::new(),
            online_state_tracker: OnlineStateTracker::new(
                Arc::clone(&scheduler),
                settings.online_state_timeout,
            ),
            watch_stream: WatchStream::new(stream(StreamKind::Watch), serializer.clone()),
            write_stream: WriteStream::new(stream(StreamKind::Write), serializer),
        }
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn is_offline_because(&self, cause: OfflineCause) -> bool {
        self.offline_causes.contains(&cause)
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn pending_write_count(&self) -> usize {
        self.write_pipeline.len()
    }

    pub fn is_listening(&self, target_id: TargetId) -> bool {
        self.listen_targets.contains_key(&target_id)
    }

    /// Lifts `cause`. Streams restart once no cause is left.
    pub fn enable_network(
        &mut self,
        cause: OfflineCause,
        syncer: &dyn RemoteSyncer,
    ) -> Vec<RemoteStoreEvent> {
        let mut events = Vec::new();
        self.offline_causes.remove(&cause);
        if self.can_use_network() {
            log::debug!(target: LOG_TARGET, "network enabled");
            if self.should_start_watch_stream() {
                self.start_watch_stream(&mut events);
            } else {
                self.set_online_state(OnlineState::Unknown, &mut events);
            }
            self.fill_write_pipeline(syncer, &mut events);
        }
        events
    }

    /// Stops both streams and forgets unacknowledged writes in flight. The
    /// batches stay in the mutation queue and are sent again later.
    pub fn disable_network(&mut self, cause: OfflineCause) -> Vec<RemoteStoreEvent> {
        let mut events = Vec::new();
        self.offline_causes.insert(cause);
        log::debug!(target: LOG_TARGET, "network disabled: {cause:?}");
        self.disable_network_internal(&mut events);
        let state = match cause {
            OfflineCause::UserDisabled | OfflineCause::StorageFailed => OnlineState::Offline,
            OfflineCause::CredentialChange | OfflineCause::Shutdown => OnlineState::Unknown,
        };
        self.set_online_state(state, &mut events);
        events
    }

    pub fn shutdown(&mut self) -> Vec<RemoteStoreEvent> {
        log::debug!(target: LOG_TARGET, "shutting down");
        self.disable_network(OfflineCause::Shutdown)
    }

    /// Starts listening to `target_data` unless its target is already
    /// listened to.
    pub fn listen(&mut self, target_data: TargetData) -> Vec<RemoteStoreEvent> {
        let mut events = Vec::new();
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return events;
        }
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream(&mut events);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&target_data, &mut events);
        }
        events
    }

    pub fn unlisten(&mut self, target_id: TargetId) -> Vec<RemoteStoreEvent> {
        let mut events = Vec::new();
        if self.listen_targets.remove(&target_id).is_none() {
            log::debug!(target: LOG_TARGET, "unlisten of unknown target {target_id}");
            return events;
        }

        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id, &mut events);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // Without a listen there is no way to tell if the stream is
                // healthy.
                self.set_online_state(OnlineState::Unknown, &mut events);
            }
        }
        events
    }

    /// Pulls queued batches into the write pipeline and sends them if the
    /// write stream is ready.
    pub fn fill_write_pipeline(
        &mut self,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteStoreEvent>,
    ) {
        let mut last_batch_id = self
            .write_pipeline
            .back()
            .map_or(BATCH_ID_UNKNOWN, |batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            let after = (last_batch_id != BATCH_ID_UNKNOWN).then_some(last_batch_id);
            match syncer.next_mutation_batch(after) {
                Some(batch) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch, events);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }

        if self.should_start_write_stream() {
            self.start_write_stream();
        }
    }

    /// Restarts the streams so that they reconnect with the new user's token.
    /// The sync engine switches the user between the two halves.
    pub fn begin_credential_change(&mut self) -> Vec<RemoteStoreEvent> {
        if !self.can_use_network() {
            // Streams restart with the new token once the network is back.
            self.offline_causes.insert(OfflineCause::CredentialChange);
            return Vec::new();
        }
        log::debug!(target: LOG_TARGET, "restarting streams for credential change");
        self.disable_network(OfflineCause::CredentialChange)
    }

    pub fn finish_credential_change(&mut self, syncer: &dyn RemoteSyncer) -> Vec<RemoteStoreEvent> {
        self.enable_network(OfflineCause::CredentialChange, syncer)
    }

    /// Routes a stream callback, token or timer into the matching stream.
    pub fn handle_remote_input(
        &mut self,
        input: RemoteInput,
        syncer: &dyn RemoteSyncer,
    ) -> Vec<RemoteStoreEvent> {
        let mut events = Vec::new();
        match input {
            RemoteInput::Stream {
                kind,
                generation,
                event,
            } => {
                let signal = match kind {
                    StreamKind::Watch => self.watch_stream.handle_event(generation, event),
                    StreamKind::Write => self.write_stream.handle_event(generation, event),
                };
                self.dispatch_signal(kind, signal, syncer, &mut events);
            }
            RemoteInput::Token {
                kind,
                generation,
                result,
            } => {
                let signal = match kind {
                    StreamKind::Watch => self.watch_stream.handle_token(generation, result),
                    StreamKind::Write => self.write_stream.handle_token(generation, result),
                };
                self.dispatch_signal(kind, signal, syncer, &mut events);
            }
            RemoteInput::Timer(RemoteTimer::StreamIdle { kind, generation }) => {
                let signal = match kind {
                    StreamKind::Watch => self.watch_stream.handle_idle_timeout(generation),
                    StreamKind::Write => self.write_stream.handle_idle_timeout(generation),
                };
                self.dispatch_signal(kind, signal, syncer, &mut events);
            }
            RemoteInput::Timer(RemoteTimer::StreamBackoff { kind, generation }) => match kind {
                StreamKind::Watch => self.watch_stream.handle_backoff_elapsed(generation),
                StreamKind::Write => self.write_stream.handle_backoff_elapsed(generation),
            },
            RemoteInput::Timer(RemoteTimer::OnlineStateTimeout) => {
                if let Some(state) = self.online_state_tracker.handle_timeout() {
                    events.push(RemoteStoreEvent::OnlineStateChanged(state));
                }
            }
        }
        events
    }

    fn dispatch_signal(
        &mut self,
        kind: StreamKind,
        signal: Option<StreamSignal>,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteStoreEvent>,
    ) {
        let Some(signal) = signal else {
            return;
        };
        match kind {
            StreamKind::Watch => self.on_watch_signal(signal, syncer, events),
            StreamKind::Write => self.on_write_signal(signal, syncer, events),
        }
    }

    fn disable_network_internal(&mut self, events: &mut Vec<RemoteStoreEvent>) {
        if let Some(signal) = self.write_stream.stop() {
            self.on_write_closed(signal_error(signal), events);
        }
        if let Some(signal) = self.watch_stream.stop() {
            self.on_watch_closed(signal_error(signal), events);
        }
        if !self.write_pipeline.is_empty() {
            log::debug!(
                target: LOG_TARGET,
                "stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.aggregator.clear();
    }

    fn set_online_state(&mut self, state: OnlineState, events: &mut Vec<RemoteStoreEvent>) {
        if let Some(state) = self.online_state_tracker.set(state) {
            events.push(RemoteStoreEvent::OnlineStateChanged(state));
        }
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self, events: &mut Vec<RemoteStoreEvent>) {
        self.watch_stream.start();
        if let Some(state) = self.online_state_tracker.handle_watch_stream_start() {
            events.push(RemoteStoreEvent::OnlineStateChanged(state));
        }
    }

    fn send_watch_request(&mut self, target_data: &TargetData, events: &mut Vec<RemoteStoreEvent>) {
        self.aggregator
            .record_pending_target_request(target_data.target_id);
        if let Err(err) = self.watch_stream.watch(target_data) {
            self.fail_watch_stream(err, events);
        }
    }

    fn send_unwatch_request(&mut self, target_id: TargetId, events: &mut Vec<RemoteStoreEvent>) {
        self.aggregator.record_pending_target_request(target_id);
        if let Err(err) = self.watch_stream.unwatch(target_id) {
            self.fail_watch_stream(err, events);
        }
    }

    fn fail_watch_stream(&mut self, error: FirestoreError, events: &mut Vec<RemoteStoreEvent>) {
        log::debug!(target: LOG_TARGET, "watch stream failed: {error}");
        let signal = self.watch_stream.close(StreamState::Error, Some(error));
        self.on_watch_closed(signal_error(signal), events);
    }

    fn on_watch_signal(
        &mut self,
        signal: StreamSignal,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteStoreEvent>,
    ) {
        match signal {
            StreamSignal::Opened => {
                let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
                for target_data in &targets {
                    self.send_watch_request(target_data, events);
                }
            }
            StreamSignal::Message(frame) => match self.watch_stream.decode(&frame) {
                Ok((change, version)) => self.on_watch_change(change, version, syncer, events),
                Err(err) => self.fail_watch_stream(err, events),
            },
            StreamSignal::Closed(error) => self.on_watch_closed(error, events),
        }
    }

    fn on_watch_closed(
        &mut self,
        error: Option<FirestoreError>,
        events: &mut Vec<RemoteStoreEvent>,
    ) {
        self.aggregator.clear();
        if self.should_start_watch_stream() {
            let error = error.unwrap_or_else(|| unavailable("Watch stream closed by the server"));
            if let Some(state) = self.online_state_tracker.handle_watch_stream_failure(&error) {
                events.push(RemoteStoreEvent::OnlineStateChanged(state));
            }
            self.start_watch_stream(events);
        } else {
            self.set_online_state(OnlineState::Unknown, events);
        }
    }

    fn on_watch_change(
        &mut self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteStoreEvent>,
    ) {
        self.set_online_state(OnlineState::Online, events);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed {
                if let Some(cause) = &target_change.cause {
                    for &target_id in &target_change.target_ids {
                        if self.listen_targets.remove(&target_id).is_some() {
                            self.aggregator.remove_target(target_id);
                            events.push(RemoteStoreEvent::ListenRejected {
                                target_id,
                                error: cause.clone(),
                            });
                        }
                    }
                    return;
                }
            }
        }

        {
            let provider = ListenTargets {
                targets: &self.listen_targets,
                syncer,
            };
            match change {
                WatchChange::Document(change) => {
                    self.aggregator.handle_document_change(&provider, change)
                }
                WatchChange::TargetChange(change) => {
                    self.aggregator.handle_target_change(&provider, &change)
                }
                WatchChange::ExistenceFilter(filter) => {
                    self.aggregator.handle_existence_filter(&provider, filter)
                }
            }
        }

        if !snapshot_version.is_min()
            && snapshot_version >= syncer.last_remote_snapshot_version()
        {
            self.raise_watch_snapshot(snapshot_version, syncer, events);
        }
    }

    fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteStoreEvent>,
    ) {
        let remote_event = {
            let provider = ListenTargets {
                targets: &self.listen_targets,
                syncer,
            };
            self.aggregator
                .create_remote_event(&provider, snapshot_version)
        };

        for (target_id, change) in &remote_event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data =
                    target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        // Targets whose existence filter disagreed are listened to again
        // from scratch; a resume token would only replay the bad state.
        for target_id in &remote_event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            let cleared = target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
            self.listen_targets.insert(*target_id, cleared);
            self.send_unwatch_request(*target_id, events);

            let relisten = TargetData::new(
                target_data.target.clone(),
                *target_id,
                QueryPurpose::ExistenceFilterMismatch,
                target_data.sequence_number,
            );
            self.send_watch_request(&relisten, events);
        }

        events.push(RemoteStoreEvent::RemoteEvent(remote_event));
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn start_write_stream(&mut self) {
        self.write_stream.start();
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch, events: &mut Vec<RemoteStoreEvent>) {
        let send = self.write_stream.is_open() && self.write_stream.handshake_complete();
        let result = if send {
            self.write_stream.write_mutations(&batch.mutations)
        } else {
            Ok(())
        };
        self.write_pipeline.push_back(batch);
        if let Err(err) = result {
            self.fail_write_stream(err, events);
        }
    }

    fn fail_write_stream(&mut self, error: FirestoreError, events: &mut Vec<RemoteStoreEvent>) {
        log::debug!(target: LOG_TARGET, "write stream failed: {error}");
        let signal = self.write_stream.close(StreamState::Error, Some(error));
        self.on_write_closed(signal_error(signal), events);
    }

    fn on_write_signal(
        &mut self,
        signal: StreamSignal,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteStoreEvent>,
    ) {
        match signal {
            StreamSignal::Opened => {
                self.write_stream
                    .set_last_stream_token(syncer.last_stream_token());
                if let Err(err) = self.write_stream.write_handshake() {
                    self.fail_write_stream(err, events);
                }
            }
            StreamSignal::Message(frame) => match self.write_stream.decode(&frame) {
                Ok(WriteStreamResponse::HandshakeComplete) => {
                    self.on_handshake_complete(events);
                }
                Ok(WriteStreamResponse::MutationResults(response)) => {
                    self.on_mutation_results(response, events);
                }
                Err(err) => self.fail_write_stream(err, events),
            },
            StreamSignal::Closed(error) => self.on_write_closed(error, events),
        }
    }

    fn on_handshake_complete(&mut self, events: &mut Vec<RemoteStoreEvent>) {
        events.push(RemoteStoreEvent::StreamTokenChanged(
            self.write_stream.last_stream_token().to_vec(),
        ));
        let batches: Vec<MutationBatch> = self.write_pipeline.iter().cloned().collect();
        for batch in &batches {
            if let Err(err) = self.write_stream.write_mutations(&batch.mutations) {
                self.fail_write_stream(err, events);
                return;
            }
        }
    }

    /// Pops the acknowledged batch. The pipeline is refilled by the syncer
    /// once the local store has removed the batch from its queue.
    fn on_mutation_results(&mut self, response: WriteResponse, events: &mut Vec<RemoteStoreEvent>) {
        let Some(batch) = self.write_pipeline.pop_front() else {
            log::warn!(target: LOG_TARGET, "got a write response without a pending batch");
            return;
        };
        match MutationBatchResult::from(
            batch,
            response.commit_version,
            response.mutation_results,
            response.stream_token,
        ) {
            Ok(result) => events.push(RemoteStoreEvent::WriteAcknowledged(result)),
            Err(err) => self.fail_write_stream(err, events),
        }
    }

    fn on_write_closed(
        &mut self,
        error: Option<FirestoreError>,
        events: &mut Vec<RemoteStoreEvent>,
    ) {
        if let Some(error) = error {
            if !self.write_pipeline.is_empty() {
                if self.write_stream.handshake_complete() {
                    self.handle_write_error(error, events);
                } else {
                    self.handle_handshake_error(&error, events);
                }
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream();
        }
    }

    fn handle_handshake_error(
        &mut self,
        error: &FirestoreError,
        events: &mut Vec<RemoteStoreEvent>,
    ) {
        if is_permanent_error(error.code) {
            log::debug!(
                target: LOG_TARGET,
                "write handshake failed with {}, resetting stream token",
                error.code_str()
            );
            self.write_stream.set_last_stream_token(Vec::new());
            events.push(RemoteStoreEvent::StreamTokenChanged(Vec::new()));
        }
    }

    fn handle_write_error(&mut self, error: FirestoreError, events: &mut Vec<RemoteStoreEvent>) {
        if !is_permanent_write_error(error.code) {
            return;
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return;
        };
        // The batch can never succeed, so there is nothing to back off for.
        self.write_stream.inhibit_backoff();
        events.push(RemoteStoreEvent::WriteRejected {
            batch_id: batch.batch_id,
            error,
        });
    }
}

fn signal_error(signal: StreamSignal) -> Option<FirestoreError> {
    match signal {
        StreamSignal::Closed(error) => error,
        _ => None,
    }
}
