use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{ChangeType, TargetId};
use crate::firestore::local::{QueryPurpose, TargetData};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, MaybeDocument, MaybeDocumentMap, NoDocument, SnapshotVersion,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local store last saw as matching `target_id` on the server.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Target data of an active target, `None` once it was unlistened.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData>;
}

/// Pending changes of one target between two global snapshots.
#[derive(Debug)]
struct TargetState {
    /// Listen and unlisten requests the server has not answered yet.
    pending_responses: i32,
    current: bool,
    resume_token: Vec<u8>,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        // Every target raises at least one event after being added.
        Self {
            pending_responses: 0,
            current: false,
            resume_token: Vec::new(),
            document_changes: BTreeMap::new(),
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => {
                    change.added_documents = change.added_documents.insert(key.clone())
                }
                ChangeType::Modified => {
                    change.modified_documents = change.modified_documents.insert(key.clone())
                }
                ChangeType::Removed => {
                    change.removed_documents = change.removed_documents.insert(key.clone())
                }
                ChangeType::Metadata => {}
            }
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Collects watch changes until the server reports a consistent snapshot,
/// then hands them out as one [`RemoteEvent`].
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: MaybeDocumentMap,
    /// Targets each updated document was reported for in this snapshot.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeSet<TargetId>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_document_change(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: DocumentWatchChange,
    ) {
        for &target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(doc @ MaybeDocument::Document(_)) => {
                    self.add_document_to_target(provider, target_id, doc.clone())
                }
                Some(doc @ MaybeDocument::NoDocument(_)) => self.remove_document_from_target(
                    provider,
                    target_id,
                    change.key.clone(),
                    Some(doc.clone()),
                ),
                _ => {}
            }
        }
        for &target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                provider,
                target_id,
                change.key.clone(),
                change.new_doc.clone(),
            );
        }
    }

    pub fn handle_target_change(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        change: &WatchTargetChange,
    ) {
        let target_ids: Vec<TargetId> = if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        };

        for target_id in target_ids {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // A re-added target starts over, e.g. after an
                        // existence filter mismatch.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the server's document count for a target with the local
    /// one. On mismatch the target is reset and reported in
    /// [`RemoteEvent::target_mismatches`].
    pub fn handle_existence_filter(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        filter: ExistenceFilterChange,
    ) {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };
        let target = &target_data.target;

        if target.is_document_query() && filter.count == 0 {
            // The document is gone; no need to re-listen for it.
            if let Ok(key) = DocumentKey::from_path(target.path.clone()) {
                let deleted = NoDocument::new(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(provider, target_id, key, Some(deleted.into()));
            }
            return;
        }

        let current_size = self.current_document_count_for_target(provider, target_id);
        if current_size != filter.count {
            log::debug!(
                target: "firestore::remote_store",
                "existence filter mismatch for target {target_id}: expected {}, have {}",
                filter.count,
                current_size
            );
            self.reset_target(provider, target_id);
            self.pending_target_resets.insert(target_id);
        }
    }

    /// Turns everything buffered so far into a [`RemoteEvent`] at
    /// `snapshot_version` and clears the buffers.
    pub fn create_remote_event(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let is_current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);

            if is_current && target_data.target.is_document_query() {
                // A document target that went current without sending its
                // document means the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !target_contains_document(provider, target_id, &key)
                    {
                        let deleted = NoDocument::new(key.clone(), snapshot_version);
                        self.remove_document_from_target(
                            provider,
                            target_id,
                            key,
                            Some(deleted.into()),
                        );
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let resolved_limbo_documents = self
            .pending_document_target_mapping
            .iter()
            .filter(|(_, targets)| {
                targets.iter().all(|target_id| {
                    self.target_data_for_active_target(provider, *target_id)
                        .map_or(true, |data| data.purpose == QueryPurpose::LimboResolution)
                })
            })
            .map(|(key, _)| key.clone())
            .collect();

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents,
        };
        self.pending_document_target_mapping.clear();
        event
    }

    /// Counts a listen or unlisten request whose response is outstanding.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    /// Drops the state of a target the server rejected.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Forgets all buffered state, e.g. when the watch stream restarts.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn add_document_to_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        doc: MaybeDocument,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = doc.key().clone();
        let change_type = if target_contains_document(provider, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates = self.pending_document_updates.insert(key.clone(), doc);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// Removes `key` from the target. `updated_doc` carries the new state of
    /// the document if it is known, e.g. after a delete.
    fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: DocumentKey,
        updated_doc: Option<MaybeDocument>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let in_target = target_contains_document(provider, target_id, &key);
        let state = self.ensure_target_state(target_id);
        if in_target {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Added and removed again within this snapshot.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(doc) = updated_doc {
            self.pending_document_updates = self.pending_document_updates.insert(key, doc);
        }
    }

    /// Drops everything known about the target so that the next snapshot
    /// rebuilds it from scratch.
    fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::new());
        for key in provider.remote_keys_for_target(target_id).iter() {
            self.remove_document_from_target(provider, target_id, key.clone(), None);
        }
    }

    fn current_document_count_for_target(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> usize {
        let existing = provider.remote_keys_for_target(target_id).len();
        let Some(state) = self.target_states.get(&target_id) else {
            return existing;
        };
        let (added, removed) =
            state
                .document_changes
                .values()
                .fold((0, 0), |(added, removed), change| match change {
                    ChangeType::Added => (added + 1, removed),
                    ChangeType::Removed => (added, removed + 1),
                    _ => (added, removed),
                });
        (existing + added).saturating_sub(removed)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        let active = self
            .target_data_for_active_target(provider, target_id)
            .is_some();
        if !active {
            log::debug!(target: "firestore::remote_store", "detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target<'p>(
        &self,
        provider: &'p dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<&'p TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.target_data_for_target(target_id),
        }
    }
}

fn target_contains_document(
    provider: &dyn TargetMetadataProvider,
    target_id: TargetId,
    key: &DocumentKey,
) -> bool {
    provider.remote_keys_for_target(target_id).contains(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::model::Document;
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct Provider {
        targets: BTreeMap<TargetId, TargetData>,
        keys: BTreeMap<TargetId, DocumentKeySet>,
    }

    impl Provider {
        fn with_target(mut self, target_id: TargetId, path: &str, purpose: QueryPurpose) -> Self {
            let target = Query::at_path(path).unwrap().to_target();
            self.targets
                .insert(target_id, TargetData::new(target, target_id, purpose, 0));
            self
        }

        fn with_keys(mut self, target_id: TargetId, paths: &[&str]) -> Self {
            self.keys
                .insert(target_id, paths.iter().map(|path| key(path)).collect());
            self
        }
    }

    impl TargetMetadataProvider for Provider {
        fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_target(&self, target_id: TargetId) -> Option<&TargetData> {
            self.targets.get(&target_id)
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    fn doc_change(targets: &[TargetId], path: &str) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: targets.to_vec(),
            removed_target_ids: Vec::new(),
            key: key(path),
            new_doc: Some(Document::new(key(path), version(1), MapValue::empty()).into()),
        }
    }

    fn target_change(state: WatchTargetChangeState, targets: &[TargetId]) -> WatchTargetChange {
        WatchTargetChange {
            state,
            target_ids: targets.to_vec(),
            resume_token: vec![1],
            cause: None,
        }
    }

    fn listened(aggregator: &mut WatchChangeAggregator, provider: &Provider, id: TargetId) {
        aggregator.record_pending_target_request(id);
        aggregator.handle_target_change(
            provider,
            &target_change(WatchTargetChangeState::Added, &[id]),
        );
    }

    #[test]
    fn documents_are_attributed_to_their_targets() {
        let provider = Provider::default()
            .with_target(2, "rooms", QueryPurpose::Listen)
            .with_keys(2, &["rooms/2"]);
        let mut aggregator = WatchChangeAggregator::new();
        listened(&mut aggregator, &provider, 2);

        aggregator.handle_document_change(&provider, doc_change(&[2], "rooms/1"));
        aggregator.handle_document_change(&provider, doc_change(&[2], "rooms/2"));
        aggregator.handle_target_change(
            &provider,
            &target_change(WatchTargetChangeState::Current, &[2]),
        );

        let event = aggregator.create_remote_event(&provider, version(3));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert!(change.added_documents.contains(&key("rooms/1")));
        assert!(change.modified_documents.contains(&key("rooms/2")));
        assert_eq!(event.document_updates.len(), 2);
        assert!(event.resolved_limbo_documents.is_empty());

        // Nothing new; the next snapshot carries no target change.
        let event = aggregator.create_remote_event(&provider, version(4));
        assert!(event.target_changes.is_empty());
    }

    #[test]
    fn changes_for_pending_targets_are_dropped() {
        let provider = Provider::default().with_target(2, "rooms", QueryPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);

        aggregator.handle_document_change(&provider, doc_change(&[2], "rooms/1"));
        let event = aggregator.create_remote_event(&provider, version(1));
        assert!(event.document_updates.is_empty());
        assert!(event.target_changes.is_empty());
    }

    #[test]
    fn reset_removes_every_known_document() {
        let provider = Provider::default()
            .with_target(2, "rooms", QueryPurpose::Listen)
            .with_keys(2, &["rooms/1", "rooms/2"]);
        let mut aggregator = WatchChangeAggregator::new();
        listened(&mut aggregator, &provider, 2);

        aggregator.handle_target_change(
            &provider,
            &target_change(WatchTargetChangeState::Reset, &[2]),
        );
        let event = aggregator.create_remote_event(&provider, version(2));
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents.len(), 2);
        assert!(!change.current);
    }

    #[test]
    fn existence_filter_mismatch_resets_the_target() {
        let provider = Provider::default()
            .with_target(2, "rooms/1", QueryPurpose::Listen)
            .with_keys(2, &["rooms/1", "rooms/2"]);
        let mut aggregator = WatchChangeAggregator::new();
        listened(&mut aggregator, &provider, 2);

        aggregator.handle_existence_filter(
            &provider,
            ExistenceFilterChange {
                target_id: 2,
                count: 1,
            },
        );
        let event = aggregator.create_remote_event(&provider, version(2));
        assert!(event.target_mismatches.contains(&2));
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn empty_existence_filter_on_a_document_target_deletes_it() {
        let provider = Provider::default()
            .with_target(2, "rooms/1", QueryPurpose::Listen)
            .with_keys(2, &["rooms/1"]);
        let mut aggregator = WatchChangeAggregator::new();
        listened(&mut aggregator, &provider, 2);

        aggregator.handle_existence_filter(
            &provider,
            ExistenceFilterChange {
                target_id: 2,
                count: 0,
            },
        );
        let event = aggregator.create_remote_event(&provider, version(2));
        assert!(event.target_mismatches.is_empty());
        let doc = event.document_updates.get(&key("rooms/1")).unwrap();
        assert!(doc.is_no_document());
        assert!(doc.version().is_min());
    }

    #[test]
    fn current_document_target_without_document_synthesizes_a_delete() {
        let provider = Provider::default().with_target(1, "rooms/1", QueryPurpose::LimboResolution);
        let mut aggregator = WatchChangeAggregator::new();
        listened(&mut aggregator, &provider, 1);
        aggregator.handle_target_change(
            &provider,
            &target_change(WatchTargetChangeState::Current, &[1]),
        );

        let event = aggregator.create_remote_event(&provider, version(7));
        let doc = event.document_updates.get(&key("rooms/1")).unwrap();
        assert_eq!(doc.version(), version(7));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/1")));
    }
}
