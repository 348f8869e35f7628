use std::collections::BTreeSet;

use crate::firestore::core::{Target, TargetId, TargetIdGenerator};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::model::{DocumentKey, DocumentKeySet, SnapshotVersion};
use crate::firestore::util::SortedMap;

/// Why the client listens to a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryPurpose {
    Listen,
    /// Re-listen after an existence filter mismatch. Sent without a resume
    /// token so the server resends the whole result set.
    ExistenceFilterMismatch,
    LimboResolution,
}

impl QueryPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryPurpose::Listen => "listen",
            QueryPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            QueryPurpose::LimboResolution => "limbo-document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "listen" => QueryPurpose::Listen,
            "existence-filter-mismatch" => QueryPurpose::ExistenceFilterMismatch,
            "limbo-document" => QueryPurpose::LimboResolution,
            _ => return None,
        })
    }
}

/// What the local store knows about one listened target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: QueryPurpose,
    pub sequence_number: i64,
    /// Version of the last snapshot that included this target.
    pub snapshot_version: SnapshotVersion,
    /// Last snapshot at which the target's view had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: QueryPurpose,
        sequence_number: i64,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
        }
    }

    pub fn with_sequence_number(&self, sequence_number: i64) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    pub fn with_resume_token(
        &self,
        resume_token: Vec<u8>,
        snapshot_version: SnapshotVersion,
    ) -> Self {
        Self {
            resume_token,
            snapshot_version,
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }
}

/// Target metadata and the documents each target matches on the server.
///
/// Changes are tracked as dirty entries until the owning transaction
/// commits them to storage.
#[derive(Clone, Debug, Default)]
pub struct TargetCache {
    targets: SortedMap<TargetId, TargetData>,
    canonical_ids: SortedMap<String, TargetId>,
    matching_keys: ReferenceSet,
    highest_target_id: TargetId,
    highest_listen_sequence_number: i64,
    last_remote_snapshot_version: SnapshotVersion,
    pub(crate) dirty_targets: BTreeSet<TargetId>,
    pub(crate) dirty_matches: BTreeSet<(TargetId, DocumentKey)>,
    pub(crate) metadata_dirty: bool,
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.highest_target_id
    }

    pub fn highest_listen_sequence_number(&self) -> i64 {
        self.highest_listen_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
        self.metadata_dirty = true;
    }

    /// Next id for a query target, after every id this cache has seen.
    pub fn allocate_target_id(&mut self) -> TargetId {
        let id = TargetIdGenerator::for_target_cache(self.highest_target_id).next();
        self.highest_target_id = id;
        self.metadata_dirty = true;
        id
    }

    pub fn next_sequence_number(&mut self) -> i64 {
        self.highest_listen_sequence_number += 1;
        self.metadata_dirty = true;
        self.highest_listen_sequence_number
    }

    pub fn get_target_data(&self, target: &Target) -> Option<&TargetData> {
        let id = self.canonical_ids.get(&target.canonical_id())?;
        self.targets.get(id).filter(|data| &data.target == target)
    }

    pub fn target_data_for_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn add_target_data(&mut self, target_data: TargetData) {
        self.save_target_data(target_data);
    }

    pub fn update_target_data(&mut self, target_data: TargetData) {
        self.save_target_data(target_data);
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        let id = target_data.target_id;
        if id > self.highest_target_id {
            self.highest_target_id = id;
            self.metadata_dirty = true;
        }
        if target_data.sequence_number > self.highest_listen_sequence_number {
            self.highest_listen_sequence_number = target_data.sequence_number;
            self.metadata_dirty = true;
        }
        self.canonical_ids = self
            .canonical_ids
            .insert(target_data.target.canonical_id(), id);
        self.targets = self.targets.insert(id, target_data);
        self.dirty_targets.insert(id);
    }

    /// Removes the target together with its matching keys.
    pub fn remove_target_data(&mut self, target_data: &TargetData) {
        let id = target_data.target_id;
        self.targets = self.targets.remove(&id);
        let canonical_id = target_data.target.canonical_id();
        if self.canonical_ids.get(&canonical_id) == Some(&id) {
            self.canonical_ids = self.canonical_ids.remove(&canonical_id);
        }
        self.remove_matching_keys_for_target_id(id);
        self.dirty_targets.insert(id);
    }

    pub fn add_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        for key in keys {
            self.matching_keys.add_reference(key.clone(), target_id);
            self.dirty_matches.insert((target_id, key.clone()));
        }
    }

    pub fn remove_matching_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        target_id: TargetId,
    ) {
        for key in keys {
            self.matching_keys.remove_reference(key, target_id);
            self.dirty_matches.insert((target_id, key.clone()));
        }
    }

    pub fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) {
        for key in self.matching_keys.remove_references_for_id(target_id) {
            self.dirty_matches.insert((target_id, key));
        }
    }

    pub fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.matching_keys.references_for_id(target_id)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.matching_keys.contains_key(key)
    }

    pub fn is_match(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.matching_keys.ids_for_key(key).contains(&target_id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    pub(crate) fn restore_metadata(
        &mut self,
        highest_target_id: TargetId,
        highest_listen_sequence_number: i64,
        last_remote_snapshot_version: SnapshotVersion,
    ) {
        self.highest_target_id = self.highest_target_id.max(highest_target_id);
        self.highest_listen_sequence_number = self
            .highest_listen_sequence_number
            .max(highest_listen_sequence_number);
        self.last_remote_snapshot_version = last_remote_snapshot_version;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty_targets.clear();
        self.dirty_matches.clear();
        self.metadata_dirty = false;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.metadata_dirty || !self.dirty_targets.is_empty() || !self.dirty_matches.is_empty()
    }
}
