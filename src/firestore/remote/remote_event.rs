use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::TargetId;
use crate::firestore::model::{DocumentKeySet, MaybeDocumentMap, SnapshotVersion};

/// Everything the watch stream reported between two consistent snapshots.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose document set must be rebuilt from scratch because an
    /// existence filter disagreed with the client's count.
    pub target_mismatches: BTreeSet<TargetId>,
    pub document_updates: MaybeDocumentMap,
    /// Documents that only changed because of limbo resolution targets.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn new(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeSet::new(),
            document_updates: MaybeDocumentMap::new(),
            resolved_limbo_documents: DocumentKeySet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_mismatches.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Changes to the document membership of a single target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Opaque cursor to resume the target from. Empty when unchanged.
    pub resume_token: Vec<u8>,
    /// Whether the target caught up with the server at this snapshot.
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    /// Number of documents whose membership changed.
    pub fn document_change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
