use std::cmp::Ordering;

use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::core::{LimitType, Query};
use crate::firestore::model::{
    Document, DocumentComparator, DocumentKey, DocumentKeySet, DocumentSet, MaybeDocument,
    MaybeDocumentMap,
};
use crate::firestore::remote::{OnlineState, TargetChange};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Result of [`View::compute_doc_changes`], not yet applied to the view.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The documents passed in were not enough to fill a limit, so the view
    /// must be recomputed from the full local cache.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Incrementally maintained result set of one query.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    // Whether the target reported CURRENT without losing consistency since.
    current: bool,
    document_set: DocumentSet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
    synced_documents: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            current: false,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
            synced_documents,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Keys the backend says belong to the target.
    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Works out the new result set for `doc_changes` without modifying the
    /// view. Pass the output of a previous call as `previous` to continue
    /// from it, as done when refilling from the local cache.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &MaybeDocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let is_refill = previous.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        // Document at the edge of a full limit. An update moving a document
        // past it, or a removal, may let a document from the cache that is
        // not in the view take its place.
        let edge_doc_in_limit = match self.query.limit() {
            Some(limit) if old_document_set.len() == limit as usize => {
                match self.query.limit_type() {
                    LimitType::First => old_document_set.last().cloned(),
                    LimitType::Last => old_document_set.first().cloned(),
                }
            }
            _ => None,
        };

        for (key, new_maybe_doc) in doc_changes.iter() {
            let old_doc = old_document_set.get(key).cloned();
            let new_doc = match new_maybe_doc {
                MaybeDocument::Document(doc) if self.query.matches(doc) => Some(doc.clone()),
                _ => None,
            };

            let old_doc_had_pending_mutations = old_doc
                .as_ref()
                .map(|doc| self.mutated_keys.contains(doc.key()))
                .unwrap_or(false);
            let new_doc_has_pending_mutations = new_doc
                .as_ref()
                .map(|doc| {
                    // Committed mutations only count for documents mutated
                    // while this view existed.
                    doc.has_local_mutations()
                        || (self.mutated_keys.contains(doc.key())
                            && doc.has_committed_mutations())
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (&old_doc, &new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                doc: new.clone(),
                            });
                            change_applied = true;

                            if let Some(edge) = &edge_doc_in_limit {
                                if self.moved_past_edge(new, edge) {
                                    needs_refill = true;
                                }
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            doc: new.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        doc: new.clone(),
                    });
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        doc: old.clone(),
                    });
                    change_applied = true;
                    if edge_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(doc) => {
                        new_document_set = new_document_set.add(doc);
                        new_mutated_keys = if new_doc_has_pending_mutations {
                            new_mutated_keys.insert(key.clone())
                        } else {
                            new_mutated_keys.remove(key)
                        };
                    }
                    None => {
                        new_document_set = new_document_set.delete(key);
                        new_mutated_keys = new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while new_document_set.len() > limit as usize {
                let dropped = match self.query.limit_type() {
                    LimitType::First => new_document_set.last().cloned(),
                    LimitType::Last => new_document_set.first().cloned(),
                };
                let Some(dropped) = dropped else { break };
                new_document_set = new_document_set.delete(dropped.key());
                new_mutated_keys = new_mutated_keys.remove(dropped.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    doc: dropped,
                });
            }
        }

        if needs_refill && is_refill {
            log::warn!(
                target: "firestore::sync_engine",
                "view for {} was refilled using documents that themselves needed refilling",
                self.query
            );
        }

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        }
    }

    fn moved_past_edge(&self, doc: &Document, edge: &Document) -> bool {
        let ordering = (self.comparator)(doc, edge);
        match self.query.limit_type() {
            LimitType::First => ordering == Ordering::Greater,
            LimitType::Last => ordering == Ordering::Less,
        }
    }

    /// Applies computed changes, and the target change that came with them,
    /// producing a snapshot when something visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_rank()
                .cmp(&right.change_type.sort_rank())
                .then_with(|| (self.comparator)(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: doc_changes.document_set,
                old_docs,
                doc_changes: changes,
                mutated_keys: doc_changes.mutated_keys,
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
            }),
            limbo_changes,
        }
    }

    /// Going offline makes a current view stale until the target reports
    /// CURRENT again.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None);
        }
        ViewChange::default()
    }

    /// Snapshot of the full current state, as if every document was added.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
        )
    }

    /// Replaces the synced key set and recomputes everything from
    /// `local_docs`, used after a user change.
    pub fn synchronize_with_persisted_state(
        &mut self,
        local_docs: &MaybeDocumentMap,
        remote_keys: DocumentKeySet,
    ) -> ViewChange {
        self.synced_documents = remote_keys;
        self.limbo_documents = DocumentKeySet::new();
        let changes = self.compute_doc_changes(local_docs, None);
        self.apply_changes(changes, true, None)
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in change.added_documents.iter() {
            self.synced_documents = self.synced_documents.insert(key.clone());
        }
        for key in change.modified_documents.iter() {
            if !self.synced_documents.contains(key) {
                log::debug!(
                    target: "firestore::sync_engine",
                    "modified document {key} not found in view"
                );
            }
        }
        for key in change.removed_documents.iter() {
            self.synced_documents = self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local changes may explain why the server does not list it.
            Some(doc) => !doc.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let mut new_limbo = DocumentKeySet::new();
        for key in self.document_set.keys() {
            if self.should_be_in_limbo(key) {
                new_limbo = new_limbo.insert(key.clone());
            }
        }

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .iter()
            .filter(|key| !new_limbo.contains(key))
            .map(|key| LimboDocumentChange::Removed(key.clone()))
            .collect();
        changes.extend(
            new_limbo
                .iter()
                .filter(|key| !old_limbo.contains(key))
                .map(|key| LimboDocumentChange::Added(key.clone())),
        );
        self.limbo_documents = new_limbo;
        changes
    }
}

fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    // An acknowledged write shows up once with committed mutations and again
    // when watch delivers it; only the final state is raised.
    old_doc.has_local_mutations()
        && new_doc.has_committed_mutations()
        && !new_doc.has_local_mutations()
}
