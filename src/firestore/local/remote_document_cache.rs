use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument, MaybeDocumentMap, SnapshotVersion,
};
use crate::firestore::util::SortedMap;

/// A cached server document and the snapshot version at which it was read.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteDocumentEntry {
    pub doc: MaybeDocument,
    pub read_time: SnapshotVersion,
}

/// Last known server state of every document the client has seen.
#[derive(Clone, Debug, Default)]
pub struct RemoteDocumentCache {
    docs: SortedMap<DocumentKey, RemoteDocumentEntry>,
    pub(crate) dirty_keys: BTreeSet<DocumentKey>,
}

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get_entry(&self, key: &DocumentKey) -> Option<&MaybeDocument> {
        self.docs.get(key).map(|entry| &entry.doc)
    }

    pub(crate) fn entry(&self, key: &DocumentKey) -> Option<&RemoteDocumentEntry> {
        self.docs.get(key)
    }

    /// Cached documents for `keys`. Keys without an entry are left out.
    pub fn get_entries(&self, keys: &DocumentKeySet) -> MaybeDocumentMap {
        keys.iter()
            .filter_map(|key| self.get_entry(key).map(|doc| (key.clone(), doc.clone())))
            .collect()
    }

    pub fn add_entry(&mut self, doc: MaybeDocument, read_time: SnapshotVersion) {
        let key = doc.key().clone();
        self.docs = self
            .docs
            .insert(key.clone(), RemoteDocumentEntry { doc, read_time });
        self.dirty_keys.insert(key);
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) {
        self.docs = self.docs.remove(key);
        self.dirty_keys.insert(key.clone());
    }

    /// Existing documents matching `query` that were read after
    /// `since_read_time`. Pass [`SnapshotVersion::min`] for a full scan.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        let prefix = query.path();
        let start = DocumentKey::first_under(prefix);
        let mut results = DocumentMap::new();
        for (key, entry) in self.docs.iter_from(&start) {
            if !prefix.is_prefix_of(key.path()) {
                break;
            }
            if entry.read_time <= since_read_time {
                continue;
            }
            if let Some(doc) = entry.doc.as_document() {
                if query.matches(doc) {
                    results = results.insert(key.clone(), doc.clone());
                }
            }
        }
        results
    }

    pub(crate) fn restore_entry(&mut self, doc: MaybeDocument, read_time: SnapshotVersion) {
        let key = doc.key().clone();
        self.docs = self.docs.insert(key, RemoteDocumentEntry { doc, read_time });
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty_keys.clear();
    }

    pub(crate) fn is_dirty(&self) -> bool {
        !self.dirty_keys.is_empty()
    }
}

/// Buffers document changes against a snapshot of the cache and writes them
/// back in one step with [`RemoteDocumentChangeBuffer::apply`].
pub struct RemoteDocumentChangeBuffer {
    base: SortedMap<DocumentKey, RemoteDocumentEntry>,
    changes: BTreeMap<DocumentKey, Option<RemoteDocumentEntry>>,
}

impl RemoteDocumentChangeBuffer {
    pub fn new(cache: &RemoteDocumentCache) -> Self {
        Self {
            base: cache.docs.clone(),
            changes: BTreeMap::new(),
        }
    }

    /// Buffered state of `key`, falling back to the cache.
    pub fn get_entry(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        match self.changes.get(key) {
            Some(change) => change.as_ref().map(|entry| entry.doc.clone()),
            None => self.base.get(key).map(|entry| entry.doc.clone()),
        }
    }

    pub fn get_entries(&self, keys: &DocumentKeySet) -> MaybeDocumentMap {
        keys.iter()
            .filter_map(|key| self.get_entry(key).map(|doc| (key.clone(), doc)))
            .collect()
    }

    pub fn add_entry(&mut self, doc: MaybeDocument, read_time: SnapshotVersion) {
        self.changes.insert(
            doc.key().clone(),
            Some(RemoteDocumentEntry { doc, read_time }),
        );
    }

    pub fn remove_entry(&mut self, key: DocumentKey) {
        self.changes.insert(key, None);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn apply(self, cache: &mut RemoteDocumentCache) {
        for (key, change) in self.changes {
            match change {
                Some(entry) => cache.add_entry(entry.doc, entry.read_time),
                None => cache.remove_entry(&key),
            }
        }
    }
}
