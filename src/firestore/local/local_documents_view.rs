use crate::firestore::core::Query;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument, MaybeDocumentMap, MutationBatch,
    MutationKind, NoDocument, SnapshotVersion,
};

/// What the user sees: cached server state with every pending local write
/// applied on top.
pub struct LocalDocumentsView<'a> {
    remote_documents: &'a RemoteDocumentCache,
    mutation_queue: &'a MutationQueue,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(
        remote_documents: &'a RemoteDocumentCache,
        mutation_queue: &'a MutationQueue,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
        }
    }

    pub fn get_document(&self, key: &DocumentKey) -> Option<MaybeDocument> {
        let batches = self.mutation_queue.all_mutation_batches_affecting_document_key(key);
        apply_batches(key, self.remote_documents.get_entry(key).cloned(), &batches)
    }

    /// Local view of every key in `keys`. Keys with no state map to a
    /// [`NoDocument`] at version zero.
    pub fn get_documents(&self, keys: &DocumentKeySet) -> MaybeDocumentMap {
        let base_docs = keys.iter().fold(MaybeDocumentMap::new(), |docs, key| {
            match self.remote_documents.get_entry(key) {
                Some(doc) => docs.insert(key.clone(), doc.clone()),
                None => docs,
            }
        });
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(keys);
        keys.iter().fold(MaybeDocumentMap::new(), |results, key| {
            let local = apply_batches(key, base_docs.get(key).cloned(), &batches)
                .unwrap_or_else(|| NoDocument::new(key.clone(), SnapshotVersion::min()).into());
            results.insert(key.clone(), local)
        })
    }

    /// Applies pending writes to documents the caller already loaded.
    pub fn get_local_view_of_documents(&self, base_docs: &MaybeDocumentMap) -> MaybeDocumentMap {
        let keys: DocumentKeySet = base_docs.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(&keys);
        base_docs
            .iter()
            .fold(MaybeDocumentMap::new(), |results, (key, doc)| {
                let local = apply_batches(key, Some(doc.clone()), &batches)
                    .unwrap_or_else(|| NoDocument::new(key.clone(), SnapshotVersion::min()).into());
                results.insert(key.clone(), local)
            })
    }

    /// Documents matching `query` in the local view. Only remote documents
    /// read after `since_read_time` are scanned; local writes are always
    /// applied.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        if query.is_document_query() {
            return self.get_documents_matching_document_query(query);
        }
        self.get_documents_matching_collection_query(query, since_read_time)
    }

    fn get_documents_matching_document_query(&self, query: &Query) -> DocumentMap {
        let Ok(key) = DocumentKey::from_path(query.path().clone()) else {
            return DocumentMap::new();
        };
        match self.get_document(&key) {
            Some(MaybeDocument::Document(doc)) => DocumentMap::new().insert(key, doc),
            _ => DocumentMap::new(),
        }
    }

    fn get_documents_matching_collection_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        let mut results: MaybeDocumentMap = self
            .remote_documents
            .get_documents_matching_query(query, since_read_time)
            .iter()
            .map(|(key, doc)| (key.clone(), MaybeDocument::from(doc.clone())))
            .collect();
        let batches = self.mutation_queue.all_mutation_batches_affecting_query(query);
        results = self.add_missing_base_documents(&batches, results);

        for batch in &batches {
            for key in batch.keys().iter() {
                if !in_query_scope(query, key) {
                    continue;
                }
                let base = results.get(key).cloned();
                results = match batch.apply_to_local_view(key, base) {
                    Some(doc @ MaybeDocument::Document(_)) => results.insert(key.clone(), doc),
                    _ => results.remove(key),
                };
            }
        }

        // Local writes may have moved documents out of the result set.
        results
            .iter()
            .filter_map(|(key, doc)| doc.as_document().map(|doc| (key, doc)))
            .filter(|(_, doc)| query.matches(doc))
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    /// A patch only applies to an existing document, so documents a pending
    /// patch touches are loaded even if the scan skipped them.
    fn add_missing_base_documents(
        &self,
        batches: &[&MutationBatch],
        mut results: MaybeDocumentMap,
    ) -> MaybeDocumentMap {
        for batch in batches {
            for mutation in &batch.mutations {
                let key = mutation.key();
                if !matches!(mutation.kind(), MutationKind::Patch { .. })
                    || results.contains_key(key)
                {
                    continue;
                }
                if let Some(doc) = self.remote_documents.get_entry(key) {
                    if doc.is_document() {
                        results = results.insert(key.clone(), doc.clone());
                    }
                }
            }
        }
        results
    }
}

fn apply_batches(
    key: &DocumentKey,
    base: Option<MaybeDocument>,
    batches: &[&MutationBatch],
) -> Option<MaybeDocument> {
    batches
        .iter()
        .fold(base, |doc, batch| batch.apply_to_local_view(key, doc))
}

fn in_query_scope(query: &Query, key: &DocumentKey) -> bool {
    match query.collection_group_id() {
        Some(group) => query.path().is_prefix_of(key.path()) && key.collection_group() == group,
        None => query.path().is_immediate_parent_of(key.path()),
    }
}
