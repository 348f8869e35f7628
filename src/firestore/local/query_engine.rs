use crate::firestore::core::{LimitType, Query};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::model::{DocumentKeySet, DocumentMap, DocumentSet, SnapshotVersion};

/// Runs queries against the local view without indexes.
///
/// When a target was last in sync at a known snapshot, the engine starts
/// from the documents the server said matched at that point and only scans
/// documents read since. Limit queries fall back to a full scan when the
/// document at the edge of the limit may have changed.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        view: &LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> DocumentMap {
        // Nothing to gain over a plain scan.
        if query.matches_all_documents() {
            return full_collection_scan(view, query);
        }

        if last_limbo_free_snapshot_version.is_min() {
            return full_collection_scan(view, query);
        }

        let previous_results = apply_query(view, query, remote_keys);
        if (query.has_limit_to_first() || query.has_limit_to_last())
            && needs_refill(
                query.limit_type(),
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return full_collection_scan(view, query);
        }

        log::debug!(
            target: "firestore::local_store",
            "re-using previous result from {:?} to execute query {}",
            last_limbo_free_snapshot_version,
            query.canonical_id()
        );

        let mut results =
            view.get_documents_matching_query(query, last_limbo_free_snapshot_version);
        // Documents from the previous result that were not touched since the
        // snapshot still match.
        for doc in previous_results.iter() {
            results = results.insert(doc.key().clone(), doc.clone());
        }
        results
    }
}

fn full_collection_scan(view: &LocalDocumentsView<'_>, query: &Query) -> DocumentMap {
    log::debug!(
        target: "firestore::local_store",
        "using full collection scan to execute query {}",
        query.canonical_id()
    );
    view.get_documents_matching_query(query, SnapshotVersion::min())
}

/// Local view of `keys` that matches `query`, in query order.
fn apply_query(
    view: &LocalDocumentsView<'_>,
    query: &Query,
    keys: &DocumentKeySet,
) -> DocumentSet {
    view.get_documents(keys)
        .values()
        .filter_map(|doc| doc.as_document())
        .filter(|doc| query.matches(doc))
        .fold(DocumentSet::new(query.comparator()), |set, doc| {
            set.add(doc.clone())
        })
}

/// Whether a limit query's previous result may be missing documents.
///
/// That is the case if documents were dropped since the last sync or if the
/// document at the edge of the limit was modified; a document from outside
/// the previous result could then take its place.
fn needs_refill(
    limit_type: LimitType,
    previous_results: &DocumentSet,
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != previous_results.len() {
        return true;
    }
    let edge = match limit_type {
        LimitType::First => previous_results.last(),
        LimitType::Last => previous_results.first(),
    };
    match edge {
        Some(doc) => doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{FilterOperator, OrderDirection};
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{Document, DocumentKey, Mutation, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(x: i64) -> MapValue {
        MapValue::new(BTreeMap::from([(
            "x".to_string(),
            FirestoreValue::from_integer(x),
        )]))
    }

    fn add(cache: &mut RemoteDocumentCache, path: &str, x: i64, read_time: i64) {
        let version = SnapshotVersion::from_micros(read_time);
        cache.add_entry(Document::new(key(path), version, data(x)).into(), version);
    }

    fn keys(paths: &[&str]) -> DocumentKeySet {
        paths.iter().map(|path| key(path)).collect()
    }

    fn result_keys(results: &DocumentMap) -> Vec<DocumentKey> {
        results.keys().cloned().collect()
    }

    fn filtered() -> Query {
        Query::at_path("rooms")
            .unwrap()
            .filter("x", FilterOperator::GreaterThan, FirestoreValue::from_integer(0))
            .unwrap()
    }

    #[test]
    fn scans_everything_without_a_limbo_free_version() {
        let mut cache = RemoteDocumentCache::new();
        add(&mut cache, "rooms/1", 1, 1);
        add(&mut cache, "rooms/2", 2, 1);
        let queue = MutationQueue::new("");
        let view = LocalDocumentsView::new(&cache, &queue);

        let results = QueryEngine::new().get_documents_matching_query(
            &view,
            &filtered(),
            SnapshotVersion::min(),
            &keys(&["rooms/1"]),
        );
        assert_eq!(result_keys(&results), vec![key("rooms/1"), key("rooms/2")]);
    }

    #[test]
    fn reuses_previous_results_and_scans_newer_documents() {
        let mut cache = RemoteDocumentCache::new();
        add(&mut cache, "rooms/1", 1, 1);
        // Read before the snapshot but not part of the synced result.
        add(&mut cache, "rooms/2", 2, 1);
        add(&mut cache, "rooms/3", 3, 3);
        let queue = MutationQueue::new("");
        let view = LocalDocumentsView::new(&cache, &queue);

        let results = QueryEngine::new().get_documents_matching_query(
            &view,
            &filtered(),
            SnapshotVersion::from_micros(2),
            &keys(&["rooms/1"]),
        );
        assert_eq!(result_keys(&results), vec![key("rooms/1"), key("rooms/3")]);
    }

    #[test]
    fn limit_queries_refill_when_the_edge_document_has_pending_writes() {
        let mut cache = RemoteDocumentCache::new();
        add(&mut cache, "rooms/1", 1, 1);
        add(&mut cache, "rooms/2", 2, 1);
        add(&mut cache, "rooms/3", 3, 1);
        let mut queue = MutationQueue::new("");
        queue.add_mutation_batch(
            Timestamp::new(1, 0),
            Vec::new(),
            vec![Mutation::set(key("rooms/2"), data(10))],
        );
        let view = LocalDocumentsView::new(&cache, &queue);
        let query = filtered()
            .order_by("x", OrderDirection::Ascending)
            .unwrap()
            .limit_to_first(2)
            .unwrap();

        let results = QueryEngine::new().get_documents_matching_query(
            &view,
            &query,
            SnapshotVersion::from_micros(1),
            &keys(&["rooms/1", "rooms/2"]),
        );
        // The full scan finds rooms/3, which the previous result lacked.
        assert!(results.contains_key(&key("rooms/3")));
    }

    #[test]
    fn limit_queries_keep_previous_results_when_the_edge_is_untouched() {
        let mut cache = RemoteDocumentCache::new();
        add(&mut cache, "rooms/1", 1, 1);
        add(&mut cache, "rooms/2", 2, 1);
        add(&mut cache, "rooms/3", 3, 1);
        let queue = MutationQueue::new("");
        let view = LocalDocumentsView::new(&cache, &queue);
        let query = filtered()
            .order_by("x", OrderDirection::Ascending)
            .unwrap()
            .limit_to_first(2)
            .unwrap();

        let results = QueryEngine::new().get_documents_matching_query(
            &view,
            &query,
            SnapshotVersion::from_micros(1),
            &keys(&["rooms/1", "rooms/2"]),
        );
        assert_eq!(result_keys(&results), vec![key("rooms/1"), key("rooms/2")]);
    }
}
