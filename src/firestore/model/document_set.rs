use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::util::{SortedMap, SortedSet};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents ordered by a query comparator, tie-broken by key, with O(log n)
/// lookup by key.
#[derive(Clone)]
pub struct DocumentSet {
    key_index: SortedMap<DocumentKey, Document>,
    sorted: SortedSet<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        let ordering = Arc::new(move |left: &Document, right: &Document| {
            comparator(left, right).then_with(|| left.key().cmp(right.key()))
        });
        Self {
            key_index: SortedMap::new(),
            sorted: SortedSet::with_comparator(ordering),
        }
    }

    /// A set ordered by document key only.
    pub fn empty_by_key() -> Self {
        Self::new(Arc::new(|_: &Document, _: &Document| Ordering::Equal))
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.key_index.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.key_index.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn len(&self) -> usize {
        self.key_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_index.is_empty()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.key_index.get(key)?;
        self.sorted.index_of(doc)
    }

    /// Returns a set containing `doc`, replacing any document with the same key.
    pub fn add(&self, doc: Document) -> Self {
        let without = self.delete(doc.key());
        Self {
            key_index: without.key_index.insert(doc.key().clone(), doc.clone()),
            sorted: without.sorted.insert(doc),
        }
    }

    pub fn delete(&self, key: &DocumentKey) -> Self {
        match self.key_index.get(key) {
            Some(existing) => Self {
                key_index: self.key_index.remove(key),
                sorted: self.sorted.remove(existing),
            },
            None => self.clone(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(l, r)| l == r)
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}
