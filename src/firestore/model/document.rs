use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::util::{SortedMap, SortedSet};
use crate::firestore::value::{FirestoreValue, MapValue};

pub type DocumentKeySet = SortedSet<DocumentKey>;
pub type DocumentMap = SortedMap<DocumentKey, Document>;
pub type MaybeDocumentMap = SortedMap<DocumentKey, MaybeDocument>;
pub type DocumentVersionMap = SortedMap<DocumentKey, SnapshotVersion>;

/// A document known to exist, together with its field data.
#[derive(Clone, Debug, PartialEq)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    data: MapValue,
    has_local_mutations: bool,
    has_committed_mutations: bool,
}

impl Document {
    pub fn new(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self {
            key,
            version,
            data,
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn with_local_mutations(mut self) -> Self {
        self.has_local_mutations = true;
        self.has_committed_mutations = false;
        self
    }

    pub fn with_committed_mutations(mut self) -> Self {
        self.has_committed_mutations = true;
        self.has_local_mutations = false;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.has_local_mutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations || self.has_committed_mutations
    }
}

/// A document known not to exist at `version`.
#[derive(Clone, Debug, PartialEq)]
pub struct NoDocument {
    key: DocumentKey,
    version: SnapshotVersion,
    has_committed_mutations: bool,
}

impl NoDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            version,
            has_committed_mutations: false,
        }
    }

    pub fn with_committed_mutations(mut self) -> Self {
        self.has_committed_mutations = true;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }
}

/// A document whose state could not be reconstructed locally after the
/// server acknowledged a write to it. Only its version is known.
#[derive(Clone, Debug, PartialEq)]
pub struct UnknownDocument {
    key: DocumentKey,
    version: SnapshotVersion,
}

impl UnknownDocument {
    pub fn new(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self { key, version }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MaybeDocument {
    Document(Document),
    NoDocument(NoDocument),
    Unknown(UnknownDocument),
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => doc.key(),
            MaybeDocument::NoDocument(doc) => doc.key(),
            MaybeDocument::Unknown(doc) => doc.key(),
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document(doc) => doc.version(),
            MaybeDocument::NoDocument(doc) => doc.version(),
            MaybeDocument::Unknown(doc) => doc.version(),
        }
    }

    /// Whether local or acknowledged-but-unconfirmed writes shaped this state.
    pub fn has_pending_writes(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.has_pending_writes(),
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations(),
            MaybeDocument::Unknown(_) => true,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn into_document(self) -> Option<Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, MaybeDocument::Document(_))
    }

    pub fn is_no_document(&self) -> bool {
        matches!(self, MaybeDocument::NoDocument(_))
    }
}

impl From<Document> for MaybeDocument {
    fn from(value: Document) -> Self {
        MaybeDocument::Document(value)
    }
}

impl From<NoDocument> for MaybeDocument {
    fn from(value: NoDocument) -> Self {
        MaybeDocument::NoDocument(value)
    }
}

impl From<UnknownDocument> for MaybeDocument {
    fn from(value: UnknownDocument) -> Self {
        MaybeDocument::Unknown(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn pending_write_flags() {
        let doc = Document::new(key("rooms/1"), SnapshotVersion::min(), MapValue::empty());
        assert!(!doc.has_pending_writes());
        let local = doc.clone().with_local_mutations();
        assert!(local.has_local_mutations());
        let committed = local.with_committed_mutations();
        assert!(!committed.has_local_mutations());
        assert!(committed.has_pending_writes());
    }

    #[test]
    fn maybe_document_accessors() {
        let missing: MaybeDocument =
            NoDocument::new(key("rooms/2"), SnapshotVersion::from_micros(3)).into();
        assert_eq!(missing.key(), &key("rooms/2"));
        assert!(missing.as_document().is_none());
        assert!(!missing.has_pending_writes());
        let unknown: MaybeDocument =
            UnknownDocument::new(key("rooms/3"), SnapshotVersion::from_micros(4)).into();
        assert!(unknown.has_pending_writes());
    }
}
