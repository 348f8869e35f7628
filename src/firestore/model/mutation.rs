use crate::firestore::model::{
    Document, DocumentKey, FieldMask, FieldTransform, MaybeDocument, NoDocument, SnapshotVersion,
    Timestamp, UnknownDocument,
};
use crate::firestore::value::{FirestoreValue, MapValue};

/// Condition the backend checks before applying a mutation.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => {
                *exists == maybe_doc.map(MaybeDocument::is_document).unwrap_or(false)
            }
            Precondition::UpdateTime(version) => matches!(
                maybe_doc,
                Some(MaybeDocument::Document(doc)) if doc.version() == *version
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    Set { value: MapValue },
    Patch { data: MapValue, mask: FieldMask },
    Transform { transforms: Vec<FieldTransform> },
    Delete,
    Verify,
}

/// A single write against one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    precondition: Precondition,
    kind: MutationKind,
}

/// What the backend reported for one acknowledged mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    /// Update time of the document, or the commit time when the server did
    /// not report one.
    pub version: SnapshotVersion,
    pub transform_results: Option<Vec<FirestoreValue>>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Option<Vec<FirestoreValue>>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self::new(key, Precondition::None, MutationKind::Set { value })
    }

    /// Patch that requires the document to exist.
    pub fn patch(key: DocumentKey, data: MapValue, mask: FieldMask) -> Self {
        Self::new(key, Precondition::Exists(true), MutationKind::Patch { data, mask })
    }

    pub fn transform(key: DocumentKey, transforms: Vec<FieldTransform>) -> Self {
        Self::new(
            key,
            Precondition::Exists(true),
            MutationKind::Transform { transforms },
        )
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, Precondition::None, MutationKind::Delete)
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self::new(key, precondition, MutationKind::Verify)
    }

    pub fn new(key: DocumentKey, precondition: Precondition, kind: MutationKind) -> Self {
        // Transforms only ever apply to existing documents.
        let precondition = match kind {
            MutationKind::Transform { .. } => Precondition::Exists(true),
            _ => precondition,
        };
        Self {
            key,
            precondition,
            kind,
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        if !matches!(self.kind, MutationKind::Transform { .. }) {
            self.precondition = precondition;
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    /// Applies the mutation to the cached remote state after the backend
    /// accepted it.
    ///
    /// When the precondition does not hold against the cache, the backend
    /// still committed something the client cannot reconstruct, so the result
    /// is an [`UnknownDocument`] at the acknowledged version.
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        result: &MutationResult,
    ) -> Option<MaybeDocument> {
        let version = result.version;
        match &self.kind {
            MutationKind::Set { value } => Some(
                Document::new(self.key.clone(), version, value.clone())
                    .with_committed_mutations()
                    .into(),
            ),
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(maybe_doc) {
                    return Some(self.unknown(version));
                }
                let patched = patch_data(maybe_doc, data, mask);
                Some(
                    Document::new(self.key.clone(), version, patched)
                        .with_committed_mutations()
                        .into(),
                )
            }
            MutationKind::Transform { transforms } => {
                let doc = match maybe_doc {
                    Some(MaybeDocument::Document(doc))
                        if self.precondition.is_valid_for(maybe_doc) =>
                    {
                        doc
                    }
                    _ => return Some(self.unknown(version)),
                };
                let server_results = result.transform_results.as_deref().unwrap_or(&[]);
                let commit_time = version.timestamp();
                let mut data = doc.data().clone();
                for (index, transform) in transforms.iter().enumerate() {
                    let value = transform.operation().apply_to_remote_document(
                        doc.field(transform.field()),
                        server_results.get(index),
                        commit_time,
                    );
                    data.set(transform.field(), value);
                }
                Some(
                    Document::new(self.key.clone(), version, data)
                        .with_committed_mutations()
                        .into(),
                )
            }
            MutationKind::Delete => Some(
                NoDocument::new(self.key.clone(), version)
                    .with_committed_mutations()
                    .into(),
            ),
            MutationKind::Verify => {
                if self.precondition.is_valid_for(maybe_doc) {
                    maybe_doc.cloned()
                } else {
                    Some(self.unknown(version))
                }
            }
        }
    }

    /// Applies the mutation to the user-visible state ahead of
    /// acknowledgement. A failing precondition leaves the input untouched.
    ///
    /// `base_doc` is the state before the enclosing batch ran; transforms read
    /// their previous value from it when the current state lacks the field.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        base_doc: Option<&MaybeDocument>,
        local_write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        if !self.precondition.is_valid_for(maybe_doc) {
            return maybe_doc.cloned();
        }

        match &self.kind {
            MutationKind::Set { value } => Some(
                Document::new(self.key.clone(), post_mutation_version(maybe_doc), value.clone())
                    .with_local_mutations()
                    .into(),
            ),
            MutationKind::Patch { data, mask } => {
                let patched = patch_data(maybe_doc, data, mask);
                Some(
                    Document::new(self.key.clone(), post_mutation_version(maybe_doc), patched)
                        .with_local_mutations()
                        .into(),
                )
            }
            MutationKind::Transform { transforms } => {
                let Some(MaybeDocument::Document(doc)) = maybe_doc else {
                    return maybe_doc.cloned();
                };
                let base = base_doc.and_then(MaybeDocument::as_document);
                let mut data = doc.data().clone();
                for transform in transforms {
                    let previous = doc
                        .field(transform.field())
                        .or_else(|| base.and_then(|base| base.field(transform.field())));
                    let value = transform
                        .operation()
                        .apply_to_local_view(previous, local_write_time);
                    data.set(transform.field(), value);
                }
                Some(
                    Document::new(self.key.clone(), doc.version(), data)
                        .with_local_mutations()
                        .into(),
                )
            }
            MutationKind::Delete => {
                Some(NoDocument::new(self.key.clone(), SnapshotVersion::min()).into())
            }
            MutationKind::Verify => maybe_doc.cloned(),
        }
    }

    /// Values of non-idempotent transforms as seen before the write, or
    /// `None` when the mutation has nothing to capture.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<MapValue> {
        let MutationKind::Transform { transforms } = &self.kind else {
            return None;
        };
        let doc = maybe_doc.and_then(MaybeDocument::as_document);
        let mut base = MapValue::empty();
        for transform in transforms {
            let existing = doc.and_then(|doc| doc.field(transform.field()));
            if let Some(value) = transform.operation().compute_base_value(existing) {
                base.set(transform.field(), value);
            }
        }
        (!base.is_empty()).then_some(base)
    }

    pub fn is_idempotent(&self) -> bool {
        match &self.kind {
            MutationKind::Transform { transforms } => transforms
                .iter()
                .all(|transform| transform.operation().is_idempotent()),
            _ => true,
        }
    }

    fn unknown(&self, version: SnapshotVersion) -> MaybeDocument {
        UnknownDocument::new(self.key.clone(), version).into()
    }
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version(),
        _ => SnapshotVersion::min(),
    }
}

fn patch_data(maybe_doc: Option<&MaybeDocument>, data: &MapValue, mask: &FieldMask) -> MapValue {
    let mut patched = maybe_doc
        .and_then(MaybeDocument::as_document)
        .map(|doc| doc.data().clone())
        .unwrap_or_default();
    for path in mask.fields() {
        match data.field(path) {
            Some(value) => patched.set(path, value.clone()),
            None => patched.delete(path),
        }
    }
    patched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, TransformOperation};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut value = MapValue::empty();
        for (field, entry) in entries {
            value.set(&path(field), entry.clone());
        }
        value
    }

    fn doc(path: &str, version: i64, data: MapValue) -> MaybeDocument {
        Document::new(key(path), SnapshotVersion::from_micros(version), data).into()
    }

    fn ack(version: i64) -> MutationResult {
        MutationResult::new(SnapshotVersion::from_micros(version), None)
    }

    #[test]
    fn set_on_missing_document_has_min_version() {
        let mutation = Mutation::set(key("rooms/1"), map(&[("name", "a".into())]));
        let result = mutation
            .apply_to_local_view(None, None, Timestamp::default())
            .unwrap();
        let doc = result.as_document().unwrap();
        assert!(doc.version().is_min());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.field(&path("name")), Some(&FirestoreValue::from("a")));
    }

    #[test]
    fn patch_leaves_missing_document_untouched() {
        let mutation = Mutation::patch(
            key("rooms/1"),
            map(&[("name", "b".into())]),
            FieldMask::new(vec![path("name")]),
        );
        let missing: MaybeDocument =
            NoDocument::new(key("rooms/1"), SnapshotVersion::from_micros(4)).into();
        assert_eq!(
            mutation.apply_to_local_view(Some(&missing), None, Timestamp::default()),
            Some(missing.clone())
        );
        assert_eq!(mutation.apply_to_local_view(None, None, Timestamp::default()), None);
    }

    #[test]
    fn patch_overlays_masked_fields_and_deletes_absent_ones() {
        let base = doc(
            "rooms/1",
            3,
            map(&[
                ("a", FirestoreValue::from_integer(1)),
                ("b", FirestoreValue::from_integer(2)),
                ("c", FirestoreValue::from_integer(3)),
            ]),
        );
        let mutation = Mutation::patch(
            key("rooms/1"),
            map(&[("a", FirestoreValue::from_integer(10))]),
            FieldMask::new(vec![path("a"), path("b")]),
        );
        let result = mutation
            .apply_to_local_view(Some(&base), None, Timestamp::default())
            .unwrap();
        let doc = result.as_document().unwrap();
        assert_eq!(doc.version(), SnapshotVersion::from_micros(3));
        assert_eq!(doc.field(&path("a")), Some(&FirestoreValue::from_integer(10)));
        assert_eq!(doc.field(&path("b")), None);
        assert_eq!(doc.field(&path("c")), Some(&FirestoreValue::from_integer(3)));
    }

    #[test]
    fn delete_produces_min_version_tombstone_locally() {
        let base = doc("rooms/1", 3, MapValue::empty());
        let mutation = Mutation::delete(key("rooms/1"));
        let result = mutation
            .apply_to_local_view(Some(&base), None, Timestamp::default())
            .unwrap();
        assert!(result.is_no_document());
        assert!(result.version().is_min());

        let remote = mutation.apply_to_remote_document(Some(&base), &ack(7)).unwrap();
        assert_eq!(remote.version(), SnapshotVersion::from_micros(7));
        assert!(remote.has_pending_writes());
    }

    #[test]
    fn failed_precondition_is_noop_locally_and_unknown_remotely() {
        let base = doc("rooms/1", 3, MapValue::empty());
        let verify = Mutation::verify(
            key("rooms/1"),
            Precondition::UpdateTime(SnapshotVersion::from_micros(9)),
        );
        assert_eq!(
            verify.apply_to_local_view(Some(&base), None, Timestamp::default()),
            Some(base.clone())
        );
        let remote = verify.apply_to_remote_document(Some(&base), &ack(10)).unwrap();
        assert!(matches!(remote, MaybeDocument::Unknown(_)));

        let patch = Mutation::patch(key("rooms/1"), MapValue::empty(), FieldMask::default());
        let remote = patch.apply_to_remote_document(None, &ack(10)).unwrap();
        assert!(matches!(remote, MaybeDocument::Unknown(_)));
    }

    #[test]
    fn set_remote_is_committed_at_ack_version() {
        let mutation = Mutation::set(key("rooms/1"), map(&[("name", "a".into())]));
        let result = mutation.apply_to_remote_document(None, &ack(5)).unwrap();
        let doc = result.as_document().unwrap();
        assert_eq!(doc.version(), SnapshotVersion::from_micros(5));
        assert!(doc.has_committed_mutations());
        assert!(!doc.has_local_mutations());
    }

    #[test]
    fn transform_uses_base_document_when_field_missing() {
        let increment = Mutation::transform(
            key("rooms/1"),
            vec![FieldTransform::new(
                path("count"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(2)),
            )],
        );
        let current = doc("rooms/1", 1, MapValue::empty());
        let base = doc("rooms/1", 1, map(&[("count", FirestoreValue::from_integer(5))]));
        let result = increment
            .apply_to_local_view(Some(&current), Some(&base), Timestamp::default())
            .unwrap();
        assert_eq!(
            result.as_document().unwrap().field(&path("count")),
            Some(&FirestoreValue::from_integer(7))
        );
    }

    #[test]
    fn transform_remote_applies_server_results() {
        let increment = Mutation::transform(
            key("rooms/1"),
            vec![FieldTransform::new(
                path("count"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
            )],
        );
        let current = doc("rooms/1", 1, map(&[("count", FirestoreValue::from_integer(1))]));
        let result = MutationResult::new(
            SnapshotVersion::from_micros(8),
            Some(vec![FirestoreValue::from_integer(42)]),
        );
        let applied = increment
            .apply_to_remote_document(Some(&current), &result)
            .unwrap();
        let doc = applied.as_document().unwrap();
        assert_eq!(doc.field(&path("count")), Some(&FirestoreValue::from_integer(42)));
        assert_eq!(doc.version(), SnapshotVersion::from_micros(8));
    }

    #[test]
    fn base_value_only_for_increments() {
        let current = doc("rooms/1", 1, map(&[("count", FirestoreValue::from_integer(4))]));
        let increment = Mutation::transform(
            key("rooms/1"),
            vec![
                FieldTransform::new(
                    path("count"),
                    TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
                ),
                FieldTransform::new(path("at"), TransformOperation::ServerTimestamp),
            ],
        );
        let base = increment.extract_base_value(Some(&current)).unwrap();
        assert_eq!(base.field_mask(), vec![path("count")]);
        assert!(!increment.is_idempotent());

        let stamp = Mutation::transform(
            key("rooms/1"),
            vec![FieldTransform::new(path("at"), TransformOperation::ServerTimestamp)],
        );
        assert!(stamp.extract_base_value(Some(&current)).is_none());
    }
}
