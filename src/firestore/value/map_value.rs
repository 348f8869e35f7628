use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Field map of a document or of a nested map value.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value stored at `path`, descending through nested maps.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = match current.kind() {
                ValueKind::Map(child) => child.fields.get(segment)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Stores `value` at `path`, creating intermediate maps and replacing any
    /// non-map value found on the way.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the value at `path`. Missing parents are ignored.
    pub fn delete(&mut self, path: &FieldPath) {
        delete_segments(&mut self.fields, path.segments());
    }

    /// Paths of every leaf value. A nested map that is empty counts as a leaf.
    pub fn field_mask(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        paths
    }
}

fn set_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child = match fields.remove(first).map(FirestoreValue::into_kind) {
        Some(ValueKind::Map(map)) => map.into_fields(),
        _ => BTreeMap::new(),
    };
    set_segments(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    let Some(existing) = fields.get(first) else {
        return;
    };
    let Some(child) = existing.as_map() else {
        return;
    };
    let mut child_fields = child.fields().clone();
    delete_segments(&mut child_fields, rest);
    fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        prefix.push(key.clone());
        match value.as_map() {
            Some(child) if !child.is_empty() => collect_leaf_paths(child.fields(), prefix, out),
            _ => out.push(FieldPath::from_segments_unchecked(prefix.clone())),
        }
        prefix.pop();
    }
}
