use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{
    Bound, FieldFilter, FilterOperator, OrderBy, OrderDirection, Query, Target, TargetId,
};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint,
    MaybeDocument, Mutation, MutationKind, MutationResult, NoDocument, Precondition,
    ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Decoded response on the write stream.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

/// Converts between model types and the JSON form of the database's RPC
/// messages.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub(crate) fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    fn resource_path_from_name(&self, name: &str) -> FirestoreResult<ResourcePath> {
        let root = self.documents_root();
        let relative = name
            .strip_prefix(&root)
            .ok_or_else(|| invalid_argument(format!("Resource name '{name}' is not in {root}")))?;
        ResourcePath::from_string(relative.trim_start_matches('/'))
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.resource_path_from_name(name)?)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> JsonValue {
        JsonValue::String(encode_timestamp(&version.timestamp()))
    }

    pub fn decode_version(&self, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        let text = value
            .as_str()
            .ok_or_else(|| invalid_argument("Expected timestamp string"))?;
        Ok(SnapshotVersion::new(parse_timestamp(text)?))
    }

    fn optional_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value {
            Some(value) => self.decode_version(value),
            None => Ok(SnapshotVersion::min()),
        }
    }

    pub fn decode_document_fields(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        self.decode_map_value(value)
    }

    pub fn encode_document(&self, doc: &Document) -> JsonValue {
        json!({
            "name": self.document_name(doc.key()),
            "fields": self.encode_map_fields(doc.data()),
            "updateTime": self.encode_version(doc.version()),
        })
    }

    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let data = self.decode_document_fields(value)?;
        let version = self.optional_version(value.get("updateTime"))?;
        Ok(Document::new(key, version, data))
    }

    /// Decodes one entry of a batch-get response.
    pub fn decode_maybe_document(&self, value: &JsonValue) -> FirestoreResult<MaybeDocument> {
        if let Some(found) = value.get("found") {
            return self.decode_document(found).map(MaybeDocument::from);
        }
        if let Some(missing) = value.get("missing").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(missing)?;
            let version = self.optional_version(value.get("readTime"))?;
            return Ok(NoDocument::new(key, version).into());
        }
        Err(invalid_argument(
            "Batch get response must contain 'found' or 'missing'",
        ))
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let name = self.document_name(mutation.key());
        let mut write = serde_json::Map::new();
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": self.encode_map_fields(value) }),
                );
            }
            MutationKind::Patch { data, mask } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": name, "fields": self.encode_map_fields(data) }),
                );
                let paths: Vec<String> =
                    mask.fields().iter().map(FieldPath::canonical_string).collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Transform { transforms } => {
                write.insert(
                    "transform".to_string(),
                    json!({
                        "document": name,
                        "fieldTransforms": transforms
                            .iter()
                            .map(|transform| self.encode_field_transform(transform))
                            .collect::<Vec<_>>(),
                    }),
                );
            }
            MutationKind::Delete => {
                write.insert("delete".to_string(), JsonValue::String(name));
            }
            MutationKind::Verify => {
                write.insert("verify".to_string(), JsonValue::String(name));
            }
        }

        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".to_string(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".to_string(),
                    json!({ "updateTime": self.encode_version(*version) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = match value.get("currentDocument") {
            None => Precondition::None,
            Some(current) => {
                if let Some(exists) = current.get("exists").and_then(JsonValue::as_bool) {
                    Precondition::Exists(exists)
                } else if let Some(update_time) = current.get("updateTime") {
                    Precondition::UpdateTime(self.decode_version(update_time)?)
                } else {
                    return Err(invalid_argument("Unknown precondition"));
                }
            }
        };

        if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Update write missing name"))?;
            let key = self.document_key_from_name(name)?;
            let data = self.decode_document_fields(update)?;
            let kind = match value.get("updateMask") {
                Some(mask) => MutationKind::Patch {
                    data,
                    mask: self.decode_field_mask(mask)?,
                },
                None => MutationKind::Set { value: data },
            };
            return Ok(Mutation::new(key, precondition, kind));
        }

        if let Some(transform) = value.get("transform") {
            let name = transform
                .get("document")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("Transform write missing document"))?;
            let key = self.document_key_from_name(name)?;
            let transforms = transform
                .get("fieldTransforms")
                .and_then(JsonValue::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|entry| self.decode_field_transform(entry))
                        .collect::<FirestoreResult<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            return Ok(Mutation::new(
                key,
                precondition,
                MutationKind::Transform { transforms },
            ));
        }

        if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(name)?;
            return Ok(Mutation::new(key, precondition, MutationKind::Delete));
        }

        if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(name)?;
            return Ok(Mutation::new(key, precondition, MutationKind::Verify));
        }

        Err(invalid_argument("Unknown write type"))
    }

    fn decode_field_mask(&self, value: &JsonValue) -> FirestoreResult<FieldMask> {
        let fields = value
            .get("fieldPaths")
            .and_then(JsonValue::as_array)
            .map(|paths| {
                paths
                    .iter()
                    .map(|path| {
                        path.as_str()
                            .ok_or_else(|| invalid_argument("Field path must be a string"))
                            .and_then(FieldPath::from_dot_separated)
                    })
                    .collect::<FirestoreResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        Ok(FieldMask::new(fields))
    }

    fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field().canonical_string();
        match transform.operation() {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements
                        .iter()
                        .map(|value| self.encode_value(value))
                        .collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements
                        .iter()
                        .map(|value| self.encode_value(value))
                        .collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": self.encode_value(operand)
            }),
        }
    }

    fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Field transform missing fieldPath"))
            .and_then(FieldPath::from_dot_separated)?;
        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(union) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(self.decode_array_values(union)?)
        } else if let Some(remove) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(self.decode_array_values(remove)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(self.decode_value(operand)?)
        } else {
            return Err(invalid_argument("Unknown field transform"));
        };
        Ok(FieldTransform::new(field, operation))
    }

    /// Decodes the write results of a commit. Results without an update time
    /// report the commit version.
    pub fn decode_write_results(
        &self,
        results: Option<&JsonValue>,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<Vec<MutationResult>> {
        let Some(entries) = results.and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };
        entries
            .iter()
            .map(|entry| {
                let version = match entry.get("updateTime") {
                    Some(update_time) => self.decode_version(update_time)?,
                    None => commit_version,
                };
                let transform_results = entry
                    .get("transformResults")
                    .and_then(JsonValue::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .map(|value| self.decode_value(value))
                            .collect::<FirestoreResult<Vec<_>>>()
                    })
                    .transpose()?;
                Ok(MutationResult::new(version, transform_results))
            })
            .collect()
    }

    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = decode_bytes(value.get("streamToken"))?;
        let commit_version = self.optional_version(value.get("commitTime"))?;
        let mutation_results =
            self.decode_write_results(value.get("writeResults"), commit_version)?;
        Ok(WriteResponse {
            stream_token,
            commit_version,
            mutation_results,
        })
    }

    pub fn encode_write_handshake(&self, stream_token: &[u8]) -> JsonValue {
        let mut request = serde_json::Map::new();
        request.insert("database".to_string(), json!(self.database_name()));
        if !stream_token.is_empty() {
            request.insert(
                "streamToken".to_string(),
                json!(BASE64_STANDARD.encode(stream_token)),
            );
        }
        JsonValue::Object(request)
    }

    pub fn encode_write_request(&self, stream_token: &[u8], mutations: &[Mutation]) -> JsonValue {
        json!({
            "streamToken": BASE64_STANDARD.encode(stream_token),
            "writes": mutations
                .iter()
                .map(|mutation| self.encode_mutation(mutation))
                .collect::<Vec<_>>(),
        })
    }

    pub fn encode_listen_request(&self, target_data: &TargetData) -> JsonValue {
        json!({
            "database": self.database_name(),
            "addTarget": self.encode_target(target_data),
        })
    }

    pub fn encode_unlisten_request(&self, target_id: TargetId) -> JsonValue {
        json!({
            "database": self.database_name(),
            "removeTarget": target_id,
        })
    }

    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = serde_json::Map::new();
        if target.is_document_query() {
            encoded.insert(
                "documents".to_string(),
                json!({ "documents": [self.resource_name(&target.path)] }),
            );
        } else {
            encoded.insert("query".to_string(), self.encode_query_target(target));
        }
        encoded.insert("targetId".to_string(), json!(target_data.target_id));
        if !target_data.resume_token.is_empty() {
            encoded.insert(
                "resumeToken".to_string(),
                json!(BASE64_STANDARD.encode(&target_data.resume_token)),
            );
        }
        JsonValue::Object(encoded)
    }

    /// Encodes a target as a `{parent, structuredQuery}` pair.
    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let (parent, from) = match &target.collection_group {
            Some(group) => (
                self.resource_name(&target.path),
                json!({ "collectionId": group, "allDescendants": true }),
            ),
            None => (
                self.resource_name(&target.path.without_last()),
                json!({ "collectionId": target.path.last_segment().unwrap_or_default() }),
            ),
        };

        let mut structured = serde_json::Map::new();
        structured.insert("from".to_string(), json!([from]));
        if let Some(filter) = self.encode_filters(&target.filters) {
            structured.insert("where".to_string(), filter);
        }
        if !target.order_by.is_empty() {
            structured.insert(
                "orderBy".to_string(),
                JsonValue::Array(
                    target
                        .order_by
                        .iter()
                        .map(|order| {
                            json!({
                                "field": { "fieldPath": order.field().canonical_string() },
                                "direction": order.direction().as_str(),
                            })
                        })
                        .collect(),
                ),
            );
        }
        if let Some(limit) = target.limit {
            structured.insert("limit".to_string(), json!(limit));
        }
        if let Some(bound) = &target.start_at {
            structured.insert("startAt".to_string(), self.encode_bound(bound));
        }
        if let Some(bound) = &target.end_at {
            structured.insert("endAt".to_string(), self.encode_bound(bound));
        }

        json!({
            "parent": parent,
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    pub fn decode_query_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let parent = value
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Query target missing parent"))?;
        let parent = self.resource_path_from_name(parent)?;
        let structured = value
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("Query target missing structuredQuery"))?;

        let from = structured
            .get("from")
            .and_then(JsonValue::as_array)
            .and_then(|entries| entries.first())
            .ok_or_else(|| invalid_argument("Structured query must select one collection"))?;
        let collection_id = from
            .get("collectionId")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Collection selector missing collectionId"))?;
        let all_descendants = from
            .get("allDescendants")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let (path, collection_group) = if all_descendants {
            (parent, Some(collection_id.to_string()))
        } else {
            (parent.child([collection_id]), None)
        };

        let filters = match structured.get("where") {
            Some(filter) => self.decode_filters(filter)?,
            None => Vec::new(),
        };
        let order_by = structured
            .get("orderBy")
            .and_then(JsonValue::as_array)
            .map(|orders| {
                orders
                    .iter()
                    .map(|order| self.decode_order_by(order))
                    .collect::<FirestoreResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        let limit = structured
            .get("limit")
            .and_then(JsonValue::as_u64)
            .map(|limit| limit as u32);
        let start_at = structured
            .get("startAt")
            .map(|bound| self.decode_bound(bound))
            .transpose()?;
        let end_at = structured
            .get("endAt")
            .map(|bound| self.decode_bound(bound))
            .transpose()?;

        Ok(Target {
            path,
            collection_group,
            order_by,
            filters,
            limit,
            start_at,
            end_at,
        })
    }

    /// Decodes a `documents` target back into the document's path.
    pub fn decode_documents_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let name = value
            .get("documents")
            .and_then(JsonValue::as_array)
            .and_then(|names| names.first())
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Documents target must name one document"))?;
        let key = self.document_key_from_name(name)?;
        Ok(Query::new(key.path().clone()).to_target())
    }

    fn encode_filters(&self, filters: &[FieldFilter]) -> Option<JsonValue> {
        match filters {
            [] => None,
            [filter] => Some(self.encode_filter(filter)),
            filters => Some(json!({
                "compositeFilter": {
                    "op": "AND",
                    "filters": filters
                        .iter()
                        .map(|filter| self.encode_filter(filter))
                        .collect::<Vec<_>>(),
                }
            })),
        }
    }

    fn encode_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field().canonical_string() });
        let unary = match (filter.operator(), filter.value()) {
            (FilterOperator::Equal, value) if value.is_null() => Some("IS_NULL"),
            (FilterOperator::Equal, value) if value.is_nan() => Some("IS_NAN"),
            (FilterOperator::NotEqual, value) if value.is_null() => Some("IS_NOT_NULL"),
            (FilterOperator::NotEqual, value) if value.is_nan() => Some("IS_NOT_NAN"),
            _ => None,
        };
        match unary {
            Some(op) => json!({ "unaryFilter": { "field": field, "op": op } }),
            None => json!({
                "fieldFilter": {
                    "field": field,
                    "op": filter.operator().as_str(),
                    "value": self.encode_value(filter.value()),
                }
            }),
        }
    }

    fn decode_filters(&self, value: &JsonValue) -> FirestoreResult<Vec<FieldFilter>> {
        if let Some(composite) = value.get("compositeFilter") {
            let op = composite.get("op").and_then(JsonValue::as_str);
            if op != Some("AND") {
                return Err(invalid_argument("Only AND composite filters are supported"));
            }
            let mut filters = Vec::new();
            for entry in composite
                .get("filters")
                .and_then(JsonValue::as_array)
                .into_iter()
                .flatten()
            {
                filters.extend(self.decode_filters(entry)?);
            }
            return Ok(filters);
        }
        self.decode_filter(value).map(|filter| vec![filter])
    }

    fn decode_filter(&self, value: &JsonValue) -> FirestoreResult<FieldFilter> {
        if let Some(unary) = value.get("unaryFilter") {
            let field = decode_field_reference(unary.get("field"))?;
            let (operator, operand) = match unary.get("op").and_then(JsonValue::as_str) {
                Some("IS_NULL") => (FilterOperator::Equal, FirestoreValue::null()),
                Some("IS_NAN") => (FilterOperator::Equal, FirestoreValue::from_double(f64::NAN)),
                Some("IS_NOT_NULL") => (FilterOperator::NotEqual, FirestoreValue::null()),
                Some("IS_NOT_NAN") => {
                    (FilterOperator::NotEqual, FirestoreValue::from_double(f64::NAN))
                }
                other => {
                    return Err(invalid_argument(format!(
                        "Unknown unary filter operator {other:?}"
                    )))
                }
            };
            return FieldFilter::new(field, operator, operand);
        }

        let filter = value
            .get("fieldFilter")
            .ok_or_else(|| invalid_argument("Unknown filter type"))?;
        let field = decode_field_reference(filter.get("field"))?;
        let operator = filter
            .get("op")
            .and_then(JsonValue::as_str)
            .and_then(FilterOperator::from_wire)
            .ok_or_else(|| invalid_argument("Unknown filter operator"))?;
        let operand = filter
            .get("value")
            .ok_or_else(|| invalid_argument("Field filter missing value"))?;
        FieldFilter::new(field, operator, self.decode_value(operand)?)
    }

    fn decode_order_by(&self, value: &JsonValue) -> FirestoreResult<OrderBy> {
        let field = decode_field_reference(value.get("field"))?;
        let direction = match value.get("direction").and_then(JsonValue::as_str) {
            Some("DESCENDING") => OrderDirection::Descending,
            _ => OrderDirection::Ascending,
        };
        Ok(OrderBy::new(field, direction))
    }

    fn encode_bound(&self, bound: &Bound) -> JsonValue {
        json!({
            "values": bound
                .position()
                .iter()
                .map(|value| self.encode_value(value))
                .collect::<Vec<_>>(),
            "before": bound.before(),
        })
    }

    fn decode_bound(&self, value: &JsonValue) -> FirestoreResult<Bound> {
        let position = self.decode_array_values(value)?;
        let before = value
            .get("before")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        Ok(Bound::new(position, before))
    }

    /// The global snapshot version carried by a listen response, or `min`
    /// when the response does not close a consistent snapshot.
    pub fn version_from_listen_response(
        &self,
        value: &JsonValue,
    ) -> FirestoreResult<SnapshotVersion> {
        let Some(change) = value.get("targetChange") else {
            return Ok(SnapshotVersion::min());
        };
        let has_targets = change
            .get("targetIds")
            .and_then(JsonValue::as_array)
            .is_some_and(|ids| !ids.is_empty());
        if has_targets {
            return Ok(SnapshotVersion::min());
        }
        let state = change
            .get("targetChangeType")
            .and_then(JsonValue::as_str)
            .unwrap_or("NO_CHANGE");
        if state != "NO_CHANGE" {
            return Ok(SnapshotVersion::min());
        }
        self.optional_version(change.get("readTime"))
    }

    fn decode_array_values(&self, value: &JsonValue) -> FirestoreResult<Vec<FirestoreValue>> {
        match value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(|entry| self.decode_value(entry))
                .collect(),
            None => Ok(Vec::new()),
        }
    }

    fn encode_map_fields(&self, map: &MapValue) -> JsonValue {
        let mut fields = serde_json::Map::new();
        for (key, value) in map.fields() {
            fields.insert(key.clone(), self.encode_value(value));
        }
        JsonValue::Object(fields)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        match value.kind() {
            ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
            ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
            ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
            ValueKind::Double(double) if double.is_nan() => json!({ "doubleValue": "NaN" }),
            ValueKind::Double(double) => json!({ "doubleValue": double }),
            ValueKind::Timestamp(timestamp) => {
                json!({ "timestampValue": encode_timestamp(timestamp) })
            }
            ValueKind::String(string) => json!({ "stringValue": string }),
            ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
            ValueKind::Reference(path) => match ResourcePath::from_string(path) {
                Ok(path) => json!({ "referenceValue": self.resource_name(&path) }),
                Err(_) => json!({ "referenceValue": path }),
            },
            ValueKind::GeoPoint(point) => json!({
                "geoPointValue": {
                    "latitude": point.latitude(),
                    "longitude": point.longitude(),
                }
            }),
            ValueKind::Array(array) => {
                let values = array
                    .values()
                    .iter()
                    .map(|value| self.encode_value(value))
                    .collect::<Vec<_>>();
                json!({ "arrayValue": { "values": values } })
            }
            ValueKind::Map(map) => json!({
                "mapValue": {
                    "fields": self.encode_map_fields(map)
                }
            }),
        }
    }

    fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        let map = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected object for map value"))?;
        let fields_object = match map.get("fields") {
            Some(fields_value) => fields_value
                .as_object()
                .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
            None => return Ok(MapValue::empty()),
        };

        let mut fields = BTreeMap::new();
        for (key, value) in fields_object {
            fields.insert(key.clone(), self.decode_value(value)?);
        }
        Ok(MapValue::new(fields))
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
        if object.contains_key("nullValue") {
            return Ok(FirestoreValue::null());
        }
        if let Some(bool_value) = object.get("booleanValue") {
            let value = bool_value
                .as_bool()
                .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
            return Ok(FirestoreValue::from_bool(value));
        }
        if let Some(integer_value) = object.get("integerValue") {
            let parsed = match integer_value {
                JsonValue::String(value) => i64::from_str(value)
                    .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
                JsonValue::Number(number) => number
                    .as_i64()
                    .ok_or_else(|| invalid_argument("Integer out of range"))?,
                _ => return Err(invalid_argument("integerValue must be a string or number")),
            };
            return Ok(FirestoreValue::from_integer(parsed));
        }
        if let Some(double_value) = object.get("doubleValue") {
            let parsed = match double_value {
                JsonValue::Number(number) => number
                    .as_f64()
                    .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
                JsonValue::String(value) => value
                    .parse::<f64>()
                    .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
                _ => return Err(invalid_argument("doubleValue must be a number or string")),
            };
            return Ok(FirestoreValue::from_double(parsed));
        }
        if let Some(timestamp_value) = object.get("timestampValue") {
            let timestamp_str = timestamp_value
                .as_str()
                .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
            return Ok(FirestoreValue::from_timestamp(parse_timestamp(
                timestamp_str,
            )?));
        }
        if let Some(string_value) = object.get("stringValue") {
            let str_value = string_value
                .as_str()
                .ok_or_else(|| invalid_argument("stringValue must be string"))?;
            return Ok(FirestoreValue::from_string(str_value));
        }
        if let Some(bytes_value) = object.get("bytesValue") {
            let str_value = bytes_value
                .as_str()
                .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
            let decoded = BytesValue::from_base64(str_value)
                .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
            return Ok(FirestoreValue::from_bytes(decoded));
        }
        if let Some(reference_value) = object.get("referenceValue") {
            let name = reference_value
                .as_str()
                .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
            let path = self
                .resource_path_from_name(name)
                .map(|path| path.canonical_string())
                .unwrap_or_else(|_| name.to_string());
            return Ok(FirestoreValue::from_reference(path));
        }
        if let Some(geo_point) = object.get("geoPointValue") {
            let latitude = geo_point
                .get("latitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or_default();
            let longitude = geo_point
                .get("longitude")
                .and_then(JsonValue::as_f64)
                .unwrap_or_default();
            return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
                latitude, longitude,
            )?));
        }
        if let Some(array_value) = object.get("arrayValue") {
            return Ok(FirestoreValue::from_array(
                self.decode_array_values(array_value)?,
            ));
        }
        if let Some(map_value) = object.get("mapValue") {
            return Ok(FirestoreValue::from_map_value(
                self.decode_map_value(map_value)?,
            ));
        }

        Err(invalid_argument("Unknown Firestore value type"))
    }
}

fn decode_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("Field reference missing fieldPath"))
        .and_then(|path| {
            if path == FieldPath::document_id().canonical_string() {
                Ok(FieldPath::document_id())
            } else {
                FieldPath::from_dot_separated(path)
            }
        })
}

pub(crate) fn decode_bytes(value: Option<&JsonValue>) -> FirestoreResult<Vec<u8>> {
    match value.and_then(JsonValue::as_str) {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .map_err(|err| invalid_argument(format!("Invalid base64 token: {err}"))),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn encode_timestamp(timestamp: &Timestamp) -> String {
    Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}
