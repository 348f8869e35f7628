use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::core::TargetId;
use crate::firestore::error::{
    internal_error, invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::model::{DocumentKey, MaybeDocument, NoDocument, SnapshotVersion};
use crate::firestore::remote::serializer::{decode_bytes, JsonProtoSerializer};

/// One decoded message from the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    TargetChange(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

/// A document entered, changed in, or left one or more targets.
///
/// `new_doc` is `None` when the document merely stopped matching
/// (`documentRemove`); a deletion carries a [`NoDocument`].
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<MaybeDocument>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means the change applies to every active target.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub cause: Option<FirestoreError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(target_change);
    }

    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change);
    }

    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete);
    }

    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove);
    }

    if let Some(filter) = value.get("filter") {
        return decode_filter_change(filter);
    }

    Err(invalid_argument(format!("Unknown listen response: {value}")))
}

fn decode_target_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_ids = numeric_array(value.get("targetIds"));
    let resume_token = decode_bytes(value.get("resumeToken"))?;
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(WatchTargetChangeState::NoChange);

    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| internal_error(format!("Failed to decode watch cause: {err}")))?
        .and_then(|cause| {
            FirestoreErrorCode::from_rpc_code(cause.code).map(|code| {
                FirestoreError::new(
                    code,
                    cause
                        .message
                        .unwrap_or_else(|| "watch stream error".to_string()),
                )
            })
        });

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let doc = serializer.decode_document(document)?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: doc.key().clone(),
        new_doc: Some(doc.into()),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let read_time = match value.get("readTime") {
        Some(read_time) => serializer.decode_version(read_time)?,
        None => SnapshotVersion::min(),
    };
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_doc: Some(NoDocument::new(key.clone(), read_time).into()),
        key,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn document_key(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    kind: &str,
) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
    serializer.document_key_from_name(name)
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value
        .get("count")
        .and_then(JsonValue::as_u64)
        .unwrap_or_default() as usize;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        count,
    }))
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> WatchTargetChangeState {
    match value {
        "ADD" => WatchTargetChangeState::Added,
        "REMOVE" => WatchTargetChangeState::Removed,
        "CURRENT" => WatchTargetChangeState::Current,
        "RESET" => WatchTargetChangeState::Reset,
        _ => WatchTargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, Timestamp};
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    fn name(path: &str) -> String {
        format!("projects/project/databases/(default)/documents/{path}")
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [1, 2],
                "resumeToken": BASE64_STANDARD.encode([1u8, 2, 3]),
                "targetChangeType": "CURRENT"
            }
        });

        match decode_watch_change(&serializer(), &change).unwrap() {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![1, 2]);
                assert_eq!(change.resume_token, vec![1, 2, 3]);
                assert_eq!(change.state, WatchTargetChangeState::Current);
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn removal_causes_map_to_error_codes() {
        let change = json!({
            "targetChange": {
                "targetIds": [4],
                "targetChangeType": "REMOVE",
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let WatchChange::TargetChange(change) =
            decode_watch_change(&serializer(), &change).unwrap()
        else {
            panic!("expected a target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn document_messages_decode_to_document_changes() {
        let serializer = serializer();
        let changed = decode_watch_change(
            &serializer,
            &json!({
                "documentChange": {
                    "document": {
                        "name": name("rooms/1"),
                        "fields": { "name": { "stringValue": "a" } },
                        "updateTime": "1970-01-01T00:00:05Z"
                    },
                    "targetIds": [2],
                    "removedTargetIds": [4]
                }
            }),
        )
        .unwrap();
        let WatchChange::Document(changed) = changed else {
            panic!("expected a document change");
        };
        assert_eq!(changed.updated_target_ids, vec![2]);
        assert_eq!(changed.removed_target_ids, vec![4]);
        assert!(changed.new_doc.unwrap().is_document());

        let deleted = decode_watch_change(
            &serializer,
            &json!({
                "documentDelete": {
                    "document": name("rooms/1"),
                    "readTime": "1970-01-01T00:00:06Z",
                    "removedTargetIds": [2]
                }
            }),
        )
        .unwrap();
        let WatchChange::Document(deleted) = deleted else {
            panic!("expected a document change");
        };
        let doc = deleted.new_doc.unwrap();
        assert!(doc.is_no_document());
        assert_eq!(doc.version(), SnapshotVersion::new(Timestamp::new(6, 0)));

        let removed = decode_watch_change(
            &serializer,
            &json!({ "documentRemove": { "document": name("rooms/1"), "removedTargetIds": [2] } }),
        )
        .unwrap();
        let WatchChange::Document(removed) = removed else {
            panic!("expected a document change");
        };
        assert!(removed.new_doc.is_none());
    }

    #[test]
    fn decodes_existence_filters() {
        let change = decode_watch_change(
            &serializer(),
            &json!({ "filter": { "targetId": 2, "count": 3 } }),
        )
        .unwrap();
        assert_eq!(
            change,
            WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: 2,
                count: 3
            })
        );
    }

    #[test]
    fn unknown_messages_are_rejected() {
        assert!(decode_watch_change(&serializer(), &json!({ "other": {} })).is_err());
    }
}
