use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::TargetId;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::remote_document_cache::RemoteDocumentEntry;
use crate::firestore::local::target_cache::{QueryPurpose, TargetData};
use crate::firestore::model::{
    BatchId, DocumentKey, MaybeDocument, Mutation, MutationBatch, NoDocument, SnapshotVersion,
    Timestamp, UnknownDocument,
};
use crate::firestore::remote::serializer::{decode_bytes, JsonProtoSerializer};

/// Timestamp as stored locally, without the precision loss of RFC 3339.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTimestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl From<Timestamp> for DbTimestamp {
    fn from(value: Timestamp) -> Self {
        Self {
            seconds: value.seconds,
            nanos: value.nanos,
        }
    }
}

impl From<DbTimestamp> for Timestamp {
    fn from(value: DbTimestamp) -> Self {
        Timestamp::new(value.seconds, value.nanos)
    }
}

impl From<SnapshotVersion> for DbTimestamp {
    fn from(value: SnapshotVersion) -> Self {
        value.timestamp().into()
    }
}

impl From<DbTimestamp> for SnapshotVersion {
    fn from(value: DbTimestamp) -> Self {
        SnapshotVersion::new(value.into())
    }
}

/// Per-user metadata of the mutation queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbMutationQueue {
    pub last_acknowledged_batch_id: BatchId,
    #[serde(default)]
    pub last_stream_token: String,
}

/// Metadata shared by all targets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: i64,
    pub last_remote_snapshot_version: DbTimestamp,
}

/// Encodes cached state into the records kept by the storage engine.
#[derive(Clone, Debug)]
pub struct LocalSerializer {
    remote: JsonProtoSerializer,
}

impl LocalSerializer {
    pub fn new(remote: JsonProtoSerializer) -> Self {
        Self { remote }
    }

    pub fn remote_serializer(&self) -> &JsonProtoSerializer {
        &self.remote
    }

    pub fn encode_remote_document(&self, entry: &RemoteDocumentEntry) -> JsonValue {
        let read_time = DbTimestamp::from(entry.read_time);
        match &entry.doc {
            MaybeDocument::Document(doc) => json!({
                "document": self.remote.encode_document(doc),
                "hasCommittedMutations": doc.has_committed_mutations(),
                "readTime": read_time,
            }),
            MaybeDocument::NoDocument(doc) => json!({
                "noDocument": {
                    "path": doc.key().path().canonical_string(),
                    "readTime": DbTimestamp::from(doc.version()),
                },
                "hasCommittedMutations": doc.has_committed_mutations(),
                "readTime": read_time,
            }),
            MaybeDocument::Unknown(doc) => json!({
                "unknownDocument": {
                    "path": doc.key().path().canonical_string(),
                    "version": DbTimestamp::from(doc.version()),
                },
                "hasCommittedMutations": true,
                "readTime": read_time,
            }),
        }
    }

    pub fn decode_remote_document(
        &self,
        value: &JsonValue,
    ) -> FirestoreResult<RemoteDocumentEntry> {
        let committed = value
            .get("hasCommittedMutations")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let read_time: SnapshotVersion = decode_field::<DbTimestamp>(value, "readTime")?.into();

        let doc: MaybeDocument = if let Some(document) = value.get("document") {
            let doc = self.remote.decode_document(document)?;
            if committed {
                doc.with_committed_mutations().into()
            } else {
                doc.into()
            }
        } else if let Some(no_document) = value.get("noDocument") {
            let key = decode_key(no_document)?;
            let version: SnapshotVersion =
                decode_field::<DbTimestamp>(no_document, "readTime")?.into();
            let doc = NoDocument::new(key, version);
            if committed {
                doc.with_committed_mutations().into()
            } else {
                doc.into()
            }
        } else if let Some(unknown) = value.get("unknownDocument") {
            let key = decode_key(unknown)?;
            let version: SnapshotVersion =
                decode_field::<DbTimestamp>(unknown, "version")?.into();
            UnknownDocument::new(key, version).into()
        } else {
            return Err(internal_error("Unexpected remote document record"));
        };
        Ok(RemoteDocumentEntry { doc, read_time })
    }

    pub fn encode_mutation_batch(&self, uid: &str, batch: &MutationBatch) -> JsonValue {
        let encode_all = |mutations: &[Mutation]| -> Vec<JsonValue> {
            mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect()
        };
        json!({
            "userId": uid,
            "batchId": batch.batch_id,
            "localWriteTime": DbTimestamp::from(batch.local_write_time),
            "baseMutations": encode_all(&batch.base_mutations),
            "mutations": encode_all(&batch.mutations),
        })
    }

    /// Decodes a stored batch together with the id of the user who wrote it.
    pub fn decode_mutation_batch(
        &self,
        value: &JsonValue,
    ) -> FirestoreResult<(String, MutationBatch)> {
        let uid = decode_field::<String>(value, "userId")?;
        let batch_id = decode_field::<BatchId>(value, "batchId")?;
        let local_write_time: Timestamp =
            decode_field::<DbTimestamp>(value, "localWriteTime")?.into();
        let decode_all = |field: &str| -> FirestoreResult<Vec<_>> {
            value
                .get(field)
                .and_then(JsonValue::as_array)
                .map(|mutations| {
                    mutations
                        .iter()
                        .map(|mutation| self.remote.decode_mutation(mutation))
                        .collect()
                })
                .unwrap_or_else(|| Ok(Vec::new()))
        };
        let batch = MutationBatch::new(
            batch_id,
            local_write_time,
            decode_all("baseMutations")?,
            decode_all("mutations")?,
        );
        Ok((uid, batch))
    }

    pub fn encode_target_data(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut record = serde_json::Map::new();
        record.insert("targetId".to_string(), json!(target_data.target_id));
        record.insert("purpose".to_string(), json!(target_data.purpose.as_str()));
        if target.is_document_query() {
            record.insert(
                "documents".to_string(),
                json!({ "documents": [self.remote.resource_name(&target.path)] }),
            );
        } else {
            record.insert("query".to_string(), self.remote.encode_query_target(target));
        }
        record.insert(
            "snapshotVersion".to_string(),
            json!(DbTimestamp::from(target_data.snapshot_version)),
        );
        record.insert(
            "lastLimboFreeSnapshotVersion".to_string(),
            json!(DbTimestamp::from(target_data.last_limbo_free_snapshot_version)),
        );
        record.insert(
            "resumeToken".to_string(),
            json!(BASE64_STANDARD.encode(&target_data.resume_token)),
        );
        record.insert(
            "sequenceNumber".to_string(),
            json!(target_data.sequence_number),
        );
        JsonValue::Object(record)
    }

    pub fn decode_target_data(&self, value: &JsonValue) -> FirestoreResult<TargetData> {
        let target_id = decode_field::<TargetId>(value, "targetId")?;
        let purpose = value
            .get("purpose")
            .and_then(JsonValue::as_str)
            .and_then(QueryPurpose::parse)
            .unwrap_or(QueryPurpose::Listen);
        let target = match (value.get("documents"), value.get("query")) {
            (Some(documents), _) => self.remote.decode_documents_target(documents)?,
            (None, Some(query)) => self.remote.decode_query_target(query)?,
            (None, None) => return Err(internal_error("Target record without a target")),
        };
        let sequence_number = decode_field::<i64>(value, "sequenceNumber")?;
        let snapshot_version: SnapshotVersion =
            decode_field::<DbTimestamp>(value, "snapshotVersion")?.into();
        let last_limbo_free: SnapshotVersion =
            decode_field::<DbTimestamp>(value, "lastLimboFreeSnapshotVersion")?.into();
        let resume_token = decode_bytes(value.get("resumeToken"))?;

        Ok(TargetData::new(target, target_id, purpose, sequence_number)
            .with_resume_token(resume_token, snapshot_version)
            .with_last_limbo_free_snapshot_version(last_limbo_free))
    }

    pub fn encode_queue_metadata(
        &self,
        last_acknowledged_batch_id: BatchId,
        token: &[u8],
    ) -> JsonValue {
        json!(DbMutationQueue {
            last_acknowledged_batch_id,
            last_stream_token: BASE64_STANDARD.encode(token),
        })
    }

    /// Returns the last acknowledged batch id and the last stream token.
    pub fn decode_queue_metadata(&self, value: &JsonValue) -> FirestoreResult<(BatchId, Vec<u8>)> {
        let metadata: DbMutationQueue = serde_json::from_value(value.clone())
            .map_err(|err| internal_error(format!("Invalid mutation queue record: {err}")))?;
        let token = BASE64_STANDARD
            .decode(metadata.last_stream_token)
            .map_err(|err| internal_error(format!("Invalid stream token: {err}")))?;
        Ok((metadata.last_acknowledged_batch_id, token))
    }

    pub fn encode_target_global(&self, global: &DbTargetGlobal) -> JsonValue {
        json!(global)
    }

    pub fn decode_target_global(&self, value: &JsonValue) -> FirestoreResult<DbTargetGlobal> {
        serde_json::from_value(value.clone())
            .map_err(|err| internal_error(format!("Invalid target global record: {err}")))
    }
}

fn decode_field<T: DeserializeOwned>(value: &JsonValue, field: &str) -> FirestoreResult<T> {
    let raw = value
        .get(field)
        .ok_or_else(|| internal_error(format!("Stored record missing '{field}'")))?;
    serde_json::from_value(raw.clone())
        .map_err(|err| internal_error(format!("Invalid '{field}' in stored record: {err}")))
}

fn decode_key(value: &JsonValue) -> FirestoreResult<DocumentKey> {
    let path = decode_field::<String>(value, "path")?;
    DocumentKey::from_string(&path)
}
