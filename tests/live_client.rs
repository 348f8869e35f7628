#![cfg(not(target_arch = "wasm32"))]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::Receiver;
use serde_json::{json, Value as JsonValue};

use firestore_sync::firestore::core::{FirestoreClient, ListenOptions, Query, ViewSnapshot};
use firestore_sync::firestore::local::{LocalSerializer, Persistence};
use firestore_sync::firestore::model::{DocumentKey, FieldPath, Mutation, SnapshotVersion};
use firestore_sync::firestore::remote::{
    ChannelConnection, ChannelServer, EmptyCredentialsProvider, FakeDatastore,
    JsonProtoSerializer, ServerEvent, ServerStream, StreamKind,
};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_sync::firestore::{FirestoreResult, FirestoreSettings};

/// A backend that applies writes and pushes every stored document to every
/// watch target.
struct Backend {
    serializer: JsonProtoSerializer,
    documents: BTreeMap<String, JsonValue>,
    version: i64,
    streams: HashMap<u32, ServerStream>,
    targets: HashMap<u32, Vec<i64>>,
    watch_frames: Arc<Mutex<Vec<JsonValue>>>,
}

impl Backend {
    fn timestamp(&self) -> JsonValue {
        self.serializer
            .encode_version(SnapshotVersion::from_micros(self.version * 1_000_000))
    }

    fn document_frames(&self, target_ids: &[i64]) -> Vec<JsonValue> {
        self.documents
            .iter()
            .map(|(name, fields)| {
                json!({"documentChange": {
                    "document": {"name": name, "fields": fields, "updateTime": self.timestamp()},
                    "targetIds": target_ids,
                }})
            })
            .collect()
    }

    fn handle_watch(&mut self, stream: &ServerStream, frame: JsonValue) {
        self.watch_frames.lock().unwrap().push(frame.clone());
        if let Some(target) = frame.get("addTarget") {
            let target_id = target["targetId"].as_i64().unwrap();
            self.targets.entry(stream.id()).or_default().push(target_id);
            stream.send(json!({"targetChange": {
                "targetChangeType": "ADD", "targetIds": [target_id]
            }}));
            for message in self.document_frames(&[target_id]) {
                stream.send(message);
            }
            stream.send(json!({"targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [target_id],
                "resumeToken": "AQ==",
            }}));
            stream.send(json!({"targetChange": {"readTime": self.timestamp()}}));
        } else if let Some(target_id) = frame.get("removeTarget").and_then(JsonValue::as_i64) {
            if let Some(ids) = self.targets.get_mut(&stream.id()) {
                ids.retain(|id| *id != target_id);
            }
            stream.send(json!({"targetChange": {
                "targetChangeType": "REMOVE", "targetIds": [target_id]
            }}));
        }
    }

    fn handle_write(&mut self, stream: &ServerStream, frame: JsonValue) {
        let Some(writes) = frame.get("writes").and_then(JsonValue::as_array) else {
            stream.send(json!({"streamToken": "AQ=="}));
            return;
        };
        self.version += 1;
        for write in writes {
            if let Some(update) = write.get("update") {
                let name = update["name"].as_str().unwrap().to_string();
                self.documents.insert(name, update["fields"].clone());
            } else if let Some(name) = write.get("delete").and_then(JsonValue::as_str) {
                self.documents.remove(name);
            }
        }
        let results: Vec<JsonValue> = writes
            .iter()
            .map(|_| json!({"updateTime": self.timestamp()}))
            .collect();
        stream.send(json!({
            "streamToken": "Ag==",
            "commitTime": self.timestamp(),
            "writeResults": results,
        }));

        for (stream_id, target_ids) in &self.targets {
            let Some(watch) = self.streams.get(stream_id) else {
                continue;
            };
            if target_ids.is_empty() {
                continue;
            }
            for message in self.document_frames(target_ids) {
                watch.send(message);
            }
            watch.send(json!({"targetChange": {"readTime": self.timestamp()}}));
        }
    }

    async fn serve(mut self, server: ChannelServer) {
        while let Some(event) = server.next_event().await {
            match event {
                ServerEvent::Opened(stream) => {
                    stream.accept();
                    self.streams.insert(stream.id(), stream);
                }
                ServerEvent::Message { stream_id, frame } => {
                    let Some(stream) = self.streams.get(&stream_id).cloned() else {
                        continue;
                    };
                    match stream.kind() {
                        StreamKind::Watch => self.handle_watch(&stream, frame),
                        StreamKind::Write => self.handle_write(&stream, frame),
                    }
                }
                ServerEvent::Closed { stream_id } => {
                    self.streams.remove(&stream_id);
                    self.targets.remove(&stream_id);
                }
            }
        }
    }
}

struct TestEnv {
    client: FirestoreClient,
    watch_frames: Arc<Mutex<Vec<JsonValue>>>,
}

fn start() -> TestEnv {
    let settings = FirestoreSettings::default();
    let serializer = JsonProtoSerializer::new(settings.database_id.clone());
    let (connection, server) = ChannelConnection::pair();
    let watch_frames = Arc::new(Mutex::new(Vec::new()));
    let backend = Backend {
        serializer: serializer.clone(),
        documents: BTreeMap::new(),
        version: 1,
        streams: HashMap::new(),
        targets: HashMap::new(),
        watch_frames: Arc::clone(&watch_frames),
    };
    tokio::spawn(backend.serve(server));

    let client = FirestoreClient::new(
        settings,
        Persistence::new_in_memory(LocalSerializer::new(serializer), ""),
        Arc::new(connection),
        Arc::new(EmptyCredentialsProvider::new()),
        Arc::new(FakeDatastore::new()),
    )
    .unwrap();
    TestEnv {
        client,
        watch_frames,
    }
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn room(name: &str) -> MapValue {
    let mut data = MapValue::empty();
    data.set(
        &FieldPath::from_dot_separated("name").unwrap(),
        FirestoreValue::from_string(name),
    );
    data
}

fn rooms() -> Query {
    Query::at_path("rooms").unwrap()
}

async fn listen(
    client: &FirestoreClient,
) -> (
    firestore_sync::firestore::core::ListenerRegistration,
    Receiver<FirestoreResult<ViewSnapshot>>,
) {
    let (sender, receiver) = async_channel::unbounded();
    let registration = client
        .listen(
            rooms(),
            ListenOptions::default().with_metadata_changes(),
            Arc::new(move |result| {
                let _ = sender.try_send(result);
            }),
        )
        .await
        .unwrap();
    (registration, receiver)
}

async fn next_matching(
    receiver: &Receiver<FirestoreResult<ViewSnapshot>>,
    matches: impl Fn(&ViewSnapshot) -> bool,
) -> ViewSnapshot {
    loop {
        let snapshot = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for a snapshot")
            .unwrap()
            .unwrap();
        if matches(&snapshot) {
            return snapshot;
        }
    }
}

fn names(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot
        .docs
        .keys()
        .map(|key| key.path().canonical_string())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_show_up_locally_then_as_synced() {
    let env = start();
    let (_registration, snapshots) = listen(&env.client).await;

    let synced = next_matching(&snapshots, |snapshot| !snapshot.from_cache).await;
    assert!(synced.docs.is_empty());

    let ack = env
        .client
        .write(vec![Mutation::set(key("rooms/1"), room("lobby"))]);
    let local = next_matching(&snapshots, |snapshot| snapshot.has_pending_writes()).await;
    assert_eq!(names(&local), vec!["rooms/1"]);

    ack.await.unwrap();
    let committed = next_matching(&snapshots, |snapshot| {
        !snapshot.has_pending_writes() && !snapshot.docs.is_empty()
    })
    .await;
    assert_eq!(names(&committed), vec!["rooms/1"]);
    assert!(!committed.from_cache);

    env.client.wait_for_pending_writes().await.unwrap();
    env.client.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn going_offline_marks_snapshots_as_cached() {
    let env = start();
    let (_registration, snapshots) = listen(&env.client).await;
    next_matching(&snapshots, |snapshot| !snapshot.from_cache).await;

    env.client.disable_network().await.unwrap();
    let offline = next_matching(&snapshots, |snapshot| snapshot.from_cache).await;
    assert!(offline.docs.is_empty());

    env.client.enable_network().await.unwrap();
    next_matching(&snapshots, |snapshot| !snapshot.from_cache).await;
    env.client.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_registration_stops_the_listen() {
    let env = start();
    let (registration, snapshots) = listen(&env.client).await;
    next_matching(&snapshots, |snapshot| !snapshot.from_cache).await;

    drop(registration);
    let frames = Arc::clone(&env.watch_frames);
    tokio::time::timeout(Duration::from_secs(5), async move {
        loop {
            let removed = frames
                .lock()
                .unwrap()
                .iter()
                .any(|frame| frame.get("removeTarget").is_some());
            if removed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("the target was never removed");
    env.client.terminate();
}

#[tokio::test(flavor = "multi_thread")]
async fn terminate_rejects_later_calls() {
    let env = start();
    env.client.terminate();
    let err = env
        .client
        .get_documents_from_cache(rooms())
        .await
        .unwrap_err();
    assert_eq!(err.code, firestore_sync::firestore::FirestoreErrorCode::Cancelled);
}
