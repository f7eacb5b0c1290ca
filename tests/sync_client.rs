#![cfg(not(target_arch = "wasm32"))]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value as Json};

use firestore_sync::core::{ListenerEvent, QueryListener, SyncClient, SyncClientConfig};
use firestore_sync::error::{unavailable, SyncResult};
use firestore_sync::model::{DatabaseId, DocumentKey, FieldPath, Mutation, ObjectValue, Value};
use firestore_sync::query::Query;
use firestore_sync::remote::{
    ConnectionTokens, Datastore, EmptyCredentialsProvider, OnlineState, WireStream,
};
use firestore_sync::model::ResourcePath;

struct FakeStream {
    requests: async_channel::Sender<Json>,
    responses: async_channel::Receiver<SyncResult<Json>>,
}

#[async_trait]
impl WireStream for FakeStream {
    async fn send(&self, message: Json) -> SyncResult<()> {
        self.requests
            .send(message)
            .await
            .map_err(|_| unavailable("stream closed"))
    }

    async fn recv(&self) -> Option<SyncResult<Json>> {
        self.responses.recv().await.ok()
    }

    fn close(&self) {
        self.requests.close();
        self.responses.close();
    }
}

/// Test-side handle to one stream the engine opened.
struct StreamHandle {
    requests: async_channel::Receiver<Json>,
    responses: async_channel::Sender<SyncResult<Json>>,
}

impl StreamHandle {
    async fn next_request(&self) -> Json {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("timed out waiting for stream request")
            .expect("stream closed while waiting for request")
    }

    async fn respond(&self, message: Json) {
        self.responses
            .send(Ok(message))
            .await
            .expect("engine dropped the stream");
    }
}

struct FakeDatastore {
    watch_handles: async_channel::Sender<StreamHandle>,
    write_handles: async_channel::Sender<StreamHandle>,
}

impl FakeDatastore {
    fn new() -> (
        Arc<Self>,
        async_channel::Receiver<StreamHandle>,
        async_channel::Receiver<StreamHandle>,
    ) {
        let (watch_tx, watch_rx) = async_channel::unbounded();
        let (write_tx, write_rx) = async_channel::unbounded();
        (
            Arc::new(Self {
                watch_handles: watch_tx,
                write_handles: write_tx,
            }),
            watch_rx,
            write_rx,
        )
    }

    fn open(&self, into: &async_channel::Sender<StreamHandle>) -> Arc<dyn WireStream> {
        let (req_tx, req_rx) = async_channel::unbounded();
        let (resp_tx, resp_rx) = async_channel::unbounded();
        let _ = into.try_send(StreamHandle {
            requests: req_rx,
            responses: resp_tx,
        });
        Arc::new(FakeStream {
            requests: req_tx,
            responses: resp_rx,
        })
    }
}

#[async_trait]
impl Datastore for FakeDatastore {
    async fn open_watch_stream(
        &self,
        _tokens: &ConnectionTokens,
    ) -> SyncResult<Arc<dyn WireStream>> {
        Ok(self.open(&self.watch_handles))
    }

    async fn open_write_stream(
        &self,
        _tokens: &ConnectionTokens,
    ) -> SyncResult<Arc<dyn WireStream>> {
        Ok(self.open(&self.write_handles))
    }
}

async fn next_stream(handles: &async_channel::Receiver<StreamHandle>) -> StreamHandle {
    tokio::time::timeout(Duration::from_secs(5), handles.recv())
        .await
        .expect("timed out waiting for stream open")
        .expect("datastore dropped")
}

async fn next_snapshot(listener: &QueryListener) -> firestore_sync::core::ViewSnapshot {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), listener.next_event())
            .await
            .expect("timed out waiting for listener event")
            .expect("listener channel closed");
        match event {
            ListenerEvent::Snapshot(snapshot) => return snapshot,
            ListenerEvent::Error(error) => panic!("unexpected query error: {error}"),
        }
    }
}

fn test_client() -> (
    Arc<SyncClient>,
    async_channel::Receiver<StreamHandle>,
    async_channel::Receiver<StreamHandle>,
) {
    let (datastore, watch_handles, write_handles) = FakeDatastore::new();
    let credentials = Arc::new(EmptyCredentialsProvider);
    let client = SyncClient::new(
        datastore,
        credentials.clone(),
        credentials,
        SyncClientConfig::new("user-a", DatabaseId::new("test-project", "(default)")),
    );
    (client, watch_handles, write_handles)
}

const DB: &str = "projects/test-project/databases/(default)";

fn doc_name(path: &str) -> String {
    format!("{DB}/documents/{path}")
}

fn set_mutation(path: &str, field: &str, value: i64) -> Mutation {
    let mut data = ObjectValue::empty();
    data.set(
        &FieldPath::from_dot_separated(field).unwrap(),
        Value::Integer(value),
    );
    Mutation::set(DocumentKey::from_string(path).unwrap(), data)
}

fn rooms_query() -> Query {
    Query::at_path(ResourcePath::from_string("rooms").unwrap())
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_write_is_visible_then_acknowledged() {
    let (client, _watch_handles, write_handles) = test_client();

    let ack = client
        .write(vec![set_mutation("rooms/a", "count", 7)])
        .await
        .unwrap();

    // Visible locally before any network activity.
    let doc = client
        .get_document(DocumentKey::from_string("rooms/a").unwrap())
        .await
        .unwrap();
    assert!(doc.is_found_document());
    assert!(doc.has_local_mutations());
    assert_eq!(
        doc.data()
            .field(&FieldPath::from_dot_separated("count").unwrap()),
        Some(&Value::Integer(7))
    );

    client.enable_network().await.unwrap();
    let stream = next_stream(&write_handles).await;

    let handshake = stream.next_request().await;
    assert_eq!(handshake["database"], json!(DB));
    assert_eq!(handshake["writes"], json!([]));
    stream
        .respond(json!({ "streamToken": BASE64.encode(b"token-1") }))
        .await;

    let write_request = stream.next_request().await;
    let writes = write_request["writes"].as_array().unwrap();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0]["update"]["name"], json!(doc_name("rooms/a")));

    stream
        .respond(json!({
            "streamToken": BASE64.encode(b"token-2"),
            "commitTime": "2024-05-01T00:00:10Z",
            "writeResults": [{ "updateTime": "2024-05-01T00:00:10Z" }],
        }))
        .await;

    tokio::time::timeout(Duration::from_secs(5), ack)
        .await
        .expect("timed out waiting for acknowledgement")
        .expect("write completion dropped")
        .expect("write rejected");

    let doc = client
        .get_document(DocumentKey::from_string("rooms/a").unwrap())
        .await
        .unwrap();
    assert!(!doc.has_local_mutations());
    assert!(doc.is_found_document());
}

#[tokio::test(flavor = "multi_thread")]
async fn listen_delivers_cached_then_synced_snapshots() {
    let (client, watch_handles, _write_handles) = test_client();

    let listener = client.listen(rooms_query()).await.unwrap();
    let initial = next_snapshot(&listener).await;
    assert!(initial.from_cache);
    assert!(initial.documents.is_empty());

    client.enable_network().await.unwrap();
    let stream = next_stream(&watch_handles).await;

    let listen_request = stream.next_request().await;
    let target_id = listen_request["addTarget"]["targetId"].as_i64().unwrap();
    stream
        .respond(json!({
            "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] }
        }))
        .await;
    assert_eq!(target_id, 2);

    stream
        .respond(json!({
            "documentChange": {
                "document": {
                    "name": doc_name("rooms/a"),
                    "fields": { "count": { "integerValue": "1" } },
                    "updateTime": "2024-05-01T00:00:01Z",
                },
                "targetIds": [target_id],
            }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [target_id],
                "resumeToken": BASE64.encode(b"resume-1"),
            }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "resumeToken": BASE64.encode(b"resume-1"),
                "readTime": "2024-05-01T00:00:02Z",
            }
        }))
        .await;

    let synced = loop {
        let snapshot = next_snapshot(&listener).await;
        if !snapshot.from_cache {
            break snapshot;
        }
    };
    assert_eq!(synced.documents.len(), 1);
    assert_eq!(
        synced.documents[0].key(),
        &DocumentKey::from_string("rooms/a").unwrap()
    );
    assert_eq!(client.online_state().await, OnlineState::Online);

    client.unlisten(listener).await.unwrap();
    let unlisten_request = stream.next_request().await;
    assert_eq!(unlisten_request["removeTarget"], json!(target_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn existence_filter_mismatch_restarts_the_target() {
    let (client, watch_handles, _write_handles) = test_client();

    let listener = client.listen(rooms_query()).await.unwrap();
    let _ = next_snapshot(&listener).await;

    client.enable_network().await.unwrap();
    let stream = next_stream(&watch_handles).await;
    let listen_request = stream.next_request().await;
    let target_id = listen_request["addTarget"]["targetId"].as_i64().unwrap();
    stream
        .respond(json!({
            "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] }
        }))
        .await;

    stream
        .respond(json!({
            "documentChange": {
                "document": {
                    "name": doc_name("rooms/a"),
                    "fields": { "count": { "integerValue": "1" } },
                    "updateTime": "2024-05-01T00:00:01Z",
                },
                "targetIds": [target_id],
            }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [target_id],
                "resumeToken": BASE64.encode(b"resume-1"),
            }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "resumeToken": BASE64.encode(b"resume-1"),
                "readTime": "2024-05-01T00:00:02Z",
            }
        }))
        .await;
    loop {
        if !next_snapshot(&listener).await.from_cache {
            break;
        }
    }

    // The backend claims zero matching documents; we track one.
    stream
        .respond(json!({
            "filter": { "targetId": target_id, "count": 0 }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "readTime": "2024-05-01T00:00:03Z",
            }
        }))
        .await;

    // Mismatch tears the target down and starts it from scratch.
    let remove = stream.next_request().await;
    assert_eq!(remove["removeTarget"], json!(target_id));
    let relisten = stream.next_request().await;
    assert_eq!(relisten["addTarget"]["targetId"], json!(target_id));
    // The fresh listen must not resume from the stale token.
    assert!(relisten["addTarget"].get("resumeToken").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_document_goes_through_limbo_resolution() {
    let (client, watch_handles, _write_handles) = test_client();

    let listener = client.listen(rooms_query()).await.unwrap();
    let _ = next_snapshot(&listener).await;

    client.enable_network().await.unwrap();
    let stream = next_stream(&watch_handles).await;
    let listen_request = stream.next_request().await;
    let target_id = listen_request["addTarget"]["targetId"].as_i64().unwrap();
    stream
        .respond(json!({
            "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] }
        }))
        .await;

    stream
        .respond(json!({
            "documentChange": {
                "document": {
                    "name": doc_name("rooms/a"),
                    "fields": { "count": { "integerValue": "1" } },
                    "updateTime": "2024-05-01T00:00:01Z",
                },
                "targetIds": [target_id],
            }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [target_id],
                "resumeToken": BASE64.encode(b"resume-1"),
            }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "readTime": "2024-05-01T00:00:02Z",
            }
        }))
        .await;
    loop {
        if !next_snapshot(&listener).await.from_cache {
            break;
        }
    }

    // The document silently drops out of the target. The view still holds
    // it, so it enters limbo and gets its own single-document listen.
    stream
        .respond(json!({
            "documentRemove": {
                "document": doc_name("rooms/a"),
                "removedTargetIds": [target_id],
            }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "readTime": "2024-05-01T00:00:03Z",
            }
        }))
        .await;

    let limbo_request = stream.next_request().await;
    let limbo_target_id = limbo_request["addTarget"]["targetId"].as_i64().unwrap();
    assert_eq!(limbo_target_id % 2, 1, "limbo targets use odd ids");
    stream
        .respond(json!({
            "targetChange": { "targetChangeType": "ADD", "targetIds": [limbo_target_id] }
        }))
        .await;
    assert_eq!(
        limbo_request["addTarget"]["documents"]["documents"],
        json!([doc_name("rooms/a")])
    );

    // The backend confirms the document no longer exists: current with no
    // document update synthesizes the deletion.
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [limbo_target_id],
            }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "readTime": "2024-05-01T00:00:04Z",
            }
        }))
        .await;

    let resolved = loop {
        let snapshot = next_snapshot(&listener).await;
        if snapshot.documents.is_empty() && !snapshot.from_cache {
            break snapshot;
        }
    };
    assert!(!resolved.has_pending_writes);

    // The synthetic limbo target is released once resolved.
    let release = stream.next_request().await;
    assert_eq!(release["removeTarget"], json!(limbo_target_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn second_listener_replays_the_latest_snapshot() {
    let (client, _watch_handles, _write_handles) = test_client();

    client
        .write(vec![set_mutation("rooms/a", "count", 1)])
        .await
        .unwrap();

    let matches = client
        .get_documents_matching_query(rooms_query())
        .await
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert!(matches[0].has_local_mutations());

    let first = client.listen(rooms_query()).await.unwrap();
    let snapshot = next_snapshot(&first).await;
    assert_eq!(snapshot.documents.len(), 1);
    assert!(snapshot.has_pending_writes);

    let second = client.listen(rooms_query()).await.unwrap();
    let replay = next_snapshot(&second).await;
    assert_eq!(replay.documents.len(), 1);

    client.unlisten(first).await.unwrap();
    client.unlisten(second).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn disable_network_reports_offline_and_cached_snapshots() {
    let (client, watch_handles, _write_handles) = test_client();

    let listener = client.listen(rooms_query()).await.unwrap();
    let _ = next_snapshot(&listener).await;

    client.enable_network().await.unwrap();
    let stream = next_stream(&watch_handles).await;
    let listen_request = stream.next_request().await;
    let target_id = listen_request["addTarget"]["targetId"].as_i64().unwrap();
    stream
        .respond(json!({
            "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] }
        }))
        .await;

    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [target_id],
            }
        }))
        .await;
    stream
        .respond(json!({
            "targetChange": {
                "targetChangeType": "NO_CHANGE",
                "targetIds": [],
                "readTime": "2024-05-01T00:00:01Z",
            }
        }))
        .await;
    loop {
        if !next_snapshot(&listener).await.from_cache {
            break;
        }
    }

    client.disable_network().await.unwrap();
    let offline = next_snapshot(&listener).await;
    assert!(offline.from_cache);
    assert_eq!(client.online_state().await, OnlineState::Offline);
}
