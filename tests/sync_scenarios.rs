use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use docsync::api::{QuerySnapshot, SetOptions};
use docsync::core::{FilterOperator, ListenOptions, Query, Subscription, SyncClient};
use docsync::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use docsync::remote::{
    encode_watch_change, BloomFilterPayload, DocumentWatchChange, ExistenceFilterChange,
    InMemoryTransport, JsonSerializer, MultiplexedConnection, MultiplexedStream, NoopTokenProvider,
    StreamKind, WatchChange, WatchTargetChange, WatchTargetChangeState,
};
use docsync::settings::{LruSettings, SyncSettings};
use docsync::util::BloomFilter;
use docsync::value::{ObjectValue, Value};
use serde_json::{json, Value as JsonValue};

const DEADLINE: Duration = Duration::from_secs(5);

/// In-process remote authority. Streams opened by the client are handed to
/// the test, which scripts the responses.
struct Authority {
    serializer: JsonSerializer,
    listen_streams: async_channel::Receiver<MultiplexedStream>,
    write_streams: async_channel::Receiver<MultiplexedStream>,
}

impl Authority {
    async fn next_listen_stream(&self) -> MultiplexedStream {
        within(self.listen_streams.recv()).await.expect("listen stream")
    }

    async fn next_write_stream(&self) -> MultiplexedStream {
        within(self.write_streams.recv()).await.expect("write stream")
    }

    async fn send(&self, stream: &MultiplexedStream, change: WatchChange, read_time: Option<SnapshotVersion>) {
        let message = encode_watch_change(&self.serializer, &change, read_time);
        stream
            .send(serde_json::to_vec(&message).expect("encode"))
            .await
            .expect("send watch change");
    }

    async fn target_state(
        &self,
        stream: &MultiplexedStream,
        state: WatchTargetChangeState,
        target_ids: Vec<TargetId>,
    ) {
        let mut change = WatchTargetChange::new(state, target_ids);
        if state == WatchTargetChangeState::Current {
            change = change.with_resume_token(b"resume".to_vec());
        }
        self.send(stream, WatchChange::TargetChange(change), None).await;
    }

    async fn document(&self, stream: &MultiplexedStream, document: MutableDocument, target_ids: Vec<TargetId>) {
        let change = DocumentWatchChange {
            updated_target_ids: target_ids,
            removed_target_ids: Vec::new(),
            key: document.key().clone(),
            document: Some(document),
        };
        self.send(stream, WatchChange::Document(change), None).await;
    }

    /// Advances the global snapshot so the client raises a remote event.
    async fn snapshot(&self, stream: &MultiplexedStream, micros: i64) {
        let change = WatchTargetChange::new(WatchTargetChangeState::NoChange, Vec::new());
        self.send(stream, WatchChange::TargetChange(change), Some(version(micros)))
            .await;
    }

    /// Reads listen requests until one adds a target, returning its id and
    /// payload.
    async fn next_added_target(&self, stream: &MultiplexedStream) -> (TargetId, JsonValue) {
        loop {
            let request = receive(stream).await;
            if let Some(target) = request.get("addTarget") {
                let target_id = target["targetId"].as_i64().expect("target id") as TargetId;
                return (target_id, target.clone());
            }
        }
    }
}

fn start() -> (SyncClient, Authority) {
    let database_id = DatabaseId::for_project("demo");
    let (client_side, server_side) = InMemoryTransport::pair();
    let server = MultiplexedConnection::server(server_side);
    let (listen_tx, listen_rx) = async_channel::unbounded();
    let (write_tx, write_rx) = async_channel::unbounded();
    tokio::spawn(async move {
        while let Ok((request, stream)) = server.accept_stream().await {
            let streams = match request.kind {
                StreamKind::Listen => &listen_tx,
                StreamKind::Write => &write_tx,
            };
            if streams.send(stream).await.is_err() {
                break;
            }
        }
    });

    let settings = SyncSettings::new(database_id.clone()).with_lru(LruSettings::disabled());
    let client = SyncClient::connect(
        settings,
        Arc::new(MultiplexedConnection::client(client_side)),
        Arc::new(NoopTokenProvider),
    )
    .expect("client");
    let authority = Authority {
        serializer: JsonSerializer::new(database_id),
        listen_streams: listen_rx,
        write_streams: write_rx,
    };
    (client, authority)
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(DEADLINE, future)
        .await
        .expect("timed out waiting for the client")
}

async fn receive(stream: &MultiplexedStream) -> JsonValue {
    let payload = within(stream.next())
        .await
        .expect("stream open")
        .expect("payload");
    serde_json::from_slice(&payload).expect("json")
}

async fn next_snapshot(subscription: &mut Subscription) -> QuerySnapshot {
    within(subscription.next())
        .await
        .expect("subscription open")
        .expect("snapshot")
}

async fn snapshot_where(
    subscription: &mut Subscription,
    mut predicate: impl FnMut(&QuerySnapshot) -> bool,
) -> QuerySnapshot {
    loop {
        let snapshot = next_snapshot(subscription).await;
        if predicate(&snapshot) {
            return snapshot;
        }
    }
}

fn version(micros: i64) -> SnapshotVersion {
    SnapshotVersion::from_micros(micros)
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("key")
}

fn fields(n: i64) -> BTreeMap<String, Value> {
    BTreeMap::from([("n".to_string(), Value::from_integer(n))])
}

fn doc(path: &str, micros: i64, n: i64) -> MutableDocument {
    MutableDocument::new_found(key(path), version(micros), ObjectValue::from_map(fields(n)))
}

fn ids(snapshot: &QuerySnapshot) -> Vec<String> {
    snapshot
        .documents()
        .iter()
        .map(|document| document.id().to_string())
        .collect()
}

#[tokio::test]
async fn offline_write_is_acknowledged_after_reconnect() {
    let (client, authority) = start();
    client.disable_network().await.expect("disable network");

    let rooms = Query::collection("rooms").expect("query");
    let mut subscription = client
        .subscribe(rooms, ListenOptions::default().with_metadata_changes())
        .await
        .expect("subscribe");
    let initial = next_snapshot(&mut subscription).await;
    assert!(initial.is_empty());
    assert!(initial.from_cache());

    let writer = client.clone();
    let write = tokio::spawn(async move {
        writer
            .set_document(&key("rooms/a"), fields(1), SetOptions::default())
            .await
    });
    let local = next_snapshot(&mut subscription).await;
    assert_eq!(ids(&local), vec!["a"]);
    assert!(local.has_pending_writes());
    assert!(local.from_cache());

    client.enable_network().await.expect("enable network");
    let listen = authority.next_listen_stream().await;
    let (target_id, _) = authority.next_added_target(&listen).await;

    let writes = authority.next_write_stream().await;
    let handshake = receive(&writes).await;
    assert!(handshake.get("database").is_some());
    writes
        .send(br#"{"streamToken":"dDE="}"#.to_vec())
        .await
        .expect("handshake response");
    let request = receive(&writes).await;
    assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
    let ack = json!({
        "streamToken": "dDI=",
        "commitTime": authority.serializer.encode_version(&version(2_000_000)),
        "writeResults": [{}],
    });
    writes
        .send(serde_json::to_vec(&ack).expect("encode"))
        .await
        .expect("ack");

    let committed = within(write).await.expect("write task").expect("write result");
    assert_eq!(committed, version(2_000_000));

    authority
        .target_state(&listen, WatchTargetChangeState::Added, vec![target_id])
        .await;
    authority
        .document(&listen, doc("rooms/a", 2_000_000, 1), vec![target_id])
        .await;
    authority
        .target_state(&listen, WatchTargetChangeState::Current, vec![target_id])
        .await;
    authority.snapshot(&listen, 2_000_000).await;

    let synced =
        snapshot_where(&mut subscription, |s| !s.from_cache() && !s.has_pending_writes()).await;
    assert_eq!(ids(&synced), vec!["a"]);
    assert_eq!(synced.documents()[0].version(), version(2_000_000));
    within(client.wait_for_pending_writes())
        .await
        .expect("no pending writes");
}

#[tokio::test]
async fn remote_delete_reaches_overlapping_queries() {
    let (client, authority) = start();
    let all = Query::collection("rooms").expect("query");
    let active = all
        .where_field("n", FilterOperator::GreaterThanOrEqual, 1_i64)
        .expect("filter");
    let mut all_rooms = client
        .subscribe(all, ListenOptions::default())
        .await
        .expect("subscribe all");
    let mut active_rooms = client
        .subscribe(active, ListenOptions::default())
        .await
        .expect("subscribe active");

    let listen = authority.next_listen_stream().await;
    let (first, _) = authority.next_added_target(&listen).await;
    let (second, _) = authority.next_added_target(&listen).await;
    let targets = vec![first, second];
    authority
        .target_state(&listen, WatchTargetChangeState::Added, targets.clone())
        .await;
    authority
        .document(&listen, doc("rooms/a", 1_000_000, 1), targets.clone())
        .await;
    authority
        .document(&listen, doc("rooms/b", 1_000_000, 0), vec![first])
        .await;
    authority
        .target_state(&listen, WatchTargetChangeState::Current, targets.clone())
        .await;
    authority.snapshot(&listen, 1_000_000).await;

    let snapshot = next_snapshot(&mut all_rooms).await;
    assert_eq!(ids(&snapshot), vec!["a", "b"]);
    assert!(!snapshot.from_cache());
    let snapshot = next_snapshot(&mut active_rooms).await;
    assert_eq!(ids(&snapshot), vec!["a"]);

    let delete = DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: targets,
        key: key("rooms/a"),
        document: Some(MutableDocument::new_no_document(key("rooms/a"), version(2_000_000))),
    };
    authority.send(&listen, WatchChange::Document(delete), None).await;
    authority.snapshot(&listen, 2_000_000).await;

    let snapshot = next_snapshot(&mut all_rooms).await;
    assert_eq!(ids(&snapshot), vec!["b"]);
    assert_eq!(snapshot.changes().len(), 1);
    let snapshot = next_snapshot(&mut active_rooms).await;
    assert!(snapshot.is_empty());
    assert!(!snapshot.from_cache());
}

#[tokio::test]
async fn bloom_filter_mismatch_resolves_removed_document_through_limbo() {
    let (client, authority) = start();
    let mut subscription = client
        .subscribe(Query::collection("rooms").expect("query"), ListenOptions::default())
        .await
        .expect("subscribe");

    let listen = authority.next_listen_stream().await;
    let (target_id, _) = authority.next_added_target(&listen).await;
    authority
        .target_state(&listen, WatchTargetChangeState::Added, vec![target_id])
        .await;
    authority
        .document(&listen, doc("rooms/a", 1_000_000, 1), vec![target_id])
        .await;
    authority
        .document(&listen, doc("rooms/b", 1_000_000, 2), vec![target_id])
        .await;
    authority
        .target_state(&listen, WatchTargetChangeState::Current, vec![target_id])
        .await;
    authority.snapshot(&listen, 1_000_000).await;
    let snapshot = next_snapshot(&mut subscription).await;
    assert_eq!(ids(&snapshot), vec!["a", "b"]);

    let remaining = key("rooms/a").qualified_name(authority.serializer.database_id());
    let filter = BloomFilter::with_members([remaining.as_str()], 64, 7);
    let existence = ExistenceFilterChange {
        target_id,
        count: 1,
        unchanged_names: Some(BloomFilterPayload {
            bitmap: filter.bitmap().to_vec(),
            padding: filter.padding(),
            hash_count: filter.hash_count() as i32,
        }),
    };
    authority
        .send(&listen, WatchChange::ExistenceFilter(existence), None)
        .await;
    authority.snapshot(&listen, 2_000_000).await;

    let (limbo_target, payload) = authority.next_added_target(&listen).await;
    let names = payload["documents"]["documents"].as_array().expect("document target");
    assert_eq!(
        names[0].as_str(),
        Some(authority.serializer.encode_key(&key("rooms/b")).as_str())
    );
    authority
        .target_state(&listen, WatchTargetChangeState::Added, vec![limbo_target])
        .await;
    authority
        .target_state(&listen, WatchTargetChangeState::Current, vec![limbo_target])
        .await;
    authority.snapshot(&listen, 3_000_000).await;

    let resolved = snapshot_where(&mut subscription, |s| s.len() == 1 && !s.from_cache()).await;
    assert_eq!(ids(&resolved), vec!["a"]);
}

#[tokio::test]
async fn cache_reads_survive_going_offline() {
    let (client, authority) = start();
    let rooms = Query::collection("rooms").expect("query");
    let mut subscription = client
        .subscribe(rooms.clone(), ListenOptions::default())
        .await
        .expect("subscribe");
    let listen = authority.next_listen_stream().await;
    let (target_id, _) = authority.next_added_target(&listen).await;
    authority
        .target_state(&listen, WatchTargetChangeState::Added, vec![target_id])
        .await;
    authority
        .document(&listen, doc("rooms/a", 1_000_000, 1), vec![target_id])
        .await;
    authority
        .target_state(&listen, WatchTargetChangeState::Current, vec![target_id])
        .await;
    authority.snapshot(&listen, 1_000_000).await;
    assert_eq!(ids(&next_snapshot(&mut subscription).await), vec!["a"]);

    client.disable_network().await.expect("disable network");
    let cached = client
        .get_once(rooms, docsync::api::GetSource::Cache)
        .await
        .expect("cache read");
    assert_eq!(ids(&cached), vec!["a"]);
    assert!(cached.from_cache());

    let document = client
        .get_document(&key("rooms/a"), docsync::api::GetSource::Default)
        .await
        .expect("document");
    assert!(document.exists());
    assert!(document.from_cache());
}
