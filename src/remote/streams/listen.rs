use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{internal_error, invalid_argument, SyncError, SyncResult};
use crate::local::TargetData;
use crate::model::{SnapshotVersion, TargetId};
use crate::remote::datastore::{box_stream_future, StreamingDatastore, StreamingFuture, TokenProviderArc};
use crate::remote::serializer::JsonSerializer;
use crate::remote::stream::{PersistentStream, PersistentStreamDelegate, PersistentStreamState, StreamKind};
use crate::remote::watch_change::{decode_snapshot_version, decode_watch_change, WatchChange};
use crate::settings::BackoffSettings;
use crate::util::AsyncQueue;

#[async_trait]
pub trait ListenStreamDelegate: Send + Sync + 'static {
    async fn on_watch_open(&self) -> SyncResult<()>;

    /// `snapshot_version` is `SnapshotVersion::min()` unless the change
    /// marks a consistent snapshot of every target.
    async fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> SyncResult<()>;

    async fn on_watch_close(&self, error: Option<SyncError>);
}

/// The listen channel: adds and removes targets and decodes the changes the
/// remote authority streams back.
pub struct ListenStream<D>
where
    D: ListenStreamDelegate,
{
    stream: PersistentStream<ListenStreamHandler<D>>,
    serializer: Arc<JsonSerializer>,
}

impl<D> ListenStream<D>
where
    D: ListenStreamDelegate,
{
    pub fn new(
        queue: AsyncQueue,
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
        serializer: Arc<JsonSerializer>,
        delegate: Weak<D>,
        backoff: BackoffSettings,
        idle_timeout: Duration,
    ) -> Self {
        let handler = Arc::new(ListenStreamHandler {
            serializer: Arc::clone(&serializer),
            delegate,
        });
        let stream = PersistentStream::new(
            StreamKind::Listen,
            queue,
            datastore,
            token_provider,
            handler,
            backoff,
            idle_timeout,
        );
        Self { stream, serializer }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub fn stop(&self) {
        self.stream.stop();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    pub fn state(&self) -> PersistentStreamState {
        self.stream.state()
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    /// Asks the remote authority to start streaming changes for a target.
    pub fn watch(&self, target_data: &TargetData) -> SyncResult<()> {
        let request = self.serializer.encode_watch_request(target_data);
        self.stream.send(encode_json(&request)?)
    }

    pub fn unwatch(&self, target_id: TargetId) -> SyncResult<()> {
        let request = self.serializer.encode_unwatch_request(target_id);
        self.stream.send(encode_json(&request)?)
    }
}

struct ListenStreamHandler<D> {
    serializer: Arc<JsonSerializer>,
    delegate: Weak<D>,
}

impl<D> PersistentStreamDelegate for ListenStreamHandler<D>
where
    D: ListenStreamDelegate,
{
    fn stream_label(&self) -> &'static str {
        StreamKind::Listen.label()
    }

    fn on_stream_open(&self) -> StreamingFuture<'_, SyncResult<()>> {
        box_stream_future(async move {
            match self.delegate.upgrade() {
                Some(delegate) => delegate.on_watch_open().await,
                None => Ok(()),
            }
        })
    }

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>> {
        box_stream_future(async move {
            let value: JsonValue = serde_json::from_slice(&message)
                .map_err(|err| invalid_argument(format!("Malformed listen response: {err}")))?;
            let change = decode_watch_change(&self.serializer, &value)?;
            let snapshot_version = decode_snapshot_version(&self.serializer, &value)?;
            match self.delegate.upgrade() {
                Some(delegate) => delegate.on_watch_change(change, snapshot_version).await,
                None => Ok(()),
            }
        })
    }

    fn on_stream_close(&self, error: Option<SyncError>) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            if let Some(delegate) = self.delegate.upgrade() {
                delegate.on_watch_close(error).await;
            }
        })
    }
}

pub(crate) fn encode_json(value: &JsonValue) -> SyncResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| internal_error(format!("Failed to encode request: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::Query;
    use crate::local::TargetPurpose;
    use crate::model::DatabaseId;
    use crate::platform::runtime;
    use crate::remote::datastore::{NoopTokenProvider, StreamingDatastoreImpl};
    use crate::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::remote::watch_change::{encode_watch_change, WatchTargetChange, WatchTargetChangeState};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingDelegate {
        changes: Mutex<Vec<(WatchChange, SnapshotVersion)>>,
        opened: Mutex<u32>,
    }

    #[async_trait]
    impl ListenStreamDelegate for RecordingDelegate {
        async fn on_watch_open(&self) -> SyncResult<()> {
            *self.opened.lock().unwrap() += 1;
            Ok(())
        }

        async fn on_watch_change(
            &self,
            change: WatchChange,
            snapshot_version: SnapshotVersion,
        ) -> SyncResult<()> {
            self.changes.lock().unwrap().push((change, snapshot_version));
            Ok(())
        }

        async fn on_watch_close(&self, _error: Option<SyncError>) {}
    }

    fn database_id() -> DatabaseId {
        DatabaseId::for_project("demo")
    }

    #[tokio::test]
    async fn sends_targets_and_decodes_changes() {
        let (left, right) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::client(left));
        let server = MultiplexedConnection::server(right);
        let queue = AsyncQueue::new();
        let serializer = Arc::new(JsonSerializer::new(database_id()));
        let delegate = Arc::new(RecordingDelegate::default());
        let stream = Arc::new(ListenStream::new(
            queue.clone(),
            Arc::new(StreamingDatastoreImpl::new(client)),
            Arc::new(NoopTokenProvider),
            Arc::clone(&serializer),
            Arc::downgrade(&delegate),
            BackoffSettings::default(),
            Duration::from_secs(60),
        ));

        let starter = Arc::clone(&stream);
        queue
            .enqueue(move || async move {
                starter.start();
                Ok(())
            })
            .await
            .expect("start");
        let (request, peer) = server.accept_stream().await.expect("accept");
        assert_eq!(request.kind, StreamKind::Listen);
        for _ in 0..100 {
            if *delegate.opened.lock().unwrap() > 0 {
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*delegate.opened.lock().unwrap(), 1);

        let target = Query::collection("rooms").expect("query").to_target();
        let target_data = TargetData::new(target, 2, TargetPurpose::Listen, 1);
        let watcher = Arc::clone(&stream);
        queue
            .enqueue(move || async move { watcher.watch(&target_data) })
            .await
            .expect("watch");
        let payload = peer.next().await.expect("frame").expect("payload");
        let request: JsonValue = serde_json::from_slice(&payload).expect("json");
        assert_eq!(request["addTarget"]["targetId"], json!(2));

        let version = SnapshotVersion::from_micros(5_000_000);
        let change = WatchChange::TargetChange(WatchTargetChange::new(
            WatchTargetChangeState::NoChange,
            Vec::new(),
        ));
        let message = encode_watch_change(&serializer, &change, Some(version));
        peer.send(serde_json::to_vec(&message).expect("encode"))
            .await
            .expect("send");
        for _ in 0..100 {
            if !delegate.changes.lock().unwrap().is_empty() {
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        let changes = delegate.changes.lock().unwrap().clone();
        assert_eq!(changes, vec![(change, version)]);
    }
}
