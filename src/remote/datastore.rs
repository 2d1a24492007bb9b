use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::SyncResult;
use crate::remote::stream::{MultiplexedConnection, MultiplexedStream, OpenRequest, StreamKind};

pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;

pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Credentials attached to a stream when it is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
}

/// One open duplex stream.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>>;

    /// Next inbound payload; `None` when the peer closed the stream cleanly.
    fn next(&self) -> StreamingFuture<'_, Option<SyncResult<Vec<u8>>>>;

    fn close(&self) -> StreamingFuture<'_, SyncResult<()>>;
}

/// Opens the listen and write channels to the remote authority.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, SyncResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, SyncResult<Arc<dyn StreamHandle>>>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> SyncResult<Option<String>>;

    /// Forces the next [`get_token`](Self::get_token) to fetch a fresh token.
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> SyncResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

/// Datastore that opens both channels as logical streams of one
/// [`MultiplexedConnection`].
pub struct StreamingDatastoreImpl {
    connection: Arc<MultiplexedConnection>,
}

impl StreamingDatastoreImpl {
    pub fn new(connection: Arc<MultiplexedConnection>) -> Self {
        Self { connection }
    }

    fn open(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, SyncResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        box_stream_future(async move {
            let request = OpenRequest {
                kind,
                auth_token: credentials.auth_token,
            };
            let stream = connection.open_stream(request).await?;
            Ok(Arc::new(StreamingHandleImpl::new(stream)) as Arc<dyn StreamHandle>)
        })
    }
}

impl StreamingDatastore for StreamingDatastoreImpl {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, SyncResult<Arc<dyn StreamHandle>>> {
        self.open(StreamKind::Listen, credentials)
    }

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, SyncResult<Arc<dyn StreamHandle>>> {
        self.open(StreamKind::Write, credentials)
    }
}

pub struct StreamingHandleImpl {
    stream: MultiplexedStream,
}

impl StreamingHandleImpl {
    fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for StreamingHandleImpl {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<SyncResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, SyncResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::stream::InMemoryTransport;

    #[tokio::test]
    async fn datastore_stream_roundtrip() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::client(left_transport));
        let server = MultiplexedConnection::server(right_transport);

        let datastore = StreamingDatastoreImpl::new(Arc::clone(&client));
        let handle = datastore
            .open_write_stream(StreamCredentials {
                auth_token: Some("abc".into()),
            })
            .await
            .expect("open write stream");

        let (request, peer_stream) = server.accept_stream().await.expect("accept");
        assert_eq!(request.kind, StreamKind::Write);
        assert_eq!(request.auth_token.as_deref(), Some("abc"));

        peer_stream.send(b"hello".to_vec()).await.expect("send payload");
        let payload = handle.next().await.expect("receive event").expect("payload");
        assert_eq!(payload, b"hello");
        handle.close().await.expect("close stream");
    }

    #[tokio::test]
    async fn noop_provider_has_no_token() {
        let provider = NoopTokenProvider;
        assert_eq!(provider.get_token().await.expect("token"), None);
    }
}
