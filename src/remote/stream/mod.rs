use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::error::{internal_error, unavailable, SyncError, SyncResult};
use crate::platform::runtime;
use crate::util::lock;

pub mod persistent;

pub use persistent::{PersistentStream, PersistentStreamDelegate, PersistentStreamState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Which of the two duplex channels a stream carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }
}

/// Sent with the first frame of a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpenRequest {
    pub kind: StreamKind,
    pub auth_token: Option<String>,
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open(OpenRequest),
    Data(Vec<u8>),
    Close,
    Error(SyncError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn open(stream_id: StreamId, request: OpenRequest) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Open(request),
        }
    }

    pub fn data(stream_id: StreamId, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Data(payload),
        }
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Close,
        }
    }

    pub fn error(stream_id: StreamId, error: SyncError) -> Self {
        Self {
            stream_id,
            kind: FrameKind::Error(error),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Moves frames between two endpoints. Implementations only need to
/// preserve ordering; multiplexing happens in [`MultiplexedConnection`].
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> SyncResult<()>;
    async fn next(&self) -> SyncResult<TransportFrame>;
}

type StreamTable = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Carries many logical streams over one transport.
///
/// The client side allocates odd stream ids and the accepting side even ones,
/// so both ends may open streams without colliding.
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
    accepted: Receiver<(OpenRequest, MultiplexedStream)>,
}

impl MultiplexedConnection {
    /// Endpoint that initiates streams.
    pub fn client(transport: Arc<dyn StreamTransport>) -> Self {
        Self::new(transport, 1)
    }

    /// Endpoint that accepts streams, e.g. an in-process authority.
    pub fn server(transport: Arc<dyn StreamTransport>) -> Self {
        Self::new(transport, 2)
    }

    fn new(transport: Arc<dyn StreamTransport>, first_stream_id: u32) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accepted_tx, accepted_rx) = async_channel::unbounded();
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));
        let connection = Self {
            next_stream_id: AtomicU32::new(first_stream_id),
            outbound_tx,
            streams,
            accepted: accepted_rx,
        };

        connection.start_outbound_loop(Arc::clone(&transport), outbound_rx);
        connection.start_inbound_loop(transport, accepted_tx);
        connection
    }

    fn start_outbound_loop(
        &self,
        transport: Arc<dyn StreamTransport>,
        outbound_rx: Receiver<TransportFrame>,
    ) {
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(
        &self,
        transport: Arc<dyn StreamTransport>,
        accepted_tx: Sender<(OpenRequest, MultiplexedStream)>,
    ) {
        let streams = Arc::clone(&self.streams);
        let handle = self.clone_handle();
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::warn!("multiplexed inbound loop terminated: {err}");
                        fail_all_streams(&streams, &err);
                        break;
                    }
                };
                let stream_id = frame.stream_id();
                let sender = lock(&streams).get(&stream_id).cloned();
                match (sender, frame.kind) {
                    (None, FrameKind::Open(request)) => {
                        let stream = handle.register(stream_id);
                        if accepted_tx.send((request, stream)).await.is_err() {
                            log::debug!("nobody accepts streams; dropping stream {}", stream_id.value());
                        }
                    }
                    (Some(sender), event @ (FrameKind::Close | FrameKind::Error(_))) => {
                        let _ = sender.send(event).await;
                        lock(&streams).remove(&stream_id);
                    }
                    (Some(sender), event) => {
                        if sender.send(event).await.is_err() {
                            log::debug!("dropping inbound frame for closed stream {}", stream_id.value());
                        }
                    }
                    (None, _) => {
                        log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    }
                }
            }
        });
    }

    pub async fn open_stream(&self, request: OpenRequest) -> SyncResult<MultiplexedStream> {
        let stream_id = StreamId::new(self.next_stream_id.fetch_add(2, Ordering::SeqCst));
        let stream = self.clone_handle().register(stream_id);
        self.outbound_tx
            .send(TransportFrame::open(stream_id, request))
            .await
            .map_err(|err| unavailable(format!("failed to queue open frame: {err}")))?;
        Ok(stream)
    }

    /// Waits for the peer to open a stream.
    pub async fn accept_stream(&self) -> SyncResult<(OpenRequest, MultiplexedStream)> {
        self.accepted
            .recv()
            .await
            .map_err(|err| unavailable(format!("connection closed: {err}")))
    }

    fn clone_handle(&self) -> MultiplexedConnectionHandle {
        MultiplexedConnectionHandle {
            outbound_tx: self.outbound_tx.clone(),
            streams: Arc::clone(&self.streams),
        }
    }
}

fn fail_all_streams(streams: &StreamTable, error: &SyncError) {
    let senders: Vec<Sender<FrameKind>> = lock(streams).drain().map(|(_, sender)| sender).collect();
    for sender in senders {
        let _ = sender.try_send(FrameKind::Error(unavailable(format!(
            "transport failed: {}",
            error.message()
        ))));
    }
}

#[derive(Clone)]
pub struct MultiplexedConnectionHandle {
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
}

impl MultiplexedConnectionHandle {
    fn register(&self, stream_id: StreamId) -> MultiplexedStream {
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        lock(&self.streams).insert(stream_id, inbound_tx);
        MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            manager: self.clone(),
        }
    }

    pub fn close_stream(&self, stream_id: StreamId) {
        let registered = lock(&self.streams).remove(&stream_id).is_some();
        if registered {
            let _ = self.outbound_tx.try_send(TransportFrame::close(stream_id));
        }
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    manager: MultiplexedConnectionHandle,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        self.outbound
            .send(TransportFrame::data(self.id, payload))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue stream frame: {err}")))
    }

    /// Next payload; `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<SyncResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> SyncResult<()> {
        self.manager.close_stream(self.id);
        Ok(())
    }

    /// Terminates the stream with an error status the peer will observe.
    pub async fn fail(&self, error: SyncError) -> SyncResult<()> {
        lock(&self.manager.streams).remove(&self.id);
        self.outbound
            .send(TransportFrame::error(self.id, error))
            .await
            .map_err(|err| internal_error(format!("failed to enqueue error frame: {err}")))
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        self.manager.close_stream(self.id);
    }
}

/// Loopback transport connecting two endpoints in the same process.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> SyncResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> SyncResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen_request() -> OpenRequest {
        OpenRequest {
            kind: StreamKind::Listen,
            auth_token: Some("token".into()),
        }
    }

    #[tokio::test]
    async fn stream_exchange_roundtrip() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::client(left_transport);
        let server = MultiplexedConnection::server(right_transport);

        let client_stream = client.open_stream(listen_request()).await.expect("client stream");
        let (request, server_stream) = server.accept_stream().await.expect("accepted");
        assert_eq!(request.kind, StreamKind::Listen);
        assert_eq!(request.auth_token.as_deref(), Some("token"));
        assert_eq!(server_stream.id(), client_stream.id());

        client_stream.send(b"hello".to_vec()).await.expect("client send");
        let payload = server_stream.next().await.expect("server recv").expect("payload");
        assert_eq!(payload, b"hello");

        server_stream.send(b"world".to_vec()).await.expect("server send");
        let payload = client_stream.next().await.expect("client recv").expect("payload");
        assert_eq!(payload, b"world");
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::client(left_transport);
        let server = MultiplexedConnection::server(right_transport);

        let client_stream = client.open_stream(listen_request()).await.expect("client stream");
        let (_, server_stream) = server.accept_stream().await.expect("accepted");

        client_stream.close().await.expect("close");
        assert!(server_stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failed_stream_surfaces_error_to_peer() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::client(left_transport);
        let server = MultiplexedConnection::server(right_transport);

        let client_stream = client.open_stream(listen_request()).await.expect("client stream");
        let (_, server_stream) = server.accept_stream().await.expect("accepted");

        server_stream
            .fail(crate::error::resource_exhausted("slow down"))
            .await
            .expect("fail");
        let err = client_stream.next().await.expect("event").unwrap_err();
        assert_eq!(err.code_str(), "docsync/resource-exhausted");
    }
}
