use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{failed_precondition, invalid_argument, SyncError, SyncResult};
use crate::model::{Mutation, MutationResult, SnapshotVersion};
use crate::remote::datastore::{box_stream_future, StreamingDatastore, StreamingFuture, TokenProviderArc};
use crate::remote::serializer::JsonSerializer;
use crate::remote::stream::{PersistentStream, PersistentStreamDelegate, PersistentStreamState, StreamKind};
use crate::remote::streams::listen::encode_json;
use crate::settings::BackoffSettings;
use crate::util::{lock, AsyncQueue};

#[async_trait]
pub trait WriteStreamDelegate: Send + Sync + 'static {
    async fn on_write_open(&self) -> SyncResult<()>;

    /// The remote authority answered the handshake; mutations may be sent.
    async fn on_handshake_complete(&self) -> SyncResult<()>;

    /// Acknowledges the oldest batch that was written.
    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> SyncResult<()>;

    async fn on_write_close(&self, error: Option<SyncError>);
}

/// The write channel. After it opens the client sends a handshake; the
/// first response carries the stream token and every later one
/// acknowledges a batch, in the order the batches were written.
pub struct WriteStream<D>
where
    D: WriteStreamDelegate,
{
    stream: PersistentStream<WriteStreamHandler<D>>,
    handler: Arc<WriteStreamHandler<D>>,
}

struct WriteStreamHandler<D> {
    serializer: Arc<JsonSerializer>,
    delegate: Weak<D>,
    state: Mutex<WriteStreamStatus>,
}

#[derive(Default)]
struct WriteStreamStatus {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

impl<D> WriteStream<D>
where
    D: WriteStreamDelegate,
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
        let handler = Arc::new(WriteStreamHandler {
            serializer,
            delegate,
            state: Mutex::new(WriteStreamStatus::default()),
        });
        let stream = PersistentStream::new(
            StreamKind::Write,
            queue,
            datastore,
            token_provider,
            Arc::clone(&handler),
            backoff,
            idle_timeout,
        );
        Self { stream, handler }
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

    pub fn handshake_complete(&self) -> bool {
        lock(&self.handler.state).handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock(&self.handler.state).last_stream_token.clone()
    }

    /// Seeds the token from the local cache before the stream opens.
    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        lock(&self.handler.state).last_stream_token = token;
    }

    pub fn write_handshake(&self) -> SyncResult<()> {
        if self.handshake_complete() {
            return Err(failed_precondition("Handshake already completed"));
        }
        let request = self.handler.serializer.encode_handshake();
        self.stream.send(encode_json(&request)?)
    }

    pub fn write_mutations(&self, mutations: &[Mutation]) -> SyncResult<()> {
        let token = {
            let state = lock(&self.handler.state);
            if !state.handshake_complete {
                return Err(failed_precondition(
                    "Cannot write mutations before the handshake completes",
                ));
            }
            state.last_stream_token.clone()
        };
        let request = self.handler.serializer.encode_write_request(&token, mutations);
        self.stream.send(encode_json(&request)?)
    }
}

impl<D> PersistentStreamDelegate for WriteStreamHandler<D>
where
    D: WriteStreamDelegate,
{
    fn stream_label(&self) -> &'static str {
        StreamKind::Write.label()
    }

    fn on_stream_open(&self) -> StreamingFuture<'_, SyncResult<()>> {
        box_stream_future(async move {
            lock(&self.state).handshake_complete = false;
            match self.delegate.upgrade() {
                Some(delegate) => delegate.on_write_open().await,
                None => Ok(()),
            }
        })
    }

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>> {
        box_stream_future(async move {
            let value: JsonValue = serde_json::from_slice(&message)
                .map_err(|err| invalid_argument(format!("Malformed write response: {err}")))?;
            let response = self.serializer.decode_write_response(&value)?;
            let first_response = {
                let mut state = lock(&self.state);
                state.last_stream_token = response.stream_token;
                !std::mem::replace(&mut state.handshake_complete, true)
            };
            let Some(delegate) = self.delegate.upgrade() else {
                return Ok(());
            };
            if first_response {
                if !response.mutation_results.is_empty() {
                    return Err(invalid_argument("Handshake response carried write results"));
                }
                delegate.on_handshake_complete().await
            } else {
                delegate
                    .on_mutation_result(response.commit_version, response.mutation_results)
                    .await
            }
        })
    }

    fn on_stream_close(&self, error: Option<SyncError>) -> StreamingFuture<'_, ()> {
        // The handshake flag survives the close so the delegate can tell a
        // failed handshake from a failed write.
        box_stream_future(async move {
            if let Some(delegate) = self.delegate.upgrade() {
                delegate.on_write_close(error).await;
            }
        })
    }
}
