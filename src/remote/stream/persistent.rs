use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_channel::Sender;

use crate::error::{failed_precondition, unavailable, SyncError, SyncErrorCode, SyncResult};
use crate::platform::runtime;
use crate::remote::datastore::{
    StreamCredentials, StreamHandle, StreamingDatastore, StreamingFuture, TokenProviderArc,
};
use crate::remote::stream::StreamKind;
use crate::settings::BackoffSettings;
use crate::util::{lock, AsyncQueue, DelayedOperation, ExponentialBackoff, TimerId};

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial -> Starting -> Open -> (Error | Initial)
/// Error -> Backoff -> Initial
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    Initial,
    Starting,
    Open,
    Error,
    Backoff,
}

/// Receives the events of a [`PersistentStream`]. All callbacks run on the
/// serial queue.
pub trait PersistentStreamDelegate: Send + Sync + 'static {
    fn stream_label(&self) -> &'static str;

    fn on_stream_open(&self) -> StreamingFuture<'_, SyncResult<()>>;

    /// A failure closes the stream with that error.
    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, SyncResult<()>>;

    /// `None` when the stream was closed for being idle.
    fn on_stream_close(&self, error: Option<SyncError>) -> StreamingFuture<'_, ()>;
}

/// A reconnectable stream to the remote authority.
///
/// Every method must be called from an operation running on the serial
/// queue; events coming from the transport are re-enqueued there too. A
/// generation counter discards events of connections that were already torn
/// down.
pub struct PersistentStream<D: PersistentStreamDelegate> {
    inner: Arc<StreamInner<D>>,
}

impl<D: PersistentStreamDelegate> Clone for PersistentStream<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct StreamInner<D> {
    kind: StreamKind,
    queue: AsyncQueue,
    datastore: Arc<dyn StreamingDatastore>,
    token_provider: TokenProviderArc,
    delegate: Arc<D>,
    idle_timeout: Duration,
    status: Mutex<StreamStatus>,
}

struct StreamStatus {
    state: PersistentStreamState,
    generation: u64,
    backoff: ExponentialBackoff,
    handle: Option<Arc<dyn StreamHandle>>,
    outbound: Option<Sender<Vec<u8>>>,
    idle_timer: Option<DelayedOperation<()>>,
    backoff_timer: Option<DelayedOperation<()>>,
}

enum StreamEvent {
    Message(Vec<u8>),
    Closed(SyncError),
}

fn idle_timer_id(kind: StreamKind) -> TimerId {
    match kind {
        StreamKind::Listen => TimerId::ListenStreamIdle,
        StreamKind::Write => TimerId::WriteStreamIdle,
    }
}

fn backoff_timer_id(kind: StreamKind) -> TimerId {
    match kind {
        StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
        StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
    }
}

impl<D: PersistentStreamDelegate> PersistentStream<D> {
    pub fn new(
        kind: StreamKind,
        queue: AsyncQueue,
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
        delegate: Arc<D>,
        backoff: BackoffSettings,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                kind,
                queue,
                datastore,
                token_provider,
                delegate,
                idle_timeout,
                status: Mutex::new(StreamStatus {
                    state: PersistentStreamState::Initial,
                    generation: 0,
                    backoff: ExponentialBackoff::new(backoff),
                    handle: None,
                    outbound: None,
                    idle_timer: None,
                    backoff_timer: None,
                }),
            }),
        }
    }

    fn from_weak(weak: &Weak<StreamInner<D>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn delegate(&self) -> &Arc<D> {
        &self.inner.delegate
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    pub fn state(&self) -> PersistentStreamState {
        lock(&self.inner.status).state
    }

    /// Started streams are either connecting, connected or waiting out a
    /// backoff delay.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Starting
                | PersistentStreamState::Open
                | PersistentStreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == PersistentStreamState::Open
    }

    #[cfg(test)]
    pub(crate) fn backoff_base(&self) -> Duration {
        lock(&self.inner.status).backoff.current_base()
    }

    /// Connects the stream. A stream that last closed with an error waits
    /// for the backoff delay first.
    pub fn start(&self) {
        let generation = {
            let mut status = lock(&self.inner.status);
            match status.state {
                PersistentStreamState::Initial => {
                    status.state = PersistentStreamState::Starting;
                    Some(status.generation)
                }
                PersistentStreamState::Error => None,
                _ => return,
            }
        };

        let Some(generation) = generation else {
            self.perform_backoff();
            return;
        };

        let label = self.inner.delegate.stream_label();
        log::debug!("starting {label} stream");
        let kind = self.inner.kind;
        let datastore = Arc::clone(&self.inner.datastore);
        let token_provider = Arc::clone(&self.inner.token_provider);
        let queue = self.inner.queue.clone();
        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            let result = open_stream(kind, datastore, token_provider).await;
            queue.enqueue_and_forget(move || async move {
                if let Some(stream) = Self::from_weak(&weak) {
                    stream.handle_open_result(generation, result).await;
                }
                Ok(())
            });
        });
    }

    /// Closes the stream without notifying the delegate.
    pub fn stop(&self) {
        if !self.is_started() && self.state() != PersistentStreamState::Error {
            return;
        }
        log::debug!("stopping {} stream", self.inner.delegate.stream_label());
        self.tear_down(PersistentStreamState::Initial, None);
    }

    /// Allows the next [`start`](Self::start) to connect immediately, e.g.
    /// after a credential change.
    pub fn inhibit_backoff(&self) {
        let mut status = lock(&self.inner.status);
        if matches!(
            status.state,
            PersistentStreamState::Starting | PersistentStreamState::Open
        ) {
            return;
        }
        if let Some(timer) = status.backoff_timer.take() {
            timer.cancel();
        }
        status.state = PersistentStreamState::Initial;
        status.backoff.reset();
    }

    pub fn send(&self, payload: Vec<u8>) -> SyncResult<()> {
        let sender = {
            let status = lock(&self.inner.status);
            match (&status.state, &status.outbound) {
                (PersistentStreamState::Open, Some(sender)) => sender.clone(),
                _ => {
                    return Err(failed_precondition(format!(
                        "{} stream is not open",
                        self.inner.delegate.stream_label()
                    )))
                }
            }
        };
        self.reset_idle_timer();
        sender
            .try_send(payload)
            .map_err(|err| unavailable(format!("failed to queue outbound message: {err}")))
    }

    async fn handle_open_result(&self, generation: u64, result: SyncResult<Arc<dyn StreamHandle>>) {
        let label = self.inner.delegate.stream_label();
        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                if self.current_generation() == generation {
                    log::warn!("{label} stream failed to open: {err}");
                    self.close(PersistentStreamState::Error, Some(err)).await;
                }
                return;
            }
        };

        let outbound_rx = {
            let mut status = lock(&self.inner.status);
            if status.generation != generation || status.state != PersistentStreamState::Starting {
                None
            } else {
                let (tx, rx) = async_channel::unbounded();
                status.state = PersistentStreamState::Open;
                status.backoff.reset();
                status.outbound = Some(tx);
                status.handle = Some(Arc::clone(&handle));
                Some(rx)
            }
        };
        let Some(outbound_rx) = outbound_rx else {
            runtime::spawn_detached(async move {
                let _ = handle.close().await;
            });
            return;
        };
        log::debug!("{label} stream open");

        let writer = Arc::clone(&handle);
        runtime::spawn_detached(async move {
            while let Ok(payload) = outbound_rx.recv().await {
                if let Err(err) = writer.send(payload).await {
                    log::debug!("{label} stream writer stopped: {err}");
                    break;
                }
            }
        });

        let reader = handle;
        let queue = self.inner.queue.clone();
        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            loop {
                let (event, last) = match reader.next().await {
                    Some(Ok(payload)) => (StreamEvent::Message(payload), false),
                    Some(Err(err)) => (StreamEvent::Closed(err), true),
                    None => (
                        StreamEvent::Closed(unavailable(format!(
                            "{label} stream closed by the remote authority"
                        ))),
                        true,
                    ),
                };
                let weak = weak.clone();
                queue.enqueue_and_forget(move || async move {
                    if let Some(stream) = Self::from_weak(&weak) {
                        stream.handle_event(generation, event).await;
                    }
                    Ok(())
                });
                if last {
                    break;
                }
            }
        });

        self.reset_idle_timer();
        if let Err(err) = self.inner.delegate.on_stream_open().await {
            self.close(PersistentStreamState::Error, Some(err)).await;
        }
    }

    async fn handle_event(&self, generation: u64, event: StreamEvent) {
        if self.current_generation() != generation {
            return;
        }
        let label = self.inner.delegate.stream_label();
        match event {
            StreamEvent::Message(payload) => {
                self.reset_idle_timer();
                if let Err(err) = self.inner.delegate.on_stream_message(payload).await {
                    log::warn!("{label} stream failed to handle message: {err}");
                    self.close(PersistentStreamState::Error, Some(err)).await;
                }
            }
            StreamEvent::Closed(err) => {
                log::debug!("{label} stream closed: {err}");
                self.close(PersistentStreamState::Error, Some(err)).await;
            }
        }
    }

    async fn handle_idle_timer(&self) {
        if self.is_open() {
            log::debug!("closing idle {} stream", self.inner.delegate.stream_label());
            self.close(PersistentStreamState::Initial, None).await;
        }
    }

    fn current_generation(&self) -> u64 {
        lock(&self.inner.status).generation
    }

    fn reset_idle_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.queue.enqueue_after_delay(
            idle_timer_id(self.inner.kind),
            self.inner.idle_timeout,
            move || async move {
                if let Some(stream) = Self::from_weak(&weak) {
                    stream.handle_idle_timer().await;
                }
                Ok(())
            },
        );
        let previous = lock(&self.inner.status).idle_timer.replace(timer);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn perform_backoff(&self) {
        let delay = {
            let mut status = lock(&self.inner.status);
            status.state = PersistentStreamState::Backoff;
            status.backoff.next_delay()
        };
        log::debug!(
            "{} stream backing off for {delay:?}",
            self.inner.delegate.stream_label()
        );
        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.queue.enqueue_after_delay(
            backoff_timer_id(self.inner.kind),
            delay,
            move || async move {
                if let Some(stream) = Self::from_weak(&weak) {
                    stream.restart_after_backoff();
                }
                Ok(())
            },
        );
        let previous = lock(&self.inner.status).backoff_timer.replace(timer);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn restart_after_backoff(&self) {
        {
            let mut status = lock(&self.inner.status);
            if status.state != PersistentStreamState::Backoff {
                return;
            }
            status.state = PersistentStreamState::Initial;
            status.backoff_timer = None;
        }
        self.start();
    }

    async fn close(&self, final_state: PersistentStreamState, error: Option<SyncError>) {
        self.tear_down(final_state, error.as_ref());
        self.inner.delegate.on_stream_close(error).await;
    }

    fn tear_down(&self, final_state: PersistentStreamState, error: Option<&SyncError>) {
        let handle = {
            let mut status = lock(&self.inner.status);
            status.generation += 1;
            if let Some(timer) = status.idle_timer.take() {
                timer.cancel();
            }
            if let Some(timer) = status.backoff_timer.take() {
                timer.cancel();
            }
            status.outbound = None;

            if final_state != PersistentStreamState::Error {
                status.backoff.reset();
            } else if let Some(err) = error {
                match err.code {
                    SyncErrorCode::ResourceExhausted => {
                        log::debug!(
                            "{} stream exhausted the remote resource; using maximum backoff",
                            self.inner.delegate.stream_label()
                        );
                        status.backoff.reset_to_max();
                    }
                    SyncErrorCode::Unauthenticated => {
                        self.inner.token_provider.invalidate_token();
                    }
                    _ => {}
                }
            }
            status.state = final_state;
            status.handle.take()
        };

        if let Some(handle) = handle {
            runtime::spawn_detached(async move {
                let _ = handle.close().await;
            });
        }
    }
}

async fn open_stream(
    kind: StreamKind,
    datastore: Arc<dyn StreamingDatastore>,
    token_provider: TokenProviderArc,
) -> SyncResult<Arc<dyn StreamHandle>> {
    let auth_token = token_provider.get_token().await?;
    let credentials = StreamCredentials { auth_token };
    match kind {
        StreamKind::Listen => datastore.open_listen_stream(credentials).await,
        StreamKind::Write => datastore.open_write_stream(credentials).await,
    }
}
