use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::{cancelled, SyncResult};
use crate::platform::runtime;
use crate::settings::BackoffSettings;
use crate::util::backoff::ExponentialBackoff;
use crate::util::lock;

type Job = BoxFuture<'static, ()>;

/// Identifies the kind of a delayed operation so tests can fast-forward it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_delayed_operations_early`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    GarbageCollection,
    RetryTransaction,
}

/// Serial execution context. Operations run one at a time in submission order
/// on a single worker task; delayed operations join the same line when their
/// timer fires.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    sender: Sender<Job>,
    state: Mutex<QueueState>,
    retry_max_attempts: u32,
    retry_backoff: BackoffSettings,
}

#[derive(Default)]
struct QueueState {
    restricted: bool,
    next_timer_seq: u64,
    delayed: BTreeMap<u64, DelayedEntry>,
    retryable_tail: Option<Shared<BoxFuture<'static, ()>>>,
}

struct DelayedEntry {
    timer_id: TimerId,
    deadline: Instant,
    job: Job,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let defaults = crate::settings::SyncSettings::default();
        Self::with_retry(defaults.retry_max_attempts, defaults.retry_backoff)
    }

    pub fn with_retry(max_attempts: u32, backoff: BackoffSettings) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let queue = Self {
            inner: Arc::new(QueueInner {
                sender,
                state: Mutex::new(QueueState::default()),
                retry_max_attempts: max_attempts.max(1),
                retry_backoff: backoff,
            }),
        };
        Self::start_worker(receiver);
        queue
    }

    fn start_worker(receiver: Receiver<Job>) {
        runtime::spawn_detached(async move {
            while let Ok(job) = receiver.recv().await {
                job.await;
            }
            log::debug!("serial queue worker stopped");
        });
    }

    pub fn is_restricted(&self) -> bool {
        lock(&self.inner.state).restricted
    }

    /// Schedules `op` after every previously enqueued operation.
    ///
    /// In restricted mode the returned future never resolves.
    pub fn enqueue<F, Fut, T>(&self, op: F) -> BoxFuture<'static, SyncResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_restricted() {
            log::debug!("ignoring operation enqueued after shutdown");
            return futures::future::pending().boxed();
        }
        self.enqueue_even_while_restricted(op)
    }

    /// Fire-and-forget variant of [`enqueue`](Self::enqueue); failures are logged.
    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        if self.is_restricted() {
            return;
        }
        let job = async move {
            if let Err(err) = op().await {
                log::warn!("queued operation failed: {err}");
            }
        }
        .boxed();
        if self.inner.sender.try_send(job).is_err() {
            log::debug!("serial queue closed; dropping operation");
        }
    }

    /// Enqueues `op` and then enters restricted mode so nothing else can be
    /// added behind it.
    pub fn enqueue_and_initiate_shutdown<F, Fut, T>(&self, op: F) -> BoxFuture<'static, SyncResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let result = self.enqueue_even_while_restricted(op);
        self.enter_restricted_mode();
        result
    }

    /// New enqueues stop resolving and pending timers are dropped. Work that
    /// is already queued keeps draining.
    pub fn enter_restricted_mode(&self) {
        let dropped = {
            let mut state = lock(&self.inner.state);
            state.restricted = true;
            std::mem::take(&mut state.delayed)
        };
        if !dropped.is_empty() {
            log::debug!("cancelled {} delayed operations on shutdown", dropped.len());
        }
    }

    /// Resolves once every operation enqueued so far has run.
    pub fn drain(&self) -> BoxFuture<'static, SyncResult<()>> {
        self.enqueue_even_while_restricted(|| async { Ok(()) })
    }

    pub(crate) fn enqueue_even_while_restricted<F, Fut, T>(
        &self,
        op: F,
    ) -> BoxFuture<'static, SyncResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let result = op().await;
            let _ = tx.send(result);
        }
        .boxed();
        if self.inner.sender.try_send(job).is_err() {
            return futures::future::ready(Err(cancelled("The serial queue has shut down"))).boxed();
        }
        async move {
            rx.await
                .unwrap_or_else(|_| Err(cancelled("Queued operation was dropped")))
        }
        .boxed()
    }

    /// Schedules `op` to join the queue after `delay`. The returned handle can
    /// cancel it; cancelling an operation that already ran does nothing.
    pub fn enqueue_after_delay<F, Fut, T>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let result = op().await;
            let _ = tx.send(result);
        }
        .boxed();

        let id = {
            let mut state = lock(&self.inner.state);
            let id = state.next_timer_seq;
            state.next_timer_seq += 1;
            if !state.restricted {
                state.delayed.insert(
                    id,
                    DelayedEntry {
                        timer_id,
                        deadline: Instant::now() + delay,
                        job,
                    },
                );
            }
            id
        };

        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(id);
            }
        });

        DelayedOperation {
            id,
            timer_id,
            queue: Arc::downgrade(&self.inner),
            result: rx,
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        lock(&self.inner.state)
            .delayed
            .values()
            .any(|entry| timer_id == TimerId::All || entry.timer_id == timer_id)
    }

    /// Runs delayed operations immediately, in deadline order, up to and
    /// including the first one registered under `last_timer_id`.
    pub async fn run_delayed_operations_early(&self, last_timer_id: TimerId) -> SyncResult<()> {
        self.drain().await?;

        let jobs = {
            let mut state = lock(&self.inner.state);
            let mut ordered: Vec<(Instant, u64, TimerId)> = state
                .delayed
                .iter()
                .map(|(id, entry)| (entry.deadline, *id, entry.timer_id))
                .collect();
            ordered.sort();

            let mut selected = Vec::new();
            for (_, id, timer_id) in ordered {
                selected.push(id);
                if last_timer_id != TimerId::All && timer_id == last_timer_id {
                    break;
                }
            }
            selected
                .into_iter()
                .filter_map(|id| state.delayed.remove(&id))
                .map(|entry| entry.job)
                .collect::<Vec<_>>()
        };

        for job in jobs {
            if self.inner.sender.try_send(job).is_err() {
                break;
            }
        }
        self.drain().await
    }

    /// Runs `op` on the queue, retrying transient persistence failures with
    /// exponential backoff. Retryable operations run one at a time: a later
    /// one starts only after every earlier one succeeded or gave up. The error
    /// surfaces only once the configured attempts are exhausted.
    pub fn enqueue_retryable<F, Fut, T>(&self, op: F) -> BoxFuture<'static, SyncResult<T>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let previous = {
            let mut state = lock(&self.inner.state);
            if state.restricted {
                return futures::future::pending().boxed();
            }
            let previous = state.retryable_tail.take();
            state.retryable_tail = Some(done_rx.map(|_| ()).boxed().shared());
            previous
        };

        let (result_tx, result_rx) = oneshot::channel();
        let queue = self.clone();
        let op = Arc::new(op);
        runtime::spawn_detached(async move {
            if let Some(previous) = previous {
                previous.await;
            }
            let result = queue.run_with_retries(op).await;
            let _ = result_tx.send(result);
            let _ = done_tx.send(());
        });

        async move {
            result_rx
                .await
                .unwrap_or_else(|_| Err(cancelled("Retryable operation was dropped")))
        }
        .boxed()
    }

    async fn run_with_retries<F, Fut, T>(&self, op: Arc<F>) -> SyncResult<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut backoff = ExponentialBackoff::new(self.inner.retry_backoff.clone());
        let first = Arc::clone(&op);
        let mut result = self.enqueue(move || (*first)()).await;
        let mut attempt = 1;

        loop {
            match result {
                Err(err)
                    if err.is_transient_persistence_error()
                        && attempt < self.inner.retry_max_attempts =>
                {
                    let delay = backoff.next_delay();
                    log::debug!(
                        "retrying operation in {delay:?} after transient failure (attempt {attempt}): {err}"
                    );
                    attempt += 1;
                    let retry = Arc::clone(&op);
                    result = self
                        .enqueue_after_delay(TimerId::RetryTransaction, delay, move || (*retry)())
                        .result()
                        .await;
                }
                Err(err) if err.is_transient_persistence_error() => {
                    log::warn!("operation failed after {attempt} attempts: {err}");
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueInner {
    fn fire(&self, id: u64) {
        let entry = lock(&self.state).delayed.remove(&id);
        if let Some(entry) = entry {
            if self.sender.try_send(entry.job).is_err() {
                log::debug!("serial queue closed; dropping delayed operation");
            }
        }
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation<T> {
    id: u64,
    timer_id: TimerId,
    queue: Weak<QueueInner>,
    result: oneshot::Receiver<SyncResult<T>>,
}

impl<T> DelayedOperation<T> {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Removes the operation if it has not fired yet.
    pub fn cancel(&self) {
        if let Some(queue) = self.queue.upgrade() {
            lock(&queue.state).delayed.remove(&self.id);
        }
    }

    /// Waits for the operation's outcome. Resolves with a cancellation error
    /// when the operation was cancelled before it fired.
    pub async fn result(self) -> SyncResult<T> {
        self.result
            .await
            .unwrap_or_else(|_| Err(cancelled("Delayed operation was cancelled")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{aborted, invalid_argument};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_queue(max_attempts: u32) -> AsyncQueue {
        AsyncQueue::with_retry(
            max_attempts,
            BackoffSettings {
                initial_delay: Duration::from_millis(1),
                multiplier: 1.5,
                max_delay: Duration::from_millis(5),
                jitter_factor: 0.0,
            },
        )
    }

    #[tokio::test]
    async fn operations_run_in_submission_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pending = Vec::new();
        for i in 0..5 {
            let log = Arc::clone(&log);
            pending.push(queue.enqueue(move || async move {
                lock(&log).push(i);
                Ok(i)
            }));
        }
        let results = futures::future::join_all(pending).await;
        assert_eq!(results.into_iter().map(|r| r.unwrap()).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*lock(&log), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ran);
        let delayed = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(60), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        delayed.cancel();
        delayed.cancel();
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        queue.run_delayed_operations_early(TimerId::All).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        let err = delayed.result().await.unwrap_err();
        assert_eq!(err.code_str(), "docsync/cancelled");
    }

    #[tokio::test]
    async fn delayed_operations_can_run_early() {
        let queue = AsyncQueue::new();
        let delayed = queue.enqueue_after_delay(TimerId::GarbageCollection, Duration::from_secs(300), || async {
            Ok(42)
        });
        queue
            .run_delayed_operations_early(TimerId::GarbageCollection)
            .await
            .unwrap();
        assert_eq!(delayed.result().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn delayed_operation_fires_after_delay() {
        let queue = AsyncQueue::new();
        let delayed = queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_millis(10), || async {
            Ok("fired")
        });
        assert_eq!(delayed.result().await.unwrap(), "fired");
    }

    #[tokio::test]
    async fn retryable_operation_retries_transient_failures() {
        let queue = fast_queue(5);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result = queue
            .enqueue_retryable(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(aborted("transaction aborted"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retryable_operation_surfaces_error_after_exhaustion() {
        let queue = fast_queue(3);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: SyncResult<()> = queue
            .enqueue_retryable(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(aborted("quota exceeded"))
                }
            })
            .await;
        assert_eq!(result.unwrap_err().code_str(), "docsync/aborted");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let queue = fast_queue(5);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let result: SyncResult<()> = queue
            .enqueue_retryable(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(invalid_argument("bad input"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_operations_do_not_overlap() {
        let queue = fast_queue(5);
        let log = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicU32::new(0));

        let first_log = Arc::clone(&log);
        let first_attempts = Arc::clone(&attempts);
        let first = queue.enqueue_retryable(move || {
            let log = Arc::clone(&first_log);
            let attempts = Arc::clone(&first_attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(aborted("retry me"));
                }
                lock(&log).push("first");
                Ok(())
            }
        });
        let second_log = Arc::clone(&log);
        let second = queue.enqueue_retryable(move || {
            let log = Arc::clone(&second_log);
            async move {
                lock(&log).push("second");
                Ok(())
            }
        });

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(*lock(&log), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn restricted_mode_drains_existing_work_and_parks_new_work() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ran);
        let existing = queue.enqueue(move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let shutdown = queue.enqueue_and_initiate_shutdown(|| async { Ok("shutdown") });
        assert!(queue.is_restricted());

        let late = queue.enqueue(|| async { Ok(()) });
        existing.await.unwrap();
        assert_eq!(shutdown.await.unwrap(), "shutdown");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let outcome = tokio::time::timeout(Duration::from_millis(20), late).await;
        assert!(outcome.is_err());
    }
}
