use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::core::OnlineState;
use crate::error::SyncError;
use crate::util::{lock, AsyncQueue, DelayedOperation, TimerId};

/// Receives online state transitions.
pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) -> BoxFuture<'static, ()> + Send + Sync>;

/// Derives the client's [`OnlineState`] from the health of the listen and
/// write streams.
///
/// The state starts `Unknown` and becomes `Online` once either stream hears
/// from the authority. A connected client that loses a stream goes `Offline`
/// at once; a client that has not connected yet only goes `Offline` when the
/// online-state timer expires. Observers hear about transitions only.
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    queue: AsyncQueue,
    timeout: Duration,
    handler: OnlineStateHandler,
    status: Mutex<TrackerStatus>,
}

struct TrackerStatus {
    state: OnlineState,
    stream_failures: u32,
    timer: Option<DelayedOperation<()>>,
    should_warn_offline: bool,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, timeout: Duration, handler: OnlineStateHandler) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                timeout,
                handler,
                status: Mutex::new(TrackerStatus {
                    state: OnlineState::Unknown,
                    stream_failures: 0,
                    timer: None,
                    should_warn_offline: true,
                }),
            }),
        }
    }

    pub fn state(&self) -> OnlineState {
        lock(&self.inner.status).state
    }

    /// Called whenever a stream starts connecting. Arms the online-state
    /// timer unless a connection attempt already failed or another stream
    /// is already connected.
    pub async fn handle_stream_start(&self) {
        let arm_timer = {
            let status = lock(&self.inner.status);
            status.stream_failures == 0
                && status.timer.is_none()
                && status.state != OnlineState::Online
        };
        if !arm_timer {
            return;
        }
        self.set_and_broadcast(OnlineState::Unknown).await;

        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            self.inner.timeout,
            move || async move {
                if let Some(tracker) = upgrade(&weak) {
                    tracker.handle_timeout().await;
                }
                Ok(())
            },
        );
        lock(&self.inner.status).timer = Some(timer);
    }

    async fn handle_timeout(&self) {
        let unknown = {
            let mut status = lock(&self.inner.status);
            status.timer = None;
            status.state == OnlineState::Unknown
        };
        if unknown {
            self.log_offline(&format!(
                "backend did not respond within {:?}",
                self.inner.timeout
            ));
            self.set_and_broadcast(OnlineState::Offline).await;
        }
    }

    pub async fn handle_stream_failure(&self, error: &SyncError) {
        let next = {
            let mut status = lock(&self.inner.status);
            status.stream_failures += 1;
            if status.state == OnlineState::Online {
                if let Some(timer) = status.timer.take() {
                    timer.cancel();
                }
                Some(OnlineState::Offline)
            } else {
                None
            }
        };
        if let Some(next) = next {
            self.log_offline(&format!("connection failed: {error}"));
            self.set_and_broadcast(next).await;
        }
    }

    /// Explicit transition, e.g. when a stream heard from the authority or
    /// the network was disabled.
    pub async fn set(&self, new_state: OnlineState) {
        {
            let mut status = lock(&self.inner.status);
            if let Some(timer) = status.timer.take() {
                timer.cancel();
            }
            status.stream_failures = 0;
            if new_state == OnlineState::Online {
                status.should_warn_offline = false;
            }
        }
        self.set_and_broadcast(new_state).await;
    }

    async fn set_and_broadcast(&self, new_state: OnlineState) {
        let changed = {
            let mut status = lock(&self.inner.status);
            if status.state == new_state {
                false
            } else {
                status.state = new_state;
                true
            }
        };
        if changed {
            log::debug!("online state changed to {new_state:?}");
            (self.inner.handler)(new_state).await;
        }
    }

    fn log_offline(&self, details: &str) {
        let warn = {
            let mut status = lock(&self.inner.status);
            std::mem::replace(&mut status.should_warn_offline, false)
        };
        if warn {
            log::warn!("could not reach the remote authority, operating offline: {details}");
        } else {
            log::debug!("operating offline: {details}");
        }
    }
}

fn upgrade(weak: &Weak<TrackerInner>) -> Option<OnlineStateTracker> {
    weak.upgrade().map(|inner| OnlineStateTracker { inner })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unavailable;
    use futures::FutureExt;

    fn tracker() -> (OnlineStateTracker, Arc<Mutex<Vec<OnlineState>>>, AsyncQueue) {
        let queue = AsyncQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: OnlineStateHandler = Arc::new(move |state| {
            sink.lock().unwrap().push(state);
            async {}.boxed()
        });
        let tracker = OnlineStateTracker::new(queue.clone(), Duration::from_secs(10), handler);
        (tracker, seen, queue)
    }

    #[tokio::test]
    async fn timeout_without_connection_goes_offline() {
        let (tracker, seen, queue) = tracker();
        tracker.handle_stream_start().await;
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        tracker.handle_stream_failure(&unavailable("down")).await;
        assert_eq!(tracker.state(), OnlineState::Unknown);

        queue
            .run_delayed_operations_early(TimerId::OnlineStateTimeout)
            .await
            .expect("timer");
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(seen.lock().unwrap().clone(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn connecting_cancels_the_timer() {
        let (tracker, seen, queue) = tracker();
        tracker.handle_stream_start().await;
        tracker.set(OnlineState::Online).await;
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(seen.lock().unwrap().clone(), vec![OnlineState::Online]);
    }

    #[tokio::test]
    async fn failure_while_online_goes_offline_once() {
        let (tracker, seen, _queue) = tracker();
        tracker.set(OnlineState::Online).await;
        tracker.handle_stream_failure(&unavailable("reset")).await;
        tracker.handle_stream_failure(&unavailable("reset")).await;
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec![OnlineState::Online, OnlineState::Offline]
        );
    }

    #[tokio::test]
    async fn starting_another_stream_keeps_a_connected_client_online() {
        let (tracker, seen, queue) = tracker();
        tracker.set(OnlineState::Online).await;
        tracker.handle_stream_start().await;
        assert_eq!(tracker.state(), OnlineState::Online);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        assert_eq!(seen.lock().unwrap().clone(), vec![OnlineState::Online]);
    }
}
