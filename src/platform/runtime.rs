use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

static BACKGROUND_RUNTIME: OnceLock<Option<Runtime>> = OnceLock::new();

/// Spawns an async task that runs in the background.
///
/// Uses the ambient tokio runtime when called from one, otherwise a lazily
/// built single-threaded fallback runtime.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
        return;
    }

    let runtime = BACKGROUND_RUNTIME.get_or_init(|| {
        match Builder::new_multi_thread().worker_threads(1).enable_all().build() {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                log::error!("failed to build background runtime: {err}");
                None
            }
        }
    });
    match runtime {
        Some(runtime) => {
            runtime.spawn(future);
        }
        None => log::error!("dropping background task: no runtime available"),
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn spawned_task_runs_on_ambient_runtime() {
        let flag = Arc::new(AtomicBool::new(false));
        let task_flag = Arc::clone(&flag);
        spawn_detached(async move {
            task_flag.store(true, Ordering::SeqCst);
        });
        for _ in 0..20 {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(flag.load(Ordering::SeqCst));
    }
}
