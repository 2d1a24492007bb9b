pub mod async_queue;
pub mod backoff;
pub mod bloom_filter;

use std::sync::{Mutex, MutexGuard};

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use backoff::ExponentialBackoff;
pub use bloom_filter::BloomFilter;

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
