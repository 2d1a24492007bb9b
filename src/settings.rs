use std::path::PathBuf;
use std::time::Duration;

use crate::model::DatabaseId;

/// Sentinel for [`LruSettings::cache_size_bytes`] that disables collection.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

const DEFAULT_CACHE_SIZE_BYTES: i64 = 100 * 1024 * 1024;

/// Where the local cache keeps its state between runs.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum PersistenceSettings {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
}

/// Exponential backoff applied between stream reconnect attempts and queue retries.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamSettings {
    pub idle_timeout: Duration,
    pub online_state_timeout: Duration,
    pub max_pending_writes: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            online_state_timeout: Duration::from_secs(10),
            max_pending_writes: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LruSettings {
    pub cache_size_bytes: i64,
    pub percentile_to_collect: u32,
    pub max_sequence_numbers_to_collect: usize,
    pub initial_delay: Duration,
    pub regular_delay: Duration,
}

impl Default for LruSettings {
    fn default() -> Self {
        Self {
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: 10,
            max_sequence_numbers_to_collect: 1_000,
            initial_delay: Duration::from_secs(60),
            regular_delay: Duration::from_secs(5 * 60),
        }
    }
}

impl LruSettings {
    pub fn disabled() -> Self {
        Self {
            cache_size_bytes: CACHE_SIZE_UNLIMITED,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_bytes != CACHE_SIZE_UNLIMITED
    }
}

/// Tuning for automatic index creation. The heuristic compares the number
/// of documents scanned by full collection scans against the number returned.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexAutoCreationSettings {
    pub enabled: bool,
    pub min_scanned_documents: usize,
    pub relative_index_read_cost: f64,
}

impl Default for IndexAutoCreationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_scanned_documents: 100,
            relative_index_read_cost: 8.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub database_id: DatabaseId,
    pub persistence: PersistenceSettings,
    /// Optional upper bound on the serialized size of the remote document cache.
    /// Transactions that would exceed it abort with a transient error.
    pub persistence_quota_bytes: Option<usize>,
    pub backoff: BackoffSettings,
    pub streams: StreamSettings,
    pub lru: LruSettings,
    pub index_auto_creation: IndexAutoCreationSettings,
    pub max_concurrent_limbo_resolutions: usize,
    pub retry_max_attempts: u32,
    pub retry_backoff: BackoffSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            database_id: DatabaseId::default(),
            persistence: PersistenceSettings::Memory,
            persistence_quota_bytes: None,
            backoff: BackoffSettings::default(),
            streams: StreamSettings::default(),
            lru: LruSettings::default(),
            index_auto_creation: IndexAutoCreationSettings::default(),
            max_concurrent_limbo_resolutions: 100,
            retry_max_attempts: 10,
            retry_backoff: BackoffSettings {
                initial_delay: Duration::from_millis(100),
                multiplier: 1.5,
                max_delay: Duration::from_secs(10),
                jitter_factor: 0.5,
            },
        }
    }
}

impl SyncSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            ..Self::default()
        }
    }

    pub fn with_persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_file_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence = PersistenceSettings::File { path: path.into() };
        self
    }

    pub fn with_persistence_quota(mut self, bytes: usize) -> Self {
        self.persistence_quota_bytes = Some(bytes);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_streams(mut self, streams: StreamSettings) -> Self {
        self.streams = streams;
        self
    }

    pub fn with_lru(mut self, lru: LruSettings) -> Self {
        self.lru = lru;
        self
    }

    pub fn with_index_auto_creation(mut self, settings: IndexAutoCreationSettings) -> Self {
        self.index_auto_creation = settings;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max.max(1);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: BackoffSettings) -> Self {
        self.retry_max_attempts = max_attempts.max(1);
        self.retry_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let settings = SyncSettings::default();
        assert_eq!(settings.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(settings.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(settings.streams.idle_timeout, Duration::from_secs(60));
        assert_eq!(settings.streams.online_state_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert_eq!(settings.index_auto_creation.min_scanned_documents, 100);
    }

    #[test]
    fn disabled_lru_is_unlimited() {
        let lru = LruSettings::disabled();
        assert!(!lru.is_enabled());
        assert!(LruSettings::default().is_enabled());
    }

    #[test]
    fn builder_clamps_limbo_bound() {
        let settings = SyncSettings::default().with_max_concurrent_limbo_resolutions(0);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 1);
    }
}
