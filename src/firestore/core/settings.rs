use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::backoff::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_INITIAL_DELAY_MILLIS, DEFAULT_JITTER_FACTOR,
    DEFAULT_MAX_DELAY_MILLIS,
};

/// Passing this as `cache_size_bytes` turns LRU collection off.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const HEALTHY_TIMEOUT: Duration = Duration::from_secs(10);
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CLIENT_METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(4);
pub const MAX_PRIMARY_LEASE_AGE: Duration = Duration::from_secs(5);
pub const MAX_CLIENT_AGE: Duration = Duration::from_secs(30 * 60);
pub const LRU_INITIAL_GC_DELAY: Duration = Duration::from_secs(60);
pub const LRU_REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistenceSettings {
    Memory,
    Durable {
        path: PathBuf,
        #[serde(default)]
        synchronize_tabs: bool,
    },
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        PersistenceSettings::Memory
    }
}

/// Client configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirestoreSettings {
    pub persistence: PersistenceSettings,
    pub cache_size_bytes: i64,
    pub max_concurrent_limbo_resolutions: usize,
    pub backoff: BackoffSettings,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            persistence: PersistenceSettings::Memory,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            backoff: BackoffSettings::default(),
        }
    }
}

impl FirestoreSettings {
    pub fn lru_params(&self) -> LruParams {
        if self.cache_size_bytes == CACHE_SIZE_UNLIMITED {
            LruParams::disabled()
        } else {
            LruParams::with_cache_size(self.cache_size_bytes)
        }
    }
}

/// Tuning knobs of the LRU garbage collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruParams {
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: u64,
}

impl LruParams {
    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            cache_size_collection_threshold: CACHE_SIZE_UNLIMITED,
            ..Self::default()
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.cache_size_collection_threshold == CACHE_SIZE_UNLIMITED
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffSettings {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MILLIS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MILLIS),
            jitter: DEFAULT_JITTER_FACTOR,
        }
    }
}
