//! Configuration for the lightbox engine
//!
//! Plain structs with sensible defaults plus environment variable overrides.
//! All policy constants (eviction weights, downgrade thresholds, debounce
//! intervals) live here as tunables rather than hard-coded values.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the cache store and persisted index
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum total size of cached blobs in bytes (default: 256 MB)
    pub max_bytes: u64,
    /// Directory for cached blobs and the index file
    pub cache_dir: PathBuf,
    /// Index file name within `cache_dir`
    pub index_file: String,
    /// Interval between debounced index flushes (default: 2s)
    pub index_flush_interval: Duration,
    /// Eviction target as a fraction of `max_bytes` under normal pressure
    pub evict_target_ratio: f64,
    /// Eviction target under aggressive pressure
    pub evict_aggressive_ratio: f64,
    /// Weight of access frequency in the eviction score
    pub frequency_weight: f64,
    /// Weight of recency in the eviction score
    pub recency_weight: f64,
    /// Entries younger than this survive a non-aggressive clear
    pub clear_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024, // 256 MB
            cache_dir: std::env::temp_dir().join("lightbox"),
            index_file: "index.json".to_string(),
            index_flush_interval: Duration::from_secs(2),
            evict_target_ratio: 0.7,
            evict_aggressive_ratio: 0.3,
            frequency_weight: 0.7,
            recency_weight: 0.3,
            clear_grace: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LIGHTBOX_CACHE_MAX_MB") {
            if let Ok(mb) = val.parse::<u64>() {
                config.max_bytes = mb * 1024 * 1024;
            }
        }

        if let Ok(val) = std::env::var("LIGHTBOX_CACHE_DIR") {
            if !val.is_empty() {
                config.cache_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = std::env::var("LIGHTBOX_INDEX_FLUSH_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.index_flush_interval = Duration::from_millis(ms);
            }
        }

        config
    }
}

/// Configuration for the network observer and adaptive strategy
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Rolling window size for latency/outcome samples (default: 20)
    pub window_size: usize,
    /// Failure rate above which the link class is downgraded one level
    pub downgrade_failure_rate: f64,
    /// Average latency above this is "not good"; two consecutive
    /// recomputations over it downgrade the link class
    pub good_latency: Duration,
    /// Debounce applied to host connectivity-change events (default: 300ms)
    pub connectivity_debounce: Duration,
    /// Minimum interval between strategy recomputations
    pub strategy_debounce: Duration,
    /// Settle delay after reconnection before suspended tasks redispatch
    pub reconnect_settle: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            downgrade_failure_rate: 0.3,
            good_latency: Duration::from_millis(800),
            connectivity_debounce: Duration::from_millis(300),
            strategy_debounce: Duration::from_millis(200),
            reconnect_settle: Duration::from_millis(500),
        }
    }
}

impl NetworkConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LIGHTBOX_SAMPLE_WINDOW") {
            if let Ok(n) = val.parse::<usize>() {
                if n > 0 {
                    config.window_size = n;
                }
            }
        }

        if let Ok(val) = std::env::var("LIGHTBOX_DOWNGRADE_FAILURE_RATE") {
            if let Ok(rate) = val.parse::<f64>() {
                config.downgrade_failure_rate = rate;
            }
        }

        config
    }
}

/// Configuration for the fetch scheduler
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Tasks queued longer than this while offline fail as stale
    pub task_ttl: Duration,
    /// Priority at or below which a task counts as a preload
    /// (bulk-droppable under critical memory pressure)
    pub preload_priority: i32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            task_ttl: Duration::from_secs(120),
            preload_priority: -100,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub network: NetworkConfig,
    pub fetch: FetchConfig,
}

impl EngineConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            cache: CacheConfig::from_env(),
            network: NetworkConfig::from_env(),
            fetch: FetchConfig::default(),
        }
    }
}
