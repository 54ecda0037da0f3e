//! Shared types and error taxonomy
//!
//! A cache miss is control flow (`Option`), never an error. `LoadError` is
//! the only error a `load` caller sees: recoverable fetch failures are
//! retried internally and storage failures degrade to "cache not updated,
//! resource still returned".

use bytes::Bytes;
use thiserror::Error;

use crate::store::CacheEntry;

/// Terminal error delivered to `load` callers.
///
/// `Clone` so every waiter on a deduplicated fetch receives its own copy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The fetch will never succeed (4xx) or its retry budget is exhausted
    #[error("fetch failed for {url} (status {http_status:?}, {retry_count} retries)")]
    Terminal {
        url: String,
        key: String,
        http_status: Option<u16>,
        retry_count: u32,
    },

    /// Task sat queued past its TTL while the network was unavailable
    #[error("task {key} is stale, network unavailable")]
    Stale { key: String },

    /// URL failed validation before any fetch was attempted
    #[error("invalid url: {url}")]
    InvalidUrl { url: String },

    /// The engine shut down while the task was in flight
    #[error("engine shut down")]
    Shutdown,
}

impl LoadError {
    /// HTTP status associated with the failure, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            LoadError::Terminal { http_status, .. } => *http_status,
            _ => None,
        }
    }

    /// Whether the underlying condition was ever retryable.
    /// Always false by the time a caller sees it: recoverable failures are
    /// exhausted internally before surfacing.
    pub fn recoverable(&self) -> bool {
        false
    }
}

/// Storage-layer failure. Logged and absorbed on the `load` path; only
/// surfaced from explicit storage operations like `ImageCache::open`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("index corrupt: {0}")]
    IndexCorrupt(String),
}

/// A loaded resource: the bytes plus the cache entry that backs them.
///
/// `entry` is `None` when persistence failed and the caller is operating on
/// the freshly downloaded bytes without a cache entry behind them.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub key: String,
    pub bytes: Bytes,
    pub entry: Option<CacheEntry>,
    /// True when served from the cache without touching the network
    pub from_cache: bool,
}

/// Result type for load operations
pub type LoadResult = std::result::Result<LoadedImage, LoadError>;

/// Default priority for interactive loads
pub const PRIORITY_NORMAL: i32 = 0;
/// Priority for urgent (visible-viewport) loads
pub const PRIORITY_HIGH: i32 = 10;
/// Priority for preloads; at or below `FetchConfig::preload_priority`
pub const PRIORITY_PRELOAD: i32 = -100;
