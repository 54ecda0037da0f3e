//! Lightbox - adaptive image fetch-and-cache engine
//!
//! Client-side engine for loading remote images over unreliable networks:
//! a two-tier cache (in-memory index over persisted blobs), a deduplicating
//! priority scheduler with strategy-bounded concurrency, retry with
//! resumable downloads, and a network observer that adapts fetch policy to
//! measured link quality.
//!
//! ## Components
//!
//! - **Store**: key-to-entry index with score-based eviction over a
//!   pluggable blob storage port
//! - **Fetch**: per-key deduplicated queue, priority dispatch, retry with
//!   byte-range resume, suspension across connectivity loss
//! - **Net**: rolling network statistics and the strategy presets derived
//!   from them
//! - **Facade**: [`ImageCache`], the single entry point hosts interact with

pub mod config;
pub mod facade;
pub mod fetch;
pub mod net;
pub mod storage;
pub mod store;
pub mod transcode;
pub mod types;

pub use config::{CacheConfig, EngineConfig, FetchConfig, NetworkConfig};
pub use facade::{ImageCache, MemoryPressure};
pub use net::{LinkClass, NetworkSnapshot, QualityLevel, Strategy};
pub use store::{CacheEntry, CacheStats, ImageVariant, ResourceKey};
pub use transcode::{PassthroughTranscoder, TranscodeError, TranscodeOutput, Transcoder};
pub use types::{
    LoadError, LoadResult, LoadedImage, StorageError, PRIORITY_HIGH, PRIORITY_NORMAL,
    PRIORITY_PRELOAD,
};
