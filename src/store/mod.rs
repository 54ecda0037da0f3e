//! Cache store - key-to-entry index with score-based eviction
//!
//! The in-memory index and the size counter are the only state behind the
//! lock; blob I/O happens outside it so file operations never serialize
//! unrelated work. An entry leaves the index only after its blob deletion
//! succeeded, so every indexed entry has a backing blob (stale entries from
//! out-of-band deletions self-heal on access).

mod entry;
mod index;

pub use entry::{CacheEntry, ImageVariant, ResourceKey};
pub use index::spawn_index_flush_task;

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::storage::{StorageHandle, StoragePort};
use crate::types::StorageError;

/// Aggregate cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in [0, 1]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn percent_full(&self) -> f64 {
        if self.max_bytes == 0 {
            0.0
        } else {
            (self.total_bytes as f64 / self.max_bytes as f64) * 100.0
        }
    }
}

struct StoreInner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
}

/// Two-tier cache store: in-memory index over port-persisted blobs
pub struct CacheStore {
    inner: Mutex<StoreInner>,
    port: Arc<dyn StoragePort>,
    config: CacheConfig,
    index_path: PathBuf,
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStore {
    /// Open the store: load the persisted index, drop entries whose backing
    /// blob fails a stat check, and delete orphaned blobs the index does not
    /// reference.
    pub async fn open(
        config: CacheConfig,
        port: Arc<dyn StoragePort>,
    ) -> Result<Arc<Self>, StorageError> {
        tokio::fs::create_dir_all(&config.cache_dir).await?;
        let index_path = config.cache_dir.join(&config.index_file);

        let loaded = index::load(&index_path).await;
        let mut entries = HashMap::with_capacity(loaded.len());
        let mut total_bytes = 0u64;
        let mut dropped = 0usize;

        for (key, entry) in loaded {
            match port.stat(&entry.handle).await {
                Ok(size) => {
                    total_bytes += size;
                    let mut entry = entry;
                    entry.size_bytes = size;
                    entries.insert(key, entry);
                }
                Err(_) => {
                    dropped += 1;
                }
            }
        }

        // Blobs on the persistent tier with no index entry: the original key
        // cannot be recovered from a hashed handle, so delete them.
        let mut orphans = 0usize;
        if let Ok(blobs) = port.list_persisted().await {
            let referenced: std::collections::HashSet<&StorageHandle> =
                entries.values().map(|e| &e.handle).collect();
            for blob in blobs {
                if !referenced.contains(&blob.handle) {
                    if let Err(e) = port.delete(&blob.handle).await {
                        warn!(handle = %blob.handle, error = %e, "orphan delete failed");
                    } else {
                        orphans += 1;
                    }
                }
            }
        }

        info!(
            entries = entries.len(),
            total_bytes,
            dropped_stale = dropped,
            deleted_orphans = orphans,
            "cache store opened"
        );

        Ok(Arc::new(Self {
            inner: Mutex::new(StoreInner {
                entries,
                total_bytes,
            }),
            port,
            config,
            index_path,
            dirty: AtomicBool::new(dropped > 0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }))
    }

    /// Look up an entry. A hit updates access metadata; a hit whose backing
    /// blob is gone self-heals into a miss, never an error.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let entry = {
            let mut inner = self.inner.lock().expect("store lock");
            match inner.entries.get_mut(key) {
                Some(entry) => {
                    entry.touch();
                    entry.clone()
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };
        self.dirty.store(true, Ordering::Relaxed);

        match self.port.stat(&entry.handle).await {
            Ok(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Err(StorageError::NotFound(_)) => {
                warn!(key, "backing blob missing, healing stale index entry");
                self.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                // Transient stat failure; serve the entry rather than degrade
                debug!(key, error = %e, "stat failed on hit, serving entry anyway");
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
        }
    }

    /// Persist bytes and index the entry. Persistence failure logs and
    /// returns `None` - the caller keeps the downloaded bytes and the cache
    /// simply isn't updated.
    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        width: Option<u32>,
        height: Option<u32>,
    ) -> Option<CacheEntry> {
        let handle = match self.port.persist(key, bytes).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(key, error = %e, "persist failed, cache not updated");
                return None;
            }
        };

        let entry = CacheEntry::new(key.to_string(), handle, bytes.len() as u64, width, height);
        let over_limit = {
            let mut inner = self.inner.lock().expect("store lock");
            if let Some(old) = inner.entries.insert(key.to_string(), entry.clone()) {
                inner.total_bytes = inner.total_bytes.saturating_sub(old.size_bytes);
            }
            inner.total_bytes += entry.size_bytes;
            inner.total_bytes > self.config.max_bytes
        };
        self.dirty.store(true, Ordering::Relaxed);
        debug!(key, size = entry.size_bytes, "entry cached");

        if over_limit {
            self.evict(self.config.evict_target_ratio, false).await;
        }

        Some(entry)
    }

    /// Drop an index entry without touching the blob (self-healing path)
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(old) = inner.entries.remove(key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(old.size_bytes);
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Reduce total size to `target_ratio * max_bytes`, removing entries in
    /// ascending composite-score order (infrequently and long-unused first).
    /// Non-aggressive eviction spares entries younger than the grace period.
    pub async fn evict(&self, target_ratio: f64, aggressive: bool) {
        let target = (self.config.max_bytes as f64 * target_ratio) as u64;
        let now = Utc::now();

        let candidates = {
            let inner = self.inner.lock().expect("store lock");
            if inner.total_bytes <= target {
                return;
            }

            // Non-aggressive eviction prefers sparing entries still inside
            // the grace period, unless that would leave the target
            // unreachable.
            let mut eligible: Vec<&CacheEntry> = inner
                .entries
                .values()
                .filter(|e| {
                    aggressive
                        || (now - e.created_at).to_std().unwrap_or_default()
                            >= self.config.clear_grace
                })
                .collect();
            let eligible_bytes: u64 = eligible.iter().map(|e| e.size_bytes).sum();
            if inner.total_bytes.saturating_sub(eligible_bytes) > target {
                eligible = inner.entries.values().collect();
            }
            if eligible.is_empty() {
                return;
            }

            let access_min = eligible.iter().map(|e| e.access_count as f64).fold(f64::MAX, f64::min);
            let access_max = eligible.iter().map(|e| e.access_count as f64).fold(f64::MIN, f64::max);
            let inv_age_min = eligible.iter().map(|e| 1.0 / e.age_secs(now)).fold(f64::MAX, f64::min);
            let inv_age_max = eligible.iter().map(|e| 1.0 / e.age_secs(now)).fold(f64::MIN, f64::max);

            let mut scored: Vec<(f64, String, StorageHandle, u64)> = eligible
                .iter()
                .map(|e| {
                    let score = entry::eviction_score(
                        e,
                        now,
                        access_min,
                        access_max,
                        inv_age_min,
                        inv_age_max,
                        self.config.frequency_weight,
                        self.config.recency_weight,
                    );
                    (score, e.key.clone(), e.handle.clone(), e.size_bytes)
                })
                .collect();
            scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

            let mut projected = inner.total_bytes;
            let mut picked = Vec::new();
            for (_, key, handle, size) in scored {
                if projected <= target {
                    break;
                }
                projected = projected.saturating_sub(size);
                picked.push((key, handle, size));
            }
            picked
        };

        // Blob deletion happens outside the lock; an entry is unindexed only
        // after its blob is gone. Individual failures are logged and skipped.
        let mut freed = 0u64;
        let mut removed = 0usize;
        for (key, handle, size) in candidates {
            match self.port.delete(&handle).await {
                Ok(()) => {
                    self.remove(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    freed += size;
                    removed += 1;
                }
                Err(e) => {
                    warn!(key, error = %e, "evict delete failed, skipping entry");
                }
            }
        }

        info!(removed, freed, aggressive, "eviction pass completed");
    }

    /// Remove entries. Aggressive removes everything; otherwise entries
    /// younger than the grace period survive.
    pub async fn clear(&self, aggressive: bool) {
        let now = Utc::now();
        let candidates: Vec<(String, StorageHandle)> = {
            let inner = self.inner.lock().expect("store lock");
            inner
                .entries
                .values()
                .filter(|e| {
                    aggressive
                        || (now - e.created_at).to_std().unwrap_or_default()
                            >= self.config.clear_grace
                })
                .map(|e| (e.key.clone(), e.handle.clone()))
                .collect()
        };

        let mut removed = 0usize;
        for (key, handle) in candidates {
            match self.port.delete(&handle).await {
                Ok(()) => {
                    self.remove(&key);
                    removed += 1;
                }
                Err(e) => warn!(key, error = %e, "clear delete failed, skipping entry"),
            }
        }

        info!(removed, aggressive, "cache cleared");
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("store lock");
        CacheStats {
            entry_count: inner.entries.len(),
            total_bytes: inner.total_bytes,
            max_bytes: self.config.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Rewrite the index file if anything changed since the last flush
    pub async fn flush_index(&self) -> Result<(), StorageError> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let snapshot = {
            let inner = self.inner.lock().expect("store lock");
            inner.entries.clone()
        };
        if let Err(e) = index::save(&self.index_path, snapshot).await {
            self.dirty.store(true, Ordering::Relaxed);
            return Err(e);
        }
        Ok(())
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().expect("store lock").total_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().expect("store lock").entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use uuid::Uuid;

    fn test_config(max_bytes: u64) -> CacheConfig {
        CacheConfig {
            max_bytes,
            cache_dir: std::env::temp_dir().join(format!("lightbox-store-{}", Uuid::new_v4())),
            clear_grace: std::time::Duration::ZERO,
            ..CacheConfig::default()
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let port = MemStorage::new();
        let store = CacheStore::open(test_config(1024), port).await.unwrap();

        let entry = store.put("k", b"hello", Some(4), Some(4)).await.unwrap();
        assert_eq!(entry.size_bytes, 5);

        let got = store.get("k").await.unwrap();
        assert_eq!(got.size_bytes, 5);
        assert_eq!(got.access_count, 1);
        assert_eq!(store.total_bytes(), 5);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert!(stats.hit_rate() > 0.99);
    }

    #[tokio::test]
    async fn test_self_heal_on_missing_blob() {
        let port = MemStorage::new();
        let store = CacheStore::open(test_config(1024), port.clone()).await.unwrap();

        let entry = store.put("k", b"data", None, None).await.unwrap();
        port.corrupt(&entry.handle);

        assert!(store.get("k").await.is_none());
        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.total_bytes(), 0);
    }

    #[tokio::test]
    async fn test_index_reload_after_restart() {
        let port = MemStorage::new();
        let config = test_config(1024);

        {
            let store = CacheStore::open(config.clone(), port.clone()).await.unwrap();
            store.put("keep", b"0123456789", None, None).await.unwrap();
            store.put("gone", b"abc", None, None).await.unwrap();
            store.flush_index().await.unwrap();
        }

        // Delete one blob out-of-band, then "restart"
        let gone_handle = crate::storage::derive_handle("gone");
        port.corrupt(&gone_handle);

        let store = CacheStore::open(config.clone(), port).await.unwrap();
        assert!(store.get("keep").await.is_some());
        assert!(store.get("gone").await.is_none());
        assert_eq!(store.total_bytes(), 10);

        let _ = tokio::fs::remove_dir_all(&config.cache_dir).await;
    }

    #[tokio::test]
    async fn test_eviction_converges_to_target() {
        let port = MemStorage::new();
        let store = CacheStore::open(test_config(1000), port).await.unwrap();

        // Fill to capacity with ten 100-byte entries
        for i in 0..10 {
            store
                .put(&format!("k{i}"), &[0u8; 100], None, None)
                .await
                .unwrap();
        }
        assert_eq!(store.total_bytes(), 1000);

        // Make some entries hot so scores differ
        for _ in 0..5 {
            store.get("k7").await;
            store.get("k8").await;
            store.get("k9").await;
        }

        store.evict(0.3, true).await;
        assert!(store.total_bytes() <= 300);

        // The hot entries survive the cold ones
        assert!(store.get("k9").await.is_some());
    }

    #[tokio::test]
    async fn test_put_over_limit_triggers_eviction() {
        let port = MemStorage::new();
        let store = CacheStore::open(test_config(250), port).await.unwrap();

        store.put("a", &[0u8; 100], None, None).await.unwrap();
        store.put("b", &[0u8; 100], None, None).await.unwrap();
        store.put("c", &[0u8; 100], None, None).await.unwrap();

        // 300 > 250 forced an eviction down to 0.7 * 250 = 175
        assert!(store.total_bytes() <= 175);
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let port = MemStorage::new();
        let store = CacheStore::open(test_config(1024), port.clone()).await.unwrap();

        store.put("a", b"aa", None, None).await.unwrap();
        store.put("b", b"bb", None, None).await.unwrap();
        store.clear(true).await;

        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.total_bytes(), 0);
        assert!(port.list_persisted().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_blobs_deleted_at_open() {
        let port = MemStorage::new();
        port.persist("orphan", b"junk").await.unwrap();

        let store = CacheStore::open(test_config(1024), port.clone()).await.unwrap();
        assert_eq!(store.entry_count(), 0);
        assert!(port.list_persisted().await.unwrap().is_empty());
    }
}
