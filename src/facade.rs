//! Engine facade - the single entry point hosts interact with
//!
//! Wires the store, scheduler, observer and strategy together and runs the
//! two background loops: the debounced index flush and the network wiring
//! loop that turns snapshot changes into strategy reassessment, suspension
//! sweeps and post-reconnect redispatch.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::fetch::{FetchScheduler, RunnerCtx};
use crate::net::{AdaptiveStrategy, LinkClass, NetworkObserver, NetworkSnapshot, Strategy};
use crate::storage::StoragePort;
use crate::store::{spawn_index_flush_task, CacheStats, CacheStore, ImageVariant, ResourceKey};
use crate::transcode::Transcoder;
use crate::types::{LoadError, LoadResult, LoadedImage, StorageError, PRIORITY_PRELOAD};

/// Host-reported memory pressure, mildest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Trim toward the normal eviction target
    Moderate,
    /// Trim hard, ignoring the grace period
    Severe,
    /// Drop everything droppable, including queued preloads
    Critical,
}

impl MemoryPressure {
    /// Map a host's numeric pressure level (1..=3, clamped) to a variant
    pub fn from_level(level: u8) -> Self {
        match level {
            0 | 1 => MemoryPressure::Moderate,
            2 => MemoryPressure::Severe,
            _ => MemoryPressure::Critical,
        }
    }
}

/// Adaptive fetch-and-cache engine for remote images
pub struct ImageCache {
    store: Arc<CacheStore>,
    scheduler: Arc<FetchScheduler>,
    observer: Arc<NetworkObserver>,
    strategy: Arc<AdaptiveStrategy>,
    port: Arc<dyn StoragePort>,
    config: EngineConfig,
}

impl ImageCache {
    /// Open the engine: load the persisted index, start the index flush and
    /// network wiring loops.
    pub async fn open(
        config: EngineConfig,
        port: Arc<dyn StoragePort>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Result<Arc<Self>, StorageError> {
        let store = CacheStore::open(config.cache.clone(), Arc::clone(&port)).await?;
        let observer = NetworkObserver::new(config.network.clone());
        let strategy = Arc::new(AdaptiveStrategy::new(&config.network));
        strategy.reassess(&observer.snapshot());

        let scheduler = FetchScheduler::new(
            RunnerCtx {
                port: Arc::clone(&port),
                store: Arc::clone(&store),
                observer: Arc::clone(&observer),
                strategy: Arc::clone(&strategy),
                transcoder,
            },
            config.fetch.clone(),
        );

        spawn_index_flush_task(Arc::clone(&store), config.cache.index_flush_interval);
        spawn_network_wiring_task(
            observer.subscribe(),
            Arc::clone(&strategy),
            Arc::clone(&scheduler),
            config.network.reconnect_settle,
        );

        info!("image cache engine opened");
        Ok(Arc::new(Self {
            store,
            scheduler,
            observer,
            strategy,
            port,
            config,
        }))
    }

    /// Load an image, serving from cache when possible and fetching
    /// otherwise. Concurrent loads of the same resource share one fetch.
    pub async fn load(&self, url: &str, variant: ImageVariant, priority: i32) -> LoadResult {
        let resource = ResourceKey {
            url: url.to_string(),
            variant,
        };
        let key = resource.storage_key();

        if let Some(entry) = self.store.get(&key).await {
            match self.port.read(&entry.handle).await {
                Ok(bytes) => {
                    debug!(key, size = entry.size_bytes, "served from cache");
                    return Ok(LoadedImage {
                        key,
                        bytes,
                        entry: Some(entry),
                        from_cache: true,
                    });
                }
                Err(e) => {
                    // Stat passed but the read failed; heal and refetch
                    warn!(key, error = %e, "cached blob unreadable, refetching");
                    self.store.remove(&key);
                }
            }
        }

        let rx = self.scheduler.enqueue(&resource, priority);
        rx.await.unwrap_or(Err(LoadError::Shutdown))
    }

    /// Queue background fetches at preload priority. Results are cached,
    /// not returned; failures are absorbed.
    pub fn preload(&self, urls: &[String], variant: ImageVariant) {
        for url in urls {
            let resource = ResourceKey {
                url: url.clone(),
                variant,
            };
            let _ = self.scheduler.enqueue(&resource, PRIORITY_PRELOAD);
        }
        debug!(count = urls.len(), "preloads queued");
    }

    /// Host connectivity callback. Debounced; rapid flapping collapses into
    /// the final state.
    pub fn report_connectivity(&self, connected: bool, class: LinkClass) {
        self.observer.report_connectivity(connected, class);
    }

    /// Respond to host memory pressure
    pub async fn on_memory_pressure(&self, pressure: MemoryPressure) {
        info!(pressure = ?pressure, "memory pressure reported");
        match pressure {
            MemoryPressure::Moderate => {
                self.store
                    .evict(self.config.cache.evict_target_ratio, false)
                    .await;
            }
            MemoryPressure::Severe => {
                self.store
                    .evict(self.config.cache.evict_aggressive_ratio, true)
                    .await;
            }
            MemoryPressure::Critical => {
                self.scheduler.drop_preloads();
                self.store.clear(true).await;
            }
        }
    }

    /// Evict down to `target_ratio * max_bytes`. Non-aggressive eviction
    /// spares entries still inside the grace period.
    pub async fn evict(&self, target_ratio: f64, aggressive: bool) {
        self.store.evict(target_ratio, aggressive).await;
    }

    /// Remove all cached entries and their blobs
    pub async fn clear(&self) {
        self.store.clear(true).await;
    }

    /// Flush the index to disk immediately
    pub async fn flush(&self) -> Result<(), StorageError> {
        self.store.flush_index().await
    }

    /// Current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Current network snapshot
    pub fn network(&self) -> NetworkSnapshot {
        self.observer.snapshot()
    }

    /// Current strategy; the receiver wakes on every strategy change
    pub fn subscribe_strategy(&self) -> watch::Receiver<Strategy> {
        self.strategy.subscribe()
    }
}

/// Turn observer snapshot changes into strategy and scheduler actions.
/// The loop exits when the observer (and with it the engine) is dropped.
fn spawn_network_wiring_task(
    mut rx: watch::Receiver<NetworkSnapshot>,
    strategy: Arc<AdaptiveStrategy>,
    scheduler: Arc<FetchScheduler>,
    reconnect_settle: Duration,
) {
    tokio::spawn(async move {
        let mut was_connected = rx.borrow().connected;
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            strategy.reassess(&snapshot);

            if snapshot.connected && !was_connected {
                // Links right after reconnect are often not usable yet
                tokio::time::sleep(reconnect_settle).await;
                scheduler.on_reconnected();
            } else if !snapshot.connected && was_connected {
                scheduler.sweep_stale();
            } else if snapshot.connected {
                // The concurrency limit may have risen without a
                // connectivity edge; queued tasks get the extra capacity now
                scheduler.drain();
            }
            was_connected = snapshot.connected;
        }
        debug!("network wiring loop stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, FetchConfig, NetworkConfig};
    use crate::storage::{MemStorage, ScriptedOutcome};
    use crate::transcode::PassthroughTranscoder;
    use crate::types::PRIORITY_NORMAL;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use uuid::Uuid;

    async fn engine(port: Arc<MemStorage>) -> Arc<ImageCache> {
        let config = EngineConfig {
            cache: CacheConfig {
                cache_dir: std::env::temp_dir().join(format!("lightbox-facade-{}", Uuid::new_v4())),
                clear_grace: Duration::ZERO,
                ..CacheConfig::default()
            },
            network: NetworkConfig {
                connectivity_debounce: Duration::from_millis(1),
                strategy_debounce: Duration::ZERO,
                reconnect_settle: Duration::from_millis(1),
                ..NetworkConfig::default()
            },
            fetch: FetchConfig::default(),
        };
        ImageCache::open(config, port, Arc::new(PassthroughTranscoder))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_miss_fetches_then_hit_serves_from_cache() {
        let port = MemStorage::new();
        port.host("https://img.example/a.jpg", b"jpeg-a".to_vec());
        let cache = engine(port.clone()).await;

        let first = cache
            .load("https://img.example/a.jpg", ImageVariant::Full, PRIORITY_NORMAL)
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert_eq!(&first.bytes[..], b"jpeg-a");

        let second = cache
            .load("https://img.example/a.jpg", ImageVariant::Full, PRIORITY_NORMAL)
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(&second.bytes[..], b"jpeg-a");
        assert_eq!(port.download_count(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_variants_cache_independently() {
        let port = MemStorage::new();
        port.host("https://img.example/a.jpg", b"jpeg-a".to_vec());
        let cache = engine(port.clone()).await;

        cache
            .load("https://img.example/a.jpg", ImageVariant::Full, PRIORITY_NORMAL)
            .await
            .unwrap();
        cache
            .load("https://img.example/a.jpg", ImageVariant::Thumbnail, PRIORITY_NORMAL)
            .await
            .unwrap();

        assert_eq!(port.download_count(), 2);
        assert_eq!(cache.stats().entry_count, 2);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let cache = engine(MemStorage::new()).await;
        let err = cache
            .load("not a url", ImageVariant::Full, PRIORITY_NORMAL)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_preload_populates_cache() {
        let port = MemStorage::new();
        port.host("https://img.example/p.jpg", b"preloaded".to_vec());
        let cache = engine(port.clone()).await;

        cache.preload(&["https://img.example/p.jpg".to_string()], ImageVariant::Preview);

        // Preloads complete in the background
        for _ in 0..200 {
            if cache.stats().entry_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.stats().entry_count, 1);

        let loaded = cache
            .load("https://img.example/p.jpg", ImageVariant::Preview, PRIORITY_NORMAL)
            .await
            .unwrap();
        assert!(loaded.from_cache);
        assert_eq!(port.download_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_pressure_critical_clears_cache() {
        let port = MemStorage::new();
        port.host("https://img.example/a.jpg", b"jpeg-a".to_vec());
        let cache = engine(port.clone()).await;

        cache
            .load("https://img.example/a.jpg", ImageVariant::Full, PRIORITY_NORMAL)
            .await
            .unwrap();
        assert_eq!(cache.stats().entry_count, 1);

        cache.on_memory_pressure(MemoryPressure::Critical).await;
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_unreadable_cached_blob_refetches() {
        let port = MemStorage::new();
        port.host("https://img.example/a.jpg", b"jpeg-a".to_vec());
        let cache = engine(port.clone()).await;

        let first = cache
            .load("https://img.example/a.jpg", ImageVariant::Full, PRIORITY_NORMAL)
            .await
            .unwrap();
        port.corrupt(&first.entry.unwrap().handle);

        let again = cache
            .load("https://img.example/a.jpg", ImageVariant::Full, PRIORITY_NORMAL)
            .await
            .unwrap();
        assert!(!again.from_cache);
        assert_eq!(&again.bytes[..], b"jpeg-a");
        assert_eq!(port.download_count(), 2);
    }

    #[tokio::test]
    async fn test_capacity_raise_dispatches_queued_tasks() {
        let port = MemStorage::new();
        let cache = engine(port.clone()).await;

        // Hold all downloads open so tasks pile up at the concurrency limit
        let gate = Arc::new(Semaphore::new(0));
        let mut receivers = Vec::new();
        for i in 0..3 {
            let url = format!("https://img.example/{i}.jpg");
            port.host(&url, b"x".to_vec());
            port.script(&url, ScriptedOutcome::Gated(gate.clone()));
            let resource = ResourceKey::new(url, ImageVariant::Full);
            receivers.push(cache.scheduler.enqueue(&resource, PRIORITY_NORMAL));
        }
        tokio::task::yield_now().await;

        // The initial (unknown-link) strategy allows two concurrent fetches
        assert_eq!(cache.scheduler.running_count(), 2);

        // Wifi raises the limit; the queued task must start without waiting
        // for a completion or another enqueue
        cache.report_connectivity(true, LinkClass::Wifi);
        let mut waited = 0;
        while cache.scheduler.running_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
            assert!(waited < 200, "raised capacity never dispatched the queued task");
        }

        gate.add_permits(3);
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_connectivity_flip_reaches_strategy() {
        let cache = engine(MemStorage::new()).await;
        let mut rx = cache.subscribe_strategy();

        cache.report_connectivity(false, LinkClass::Unknown);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().cache_only);

        cache.report_connectivity(true, LinkClass::Wifi);
        rx.changed().await.unwrap();
        let strategy = rx.borrow_and_update().clone();
        assert!(!strategy.cache_only);
        assert_eq!(strategy.max_concurrency, 6);
    }

    #[test]
    fn test_pressure_level_mapping() {
        assert_eq!(MemoryPressure::from_level(1), MemoryPressure::Moderate);
        assert_eq!(MemoryPressure::from_level(2), MemoryPressure::Severe);
        assert_eq!(MemoryPressure::from_level(3), MemoryPressure::Critical);
        assert_eq!(MemoryPressure::from_level(250), MemoryPressure::Critical);
    }
}
