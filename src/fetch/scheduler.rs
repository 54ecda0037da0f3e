//! Fetch scheduler - bounded-concurrency queue with per-key deduplication
//!
//! The queue, the task map and the running count are the only shared state,
//! guarded by one lock; downloads run in spawned tasks outside it. The
//! concurrency limit is re-read from the current strategy on every drain
//! decision, so a strategy change takes effect for the next dispatch without
//! cancelling anything in flight.

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::retry::{run_task, RunnerCtx, TaskOutcome};
use super::task::{FetchTask, QueueSlot, TaskState};
use crate::config::FetchConfig;
use crate::store::ResourceKey;
use crate::types::{LoadError, LoadResult};

struct SchedState {
    queue: BinaryHeap<QueueSlot>,
    /// Every live task by key - the deduplication index
    tasks: HashMap<String, FetchTask>,
    running: usize,
    seq: u64,
}

/// Accepts fetch requests, deduplicates by key, dispatches by priority
/// within the strategy's concurrency limit
pub struct FetchScheduler {
    state: Mutex<SchedState>,
    ctx: RunnerCtx,
    config: FetchConfig,
}

impl FetchScheduler {
    pub(crate) fn new(ctx: RunnerCtx, config: FetchConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedState {
                queue: BinaryHeap::new(),
                tasks: HashMap::new(),
                running: 0,
                seq: 0,
            }),
            ctx,
            config,
        })
    }

    /// Request a fetch. If a task for the key is already live, the caller
    /// attaches as a waiter on it; otherwise a task is queued. The returned
    /// receiver resolves when the task reaches a terminal state.
    pub fn enqueue(
        self: &Arc<Self>,
        resource: &ResourceKey,
        priority: i32,
    ) -> oneshot::Receiver<LoadResult> {
        let (tx, rx) = oneshot::channel();

        match reqwest::Url::parse(&resource.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            _ => {
                let _ = tx.send(Err(LoadError::InvalidUrl {
                    url: resource.url.clone(),
                }));
                return rx;
            }
        }

        let key = resource.storage_key();
        {
            let mut state = self.state.lock().expect("scheduler lock");
            if let Some(task) = state.tasks.get_mut(&key) {
                task.waiters.push(tx);
                // A hotter request raises a queued task's priority
                if task.state == TaskState::Pending && priority > task.priority {
                    task.priority = priority;
                    let slot = QueueSlot {
                        boosted: false,
                        priority,
                        seq: state.seq,
                        key: key.clone(),
                    };
                    state.seq += 1;
                    state.queue.push(slot);
                }
                debug!(key, "attached waiter to existing task");
                return rx;
            }

            let mut task = FetchTask::new(
                key.clone(),
                resource.url.clone(),
                resource.variant,
                priority,
            );
            task.waiters.push(tx);
            let slot = QueueSlot {
                boosted: false,
                priority,
                seq: state.seq,
                key: key.clone(),
            };
            state.seq += 1;
            state.tasks.insert(key.clone(), task);
            state.queue.push(slot);
            debug!(key, priority, "task queued");
        }

        // Each new task arms a one-shot expiry timer, so the TTL is enforced
        // even when nothing else touches the scheduler while offline
        let this = Arc::downgrade(self);
        let ttl = self.config.task_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(scheduler) = this.upgrade() {
                scheduler.sweep_stale();
            }
        });

        self.drain();
        rx
    }

    /// Dispatch queued tasks while the current strategy allows. Stale queue
    /// slots (task already dispatched via another slot, or gone) are
    /// skipped.
    pub(crate) fn drain(self: &Arc<Self>) {
        loop {
            let strategy = self.ctx.strategy.current();
            if strategy.cache_only {
                self.sweep_stale();
                return;
            }

            let seed = {
                let mut state = self.state.lock().expect("scheduler lock");
                if state.running >= strategy.max_concurrency {
                    return;
                }
                let seed = loop {
                    let Some(slot) = state.queue.pop() else {
                        break None;
                    };
                    let Some(task) = state.tasks.get_mut(&slot.key) else {
                        continue;
                    };
                    if !matches!(task.state, TaskState::Pending | TaskState::Suspended) {
                        continue;
                    }
                    task.state = TaskState::Downloading;
                    let (received, total, retries) = task.take_progress();
                    break Some((
                        task.key.clone(),
                        task.url.clone(),
                        task.variant,
                        received,
                        total,
                        retries,
                    ));
                };
                if seed.is_some() {
                    state.running += 1;
                }
                seed
            };

            let Some((key, url, variant, received, total, retries)) = seed else {
                return;
            };

            let this = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = run_task(
                    &this.ctx, &key, &url, variant, received, total, retries,
                )
                .await;
                this.finish(&key, outcome);
            });
        }
    }

    /// A runner came back; settle the task and keep draining
    fn finish(self: &Arc<Self>, key: &str, outcome: TaskOutcome) {
        let waiters = {
            let mut state = self.state.lock().expect("scheduler lock");
            state.running = state.running.saturating_sub(1);

            match outcome {
                TaskOutcome::Succeeded(image) => state
                    .tasks
                    .remove(key)
                    .map(|task| (task.waiters, Ok(image))),
                TaskOutcome::Failed(error) => state
                    .tasks
                    .remove(key)
                    .map(|task| (task.waiters, Err(error))),
                TaskOutcome::Suspended {
                    received,
                    total,
                    retries,
                } => {
                    if let Some(task) = state.tasks.get_mut(key) {
                        task.state = TaskState::Suspended;
                        task.restore_progress(received, total, retries);
                        task.suspended_at = Some(std::time::Instant::now());
                        debug!(key, "task suspended, awaiting reconnection");
                    }
                    None
                }
            }
        };

        if let Some((waiters, result)) = waiters {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }

        self.drain();
    }

    /// Redispatch suspended tasks, most recently suspended first, ahead of
    /// the normal queue for one cycle
    pub(crate) fn on_reconnected(self: &Arc<Self>) {
        let redispatched = {
            let mut state = self.state.lock().expect("scheduler lock");
            let mut suspended: Vec<(String, std::time::Instant)> = state
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Suspended)
                .map(|t| (t.key.clone(), t.suspended_at.unwrap_or(t.created_at)))
                .collect();
            suspended.sort_by(|a, b| b.1.cmp(&a.1));

            let count = suspended.len();
            for (key, _) in suspended {
                // Boosted slots sort by redispatch recency alone
                let slot = QueueSlot {
                    boosted: true,
                    priority: 0,
                    seq: state.seq,
                    key,
                };
                state.seq += 1;
                state.queue.push(slot);
            }
            count
        };

        if redispatched > 0 {
            info!(count = redispatched, "redispatching suspended tasks");
        }
        self.drain();
    }

    /// Fail queued tasks that outlived the task TTL while the network was
    /// unavailable. Everything younger stays queued for reconnection.
    pub(crate) fn sweep_stale(&self) {
        let expired = {
            let mut state = self.state.lock().expect("scheduler lock");
            let now = std::time::Instant::now();
            let ttl = self.config.task_ttl;
            let keys: Vec<String> = state
                .tasks
                .values()
                .filter(|t| {
                    matches!(t.state, TaskState::Pending | TaskState::Suspended)
                        && now.duration_since(t.created_at) > ttl
                })
                .map(|t| t.key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| state.tasks.remove(&k))
                .collect::<Vec<_>>()
        };

        for task in expired {
            warn!(key = task.key, "queued task expired while offline");
            let error = LoadError::Stale {
                key: task.key.clone(),
            };
            for waiter in task.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Drop all queued preload-priority tasks (critical memory pressure)
    pub(crate) fn drop_preloads(&self) {
        let dropped = {
            let mut state = self.state.lock().expect("scheduler lock");
            let keys: Vec<String> = state
                .tasks
                .values()
                .filter(|t| {
                    t.state == TaskState::Pending && t.priority <= self.config.preload_priority
                })
                .map(|t| t.key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| state.tasks.remove(&k))
                .collect::<Vec<_>>()
        };

        let count = dropped.len();
        for task in dropped {
            let error = LoadError::Stale {
                key: task.key.clone(),
            };
            for waiter in task.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        if count > 0 {
            info!(count, "dropped queued preloads under memory pressure");
        }
    }

    /// Number of tasks currently downloading
    pub fn running_count(&self) -> usize {
        self.state.lock().expect("scheduler lock").running
    }

    /// Number of live tasks in any state
    pub fn task_count(&self) -> usize {
        self.state.lock().expect("scheduler lock").tasks.len()
    }

    #[cfg(test)]
    pub(crate) fn task_state(&self, key: &str) -> Option<TaskState> {
        self.state
            .lock()
            .expect("scheduler lock")
            .tasks
            .get(key)
            .map(|t| t.state)
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.state
            .lock()
            .expect("scheduler lock")
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, NetworkConfig};
    use crate::net::{
        AdaptiveStrategy, LinkClass, NetworkObserver, QualityLevel, RetryPolicy, Strategy,
    };
    use crate::storage::{MemStorage, ScriptedOutcome};
    use crate::store::{CacheStore, ImageVariant};
    use crate::transcode::PassthroughTranscoder;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use uuid::Uuid;

    struct Rig {
        scheduler: Arc<FetchScheduler>,
        port: Arc<MemStorage>,
        observer: Arc<NetworkObserver>,
        strategy: Arc<AdaptiveStrategy>,
        store: Arc<CacheStore>,
    }

    async fn rig() -> Rig {
        rig_with(FetchConfig::default()).await
    }

    async fn rig_with(config: FetchConfig) -> Rig {
        let port = MemStorage::new();
        let cache_config = CacheConfig {
            cache_dir: std::env::temp_dir().join(format!("lightbox-sched-{}", Uuid::new_v4())),
            ..CacheConfig::default()
        };
        let store = CacheStore::open(cache_config, port.clone()).await.unwrap();
        let observer = NetworkObserver::new(NetworkConfig::default());
        let strategy = Arc::new(AdaptiveStrategy::new(&NetworkConfig::default()));
        observer.apply_connectivity(true, LinkClass::Wifi);
        strategy.reassess(&observer.snapshot());

        let ctx = RunnerCtx {
            port: port.clone(),
            store: store.clone(),
            observer: observer.clone(),
            strategy: strategy.clone(),
            transcoder: Arc::new(PassthroughTranscoder),
        };
        Rig {
            scheduler: FetchScheduler::new(ctx, config),
            port,
            observer,
            strategy,
            store,
        }
    }

    fn fast_retry(max_retries: u32) -> Strategy {
        Strategy {
            max_concurrency: 4,
            quality: QualityLevel::High,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
            cache_only: false,
        }
    }

    fn resource(url: &str) -> ResourceKey {
        ResourceKey::new(url, ImageVariant::Full)
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_fetch() {
        let r = rig().await;
        let url = "https://example.com/a.jpg";
        r.port.host(url, Bytes::from_static(b"image-bytes"));

        // Hold the download open so later enqueues find the task live
        let gate = Arc::new(Semaphore::new(0));
        r.port.script(url, ScriptedOutcome::Gated(gate.clone()));

        let res = resource(url);
        let rx1 = r.scheduler.enqueue(&res, 0);
        let rx2 = r.scheduler.enqueue(&res, 0);
        let rx3 = r.scheduler.enqueue(&res, 5);

        tokio::task::yield_now().await;
        assert_eq!(r.scheduler.task_count(), 1);

        gate.add_permits(1);
        let (a, b, c) = (rx1.await.unwrap(), rx2.await.unwrap(), rx3.await.unwrap());
        assert_eq!(&a.unwrap().bytes[..], b"image-bytes");
        assert_eq!(&b.unwrap().bytes[..], b"image-bytes");
        assert_eq!(&c.unwrap().bytes[..], b"image-bytes");

        assert_eq!(r.port.download_count(), 1);
        assert_eq!(r.scheduler.task_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit_respected() {
        let r = rig().await;
        r.strategy.force(Strategy {
            max_concurrency: 3,
            ..fast_retry(0)
        });

        let gate = Arc::new(Semaphore::new(0));
        let mut receivers = Vec::new();
        for i in 0..10 {
            let url = format!("https://example.com/{i}.jpg");
            r.port.host(&url, Bytes::from_static(b"x"));
            r.port.script(&url, ScriptedOutcome::Gated(gate.clone()));
            receivers.push(r.scheduler.enqueue(&resource(&url), 0));
        }
        tokio::task::yield_now().await;

        assert_eq!(r.scheduler.running_count(), 3);
        assert_eq!(r.scheduler.pending_count(), 7);

        // First three resolve; the next three start
        gate.add_permits(3);
        for rx in receivers.drain(..3) {
            rx.await.unwrap().unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(r.scheduler.running_count(), 3);
        assert_eq!(r.scheduler.pending_count(), 4);

        gate.add_permits(7);
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
        assert_eq!(r.scheduler.task_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_bound_then_terminal() {
        let r = rig().await;
        r.strategy.force(fast_retry(2));

        let url = "https://example.com/flaky.jpg";
        r.port.host(url, Bytes::from_static(b"never-served"));
        for _ in 0..3 {
            r.port.script(url, ScriptedOutcome::Reset);
        }

        let err = r
            .scheduler
            .enqueue(&resource(url), 0)
            .await
            .unwrap()
            .unwrap_err();

        match err {
            LoadError::Terminal { retry_count, .. } => assert_eq!(retry_count, 2),
            other => panic!("expected terminal error, got {other:?}"),
        }
        // Initial attempt plus two retries
        assert_eq!(r.port.download_count(), 3);
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let r = rig().await;
        r.strategy.force(fast_retry(3));

        let url = "https://example.com/missing.jpg";
        r.port.host(url, Bytes::from_static(b""));
        r.port.script(url, ScriptedOutcome::Status(404));

        let err = r
            .scheduler
            .enqueue(&resource(url), 0)
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.http_status(), Some(404));
        assert_eq!(r.port.download_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_from_partial_bytes() {
        let r = rig().await;
        r.strategy.force(fast_retry(3));

        let url = "https://example.com/big.jpg";
        let body = Bytes::from_static(b"0123456789");
        r.port.host(url, body.clone());
        r.port.script(url, ScriptedOutcome::Partial(4));

        let image = r.scheduler.enqueue(&resource(url), 0).await.unwrap().unwrap();
        assert_eq!(&image.bytes[..], &body[..]);

        // Second attempt resumed exactly where the first stopped
        assert_eq!(r.port.range_starts(url), vec![0, 4]);

        // And the full body landed in the cache
        let entry = image.entry.unwrap();
        assert_eq!(entry.size_bytes, 10);
        assert!(r.store.get(&entry.key).await.is_some());
    }

    #[tokio::test]
    async fn test_restart_when_server_ignores_range() {
        let r = rig().await;
        r.strategy.force(fast_retry(3));

        let url = "https://example.com/norange.jpg";
        let body = Bytes::from_static(b"abcdefghij");
        r.port.host(url, body.clone());
        r.port.script(url, ScriptedOutcome::Partial(4));
        r.port.script(url, ScriptedOutcome::IgnoreRange);

        let image = r.scheduler.enqueue(&resource(url), 0).await.unwrap().unwrap();
        // Partial buffer was discarded, not duplicated
        assert_eq!(&image.bytes[..], &body[..]);
    }

    #[tokio::test]
    async fn test_disconnect_suspends_and_reconnect_redispatches() {
        let r = rig().await;
        r.strategy.force(fast_retry(3));

        let url = "https://example.com/suspended.jpg";
        r.port.host(url, Bytes::from_static(b"payload"));
        r.port.script(url, ScriptedOutcome::Reset);

        // The failure lands while the observer says disconnected, so the
        // runner suspends instead of burning retries
        r.observer.apply_connectivity(false, LinkClass::Unknown);
        let res = resource(url);
        let rx = r.scheduler.enqueue(&res, 0);
        let key = res.storage_key();

        let mut waited = 0;
        while r.scheduler.task_state(&key) != Some(TaskState::Suspended) {
            tokio::time::sleep(Duration::from_millis(5)).await;
            waited += 1;
            assert!(waited < 200, "task never suspended");
        }

        r.observer.apply_connectivity(true, LinkClass::Wifi);
        r.scheduler.on_reconnected();

        let image = rx.await.unwrap().unwrap();
        assert_eq!(&image.bytes[..], b"payload");
    }

    #[tokio::test]
    async fn test_offline_queue_expires_to_stale() {
        let r = rig_with(FetchConfig {
            task_ttl: Duration::from_millis(20),
            ..FetchConfig::default()
        })
        .await;
        r.strategy.force(Strategy::offline());

        let url = "https://example.com/stale.jpg";
        r.port.host(url, Bytes::from_static(b"x"));
        let rx = r.scheduler.enqueue(&resource(url), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        r.scheduler.sweep_stale();

        assert!(matches!(rx.await.unwrap(), Err(LoadError::Stale { .. })));
        assert_eq!(r.port.download_count(), 0);
    }

    #[tokio::test]
    async fn test_offline_task_expires_without_external_trigger() {
        let r = rig_with(FetchConfig {
            task_ttl: Duration::from_millis(20),
            ..FetchConfig::default()
        })
        .await;
        r.strategy.force(Strategy::offline());

        let url = "https://example.com/abandoned.jpg";
        r.port.host(url, Bytes::from_static(b"x"));
        let rx = r.scheduler.enqueue(&resource(url), 0);

        // No sweep call, no further enqueues, no connectivity event: the
        // waiter must still resolve once the TTL elapses
        let result = tokio::time::timeout(Duration::from_millis(500), rx)
            .await
            .expect("waiter hung past the task ttl")
            .unwrap();
        assert!(matches!(result, Err(LoadError::Stale { .. })));
        assert_eq!(r.port.download_count(), 0);
        assert_eq!(r.scheduler.task_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected_without_fetch() {
        let r = rig().await;
        let rx = r.scheduler.enqueue(&resource("not a url"), 0);
        assert!(matches!(rx.await.unwrap(), Err(LoadError::InvalidUrl { .. })));
        assert_eq!(r.port.download_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_preloads_spares_normal_tasks() {
        let r = rig().await;
        r.strategy.force(Strategy {
            max_concurrency: 1,
            ..fast_retry(0)
        });

        let gate = Arc::new(Semaphore::new(0));
        let busy = "https://example.com/busy.jpg";
        r.port.host(busy, Bytes::from_static(b"x"));
        r.port.script(busy, ScriptedOutcome::Gated(gate.clone()));
        let busy_rx = r.scheduler.enqueue(&resource(busy), 0);

        let normal = "https://example.com/normal.jpg";
        let preload = "https://example.com/preload.jpg";
        r.port.host(normal, Bytes::from_static(b"n"));
        r.port.host(preload, Bytes::from_static(b"p"));
        tokio::task::yield_now().await;

        let normal_rx = r.scheduler.enqueue(&resource(normal), 0);
        let preload_rx = r.scheduler.enqueue(&resource(preload), crate::types::PRIORITY_PRELOAD);
        tokio::task::yield_now().await;

        r.scheduler.drop_preloads();
        assert!(matches!(preload_rx.await.unwrap(), Err(LoadError::Stale { .. })));

        gate.add_permits(1);
        busy_rx.await.unwrap().unwrap();
        normal_rx.await.unwrap().unwrap();
    }
}
