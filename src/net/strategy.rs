//! Adaptive strategy - network state to fetch policy
//!
//! Derives an immutable `Strategy` snapshot from the observer's snapshot via
//! a static per-class preset table. Recomputation is debounced and a new
//! strategy is only published when at least one field changed, so dependents
//! never oscillate on per-sample noise.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

use super::observer::{LinkClass, NetworkSnapshot};
use crate::config::NetworkConfig;

/// Image quality tier requested from the transcode step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLevel {
    Low,
    Medium,
    High,
}

/// Retry budget and backoff shape for one fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Immutable policy snapshot. Consumers re-read the current strategy at
/// every decision point; a strategy is never cached across a fetch's
/// lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub max_concurrency: usize,
    pub quality: QualityLevel,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Serve only from cache; nothing is dispatched
    pub cache_only: bool,
}

impl Strategy {
    /// Preset for a link class (the disconnected preset is `offline`)
    pub fn for_class(class: LinkClass) -> Self {
        match class {
            LinkClass::Wifi => Self {
                max_concurrency: 6,
                quality: QualityLevel::High,
                timeout: Duration::from_secs(10),
                retry: RetryPolicy {
                    max_retries: 3,
                    base_delay: Duration::from_millis(500),
                    max_delay: Duration::from_secs(10),
                },
                cache_only: false,
            },
            LinkClass::CellularFast => Self {
                max_concurrency: 4,
                quality: QualityLevel::Medium,
                timeout: Duration::from_secs(15),
                retry: RetryPolicy {
                    max_retries: 3,
                    base_delay: Duration::from_millis(800),
                    max_delay: Duration::from_secs(15),
                },
                cache_only: false,
            },
            LinkClass::CellularSlow => Self {
                max_concurrency: 2,
                quality: QualityLevel::Low,
                timeout: Duration::from_secs(20),
                retry: RetryPolicy {
                    max_retries: 4,
                    base_delay: Duration::from_millis(1500),
                    max_delay: Duration::from_secs(30),
                },
                cache_only: false,
            },
            LinkClass::Unknown => Self {
                max_concurrency: 2,
                quality: QualityLevel::Medium,
                timeout: Duration::from_secs(15),
                retry: RetryPolicy {
                    max_retries: 3,
                    base_delay: Duration::from_secs(1),
                    max_delay: Duration::from_secs(20),
                },
                cache_only: false,
            },
        }
    }

    /// Preset while disconnected: nothing dispatches, cache serves
    pub fn offline() -> Self {
        Self {
            max_concurrency: 0,
            quality: QualityLevel::Low,
            timeout: Duration::from_secs(15),
            retry: RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
            cache_only: true,
        }
    }
}

/// Publishes strategy snapshots derived from network state
pub struct AdaptiveStrategy {
    tx: watch::Sender<Strategy>,
    last_reassess: Mutex<Instant>,
    debounce: Duration,
}

impl AdaptiveStrategy {
    pub fn new(config: &NetworkConfig) -> Self {
        let (tx, _) = watch::channel(Strategy::for_class(LinkClass::Unknown));
        Self {
            tx,
            // Allow the first reassess immediately
            last_reassess: Mutex::new(Instant::now() - config.strategy_debounce),
            debounce: config.strategy_debounce,
        }
    }

    /// Latest strategy snapshot (pure read)
    pub fn current(&self) -> Strategy {
        self.tx.borrow().clone()
    }

    /// Subscribe to strategy changes; receivers wake only on actual change
    pub fn subscribe(&self) -> watch::Receiver<Strategy> {
        self.tx.subscribe()
    }

    /// Install an arbitrary strategy, bypassing presets and debounce
    #[cfg(test)]
    pub(crate) fn force(&self, strategy: Strategy) {
        self.tx.send_replace(strategy);
    }

    /// Recompute from a network snapshot. Debounced; publishes only when the
    /// resulting strategy differs from the previous one.
    ///
    /// A disconnect always applies immediately - holding the old concurrency
    /// while offline would dispatch doomed downloads.
    pub fn reassess(&self, snapshot: &NetworkSnapshot) {
        let next = if snapshot.connected {
            Strategy::for_class(snapshot.class)
        } else {
            Strategy::offline()
        };

        let current = self.tx.borrow().clone();
        if next == current {
            debug!("strategy reassessed, unchanged");
            return;
        }

        // Rate-limit class-driven changes; samples keep flowing so a real
        // shift re-applies on a later reassess. Connectivity flips bypass
        // the limit.
        let connectivity_flip = next.cache_only != current.cache_only;
        if !connectivity_flip {
            let mut last = self.last_reassess.lock().expect("strategy lock");
            if last.elapsed() < self.debounce {
                debug!("strategy change suppressed by debounce");
                return;
            }
            *last = Instant::now();
        }

        info!(
            max_concurrency = next.max_concurrency,
            quality = ?next.quality,
            timeout_ms = next.timeout.as_millis() as u64,
            cache_only = next.cache_only,
            "strategy changed"
        );
        self.tx.send_replace(next);
    }
}
