//! Network observer - rolling performance statistics from live traffic
//!
//! The single writer of network state. Components subscribe to snapshot
//! changes through a watch channel and never mutate the state themselves.
//! The effective link class is derived from measurement: a nominally fast
//! link that keeps failing or lagging is downgraded regardless of what the
//! host reports.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::NetworkConfig;

/// Connection class as reported by the host, ordered fast to slow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkClass {
    Wifi,
    CellularFast,
    CellularSlow,
    Unknown,
}

impl LinkClass {
    /// One level slower; measured trouble overrides the nominal class
    pub fn downgraded(self) -> Self {
        match self {
            LinkClass::Wifi => LinkClass::CellularFast,
            LinkClass::CellularFast => LinkClass::CellularSlow,
            LinkClass::CellularSlow => LinkClass::CellularSlow,
            LinkClass::Unknown => LinkClass::CellularSlow,
        }
    }
}

/// Immutable view of current network state
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSnapshot {
    pub connected: bool,
    /// Class reported by the host's connectivity callback
    pub nominal: LinkClass,
    /// Nominal class, downgraded when measurements disagree
    pub class: LinkClass,
    pub avg_latency_ms: f64,
    /// Failures / window, in [0, 1]
    pub failure_rate: f64,
    /// Instability metric in [0, 100]: latency variation boosted by failures
    pub fluctuation: f64,
}

impl NetworkSnapshot {
    fn initial() -> Self {
        Self {
            connected: true,
            nominal: LinkClass::Unknown,
            class: LinkClass::Unknown,
            avg_latency_ms: 0.0,
            failure_rate: 0.0,
            fluctuation: 0.0,
        }
    }
}

struct ObserverInner {
    connected: bool,
    nominal: LinkClass,
    latencies: VecDeque<f64>,
    outcomes: VecDeque<bool>,
    /// Consecutive recomputations with average latency over the good
    /// threshold; two in a row downgrade the class
    slow_streak: u32,
}

/// Tracks connectivity and rolling fetch statistics
pub struct NetworkObserver {
    inner: Mutex<ObserverInner>,
    config: NetworkConfig,
    tx: watch::Sender<NetworkSnapshot>,
    /// Debounce sequence for connectivity events; only the latest applies
    conn_seq: AtomicU64,
}

impl NetworkObserver {
    pub fn new(config: NetworkConfig) -> Arc<Self> {
        let (tx, _) = watch::channel(NetworkSnapshot::initial());
        Arc::new(Self {
            inner: Mutex::new(ObserverInner {
                connected: true,
                nominal: LinkClass::Unknown,
                latencies: VecDeque::new(),
                outcomes: VecDeque::new(),
                slow_streak: 0,
            }),
            config,
            tx,
            conn_seq: AtomicU64::new(0),
        })
    }

    /// Record one completed fetch attempt and republish the snapshot
    pub fn record_outcome(&self, success: bool, latency: Duration, http_status: Option<u16>) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("observer lock");
            let window = self.config.window_size;

            inner.outcomes.push_back(success);
            if inner.outcomes.len() > window {
                inner.outcomes.pop_front();
            }
            if success {
                inner.latencies.push_back(latency.as_millis() as f64);
                if inner.latencies.len() > window {
                    inner.latencies.pop_front();
                }
            }

            self.derive(&mut inner)
        };

        debug!(
            success,
            latency_ms = latency.as_millis() as u64,
            status = ?http_status,
            failure_rate = snapshot.failure_rate,
            class = ?snapshot.class,
            "fetch outcome recorded"
        );
        self.tx.send_replace(snapshot);
    }

    /// Host connectivity callback, debounced so rapid flapping collapses
    /// into the final state.
    pub fn report_connectivity(self: &Arc<Self>, connected: bool, class: LinkClass) {
        let seq = self.conn_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let this = Arc::clone(self);
        let debounce = self.config.connectivity_debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if this.conn_seq.load(Ordering::SeqCst) == seq {
                this.apply_connectivity(connected, class);
            }
        });
    }

    /// Apply a connectivity change immediately (the debounced path lands
    /// here; tests call it directly)
    pub fn apply_connectivity(&self, connected: bool, class: LinkClass) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("observer lock");
            inner.connected = connected;
            inner.nominal = class;
            self.derive(&mut inner)
        };
        info!(connected, class = ?class, "connectivity changed");
        self.tx.send_replace(snapshot);
    }

    /// Current snapshot (pure read)
    pub fn snapshot(&self) -> NetworkSnapshot {
        self.tx.borrow().clone()
    }

    pub fn connected(&self) -> bool {
        self.tx.borrow().connected
    }

    /// Subscribe to snapshot changes
    pub fn subscribe(&self) -> watch::Receiver<NetworkSnapshot> {
        self.tx.subscribe()
    }

    fn derive(&self, inner: &mut ObserverInner) -> NetworkSnapshot {
        let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
        let failure_rate = if inner.outcomes.is_empty() {
            0.0
        } else {
            failures as f64 / inner.outcomes.len() as f64
        };

        let avg_latency_ms = if inner.latencies.is_empty() {
            0.0
        } else {
            inner.latencies.iter().sum::<f64>() / inner.latencies.len() as f64
        };

        // Coefficient of variation of latency, scaled to 0-100 and boosted
        // by the failure rate
        let fluctuation = if inner.latencies.len() < 2 || avg_latency_ms == 0.0 {
            (failure_rate * 50.0).min(100.0)
        } else {
            let variance = inner
                .latencies
                .iter()
                .map(|l| (l - avg_latency_ms).powi(2))
                .sum::<f64>()
                / inner.latencies.len() as f64;
            let cv = variance.sqrt() / avg_latency_ms;
            (cv * 100.0 + failure_rate * 50.0).min(100.0)
        };

        if avg_latency_ms > self.config.good_latency.as_millis() as f64 {
            inner.slow_streak += 1;
        } else {
            inner.slow_streak = 0;
        }

        let class = if failure_rate > self.config.downgrade_failure_rate
            || inner.slow_streak >= 2
        {
            inner.nominal.downgraded()
        } else {
            inner.nominal
        };

        NetworkSnapshot {
            connected: inner.connected,
            nominal: inner.nominal,
            class,
            avg_latency_ms,
            failure_rate,
            fluctuation,
        }
    }
}
