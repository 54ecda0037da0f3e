//! Retry/resume controller
//!
//! Drives one task's download attempts: exponential backoff with jitter,
//! byte-range resume from the partial buffer, and suspension when the
//! network drops mid-flight. The current strategy is re-read at every
//! attempt, never cached across the task's lifetime.

use bytes::BytesMut;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::net::{AdaptiveStrategy, LinkClass, NetworkObserver, NetworkSnapshot, RetryPolicy};
use crate::storage::{DownloadError, StoragePort};
use crate::store::{CacheStore, ImageVariant};
use crate::transcode::Transcoder;
use crate::types::{LoadError, LoadedImage};

/// Shared collaborators for task runners
pub(crate) struct RunnerCtx {
    pub port: Arc<dyn StoragePort>,
    pub store: Arc<CacheStore>,
    pub observer: Arc<NetworkObserver>,
    pub strategy: Arc<AdaptiveStrategy>,
    pub transcoder: Arc<dyn Transcoder>,
}

/// How a dispatched task came back to the scheduler
pub(crate) enum TaskOutcome {
    Succeeded(LoadedImage),
    Failed(LoadError),
    /// Network dropped; progress preserved for redispatch after reconnect
    Suspended {
        received: BytesMut,
        total: Option<u64>,
        retries: u32,
    },
}

/// Backoff before retry `attempt` (1-based):
/// `min(max_delay, base * 2^(attempt-1) * weak_factor * (1 +/- 30% jitter))`
pub(crate) fn backoff_delay(
    policy: &RetryPolicy,
    attempt: u32,
    snapshot: &NetworkSnapshot,
) -> Duration {
    let exp = policy.base_delay.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let weak = weak_network_factor(snapshot);
    let jitter = 1.0 + (rand::random::<f64>() * 0.6 - 0.3);
    let delay_ms = (exp * weak * jitter).min(policy.max_delay.as_millis() as f64);
    Duration::from_millis(delay_ms.max(0.0) as u64)
}

/// Scales backoff up on a weak network so a struggling link gets more
/// breathing room between attempts
fn weak_network_factor(snapshot: &NetworkSnapshot) -> f64 {
    let weak = snapshot.class == LinkClass::CellularSlow || snapshot.failure_rate > 0.3;
    if !weak {
        return 1.0;
    }
    let latency_part = (snapshot.avg_latency_ms / 1000.0).min(1.0);
    1.0 + snapshot.failure_rate + latency_part
}

/// Run a task to a terminal outcome or suspension
pub(crate) async fn run_task(
    ctx: &RunnerCtx,
    key: &str,
    url: &str,
    variant: ImageVariant,
    mut received: BytesMut,
    mut total: Option<u64>,
    mut retries: u32,
) -> TaskOutcome {
    loop {
        let strategy = ctx.strategy.current();
        if strategy.cache_only {
            return TaskOutcome::Suspended {
                received,
                total,
                retries,
            };
        }

        let snapshot = ctx.observer.snapshot();
        let mut attempt_timeout = strategy.timeout;
        if snapshot.class == LinkClass::CellularSlow {
            attempt_timeout *= 2;
        }

        let started = Instant::now();
        let attempt_result = tokio::time::timeout(
            attempt_timeout,
            attempt(ctx.port.as_ref(), url, &mut received, &mut total, attempt_timeout),
        )
        .await;

        let failure = match attempt_result {
            Ok(Ok(())) => {
                ctx.observer.record_outcome(true, started.elapsed(), None);
                return complete(ctx, key, received.freeze(), variant).await;
            }
            Ok(Err(e)) => e,
            Err(_) => DownloadError::recoverable("attempt timed out"),
        };

        ctx.observer
            .record_outcome(false, started.elapsed(), failure.http_status);

        // Network gone: suspend rather than burn the retry budget
        if !ctx.observer.connected() {
            debug!(key, received = received.len(), "disconnected mid-flight, suspending");
            return TaskOutcome::Suspended {
                received,
                total,
                retries,
            };
        }

        // Re-read the policy; a strategy change mid-task applies here
        let policy = ctx.strategy.current().retry;
        if failure.recoverable && retries < policy.max_retries {
            retries += 1;
            let delay = backoff_delay(&policy, retries, &ctx.observer.snapshot());
            debug!(
                key,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                received = received.len(),
                "recoverable failure, backing off"
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        warn!(key, url, status = ?failure.http_status, retries, "fetch failed terminally");
        return TaskOutcome::Failed(LoadError::Terminal {
            url: url.to_string(),
            key: key.to_string(),
            http_status: failure.http_status,
            retry_count: retries,
        });
    }
}

/// One download attempt, resuming from the buffer's length. A plain-200
/// response restarts accumulation from zero.
async fn attempt(
    port: &dyn StoragePort,
    url: &str,
    received: &mut BytesMut,
    total: &mut Option<u64>,
    timeout: Duration,
) -> Result<(), DownloadError> {
    let download = port.download(url, received.len() as u64, timeout).await?;

    if download.offset as usize <= received.len() {
        received.truncate(download.offset as usize);
    } else {
        return Err(DownloadError::recoverable(format!(
            "server resumed at {} past our {} received bytes",
            download.offset,
            received.len()
        )));
    }
    if let Some(t) = download.total_bytes {
        *total = Some(t);
    }

    let mut stream = download.stream;
    while let Some(chunk) = stream.next().await {
        received.extend_from_slice(&chunk?);
    }

    if let Some(t) = *total {
        if (received.len() as u64) < t {
            return Err(DownloadError::recoverable(format!(
                "truncated body: {} of {} bytes",
                received.len(),
                t
            )));
        }
    }

    Ok(())
}

/// Transcode and persist a completed download. Persistence failure degrades
/// to returning the bytes without a cache entry behind them.
async fn complete(
    ctx: &RunnerCtx,
    key: &str,
    raw: bytes::Bytes,
    variant: ImageVariant,
) -> TaskOutcome {
    let quality = ctx.strategy.current().quality;
    let (bytes, width, height) = match ctx.transcoder.transcode(raw.clone(), variant, quality) {
        Ok(out) => (out.bytes, out.width, out.height),
        Err(e) => {
            warn!(key, error = %e, "transcode failed, caching raw bytes");
            (raw, None, None)
        }
    };

    let entry = ctx.store.put(key, &bytes, width, height).await;
    TaskOutcome::Succeeded(LoadedImage {
        key: key.to_string(),
        bytes,
        entry,
        from_cache: false,
    })
}
