//! In-memory storage port
//!
//! Serves a scripted "remote" and keeps persisted blobs in a map. Used by the
//! engine's tests and usable by hosts without a filesystem. Every download
//! attempt's range start is recorded so tests can assert resume behavior.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use super::port::{derive_handle, Download, DownloadError, PersistedBlob, StorageHandle, StoragePort};
use crate::types::StorageError;

/// Scripted outcome for one download attempt against a URL
#[derive(Clone)]
pub enum ScriptedOutcome {
    /// Serve the remote body from the requested offset (206 semantics)
    Body,
    /// Serve the full body from offset 0 even if a range was requested
    /// (server ignored the Range header)
    IgnoreRange,
    /// Serve `n` bytes from the requested offset, then fail recoverably
    /// mid-stream (connection dropped)
    Partial(usize),
    /// Respond with an HTTP status failure before any bytes
    Status(u16),
    /// Fail recoverably before any bytes (connection reset)
    Reset,
    /// Block the body behind a gate; the stream yields only once a permit
    /// is added. Lets tests hold N downloads "in flight".
    Gated(Arc<Semaphore>),
}

/// In-memory storage port with a scriptable remote side
#[derive(Default)]
pub struct MemStorage {
    remote: DashMap<String, Bytes>,
    scripts: Mutex<std::collections::HashMap<String, VecDeque<ScriptedOutcome>>>,
    blobs: DashMap<String, Bytes>,
    /// (url, range_start) per attempted download, in order
    requests: Mutex<Vec<(String, u64)>>,
    downloads_started: AtomicU64,
}

impl MemStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Define the remote body for a URL
    pub fn host(&self, url: &str, body: impl Into<Bytes>) {
        self.remote.insert(url.to_string(), body.into());
    }

    /// Queue an outcome for the next download of `url`. Once the queue is
    /// empty, downloads fall back to `Body`.
    pub fn script(&self, url: &str, outcome: ScriptedOutcome) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Total downloads attempted (across all URLs)
    pub fn download_count(&self) -> u64 {
        self.downloads_started.load(Ordering::Relaxed)
    }

    /// Range starts recorded for a URL, in attempt order
    pub fn range_starts(&self, url: &str) -> Vec<u64> {
        self.requests
            .lock()
            .expect("requests lock")
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, start)| *start)
            .collect()
    }

    /// Drop a persisted blob out-of-band (simulates external deletion)
    pub fn corrupt(&self, handle: &StorageHandle) {
        self.blobs.remove(&handle.0);
    }

    fn next_outcome(&self, url: &str) -> ScriptedOutcome {
        self.scripts
            .lock()
            .expect("scripts lock")
            .get_mut(url)
            .and_then(|q| q.pop_front())
            .unwrap_or(ScriptedOutcome::Body)
    }
}

/// Split a body into smallish chunks so mid-stream behavior is exercised
fn chunked(body: Bytes) -> Vec<Result<Bytes, DownloadError>> {
    const CHUNK: usize = 4096;
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + CHUNK).min(body.len());
        out.push(Ok(body.slice(offset..end)));
        offset = end;
    }
    out
}

#[async_trait]
impl StoragePort for MemStorage {
    async fn download(
        &self,
        url: &str,
        range_start: u64,
        _timeout: Duration,
    ) -> Result<Download, DownloadError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push((url.to_string(), range_start));
        self.downloads_started.fetch_add(1, Ordering::Relaxed);

        let body = self
            .remote
            .get(url)
            .map(|b| b.clone())
            .ok_or_else(|| DownloadError::http(404, format!("no remote body for {url}")))?;
        let total = body.len() as u64;

        match self.next_outcome(url) {
            ScriptedOutcome::Body => {
                let start = range_start.min(total) as usize;
                Ok(Download {
                    offset: start as u64,
                    total_bytes: Some(total),
                    stream: stream::iter(chunked(body.slice(start..))).boxed(),
                })
            }
            ScriptedOutcome::IgnoreRange => Ok(Download {
                offset: 0,
                total_bytes: Some(total),
                stream: stream::iter(chunked(body)).boxed(),
            }),
            ScriptedOutcome::Partial(n) => {
                let start = range_start.min(total) as usize;
                let served = body.slice(start..(start + n).min(body.len()));
                let mut items = chunked(served);
                items.push(Err(DownloadError::recoverable("connection dropped")));
                Ok(Download {
                    offset: start as u64,
                    total_bytes: Some(total),
                    stream: stream::iter(items).boxed(),
                })
            }
            ScriptedOutcome::Status(code) => {
                Err(DownloadError::http(code, format!("HTTP {code} from {url}")))
            }
            ScriptedOutcome::Reset => Err(DownloadError::recoverable("connection reset")),
            ScriptedOutcome::Gated(gate) => {
                let start = range_start.min(total) as usize;
                let tail = body.slice(start..);
                let gated = stream::once(async move {
                    let permit = gate.acquire_owned().await.map_err(|_| {
                        DownloadError::recoverable("gate closed")
                    })?;
                    permit.forget();
                    Ok(Bytes::new())
                })
                .chain(stream::iter(chunked(tail)))
                .boxed();
                Ok(Download {
                    offset: start as u64,
                    total_bytes: Some(total),
                    stream: gated,
                })
            }
        }
    }

    async fn persist(&self, key: &str, bytes: &[u8]) -> Result<StorageHandle, StorageError> {
        let handle = derive_handle(key);
        self.blobs
            .insert(handle.0.clone(), Bytes::copy_from_slice(bytes));
        Ok(handle)
    }

    async fn read(&self, handle: &StorageHandle) -> Result<Bytes, StorageError> {
        self.blobs
            .get(&handle.0)
            .map(|b| b.clone())
            .ok_or_else(|| StorageError::NotFound(handle.0.clone()))
    }

    async fn stat(&self, handle: &StorageHandle) -> Result<u64, StorageError> {
        self.blobs
            .get(&handle.0)
            .map(|b| b.len() as u64)
            .ok_or_else(|| StorageError::NotFound(handle.0.clone()))
    }

    async fn delete(&self, handle: &StorageHandle) -> Result<(), StorageError> {
        self.blobs.remove(&handle.0);
        Ok(())
    }

    async fn list_persisted(&self) -> Result<Vec<PersistedBlob>, StorageError> {
        Ok(self
            .blobs
            .iter()
            .map(|e| PersistedBlob {
                handle: StorageHandle(e.key().clone()),
                size_bytes: e.value().len() as u64,
            })
            .collect())
    }
}
