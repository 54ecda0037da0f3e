//! Storage port - the narrow interface between the engine and the host's
//! primitive I/O
//!
//! The engine never touches the network or filesystem directly; it calls
//! through this trait. Production hosts use [`FsStorage`](super::FsStorage),
//! tests and filesystem-less hosts use [`MemStorage`](super::MemStorage).

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::types::StorageError;

/// Failure of a download attempt, classified for the retry controller.
///
/// Timeouts, 5xx responses and connection resets are recoverable; 4xx client
/// errors are not and must never be retried.
#[derive(Debug, Clone, Error)]
#[error("download failed (status {http_status:?}, recoverable {recoverable}): {message}")]
pub struct DownloadError {
    pub recoverable: bool,
    pub http_status: Option<u16>,
    pub message: String,
}

impl DownloadError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            recoverable: true,
            http_status: None,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            recoverable: false,
            http_status: None,
            message: message.into(),
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            // 5xx and 429 are worth retrying, other 4xx are not
            recoverable: status >= 500 || status == 429,
            http_status: Some(status),
            message: message.into(),
        }
    }
}

/// Opaque handle to a persisted blob, owned exclusively by the cache store
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StorageHandle(pub String);

impl fmt::Display for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A blob found on the persistent tier during startup reconciliation
#[derive(Debug, Clone)]
pub struct PersistedBlob {
    pub handle: StorageHandle,
    pub size_bytes: u64,
}

/// An accepted download: the server's actual starting offset, the total
/// length when known, and the body as a chunk stream.
///
/// `offset` is 0 when the server ignored the `Range` header (plain 200);
/// callers holding a partial buffer must discard it and restart accumulation.
pub struct Download {
    pub offset: u64,
    pub total_bytes: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, DownloadError>>,
}

/// Derive a stable storage handle from a resource key (sha256, truncated).
/// Shared by port implementations so a key always maps to the same blob name.
pub fn derive_handle(key: &str) -> StorageHandle {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let hash = hasher.finalize();
    StorageHandle(format!("{}.bin", hex::encode(&hash[..16])))
}

/// Byte-range download plus local blob persistence, as implemented by the
/// host platform.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Start a download at `range_start` (0 for a fresh fetch). `timeout`
    /// bounds connection establishment; the caller bounds the whole attempt.
    async fn download(
        &self,
        url: &str,
        range_start: u64,
        timeout: Duration,
    ) -> Result<Download, DownloadError>;

    /// Persist bytes under a handle derived from `key`. Must be atomic:
    /// a reader never observes a half-written blob.
    async fn persist(&self, key: &str, bytes: &[u8]) -> Result<StorageHandle, StorageError>;

    /// Read a persisted blob
    async fn read(&self, handle: &StorageHandle) -> Result<Bytes, StorageError>;

    /// Size of a persisted blob; `NotFound` if the backing file is gone
    async fn stat(&self, handle: &StorageHandle) -> Result<u64, StorageError>;

    /// Delete a persisted blob. Deleting a missing blob is not an error.
    async fn delete(&self, handle: &StorageHandle) -> Result<(), StorageError>;

    /// Enumerate all persisted blobs, used to reconcile the index at startup
    async fn list_persisted(&self) -> Result<Vec<PersistedBlob>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_classification() {
        assert!(DownloadError::http(500, "server error").recoverable);
        assert!(DownloadError::http(503, "unavailable").recoverable);
        assert!(DownloadError::http(429, "throttled").recoverable);
        assert!(!DownloadError::http(404, "not found").recoverable);
        assert!(!DownloadError::http(403, "forbidden").recoverable);
    }

    #[test]
    fn test_timeout_is_recoverable() {
        let err = DownloadError::recoverable("timeout");
        assert!(err.recoverable);
        assert_eq!(err.http_status, None);
    }
}
