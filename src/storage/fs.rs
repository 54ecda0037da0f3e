//! Filesystem + HTTP storage port
//!
//! Downloads via reqwest with byte-range resume, persists blobs under the
//! cache directory with write-to-temp-then-rename so a reader never observes
//! a half-written file.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::port::{Download, DownloadError, PersistedBlob, StoragePort};
use crate::types::StorageError;

/// Extension for persisted blobs; files without it (the index file, temp
/// files) are ignored by `list_persisted`.
const BLOB_EXT: &str = "bin";

/// Production storage port: reqwest downloads, blobs on the local filesystem
pub struct FsStorage {
    client: reqwest::Client,
    dir: PathBuf,
}

impl FsStorage {
    /// Create a storage port rooted at `dir`, creating it if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        Ok(Self { client, dir })
    }

    fn path_for(&self, handle: &super::StorageHandle) -> PathBuf {
        self.dir.join(&handle.0)
    }
}

/// Parse the starting offset out of a Content-Range header ("bytes S-E/T")
fn content_range_start(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, _total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    start.parse().ok()
}

/// Parse the total length out of a Content-Range header
fn content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (_range, total) = rest.split_once('/')?;
    total.parse().ok()
}

fn map_reqwest_error(e: reqwest::Error) -> DownloadError {
    if let Some(status) = e.status() {
        return DownloadError::http(status.as_u16(), e.to_string());
    }
    if e.is_timeout() || e.is_connect() || e.is_body() || e.is_request() {
        DownloadError::recoverable(e.to_string())
    } else {
        DownloadError::terminal(e.to_string())
    }
}

#[async_trait]
impl StoragePort for FsStorage {
    async fn download(
        &self,
        url: &str,
        range_start: u64,
        timeout: Duration,
    ) -> Result<Download, DownloadError> {
        let mut request = self.client.get(url).timeout(timeout);
        if range_start > 0 {
            request = request.header(RANGE, format!("bytes={}-", range_start));
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();

        if !status.is_success() {
            return Err(DownloadError::http(
                status.as_u16(),
                format!("HTTP {} from {}", status, url),
            ));
        }

        // 206 honors the range; a plain 200 means the server restarted from
        // zero and any partial buffer must be discarded by the caller.
        let (offset, total_bytes) = if status == reqwest::StatusCode::PARTIAL_CONTENT {
            let header = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let offset = header
                .as_deref()
                .and_then(content_range_start)
                .unwrap_or(range_start);
            let total = header.as_deref().and_then(content_range_total);
            (offset, total)
        } else {
            (0, response.content_length())
        };

        debug!(url, offset, total = ?total_bytes, "download started");

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error))
            .boxed();

        Ok(Download {
            offset,
            total_bytes,
            stream,
        })
    }

    async fn persist(&self, key: &str, bytes: &[u8]) -> Result<super::StorageHandle, StorageError> {
        let handle = super::derive_handle(key);
        let final_path = self.path_for(&handle);
        let temp_path = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));

        tokio::fs::write(&temp_path, bytes).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(key, handle = %handle, size = bytes.len(), "blob persisted");
        Ok(handle)
    }

    async fn read(&self, handle: &super::StorageHandle) -> Result<Bytes, StorageError> {
        match tokio::fs::read(self.path_for(handle)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(handle.0.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, handle: &super::StorageHandle) -> Result<u64, StorageError> {
        match tokio::fs::metadata(self.path_for(handle)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(handle.0.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, handle: &super::StorageHandle) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(handle)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_persisted(&self) -> Result<Vec<PersistedBlob>, StorageError> {
        let mut blobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXT) {
                continue;
            }
            let Some(name) = file_name(&path) else {
                continue;
            };
            match entry.metadata().await {
                Ok(meta) if meta.is_file() => blobs.push(PersistedBlob {
                    handle: super::StorageHandle(name),
                    size_bytes: meta.len(),
                }),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "stat failed during listing"),
            }
        }

        Ok(blobs)
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_owned)
}
