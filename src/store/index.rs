//! Persisted cache index
//!
//! A JSON file mapping key -> entry metadata, rewritten by a debounced
//! background flush task. Read once at startup and validated against the
//! real blob storage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CacheEntry, CacheStore};
use crate::types::StorageError;

/// On-disk index layout, versioned so future layouts can migrate
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct IndexFile {
    pub version: u32,
    pub entries: HashMap<String, CacheEntry>,
}

pub(crate) const INDEX_VERSION: u32 = 1;

/// Load the index file. A missing file is an empty index; a corrupt file is
/// logged and treated as empty (the blob reconcile pass cleans up).
pub(crate) async fn load(path: &Path) -> HashMap<String, CacheEntry> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "index read failed, starting empty");
            return HashMap::new();
        }
    };

    match serde_json::from_slice::<IndexFile>(&raw) {
        Ok(file) if file.version == INDEX_VERSION => {
            debug!(entries = file.entries.len(), "index loaded");
            file.entries
        }
        Ok(file) => {
            warn!(version = file.version, "unsupported index version, starting empty");
            HashMap::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "index corrupt, starting empty");
            HashMap::new()
        }
    }
}

/// Write the index atomically (temp file then rename)
pub(crate) async fn save(
    path: &Path,
    entries: HashMap<String, CacheEntry>,
) -> Result<(), StorageError> {
    let file = IndexFile {
        version: INDEX_VERSION,
        entries,
    };
    let raw = serde_json::to_vec(&file).map_err(|e| StorageError::IndexCorrupt(e.to_string()))?;

    let temp: PathBuf = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    tokio::fs::write(&temp, raw).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Spawn a background task that rewrites the index whenever the store is
/// dirty, debounced to at most one write per interval.
pub fn spawn_index_flush_task(store: Arc<CacheStore>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = store.flush_index().await {
                warn!(error = %e, "index flush failed");
            }
        }
    });

    debug!(interval_ms = interval.as_millis() as u64, "index flush task started");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::derive_handle;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("lightbox-index-{}.json", Uuid::new_v4()))
    }

    fn sample_entry(key: &str) -> CacheEntry {
        CacheEntry::new(key.to_string(), derive_handle(key), 42, Some(10), Some(10))
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let path = temp_path();
        let mut entries = HashMap::new();
        entries.insert("a".to_string(), sample_entry("a"));
        entries.insert("b".to_string(), sample_entry("b"));

        save(&path, entries.clone()).await.unwrap();
        let loaded = load(&path).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("a"), entries.get("a"));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let loaded = load(Path::new("/nonexistent/lightbox/index.json")).await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_empty() {
        let path = temp_path();
        tokio::fs::write(&path, b"not json at all").await.unwrap();
        let loaded = load(&path).await;
        assert!(loaded.is_empty());
        let _ = tokio::fs::remove_file(&path).await;
    }
}
