//! Cache entries and resource keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::StorageHandle;

/// Quality/size tier of the same logical resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageVariant {
    Thumbnail,
    Preview,
    Full,
}

impl ImageVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageVariant::Thumbnail => "thumb",
            ImageVariant::Preview => "preview",
            ImageVariant::Full => "full",
        }
    }
}

impl fmt::Display for ImageVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier for a cached resource variant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub url: String,
    pub variant: ImageVariant,
}

impl ResourceKey {
    pub fn new(url: impl Into<String>, variant: ImageVariant) -> Self {
        Self {
            url: url.into(),
            variant,
        }
    }

    /// Index/storage key string. The URL is hashed so keys stay short and
    /// filesystem-safe; the variant tag keeps tiers distinct.
    pub fn storage_key(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_bytes());
        let hash = hasher.finalize();
        format!("{}:{}", hex::encode(&hash[..12]), self.variant)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.variant, self.url)
    }
}

/// One cached resource: backing blob handle plus access metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub handle: StorageHandle,
    pub size_bytes: u64,
    /// Pixel dimensions; absent for non-image variants
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

impl CacheEntry {
    pub fn new(
        key: String,
        handle: StorageHandle,
        size_bytes: u64,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            handle,
            size_bytes,
            width,
            height,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    /// Record a cache hit
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count += 1;
    }

    /// Age in seconds, floored at 1 so 1/age stays bounded
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds().max(1) as f64
    }
}

/// Composite eviction score: low scores evict first. Infrequently used
/// entries that are also old score lowest.
///
/// `normalize` maps a value into [0, 1] relative to the candidate set's
/// min/max, recomputed per eviction call.
pub(crate) fn eviction_score(
    entry: &CacheEntry,
    now: DateTime<Utc>,
    access_min: f64,
    access_max: f64,
    inv_age_min: f64,
    inv_age_max: f64,
    frequency_weight: f64,
    recency_weight: f64,
) -> f64 {
    let access = normalize(entry.access_count as f64, access_min, access_max);
    let inv_age = normalize(1.0 / entry.age_secs(now), inv_age_min, inv_age_max);
    frequency_weight * access + recency_weight * inv_age
}

fn normalize(value: f64, min: f64, max: f64) -> f64 {
    if (max - min).abs() < f64::EPSILON {
        0.5
    } else {
        (value - min) / (max - min)
    }
}
