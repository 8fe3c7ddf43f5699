//! Two-tier response cache.
//!
//! L1 is a bounded in-memory LRU; L2 is one JSON blob per fingerprint in
//! a flat directory, bounded by a disk quota with least-recently-written
//! eviction. Lookup order is strictly L1 then L2, and an L2 hit promotes
//! the entry into L1. Disk failures never fail a request: they are logged
//! and demoted to misses, and a corrupt L2 entry is evicted on sight.

use crate::config::CacheConfig;
use crate::errors::ExtractError;
use crate::fingerprint::Fingerprint;
use crate::types::ExtractionResult;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

const DISK_TIMEOUT: Duration = Duration::from_secs(5);

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    L1,
    L2,
}

/// On-disk entry shape. `result` is immutable once written; the entry may
/// be rewritten wholesale only to refresh its recency.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    result: ExtractionResult,
    stored_at: DateTime<Utc>,
}

/// Counters exposed by [`CacheManager::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1_size: usize,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
}

pub struct CacheManager {
    l1: RwLock<LruCache<Fingerprint, ExtractionResult>>,
    l2_dir: PathBuf,
    l2_max_bytes: u64,
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
}

impl CacheManager {
    pub async fn open(config: &CacheConfig) -> Result<Self, ExtractError> {
        let capacity = NonZeroUsize::new(config.l1_capacity).unwrap_or(NonZeroUsize::MIN);
        tokio::fs::create_dir_all(&config.l2_dir).await?;
        Ok(Self {
            l1: RwLock::new(LruCache::new(capacity)),
            l2_dir: config.l2_dir.clone(),
            l2_max_bytes: config.l2_max_bytes,
            l1_hits: AtomicU64::new(0),
            l1_misses: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            l2_misses: AtomicU64::new(0),
        })
    }

    /// Looks a fingerprint up, L1 first. An L2 hit is promoted into L1.
    pub async fn get(&self, key: Fingerprint) -> Option<(ExtractionResult, CacheSource)> {
        // Cheap read-locked probe; promotion to MRU needs the write lock.
        let present = self
            .l1
            .read()
            .map(|l1| l1.peek(&key).is_some())
            .unwrap_or(false);
        if present {
            if let Ok(mut l1) = self.l1.write() {
                if let Some(result) = l1.get(&key).cloned() {
                    self.l1_hits.fetch_add(1, Ordering::Relaxed);
                    return Some((result, CacheSource::L1));
                }
            }
        }
        self.l1_misses.fetch_add(1, Ordering::Relaxed);

        match self.read_l2(key).await {
            Some(result) => {
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut l1) = self.l1.write() {
                    l1.push(key, result.clone());
                }
                Some((result, CacheSource::L2))
            }
            None => {
                self.l2_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores a result in both tiers. Idempotent: writing the same
    /// `(key, result)` again only refreshes recency.
    pub async fn put(&self, key: Fingerprint, result: &ExtractionResult) {
        if let Ok(mut l1) = self.l1.write() {
            l1.push(key, result.clone());
        }
        self.write_l2(key, result).await;
        self.enforce_quota().await;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_size: self.l1.read().map(|l1| l1.len()).unwrap_or(0),
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l1_misses: self.l1_misses.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
        }
    }

    fn entry_path(&self, key: Fingerprint) -> PathBuf {
        self.l2_dir.join(format!("{key}.json"))
    }

    async fn read_l2(&self, key: Fingerprint) -> Option<ExtractionResult> {
        let path = self.entry_path(key);
        let bytes = match timeout(DISK_TIMEOUT, tokio::fs::read(&path)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Ok(Err(e)) => {
                warn!("L2 read failed for {key}: {e}; treating as miss");
                return None;
            }
            Err(_) => {
                warn!("L2 read timed out for {key}; treating as miss");
                return None;
            }
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => {
                // Refresh recency so quota eviction sees this entry as hot.
                self.write_l2(key, &entry.result).await;
                Some(entry.result)
            }
            Err(e) => {
                warn!("Corrupt L2 entry for {key}: {e}; evicting");
                let _ = tokio::fs::remove_file(&path).await;
                None
            }
        }
    }

    async fn write_l2(&self, key: Fingerprint, result: &ExtractionResult) {
        let entry = CacheEntry {
            result: result.clone(),
            stored_at: Utc::now(),
        };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialise cache entry for {key}: {e}");
                return;
            }
        };
        match timeout(DISK_TIMEOUT, tokio::fs::write(self.entry_path(key), bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("L2 write failed for {key}: {e}; continuing with L1 only"),
            Err(_) => warn!("L2 write timed out for {key}; continuing with L1 only"),
        }
    }

    /// Deletes least-recently-written entries until the directory fits
    /// the quota again.
    async fn enforce_quota(&self) {
        let result = timeout(DISK_TIMEOUT, self.collect_entries()).await;
        let mut entries = match result {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                warn!("L2 quota scan failed: {e}");
                return;
            }
            Err(_) => {
                warn!("L2 quota scan timed out");
                return;
            }
        };

        let mut total: u64 = entries.iter().map(|(_, len, _)| len).sum();
        if total <= self.l2_max_bytes {
            return;
        }
        entries.sort_by_key(|(_, _, modified)| *modified);
        for (path, len, _) in entries {
            if total <= self.l2_max_bytes {
                break;
            }
            debug!("Evicting L2 entry {path:?} ({len} bytes) to satisfy quota");
            if tokio::fs::remove_file(&path).await.is_ok() {
                total = total.saturating_sub(len);
            }
        }
    }

    async fn collect_entries(
        &self,
    ) -> Result<Vec<(PathBuf, u64, std::time::SystemTime)>, std::io::Error> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.l2_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                entries.push((entry.path(), meta.len(), modified));
            }
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("l2_dir", &self.l2_dir)
            .field("l2_max_bytes", &self.l2_max_bytes)
            .finish_non_exhaustive()
    }
}
