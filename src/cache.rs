//! Response Cache - memoizes schema analysis and language-model results
//!
//! Architecture: DashMap of per-key `OnceCell`s
//! - Key: SHA-256 of (operation kind, normalized input, schema version)
//! - At most one computation per key is in flight; concurrent callers await it
//! - A computation that is cancelled or fails leaves the cell empty, so
//!   nothing partial is ever committed
//! - Expired entries are dropped when read; past `max_entries` the oldest
//!   completed entries go first
//! - Optional JSON snapshot on disk seeds the cache at startup

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{QueryBridgeError, Result};

const SNAPSHOT_FORMAT: u32 = 1;

/// Default lifetime of schema analysis entries.
pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKind {
    SchemaAnalysis,
    IntentExtraction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub input: String,
    pub schema_version: String,
}

impl CacheKey {
    /// Input is normalized (trimmed, lowercased, whitespace collapsed) so
    /// trivially different phrasings of the same text share an entry.
    pub fn new(kind: CacheKind, input: &str, schema_version: &str) -> Self {
        Self {
            kind,
            input: normalize_input(input),
            schema_version: schema_version.to_string(),
        }
    }

    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", self.kind).as_bytes());
        hasher.update([0u8]);
        hasher.update(self.input.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.schema_version.as_bytes());
        hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

pub fn normalize_input(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    kind: CacheKind,
    schema_version: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    value: serde_json::Value,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<(String, CacheEntry)>,
}

type Slot = Arc<OnceCell<CacheEntry>>;

pub struct ResponseCache {
    entries: DashMap<String, Slot>,
    schema_ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEMA_TTL)
    }
}

impl ResponseCache {
    pub fn new(schema_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            schema_ttl,
            max_entries: DEFAULT_MAX_ENTRIES,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Schema analysis expires on the TTL; completions live until the
    /// schema version changes (their key carries the version).
    pub fn ttl_for(&self, kind: CacheKind) -> Option<Duration> {
        match kind {
            CacheKind::SchemaAnalysis => Some(self.schema_ttl),
            CacheKind::IntentExtraction => None,
        }
    }

    /// Return the cached value for `key`, or run `compute` exactly once
    /// across all concurrent callers and cache its result.
    pub async fn get_or_try_insert_with<T, F, Fut>(&self, key: &CacheKey, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let digest = key.digest();
        let cell = self.slot(&digest);

        let ttl = self.ttl_for(key.kind);
        let kind = key.kind;
        let version = key.schema_version.clone();
        let mut computed = false;
        let entry = cell
            .get_or_try_init(|| {
                computed = true;
                async move {
                    let value = compute().await?;
                    let created_at = Utc::now();
                    let expires_at = match ttl {
                        Some(ttl) => Some(created_at + to_chrono(ttl)?),
                        None => None,
                    };
                    Ok::<_, QueryBridgeError>(CacheEntry {
                        kind,
                        schema_version: version,
                        created_at,
                        expires_at,
                        value: serde_json::to_value(&value)?,
                    })
                }
            })
            .await?;

        let value = serde_json::from_value(entry.value.clone())?;
        if computed {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache miss for {:?} ({})", key.kind, &digest[..12]);
            self.evict();
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for {:?} ({})", key.kind, &digest[..12]);
        }
        Ok(value)
    }

    /// Non-computing lookup; an expired entry is removed and reads as absent.
    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let digest = key.digest();
        let slot = Arc::clone(self.entries.get(&digest)?.value());
        let entry = slot.get()?;
        if entry.is_expired(Utc::now()) {
            let removed = self
                .entries
                .remove_if(&digest, |_, current| Arc::ptr_eq(current, &slot))
                .is_some();
            if removed {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }
        serde_json::from_value(entry.value.clone()).ok()
    }

    /// Drop expired entries, then the oldest completed ones beyond `max_entries`.
    pub fn evict(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| slot.get().map_or(true, |entry| !entry.is_expired(now)));
        let mut evicted = before.saturating_sub(self.entries.len());

        let mut completed: Vec<(DateTime<Utc>, String)> = self
            .entries
            .iter()
            .filter_map(|slot| {
                let entry = slot.value().get()?;
                Some((entry.created_at, slot.key().clone()))
            })
            .collect();
        if completed.len() > self.max_entries {
            completed.sort();
            let excess = completed.len() - self.max_entries;
            for (_, digest) in completed.into_iter().take(excess) {
                if self.entries.remove(&digest).is_some() {
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            self.invalidations.fetch_add(evicted as u64, Ordering::Relaxed);
            debug!("Evicted {} cache entries", evicted);
        }
        evicted
    }

    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let removed = self.entries.remove(&key.digest()).is_some();
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every `kind` entry computed against a schema version other than `version`.
    pub fn purge_other_versions(&self, kind: CacheKind, version: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, slot| match slot.get() {
            Some(entry) => entry.kind != kind || entry.schema_version == version,
            None => true,
        });
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            self.invalidations.fetch_add(purged as u64, Ordering::Relaxed);
            info!("Purged {} cached {:?} entries from older schema versions", purged, kind);
        }
        purged
    }

    pub fn clear(&self) {
        let n = self.entries.len();
        self.entries.clear();
        self.invalidations.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.value().get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Write all completed, unexpired entries to `path` (temp file + rename).
    pub fn save_snapshot(&self, path: &Path) -> Result<usize> {
        let now = Utc::now();
        let entries: Vec<(String, CacheEntry)> = self
            .entries
            .iter()
            .filter_map(|slot| {
                let entry = slot.value().get()?;
                (!entry.is_expired(now)).then(|| (slot.key().clone(), entry.clone()))
            })
            .collect();
        let count = entries.len();
        let snapshot = Snapshot {
            format: SNAPSHOT_FORMAT,
            saved_at: now,
            entries,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, path)?;
        info!("Saved {} cache entries to {}", count, path.display());
        Ok(count)
    }

    /// Seed from a snapshot. Missing or unreadable snapshots are not errors:
    /// durability is best effort.
    pub fn seed_from_snapshot(&self, path: &Path) -> usize {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(_) => return 0,
        };
        let snapshot: Snapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                warn!("Ignoring unreadable cache snapshot {}: {}", path.display(), e);
                return 0;
            }
        };
        if snapshot.format != SNAPSHOT_FORMAT {
            warn!(
                "Ignoring cache snapshot with format {} (expected {})",
                snapshot.format, SNAPSHOT_FORMAT
            );
            return 0;
        }
        let now = Utc::now();
        let mut loaded = 0;
        for (digest, entry) in snapshot.entries {
            if entry.is_expired(now) {
                continue;
            }
            self.entries
                .insert(digest, Arc::new(OnceCell::new_with(Some(entry))));
            loaded += 1;
        }
        let evicted = self.evict();
        info!("Seeded {} cache entries from {}", loaded - evicted.min(loaded), path.display());
        loaded - evicted.min(loaded)
    }

    fn slot(&self, digest: &str) -> Slot {
        let mut slot = self
            .entries
            .entry(digest.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()));
        let expired = slot
            .value()
            .get()
            .map_or(false, |entry| entry.is_expired(Utc::now()));
        if expired {
            *slot.value_mut() = Arc::new(OnceCell::new());
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        Arc::clone(slot.value())
    }
}

fn to_chrono(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| QueryBridgeError::Cache(format!("invalid ttl: {}", e)))
}
