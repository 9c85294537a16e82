//! TTL-keyed cache of validated product records with file persistence
//!
//! Keys combine the normalized product id with an hour-aligned time bucket,
//! bounding the number of distinct keys per product while letting entries
//! expire naturally. Expired entries are treated as absent and never served.
//! The backing file is loaded on startup (pruning expired entries) and
//! rewritten periodically; a corrupt or missing file is an empty cache, not
//! a fatal error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::product::ProductRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub default_ttl_secs: u64,
    /// Where the cache is persisted; `None` disables persistence entirely.
    pub file_path: Option<PathBuf>,
    pub flush_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            file_path: None,
            flush_interval_secs: 300,
        }
    }
}

/// One cached record. Valid only while `now - inserted_at < ttl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub record: ProductRecord,
    pub inserted_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.inserted_at);
        age >= chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

/// Hour-aligned cache key for a product id at a given instant.
fn derive_key(id: &str, at: DateTime<Utc>) -> String {
    let bucket = at.timestamp().div_euclid(3600);
    format!("{}:{}", id.trim(), bucket)
}

/// Time-bounded record cache shared across in-flight acquisitions.
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    /// Largest TTL any live entry was inserted with; bounds the lookup scan.
    max_ttl_secs: AtomicU64,
    config: CacheConfig,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_ttl_secs: AtomicU64::new(config.default_ttl_secs),
            config,
        }
    }

    /// Look up a fresh record. Keys carry the insertion-hour bucket, so the
    /// scan walks back enough buckets to cover the largest TTL in use; an
    /// entry stays reachable for its whole TTL regardless of where in a
    /// bucket it was inserted.
    pub async fn get(&self, id: &str) -> Option<ProductRecord> {
        self.get_at(id, Utc::now()).await
    }

    async fn get_at(&self, id: &str, now: DateTime<Utc>) -> Option<ProductRecord> {
        let scan_back = self.max_ttl_secs.load(Ordering::Relaxed).div_ceil(3600) as i64;
        let entries = self.entries.read().await;
        for hours_back in 0..=scan_back {
            let key = derive_key(id, now - chrono::Duration::hours(hours_back));
            if let Some(entry) = entries.get(&key) {
                if !entry.is_expired(now) {
                    debug!(id, key, "🎯 cache hit");
                    return Some(entry.record.clone());
                }
            }
        }
        None
    }

    /// Insert a validated record; `ttl` overrides the configured default
    /// (per-tier overrides let cheap-to-refresh sources cache longer).
    /// Expired entries are lazily evicted on the way in.
    pub async fn set(&self, id: &str, record: ProductRecord, ttl: Option<Duration>) {
        let now = Utc::now();
        let ttl_secs = ttl.map_or(self.config.default_ttl_secs, |d| d.as_secs());
        self.max_ttl_secs.fetch_max(ttl_secs, Ordering::Relaxed);
        let key = derive_key(id, now);

        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| !entry.is_expired(now));
        entries.insert(
            key.clone(),
            CacheEntry {
                key,
                record,
                inserted_at: now,
                ttl_secs,
            },
        );
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Load the persisted cache, pruning expired entries. Missing or corrupt
    /// files start an empty cache.
    pub async fn load(&self) -> usize {
        let Some(path) = self.config.file_path.as_ref() else {
            return 0;
        };
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) => {
                info!(path = %path.display(), "no cache file to load: {e}");
                return 0;
            }
        };
        let persisted: HashMap<String, CacheEntry> = match serde_json::from_str(&raw) {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(path = %path.display(), "cache file corrupt, starting empty: {e}");
                return 0;
            }
        };

        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let mut loaded = 0usize;
        for (key, entry) in persisted {
            if entry.is_expired(now) {
                continue;
            }
            self.max_ttl_secs.fetch_max(entry.ttl_secs, Ordering::Relaxed);
            entries.insert(key, entry);
            loaded += 1;
        }
        info!(count = loaded, "loaded cache entries from disk");
        loaded
    }

    /// Rewrite the cache file with the current non-expired entries.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = self.config.file_path.as_ref() else {
            return Ok(());
        };
        let snapshot: HashMap<String, CacheEntry> = {
            let now = Utc::now();
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create cache directory {}", parent.display()))?;
        }
        let serialized =
            serde_json::to_string_pretty(&snapshot).context("failed to serialize cache")?;
        tokio::fs::write(path, serialized)
            .await
            .with_context(|| format!("failed to write cache file {}", path.display()))?;
        debug!(count = snapshot.len(), path = %path.display(), "flushed cache to disk");
        Ok(())
    }

    /// Spawn the periodic flush loop; stops (with a final flush) on
    /// cancellation.
    pub fn spawn_flush_task(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = Duration::from_secs(store.config.flush_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = store.flush().await {
                            warn!("periodic cache flush failed: {e:#}");
                        }
                    }
                    _ = token.cancelled() => {
                        if let Err(e) = store.flush().await {
                            warn!("final cache flush failed: {e:#}");
                        }
                        break;
                    }
                }
            }
        })
    }
}
