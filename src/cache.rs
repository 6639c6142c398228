//! Short-lived cache of last-known statuses and batch reports.
//!
//! [`CacheBackend`] is a plain byte key/value store with TTLs so it can be
//! backed by a shared remote cache; [`LocalBackend`] keeps entries in a
//! sharded in-process map. [`StatusCache`] layers typed access on top and
//! degrades backend failures to misses.

use crate::batch::BatchReport;
use crate::error::CacheError;
use crate::events::Stats;
use crate::model::StatusSnapshot;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Longest TTL an entry may be stored with.
pub const MAX_TTL: Duration = Duration::from_secs(7 * 86_400);

#[async_trait::async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;
    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Reclaim expired entries, returning how many were dropped. Backends
    /// that expire keys on their own keep the default.
    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }
}

#[derive(Default)]
pub struct LocalBackend {
    store: DashMap<String, (Vec<u8>, Instant)>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[async_trait::async_trait]
impl CacheBackend for LocalBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        if let Some(entry) = self.store.get(key) {
            let (val, expires_at) = entry.value();
            if Instant::now() >= *expires_at {
                drop(entry);
                self.store
                    .remove_if(key, |_, (_, exp)| Instant::now() >= *exp);
                return Ok(None);
            }
            return Ok(Some(val.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now);
        self.store
            .insert(key.to_string(), (value.to_vec(), expires_at));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.store.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let before = self.store.len();
        self.store.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before.saturating_sub(self.store.len()))
    }
}

fn status_key(record_id: &str) -> String {
    format!("status:{record_id}")
}

fn batch_key(key: &str) -> String {
    format!("batch:{key}")
}

/// Typed cache facade. Never fails: backend errors are logged and reported
/// as a miss so status checks fall through to the upstream.
#[derive(Clone)]
pub struct StatusCache {
    backend: Arc<dyn CacheBackend>,
    stats: Arc<Stats>,
}

impl StatusCache {
    pub fn new(backend: Arc<dyn CacheBackend>, stats: Arc<Stats>) -> Self {
        Self { backend, stats }
    }

    pub async fn get(&self, record_id: &str) -> Option<StatusSnapshot> {
        self.read(&status_key(record_id)).await
    }

    pub async fn put(&self, snapshot: &StatusSnapshot, ttl: Duration) {
        self.write(&status_key(&snapshot.record_id), snapshot, ttl)
            .await;
    }

    pub async fn invalidate(&self, record_id: &str) {
        let key = status_key(record_id);
        if let Err(err) = self.backend.del(&key).await {
            self.stats.cache_unavailable(&key, &err);
        }
    }

    pub async fn get_batch_result(&self, key: &str) -> Option<BatchReport> {
        self.read(&batch_key(key)).await
    }

    pub async fn put_batch_result(&self, key: &str, report: &BatchReport, ttl: Duration) {
        self.write(&batch_key(key), report, ttl).await;
    }

    /// Drop expired entries nobody will read again (batch reports of one-off
    /// id sets, statuses of records no longer tracked).
    pub async fn purge_expired(&self) -> usize {
        match self.backend.purge_expired().await {
            Ok(purged) => purged,
            Err(err) => {
                self.stats.cache_unavailable("*", &err);
                0
            }
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.backend.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.stats.cache_miss(key);
                return None;
            }
            Err(err) => {
                self.stats.cache_unavailable(key, &err);
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                self.stats.cache_hit(key);
                Some(value)
            }
            Err(err) => {
                self.stats.cache_unavailable(key, &CacheError::Codec(err));
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let result = match serde_json::to_vec(value) {
            Ok(bytes) => self.backend.set(key, &bytes, ttl).await,
            Err(err) => Err(CacheError::Codec(err)),
        };
        if let Err(err) = result {
            self.stats.cache_unavailable(key, &err);
        }
    }
}
