use crate::cache::StatusCache;
use crate::error::UpstreamError;
use crate::events::Stats;
use crate::model::StatusSnapshot;
use crate::singleflight::SingleFlight;
use crate::upstream::StatusSource;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

/// Retry curve for transient upstream failures inside one in-flight call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: base * 2^(attempt-1), capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.base_delay_ms.saturating_mul(1_u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetcherSettings {
    pub status_ttl: Duration,
    /// Upstream calls allowed at once across every caller.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

/// Cache-first, single-flight access to the status source.
#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<FetcherInner>,
}

struct FetcherInner {
    source: Arc<dyn StatusSource>,
    cache: StatusCache,
    flights: SingleFlight<StatusSnapshot, UpstreamError>,
    permits: Arc<Semaphore>,
    settings: FetcherSettings,
    stats: Arc<Stats>,
}

impl Fetcher {
    pub fn new(
        source: Arc<dyn StatusSource>,
        cache: StatusCache,
        settings: FetcherSettings,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                source,
                cache,
                flights: SingleFlight::new(),
                permits: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
                settings,
                stats,
            }),
        }
    }

    pub fn cache(&self) -> &StatusCache {
        &self.inner.cache
    }

    /// Number of records with an upstream call outstanding.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.in_flight()
    }

    #[instrument(skip(self))]
    pub async fn fetch(&self, record_id: &str) -> Result<StatusSnapshot, UpstreamError> {
        if let Some(hit) = self.inner.cache.get(record_id).await {
            return Ok(hit);
        }

        let inner = Arc::clone(&self.inner);
        let id = record_id.to_string();
        let joined = self
            .inner
            .flights
            .run(record_id, move || async move { inner.fetch_through(&id).await })
            .await;
        if joined.coalesced {
            self.inner.stats.fetch_coalesced(record_id, joined.waiters);
        }
        joined.result
    }
}

impl FetcherInner {
    async fn fetch_through(&self, record_id: &str) -> Result<StatusSnapshot, UpstreamError> {
        let result = self.fetch_with_retry(record_id).await;
        match &result {
            Ok(snapshot) => {
                self.cache.put(snapshot, self.settings.status_ttl).await;
            }
            Err(UpstreamError::Permanent(_)) => {
                self.cache.invalidate(record_id).await;
            }
            Err(_) => {}
        }
        result
    }

    async fn fetch_with_retry(&self, record_id: &str) -> Result<StatusSnapshot, UpstreamError> {
        let retry = self.settings.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let _permit = self
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| UpstreamError::Transient("upstream limiter closed".into()))?;
                self.stats.upstream_call(record_id, attempt);
                self.source.fetch_status(record_id).await
            };
            match result {
                Ok(mut snapshot) => {
                    snapshot.attempts = attempt;
                    return Ok(snapshot);
                }
                Err(UpstreamError::Transient(reason)) if attempt < max_attempts => {
                    let delay = retry.delay_after(attempt);
                    warn!(record_id, attempt, ?delay, %reason, "transient upstream failure; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(UpstreamError::Transient(reason)) => {
                    return Err(UpstreamError::Exhausted {
                        attempts: attempt,
                        last: reason,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }
}
