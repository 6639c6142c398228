use crate::cache::StatusCache;
use crate::check::{Checker, RecordOutcome};
use crate::error::TrackerError;
use crate::model::is_valid_record_id;
use crate::store::TrackingStore;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Aggregated result of one "check all" request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub batch_key: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: BTreeMap<String, RecordOutcome>,
    /// True when served from a recent identical batch.
    #[serde(default)]
    pub from_cache: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

/// Cache key for a set of ids: order and duplicates do not matter.
pub fn batch_key(ids: &BTreeSet<String>) -> String {
    ids.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    checker: Checker,
    store: Arc<dyn TrackingStore>,
    cache: StatusCache,
    batch_ttl: Duration,
}

impl BatchOrchestrator {
    pub fn new(
        checker: Checker,
        store: Arc<dyn TrackingStore>,
        cache: StatusCache,
        batch_ttl: Duration,
    ) -> Self {
        Self {
            checker,
            store,
            cache,
            batch_ttl,
        }
    }

    /// Check every id with at most `concurrency_limit` checks in progress.
    ///
    /// The limit applies to this call only: two batches running side by
    /// side may each have `concurrency_limit` checks open. The process-wide
    /// bound on upstream calls is `upstream.max_concurrency`, enforced by
    /// the fetcher's semaphore across batches, scheduled checks and
    /// `check_now`.
    ///
    /// Fails only for structurally invalid input; per-record failures are in
    /// the report.
    #[instrument(skip_all, fields(count = ids.len(), concurrency_limit = concurrency_limit))]
    pub async fn check_all(
        &self,
        ids: &[String],
        concurrency_limit: usize,
    ) -> Result<BatchReport, TrackerError> {
        if ids.is_empty() {
            return Err(TrackerError::EmptyBatch);
        }
        if concurrency_limit == 0 {
            return Err(TrackerError::InvalidConcurrency);
        }
        let mut unique = BTreeSet::new();
        for id in ids {
            if !is_valid_record_id(id) {
                return Err(TrackerError::InvalidRecordId(id.clone()));
            }
            unique.insert(id.clone());
        }
        for id in &unique {
            if self.store.get_record(id).await?.is_none() {
                return Err(TrackerError::UnknownRecord(id.clone()));
            }
        }

        let key = batch_key(&unique);
        if let Some(mut cached) = self.cache.get_batch_result(&key).await {
            info!(batch_id = %cached.batch_id, "serving recent batch report");
            cached.from_cache = true;
            return Ok(cached);
        }

        let started_at = Utc::now();
        let outcomes: BTreeMap<String, RecordOutcome> = stream::iter(unique)
            .map(|id| async move {
                let outcome = RecordOutcome::from(self.checker.check(&id).await);
                (id, outcome)
            })
            .buffer_unordered(concurrency_limit)
            .collect()
            .await;

        let report = BatchReport {
            batch_id: Uuid::new_v4(),
            batch_key: key,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            from_cache: false,
        };
        info!(
            batch_id = %report.batch_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "batch check finished"
        );
        self.cache
            .put_batch_result(&report.batch_key, &report, self.batch_ttl)
            .await;
        Ok(report)
    }
}
