//! Entry point for the API layer: wires cache, fetcher, dispatcher, checker,
//! batch orchestrator and scheduler around one store.

use crate::batch::{BatchOrchestrator, BatchReport};
use crate::cache::{CacheBackend, StatusCache};
use crate::check::{Checker, RecordOutcome};
use crate::error::TrackerError;
use crate::events::{Stats, StatsSnapshot};
use crate::fetcher::{Fetcher, FetcherSettings};
use crate::model::{
    is_valid_record_id, ChannelKind, HistoryEntry, NewTrackedRecord, StatusSnapshot,
    TrackedRecord,
};
use crate::notify::{Dispatcher, NotificationChannel};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::store::TrackingStore;
use crate::upstream::StatusSource;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub fetcher: FetcherSettings,
    pub scheduler: SchedulerSettings,
    /// Used when a registration does not name its own interval.
    pub default_interval: Duration,
    pub batch_ttl: Duration,
}

#[derive(Clone)]
pub struct Tracker {
    store: Arc<dyn TrackingStore>,
    cache: StatusCache,
    checker: Checker,
    batch: BatchOrchestrator,
    scheduler: Scheduler,
    stats: Arc<Stats>,
    default_interval: Duration,
}

impl Tracker {
    pub fn new(
        settings: TrackerSettings,
        store: Arc<dyn TrackingStore>,
        source: Arc<dyn StatusSource>,
        cache_backend: Arc<dyn CacheBackend>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        disabled: Vec<ChannelKind>,
    ) -> Self {
        let stats = Arc::new(Stats::default());
        let cache = StatusCache::new(cache_backend, Arc::clone(&stats));
        let fetcher = Fetcher::new(source, cache.clone(), settings.fetcher, Arc::clone(&stats));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            channels,
            disabled,
            Arc::clone(&stats),
        );
        let checker = Checker::new(Arc::clone(&store), fetcher, dispatcher, Arc::clone(&stats));
        let batch = BatchOrchestrator::new(
            checker.clone(),
            Arc::clone(&store),
            cache.clone(),
            settings.batch_ttl,
        );
        let scheduler = Scheduler::new(
            checker.clone(),
            Arc::clone(&store),
            cache.clone(),
            settings.scheduler,
        );
        Self {
            store,
            cache,
            checker,
            batch,
            scheduler,
            stats,
            default_interval: settings.default_interval,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn start(&self) -> Result<(), TrackerError> {
        self.scheduler.start().await
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await
    }

    /// Create (or re-arm) a tracked record and schedule its recurring check.
    /// Re-registering a finalized record clears the finalized flag.
    pub async fn register_tracking(
        &self,
        record: NewTrackedRecord,
        interval: Option<Duration>,
    ) -> Result<TrackedRecord, TrackerError> {
        ensure_valid_id(&record.record_id)?;
        let interval = interval.unwrap_or(self.default_interval);
        self.scheduler.validate_interval(interval)?;

        let tracked = self.store.upsert_record(&record).await?;
        self.cache.invalidate(&tracked.record_id).await;
        self.scheduler
            .schedule_status_check(&tracked.record_id, interval)
            .await?;
        info!(record_id = %tracked.record_id, interval_secs = interval.as_secs(), "tracking registered");
        Ok(tracked)
    }

    /// Stop tracking and delete the record. History is kept until the
    /// retention sweep removes it. Returns false if nothing was tracked.
    pub async fn cancel_tracking(&self, record_id: &str) -> Result<bool, TrackerError> {
        ensure_valid_id(record_id)?;
        self.scheduler.cancel_status_check(record_id).await?;
        let deleted = self.store.delete_record(record_id).await?;
        self.cache.invalidate(record_id).await;
        if deleted {
            info!(record_id, "tracking cancelled");
        }
        Ok(deleted)
    }

    /// Run one check now. Check failures are part of the outcome; only an
    /// invalid or unknown id is an error.
    pub async fn check_now(&self, record_id: &str) -> Result<RecordOutcome, TrackerError> {
        ensure_valid_id(record_id)?;
        if self.store.get_record(record_id).await?.is_none() {
            return Err(TrackerError::UnknownRecord(record_id.to_string()));
        }
        let outcome = RecordOutcome::from(self.checker.check(record_id).await);
        self.retire_if_finalized(record_id, &outcome).await;
        Ok(outcome)
    }

    pub async fn check_all(
        &self,
        ids: &[String],
        concurrency_limit: usize,
    ) -> Result<BatchReport, TrackerError> {
        let report = self.batch.check_all(ids, concurrency_limit).await?;
        if !report.from_cache {
            for (record_id, outcome) in &report.outcomes {
                self.retire_if_finalized(record_id, outcome).await;
            }
        }
        Ok(report)
    }

    /// Newest first. Records that were never tracked yield an empty list.
    pub async fn get_history(&self, record_id: &str) -> Result<Vec<HistoryEntry>, TrackerError> {
        ensure_valid_id(record_id)?;
        Ok(self.store.history(record_id).await?)
    }

    pub async fn get_cached_status(&self, record_id: &str) -> Option<StatusSnapshot> {
        self.cache.get(record_id).await
    }

    pub async fn get_record(&self, record_id: &str) -> Result<Option<TrackedRecord>, TrackerError> {
        ensure_valid_id(record_id)?;
        Ok(self.store.get_record(record_id).await?)
    }

    async fn retire_if_finalized(&self, record_id: &str, outcome: &RecordOutcome) {
        if outcome.transition().is_some_and(|t| t.is_finalized()) {
            self.scheduler.forget_finalized(record_id).await;
        }
    }
}

fn ensure_valid_id(record_id: &str) -> Result<(), TrackerError> {
    if is_valid_record_id(record_id) {
        Ok(())
    } else {
        Err(TrackerError::InvalidRecordId(record_id.to_string()))
    }
}
