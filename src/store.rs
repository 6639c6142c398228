use crate::db::{self, Pool};
use crate::error::StoreError;
use crate::model::{
    HistoryEntry, NewTrackedRecord, NotificationAttempt, ScheduledJob, StatusChange,
    TrackedRecord,
};
use chrono::{DateTime, Utc};

/// Durable storage for tracked records, their history and job definitions.
/// Writes for one record are expected to be serialized by the backend.
#[async_trait::async_trait]
pub trait TrackingStore: Send + Sync {
    async fn upsert_record(&self, record: &NewTrackedRecord) -> Result<TrackedRecord, StoreError>;
    async fn get_record(&self, record_id: &str) -> Result<Option<TrackedRecord>, StoreError>;
    async fn delete_record(&self, record_id: &str) -> Result<bool, StoreError>;
    async fn touch_checked(&self, record_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    /// History append plus conditional status update, atomically. `None`
    /// when the record no longer holds the change's previous status.
    async fn apply_status_change(
        &self,
        change: &StatusChange,
    ) -> Result<Option<HistoryEntry>, StoreError>;
    async fn history(&self, record_id: &str) -> Result<Vec<HistoryEntry>, StoreError>;
    async fn record_attempts(&self, attempts: &[NotificationAttempt]) -> Result<(), StoreError>;
    async fn upsert_job(&self, job: &ScheduledJob) -> Result<(), StoreError>;
    /// Update only; `false` when the job no longer exists.
    async fn update_job(&self, job: &ScheduledJob) -> Result<bool, StoreError>;
    async fn delete_job(&self, record_id: &str) -> Result<bool, StoreError>;
    async fn active_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError>;
    async fn prune_history(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TrackingStore for SqliteStore {
    async fn upsert_record(&self, record: &NewTrackedRecord) -> Result<TrackedRecord, StoreError> {
        Ok(db::upsert_record(&self.pool, record).await?)
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<TrackedRecord>, StoreError> {
        Ok(db::get_record(&self.pool, record_id).await?)
    }

    async fn delete_record(&self, record_id: &str) -> Result<bool, StoreError> {
        Ok(db::delete_record(&self.pool, record_id).await?)
    }

    async fn touch_checked(&self, record_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(db::touch_checked(&self.pool, record_id, at).await?)
    }

    async fn apply_status_change(
        &self,
        change: &StatusChange,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        Ok(db::apply_status_change(&self.pool, change).await?)
    }

    async fn history(&self, record_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(db::history_for(&self.pool, record_id).await?)
    }

    async fn record_attempts(&self, attempts: &[NotificationAttempt]) -> Result<(), StoreError> {
        Ok(db::insert_notification_attempts(&self.pool, attempts).await?)
    }

    async fn upsert_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        Ok(db::upsert_job(&self.pool, job).await?)
    }

    async fn update_job(&self, job: &ScheduledJob) -> Result<bool, StoreError> {
        Ok(db::update_job(&self.pool, job).await?)
    }

    async fn delete_job(&self, record_id: &str) -> Result<bool, StoreError> {
        Ok(db::delete_job(&self.pool, record_id).await?)
    }

    async fn active_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        Ok(db::active_jobs(&self.pool).await?)
    }

    async fn prune_history(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(db::prune_history(&self.pool, before).await?)
    }
}
