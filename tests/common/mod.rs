#![allow(dead_code)]

use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, Utc};
use pnr_tracker::cache::{CacheBackend, LocalBackend};
use pnr_tracker::error::{CacheError, StoreError};
use pnr_tracker::fetcher::{FetcherSettings, RetryPolicy};
use pnr_tracker::model::{
    ChannelKind, HistoryEntry, NewTrackedRecord, NotificationAttempt, ScheduledJob,
    StatusChange, StatusSnapshot, TrackedRecord,
};
use pnr_tracker::notify::{Delivery, Notice, NotificationChannel};
use pnr_tracker::scheduler::SchedulerSettings;
use pnr_tracker::store::{SqliteStore, TrackingStore};
use pnr_tracker::upstream::StatusSource;
use pnr_tracker::{Tracker, TrackerSettings, UpstreamError};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore};

pub const PNR_A: &str = "4512345678";
pub const PNR_B: &str = "4512345679";
pub const PNR_C: &str = "4512345680";

pub async fn setup_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn settings() -> TrackerSettings {
    TrackerSettings {
        fetcher: FetcherSettings {
            status_ttl: Duration::from_secs(60),
            max_concurrency: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 40,
            },
        },
        scheduler: SchedulerSettings {
            min_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            workers: 2,
            sweep_interval: Duration::from_secs(3600),
            history_retention: None,
        },
        default_interval: Duration::from_secs(3600),
        batch_ttl: Duration::from_secs(30),
    }
}

pub fn record(id: &str) -> NewTrackedRecord {
    NewTrackedRecord {
        record_id: id.into(),
        origin: "NDLS".into(),
        destination: "BCT".into(),
        travel_date: NaiveDate::from_ymd_opt(2026, 12, 24).unwrap(),
        owner_ref: "1001".into(),
    }
}

type Reply = Result<(String, bool), UpstreamError>;

pub fn status(s: &str) -> Reply {
    Ok((s.to_string(), false))
}

pub fn complete(s: &str) -> Reply {
    Ok((s.to_string(), true))
}

pub fn transient() -> Reply {
    Err(UpstreamError::Transient("gateway timeout".into()))
}

/// Status source replaying a per-record script. The last reply repeats;
/// records without a script are unknown upstream.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Reply>>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedSource {
    /// Every call waits for a permit on the returned gate.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let source = Self {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        (source, gate)
    }

    pub async fn script(&self, record_id: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .await
            .insert(record_id.to_string(), VecDeque::from(replies));
    }

    pub async fn calls(&self, record_id: &str) -> usize {
        self.calls
            .lock()
            .await
            .get(record_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl StatusSource for ScriptedSource {
    async fn fetch_status(&self, record_id: &str) -> Result<StatusSnapshot, UpstreamError> {
        *self
            .calls
            .lock()
            .await
            .entry(record_id.to_string())
            .or_default() += 1;
        if let Some(gate) = &self.gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| UpstreamError::Transient("gate closed".into()))?;
        }
        let reply = {
            let mut scripts = self.scripts.lock().await;
            match scripts.get_mut(record_id) {
                Some(replies) if replies.len() > 1 => replies.pop_front(),
                Some(replies) => replies.front().cloned(),
                None => None,
            }
        };
        let (status, journey_complete) =
            reply.unwrap_or_else(|| Err(UpstreamError::Permanent("no such pnr".into())))?;
        Ok(StatusSnapshot {
            record_id: record_id.to_string(),
            status,
            journey_complete,
            fetched_at: Utc::now(),
            attempts: 1,
        })
    }
}

pub struct RecordingChannel {
    kind: ChannelKind,
    fail: bool,
    sent: Mutex<Vec<Notice>>,
}

impl RecordingChannel {
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail: false,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            fail: true,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub async fn sent(&self) -> Vec<Notice> {
        self.sent.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl NotificationChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, notice: &Notice) -> anyhow::Result<Delivery> {
        if self.fail {
            return Err(anyhow!("endpoint returned 502"));
        }
        self.sent.lock().await.push(notice.clone());
        Ok(Delivery::Delivered)
    }
}

/// Cache backend that is always down.
pub struct DownBackend;

#[async_trait::async_trait]
impl CacheBackend for DownBackend {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn del(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

/// SQLite store whose history writes always fail.
pub struct BrokenHistoryStore(pub SqliteStore);

#[async_trait::async_trait]
impl TrackingStore for BrokenHistoryStore {
    async fn upsert_record(&self, record: &NewTrackedRecord) -> Result<TrackedRecord, StoreError> {
        self.0.upsert_record(record).await
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<TrackedRecord>, StoreError> {
        self.0.get_record(record_id).await
    }

    async fn delete_record(&self, record_id: &str) -> Result<bool, StoreError> {
        self.0.delete_record(record_id).await
    }

    async fn touch_checked(&self, record_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.0.touch_checked(record_id, at).await
    }

    async fn apply_status_change(
        &self,
        _change: &StatusChange,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        Err(StoreError(anyhow!("disk I/O error")))
    }

    async fn history(&self, record_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        self.0.history(record_id).await
    }

    async fn record_attempts(&self, attempts: &[NotificationAttempt]) -> Result<(), StoreError> {
        self.0.record_attempts(attempts).await
    }

    async fn upsert_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        self.0.upsert_job(job).await
    }

    async fn update_job(&self, job: &ScheduledJob) -> Result<bool, StoreError> {
        self.0.update_job(job).await
    }

    async fn delete_job(&self, record_id: &str) -> Result<bool, StoreError> {
        self.0.delete_job(record_id).await
    }

    async fn active_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        self.0.active_jobs().await
    }

    async fn prune_history(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.0.prune_history(before).await
    }
}

/// SQLite store whose job listing parks after reading until `release` has
/// a permit, so tests can act between the read and its use.
pub struct ParkingJobsStore {
    inner: SqliteStore,
    pub listed: Arc<Notify>,
    pub release: Arc<Semaphore>,
}

impl ParkingJobsStore {
    pub fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            listed: Arc::new(Notify::new()),
            release: Arc::new(Semaphore::new(0)),
        }
    }
}

#[async_trait::async_trait]
impl TrackingStore for ParkingJobsStore {
    async fn upsert_record(&self, record: &NewTrackedRecord) -> Result<TrackedRecord, StoreError> {
        self.inner.upsert_record(record).await
    }

    async fn get_record(&self, record_id: &str) -> Result<Option<TrackedRecord>, StoreError> {
        self.inner.get_record(record_id).await
    }

    async fn delete_record(&self, record_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_record(record_id).await
    }

    async fn touch_checked(&self, record_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.touch_checked(record_id, at).await
    }

    async fn apply_status_change(
        &self,
        change: &StatusChange,
    ) -> Result<Option<HistoryEntry>, StoreError> {
        self.inner.apply_status_change(change).await
    }

    async fn history(&self, record_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        self.inner.history(record_id).await
    }

    async fn record_attempts(&self, attempts: &[NotificationAttempt]) -> Result<(), StoreError> {
        self.inner.record_attempts(attempts).await
    }

    async fn upsert_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        self.inner.upsert_job(job).await
    }

    async fn update_job(&self, job: &ScheduledJob) -> Result<bool, StoreError> {
        self.inner.update_job(job).await
    }

    async fn delete_job(&self, record_id: &str) -> Result<bool, StoreError> {
        self.inner.delete_job(record_id).await
    }

    async fn active_jobs(&self) -> Result<Vec<ScheduledJob>, StoreError> {
        let jobs = self.inner.active_jobs().await?;
        self.listed.notify_one();
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|_| StoreError(anyhow!("release gate closed")))?;
        permit.forget();
        Ok(jobs)
    }

    async fn prune_history(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.prune_history(before).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    pub broken_history: bool,
    pub cache_down: bool,
    pub failing_webhook: bool,
}

pub struct Harness {
    pub tracker: Tracker,
    pub pool: SqlitePool,
    pub source: ScriptedSource,
    pub telegram: Arc<RecordingChannel>,
    pub webhook: Arc<RecordingChannel>,
}

pub async fn harness(source: ScriptedSource) -> Harness {
    harness_with(settings(), source, Options::default()).await
}

/// Telegram and webhook are recorded; in-app is configured off.
pub async fn harness_with(
    settings: TrackerSettings,
    source: ScriptedSource,
    opts: Options,
) -> Harness {
    let pool = setup_pool().await;
    let sqlite = SqliteStore::new(pool.clone());
    let store: Arc<dyn TrackingStore> = if opts.broken_history {
        Arc::new(BrokenHistoryStore(sqlite))
    } else {
        Arc::new(sqlite)
    };
    harness_on(settings, source, opts, pool, store)
}

/// Like [`harness_with`] over a caller-built store sharing `pool`.
pub fn harness_on(
    settings: TrackerSettings,
    source: ScriptedSource,
    opts: Options,
    pool: SqlitePool,
    store: Arc<dyn TrackingStore>,
) -> Harness {
    let backend: Arc<dyn CacheBackend> = if opts.cache_down {
        Arc::new(DownBackend)
    } else {
        Arc::new(LocalBackend::new())
    };
    let telegram = RecordingChannel::new(ChannelKind::Telegram);
    let webhook = if opts.failing_webhook {
        RecordingChannel::failing(ChannelKind::Webhook)
    } else {
        RecordingChannel::new(ChannelKind::Webhook)
    };
    let channels = vec![
        telegram.clone() as Arc<dyn NotificationChannel>,
        webhook.clone() as Arc<dyn NotificationChannel>,
    ];
    let tracker = Tracker::new(
        settings,
        store,
        Arc::new(source.clone()),
        backend,
        channels,
        vec![ChannelKind::InApp],
    );
    Harness {
        tracker,
        pool,
        source,
        telegram,
        webhook,
    }
}

/// Poll `check` every 25ms until it holds or `limit` passes.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
