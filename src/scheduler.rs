//! Recurring per-record status checks.
//!
//! Jobs live in one priority queue keyed by next-fire instant. A single timer
//! task pops due jobs and hands them to a fixed pool of workers, so the
//! number of timers does not grow with the number of tracked records.
//! Queue entries carry the job generation they were armed with; cancelling
//! or replacing a job bumps the generation and leaves stale entries to be
//! skipped when they surface or discarded by the next sweep.

use crate::cache::StatusCache;
use crate::check::Checker;
use crate::error::{CheckFailure, TrackerError};
use crate::events;
use crate::model::ScheduledJob;
use crate::store::TrackingStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Longest accepted check interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 86_400);

/// Deadline used when `now + delay` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86_400);

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub min_interval: Duration,
    /// Upper bound for the backoff-extended interval.
    pub max_backoff: Duration,
    pub workers: usize,
    pub sweep_interval: Duration,
    pub history_retention: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Checking,
}

/// Read-only view of an armed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub record_id: String,
    pub interval: Duration,
    pub next_fire: Instant,
    pub consecutive_failures: u32,
    pub state: JobState,
}

/// What a sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub adopted: usize,
    pub dropped: usize,
    /// Queue entries of cancelled or replaced jobs.
    pub discarded: usize,
    pub purged_cache: usize,
    pub pruned_history: u64,
}

/// Delay until the next fire: the plain interval, doubled per consecutive
/// failure and capped at `max_backoff` (never below the interval itself).
pub fn next_delay(interval: Duration, failures: u32, max_backoff: Duration) -> Duration {
    if failures == 0 {
        return interval;
    }
    let factor = 1_u32 << failures.min(16);
    interval
        .saturating_mul(factor)
        .min(max_backoff.max(interval))
}

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650));
    let now = Utc::now();
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct JobSlot {
    generation: u64,
    interval: Duration,
    next_fire: Instant,
    failures: u32,
    state: JobState,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    at: Instant,
    generation: u64,
    record_id: String,
}

#[derive(Debug)]
struct Fire {
    record_id: String,
    generation: u64,
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Left behind by `cancel_status_check` so a sweep that listed the job
/// before the cancel does not re-arm it.
struct Tombstone {
    generation: u64,
    deleted: bool,
}

struct SchedulerInner {
    checker: Checker,
    store: Arc<dyn TrackingStore>,
    cache: StatusCache,
    settings: SchedulerSettings,
    jobs: DashMap<String, JobSlot>,
    cancelled: DashMap<String, Tombstone>,
    queue: Mutex<BinaryHeap<Reverse<Due>>>,
    wake: Notify,
    generation: AtomicU64,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(
        checker: Checker,
        store: Arc<dyn TrackingStore>,
        cache: StatusCache,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                checker,
                store,
                cache,
                settings,
                jobs: DashMap::new(),
                cancelled: DashMap::new(),
                queue: Mutex::new(BinaryHeap::new()),
                wake: Notify::new(),
                generation: AtomicU64::new(0),
                running: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Resume every persisted job of a non-finalized record and start the
    /// timer, workers and sweeper. Calling it while running does nothing.
    pub async fn start(&self) -> Result<(), TrackerError> {
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            debug!("scheduler already running");
            return Ok(());
        }

        let jobs = self.inner.store.active_jobs().await?;
        for job in &jobs {
            self.inner.resume(job);
        }

        let workers = self.inner.settings.workers.max(1);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut tasks = Vec::with_capacity(workers + 2);
        tasks.push(tokio::spawn(run_timer(
            Arc::clone(&self.inner),
            tx,
            shutdown_rx.clone(),
        )));
        for _ in 0..workers {
            tasks.push(tokio::spawn(run_worker(
                Arc::clone(&self.inner),
                Arc::clone(&rx),
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(run_sweeper(self.clone(), shutdown_rx)));

        *running = Some(Running { shutdown, tasks });
        info!(jobs = jobs.len(), workers, "scheduler started");
        Ok(())
    }

    /// Stop all timers. Checks already running finish first; persisted job
    /// definitions are left untouched for the next `start`.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(err) = task.await {
                warn!(?err, "scheduler task ended abnormally");
            }
        }
        self.inner.jobs.clear();
        self.inner.queue().clear();
        info!("scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.running.lock().await.is_some()
    }

    /// Create or replace the job for `record_id`; the first fire is one
    /// `interval` from now. Finalized records are left alone and `false` is
    /// returned.
    pub async fn schedule_status_check(
        &self,
        record_id: &str,
        interval: Duration,
    ) -> Result<bool, TrackerError> {
        self.validate_interval(interval)?;
        let record = self
            .inner
            .store
            .get_record(record_id)
            .await?
            .ok_or_else(|| TrackerError::UnknownRecord(record_id.to_string()))?;
        if record.is_finalized {
            debug!(record_id, "record finalized; not scheduling");
            return Ok(false);
        }

        self.inner
            .store
            .upsert_job(&ScheduledJob {
                record_id: record_id.to_string(),
                interval_secs: interval.as_secs(),
                next_fire_at: wall_clock_after(interval),
                consecutive_failures: 0,
            })
            .await?;
        self.inner.arm(record_id, interval, interval, 0);
        Ok(true)
    }

    pub fn validate_interval(&self, interval: Duration) -> Result<(), TrackerError> {
        let minimum = self.inner.settings.min_interval;
        if interval.is_zero() || interval < minimum {
            return Err(TrackerError::InvalidInterval {
                requested_secs: interval.as_secs(),
                minimum_secs: minimum.as_secs(),
            });
        }
        if interval > MAX_INTERVAL {
            return Err(TrackerError::IntervalTooLong {
                requested_secs: interval.as_secs(),
                maximum_secs: MAX_INTERVAL.as_secs(),
            });
        }
        Ok(())
    }

    /// Remove the job. Idempotent; a check already running is not aborted
    /// but will not be rescheduled.
    pub async fn cancel_status_check(&self, record_id: &str) -> Result<bool, TrackerError> {
        let inner = &self.inner;
        let generation = inner.next_generation();
        inner.cancelled.insert(
            record_id.to_string(),
            Tombstone {
                generation,
                deleted: false,
            },
        );
        let removed = inner.jobs.remove(record_id).is_some();
        let deleted = inner.store.delete_job(record_id).await;
        if deleted.is_ok() {
            if let Some(mut tombstone) = inner.cancelled.get_mut(record_id) {
                if tombstone.generation == generation {
                    tombstone.deleted = true;
                }
            }
        } else {
            // The row survived; let the sweep adopt it again.
            inner
                .cancelled
                .remove_if(record_id, |_, t| t.generation == generation);
        }
        let deleted = deleted?;
        if removed || deleted {
            events::job_cancelled(record_id);
        }
        Ok(removed || deleted)
    }

    /// Drop the job of a record that was finalized outside the scheduler.
    pub async fn forget_finalized(&self, record_id: &str) {
        self.inner.retire(record_id).await;
    }

    pub fn job(&self, record_id: &str) -> Option<JobSnapshot> {
        self.inner.jobs.get(record_id).map(|slot| JobSnapshot {
            record_id: record_id.to_string(),
            interval: slot.interval,
            next_fire: slot.next_fire,
            consecutive_failures: slot.failures,
            state: slot.state,
        })
    }

    pub fn job_count(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Reconcile armed jobs with the persisted definitions, discard stale
    /// queue entries, reclaim expired cache entries and apply the history
    /// retention period.
    pub async fn sweep(&self) -> Result<SweepReport, TrackerError> {
        let inner = &self.inner;
        let horizon = inner.generation.load(Ordering::Acquire);
        // Cancels whose row was gone before the listing below.
        let settled: HashMap<String, u64> = inner
            .cancelled
            .iter()
            .filter(|t| t.deleted)
            .map(|t| (t.key().clone(), t.generation))
            .collect();
        let persisted = inner.store.active_jobs().await?;
        let known: HashSet<&str> = persisted.iter().map(|j| j.record_id.as_str()).collect();

        let mut report = SweepReport::default();
        for job in &persisted {
            let id = job.record_id.as_str();
            if inner.jobs.contains_key(id) {
                continue;
            }
            let cancelled_since = inner
                .cancelled
                .get(id)
                .is_some_and(|t| settled.get(id) != Some(&t.generation));
            if cancelled_since {
                debug!(record_id = id, "skipping adoption of a job cancelled during the sweep");
                continue;
            }
            inner.resume(job);
            report.adopted += 1;
        }
        for (record_id, generation) in settled {
            inner
                .cancelled
                .remove_if(&record_id, |_, t| t.generation == generation);
        }

        // Slots armed after `horizon` may not be visible in `persisted` yet.
        let stale: Vec<String> = inner
            .jobs
            .iter()
            .filter(|slot| {
                !known.contains(slot.key().as_str())
                    && slot.generation <= horizon
                    && slot.state == JobState::Scheduled
            })
            .map(|slot| slot.key().clone())
            .collect();
        for record_id in stale {
            if inner
                .jobs
                .remove_if(&record_id, |_, slot| {
                    slot.generation <= horizon && slot.state == JobState::Scheduled
                })
                .is_some()
            {
                events::job_cancelled(&record_id);
                report.dropped += 1;
            }
        }

        report.discarded = inner.discard_stale();
        report.purged_cache = inner.cache.purge_expired().await;

        if let Some(retention) = inner.settings.history_retention {
            report.pruned_history = inner.store.prune_history(wall_clock_before(retention)).await?;
        }
        if report != SweepReport::default() {
            info!(?report, "scheduler sweep");
        }
        Ok(report)
    }
}

fn wall_clock_before(age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(3650));
    let now = Utc::now();
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl SchedulerInner {
    fn queue(&self) -> MutexGuard<'_, BinaryHeap<Reverse<Due>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn arm(&self, record_id: &str, interval: Duration, delay: Duration, failures: u32) {
        let generation = self.next_generation();
        let next_fire = deadline_after(delay);
        self.jobs.insert(
            record_id.to_string(),
            JobSlot {
                generation,
                interval,
                next_fire,
                failures,
                state: JobState::Scheduled,
            },
        );
        self.enqueue(record_id, next_fire, generation);
        events::job_scheduled(record_id, delay, failures);
    }

    fn resume(&self, job: &ScheduledJob) {
        let delay = (job.next_fire_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let interval = Duration::from_secs(job.interval_secs)
            .clamp(self.settings.min_interval, MAX_INTERVAL.max(self.settings.min_interval));
        self.arm(
            &job.record_id,
            interval,
            delay,
            job.consecutive_failures,
        );
    }

    fn enqueue(&self, record_id: &str, at: Instant, generation: u64) {
        self.queue().push(Reverse(Due {
            at,
            generation,
            record_id: record_id.to_string(),
        }));
        self.wake.notify_one();
    }

    /// Drop queue entries whose job was cancelled or re-armed since.
    fn discard_stale(&self) -> usize {
        let mut queue = self.queue();
        let before = queue.len();
        queue.retain(|Reverse(due)| {
            self.jobs
                .get(&due.record_id)
                .is_some_and(|slot| slot.generation == due.generation)
        });
        before - queue.len()
    }

    fn next_due(&self) -> Option<Instant> {
        self.queue().peek().map(|Reverse(due)| due.at)
    }

    /// Pop every entry due at `now`, keeping only those that still match
    /// their job's generation, and mark those jobs as checking.
    fn take_due(&self, now: Instant) -> Vec<Fire> {
        let mut fires = Vec::new();
        let mut queue = self.queue();
        while queue.peek().is_some_and(|Reverse(due)| due.at <= now) {
            let Some(Reverse(due)) = queue.pop() else {
                break;
            };
            if let Some(mut slot) = self.jobs.get_mut(&due.record_id) {
                if slot.generation == due.generation && slot.state == JobState::Scheduled {
                    slot.state = JobState::Checking;
                    fires.push(Fire {
                        record_id: due.record_id,
                        generation: due.generation,
                    });
                }
            }
        }
        fires
    }

    fn is_current(&self, fire: &Fire) -> bool {
        self.jobs
            .get(&fire.record_id)
            .is_some_and(|slot| slot.generation == fire.generation)
    }

    async fn fire(&self, fire: Fire) {
        if !self.is_current(&fire) {
            return;
        }
        events::job_fired(&fire.record_id);
        let result = self.checker.check(&fire.record_id).await;

        let failed = match &result {
            Ok(check) if check.transition.is_finalized() => {
                self.retire(&fire.record_id).await;
                return;
            }
            Err(CheckFailure::Finalized) | Err(CheckFailure::UnknownRecord) => {
                self.retire(&fire.record_id).await;
                return;
            }
            Ok(_) => false,
            Err(err) => {
                warn!(record_id = %fire.record_id, error = %err, "scheduled check failed");
                err.is_retryable()
            }
        };
        self.reschedule(&fire, failed).await;
    }

    async fn reschedule(&self, fire: &Fire, failed: bool) {
        let generation = self.next_generation();
        let (interval, delay, failures, next_fire) = {
            let Some(mut slot) = self.jobs.get_mut(&fire.record_id) else {
                // cancelled while checking
                return;
            };
            if slot.generation != fire.generation {
                // replaced while checking; the replacement is already queued
                return;
            }
            slot.failures = if failed { slot.failures.saturating_add(1) } else { 0 };
            let delay = next_delay(slot.interval, slot.failures, self.settings.max_backoff);
            slot.generation = generation;
            slot.next_fire = deadline_after(delay);
            slot.state = JobState::Scheduled;
            (slot.interval, delay, slot.failures, slot.next_fire)
        };
        self.enqueue(&fire.record_id, next_fire, generation);
        events::job_scheduled(&fire.record_id, delay, failures);

        let job = ScheduledJob {
            record_id: fire.record_id.clone(),
            interval_secs: interval.as_secs(),
            next_fire_at: wall_clock_after(delay),
            consecutive_failures: failures,
        };
        match self.store.update_job(&job).await {
            Ok(true) => {}
            Ok(false) => {
                // Definition removed from the store while checking.
                self.jobs
                    .remove_if(&fire.record_id, |_, slot| slot.generation == generation);
                events::job_cancelled(&fire.record_id);
            }
            Err(err) => warn!(?err, record_id = %fire.record_id, "failed to persist job state"),
        }
    }

    /// Terminal removal: the record is finalized or gone.
    async fn retire(&self, record_id: &str) {
        self.jobs.remove(record_id);
        if let Err(err) = self.store.delete_job(record_id).await {
            error!(?err, record_id, "failed to delete job of finalized record");
        }
        events::job_finalized(record_id);
    }
}

async fn run_timer(
    inner: Arc<SchedulerInner>,
    tx: mpsc::UnboundedSender<Fire>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next_due = inner.next_due();
        let sleep = async {
            match next_due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = inner.wake.notified() => continue,
            _ = sleep => {}
        }
        for fire in inner.take_due(Instant::now()) {
            if tx.send(fire).is_err() {
                return;
            }
        }
    }
}

async fn run_worker(
    inner: Arc<SchedulerInner>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Fire>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => None,
                fire = rx.recv() => fire,
            }
        };
        let Some(fire) = next else {
            break;
        };
        inner.fire(fire).await;
    }
}

async fn run_sweeper(scheduler: Scheduler, mut shutdown: watch::Receiver<bool>) {
    let period = scheduler.inner.settings.sweep_interval;
    let mut ticker = tokio::time::interval_at(deadline_after(period), period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                if let Err(err) = scheduler.sweep().await {
                    error!(?err, "scheduler sweep failed");
                }
            }
        }
    }
}
