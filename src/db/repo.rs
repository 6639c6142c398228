use super::model::{HistoryRow, JobRow};
use crate::model::{
    HistoryEntry, NewTrackedRecord, NotificationAttempt, ScheduledJob, StatusChange,
    TrackedRecord, TransitionKind,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

pub type Pool = SqlitePool;

const RECORD_COLUMNS: &str = "record_id, origin, destination, travel_date, owner_ref, \
     current_status, is_finalized, last_checked_at, created_at";

pub async fn init_pool(database_url: &str, max_connections: u32) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn map_record(row: &SqliteRow) -> Result<TrackedRecord> {
    Ok(TrackedRecord {
        record_id: row.try_get("record_id")?,
        origin: row.try_get("origin")?,
        destination: row.try_get("destination")?,
        travel_date: row.try_get("travel_date")?,
        owner_ref: row.try_get("owner_ref")?,
        current_status: row.try_get("current_status")?,
        is_finalized: row.try_get("is_finalized")?,
        last_checked_at: row.try_get("last_checked_at")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert a record, or refresh an existing one and re-arm it if it was
/// finalized. The last known status is kept so history stays continuous.
#[instrument(skip_all)]
pub async fn upsert_record(pool: &Pool, record: &NewTrackedRecord) -> Result<TrackedRecord> {
    let sql = format!(
        "INSERT INTO tracked_records \
         (record_id, origin, destination, travel_date, owner_ref, is_finalized, created_at) \
         VALUES (?, ?, ?, ?, ?, 0, ?) \
         ON CONFLICT(record_id) DO UPDATE SET \
            origin = excluded.origin, \
            destination = excluded.destination, \
            travel_date = excluded.travel_date, \
            owner_ref = excluded.owner_ref, \
            is_finalized = 0 \
         RETURNING {RECORD_COLUMNS}"
    );
    let row = sqlx::query(&sql)
        .bind(&record.record_id)
        .bind(&record.origin)
        .bind(&record.destination)
        .bind(record.travel_date)
        .bind(&record.owner_ref)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
        .context("failed to upsert tracked record")?;
    map_record(&row)
}

#[instrument(skip_all)]
pub async fn get_record(pool: &Pool, record_id: &str) -> Result<Option<TrackedRecord>> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM tracked_records WHERE record_id = ?");
    let row = sqlx::query(&sql)
        .bind(record_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(map_record).transpose()
}

/// Remove a record and its job. History is retained.
#[instrument(skip_all)]
pub async fn delete_record(pool: &Pool, record_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM scheduled_jobs WHERE record_id = ?")
        .bind(record_id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM tracked_records WHERE record_id = ?")
        .bind(record_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(deleted > 0)
}

#[instrument(skip_all)]
pub async fn touch_checked(pool: &Pool, record_id: &str, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE tracked_records SET last_checked_at = ? WHERE record_id = ?")
        .bind(at)
        .bind(record_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Append the history entry and move the record to the new status in one
/// transaction. The record update only applies if the record still holds
/// `previous_status` and is not finalized; otherwise nothing is written and
/// `None` is returned.
#[instrument(skip_all)]
pub async fn apply_status_change(
    pool: &Pool,
    change: &StatusChange,
) -> Result<Option<HistoryEntry>> {
    let finalized = change.kind == TransitionKind::Finalized;
    let mut tx = pool.begin().await?;

    let history_id: i64 = sqlx::query(
        "INSERT INTO status_history (record_id, previous_status, new_status, kind, transitioned_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&change.record_id)
    .bind(&change.previous_status)
    .bind(&change.new_status)
    .bind(change.kind.as_str())
    .bind(change.at)
    .fetch_one(&mut *tx)
    .await
    .context("failed to append history")?
    .get("id");

    let updated = sqlx::query(
        "UPDATE tracked_records \
         SET current_status = ?, is_finalized = ?, last_checked_at = ? \
         WHERE record_id = ? AND is_finalized = 0 AND current_status IS ?",
    )
    .bind(&change.new_status)
    .bind(finalized)
    .bind(change.at)
    .bind(&change.record_id)
    .bind(&change.previous_status)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if updated == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    if finalized {
        sqlx::query("DELETE FROM scheduled_jobs WHERE record_id = ?")
            .bind(&change.record_id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(Some(HistoryEntry {
        id: history_id,
        record_id: change.record_id.clone(),
        previous_status: change.previous_status.clone(),
        new_status: change.new_status.clone(),
        kind: change.kind,
        transitioned_at: change.at,
    }))
}

/// History for a record, newest first.
#[instrument(skip_all)]
pub async fn history_for(pool: &Pool, record_id: &str) -> Result<Vec<HistoryEntry>> {
    let rows: Vec<HistoryRow> = sqlx::query_as(
        "SELECT id, record_id, previous_status, new_status, kind, transitioned_at \
         FROM status_history WHERE record_id = ? \
         ORDER BY transitioned_at DESC, id DESC",
    )
    .bind(record_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(HistoryEntry::try_from).collect()
}

#[instrument(skip_all)]
pub async fn insert_notification_attempts(
    pool: &Pool,
    attempts: &[NotificationAttempt],
) -> Result<()> {
    if attempts.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for attempt in attempts {
        sqlx::query(
            "INSERT OR IGNORE INTO notification_attempts \
             (history_id, record_id, channel, outcome, detail, attempted_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.history_id)
        .bind(&attempt.record_id)
        .bind(attempt.channel.as_str())
        .bind(attempt.outcome.as_str())
        .bind(&attempt.detail)
        .bind(attempt.attempted_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_notification_attempts(pool: &Pool, history_id: i64) -> Result<i64> {
    let cnt: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notification_attempts WHERE history_id = ?")
            .bind(history_id)
            .fetch_one(pool)
            .await?;
    Ok(cnt)
}

#[instrument(skip_all)]
pub async fn upsert_job(pool: &Pool, job: &ScheduledJob) -> Result<()> {
    let interval = i64::try_from(job.interval_secs).map_err(|_| anyhow!("interval too large"))?;
    sqlx::query(
        "INSERT INTO scheduled_jobs (record_id, interval_secs, next_fire_at, consecutive_failures) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT(record_id) DO UPDATE SET \
            interval_secs = excluded.interval_secs, \
            next_fire_at = excluded.next_fire_at, \
            consecutive_failures = excluded.consecutive_failures",
    )
    .bind(&job.record_id)
    .bind(interval)
    .bind(job.next_fire_at)
    .bind(i64::from(job.consecutive_failures))
    .execute(pool)
    .await
    .context("failed to persist scheduled job")?;
    Ok(())
}

/// Update an existing job's schedule. Returns false when the job row is gone.
#[instrument(skip_all)]
pub async fn update_job(pool: &Pool, job: &ScheduledJob) -> Result<bool> {
    let interval = i64::try_from(job.interval_secs).map_err(|_| anyhow!("interval too large"))?;
    let updated = sqlx::query(
        "UPDATE scheduled_jobs \
         SET interval_secs = ?, next_fire_at = ?, consecutive_failures = ? \
         WHERE record_id = ?",
    )
    .bind(interval)
    .bind(job.next_fire_at)
    .bind(i64::from(job.consecutive_failures))
    .bind(&job.record_id)
    .execute(pool)
    .await
    .context("failed to update scheduled job")?
    .rows_affected();
    Ok(updated > 0)
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, record_id: &str) -> Result<bool> {
    let deleted = sqlx::query("DELETE FROM scheduled_jobs WHERE record_id = ?")
        .bind(record_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(deleted > 0)
}

#[instrument(skip_all)]
pub async fn get_job(pool: &Pool, record_id: &str) -> Result<Option<ScheduledJob>> {
    let row: Option<JobRow> = sqlx::query_as(
        "SELECT record_id, interval_secs, next_fire_at, consecutive_failures \
         FROM scheduled_jobs WHERE record_id = ?",
    )
    .bind(record_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(ScheduledJob::from))
}

/// Jobs whose record is still being tracked.
#[instrument(skip_all)]
pub async fn active_jobs(pool: &Pool) -> Result<Vec<ScheduledJob>> {
    let rows: Vec<JobRow> = sqlx::query_as(
        "SELECT j.record_id, j.interval_secs, j.next_fire_at, j.consecutive_failures \
         FROM scheduled_jobs j \
         JOIN tracked_records r ON r.record_id = j.record_id \
         WHERE r.is_finalized = 0 \
         ORDER BY j.next_fire_at ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(ScheduledJob::from).collect())
}

/// Retention sweep: drop history (and its notification attempts) older than
/// `before`.
#[instrument(skip_all)]
pub async fn prune_history(pool: &Pool, before: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM notification_attempts WHERE history_id IN \
         (SELECT id FROM status_history WHERE transitioned_at < ?)",
    )
    .bind(before)
    .execute(&mut *tx)
    .await?;
    let deleted = sqlx::query("DELETE FROM status_history WHERE transitioned_at < ?")
        .bind(before)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate};

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn new_record(id: &str) -> NewTrackedRecord {
        NewTrackedRecord {
            record_id: id.into(),
            origin: "NDLS".into(),
            destination: "BCT".into(),
            travel_date: NaiveDate::from_ymd_opt(2026, 12, 24).unwrap(),
            owner_ref: "1001".into(),
        }
    }

    fn change(id: &str, prev: Option<&str>, new: &str, kind: TransitionKind) -> StatusChange {
        StatusChange {
            record_id: id.into(),
            previous_status: prev.map(str::to_string),
            new_status: new.into(),
            kind,
            at: Utc::now(),
        }
    }

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://x/y"),
            "postgres://x/y"
        );
    }

    #[tokio::test]
    async fn upsert_and_reregister_resets_finalized() {
        let pool = setup_pool().await;
        let rec = upsert_record(&pool, &new_record("4512345678")).await.unwrap();
        assert_eq!(rec.current_status, None);
        assert!(!rec.is_finalized);

        apply_status_change(
            &pool,
            &change("4512345678", None, "EXPIRED", TransitionKind::Finalized),
        )
        .await
        .unwrap()
        .unwrap();
        let rec = get_record(&pool, "4512345678").await.unwrap().unwrap();
        assert!(rec.is_finalized);
        assert_eq!(rec.current_status.as_deref(), Some("EXPIRED"));

        let rec = upsert_record(&pool, &new_record("4512345678")).await.unwrap();
        assert!(!rec.is_finalized);
        assert_eq!(rec.current_status.as_deref(), Some("EXPIRED"));
    }

    #[tokio::test]
    async fn stale_change_writes_nothing() {
        let pool = setup_pool().await;
        upsert_record(&pool, &new_record("4512345678")).await.unwrap();
        let first = apply_status_change(
            &pool,
            &change("4512345678", None, "WL/12", TransitionKind::FirstSeen),
        )
        .await
        .unwrap();
        assert!(first.is_some());

        // Same "previous = none" change again loses the compare-and-set.
        let again = apply_status_change(
            &pool,
            &change("4512345678", None, "WL/12", TransitionKind::FirstSeen),
        )
        .await
        .unwrap();
        assert!(again.is_none());
        assert_eq!(history_for(&pool, "4512345678").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let pool = setup_pool().await;
        upsert_record(&pool, &new_record("4512345678")).await.unwrap();
        apply_status_change(
            &pool,
            &change("4512345678", None, "WL/12", TransitionKind::FirstSeen),
        )
        .await
        .unwrap();
        apply_status_change(
            &pool,
            &change("4512345678", Some("WL/12"), "RAC/3", TransitionKind::Updated),
        )
        .await
        .unwrap();

        let history = history_for(&pool, "4512345678").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].new_status, "RAC/3");
        assert_eq!(history[0].previous_status.as_deref(), Some("WL/12"));
        assert_eq!(history[1].kind, TransitionKind::FirstSeen);
    }

    #[tokio::test]
    async fn finalizing_removes_job_and_hides_it_from_active() {
        let pool = setup_pool().await;
        upsert_record(&pool, &new_record("4512345678")).await.unwrap();
        upsert_record(&pool, &new_record("4512345679")).await.unwrap();
        for id in ["4512345678", "4512345679"] {
            upsert_job(
                &pool,
                &ScheduledJob {
                    record_id: id.into(),
                    interval_secs: 600,
                    next_fire_at: Utc::now(),
                    consecutive_failures: 0,
                },
            )
            .await
            .unwrap();
        }
        apply_status_change(
            &pool,
            &change("4512345678", None, "EXPIRED", TransitionKind::Finalized),
        )
        .await
        .unwrap();

        assert!(get_job(&pool, "4512345678").await.unwrap().is_none());
        let active = active_jobs(&pool).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].record_id, "4512345679");
        assert_eq!(active[0].interval_secs, 600);
    }

    #[tokio::test]
    async fn attempts_are_unique_per_channel_and_pruned_with_history() {
        use crate::model::{ChannelKind, DeliveryOutcome};

        let pool = setup_pool().await;
        upsert_record(&pool, &new_record("4512345678")).await.unwrap();
        let mut old = change("4512345678", None, "WL/12", TransitionKind::FirstSeen);
        old.at = Utc::now() - ChronoDuration::days(400);
        let entry = apply_status_change(&pool, &old).await.unwrap().unwrap();

        let attempt = NotificationAttempt {
            history_id: entry.id,
            record_id: "4512345678".into(),
            channel: ChannelKind::InApp,
            outcome: DeliveryOutcome::Delivered,
            detail: None,
            attempted_at: Utc::now(),
        };
        insert_notification_attempts(&pool, &[attempt.clone(), attempt])
            .await
            .unwrap();
        assert_eq!(count_notification_attempts(&pool, entry.id).await.unwrap(), 1);

        let pruned = prune_history(&pool, Utc::now() - ChronoDuration::days(365))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(history_for(&pool, "4512345678").await.unwrap().is_empty());
        assert_eq!(count_notification_attempts(&pool, entry.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_record_keeps_history() {
        let pool = setup_pool().await;
        upsert_record(&pool, &new_record("4512345678")).await.unwrap();
        apply_status_change(
            &pool,
            &change("4512345678", None, "WL/12", TransitionKind::FirstSeen),
        )
        .await
        .unwrap();
        assert!(delete_record(&pool, "4512345678").await.unwrap());
        assert!(!delete_record(&pool, "4512345678").await.unwrap());
        assert!(get_record(&pool, "4512345678").await.unwrap().is_none());
        assert_eq!(history_for(&pool, "4512345678").await.unwrap().len(), 1);
    }
}
