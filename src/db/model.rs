//! Row shapes returned by repository queries.
//!
//! Keep these structs focused on the columns a query selects; conversion to
//! domain types happens here so the repository stays SQL-only.

use crate::model::{HistoryEntry, ScheduledJob, TransitionKind};
use anyhow::anyhow;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryRow {
    pub id: i64,
    pub record_id: String,
    pub previous_status: Option<String>,
    pub new_status: String,
    pub kind: String,
    pub transitioned_at: DateTime<Utc>,
}

impl TryFrom<HistoryRow> for HistoryEntry {
    type Error = anyhow::Error;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let kind = TransitionKind::parse_kind(&row.kind)
            .ok_or_else(|| anyhow!("history {} has unknown kind {}", row.id, row.kind))?;
        Ok(HistoryEntry {
            id: row.id,
            record_id: row.record_id,
            previous_status: row.previous_status,
            new_status: row.new_status,
            kind,
            transitioned_at: row.transitioned_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub record_id: String,
    pub interval_secs: i64,
    pub next_fire_at: DateTime<Utc>,
    pub consecutive_failures: i64,
}

impl From<JobRow> for ScheduledJob {
    fn from(row: JobRow) -> Self {
        ScheduledJob {
            record_id: row.record_id,
            interval_secs: u64::try_from(row.interval_secs).unwrap_or(0),
            next_fire_at: row.next_fire_at,
            consecutive_failures: u32::try_from(row.consecutive_failures).unwrap_or(u32::MAX),
        }
    }
}
