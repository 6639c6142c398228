use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Status recorded when the upstream reports the record as gone for good.
pub const EXPIRED_STATUS: &str = "EXPIRED";

static RECORD_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{10}$").expect("valid record id pattern"));

/// Returns true for a well-formed 10-digit record identifier.
pub fn is_valid_record_id(id: &str) -> bool {
    RECORD_ID_RE.is_match(id)
}

/// A booking registered for status tracking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedRecord {
    pub record_id: String,
    pub origin: String,
    pub destination: String,
    pub travel_date: NaiveDate,
    pub owner_ref: String,
    pub current_status: Option<String>,
    pub is_finalized: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Registration payload coming from the API layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTrackedRecord {
    pub record_id: String,
    pub origin: String,
    pub destination: String,
    pub travel_date: NaiveDate,
    pub owner_ref: String,
}

/// One immutable observation of a record's upstream status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub record_id: String,
    pub status: String,
    /// Upstream signalled that the journey is complete and no further
    /// updates will follow.
    pub journey_complete: bool,
    pub fetched_at: DateTime<Utc>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    FirstSeen,
    Updated,
    Finalized,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::FirstSeen => "first_seen",
            TransitionKind::Updated => "updated",
            TransitionKind::Finalized => "finalized",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "first_seen" => Some(TransitionKind::FirstSeen),
            "updated" => Some(TransitionKind::Updated),
            "finalized" => Some(TransitionKind::Finalized),
            _ => None,
        }
    }
}

/// Classified outcome of comparing a fresh snapshot with the previous status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Unchanged {
        status: String,
    },
    FirstSeen {
        status: String,
    },
    Updated {
        previous: String,
        status: String,
    },
    /// Terminal: polling stops for this record.
    Finalized {
        previous: Option<String>,
        status: String,
    },
}

impl Transition {
    /// History kind for transitions that are forwarded downstream;
    /// `None` for `Unchanged`.
    pub fn kind(&self) -> Option<TransitionKind> {
        match self {
            Transition::Unchanged { .. } => None,
            Transition::FirstSeen { .. } => Some(TransitionKind::FirstSeen),
            Transition::Updated { .. } => Some(TransitionKind::Updated),
            Transition::Finalized { .. } => Some(TransitionKind::Finalized),
        }
    }

    pub fn status(&self) -> &str {
        match self {
            Transition::Unchanged { status }
            | Transition::FirstSeen { status }
            | Transition::Updated { status, .. }
            | Transition::Finalized { status, .. } => status,
        }
    }

    pub fn previous(&self) -> Option<&str> {
        match self {
            Transition::Unchanged { status } => Some(status),
            Transition::FirstSeen { .. } => None,
            Transition::Updated { previous, .. } => Some(previous),
            Transition::Finalized { previous, .. } => previous.as_deref(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self, Transition::Finalized { .. })
    }
}

/// Append-only record of a genuine status change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: i64,
    pub record_id: String,
    pub previous_status: Option<String>,
    pub new_status: String,
    pub kind: TransitionKind,
    pub transitioned_at: DateTime<Utc>,
}

/// Write request applied by the store in one transaction: history append,
/// then the conditional record update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub record_id: String,
    pub previous_status: Option<String>,
    pub new_status: String,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Telegram,
    Webhook,
    InApp,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Telegram => "telegram",
            ChannelKind::Webhook => "webhook",
            ChannelKind::InApp => "in_app",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Failed,
    Skipped,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Failed => "failed",
            DeliveryOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationAttempt {
    pub history_id: i64,
    pub record_id: String,
    pub channel: ChannelKind,
    pub outcome: DeliveryOutcome,
    pub detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Persisted definition of a recurring status check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledJob {
    pub record_id: String,
    pub interval_secs: u64,
    pub next_fire_at: DateTime<Utc>,
    pub consecutive_failures: u32,
}
