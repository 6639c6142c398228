//! History append and per-channel notification fan-out.

use crate::error::CheckFailure;
use crate::events::Stats;
use crate::model::{
    ChannelKind, DeliveryOutcome, HistoryEntry, NotificationAttempt, StatusChange,
    TrackedRecord, Transition,
};
use crate::store::TrackingStore;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

pub mod channels;

pub use channels::{InAppChannel, TelegramChannel, WebhookChannel};

/// What a channel receives for one genuine transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notice {
    pub history_id: i64,
    pub record_id: String,
    pub owner_ref: String,
    pub origin: String,
    pub destination: String,
    pub travel_date: NaiveDate,
    pub transition: Transition,
    pub at: DateTime<Utc>,
}

impl Notice {
    pub fn new(record: &TrackedRecord, transition: &Transition, entry: &HistoryEntry) -> Self {
        Self {
            history_id: entry.id,
            record_id: record.record_id.clone(),
            owner_ref: record.owner_ref.clone(),
            origin: record.origin.clone(),
            destination: record.destination.clone(),
            travel_date: record.travel_date,
            transition: transition.clone(),
            at: entry.transitioned_at,
        }
    }

    /// One-line human readable summary.
    pub fn headline(&self) -> String {
        let route = format!(
            "PNR {} ({} → {}, {})",
            self.record_id, self.origin, self.destination, self.travel_date
        );
        match &self.transition {
            Transition::FirstSeen { status } => format!("{route}: status is {status}"),
            Transition::Updated { previous, status } => {
                format!("{route}: {previous} → {status}")
            }
            Transition::Finalized { status, .. } => {
                format!("{route}: final status {status}, tracking stopped")
            }
            Transition::Unchanged { status } => format!("{route}: still {status}"),
        }
    }
}

/// Result of a send that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The channel had nothing to deliver to (no address, no subscriber).
    Skipped(String),
}

/// A delivery channel. Errors mean the send failed; the dispatcher records
/// them and never retries.
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;
    async fn send(&self, notice: &Notice) -> Result<Delivery>;
}

/// Outcome of dispatching one forwarded transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub history: HistoryEntry,
    pub notifications: Vec<NotificationAttempt>,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn TrackingStore>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    /// Channels configured off; recorded as skipped for every transition.
    disabled: Vec<ChannelKind>,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        disabled: Vec<ChannelKind>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            store,
            channels,
            disabled,
            stats,
        }
    }

    /// Persist the transition, then notify every channel once.
    ///
    /// Returns `Ok(None)` for `Unchanged` and for a change that lost the race
    /// against a concurrent writer of the same record. A failed history write
    /// aborts before any channel is contacted.
    pub async fn dispatch(
        &self,
        record: &TrackedRecord,
        transition: &Transition,
        at: DateTime<Utc>,
    ) -> Result<Option<Dispatched>, CheckFailure> {
        let Some(kind) = transition.kind() else {
            return Ok(None);
        };
        let change = StatusChange {
            record_id: record.record_id.clone(),
            previous_status: record.current_status.clone(),
            new_status: transition.status().to_string(),
            kind,
            at,
        };
        let entry = match self.store.apply_status_change(&change).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                warn!(
                    record_id = %record.record_id,
                    "record changed concurrently; dropping stale transition"
                );
                return Ok(None);
            }
            Err(err) => {
                error!(?err, record_id = %record.record_id, "history append failed; not notifying");
                return Err(CheckFailure::HistoryWrite(err.to_string()));
            }
        };

        let notice = Notice::new(record, transition, &entry);
        let notifications = self.fan_out(&notice).await;
        if let Err(err) = self.store.record_attempts(&notifications).await {
            warn!(?err, history_id = entry.id, "failed to persist notification attempts");
        }
        Ok(Some(Dispatched {
            history: entry,
            notifications,
        }))
    }

    /// One adapter task per channel; a failing or panicking channel does not
    /// affect the others.
    async fn fan_out(&self, notice: &Notice) -> Vec<NotificationAttempt> {
        let handles: Vec<_> = self
            .channels
            .iter()
            .map(|channel| {
                let channel = Arc::clone(channel);
                let notice = notice.clone();
                let kind = channel.kind();
                (
                    kind,
                    tokio::spawn(async move { channel.send(&notice).await }),
                )
            })
            .collect();

        let mut attempts = Vec::with_capacity(handles.len() + self.disabled.len());
        for (channel, handle) in handles {
            let (outcome, detail) = match handle.await {
                Ok(Ok(Delivery::Delivered)) => (DeliveryOutcome::Delivered, None),
                Ok(Ok(Delivery::Skipped(reason))) => (DeliveryOutcome::Skipped, Some(reason)),
                Ok(Err(err)) => {
                    warn!(?err, channel = channel.as_str(), record_id = %notice.record_id, "notification failed");
                    (DeliveryOutcome::Failed, Some(format!("{err:#}")))
                }
                Err(join_err) => (
                    DeliveryOutcome::Failed,
                    Some(format!("channel task aborted: {join_err}")),
                ),
            };
            attempts.push(self.attempt(notice, channel, outcome, detail));
        }
        for &channel in &self.disabled {
            attempts.push(self.attempt(
                notice,
                channel,
                DeliveryOutcome::Skipped,
                Some("channel disabled".into()),
            ));
        }
        attempts
    }

    fn attempt(
        &self,
        notice: &Notice,
        channel: ChannelKind,
        outcome: DeliveryOutcome,
        detail: Option<String>,
    ) -> NotificationAttempt {
        self.stats.notification(&notice.record_id, channel, outcome);
        NotificationAttempt {
            history_id: notice.history_id,
            record_id: notice.record_id.clone(),
            channel,
            outcome,
            detail,
            attempted_at: Utc::now(),
        }
    }
}
