//! The fetch → detect → dispatch pipeline for one record.

use crate::detect::detect;
use crate::error::{CheckFailure, UpstreamError};
use crate::events::Stats;
use crate::fetcher::Fetcher;
use crate::model::{NotificationAttempt, Transition, EXPIRED_STATUS};
use crate::notify::Dispatcher;
use crate::singleflight::SingleFlight;
use crate::store::TrackingStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// A completed check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordCheck {
    pub transition: Transition,
    /// Set when the transition was written to history.
    pub history_id: Option<i64>,
    pub notifications: Vec<NotificationAttempt>,
}

pub type CheckResult = Result<RecordCheck, CheckFailure>;

/// Per-record outcome as reported to the API layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Checked(RecordCheck),
    Failed { error: CheckFailure },
}

impl RecordOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecordOutcome::Checked(_))
    }

    pub fn transition(&self) -> Option<&Transition> {
        match self {
            RecordOutcome::Checked(check) => Some(&check.transition),
            RecordOutcome::Failed { .. } => None,
        }
    }
}

impl From<CheckResult> for RecordOutcome {
    fn from(result: CheckResult) -> Self {
        match result {
            Ok(check) => RecordOutcome::Checked(check),
            Err(error) => RecordOutcome::Failed { error },
        }
    }
}

/// Runs checks, coalescing concurrent checks of the same record so they
/// share one fetch, one history entry and one notification set.
#[derive(Clone)]
pub struct Checker {
    inner: Arc<CheckerInner>,
}

struct CheckerInner {
    store: Arc<dyn TrackingStore>,
    fetcher: Fetcher,
    dispatcher: Dispatcher,
    flights: SingleFlight<RecordCheck, CheckFailure>,
    stats: Arc<Stats>,
}

impl Checker {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        fetcher: Fetcher,
        dispatcher: Dispatcher,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            inner: Arc::new(CheckerInner {
                store,
                fetcher,
                dispatcher,
                flights: SingleFlight::new(),
                stats,
            }),
        }
    }

    pub async fn check(&self, record_id: &str) -> CheckResult {
        let inner = Arc::clone(&self.inner);
        let id = record_id.to_string();
        let joined = self
            .inner
            .flights
            .run(record_id, move || async move { inner.run_check(&id).await })
            .await;
        if joined.coalesced {
            self.inner.stats.check_coalesced(record_id, joined.waiters);
        }
        joined.result
    }
}

impl CheckerInner {
    #[instrument(skip(self))]
    async fn run_check(&self, record_id: &str) -> CheckResult {
        let record = self
            .store
            .get_record(record_id)
            .await
            .map_err(|err| CheckFailure::Store(err.to_string()))?
            .ok_or(CheckFailure::UnknownRecord)?;
        if record.is_finalized {
            return Err(CheckFailure::Finalized);
        }

        let transition = match self.fetcher.fetch(record_id).await {
            Ok(snapshot) => detect(record.current_status.as_deref(), &snapshot),
            Err(UpstreamError::Permanent(reason)) => {
                info!(record_id, %reason, "upstream no longer knows the record; finalizing");
                expired(record.current_status.as_deref())
            }
            Err(err) => return Err(CheckFailure::Upstream(err)),
        };

        let now = Utc::now();
        if let Transition::Unchanged { .. } = transition {
            if let Err(err) = self.store.touch_checked(record_id, now).await {
                warn!(?err, record_id, "failed to refresh last-checked timestamp");
            }
            return Ok(RecordCheck {
                transition,
                history_id: None,
                notifications: Vec::new(),
            });
        }

        match self.dispatcher.dispatch(&record, &transition, now).await? {
            Some(dispatched) => Ok(RecordCheck {
                transition,
                history_id: Some(dispatched.history.id),
                notifications: dispatched.notifications,
            }),
            // Someone else already moved the record to this status.
            None => Ok(RecordCheck {
                transition: Transition::Unchanged {
                    status: transition.status().to_string(),
                },
                history_id: None,
                notifications: Vec::new(),
            }),
        }
    }
}

fn expired(previous: Option<&str>) -> Transition {
    Transition::Finalized {
        previous: previous.map(str::to_string),
        status: EXPIRED_STATUS.to_string(),
    }
}
