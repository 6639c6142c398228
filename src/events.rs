//! Structured events for the observability collaborator.
//!
//! Every event is emitted under the `pnr_tracker::events` target with an
//! `event` field naming it, so a subscriber can filter on
//! `pnr_tracker::events=info` and route by name. The same facts are counted
//! in [`Stats`] for in-process consumers.

use crate::model::{ChannelKind, DeliveryOutcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const TARGET: &str = "pnr_tracker::events";

#[derive(Debug, Default)]
pub struct Stats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_errors: AtomicU64,
    upstream_calls: AtomicU64,
    fetches_coalesced: AtomicU64,
    checks_coalesced: AtomicU64,
    notifications_delivered: AtomicU64,
    notifications_failed: AtomicU64,
    notifications_skipped: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_errors: u64,
    pub upstream_calls: u64,
    pub fetches_coalesced: u64,
    pub checks_coalesced: u64,
    pub notifications_delivered: u64,
    pub notifications_failed: u64,
    pub notifications_skipped: u64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            fetches_coalesced: self.fetches_coalesced.load(Ordering::Relaxed),
            checks_coalesced: self.checks_coalesced.load(Ordering::Relaxed),
            notifications_delivered: self.notifications_delivered.load(Ordering::Relaxed),
            notifications_failed: self.notifications_failed.load(Ordering::Relaxed),
            notifications_skipped: self.notifications_skipped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn cache_hit(&self, key: &str) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "cache_hit", key);
    }

    pub(crate) fn cache_miss(&self, key: &str) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "cache_miss", key);
    }

    pub(crate) fn cache_unavailable(&self, key: &str, err: &dyn std::error::Error) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
        warn!(target: TARGET, event = "cache_unavailable", key, error = %err, "treating as miss");
    }

    pub(crate) fn upstream_call(&self, record_id: &str, attempt: u32) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "upstream_call", record_id, attempt);
    }

    pub(crate) fn fetch_coalesced(&self, record_id: &str, waiters: usize) {
        self.fetches_coalesced.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "fetch_coalesced", record_id, waiters);
    }

    pub(crate) fn check_coalesced(&self, record_id: &str, waiters: usize) {
        self.checks_coalesced.fetch_add(1, Ordering::Relaxed);
        info!(target: TARGET, event = "check_coalesced", record_id, waiters);
    }

    pub(crate) fn notification(
        &self,
        record_id: &str,
        channel: ChannelKind,
        outcome: DeliveryOutcome,
    ) {
        let counter = match outcome {
            DeliveryOutcome::Delivered => &self.notifications_delivered,
            DeliveryOutcome::Failed => &self.notifications_failed,
            DeliveryOutcome::Skipped => &self.notifications_skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        info!(
            target: TARGET,
            event = "notification",
            record_id,
            channel = channel.as_str(),
            outcome = outcome.as_str()
        );
    }
}

pub(crate) fn job_scheduled(record_id: &str, delay: Duration, failures: u32) {
    info!(
        target: TARGET,
        event = "job_scheduled",
        record_id,
        delay_secs = delay.as_secs(),
        failures
    );
}

pub(crate) fn job_fired(record_id: &str) {
    info!(target: TARGET, event = "job_fired", record_id);
}

pub(crate) fn job_finalized(record_id: &str) {
    info!(target: TARGET, event = "job_finalized", record_id);
}

pub(crate) fn job_cancelled(record_id: &str) {
    info!(target: TARGET, event = "job_cancelled", record_id);
}
