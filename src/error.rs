use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a status source or by the fetcher after retries.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UpstreamError {
    /// Network, timeout or rate-limit signal. Worth retrying.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// Malformed response or record unknown/expired upstream.
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
    #[error("upstream still failing after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl From<tokio::task::JoinError> for UpstreamError {
    fn from(err: tokio::task::JoinError) -> Self {
        UpstreamError::Transient(format!("fetch task aborted: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Persistent store failure. The SQL layer speaks `anyhow`; this wraps it at
/// the store seam.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct StoreError(#[from] pub anyhow::Error);

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError(err.into())
    }
}

/// Why a single record check did not complete. Reported per record, never
/// thrown at the caller.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CheckFailure {
    #[error(transparent)]
    Upstream(UpstreamError),
    /// History append failed; nothing was notified.
    #[error("history write failed: {0}")]
    HistoryWrite(String),
    #[error("store failure: {0}")]
    Store(String),
    #[error("record is not tracked")]
    UnknownRecord,
    #[error("record is finalized")]
    Finalized,
    #[error("check aborted: {0}")]
    Aborted(String),
}

impl CheckFailure {
    /// Failures that should stretch the next scheduled fire.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CheckFailure::Upstream(_)
                | CheckFailure::HistoryWrite(_)
                | CheckFailure::Store(_)
                | CheckFailure::Aborted(_)
        )
    }
}

impl From<tokio::task::JoinError> for CheckFailure {
    fn from(err: tokio::task::JoinError) -> Self {
        CheckFailure::Aborted(err.to_string())
    }
}

/// Hard errors returned to the API layer for structurally invalid requests.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid record id {0:?}: expected 10 digits")]
    InvalidRecordId(String),
    #[error("record {0} is not tracked")]
    UnknownRecord(String),
    #[error("batch must contain at least one record id")]
    EmptyBatch,
    #[error("concurrency limit must be > 0")]
    InvalidConcurrency,
    #[error("check interval {requested_secs}s is below the minimum of {minimum_secs}s")]
    InvalidInterval { requested_secs: u64, minimum_secs: u64 },
    #[error("check interval {requested_secs}s exceeds the maximum of {maximum_secs}s")]
    IntervalTooLong { requested_secs: u64, maximum_secs: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}
