use crate::error::UpstreamError;
use crate::model::StatusSnapshot;
use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// One status lookup for one record. Implementations normalize the status
/// text so equal statuses compare equal byte for byte.
#[async_trait::async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, record_id: &str) -> Result<StatusSnapshot, UpstreamError>;
}

/// Client for a JSON status gateway in front of the booking system:
/// `GET {base_url}/status/{record_id}` answering
/// `{"status": "...", "journey_complete": bool}`.
#[derive(Clone)]
pub struct HttpStatusSource {
    http: Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    journey_complete: bool,
}

impl fmt::Debug for HttpStatusSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStatusSource")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpStatusSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context("invalid upstream base_url")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent("pnr-tracker/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build upstream http client")?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, record_id: &str) -> Result<Url, UpstreamError> {
        self.base_url
            .join(&format!("status/{record_id}"))
            .map_err(|err| UpstreamError::Permanent(format!("bad status url: {err}")))
    }
}

#[async_trait::async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch_status(&self, record_id: &str) -> Result<StatusSnapshot, UpstreamError> {
        let url = self.endpoint(record_id)?;
        debug!(%url, record_id, "requesting upstream status");
        let res = self.http.get(url).send().await.map_err(|err| {
            warn!(?err, record_id, "upstream request failed");
            UpstreamError::Transient(err.to_string())
        })?;

        let status = res.status();
        if let Some(err) = classify_status(status) {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, record_id, %body, "upstream returned error status");
            return Err(err);
        }

        let body = res
            .text()
            .await
            .map_err(|err| UpstreamError::Transient(format!("failed to read body: {err}")))?;
        parse_status_body(record_id, &body)
    }
}

/// Map a non-success HTTP status onto the upstream error taxonomy.
pub fn classify_status(status: StatusCode) -> Option<UpstreamError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        return Some(UpstreamError::Transient(format!("upstream status {status}")));
    }
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Some(UpstreamError::Permanent(format!(
            "record not found or expired ({status})"
        )));
    }
    Some(UpstreamError::Permanent(format!("upstream status {status}")))
}

fn parse_status_body(record_id: &str, body: &str) -> Result<StatusSnapshot, UpstreamError> {
    let payload: StatusResponse = serde_json::from_str(body)
        .map_err(|err| UpstreamError::Permanent(format!("unparseable status response: {err}")))?;
    let status = normalize_status(&payload.status);
    if status.is_empty() {
        return Err(UpstreamError::Permanent("empty status in response".into()));
    }
    Ok(StatusSnapshot {
        record_id: record_id.to_string(),
        status,
        journey_complete: payload.journey_complete,
        fetched_at: Utc::now(),
        attempts: 1,
    })
}

/// Trim, collapse inner whitespace and upper-case.
pub fn normalize_status(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}
