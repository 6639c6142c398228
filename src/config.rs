//! Configuration loader and validator for the PNR status tracker.
use crate::cache::MAX_TTL;
use crate::fetcher::{FetcherSettings, RetryPolicy};
use crate::scheduler::{SchedulerSettings, MAX_INTERVAL};
use crate::tracker::TrackerSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub upstream: Upstream,
    pub cache: Cache,
    pub scheduler: Scheduler,
    pub notify: Notify,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Defaults to `sqlite://{data_dir}/tracker.db`.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Status gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Upstream {
    pub base_url: String,
    pub timeout_ms: u64,
    pub max_concurrency: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cache {
    pub status_ttl_secs: u64,
    pub batch_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub default_interval_secs: u64,
    pub min_interval_secs: u64,
    pub max_backoff_secs: u64,
    pub workers: usize,
    pub sweep_interval_secs: u64,
    /// 0 keeps history forever.
    #[serde(default)]
    pub history_retention_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notify {
    pub telegram: TelegramChannel,
    pub webhook: WebhookChannel,
    pub in_app: InAppChannel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelegramChannel {
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookChannel {
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InAppChannel {
    pub enabled: bool,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins over the file, then `app.database_url`, then a
    /// database file inside `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/tracker.db", self.app.data_dir))
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.timeout_ms)
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        let s = &self.scheduler;
        TrackerSettings {
            fetcher: FetcherSettings {
                status_ttl: Duration::from_secs(self.cache.status_ttl_secs),
                max_concurrency: self.upstream.max_concurrency,
                retry: self.upstream.retry,
            },
            scheduler: SchedulerSettings {
                min_interval: Duration::from_secs(s.min_interval_secs),
                max_backoff: Duration::from_secs(s.max_backoff_secs),
                workers: s.workers,
                sweep_interval: Duration::from_secs(s.sweep_interval_secs),
                history_retention: (s.history_retention_days > 0)
                    .then(|| Duration::from_secs(s.history_retention_days.saturating_mul(86_400))),
            },
            default_interval: Duration::from_secs(s.default_interval_secs),
            batch_ttl: Duration::from_secs(self.cache.batch_ttl_secs),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.max_connections == 0 {
        return Err(ConfigError::Invalid("app.max_connections must be > 0"));
    }

    if cfg.upstream.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("upstream.base_url must be non-empty"));
    }
    if cfg.upstream.timeout_ms == 0 {
        return Err(ConfigError::Invalid("upstream.timeout_ms must be > 0"));
    }
    if cfg.upstream.max_concurrency == 0 {
        return Err(ConfigError::Invalid("upstream.max_concurrency must be > 0"));
    }
    let retry = &cfg.upstream.retry;
    if retry.max_attempts == 0 {
        return Err(ConfigError::Invalid("upstream.retry.max_attempts must be > 0"));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(ConfigError::Invalid(
            "upstream.retry.max_delay_ms must be >= base_delay_ms",
        ));
    }

    if cfg.cache.status_ttl_secs == 0 {
        return Err(ConfigError::Invalid("cache.status_ttl_secs must be > 0"));
    }
    if cfg.cache.status_ttl_secs > MAX_TTL.as_secs() {
        return Err(ConfigError::Invalid("cache.status_ttl_secs must be <= 7 days"));
    }
    if cfg.cache.batch_ttl_secs > MAX_TTL.as_secs() {
        return Err(ConfigError::Invalid("cache.batch_ttl_secs must be <= 7 days"));
    }

    let s = &cfg.scheduler;
    if s.min_interval_secs == 0 {
        return Err(ConfigError::Invalid("scheduler.min_interval_secs must be > 0"));
    }
    if s.default_interval_secs < s.min_interval_secs {
        return Err(ConfigError::Invalid(
            "scheduler.default_interval_secs must be >= min_interval_secs",
        ));
    }
    if s.default_interval_secs > MAX_INTERVAL.as_secs() {
        return Err(ConfigError::Invalid(
            "scheduler.default_interval_secs must be <= 366 days",
        ));
    }
    if s.max_backoff_secs > MAX_INTERVAL.as_secs() {
        return Err(ConfigError::Invalid("scheduler.max_backoff_secs must be <= 366 days"));
    }
    if s.max_backoff_secs < s.default_interval_secs {
        return Err(ConfigError::Invalid(
            "scheduler.max_backoff_secs must be >= default_interval_secs",
        ));
    }
    if s.workers == 0 {
        return Err(ConfigError::Invalid("scheduler.workers must be > 0"));
    }
    if s.sweep_interval_secs == 0 {
        return Err(ConfigError::Invalid("scheduler.sweep_interval_secs must be > 0"));
    }

    let n = &cfg.notify;
    if n.telegram.enabled && n.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "notify.telegram.bot_token must be non-empty when enabled",
        ));
    }
    if n.webhook.enabled && n.webhook.url.trim().is_empty() {
        return Err(ConfigError::Invalid("notify.webhook.url must be non-empty when enabled"));
    }

    Ok(())
}

/// Returns a complete, valid example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  max_connections: 5

upstream:
  base_url: "http://localhost:8080/api/"
  timeout_ms: 5000
  max_concurrency: 8
  retry:
    max_attempts: 3
    base_delay_ms: 500
    max_delay_ms: 8000

cache:
  status_ttl_secs: 300
  batch_ttl_secs: 60

scheduler:
  default_interval_secs: 1800
  min_interval_secs: 60
  max_backoff_secs: 21600
  workers: 4
  sweep_interval_secs: 600
  history_retention_days: 90

notify:
  telegram:
    enabled: true
    bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  webhook:
    enabled: false
    url: ""
  in_app:
    enabled: true
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    fn invalid_msg(cfg: &Config) -> &'static str {
        match validate(cfg).unwrap_err() {
            ConfigError::Invalid(msg) => msg,
            other => panic!("wrong error: {other}"),
        }
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.upstream.retry, RetryPolicy::default());
    }

    #[test]
    fn telegram_token_required_only_when_enabled() {
        let mut cfg = example_cfg();
        cfg.notify.telegram.bot_token = "".into();
        assert!(invalid_msg(&cfg).contains("telegram.bot_token"));

        cfg.notify.telegram.enabled = false;
        validate(&cfg).unwrap();
    }

    #[test]
    fn webhook_url_required_when_enabled() {
        let mut cfg = example_cfg();
        cfg.notify.webhook.enabled = true;
        assert!(invalid_msg(&cfg).contains("webhook.url"));
    }

    #[test]
    fn interval_bounds() {
        let mut cfg = example_cfg();
        cfg.scheduler.default_interval_secs = 30;
        assert!(invalid_msg(&cfg).contains("default_interval_secs"));

        let mut cfg = example_cfg();
        cfg.scheduler.max_backoff_secs = 60;
        assert!(invalid_msg(&cfg).contains("max_backoff_secs"));

        let mut cfg = example_cfg();
        cfg.scheduler.default_interval_secs = u64::MAX / 2;
        cfg.scheduler.max_backoff_secs = u64::MAX;
        assert!(invalid_msg(&cfg).contains("default_interval_secs"));

        let mut cfg = example_cfg();
        cfg.scheduler.workers = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn cache_ttls_are_bounded() {
        let mut cfg = example_cfg();
        cfg.cache.status_ttl_secs = u64::MAX;
        assert!(invalid_msg(&cfg).contains("status_ttl_secs"));

        let mut cfg = example_cfg();
        cfg.cache.batch_ttl_secs = 30 * 86_400;
        assert!(invalid_msg(&cfg).contains("batch_ttl_secs"));

        let mut cfg = example_cfg();
        cfg.cache.status_ttl_secs = 7 * 86_400;
        validate(&cfg).unwrap();
    }

    #[test]
    fn retry_curve_must_be_ordered() {
        let mut cfg = example_cfg();
        cfg.upstream.retry.max_delay_ms = 10;
        assert!(invalid_msg(&cfg).contains("max_delay_ms"));
    }

    #[test]
    fn retry_section_is_optional() {
        let yaml = example().replace(
            "  retry:\n    max_attempts: 3\n    base_delay_ms: 500\n    max_delay_ms: 8000\n",
            "",
        );
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg.upstream.retry, RetryPolicy::default());
    }

    #[test]
    fn tracker_settings_conversion() {
        let settings = example_cfg().tracker_settings();
        assert_eq!(settings.default_interval, Duration::from_secs(1800));
        assert_eq!(settings.fetcher.status_ttl, Duration::from_secs(300));
        assert_eq!(
            settings.scheduler.history_retention,
            Some(Duration::from_secs(90 * 86_400))
        );

        let mut cfg = example_cfg();
        cfg.scheduler.history_retention_days = 0;
        assert_eq!(cfg.tracker_settings().scheduler.history_retention, None);
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.scheduler.workers, 4);
        assert!(cfg.notify.in_app.enabled);
    }
}
