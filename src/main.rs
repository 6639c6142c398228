use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use pnr_tracker::cache::LocalBackend;
use pnr_tracker::config::{self, Config};
use pnr_tracker::db;
use pnr_tracker::model::{ChannelKind, NewTrackedRecord};
use pnr_tracker::notify::{InAppChannel, NotificationChannel, TelegramChannel, WebhookChannel};
use pnr_tracker::store::SqliteStore;
use pnr_tracker::upstream::HttpStatusSource;
use pnr_tracker::Tracker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Track PNR status changes and notify owners")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background scheduler until Ctrl-C
    Run,
    /// Register a record for tracking
    Track {
        record_id: String,
        #[arg(long)]
        origin: String,
        #[arg(long)]
        destination: String,
        /// Travel date, YYYY-MM-DD
        #[arg(long)]
        date: NaiveDate,
        /// Owner reference (Telegram chat id for Telegram delivery)
        #[arg(long)]
        owner: String,
        /// Check interval in seconds; defaults to scheduler.default_interval_secs
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Stop tracking a record
    Untrack { record_id: String },
    /// Check one or more records now and print the outcome as JSON
    Check {
        #[arg(required = true)]
        record_ids: Vec<String>,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    /// Print a record's status history, newest first
    History { record_id: String },
    /// Print an example config file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;
    let tracker = build_tracker(&cfg).await?;

    match args.command {
        Command::Run => {
            tracker.start().await?;
            info!("tracker running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            tracker.stop().await;
        }
        Command::Track {
            record_id,
            origin,
            destination,
            date,
            owner,
            interval_secs,
        } => {
            let record = NewTrackedRecord {
                record_id,
                origin,
                destination,
                travel_date: date,
                owner_ref: owner,
            };
            let tracked = tracker
                .register_tracking(record, interval_secs.map(Duration::from_secs))
                .await?;
            print_json(&tracked)?;
        }
        Command::Untrack { record_id } => {
            let removed = tracker.cancel_tracking(&record_id).await?;
            print_json(&serde_json::json!({ "record_id": record_id, "removed": removed }))?;
        }
        Command::Check {
            record_ids,
            concurrency,
        } => {
            if let [record_id] = record_ids.as_slice() {
                print_json(&tracker.check_now(record_id).await?)?;
            } else {
                print_json(&tracker.check_all(&record_ids, concurrency).await?)?;
            }
        }
        Command::History { record_id } => {
            print_json(&tracker.get_history(&record_id).await?)?;
        }
        Command::ExampleConfig => unreachable!("handled before loading config"),
    }

    Ok(())
}

async fn build_tracker(cfg: &Config) -> Result<Tracker> {
    let pool = db::init_pool(&cfg.database_url(), cfg.app.max_connections).await?;
    db::run_migrations(&pool).await?;

    let source = HttpStatusSource::new(&cfg.upstream.base_url, cfg.upstream_timeout())?;
    let (channels, disabled) = build_channels(cfg)?;
    Ok(Tracker::new(
        cfg.tracker_settings(),
        Arc::new(SqliteStore::new(pool)),
        Arc::new(source),
        Arc::new(LocalBackend::new()),
        channels,
        disabled,
    ))
}

fn build_channels(cfg: &Config) -> Result<(Vec<Arc<dyn NotificationChannel>>, Vec<ChannelKind>)> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    let mut disabled = Vec::new();
    let n = &cfg.notify;

    if n.telegram.enabled {
        channels.push(Arc::new(TelegramChannel::new(n.telegram.bot_token.clone())));
    } else {
        disabled.push(ChannelKind::Telegram);
    }
    if n.webhook.enabled {
        channels.push(Arc::new(WebhookChannel::new(
            &n.webhook.url,
            cfg.upstream_timeout(),
        )?));
    } else {
        disabled.push(ChannelKind::Webhook);
    }
    if n.in_app.enabled {
        channels.push(Arc::new(InAppChannel::new(256)));
    } else {
        disabled.push(ChannelKind::InApp);
    }
    Ok((channels, disabled))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
