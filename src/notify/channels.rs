use super::{Delivery, Notice, NotificationChannel};
use crate::model::ChannelKind;
use anyhow::{anyhow, Context, Result};
use reqwest::{Client, Url};
use std::fmt;
use std::time::Duration;
use teloxide::prelude::*;
use tokio::sync::broadcast;
use tracing::debug;

/// Push to the owner's Telegram chat. The record owner reference is the
/// numeric chat id.
#[derive(Clone)]
pub struct TelegramChannel {
    bot: Bot,
}

impl fmt::Debug for TelegramChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramChannel").finish_non_exhaustive()
    }
}

impl TelegramChannel {
    pub fn new(bot_token: String) -> Self {
        Self {
            bot: Bot::new(bot_token),
        }
    }
}

#[async_trait::async_trait]
impl NotificationChannel for TelegramChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn send(&self, notice: &Notice) -> Result<Delivery> {
        let Ok(chat_id) = notice.owner_ref.trim().parse::<i64>() else {
            return Ok(Delivery::Skipped(format!(
                "owner {:?} is not a telegram chat id",
                notice.owner_ref
            )));
        };
        self.bot
            .send_message(ChatId(chat_id), notice.headline())
            .await
            .context("telegram send_message failed")?;
        Ok(Delivery::Delivered)
    }
}

/// POST the notice as JSON to a fixed endpoint.
#[derive(Clone)]
pub struct WebhookChannel {
    http: Client,
    url: Url,
}

impl fmt::Debug for WebhookChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookChannel")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl WebhookChannel {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url).context("invalid webhook url")?;
        let http = Client::builder()
            .user_agent("pnr-tracker/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build webhook client")?;
        Ok(Self { http, url })
    }
}

#[async_trait::async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn send(&self, notice: &Notice) -> Result<Delivery> {
        let res = self
            .http
            .post(self.url.clone())
            .json(notice)
            .send()
            .await
            .context("failed to reach webhook")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("webhook error {}: {}", status, body));
        }
        Ok(Delivery::Delivered)
    }
}

/// In-process feed for the API layer (e.g. a websocket bridge).
#[derive(Debug, Clone)]
pub struct InAppChannel {
    tx: broadcast::Sender<Notice>,
}

impl InAppChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}

#[async_trait::async_trait]
impl NotificationChannel for InAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    async fn send(&self, notice: &Notice) -> Result<Delivery> {
        match self.tx.send(notice.clone()) {
            Ok(receivers) => {
                debug!(receivers, record_id = %notice.record_id, "in-app notice published");
                Ok(Delivery::Delivered)
            }
            Err(_) => Ok(Delivery::Skipped("no in-app subscribers".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Transition;
    use chrono::{NaiveDate, Utc};

    fn notice(owner: &str) -> Notice {
        Notice {
            history_id: 7,
            record_id: "4512345678".into(),
            owner_ref: owner.into(),
            origin: "NDLS".into(),
            destination: "BCT".into(),
            travel_date: NaiveDate::from_ymd_opt(2026, 12, 24).unwrap(),
            transition: Transition::FirstSeen {
                status: "WL/12".into(),
            },
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_app_skips_without_subscribers() {
        let channel = InAppChannel::new(8);
        assert_eq!(
            channel.send(&notice("1001")).await.unwrap(),
            Delivery::Skipped("no in-app subscribers".into())
        );

        let mut rx = channel.subscribe();
        assert_eq!(channel.send(&notice("1001")).await.unwrap(), Delivery::Delivered);
        assert_eq!(rx.recv().await.unwrap().history_id, 7);
    }

    #[tokio::test]
    async fn telegram_skips_non_numeric_owner() {
        let channel = TelegramChannel::new("123:TEST".into());
        let delivery = channel.send(&notice("alice@example.com")).await.unwrap();
        assert!(matches!(delivery, Delivery::Skipped(_)));
    }
}
