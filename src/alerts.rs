//! One-shot alert delivery. Alerting never retries internally; a failed
//! send is logged and dropped.

use async_trait::async_trait;
use serde_json::json;
use std::fmt::Debug;
use tracing::warn;

/// Channels an alert can be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertChannel {
    /// Telegram bot message.
    Telegram,
}

/// Alert sink seam.
#[async_trait]
pub trait Alerts: Debug + Send + Sync {
    /// Sends `text` to the given channels, best effort.
    async fn send_message(&self, text: &str, channels: &[AlertChannel]);
}

/// Telegram bot API configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather.
    pub bot_token: String,
    /// Chat the alerts are posted to.
    pub chat_id: String,
}

impl TelegramConfig {
    /// Whether both fields are present.
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

/// Telegram alert sink.
#[derive(Debug, Clone)]
pub struct TelegramAlerter {
    http: reqwest::Client,
    config: TelegramConfig,
}

impl TelegramAlerter {
    /// Creates a sink posting to the configured chat.
    pub fn new(config: TelegramConfig) -> Self {
        Self { http: reqwest::Client::new(), config }
    }
}

#[async_trait]
impl Alerts for TelegramAlerter {
    async fn send_message(&self, text: &str, channels: &[AlertChannel]) {
        if !channels.contains(&AlertChannel::Telegram) || !self.config.is_configured() {
            return;
        }

        let url =
            format!("https://api.telegram.org/bot{}/sendMessage", self.config.bot_token);
        let body = json!({
            "chat_id": self.config.chat_id,
            "text": text,
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                metrics::counter!("alerts.sent").increment(1);
            }
            Ok(response) => {
                metrics::counter!("alerts.failed").increment(1);
                warn!(status = %response.status(), "telegram alert rejected");
            }
            Err(err) => {
                metrics::counter!("alerts.failed").increment(1);
                warn!(%err, "telegram alert failed");
            }
        }
    }
}

/// Discards alerts. Used in tests and when no channel is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopAlerts;

#[async_trait]
impl Alerts for NoopAlerts {
    async fn send_message(&self, _text: &str, _channels: &[AlertChannel]) {}
}
