use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, WatchError};
use crate::models::{Transfer, display_address};
use crate::watchlist::WatchedEntry;

/// `<nickname> (<watched>) <sent|received> <amount> <symbol> <to|from> <counterparty>`
pub fn format_message(transfer: &Transfer, entry: &WatchedEntry) -> String {
    format!(
        "{} ({}) {} {} {} {} {}",
        entry.nickname,
        display_address(&transfer.watched),
        transfer.direction.verb(),
        transfer.amount,
        transfer.symbol,
        transfer.direction.preposition(),
        display_address(&transfer.counterparty()),
    )
}

/// A single outbound text channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;

    /// Fire-and-forget: a delivery failure is logged and swallowed.
    async fn notify(&self, transfer: &Transfer, entry: &WatchedEntry) -> bool {
        let message = format_message(transfer, entry);
        match self.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Dropping notification for {:?} tx {:?}: {}",
                    transfer.watched, transfer.transaction_hash, e
                );
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

pub struct TelegramNotifier {
    client: Client,
    api_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(api_url: &str, bot_token: &str, chat_id: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WatchError::Config(format!("cannot build Telegram HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            // the URL embeds the bot token; keep it out of logs
            .map_err(|e| WatchError::Delivery(format!("Telegram request failed: {}", e.without_url())))?;

        let status = response.status();
        let body: Option<TelegramResponse> = response.json().await.ok();
        match body {
            Some(TelegramResponse { ok: true, .. }) if status.is_success() => {
                debug!("Delivered message to chat {}", self.chat_id);
                Ok(())
            }
            Some(TelegramResponse { description, .. }) => Err(WatchError::Delivery(format!(
                "Telegram rejected message (HTTP {}): {}",
                status,
                description.unwrap_or_default()
            ))),
            None => Err(WatchError::Delivery(format!(
                "Telegram returned HTTP {status} with an unreadable body"
            ))),
        }
    }
}

/// Prints messages instead of delivering them; used for dry runs.
#[derive(Debug, Default)]
pub struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        println!("{text}");
        Ok(())
    }
}
