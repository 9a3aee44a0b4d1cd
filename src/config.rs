use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::detector::{DetectorSettings, InternalTransferPolicy};

const DEFAULT_EXPLORER_API_URL: &str = "https://api.etherscan.io/v2/api";
const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_url: String,
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub json_rpc_urls: Vec<String>,
    pub explorer_api_url: String,
    pub explorer_api_key: String,
    pub explorer_chain_id: u64,
    pub telegram: Option<TelegramConfig>,
    pub watchlist_path: PathBuf,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub confirmations: u64,
    pub overlap_blocks: u64,
    pub native_symbol: String,
    pub internal_transfers: InternalTransferPolicy,
    pub notify_zero_value: bool,
    pub max_event_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let json_rpc_urls: Vec<String> = var("JSON_RPC_URLS")
            .or_else(|| var("JSON_RPC_URL"))
            .context("JSON_RPC_URLS must be set in .env")?
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if json_rpc_urls.is_empty() {
            bail!("JSON_RPC_URLS must contain at least one URL");
        }

        let explorer_api_key =
            var("EXPLORER_API_KEY").context("EXPLORER_API_KEY must be set in .env")?;

        let telegram = match (var("TELEGRAM_BOT_TOKEN"), var("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramConfig {
                api_url: var("TELEGRAM_API_URL")
                    .unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string()),
                bot_token,
                chat_id,
            }),
            (None, None) => None,
            _ => bail!("TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together"),
        };

        let internal_transfers = match var("INTERNAL_TRANSFERS") {
            Some(value) => InternalTransferPolicy::from_str(&value)
                .map_err(|e| anyhow::anyhow!("Invalid INTERNAL_TRANSFERS: {e}"))?,
            None => InternalTransferPolicy::default(),
        };

        let poll_interval_seconds: u64 = parse_or(&var, "POLL_INTERVAL_SECONDS", 60)?;
        if poll_interval_seconds == 0 {
            bail!("POLL_INTERVAL_SECONDS must be greater than zero");
        }
        let request_timeout_seconds: u64 = parse_or(&var, "REQUEST_TIMEOUT_SECONDS", 30)?;
        if request_timeout_seconds == 0 {
            bail!("REQUEST_TIMEOUT_SECONDS must be greater than zero");
        }
        let max_event_attempts: u32 = parse_or(&var, "MAX_EVENT_ATTEMPTS", 5)?;
        if max_event_attempts == 0 {
            bail!("MAX_EVENT_ATTEMPTS must be greater than zero");
        }

        Ok(Config {
            json_rpc_urls,
            explorer_api_url: var("EXPLORER_API_URL")
                .unwrap_or_else(|| DEFAULT_EXPLORER_API_URL.to_string()),
            explorer_api_key,
            explorer_chain_id: parse_or(&var, "EXPLORER_CHAIN_ID", 1)?,
            telegram,
            watchlist_path: var("WATCHLIST_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("wallets.csv")),
            poll_interval: Duration::from_secs(poll_interval_seconds),
            request_timeout: Duration::from_secs(request_timeout_seconds),
            confirmations: parse_or(&var, "CONFIRMATIONS", 1)?,
            overlap_blocks: parse_or(&var, "OVERLAP_BLOCKS", 5)?,
            native_symbol: var("NATIVE_SYMBOL").unwrap_or_else(|| "ETH".to_string()),
            internal_transfers,
            notify_zero_value: parse_or(&var, "NOTIFY_ZERO_VALUE", false)?,
            max_event_attempts,
        })
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            native_symbol: self.native_symbol.clone(),
            confirmations: self.confirmations,
            overlap_blocks: self.overlap_blocks,
            internal_transfers: self.internal_transfers,
            notify_zero_value: self.notify_zero_value,
            max_event_attempts: self.max_event_attempts,
        }
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key} value: {value}")),
        None => Ok(default),
    }
}
