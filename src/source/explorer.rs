use alloy_primitives::{Address, B256};
use reqwest::Client;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, WatchError};
use crate::models::{NativeTx, RawEvent, display_address};

const NO_TRANSACTIONS: &str = "No transactions found";
const PAGE_SIZE: usize = 10_000;

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    message: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExplorerTx {
    hash: String,
    block_number: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default)]
    contract_address: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    is_error: String,
}

/// Etherscan-compatible `account/txlist` client for native-currency transfers.
#[derive(Clone)]
pub struct ExplorerClient {
    client: Client,
    api_url: String,
    api_key: String,
    chain_id: u64,
}

impl ExplorerClient {
    pub fn new(
        api_url: &str,
        api_key: &str,
        chain_id: u64,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WatchError::Config(format!("cannot build explorer HTTP client: {e}")))?;

        Ok(ExplorerClient {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            chain_id,
        })
    }

    /// Native transactions touching `address` in `[from_block, to_block]`.
    ///
    /// The explorer caps a response at one page. A full page is followed by
    /// another request starting at the last block it reached; that block is
    /// re-read whole so nothing past the cut is lost.
    pub async fn get_transactions(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>> {
        let mut events = Vec::new();
        let mut start = from_block;

        while start <= to_block {
            let (page, full) = self.get_page(address, start, to_block).await?;
            if !full {
                events.extend(page.into_iter().map(RawEvent::Native));
                break;
            }

            let last_block = page.iter().map(|tx| tx.block_number).max().unwrap_or(start);
            if last_block <= start {
                return Err(WatchError::SourceUnavailable(format!(
                    "explorer page for {:?} is filled by block {} alone",
                    address, start
                )));
            }
            debug!(
                "Explorer page for {:?} is full, continuing from block {}",
                address, last_block
            );
            events.extend(
                page.into_iter()
                    .filter(|tx| tx.block_number < last_block)
                    .map(RawEvent::Native),
            );
            start = last_block;
        }

        debug!(
            "Explorer returned {} transaction(s) for {:?} in blocks {}-{}",
            events.len(),
            address,
            from_block,
            to_block
        );
        Ok(events)
    }

    /// One `txlist` page; the flag is set when the page came back full.
    async fn get_page(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<(Vec<NativeTx>, bool)> {
        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("chainid", self.chain_id.to_string()),
                ("module", "account".to_string()),
                ("action", "txlist".to_string()),
                ("address", display_address(&address)),
                ("startblock", from_block.to_string()),
                ("endblock", to_block.to_string()),
                ("page", "1".to_string()),
                ("offset", PAGE_SIZE.to_string()),
                ("sort", "asc".to_string()),
                ("apikey", self.api_key.clone()),
            ])
            .send()
            .await
            // the query string carries the API key
            .map_err(|e| {
                WatchError::SourceUnavailable(format!(
                    "explorer request failed: {}",
                    e.without_url()
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WatchError::SourceUnavailable(format!(
                "explorer returned HTTP {status}"
            )));
        }

        let body: ExplorerResponse = response.json().await.map_err(|e| {
            WatchError::SourceUnavailable(format!(
                "unreadable explorer response: {}",
                e.without_url()
            ))
        })?;

        if body.status != "1" {
            if body.message.starts_with(NO_TRANSACTIONS) {
                return Ok((Vec::new(), false));
            }
            return Err(WatchError::SourceUnavailable(format!(
                "explorer error: {} ({})",
                body.message, body.result
            )));
        }

        let records: Vec<ExplorerTx> = serde_json::from_value(body.result).map_err(|e| {
            WatchError::SourceUnavailable(format!("unexpected explorer result shape: {e}"))
        })?;
        let full = records.len() >= PAGE_SIZE;

        let transactions = records
            .into_iter()
            .filter_map(|record| {
                let tx = to_native_tx(&record);
                if tx.is_none() {
                    warn!(
                        "Dropping explorer record with unreadable hash/block: {} @ {}",
                        record.hash, record.block_number
                    );
                }
                tx
            })
            .collect();

        Ok((transactions, full))
    }
}

fn to_native_tx(record: &ExplorerTx) -> Option<NativeTx> {
    let transaction_hash = B256::from_str(&record.hash).ok()?;
    let block_number = record.block_number.parse().ok()?;

    Some(NativeTx {
        transaction_hash,
        block_number,
        from: record.from.clone(),
        to: record.to.clone(),
        contract_address: record.contract_address.clone(),
        value: record.value.clone(),
        is_error: record.is_error == "1",
    })
}
