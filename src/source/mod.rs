pub mod explorer;
pub mod rpc;

#[cfg(test)]
pub(crate) mod fake;

pub use explorer::ExplorerClient;
pub use rpc::RpcClient;

use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy_primitives::Address;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, WatchError};
use crate::events::{Transfer as TransferEvent, decimalsCall, symbolCall};
use crate::models::{RawEvent, TokenLog, TokenMetadata};

/// Where candidate transfers come from. Implementations bound every call with a
/// timeout and never retry; `from_block > to_block` yields an empty result.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn latest_block(&self) -> Result<u64>;

    /// ERC-20 Transfer logs with `address` as sender or recipient.
    async fn fetch_token_transfers(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>>;

    /// Native-currency transactions with `address` as sender or recipient.
    async fn fetch_native_transfers(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>>;

    async fn token_metadata(&self, token: Address) -> Result<TokenMetadata>;
}

#[async_trait]
impl<T: ChainSource + ?Sized> ChainSource for Arc<T> {
    async fn latest_block(&self) -> Result<u64> {
        (**self).latest_block().await
    }

    async fn fetch_token_transfers(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>> {
        (**self)
            .fetch_token_transfers(address, from_block, to_block)
            .await
    }

    async fn fetch_native_transfers(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>> {
        (**self)
            .fetch_native_transfers(address, from_block, to_block)
            .await
    }

    async fn token_metadata(&self, token: Address) -> Result<TokenMetadata> {
        (**self).token_metadata(token).await
    }
}

/// Token logs come from the node, native transactions from the explorer.
#[derive(Clone)]
pub struct ChainClient {
    rpc: RpcClient,
    explorer: ExplorerClient,
}

impl ChainClient {
    pub fn new(rpc: RpcClient, explorer: ExplorerClient) -> Self {
        Self { rpc, explorer }
    }
}

#[async_trait]
impl ChainSource for ChainClient {
    async fn latest_block(&self) -> Result<u64> {
        self.rpc.get_latest_block().await
    }

    async fn fetch_token_transfers(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>> {
        if from_block > to_block {
            return Ok(Vec::new());
        }

        let topic = address.into_word();
        let sent = Filter::new()
            .event_signature(TransferEvent::SIGNATURE_HASH)
            .topic1(topic);
        let received = Filter::new()
            .event_signature(TransferEvent::SIGNATURE_HASH)
            .topic2(topic);

        let (sent_logs, received_logs) = futures::future::try_join(
            self.rpc.get_logs(&sent, from_block, to_block),
            self.rpc.get_logs(&received, from_block, to_block),
        )
        .await?;

        let events = merge_token_logs(sent_logs.into_iter().chain(received_logs));
        debug!(
            "Node returned {} token log(s) for {:?} in blocks {}-{}",
            events.len(),
            address,
            from_block,
            to_block
        );
        Ok(events)
    }

    async fn fetch_native_transfers(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>> {
        self.explorer
            .get_transactions(address, from_block, to_block)
            .await
    }

    async fn token_metadata(&self, token: Address) -> Result<TokenMetadata> {
        debug!("Fetching token metadata for {:?}", token);

        let symbol = optional_field(self.rpc.call_contract(token, symbolCall {}).await, "symbol")?;
        let decimals = optional_field(
            self.rpc.call_contract(token, decimalsCall {}).await,
            "decimals",
        )?;

        Ok(TokenMetadata {
            symbol,
            decimals,
        })
    }
}

/// A contract that does not implement an optional ERC-20 getter leaves the
/// field empty; an unreachable node is still an error.
fn optional_field<T>(result: Result<T>, field: &str) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(WatchError::Classification(reason)) => {
            warn!("Failed to fetch token {}: {}", field, reason);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Deduplicates by (tx hash, log index), orders by (block, log index) and drops
/// logs that cannot be identified.
fn merge_token_logs(logs: impl IntoIterator<Item = Log>) -> Vec<RawEvent> {
    let mut seen = HashSet::new();
    let mut merged: Vec<TokenLog> = Vec::new();

    for log in logs {
        if log.removed {
            continue;
        }
        let (Some(transaction_hash), Some(log_index), Some(block_number)) =
            (log.transaction_hash, log.log_index, log.block_number)
        else {
            warn!("Dropping log without transaction hash, index or block: {:?}", log);
            continue;
        };
        if !seen.insert((transaction_hash, log_index)) {
            continue;
        }

        merged.push(TokenLog {
            contract: log.address(),
            transaction_hash,
            log_index,
            block_number,
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
        });
    }

    merged.sort_by_key(|log| (log.block_number, log.log_index));
    merged.into_iter().map(RawEvent::Token).collect()
}
