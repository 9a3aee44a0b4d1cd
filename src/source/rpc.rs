use alloy::providers::fillers::FillProvider;
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::sol_types::SolCall;
use alloy_primitives::{Address, Bytes};
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Result, WatchError};

type AlloyFullProvider = FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::JoinFill<
            alloy::providers::fillers::GasFiller,
            alloy::providers::fillers::JoinFill<
                alloy::providers::fillers::BlobGasFiller,
                alloy::providers::fillers::JoinFill<
                    alloy::providers::fillers::NonceFiller,
                    alloy::providers::fillers::ChainIdFiller,
                >,
            >,
        >,
    >,
    alloy::providers::RootProvider,
>;

const MAX_RESULTS_ERROR: &str = "exceeds max results";

/// Node JSON-RPC access over one or more HTTP endpoints. Every request is
/// bounded by `request_timeout`; failures rotate to the next endpoint and are
/// reported as [`WatchError::SourceUnavailable`] without retrying.
#[derive(Clone)]
pub struct RpcClient {
    providers: Vec<AlloyFullProvider>,
    urls: Vec<String>,
    current_provider: Arc<AtomicUsize>,
    request_timeout: Duration,
}

impl RpcClient {
    pub fn new(rpc_urls: &[String], request_timeout: Duration) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(WatchError::Config(
                "At least one RPC URL must be provided".to_string(),
            ));
        }

        let mut providers = Vec::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| WatchError::Config(format!("Invalid RPC URL: {url}")))?;
            let provider: AlloyFullProvider = ProviderBuilder::new().connect_http(parsed_url);
            providers.push(provider);
        }

        Ok(RpcClient {
            providers,
            urls: rpc_urls.to_vec(),
            current_provider: Arc::new(AtomicUsize::new(0)),
            request_timeout,
        })
    }

    fn get_provider(&self) -> &AlloyFullProvider {
        let index = self.current_provider.load(Ordering::Relaxed) % self.providers.len();
        &self.providers[index]
    }

    pub fn get_current_url(&self) -> &str {
        let index = self.current_provider.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[index]
    }

    pub fn rotate_provider(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);

        if self.providers.len() > 1 {
            debug!("Rotating to RPC provider #{}", next);
        }
    }

    fn handle_error(&self, error_str: &str) -> WatchError {
        let current_url = self.get_current_url().to_string();
        warn!(
            "RPC error on {}: {}, rotating provider",
            current_url, error_str
        );
        self.rotate_provider();
        WatchError::SourceUnavailable(format!("{current_url}: {error_str}"))
    }

    fn handle_timeout(&self) -> WatchError {
        let current_url = self.get_current_url().to_string();
        warn!(
            "Request timeout after {} seconds on {}, rotating provider",
            self.request_timeout.as_secs(),
            current_url
        );
        self.rotate_provider();
        WatchError::SourceUnavailable(format!(
            "{current_url}: request timeout after {} seconds",
            self.request_timeout.as_secs()
        ))
    }

    pub async fn get_latest_block(&self) -> Result<u64> {
        let provider = self.get_provider();
        match timeout(self.request_timeout, provider.get_block_number()).await {
            Ok(Ok(block_number)) => Ok(block_number),
            Ok(Err(e)) => Err(self.handle_error(&e.to_string())),
            Err(_) => Err(self.handle_timeout()),
        }
    }

    /// Calls a view function. A revert or an undecodable return value is a
    /// [`WatchError::Classification`]; transport trouble is `SourceUnavailable`.
    pub async fn call_contract<C: SolCall>(&self, address: Address, call: C) -> Result<C::Return> {
        let request = TransactionRequest::default()
            .to(address)
            .input(Bytes::from(call.abi_encode()).into());

        let provider = self.get_provider();
        match timeout(self.request_timeout, provider.call(request)).await {
            Ok(Ok(output)) => C::abi_decode_returns(&output).map_err(|e| {
                WatchError::Classification(format!(
                    "cannot decode {} from {:?}: {}",
                    C::SIGNATURE,
                    address,
                    e
                ))
            }),
            Ok(Err(e)) if e.is_error_resp() => Err(WatchError::Classification(format!(
                "{} reverted on {:?}: {}",
                C::SIGNATURE,
                address,
                e
            ))),
            Ok(Err(e)) => Err(self.handle_error(&e.to_string())),
            Err(_) => Err(self.handle_timeout()),
        }
    }

    async fn get_logs_once(&self, filter: &Filter) -> Result<Vec<Log>> {
        let provider = self.get_provider();
        match timeout(self.request_timeout, provider.get_logs(filter)).await {
            Ok(Ok(logs)) => Ok(logs),
            Ok(Err(e)) => {
                let error_str = e.to_string();
                if error_str.contains(MAX_RESULTS_ERROR) {
                    // the range gets split, the endpoint is fine
                    Err(WatchError::SourceUnavailable(error_str))
                } else {
                    Err(self.handle_error(&error_str))
                }
            }
            Err(_) => Err(self.handle_timeout()),
        }
    }

    fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
        let re = Regex::new(r"retry with the range (\d+)-(\d+)").ok()?;
        let captures = re.captures(error_str)?;

        let from = captures.get(1)?.as_str().parse().ok()?;
        let to = captures.get(2)?.as_str().parse().ok()?;

        Some((from, to))
    }

    /// Fetches logs matching `filter` over the inclusive range, following the
    /// node's "retry with the range A-B" hint when a response would be too large.
    pub async fn get_logs(&self, filter: &Filter, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        let mut all_logs = Vec::new();
        let mut current_from = from_block;

        while current_from <= to_block {
            let ranged = filter.clone().from_block(current_from).to_block(to_block);

            match self.get_logs_once(&ranged).await {
                Ok(logs) => {
                    all_logs.extend(logs);
                    break;
                }
                Err(WatchError::SourceUnavailable(error_str))
                    if error_str.contains(MAX_RESULTS_ERROR) =>
                {
                    let Some((suggested_from, suggested_to)) =
                        Self::parse_max_results_error(&error_str)
                    else {
                        return Err(WatchError::SourceUnavailable(error_str));
                    };
                    if suggested_from != current_from || suggested_to < suggested_from {
                        return Err(WatchError::SourceUnavailable(error_str));
                    }

                    info!(
                        "Hit max results limit for blocks {}-{}, splitting at block {}",
                        current_from, to_block, suggested_to
                    );

                    let chunk = filter.clone().from_block(suggested_from).to_block(suggested_to);
                    all_logs.extend(self.get_logs_once(&chunk).await?);
                    current_from = suggested_to + 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(all_logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_split_hint() {
        let message = "query exceeds max results 10000, retry with the range 100-250";
        assert_eq!(RpcClient::parse_max_results_error(message), Some((100, 250)));
        assert_eq!(RpcClient::parse_max_results_error("rate limited"), None);
    }

    #[test]
    fn rejects_empty_or_invalid_urls() {
        let timeout = Duration::from_secs(1);
        assert!(matches!(RpcClient::new(&[], timeout), Err(WatchError::Config(_))));
        assert!(matches!(
            RpcClient::new(&["not a url".to_string()], timeout),
            Err(WatchError::Config(_))
        ));
    }

    #[test]
    fn rotates_between_endpoints() {
        let urls = vec!["http://node-a".to_string(), "http://node-b".to_string()];
        let client = RpcClient::new(&urls, Duration::from_secs(1)).unwrap();

        assert_eq!(client.get_current_url(), "http://node-a");
        client.rotate_provider();
        assert_eq!(client.get_current_url(), "http://node-b");
        client.rotate_provider();
        assert_eq!(client.get_current_url(), "http://node-a");
    }
}
