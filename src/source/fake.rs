//! In-memory chain used by detector and loop tests.

use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::ChainSource;
use crate::error::{Result, WatchError};
use crate::events::Transfer as TransferEvent;
use crate::models::{NativeTx, RawEvent, TokenLog, TokenMetadata};

struct Stored {
    event: RawEvent,
    parties: [Address; 2],
}

#[derive(Default)]
struct State {
    head: u64,
    events: Vec<Stored>,
    metadata: HashMap<Address, TokenMetadata>,
    unavailable: HashSet<Address>,
    metadata_unavailable: bool,
    ignore_ranges: bool,
    metadata_calls: usize,
    fetches: Vec<(Address, u64, u64)>,
}

#[derive(Default)]
pub(crate) struct FakeChain {
    state: Mutex<State>,
}

impl FakeChain {
    pub fn with_head(head: u64) -> Self {
        let chain = Self::default();
        chain.set_head(head);
        chain
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn set_token(&self, contract: Address, symbol: Option<&str>, decimals: Option<u8>) {
        self.state.lock().unwrap().metadata.insert(
            contract,
            TokenMetadata {
                symbol: symbol.map(str::to_string),
                decimals,
            },
        );
    }

    /// Every fetch involving `address` fails with `SourceUnavailable`.
    pub fn make_unavailable(&self, address: Address) {
        self.state.lock().unwrap().unavailable.insert(address);
    }

    pub fn make_available(&self, address: Address) {
        self.state.lock().unwrap().unavailable.remove(&address);
    }

    pub fn set_metadata_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().metadata_unavailable = unavailable;
    }

    /// Return every matching event regardless of the requested range.
    pub fn ignore_ranges(&self) {
        self.state.lock().unwrap().ignore_ranges = true;
    }

    pub fn metadata_calls(&self) -> usize {
        self.state.lock().unwrap().metadata_calls
    }

    pub fn fetches(&self) -> Vec<(Address, u64, u64)> {
        self.state.lock().unwrap().fetches.clone()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push_token_transfer(
        &self,
        contract: Address,
        from: Address,
        to: Address,
        value: U256,
        block: u64,
        tx: u8,
        log_index: u64,
    ) {
        let topics = vec![TransferEvent::SIGNATURE_HASH, from.into_word(), to.into_word()];
        let data = Bytes::from(value.to_be_bytes::<32>().to_vec());
        self.push_token_log(contract, topics, data, [from, to], block, tx, log_index);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push_token_log(
        &self,
        contract: Address,
        topics: Vec<B256>,
        data: Bytes,
        parties: [Address; 2],
        block: u64,
        tx: u8,
        log_index: u64,
    ) {
        let event = RawEvent::Token(TokenLog {
            contract,
            transaction_hash: B256::repeat_byte(tx),
            log_index,
            block_number: block,
            topics,
            data,
        });
        self.state
            .lock()
            .unwrap()
            .events
            .push(Stored { event, parties });
    }

    pub fn push_native_transfer(&self, from: Address, to: Address, wei: u128, block: u64, tx: u8) {
        self.push_native(
            NativeTx {
                transaction_hash: B256::repeat_byte(tx),
                block_number: block,
                from: format!("{from:?}"),
                to: format!("{to:?}"),
                contract_address: String::new(),
                value: wei.to_string(),
                is_error: false,
            },
            [from, to],
        );
    }

    pub fn push_native(&self, tx: NativeTx, parties: [Address; 2]) {
        self.state.lock().unwrap().events.push(Stored {
            event: RawEvent::Native(tx),
            parties,
        });
    }

    fn fetch(&self, address: Address, from_block: u64, to_block: u64, native: bool) -> Result<Vec<RawEvent>> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable.contains(&address) {
            return Err(WatchError::SourceUnavailable(format!("{address:?} unreachable")));
        }
        state.fetches.push((address, from_block, to_block));
        if from_block > to_block && !state.ignore_ranges {
            return Ok(Vec::new());
        }

        let ignore_ranges = state.ignore_ranges;
        Ok(state
            .events
            .iter()
            .filter(|s| matches!(s.event, RawEvent::Native(_)) == native)
            .filter(|s| s.parties.contains(&address))
            .filter(|s| {
                ignore_ranges
                    || (from_block..=to_block).contains(&s.event.block_number())
            })
            .map(|s| s.event.clone())
            .collect())
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn latest_block(&self) -> Result<u64> {
        Ok(self.state.lock().unwrap().head)
    }

    async fn fetch_token_transfers(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>> {
        self.fetch(address, from_block, to_block, false)
    }

    async fn fetch_native_transfers(
        &self,
        address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>> {
        self.fetch(address, from_block, to_block, true)
    }

    async fn token_metadata(&self, token: Address) -> Result<TokenMetadata> {
        let mut state = self.state.lock().unwrap();
        state.metadata_calls += 1;
        if state.metadata_unavailable {
            return Err(WatchError::SourceUnavailable("metadata call timed out".into()));
        }
        Ok(state.metadata.get(&token).cloned().unwrap_or_default())
    }
}
