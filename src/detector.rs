use alloy_primitives::{Address, U256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cursor::CursorStore;
use crate::error::{Result, WatchError};
use crate::events::{decode_transfer_event, is_erc20_transfer};
use crate::models::{
    Direction, EventId, NATIVE_DECIMALS, NativeTx, RawEvent, TokenLog, Transfer, TransferKind,
    display_address, format_amount,
};
use crate::source::ChainSource;
use crate::watchlist::WatchList;

/// What to report when both sides of a transfer are watched wallets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InternalTransferPolicy {
    /// Each wallet gets its own notification: `Sent` for the sender, `Received` for the recipient.
    #[default]
    Both,
    SenderOnly,
    Skip,
}

impl FromStr for InternalTransferPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "both" => Ok(InternalTransferPolicy::Both),
            "sender" | "sender-only" | "sender_only" => Ok(InternalTransferPolicy::SenderOnly),
            "skip" | "none" => Ok(InternalTransferPolicy::Skip),
            other => Err(format!(
                "unknown internal transfer policy '{other}', expected both, sender or skip"
            )),
        }
    }
}

impl fmt::Display for InternalTransferPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InternalTransferPolicy::Both => f.write_str("both"),
            InternalTransferPolicy::SenderOnly => f.write_str("sender"),
            InternalTransferPolicy::Skip => f.write_str("skip"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub native_symbol: String,
    pub confirmations: u64,
    pub overlap_blocks: u64,
    pub internal_transfers: InternalTransferPolicy,
    pub notify_zero_value: bool,
    pub max_event_attempts: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            native_symbol: "ETH".to_string(),
            confirmations: 1,
            overlap_blocks: 5,
            internal_transfers: InternalTransferPolicy::Both,
            notify_zero_value: false,
            max_event_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct TokenInfo {
    symbol: String,
    decimals: u8,
}

enum Verdict {
    Notify(Transfer),
    Skip(&'static str),
}

/// Outcome of classifying one fetched batch, applied to the cursor only once
/// the whole poll has finished.
struct Staged {
    kind: TransferKind,
    transfers: Vec<Transfer>,
    seen: Vec<(EventId, u64)>,
    failed: Vec<EventId>,
    hold_at: Option<u64>,
}

impl Staged {
    fn new(kind: TransferKind) -> Self {
        Self {
            kind,
            transfers: Vec::new(),
            seen: Vec::new(),
            failed: Vec::new(),
            hold_at: None,
        }
    }

    fn hold(&mut self, block: u64) {
        self.hold_at = Some(self.hold_at.map_or(block, |held| held.min(block)));
    }
}

/// Turns raw chain events into attributed, deduplicated transfers.
///
/// Each watched address has an independent cursor and seen-set per
/// [`TransferKind`]. The first poll of an address only seeds its cursors at the
/// current head, so history before startup is never reported. A cursor moves
/// forward only past events that were classified (or deliberately skipped);
/// an event that fails classification pins it so the next poll fetches it
/// again.
pub struct TransferDetector<S> {
    source: S,
    watchlist: Arc<WatchList>,
    settings: DetectorSettings,
    cursors: CursorStore,
    tokens: HashMap<Address, TokenInfo>,
}

impl<S: ChainSource> TransferDetector<S> {
    pub fn new(source: S, watchlist: Arc<WatchList>, settings: DetectorSettings) -> Self {
        Self {
            source,
            watchlist,
            settings,
            cursors: CursorStore::new(),
            tokens: HashMap::new(),
        }
    }

    pub fn cursor(&self, address: Address, kind: TransferKind) -> Option<u64> {
        self.cursors.last_processed(address, kind)
    }

    /// Fetches and classifies everything new for `address` since its cursors.
    ///
    /// A fetch failure returns `SourceUnavailable` and leaves every cursor and
    /// seen-set exactly as it was.
    pub async fn poll(&mut self, address: Address) -> Result<Vec<Transfer>> {
        let latest = self.source.latest_block().await?;
        let head = latest.saturating_sub(self.settings.confirmations);

        let native_from = self.fetch_start(address, TransferKind::Native, head);
        let token_from = self.fetch_start(address, TransferKind::Token, head);

        let source = &self.source;
        let (native_events, token_events) = futures::future::try_join(
            async move {
                match native_from {
                    Some(from) => source.fetch_native_transfers(address, from, head).await,
                    None => Ok(Vec::new()),
                }
            },
            async move {
                match token_from {
                    Some(from) => source.fetch_token_transfers(address, from, head).await,
                    None => Ok(Vec::new()),
                }
            },
        )
        .await?;

        let native = self
            .classify_batch(address, TransferKind::Native, native_events)
            .await;
        let token = self
            .classify_batch(address, TransferKind::Token, token_events)
            .await;

        let mut transfers = self.commit(address, native, head);
        transfers.extend(self.commit(address, token, head));

        if !transfers.is_empty() {
            info!(
                "Detected {} new transfer(s) for {:?} up to block {}",
                transfers.len(),
                address,
                head
            );
        }
        Ok(transfers)
    }

    fn fetch_start(&mut self, address: Address, kind: TransferKind, head: u64) -> Option<u64> {
        let overlap = self.settings.overlap_blocks;
        let cursor = self.cursors.get_mut(address, kind);

        match cursor.last_processed() {
            None => {
                cursor.seed(head);
                info!("Seeded {} cursor for {:?} at block {}", kind, address, head);
                None
            }
            Some(last) if last >= head => None,
            Some(last) => Some(last.saturating_sub(overlap) + 1),
        }
    }

    async fn classify_batch(
        &mut self,
        address: Address,
        kind: TransferKind,
        events: Vec<RawEvent>,
    ) -> Staged {
        let mut staged = Staged::new(kind);
        let mut handled = HashSet::new();

        for event in events {
            let id = event.id();
            let block = event.block_number();
            if !handled.insert(id) {
                continue;
            }

            let (seen, stale, failures) = match self.cursors.get(address, kind) {
                Some(cursor) => (cursor.is_seen(&id), cursor.is_stale(block), cursor.failures(&id)),
                None => (false, false, 0),
            };
            if seen || stale {
                debug!("Skipping already handled {} event {:?}", kind, id);
                continue;
            }

            match self.classify(address, &event).await {
                Ok(Verdict::Notify(transfer)) => {
                    staged.seen.push((id, block));
                    staged.transfers.push(transfer);
                }
                Ok(Verdict::Skip(reason)) => {
                    debug!("Ignoring {} event {:?} for {:?}: {}", kind, id, address, reason);
                    staged.seen.push((id, block));
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Cannot classify {} event {:?} at block {} yet: {}",
                        kind, id, block, e
                    );
                    staged.hold(block);
                }
                Err(e) => {
                    let attempts = failures + 1;
                    if attempts >= self.settings.max_event_attempts {
                        error!(
                            "Giving up on {} event {:?} at block {} after {} attempt(s): {}",
                            kind, id, block, attempts, e
                        );
                        staged.seen.push((id, block));
                    } else {
                        warn!(
                            "Failed to classify {} event {:?} at block {} (attempt {}): {}",
                            kind, id, block, attempts, e
                        );
                        staged.failed.push(id);
                        staged.hold(block);
                    }
                }
            }
        }

        staged
    }

    fn commit(&mut self, address: Address, staged: Staged, head: u64) -> Vec<Transfer> {
        let cursor = self.cursors.get_mut(address, staged.kind);
        for (id, block) in staged.seen {
            cursor.mark_seen(id, block);
        }
        for id in staged.failed {
            cursor.record_failure(id);
        }

        let target = match staged.hold_at {
            Some(block) => block.saturating_sub(1).min(head),
            None => head,
        };
        cursor.advance(target);

        staged.transfers
    }

    async fn classify(&mut self, watched: Address, event: &RawEvent) -> Result<Verdict> {
        match event {
            RawEvent::Token(log) => self.classify_token(watched, log).await,
            RawEvent::Native(tx) => self.classify_native(watched, tx),
        }
    }

    async fn classify_token(&mut self, watched: Address, log: &TokenLog) -> Result<Verdict> {
        if !is_erc20_transfer(&log.topics) {
            return Ok(Verdict::Skip("not an ERC-20 Transfer log"));
        }

        let decoded = decode_transfer_event(&log.topics, &log.data).map_err(|e| {
            WatchError::Classification(format!(
                "undecodable Transfer log {:?}#{}: {}",
                log.transaction_hash, log.log_index, e
            ))
        })?;

        let direction = match self.attribute(watched, decoded.from, decoded.to, decoded.value) {
            Ok(direction) => direction,
            Err(reason) => return Ok(Verdict::Skip(reason)),
        };

        let token = self.token_info(log.contract).await?;
        let amount = format_amount(decoded.value, token.decimals)?;

        Ok(Verdict::Notify(Transfer {
            kind: TransferKind::Token,
            direction,
            watched,
            from: decoded.from,
            to: decoded.to,
            value: decoded.value,
            decimals: token.decimals,
            amount,
            symbol: token.symbol,
            contract: Some(log.contract),
            transaction_hash: log.transaction_hash,
            block_number: log.block_number,
        }))
    }

    fn classify_native(&self, watched: Address, tx: &NativeTx) -> Result<Verdict> {
        if tx.is_error {
            return Ok(Verdict::Skip("reverted transaction"));
        }

        let from = parse_field(&tx.from, "from", tx)?;
        // contract creations have no `to`; the value lands in the new contract
        let to = if tx.to.is_empty() {
            parse_field(&tx.contract_address, "contractAddress", tx)?
        } else {
            parse_field(&tx.to, "to", tx)?
        };
        if tx.value.is_empty() {
            return Err(WatchError::Classification(format!(
                "transaction {:?} has no value",
                tx.transaction_hash
            )));
        }
        let value = U256::from_str(&tx.value).map_err(|e| {
            WatchError::Classification(format!(
                "transaction {:?} has invalid value '{}': {}",
                tx.transaction_hash, tx.value, e
            ))
        })?;

        let direction = match self.attribute(watched, from, to, value) {
            Ok(direction) => direction,
            Err(reason) => return Ok(Verdict::Skip(reason)),
        };

        Ok(Verdict::Notify(Transfer {
            kind: TransferKind::Native,
            direction,
            watched,
            from,
            to,
            value,
            decimals: NATIVE_DECIMALS,
            amount: format_amount(value, NATIVE_DECIMALS)?,
            symbol: self.settings.native_symbol.clone(),
            contract: None,
            transaction_hash: tx.transaction_hash,
            block_number: tx.block_number,
        }))
    }

    /// Direction relative to `watched`, or the reason the transfer is not reported.
    /// Applied identically to both transfer kinds.
    fn attribute(
        &self,
        watched: Address,
        from: Address,
        to: Address,
        value: U256,
    ) -> std::result::Result<Direction, &'static str> {
        let direction = if from == watched {
            Direction::Sent
        } else if to == watched {
            Direction::Received
        } else {
            warn!(
                "Transfer {:?} -> {:?} does not involve watched address {:?}",
                from, to, watched
            );
            return Err("watched address on neither side");
        };

        if value.is_zero() && !self.settings.notify_zero_value {
            return Err("zero value");
        }

        let counterparty = if direction == Direction::Sent { to } else { from };
        if counterparty != watched && self.watchlist.contains(&counterparty) {
            match (self.settings.internal_transfers, direction) {
                (InternalTransferPolicy::Both, _) => {}
                (InternalTransferPolicy::SenderOnly, Direction::Sent) => {}
                (InternalTransferPolicy::SenderOnly, Direction::Received) => {
                    return Err("internal transfer, reported by the sender");
                }
                (InternalTransferPolicy::Skip, _) => {
                    return Err("internal transfer between watched wallets");
                }
            }
        }

        Ok(direction)
    }

    /// Read-through cache of token symbol and decimals. Metadata without
    /// decimals is not cached so the lookup is retried.
    async fn token_info(&mut self, contract: Address) -> Result<TokenInfo> {
        if let Some(info) = self.tokens.get(&contract) {
            return Ok(info.clone());
        }

        let metadata = self.source.token_metadata(contract).await?;
        let decimals = metadata.decimals.ok_or_else(|| {
            WatchError::Classification(format!("token {contract:?} does not report decimals"))
        })?;
        let symbol = metadata
            .symbol
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| display_address(&contract));

        info!(
            "Cached token {:?}: {} with {} decimals",
            contract, symbol, decimals
        );
        let info = TokenInfo { symbol, decimals };
        self.tokens.insert(contract, info.clone());
        Ok(info)
    }
}

fn parse_field(raw: &str, field: &str, tx: &NativeTx) -> Result<Address> {
    Address::from_str(raw).map_err(|_| {
        WatchError::Classification(format!(
            "transaction {:?} has invalid {} address '{}'",
            tx.transaction_hash, field, raw
        ))
    })
}
