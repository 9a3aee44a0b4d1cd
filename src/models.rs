use alloy_primitives::utils::format_units;
use alloy_primitives::{Address, B256, Bytes, U256, hex};
use std::fmt;

use crate::error::{Result, WatchError};

pub const NATIVE_DECIMALS: u8 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Native,
    Token,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Native => f.write_str("native"),
            TransferKind::Token => f.write_str("token"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn verb(&self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    pub fn preposition(&self) -> &'static str {
        match self {
            Direction::Sent => "to",
            Direction::Received => "from",
        }
    }
}

/// Identity of an on-chain transfer signal. Native transactions have no log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    pub transaction_hash: B256,
    pub log_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLog {
    pub contract: Address,
    pub transaction_hash: B256,
    pub log_index: u64,
    pub block_number: u64,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// An explorer transaction record. Only the identity fields are parsed up front;
/// the rest is left to the detector so a malformed record fails classification
/// instead of the whole fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeTx {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub from: String,
    pub to: String,
    pub contract_address: String,
    pub value: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Token(TokenLog),
    Native(NativeTx),
}

impl RawEvent {
    pub fn id(&self) -> EventId {
        match self {
            RawEvent::Token(log) => EventId {
                transaction_hash: log.transaction_hash,
                log_index: Some(log.log_index),
            },
            RawEvent::Native(tx) => EventId {
                transaction_hash: tx.transaction_hash,
                log_index: None,
            },
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            RawEvent::Token(log) => log.block_number,
            RawEvent::Native(tx) => tx.block_number,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMetadata {
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub kind: TransferKind,
    pub direction: Direction,
    pub watched: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub decimals: u8,
    pub amount: String,
    pub symbol: String,
    pub contract: Option<Address>,
    pub transaction_hash: B256,
    pub block_number: u64,
}

impl Transfer {
    pub fn counterparty(&self) -> Address {
        match self.direction {
            Direction::Sent => self.to,
            Direction::Received => self.from,
        }
    }
}

/// Canonical lowercase `0x`-prefixed form used in every user-facing string.
pub fn display_address(address: &Address) -> String {
    hex::encode_prefixed(address)
}

/// Scales a raw integer amount by `decimals` and prints the shortest decimal
/// with at least one fractional digit.
pub fn format_amount(value: U256, decimals: u8) -> Result<String> {
    let formatted = format_units(value, decimals).map_err(|e| {
        WatchError::Classification(format!("cannot scale {value} by {decimals} decimals: {e}"))
    })?;

    let mut amount = formatted;
    if amount.contains('.') {
        let trimmed = amount.trim_end_matches('0').len();
        amount.truncate(trimmed);
        if amount.ends_with('.') {
            amount.push('0');
        }
    } else {
        amount.push_str(".0");
    }
    Ok(amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_by_token_decimals() {
        let one_ether = U256::from(1_000_000_000_000_000_000u128);
        assert_eq!(format_amount(one_ether, 18).unwrap(), "1.0");
        assert_eq!(format_amount(U256::from(1_500_000u64), 6).unwrap(), "1.5");
        assert_eq!(format_amount(U256::from(1u64), 6).unwrap(), "0.000001");
        assert_eq!(
            format_amount(U256::from(1_234_000_001u64), 6).unwrap(),
            "1234.000001"
        );
    }

    #[test]
    fn zero_and_undivided_amounts_keep_a_fraction() {
        assert_eq!(format_amount(U256::ZERO, 18).unwrap(), "0.0");
        assert_eq!(format_amount(U256::from(1000u64), 0).unwrap(), "1000.0");
    }

    #[test]
    fn large_values_are_exact() {
        // 123456789.123456789123456789 with 18 decimals
        let raw = U256::from(123_456_789_123_456_789_123_456_789u128);
        assert_eq!(
            format_amount(raw, 18).unwrap(),
            "123456789.123456789123456789"
        );
    }

    #[test]
    fn addresses_display_lowercase() {
        let address: Address = "0xAbCdEf0000000000000000000000000000000001".parse().unwrap();
        assert_eq!(
            display_address(&address),
            "0xabcdef0000000000000000000000000000000001"
        );
    }

    #[test]
    fn counterparty_follows_direction() {
        let transfer = Transfer {
            kind: TransferKind::Native,
            direction: Direction::Received,
            watched: Address::repeat_byte(0xaa),
            from: Address::repeat_byte(0xbb),
            to: Address::repeat_byte(0xaa),
            value: U256::from(1u64),
            decimals: 18,
            amount: "0.000000000000000001".to_string(),
            symbol: "ETH".to_string(),
            contract: None,
            transaction_hash: B256::ZERO,
            block_number: 1,
        };
        assert_eq!(transfer.counterparty(), Address::repeat_byte(0xbb));

        let sent = Transfer {
            direction: Direction::Sent,
            ..transfer
        };
        assert_eq!(sent.counterparty(), Address::repeat_byte(0xaa));
    }
}
