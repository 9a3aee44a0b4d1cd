use alloy_primitives::Address;
use csv::{ReaderBuilder, StringRecord, Trim};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{Result, WatchError};

const ADDRESS_COLUMNS: [&str; 2] = ["address", "wallets"];
const NICKNAME_COLUMN: &str = "nickname";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedEntry {
    pub address: Address,
    pub nickname: String,
}

/// Watched wallets in file order. Duplicate addresses are last-write-wins:
/// the later nickname replaces the earlier one in the earlier position.
#[derive(Debug, Clone, Default)]
pub struct WatchList {
    entries: Vec<WatchedEntry>,
    index: HashMap<Address, usize>,
}

impl WatchList {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            WatchError::Config(format!("cannot open watch list {}: {e}", path.display()))
        })?;
        let list = Self::from_reader(file)?;
        info!(
            "Loaded {} watched address(es) from {}",
            list.len(),
            path.display()
        );
        Ok(list)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(reader);

        let headers = reader
            .headers()
            .map_err(|e| WatchError::Config(format!("cannot read watch list header: {e}")))?
            .clone();
        let address_col = find_column(&headers, &ADDRESS_COLUMNS)?;
        let nickname_col = find_column(&headers, &[NICKNAME_COLUMN])?;

        let mut list = WatchList::default();
        for (row, record) in reader.records().enumerate() {
            // header is line 1
            let line = row + 2;
            let record = record
                .map_err(|e| WatchError::Config(format!("watch list line {line}: {e}")))?;

            let raw_address = record.get(address_col).unwrap_or_default();
            if raw_address.is_empty() {
                return Err(WatchError::Config(format!(
                    "watch list line {line}: empty address"
                )));
            }
            let address = Address::from_str(raw_address).map_err(|_| {
                WatchError::Config(format!(
                    "watch list line {line}: invalid address {raw_address}"
                ))
            })?;
            let nickname = record.get(nickname_col).unwrap_or_default().to_string();

            list.insert(WatchedEntry { address, nickname });
        }

        if list.is_empty() {
            return Err(WatchError::Config("watch list is empty".to_string()));
        }
        Ok(list)
    }

    fn insert(&mut self, entry: WatchedEntry) {
        match self.index.get(&entry.address) {
            Some(&position) => {
                let existing = &mut self.entries[position];
                warn!(
                    "Duplicate watch list address {:?}: nickname '{}' replaces '{}'",
                    entry.address, entry.nickname, existing.nickname
                );
                existing.nickname = entry.nickname;
            }
            None => {
                self.index.insert(entry.address, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn entries(&self) -> &[WatchedEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchedEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.index.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<WatchedEntry> for WatchList {
    fn from_iter<I: IntoIterator<Item = WatchedEntry>>(iter: I) -> Self {
        let mut list = WatchList::default();
        for entry in iter {
            list.insert(entry);
        }
        list
    }
}

fn find_column(headers: &StringRecord, names: &[&str]) -> Result<usize> {
    headers
        .iter()
        .position(|header| names.iter().any(|name| header.eq_ignore_ascii_case(name)))
        .ok_or_else(|| {
            WatchError::Config(format!(
                "watch list is missing the '{}' column",
                names[0]
            ))
        })
}
