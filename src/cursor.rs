use alloy_primitives::Address;
use std::collections::HashMap;

use crate::models::{EventId, TransferKind};

/// How many blocks behind the cursor seen identities are remembered. Anything
/// older is treated as already handled.
pub const SEEN_RETENTION_BLOCKS: u64 = 10_000;

/// Progress for one (address, kind) pair: the last fully processed block,
/// the identities already handled, and failure counts for events that could
/// not be classified yet.
#[derive(Debug, Default)]
pub struct KindCursor {
    last_processed: Option<u64>,
    seen: HashMap<EventId, u64>,
    failures: HashMap<EventId, u32>,
}

impl KindCursor {
    pub fn last_processed(&self) -> Option<u64> {
        self.last_processed
    }

    pub fn seed(&mut self, block: u64) {
        if self.last_processed.is_none() {
            self.last_processed = Some(block);
        }
    }

    /// Moves forward to `block`; a lower value is ignored.
    pub fn advance(&mut self, block: u64) {
        self.last_processed = Some(self.last_processed.map_or(block, |last| last.max(block)));
        self.prune();
    }

    pub fn is_seen(&self, id: &EventId) -> bool {
        self.seen.contains_key(id)
    }

    /// True when `block` is below the retention window and therefore long done.
    pub fn is_stale(&self, block: u64) -> bool {
        self.retention_floor().is_some_and(|floor| block < floor)
    }

    pub fn mark_seen(&mut self, id: EventId, block: u64) {
        self.failures.remove(&id);
        self.seen.insert(id, block);
    }

    pub fn failures(&self, id: &EventId) -> u32 {
        self.failures.get(id).copied().unwrap_or(0)
    }

    pub fn record_failure(&mut self, id: EventId) -> u32 {
        let count = self.failures.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    fn retention_floor(&self) -> Option<u64> {
        self.last_processed
            .map(|last| last.saturating_sub(SEEN_RETENTION_BLOCKS))
            .filter(|floor| *floor > 0)
    }

    fn prune(&mut self) {
        if let Some(floor) = self.retention_floor() {
            self.seen.retain(|_, block| *block >= floor);
        }
    }
}

/// In-memory cursors, one independent [`KindCursor`] per watched address and
/// transfer kind. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct CursorStore {
    cursors: HashMap<(Address, TransferKind), KindCursor>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: Address, kind: TransferKind) -> Option<&KindCursor> {
        self.cursors.get(&(address, kind))
    }

    pub fn get_mut(&mut self, address: Address, kind: TransferKind) -> &mut KindCursor {
        self.cursors.entry((address, kind)).or_default()
    }

    pub fn last_processed(&self, address: Address, kind: TransferKind) -> Option<u64> {
        self.get(address, kind).and_then(KindCursor::last_processed)
    }
}
