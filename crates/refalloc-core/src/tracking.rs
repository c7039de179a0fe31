//! Ledger of live debug-backend allocations.
//!
//! Each entry is keyed by block address and records the allocation site,
//! size, and how often it has been resized. The ledger is sharded by address
//! behind `parking_lot::Mutex`es so concurrent allocations on different
//! blocks rarely contend.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::header::HEADER_SIZE;
use crate::log::{self, LogLevel, LogRecord};
use crate::registry::builtin;

/// Number of shards for ledger locks (power of 2).
const NUM_SHARDS: usize = 16;

/// Source location attached to a debug allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DebugSite {
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
}

impl DebugSite {
    /// Placeholder for allocations made without site information.
    pub const UNKNOWN: Self = Self::new("<unknown>", 0, "<unknown>");

    #[must_use]
    pub const fn new(file: &'static str, line: u32, function: &'static str) -> Self {
        Self {
            file,
            line,
            function,
        }
    }
}

impl Default for DebugSite {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// [`DebugSite`] for the invocation point.
///
/// The function slot holds the enclosing module path.
#[macro_export]
macro_rules! debug_site {
    () => {
        $crate::tracking::DebugSite::new(file!(), line!(), module_path!())
    };
}

/// One live debug allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedAllocation {
    /// Block address (the header position).
    pub block: usize,
    /// Block size in bytes, header included.
    pub size: usize,
    /// Where the block was last allocated or resized.
    pub site: DebugSite,
    /// Ledger-wide insertion order of the original allocation.
    pub sequence: u64,
    /// Number of successful resizes.
    pub resizes: u32,
    /// Name of the thread that made the allocation, if it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl TrackedAllocation {
    /// Address handed to the caller.
    #[must_use]
    pub fn user_addr(&self) -> usize {
        self.block + HEADER_SIZE
    }

    /// User bytes, header excluded.
    #[must_use]
    pub fn user_size(&self) -> usize {
        self.size.saturating_sub(HEADER_SIZE)
    }
}

/// Summary of everything still live in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub live_count: usize,
    pub live_bytes: usize,
    pub allocations: Vec<TrackedAllocation>,
}

type Shard = HashMap<usize, TrackedAllocation>;

/// Thread-safe ledger of live allocations.
pub struct AllocationLedger {
    shards: Box<[Mutex<Shard>]>,
    next_sequence: AtomicU64,
}

impl AllocationLedger {
    #[must_use]
    pub fn new() -> Self {
        let shards: Vec<Mutex<Shard>> = (0..NUM_SHARDS).map(|_| Mutex::new(Shard::new())).collect();
        Self {
            shards: shards.into_boxed_slice(),
            next_sequence: AtomicU64::new(1),
        }
    }

    fn shard_for(&self, block: usize) -> &Mutex<Shard> {
        // Blocks are at least 8-aligned, skip the always-zero low bits.
        &self.shards[(block >> 4) % NUM_SHARDS]
    }

    /// Record a new allocation.
    pub fn track(&self, block: usize, size: usize, site: DebugSite) {
        let entry = TrackedAllocation {
            block,
            size,
            site,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            resizes: 0,
            thread: std::thread::current().name().map(str::to_owned),
        };
        self.shard_for(block).lock().insert(block, entry);
    }

    /// Remove and return the entry for `block` ahead of a resize.
    pub fn detach(&self, block: usize) -> Option<TrackedAllocation> {
        self.shard_for(block).lock().remove(&block)
    }

    /// Put back an entry taken with [`Self::detach`] after a failed resize.
    pub fn reinsert(&self, entry: TrackedAllocation) {
        self.shard_for(entry.block).lock().insert(entry.block, entry);
    }

    /// Record a successful resize of a detached entry.
    ///
    /// Without a prior entry the block is tracked as a fresh allocation.
    pub fn track_replaced(
        &self,
        prior: Option<TrackedAllocation>,
        block: usize,
        size: usize,
        site: DebugSite,
    ) {
        let Some(prior) = prior else {
            self.track(block, size, site);
            return;
        };
        let entry = TrackedAllocation {
            block,
            size,
            site,
            resizes: prior.resizes.saturating_add(1),
            ..prior
        };
        self.shard_for(block).lock().insert(block, entry);
    }

    /// Forget `block`. Freeing something the ledger never saw is logged.
    pub fn untrack(&self, block: usize) -> Option<TrackedAllocation> {
        let removed = self.shard_for(block).lock().remove(&block);
        if removed.is_none() {
            log::emit(
                LogRecord::new(
                    LogLevel::Error,
                    "untracked_free",
                    "debug block was not in the allocation ledger",
                )
                .with_backend(builtin::DEBUG)
                .with_addr(block),
            );
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, block: usize) -> bool {
        self.shard_for(block).lock().contains_key(&block)
    }

    #[must_use]
    pub fn get(&self, block: usize) -> Option<TrackedAllocation> {
        self.shard_for(block).lock().get(&block).cloned()
    }

    /// All live entries, oldest first.
    #[must_use]
    pub fn live(&self) -> Vec<TrackedAllocation> {
        let mut all: Vec<TrackedAllocation> = self
            .shards
            .iter()
            .flat_map(|shard| shard.lock().values().cloned().collect::<Vec<_>>())
            .collect();
        all.sort_by_key(|entry| entry.sequence);
        all
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().values().map(|e| e.size).sum::<usize>())
            .sum()
    }

    #[must_use]
    pub fn leak_report(&self) -> LeakReport {
        let allocations = self.live();
        LeakReport {
            live_count: allocations.len(),
            live_bytes: allocations.iter().map(|e| e.size).sum(),
            allocations,
        }
    }
}

impl Default for AllocationLedger {
    fn default() -> Self {
        Self::new()
    }
}

static LEDGER: LazyLock<AllocationLedger> = LazyLock::new(AllocationLedger::new);

/// The process-wide ledger used by the debug backend.
#[must_use]
pub fn ledger() -> &'static AllocationLedger {
    &LEDGER
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITE: DebugSite = DebugSite::new("ledger.rs", 7, "tests");

    #[test]
    fn track_and_untrack() {
        let ledger = AllocationLedger::new();
        ledger.track(0x1000, 64, SITE);
        assert!(ledger.contains(0x1000));
        assert_eq!(ledger.live_count(), 1);
        assert_eq!(ledger.live_bytes(), 64);
        let entry = ledger.untrack(0x1000).expect("tracked");
        assert_eq!(entry.site, SITE);
        assert_eq!(entry.user_addr(), 0x1000 + HEADER_SIZE);
        assert_eq!(ledger.live_count(), 0);
    }

    #[test]
    fn replaced_entry_keeps_sequence_and_counts_resizes() {
        let ledger = AllocationLedger::new();
        ledger.track(0x2000, 32, SITE);
        let original = ledger.get(0x2000).expect("tracked");

        let prior = ledger.detach(0x2000);
        let moved_site = DebugSite::new("ledger.rs", 99, "tests");
        ledger.track_replaced(prior, 0x9000, 128, moved_site);

        assert!(!ledger.contains(0x2000));
        let moved = ledger.get(0x9000).expect("moved");
        assert_eq!(moved.sequence, original.sequence);
        assert_eq!(moved.resizes, 1);
        assert_eq!(moved.size, 128);
        assert_eq!(moved.site, moved_site);
    }

    #[test]
    fn failed_resize_reinserts() {
        let ledger = AllocationLedger::new();
        ledger.track(0x3000, 16, SITE);
        let prior = ledger.detach(0x3000).expect("tracked");
        assert!(!ledger.contains(0x3000));
        ledger.reinsert(prior);
        assert!(ledger.contains(0x3000));
    }

    #[test]
    fn untracked_free_is_logged() {
        let ledger = AllocationLedger::new();
        assert!(ledger.untrack(0xdead_0000).is_none());
        assert!(
            log::records_for("untracked_free")
                .iter()
                .any(|r| r.addr == Some(0xdead_0000))
        );
    }

    #[test]
    fn leak_report_is_ordered_and_serializable() {
        let ledger = AllocationLedger::new();
        ledger.track(0x5000, 10, SITE);
        ledger.track(0x4000, 20, SITE);
        let report = ledger.leak_report();
        assert_eq!(report.live_count, 2);
        assert_eq!(report.live_bytes, 30);
        assert_eq!(report.allocations[0].block, 0x5000);
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["allocations"][1]["site"]["line"], 7);
    }

    #[test]
    fn macro_captures_call_site() {
        let site = crate::debug_site!();
        assert!(site.file.ends_with("tracking.rs"));
        assert!(site.line > 0);
        assert!(site.function.contains("tracking"));
    }
}
