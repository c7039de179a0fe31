//! Structured allocator log records.
//!
//! Every diagnostic the subsystem produces is a [`LogRecord`]. Records are
//! kept in a bounded in-process ring (most recent [`RING_CAPACITY`] entries)
//! and, when at or above the configured threshold, written to stderr as a
//! single JSON line. Fatal usage errors go through [`fatal`], which records
//! the event and then panics or aborts according to [`crate::config`].

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::{self, FatalMode};

/// Number of records retained in the in-process ring.
pub const RING_CAPACITY: usize = 1024;

/// Severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// One allocator lifecycle/diagnostic record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    /// Process-wide monotonic sequence number, assigned on emit.
    pub seq: u64,
    pub level: LogLevel,
    /// Machine-readable event name (`size_overflow`, `over_release`, ...).
    pub event: &'static str,
    /// Backend index involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<i32>,
    /// Address involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<usize>,
    /// Size involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Human-readable details.
    pub details: String,
}

impl LogRecord {
    /// Create a record with no backend/address/size context.
    #[must_use]
    pub fn new(level: LogLevel, event: &'static str, details: impl Into<String>) -> Self {
        Self {
            seq: 0,
            level,
            event,
            backend: None,
            addr: None,
            size: None,
            details: details.into(),
        }
    }

    #[must_use]
    pub fn with_backend(mut self, index: i32) -> Self {
        self.backend = Some(index);
        self
    }

    #[must_use]
    pub fn with_addr(mut self, addr: usize) -> Self {
        self.addr = Some(addr);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Serialize to one JSON line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);
static RING: Mutex<VecDeque<LogRecord>> = parking_lot::const_mutex(VecDeque::new());

/// Whether records at `level` are produced at all.
///
/// Trace records only exist when the stderr threshold asks for them, so the
/// hot allocation path stays off the ring lock by default.
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level > LogLevel::Trace || config::log_level().is_some_and(|threshold| threshold <= level)
}

/// Record `record` in the ring and write it to stderr if above threshold.
pub fn emit(mut record: LogRecord) {
    record.seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);

    if config::log_level().is_some_and(|threshold| record.level >= threshold) {
        if let Ok(line) = record.to_jsonl() {
            let _ = writeln!(std::io::stderr().lock(), "{line}");
        }
    }

    let mut ring = RING.lock();
    if ring.len() == RING_CAPACITY {
        ring.pop_front();
    }
    ring.push_back(record);
}

/// Record a fatal usage error, then panic or abort.
///
/// The panic message is the record's `details`.
pub fn fatal(mut record: LogRecord) -> ! {
    record.level = LogLevel::Fatal;
    let message = record.details.clone();
    emit(record);
    match config::fatal_mode() {
        FatalMode::Abort => std::process::abort(),
        FatalMode::Panic => panic!("{message}"),
    }
}

/// Snapshot of the retained records, oldest first.
#[must_use]
pub fn recent_records() -> Vec<LogRecord> {
    RING.lock().iter().cloned().collect()
}

/// Retained records with the given event name, oldest first.
#[must_use]
pub fn records_for(event: &str) -> Vec<LogRecord> {
    RING.lock()
        .iter()
        .filter(|r| r.event == event)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_severity() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
    }

    #[test]
    fn record_serializes_without_empty_context() {
        let record = LogRecord::new(LogLevel::Warn, "backend_replaced", "slot 7");
        let line = record.to_jsonl().expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(value["level"], "warn");
        assert_eq!(value["event"], "backend_replaced");
        assert!(value.get("backend").is_none());
        assert!(value.get("addr").is_none());
    }

    #[test]
    fn emitted_records_are_retained_with_sequence() {
        emit(
            LogRecord::new(LogLevel::Debug, "log_ring_probe", "first")
                .with_backend(9)
                .with_size(32),
        );
        emit(LogRecord::new(LogLevel::Debug, "log_ring_probe", "second"));
        let probes = records_for("log_ring_probe");
        assert!(probes.len() >= 2);
        let first = probes.iter().find(|r| r.details == "first").expect("first");
        let second = probes.iter().find(|r| r.details == "second").expect("second");
        assert!(first.seq < second.seq);
        assert_eq!(first.backend, Some(9));
        assert_eq!(first.size, Some(32));
    }

    #[test]
    fn non_trace_levels_are_always_enabled() {
        assert!(enabled(LogLevel::Debug));
        assert!(enabled(LogLevel::Fatal));
    }

    #[test]
    #[should_panic(expected = "probe fatal")]
    fn fatal_panics_with_details() {
        fatal(LogRecord::new(LogLevel::Error, "fatal_probe", "probe fatal"));
    }
}
