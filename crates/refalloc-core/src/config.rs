//! Runtime configuration.
//!
//! Two knobs, both read from the environment on first use and cached:
//! - `REFALLOC_LOG`: minimum level written to stderr as JSON lines
//!   (`trace|debug|info|warn|error|fatal|off`, default `warn`). Records below
//!   the threshold still land in the in-process ring (see [`crate::log`]).
//! - `REFALLOC_FATAL`: what a fatal usage error does after it is logged
//!   (`panic` by default, or `abort`).
//!
//! Hosts and tests can override either value with [`set_log_level`] and
//! [`set_fatal_mode`].

use std::sync::atomic::{AtomicU8, Ordering};

use crate::log::LogLevel;

/// Reaction to a fatal usage error (over-release, guard corruption, ...).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalMode {
    /// Unwind with a panic carrying the diagnostic message.
    #[default]
    Panic,
    /// Abort the process immediately.
    Abort,
}

impl FatalMode {
    /// Parse from string (case-insensitive). Unknown values select `Panic`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "abort" | "crash" | "hard" => Self::Abort,
            _ => Self::Panic,
        }
    }
}

// Cache states: 0=unresolved, 255=resolving, anything else is an encoded value.
const UNRESOLVED: u8 = 0;
const RESOLVING: u8 = 255;

// Log threshold encoding: 1..=6 are Trace..Fatal, 7 is "off".
const LOG_OFF: u8 = 7;
const DEFAULT_LOG: u8 = 4; // Warn

const FATAL_PANIC: u8 = 1;
const FATAL_ABORT: u8 = 2;

static CACHED_LOG: AtomicU8 = AtomicU8::new(UNRESOLVED);
static CACHED_FATAL: AtomicU8 = AtomicU8::new(UNRESOLVED);

fn parse_log_env(raw: &str) -> u8 {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => 1,
        "debug" => 2,
        "info" => 3,
        "warn" | "warning" => 4,
        "error" => 5,
        "fatal" => 6,
        "off" | "none" | "quiet" => LOG_OFF,
        _ => DEFAULT_LOG,
    }
}

fn level_to_u8(level: Option<LogLevel>) -> u8 {
    match level {
        Some(LogLevel::Trace) => 1,
        Some(LogLevel::Debug) => 2,
        Some(LogLevel::Info) => 3,
        Some(LogLevel::Warn) => 4,
        Some(LogLevel::Error) => 5,
        Some(LogLevel::Fatal) => 6,
        None => LOG_OFF,
    }
}

fn u8_to_level(v: u8) -> Option<LogLevel> {
    match v {
        1 => Some(LogLevel::Trace),
        2 => Some(LogLevel::Debug),
        3 => Some(LogLevel::Info),
        5 => Some(LogLevel::Error),
        6 => Some(LogLevel::Fatal),
        LOG_OFF => None,
        _ => Some(LogLevel::Warn),
    }
}

/// Resolve a cached value, reading `var` at most once per process.
///
/// Concurrent first calls see `RESOLVING` and fall back to `default`
/// instead of blocking.
fn resolve(cache: &AtomicU8, var: &str, parse: fn(&str) -> u8, default: u8) -> u8 {
    let cached = cache.load(Ordering::Relaxed);
    if cached != UNRESOLVED && cached != RESOLVING {
        return cached;
    }
    if cached == RESOLVING {
        return default;
    }
    if cache
        .compare_exchange(UNRESOLVED, RESOLVING, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        let v = cache.load(Ordering::Relaxed);
        return if v != UNRESOLVED && v != RESOLVING {
            v
        } else {
            default
        };
    }

    let value = std::env::var(var).map(|v| parse(&v)).unwrap_or(default);
    cache.store(value, Ordering::Release);
    value
}

/// Minimum level written to stderr, or `None` when stderr output is off.
#[must_use]
pub fn log_level() -> Option<LogLevel> {
    u8_to_level(resolve(&CACHED_LOG, "REFALLOC_LOG", parse_log_env, DEFAULT_LOG))
}

/// Override the stderr threshold for the rest of the process.
pub fn set_log_level(level: Option<LogLevel>) {
    CACHED_LOG.store(level_to_u8(level), Ordering::Release);
}

/// Configured reaction to fatal usage errors.
#[must_use]
pub fn fatal_mode() -> FatalMode {
    let parse = |raw: &str| match FatalMode::from_str_loose(raw) {
        FatalMode::Panic => FATAL_PANIC,
        FatalMode::Abort => FATAL_ABORT,
    };
    match resolve(&CACHED_FATAL, "REFALLOC_FATAL", parse, FATAL_PANIC) {
        FATAL_ABORT => FatalMode::Abort,
        _ => FatalMode::Panic,
    }
}

/// Override the fatal-error reaction for the rest of the process.
pub fn set_fatal_mode(mode: FatalMode) {
    let v = match mode {
        FatalMode::Panic => FATAL_PANIC,
        FatalMode::Abort => FATAL_ABORT,
    };
    CACHED_FATAL.store(v, Ordering::Release);
}
