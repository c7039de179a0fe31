//! Atomic counters for allocator observability.
//!
//! All counters use relaxed ordering. They are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global facade operation counters.
pub struct AllocatorMetrics {
    /// Successful allocations.
    pub allocations: AtomicU64,
    /// Successful reallocations.
    pub reallocations: AtomicU64,
    /// Blocks handed back to their backend (count reached zero).
    pub frees: AtomicU64,
    /// Reference count increments.
    pub retains: AtomicU64,
    /// Reference count decrements that did not free.
    pub releases: AtomicU64,
    /// Destructor callbacks invoked.
    pub destructor_calls: AtomicU64,
    /// Requests rejected because size + header overflowed.
    pub overflow_rejections: AtomicU64,
    /// Requests a backend (or a missing backend) could not satisfy.
    pub backend_failures: AtomicU64,
    /// Guard-byte mismatches found by the bounds-check backend.
    pub guard_violations: AtomicU64,
}

impl AllocatorMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            retains: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            destructor_calls: AtomicU64::new(0),
            overflow_rejections: AtomicU64::new(0),
            backend_failures: AtomicU64::new(0),
            guard_violations: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            reallocations: Self::get(&self.reallocations),
            frees: Self::get(&self.frees),
            retains: Self::get(&self.retains),
            releases: Self::get(&self.releases),
            destructor_calls: Self::get(&self.destructor_calls),
            overflow_rejections: Self::get(&self.overflow_rejections),
            backend_failures: Self::get(&self.backend_failures),
            guard_violations: Self::get(&self.guard_violations),
        }
    }
}

impl Default for AllocatorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub reallocations: u64,
    pub frees: u64,
    pub retains: u64,
    pub releases: u64,
    pub destructor_calls: u64,
    pub overflow_rejections: u64,
    pub backend_failures: u64,
    pub guard_violations: u64,
}

static GLOBAL_METRICS: AllocatorMetrics = AllocatorMetrics::new();

/// Access the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static AllocatorMetrics {
    &GLOBAL_METRICS
}
