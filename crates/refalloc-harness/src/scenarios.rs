//! Named lifecycle scenarios over every built-in backend.
//!
//! Each scenario drives the facade end to end and reports the first
//! observation that disagrees with the reference-counting contract. Fatal
//! usage errors surface as panics and are caught by [`Scenario::run`].

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Instant;

use refalloc_core::backend::{bounds_check, debug, static_alloc};
use refalloc_core::log::{self, LogRecord};
use refalloc_core::metrics::global_metrics;
use refalloc_core::tracking::ledger;
use refalloc_core::{
    AllocatorType, CallbackEvent, CustomAllocator, HEADER_SIZE, Memory, MetricsSnapshot,
    UNMANAGED_REF_COUNT, debug_site, memory,
};
use serde::Serialize;

use crate::error::HarnessError;
use crate::structured_log::Outcome;

type ScenarioFn = fn() -> Result<(), HarnessError>;

/// Scenarios share counters and sinks, so at most one runs at a time.
static RUN_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

/// A named, self-contained facade exercise.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    body: ScenarioFn,
}

/// Result of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: &'static str,
    pub outcome: Outcome,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Facade counters when the scenario finished.
    pub metrics: MetricsSnapshot,
    /// Allocator records emitted while the scenario ran.
    pub records: Vec<LogRecord>,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Scenario {
    /// Run the scenario body and collect its report.
    #[must_use]
    pub fn run(&self) -> ScenarioReport {
        let _serial = RUN_LOCK.lock();
        let first_seq = log::recent_records().last().map_or(0, |r| r.seq);
        let started = Instant::now();

        let result = match panic::catch_unwind(AssertUnwindSafe(self.body)) {
            Ok(result) => result,
            Err(payload) => Err(HarnessError::Panicked {
                scenario: self.name,
                message: panic_message(payload.as_ref()),
            }),
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let records = log::recent_records()
            .into_iter()
            .filter(|r| r.seq > first_seq)
            .collect();
        ScenarioReport {
            name: self.name,
            outcome: if result.is_ok() {
                Outcome::Pass
            } else {
                Outcome::Fail
            },
            duration_ms,
            error: result.err().map(|e| e.to_string()),
            metrics: global_metrics().snapshot(),
            records,
        }
    }
}

/// Every scenario, in run order.
pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "standard_lifecycle",
        description: "allocate 64 bytes, retain, release twice; counts step 1-2-1-0",
        body: standard_lifecycle,
    },
    Scenario {
        name: "destructor_once",
        description: "destructor runs exactly once with the user pointer",
        body: destructor_once,
    },
    Scenario {
        name: "aligned_sweep",
        description: "every power-of-two alignment up to 4096, through allocate and grow",
        body: aligned_sweep,
    },
    Scenario {
        name: "bounds_check_resize",
        description: "guard bytes stay intact across resizes of a bounds-checked block",
        body: bounds_check_resize,
    },
    Scenario {
        name: "debug_ledger_balance",
        description: "debug blocks appear in the ledger while live and leave it on free",
        body: debug_ledger_balance,
    },
    Scenario {
        name: "custom_chain",
        description: "custom triple sees one allocate, one reallocate and one free",
        body: custom_chain,
    },
    Scenario {
        name: "callback_events",
        description: "callback sink sees pre/post events in order and may enlarge requests",
        body: callback_events,
    },
    Scenario {
        name: "static_capacity",
        description: "static blocks resize in place up to capacity and are never freed",
        body: static_capacity,
    },
    Scenario {
        name: "concurrent_release",
        description: "racing last releases run the destructor exactly once",
        body: concurrent_release,
    },
];

/// Look up a scenario by name.
pub fn find(name: &str) -> Result<&'static Scenario, HarnessError> {
    SCENARIOS
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| HarnessError::UnknownScenario(name.to_string()))
}

macro_rules! ensure {
    ($scenario:expr, $cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err(HarnessError::check($scenario, format!($($msg)+)));
        }
    };
}

fn alloc(scenario: &'static str, ty: AllocatorType, size: usize) -> Result<Memory, HarnessError> {
    memory::allocate(ty, size).map_err(|source| HarnessError::Alloc { scenario, source })
}

fn standard_lifecycle() -> Result<(), HarnessError> {
    const NAME: &str = "standard_lifecycle";
    let mem = alloc(NAME, AllocatorType::STANDARD, 64)?;
    // SAFETY: mem is live until the final release below.
    unsafe {
        ensure!(NAME, memory::ref_count(mem) == 1, "fresh count {}", memory::ref_count(mem));
        mem.as_mut_slice(64).fill(0x5a);
        let again = memory::retain(mem);
        ensure!(NAME, again == mem, "retain returned a different pointer");
        ensure!(NAME, memory::ref_count(mem) == 2, "retained count {}", memory::ref_count(mem));
        memory::deallocate(mem);
        ensure!(NAME, memory::ref_count(mem) == 1, "released count {}", memory::ref_count(mem));
        ensure!(
            NAME,
            mem.as_mut_slice(64).iter().all(|&b| b == 0x5a),
            "contents changed while a reference was held"
        );
        memory::deallocate(mem);
    }
    Ok(())
}

static DESTROYED: AtomicUsize = AtomicUsize::new(0);
static DESTROYED_AT: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn record_destroy(ptr: *mut c_void) {
    DESTROYED.fetch_add(1, Ordering::SeqCst);
    DESTROYED_AT.store(ptr as usize, Ordering::SeqCst);
}

fn destructor_once() -> Result<(), HarnessError> {
    const NAME: &str = "destructor_once";
    let before = DESTROYED.load(Ordering::SeqCst);
    let mem = alloc(NAME, AllocatorType::STANDARD, 32)?;
    let addr = mem.addr();
    // SAFETY: three references are taken and three released.
    unsafe {
        memory::set_destructor(mem, Some(record_destroy));
        memory::retain(mem);
        memory::retain(mem);
        memory::deallocate(mem);
        memory::deallocate(mem);
        ensure!(
            NAME,
            DESTROYED.load(Ordering::SeqCst) == before,
            "destructor ran while references remained"
        );
        memory::deallocate(mem);
    }
    let runs = DESTROYED.load(Ordering::SeqCst) - before;
    ensure!(NAME, runs == 1, "destructor ran {runs} times");
    let at = DESTROYED_AT.load(Ordering::SeqCst);
    ensure!(NAME, at == addr, "destructor saw {at:#x}, expected {addr:#x}");
    Ok(())
}

fn aligned_sweep() -> Result<(), HarnessError> {
    const NAME: &str = "aligned_sweep";
    for shift in 0..=12 {
        let alignment = 1usize << shift;
        let ty = AllocatorType::aligned(alignment);
        let mem = alloc(NAME, ty, 24 + shift)?;
        ensure!(
            NAME,
            mem.addr() % alignment == 0,
            "{:#x} not aligned to {alignment}",
            mem.addr()
        );
        // SAFETY: mem holds at least 24 bytes and is released once.
        unsafe {
            mem.as_mut_slice(24).fill(shift as u8);
            let grown = memory::reallocate(ty, Some(mem), 4096)
                .map_err(|source| HarnessError::Alloc { scenario: NAME, source })?;
            ensure!(
                NAME,
                grown.addr() % alignment == 0,
                "grown block {:#x} lost alignment {alignment}",
                grown.addr()
            );
            ensure!(
                NAME,
                grown.as_mut_slice(24).iter().all(|&b| b == shift as u8),
                "contents lost growing at alignment {alignment}"
            );
            memory::deallocate(grown);
        }
    }
    Ok(())
}

fn bounds_check_resize() -> Result<(), HarnessError> {
    const NAME: &str = "bounds_check_resize";
    let ty = AllocatorType::BOUNDS_CHECK;
    let mut mem = alloc(NAME, ty, 16)?;
    // SAFETY: each write stays inside the block's current size.
    unsafe {
        for size in [16usize, 100, 7, 1000, 1] {
            mem = memory::reallocate(ty, Some(mem), size)
                .map_err(|source| HarnessError::Alloc { scenario: NAME, source })?;
            mem.as_mut_slice(size).fill(0xee);
            ensure!(
                NAME,
                bounds_check::guards_intact(mem),
                "guards damaged after resize to {size}"
            );
        }
        memory::deallocate(mem);
    }
    Ok(())
}

fn debug_ledger_balance() -> Result<(), HarnessError> {
    const NAME: &str = "debug_ledger_balance";
    let ty = AllocatorType::debug(debug_site!());
    let mut blocks = Vec::new();
    for size in [8usize, 64, 512] {
        blocks.push(alloc(NAME, ty, size)?);
    }
    for mem in &blocks {
        ensure!(NAME, debug::is_tracked(*mem), "{mem:p} missing from ledger");
        let block = mem.addr() - HEADER_SIZE;
        let entry = ledger().get(block);
        ensure!(
            NAME,
            entry.is_some_and(|e| e.site.function.ends_with("scenarios")),
            "{mem:p} tracked with the wrong site"
        );
    }
    let report = ledger().leak_report();
    ensure!(
        NAME,
        report.live_count >= blocks.len(),
        "leak report lists {} live blocks",
        report.live_count
    );
    for mem in blocks.drain(..) {
        // SAFETY: each block holds one reference.
        unsafe { memory::deallocate(mem) };
        ensure!(NAME, !debug::is_tracked(mem), "{mem:p} still tracked after free");
    }
    Ok(())
}

static CHAIN_ALLOCS: AtomicUsize = AtomicUsize::new(0);
static CHAIN_REALLOCS: AtomicUsize = AtomicUsize::new(0);
static CHAIN_FREES: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn chain_malloc(_data: *mut c_void, size: usize) -> *mut c_void {
    CHAIN_ALLOCS.fetch_add(1, Ordering::SeqCst);
    // SAFETY: plain host malloc.
    unsafe { libc::malloc(size) }
}

unsafe extern "C" fn chain_realloc(_data: *mut c_void, ptr: *mut c_void, size: usize) -> *mut c_void {
    CHAIN_REALLOCS.fetch_add(1, Ordering::SeqCst);
    // SAFETY: ptr came from chain_malloc.
    unsafe { libc::realloc(ptr, size) }
}

unsafe extern "C" fn chain_free(ptr: *mut c_void) {
    CHAIN_FREES.fetch_add(1, Ordering::SeqCst);
    // SAFETY: ptr came from chain_malloc or chain_realloc.
    unsafe { libc::free(ptr) }
}

fn custom_chain() -> Result<(), HarnessError> {
    const NAME: &str = "custom_chain";
    let counts = || {
        (
            CHAIN_ALLOCS.load(Ordering::SeqCst),
            CHAIN_REALLOCS.load(Ordering::SeqCst),
            CHAIN_FREES.load(Ordering::SeqCst),
        )
    };
    let before = counts();
    // SAFETY: the triple wraps libc.
    let chain = unsafe { CustomAllocator::new(chain_malloc, Some(chain_realloc), Some(chain_free)) };
    let ty = AllocatorType::custom(chain);
    let mem = alloc(NAME, ty, 40)?;
    // SAFETY: one reference, released once.
    unsafe {
        let mem = memory::reallocate(ty, Some(mem), 400)
            .map_err(|source| HarnessError::Alloc { scenario: NAME, source })?;
        memory::deallocate(mem);
    }
    let after = counts();
    let delta = (after.0 - before.0, after.1 - before.1, after.2 - before.2);
    ensure!(NAME, delta == (1, 1, 1), "chain calls (alloc, realloc, free) = {delta:?}");
    Ok(())
}

static EVENTS: parking_lot::Mutex<Vec<(CallbackEvent, usize)>> = parking_lot::const_mutex(Vec::new());

unsafe extern "C" fn record_event(event: CallbackEvent, _ptr: *mut c_void, size: Option<&mut usize>) {
    let reported = match size {
        Some(size) => {
            if event == CallbackEvent::AllocatePre {
                *size += 32;
            }
            *size
        }
        None => 0,
    };
    EVENTS.lock().push((event, reported));
}

fn callback_events() -> Result<(), HarnessError> {
    const NAME: &str = "callback_events";
    EVENTS.lock().clear();
    // SAFETY: record_event only enlarges sizes on pre events.
    let ty = unsafe { AllocatorType::callback(Some(record_event)) };
    let mem = alloc(NAME, ty, 16)?;
    // SAFETY: one reference, released once.
    unsafe {
        mem.as_mut_slice(16).fill(1);
        let mem = memory::reallocate(ty, Some(mem), 128)
            .map_err(|source| HarnessError::Alloc { scenario: NAME, source })?;
        memory::deallocate(mem);
    }
    let events: Vec<CallbackEvent> = EVENTS.lock().iter().map(|(e, _)| *e).collect();
    let expected = [
        CallbackEvent::AllocatePre,
        CallbackEvent::AllocatePost,
        CallbackEvent::ReallocatePre,
        CallbackEvent::ReallocatePost,
        CallbackEvent::DeallocatePre,
    ];
    ensure!(NAME, events == expected, "events {events:?}");
    let enlarged = EVENTS.lock()[0].1;
    ensure!(
        NAME,
        enlarged == 16 + HEADER_SIZE + 32,
        "pre-allocate size {enlarged} was not enlarged"
    );
    Ok(())
}

fn static_capacity() -> Result<(), HarnessError> {
    const NAME: &str = "static_capacity";
    let mut storage = [0u8; 256];
    // SAFETY: storage outlives every use of the block below.
    unsafe {
        let Some(mem) = static_alloc::managed_block(&mut storage) else {
            return Err(HarnessError::check(NAME, "storage too small for a managed block"));
        };
        let capacity = static_alloc::capacity(mem);
        ensure!(NAME, capacity > 0 && capacity < 256, "capacity {capacity}");
        let same = memory::reallocate(AllocatorType::STATIC, Some(mem), capacity)
            .map_err(|source| HarnessError::Alloc { scenario: NAME, source })?;
        ensure!(NAME, same == mem, "in-capacity resize moved the block");
        ensure!(
            NAME,
            memory::reallocate(AllocatorType::STATIC, Some(mem), capacity + 1).is_err(),
            "resize past capacity succeeded"
        );
        ensure!(
            NAME,
            memory::allocate(AllocatorType::STATIC, 8).is_err(),
            "static backend allocated"
        );
        memory::retain(mem);
        memory::deallocate(mem);
        memory::deallocate(mem);
        ensure!(NAME, memory::ref_count(mem) == 0, "count after last release");

        let Some(loose) = static_alloc::unmanaged_block(&mut storage) else {
            return Err(HarnessError::check(NAME, "storage too small for an unmanaged block"));
        };
        memory::retain(loose);
        memory::deallocate(loose);
        memory::deallocate(loose);
        ensure!(
            NAME,
            memory::ref_count(loose) == UNMANAGED_REF_COUNT,
            "unmanaged count {}",
            memory::ref_count(loose)
        );
    }
    Ok(())
}

static RACE_DESTROYED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn race_destroy(_ptr: *mut c_void) {
    RACE_DESTROYED.fetch_add(1, Ordering::SeqCst);
}

fn concurrent_release() -> Result<(), HarnessError> {
    const NAME: &str = "concurrent_release";
    const THREADS: usize = 8;
    const ROUNDS: usize = 64;

    for _ in 0..ROUNDS {
        let before = RACE_DESTROYED.load(Ordering::SeqCst);
        let mem = alloc(NAME, AllocatorType::STANDARD, 48)?;
        // SAFETY: THREADS references in total, each released by one thread.
        unsafe {
            memory::set_destructor(mem, Some(race_destroy));
            for _ in 1..THREADS {
                memory::retain(mem);
            }
        }
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    // SAFETY: this thread owns one of the references.
                    unsafe { memory::deallocate(mem) };
                })
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                return Err(HarnessError::check(NAME, "release thread panicked"));
            }
        }
        let runs = RACE_DESTROYED.load(Ordering::SeqCst) - before;
        ensure!(NAME, runs == 1, "destructor ran {runs} times");
    }
    Ok(())
}
