//! Bounds-check backend: guard bytes on both sides of every block.
//!
//! ```text
//! [size: usize][guard 0..7][block: size bytes][guard 0..7]
//! ```
//!
//! Guards are verified on every resize and free. A mismatch means something
//! wrote outside the block and is a fatal error.

use std::mem::size_of;
use std::ptr::NonNull;

use super::host;
use crate::header::{Memory, block_of};
use crate::log::{self, LogLevel, LogRecord};
use crate::metrics::{AllocatorMetrics, global_metrics};
use crate::registry::{Backend, BackendConfig, builtin};

const GUARD: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];
const GUARD_LEN: usize = GUARD.len();
const LEADING: usize = size_of::<usize>() + GUARD_LEN;

/// Host bytes needed around a `size`-byte block.
const OVERHEAD: usize = LEADING + GUARD_LEN;

#[derive(Debug, Clone, Copy, Default)]
pub struct BoundsCheckBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Breach {
    Before,
    After,
}

fn raw_of(block: NonNull<u8>) -> *mut u8 {
    block.as_ptr().wrapping_sub(LEADING)
}

/// # Safety
///
/// `raw` must be valid for `OVERHEAD + size` bytes.
unsafe fn arm(raw: NonNull<u8>, size: usize) -> NonNull<u8> {
    // SAFETY: caller guarantees the full guarded extent is writable.
    unsafe {
        raw.cast::<usize>().as_ptr().write_unaligned(size);
        let block = raw.add(LEADING);
        block.sub(GUARD_LEN).as_ptr().copy_from_nonoverlapping(GUARD.as_ptr(), GUARD_LEN);
        block.add(size).as_ptr().copy_from_nonoverlapping(GUARD.as_ptr(), GUARD_LEN);
        block
    }
}

/// # Safety
///
/// `block` must be a live bounds-check block.
unsafe fn inspect(block: NonNull<u8>) -> Option<Breach> {
    // SAFETY: the leading guard and size slot precede the block; the size
    // slot is trusted only as far as the leading guard is intact.
    unsafe {
        let leading = std::slice::from_raw_parts(block.as_ptr().sub(GUARD_LEN), GUARD_LEN);
        if leading != GUARD {
            return Some(Breach::Before);
        }
        let size = raw_of(block).cast::<usize>().read_unaligned();
        let trailing = std::slice::from_raw_parts(block.as_ptr().add(size), GUARD_LEN);
        (trailing != GUARD).then_some(Breach::After)
    }
}

/// # Safety
///
/// `block` must be a live bounds-check block.
unsafe fn verify(block: NonNull<u8>) {
    // SAFETY: forwarded caller contract.
    let Some(breach) = (unsafe { inspect(block) }) else {
        return;
    };
    AllocatorMetrics::inc(&global_metrics().guard_violations);
    let details = match breach {
        Breach::Before => "data changed before bounds",
        Breach::After => "data changed after bounds",
    };
    log::fatal(
        LogRecord::new(LogLevel::Fatal, "bounds_violation", details)
            .with_backend(builtin::BOUNDS_CHECK)
            .with_addr(block.as_ptr() as usize),
    );
}

/// Non-fatal guard check for a bounds-check allocation.
///
/// # Safety
///
/// `mem` must be a live block allocated with [`crate::AllocatorType::BOUNDS_CHECK`].
#[must_use]
pub unsafe fn guards_intact(mem: Memory) -> bool {
    // SAFETY: forwarded caller contract.
    unsafe { inspect(block_of(mem)).is_none() }
}

// SAFETY: host blocks are 16-aligned and LEADING is 16, so blocks keep
// pointer alignment. Guards live strictly outside the `size` block bytes.
unsafe impl Backend for BoundsCheckBackend {
    fn name(&self) -> &str {
        "bounds_check"
    }

    fn allocate(&self, _config: &BackendConfig, size: usize) -> Option<NonNull<u8>> {
        let raw = host::malloc(size.checked_add(OVERHEAD)?)?;
        // SAFETY: raw spans OVERHEAD + size bytes.
        Some(unsafe { arm(raw, size) })
    }

    unsafe fn reallocate(
        &self,
        _config: &BackendConfig,
        block: NonNull<u8>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: block is live (trait contract).
        unsafe { verify(block) };
        let total = size.checked_add(OVERHEAD)?;
        let raw = NonNull::new(raw_of(block))?;
        // SAFETY: raw is the live host block; on success it spans `total`.
        unsafe {
            let raw = host::realloc(raw, total)?;
            Some(arm(raw, size))
        }
    }

    unsafe fn deallocate(&self, block: NonNull<u8>) {
        // SAFETY: block is live (trait contract).
        unsafe { verify(block) };
        if let Some(raw) = NonNull::new(raw_of(block)) {
            // SAFETY: raw is the live host block.
            unsafe { host::free(raw) };
        }
    }
}
