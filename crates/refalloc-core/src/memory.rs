//! The allocation facade.
//!
//! Every block flows through these functions. They resolve the backend,
//! add or strip the shared [`AllocatorHeader`](crate::header::AllocatorHeader),
//! and run the reference-counting protocol:
//!
//! - a new block starts with a count of one and no destructor;
//! - [`retain`] increments with relaxed ordering;
//! - [`deallocate`] decrements with release ordering, and the thread that
//!   takes the count to zero issues an acquire fence, runs the destructor
//!   with the user pointer and hands the block back to its backend.
//!
//! Blocks whose header carries a negative backend index are unmanaged:
//! retain and release do nothing and the count reads as
//! [`UNMANAGED_REF_COUNT`].

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use crate::error::AllocError;
use crate::header::{
    Destructor, HEADER_SIZE, Memory, UNMANAGED_REF_COUNT, backend_of, block_of, destructor_of,
    init_header, memory_of, ref_count_of, replace_destructor,
};
use crate::log::{self, LogLevel, LogRecord};
use crate::metrics::{AllocatorMetrics, global_metrics};
use crate::registry::{AllocatorType, Backend, MAX_BACKENDS, global_registry};

fn out_of_range(index: i32) -> bool {
    usize::try_from(index).is_ok_and(|slot| slot >= MAX_BACKENDS)
}

/// Total block size for a `size`-byte request, or the overflow error.
fn block_size(index: i32, size: usize) -> Result<usize, AllocError> {
    size.checked_add(HEADER_SIZE).ok_or_else(|| {
        AllocatorMetrics::inc(&global_metrics().overflow_rejections);
        log::emit(
            LogRecord::new(
                LogLevel::Debug,
                "size_overflow",
                format!("integer overflow adding the header to {size} bytes; try a smaller size"),
            )
            .with_backend(index)
            .with_size(size),
        );
        AllocError::SizeOverflow {
            size,
            header: HEADER_SIZE,
        }
    })
}

fn backend_failed(index: i32, size: usize) -> AllocError {
    AllocatorMetrics::inc(&global_metrics().backend_failures);
    log::emit(
        LogRecord::new(LogLevel::Debug, "backend_failed", "backend returned no memory")
            .with_backend(index)
            .with_size(size),
    );
    AllocError::BackendFailed { index, size }
}

fn no_backend(index: i32) -> AllocError {
    AllocatorMetrics::inc(&global_metrics().backend_failures);
    AllocError::NoBackend { index }
}

/// Backend owning a managed block, or fatal if the header is corrupt.
fn owning_backend(mem: Memory, index: i32) -> Option<Arc<dyn Backend>> {
    if out_of_range(index) {
        log::fatal(
            LogRecord::new(
                LogLevel::Fatal,
                "corrupt_backend_index",
                "memory has been modified outside of its bounds",
            )
            .with_backend(index)
            .with_addr(mem.addr()),
        );
    }
    global_registry().get(index)
}

/// Allocate `size` user bytes from the backend `ty` selects.
///
/// # Errors
///
/// [`AllocError::Unmanaged`] for a negative backend index,
/// [`AllocError::NoBackend`] for an empty slot or a backend that cannot
/// allocate, [`AllocError::SizeOverflow`] when the header does not fit in
/// `usize`, and [`AllocError::BackendFailed`] when the backend returns nothing.
///
/// # Panics
///
/// An index at or beyond [`MAX_BACKENDS`] is a fatal usage error.
pub fn allocate(ty: AllocatorType, size: usize) -> Result<Memory, AllocError> {
    let index = ty.index();
    if index < 0 {
        return Err(AllocError::Unmanaged);
    }
    if out_of_range(index) {
        log::fatal(
            LogRecord::new(
                LogLevel::Fatal,
                "backend_out_of_range",
                format!("index {index} exceeds the number of backends available ({MAX_BACKENDS})"),
            )
            .with_backend(index),
        );
    }

    let backend = global_registry()
        .get(index)
        .filter(|backend| backend.can_allocate())
        .ok_or_else(|| no_backend(index))?;
    let total = block_size(index, size)?;
    let block = backend
        .allocate(ty.config(), total)
        .ok_or_else(|| backend_failed(index, size))?;

    AllocatorMetrics::inc(&global_metrics().allocations);
    // SAFETY: the backend contract gives an aligned block of `total` bytes.
    let mem = unsafe { init_header(block, index) };
    if log::enabled(LogLevel::Trace) {
        log::emit(
            LogRecord::new(LogLevel::Trace, "allocate", backend.name().to_owned())
                .with_backend(index)
                .with_addr(mem.addr())
                .with_size(size),
        );
    }
    Ok(mem)
}

/// Resize a block, or allocate a fresh one when `mem` is `None`.
///
/// The block is always resized by the backend recorded in its header; `ty`
/// only contributes its configuration. On failure the original block is
/// left to the backend's conventions and must not be assumed freed or valid.
/// Every built-in backend leaves it untouched.
///
/// # Errors
///
/// As [`allocate`], with [`AllocError::Unmanaged`] for unmanaged blocks.
///
/// # Safety
///
/// `mem`, if present, must be a live block from this facade and no other
/// thread may hold a reference to it.
pub unsafe fn reallocate(
    ty: AllocatorType,
    mem: Option<Memory>,
    size: usize,
) -> Result<Memory, AllocError> {
    let Some(mem) = mem else {
        return allocate(ty, size);
    };

    // SAFETY: caller guarantees a live block.
    let index = unsafe { backend_of(mem) };
    if index < 0 {
        return Err(AllocError::Unmanaged);
    }
    let backend = owning_backend(mem, index).ok_or_else(|| no_backend(index))?;
    let total = block_size(index, size)?;

    // SAFETY: the block was produced by this backend and is exclusively ours.
    let block = unsafe { backend.reallocate(ty.config(), block_of(mem), total) }
        .ok_or_else(|| backend_failed(index, size))?;

    AllocatorMetrics::inc(&global_metrics().reallocations);
    // SAFETY: the backend preserved the header bytes at the front of the block.
    let resized = unsafe { memory_of(block) };
    if log::enabled(LogLevel::Trace) {
        log::emit(
            LogRecord::new(LogLevel::Trace, "reallocate", backend.name().to_owned())
                .with_backend(index)
                .with_addr(resized.addr())
                .with_size(size),
        );
    }
    Ok(resized)
}

/// Add a reference to `mem` and hand it back.
///
/// # Safety
///
/// `mem` must be a live block from this facade (or an unmanaged block).
pub unsafe fn retain(mem: Memory) -> Memory {
    // SAFETY: caller guarantees a live header.
    if unsafe { backend_of(mem) } < 0 {
        return mem;
    }
    // SAFETY: the caller's reference keeps the header alive.
    unsafe { ref_count_of(mem) }.fetch_add(1, Ordering::Relaxed);
    AllocatorMetrics::inc(&global_metrics().retains);
    mem
}

/// Current reference count, or [`UNMANAGED_REF_COUNT`] for unmanaged blocks.
///
/// # Safety
///
/// `mem` must be a live block from this facade (or an unmanaged block).
#[must_use]
pub unsafe fn ref_count(mem: Memory) -> i32 {
    // SAFETY: caller guarantees a live header.
    if unsafe { backend_of(mem) } < 0 {
        return UNMANAGED_REF_COUNT;
    }
    // SAFETY: the caller's reference keeps the header alive.
    unsafe { ref_count_of(mem) }.load(Ordering::Relaxed)
}

/// Drop one reference; the last one runs the destructor and frees the block.
///
/// # Panics
///
/// Releasing more references than were held, or a header whose backend
/// index is out of range, is a fatal usage error.
///
/// # Safety
///
/// `mem` must be a live block from this facade (or an unmanaged block) and
/// the caller must own the reference being dropped. Once the count reaches
/// zero `mem` is dangling.
pub unsafe fn deallocate(mem: Memory) {
    // SAFETY: caller guarantees a live header.
    let index = unsafe { backend_of(mem) };
    if index < 0 {
        return;
    }
    let backend = owning_backend(mem, index);

    // SAFETY: the caller's reference keeps the header alive until here.
    let remaining = unsafe { ref_count_of(mem) }.fetch_sub(1, Ordering::Release) - 1;
    if remaining < 0 {
        log::fatal(
            LogRecord::new(
                LogLevel::Fatal,
                "over_release",
                "allocation has been over released",
            )
            .with_backend(index)
            .with_addr(mem.addr()),
        );
    }
    if remaining > 0 {
        AllocatorMetrics::inc(&global_metrics().releases);
        return;
    }

    // Synchronize with every earlier release before touching the block.
    fence(Ordering::Acquire);

    // SAFETY: this thread dropped the last reference; the header is ours.
    if let Some(destructor) = unsafe { destructor_of(mem) } {
        AllocatorMetrics::inc(&global_metrics().destructor_calls);
        // SAFETY: the destructor was installed for exactly this user pointer.
        unsafe { destructor(mem.as_void()) };
    }

    AllocatorMetrics::inc(&global_metrics().frees);
    match backend {
        // SAFETY: the block came from this backend and has no references left.
        Some(backend) => unsafe { backend.deallocate(block_of(mem)) },
        None => log::emit(
            LogRecord::new(
                LogLevel::Warn,
                "orphaned_block",
                "no backend registered for a released block; leaking it",
            )
            .with_backend(index)
            .with_addr(mem.addr()),
        ),
    }
}

/// Install `destructor` for `mem`, returning the one it replaces.
///
/// Applies to unmanaged blocks too, although they are never destroyed.
///
/// # Safety
///
/// `mem` must be a live block from this facade, and nothing may race with
/// this call on the same block's destructor slot.
pub unsafe fn set_destructor(mem: Memory, destructor: Option<Destructor>) -> Option<Destructor> {
    // SAFETY: forwarded caller contract.
    unsafe { replace_destructor(mem, destructor) }
}
