//! Static backend: caller-owned buffers that take part in the facade.
//!
//! This backend never allocates. A caller carves a block out of storage it
//! owns with [`managed_block`] (or [`unmanaged_block`]), which writes the
//! block's capacity in the slot right before it:
//!
//! ```text
//! [max size: usize][header][user data ...]
//!                  ^ block (max size counts from here)
//! ```
//!
//! Resizing succeeds in place while the request fits, and freeing does
//! nothing since the storage is not ours.

use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::header::{HEADER_SIZE, Memory, UNMANAGED, block_of, init_header, prefix_before};
use crate::registry::{Backend, BackendConfig, builtin};

type MaxSize = usize;

#[derive(Debug, Clone, Copy, Default)]
pub struct StaticBackend;

// SAFETY: blocks come from `managed_block`, which aligns them and records
// how many bytes follow; resizes never move or exceed that extent.
unsafe impl Backend for StaticBackend {
    fn name(&self) -> &str {
        "static"
    }

    fn allocate(&self, _config: &BackendConfig, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn reallocate(
        &self,
        _config: &BackendConfig,
        block: NonNull<u8>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: the capacity slot was written by `managed_block`.
        let max = unsafe { prefix_before::<MaxSize>(block).read() };
        (size <= max).then_some(block)
    }

    unsafe fn deallocate(&self, _block: NonNull<u8>) {}
}

/// # Safety
///
/// See [`managed_block`].
unsafe fn carve(storage: &mut [u8], backend: i32) -> Option<Memory> {
    let base = storage.as_mut_ptr();
    let pad = base.align_offset(align_of::<MaxSize>());
    let prefix_end = pad.checked_add(size_of::<MaxSize>())?;
    let max = storage.len().checked_sub(prefix_end)?;
    if max < HEADER_SIZE {
        return None;
    }
    // SAFETY: prefix_end + HEADER_SIZE <= storage.len().
    let block = NonNull::new(unsafe { base.add(prefix_end) })?;
    // SAFETY: the slot before the block is in bounds and aligned; the block
    // is usize-aligned, which is the header's alignment.
    unsafe {
        prefix_before::<MaxSize>(block).write(max);
        Some(init_header(block, backend))
    }
}

/// Turn caller-owned `storage` into a facade block owned by the static backend.
///
/// The block holds a reference count of one and can be retained, resized
/// within [`capacity`], and released like any other; releasing the last
/// reference runs the destructor but leaves the storage alone.
///
/// Returns `None` if `storage` is too small for the capacity slot and header.
///
/// # Safety
///
/// `storage` must outlive every use of the returned handle, and must not be
/// touched except through that handle in the meantime.
pub unsafe fn managed_block(storage: &mut [u8]) -> Option<Memory> {
    // SAFETY: forwarded caller contract.
    unsafe { carve(storage, builtin::STATIC) }
}

/// Like [`managed_block`], but the block is marked unmanaged: retain and
/// release are no-ops, the reported count is saturated, and resize fails.
///
/// # Safety
///
/// See [`managed_block`].
pub unsafe fn unmanaged_block(storage: &mut [u8]) -> Option<Memory> {
    // SAFETY: forwarded caller contract.
    unsafe { carve(storage, UNMANAGED) }
}

/// User bytes available in a block produced by [`managed_block`].
///
/// # Safety
///
/// `mem` must come from [`managed_block`] or [`unmanaged_block`].
#[must_use]
pub unsafe fn capacity(mem: Memory) -> usize {
    // SAFETY: forwarded caller contract.
    let max = unsafe { prefix_before::<MaxSize>(block_of(mem)).read() };
    max - HEADER_SIZE
}
