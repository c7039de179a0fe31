//! Aligned backend: user pointers land on a caller-chosen power of two.
//!
//! The host block is over-allocated by `alignment` bytes. The block pointer
//! is placed so that the *user* pointer (block + header) is the lowest
//! aligned address past the private prefix, and `{head, alignment}` is
//! stored right before the block to undo the offset on resize and free.
//!
//! Alignments below the header's own alignment are raised to it; the result
//! is still a multiple of what was asked for.

use std::mem::size_of;
use std::ptr::NonNull;

use super::host;
use crate::header::{HEADER_ALIGN, HEADER_SIZE, prefix_before};
use crate::log::{self, LogLevel, LogRecord};
use crate::registry::{Backend, BackendConfig, builtin};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct AlignedPrefix {
    head: NonNull<u8>,
    alignment: usize,
}

const ALIGNED_PREFIX: usize = size_of::<AlignedPrefix>();

#[derive(Debug, Clone, Copy, Default)]
pub struct AlignedBackend;

/// Host bytes needed for a `size`-byte block at `alignment`.
fn host_size(size: usize, alignment: usize) -> Option<usize> {
    size.checked_add(alignment)?.checked_add(ALIGNED_PREFIX)
}

/// Offset from `head` at which the block sits for `alignment`.
fn block_offset(head: NonNull<u8>, alignment: usize) -> usize {
    let head = head.as_ptr() as usize;
    let earliest_user = head + ALIGNED_PREFIX + HEADER_SIZE;
    let user = (earliest_user + alignment - 1) & !(alignment - 1);
    user - HEADER_SIZE - head
}

fn place(head: NonNull<u8>, alignment: usize) -> NonNull<u8> {
    let offset = block_offset(head, alignment);
    // SAFETY: offset <= ALIGNED_PREFIX + alignment - 1, inside the host block.
    let block = unsafe { head.add(offset) };
    // SAFETY: the prefix fits between head and block.
    unsafe { prefix_before::<AlignedPrefix>(block).write(AlignedPrefix { head, alignment }) };
    block
}

/// Re-place a block inside `head` after the host moved it.
///
/// The host keeps the bytes at `old_offset`, but the aligned position
/// depends on the new head address. When the two differ, the header and
/// data slide to the new position. The prefix is always rewritten.
///
/// # Safety
///
/// `head` must be valid for `host_size(size, alignment)` bytes and for
/// `old_offset + size` bytes, with the block's first `size` bytes at
/// `old_offset`.
unsafe fn relocate(
    head: NonNull<u8>,
    old_offset: usize,
    alignment: usize,
    size: usize,
) -> NonNull<u8> {
    let new_offset = block_offset(head, alignment);
    if new_offset != old_offset {
        // SAFETY: both offsets leave room for `size` bytes in the host block;
        // `copy` handles the overlap.
        unsafe {
            std::ptr::copy(
                head.as_ptr().add(old_offset),
                head.as_ptr().add(new_offset),
                size,
            );
        }
    }
    place(head, alignment)
}

fn effective_alignment(config: &BackendConfig) -> Option<usize> {
    let requested = match config {
        BackendConfig::Alignment(alignment) => *alignment,
        _ => 0,
    };
    if !requested.is_power_of_two() {
        log::emit(
            LogRecord::new(
                LogLevel::Error,
                "bad_alignment",
                format!("alignment {requested} is not a power of two"),
            )
            .with_backend(builtin::ALIGNED),
        );
        return None;
    }
    Some(requested.max(HEADER_ALIGN))
}

// SAFETY: the block is at least HEADER_ALIGN aligned (user pointer aligned to
// >= HEADER_ALIGN, header size a multiple of it) and lies within the host
// block together with `size` bytes; reallocation moves contents along with
// the aligned offset.
unsafe impl Backend for AlignedBackend {
    fn name(&self) -> &str {
        "aligned"
    }

    fn allocate(&self, config: &BackendConfig, size: usize) -> Option<NonNull<u8>> {
        let alignment = effective_alignment(config)?;
        let head = host::malloc(host_size(size, alignment)?)?;
        Some(place(head, alignment))
    }

    unsafe fn reallocate(
        &self,
        _config: &BackendConfig,
        block: NonNull<u8>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: the prefix was written on allocation (trait contract).
        let prefix = unsafe { prefix_before::<AlignedPrefix>(block).read() };
        let alignment = prefix.alignment;
        let old_offset = block.as_ptr() as usize - prefix.head.as_ptr() as usize;
        let total = host_size(size, alignment)?;

        // SAFETY: prefix.head is the live host block.
        let head = unsafe { host::realloc(prefix.head, total) }?;
        // SAFETY: realloc kept `size` block bytes at `old_offset` within the
        // `total`-byte host block.
        Some(unsafe { relocate(head, old_offset, alignment, size) })
    }

    unsafe fn deallocate(&self, block: NonNull<u8>) {
        // SAFETY: the prefix was written on allocation (trait contract).
        let prefix = unsafe { prefix_before::<AlignedPrefix>(block).read() };
        // SAFETY: prefix.head is the live host block.
        unsafe { host::free(prefix.head) };
    }
}
