//! Host allocation primitives (`malloc`/`realloc`/`free`).

use std::ptr::NonNull;

#[inline]
pub(crate) fn malloc(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: malloc accepts any size and returns null on failure.
    NonNull::new(unsafe { libc::malloc(size) }.cast())
}

/// # Safety
///
/// `ptr` must come from [`malloc`] or [`realloc`] and still be live.
#[inline]
pub(crate) unsafe fn realloc(ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    // SAFETY: caller guarantees ptr is a live host allocation.
    NonNull::new(unsafe { libc::realloc(ptr.as_ptr().cast(), size) }.cast())
}

/// # Safety
///
/// `ptr` must come from [`malloc`] or [`realloc`] and still be live.
#[inline]
pub(crate) unsafe fn free(ptr: NonNull<u8>) {
    // SAFETY: caller guarantees ptr is a live host allocation.
    unsafe { libc::free(ptr.as_ptr().cast()) }
}
