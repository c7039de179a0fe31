//! Facade and registry entry points.
//!
//! Failures that the Rust API reports as `Err` come back as null pointers.
//! Null pointers handed to retain/ref_count/deallocate/set_destructor are
//! fatal usage errors.

use std::ffi::{c_int, c_void};

use refalloc_core::log::{self, LogLevel, LogRecord};
use refalloc_core::registry::{HostAllocateFn, HostDeallocateFn, HostReallocateFn};
use refalloc_core::{Destructor, Memory, memory};

use crate::selector::RefallocAllocatorType;

fn non_null(ptr: *mut c_void, operation: &'static str) -> Memory {
    match Memory::from_raw(ptr.cast()) {
        Some(mem) => mem,
        None => log::fatal(LogRecord::new(
            LogLevel::Fatal,
            "null_pointer",
            format!("{operation}: ptr must not be null"),
        )),
    }
}

fn into_raw(result: Result<Memory, refalloc_core::AllocError>) -> *mut c_void {
    result.map_or(std::ptr::null_mut(), Memory::as_void)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn refalloc_memory_allocate(
    allocator: RefallocAllocatorType,
    size: usize,
) -> *mut c_void {
    // SAFETY: the caller pairs `data` with its backend.
    let ty = unsafe { allocator.to_allocator_type() };
    into_raw(memory::allocate(ty, size))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn refalloc_memory_reallocate(
    allocator: RefallocAllocatorType,
    ptr: *mut c_void,
    size: usize,
) -> *mut c_void {
    // SAFETY: the caller pairs `data` with its backend.
    let ty = unsafe { allocator.to_allocator_type() };
    // SAFETY: a non-null ptr is a live facade block owned by the caller.
    into_raw(unsafe { memory::reallocate(ty, Memory::from_raw(ptr.cast()), size) })
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn refalloc_memory_retain(ptr: *mut c_void) -> *mut c_void {
    let mem = non_null(ptr, "refalloc_memory_retain");
    // SAFETY: the caller holds a reference to a live block.
    unsafe { memory::retain(mem) }.as_void()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn refalloc_memory_ref_count(ptr: *mut c_void) -> i32 {
    let mem = non_null(ptr, "refalloc_memory_ref_count");
    // SAFETY: the caller holds a reference to a live block.
    unsafe { memory::ref_count(mem) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn refalloc_memory_deallocate(ptr: *mut c_void) {
    let mem = non_null(ptr, "refalloc_memory_deallocate");
    // SAFETY: the caller gives up one reference to a live block.
    unsafe { memory::deallocate(mem) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn refalloc_memory_set_destructor(
    ptr: *mut c_void,
    destructor: Option<Destructor>,
) -> Option<Destructor> {
    let mem = non_null(ptr, "refalloc_memory_set_destructor");
    // SAFETY: the caller owns the block and does not race on its destructor.
    unsafe { memory::set_destructor(mem, destructor) }
}

/// Register a C function triple at `index` (4 or above).
#[unsafe(no_mangle)]
pub unsafe extern "C" fn refalloc_allocator_add(
    index: c_int,
    allocate: Option<HostAllocateFn>,
    reallocate: Option<HostReallocateFn>,
    deallocate: Option<HostDeallocateFn>,
) {
    // SAFETY: the caller supplies malloc-like functions.
    unsafe { refalloc_core::register_functions(index, allocate, reallocate, deallocate) }
}
