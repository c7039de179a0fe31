//! Callback backend: standard allocation that reports lifecycle events.
//!
//! The sink chosen at allocation time is stored one slot before the block.
//! Resize and free read it back from the block, so a block reports to the
//! same sink for its whole life regardless of the configuration passed to
//! later calls.

use std::ffi::c_void;
use std::mem::size_of;
use std::ptr::NonNull;

use super::host;
use crate::header::{block_after, prefix_before, raw_before};
use crate::log::{self, LogLevel, LogRecord};
use crate::registry::{Backend, BackendConfig, builtin};

/// Lifecycle event reported to a callback sink.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackEvent {
    /// Before the host allocation; the size may be enlarged.
    ///
    /// The size handed to the sink already covers the shared header and the
    /// bytes the caller asked for, so it is a floor: a sink that lowers it
    /// is clamped back up (and a `callback_shrink_ignored` record is logged).
    AllocatePre,
    /// After the host allocation; pointer is null on failure.
    AllocatePost,
    /// Before the host reallocation; the size may be enlarged. Same floor
    /// as [`CallbackEvent::AllocatePre`].
    ReallocatePre,
    /// After the host reallocation; pointer is null on failure.
    ReallocatePost,
    /// Before the host free; no size is supplied.
    DeallocatePre,
}

/// Event sink: `(event, block pointer, size)`.
///
/// The pointer is the backend block (the shared header position), null for
/// `AllocatePre`. The size is `None` for `DeallocatePre`.
pub type CallbackFn =
    unsafe extern "C" fn(event: CallbackEvent, ptr: *mut c_void, size: Option<&mut usize>);

type Sink = Option<CallbackFn>;

const SINK_PREFIX: usize = size_of::<Sink>();

#[derive(Debug, Clone, Copy, Default)]
pub struct CallbackBackend;

/// Fire `event` at `sink`, clamping the size to at least what was requested.
fn fire(sink: Sink, event: CallbackEvent, ptr: *mut u8, size: &mut usize) {
    if let Some(sink) = sink {
        let requested = *size;
        // SAFETY: `AllocatorType::callback` puts the sink contract on its caller.
        unsafe { sink(event, ptr.cast(), Some(&mut *size)) };
        if *size < requested {
            log::emit(
                LogRecord::new(
                    LogLevel::Debug,
                    "callback_shrink_ignored",
                    format!("{event:?} sink lowered {requested} to {}; keeping {requested}", *size),
                )
                .with_backend(builtin::CALLBACK)
                .with_size(requested),
            );
            *size = requested;
        }
    }
}

fn block_ptr(block: Option<NonNull<u8>>) -> *mut u8 {
    block.map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

// SAFETY: blocks are host allocations offset by one pointer-sized slot, so
// they keep pointer alignment; the stored sink is never moved by the facade.
unsafe impl Backend for CallbackBackend {
    fn name(&self) -> &str {
        "callback"
    }

    fn allocate(&self, config: &BackendConfig, size: usize) -> Option<NonNull<u8>> {
        let sink = match config {
            BackendConfig::Callback(sink) => *sink,
            _ => None,
        };
        let mut size = size;
        fire(sink, CallbackEvent::AllocatePre, std::ptr::null_mut(), &mut size);

        let block = size
            .checked_add(SINK_PREFIX)
            .and_then(host::malloc)
            .map(|raw| {
                // SAFETY: raw is valid for the prefix plus `size` bytes.
                unsafe {
                    raw.cast::<Sink>().as_ptr().write(sink);
                    block_after::<Sink>(raw)
                }
            });

        fire(sink, CallbackEvent::AllocatePost, block_ptr(block), &mut size);
        block
    }

    unsafe fn reallocate(
        &self,
        _config: &BackendConfig,
        block: NonNull<u8>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: the sink slot was written on allocation (trait contract).
        let sink = unsafe { prefix_before::<Sink>(block).read() };
        let mut size = size;
        fire(sink, CallbackEvent::ReallocatePre, block.as_ptr(), &mut size);

        let raw = raw_before::<Sink>(block);
        let resized = match size.checked_add(SINK_PREFIX) {
            // SAFETY: raw is the live host allocation behind this block.
            Some(total) => unsafe { host::realloc(raw, total) },
            None => None,
        };
        // SAFETY: realloc preserved the sink slot at the front.
        let resized = resized.map(|raw| unsafe { block_after::<Sink>(raw) });

        fire(sink, CallbackEvent::ReallocatePost, block_ptr(resized), &mut size);
        resized
    }

    unsafe fn deallocate(&self, block: NonNull<u8>) {
        // SAFETY: the sink slot was written on allocation (trait contract).
        let sink = unsafe { prefix_before::<Sink>(block).read() };
        if let Some(sink) = sink {
            // SAFETY: `AllocatorType::callback` puts the sink contract on its caller.
            unsafe { sink(CallbackEvent::DeallocatePre, block.as_ptr().cast(), None) };
        }
        // SAFETY: raw is the live host allocation behind this block.
        unsafe { host::free(raw_before::<Sink>(block)) };
    }
}
