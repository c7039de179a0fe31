//! Custom backend: chains to a caller-supplied allocator triple.
//!
//! The triple is written into the three pointer-sized slots in front of
//! the block, so resize and free find their delegate from the block alone,
//! whichever configuration the caller passes later. The chained functions
//! always receive a null `data` argument.

use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;

use crate::header::{block_after, prefix_before, raw_before};
use crate::registry::{Backend, BackendConfig, HostAllocateFn, HostDeallocateFn, HostReallocateFn};

/// External allocate/reallocate/deallocate triple.
///
/// Layout-compatible with a C `void *[3]`; any slot may be null. A null
/// allocate slot makes every allocation fail.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CustomAllocator {
    allocate: Option<HostAllocateFn>,
    reallocate: Option<HostReallocateFn>,
    deallocate: Option<HostDeallocateFn>,
}

/// Bytes the triple occupies in front of each block.
pub const CUSTOM_PREFIX: usize = size_of::<CustomAllocator>();

const _: () = assert!(CUSTOM_PREFIX == 3 * size_of::<usize>());

impl CustomAllocator {
    /// # Safety
    ///
    /// The functions must behave like `malloc`/`realloc`/`free` (ignoring the
    /// leading data argument), return memory aligned to at least pointer
    /// width, and be callable from any thread. A missing `reallocate` makes
    /// every resize fail; a missing `deallocate` leaks on free.
    #[must_use]
    pub const unsafe fn new(
        allocate: HostAllocateFn,
        reallocate: Option<HostReallocateFn>,
        deallocate: Option<HostDeallocateFn>,
    ) -> Self {
        Self {
            allocate: Some(allocate),
            reallocate,
            deallocate,
        }
    }
}

impl fmt::Debug for CustomAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomAllocator")
            .field("allocate", &self.allocate.map(|p| p as *const ()))
            .field("reallocate", &self.reallocate.map(|p| p as *const ()))
            .field("deallocate", &self.deallocate.map(|p| p as *const ()))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CustomBackend;

impl CustomBackend {
    /// # Safety
    ///
    /// `block` must be a live custom-backend block.
    unsafe fn chain_of(block: NonNull<u8>) -> CustomAllocator {
        // SAFETY: the triple was written in front of the block on allocation.
        unsafe { prefix_before::<CustomAllocator>(block).read() }
    }
}

// SAFETY: `CustomAllocator::new` puts the malloc contract on the triple; the
// prefix is pointer-sized slots so the block keeps the delegate's alignment.
unsafe impl Backend for CustomBackend {
    fn name(&self) -> &str {
        "custom"
    }

    fn allocate(&self, config: &BackendConfig, size: usize) -> Option<NonNull<u8>> {
        let BackendConfig::Custom(chain) = config else {
            return None;
        };
        let allocate = chain.allocate?;
        let total = size.checked_add(CUSTOM_PREFIX)?;
        // SAFETY: the chained allocate honours the malloc contract.
        let raw = NonNull::new(unsafe { allocate(std::ptr::null_mut(), total) })?;
        let raw = raw.cast::<u8>();
        // SAFETY: raw is valid for `total` bytes, the prefix comes first.
        unsafe {
            raw.cast::<CustomAllocator>().as_ptr().write(*chain);
            Some(block_after::<CustomAllocator>(raw))
        }
    }

    unsafe fn reallocate(
        &self,
        _config: &BackendConfig,
        block: NonNull<u8>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: block is a live custom block (trait contract).
        let chain = unsafe { Self::chain_of(block) };
        let reallocate = chain.reallocate?;
        let total = size.checked_add(CUSTOM_PREFIX)?;
        let raw = raw_before::<CustomAllocator>(block);
        // SAFETY: raw is the chained allocation that holds this block.
        let resized =
            NonNull::new(unsafe { reallocate(std::ptr::null_mut(), raw.as_ptr().cast(), total) })?;
        let resized = resized.cast::<u8>();
        // SAFETY: resized is valid for `total` bytes.
        unsafe {
            resized.cast::<CustomAllocator>().as_ptr().write(chain);
            Some(block_after::<CustomAllocator>(resized))
        }
    }

    unsafe fn deallocate(&self, block: NonNull<u8>) {
        // SAFETY: block is a live custom block (trait contract).
        let chain = unsafe { Self::chain_of(block) };
        if let Some(deallocate) = chain.deallocate {
            let raw = raw_before::<CustomAllocator>(block);
            // SAFETY: raw is the chained allocation that holds this block.
            unsafe { deallocate(raw.as_ptr().cast()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ALLOCS: AtomicUsize = AtomicUsize::new(0);
    static FREES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_allocate(_data: *mut c_void, size: usize) -> *mut c_void {
        ALLOCS.fetch_add(1, Ordering::SeqCst);
        // SAFETY: plain host malloc.
        unsafe { libc::malloc(size) }
    }

    unsafe extern "C" fn counting_free(ptr: *mut c_void) {
        FREES.fetch_add(1, Ordering::SeqCst);
        // SAFETY: ptr came from counting_allocate.
        unsafe { libc::free(ptr) }
    }

    #[test]
    fn block_sits_three_pointers_past_the_chained_allocation() {
        // SAFETY: malloc/free wrappers.
        let chain = unsafe { CustomAllocator::new(counting_allocate, None, Some(counting_free)) };
        let backend = CustomBackend;
        let block = backend
            .allocate(&BackendConfig::Custom(chain), 48)
            .expect("chained allocation");
        // SAFETY: block is live.
        unsafe {
            let stored = CustomBackend::chain_of(block);
            assert_eq!(stored.allocate.map(|f| f as usize), Some(counting_allocate as usize));
            assert!(stored.reallocate.is_none());
            assert!(stored.deallocate.is_some());
            assert!(backend.reallocate(&BackendConfig::None, block, 96).is_none());
            backend.deallocate(block);
        }
        assert!(ALLOCS.load(Ordering::SeqCst) >= 1);
        assert!(FREES.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn all_null_triple_never_allocates() {
        let slots = [std::ptr::null_mut::<c_void>(); 3];
        // SAFETY: every slot of the triple is nullable, so three nulls are a
        // valid CustomAllocator.
        let chain = unsafe { std::mem::transmute::<[*mut c_void; 3], CustomAllocator>(slots) };
        assert!(chain.allocate.is_none());
        assert!(CustomBackend.allocate(&BackendConfig::Custom(chain), 16).is_none());
    }

    #[test]
    fn allocate_requires_custom_config() {
        assert!(CustomBackend.allocate(&BackendConfig::None, 16).is_none());
    }
}
