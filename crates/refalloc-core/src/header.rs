//! Shared per-block header and the opaque [`Memory`] handle.
//!
//! Every block handed out by the facade has this layout:
//!
//! ```text
//! [backend-private prefix][AllocatorHeader][user data ...]
//!                         ^ block          ^ Memory
//! ```
//!
//! Backends only ever see the *block* pointer (the header position) and
//! own whatever they place before it. The facade owns the header. All
//! pointer arithmetic between the three regions lives in this module.

use std::ffi::c_void;
use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::AtomicI32;

use crate::log::{self, LogLevel, LogRecord};

/// Callback invoked with the user pointer when a block's count reaches zero.
pub type Destructor = unsafe extern "C" fn(ptr: *mut c_void);

/// Backend index marking memory the facade does not manage.
pub const UNMANAGED: i32 = -1;

/// Reference count reported for unmanaged memory.
pub const UNMANAGED_REF_COUNT: i32 = i32::MAX;

/// Metadata placed immediately before every user pointer.
#[repr(C)]
pub struct AllocatorHeader {
    /// Registry index of the owning backend, or negative for unmanaged memory.
    pub(crate) backend: i32,
    pub(crate) ref_count: AtomicI32,
    pub(crate) destructor: Option<Destructor>,
}

/// Size of [`AllocatorHeader`] in bytes.
pub const HEADER_SIZE: usize = size_of::<AllocatorHeader>();

/// Alignment the header (and therefore every block pointer) requires.
pub const HEADER_ALIGN: usize = align_of::<AllocatorHeader>();

/// Handle to the user-data region of a facade block.
///
/// A `Memory` is just an address; it does not keep the block alive. Every
/// operation that reads the header is `unsafe` and requires the block to
/// still hold at least one reference.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Memory(NonNull<u8>);

// SAFETY: a Memory is an address. The header it points at is only touched
// through atomics (ref count) or through unsafe facade calls whose contracts
// put synchronization on the caller.
unsafe impl Send for Memory {}
// SAFETY: see above; shared access never mutates through `&Memory`.
unsafe impl Sync for Memory {}

impl Memory {
    /// Wrap a raw user pointer previously obtained from the facade.
    ///
    /// Returns `None` for null.
    #[must_use]
    pub fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Raw user-data pointer.
    #[must_use]
    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Raw user-data pointer as `void*`.
    #[must_use]
    pub const fn as_void(self) -> *mut c_void {
        self.0.as_ptr().cast()
    }

    /// User-data address.
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// View the first `len` bytes of user data as a mutable slice.
    ///
    /// # Safety
    ///
    /// The block must be live, at least `len` bytes long, and not aliased
    /// mutably elsewhere for the lifetime `'a`.
    #[must_use]
    pub unsafe fn as_mut_slice<'a>(self, len: usize) -> &'a mut [u8] {
        // SAFETY: caller guarantees `len` bytes of live, unaliased user data.
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), len) }
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Memory({:p})", self.0)
    }
}

impl fmt::Pointer for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.0, f)
    }
}

/// `ptr` as a `NonNull`, or fatal if stepping back from `from` wrapped to null.
///
/// Facade blocks never start at address zero, so a null here means `from`
/// was not a facade pointer.
fn stepped_back(ptr: *mut u8, from: *mut u8) -> NonNull<u8> {
    match NonNull::new(ptr) {
        Some(ptr) => ptr,
        None => log::fatal(
            LogRecord::new(
                LogLevel::Fatal,
                "null_pointer",
                format!("{from:p} is too close to address zero to be a facade block"),
            )
            .with_addr(from as usize),
        ),
    }
}

/// Header position (the backend's block pointer) for a user pointer.
pub(crate) fn block_of(mem: Memory) -> NonNull<u8> {
    stepped_back(mem.as_ptr().wrapping_sub(HEADER_SIZE), mem.as_ptr())
}

pub(crate) fn header_of(mem: Memory) -> *mut AllocatorHeader {
    block_of(mem).as_ptr().cast()
}

/// User pointer for a backend block.
///
/// # Safety
///
/// `block` must point to at least `HEADER_SIZE` bytes.
pub(crate) unsafe fn memory_of(block: NonNull<u8>) -> Memory {
    // SAFETY: the header occupies the first HEADER_SIZE bytes of the block.
    Memory(unsafe { block.add(HEADER_SIZE) })
}

/// Write a fresh header (count 1, no destructor) at `block`.
///
/// # Safety
///
/// `block` must be valid for writes of `HEADER_SIZE` bytes and aligned to
/// `HEADER_ALIGN`.
pub(crate) unsafe fn init_header(block: NonNull<u8>, backend: i32) -> Memory {
    debug_assert_eq!(block.as_ptr() as usize % HEADER_ALIGN, 0);
    // SAFETY: caller guarantees a writable, aligned header slot.
    unsafe {
        block.cast::<AllocatorHeader>().as_ptr().write(AllocatorHeader {
            backend,
            ref_count: AtomicI32::new(1),
            destructor: None,
        });
        memory_of(block)
    }
}

/// Backend index recorded in the header of `mem`.
///
/// # Safety
///
/// `mem` must carry a valid header.
pub(crate) unsafe fn backend_of(mem: Memory) -> i32 {
    // SAFETY: caller guarantees the header is valid.
    unsafe { (*header_of(mem)).backend }
}

/// Reference counter of `mem`.
///
/// # Safety
///
/// `mem` must carry a valid header that outlives `'a`.
pub(crate) unsafe fn ref_count_of<'a>(mem: Memory) -> &'a AtomicI32 {
    // SAFETY: caller guarantees the header is valid for 'a.
    unsafe { &(*header_of(mem)).ref_count }
}

/// Swap the destructor slot of `mem`, returning the previous value.
///
/// # Safety
///
/// `mem` must carry a valid header and no other thread may touch the
/// destructor slot concurrently.
pub(crate) unsafe fn replace_destructor(mem: Memory, new: Option<Destructor>) -> Option<Destructor> {
    // SAFETY: caller guarantees exclusive access to a valid header.
    unsafe { std::ptr::addr_of_mut!((*header_of(mem)).destructor).replace(new) }
}

/// Destructor currently stored for `mem`.
///
/// # Safety
///
/// `mem` must carry a valid header.
pub(crate) unsafe fn destructor_of(mem: Memory) -> Option<Destructor> {
    // SAFETY: caller guarantees the header is valid.
    unsafe { (*header_of(mem)).destructor }
}

/// Location of a backend-private prefix `P` stored immediately before `block`.
pub(crate) fn prefix_before<P>(block: NonNull<u8>) -> *mut P {
    block.as_ptr().wrapping_sub(size_of::<P>()).cast()
}

/// Block pointer that follows a prefix `P` written at the start of `raw`.
///
/// # Safety
///
/// `raw` must point to an allocation of at least `size_of::<P>()` bytes.
pub(crate) unsafe fn block_after<P>(raw: NonNull<u8>) -> NonNull<u8> {
    // SAFETY: caller guarantees the allocation covers the prefix.
    unsafe { raw.add(size_of::<P>()) }
}

/// Start of the allocation whose prefix `P` precedes `block`.
pub(crate) fn raw_before<P>(block: NonNull<u8>) -> NonNull<u8> {
    stepped_back(prefix_before::<P>(block).cast::<u8>(), block.as_ptr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_three_fields_of_natural_alignment() {
        assert_eq!(HEADER_SIZE, 2 * size_of::<i32>() + size_of::<usize>());
        assert_eq!(HEADER_ALIGN, align_of::<usize>());
    }

    #[test]
    fn destructor_option_is_pointer_sized() {
        assert_eq!(size_of::<Option<Destructor>>(), size_of::<usize>());
    }

    #[test]
    fn block_and_memory_offsets_are_inverse() {
        let mut storage = [0u64; 8];
        let block = NonNull::new(storage.as_mut_ptr().cast::<u8>()).expect("non-null");
        // SAFETY: storage is 64 bytes, aligned for the header.
        let mem = unsafe { init_header(block, 3) };
        assert_eq!(mem.addr() - block.as_ptr() as usize, HEADER_SIZE);
        assert_eq!(block_of(mem), block);
        // SAFETY: header was just written.
        unsafe {
            assert_eq!(backend_of(mem), 3);
            assert_eq!(
                ref_count_of(mem).load(std::sync::atomic::Ordering::Relaxed),
                1
            );
            assert!(destructor_of(mem).is_none());
        }
    }

    #[test]
    fn prefix_helpers_round_trip() {
        let mut storage = [0u64; 8];
        let raw = NonNull::new(storage.as_mut_ptr().cast::<u8>()).expect("non-null");
        // SAFETY: storage is larger than the [usize; 2] prefix.
        let block = unsafe { block_after::<[usize; 2]>(raw) };
        assert_eq!(block.as_ptr() as usize - raw.as_ptr() as usize, 16);
        assert_eq!(raw_before::<[usize; 2]>(block), raw);
        assert_eq!(prefix_before::<[usize; 2]>(block).cast::<u8>(), raw.as_ptr());
    }

    #[test]
    #[should_panic(expected = "too close to address zero")]
    fn block_below_address_zero_is_fatal() {
        let mem = Memory::from_raw(HEADER_SIZE as *mut u8).expect("non-null");
        let _ = block_of(mem);
    }

    #[test]
    #[should_panic(expected = "too close to address zero")]
    fn prefix_below_address_zero_is_fatal() {
        let block = NonNull::new(size_of::<usize>() as *mut u8).expect("non-null");
        let _ = raw_before::<usize>(block);
    }

    #[test]
    fn from_raw_rejects_null() {
        assert!(Memory::from_raw(std::ptr::null_mut()).is_none());
    }
}
