//! Backend registry.
//!
//! A fixed table of [`MAX_BACKENDS`] slots mapping small indices to
//! [`Backend`] implementations. The seven built-ins occupy indices 0..=6
//! from process start; indices 0..=3 can never be replaced. Remaining slots
//! are claimed at runtime with [`BackendRegistry::register`].
//!
//! The table sits behind a `parking_lot::RwLock`. Lookups clone the slot's
//! `Arc` and release the lock before the backend runs, so a backend (or a
//! callback it fires) may re-enter the facade.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

use crate::backend::{
    AlignedBackend, BoundsCheckBackend, CallbackBackend, CallbackFn, CustomAllocator,
    CustomBackend, DebugBackend, StandardBackend, StaticBackend,
};
use crate::error::RegistryError;
use crate::header::UNMANAGED;
use crate::log::{self, LogLevel, LogRecord};
use crate::tracking::DebugSite;

/// Number of registry slots.
pub const MAX_BACKENDS: usize = 20;

/// Indices below this value can never be registered over.
pub const RESERVED_BACKENDS: i32 = 4;

/// Indices of the built-in backends.
pub mod builtin {
    pub const STATIC: i32 = 0;
    pub const STANDARD: i32 = 1;
    pub const CUSTOM: i32 = 2;
    pub const CALLBACK: i32 = 3;
    pub const ALIGNED: i32 = 4;
    pub const BOUNDS_CHECK: i32 = 5;
    pub const DEBUG: i32 = 6;
}

const _: () = assert!(MAX_BACKENDS >= 7, "registry must hold the built-in backends");

/// C-shaped allocate function: `(data, size) -> ptr`.
pub type HostAllocateFn = unsafe extern "C" fn(data: *mut c_void, size: usize) -> *mut c_void;
/// C-shaped reallocate function: `(data, ptr, size) -> ptr`.
pub type HostReallocateFn =
    unsafe extern "C" fn(data: *mut c_void, ptr: *mut c_void, size: usize) -> *mut c_void;
/// C-shaped deallocate function: `(ptr)`.
pub type HostDeallocateFn = unsafe extern "C" fn(ptr: *mut c_void);

/// Per-request backend configuration.
#[derive(Debug, Clone, Copy, Default)]
pub enum BackendConfig {
    #[default]
    None,
    /// Chained allocate/reallocate/deallocate triple for the custom backend.
    Custom(CustomAllocator),
    /// Event sink for the callback backend.
    Callback(Option<CallbackFn>),
    /// Power-of-two alignment for the aligned backend.
    Alignment(usize),
    /// Allocation site recorded by the debug backend.
    Debug(DebugSite),
    /// Untyped data forwarded to host-registered backends.
    Opaque(*mut c_void),
}

impl BackendConfig {
    /// Data pointer forwarded to C-shaped host functions.
    #[must_use]
    pub fn opaque(&self) -> *mut c_void {
        match self {
            Self::Opaque(data) => *data,
            _ => std::ptr::null_mut(),
        }
    }
}

/// Backend selector plus its per-request configuration.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorType {
    index: i32,
    config: BackendConfig,
}

impl AllocatorType {
    /// Never allocates; see [`crate::backend::static_alloc`].
    pub const STATIC: Self = Self::new(builtin::STATIC, BackendConfig::None);
    /// Host heap, no private metadata.
    pub const STANDARD: Self = Self::new(builtin::STANDARD, BackendConfig::None);
    /// Guard bytes around every block.
    pub const BOUNDS_CHECK: Self = Self::new(builtin::BOUNDS_CHECK, BackendConfig::None);
    /// Selects nothing; allocation always fails.
    pub const UNMANAGED: Self = Self::new(UNMANAGED, BackendConfig::None);

    const fn new(index: i32, config: BackendConfig) -> Self {
        Self { index, config }
    }

    /// Chain to an external allocator triple.
    #[must_use]
    pub const fn custom(chain: CustomAllocator) -> Self {
        Self::new(builtin::CUSTOM, BackendConfig::Custom(chain))
    }

    /// Standard allocation reporting lifecycle events to `sink`.
    ///
    /// # Safety
    ///
    /// `sink` must be safe to call with any [`crate::backend::CallbackEvent`]
    /// from any thread. It may enlarge the size it is handed on pre events
    /// but must not otherwise touch the block.
    #[must_use]
    pub const unsafe fn callback(sink: Option<CallbackFn>) -> Self {
        Self::new(builtin::CALLBACK, BackendConfig::Callback(sink))
    }

    /// Host allocation whose user pointer is a multiple of `alignment`.
    #[must_use]
    pub const fn aligned(alignment: usize) -> Self {
        Self::new(builtin::ALIGNED, BackendConfig::Alignment(alignment))
    }

    /// Host allocation tracked in the debug ledger.
    #[must_use]
    pub const fn debug(site: DebugSite) -> Self {
        Self::new(builtin::DEBUG, BackendConfig::Debug(site))
    }

    /// A runtime-registered backend, with untyped data forwarded to it.
    #[must_use]
    pub const fn registered(index: i32, data: *mut c_void) -> Self {
        Self::new(index, BackendConfig::Opaque(data))
    }

    /// A backend index with an explicit configuration.
    #[must_use]
    pub const fn with_config(index: i32, config: BackendConfig) -> Self {
        Self::new(index, config)
    }

    #[must_use]
    pub const fn index(&self) -> i32 {
        self.index
    }

    #[must_use]
    pub const fn config(&self) -> &BackendConfig {
        &self.config
    }
}

/// An allocation strategy occupying a registry slot.
///
/// Backends operate on *block* pointers: the position where the facade
/// writes its shared header. Anything a backend stores for itself must live
/// before the block (or past its end) and be reversed by the backend.
///
/// # Safety
///
/// Implementations must uphold:
/// - `allocate` returns `None` or a block valid for reads and writes of
///   `size` bytes, aligned to [`crate::header::HEADER_ALIGN`].
/// - `reallocate` returns `None`, or a block with the same guarantees for
///   the new size whose first `min(old, new)` bytes equal the old block's.
/// - `deallocate` releases exactly the storage behind `block`.
pub unsafe trait Backend: Send + Sync {
    /// Short name used in diagnostics.
    fn name(&self) -> &str;

    /// Whether this backend has an allocate operation at all.
    fn can_allocate(&self) -> bool {
        true
    }

    fn allocate(&self, config: &BackendConfig, size: usize) -> Option<NonNull<u8>>;

    /// Resize a block previously returned by this backend.
    ///
    /// # Safety
    ///
    /// `block` must have come from this backend's `allocate`/`reallocate`
    /// and must not have been deallocated.
    unsafe fn reallocate(
        &self,
        config: &BackendConfig,
        block: NonNull<u8>,
        size: usize,
    ) -> Option<NonNull<u8>>;

    /// Release a block previously returned by this backend.
    ///
    /// # Safety
    ///
    /// Same as [`Backend::reallocate`]; `block` is dead afterwards.
    unsafe fn deallocate(&self, block: NonNull<u8>);
}

/// Adapts a C-shaped function triple to [`Backend`].
///
/// A missing allocate function makes every allocation fail. Missing
/// reallocate or deallocate functions turn those operations into no-ops
/// (a failed resize, or a deliberate leak).
#[derive(Clone, Copy)]
pub struct HostBackend {
    allocate: Option<HostAllocateFn>,
    reallocate: Option<HostReallocateFn>,
    deallocate: Option<HostDeallocateFn>,
}

impl HostBackend {
    /// # Safety
    ///
    /// The functions must behave like `malloc`/`realloc`/`free` with an extra
    /// leading data argument, return memory aligned to at least pointer
    /// width, and be callable from any thread.
    #[must_use]
    pub const unsafe fn new(
        allocate: Option<HostAllocateFn>,
        reallocate: Option<HostReallocateFn>,
        deallocate: Option<HostDeallocateFn>,
    ) -> Self {
        Self {
            allocate,
            reallocate,
            deallocate,
        }
    }
}

impl fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBackend")
            .field("allocate", &self.allocate.map(|p| p as *const ()))
            .field("reallocate", &self.reallocate.map(|p| p as *const ()))
            .field("deallocate", &self.deallocate.map(|p| p as *const ()))
            .finish()
    }
}

// SAFETY: `HostBackend::new` puts the malloc-like contract on its caller.
unsafe impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn can_allocate(&self) -> bool {
        self.allocate.is_some()
    }

    fn allocate(&self, config: &BackendConfig, size: usize) -> Option<NonNull<u8>> {
        let allocate = self.allocate?;
        // SAFETY: the function honours the malloc contract (see `new`).
        let ptr = unsafe { allocate(config.opaque(), size) };
        NonNull::new(ptr.cast())
    }

    unsafe fn reallocate(
        &self,
        config: &BackendConfig,
        block: NonNull<u8>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let reallocate = self.reallocate?;
        // SAFETY: block came from this triple's allocate (caller contract).
        let ptr = unsafe { reallocate(config.opaque(), block.as_ptr().cast(), size) };
        NonNull::new(ptr.cast())
    }

    unsafe fn deallocate(&self, block: NonNull<u8>) {
        if let Some(deallocate) = self.deallocate {
            // SAFETY: block came from this triple's allocate (caller contract).
            unsafe { deallocate(block.as_ptr().cast()) };
        }
    }
}

type Slots = [Option<Arc<dyn Backend>>; MAX_BACKENDS];

/// Fixed-capacity table of backends.
pub struct BackendRegistry {
    slots: RwLock<Slots>,
}

impl BackendRegistry {
    /// A registry with every slot empty.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            slots: RwLock::new(std::array::from_fn(|_| None)),
        }
    }

    /// A registry with the seven built-in backends installed.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        {
            let mut slots = registry.slots.write();
            slots[builtin::STATIC as usize] = Some(Arc::new(StaticBackend));
            slots[builtin::STANDARD as usize] = Some(Arc::new(StandardBackend));
            slots[builtin::CUSTOM as usize] = Some(Arc::new(CustomBackend));
            slots[builtin::CALLBACK as usize] = Some(Arc::new(CallbackBackend));
            slots[builtin::ALIGNED as usize] = Some(Arc::new(AlignedBackend));
            slots[builtin::BOUNDS_CHECK as usize] = Some(Arc::new(BoundsCheckBackend));
            slots[builtin::DEBUG as usize] = Some(Arc::new(DebugBackend));
        }
        registry
    }

    /// Backend at `index`, or `None` for an empty or out-of-range slot.
    #[must_use]
    pub fn get(&self, index: i32) -> Option<Arc<dyn Backend>> {
        let slot = usize::try_from(index).ok()?;
        self.slots.read().get(slot)?.clone()
    }

    /// Whether `index` currently holds a backend.
    #[must_use]
    pub fn is_occupied(&self, index: i32) -> bool {
        self.get(index).is_some()
    }

    /// Diagnostic name of the backend at `index`.
    #[must_use]
    pub fn backend_name(&self, index: i32) -> Option<String> {
        self.get(index).map(|b| b.name().to_owned())
    }

    /// Install `backend` at `index`, returning whatever it replaced.
    ///
    /// Replacing an occupied slot is allowed but logged as a warning: blocks
    /// already allocated there will be resized and freed by the new backend.
    pub fn try_register(
        &self,
        index: i32,
        backend: Arc<dyn Backend>,
    ) -> Result<Option<Arc<dyn Backend>>, RegistryError> {
        if index < 0 {
            return Err(RegistryError::OutOfRange {
                index,
                capacity: MAX_BACKENDS,
            });
        }
        if index < RESERVED_BACKENDS {
            return Err(RegistryError::Reserved { index });
        }
        let slot = index as usize;
        if slot >= MAX_BACKENDS {
            return Err(RegistryError::OutOfRange {
                index,
                capacity: MAX_BACKENDS,
            });
        }

        let mut slots = self.slots.write();
        let previous = slots[slot].replace(Arc::clone(&backend));
        drop(slots);

        if let Some(old) = &previous {
            log::emit(
                LogRecord::new(
                    LogLevel::Warn,
                    "backend_replaced",
                    format!(
                        "replacing backend `{}` at index {index} with `{}`",
                        old.name(),
                        backend.name()
                    ),
                )
                .with_backend(index),
            );
        }
        Ok(previous)
    }

    /// Like [`Self::try_register`], but a reserved or out-of-range index is
    /// a fatal usage error.
    pub fn register(&self, index: i32, backend: Arc<dyn Backend>) {
        if let Err(err) = self.try_register(index, backend) {
            log::fatal(
                LogRecord::new(LogLevel::Fatal, "registry_misuse", err.to_string())
                    .with_backend(index),
            );
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

static GLOBAL_REGISTRY: LazyLock<BackendRegistry> = LazyLock::new(BackendRegistry::with_builtins);

/// The process-wide registry the facade dispatches through.
#[must_use]
pub fn global_registry() -> &'static BackendRegistry {
    &GLOBAL_REGISTRY
}

/// Register `backend` at `index` in the process-wide registry.
pub fn register_backend(index: i32, backend: Arc<dyn Backend>) {
    global_registry().register(index, backend);
}

/// Register a C-shaped function triple at `index` in the process-wide registry.
///
/// # Safety
///
/// See [`HostBackend::new`].
pub unsafe fn register_functions(
    index: i32,
    allocate: Option<HostAllocateFn>,
    reallocate: Option<HostReallocateFn>,
    deallocate: Option<HostDeallocateFn>,
) {
    // SAFETY: forwarded caller contract.
    let backend = unsafe { HostBackend::new(allocate, reallocate, deallocate) };
    register_backend(index, Arc::new(backend));
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn null_allocate(_data: *mut c_void, _size: usize) -> *mut c_void {
        std::ptr::null_mut()
    }

    fn null_backend() -> Arc<dyn Backend> {
        // SAFETY: the allocate function never returns memory.
        Arc::new(unsafe { HostBackend::new(Some(null_allocate), None, None) })
    }

    #[test]
    fn builtins_fill_first_seven_slots() {
        let registry = BackendRegistry::with_builtins();
        let names: Vec<_> = (0..7)
            .map(|i| registry.backend_name(i).expect("built-in"))
            .collect();
        assert_eq!(
            names,
            [
                "static",
                "standard",
                "custom",
                "callback",
                "aligned",
                "bounds_check",
                "debug"
            ]
        );
        for index in 7..MAX_BACKENDS as i32 {
            assert!(!registry.is_occupied(index));
        }
    }

    #[test]
    fn out_of_range_lookup_is_empty() {
        let registry = BackendRegistry::with_builtins();
        assert!(registry.get(-1).is_none());
        assert!(registry.get(MAX_BACKENDS as i32).is_none());
    }

    #[test]
    fn reserved_and_out_of_range_indices_are_refused() {
        let registry = BackendRegistry::empty();
        for index in 0..RESERVED_BACKENDS {
            assert_eq!(
                registry.try_register(index, null_backend()).err(),
                Some(RegistryError::Reserved { index })
            );
        }
        assert!(matches!(
            registry.try_register(-3, null_backend()),
            Err(RegistryError::OutOfRange { index: -3, .. })
        ));
        assert!(matches!(
            registry.try_register(MAX_BACKENDS as i32, null_backend()),
            Err(RegistryError::OutOfRange { .. })
        ));
    }

    #[test]
    fn replacing_an_occupied_slot_warns_and_returns_previous() {
        let registry = BackendRegistry::with_builtins();
        let first = registry.try_register(11, null_backend()).expect("register");
        assert!(first.is_none());

        let replaced = registry.try_register(11, null_backend()).expect("register");
        assert_eq!(replaced.map(|b| b.name().to_owned()).as_deref(), Some("host"));
        assert!(
            log::records_for("backend_replaced")
                .iter()
                .any(|r| r.backend == Some(11) && r.level == LogLevel::Warn)
        );
    }

    #[test]
    fn non_foundational_builtins_may_be_replaced() {
        let registry = BackendRegistry::with_builtins();
        let previous = registry
            .try_register(builtin::DEBUG, null_backend())
            .expect("debug slot is replaceable");
        assert_eq!(previous.map(|b| b.name().to_owned()).as_deref(), Some("debug"));
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn register_over_reserved_slot_is_fatal() {
        BackendRegistry::with_builtins().register(builtin::CALLBACK, null_backend());
    }

    #[test]
    fn host_backend_without_allocate_cannot_allocate() {
        // SAFETY: no functions at all.
        let backend = unsafe { HostBackend::new(None, None, None) };
        assert!(!backend.can_allocate());
        assert!(backend.allocate(&BackendConfig::None, 64).is_none());
    }

    #[test]
    fn opaque_config_only_forwards_opaque_data() {
        let mut value = 5u32;
        let data = (&raw mut value).cast::<c_void>();
        assert_eq!(BackendConfig::Opaque(data).opaque(), data);
        assert!(BackendConfig::Alignment(16).opaque().is_null());
    }
}
