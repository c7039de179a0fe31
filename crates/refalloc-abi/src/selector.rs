//! C-shaped backend selector and its translation to [`AllocatorType`].
//!
//! C callers pass `{allocator, data}` where the meaning of `data` depends on
//! the backend:
//!
//! | Backend | `data` |
//! |---|---|
//! | custom | `const RefallocCustomAllocator *`, i.e. `void *[3]` (null slots allowed) |
//! | callback | the sink function itself (may be null) |
//! | aligned | `const size_t *` alignment |
//! | debug | `const RefallocDebugInfo *` (may be null) |
//! | registered | forwarded untouched |
//! | others | ignored |

use std::collections::HashSet;
use std::ffi::{CStr, c_char, c_int, c_void};

use parking_lot::Mutex;
use refalloc_core::registry::builtin;
use refalloc_core::{AllocatorType, BackendConfig, CallbackFn, CustomAllocator, DebugSite};

/// `{allocator, data}` backend selector.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RefallocAllocatorType {
    pub allocator: c_int,
    pub data: *mut c_void,
}

/// Allocation site supplied by C callers of the debug backend.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RefallocDebugInfo {
    pub file: *const c_char,
    pub line: c_int,
    pub function: *const c_char,
}

/// C layout of the custom backend's triple.
pub type RefallocCustomAllocator = CustomAllocator;

static INTERNED: Mutex<Option<HashSet<&'static str>>> = parking_lot::const_mutex(None);

/// Give a C string a process lifetime so it can sit in a [`DebugSite`].
///
/// Each distinct string is leaked once.
fn intern(raw: *const c_char) -> &'static str {
    if raw.is_null() {
        return "<unknown>";
    }
    // SAFETY: callers pass NUL-terminated strings.
    let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy();
    let mut set = INTERNED.lock();
    let set = set.get_or_insert_with(HashSet::new);
    if let Some(existing) = set.get(text.as_ref()) {
        return *existing;
    }
    let leaked: &'static str = Box::leak(text.into_owned().into_boxed_str());
    set.insert(leaked);
    leaked
}

/// # Safety
///
/// `info` must be null or point to a valid [`RefallocDebugInfo`] whose
/// strings are null or NUL-terminated.
unsafe fn debug_site(info: *const RefallocDebugInfo) -> DebugSite {
    // SAFETY: caller contract.
    let Some(info) = (unsafe { info.as_ref() }) else {
        return DebugSite::UNKNOWN;
    };
    DebugSite::new(
        intern(info.file),
        u32::try_from(info.line).unwrap_or(0),
        intern(info.function),
    )
}

impl RefallocAllocatorType {
    /// Translate to the core selector.
    ///
    /// # Safety
    ///
    /// `data` must match the table in the module docs for `allocator`.
    #[must_use]
    pub unsafe fn to_allocator_type(self) -> AllocatorType {
        let index = self.allocator;
        let data = self.data;
        let config = match index {
            builtin::CUSTOM => {
                // SAFETY: custom selectors carry a triple pointer or null.
                match unsafe { data.cast::<RefallocCustomAllocator>().as_ref() } {
                    Some(chain) => BackendConfig::Custom(*chain),
                    None => BackendConfig::None,
                }
            }
            builtin::CALLBACK => {
                // SAFETY: callback selectors carry the sink function pointer;
                // a nullable fn pointer has the same layout as `void*`.
                let sink = unsafe { std::mem::transmute::<*mut c_void, Option<CallbackFn>>(data) };
                BackendConfig::Callback(sink)
            }
            builtin::ALIGNED => {
                // SAFETY: aligned selectors carry a pointer to the alignment.
                let alignment = unsafe { data.cast::<usize>().as_ref() }.copied().unwrap_or(0);
                BackendConfig::Alignment(alignment)
            }
            // SAFETY: debug selectors carry a debug-info pointer or null.
            builtin::DEBUG => BackendConfig::Debug(unsafe { debug_site(data.cast()) }),
            builtin::STATIC | builtin::STANDARD | builtin::BOUNDS_CHECK => BackendConfig::None,
            _ => BackendConfig::Opaque(data),
        };
        AllocatorType::with_config(index, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_selector_reads_alignment() {
        let mut alignment = 64usize;
        let c = RefallocAllocatorType {
            allocator: builtin::ALIGNED,
            data: (&raw mut alignment).cast(),
        };
        // SAFETY: data points to a usize.
        let ty = unsafe { c.to_allocator_type() };
        assert_eq!(ty.index(), builtin::ALIGNED);
        assert!(matches!(ty.config(), BackendConfig::Alignment(64)));
    }

    #[test]
    fn debug_selector_interns_strings() {
        let info = RefallocDebugInfo {
            file: c"widget.c".as_ptr(),
            line: 17,
            function: c"make_widget".as_ptr(),
        };
        let c = RefallocAllocatorType {
            allocator: builtin::DEBUG,
            data: (&raw const info).cast_mut().cast(),
        };
        // SAFETY: data points to a valid debug info.
        let ty = unsafe { c.to_allocator_type() };
        let BackendConfig::Debug(site) = *ty.config() else {
            panic!("expected debug config");
        };
        assert_eq!(site, DebugSite::new("widget.c", 17, "make_widget"));
        assert!(std::ptr::eq(intern(info.file), site.file));
    }

    #[test]
    fn null_debug_info_is_unknown_site() {
        let c = RefallocAllocatorType {
            allocator: builtin::DEBUG,
            data: std::ptr::null_mut(),
        };
        // SAFETY: null is allowed.
        let ty = unsafe { c.to_allocator_type() };
        assert!(matches!(ty.config(), BackendConfig::Debug(site) if *site == DebugSite::UNKNOWN));
    }

    #[test]
    fn unknown_indices_forward_data() {
        let c = RefallocAllocatorType {
            allocator: 9,
            data: 0x40usize as *mut c_void,
        };
        // SAFETY: registered backends accept any data.
        let ty = unsafe { c.to_allocator_type() };
        assert_eq!(ty.config().opaque(), 0x40usize as *mut c_void);
    }
}
