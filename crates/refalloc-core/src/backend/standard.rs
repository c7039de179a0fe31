//! Standard backend: the host heap with no private metadata.

use std::ptr::NonNull;

use super::host;
use crate::registry::{Backend, BackendConfig};

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardBackend;

// SAFETY: host malloc returns memory aligned for any fundamental type and
// realloc preserves contents up to the smaller size.
unsafe impl Backend for StandardBackend {
    fn name(&self) -> &str {
        "standard"
    }

    fn allocate(&self, _config: &BackendConfig, size: usize) -> Option<NonNull<u8>> {
        host::malloc(size)
    }

    unsafe fn reallocate(
        &self,
        _config: &BackendConfig,
        block: NonNull<u8>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: block is a live host allocation (trait contract).
        unsafe { host::realloc(block, size) }
    }

    unsafe fn deallocate(&self, block: NonNull<u8>) {
        // SAFETY: block is a live host allocation (trait contract).
        unsafe { host::free(block) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_resize_free_cycle() {
        let backend = StandardBackend;
        let block = backend
            .allocate(&BackendConfig::None, 32)
            .expect("host allocation");
        // SAFETY: block is valid for 32 bytes.
        unsafe {
            std::ptr::write_bytes(block.as_ptr(), 0x5A, 32);
            let grown = backend
                .reallocate(&BackendConfig::None, block, 256)
                .expect("host reallocation");
            assert_eq!(*grown.as_ptr().add(31), 0x5A);
            backend.deallocate(grown);
        }
    }
}
