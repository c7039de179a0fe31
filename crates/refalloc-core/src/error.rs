//! Recoverable error types.
//!
//! Usage errors (over-release, guard corruption, null pointers at the C
//! boundary) are not represented here; they are fatal and go through
//! [`crate::log::fatal`].

use thiserror::Error;

/// Why an allocate/reallocate request produced no memory.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("allocation size {size} overflows once the {header}-byte header is added")]
    SizeOverflow { size: usize, header: usize },
    #[error("no backend with an allocate operation at index {index}")]
    NoBackend { index: i32 },
    #[error("backend {index} could not provide {size} bytes")]
    BackendFailed { index: i32, size: usize },
    #[error("memory is not managed by the allocation facade")]
    Unmanaged,
}

/// Why a backend registration was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("index {index} is reserved for a foundational built-in backend")]
    Reserved { index: i32 },
    #[error("index {index} is outside the registry (capacity {capacity})")]
    OutOfRange { index: i32, capacity: usize },
}
