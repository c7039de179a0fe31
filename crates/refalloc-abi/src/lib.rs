// All extern "C" ABI exports take raw pointers from C callers and forward
// the facade's contracts, so per-function safety docs would repeat them.
#![allow(clippy::missing_safety_doc)]
//! # refalloc-abi
//!
//! `extern "C"` boundary for the refalloc allocation facade.
//!
//! This crate produces a `cdylib` (`librefalloc.so`) exposing the facade and
//! backend registration to C callers. Each entry point translates the C
//! selector into a typed [`refalloc_core::AllocatorType`], checks pointer
//! preconditions, and delegates to `refalloc-core`.
//!
//! ```text
//! C caller -> ABI entry (this crate) -> selector translation -> facade -> backend
//! ```

pub mod memory_abi;
pub mod selector;

pub use memory_abi::*;
pub use selector::{RefallocAllocatorType, RefallocCustomAllocator, RefallocDebugInfo};
