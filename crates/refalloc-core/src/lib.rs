//! Reference-counted allocation facade with pluggable backends.
//!
//! Every allocation goes through one facade ([`memory`]) and is served by a
//! backend chosen from a fixed-size registry ([`registry`]). Each block
//! carries a shared header right before the user pointer holding the owning
//! backend index, an atomic reference count, and an optional destructor, so
//! retain/release work the same whichever backend produced the block.
//!
//! # Architecture
//!
//! - **Header** (`header`): block layout, the [`Memory`] handle, offset math
//! - **Registry** (`registry`): backend table, [`Backend`] trait, [`AllocatorType`]
//! - **Facade** (`memory`): allocate, reallocate, retain, release, destructors
//! - **Backends** (`backend`): static, standard, custom, callback, aligned,
//!   bounds check, debug
//! - **Tracking** (`tracking`): live-allocation ledger behind the debug backend
//! - **Configuration** (`config`): log threshold and fatal-error behaviour
//! - **Logging** (`log`): structured records, fatal usage errors
//! - **Metrics** (`metrics`): atomic counters for observability
//!
//! ```
//! use refalloc_core::{AllocatorType, memory};
//!
//! let mem = memory::allocate(AllocatorType::STANDARD, 64).unwrap();
//! unsafe {
//!     memory::retain(mem);
//!     assert_eq!(memory::ref_count(mem), 2);
//!     memory::deallocate(mem);
//!     memory::deallocate(mem);
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod header;
pub mod log;
pub mod memory;
pub mod metrics;
pub mod registry;
pub mod tracking;

pub use backend::{CallbackEvent, CallbackFn, CustomAllocator};
pub use config::FatalMode;
pub use error::{AllocError, RegistryError};
pub use header::{Destructor, HEADER_SIZE, Memory, UNMANAGED, UNMANAGED_REF_COUNT};
pub use log::{LogLevel, LogRecord};
pub use metrics::{AllocatorMetrics, MetricsSnapshot};
pub use registry::{
    AllocatorType, Backend, BackendConfig, BackendRegistry, HostBackend, MAX_BACKENDS,
    RESERVED_BACKENDS, global_registry, register_backend, register_functions,
};
pub use tracking::{DebugSite, LeakReport, TrackedAllocation};
