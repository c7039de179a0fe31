//! The seven built-in backends.
//!
//! Each backend owns the metadata it places around the block pointer the
//! facade hands it:
//!
//! | Backend | Private layout |
//! |---|---|
//! | standard | none |
//! | custom | `[allocate][reallocate][deallocate][block]` |
//! | callback | `[sink][block]` |
//! | aligned | `[padding][head, alignment][block]` |
//! | bounds check | `[size][guard 0..8][block][guard 0..8]` |
//! | debug | none (entry in the tracking ledger) |
//! | static | `[max size][block]`, written by the buffer's owner |

mod host;

pub mod aligned;
pub mod bounds_check;
pub mod callback;
pub mod custom;
pub mod debug;
pub mod standard;
pub mod static_alloc;

pub use aligned::AlignedBackend;
pub use bounds_check::BoundsCheckBackend;
pub use callback::{CallbackBackend, CallbackEvent, CallbackFn};
pub use custom::{CustomAllocator, CustomBackend};
pub use debug::DebugBackend;
pub use standard::StandardBackend;
pub use static_alloc::StaticBackend;
