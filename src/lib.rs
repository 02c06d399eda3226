//! Allocation tracking and access checking for manually managed memory.
//!
//! Every raw allocate, free, reallocate and access goes through a
//! [`MemoryGuard`], which keeps a registry of live blocks, validates
//! accesses against it, and keeps frees from racing with accesses.
//!
//! ```no_run
//! use offheap_guard::{GuardConfig, MemoryGuard};
//!
//! let guard = MemoryGuard::new(GuardConfig {
//!     safe_memory_management: true,
//!     safe_memory_access: true,
//!     concurrent_access_check: true,
//!     ..Default::default()
//! })?;
//! let address = guard.allocate(64)?;
//! unsafe {
//!     guard.put::<u32>(address, 0x0102_0304)?;
//!     assert!(guard.get::<u64>(address + 60).is_err());
//!     guard.free(address)?;
//! }
//! # Ok::<(), offheap_guard::GuardError>(())
//! ```

pub mod alloc;
pub mod config;
pub mod diag;
pub mod error;
mod serialize;
pub(crate) mod util;

pub use alloc::{
    guard::{GuardBuilder, MemoryGuard},
    listener::{AccessKind, IllegalAccessListener, MemoryListener},
    raw::{Location, RawMemory, SystemMemory},
    registry::{AllocRegistry, MemoryBlock},
};
pub use config::{GuardConfig, RegistryStrategy};
pub use error::{ConfigError, GuardError, Result};
