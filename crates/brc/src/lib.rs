//! # BRC - Biased Reference Counting
//!
//! BRC is the object-lifetime subsystem of a managed-object runtime: every
//! heap object tracks how many live references point to it and is destroyed
//! exactly once when that count reaches zero, with or without a global lock.
//!
//! ## Overview
//!
//! - **Biased counts**: the allocating thread owns the object and updates a
//!   plain local count; other threads use an atomic shared field
//! - **Deferred merges**: a release that cannot be applied remotely is queued
//!   for the owner and folded in at its next safe point
//! - **Immortal objects**: static objects and objects promoted near counter
//!   overflow ignore all accounting
//! - **Weak references**: striped per-object lists, torn down before memory
//!   is released, with optional death callbacks
//! - **Single-threaded mode**: one reentrant lock and a plain count
//!
//! ## Quick Start
//!
//! ```rust
//! use brc::{Runtime, RuntimeConfig, SafepointKind, ThreadId};
//!
//! fn main() -> Result<(), brc::BrcError> {
//!     let runtime = Runtime::new(RuntimeConfig::default())?;
//!     let main = runtime.register_thread(ThreadId::unique())?;
//!
//!     let obj = runtime.allocate(&main, vec![1u8, 2, 3])?;
//!     let weak = unsafe { runtime.create_weak(&main, obj, None) };
//!
//!     unsafe {
//!         assert_eq!(obj.downcast_ref::<Vec<u8>>().map(Vec::len), Some(3));
//!         runtime.release(&main, obj);
//!     }
//!     assert!(runtime.dereference(&weak).is_none());
//!
//!     runtime.safepoint(&main, SafepointKind::BackEdge);
//!     runtime.unregister_thread(main);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       Runtime                              │
//! │  retain / release ─► owner? ─yes─► local count (plain)     │
//! │                        │                                   │
//! │                        no ──► shared field (atomic CAS)    │
//! │                                   │                        │
//! │                     nothing to subtract                    │
//! │                                   ▼                        │
//! │  ┌──────────────────────────────────────────────┐          │
//! │  │ BrcState: buckets[id % B] ─► thread records  │          │
//! │  │           record.objects_to_merge (stack)    │          │
//! │  └──────────────────────────────────────────────┘          │
//! │                                   │ safe point             │
//! │                                   ▼                        │
//! │               owner drains, merges, deallocates            │
//! │                                   │                        │
//! │   weak teardown ─► payload drop ─► Allocator::release      │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ### Shared Field
//!
//! ```text
//! ┌──────────────────────────────────┬───────┐
//! │           signed count           │ state │
//! │             63 - 2               │ 1 - 0 │
//! └──────────────────────────────────┴───────┘
//!
//! State: 0 none, 1 maybe-weakref, 2 queued, 3 merged
//! ```
//!
//! ## Safety
//!
//! [`ObjectRef`] is a raw handle. Lifetime operations are `unsafe` because
//! the caller vouches that it holds the reference it passes in:
//!
//! 1. **Retain only what you hold**: a handle without a counted reference may
//!    dangle
//! 2. **Release each reference once**: debug builds abort on negative counts
//! 3. **Poll safe points**: queued releases are only applied by the owner
//!
//! ### Thread Safety
//!
//! - `Runtime` is `Send + Sync` and cheap to clone
//! - `ThreadHandle` is `Send` but not `Sync`; one per running thread
//! - `WeakRef` is `Send + Sync`
//!
//! ## Modules
//!
//! - [`allocator`]: Allocator collaborator trait
//! - [`brc`]: Thread registry, merge queues and object stacks
//! - [`config`]: Runtime configuration and validation
//! - [`error`]: Error types and fatal escalation
//! - [`logging`]: Structured lifetime events
//! - [`object`]: Object header, handles and weak references
//! - [`runtime`]: Public entry points, lifetime operations, safe points
//! - [`stats`]: Counters and metrics export

// Core
pub mod config;
pub mod error;
pub mod logging;

// Object model
pub mod allocator;
pub mod object;

// Reference counting
pub mod brc;
pub mod runtime;

// Monitoring
pub mod stats;

// Re-export main types for convenience
pub use allocator::{Allocator, SystemAllocator};
pub use brc::{ThreadHandle, ThreadId};
pub use config::{ConfigError, RefcountMode, RuntimeConfig};
pub use error::{BrcError, Result};
pub use object::{ObjectKind, ObjectRef, WeakCallback, WeakRef, IMMORTAL_REFCOUNT};
pub use runtime::{DrainReport, Runtime, SafepointKind, UnregisterReport};
pub use stats::StatsSummary;

/// BRC version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a runtime configured from `BRC_*` environment variables
///
/// # Examples
///
/// ```rust
/// let runtime = brc::init()?;
/// let thread = runtime.register_thread(brc::ThreadId::unique())?;
/// runtime.unregister_thread(thread);
/// # Ok::<(), brc::BrcError>(())
/// ```
pub fn init() -> Result<Runtime> {
    Runtime::new(RuntimeConfig::from_env())
}

/// Create a runtime with an explicit configuration
pub fn init_with_config(config: RuntimeConfig) -> Result<Runtime> {
    Runtime::new(config)
}
