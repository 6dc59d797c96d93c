//! Object Module - managed object representation
//!
//! - `header`: reference count fields and the raw [`ObjectRef`] handle
//! - `weak`: weak reference lists and their teardown

pub mod header;
pub mod weak;

pub use header::{ObjectHeader, ObjectKind, ObjectRef, IMMORTAL_REFCOUNT};
pub use weak::{TeardownReport, WeakCallback, WeakRef};
