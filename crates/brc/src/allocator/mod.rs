//! Allocator - raw memory collaborator
//!
//! The runtime never calls the global allocator for objects directly. Every
//! object block is obtained through an [`Allocator`] and released through the
//! same allocator exactly once, after weak references are torn down and the
//! payload is dropped.

use crate::error::{BrcError, Result};
use std::alloc::Layout;
use std::ptr::NonNull;

/// Source of raw object memory
///
/// Implementations must be thread safe: an object allocated on one thread may
/// be released on another.
pub trait Allocator: Send + Sync {
    /// Allocate a block for `layout`
    ///
    /// Returns `BrcError::OutOfMemory` when the block cannot be provided.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>>;

    /// Release a block previously returned by `allocate`
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be released twice.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Allocator backed by the global Rust allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        // SAFETY: layout has non-zero size, objects always carry a header.
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(BrcError::OutOfMemory {
            requested: layout.size(),
        })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees ptr/layout came from `allocate`.
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}
