//! Object Stack - chunked LIFO of object handles
//!
//! Work queue for deferred merges. Objects are stored in fixed-size chunks
//! linked through `prev`; the head chunk is the one being filled. Every
//! chunk in the chain holds at least one entry, so an empty stack owns no
//! memory.
//!
//! ```text
//! head ──► [chunk n] ──prev──► [chunk n-1] ──prev──► ... ──► [chunk 0] ◄── oldest
//! ```
//!
//! `oldest` is a non-owning pointer kept so that [`ObjectStack::merge`] can
//! splice a whole chain in constant time.
//!
//! Chunks come from the runtime's [`Allocator`], so a refused chunk surfaces
//! as [`BrcError::QueueOutOfMemory`].

use crate::allocator::{Allocator, SystemAllocator};
use crate::error::{BrcError, Result};
use crate::object::ObjectRef;
use std::alloc::Layout;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::Arc;

/// Object slots per chunk (chunk is 2KB on 64-bit)
pub const CHUNK_CAPACITY: usize = 254;

#[repr(C)]
struct Chunk {
    prev: Option<NonNull<Chunk>>,
    len: usize,
    objects: [MaybeUninit<ObjectRef>; CHUNK_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<Chunk>().is_power_of_two());

/// Layout of every chunk requested from the allocator
pub const CHUNK_LAYOUT: Layout = Layout::new::<Chunk>();

impl Chunk {
    /// Allocate an empty chunk linked to `prev`
    fn allocate(allocator: &dyn Allocator, prev: Option<NonNull<Chunk>>) -> Result<NonNull<Chunk>> {
        let chunk = allocator
            .allocate(CHUNK_LAYOUT)
            .map_err(|_| BrcError::QueueOutOfMemory {
                requested: CHUNK_LAYOUT.size(),
            })?
            .cast::<Chunk>();
        let raw = chunk.as_ptr();
        // SAFETY: freshly allocated; slots stay uninitialized until pushed.
        unsafe {
            std::ptr::addr_of_mut!((*raw).prev).write(prev);
            std::ptr::addr_of_mut!((*raw).len).write(0);
        }
        Ok(chunk)
    }

    /// # Safety
    ///
    /// `chunk` must come from `Chunk::allocate` on `allocator` and be unlinked.
    unsafe fn free(allocator: &dyn Allocator, chunk: NonNull<Chunk>) {
        allocator.release(chunk.cast(), CHUNK_LAYOUT);
    }
}

/// Chunked stack of object handles
///
/// Exactly one stack owns each chunk at a time. Not synchronized: merge
/// queues live behind their bucket mutex, scratch stacks are thread-private.
///
/// Stacks only splice chains with stacks sharing their allocator.
pub struct ObjectStack {
    head: Option<NonNull<Chunk>>,
    oldest: Option<NonNull<Chunk>>,
    allocator: Arc<dyn Allocator>,
}

// SAFETY: the stack uniquely owns its chunks, ObjectRef is Send and the
// allocator is Send + Sync.
unsafe impl Send for ObjectStack {}

impl ObjectStack {
    /// A stack whose chunks come from the global allocator
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(SystemAllocator))
    }

    pub fn with_allocator(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            head: None,
            oldest: None,
            allocator,
        }
    }

    #[inline]
    fn same_allocator(&self, other: &ObjectStack) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.allocator) as *const (),
            Arc::as_ptr(&other.allocator) as *const (),
        )
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Push an object, allocating a chunk if the head is full or absent
    ///
    /// Fails only with `QueueOutOfMemory`; the stack is unchanged on failure.
    pub fn push(&mut self, obj: ObjectRef) -> Result<()> {
        let mut head = match self.head {
            // SAFETY: chunks in the chain are live and owned by self.
            Some(chunk) if unsafe { chunk.as_ref().len } < CHUNK_CAPACITY => chunk,
            _ => {
                let chunk = Chunk::allocate(&*self.allocator, self.head)?;
                if self.oldest.is_none() {
                    self.oldest = Some(chunk);
                }
                self.head = Some(chunk);
                chunk
            }
        };
        // SAFETY: head is live, owned by self and has a free slot.
        unsafe {
            let chunk = head.as_mut();
            chunk.objects[chunk.len].write(obj);
            chunk.len += 1;
        }
        Ok(())
    }

    /// Pop the most recently pushed object, freeing the head chunk once empty
    pub fn pop(&mut self) -> Option<ObjectRef> {
        let mut head = self.head?;
        // SAFETY: every chunk in the chain holds at least one initialized
        // slot below `len`.
        unsafe {
            let chunk = head.as_mut();
            chunk.len -= 1;
            let obj = chunk.objects[chunk.len].assume_init();
            if chunk.len == 0 {
                self.head = chunk.prev;
                if self.head.is_none() {
                    self.oldest = None;
                }
                Chunk::free(&*self.allocator, head);
            }
            Some(obj)
        }
    }

    /// Move every entry of `src` onto `self`, leaving `src` empty
    ///
    /// Constant time: `src`'s chain is linked above `self`'s current head.
    pub fn merge(&mut self, src: &mut ObjectStack) {
        debug_assert!(self.same_allocator(src), "merging stacks with different allocators");
        let (Some(src_head), Some(mut src_oldest)) = (src.head.take(), src.oldest.take()) else {
            return;
        };
        // SAFETY: src_oldest is the bottom chunk of src's chain, now owned by self.
        unsafe { src_oldest.as_mut().prev = self.head };
        if self.oldest.is_none() {
            self.oldest = Some(src_oldest);
        }
        self.head = Some(src_head);
    }

    /// Number of entries, walking every chunk
    ///
    /// Diagnostic only.
    pub fn size(&self) -> usize {
        let mut total = 0;
        let mut cursor = self.head;
        while let Some(chunk) = cursor {
            // SAFETY: chunks in the chain are live and owned by self.
            let chunk = unsafe { chunk.as_ref() };
            total += chunk.len;
            cursor = chunk.prev;
        }
        total
    }

    /// Number of chunks currently allocated
    pub fn chunk_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(chunk) = cursor {
            count += 1;
            // SAFETY: as in `size`.
            cursor = unsafe { chunk.as_ref().prev };
        }
        count
    }
}

impl Default for ObjectStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ObjectStack {
    fn drop(&mut self) {
        if !self.is_empty() {
            log::warn!(
                "object stack dropped with {} pending entries",
                self.size()
            );
        }
        let mut cursor = self.head.take();
        self.oldest = None;
        while let Some(chunk) = cursor {
            // SAFETY: chunk is owned by self and unlinked after reading prev.
            unsafe {
                cursor = chunk.as_ref().prev;
                Chunk::free(&*self.allocator, chunk);
            }
        }
    }
}

impl std::fmt::Debug for ObjectStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStack")
            .field("size", &self.size())
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(i: usize) -> ObjectRef {
        ObjectRef::dangling((i + 1) * 8)
    }

    fn drain(stack: &mut ObjectStack) -> Vec<usize> {
        std::iter::from_fn(|| stack.pop()).map(|o| o.addr()).collect()
    }

    #[test]
    fn test_push_pop_lifo() {
        let mut stack = ObjectStack::new();
        assert!(stack.pop().is_none());

        for i in 0..3 {
            stack.push(obj(i)).unwrap();
        }
        assert_eq!(stack.size(), 3);
        assert_eq!(drain(&mut stack), vec![24, 16, 8]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_chunks_grow_and_shrink() {
        let mut stack = ObjectStack::new();
        for i in 0..CHUNK_CAPACITY {
            stack.push(obj(i)).unwrap();
        }
        assert_eq!(stack.chunk_count(), 1);

        stack.push(obj(CHUNK_CAPACITY)).unwrap();
        assert_eq!(stack.chunk_count(), 2);
        assert_eq!(stack.size(), CHUNK_CAPACITY + 1);

        // Popping the lone entry of the head chunk frees it
        stack.pop().unwrap();
        assert_eq!(stack.chunk_count(), 1);

        let rest = drain(&mut stack);
        assert_eq!(rest.len(), CHUNK_CAPACITY);
        assert_eq!(stack.chunk_count(), 0);
    }

    #[test]
    fn test_merge_moves_everything() {
        let mut dst = ObjectStack::new();
        let mut src = ObjectStack::new();
        for i in 0..10 {
            dst.push(obj(i)).unwrap();
        }
        for i in 10..(10 + 2 * CHUNK_CAPACITY) {
            src.push(obj(i)).unwrap();
        }

        dst.merge(&mut src);

        assert!(src.is_empty());
        assert_eq!(src.chunk_count(), 0);
        assert_eq!(dst.size(), 10 + 2 * CHUNK_CAPACITY);

        let mut popped = drain(&mut dst);
        popped.sort_unstable();
        let expected: Vec<usize> = (0..10 + 2 * CHUNK_CAPACITY).map(|i| obj(i).addr()).collect();
        assert_eq!(popped, expected);
    }

    #[test]
    fn test_merge_into_empty_and_from_empty() {
        let mut dst = ObjectStack::new();
        let mut src = ObjectStack::new();
        dst.merge(&mut src);
        assert!(dst.is_empty());

        src.push(obj(1)).unwrap();
        dst.merge(&mut src);
        assert_eq!(dst.size(), 1);

        // Pushing after a merge keeps filling the spliced head chunk
        dst.push(obj(2)).unwrap();
        assert_eq!(dst.chunk_count(), 1);

        let mut empty = ObjectStack::new();
        dst.merge(&mut empty);
        assert_eq!(drain(&mut dst), vec![obj(2).addr(), obj(1).addr()]);
    }

    /// Allocator that refuses every chunk
    struct Refusing;

    impl Allocator for Refusing {
        fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
            Err(BrcError::OutOfMemory {
                requested: layout.size(),
            })
        }

        unsafe fn release(&self, _ptr: NonNull<u8>, _layout: Layout) {
            unreachable!("nothing was allocated");
        }
    }

    #[test]
    fn test_refused_chunk_reports_queue_oom() {
        let mut stack = ObjectStack::with_allocator(Arc::new(Refusing));

        let result = stack.push(obj(0));

        assert!(matches!(
            result,
            Err(BrcError::QueueOutOfMemory { requested }) if requested == CHUNK_LAYOUT.size()
        ));
        assert!(result.unwrap_err().is_fatal());
        assert!(stack.is_empty());
        assert_eq!(stack.chunk_count(), 0);
    }

    #[test]
    fn test_repeated_merges_keep_oldest_chunk() {
        let mut dst = ObjectStack::new();
        for round in 0..3 {
            let mut src = ObjectStack::new();
            src.push(obj(round)).unwrap();
            dst.merge(&mut src);
        }
        assert_eq!(dst.chunk_count(), 3);
        assert_eq!(drain(&mut dst).len(), 3);

        // Stack is reusable once drained
        dst.push(obj(9)).unwrap();
        let mut other = ObjectStack::new();
        other.push(obj(10)).unwrap();
        other.merge(&mut dst);
        assert_eq!(other.size(), 2);
    }
}
