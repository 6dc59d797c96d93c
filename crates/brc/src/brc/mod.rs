//! Biased Reference Counting State
//!
//! The per-runtime registry of threads: a fixed table of buckets, each a
//! mutex over the list of thread records hashed into it. A record carries
//! the merge queue that other threads append to when they release an object
//! whose reference was counted by its owner.
//!
//! ```text
//! buckets[id % B] ──► Mutex<ThreadList> ──► [record] ◄──► [record] ◄──► ...
//!                                             │
//!                                             └─ objects_to_merge: ObjectStack
//! ```
//!
//! Bucket mutexes are held only to push, splice or unlink. Nothing that can
//! run a destructor executes while one is held.

pub mod object_stack;
pub mod thread;

pub use object_stack::ObjectStack;
pub use thread::{ThreadHandle, ThreadId};

use crate::allocator::Allocator;
use crate::error::{BrcError, Result};
use crate::object::ObjectRef;
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thread::{ThreadList, ThreadRecord, ThreadSlot};

/// Outcome of handing an object to its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    /// Pushed onto the owner's merge queue
    Queued,
    /// Owner is no longer registered; the caller must merge
    OwnerGone,
}

/// Sharded thread registry
pub(crate) struct BrcState {
    buckets: Box<[CachePadded<Mutex<ThreadList>>]>,
    /// Source of merge-queue chunks
    allocator: Arc<dyn Allocator>,
}

impl BrcState {
    pub(crate) fn new(bucket_count: usize, allocator: Arc<dyn Allocator>) -> Self {
        let buckets = (0..bucket_count)
            .map(|_| CachePadded::new(Mutex::new(ThreadList::default())))
            .collect();
        Self { buckets, allocator }
    }

    /// An empty stack drawing chunks from the runtime's allocator
    pub(crate) fn new_stack(&self) -> ObjectStack {
        ObjectStack::with_allocator(Arc::clone(&self.allocator))
    }

    #[inline]
    pub(crate) fn bucket_index(&self, thread: u64) -> usize {
        (thread % self.buckets.len() as u64) as usize
    }

    #[inline]
    fn lock(&self, bucket: usize) -> MutexGuard<'_, ThreadList> {
        self.buckets[bucket].lock()
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Link a new record for `id`
    ///
    /// Returns the bucket, the slot and the shared merge-requested flag.
    pub(crate) fn register(&self, id: ThreadId) -> Result<(usize, ThreadSlot, Arc<AtomicBool>)> {
        let bucket = self.bucket_index(id.get());
        let mut threads = self.lock(bucket);
        if threads.find_mut(id.get()).is_some() {
            return Err(BrcError::ThreadAlreadyRegistered(id));
        }
        let merge_requested = Arc::new(AtomicBool::new(false));
        let slot = threads.insert(ThreadRecord {
            id,
            objects_to_merge: self.new_stack(),
            merge_requested: Arc::clone(&merge_requested),
        });
        Ok((bucket, slot, merge_requested))
    }

    /// Push `obj` onto the merge queue of thread `owner`
    ///
    /// Fails only with `QueueOutOfMemory` when a chunk cannot be allocated.
    pub(crate) fn enqueue(&self, owner: u64, obj: ObjectRef) -> Result<Enqueue> {
        let mut threads = self.lock(self.bucket_index(owner));
        let Some(record) = threads.find_mut(owner) else {
            return Ok(Enqueue::OwnerGone);
        };
        record.objects_to_merge.push(obj)?;
        record.merge_requested.store(true, Ordering::Release);
        Ok(Enqueue::Queued)
    }

    /// Splice the thread's pending merge queue onto `into`
    pub(crate) fn take_queue(&self, thread: &ThreadHandle, into: &mut ObjectStack) {
        let mut threads = self.lock(thread.bucket);
        if let Some(record) = threads.get_mut(thread.slot) {
            into.merge(&mut record.objects_to_merge);
            record.merge_requested.store(false, Ordering::Release);
        }
    }

    /// Unlink the thread's record, returning whatever was still queued
    pub(crate) fn unregister(&self, thread: &ThreadHandle) -> ObjectStack {
        let mut threads = self.lock(thread.bucket);
        match threads.remove(thread.slot) {
            Some(mut record) => {
                debug_assert_eq!(record.id, thread.id);
                let mut leftover = self.new_stack();
                leftover.merge(&mut record.objects_to_merge);
                leftover
            }
            None => self.new_stack(),
        }
    }

    /// Size of a thread's pending queue
    ///
    /// Diagnostic only: walks every chunk under the bucket mutex.
    pub(crate) fn pending(&self, thread: &ThreadHandle) -> usize {
        let mut threads = self.lock(thread.bucket);
        threads
            .get_mut(thread.slot)
            .map(|record| record.objects_to_merge.size())
            .unwrap_or(0)
    }

    pub(crate) fn is_registered(&self, id: ThreadId) -> bool {
        self.lock(self.bucket_index(id.get())).find_mut(id.get()).is_some()
    }

    /// Total registered threads, locking each bucket in turn
    pub(crate) fn thread_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }
}
