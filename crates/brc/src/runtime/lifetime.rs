//! Lifetime Operations - retain, release, merge, promote, deallocate
//!
//! ## Biased mode
//!
//! ```text
//!              retain_local / release_local (owner, plain load/store)
//!            ┌──────────┐
//!            │  Owned   │── local hits 0, shared != 0 ──► Merged ── count 0 ──► freed
//!            └──────────┘                                   ▲
//!              │  │ remote release of a locally              │
//!              │  │ counted reference: Queued ── drain ──────┘
//!              │  └── local hits 0, shared == 0 ──────────────────────────────► freed
//!              └── count reaches the promotion threshold ──► Immortal
//! ```
//!
//! All cross-thread traffic goes through the shared field. A remote release
//! that finds nothing to subtract (the reference was counted locally) marks
//! the object queued and hands it to the owner, which folds it in at its next
//! safe point.
//!
//! ## Single-threaded mode
//!
//! Objects are unowned and the local field is the plain refcount. Every
//! operation runs under the runtime's reentrant lock.

use super::RuntimeInner;
use crate::brc::thread::ThreadHandle;
use crate::brc::Enqueue;
use crate::config::RefcountMode;
use crate::error::{fatal, BrcError, OrFatal};
use crate::logging::LifetimeEvent;
use crate::object::header::{
    pack_shared, shared_count, shared_flags, ObjectHeader, FLAG_MAYBE_WEAKREF, FLAG_MERGED,
    FLAG_QUEUED, SHARED_FLAG_MASK, SHARED_UNIT, UNOWNED,
};
use crate::object::weak::WeakRef;
use crate::object::ObjectRef;
use crate::stats::Counter;
use parking_lot::ReentrantMutexGuard;
use serde::Serialize;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

/// Result of draining a merge queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Queue entries folded into their objects' shared counts
    pub merged: usize,
    /// Objects whose count reached zero during the drain
    pub deallocated: usize,
}

/// Result of unregistering a thread
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnregisterReport {
    /// Entries merged by the final drain
    pub drained: usize,
    /// Owned objects whose ownership was relinquished
    pub merged: usize,
    /// Entries queued after the final drain, merged after unlinking
    pub handed_off: usize,
    /// Objects deallocated by any of the above
    pub deallocated: usize,
}

impl RuntimeInner {
    #[inline]
    fn single_threaded(&self) -> bool {
        self.config.mode == RefcountMode::SingleThreaded
    }

    /// The single-threaded lock, in that mode only
    #[inline]
    pub(crate) fn single_lock(&self) -> Option<ReentrantMutexGuard<'_, ()>> {
        if self.single_threaded() {
            Some(self.lock.lock())
        } else {
            None
        }
    }

    /// Immortal check shared by every entry point
    #[inline]
    fn skip_immortal(thread: &ThreadHandle, header: &ObjectHeader, counter: Counter) -> bool {
        if header.is_immortal() {
            thread.stats.record(counter);
            return true;
        }
        false
    }

    // === Dispatch ===

    pub(crate) unsafe fn retain(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        if Self::skip_immortal(thread, header, Counter::ImmortalRetain) {
            return;
        }
        if self.single_threaded() {
            self.retain_single(thread, obj);
        } else if header.is_owned_by(thread.raw_id()) {
            self.retain_owned(thread, obj);
        } else {
            self.retain_shared(thread, obj);
        }
    }

    pub(crate) unsafe fn release(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        if Self::skip_immortal(thread, header, Counter::ImmortalRelease) {
            return;
        }
        if self.single_threaded() {
            self.release_single(thread, obj);
        } else if header.is_owned_by(thread.raw_id()) {
            self.release_owned(thread, obj);
        } else {
            self.release_shared(thread, obj);
        }
    }

    pub(crate) unsafe fn retain_local(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        if Self::skip_immortal(thread, header, Counter::ImmortalRetain) {
            return;
        }
        if self.single_threaded() {
            return self.retain_single(thread, obj);
        }
        debug_assert!(
            header.is_owned_by(thread.raw_id()),
            "retain_local on object {:#x} not owned by thread {}",
            obj.addr(),
            thread.id
        );
        self.retain_owned(thread, obj);
    }

    pub(crate) unsafe fn retain_remote(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        if Self::skip_immortal(thread, header, Counter::ImmortalRetain) {
            return;
        }
        if self.single_threaded() {
            return self.retain_single(thread, obj);
        }
        self.retain_shared(thread, obj);
    }

    pub(crate) unsafe fn release_local(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        if Self::skip_immortal(thread, header, Counter::ImmortalRelease) {
            return;
        }
        if self.single_threaded() {
            return self.release_single(thread, obj);
        }
        debug_assert!(
            header.is_owned_by(thread.raw_id()),
            "release_local on object {:#x} not owned by thread {}",
            obj.addr(),
            thread.id
        );
        self.release_owned(thread, obj);
    }

    pub(crate) unsafe fn release_remote(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        if Self::skip_immortal(thread, header, Counter::ImmortalRelease) {
            return;
        }
        if self.single_threaded() {
            return self.release_single(thread, obj);
        }
        // Ownership may have come back around to the caller
        if header.is_owned_by(thread.raw_id()) {
            return self.release_owned(thread, obj);
        }
        self.release_shared(thread, obj);
    }

    // === Single-threaded mode ===

    unsafe fn retain_single(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let _guard = self.lock.lock();
        let header = obj.header();
        let count = header.local();
        if count >= self.config.promotion_threshold {
            self.promote(thread, obj);
            return;
        }
        header.set_local(count + 1);
        thread.stats.record(Counter::RetainLocal);
    }

    unsafe fn release_single(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let _guard = self.lock.lock();
        let header = obj.header();
        let count = header.local();
        if cfg!(debug_assertions) && count == 0 {
            fatal(BrcError::NegativeRefcount {
                address: obj.addr(),
                count: -1,
            });
        }
        let count = count.wrapping_sub(1);
        header.set_local(count);
        thread.stats.record(Counter::ReleaseLocal);
        if count == 0 {
            self.deallocate(thread, obj);
        }
    }

    // === Biased mode ===

    unsafe fn retain_owned(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        let local = header.local();
        if local >= self.config.promotion_threshold {
            self.promote(thread, obj);
            return;
        }
        header.set_local(local + 1);
        thread.stats.record(Counter::RetainLocal);
    }

    unsafe fn retain_shared(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        let old = header.add_shared(1);
        thread.stats.record(Counter::RetainRemote);
        if shared_count(old) + 1 > self.config.promotion_threshold as isize {
            self.promote(thread, obj);
        }
    }

    unsafe fn release_owned(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        let local = header.local();
        if cfg!(debug_assertions) && local == 0 {
            fatal(BrcError::NegativeRefcount {
                address: obj.addr(),
                count: -1,
            });
        }
        let local = local.wrapping_sub(1);
        header.set_local(local);
        thread.stats.record(Counter::ReleaseLocal);
        if local == 0 {
            self.merge_zero_local(thread, obj);
        }
    }

    /// The owner dropped its last local reference
    unsafe fn merge_zero_local(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        thread.forget_owned(obj);

        let mut shared = header.shared();
        if shared == 0 {
            // No other thread ever counted a reference
            self.deallocate(thread, obj);
            return;
        }

        header.clear_owner();
        let merged = loop {
            let new = (shared & !SHARED_FLAG_MASK) | FLAG_MERGED;
            match header.cas_shared(shared, new) {
                Ok(_) => break new,
                Err(actual) => shared = actual,
            }
        };
        thread.stats.record(Counter::Merge);
        log::trace!(
            "thread {} relinquished object {:#x} (shared count {})",
            thread.id,
            obj.addr(),
            shared_count(merged)
        );
        if merged == FLAG_MERGED {
            self.deallocate(thread, obj);
        }
    }

    unsafe fn release_shared(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        let mut shared = header.shared();
        let (new, queue) = loop {
            // Nothing to subtract: the reference was counted by the owner
            let (new, queue) = if shared == 0 || shared == FLAG_MAYBE_WEAKREF {
                (pack_shared(0, FLAG_QUEUED), true)
            } else {
                (shared - SHARED_UNIT, false)
            };
            if cfg!(debug_assertions) && shared_flags(new) == FLAG_MERGED && shared_count(new) < 0 {
                fatal(BrcError::NegativeRefcount {
                    address: obj.addr(),
                    count: shared_count(new),
                });
            }
            match header.cas_shared(shared, new) {
                Ok(_) => break (new, queue),
                Err(actual) => shared = actual,
            }
        };
        thread.stats.record(Counter::ReleaseRemote);

        if queue {
            self.queue_object(thread, obj);
        } else if new == FLAG_MERGED {
            self.deallocate(thread, obj);
        }
    }

    /// Hand a queued object to its owner
    ///
    /// The queue entry carries the caller's reference until the owner
    /// merges it.
    unsafe fn queue_object(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        let owner = header.owner();
        if owner == UNOWNED {
            // The owner merged after we marked the object queued
            self.release_shared(thread, obj);
            return;
        }

        match self.brc.enqueue(owner, obj).or_fatal() {
            Enqueue::Queued => {
                thread.stats.record(Counter::Queued);
                log::trace!(
                    "thread {} queued object {:#x} for owner {}",
                    thread.id,
                    obj.addr(),
                    owner
                );
            }
            Enqueue::OwnerGone => {
                let count = self.explicit_merge(obj, -1);
                thread.stats.record(Counter::Merge);
                self.logger.log(LifetimeEvent::OwnerGone {
                    thread: thread.raw_id(),
                    owner,
                    address: obj.addr(),
                });
                if count == 0 {
                    self.deallocate(thread, obj);
                }
            }
        }
    }

    /// Relinquish ownership, folding the local count and `extra` into the
    /// shared field. Returns the merged count.
    pub(crate) unsafe fn explicit_merge(&self, obj: ObjectRef, extra: isize) -> isize {
        let header = obj.header();
        header.clear_owner();
        let local = header.take_local() as isize;

        let mut shared = header.shared();
        loop {
            let count = shared_count(shared) + local + extra;
            match header.cas_shared(shared, pack_shared(count, FLAG_MERGED)) {
                Ok(_) => {
                    if cfg!(debug_assertions) && count < 0 {
                        fatal(BrcError::NegativeRefcount {
                            address: obj.addr(),
                            count,
                        });
                    }
                    return count;
                }
                Err(actual) => shared = actual,
            }
        }
    }

    /// Normal -> ImmortalPromoted
    pub(crate) unsafe fn promote(&self, thread: &ThreadHandle, obj: ObjectRef) -> bool {
        let header = obj.header();
        let refcount = header.refcount();
        if !header.promote() {
            return false;
        }
        if header.is_owned_by(thread.raw_id()) {
            thread.forget_owned(obj);
        }
        thread.stats.record(Counter::Promotion);
        self.logger.log(LifetimeEvent::ObjectPromoted {
            thread: thread.raw_id(),
            address: obj.addr(),
            refcount,
        });
        true
    }

    // === Merge queue ===

    pub(crate) fn drain_merge_queue(&self, thread: &ThreadHandle) -> DrainReport {
        let mut report = DrainReport::default();
        self.brc.take_queue(thread, &mut thread.scratch.borrow_mut());

        loop {
            // Short borrow: destructors run by deallocate may drain again
            let next = thread.scratch.borrow_mut().pop();
            let Some(obj) = next else { break };
            // SAFETY: the queue entry holds a reference to obj.
            unsafe {
                if obj.header().is_immortal() {
                    continue;
                }
                thread.forget_owned(obj);
                let count = self.explicit_merge(obj, -1);
                thread.stats.record(Counter::Drained);
                report.merged += 1;
                if count == 0 {
                    self.deallocate(thread, obj);
                    report.deallocated += 1;
                }
            }
        }

        if report.merged > 0 {
            log::debug!(
                "thread {} drained {} queued objects ({} deallocated)",
                thread.id,
                report.merged,
                report.deallocated
            );
            self.logger.log(LifetimeEvent::MergeQueueDrained {
                thread: thread.raw_id(),
                merged: report.merged,
                deallocated: report.deallocated,
            });
        }
        report
    }

    /// Retire a thread
    ///
    /// Everything the thread owns is merged while its record is still
    /// linked, so a remote release never finds the owner missing while the
    /// object still depends on the owner's local count.
    pub(crate) fn unregister(&self, thread: &ThreadHandle) -> UnregisterReport {
        if !thread.registered.replace(false) {
            return UnregisterReport::default();
        }

        let drained = self.drain_merge_queue(thread);
        let mut report = UnregisterReport {
            drained: drained.merged,
            deallocated: drained.deallocated,
            ..Default::default()
        };

        let owned: Vec<ObjectRef> = thread.owned.borrow_mut().drain(..).collect();
        for obj in owned {
            // SAFETY: owned objects are alive until their owner merges them.
            unsafe {
                if obj.header().is_immortal() {
                    continue;
                }
                let count = self.explicit_merge(obj, 0);
                thread.stats.record(Counter::Merge);
                report.merged += 1;
                if count == 0 {
                    self.deallocate(thread, obj);
                    report.deallocated += 1;
                }
            }
        }

        let mut leftover = self.brc.unregister(thread);
        while let Some(obj) = leftover.pop() {
            // SAFETY: as in drain_merge_queue.
            unsafe {
                if obj.header().is_immortal() {
                    continue;
                }
                let count = self.explicit_merge(obj, -1);
                thread.stats.record(Counter::Drained);
                report.handed_off += 1;
                if count == 0 {
                    self.deallocate(thread, obj);
                    report.deallocated += 1;
                }
            }
        }

        self.stats.retire(&thread.stats);
        log::debug!("thread {} unregistered: {:?}", thread.id, report);
        self.logger.log(LifetimeEvent::ThreadUnregistered {
            thread: thread.raw_id(),
            drained: report.drained,
            merged: report.merged,
            handed_off: report.handed_off,
            deallocated: report.deallocated,
        });
        report
    }

    // === Weak references ===

    /// Retain `obj` only if its count is still positive
    ///
    /// Called under the weak stripe lock, which keeps `obj` allocated.
    unsafe fn try_retain(&self, thread: &ThreadHandle, obj: ObjectRef) -> bool {
        let header = obj.header();
        if Self::skip_immortal(thread, header, Counter::ImmortalRetain) {
            return true;
        }
        if self.single_threaded() {
            if header.local() == 0 {
                return false;
            }
            self.retain_single(thread, obj);
            return true;
        }
        if header.is_owned_by(thread.raw_id()) {
            if header.local() == 0 {
                return false;
            }
            self.retain_owned(thread, obj);
            return true;
        }

        let mut shared = header.shared();
        loop {
            if shared == 0 || shared == FLAG_MERGED {
                return false;
            }
            match header.cas_shared(shared, shared + SHARED_UNIT) {
                Ok(_) => break,
                Err(actual) => shared = actual,
            }
        }
        thread.stats.record(Counter::RetainRemote);
        true
    }

    pub(crate) fn upgrade(&self, thread: &ThreadHandle, weak: &WeakRef) -> Option<ObjectRef> {
        // Lock order: single-threaded lock, then the weak stripe
        let _guard = self.single_lock();
        self.weak.with_target(weak, |target| {
            let obj = target?;
            // SAFETY: a listed target is allocated while the stripe is held.
            unsafe { self.try_retain(thread, obj) }.then_some(obj)
        })
    }

    pub(crate) fn dereference(&self, weak: &WeakRef) -> Option<ObjectRef> {
        let _guard = self.single_lock();
        self.weak.with_target(weak, |target| {
            // SAFETY: as in upgrade.
            target.filter(|obj| unsafe { obj.refcount() } > 0)
        })
    }

    // === Deallocation ===

    /// Destroy an object whose count reached zero
    ///
    /// Weak teardown first, then the payload destructor, then the allocator.
    /// A panicking destructor still releases the memory before the panic
    /// continues.
    pub(crate) unsafe fn deallocate(&self, thread: &ThreadHandle, obj: ObjectRef) {
        let header = obj.header();
        debug_assert!(!header.is_immortal());

        if header.ever_weakly_referenced() {
            let report = self.weak.teardown(obj, true);
            thread.stats.add(Counter::WeakCleared, report.cleared as u64);
            thread.stats.add(Counter::CallbackInvoked, report.callbacks as u64);
            for message in report.panics {
                self.logger.log(LifetimeEvent::CallbackPanicked {
                    address: obj.addr(),
                    message,
                });
            }
        }

        let vtable = header.vtable();
        let ptr = obj.as_non_null();
        // SAFETY: count is zero and the weak list is gone; nothing else can
        // reach the payload.
        let dropped = catch_unwind(AssertUnwindSafe(|| unsafe { (vtable.drop_value)(ptr) }));
        self.allocator.release(ptr.cast(), vtable.layout);
        thread.stats.record(Counter::Deallocation);

        if let Err(panic) = dropped {
            log::warn!("destructor of object {:#x} panicked", obj.addr());
            resume_unwind(panic);
        }
    }
}
