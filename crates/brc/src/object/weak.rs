//! Weak References - per-object weak reference lists
//!
//! Every weakly referenced object heads a doubly linked list of weak
//! records. Records live in arenas owned by a fixed table of lock stripes;
//! an object's records all sit in the stripe selected by its address, and
//! the object header stores the arena slot of the first record.
//!
//! Keying the lock by address lets a [`WeakRef`] take the right lock without
//! touching its target, which may already be gone. Deallocation tears the
//! list down under the same lock before memory is released, so a target
//! observed under the lock is always still allocated.
//!
//! Callback-less records are canonical: asking for another plain weak
//! reference to the same object returns a handle to the existing record.
//! The canonical record is kept at the head; records with callbacks are
//! linked after it.

use crate::object::header::{ObjectHeader, NO_WEAKREFS};
use crate::object::ObjectRef;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Number of weak list lock stripes (prime)
pub const WEAKREF_STRIPES: usize = 127;

/// Callback fired once when a weak reference's target is deallocated
///
/// Receives the now-dead record. Must not try to revive the target.
pub type WeakCallback = Box<dyn FnOnce(&WeakRef) + Send + 'static>;

struct WeakSlot {
    generation: u32,
    handles: usize,
    target: Option<ObjectRef>,
    callback: Option<WeakCallback>,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Default)]
struct WeakStripe {
    slots: Vec<WeakSlot>,
    free: Vec<u32>,
}

#[inline]
fn head_of(header: &ObjectHeader) -> Option<u32> {
    match header.weak_head() {
        NO_WEAKREFS => None,
        slot => Some(slot),
    }
}

impl WeakStripe {
    fn alloc(&mut self, target: ObjectRef, callback: Option<WeakCallback>) -> u32 {
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.handles = 1;
            slot.target = Some(target);
            slot.callback = callback;
            return idx;
        }
        let idx = self.slots.len() as u32;
        self.slots.push(WeakSlot {
            generation: 0,
            handles: 1,
            target: Some(target),
            callback,
            prev: None,
            next: None,
        });
        idx
    }

    /// Return a slot to the free list, handing back any unfired callback
    fn release(&mut self, idx: u32) -> Option<WeakCallback> {
        let slot = &mut self.slots[idx as usize];
        debug_assert_eq!(slot.handles, 0);
        debug_assert!(slot.prev.is_none() && slot.next.is_none());
        slot.generation = slot.generation.wrapping_add(1);
        slot.target = None;
        self.free.push(idx);
        slot.callback.take()
    }

    fn link_head(&mut self, header: &ObjectHeader, idx: u32) {
        let old = head_of(header);
        if let Some(old) = old {
            self.slots[old as usize].prev = Some(idx);
        }
        let slot = &mut self.slots[idx as usize];
        slot.prev = None;
        slot.next = old;
        header.set_weak_head(idx);
    }

    fn link_after(&mut self, anchor: u32, idx: u32) {
        let next = self.slots[anchor as usize].next;
        if let Some(next) = next {
            self.slots[next as usize].prev = Some(idx);
        }
        let slot = &mut self.slots[idx as usize];
        slot.prev = Some(anchor);
        slot.next = next;
        self.slots[anchor as usize].next = Some(idx);
    }

    fn unlink(&mut self, header: &ObjectHeader, idx: u32) {
        let (prev, next) = {
            let slot = &mut self.slots[idx as usize];
            (slot.prev.take(), slot.next.take())
        };
        match prev {
            Some(prev) => self.slots[prev as usize].next = next,
            None => header.set_weak_head(next.unwrap_or(NO_WEAKREFS)),
        }
        if let Some(next) = next {
            self.slots[next as usize].prev = prev;
        }
    }
}

/// Outcome of tearing down an object's weak list
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// Records detached from the object
    pub cleared: usize,
    /// Callbacks invoked
    pub callbacks: usize,
    /// Messages of callbacks that panicked
    pub panics: Vec<String>,
}

/// Weak reference lists of every object in one runtime
pub(crate) struct WeakRegistry {
    stripes: Box<[CachePadded<Mutex<WeakStripe>>]>,
}

impl WeakRegistry {
    pub(crate) fn new() -> Self {
        let stripes = (0..WEAKREF_STRIPES)
            .map(|_| CachePadded::new(Mutex::new(WeakStripe::default())))
            .collect();
        Self { stripes }
    }

    #[inline]
    fn stripe_of(obj: ObjectRef) -> usize {
        obj.addr() % WEAKREF_STRIPES
    }

    /// Create a weak reference to `obj`
    ///
    /// # Safety
    ///
    /// The caller must hold a reference to `obj`.
    pub(crate) unsafe fn create(
        self: &Arc<Self>,
        obj: ObjectRef,
        callback: Option<WeakCallback>,
    ) -> WeakRef {
        let header = obj.header();
        let stripe_idx = Self::stripe_of(obj);
        let mut stripe = self.stripes[stripe_idx].lock();

        let head = head_of(header);
        let basic_head = head.filter(|&h| stripe.slots[h as usize].callback.is_none());

        let slot = match (basic_head, callback.is_some()) {
            (Some(basic), false) => {
                let record = &mut stripe.slots[basic as usize];
                record.handles += 1;
                basic
            }
            (Some(basic), true) => {
                let idx = stripe.alloc(obj, callback);
                stripe.link_after(basic, idx);
                idx
            }
            (None, _) => {
                let idx = stripe.alloc(obj, callback);
                stripe.link_head(header, idx);
                idx
            }
        };

        header.mark_weakly_referenced();
        if !header.is_immortal() {
            header.set_maybe_weakref();
        }

        let generation = stripe.slots[slot as usize].generation;
        drop(stripe);

        WeakRef {
            registry: Arc::clone(self),
            stripe: stripe_idx as u32,
            slot,
            generation,
        }
    }

    /// Run `f` on the record's target while holding the stripe lock
    ///
    /// A `Some` target is guaranteed to be allocated for the duration of `f`.
    pub(crate) fn with_target<R>(&self, weak: &WeakRef, f: impl FnOnce(Option<ObjectRef>) -> R) -> R {
        let stripe = self.stripes[weak.stripe as usize].lock();
        let slot = &stripe.slots[weak.slot as usize];
        debug_assert_eq!(slot.generation, weak.generation);
        f(slot.target)
    }

    /// Number of live weak records attached to `obj`
    ///
    /// # Safety
    ///
    /// `obj` must still be allocated.
    pub(crate) unsafe fn count(&self, obj: ObjectRef) -> usize {
        let header = obj.header();
        if !header.ever_weakly_referenced() {
            return 0;
        }
        let stripe = self.stripes[Self::stripe_of(obj)].lock();
        let mut count = 0;
        let mut cursor = head_of(header);
        while let Some(idx) = cursor {
            count += 1;
            cursor = stripe.slots[idx as usize].next;
        }
        count
    }

    /// Detach every record from `obj`, marking each dead
    ///
    /// With `run_callbacks`, registered callbacks fire after the lock is
    /// released, in list order. Otherwise they are dropped unfired. A
    /// panicking callback is caught and reported; later callbacks still run.
    ///
    /// # Safety
    ///
    /// `obj` must be allocated and either unreachable (refcount zero) or the
    /// caller must accept that its weak references now read as dead.
    pub(crate) unsafe fn teardown(self: &Arc<Self>, obj: ObjectRef, run_callbacks: bool) -> TeardownReport {
        let header = obj.header();
        let mut report = TeardownReport::default();
        if !header.ever_weakly_referenced() {
            return report;
        }

        let stripe_idx = Self::stripe_of(obj);
        let mut pending = Vec::new();
        let mut unfired = Vec::new();
        {
            let mut stripe = self.stripes[stripe_idx].lock();
            let mut cursor = head_of(header);
            while let Some(idx) = cursor {
                let slot = &mut stripe.slots[idx as usize];
                cursor = slot.next.take();
                slot.prev = None;
                slot.target = None;
                report.cleared += 1;
                if let Some(callback) = slot.callback.take() {
                    if run_callbacks {
                        // Keeps the record alive while its callback runs
                        slot.handles += 1;
                        pending.push((idx, slot.generation, callback));
                    } else {
                        unfired.push(callback);
                    }
                }
            }
            header.set_weak_head(NO_WEAKREFS);
        }
        drop(unfired);

        for (slot, generation, callback) in pending {
            let weak = WeakRef {
                registry: Arc::clone(self),
                stripe: stripe_idx as u32,
                slot,
                generation,
            };
            report.callbacks += 1;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&weak))) {
                let message = panic_message(panic.as_ref());
                log::error!(
                    "weak reference callback for object {:#x} panicked: {}",
                    obj.addr(),
                    message
                );
                report.panics.push(message);
            }
        }
        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Weak reference to a managed object
///
/// Does not keep its target alive. Use `Runtime::upgrade` to obtain a
/// counted reference, or `Runtime::dereference` for a snapshot. Clones share
/// one record; the record is unlinked when the last clone is dropped.
pub struct WeakRef {
    registry: Arc<WeakRegistry>,
    stripe: u32,
    slot: u32,
    generation: u32,
}

impl WeakRef {
    /// Whether the target has been deallocated (or its list cleared)
    pub fn is_dead(&self) -> bool {
        self.registry.with_target(self, |target| target.is_none())
    }

    /// Whether a callback is still pending on this record
    pub fn has_callback(&self) -> bool {
        let stripe = self.registry.stripes[self.stripe as usize].lock();
        stripe.slots[self.slot as usize].callback.is_some()
    }

    /// Whether both handles name the same record
    pub fn same_record(&self, other: &WeakRef) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry)
            && self.stripe == other.stripe
            && self.slot == other.slot
            && self.generation == other.generation
    }

    pub(crate) fn registry(&self) -> &Arc<WeakRegistry> {
        &self.registry
    }
}

impl Clone for WeakRef {
    fn clone(&self) -> Self {
        let mut stripe = self.registry.stripes[self.stripe as usize].lock();
        stripe.slots[self.slot as usize].handles += 1;
        drop(stripe);
        WeakRef {
            registry: Arc::clone(&self.registry),
            stripe: self.stripe,
            slot: self.slot,
            generation: self.generation,
        }
    }
}

impl Drop for WeakRef {
    fn drop(&mut self) {
        let unfired = {
            let mut stripe = self.registry.stripes[self.stripe as usize].lock();
            let slot = &mut stripe.slots[self.slot as usize];
            debug_assert_eq!(slot.generation, self.generation);
            slot.handles -= 1;
            if slot.handles > 0 {
                return;
            }
            if let Some(target) = slot.target {
                // SAFETY: the target is listed under this lock, so teardown
                // has not run and the object is still allocated.
                let header = unsafe { target.header() };
                stripe.unlink(header, self.slot);
            }
            stripe.release(self.slot)
        };
        drop(unfired);
    }
}

impl fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRef")
            .field("stripe", &self.stripe)
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}
