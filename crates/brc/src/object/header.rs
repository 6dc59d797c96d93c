//! Object Header - reference count fields of runtime-managed objects
//!
//! Object Header Layout (40 bytes on 64-bit):
//! ┌─────────────────────────────────────────┐
//! │         Owner (8 bytes)                 │  <- AtomicU64, 0 = unowned/merged
//! ├─────────────────────────────────────────┤
//! │  Local (4) │ Kind (1) │ Weak (1) │ pad  │  <- local written by the owner only
//! ├─────────────────────────────────────────┤
//! │         Shared field (8 bytes)          │  <- AtomicIsize
//! │  - Bits 0-1: state flags                │
//! │  - Bits 2-63: signed shared count       │
//! ├─────────────────────────────────────────┤
//! │  Weak head (4)   │ pad (4)              │  <- arena slot of first weak ref
//! ├─────────────────────────────────────────┤
//! │         VTable (8 bytes)                │  <- layout, drop, type identity
//! └─────────────────────────────────────────┘
//!
//! The payload follows the header in the same allocation (`ObjectBox<T>`).
//!
//! Logical refcount is `local + (shared >> 2)` while the object is owned and
//! `shared >> 2` once the merged state is set. The local count is an atomic
//! only so that snapshots from other threads are not data races; the owner
//! updates it with relaxed load/store pairs, never read-modify-write.

use std::alloc::Layout;
use std::any::TypeId;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Shift of the count inside the shared field
pub const SHARED_SHIFT: u32 = 2;

/// One reference in shared-field units
pub const SHARED_UNIT: isize = 1 << SHARED_SHIFT;

/// Mask for the state bits of the shared field
pub const SHARED_FLAG_MASK: isize = SHARED_UNIT - 1;

/// Shared field states (low two bits)
pub const FLAG_NONE: isize = 0;
pub const FLAG_MAYBE_WEAKREF: isize = 1;
pub const FLAG_QUEUED: isize = 2;
pub const FLAG_MERGED: isize = 3;

/// Owner value of objects with no owning thread
pub const UNOWNED: u64 = 0;

/// Weak head value of objects never weakly referenced
pub const NO_WEAKREFS: u32 = u32::MAX;

/// Refcount reported for immortal objects
pub const IMMORTAL_REFCOUNT: usize = 3 << 30;

/// Extract the signed count from a shared field value
#[inline]
pub const fn shared_count(shared: isize) -> isize {
    shared >> SHARED_SHIFT
}

/// Extract the state bits from a shared field value
#[inline]
pub const fn shared_flags(shared: isize) -> isize {
    shared & SHARED_FLAG_MASK
}

/// Build a shared field value from a count and state bits
#[inline]
pub const fn pack_shared(count: isize, flags: isize) -> isize {
    (count << SHARED_SHIFT) | flags
}

/// Lifetime class of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectKind {
    /// Counted normally, deallocated at zero
    Normal = 0,
    /// Immortal from birth
    ImmortalStatic = 1,
    /// Promoted to immortal after its count approached overflow
    ImmortalPromoted = 2,
}

impl ObjectKind {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ObjectKind::Normal,
            1 => ObjectKind::ImmortalStatic,
            _ => ObjectKind::ImmortalPromoted,
        }
    }

    /// Whether retain/release are accounting no-ops for this kind
    #[inline]
    pub fn is_immortal(self) -> bool {
        self != ObjectKind::Normal
    }
}

/// Per-type information needed to destroy an object
pub struct ObjectVTable {
    /// Layout of the whole allocation (header plus payload)
    pub layout: Layout,
    /// Drops the payload in place
    pub drop_value: unsafe fn(NonNull<ObjectHeader>),
    /// Payload type identity, for checked downcasts
    pub type_id: fn() -> TypeId,
    /// Payload type name, for diagnostics
    pub type_name: fn() -> &'static str,
}

/// Object Header
///
/// Every runtime-managed object starts with this header.
#[repr(C)]
pub struct ObjectHeader {
    owner: AtomicU64,
    local: AtomicU32,
    kind: AtomicU8,
    weakly_referenced: AtomicBool,
    shared: AtomicIsize,
    weak_head: AtomicU32,
    vtable: &'static ObjectVTable,
}

impl ObjectHeader {
    /// Create a header holding one reference
    ///
    /// Owned objects count that reference locally. Unowned objects (the
    /// single-threaded mode) use the local field as their plain count.
    pub fn new(owner: u64, kind: ObjectKind, vtable: &'static ObjectVTable) -> Self {
        Self {
            owner: AtomicU64::new(owner),
            local: AtomicU32::new(1),
            kind: AtomicU8::new(kind as u8),
            weakly_referenced: AtomicBool::new(false),
            shared: AtomicIsize::new(0),
            weak_head: AtomicU32::new(NO_WEAKREFS),
            vtable,
        }
    }

    #[inline]
    pub fn vtable(&self) -> &'static ObjectVTable {
        self.vtable
    }

    // === Ownership ===

    #[inline]
    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_owned_by(&self, thread: u64) -> bool {
        self.owner.load(Ordering::Relaxed) == thread
    }

    /// Drop ownership. Must precede the merged CAS on the shared field.
    #[inline]
    pub fn clear_owner(&self) {
        self.owner.store(UNOWNED, Ordering::Relaxed);
    }

    // === Local count (owner only) ===

    #[inline]
    pub fn local(&self) -> u32 {
        self.local.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_local(&self, value: u32) {
        self.local.store(value, Ordering::Relaxed);
    }

    /// Take the local count, leaving zero behind
    ///
    /// Swap rather than load/store: an exiting owner and a thread that found
    /// the owner gone may both fold the same object.
    #[inline]
    pub fn take_local(&self) -> u32 {
        self.local.swap(0, Ordering::AcqRel)
    }

    // === Kind ===

    #[inline]
    pub fn kind(&self) -> ObjectKind {
        ObjectKind::from_u8(self.kind.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_immortal(&self) -> bool {
        self.kind().is_immortal()
    }

    /// Transition Normal -> ImmortalPromoted
    ///
    /// Returns true if this call performed the transition.
    #[inline]
    pub fn promote(&self) -> bool {
        self.kind
            .compare_exchange(
                ObjectKind::Normal as u8,
                ObjectKind::ImmortalPromoted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // === Shared field ===

    #[inline]
    pub fn shared(&self) -> isize {
        self.shared.load(Ordering::Acquire)
    }

    /// Add `units` references to the shared count, returning the old value
    #[inline]
    pub fn add_shared(&self, units: isize) -> isize {
        self.shared.fetch_add(units * SHARED_UNIT, Ordering::AcqRel)
    }

    /// Single CAS attempt on the shared field
    ///
    /// # Memory Ordering
    ///
    /// AcqRel on success: a thread that observes the merged state sees the
    /// owner cleared and the folded count. Acquire on failure since the
    /// caller retries with the returned value.
    #[inline]
    pub fn cas_shared(&self, current: isize, new: isize) -> Result<isize, isize> {
        self.shared
            .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Set the maybe-weakref state if no other state is set
    pub fn set_maybe_weakref(&self) {
        let mut shared = self.shared.load(Ordering::Relaxed);
        loop {
            if shared_flags(shared) != FLAG_NONE {
                // Already weakref, queued or merged
                return;
            }
            match self.cas_shared(shared, shared | FLAG_MAYBE_WEAKREF) {
                Ok(_) => return,
                Err(actual) => shared = actual,
            }
        }
    }

    #[inline]
    pub fn is_merged(&self) -> bool {
        shared_flags(self.shared()) == FLAG_MERGED
    }

    /// Logical refcount snapshot
    ///
    /// Racy while other threads are active. Immortal objects report
    /// [`IMMORTAL_REFCOUNT`].
    pub fn refcount(&self) -> usize {
        if self.is_immortal() {
            return IMMORTAL_REFCOUNT;
        }
        let shared = shared_count(self.shared());
        let total = if self.is_merged() {
            shared
        } else {
            self.local() as isize + shared
        };
        total.max(0) as usize
    }

    // === Weak list head ===

    #[inline]
    pub fn weak_head(&self) -> u32 {
        self.weak_head.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_weak_head(&self, slot: u32) {
        self.weak_head.store(slot, Ordering::Release);
    }

    #[inline]
    pub fn has_weakrefs(&self) -> bool {
        self.weak_head() != NO_WEAKREFS
    }

    /// Sticky: set under the weak stripe lock when the first record is
    /// created, never cleared. Deallocation takes the stripe lock only for
    /// objects with this bit.
    #[inline]
    pub fn mark_weakly_referenced(&self) {
        self.weakly_referenced.store(true, Ordering::Release);
    }

    #[inline]
    pub fn ever_weakly_referenced(&self) -> bool {
        self.weakly_referenced.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .field("local", &self.local())
            .field("kind", &self.kind())
            .field("shared", &format_args!("{:#x}", self.shared()))
            .field("type", &(self.vtable.type_name)())
            .finish()
    }
}

/// Header and payload in one allocation
#[repr(C)]
pub(crate) struct ObjectBox<T> {
    pub(crate) header: ObjectHeader,
    pub(crate) value: T,
}

impl<T: Send + Sync + 'static> ObjectBox<T> {
    pub(crate) const VTABLE: &'static ObjectVTable = &ObjectVTable {
        layout: Layout::new::<ObjectBox<T>>(),
        drop_value: drop_payload::<T>,
        type_id: TypeId::of::<T>,
        type_name: std::any::type_name::<T>,
    };
}

unsafe fn drop_payload<T>(header: NonNull<ObjectHeader>) {
    let object = header.cast::<ObjectBox<T>>().as_ptr();
    // SAFETY: header is the first field of a live ObjectBox<T>; the payload
    // is dropped exactly once, during deallocation.
    std::ptr::drop_in_place(std::ptr::addr_of_mut!((*object).value));
}

/// Raw handle to a managed object
///
/// Copyable and address-identified. Holding an `ObjectRef` does not keep the
/// object alive: the holder must own one counted reference for as long as
/// it uses the handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(NonNull<ObjectHeader>);

// SAFETY: all header state behind the pointer is atomic; payloads are
// required to be Send + Sync at allocation.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    #[inline]
    pub(crate) fn from_header(header: NonNull<ObjectHeader>) -> Self {
        ObjectRef(header)
    }

    /// Address of the object, stable for its lifetime
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn as_non_null(self) -> NonNull<ObjectHeader> {
        self.0
    }

    /// Borrow the header
    ///
    /// # Safety
    ///
    /// The object must still be allocated.
    #[inline]
    pub unsafe fn header<'a>(self) -> &'a ObjectHeader {
        &*self.0.as_ptr()
    }

    /// Borrow the payload if it has type `T`
    ///
    /// # Safety
    ///
    /// The caller must hold a reference to the object for `'a`.
    pub unsafe fn downcast_ref<'a, T: 'static>(self) -> Option<&'a T> {
        let header = self.header();
        if (header.vtable().type_id)() != TypeId::of::<T>() {
            return None;
        }
        let object = self.0.cast::<ObjectBox<T>>().as_ptr();
        Some(&*std::ptr::addr_of!((*object).value))
    }

    /// Logical refcount snapshot
    ///
    /// # Safety
    ///
    /// The object must still be allocated.
    pub unsafe fn refcount(self) -> usize {
        self.header().refcount()
    }

    /// # Safety
    ///
    /// The object must still be allocated.
    pub unsafe fn kind(self) -> ObjectKind {
        self.header().kind()
    }

    /// Handle for tests that only need identity, never dereferenced
    #[cfg(test)]
    pub(crate) fn dangling(addr: usize) -> Self {
        let ptr = NonNull::new(addr as *mut ObjectHeader).expect("nonzero test address");
        ObjectRef(ptr)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    struct Payload(u64);

    fn header() -> ObjectHeader {
        ObjectHeader::new(7, ObjectKind::Normal, ObjectBox::<Payload>::VTABLE)
    }

    #[test]
    fn test_shared_packing() {
        let packed = pack_shared(5, FLAG_MERGED);
        assert_eq!(shared_count(packed), 5);
        assert_eq!(shared_flags(packed), FLAG_MERGED);

        // Negative counts keep their state bits
        let negative = FLAG_QUEUED - SHARED_UNIT;
        assert_eq!(shared_count(negative), -1);
        assert_eq!(shared_flags(negative), FLAG_QUEUED);
    }

    #[test]
    fn test_new_header_holds_one_reference() {
        let h = header();
        assert_eq!(h.local(), 1);
        assert_eq!(h.shared(), 0);
        assert_eq!(h.refcount(), 1);
        assert!(h.is_owned_by(7));
        assert!(!h.has_weakrefs());
    }

    #[test]
    fn test_refcount_combines_fields() {
        let h = header();
        h.add_shared(2);
        assert_eq!(h.refcount(), 3);

        h.clear_owner();
        let local = h.take_local() as isize;
        let merged = pack_shared(shared_count(h.shared()) + local, FLAG_MERGED);
        while h.cas_shared(h.shared(), merged).is_err() {}
        assert_eq!(h.refcount(), 3);
        assert_eq!(h.local(), 0);
    }

    #[test]
    fn test_maybe_weakref_only_from_none() {
        let h = header();
        h.set_maybe_weakref();
        assert_eq!(shared_flags(h.shared()), FLAG_MAYBE_WEAKREF);

        let queued = header();
        while queued.cas_shared(0, FLAG_QUEUED).is_err() {}
        queued.set_maybe_weakref();
        assert_eq!(shared_flags(queued.shared()), FLAG_QUEUED);
    }

    #[test]
    fn test_promote_once() {
        let h = header();
        assert!(h.promote());
        assert!(!h.promote());
        assert_eq!(h.kind(), ObjectKind::ImmortalPromoted);
        assert_eq!(h.refcount(), IMMORTAL_REFCOUNT);
    }

    #[test]
    fn test_vtable_layout_covers_payload() {
        let vtable = ObjectBox::<Payload>::VTABLE;
        assert!(vtable.layout.size() >= std::mem::size_of::<ObjectHeader>() + 8);
        assert_eq!((vtable.type_id)(), TypeId::of::<Payload>());
    }
}
