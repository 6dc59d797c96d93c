//! Runtime - the public face of the reference counting subsystem
//!
//! A [`Runtime`] owns the thread registry, the weak reference lists, the
//! allocator collaborator and the statistics. Every operation takes the
//! calling thread's [`ThreadHandle`] explicitly; nothing is looked up
//! through thread-local state.

pub mod lifetime;
pub mod safepoint;

pub use lifetime::{DrainReport, UnregisterReport};
pub use safepoint::SafepointKind;

use crate::allocator::{Allocator, SystemAllocator};
use crate::brc::thread::{ThreadHandle, ThreadId};
use crate::brc::BrcState;
use crate::config::{RefcountMode, RuntimeConfig};
use crate::error::Result;
use crate::logging::{EventLogger, EventLoggerConfig, LifetimeEvent};
use crate::object::header::{ObjectBox, ObjectHeader, ObjectKind, UNOWNED};
use crate::object::weak::{WeakCallback, WeakRef, WeakRegistry};
use crate::object::ObjectRef;
use crate::stats::{Counter, StatsRegistry, StatsSummary};
use indexmap::IndexSet;
use parking_lot::ReentrantMutex;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::sync::Arc;

/// Shared runtime state, kept alive by the runtime and every thread handle
pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) brc: BrcState,
    pub(crate) weak: Arc<WeakRegistry>,
    pub(crate) allocator: Arc<dyn Allocator>,
    pub(crate) stats: StatsRegistry,
    pub(crate) logger: EventLogger,
    /// Serializes every operation in single-threaded mode
    pub(crate) lock: ReentrantMutex<()>,
}

/// Reference counting runtime
///
/// # Examples
///
/// ```rust
/// use brc::{Runtime, RuntimeConfig, ThreadId};
///
/// let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
/// let thread = runtime.register_thread(ThreadId::unique()).unwrap();
///
/// let obj = runtime.allocate(&thread, String::from("hello")).unwrap();
/// unsafe {
///     runtime.retain(&thread, obj);
///     assert_eq!(obj.refcount(), 2);
///     runtime.release(&thread, obj);
///     runtime.release(&thread, obj); // deallocated here
/// }
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime backed by the global allocator
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_allocator(config, Arc::new(SystemAllocator))
    }

    /// Create a runtime with a custom allocator collaborator
    pub fn with_allocator(config: RuntimeConfig, allocator: Arc<dyn Allocator>) -> Result<Self> {
        config.validate()?;

        let logger = EventLogger::new(EventLoggerConfig {
            history: config.event_history,
            ..Default::default()
        });
        if !config.verbose {
            logger.disable();
        }

        let inner = RuntimeInner {
            brc: BrcState::new(config.bucket_count, Arc::clone(&allocator)),
            weak: Arc::new(WeakRegistry::new()),
            allocator,
            stats: StatsRegistry::new(config.stats_enabled),
            logger,
            lock: ReentrantMutex::new(()),
            config,
        };
        log::debug!(
            "brc runtime created: mode={:?}, buckets={}, promotion_threshold={}",
            inner.config.mode,
            inner.config.bucket_count,
            inner.config.promotion_threshold
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> RefcountMode {
        self.inner.config.mode
    }

    pub fn logger(&self) -> &EventLogger {
        &self.inner.logger
    }

    /// Statistics over every thread, live or retired
    pub fn stats(&self) -> StatsSummary {
        self.inner.stats.summary()
    }

    #[inline]
    fn check_thread(&self, thread: &ThreadHandle) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &thread.runtime),
            "thread handle belongs to another runtime"
        );
        debug_assert!(thread.is_registered(), "thread handle used after unregistering");
    }

    // === Threads ===

    /// Register a thread
    ///
    /// Fails if `id` already has a live record.
    pub fn register_thread(&self, id: ThreadId) -> Result<ThreadHandle> {
        let (bucket, slot, merge_requested) = self.inner.brc.register(id)?;
        let handle = ThreadHandle {
            runtime: Arc::clone(&self.inner),
            id,
            bucket,
            slot,
            merge_requested,
            owned: RefCell::new(IndexSet::new()),
            scratch: RefCell::new(self.inner.brc.new_stack()),
            stats: self.inner.stats.register(),
            registered: Cell::new(true),
        };
        self.inner.logger.log(LifetimeEvent::ThreadRegistered {
            thread: id.get(),
            bucket,
        });
        Ok(handle)
    }

    /// Unregister a thread, merging everything it still owns
    pub fn unregister_thread(&self, thread: ThreadHandle) -> UnregisterReport {
        self.check_thread(&thread);
        self.inner.unregister(&thread)
    }

    pub fn is_registered(&self, id: ThreadId) -> bool {
        self.inner.brc.is_registered(id)
    }

    pub fn thread_count(&self) -> usize {
        self.inner.brc.thread_count()
    }

    /// Entries waiting in a thread's merge queue (diagnostic)
    pub fn pending_merge_count(&self, thread: &ThreadHandle) -> usize {
        self.inner.brc.pending(thread)
    }

    // === Allocation ===

    /// Allocate an object holding `value`, owned by `thread`
    ///
    /// The new object holds one reference, which belongs to the caller.
    pub fn allocate<T: Send + Sync + 'static>(&self, thread: &ThreadHandle, value: T) -> Result<ObjectRef> {
        self.inner.allocate(thread, value, ObjectKind::Normal)
    }

    /// Allocate an object that is immortal from birth
    ///
    /// Never deallocated; its memory stays with the allocator for the life
    /// of the process.
    pub fn allocate_static<T: Send + Sync + 'static>(&self, thread: &ThreadHandle, value: T) -> Result<ObjectRef> {
        self.inner.allocate(thread, value, ObjectKind::ImmortalStatic)
    }

    // === Lifetime operations ===

    /// Add a reference, choosing the local or remote path by ownership
    ///
    /// # Safety
    ///
    /// The caller must already hold a reference to `obj`.
    pub unsafe fn retain(&self, thread: &ThreadHandle, obj: ObjectRef) {
        self.check_thread(thread);
        self.inner.retain(thread, obj)
    }

    /// Drop a reference, deallocating the object if it was the last
    ///
    /// # Safety
    ///
    /// The caller must hold the reference being released and must not use
    /// `obj` afterwards unless it holds another.
    pub unsafe fn release(&self, thread: &ThreadHandle, obj: ObjectRef) {
        self.check_thread(thread);
        self.inner.release(thread, obj)
    }

    /// Owner-side retain
    ///
    /// # Safety
    ///
    /// As [`Runtime::retain`]; `thread` must own `obj`.
    pub unsafe fn retain_local(&self, thread: &ThreadHandle, obj: ObjectRef) {
        self.check_thread(thread);
        self.inner.retain_local(thread, obj)
    }

    /// Non-owner retain through the shared field
    ///
    /// # Safety
    ///
    /// As [`Runtime::retain`].
    pub unsafe fn retain_remote(&self, thread: &ThreadHandle, obj: ObjectRef) {
        self.check_thread(thread);
        self.inner.retain_remote(thread, obj)
    }

    /// Owner-side release
    ///
    /// # Safety
    ///
    /// As [`Runtime::release`]; `thread` must own `obj`.
    pub unsafe fn release_local(&self, thread: &ThreadHandle, obj: ObjectRef) {
        self.check_thread(thread);
        self.inner.release_local(thread, obj)
    }

    /// Non-owner release through the shared field or the owner's queue
    ///
    /// # Safety
    ///
    /// As [`Runtime::release`].
    pub unsafe fn release_remote(&self, thread: &ThreadHandle, obj: ObjectRef) {
        self.check_thread(thread);
        self.inner.release_remote(thread, obj)
    }

    /// Make `obj` immortal
    ///
    /// # Safety
    ///
    /// The caller must hold a reference to `obj`.
    pub unsafe fn promote(&self, thread: &ThreadHandle, obj: ObjectRef) -> bool {
        self.check_thread(thread);
        self.inner.promote(thread, obj)
    }

    /// Merge every object other threads queued for this thread
    pub fn drain_merge_queue(&self, thread: &ThreadHandle) -> DrainReport {
        self.check_thread(thread);
        self.inner.drain_merge_queue(thread)
    }

    // === Weak references ===

    /// Create a weak reference, optionally with a death callback
    ///
    /// # Safety
    ///
    /// The caller must hold a reference to `obj`.
    pub unsafe fn create_weak(
        &self,
        thread: &ThreadHandle,
        obj: ObjectRef,
        callback: Option<WeakCallback>,
    ) -> WeakRef {
        self.check_thread(thread);
        let _guard = self.inner.single_lock();
        let weak = self.inner.weak.create(obj, callback);
        thread.stats.record(Counter::WeakCreated);
        weak
    }

    /// Snapshot read of a weak reference
    ///
    /// Returns the target if it was alive with a positive refcount at the
    /// time of the call. The result is not retained: re-`retain` promptly
    /// or prefer [`Runtime::upgrade`].
    pub fn dereference(&self, weak: &WeakRef) -> Option<ObjectRef> {
        self.check_registry(weak);
        self.inner.dereference(weak)
    }

    /// Atomically retain the target of a weak reference if still alive
    ///
    /// The returned reference belongs to the caller.
    pub fn upgrade(&self, thread: &ThreadHandle, weak: &WeakRef) -> Option<ObjectRef> {
        self.check_thread(thread);
        self.check_registry(weak);
        self.inner.upgrade(thread, weak)
    }

    /// Number of live weak records attached to `obj`
    ///
    /// # Safety
    ///
    /// The caller must hold a reference to `obj`.
    pub unsafe fn weakref_count(&self, obj: ObjectRef) -> usize {
        self.inner.weak.count(obj)
    }

    /// Kill every weak reference to `obj` without running callbacks
    ///
    /// # Safety
    ///
    /// The caller must hold a reference to `obj`.
    pub unsafe fn clear_weakrefs_no_callbacks(&self, thread: &ThreadHandle, obj: ObjectRef) -> usize {
        self.check_thread(thread);
        let _guard = self.inner.single_lock();
        let report = self.inner.weak.teardown(obj, false);
        thread.stats.add(Counter::WeakCleared, report.cleared as u64);
        report.cleared
    }

    fn check_registry(&self, weak: &WeakRef) {
        debug_assert!(
            Arc::ptr_eq(&self.inner.weak, weak.registry()),
            "weak reference belongs to another runtime"
        );
    }
}

impl RuntimeInner {
    fn allocate<T: Send + Sync + 'static>(
        &self,
        thread: &ThreadHandle,
        value: T,
        kind: ObjectKind,
    ) -> Result<ObjectRef> {
        thread.ensure_registered()?;

        let vtable = ObjectBox::<T>::VTABLE;
        let block = self.allocator.allocate(vtable.layout)?;
        let biased = self.config.mode == RefcountMode::Biased && kind == ObjectKind::Normal;
        let owner = if biased { thread.raw_id() } else { UNOWNED };

        let object = block.cast::<ObjectBox<T>>();
        // SAFETY: block is a fresh allocation with ObjectBox<T>'s layout.
        unsafe {
            object.as_ptr().write(ObjectBox {
                header: ObjectHeader::new(owner, kind, vtable),
                value,
            });
        }
        let obj = ObjectRef::from_header(NonNull::cast(object));
        if biased {
            thread.track_owned(obj);
        }
        thread.stats.record(Counter::Allocation);
        Ok(obj)
    }
}
