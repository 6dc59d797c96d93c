//! Thread identity, thread records and bucket thread lists

use super::object_stack::ObjectStack;
use crate::ensure;
use crate::error::{BrcError, Result};
use crate::object::ObjectRef;
use crate::runtime::RuntimeInner;
use crate::stats::ThreadStats;
use indexmap::IndexSet;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Stable, cheaply comparable thread identity
///
/// Zero is reserved: it marks objects with no owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    pub fn new(raw: u64) -> Result<Self> {
        NonZeroU64::new(raw)
            .map(ThreadId)
            .ok_or(BrcError::InvalidThreadId(raw))
    }

    /// A process-unique identity
    ///
    /// Identities handed out here never repeat, but may collide with ones
    /// built by hand through [`ThreadId::new`].
    pub fn unique() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let raw = NEXT.fetch_add(1, Ordering::Relaxed);
        // The counter starts at one and would need 2^64 calls to wrap.
        ThreadId(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    #[inline]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Slot of a thread record inside its bucket's list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ThreadSlot(u32);

/// Registry entry of one thread, shared with other threads under the
/// bucket mutex
pub(crate) struct ThreadRecord {
    pub(crate) id: ThreadId,
    /// Objects other threads handed to this owner for merging
    pub(crate) objects_to_merge: ObjectStack,
    /// Set when `objects_to_merge` gains an entry
    pub(crate) merge_requested: Arc<AtomicBool>,
}

struct ThreadNode {
    record: ThreadRecord,
    prev: Option<u32>,
    next: Option<u32>,
}

/// Doubly linked list of thread records, linked by arena index
#[derive(Default)]
pub(crate) struct ThreadList {
    nodes: Vec<Option<ThreadNode>>,
    free: Vec<u32>,
    head: Option<u32>,
    len: usize,
}

impl ThreadList {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Link a record at the head of the list
    pub(crate) fn insert(&mut self, record: ThreadRecord) -> ThreadSlot {
        let node = ThreadNode {
            record,
            prev: None,
            next: self.head,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx as usize] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as u32
            }
        };
        if let Some(old) = self.head {
            self.node_mut(old).prev = Some(idx);
        }
        self.head = Some(idx);
        self.len += 1;
        ThreadSlot(idx)
    }

    /// Unlink a record in constant time
    pub(crate) fn remove(&mut self, slot: ThreadSlot) -> Option<ThreadRecord> {
        let node = self.nodes.get_mut(slot.0 as usize)?.take()?;
        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        if let Some(next) = node.next {
            self.node_mut(next).prev = node.prev;
        }
        self.free.push(slot.0);
        self.len -= 1;
        Some(node.record)
    }

    /// Walk the list for `id`
    pub(crate) fn find_mut(&mut self, id: u64) -> Option<&mut ThreadRecord> {
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = self.nodes[idx as usize].as_ref()?;
            if node.record.id.get() == id {
                break;
            }
            cursor = node.next;
        }
        let idx = cursor?;
        self.nodes[idx as usize].as_mut().map(|n| &mut n.record)
    }

    pub(crate) fn get_mut(&mut self, slot: ThreadSlot) -> Option<&mut ThreadRecord> {
        self.nodes
            .get_mut(slot.0 as usize)?
            .as_mut()
            .map(|n| &mut n.record)
    }

    fn node_mut(&mut self, idx: u32) -> &mut ThreadNode {
        match self.nodes[idx as usize].as_mut() {
            Some(node) => node,
            None => crate::error::fatal(BrcError::Internal(format!(
                "thread list link to vacant slot {}",
                idx
            ))),
        }
    }
}

/// A registered thread
///
/// The explicit thread context passed to every lifetime operation. Owned by
/// the thread it names: `Send`, so it can be created on one thread and moved
/// to the thread it describes, but not `Sync`.
///
/// Dropping the handle unregisters the thread.
pub struct ThreadHandle {
    pub(crate) runtime: Arc<RuntimeInner>,
    pub(crate) id: ThreadId,
    pub(crate) bucket: usize,
    pub(crate) slot: ThreadSlot,
    pub(crate) merge_requested: Arc<AtomicBool>,
    /// Objects this thread still owns, merged on exit
    pub(crate) owned: RefCell<IndexSet<ObjectRef>>,
    /// Merge queue entries taken out from under the bucket mutex
    pub(crate) scratch: RefCell<ObjectStack>,
    pub(crate) stats: Arc<ThreadStats>,
    pub(crate) registered: Cell<bool>,
}

impl ThreadHandle {
    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Bucket this thread hashes into
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Whether another thread has queued objects since the last drain
    #[inline]
    pub fn has_pending_merges(&self) -> bool {
        self.merge_requested.load(Ordering::Acquire)
    }

    /// Number of objects currently tracked as owned by this thread
    pub fn owned_count(&self) -> usize {
        self.owned.borrow().len()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.get()
    }

    #[inline]
    pub(crate) fn raw_id(&self) -> u64 {
        self.id.get()
    }

    #[inline]
    pub(crate) fn track_owned(&self, obj: ObjectRef) {
        self.owned.borrow_mut().insert(obj);
    }

    #[inline]
    pub(crate) fn forget_owned(&self, obj: ObjectRef) {
        self.owned.borrow_mut().swap_remove(&obj);
    }

    pub(crate) fn ensure_registered(&self) -> Result<()> {
        ensure!(
            self.registered.get(),
            BrcError::Internal(format!("thread {} used after unregistering", self.id))
        );
        Ok(())
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        if self.registered.get() {
            let runtime = Arc::clone(&self.runtime);
            runtime.unregister(self);
        }
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id)
            .field("bucket", &self.bucket)
            .field("owned", &self.owned_count())
            .field("registered", &self.registered.get())
            .finish()
    }
}
