//! Safe Points
//!
//! Cross-thread releases of locally counted references wait in the owner's
//! merge queue until the owner reaches a safe point. The interpreter loop
//! polls at each of them:
//!
//! ```text
//! loop back-edge ─┐
//! call return ────┼──► Runtime::safepoint(thread, kind) ──► drain if requested
//! thread exit ────┘                                        (always at exit)
//! ```
//!
//! Polling is a single acquire load of the thread's merge-requested flag;
//! the bucket mutex is only taken when another thread has queued work.

use super::lifetime::DrainReport;
use super::Runtime;
use crate::brc::thread::ThreadHandle;

/// Where the caller is polling from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafepointKind {
    /// Backward jump of the interpreter loop
    BackEdge,
    /// Return from a call
    CallReturn,
    /// The thread is about to stop running managed code
    ThreadExit,
}

impl SafepointKind {
    /// Whether the poll must drain even without a pending request
    #[inline]
    pub fn is_exhaustive(self) -> bool {
        matches!(self, SafepointKind::ThreadExit)
    }
}

impl Runtime {
    /// Poll for pending merges and drain them
    ///
    /// Returns `None` when nothing was requested. At
    /// [`SafepointKind::ThreadExit`] the queue is drained unconditionally.
    pub fn safepoint(&self, thread: &ThreadHandle, kind: SafepointKind) -> Option<DrainReport> {
        if !kind.is_exhaustive() && !thread.has_pending_merges() {
            return None;
        }
        log::trace!("thread {} draining at {:?}", thread.id(), kind);
        Some(self.drain_merge_queue(thread))
    }
}
