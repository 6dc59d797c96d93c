//! Error Module - BRC Error Types
//!
//! Defines all error types used by the reference counting runtime.
//!
//! # Error Categories
//!
//! ## Memory Errors
//! - `OutOfMemory` - Allocator could not provide an object block
//! - `QueueOutOfMemory` - Allocator could not provide a merge-queue chunk
//!
//! ## Logic Errors
//! - `NegativeRefcount` - A release drove a count below zero
//! - `Internal` - Invariant violation inside the runtime
//!
//! ## Registry Errors
//! - `ThreadAlreadyRegistered` - Duplicate thread identity
//! - `InvalidThreadId` - Reserved identity used for registration
//!
//! ## Configuration Errors
//! - `Configuration` - Invalid runtime configuration
//!
//! A stale weak reference is not an error: `Runtime::dereference` simply
//! returns `None` for it.

use crate::brc::thread::ThreadId;
use crate::config::ConfigError;
use thiserror::Error;

/// Main error type for all BRC operations
///
/// # Examples
///
/// ```rust
/// use brc::BrcError;
///
/// fn handle_error(err: BrcError) {
///     match err {
///         BrcError::OutOfMemory { requested } => {
///             eprintln!("OOM: requested {} bytes", requested);
///         }
///         BrcError::ThreadAlreadyRegistered(id) => {
///             eprintln!("thread {} registered twice", id);
///         }
///         _ => {
///             eprintln!("Other error: {}", err);
///         }
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum BrcError {
    /// Out of memory
    ///
    /// **When returned:** The allocator collaborator refused a block for a
    /// new object. No bookkeeping has been touched.
    ///
    /// **Recovery strategy:** Retry or report to the caller
    #[error("Out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Out of memory while growing a merge queue
    ///
    /// **When returned:** `ObjectStack::push` could not get a chunk. Inside
    /// the runtime this happens while queueing a cross-thread release.
    ///
    /// **Recovery strategy:** Cannot recover - the pending entry carries a
    /// reference, losing it is a leak or a lost free
    #[error("Out of memory growing a merge queue: requested {requested} bytes")]
    QueueOutOfMemory { requested: usize },

    /// Negative reference count
    ///
    /// **When returned:** A release drove the local count or the merged
    /// shared count below zero. Only detected in debug builds.
    ///
    /// **Recovery strategy:** Cannot recover - the caller released a
    /// reference it did not own, continuing risks a double free
    #[error("Negative refcount {count} on object {address:#x}")]
    NegativeRefcount { address: usize, count: isize },

    /// Thread registered twice
    ///
    /// **When returned:** `register_thread` is called with an identity that
    /// already has a live record
    ///
    /// **Recovery strategy:** Unregister the previous handle first, or use
    /// `ThreadId::unique()`
    #[error("Thread {0} is already registered")]
    ThreadAlreadyRegistered(ThreadId),

    /// Reserved thread identity
    ///
    /// **When returned:** Identity 0 is passed to `ThreadId::new` or to
    /// registration. It marks objects with no owner.
    ///
    /// **Recovery strategy:** Pick a nonzero identity
    #[error("Invalid thread id {0}: zero is reserved for unowned objects")]
    InvalidThreadId(u64),

    /// Configuration error
    ///
    /// **When returned:** `Runtime::new` was given a configuration that fails
    /// validation
    ///
    /// **Recovery strategy:** Use default configuration or fail fast
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// Internal error - indicates a bug in the runtime
    ///
    /// **When returned:** Invariant violation or unexpected state
    ///
    /// **Recovery strategy:** Cannot recover - this is a bug
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrcError {
    /// Check if this error must abort the process when raised inside the runtime
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BrcError::QueueOutOfMemory { .. }
                | BrcError::NegativeRefcount { .. }
                | BrcError::Internal(_)
        )
    }

    /// Check if this error indicates a bug in the calling code or the runtime
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            BrcError::NegativeRefcount { .. }
                | BrcError::Internal(_)
                | BrcError::ThreadAlreadyRegistered(_)
        )
    }
}

/// Result type alias for BRC operations
pub type Result<T> = std::result::Result<T, BrcError>;

/// Abort the process with a diagnostic.
///
/// Used where no safe partial state exists: a lost merge-queue entry or a
/// negative count. Never unwinds, so no `catch_unwind` in the caller can
/// keep using counts that are already wrong.
#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn fatal(err: BrcError) -> ! {
    let location = std::panic::Location::caller();
    log::error!("fatal refcount error: {} at {}", err, location);
    // The log facade may have no logger installed
    eprintln!("fatal refcount error: {} at {}", err, location);
    std::process::abort()
}

/// Unwrap a result or escalate through [`fatal`]
pub(crate) trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for Result<T> {
    #[inline]
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }
}

/// Ensure condition is true, otherwise return error
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}
