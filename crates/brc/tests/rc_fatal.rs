//! Fatal Error Tests
//!
//! Negative counts and a lost merge-queue entry leave no safe state to
//! continue from. Each scenario runs in a child process and must abort it:
//! - Queue chunk allocation failure during a cross-thread release
//! - Over-release on the owner, single-threaded and merge paths
//! - No `catch_unwind` in the caller can observe the error
//!
//! ============================================================================
//! A SCENARIO THAT RETURNS OR MERELY PANICS FAILS ITS TEST
//! ============================================================================

mod common;

use common::{assert_aborts, RcFixture};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// ============================================================================
/// MERGE QUEUE EXHAUSTION
/// ============================================================================

/// A queued release that cannot get a chunk
///
/// **Bug this finds:** Queue entry silently dropped on allocation failure,
/// leaking the object or losing its free
/// **Invariant verified:** Chunk OOM while queueing aborts the process
#[test]
fn test_queue_chunk_oom_aborts() {
    assert_aborts(
        "test_queue_chunk_oom_aborts",
        "merge queue",
        || {
            // Arrange - O is counted only in its owner's local field
            let fixture = RcFixture::biased();
            let owner = fixture.thread();
            let stranger = fixture.thread();
            let obj = fixture.runtime.allocate(&owner, fixture.tracked(1)).unwrap();
            assert_eq!(fixture.allocator.chunks_allocated(), 0);

            // Act - the release must queue, and the chunk is refused
            fixture.allocator.set_failing(true);
            let _ = catch_unwind(AssertUnwindSafe(|| unsafe {
                fixture.runtime.release(&stranger, obj);
            }));
        },
    );
}

/// Queued releases draw their chunks from the runtime's allocator
///
/// **Bug this finds:** Queue chunks bypassing the allocator collaborator
/// **Invariant verified:** Every chunk is returned once the queue drains
#[test]
fn test_queue_chunks_use_runtime_allocator() {
    let fixture = RcFixture::biased();
    let owner = fixture.thread();
    let stranger = fixture.thread();
    let obj = fixture.runtime.allocate(&owner, fixture.tracked(2)).unwrap();

    unsafe { fixture.runtime.release(&stranger, obj) };
    assert_eq!(fixture.allocator.chunks_allocated(), 1);
    assert_eq!(fixture.allocator.chunks_outstanding(), 1);

    let report = fixture.runtime.drain_merge_queue(&owner);

    assert_eq!(report.deallocated, 1);
    assert_eq!(fixture.allocator.chunks_outstanding(), 0);
    fixture.assert_all_freed(1);
}

/// ============================================================================
/// NEGATIVE COUNTS (debug builds)
/// ============================================================================

/// Over-release discovered when the owner merges its queue
///
/// **Bug this finds:** Negative merged count caught and ignored by a caller
/// **Invariant verified:** The merge-time check aborts through catch_unwind
#[test]
#[cfg(debug_assertions)]
fn test_negative_merge_aborts_through_catch_unwind() {
    assert_aborts(
        "test_negative_merge_aborts_through_catch_unwind",
        "Negative refcount -1",
        || {
            let fixture = RcFixture::biased();
            let owner = fixture.thread();
            let other = fixture.thread();
            let obj = fixture.runtime.allocate(&owner, 1u32).unwrap();

            unsafe {
                // One reference, released twice from another thread
                fixture.runtime.release(&other, obj);
                fixture.runtime.release(&other, obj);
            }
            let caught = catch_unwind(AssertUnwindSafe(|| {
                fixture.runtime.drain_merge_queue(&owner)
            }));
            eprintln!("drain returned to its caller: {}", caught.is_err());
        },
    );
}

/// Owner releasing past zero
///
/// **Bug this finds:** Local count wrapping to u32::MAX in debug builds
/// **Invariant verified:** Owner-local underflow aborts
#[test]
#[cfg(debug_assertions)]
fn test_owner_local_over_release_aborts() {
    assert_aborts(
        "test_owner_local_over_release_aborts",
        "Negative refcount -1",
        || {
            let fixture = RcFixture::biased();
            let owner = fixture.thread();
            let obj = fixture.runtime.allocate(&owner, 3u32).unwrap();
            // The block stays mapped after the first release frees it
            fixture.allocator.set_quarantine(true);

            unsafe {
                fixture.runtime.release_local(&owner, obj);
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    fixture.runtime.release_local(&owner, obj);
                }));
            }
        },
    );
}

/// Single-threaded release past zero
///
/// **Bug this finds:** Plain refcount underflow unchecked under the runtime
/// lock
/// **Invariant verified:** Single-threaded underflow aborts
#[test]
#[cfg(debug_assertions)]
fn test_single_threaded_over_release_aborts() {
    assert_aborts(
        "test_single_threaded_over_release_aborts",
        "Negative refcount -1",
        || {
            let fixture = RcFixture::single_threaded();
            let thread = fixture.thread();
            let obj = fixture.runtime.allocate(&thread, 4u32).unwrap();
            fixture.allocator.set_quarantine(true);

            unsafe {
                fixture.runtime.release(&thread, obj);
                let _ = catch_unwind(AssertUnwindSafe(|| {
                    fixture.runtime.release(&thread, obj);
                }));
            }
        },
    );
}
