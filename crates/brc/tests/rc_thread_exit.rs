//! Thread Exit Tests
//!
//! A thread that unregisters must leave nothing behind that depends on its
//! private counts:
//! - Owned objects merged into their shared fields
//! - Pending merge queues drained or handed off
//! - Remote releases after exit freeing exactly once

mod common;

use brc::logging::LifetimeEvent;
use brc::{BrcError, RuntimeConfig, ThreadId};
use common::RcFixture;
use std::sync::{Arc, Barrier};
use std::thread;

/// ============================================================================
/// UNREGISTER
/// ============================================================================

/// Owner exits with a pending remote retain unmerged
///
/// **Bug this finds:** Remote thread touching the exited owner's record
/// **Invariant verified:** After exit the shared field holds the whole count
#[test]
fn test_exit_folds_ownership_into_shared_field() {
    // Arrange - A owns O (local 1), B holds a remote reference
    let fixture = RcFixture::biased();
    let a = fixture.thread();
    let b = fixture.thread();
    let obj = fixture.runtime.allocate(&a, fixture.tracked(1)).unwrap();
    unsafe { fixture.runtime.retain_remote(&b, obj) };
    let a_id = a.id();

    // Act - A exits still holding its reference
    let report = fixture.runtime.unregister_thread(a);

    // Assert - A's reference now lives in the merged shared field
    assert_eq!(report.merged, 1);
    assert!(!fixture.runtime.is_registered(a_id));
    unsafe {
        assert!(obj.header().is_merged());
        assert_eq!(obj.header().owner(), 0);
        assert_eq!(obj.header().local(), 0);
        assert_eq!(obj.refcount(), 2);
    }

    // B releases both references without any owner to consult
    let runtime = fixture.runtime.clone();
    thread::spawn(move || unsafe {
        runtime.release_remote(&b, obj);
        assert_eq!(obj.refcount(), 1);
        runtime.release_remote(&b, obj);
    })
    .join()
    .unwrap();

    fixture.assert_all_freed(1);
}

/// Exit drains objects other threads queued
///
/// **Bug this finds:** Queue entries dropped with the thread record
/// **Invariant verified:** Every queued entry is merged exactly once
#[test]
fn test_exit_drains_pending_queue() {
    let fixture = RcFixture::biased();
    let owner = fixture.thread();
    let other = fixture.thread();

    let objects: Vec<_> = (0..3)
        .map(|i| fixture.runtime.allocate(&owner, fixture.tracked(i)).unwrap())
        .collect();
    // Give away the owner's only reference to each
    for obj in &objects {
        unsafe { fixture.runtime.release(&other, *obj) };
    }
    assert_eq!(fixture.runtime.pending_merge_count(&owner), 3);

    let report = fixture.runtime.unregister_thread(owner);

    assert_eq!(report.drained, 3);
    assert_eq!(report.deallocated, 3);
    assert_eq!(report.merged, 0);
    assert_eq!(report.handed_off, 0);
    fixture.assert_all_freed(3);
}

/// Dropping the handle unregisters
///
/// **Bug this finds:** Leaked thread records when a thread panics or returns
/// **Invariant verified:** Handle drop has the same effect as unregistering
#[test]
fn test_drop_unregisters() {
    let fixture = RcFixture::biased();
    let thread = fixture.thread();
    let id = thread.id();
    let obj = fixture.runtime.allocate(&thread, fixture.tracked(2)).unwrap();
    assert!(fixture.runtime.is_registered(id));

    drop(thread);

    assert!(!fixture.runtime.is_registered(id));
    assert_eq!(fixture.runtime.thread_count(), 0);
    unsafe { assert!(obj.header().is_merged()) };

    // The identity can be reused, and the new thread releases as a stranger
    let again = fixture.runtime.register_thread(id).unwrap();
    unsafe { fixture.runtime.release(&again, obj) };
    fixture.assert_all_freed(1);
}

/// Duplicate registration is rejected
///
/// **Bug this finds:** Two records for one identity splitting a merge queue
#[test]
fn test_duplicate_registration_rejected() {
    let fixture = RcFixture::biased();
    let id = ThreadId::new(4242).unwrap();
    let _first = fixture.runtime.register_thread(id).unwrap();

    let second = fixture.runtime.register_thread(id);

    assert!(matches!(second, Err(BrcError::ThreadAlreadyRegistered(dup)) if dup == id));
    assert_eq!(fixture.runtime.thread_count(), 1);
    assert!(matches!(ThreadId::new(0), Err(BrcError::InvalidThreadId(0))));
}

/// Lifecycle events are recorded when verbose
///
/// **Bug this finds:** Exit report and event disagreeing
#[test]
fn test_exit_event_matches_report() {
    let fixture = RcFixture::with_config(RuntimeConfig {
        verbose: true,
        ..Default::default()
    });
    let thread = fixture.thread();
    let raw = thread.id().get();
    let _obj = fixture.runtime.allocate(&thread, 1u32).unwrap();

    let report = fixture.runtime.unregister_thread(thread);

    let events: Vec<LifetimeEvent> = fixture
        .runtime
        .logger()
        .get_events()
        .into_iter()
        .map(|(_, event)| event)
        .collect();
    assert!(events.contains(&LifetimeEvent::ThreadRegistered {
        thread: raw,
        bucket: (raw % 257) as usize,
    }));
    assert!(events.contains(&LifetimeEvent::ThreadUnregistered {
        thread: raw,
        drained: report.drained,
        merged: report.merged,
        handed_off: report.handed_off,
        deallocated: report.deallocated,
    }));
}

/// ============================================================================
/// STRESS
/// ============================================================================

/// Owners exit while other threads still release their objects
///
/// **Bug this finds:** Use of an exited owner's record, lost frees in the
/// window between the final drain and unlinking
/// **Invariant verified:** Every object is freed exactly once
#[test]
fn test_owners_exit_during_remote_releases() {
    const OWNERS: usize = 4;
    const OBJECTS: usize = 500;

    let fixture = RcFixture::biased();
    let (tx, rx) = crossbeam::channel::unbounded();
    let barrier = Arc::new(Barrier::new(OWNERS + 1));

    let owners: Vec<_> = (0..OWNERS)
        .map(|o| {
            let runtime = fixture.runtime.clone();
            let handle = fixture.thread();
            let tx = tx.clone();
            let barrier = Arc::clone(&barrier);
            let drops = Arc::clone(&fixture.drops);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..OBJECTS {
                    let payload = common::Tracked::new((o * OBJECTS + i) as u64, &drops);
                    let obj = runtime.allocate(&handle, payload).unwrap();
                    // Keep half the references until exit
                    if i % 2 == 0 {
                        unsafe { runtime.retain(&handle, obj) };
                        tx.send((obj, 2)).unwrap();
                    } else {
                        tx.send((obj, 1)).unwrap();
                    }
                }
                // Exit with references still owned and entries still queued
                runtime.unregister_thread(handle)
            })
        })
        .collect();
    drop(tx);

    let releaser = fixture.thread();
    barrier.wait();
    let mut expected = 0;
    for (obj, refs) in rx {
        expected += 1;
        for _ in 0..refs {
            unsafe { fixture.runtime.release(&releaser, obj) };
        }
    }
    for owner in owners {
        owner.join().expect("owner should not panic");
    }
    drop(releaser);

    assert_eq!(expected, OWNERS * OBJECTS);
    fixture.assert_all_freed(OWNERS * OBJECTS);
    assert_eq!(fixture.runtime.thread_count(), 0);
}
