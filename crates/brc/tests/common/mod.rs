//! Test Utilities for the BRC Test Suite
//!
//! Fixtures count every allocator call and every payload drop, so tests can
//! assert "deallocated exactly once" instead of inferring it from refcounts.
//!
//! ============================================================================
//! A LEAK AND A DOUBLE FREE MUST BOTH FAIL A TEST - NEVER ASSERT ">= 1"
//! ============================================================================

#![allow(dead_code)]

use brc::brc::object_stack::CHUNK_LAYOUT;
use brc::{
    Allocator, BrcError, RefcountMode, Result, Runtime, RuntimeConfig, SystemAllocator,
    ThreadHandle, ThreadId,
};
use parking_lot::Mutex;
use std::alloc::Layout;
use std::process::Command;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// ============================================================================
/// COUNTING ALLOCATOR
/// ============================================================================

/// Allocator that counts blocks and can be told to fail
///
/// Object blocks and merge-queue chunks are counted apart, so tests can
/// assert on objects regardless of how many chunks the queues needed.
#[derive(Default)]
pub struct CountingAllocator {
    inner: SystemAllocator,
    allocated: AtomicUsize,
    released: AtomicUsize,
    chunks_allocated: AtomicUsize,
    chunks_released: AtomicUsize,
    fail: AtomicBool,
    quarantine: AtomicBool,
}

impl CountingAllocator {
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Blocks handed out and not yet returned
    pub fn outstanding(&self) -> usize {
        self.allocated() - self.released()
    }

    /// Merge-queue chunks handed out and not yet returned
    pub fn chunks_outstanding(&self) -> usize {
        self.chunks_allocated.load(Ordering::SeqCst) - self.chunks_released.load(Ordering::SeqCst)
    }

    pub fn chunks_allocated(&self) -> usize {
        self.chunks_allocated.load(Ordering::SeqCst)
    }

    /// Refuse every request, objects and chunks alike
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Count releases but keep the blocks mapped
    ///
    /// Lets a test release an object once too often without reading
    /// returned memory.
    pub fn set_quarantine(&self, quarantine: bool) {
        self.quarantine.store(quarantine, Ordering::SeqCst);
    }

    fn is_chunk(layout: Layout) -> bool {
        layout == CHUNK_LAYOUT
    }
}

impl Allocator for CountingAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrcError::OutOfMemory {
                requested: layout.size(),
            });
        }
        let ptr = self.inner.allocate(layout)?;
        if Self::is_chunk(layout) {
            self.chunks_allocated.fetch_add(1, Ordering::SeqCst);
        } else {
            self.allocated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(ptr)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        if Self::is_chunk(layout) {
            self.chunks_released.fetch_add(1, Ordering::SeqCst);
        } else {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        if !self.quarantine.load(Ordering::SeqCst) {
            self.inner.release(ptr, layout);
        }
    }
}

/// ============================================================================
/// DROP TRACKING PAYLOAD
/// ============================================================================

/// Shared record of payload drops
#[derive(Default)]
pub struct DropLog {
    drops: AtomicUsize,
    threads: Mutex<Vec<std::thread::ThreadId>>,
}

impl DropLog {
    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    /// OS threads that ran a payload destructor, in order
    pub fn dropped_on(&self) -> Vec<std::thread::ThreadId> {
        self.threads.lock().clone()
    }
}

/// Payload that reports its own destruction
pub struct Tracked {
    pub value: u64,
    log: Arc<DropLog>,
}

impl Tracked {
    pub fn new(value: u64, log: &Arc<DropLog>) -> Self {
        Self {
            value,
            log: Arc::clone(log),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.log.threads.lock().push(std::thread::current().id());
        self.log.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// ============================================================================
/// RUNTIME FIXTURE
/// ============================================================================

/// Runtime wired to a counting allocator
pub struct RcFixture {
    pub runtime: Runtime,
    pub allocator: Arc<CountingAllocator>,
    pub drops: Arc<DropLog>,
}

impl RcFixture {
    /// Biased mode, default configuration
    ///
    /// **Bug this finds:** Default configuration failing its own validation
    pub fn biased() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Single-threaded mode
    pub fn single_threaded() -> Self {
        Self::with_config(RuntimeConfig {
            mode: RefcountMode::SingleThreaded,
            ..Default::default()
        })
    }

    /// Biased mode with a low promotion threshold
    pub fn with_threshold(promotion_threshold: u32) -> Self {
        Self::with_config(RuntimeConfig {
            promotion_threshold,
            ..Default::default()
        })
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let allocator = Arc::new(CountingAllocator::default());
        let runtime = Runtime::with_allocator(config, allocator.clone())
            .expect("runtime creation should succeed with valid config");
        Self {
            runtime,
            allocator,
            drops: Arc::new(DropLog::default()),
        }
    }

    pub fn thread(&self) -> ThreadHandle {
        self.runtime
            .register_thread(ThreadId::unique())
            .expect("fresh thread id should register")
    }

    pub fn tracked(&self, value: u64) -> Tracked {
        Tracked::new(value, &self.drops)
    }

    /// Assert that every allocation was returned and every payload dropped
    ///
    /// **Invariant verified:** allocator release and payload drop run once
    /// per deallocated object
    pub fn assert_all_freed(&self, expected: usize) {
        assert_eq!(self.drops.drops(), expected, "payload drop count");
        assert_eq!(self.allocator.released(), expected, "allocator release count");
        assert_eq!(self.allocator.outstanding(), 0, "blocks leaked");
    }
}

/// ============================================================================
/// ABORT HARNESS
/// ============================================================================

const ABORT_CHILD_ENV: &str = "BRC_TEST_ABORT_CHILD";

/// SIGABRT on Linux and macOS
#[cfg(unix)]
const SIGABRT: i32 = 6;

/// Run `scenario` in a child copy of this test binary and assert that it
/// aborts with `expected` on stderr
///
/// `test_name` must be the calling test's name: the child re-runs exactly
/// that test with `ABORT_CHILD_ENV` set, which sends it into `scenario`.
/// A scenario that returns, or that only panics, fails the parent.
///
/// **Invariant verified:** fatal refcount errors end the process and cannot
/// be caught
pub fn assert_aborts(test_name: &str, expected: &str, scenario: impl FnOnce()) {
    if std::env::var_os(ABORT_CHILD_ENV).is_some() {
        scenario();
        // Reaching here is the failure the parent reports
        std::process::exit(0);
    }

    let exe = std::env::current_exe().expect("test binary path should be known");
    let output = Command::new(exe)
        .args([test_name, "--exact", "--nocapture", "--test-threads=1"])
        .env(ABORT_CHILD_ENV, "1")
        .output()
        .expect("child test process should start");
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "scenario finished without aborting; stderr:\n{}",
        stderr
    );
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(
            output.status.signal(),
            Some(SIGABRT),
            "child should abort, not exit; status {:?}, stderr:\n{}",
            output.status,
            stderr
        );
    }
    assert!(
        stderr.contains(expected),
        "stderr should mention {:?}:\n{}",
        expected,
        stderr
    );
}
