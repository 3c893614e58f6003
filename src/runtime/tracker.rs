//! In-flight operation accounting and coordinated teardown.
//!
//! Every asynchronous operation on a connection first calls
//! [`AsyncOperationTracker::prepare`]. When it completes it builds an
//! [`AsyncOperationGuard`]; dropping the guard balances the count and, when
//! the last operation drains, runs the context's finish hook. The tracker
//! state lives in one atomic word, so any number of completions racing on
//! different threads agree on which of them performs the transition.

use std::sync::atomic::{AtomicU32, Ordering};

/// Ceiling on concurrently tracked operations.
pub const MAX_OPERATIONS: u32 = 0xFFFF;

const COUNT_MASK: u32 = 0x00FF_FFFF;
const SHUTDOWN: u32 = 1 << 30;
const FINISHED: u32 = 1 << 31;

/// Counter of in-flight operations plus the shutting-down and finished marks.
#[derive(Debug)]
pub struct AsyncOperationTracker {
    state: AtomicU32,
}

impl Default for AsyncOperationTracker {
    fn default() -> Self {
        Self::new(true)
    }
}

impl AsyncOperationTracker {
    /// A tracker created with `active == false` starts shutting down and must
    /// be brought up with [`activate`](Self::activate).
    pub fn new(active: bool) -> Self {
        Self {
            state: AtomicU32::new(if active { 0 } else { SHUTDOWN }),
        }
    }

    /// Register one more operation. Fails once shutdown has begun or when
    /// the ceiling would be exceeded; the counter is untouched on failure.
    pub fn prepare(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & SHUTDOWN != 0 || current & COUNT_MASK >= MAX_OPERATIONS {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Balance one `prepare`, returning the remaining count.
    pub fn complete(&self) -> u32 {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & COUNT_MASK > 0, "complete without prepare");
        (previous & COUNT_MASK) - 1
    }

    /// Begin shutting down. Returns true only for the call that flipped the
    /// state.
    pub fn shutdown(&self) -> bool {
        self.state.fetch_or(SHUTDOWN, Ordering::AcqRel) & SHUTDOWN == 0
    }

    /// Claim the finished transition. Succeeds exactly once per activation,
    /// and only while no operation is outstanding.
    pub fn finish(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & FINISHED != 0 || current & COUNT_MASK != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                FINISHED | SHUTDOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Bring a shut down tracker back to the active state with a zero count.
    /// Returns false if it was already active.
    pub fn activate(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & SHUTDOWN == 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) & SHUTDOWN == 0
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) & FINISHED != 0
    }

    /// Outstanding operations.
    pub fn count(&self) -> u32 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }
}

/// The object an operation runs on behalf of.
pub trait AsyncContext {
    fn async_operations(&self) -> &AsyncOperationTracker;

    /// Runs once, after the last outstanding operation completed.
    fn finish(&self);

    /// Runs once, when a failed operation starts the shutdown.
    fn shutdown(&self);
}

/// Scoped completion of one tracked operation.
///
/// Create it at the top of a completion and call [`failed`](Self::failed)
/// on error. Work the completion re-arms must be prepared before the guard
/// drops, otherwise the count may reach zero and finish the context early.
pub struct AsyncOperationGuard<'a, C: AsyncContext + ?Sized> {
    context: &'a C,
    failed: bool,
}

impl<'a, C: AsyncContext + ?Sized> AsyncOperationGuard<'a, C> {
    pub fn new(context: &'a C) -> Self {
        Self {
            context,
            failed: false,
        }
    }

    pub fn failed(&mut self) {
        self.failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn try_finish(&self, stop: bool) {
        let tracker = self.context.async_operations();
        if tracker.finish() {
            self.context.finish();
        } else if stop && tracker.shutdown() {
            self.context.shutdown();
        }
    }
}

impl<C: AsyncContext + ?Sized> Drop for AsyncOperationGuard<'_, C> {
    fn drop(&mut self) {
        let remaining = self.context.async_operations().complete();
        if self.failed {
            self.try_finish(true);
        } else if remaining == 0 {
            self.try_finish(false);
        }
    }
}
