//! Completion / thread-affinity contracts (spec §5, §9).
//!
//! Work-queue infrastructure is an external collaborator (spec §1): this
//! module only names the contract the depot assumes of it, plus the debug-
//! build thread-affinity assertion spec §9 calls for. Production embedders
//! implement `ZoneThread` against their own work queue; `#[cfg(test)]`
//! below ships a trivial same-thread stand-in for the integration suite.

use alloc::boxed::Box;

use crate::error::DepotResult;

pub type ThreadId = u32;

/// A typed continuation: where it runs, and what to do with the result.
/// Spec §9 asks for tagged variants over a polymorphic completion base
/// class; a boxed `FnOnce` plus an explicit `thread_id` is the tagged
/// variant that fits a work-queue contract we don't own.
pub struct Completion {
    pub thread_id: ThreadId,
    pub run: Box<dyn FnOnce(DepotResult<()>) + Send>,
}

/// Contract for enqueuing a completion onto a specific zone's thread.
pub trait ZoneThread {
    fn current_thread_id(&self) -> ThreadId;
    fn enqueue(&self, completion: Completion);
}

/// Debug-only assertion that the caller is running on the allocator's own
/// thread (spec §9, "thread-affinity enforcement"). In release builds this
/// is a no-op; production callers rely on the type system (a non-`Send`
/// handle the allocator only hands out on its own thread) instead.
#[inline]
pub fn assert_on_thread(executor: &dyn ZoneThread, expected: ThreadId) {
    debug_assert_eq!(
        executor.current_thread_id(),
        expected,
        "depot operation invoked off its owning zone thread"
    );
}

#[cfg(test)]
pub struct TestExecutor {
    pub thread_id: ThreadId,
}

#[cfg(test)]
impl ZoneThread for TestExecutor {
    fn current_thread_id(&self) -> ThreadId {
        self.thread_id
    }

    fn enqueue(&self, completion: Completion) {
        (completion.run)(Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_runs_inline() {
        use alloc::sync::Arc;
        use core::sync::atomic::{AtomicBool, Ordering};

        let exec = TestExecutor { thread_id: 3 };
        assert_on_thread(&exec, 3);
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = flag.clone();
        exec.enqueue(Completion {
            thread_id: 3,
            run: Box::new(move |_| flag_clone.store(true, Ordering::SeqCst)),
        });
        assert!(flag.load(Ordering::SeqCst));
    }
}
