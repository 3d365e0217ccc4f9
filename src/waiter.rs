//! Waiter queue (spec §5, §9): callers that must block on a resource (a
//! full journal tail, an exhausted scrubber, a VIO pool) register a
//! callback and get re-scheduled when the resource frees up.
//!
//! The source uses an intrusive singly-linked list so waiting costs no
//! allocation beyond the waiter's own storage. A boxed-closure FIFO gives
//! the same O(1) enqueue/dequeue without `unsafe` linked-list surgery,
//! at the cost of one allocation per waiter — acceptable here since waiters
//! are rare (allocation failure, scrub backlog) rather than per-I/O.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use crate::error::DepotResult;

pub type WaiterCallback = Box<dyn FnOnce(DepotResult<()>)>;

#[derive(Default)]
pub struct WaiterQueue {
    waiters: VecDeque<WaiterCallback>,
}

impl WaiterQueue {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, callback: WaiterCallback) {
        self.waiters.push_back(callback);
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Notify every waiter in FIFO order with `result`, draining the queue.
    pub fn notify_all(&mut self, result: DepotResult<()>) {
        while let Some(cb) = self.waiters.pop_front() {
            cb(result);
        }
    }

    /// Notify a single waiter, if any.
    pub fn notify_next(&mut self, result: DepotResult<()>) -> bool {
        match self.waiters.pop_front() {
            Some(cb) => {
                cb(result);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use alloc::vec::Vec;
    use core::cell::RefCell;

    #[test]
    fn notify_all_runs_in_fifo_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut q = WaiterQueue::new();
        for i in 0..3 {
            let log = Rc::clone(&log);
            q.enqueue(Box::new(move |_| log.borrow_mut().push(i)));
        }
        q.notify_all(Ok(()));
        assert_eq!(*log.borrow(), alloc::vec![0, 1, 2]);
        assert!(q.is_empty());
    }
}
