//! C6: Slab Scrubber — replays slab journals to rebuild ref-counts (spec
//! §4.6).

use alloc::collections::VecDeque;

use crate::error::{DepotError, DepotResult};
use crate::reference_counts::{ReferenceCounts, ReferenceOperation, ReferenceOperationType};
use crate::slab::{Slab, SlabEvent};
use crate::waiter::WaiterQueue;

/// Owns the two scrub work lists for one zone. Slabs are identified by
/// their dense `slab_number`; the caller passes the actual `Slab` in.
pub struct SlabScrubber {
    high_priority: VecDeque<u32>,
    normal: VecDeque<u32>,
    /// Callers blocked on `allocate()` because every slab in the zone was
    /// either full or still scrubbing (spec §8, scenario E2).
    allocation_waiters: WaiterQueue,
    stopped: bool,
}

impl SlabScrubber {
    pub fn new() -> Self {
        Self {
            high_priority: VecDeque::new(),
            normal: VecDeque::new(),
            allocation_waiters: WaiterQueue::new(),
            stopped: false,
        }
    }

    pub fn register(&mut self, slab_number: u32, high_priority: bool) {
        if high_priority {
            self.high_priority.push_back(slab_number);
        } else {
            self.normal.push_back(slab_number);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.high_priority.is_empty() && self.normal.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.high_priority.len() + self.normal.len()
    }

    pub(crate) fn peek_high_priority(&self) -> Option<u32> {
        if self.stopped {
            return None;
        }
        self.high_priority.front().copied()
    }

    pub(crate) fn peek_normal(&self) -> Option<u32> {
        if self.stopped {
            return None;
        }
        self.normal.front().copied()
    }

    /// Escalation path for the allocator's read-only transition: stop
    /// scrubbing and abort every queued allocation waiter (spec §4.7).
    pub fn abort(&mut self) {
        self.stopped = true;
        self.allocation_waiters.notify_all(Err(DepotError::ReadOnly));
    }

    pub fn request_stop(&mut self) {
        self.stopped = true;
    }

    pub fn wait_for_any_slab(&mut self, callback: crate::waiter::WaiterCallback) {
        self.allocation_waiters.enqueue(callback);
    }

    /// Scrub the next registered slab end-to-end: replay its journal over a
    /// freshly-zeroed ref-count array in submission order, install the
    /// result, and transition the slab to `Open`.
    ///
    /// High-priority slabs drain first. Returns `None` once both lists are
    /// empty or a stop was requested; a scrub failure puts the caller's
    /// allocator into read-only mode (handled by `BlockAllocator`, which
    /// owns the notifier) and aborts every queued allocation waiter.
    pub fn scrub_next(&mut self, slab: &mut Slab) -> Option<DepotResult<u32>> {
        if self.stopped {
            return None;
        }
        let slab_number = self.high_priority.pop_front().or_else(|| self.normal.pop_front())?;
        debug_assert_eq!(slab_number, slab.slab_number);

        let result = self.replay_into(slab);
        if result.is_ok() {
            self.allocation_waiters.notify_next(Ok(()));
        } else {
            self.stopped = true;
            self.allocation_waiters.notify_all(Err(DepotError::ReadOnly));
        }
        Some(result.map(|()| slab_number))
    }

    fn replay_into(&self, slab: &mut Slab) -> DepotResult<()> {
        slab.fire(SlabEvent::ScrubBegin)?;

        let entries = slab.journal.replay_entries();
        let mut rebuilt = ReferenceCounts::new(slab.data_blocks, slab.slab_data_origin);
        for entry in &entries {
            if entry.increment {
                // A fresh array has no free/provisional distinction to
                // preserve; drive every increment through `allocate_unreferenced`
                // first so the byte ends up `Count(1)` the same way live
                // traffic would have left it, then apply any further delta.
                if rebuilt.free_count() > 0 {
                    let _ = rebuilt.allocate_unreferenced();
                }
                rebuilt.modify(ReferenceOperation {
                    op_type: entry.op_type,
                    pbn: entry.pbn,
                    increment: true,
                    recovery_lock_id: entry.recovery_lock_id,
                })?;
            } else {
                rebuilt.modify(ReferenceOperation {
                    op_type: entry.op_type,
                    pbn: entry.pbn,
                    increment: false,
                    recovery_lock_id: entry.recovery_lock_id,
                })?;
            }
        }

        slab.ref_counts = rebuilt;
        slab.fire(SlabEvent::ReplayDone)?;
        Ok(())
    }
}

impl Default for SlabScrubber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference_counts::RefCount;
    use crate::slab::SlabState;

    fn loaded_unrecovered_slab() -> Slab {
        let mut slab = Slab::new(0, 0, 0, 0, 4, 8, 4);
        slab.fire(SlabEvent::StartLoad).unwrap();
        slab.fire(SlabEvent::FinishLoad).unwrap();
        slab
    }

    #[test]
    fn replays_journal_and_opens_slab() {
        let mut slab = loaded_unrecovered_slab();
        slab.journal
            .add_entry(crate::reference_counts::JournalDelta {
                pbn: 2,
                increment: true,
                recovery_lock_id: 1,
                op_type: ReferenceOperationType::Data,
            })
            .unwrap();

        let mut scrubber = SlabScrubber::new();
        scrubber.register(0, false);
        let result = scrubber.scrub_next(&mut slab).unwrap();
        assert_eq!(result, Ok(0));
        assert_eq!(slab.state(), SlabState::Open);
        assert_eq!(slab.ref_counts.counter_at(2), RefCount::Count(1));
    }

    #[test]
    fn high_priority_drains_before_normal() {
        let mut a = loaded_unrecovered_slab();
        a.slab_number = 0;
        let mut b = loaded_unrecovered_slab();
        b.slab_number = 1;

        let mut scrubber = SlabScrubber::new();
        scrubber.register(0, false);
        scrubber.register(1, true);

        assert_eq!(scrubber.scrub_next(&mut b).unwrap(), Ok(1));
        assert_eq!(scrubber.scrub_next(&mut a).unwrap(), Ok(0));
    }
}
