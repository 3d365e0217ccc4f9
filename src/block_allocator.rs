//! C7: Block Allocator — per-zone allocation policy and lifecycle driver
//! (spec §4.7).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{DepotError, DepotResult};
use crate::pbn::{is_zero_block, Pbn};
use crate::priority_table::PriorityTable;
use crate::read_only::ReadOnlyNotifier;
use crate::reference_counts::{ReferenceOperation, ReferenceOperationType};
use crate::scrubber::SlabScrubber;
use crate::slab::{Slab, SlabEvent, SlabState};
use crate::slab_summary::SlabSummaryZone;

/// Per-zone running counters (spec §2 "SPEC_FULL" ambient stats).
#[derive(Default, Clone, Copy, Debug)]
pub struct BlockAllocatorStatistics {
    pub slabs_opened: u64,
    pub slabs_reopened: u64,
    pub allocations: u64,
    pub allocations_blocked_on_scrub: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainStep {
    Scrubber,
    Slabs,
    Summary,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocatorAdminState {
    Normal,
    Draining(DrainStep),
    Resuming(DrainStep),
}

/// The free-space priority policy (spec §4.7): slabs with more free blocks
/// and a non-blank journal outrank pristine (never-opened) slabs, and full
/// slabs alone occupy bucket 0. `unopened_priority` is "stepped over" so a
/// real `floor(log2(F))` magnitude never collides with it.
pub fn slab_priority(free_blocks: usize, journal_is_blank: bool, unopened_priority: u32) -> u32 {
    if free_blocks == 0 {
        return 0;
    }
    if journal_is_blank {
        return unopened_priority;
    }
    let p = 1 + (usize::BITS - 1 - free_blocks.leading_zeros());
    if p < unopened_priority {
        p
    } else {
        p + 1
    }
}

pub fn unopened_slab_priority_for(data_blocks: usize) -> u32 {
    let reference = (data_blocks * 3) / 4;
    if reference == 0 {
        1
    } else {
        1 + (usize::BITS - 1 - reference.leading_zeros())
    }
}

pub struct BlockAllocator {
    pub zone_number: u32,
    pub thread_id: u32,
    priority_table: PriorityTable,
    open_slab: Option<u32>,
    pub scrubber: SlabScrubber,
    pub summary: SlabSummaryZone,
    unopened_slab_priority: u32,
    /// Count of non-provisional, non-zero counters across this zone's
    /// slabs. Relaxed loads from any thread (spec §5); only this
    /// allocator's own thread stores to it.
    allocated_blocks: AtomicU64,
    data_blocks_total: u64,
    admin_state: AllocatorAdminState,
    read_only: Arc<ReadOnlyNotifier>,
    pub stats: BlockAllocatorStatistics,
}

impl BlockAllocator {
    pub fn new(
        zone_number: u32,
        thread_id: u32,
        slab_capacity: usize,
        data_blocks_per_slab: usize,
        read_only: Arc<ReadOnlyNotifier>,
    ) -> Self {
        let unopened_slab_priority = unopened_slab_priority_for(data_blocks_per_slab);
        let max_priority = unopened_slab_priority as usize + 2;
        Self {
            zone_number,
            thread_id,
            priority_table: PriorityTable::new(max_priority, slab_capacity),
            open_slab: None,
            scrubber: SlabScrubber::new(),
            summary: SlabSummaryZone::new(slab_capacity),
            unopened_slab_priority,
            allocated_blocks: AtomicU64::new(0),
            data_blocks_total: 0,
            admin_state: AllocatorAdminState::Normal,
            read_only,
            stats: BlockAllocatorStatistics::default(),
        }
    }

    pub fn allocated_blocks(&self) -> u64 {
        self.allocated_blocks.load(Ordering::Relaxed)
    }

    pub fn data_blocks(&self) -> u64 {
        self.data_blocks_total
    }

    fn check_not_read_only(&self) -> DepotResult<()> {
        if self.read_only.is_read_only() {
            return Err(DepotError::ReadOnly);
        }
        Ok(())
    }

    fn enter_read_only(&mut self, slabs: &mut [Slab]) {
        self.read_only.enter();
        for slab in slabs.iter_mut() {
            if slab.zone_number == self.zone_number {
                slab.journal.abort_waiters();
            }
        }
        self.scrubber.abort();
    }

    /// `slabs` is the depot's full dense slab array; this allocator only
    /// touches entries whose `zone_number` matches its own (spec §3,
    /// invariant 4: every data-block PBN is owned by exactly one zone).
    pub fn allocate(&mut self, slabs: &mut [Slab]) -> DepotResult<Pbn> {
        self.check_not_read_only()?;

        if let Some(open) = self.open_slab {
            match slabs[open as usize].allocate_unreferenced() {
                Ok(pbn) => {
                    self.stats.allocations += 1;
                    self.allocated_blocks.fetch_add(1, Ordering::Relaxed);
                    return Ok(pbn);
                }
                Err(DepotError::NoSpace) => {
                    self.retire_open_slab(slabs, open);
                }
                Err(e) => return Err(e),
            }
        }

        self.open_next_slab(slabs)?;

        match self.open_slab {
            Some(open) => {
                let pbn = slabs[open as usize].allocate_unreferenced()?;
                self.stats.allocations += 1;
                self.allocated_blocks.fetch_add(1, Ordering::Relaxed);
                Ok(pbn)
            }
            None => {
                self.stats.allocations_blocked_on_scrub += 1;
                Err(DepotError::NoSpace)
            }
        }
    }

    fn retire_open_slab(&mut self, slabs: &mut [Slab], slab_number: u32) {
        slabs[slab_number as usize].is_open_slab = false;
        self.open_slab = None;
        self.queue_slab(slabs, slab_number);
    }

    fn open_next_slab(&mut self, slabs: &mut [Slab]) -> DepotResult<()> {
        let Some(next) = self.priority_table.dequeue_max() else {
            return Ok(());
        };
        let slab = &mut slabs[next as usize];
        slab.on_priority_table = false;
        if slab.state() != SlabState::Open {
            slab.fire(SlabEvent::Open)?;
            self.stats.slabs_reopened += 1;
        } else {
            self.stats.slabs_opened += 1;
        }
        slab.is_open_slab = true;
        self.open_slab = Some(next);
        Ok(())
    }

    /// `vdo_queue_slab` (spec §4.4): register with the scrubber if
    /// unrecovered, otherwise prioritize into this zone's table.
    pub fn queue_slab(&mut self, slabs: &mut [Slab], slab_number: u32) {
        let slab = &mut slabs[slab_number as usize];
        if slab.state() == SlabState::Unrecovered {
            let high_priority = slab_is_clean_hint(&self.summary, slab_number as usize);
            self.scrubber.register(slab_number, high_priority);
            return;
        }
        if slab.is_open_slab {
            return;
        }
        // Every non-open, non-unrecovered slab is kept in the priority
        // table, including exhausted ones: `slab_priority` maps
        // `free_blocks() == 0` to bucket 0, and `allocate()`'s single-retry
        // structure bounds the cost of dequeuing a full slab to one extra
        // lookup per call (spec §4.4, invariant 3 — a slab is on exactly one
        // of open/priority-table/scrubber/admin-transition).
        let priority = slab_priority(
            slab.free_blocks(),
            slab.journal.is_blank(),
            self.unopened_slab_priority,
        );
        slab.priority = priority;
        slab.on_priority_table = true;
        self.priority_table.enqueue(priority, slab_number);
    }

    /// Re-prioritize `slab` after a free-block-count change, unless it is
    /// the currently open slab (spec §4.4). `allocated_blocks` only moves
    /// here on an actual free: `allocate()` already counted the block when
    /// it left the free pool, so a provisional-to-durable confirm (`freed ==
    /// false`) must not double-count it.
    pub fn adjust_free_block_count(&mut self, slabs: &mut [Slab], slab_number: u32, freed: bool) {
        if freed {
            self.allocated_blocks.fetch_sub(1, Ordering::Relaxed);
        }

        let slab = &slabs[slab_number as usize];
        if slab.is_open_slab {
            return;
        }
        let new_priority = slab_priority(
            slab.free_blocks(),
            slab.journal.is_blank(),
            self.unopened_slab_priority,
        );
        if slab.on_priority_table && new_priority != slab.priority {
            self.queue_slab(slabs, slab_number);
        }
    }

    /// Issue a `DATA_DECREMENT` on the slab containing `pbn`. No-op on the
    /// zero block (spec §4.7).
    pub fn release_reference(
        &mut self,
        slabs: &mut [Slab],
        pbn: Pbn,
        lock_id: u64,
    ) -> DepotResult<()> {
        if is_zero_block(pbn) {
            return Ok(());
        }
        self.check_not_read_only()?;

        let slab_number = slabs
            .iter()
            .find(|s| s.zone_number == self.zone_number && s.contains(pbn))
            .map(|s| s.slab_number)
            .ok_or(DepotError::OutOfRange)?;

        let result = slabs[slab_number as usize].modify_reference(ReferenceOperation {
            op_type: ReferenceOperationType::Data,
            pbn,
            increment: false,
            recovery_lock_id: lock_id,
        });

        match result {
            Ok(freed) => {
                self.adjust_free_block_count(slabs, slab_number, freed);
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    self.enter_read_only(slabs);
                }
                Err(e)
            }
        }
    }

    /// Confirm a provisional allocation (journaled `DATA_INCREMENT`).
    pub fn confirm_reference(
        &mut self,
        slabs: &mut [Slab],
        pbn: Pbn,
        lock_id: u64,
    ) -> DepotResult<()> {
        if is_zero_block(pbn) {
            return Ok(());
        }
        self.check_not_read_only()?;
        let slab_number = slabs
            .iter()
            .find(|s| s.zone_number == self.zone_number && s.contains(pbn))
            .map(|s| s.slab_number)
            .ok_or(DepotError::OutOfRange)?;

        let result = slabs[slab_number as usize].modify_reference(ReferenceOperation {
            op_type: ReferenceOperationType::Data,
            pbn,
            increment: true,
            recovery_lock_id: lock_id,
        });
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_fatal() {
                    self.enter_read_only(slabs);
                }
                Err(e)
            }
        }
    }

    /// Drive the scrubber for every slab registered by load (spec §4.7,
    /// load-time ordering), then open any slab the scrub frees up.
    pub fn scrub_all(&mut self, slabs: &mut [Slab]) -> DepotResult<()> {
        loop {
            let Some(slab_number) = self.scrubber.next_candidate() else {
                break;
            };
            let slab = &mut slabs[slab_number as usize];
            match self.scrubber.scrub_next(slab) {
                Some(Ok(n)) => self.queue_slab(slabs, n),
                Some(Err(e)) => {
                    self.enter_read_only(slabs);
                    return Err(e);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Drain steps advance `Scrubber -> Slabs -> Summary -> Finished`
    /// (spec §4.7). Each call advances exactly one step.
    pub fn drain_step(&mut self, slabs: &mut [Slab]) -> DepotResult<DrainStep> {
        let current = match self.admin_state {
            AllocatorAdminState::Draining(s) => s,
            _ => DrainStep::Scrubber,
        };
        let next = match current {
            DrainStep::Scrubber => {
                self.scrubber.request_stop();
                DrainStep::Slabs
            }
            DrainStep::Slabs => {
                for slab in slabs
                    .iter_mut()
                    .filter(|s| s.zone_number == self.zone_number && s.state() == SlabState::Open)
                {
                    slab.drain()?;
                }
                DrainStep::Summary
            }
            DrainStep::Summary => {
                let _ = self.summary.take_dirty_bytes();
                DrainStep::Finished
            }
            DrainStep::Finished => DrainStep::Finished,
        };
        self.admin_state = AllocatorAdminState::Draining(next);
        Ok(next)
    }

    /// Resume reverses the drain steps (spec §4.7).
    pub fn resume_step(&mut self, slabs: &mut [Slab]) -> DepotResult<DrainStep> {
        let current = match self.admin_state {
            AllocatorAdminState::Resuming(s) => s,
            AllocatorAdminState::Draining(s) => s,
            AllocatorAdminState::Normal => DrainStep::Finished,
        };
        let next = match current {
            DrainStep::Finished => DrainStep::Summary,
            DrainStep::Summary => DrainStep::Slabs,
            DrainStep::Slabs => {
                for slab in slabs
                    .iter_mut()
                    .filter(|s| s.zone_number == self.zone_number)
                {
                    if slab.state() == SlabState::Quiescent {
                        slab.fire(SlabEvent::Resume)?;
                        slab.fire(SlabEvent::Open)?;
                    }
                }
                DrainStep::Scrubber
            }
            DrainStep::Scrubber => {
                self.admin_state = AllocatorAdminState::Normal;
                return Ok(DrainStep::Scrubber);
            }
        };
        self.admin_state = AllocatorAdminState::Resuming(next);
        Ok(next)
    }

    /// `release_tail_block_locks` (spec §4.8): release every slab journal
    /// tail whose recovery lock predates `recovery_block_number`. Keeps
    /// releasing the rest of the slabs even after one rejects the id, but
    /// reports the first error to the caller.
    pub fn release_tail_block_locks(
        &mut self,
        slabs: &mut [Slab],
        recovery_block_number: u64,
    ) -> DepotResult<()> {
        let mut first_error = None;
        for slab in slabs
            .iter_mut()
            .filter(|s| s.zone_number == self.zone_number)
        {
            match slab
                .journal
                .release_recovery_journal_lock(recovery_block_number)
            {
                Ok(()) => {
                    if slab.journal.oldest_recovery_lock().is_none() {
                        slab.dirty = false;
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn set_data_blocks_total(&mut self, total: u64) {
        self.data_blocks_total = total;
    }

    /// Extend the priority table and summary to cover newly-grown slab
    /// numbers (spec §4.8 depot growth).
    pub fn grow_tables(&mut self, new_capacity: usize) {
        self.priority_table.grow(new_capacity);
        self.summary.grow(new_capacity);
    }
}

fn slab_is_clean_hint(summary: &SlabSummaryZone, slab_number: usize) -> bool {
    let entry = summary.get(slab_number);
    entry.is_clean || !entry.load_ref_counts
}

impl SlabScrubber {
    /// Peek the next candidate without popping, so `scrub_all` can pass the
    /// matching `&mut Slab` in. High-priority first, as in `scrub_next`.
    pub fn next_candidate(&self) -> Option<u32> {
        self.peek_high_priority().or_else(|| self.peek_normal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn zone_slabs(count: u32, data_blocks: usize) -> Vec<Slab> {
        (0..count)
            .map(|n| {
                let origin = n as u64 * data_blocks as u64;
                let mut s = Slab::new(n, 0, origin, origin, data_blocks, 8, 4);
                s.fire(SlabEvent::StartLoad).unwrap();
                s.fire(SlabEvent::FinishLoad).unwrap();
                s.fire(SlabEvent::ScrubBegin).unwrap();
                s.fire(SlabEvent::ReplayDone).unwrap();
                s
            })
            .collect()
    }

    #[test]
    fn allocate_exhausts_open_slab_then_switches() {
        let mut slabs = zone_slabs(2, 2);
        let mut alloc = BlockAllocator::new(0, 0, 2, 2, ReadOnlyNotifier::new());
        alloc.queue_slab(&mut slabs, 0);
        alloc.queue_slab(&mut slabs, 1);

        let mut seen = alloc::vec::Vec::new();
        for _ in 0..4 {
            seen.push(alloc.allocate(&mut slabs).unwrap());
        }
        seen.sort();
        assert_eq!(seen, alloc::vec![0, 1, 2, 3]);
        assert_eq!(alloc.allocate(&mut slabs), Err(DepotError::NoSpace));
    }

    #[test]
    fn priority_policy_matches_spec_formula() {
        let unopened = unopened_slab_priority_for(1024); // 1 + floor(log2(768)) = 10
        assert_eq!(unopened, 10);
        assert_eq!(slab_priority(0, false, unopened), 0);
        assert_eq!(slab_priority(1024, true, unopened), unopened);
        // floor(log2(512)) = 9 -> p = 10, collides with unopened -> bumped to 11
        assert_eq!(slab_priority(512, false, unopened), 11);
        // floor(log2(256)) = 8 -> p = 9 < unopened(10), no bump
        assert_eq!(slab_priority(256, false, unopened), 9);
    }

    #[test]
    fn release_reference_ignores_zero_pbn() {
        let mut slabs = zone_slabs(1, 4);
        let mut alloc = BlockAllocator::new(0, 0, 1, 4, ReadOnlyNotifier::new());
        assert_eq!(alloc.release_reference(&mut slabs, 0, 1), Ok(()));
    }
}
