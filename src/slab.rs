//! C4: Slab — binds ref-counts, journal, and admin state for one slab
//! (spec §4.4).

use crate::error::{DepotError, DepotResult};
use crate::pbn::Pbn;
use crate::reference_counts::{ReferenceCounts, ReferenceOperation};
use crate::slab_journal::SlabJournal;

/// Admin-state machine for a single slab (spec §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabState {
    New,
    Loading,
    Unrecovered,
    Replaying,
    Open,
    Quiescent,
    Resuming,
    DirtyClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabEvent {
    StartLoad,
    FinishLoad,
    ScrubBegin,
    ReplayDone,
    Open,
    Close,
    Drain,
    Resume,
}

fn transition(state: SlabState, event: SlabEvent) -> DepotResult<SlabState> {
    use SlabEvent as E;
    use SlabState as S;
    match (state, event) {
        (S::New, E::StartLoad) => Ok(S::Loading),
        (S::Loading, E::FinishLoad) => Ok(S::Unrecovered),
        (S::Loading, E::Open) => Ok(S::Open),
        (S::Unrecovered, E::ScrubBegin) => Ok(S::Replaying),
        (S::Replaying, E::ReplayDone) => Ok(S::Open),
        (S::Open, E::Close) => Ok(S::Quiescent),
        (S::Quiescent, E::Resume) => Ok(S::Resuming),
        (S::Resuming, E::Open) => Ok(S::Open),
        (S::Resuming, E::FinishLoad) => Ok(S::Unrecovered),
        _ => Err(DepotError::BadState),
    }
}

/// A contiguous range of `slab_size` PBNs: data-block region, ref-counts,
/// and a slab journal (spec §3).
pub struct Slab {
    pub slab_number: u32,
    pub zone_number: u32,
    pub slab_origin: Pbn,
    pub slab_data_origin: Pbn,
    pub data_blocks: usize,

    state: SlabState,
    pub ref_counts: ReferenceCounts,
    pub journal: SlabJournal,

    /// Current priority-table bucket (0 means full); recomputed by the
    /// owning allocator after every free-count change (spec §4.7).
    pub priority: u32,
    pub on_priority_table: bool,
    pub is_open_slab: bool,
    /// True once the journal holds an uncommitted recovery-journal lock
    /// that has not yet been released (spec §3, "dirty" membership flag).
    pub dirty: bool,
}

impl Slab {
    pub fn new(
        slab_number: u32,
        zone_number: u32,
        slab_origin: Pbn,
        slab_data_origin: Pbn,
        data_blocks: usize,
        entries_per_journal_block: usize,
        max_outstanding_tails: usize,
    ) -> Self {
        Self {
            slab_number,
            zone_number,
            slab_origin,
            slab_data_origin,
            data_blocks,
            state: SlabState::New,
            ref_counts: ReferenceCounts::new(data_blocks, slab_data_origin),
            journal: SlabJournal::new(entries_per_journal_block, max_outstanding_tails),
            priority: 0,
            on_priority_table: false,
            is_open_slab: false,
            dirty: false,
        }
    }

    pub fn state(&self) -> SlabState {
        self.state
    }

    pub fn fire(&mut self, event: SlabEvent) -> DepotResult<()> {
        self.state = transition(self.state, event)?;
        Ok(())
    }

    pub fn contains(&self, pbn: Pbn) -> bool {
        pbn >= self.slab_origin && pbn < self.slab_origin + self.slab_size() as Pbn
    }

    fn slab_size(&self) -> usize {
        (self.slab_data_origin - self.slab_origin) as usize + self.data_blocks
    }

    pub fn free_blocks(&self) -> usize {
        self.ref_counts.free_count()
    }

    /// Apply a ref-count modification and keep the slab's journal and
    /// dirty flag consistent. Does not re-prioritize in the allocator's
    /// table — the allocator does that via `adjust_free_block_count` after
    /// comparing the old and new priority (spec §4.4).
    pub fn modify_reference(&mut self, op: ReferenceOperation) -> DepotResult<bool> {
        let delta = self.ref_counts.modify(op)?;
        if let Some(entry) = delta.journal_entry {
            self.journal.add_entry(entry)?;
            self.dirty = true;
        }
        Ok(delta.free_count_increased)
    }

    pub fn allocate_unreferenced(&mut self) -> DepotResult<Pbn> {
        if self.state != SlabState::Open {
            return Err(DepotError::InvalidState);
        }
        self.ref_counts.allocate_unreferenced()
    }

    /// Drain the slab's journal and retire it from `Open`. Lands on
    /// `DirtyClosed` instead of `Quiescent` if the journal is still holding
    /// an unreleased recovery-journal lock, so the next load knows to
    /// re-scrub it (spec §3, "dirty" membership flag).
    pub fn drain(&mut self) -> DepotResult<()> {
        if self.state != SlabState::Open {
            return Err(DepotError::BadState);
        }
        self.journal.begin_drain();
        self.state = if self.dirty {
            SlabState::DirtyClosed
        } else {
            SlabState::Quiescent
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_slab() -> Slab {
        Slab::new(0, 0, 0, 0, 16, 4, 4)
    }

    #[test]
    fn load_to_open_via_unrecovered() {
        let mut s = new_slab();
        s.fire(SlabEvent::StartLoad).unwrap();
        s.fire(SlabEvent::FinishLoad).unwrap();
        assert_eq!(s.state(), SlabState::Unrecovered);
        s.fire(SlabEvent::ScrubBegin).unwrap();
        s.fire(SlabEvent::ReplayDone).unwrap();
        assert_eq!(s.state(), SlabState::Open);
    }

    #[test]
    fn illegal_transition_is_bad_state() {
        let mut s = new_slab();
        assert_eq!(s.fire(SlabEvent::Open), Err(DepotError::BadState));
    }

    #[test]
    fn contains_checks_full_slab_range() {
        let s = Slab::new(1, 0, 100, 104, 20, 4, 4);
        assert!(s.contains(100));
        assert!(s.contains(123));
        assert!(!s.contains(124));
        assert!(!s.contains(99));
    }
}
