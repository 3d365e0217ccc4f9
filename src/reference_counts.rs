//! C2: Reference Counts — per-slab dense counter array with a search cursor
//! (spec §4.2).

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{DepotError, DepotResult};
use crate::pbn::Pbn;

/// Counters saturate at this value; further increments are no-ops.
pub const MAXIMUM_REFERENCE_COUNT: u8 = 254;

/// A single counter's logical state (spec §9, "provisional reference
/// sentinel" — kept as a real enum rather than an out-of-range magic byte,
/// since nothing here needs to match an on-disk byte layout bit-for-bit
/// except at encode/decode time).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefCount {
    Free,
    Provisional,
    Count(u8),
}

impl RefCount {
    fn to_wire(self) -> u8 {
        match self {
            RefCount::Free => 0,
            RefCount::Count(n) => n,
            RefCount::Provisional => 0xFF,
        }
    }

    fn from_wire(byte: u8) -> Self {
        match byte {
            0 => RefCount::Free,
            0xFF => RefCount::Provisional,
            n => RefCount::Count(n),
        }
    }
}

/// The kind of modification requested of a counter (spec §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceOperationType {
    Data,
    BlockMap,
}

#[derive(Clone, Copy, Debug)]
pub struct ReferenceOperation {
    pub op_type: ReferenceOperationType,
    pub pbn: Pbn,
    pub increment: bool,
    pub recovery_lock_id: u64,
}

/// Per-slab entry returned to the journal so it can append the matching
/// `(pbn, delta, lock_id)` tuple (spec §3, "Slab Journal").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalDelta {
    pub pbn: Pbn,
    pub increment: bool,
    pub recovery_lock_id: u64,
    pub op_type: ReferenceOperationType,
}

/// Dense reference-count array for one slab's data-block region.
pub struct ReferenceCounts {
    counters: Vec<RefCount>,
    slab_data_origin: Pbn,
    /// Number of `Free` counters. `Provisional` counters do not count as
    /// free (they reserve the block) but do not count as durably allocated
    /// either (invariant 2 in spec §3).
    free_count: usize,
    /// Monotonically advancing search cursor (spec §3); wraps once per
    /// `allocate_unreferenced` call.
    search_cursor: usize,
    unreferenced_provisional: usize,
}

impl ReferenceCounts {
    pub fn new(block_count: usize, slab_data_origin: Pbn) -> Self {
        Self {
            counters: vec![RefCount::Free; block_count],
            slab_data_origin,
            free_count: block_count,
            search_cursor: 0,
            unreferenced_provisional: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    fn index_of(&self, pbn: Pbn) -> DepotResult<usize> {
        let offset = pbn
            .checked_sub(self.slab_data_origin)
            .ok_or(DepotError::OutOfRange)?;
        if offset as usize >= self.counters.len() {
            return Err(DepotError::OutOfRange);
        }
        Ok(offset as usize)
    }

    /// Scan starting at the cursor, wrapping once, for the first `Free`
    /// counter. Sets it `Provisional`, advances the cursor past it, and
    /// returns its PBN. `NoSpace` if none is found; leaves state untouched
    /// on failure (spec §8, property 9).
    pub fn allocate_unreferenced(&mut self) -> DepotResult<Pbn> {
        let len = self.counters.len();
        if len == 0 {
            return Err(DepotError::NoSpace);
        }
        for steps in 0..len {
            let idx = (self.search_cursor + steps) % len;
            if self.counters[idx] == RefCount::Free {
                self.counters[idx] = RefCount::Provisional;
                self.free_count -= 1;
                self.unreferenced_provisional += 1;
                self.search_cursor = (idx + 1) % len;
                return Ok(self.slab_data_origin + idx as Pbn);
            }
        }
        Err(DepotError::NoSpace)
    }

    pub fn unreferenced_provisional_count(&self) -> usize {
        self.unreferenced_provisional
    }

    /// Apply a modification, returning the journal delta to append (if any)
    /// and whether the slab's free-block count changed.
    ///
    /// Mirrors spec §4.2's `modify` contract. `DATA_DECREMENT`/`BLOCK_MAP_DECREMENT`
    /// of an already-zero counter is a fatal inconsistency (`InvalidState`);
    /// callers must escalate the owning allocator to read-only mode on that
    /// error (spec §7).
    pub fn modify(&mut self, op: ReferenceOperation) -> DepotResult<FreeCountDelta> {
        let idx = self.index_of(op.pbn)?;
        let current = self.counters[idx];

        if op.increment {
            self.increment(idx, current, op)
        } else {
            self.decrement(idx, current, op)
        }
    }

    fn increment(
        &mut self,
        idx: usize,
        current: RefCount,
        op: ReferenceOperation,
    ) -> DepotResult<FreeCountDelta> {
        let (next, became_durable) = match current {
            RefCount::Free => (RefCount::Count(1), false),
            RefCount::Provisional => {
                self.unreferenced_provisional -= 1;
                (RefCount::Count(1), true)
            }
            RefCount::Count(n) if n >= MAXIMUM_REFERENCE_COUNT => {
                (RefCount::Count(MAXIMUM_REFERENCE_COUNT), false)
            }
            RefCount::Count(n) => (RefCount::Count(n + 1), false),
        };
        self.counters[idx] = next;
        let _ = became_durable;

        Ok(FreeCountDelta {
            journal_entry: Some(JournalDelta {
                pbn: op.pbn,
                increment: true,
                recovery_lock_id: op.recovery_lock_id,
                op_type: op.op_type,
            }),
            free_count_increased: false,
        })
    }

    fn decrement(
        &mut self,
        idx: usize,
        current: RefCount,
        op: ReferenceOperation,
    ) -> DepotResult<FreeCountDelta> {
        let was_provisional = current == RefCount::Provisional;
        let next = match current {
            RefCount::Free => return Err(DepotError::InvalidState),
            RefCount::Provisional => {
                self.unreferenced_provisional -= 1;
                RefCount::Free
            }
            RefCount::Count(1) => RefCount::Free,
            RefCount::Count(n) => RefCount::Count(n - 1),
        };
        let freed = next == RefCount::Free && !was_provisional;
        if next == RefCount::Free {
            self.free_count += 1;
        }
        self.counters[idx] = next;

        // Vacating a never-confirmed provisional claim was never journaled
        // as a `+1` (`allocate_unreferenced` doesn't append an entry), so
        // undoing it must not journal a `-1` either — a lone decrement would
        // hit the `Free` arm above on scrub replay and wedge the zone
        // read-only. Mirrors the original's `NULL` journal point on this
        // path.
        let journal_entry = if was_provisional {
            None
        } else {
            Some(JournalDelta {
                pbn: op.pbn,
                increment: false,
                recovery_lock_id: op.recovery_lock_id,
                op_type: op.op_type,
            })
        };

        Ok(FreeCountDelta {
            journal_entry,
            free_count_increased: freed,
        })
    }

    /// Serialize the counter array to on-disk bytes, one byte per counter.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.counters.iter().map(|c| c.to_wire()).collect()
    }

    /// Rebuild a counter array from on-disk bytes (used by depot decode and
    /// by scrub replay verification).
    pub fn from_bytes(bytes: &[u8], slab_data_origin: Pbn) -> Self {
        let counters: Vec<RefCount> = bytes.iter().map(|&b| RefCount::from_wire(b)).collect();
        let free_count = counters.iter().filter(|c| **c == RefCount::Free).count();
        let unreferenced_provisional = counters
            .iter()
            .filter(|c| **c == RefCount::Provisional)
            .count();
        Self {
            counters,
            slab_data_origin,
            free_count,
            search_cursor: 0,
            unreferenced_provisional,
        }
    }

    #[cfg(test)]
    pub(crate) fn counter_at(&self, pbn: Pbn) -> RefCount {
        self.counters[self.index_of(pbn).unwrap()]
    }
}

/// Result of a single `modify` call: whether the slab's free-block count
/// went up (used by `Slab::adjust_free_block_count`, spec §4.4) and the
/// journal entry (if any) the caller must append.
#[derive(Debug)]
pub struct FreeCountDelta {
    pub journal_entry: Option<JournalDelta>,
    pub free_count_increased: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(pbn: Pbn, increment: bool) -> ReferenceOperation {
        ReferenceOperation {
            op_type: ReferenceOperationType::Data,
            pbn,
            increment,
            recovery_lock_id: 1,
        }
    }

    #[test]
    fn allocate_unreferenced_scans_and_wraps() {
        let mut rc = ReferenceCounts::new(4, 100);
        assert_eq!(rc.allocate_unreferenced().unwrap(), 100);
        assert_eq!(rc.allocate_unreferenced().unwrap(), 101);
        assert_eq!(rc.free_count(), 2);
        assert_eq!(rc.counter_at(100), RefCount::Provisional);
    }

    #[test]
    fn full_slab_returns_no_space_without_mutation() {
        let mut rc = ReferenceCounts::new(1, 0);
        rc.allocate_unreferenced().unwrap();
        assert_eq!(rc.free_count(), 0);
        assert_eq!(rc.allocate_unreferenced(), Err(DepotError::NoSpace));
        assert_eq!(rc.free_count(), 0);
    }

    #[test]
    fn decrement_zero_is_invalid_state() {
        let mut rc = ReferenceCounts::new(4, 0);
        assert_eq!(rc.modify(op(0, false)).unwrap_err(), DepotError::InvalidState);
    }

    #[test]
    fn increment_saturates_at_max() {
        let mut rc = ReferenceCounts::new(1, 0);
        rc.allocate_unreferenced().unwrap();
        rc.modify(op(0, true)).unwrap(); // provisional -> 1
        for _ in 0..300 {
            rc.modify(op(0, true)).unwrap();
        }
        assert_eq!(rc.counter_at(0), RefCount::Count(MAXIMUM_REFERENCE_COUNT));
    }

    #[test]
    fn provisional_vacate_restores_free_count() {
        let mut rc = ReferenceCounts::new(4, 0);
        let before = rc.free_count();
        rc.allocate_unreferenced().unwrap();
        rc.modify(op(0, false)).unwrap(); // vacate the provisional claim
        assert_eq!(rc.free_count(), before);
    }

    #[test]
    fn decrement_to_zero_increases_free_count() {
        let mut rc = ReferenceCounts::new(2, 0);
        rc.allocate_unreferenced().unwrap();
        rc.modify(op(0, true)).unwrap(); // durable at 1
        let delta = rc.modify(op(0, false)).unwrap();
        assert!(delta.free_count_increased);
        assert_eq!(rc.counter_at(0), RefCount::Free);
    }
}
