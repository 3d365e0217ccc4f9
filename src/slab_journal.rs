//! C3: Slab Journal — bounded ring of tail blocks, write-ahead log of
//! ref-count deltas (spec §4.3).

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{DepotError, DepotResult};
use crate::pbn::Pbn;
use crate::reference_counts::{JournalDelta, ReferenceOperationType};
use crate::waiter::WaiterQueue;

/// One entry in a tail block: `(pbn, delta, recovery_journal_lock_id)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub pbn: Pbn,
    pub increment: bool,
    pub recovery_lock_id: u64,
    pub op_type: ReferenceOperationType,
}

impl From<JournalDelta> for JournalEntry {
    fn from(d: JournalDelta) -> Self {
        Self {
            pbn: d.pbn,
            increment: d.increment,
            recovery_lock_id: d.recovery_lock_id,
            op_type: d.op_type,
        }
    }
}

/// A sealed, not-yet-released tail block. Holds a recovery-journal lock
/// until its entries are both durably written and their ref-count effects
/// flushed via the summary (spec §4.3).
#[derive(Clone, Debug)]
pub struct TailBlock {
    pub sequence_number: u64,
    pub entries: Vec<JournalEntry>,
    pub recovery_lock: u64,
    pub written: bool,
}

impl TailBlock {
    fn seal(sequence_number: u64, entries: Vec<JournalEntry>) -> Self {
        let recovery_lock = entries
            .iter()
            .map(|e| e.recovery_lock_id)
            .min()
            .unwrap_or(0);
        Self {
            sequence_number,
            entries,
            recovery_lock,
            written: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalState {
    Blank,
    Active,
    Full,
    Draining,
    Closed,
}

/// Per-slab write-ahead log. `entries_per_block` and `max_outstanding_tails`
/// describe the on-disk journal region's capacity.
pub struct SlabJournal {
    state: JournalState,
    entries_per_block: usize,
    max_outstanding_tails: usize,
    next_sequence_number: u64,
    current_tail: Vec<JournalEntry>,
    /// Sealed tails still holding a recovery-journal lock, oldest first.
    outstanding: VecDeque<TailBlock>,
    waiters: WaiterQueue,
    /// Highest `min_kept_id` ever accepted by `release_recovery_journal_lock`
    /// (spec §4.3 supplement: recovery-journal lock ids are a monotonic
    /// sequence owned by the recovery journal; a call with an id lower than
    /// this watermark means the id wrapped or the caller went backward).
    released_watermark: Option<u64>,
}

impl SlabJournal {
    pub fn new(entries_per_block: usize, max_outstanding_tails: usize) -> Self {
        Self {
            state: JournalState::Blank,
            entries_per_block,
            max_outstanding_tails,
            next_sequence_number: 1,
            current_tail: Vec::new(),
            outstanding: VecDeque::new(),
            waiters: WaiterQueue::new(),
            released_watermark: None,
        }
    }

    pub fn state(&self) -> JournalState {
        self.state
    }

    pub fn is_blank(&self) -> bool {
        self.state == JournalState::Blank
    }

    /// Append an entry in submission order. Coalesces a same-block
    /// `(pbn, +1)`/`(pbn, -1)` pair that both land in the still-open tail,
    /// since the on-disk format allows dropping cancelling pairs before the
    /// tail seals (spec §4.3); once sealed, entries are immutable.
    ///
    /// Returns `Err(NoSpace)` — treated by callers as "block and wait" — if
    /// the outstanding-tail ring is full; the caller should register on the
    /// returned waiter queue via `wait_for_tail_slot`.
    pub fn add_entry(&mut self, delta: JournalDelta) -> DepotResult<()> {
        if self.state == JournalState::Full || self.state == JournalState::Draining {
            return Err(DepotError::NoSpace);
        }
        if self.state == JournalState::Closed {
            return Err(DepotError::BadState);
        }

        let entry = JournalEntry::from(delta);

        if let Some(pos) = self
            .current_tail
            .iter()
            .position(|e| e.pbn == entry.pbn && e.increment != entry.increment)
        {
            self.current_tail.remove(pos);
        } else {
            self.current_tail.push(entry);
        }

        self.state = JournalState::Active;

        if self.current_tail.len() >= self.entries_per_block {
            self.seal_current_tail();
        }
        Ok(())
    }

    fn seal_current_tail(&mut self) {
        if self.current_tail.is_empty() {
            return;
        }
        let entries = core::mem::take(&mut self.current_tail);
        let seq = self.next_sequence_number;
        self.next_sequence_number += 1;
        self.outstanding.push_back(TailBlock::seal(seq, entries));
        if self.outstanding.len() >= self.max_outstanding_tails {
            self.state = JournalState::Full;
        }
    }

    /// Force-seal and enqueue any partial tail (periodic flush or drain).
    pub fn flush(&mut self) {
        self.seal_current_tail();
    }

    pub fn wait_for_tail_slot(&mut self, callback: crate::waiter::WaiterCallback) {
        self.waiters.enqueue(callback);
    }

    pub fn mark_tail_written(&mut self, sequence_number: u64) {
        if let Some(block) = self
            .outstanding
            .iter_mut()
            .find(|b| b.sequence_number == sequence_number)
        {
            block.written = true;
        }
    }

    /// Pop tails whose `recovery_lock < min_kept_id`; stop at the first tail
    /// whose lock is `>= min_kept_id` (spec §4.3). Idempotent: calling this
    /// twice with the same `min_kept_id` releases nothing the second time.
    ///
    /// Rejects a `min_kept_id` lower than the highest one this journal has
    /// already released: recovery-journal lock ids only move forward, so a
    /// lower id here means the id wrapped or the caller regressed, either of
    /// which would otherwise silently under-release (or over-release) tails.
    pub fn release_recovery_journal_lock(&mut self, min_kept_id: u64) -> DepotResult<()> {
        if let Some(watermark) = self.released_watermark {
            if min_kept_id < watermark {
                return Err(DepotError::LockError);
            }
        }
        self.released_watermark = Some(min_kept_id);

        while let Some(front) = self.outstanding.front() {
            if front.recovery_lock >= min_kept_id {
                break;
            }
            self.outstanding.pop_front();
            if self.state == JournalState::Full
                && self.outstanding.len() < self.max_outstanding_tails
            {
                self.state = JournalState::Active;
                self.waiters.notify_next(Ok(()));
            }
        }
        Ok(())
    }

    pub fn oldest_recovery_lock(&self) -> Option<u64> {
        self.outstanding.front().map(|b| b.recovery_lock)
    }

    pub fn outstanding_tail_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Drain: seal the partial tail and move to `Draining`. A later
    /// `resume` (or successful commit of every outstanding tail) is
    /// required to return to `Active`.
    pub fn begin_drain(&mut self) {
        self.flush();
        self.state = JournalState::Draining;
    }

    pub fn finish_drain(&mut self) -> DepotResult<()> {
        if !self.outstanding.is_empty() {
            return Err(DepotError::BadState);
        }
        self.state = JournalState::Closed;
        Ok(())
    }

    pub fn resume(&mut self) {
        if self.state == JournalState::Draining || self.state == JournalState::Closed {
            self.state = if self.outstanding.len() >= self.max_outstanding_tails {
                JournalState::Full
            } else {
                JournalState::Active
            };
        }
    }

    /// Abort every waiter with `ReadOnly` (spec §4.7, "Read-only
    /// transition").
    pub fn abort_waiters(&mut self) {
        self.waiters.notify_all(Err(DepotError::ReadOnly));
    }

    /// Replay every entry across all outstanding and current-tail blocks,
    /// in submission order, for the scrubber (spec §4.6).
    pub fn replay_entries(&self) -> Vec<JournalEntry> {
        let mut all = Vec::new();
        for block in &self.outstanding {
            all.extend_from_slice(&block.entries);
        }
        all.extend_from_slice(&self.current_tail);
        all
    }
}
