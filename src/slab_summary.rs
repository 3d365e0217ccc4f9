//! C5: Slab Summary — compact per-slab hints persisted per zone (spec
//! §4.5).
//!
//! One entry per slab, packed three bytes wide (`tail_block_offset`,
//! `flags`, `fullness_hint`) and laid out per-zone in sectors (spec §6).
//! Updates are opportunistic: `mark_dirty` just flips a bit; the zone
//! decides when to actually write (drain or periodic save).

use alloc::vec;
use alloc::vec::Vec;

pub const ENTRY_SIZE: usize = 3;
pub const SECTOR_SIZE: usize = 512;
pub const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / ENTRY_SIZE;

const FLAG_LOAD_REF_COUNTS: u8 = 0x1;
const FLAG_IS_CLEAN: u8 = 0x2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SummaryEntry {
    pub tail_block_offset: u8,
    pub load_ref_counts: bool,
    pub is_clean: bool,
    pub fullness_hint: u8,
}

impl Default for SummaryEntry {
    fn default() -> Self {
        Self {
            tail_block_offset: 0,
            load_ref_counts: true,
            is_clean: false,
            fullness_hint: 0,
        }
    }
}

impl SummaryEntry {
    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut flags = 0u8;
        if self.load_ref_counts {
            flags |= FLAG_LOAD_REF_COUNTS;
        }
        if self.is_clean {
            flags |= FLAG_IS_CLEAN;
        }
        [self.tail_block_offset, flags, self.fullness_hint.min(127)]
    }

    fn from_bytes(bytes: [u8; ENTRY_SIZE]) -> Self {
        Self {
            tail_block_offset: bytes[0],
            load_ref_counts: bytes[1] & FLAG_LOAD_REF_COUNTS != 0,
            is_clean: bytes[1] & FLAG_IS_CLEAN != 0,
            fullness_hint: bytes[2] & 0x7F,
        }
    }
}

/// One zone's in-memory view over its slice of the summary partition.
pub struct SlabSummaryZone {
    entries: Vec<SummaryEntry>,
    dirty: Vec<bool>,
}

impl SlabSummaryZone {
    pub fn new(slab_count: usize) -> Self {
        Self {
            entries: vec![SummaryEntry::default(); slab_count],
            dirty: vec![false; slab_count],
        }
    }

    /// Extend to `new_slab_count` entries with default (dirty, needs-scrub)
    /// hints (spec §4.8 depot growth).
    pub fn grow(&mut self, new_slab_count: usize) {
        if new_slab_count > self.entries.len() {
            self.entries.resize(new_slab_count, SummaryEntry::default());
            self.dirty.resize(new_slab_count, false);
        }
    }

    pub fn get(&self, slab_number: usize) -> SummaryEntry {
        self.entries[slab_number]
    }

    pub fn update(&mut self, slab_number: usize, entry: SummaryEntry) {
        self.entries[slab_number] = entry;
        self.dirty[slab_number] = true;
    }

    pub fn dirty_slabs(&self) -> impl Iterator<Item = usize> + '_ {
        self.dirty
            .iter()
            .enumerate()
            .filter(|(_, d)| **d)
            .map(|(i, _)| i)
    }

    /// Coalesce and clear the dirty map, returning the bytes to write for
    /// the zone's region of the summary partition. Called on drain/save.
    pub fn take_dirty_bytes(&mut self) -> Vec<(usize, [u8; ENTRY_SIZE])> {
        let out: Vec<_> = self
            .dirty_slabs()
            .map(|i| (i, self.entries[i].to_bytes()))
            .collect();
        for d in self.dirty.iter_mut() {
            *d = false;
        }
        out
    }

    /// Bytes per zone, rounded up to a sector boundary (spec §6).
    pub fn region_size_bytes(slab_count: usize) -> usize {
        let raw = slab_count * ENTRY_SIZE;
        let sectors = (raw + SECTOR_SIZE - 1) / SECTOR_SIZE;
        sectors.max(1) * SECTOR_SIZE
    }

    /// Decode a full per-zone region read at load (spec §4.5: "Reads happen
    /// once at load").
    pub fn from_region_bytes(bytes: &[u8], slab_count: usize) -> Self {
        let mut entries = vec![SummaryEntry::default(); slab_count];
        for (i, entry) in entries.iter_mut().enumerate() {
            let off = i * ENTRY_SIZE;
            if off + ENTRY_SIZE <= bytes.len() {
                *entry = SummaryEntry::from_bytes([
                    bytes[off],
                    bytes[off + 1],
                    bytes[off + 2],
                ]);
            }
        }
        Self {
            dirty: vec![false; slab_count],
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_region_bytes() {
        let mut zone = SlabSummaryZone::new(4);
        zone.update(
            1,
            SummaryEntry {
                tail_block_offset: 7,
                load_ref_counts: false,
                is_clean: true,
                fullness_hint: 42,
            },
        );
        let dirty = zone.take_dirty_bytes();
        assert_eq!(dirty.len(), 1);

        let mut region = vec![0u8; SlabSummaryZone::region_size_bytes(4)];
        for (slab, bytes) in &dirty {
            let off = slab * ENTRY_SIZE;
            region[off..off + ENTRY_SIZE].copy_from_slice(bytes);
        }

        let reloaded = SlabSummaryZone::from_region_bytes(&region, 4);
        let e = reloaded.get(1);
        assert_eq!(e.tail_block_offset, 7);
        assert!(!e.load_ref_counts);
        assert!(e.is_clean);
        assert_eq!(e.fullness_hint, 42);
    }

    #[test]
    fn region_size_rounds_to_sector() {
        assert_eq!(SlabSummaryZone::region_size_bytes(1), SECTOR_SIZE);
        assert_eq!(
            SlabSummaryZone::region_size_bytes(ENTRIES_PER_SECTOR + 1),
            SECTOR_SIZE * 2
        );
    }
}
