//! C8: Slab Depot — owns every slab and allocator, routes PBNs to zones,
//! orchestrates zone-fanned admin actions (spec §4.8).

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::block_allocator::{BlockAllocator, DrainStep};
use crate::error::{DepotError, DepotResult};
use crate::pbn::{is_zero_block, Pbn};
use crate::read_only::ReadOnlyNotifier;
use crate::slab::{Slab, SlabEvent, SlabState};
use crate::slab_summary::SummaryEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadType {
    Normal,
    Recovery,
    Rebuild,
}

#[derive(Clone, Copy, Debug)]
pub struct DepotConfig {
    pub origin: Pbn,
    pub slab_size_shift: u32,
    pub slab_count: u32,
    pub zone_count: u32,
    pub data_blocks_per_slab: usize,
    pub entries_per_journal_block: usize,
    pub max_outstanding_tails: usize,
    pub load_type: LoadType,
}

pub struct SlabDepot {
    config: DepotConfig,
    slabs: Vec<Slab>,
    allocators: Vec<BlockAllocator>,
    read_only: Arc<ReadOnlyNotifier>,
    new_slabs: Vec<Slab>,
}

fn slab_size(cfg: &DepotConfig) -> u64 {
    1u64 << cfg.slab_size_shift
}

fn build_slab(cfg: &DepotConfig, slab_number: u32) -> Slab {
    let size = slab_size(cfg);
    let origin = cfg.origin + slab_number as u64 * size;
    let data_origin = origin; // ref-count/journal regions are tracked logically, not carved from data space here
    Slab::new(
        slab_number,
        slab_number % cfg.zone_count,
        origin,
        data_origin,
        cfg.data_blocks_per_slab,
        cfg.entries_per_journal_block,
        cfg.max_outstanding_tails,
    )
}

impl SlabDepot {
    /// Reconstruct slabs and allocators from a decoded state record,
    /// partitioning slabs across zones by `slab_number mod zone_count`
    /// (spec §4.8).
    pub fn decode(config: DepotConfig) -> Self {
        let read_only = ReadOnlyNotifier::new();
        let slabs: Vec<Slab> = (0..config.slab_count)
            .map(|n| build_slab(&config, n))
            .collect();

        // Both the priority table and the summary are indexed by the dense,
        // zone-spanning `slab_number` (not a per-zone-local index), so each
        // allocator's tables must be sized to the full slab count.
        let capacity = config.slab_count.max(1) as usize;
        let mut allocators: Vec<BlockAllocator> = (0..config.zone_count)
            .map(|z| {
                let mut a = BlockAllocator::new(
                    z,
                    z,
                    capacity,
                    config.data_blocks_per_slab,
                    read_only.clone(),
                );
                let total: u64 = slabs
                    .iter()
                    .filter(|s| s.zone_number == z)
                    .map(|s| s.data_blocks as u64)
                    .sum();
                a.set_data_blocks_total(total);
                a
            })
            .collect();

        Self {
            config,
            slabs,
            allocators,
            read_only,
            new_slabs: Vec::new(),
        }
    }

    pub fn zone_count(&self) -> u32 {
        self.config.zone_count
    }

    pub fn slab_count(&self) -> u32 {
        self.slabs.len() as u32
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.is_read_only()
    }

    /// The slab containing `pbn`, or `None` for the zero block. An
    /// out-of-range non-zero PBN escalates the depot to read-only mode
    /// before returning `None` (spec §4.8).
    pub fn get_slab(&mut self, pbn: Pbn) -> Option<&Slab> {
        if is_zero_block(pbn) {
            return None;
        }
        let number = self.slab_number_for(pbn);
        match number {
            Some(n) => self.slabs.get(n as usize),
            None => {
                self.read_only.enter();
                None
            }
        }
    }

    fn slab_number_for(&self, pbn: Pbn) -> Option<u32> {
        let offset = pbn.checked_sub(self.config.origin)?;
        let number = offset >> self.config.slab_size_shift;
        if number < self.config.slab_count as u64 {
            Some(number as u32)
        } else {
            None
        }
    }

    pub fn get_block_allocator_for_zone(&self, zone: u32) -> &BlockAllocator {
        &self.allocators[zone as usize]
    }

    pub fn get_block_allocator_for_zone_mut(&mut self, zone: u32) -> &mut BlockAllocator {
        &mut self.allocators[zone as usize]
    }

    pub fn allocate(&mut self, zone: u32) -> DepotResult<Pbn> {
        self.allocators[zone as usize].allocate(&mut self.slabs)
    }

    pub fn release_reference(&mut self, zone: u32, pbn: Pbn, lock_id: u64) -> DepotResult<()> {
        self.allocators[zone as usize].release_reference(&mut self.slabs, pbn, lock_id)
    }

    pub fn confirm_reference(&mut self, zone: u32, pbn: Pbn, lock_id: u64) -> DepotResult<()> {
        self.allocators[zone as usize].confirm_reference(&mut self.slabs, pbn, lock_id)
    }

    /// Safe to call from any thread: relaxed atomic loads across
    /// allocators (spec §5).
    pub fn allocated_blocks(&self) -> u64 {
        self.allocators.iter().map(|a| a.allocated_blocks()).sum()
    }

    pub fn data_blocks(&self) -> u64 {
        self.allocators.iter().map(|a| a.data_blocks()).sum()
    }

    /// Order every slab by `(is_clean desc, fullness_hint desc, slab_number
    /// desc)` (spec §4.7's load-time ordering comparator). The
    /// `slab_number` tie-break guarantees deterministic recovery order
    /// across runs.
    fn load_time_order(&self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.slabs.len() as u32).collect();
        order.sort_by(|&a, &b| {
            let ea = self.summary_entry(a);
            let eb = self.summary_entry(b);
            eb.is_clean
                .cmp(&ea.is_clean)
                .then(eb.fullness_hint.cmp(&ea.fullness_hint))
                .then(b.cmp(&a))
        });
        order
    }

    fn summary_entry(&self, slab_number: u32) -> SummaryEntry {
        let slab = &self.slabs[slab_number as usize];
        self.allocators[slab.zone_number as usize]
            .summary
            .get(slab_number as usize)
    }

    /// Zone action: `load` (spec §4.7 load-time ordering + §4.8 dispatch).
    pub fn load(&mut self) -> DepotResult<()> {
        let order = self.load_time_order();
        let load_type = self.config.load_type;
        for slab_number in order {
            let entry = self.summary_entry(slab_number);
            let slab = &mut self.slabs[slab_number as usize];
            slab.fire(SlabEvent::StartLoad)?;
            slab.fire(SlabEvent::FinishLoad)?;

            let zone = slab.zone_number;
            if load_type == LoadType::Rebuild || (entry.is_clean && !entry.load_ref_counts) {
                slab.fire(SlabEvent::ScrubBegin).ok();
                slab.fire(SlabEvent::ReplayDone).ok();
                self.allocators[zone as usize].queue_slab(&mut self.slabs, slab_number);
            } else {
                let high_priority =
                    (entry.is_clean && load_type == LoadType::Normal) || !entry.is_clean;
                self.allocators[zone as usize]
                    .scrubber
                    .register(slab_number, high_priority);
            }
        }
        Ok(())
    }

    /// Zone action: `prepare_to_allocate` — runs each zone's scrubber to
    /// completion, one zone at a time (spec §4.8).
    pub fn prepare_to_allocate(&mut self) -> DepotResult<()> {
        self.run_zone_action(|allocator, slabs| allocator.scrub_all(slabs))
    }

    /// Zone action: `scrub_all`.
    pub fn scrub_all(&mut self) -> DepotResult<()> {
        self.prepare_to_allocate()
    }

    /// Zone action: `drain` — each zone advances `Scrubber -> Slabs ->
    /// Summary -> Finished` to completion before the next zone starts
    /// (spec §4.7, §5: "1 zone active at a time per action").
    pub fn drain(&mut self) -> DepotResult<()> {
        self.run_zone_action(|allocator, slabs| {
            loop {
                let step = allocator.drain_step(slabs)?;
                if step == DrainStep::Finished {
                    return Ok(());
                }
            }
        })
    }

    /// Zone action: `resume` — reverses drain's steps.
    pub fn resume(&mut self) -> DepotResult<()> {
        self.run_zone_action(|allocator, slabs| {
            loop {
                let step = allocator.resume_step(slabs)?;
                if step == DrainStep::Scrubber {
                    return Ok(());
                }
            }
        })
    }

    /// From the journal-zone thread: releases each allocator's slab
    /// journal tail locks older than `recovery_block_number` (spec §4.8).
    pub fn commit_oldest_slab_journal_tail_blocks(
        &mut self,
        recovery_block_number: u64,
    ) -> DepotResult<()> {
        self.run_zone_action(|allocator, slabs| {
            allocator.release_tail_block_locks(slabs, recovery_block_number)
        })
    }

    fn run_zone_action<F>(&mut self, mut per_zone: F) -> DepotResult<()>
    where
        F: FnMut(&mut BlockAllocator, &mut [Slab]) -> DepotResult<()>,
    {
        let mut first_error = None;
        for zone in 0..self.allocators.len() {
            if let Err(e) = per_zone(&mut self.allocators[zone], &mut self.slabs) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resize: stage new slabs without touching the live array.
    pub fn prepare_to_grow(&mut self, new_slab_count: u32) -> DepotResult<()> {
        if new_slab_count <= self.config.slab_count {
            return Err(DepotError::InvalidState);
        }
        self.new_slabs = (self.config.slab_count..new_slab_count)
            .map(|n| build_slab(&self.config, n))
            .collect();
        Ok(())
    }

    /// Promote staged slabs into the live array and open them for
    /// allocation immediately (freshly-grown slabs are blank, not loaded).
    pub fn use_new_slabs(&mut self) -> DepotResult<()> {
        let mut new_slabs = core::mem::take(&mut self.new_slabs);
        if new_slabs.is_empty() {
            return Ok(());
        }
        self.config.slab_count += new_slabs.len() as u32;
        let new_capacity = self.config.slab_count as usize;
        for allocator in self.allocators.iter_mut() {
            allocator.grow_tables(new_capacity);
        }
        for slab in new_slabs.iter_mut() {
            slab.fire(SlabEvent::StartLoad)?;
            slab.fire(SlabEvent::Open)?;
        }
        for slab in &new_slabs {
            let total = slab.data_blocks as u64;
            let allocator = &mut self.allocators[slab.zone_number as usize];
            let new_total = allocator.data_blocks() + total;
            allocator.set_data_blocks_total(new_total);
        }
        let numbers: Vec<u32> = new_slabs.iter().map(|s| s.slab_number).collect();
        self.slabs.append(&mut new_slabs);
        for n in numbers {
            let zone = self.slabs[n as usize].zone_number;
            self.allocators[zone as usize].queue_slab(&mut self.slabs, n);
        }
        Ok(())
    }

    pub fn abandon_new_slabs(&mut self) {
        self.new_slabs.clear();
    }

    #[cfg(test)]
    pub(crate) fn slab_state(&self, slab_number: u32) -> SlabState {
        self.slabs[slab_number as usize].state()
    }
}
