//! End-to-end scenarios for the slab depot and its per-zone allocators.
//! These drive the public API the way an embedding VDO instance would:
//! decode a depot from a config, load it, allocate, and recover from a
//! simulated crash.

use std::collections::HashSet;

use vdo_depot::config::{IndexConfig, IndexGeometry};
use vdo_depot::error::DepotError;
use vdo_depot::reference_counts::{ReferenceOperation, ReferenceOperationType};
use vdo_depot::scrubber::SlabScrubber;
use vdo_depot::slab::{Slab, SlabEvent};
use vdo_depot::slab_depot::{DepotConfig, LoadType, SlabDepot};
use vdo_depot::slab_summary::SummaryEntry;

fn clean_no_load_refs() -> SummaryEntry {
    SummaryEntry {
        tail_block_offset: 0,
        load_ref_counts: false,
        is_clean: true,
        fullness_hint: 0,
    }
}

fn dirty_needs_scrub() -> SummaryEntry {
    SummaryEntry {
        tail_block_offset: 0,
        load_ref_counts: true,
        is_clean: false,
        fullness_hint: 0,
    }
}

/// E1: a freshly-formatted 4-slab, 2-zone depot hands out 2048 distinct PBNs
/// from zone 0, all landing in the two slabs zone 0 owns, and the zone's
/// running counter matches.
#[test]
fn fresh_depot_allocates_every_block_in_its_zone() {
    let config = DepotConfig {
        origin: 0,
        slab_size_shift: 10, // 1 << 10 == 1024 data blocks per slab
        slab_count: 4,
        zone_count: 2,
        data_blocks_per_slab: 1024,
        entries_per_journal_block: 64,
        max_outstanding_tails: 8,
        load_type: LoadType::Normal,
    };
    let mut depot = SlabDepot::decode(config);

    for slab_number in 0..4u32 {
        let zone = slab_number % 2;
        depot
            .get_block_allocator_for_zone_mut(zone)
            .summary
            .update(slab_number as usize, clean_no_load_refs());
    }
    depot.load().unwrap();
    depot.prepare_to_allocate().unwrap();

    let mut seen = HashSet::new();
    for _ in 0..2048 {
        let pbn = depot.allocate(0).unwrap();
        assert!(seen.insert(pbn), "pbn {pbn} allocated twice");
        let in_slab_0 = pbn < 1024;
        let in_slab_2 = (2048..3072).contains(&pbn);
        assert!(in_slab_0 || in_slab_2, "pbn {pbn} outside zone 0's slabs");
    }
    assert_eq!(depot.get_block_allocator_for_zone(0).allocated_blocks(), 2048);

    // E1 cont'd / E2: zone 0 has nothing left and nothing to scrub.
    assert_eq!(depot.allocate(0), Err(DepotError::NoSpace));
}

/// E2: an allocate that outruns the open slab, with a second slab still
/// sitting unscrubbed, blocks with `NoSpace` rather than touching it early.
#[test]
fn allocate_reports_no_space_while_a_slab_is_still_unscrubbed() {
    let config = DepotConfig {
        origin: 0,
        slab_size_shift: 2, // 4 data blocks per slab
        slab_count: 2,
        zone_count: 1,
        data_blocks_per_slab: 4,
        entries_per_journal_block: 8,
        max_outstanding_tails: 4,
        load_type: LoadType::Normal,
    };
    let mut depot = SlabDepot::decode(config);
    depot
        .get_block_allocator_for_zone_mut(0)
        .summary
        .update(0, clean_no_load_refs());
    depot
        .get_block_allocator_for_zone_mut(0)
        .summary
        .update(1, dirty_needs_scrub());
    depot.load().unwrap();
    // Deliberately skip prepare_to_allocate(): slab 1 stays unrecovered.

    for _ in 0..4 {
        depot.allocate(0).unwrap();
    }
    assert_eq!(depot.allocate(0), Err(DepotError::NoSpace));
}

/// E3: a caller-requested version below 4 always persists as 06.02 with the
/// remap fields zeroed, regardless of what was passed in.
#[test]
fn config_version_below_4_zeroes_remap_fields() {
    let geometry = IndexGeometry {
        record_pages_per_chapter: 256,
        chapters_per_volume: 1024,
        sparse_chapters_per_volume: 0,
        cache_chapters: 8,
        volume_index_mean_delta: 4096,
        bytes_per_page: 4096,
        sparse_sample_rate: 32,
        nonce: 0xA5A5_5A5A_1234_5678,
    };
    let written = IndexConfig::new(3, geometry, 0xDEAD_BEEF, 0xFEED_FACE);
    let bytes = written.to_bytes();
    let read_back = IndexConfig::from_bytes(&bytes).unwrap();
    assert_eq!(read_back.remapped_virtual, 0);
    assert_eq!(read_back.remapped_physical, 0);
}

/// E4: version 4 and above preserves the remap fields exactly.
#[test]
fn config_version_4_preserves_remap_fields() {
    let geometry = IndexGeometry {
        record_pages_per_chapter: 256,
        chapters_per_volume: 1024,
        sparse_chapters_per_volume: 2,
        cache_chapters: 8,
        volume_index_mean_delta: 4096,
        bytes_per_page: 4096,
        sparse_sample_rate: 32,
        nonce: 0x1,
    };
    let written = IndexConfig::new(4, geometry, 0x1111_2222_3333_4444, 0x5555_6666_7777_8888);
    let bytes = written.to_bytes();
    let read_back = IndexConfig::from_bytes(&bytes).unwrap();
    assert_eq!(read_back.remapped_virtual, 0x1111_2222_3333_4444);
    assert_eq!(read_back.remapped_physical, 0x5555_6666_7777_8888);
}

/// E5: at load, a slab whose summary hint says clean-and-no-refs-needed is
/// queued straight to the allocator; a dirty slab is scrubbed first. Both
/// end up allocatable.
#[test]
fn load_mixes_direct_queue_and_scrub_per_summary_hint() {
    let config = DepotConfig {
        origin: 0,
        slab_size_shift: 4, // 16 data blocks per slab
        slab_count: 3,
        zone_count: 1,
        data_blocks_per_slab: 16,
        entries_per_journal_block: 8,
        max_outstanding_tails: 4,
        load_type: LoadType::Normal,
    };
    let mut depot = SlabDepot::decode(config);
    depot
        .get_block_allocator_for_zone_mut(0)
        .summary
        .update(0, dirty_needs_scrub());
    depot
        .get_block_allocator_for_zone_mut(0)
        .summary
        .update(1, clean_no_load_refs());
    depot
        .get_block_allocator_for_zone_mut(0)
        .summary
        .update(2, dirty_needs_scrub());

    depot.load().unwrap();
    depot.prepare_to_allocate().unwrap();

    let mut seen = HashSet::new();
    for _ in 0..48 {
        let pbn = depot.allocate(0).unwrap();
        assert!(seen.insert(pbn));
    }
    assert_eq!(depot.allocate(0), Err(DepotError::NoSpace));
    assert_eq!(seen.len(), 48);
}

/// E6: two zones allocate and journal concurrently; a crash loses the
/// durable ref-count page before the summary flush, but the slab journal
/// (already sealed) survives and a scrub replay reconstructs the exact same
/// allocation count.
#[test]
fn scrub_replay_reconstructs_allocations_lost_before_summary_flush() {
    let mut total_recovered = 0u64;

    for zone in 0..2u32 {
        // A journal block large enough that 1024 single-pbn increments never
        // force an early seal; only `replay_entries()`'s submission order
        // matters for this scenario, not tail-block boundaries.
        let mut live = Slab::new(zone, zone, 0, 0, 1024, 2048, 8);
        live.fire(SlabEvent::StartLoad).unwrap();
        live.fire(SlabEvent::FinishLoad).unwrap();
        live.fire(SlabEvent::ScrubBegin).unwrap();
        live.fire(SlabEvent::ReplayDone).unwrap();

        for i in 0..1024u64 {
            let pbn = live.allocate_unreferenced().unwrap();
            live.modify_reference(ReferenceOperation {
                op_type: ReferenceOperationType::Data,
                pbn,
                increment: true,
                recovery_lock_id: i,
            })
            .unwrap();
        }
        assert_eq!(live.free_blocks(), 0);

        // Crash: the durable ref-count page for this slab never made it to
        // disk, but its slab journal (already sealed into tail blocks) did.
        let surviving_journal = core::mem::replace(&mut live.journal, vdo_depot::slab_journal::SlabJournal::new(64, 8));

        let mut recovered = Slab::new(zone, zone, 0, 0, 1024, 64, 8);
        recovered.fire(SlabEvent::StartLoad).unwrap();
        recovered.fire(SlabEvent::FinishLoad).unwrap();
        recovered.journal = surviving_journal;

        let mut scrubber = SlabScrubber::new();
        scrubber.register(zone, false);
        let outcome = scrubber.scrub_next(&mut recovered).unwrap().unwrap();
        assert_eq!(outcome, zone);
        assert_eq!(recovered.free_blocks(), 0);
        total_recovered += 1024 - recovered.free_blocks() as u64;
    }

    assert_eq!(total_recovered, 2048);
}
