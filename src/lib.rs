//! Slab depot and per-zone block allocators for a deduplicating block
//! storage engine (spec: slab depot / block allocator subsystem).
//!
//! This crate implements the hardest part of that engine: tracking free
//! physical blocks, allocating them under concurrency with strict per-zone
//! thread affinity, maintaining reference counts, and recovering this state
//! after a crash. The dedup index, logical-to-physical map, recovery
//! journal, and device bring-up are external collaborators whose contracts
//! this crate assumes but does not implement.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block_allocator;
pub mod completion;
pub mod config;
pub mod error;
pub mod pbn;
pub mod priority_table;
pub mod read_only;
pub mod reference_counts;
pub mod scrubber;
pub mod slab;
pub mod slab_depot;
pub mod slab_journal;
pub mod slab_summary;
pub mod waiter;

pub use error::{DepotError, DepotResult};
pub use pbn::Pbn;
pub use slab_depot::{DepotConfig, LoadType, SlabDepot};
