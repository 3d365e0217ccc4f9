//! Physical block number (spec §3).

/// Physical block number on the backing device.
///
/// PBN 0 is the distinguished zero block: never allocated, referenced, or
/// freed. Operations on it are no-ops.
pub type Pbn = u64;

/// The distinguished zero block.
pub const ZERO_BLOCK: Pbn = 0;

#[inline]
pub const fn is_zero_block(pbn: Pbn) -> bool {
    pbn == ZERO_BLOCK
}
