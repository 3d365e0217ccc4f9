//! On-disk configuration block (spec §6).
//!
//! Carries the dedup index's UDS geometry fields — this subsystem never
//! reads them — but the depot crate owns their wire format because it sits
//! on the load path before the index is brought up, and a configuration
//! mismatch here (`NoIndex`) or an unknown version (`CorruptComponent`) must
//! abort bring-up before either subsystem touches the device.
//!
//! All multi-byte integers are little-endian; encode/decode is done by
//! explicit byte slicing rather than a `#[repr(C)]` transmute (see
//! `jbd2::Journal::load`'s `from_le_bytes` pattern in the teacher for the
//! same approach applied to a magic-prefixed header), since transmuting a
//! packed struct does not guarantee byte order or the absence of padding.

use alloc::vec::Vec;

use crate::error::{DepotError, DepotResult};

const MAGIC: &[u8; 5] = b"ALBIC";
const VERSION_06_02: &[u8; 5] = b"06.02";
const VERSION_08_02: &[u8; 5] = b"08.02";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigVersion {
    V06_02,
    V08_02,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexGeometry {
    pub record_pages_per_chapter: u32,
    pub chapters_per_volume: u32,
    pub sparse_chapters_per_volume: u32,
    pub cache_chapters: u32,
    pub volume_index_mean_delta: u32,
    pub bytes_per_page: u32,
    pub sparse_sample_rate: u32,
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexConfig {
    pub version: ConfigVersion,
    pub geometry: IndexGeometry,
    pub remapped_virtual: u64,
    pub remapped_physical: u64,
}

impl IndexConfig {
    /// Write policy (spec §6): callers requesting `caller_version < 4` get
    /// the 06.02 layout; everyone else gets 08.02 with remap fields from
    /// the current geometry.
    pub fn new(caller_version: u32, geometry: IndexGeometry, remapped_virtual: u64, remapped_physical: u64) -> Self {
        if caller_version < 4 {
            Self {
                version: ConfigVersion::V06_02,
                geometry,
                remapped_virtual: 0,
                remapped_physical: 0,
            }
        } else {
            Self {
                version: ConfigVersion::V08_02,
                geometry,
                remapped_virtual,
                remapped_physical,
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(MAGIC);
        match self.version {
            ConfigVersion::V06_02 => out.extend_from_slice(VERSION_06_02),
            ConfigVersion::V08_02 => out.extend_from_slice(VERSION_08_02),
        }
        let g = &self.geometry;
        out.extend_from_slice(&g.record_pages_per_chapter.to_le_bytes());
        out.extend_from_slice(&g.chapters_per_volume.to_le_bytes());
        out.extend_from_slice(&g.sparse_chapters_per_volume.to_le_bytes());
        out.extend_from_slice(&g.cache_chapters.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved_zero
        out.extend_from_slice(&g.volume_index_mean_delta.to_le_bytes());
        out.extend_from_slice(&g.bytes_per_page.to_le_bytes());
        out.extend_from_slice(&g.sparse_sample_rate.to_le_bytes());
        out.extend_from_slice(&g.nonce.to_le_bytes());
        if self.version == ConfigVersion::V08_02 {
            out.extend_from_slice(&self.remapped_virtual.to_le_bytes());
            out.extend_from_slice(&self.remapped_physical.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> DepotResult<Self> {
        if bytes.len() < 10 {
            return Err(DepotError::CorruptComponent);
        }
        if &bytes[0..5] != MAGIC {
            return Err(DepotError::NoIndex);
        }
        let version_bytes: [u8; 5] = bytes[5..10].try_into().unwrap();
        let version = if &version_bytes == VERSION_06_02 {
            ConfigVersion::V06_02
        } else if &version_bytes == VERSION_08_02 {
            ConfigVersion::V08_02
        } else {
            return Err(DepotError::CorruptComponent);
        };

        let payload = &bytes[10..];
        let needed = if version == ConfigVersion::V08_02 { 36 + 16 } else { 36 };
        if payload.len() < needed {
            return Err(DepotError::CorruptComponent);
        }

        let u32_at = |off: usize| u32::from_le_bytes(payload[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(payload[off..off + 8].try_into().unwrap());

        let geometry = IndexGeometry {
            record_pages_per_chapter: u32_at(0),
            chapters_per_volume: u32_at(4),
            sparse_chapters_per_volume: u32_at(8),
            cache_chapters: u32_at(12),
            // payload[16..20] is reserved_zero
            volume_index_mean_delta: u32_at(20),
            bytes_per_page: u32_at(24),
            sparse_sample_rate: u32_at(28),
            nonce: u64_at(32),
        };

        let (remapped_virtual, remapped_physical) = if version == ConfigVersion::V08_02 {
            (u64_at(40), u64_at(48))
        } else {
            (0, 0)
        };

        Ok(Self {
            version,
            geometry,
            remapped_virtual,
            remapped_physical,
        })
    }
}
