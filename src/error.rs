//! Error codes surfaced by the slab depot (spec §6, §7).
//!
//! Modeled on the kernel's `Errno` enum: a small `#[repr]` enum with a
//! `description()` method, no `dyn Error`, no allocation on the error path.

use core::fmt;

/// Every error the depot and its allocators can return to a caller.
///
/// `SUCCESS` has no variant here; operations that succeed return `Ok(())`
/// or `Ok(T)` directly.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepotError {
    /// No free physical block is available in the target slab/zone.
    NoSpace = 1,
    /// Index/configuration geometry does not match what was persisted.
    NoIndex = 2,
    /// A persisted component failed its structural/magic validation.
    CorruptComponent = 3,
    /// The depot or allocator has entered sticky read-only mode.
    ReadOnly = 4,
    /// An operation was attempted against a ref-count or admin state that
    /// forbids it (e.g. decrementing a zero counter).
    InvalidState = 5,
    /// A PBN fell outside every slab's range.
    OutOfRange = 6,
    /// An admin-state transition has no edge for the requested event.
    BadState = 7,
    /// A recovery-journal lock id failed a monotonicity/wraparound check.
    LockError = 8,
    /// The backing device returned an I/O error while reading or writing
    /// depot metadata.
    Io = 9,
}

pub type DepotResult<T> = Result<T, DepotError>;

impl DepotError {
    pub const fn description(self) -> &'static str {
        match self {
            DepotError::NoSpace => "no free physical block available",
            DepotError::NoIndex => "configuration geometry mismatch",
            DepotError::CorruptComponent => "persisted component failed validation",
            DepotError::ReadOnly => "depot is in read-only mode",
            DepotError::InvalidState => "operation invalid for current state",
            DepotError::OutOfRange => "physical block number out of range",
            DepotError::BadState => "no admin-state transition for this event",
            DepotError::LockError => "recovery journal lock id rejected",
            DepotError::Io => "I/O error accessing depot metadata",
        }
    }

    /// True for the errors that must escalate the owning allocator to
    /// read-only mode (spec §7, "Invariant violation" and "I/O" rows).
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            DepotError::InvalidState | DepotError::Io | DepotError::CorruptComponent
        )
    }
}

impl fmt::Display for DepotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
