//! Collector errors.
//!
//! Recoverable failures (allocation, API misuse) are returned as
//! [`GcError`]. Broken heap invariants found by the collector itself are not
//! recoverable: [`fatal`] dumps a diagnostic and aborts the process.

use std::fmt;

use thiserror::Error;

use crate::cell::CellPtr;
use crate::zone::ZoneId;

/// Which heap invariant a [`Violation`] breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A black cell points to a white cell in a zone being marked.
    BlackToWhite,
    /// A reachable cell was left unmarked when marking finished.
    UnmarkedReachable,
    /// A live cell holds an edge to a freed or stale cell.
    DanglingEdge,
    /// A store skipped a barrier that was required.
    UnbarrieredStore,
}

/// A broken heap invariant, with the offending edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    /// What went wrong.
    pub kind: ViolationKind,
    /// Cell holding the edge, if the edge came from a cell.
    pub holder: Option<CellPtr>,
    /// The edge's target.
    pub target: CellPtr,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ViolationKind::BlackToWhite => "black cell points to white cell",
            ViolationKind::UnmarkedReachable => "reachable cell left unmarked",
            ViolationKind::DanglingEdge => "edge to dead cell",
            ViolationKind::UnbarrieredStore => "store skipped required barrier",
        };
        match self.holder {
            Some(holder) => write!(f, "{what}: {holder} -> {}", self.target),
            None => write!(f, "{what}: root -> {}", self.target),
        }
    }
}

/// Errors returned by the collector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    /// The page pool cannot satisfy an allocation, even after a full
    /// collection.
    #[error("out of memory allocating {bytes} bytes in {zone}")]
    OutOfMemory {
        /// Zone the allocation was for.
        zone: ZoneId,
        /// Size of the request.
        bytes: usize,
    },

    /// A heap invariant does not hold.
    #[error("heap invariant violated: {0}")]
    InvariantViolation(Violation),

    /// A store bypassed a required barrier.
    #[error("barrier misuse: unbarriered store of {target} into {holder}")]
    BarrierMisuse {
        /// Cell written to.
        holder: CellPtr,
        /// Value stored.
        target: CellPtr,
    },

    /// The zone does not exist (never created or destroyed).
    #[error("no such zone: {0}")]
    NoSuchZone(ZoneId),

    /// The zone id space is exhausted.
    #[error("too many zones")]
    TooManyZones,

    /// The zone still holds live cells, or is the permanent atoms zone.
    #[error("{0} still holds live cells")]
    ZoneNotEmpty(ZoneId),

    /// A collection cycle is already running.
    #[error("a collection is already in progress")]
    CollectionInProgress,

    /// The pointer names a freed cell, or a nursery cell from a previous
    /// nursery epoch.
    #[error("stale cell pointer {0}")]
    StaleCell(CellPtr),

    /// Slot index past the end of the cell.
    #[error("slot {slot} out of bounds for {cell} with {len} slots")]
    SlotOutOfBounds {
        /// The cell.
        cell: CellPtr,
        /// Requested slot.
        slot: usize,
        /// Slot count of the cell.
        len: usize,
    },

    /// The kind is not registered, or the cell has the wrong kind for the
    /// operation.
    #[error("unknown or unsuitable kind {0}")]
    UnknownKind(u16),

    /// Too many slots for one cell.
    #[error("cell with {0} slots exceeds the maximum cell size")]
    TooManySlots(usize),

    /// `gczeal` was given a mode number it does not know.
    #[error("unknown zeal mode {0}")]
    UnknownZealMode(u8),
}

/// Logs a diagnostic dump and aborts the process.
///
/// Used when the collector detects that its own invariants are broken;
/// continuing would corrupt the heap further.
#[cold]
pub fn fatal(error: &GcError, dump: &str) -> ! {
    #[cfg(feature = "tracing")]
    tracing::error!(error = %error, dump = dump, "fatal collector error");

    eprintln!("[GC] fatal: {error}");
    if !dump.is_empty() {
        eprintln!("{dump}");
    }
    std::process::abort()
}
