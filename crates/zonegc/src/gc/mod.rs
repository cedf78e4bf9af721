//! Collection phases.
//!
//! This module holds the collector proper, as `impl GcRuntime` blocks split
//! by phase:
//! - Incremental scheduler and slice budgets
//! - Marking, ephemeron resolution and sweeping
//! - Minor collection (nursery evacuation) and compaction
//! - Write barriers
//! - Heap verification and zone selection policies

mod barrier;
mod compact;
pub mod ephemeron;
pub mod incremental;
mod mark;
mod minor;
pub mod policy;
mod sweep;
mod verify;

#[cfg(feature = "tracing")]
pub mod tracing;

pub use ephemeron::EphemeronTable;
pub use incremental::{GcScope, GcState, SliceBudget, SliceOutcome};
pub use policy::{AllZones, AllocationThreshold, ZonePolicy, ZoneUsage};
