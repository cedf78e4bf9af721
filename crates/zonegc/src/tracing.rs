//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collections and their phases. Without the
//! feature the same names exist as no-ops.

/// Collector phases that get their own span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Zone selection and root snapshot.
    Prepare,
    /// Tracing the live graph.
    Mark,
    /// Reclaiming white cells.
    Sweep,
    /// Relocating cells out of sparse arenas.
    Compact,
    /// Clearing marks and recording metrics.
    Finalize,
    /// Nursery evacuation.
    Minor,
}

/// Stable identifier for a collection.
///
/// Correlates all events of one collection, including every slice of an
/// incremental one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcId(pub u64);

#[cfg(feature = "tracing")]
mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};

    use tracing::{span, Level};

    use super::{GcId, GcPhase};

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span for one collection slice (or a whole atomic collection).
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Span for a collector phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a GC phase.
    pub fn log_phase_start(phase: GcPhase, bytes_before: usize) {
        tracing::debug!(phase = ?phase, bytes_before, "phase_start");
    }

    /// Log the end of a GC phase.
    pub fn log_phase_end(phase: GcPhase, bytes_reclaimed: usize) {
        tracing::debug!(phase = ?phase, bytes_reclaimed, "phase_end");
    }
}

#[cfg(not(feature = "tracing"))]
mod internal {
    use super::{GcId, GcPhase};

    /// Stand-in for an entered span.
    #[derive(Debug)]
    pub struct EnteredSpan;

    /// Generate the next GC ID; always zero without tracing.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }

    /// No-op without tracing.
    pub const fn trace_gc_collection(_collection_type: &str, _gc_id: GcId) -> EnteredSpan {
        EnteredSpan
    }

    /// No-op without tracing.
    pub const fn trace_phase(_phase: GcPhase) -> EnteredSpan {
        EnteredSpan
    }

    /// No-op without tracing.
    pub const fn log_phase_start(_phase: GcPhase, _bytes_before: usize) {}

    /// No-op without tracing.
    pub const fn log_phase_end(_phase: GcPhase, _bytes_reclaimed: usize) {}
}

pub use internal::{log_phase_end, log_phase_start, next_gc_id, trace_gc_collection, trace_phase};
