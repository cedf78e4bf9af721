//! GC-level tracing events.

use tracing::Span;

use crate::gc::incremental::GcState;
use crate::tracing::GcId;

/// Create a span for one incremental slice.
pub fn span_slice(state: GcState, gc_id: GcId) -> Span {
    tracing::debug_span!("gc_slice", state = state.as_str(), gc_id = gc_id.0)
}

/// Log a slice completion event.
pub fn log_slice(state: GcState, work: usize, budget_exhausted: bool) {
    tracing::debug!(
        state = state.as_str(),
        work = work,
        budget_exhausted = budget_exhausted,
        "gc_slice"
    );
}

/// Log a state machine transition.
pub fn log_state_transition(from: GcState, to: GcState, cells_marked: usize) {
    tracing::debug!(
        from = from.as_str(),
        to = to.as_str(),
        cells_marked = cells_marked,
        "state_transition"
    );
}

/// Log the start of a collection.
pub fn log_collection_start(zones: usize, full: bool, reason: &str, gc_id: GcId) {
    tracing::debug!(zones, full, reason, gc_id = gc_id.0, "collection_start");
}

/// Log a finished minor collection.
pub fn log_minor(promoted: usize, promoted_bytes: usize, reason: &str) {
    tracing::debug!(promoted, promoted_bytes, reason, "minor_gc");
}

/// Log a finished compaction.
pub fn log_compaction(relocated: usize, edges_patched: usize, arenas_released: usize) {
    tracing::debug!(relocated, edges_patched, arenas_released, "compaction");
}

/// Log a collection forced to completion.
pub fn log_abort_forward(state: GcState, reason: &str) {
    tracing::debug!(state = state.as_str(), reason, "abort_forward");
}

/// Log an emergency collection after pool exhaustion.
pub fn log_emergency(bytes: usize) {
    tracing::warn!(bytes, "heap limit reached, running emergency collection");
}
