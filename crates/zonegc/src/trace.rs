//! Tracer trait and the tracer implementations used by the collector.
//!
//! Every cell kind reports its strong edges through a [`TraceFn`]: the
//! function walks the cell's slots and hands each reference slot to a
//! [`Tracer`]. The same enumeration serves marking, verification and
//! relocation; only the tracer's [`TraceMode`] differs.
//!
//! [`TraceFn`]: crate::TraceFn

use rustc_hash::FxHashMap;

use crate::cell::{CellPtr, Value};

// ============================================================================
// Core Traits
// ============================================================================

/// What a traversal is doing with the edges it is handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Discovering reachable cells; edges are read only.
    Marking,
    /// Relocating cells; edges may be rewritten.
    Moving,
    /// Checking heap invariants; edges are read only.
    Verifying,
    /// Generic graph walk on behalf of the embedder.
    Visiting,
}

/// Receives the strong edges reported by a cell's trace hook.
pub trait Tracer {
    /// The mode of this traversal.
    fn mode(&self) -> TraceMode;

    /// Visit one edge. Moving tracers may overwrite `edge` in place.
    fn on_edge(&mut self, edge: &mut CellPtr);

    /// Visit a slot value; non-cell values are ignored.
    fn trace_value(&mut self, value: &mut Value) {
        if let Some(mut ptr) = value.as_cell() {
            self.on_edge(&mut ptr);
            *value = Value::cell(ptr);
        }
    }
}

/// Trace hook for kinds whose slots are all values.
pub fn trace_all_slots(slots: &mut [Value], tracer: &mut dyn Tracer) {
    for slot in slots {
        tracer.trace_value(slot);
    }
}

/// Trace hook for kinds without strong edges.
pub fn trace_nothing(_slots: &mut [Value], _tracer: &mut dyn Tracer) {}

// ============================================================================
// Collector-side tracers
// ============================================================================

/// Appends every edge to a buffer.
pub(crate) struct EdgeCollector<'a> {
    mode: TraceMode,
    edges: &'a mut Vec<CellPtr>,
}

impl<'a> EdgeCollector<'a> {
    pub(crate) fn new(mode: TraceMode, edges: &'a mut Vec<CellPtr>) -> Self {
        Self { mode, edges }
    }
}

impl Tracer for EdgeCollector<'_> {
    fn mode(&self) -> TraceMode {
        self.mode
    }

    fn on_edge(&mut self, edge: &mut CellPtr) {
        self.edges.push(*edge);
    }
}

/// Old-to-new address map produced by a moving collection.
#[derive(Debug, Default)]
pub(crate) struct Relocation {
    forward: FxHashMap<CellPtr, CellPtr>,
    evicts_nursery: bool,
}

impl Relocation {
    /// Relocation of a minor collection: every nursery cell not in the map
    /// is dead afterwards.
    pub(crate) fn nursery_eviction() -> Self {
        Self {
            forward: FxHashMap::default(),
            evicts_nursery: true,
        }
    }

    /// Relocation of a compaction: unmapped cells stay where they are.
    pub(crate) fn compaction() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, from: CellPtr, to: CellPtr) {
        self.forward.insert(from, to);
    }

    pub(crate) fn len(&self) -> usize {
        self.forward.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub(crate) fn get(&self, from: CellPtr) -> Option<CellPtr> {
        self.forward.get(&from).copied()
    }

    /// New location of `ptr`, or `None` if the cell did not survive.
    pub(crate) fn resolve(&self, ptr: CellPtr) -> Option<CellPtr> {
        match self.forward.get(&ptr) {
            Some(&to) => Some(to),
            None if self.evicts_nursery && ptr.is_nursery() => None,
            None => Some(ptr),
        }
    }
}

/// Rewrites edges through a [`Relocation`].
pub(crate) struct ForwardingTracer<'a> {
    relocation: &'a Relocation,
    patched: usize,
}

impl<'a> ForwardingTracer<'a> {
    pub(crate) fn new(relocation: &'a Relocation) -> Self {
        Self {
            relocation,
            patched: 0,
        }
    }

    pub(crate) const fn patched(&self) -> usize {
        self.patched
    }
}

impl Tracer for ForwardingTracer<'_> {
    fn mode(&self) -> TraceMode {
        TraceMode::Moving
    }

    fn on_edge(&mut self, edge: &mut CellPtr) {
        if let Some(to) = self.relocation.get(*edge) {
            *edge = to;
            self.patched += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zone::ZoneId;

    #[test]
    fn test_edge_collector_skips_non_cells() {
        let a = CellPtr::tenured(ZoneId(1), 0, 0);
        let b = CellPtr::nursery(0, 8);
        let mut slots = [Value::cell(a), Value::int(3), Value::NULL, Value::cell(b)];
        let mut edges = Vec::new();
        trace_all_slots(&mut slots, &mut EdgeCollector::new(TraceMode::Marking, &mut edges));
        assert_eq!(edges, vec![a, b]);
    }

    #[test]
    fn test_forwarding_tracer_rewrites_slots() {
        let old = CellPtr::nursery(0, 8);
        let new = CellPtr::tenured(ZoneId(1), 3, 4);
        let other = CellPtr::tenured(ZoneId(1), 0, 0);
        let mut relocation = Relocation::nursery_eviction();
        relocation.insert(old, new);

        let mut slots = [Value::cell(old), Value::cell(other), Value::int(1)];
        let mut tracer = ForwardingTracer::new(&relocation);
        trace_all_slots(&mut slots, &mut tracer);

        assert_eq!(tracer.patched(), 1);
        assert_eq!(slots[0], Value::cell(new));
        assert_eq!(slots[1], Value::cell(other));
        assert_eq!(slots[2], Value::int(1));
    }

    #[test]
    fn test_relocation_resolve() {
        let survivor = CellPtr::nursery(0, 8);
        let dead = CellPtr::nursery(0, 16);
        let tenured = CellPtr::tenured(ZoneId(1), 0, 0);
        let promoted = CellPtr::tenured(ZoneId(1), 1, 0);

        let mut minor = Relocation::nursery_eviction();
        minor.insert(survivor, promoted);
        assert_eq!(minor.resolve(survivor), Some(promoted));
        assert_eq!(minor.resolve(dead), None);
        assert_eq!(minor.resolve(tenured), Some(tenured));

        let compaction = Relocation::compaction();
        assert_eq!(compaction.resolve(dead), Some(dead));
        assert!(compaction.is_empty());
    }

    #[test]
    fn test_trace_nothing_reports_no_edges() {
        let mut slots = [Value::cell(CellPtr::tenured(ZoneId(1), 0, 0))];
        let mut edges = Vec::new();
        trace_nothing(&mut slots, &mut EdgeCollector::new(TraceMode::Verifying, &mut edges));
        assert!(edges.is_empty());
    }
}
