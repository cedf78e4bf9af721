//! The collector context.
//!
//! [`GcRuntime`] owns everything a collector needs: zones and their arenas,
//! the nursery, the page pool, roots, side tables and the incremental state.
//! There is no global state; independent runtimes never interact.

use std::io;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::cell::{cell_words, CellPtr, Header, KindId, KindInfo, KindRegistry, Value, MAX_SLOTS, WORD_SIZE};
use crate::config::GcConfig;
use crate::error::GcError;
use crate::gc::ephemeron::EphemeronTable;
use crate::gc::incremental::{GcScope, IncrementalState};
use crate::gc::policy::{AllZones, ZonePolicy};
use crate::heap::PagePool;
use crate::metrics::{GcHistory, GcMetrics, GcReason, GcStats, MetricsRecorder};
use crate::nursery::{Nursery, StoreBuffer};
use crate::roots::{RootId, RootTable};
use crate::testing::Zeal;
use crate::trace::{EdgeCollector, Relocation, TraceMode, Tracer};
use crate::zone::{CrossZoneTable, Zone, ZoneId, ZoneTable};

/// A garbage-collected heap and its collector.
///
/// All methods take `&mut self` or `&self`; the runtime has a single
/// mutator. Calls that may collect ([`allocate`](Self::allocate),
/// [`allocate_young`](Self::allocate_young), [`run_slice`](Self::run_slice))
/// may move young cells and compacted cells: pointers held outside the heap
/// must be rooted and read back through their [`RootId`].
pub struct GcRuntime {
    pub(crate) zones: ZoneTable,
    pub(crate) nursery: Nursery,
    pub(crate) pool: Mutex<PagePool>,
    pub(crate) kinds: KindRegistry,
    pub(crate) roots: RootTable,
    pub(crate) store_buffer: StoreBuffer,
    pub(crate) cross_zone: CrossZoneTable,
    pub(crate) weak_maps: EphemeronTable,
    pub(crate) incremental: IncrementalState,
    /// Cells shaded by the write barrier, drained into the mark stack at
    /// the start of every mark slice.
    pub(crate) barrier_log: SegQueue<CellPtr>,
    pub(crate) policy: Box<dyn ZonePolicy>,
    pub(crate) zeal: Zeal,
    pub(crate) observers: Vec<Option<CellPtr>>,
    pub(crate) metrics: MetricsRecorder,
    pub(crate) config: GcConfig,
    pub(crate) atoms: ZoneId,
}

impl GcRuntime {
    /// Creates a runtime with its permanent atoms zone.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the nursery cannot be mapped.
    pub fn new(config: GcConfig) -> io::Result<Self> {
        let nursery = Nursery::new(config.nursery_bytes)?;
        let pool = PagePool::new(config.chunk_pages, config.heap_limit());
        let mut zones = ZoneTable::default();
        let atoms = zones
            .create(true)
            .ok_or_else(|| io::Error::other("cannot create the atoms zone"))?;

        Ok(Self {
            zones,
            nursery,
            pool: Mutex::new(pool),
            kinds: KindRegistry::new(),
            roots: RootTable::new(),
            store_buffer: StoreBuffer::default(),
            cross_zone: CrossZoneTable::default(),
            weak_maps: EphemeronTable::default(),
            incremental: IncrementalState::default(),
            barrier_log: SegQueue::new(),
            policy: Box::new(AllZones),
            zeal: Zeal::default(),
            observers: Vec::new(),
            metrics: MetricsRecorder::default(),
            config,
            atoms,
        })
    }

    /// A runtime with [`GcConfig::default`].
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_defaults() -> io::Result<Self> {
        Self::new(GcConfig::default())
    }

    /// The configuration this runtime was created with.
    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Registers a cell kind.
    pub fn register_kind(&mut self, info: KindInfo) -> Option<KindId> {
        self.kinds.register(info)
    }

    /// The kind registry.
    #[must_use]
    pub const fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    // ========================================================================
    // Zones
    // ========================================================================

    /// Creates an empty zone.
    ///
    /// # Errors
    ///
    /// `TooManyZones` once the zone id space is used up.
    pub fn create_zone(&mut self) -> Result<ZoneId, GcError> {
        self.zones.create(false).ok_or(GcError::TooManyZones)
    }

    /// Collects `zone` and removes it if nothing in it survived.
    ///
    /// Cells kept alive only by stale cross-zone edges from other zones keep
    /// the zone alive until those zones are collected.
    ///
    /// # Errors
    ///
    /// `NoSuchZone`; `ZoneNotEmpty` if live cells remain or `zone` is the
    /// atoms zone; `OutOfMemory` if the nursery cannot be evicted.
    pub fn destroy_zone(&mut self, zone: ZoneId) -> Result<(), GcError> {
        if self.zones.get(zone).is_none() {
            return Err(GcError::NoSuchZone(zone));
        }
        if zone == self.atoms {
            return Err(GcError::ZoneNotEmpty(zone));
        }
        self.finish_collection();
        self.collect_minor(GcReason::DestroyZone)?;
        self.collect_atomic(GcScope::Zones(vec![zone]), GcReason::DestroyZone);

        if self.zones.get(zone).is_some_and(|z| z.live_cells() > 0) {
            return Err(GcError::ZoneNotEmpty(zone));
        }
        if let Some(mut removed) = self.zones.remove(zone) {
            removed.release_all(&self.pool);
        }
        self.cross_zone.remove_zone(zone);
        Ok(())
    }

    /// The permanent zone holding atoms.
    #[must_use]
    pub const fn atoms_zone(&self) -> ZoneId {
        self.atoms
    }

    /// Zone `id`, if it exists.
    #[must_use]
    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.get(id)
    }

    /// All zones.
    #[must_use]
    pub const fn zones(&self) -> &ZoneTable {
        &self.zones
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocates a tenured cell with `slots` null slots.
    ///
    /// # Errors
    ///
    /// `NoSuchZone`, `UnknownKind`, `TooManySlots` for bad arguments;
    /// `OutOfMemory` if the pool is exhausted even after a full collection.
    pub fn allocate(&mut self, zone: ZoneId, kind: KindId, slots: usize) -> Result<CellPtr, GcError> {
        self.check_alloc(zone, kind, slots)?;
        self.run_zeal(false)?;
        self.allocate_tenured(zone, kind, slots)
    }

    /// Allocates a young cell, running a minor collection if the nursery is
    /// full.
    ///
    /// Atoms, weak maps, kinds with finalizers and cells over the nursery
    /// object limit are allocated tenured, as is everything while the
    /// nursery is disabled.
    ///
    /// # Errors
    ///
    /// As [`allocate`](Self::allocate).
    pub fn allocate_young(
        &mut self,
        zone: ZoneId,
        kind: KindId,
        slots: usize,
    ) -> Result<CellPtr, GcError> {
        self.check_alloc(zone, kind, slots)?;
        let bytes = cell_words(slots) * WORD_SIZE;
        let tenured = zone == self.atoms
            || !self.nursery.is_enabled()
            || kind == KindId::WEAK_MAP
            || self.kinds.finalizer(kind).is_some()
            || bytes > self.config.nursery_object_limit();
        if tenured {
            self.run_zeal(false)?;
            return self.allocate_tenured(zone, kind, slots);
        }

        self.run_zeal(true)?;
        if let Some(ptr) = self.nursery.alloc(zone, kind, slots) {
            return Ok(ptr);
        }
        self.collect_minor(GcReason::NurseryFull)?;
        self.nursery
            .alloc(zone, kind, slots)
            .ok_or(GcError::OutOfMemory { zone, bytes })
    }

    fn check_alloc(&self, zone: ZoneId, kind: KindId, slots: usize) -> Result<(), GcError> {
        if slots > MAX_SLOTS {
            return Err(GcError::TooManySlots(slots));
        }
        if self.kinds.get(kind).is_none() {
            return Err(GcError::UnknownKind(kind.index()));
        }
        if self.zones.get(zone).is_none() {
            return Err(GcError::NoSuchZone(zone));
        }
        Ok(())
    }

    fn allocate_tenured(&mut self, zone: ZoneId, kind: KindId, slots: usize) -> Result<CellPtr, GcError> {
        if let Some(ptr) = self.try_allocate_tenured(zone, kind, slots) {
            return Ok(ptr);
        }
        let bytes = cell_words(slots) * WORD_SIZE;
        self.collect_for_oom(bytes);
        self.try_allocate_tenured(zone, kind, slots)
            .ok_or(GcError::OutOfMemory { zone, bytes })
    }

    fn try_allocate_tenured(&mut self, zone: ZoneId, kind: KindId, slots: usize) -> Option<CellPtr> {
        self.zones.get_mut(zone)?.allocate(kind, slots, &self.pool)
    }

    /// Last-ditch full collection before reporting `OutOfMemory`. Any
    /// active cycle is finished first.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub(crate) fn collect_for_oom(&mut self, bytes: usize) {
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_emergency(bytes);
        self.collect_atomic(GcScope::Full, GcReason::OutOfMemory);
    }

    // ========================================================================
    // Cell access
    // ========================================================================

    /// Reads slot `slot` of `ptr`.
    ///
    /// # Errors
    ///
    /// `StaleCell` for a dead pointer, `SlotOutOfBounds` for a bad index.
    pub fn get_slot(&self, ptr: CellPtr, slot: usize) -> Result<Value, GcError> {
        let cell = self.cell_words(ptr).ok_or(GcError::StaleCell(ptr))?;
        let len = header_of(cell).slot_count();
        if slot >= len {
            return Err(GcError::SlotOutOfBounds { cell: ptr, slot, len });
        }
        Ok(cell[slot + 1])
    }

    /// Number of slots of `ptr`.
    ///
    /// # Errors
    ///
    /// `StaleCell` for a dead pointer.
    pub fn slot_count(&self, ptr: CellPtr) -> Result<usize, GcError> {
        self.cell_words(ptr)
            .map(|cell| header_of(cell).slot_count())
            .ok_or(GcError::StaleCell(ptr))
    }

    /// Kind of `ptr`.
    ///
    /// # Errors
    ///
    /// `StaleCell` for a dead pointer.
    pub fn kind_of(&self, ptr: CellPtr) -> Result<KindId, GcError> {
        self.cell_words(ptr)
            .map(|cell| header_of(cell).kind())
            .ok_or(GcError::StaleCell(ptr))
    }

    /// Zone of `ptr`. Young cells report the zone they will be promoted
    /// into.
    ///
    /// # Errors
    ///
    /// `StaleCell` for a dead pointer.
    pub fn zone_of(&self, ptr: CellPtr) -> Result<ZoneId, GcError> {
        if !self.is_alive(ptr) {
            return Err(GcError::StaleCell(ptr));
        }
        self.zone_of_ptr(ptr).ok_or(GcError::StaleCell(ptr))
    }

    /// Whether `ptr` names an allocated cell. Young pointers from an earlier
    /// nursery epoch are never alive.
    #[must_use]
    pub fn is_alive(&self, ptr: CellPtr) -> bool {
        self.cell_words(ptr).is_some()
    }

    pub(crate) fn zone_of_ptr(&self, ptr: CellPtr) -> Option<ZoneId> {
        ptr.tenured_zone().or_else(|| self.nursery.zone_of(ptr))
    }

    pub(crate) fn cell_words(&self, ptr: CellPtr) -> Option<&[Value]> {
        if ptr.is_nursery() {
            self.nursery.cell(ptr)
        } else {
            self.zones.cell(ptr)
        }
    }

    pub(crate) fn cell_words_mut(&mut self, ptr: CellPtr) -> Option<&mut [Value]> {
        if ptr.is_nursery() {
            self.nursery.cell_mut(ptr)
        } else {
            self.zones.cell_mut(ptr)
        }
    }

    /// Strong edges of `ptr` in slot order.
    pub(crate) fn edges_of(&self, ptr: CellPtr, mode: TraceMode) -> Vec<CellPtr> {
        let mut edges = Vec::new();
        let Some(cell) = self.cell_words(ptr) else {
            return edges;
        };
        let header = header_of(cell);
        let Some(slots) = cell.get(1..=header.slot_count()) else {
            return edges;
        };
        let mut slots = slots.to_vec();
        let trace = self.kinds.trace_fn(header.kind());
        trace(&mut slots, &mut EdgeCollector::new(mode, &mut edges));
        edges
    }

    /// Allocated tenured cells of `zone`.
    pub(crate) fn tenured_cells_of(&self, zone: ZoneId) -> Vec<CellPtr> {
        let Some(z) = self.zones.get(zone) else {
            return Vec::new();
        };
        let mut cells = Vec::new();
        for idx in z.arena_ids() {
            let Some(arena) = z.arena(idx) else {
                continue;
            };
            cells.extend(
                arena
                    .allocated_slots()
                    .filter_map(|slot| u16::try_from(slot).ok())
                    .map(|slot| CellPtr::tenured(zone, idx, slot)),
            );
        }
        cells
    }

    /// Calls `visit` once for every cell reachable from `root`, `root`
    /// included. Returns the number of cells visited.
    ///
    /// # Errors
    ///
    /// `StaleCell` if `root` is dead.
    pub fn trace(&self, root: CellPtr, mut visit: impl FnMut(CellPtr)) -> Result<usize, GcError> {
        if !self.is_alive(root) {
            return Err(GcError::StaleCell(root));
        }
        let mut visited: FxHashSet<CellPtr> = FxHashSet::default();
        let mut stack = vec![root];
        while let Some(ptr) = stack.pop() {
            if !visited.insert(ptr) {
                continue;
            }
            visit(ptr);
            stack.extend(
                self.edges_of(ptr, TraceMode::Visiting)
                    .into_iter()
                    .filter(|&edge| !visited.contains(&edge) && self.is_alive(edge)),
            );
        }
        Ok(visited.len())
    }

    // ========================================================================
    // Roots
    // ========================================================================

    /// Roots `ptr`.
    pub fn add_root(&mut self, ptr: CellPtr) -> RootId {
        self.roots.add(ptr)
    }

    /// Unroots `id`, returning the cell's current location.
    pub fn remove_root(&mut self, id: RootId) -> Option<CellPtr> {
        self.roots.remove(id)
    }

    /// Current location of the cell rooted by `id`.
    #[must_use]
    pub fn root(&self, id: RootId) -> Option<CellPtr> {
        self.roots.get(id)
    }

    /// Re-points an existing root.
    pub fn set_root(&mut self, id: RootId, ptr: CellPtr) -> bool {
        self.roots.set(id, ptr)
    }

    /// Opens a root scope; see [`RootTable::push_frame`].
    pub fn push_root_frame(&mut self) {
        self.roots.push_frame();
    }

    /// Unroots everything rooted since the matching
    /// [`push_root_frame`](Self::push_root_frame).
    pub fn pop_root_frame(&mut self) {
        self.roots.pop_frame();
    }

    /// The root table.
    #[must_use]
    pub const fn roots(&self) -> &RootTable {
        &self.roots
    }

    // ========================================================================
    // Side tables and statistics
    // ========================================================================

    /// Registered cross-zone edges.
    #[must_use]
    pub const fn cross_zone_edges(&self) -> &CrossZoneTable {
        &self.cross_zone
    }

    /// Tenured cells remembered as holding young pointers.
    #[must_use]
    pub const fn store_buffer(&self) -> &StoreBuffer {
        &self.store_buffer
    }

    /// The young generation.
    #[must_use]
    pub const fn nursery(&self) -> &Nursery {
        &self.nursery
    }

    /// Decommits pool chunks with no pages in use. Returns the bytes handed
    /// back to the OS.
    pub fn decommit_free_pages(&mut self) -> usize {
        self.pool.lock().decommit_idle()
    }

    /// Arena pages currently handed out to zones.
    #[must_use]
    pub fn pages_in_use(&self) -> usize {
        self.pool.lock().pages_in_use()
    }

    /// Tenured bytes handed out to zones, large cells included.
    #[must_use]
    pub fn heap_bytes_in_use(&self) -> usize {
        self.pool.lock().bytes_in_use()
    }

    /// Bytes reserved from the OS for arena chunks.
    #[must_use]
    pub fn heap_bytes_reserved(&self) -> usize {
        self.pool.lock().reserved_bytes()
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub const fn last_gc_metrics(&self) -> GcMetrics {
        self.metrics.last()
    }

    /// Cumulative counters.
    #[must_use]
    pub const fn stats(&self) -> GcStats {
        self.metrics.stats()
    }

    /// Recent collections.
    #[must_use]
    pub const fn gc_history(&self) -> &GcHistory {
        self.metrics.history()
    }

    /// Rewrites every off-heap reference through `relocation`.
    pub(crate) fn remap_references(&mut self, relocation: &Relocation) {
        let resolve = |ptr: CellPtr| relocation.resolve(ptr);
        self.roots.remap(resolve);
        self.store_buffer.remap(resolve);
        self.cross_zone.remap(resolve);
        self.weak_maps.remap(resolve);
        for zone in self.zones.iter_mut() {
            zone.atom_marks = zone.atom_marks.drain().filter_map(resolve).collect();
        }
        for observer in &mut self.observers {
            *observer = observer.and_then(resolve);
        }
        let pending: Vec<CellPtr> = std::iter::from_fn(|| self.barrier_log.pop()).collect();
        for ptr in pending.into_iter().filter_map(resolve) {
            self.barrier_log.push(ptr);
        }
        self.incremental.remap(resolve);
    }
}

fn header_of(cell: &[Value]) -> Header {
    Header::from_value(cell.first().copied().unwrap_or(Value::NULL))
}

/// Runs `cell`'s trace hook over its slots with `tracer`, which may rewrite
/// them.
pub(crate) fn patch_cell(kinds: &KindRegistry, cell: &mut [Value], tracer: &mut dyn Tracer) {
    let header = header_of(cell);
    let trace = kinds.trace_fn(header.kind());
    if let Some(slots) = cell.get_mut(1..=header.slot_count()) {
        trace(slots, tracer);
    }
}

impl Drop for GcRuntime {
    /// Final collection: every root and side table is dropped, so every
    /// cell dies and every finalizer runs.
    fn drop(&mut self) {
        self.zeal = Zeal::default();
        self.finish_collection();
        self.roots.clear();
        self.cross_zone = CrossZoneTable::default();
        self.observers.clear();
        self.store_buffer.clear();
        for zone in self.zones.iter_mut() {
            zone.atom_marks.clear();
        }
        self.nursery.reset();
        self.collect_atomic(GcScope::Full, GcReason::Shutdown);
        for zone in self.zones.iter_mut() {
            zone.release_all(&self.pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_runtime_has_only_atoms_zone() {
        let rt = GcRuntime::with_defaults().unwrap();
        assert_eq!(rt.zones().len(), 1);
        assert!(rt.zone(rt.atoms_zone()).unwrap().is_atoms());
        assert_eq!(rt.pages_in_use(), 0);
    }

    #[test]
    fn test_edges_follow_slot_order() {
        let mut rt = GcRuntime::with_defaults().unwrap();
        let zone = rt.create_zone().unwrap();
        let holder = rt.allocate(zone, KindId::OBJECT, 3).unwrap();
        let a = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
        let b = rt.allocate(zone, KindId::OBJECT, 0).unwrap();
        rt.store(holder, 0, Value::cell(b)).unwrap();
        rt.store(holder, 1, Value::int(7)).unwrap();
        rt.store(holder, 2, Value::cell(a)).unwrap();

        assert_eq!(rt.edges_of(holder, TraceMode::Visiting), vec![b, a]);
        assert_eq!(rt.get_slot(holder, 1).unwrap().as_int(), Some(7));
        assert!(matches!(
            rt.get_slot(holder, 3),
            Err(GcError::SlotOutOfBounds { slot: 3, len: 3, .. })
        ));
    }

    #[test]
    fn test_tenured_cells_of_lists_allocated_cells() {
        let mut rt = GcRuntime::with_defaults().unwrap();
        let zone = rt.create_zone().unwrap();
        let cells: Vec<CellPtr> = (0..5)
            .map(|_| rt.allocate(zone, KindId::OBJECT, 1).unwrap())
            .collect();
        let mut listed = rt.tenured_cells_of(zone);
        listed.sort_by_key(|p| p.to_bits());
        let mut expected = cells;
        expected.sort_by_key(|p| p.to_bits());
        assert_eq!(listed, expected);
    }
}
