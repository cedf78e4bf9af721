//! Zones: independently collectable partitions of the tenured heap.
//!
//! Every tenured cell belongs to exactly one zone and lives in one of that
//! zone's arenas. A collection selects a set of zones; cells in other zones
//! are neither marked nor swept. Pointers from an uncollected zone into a
//! collected one are kept alive through the [`CrossZoneTable`].

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell::{cell_words, CellPtr, Header, KindId, MarkColor, Value, MAX_ARENAS_PER_ZONE, WORD_SIZE};
use crate::heap::{size_class_for, Arena, PagePool, NUM_SIZE_CLASSES};

/// Identity of a zone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneId(pub(crate) u16);

impl ZoneId {
    /// Table index of this zone.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone#{}", self.0)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone#{}", self.0)
    }
}

/// An ordered set of zones.
pub type ZoneSet = BTreeSet<ZoneId>;

/// Per-zone collection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZoneGcState {
    /// Not part of the current collection.
    #[default]
    Idle,
    /// Being marked; the write barrier is armed.
    Mark,
    /// Being swept.
    Sweep,
    /// Being compacted.
    Compact,
}

impl ZoneGcState {
    /// Cells allocated in this state start out black.
    #[must_use]
    pub const fn allocates_black(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

#[derive(Debug, Default)]
struct ArenaList {
    arenas: Vec<u32>,
    cursor: usize,
}

/// A zone and its arenas.
pub struct Zone {
    id: ZoneId,
    is_atoms: bool,
    arenas: Vec<Option<Arena>>,
    free_arena_ids: Vec<u32>,
    classes: [ArenaList; NUM_SIZE_CLASSES],
    large: Vec<u32>,
    pub(crate) needs_barrier: bool,
    pub(crate) gc_state: ZoneGcState,
    pub(crate) gc_generation: u64,
    pub(crate) scheduled: bool,
    pub(crate) allocated_since_gc: usize,
    /// Atoms referenced from this zone's cells.
    pub(crate) atom_marks: FxHashSet<CellPtr>,
}

impl Zone {
    pub(crate) fn new(id: ZoneId, is_atoms: bool) -> Self {
        Self {
            id,
            is_atoms,
            arenas: Vec::new(),
            free_arena_ids: Vec::new(),
            classes: Default::default(),
            large: Vec::new(),
            needs_barrier: false,
            gc_state: ZoneGcState::Idle,
            gc_generation: 0,
            scheduled: false,
            allocated_since_gc: 0,
            atom_marks: FxHashSet::default(),
        }
    }

    /// This zone's id.
    #[must_use]
    pub const fn id(&self) -> ZoneId {
        self.id
    }

    /// Whether this is the runtime's atoms zone.
    #[must_use]
    pub const fn is_atoms(&self) -> bool {
        self.is_atoms
    }

    /// Whether stores into this zone's cells go through the marking barrier.
    #[must_use]
    pub const fn needs_barrier(&self) -> bool {
        self.needs_barrier
    }

    /// Collection state of this zone.
    #[must_use]
    pub const fn gc_state(&self) -> ZoneGcState {
        self.gc_state
    }

    /// Number of completed collections of this zone.
    #[must_use]
    pub const fn gc_generation(&self) -> u64 {
        self.gc_generation
    }

    /// Bytes allocated (or promoted) into this zone since it was last collected.
    #[must_use]
    pub const fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc
    }

    /// Arenas currently owned.
    #[must_use]
    pub fn arena_count(&self) -> usize {
        self.arenas.iter().flatten().count()
    }

    /// Allocated cells across all arenas.
    #[must_use]
    pub fn live_cells(&self) -> usize {
        self.arenas.iter().flatten().map(Arena::live).sum()
    }

    /// Bytes held by allocated cells.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.arenas
            .iter()
            .flatten()
            .map(|a| a.live() * a.cell_words() * WORD_SIZE)
            .sum()
    }

    /// Bytes of arena memory held by this zone.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.arenas.iter().flatten().map(Arena::footprint).sum()
    }

    /// Fraction of small-arena cells that are free.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fragmentation(&self) -> f64 {
        let (free, capacity) = self
            .arenas
            .iter()
            .flatten()
            .filter(|a| a.size_class().is_some())
            .fold((0, 0), |(f, c), a| (f + a.free(), c + a.capacity()));
        if capacity == 0 {
            0.0
        } else {
            free as f64 / capacity as f64
        }
    }

    /// Allocates a cell with its header written and slots null.
    pub(crate) fn allocate(
        &mut self,
        kind: KindId,
        slots: usize,
        pool: &Mutex<PagePool>,
    ) -> Option<CellPtr> {
        let slot_count = u16::try_from(slots).ok()?;
        let words = cell_words(slots);
        let (arena_idx, slot) = match size_class_for(words * WORD_SIZE) {
            Some(class) => self.alloc_small(class, pool)?,
            None => self.alloc_large(words, pool)?,
        };
        let color = if self.gc_state.allocates_black() {
            MarkColor::Black
        } else {
            MarkColor::White
        };
        let id = self.id;
        let arena = self.arenas.get_mut(arena_idx as usize)?.as_mut()?;
        arena.cell_mut(slot)?[0] = Header::new(kind, slot_count, id).to_value();
        arena.set_color(slot, color);
        self.allocated_since_gc += arena.cell_words() * WORD_SIZE;
        Some(CellPtr::tenured(id, arena_idx, u16::try_from(slot).ok()?))
    }

    fn alloc_small(&mut self, class: usize, pool: &Mutex<PagePool>) -> Option<(u32, usize)> {
        // Scan from the cursor to the end, then wrap: arenas behind the
        // cursor regain free cells as they are swept.
        let list = &mut self.classes[class];
        let len = list.arenas.len();
        for step in 0..len {
            let pos = (list.cursor + step) % len;
            let idx = list.arenas[pos];
            if let Some(arena) = self.arenas[idx as usize].as_mut() {
                if let Some(slot) = arena.try_alloc() {
                    list.cursor = pos;
                    return Some((idx, slot));
                }
            }
        }

        let (page, base) = pool.lock().acquire_page()?;
        let idx = self.insert_arena(Arena::new_small(page, base, class), pool)?;
        let list = &mut self.classes[class];
        list.arenas.push(idx);
        list.cursor = list.arenas.len() - 1;
        let slot = self.arenas[idx as usize].as_mut()?.try_alloc()?;
        Some((idx, slot))
    }

    fn alloc_large(&mut self, words: usize, pool: &Mutex<PagePool>) -> Option<(u32, usize)> {
        let mapping = pool.lock().acquire_large(words * WORD_SIZE)?;
        let arena = Arena::new_large(mapping, words)?;
        let idx = self.insert_arena(arena, pool)?;
        self.large.push(idx);
        let slot = self.arenas[idx as usize].as_mut()?.try_alloc()?;
        Some((idx, slot))
    }

    fn insert_arena(&mut self, arena: Arena, pool: &Mutex<PagePool>) -> Option<u32> {
        if let Some(idx) = self.free_arena_ids.pop() {
            self.arenas[idx as usize] = Some(arena);
            return Some(idx);
        }
        if self.arenas.len() >= MAX_ARENAS_PER_ZONE {
            pool.lock().release_arena(arena);
            return None;
        }
        let idx = u32::try_from(self.arenas.len()).ok()?;
        self.arenas.push(Some(arena));
        Some(idx)
    }

    /// Removes an arena and returns its memory to the pool.
    pub(crate) fn release_arena(&mut self, idx: u32, pool: &Mutex<PagePool>) {
        let Some(arena) = self.arenas.get_mut(idx as usize).and_then(Option::take) else {
            return;
        };
        match arena.size_class() {
            Some(class) => {
                let list = &mut self.classes[class];
                if let Some(pos) = list.arenas.iter().position(|&a| a == idx) {
                    list.arenas.remove(pos);
                    if pos < list.cursor {
                        list.cursor -= 1;
                    }
                }
                list.cursor = list.cursor.min(list.arenas.len());
            }
            None => self.large.retain(|&a| a != idx),
        }
        self.free_arena_ids.push(idx);
        pool.lock().release_arena(arena);
    }

    /// Frees a cell that was allocated but never handed out.
    pub(crate) fn free_unpublished(&mut self, ptr: CellPtr) {
        let Some((_, arena, slot)) = ptr.tenured_parts() else {
            return;
        };
        let Some(arena) = self.arena_mut(arena) else {
            return;
        };
        let bytes = arena.cell_words() * WORD_SIZE;
        arena.release(slot as usize);
        self.allocated_since_gc = self.allocated_since_gc.saturating_sub(bytes);
    }

    /// Releases every arena, regardless of contents.
    pub(crate) fn release_all(&mut self, pool: &Mutex<PagePool>) {
        for idx in self.arena_ids() {
            self.release_arena(idx, pool);
        }
    }

    pub(crate) fn arena(&self, idx: u32) -> Option<&Arena> {
        self.arenas.get(idx as usize)?.as_ref()
    }

    pub(crate) fn arena_mut(&mut self, idx: u32) -> Option<&mut Arena> {
        self.arenas.get_mut(idx as usize)?.as_mut()
    }

    /// Ids of all arenas currently owned, in index order.
    pub(crate) fn arena_ids(&self) -> Vec<u32> {
        self.arenas
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_some())
            .filter_map(|(i, _)| u32::try_from(i).ok())
            .collect()
    }

    /// Arenas of one size class.
    pub(crate) fn class_arenas(&self, class: usize) -> &[u32] {
        &self.classes[class].arenas
    }

    /// Free cells in existing arenas of `class`.
    pub(crate) fn free_slots(&self, class: usize) -> usize {
        self.classes[class]
            .arenas
            .iter()
            .filter_map(|&i| self.arena(i))
            .map(Arena::free)
            .sum()
    }

    /// Restarts allocation scans from the first arena of every class.
    pub(crate) fn reset_alloc_cursors(&mut self) {
        for list in &mut self.classes {
            list.cursor = 0;
        }
    }

    pub(crate) fn clear_marks(&mut self) {
        for arena in self.arenas.iter_mut().flatten() {
            arena.clear_marks();
        }
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.id)
            .field("is_atoms", &self.is_atoms)
            .field("arenas", &self.arena_count())
            .field("live_cells", &self.live_cells())
            .field("gc_state", &self.gc_state)
            .field("gc_generation", &self.gc_generation)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ZoneTable
// ============================================================================

/// All zones of a runtime. Zone ids are never reused.
#[derive(Debug, Default)]
pub struct ZoneTable {
    zones: Vec<Option<Zone>>,
}

impl ZoneTable {
    pub(crate) fn create(&mut self, is_atoms: bool) -> Option<ZoneId> {
        let id = ZoneId(u16::try_from(self.zones.len()).ok()?);
        self.zones.push(Some(Zone::new(id, is_atoms)));
        Some(id)
    }

    pub(crate) fn remove(&mut self, id: ZoneId) -> Option<Zone> {
        self.zones.get_mut(id.index())?.take()
    }

    /// Zone `id`, if it exists.
    #[must_use]
    pub fn get(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.get(id.index())?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ZoneId) -> Option<&mut Zone> {
        self.zones.get_mut(id.index())?.as_mut()
    }

    /// Live zones in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Zone> {
        self.zones.iter_mut().flatten()
    }

    /// Ids of live zones.
    #[must_use]
    pub fn ids(&self) -> Vec<ZoneId> {
        self.iter().map(Zone::id).collect()
    }

    /// Number of live zones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// No live zones.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Words of an allocated tenured cell, header included.
    pub(crate) fn cell(&self, ptr: CellPtr) -> Option<&[Value]> {
        let (zone, arena, slot) = ptr.tenured_parts()?;
        self.get(zone)?.arena(arena)?.cell(slot as usize)
    }

    pub(crate) fn cell_mut(&mut self, ptr: CellPtr) -> Option<&mut [Value]> {
        let (zone, arena, slot) = ptr.tenured_parts()?;
        self.get_mut(zone)?.arena_mut(arena)?.cell_mut(slot as usize)
    }

    /// Mark color of an allocated tenured cell.
    pub(crate) fn color(&self, ptr: CellPtr) -> Option<MarkColor> {
        let (zone, arena, slot) = ptr.tenured_parts()?;
        let arena = self.get(zone)?.arena(arena)?;
        arena
            .is_allocated(slot as usize)
            .then(|| arena.color(slot as usize))
    }

    pub(crate) fn set_color(&mut self, ptr: CellPtr, color: MarkColor) -> bool {
        let Some((zone, arena, slot)) = ptr.tenured_parts() else {
            return false;
        };
        match self.get_mut(zone).and_then(|z| z.arena_mut(arena)) {
            Some(arena) if arena.is_allocated(slot as usize) => {
                arena.set_color(slot as usize, color);
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// CrossZoneTable
// ============================================================================

/// A pointer from a cell in one zone to a cell in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CrossZoneEdge {
    /// Holder of the pointer.
    pub from: CellPtr,
    /// Referenced cell.
    pub to: CellPtr,
    /// Zone of `to`.
    pub to_zone: ZoneId,
}

/// Cross-zone edges, grouped by the zone of the holder.
///
/// When a zone is collected without the holder's zone, every edge into it
/// is an implicit root. The set is a conservative superset of the real
/// edges: it is rebuilt for a zone each time that zone is marked.
#[derive(Debug, Default)]
pub struct CrossZoneTable {
    outgoing: FxHashMap<ZoneId, FxHashSet<CrossZoneEdge>>,
}

impl CrossZoneTable {
    /// Records `from -> to`. Returns whether the edge was new.
    pub(crate) fn register(&mut self, from_zone: ZoneId, edge: CrossZoneEdge) -> bool {
        if from_zone == edge.to_zone {
            return false;
        }
        self.outgoing.entry(from_zone).or_default().insert(edge)
    }

    /// Targets of edges whose holder zone is not collected and whose target
    /// zone is.
    pub(crate) fn implicit_roots(&self, collecting: &ZoneSet) -> Vec<CellPtr> {
        self.outgoing
            .iter()
            .filter(|(zone, _)| !collecting.contains(zone))
            .flat_map(|(_, edges)| edges.iter())
            .filter(|edge| collecting.contains(&edge.to_zone))
            .map(|edge| edge.to)
            .collect()
    }

    /// Replaces every edge held by `zone`.
    pub(crate) fn replace_outgoing(&mut self, zone: ZoneId, edges: FxHashSet<CrossZoneEdge>) {
        if edges.is_empty() {
            self.outgoing.remove(&zone);
        } else {
            self.outgoing.insert(zone, edges);
        }
    }

    /// Drops every edge touching `zone`.
    pub(crate) fn remove_zone(&mut self, zone: ZoneId) {
        self.outgoing.remove(&zone);
        for edges in self.outgoing.values_mut() {
            edges.retain(|e| e.to_zone != zone);
        }
    }

    /// Rewrites both ends of every edge; edges with a dead end are dropped.
    pub(crate) fn remap(&mut self, mut resolve: impl FnMut(CellPtr) -> Option<CellPtr>) {
        for edges in self.outgoing.values_mut() {
            *edges = edges
                .drain()
                .filter_map(|e| {
                    Some(CrossZoneEdge {
                        from: resolve(e.from)?,
                        to: resolve(e.to)?,
                        to_zone: e.to_zone,
                    })
                })
                .collect();
        }
        self.outgoing.retain(|_, edges| !edges.is_empty());
    }

    /// Edges held by `zone`.
    pub fn outgoing(&self, zone: ZoneId) -> impl Iterator<Item = &CrossZoneEdge> {
        self.outgoing.get(&zone).into_iter().flatten()
    }

    /// All edges.
    pub fn iter(&self) -> impl Iterator<Item = (ZoneId, &CrossZoneEdge)> {
        self.outgoing
            .iter()
            .flat_map(|(&zone, edges)| edges.iter().map(move |e| (zone, e)))
    }

    /// Total number of edges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outgoing.values().map(FxHashSet::len).sum()
    }

    /// No edges recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
