//! Compaction.
//!
//! For each size class of a zone, the fullest arenas are kept as targets and
//! every cell of the remaining arenas is moved into them. Cells never leave
//! their zone. After the move every edge in the heap, the nursery and the
//! side tables is rewritten, and the emptied arenas go back to the pool.

use crate::cell::{CellPtr, MarkColor, Value};
use crate::heap::{cells_per_arena, NUM_SIZE_CLASSES};
use crate::runtime::{patch_cell, GcRuntime};
use crate::trace::{ForwardingTracer, Relocation};
use crate::zone::{Zone, ZoneId};

/// Splits a class's arenas into `(targets, sources)`, fullest first.
fn plan_class(zone: &Zone, class: usize) -> (Vec<u32>, Vec<u32>) {
    let mut arenas: Vec<(u32, usize)> = zone
        .class_arenas(class)
        .iter()
        .filter_map(|&idx| zone.arena(idx).map(|a| (idx, a.live())))
        .collect();
    arenas.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let live: usize = arenas.iter().map(|&(_, n)| n).sum();
    let keep = live.div_ceil(cells_per_arena(class));
    let (targets, sources) = arenas.split_at(keep.min(arenas.len()));
    (
        targets.iter().map(|&(idx, _)| idx).collect(),
        sources.iter().map(|&(idx, _)| idx).collect(),
    )
}

/// Moves every cell of `sources` into free slots of `targets`.
fn evacuate(zone: &mut Zone, targets: &[u32], sources: &[u32], relocation: &mut Relocation) {
    let id = zone.id();
    let mut target_iter = targets.iter().copied().peekable();
    for &src_idx in sources {
        let slots: Vec<usize> = zone
            .arena(src_idx)
            .map(|a| a.allocated_slots().collect())
            .unwrap_or_default();
        for slot in slots {
            let Some(words) = zone
                .arena(src_idx)
                .and_then(|a| a.cell(slot))
                .map(<[Value]>::to_vec)
            else {
                continue;
            };

            let mut placed = None;
            while let Some(&dst_idx) = target_iter.peek() {
                if let Some(dst_slot) = zone.arena_mut(dst_idx).and_then(|a| a.try_alloc()) {
                    placed = Some((dst_idx, dst_slot));
                    break;
                }
                target_iter.next();
            }
            let Some((dst_idx, dst_slot)) = placed else {
                return;
            };

            if let Some(dst) = zone.arena_mut(dst_idx) {
                if let Some(cell) = dst.cell_mut(dst_slot) {
                    cell.copy_from_slice(&words);
                }
                dst.set_color(dst_slot, MarkColor::Black);
            }
            if let Some(src) = zone.arena_mut(src_idx) {
                src.release(slot);
            }
            if let (Ok(src_slot), Ok(dst_slot16)) = (u16::try_from(slot), u16::try_from(dst_slot)) {
                relocation.insert(
                    CellPtr::tenured(id, src_idx, src_slot),
                    CellPtr::tenured(id, dst_idx, dst_slot16),
                );
            }
        }
    }
}

impl GcRuntime {
    /// Compacts every zone scheduled for compaction. Returns the number of
    /// cells moved.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub(crate) fn compact_zones(&mut self) -> usize {
        let zones: Vec<ZoneId> = self.incremental.compact_zones.clone();
        let mut relocation = Relocation::compaction();
        let mut emptied: Vec<(ZoneId, u32)> = Vec::new();

        for id in zones {
            let Some(zone) = self.zones.get_mut(id) else {
                continue;
            };
            for class in 0..NUM_SIZE_CLASSES {
                let (targets, sources) = plan_class(zone, class);
                if sources.is_empty() {
                    continue;
                }
                evacuate(zone, &targets, &sources, &mut relocation);
                emptied.extend(
                    sources
                        .into_iter()
                        .filter(|&idx| zone.arena(idx).is_some_and(|a| a.is_empty()))
                        .map(|idx| (id, idx)),
                );
            }
        }

        if relocation.is_empty() {
            return 0;
        }
        let patched = self.patch_heap(&relocation);
        self.remap_references(&relocation);
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_compaction(relocation.len(), patched, emptied.len());

        for (id, idx) in emptied {
            if let Some(zone) = self.zones.get_mut(id) {
                zone.release_arena(idx, &self.pool);
                self.incremental.stats.arenas_released += 1;
            }
        }
        relocation.len()
    }

    /// Rewrites every edge of every tenured and young cell. Returns the
    /// number of edges changed.
    fn patch_heap(&mut self, relocation: &Relocation) -> usize {
        let mut tracer = ForwardingTracer::new(relocation);
        for zone in self.zones.iter_mut() {
            for idx in zone.arena_ids() {
                let Some(arena) = zone.arena_mut(idx) else {
                    continue;
                };
                let slots: Vec<usize> = arena.allocated_slots().collect();
                for slot in slots {
                    if let Some(cell) = arena.cell_mut(slot) {
                        patch_cell(&self.kinds, cell, &mut tracer);
                    }
                }
            }
        }
        for ptr in self.nursery.live_cells() {
            if let Some(cell) = self.nursery.cell_mut(ptr) {
                patch_cell(&self.kinds, cell, &mut tracer);
            }
        }
        tracer.patched()
    }
}
