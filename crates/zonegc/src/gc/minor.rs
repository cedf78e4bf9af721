//! Minor collection: evacuating the nursery.
//!
//! Reachable young cells are copied into their zones' tenured arenas and
//! every reference to them is patched. Every copy gets its tenured cell
//! before anything moves, so once copying starts it cannot fail.

use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell::{CellPtr, MarkColor, WORD_SIZE};
use crate::error::GcError;
use crate::heap::{cells_per_arena, size_class_for, ARENA_SIZE};
use crate::metrics::{CollectionType, GcMetrics, GcReason};
use crate::runtime::{patch_cell, GcRuntime};
use crate::trace::{ForwardingTracer, Relocation, TraceMode};
use crate::zone::{ZoneGcState, ZoneId};

/// Nursery cells reached from the minor-collection roots, in discovery
/// order.
struct Reached {
    cells: Vec<CellPtr>,
}

/// Tenured destination reserved for one surviving young cell.
struct Placement {
    from: CellPtr,
    to: CellPtr,
    words: usize,
}

impl GcRuntime {
    /// Evacuates the nursery.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the survivors do not fit in the tenured heap even
    /// after a full collection. The nursery is left untouched in that case.
    pub fn minor_gc(&mut self) -> Result<(), GcError> {
        self.collect_minor(GcReason::Api)
    }

    pub(crate) fn collect_minor(&mut self, reason: GcReason) -> Result<(), GcError> {
        let start = Instant::now();
        let _span = crate::tracing::trace_phase(crate::tracing::GcPhase::Minor);
        let used_bytes = self.nursery.used_bytes();
        let young_cells = self.nursery.cell_count();

        let mut reached = self.nursery_reachable();
        let mut escalated = false;
        if let Err((_, bytes)) = self.check_headroom(&reached) {
            self.collect_for_oom(bytes);
            escalated = true;
            reached = self.nursery_reachable();
        }
        let placements = match self.place_survivors(&reached) {
            Ok(placements) => placements,
            Err((_, bytes)) if !escalated => {
                self.collect_for_oom(bytes);
                reached = self.nursery_reachable();
                self.place_survivors(&reached)
                    .map_err(|(zone, bytes)| GcError::OutOfMemory { zone, bytes })?
            }
            Err((zone, bytes)) => return Err(GcError::OutOfMemory { zone, bytes }),
        };

        let (relocation, promoted_bytes) = self.promote(&placements);

        let mut tracer = ForwardingTracer::new(&relocation);
        for &from in &reached.cells {
            if let Some(to) = relocation.get(from) {
                if let Some(cell) = self.zones.cell_mut(to) {
                    patch_cell(&self.kinds, cell, &mut tracer);
                }
            }
        }
        let holders: Vec<CellPtr> = self.store_buffer.iter().collect();
        for holder in holders {
            if let Some(cell) = self.zones.cell_mut(holder) {
                patch_cell(&self.kinds, cell, &mut tracer);
            }
        }
        self.remap_references(&relocation);

        self.store_buffer.clear();
        self.incremental.nursery_visited.clear();
        self.nursery.reset();

        let promoted = reached.cells.len();
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_minor(promoted, promoted_bytes, reason.as_str());

        let duration = start.elapsed();
        self.metrics.record(GcMetrics {
            duration,
            pause_total: duration,
            max_pause: duration,
            bytes_reclaimed: used_bytes.saturating_sub(promoted_bytes),
            bytes_surviving: promoted_bytes,
            cells_reclaimed: young_cells.saturating_sub(promoted),
            cells_surviving: promoted,
            collection_type: CollectionType::Minor,
            reason,
            cells_promoted: promoted,
            ..GcMetrics::new()
        });

        if self.zeal.checks_heap() {
            self.check_heap_or_abort();
        }
        Ok(())
    }

    /// Young cells reachable from roots, store-buffer holders, cross-zone
    /// edges held by tenured cells, and weak map entries.
    fn nursery_reachable(&self) -> Reached {
        let mut visited: FxHashSet<CellPtr> = FxHashSet::default();
        let mut stack: Vec<CellPtr> = Vec::new();
        let mut cells = Vec::new();

        let mut seeds: Vec<CellPtr> = self.roots.iter().collect();
        for holder in self.store_buffer.iter() {
            seeds.extend(self.edges_of(holder, TraceMode::Moving));
        }
        seeds.extend(
            self.cross_zone
                .iter()
                .filter(|(_, e)| e.from.is_tenured())
                .map(|(_, e)| e.to),
        );
        seeds.extend(
            self.weak_maps
                .iter()
                .filter(|(_, key, _)| key.is_tenured())
                .filter_map(|(_, _, value)| value.as_cell()),
        );
        for seed in seeds {
            if seed.is_nursery() && self.nursery.contains(seed) && visited.insert(seed) {
                stack.push(seed);
            }
        }

        loop {
            while let Some(ptr) = stack.pop() {
                cells.push(ptr);
                for edge in self.edges_of(ptr, TraceMode::Moving) {
                    if edge.is_nursery() && self.nursery.contains(edge) && visited.insert(edge) {
                        stack.push(edge);
                    }
                }
            }

            // Entries keyed by young cells hold their value only once the
            // key has been reached.
            for (_, key, value) in self.weak_maps.iter() {
                let Some(value) = value.as_cell() else {
                    continue;
                };
                if key.is_nursery()
                    && visited.contains(&key)
                    && value.is_nursery()
                    && self.nursery.contains(value)
                    && visited.insert(value)
                {
                    stack.push(value);
                }
            }
            if stack.is_empty() {
                break;
            }
        }
        Reached { cells }
    }

    /// Checks that the page pool can take every reached cell. On shortfall,
    /// returns the first zone that would not fit and the bytes it needs.
    fn check_headroom(&self, reached: &Reached) -> Result<(), (ZoneId, usize)> {
        let mut demand: FxHashMap<(ZoneId, usize), usize> = FxHashMap::default();
        for &ptr in &reached.cells {
            let Some(header) = self.nursery.header(ptr) else {
                continue;
            };
            let Some(class) = size_class_for(header.words() * WORD_SIZE) else {
                continue;
            };
            *demand.entry((header.zone(), class)).or_default() += 1;
        }

        let available = self.pool.lock().available_pages();
        let mut pages = 0;
        let mut short: Option<(ZoneId, usize)> = None;
        for (&(zone, class), &count) in &demand {
            let free = self.zones.get(zone).map_or(0, |z| z.free_slots(class));
            let extra = count.saturating_sub(free);
            let needed = extra.div_ceil(cells_per_arena(class));
            pages += needed;
            if pages > available && short.is_none() {
                short = Some((zone, needed * ARENA_SIZE));
            }
        }
        match short {
            Some(short) => Err(short),
            None => Ok(()),
        }
    }

    /// Reserves a tenured cell for every reached young cell without copying
    /// anything. On shortfall the reservations are freed again and the zone
    /// and cell size that did not fit are returned.
    fn place_survivors(&mut self, reached: &Reached) -> Result<Vec<Placement>, (ZoneId, usize)> {
        let mut placements = Vec::with_capacity(reached.cells.len());
        for &from in &reached.cells {
            let Some(header) = self.nursery.header(from) else {
                continue;
            };
            let zone_id = header.zone();
            let Some(zone) = self.zones.get_mut(zone_id) else {
                continue;
            };
            match zone.allocate(header.kind(), header.slot_count(), &self.pool) {
                Some(to) => placements.push(Placement {
                    from,
                    to,
                    words: header.words(),
                }),
                None => {
                    for placement in &placements {
                        let owner = placement.to.tenured_zone();
                        if let Some(zone) = owner.and_then(|z| self.zones.get_mut(z)) {
                            zone.free_unpublished(placement.to);
                        }
                    }
                    return Err((zone_id, header.words() * WORD_SIZE));
                }
            }
        }
        Ok(placements)
    }

    /// Copies young cells into their reserved tenured cells and leaves
    /// forwarding pointers behind.
    fn promote(&mut self, placements: &[Placement]) -> (Relocation, usize) {
        let mut relocation = Relocation::nursery_eviction();
        let mut bytes = 0;
        for &Placement { from, to, words } in placements {
            if let (Some(src), Some(dst)) = (self.nursery.cell(from), self.zones.cell_mut(to)) {
                dst[1..words].copy_from_slice(&src[1..words]);
            }
            let marking = to
                .tenured_zone()
                .and_then(|z| self.zones.get(z))
                .is_some_and(|z| z.gc_state == ZoneGcState::Mark);
            if marking {
                self.zones.set_color(to, MarkColor::Gray);
                self.incremental.mark_stack.push(to);
            }
            self.nursery.forward(from, to);
            relocation.insert(from, to);
            bytes += words * WORD_SIZE;
        }
        (relocation, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Header, KindId, Value};
    use crate::config::GcConfig;

    fn runtime() -> GcRuntime {
        GcRuntime::new(GcConfig::default()).unwrap()
    }

    #[test]
    fn test_unreached_young_cells_are_not_promoted() {
        let mut rt = runtime();
        let zone = rt.create_zone().unwrap();
        let kept = rt.allocate_young(zone, KindId::OBJECT, 1).unwrap();
        let _garbage = rt.allocate_young(zone, KindId::OBJECT, 1).unwrap();
        let root = rt.add_root(kept);

        let reached = rt.nursery_reachable();
        assert_eq!(reached.cells, vec![kept]);
        assert_eq!(rt.nursery.header(kept).map(Header::slot_count), Some(1));

        rt.minor_gc().unwrap();
        let moved = rt.root(root).unwrap();
        assert!(moved.is_tenured());
        assert_eq!(rt.last_gc_metrics().cells_promoted, 1);
        assert_eq!(rt.last_gc_metrics().cells_reclaimed, 1);
    }

    #[test]
    fn test_young_key_entry_promotes_value_only_with_key() {
        let mut rt = runtime();
        let zone = rt.create_zone().unwrap();
        let map = rt.new_weak_map(zone).unwrap();
        let map_root = rt.add_root(map);
        let key = rt.allocate_young(zone, KindId::OBJECT, 0).unwrap();
        let value = rt.allocate_young(zone, KindId::OBJECT, 0).unwrap();
        rt.weak_map_set(map, key, Value::cell(value)).unwrap();

        assert!(rt.nursery_reachable().cells.is_empty());

        let key_root = rt.add_root(key);
        assert_eq!(rt.nursery_reachable().cells.len(), 2);

        rt.minor_gc().unwrap();
        let map = rt.root(map_root).unwrap();
        let key = rt.root(key_root).unwrap();
        let value = rt.weak_map_get(map, key).unwrap().and_then(Value::as_cell);
        assert!(value.is_some_and(CellPtr::is_tenured));
    }
}
