//! Heap verification.
//!
//! Read-only checks run by zeal modes and [`GcRuntime::verify_heap`]. Each
//! returns the first [`Violation`] it finds; callers inside the collector
//! turn a violation into a fatal error.

use std::fmt::Write as _;

use rustc_hash::FxHashSet;

use crate::cell::{CellPtr, MarkColor};
use crate::error::{GcError, Violation, ViolationKind};
use crate::runtime::GcRuntime;
use crate::trace::TraceMode;

impl GcRuntime {
    /// Checks that no black cell of a collected zone points to a white cell
    /// of a collected zone, or to a young cell marking has not reached.
    ///
    /// # Errors
    ///
    /// The first offending edge.
    pub fn verify_tri_color(&self) -> Result<(), Violation> {
        if !self.incremental.is_marking() {
            return Ok(());
        }
        for zone in self.zones.iter() {
            if !self.incremental.zones.contains(&zone.id()) {
                continue;
            }
            for holder in self.tenured_cells_of(zone.id()) {
                if self.zones.color(holder) != Some(MarkColor::Black) {
                    continue;
                }
                for target in self.edges_of(holder, TraceMode::Verifying) {
                    if self.is_unmarked_target(target) {
                        return Err(Violation {
                            kind: ViolationKind::BlackToWhite,
                            holder: Some(holder),
                            target,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn is_unmarked_target(&self, target: CellPtr) -> bool {
        if target.is_nursery() {
            return self.nursery.contains(target)
                && !self.incremental.nursery_visited.contains(&target);
        }
        target
            .tenured_zone()
            .is_some_and(|z| self.incremental.is_collecting(z))
            && self.zones.color(target) == Some(MarkColor::White)
    }

    /// Recomputes reachability from scratch and checks that marking found
    /// every reachable cell of the collected zones.
    ///
    /// # Errors
    ///
    /// The first reachable cell left white.
    pub fn verify_marking(&self) -> Result<(), Violation> {
        let collecting = &self.incremental.zones;
        let mut visited: FxHashSet<CellPtr> = FxHashSet::default();
        let mut stack: Vec<CellPtr> = self.roots.iter().collect();
        stack.extend(self.cross_zone.implicit_roots(collecting));
        if collecting.contains(&self.atoms) {
            stack.extend(
                self.zones
                    .iter()
                    .filter(|z| !collecting.contains(&z.id()))
                    .flat_map(|z| z.atom_marks.iter().copied()),
            );
        }

        let traversed = |ptr: CellPtr| {
            ptr.is_nursery() || ptr.tenured_zone().is_some_and(|z| collecting.contains(&z))
        };
        loop {
            while let Some(ptr) = stack.pop() {
                if !self.is_alive(ptr) || !traversed(ptr) || !visited.insert(ptr) {
                    continue;
                }
                stack.extend(self.edges_of(ptr, TraceMode::Verifying));
            }
            let live = |ptr: CellPtr| {
                visited.contains(&ptr)
                    || self
                        .zone_of_ptr(ptr)
                        .is_some_and(|z| !collecting.contains(&z))
            };
            stack.extend(
                self.weak_maps
                    .iter()
                    .filter(|&(map, key, _)| live(map) && live(key))
                    .filter_map(|(_, _, value)| value.as_cell())
                    .filter(|value| !visited.contains(value)),
            );
            stack.retain(|&ptr| traversed(ptr) && self.is_alive(ptr));
            if stack.is_empty() {
                break;
            }
        }

        for &ptr in &visited {
            if ptr.is_tenured() && self.zones.color(ptr) == Some(MarkColor::White) {
                return Err(Violation {
                    kind: ViolationKind::UnmarkedReachable,
                    holder: None,
                    target: ptr,
                });
            }
        }
        Ok(())
    }

    /// Checks that no root, tenured cell, reachable young cell or weak map
    /// entry refers to a dead cell.
    ///
    /// # Errors
    ///
    /// The first dangling reference.
    pub fn check_heap(&self) -> Result<(), Violation> {
        let dangling = |holder: Option<CellPtr>, target: CellPtr| Violation {
            kind: ViolationKind::DanglingEdge,
            holder,
            target,
        };

        let mut young: Vec<CellPtr> = Vec::new();
        for root in self.roots.iter() {
            if !self.is_alive(root) {
                return Err(dangling(None, root));
            }
            if root.is_nursery() {
                young.push(root);
            }
        }

        for zone in self.zones.iter() {
            for holder in self.tenured_cells_of(zone.id()) {
                for target in self.edges_of(holder, TraceMode::Verifying) {
                    if !self.is_alive(target) {
                        return Err(dangling(Some(holder), target));
                    }
                    if target.is_nursery() {
                        young.push(target);
                    }
                }
            }
        }

        let mut seen: FxHashSet<CellPtr> = FxHashSet::default();
        while let Some(holder) = young.pop() {
            if !seen.insert(holder) {
                continue;
            }
            for target in self.edges_of(holder, TraceMode::Verifying) {
                if !self.is_alive(target) {
                    return Err(dangling(Some(holder), target));
                }
                if target.is_nursery() {
                    young.push(target);
                }
            }
        }

        for (map, key, value) in self.weak_maps.iter() {
            if !self.is_alive(map) {
                return Err(dangling(None, map));
            }
            if !self.is_alive(key) {
                return Err(dangling(Some(map), key));
            }
            if let Some(value) = value.as_cell().filter(|&v| !self.is_alive(v)) {
                return Err(dangling(Some(map), value));
            }
        }
        Ok(())
    }

    /// Runs [`check_heap`](Self::check_heap), aborting on failure.
    pub(crate) fn check_heap_or_abort(&self) {
        if let Err(violation) = self.check_heap() {
            crate::error::fatal(&GcError::InvariantViolation(violation), &self.heap_dump());
        }
    }

    /// End-of-marking check for the marking validator zeal mode.
    pub(crate) fn validate_marking_if_zealous(&self) {
        if !self.zeal.validates_marking() {
            return;
        }
        if let Err(violation) = self.verify_marking() {
            crate::error::fatal(&GcError::InvariantViolation(violation), &self.heap_dump());
        }
    }

    /// Human-readable summary of the heap for fatal diagnostics.
    #[must_use]
    pub fn heap_dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "gc state: {} (zones {:?})",
            self.incremental.state, self.incremental.zones
        );
        for zone in self.zones.iter() {
            let _ = writeln!(
                out,
                "  {}{}: {} arenas, {} cells, {} bytes, generation {}, {:?}",
                zone.id(),
                if zone.is_atoms() { " (atoms)" } else { "" },
                zone.arena_count(),
                zone.live_cells(),
                zone.live_bytes(),
                zone.gc_generation(),
                zone.gc_state(),
            );
        }
        let _ = writeln!(
            out,
            "  nursery: {} cells, {}/{} bytes, epoch {}",
            self.nursery.cell_count(),
            self.nursery.used_bytes(),
            self.nursery.capacity_bytes(),
            self.nursery.epoch()
        );
        let _ = writeln!(
            out,
            "  roots: {}, store buffer: {}, cross-zone edges: {}, weak entries: {}, mark stack: {}",
            self.roots.len(),
            self.store_buffer.len(),
            self.cross_zone.len(),
            self.weak_maps.entry_count(),
            self.incremental.mark_stack.len()
        );
        out
    }
}
