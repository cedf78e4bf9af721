//! Marking.
//!
//! Tenured cells are colored in their arena's side bitmaps: white cells are
//! unvisited, gray cells sit on the mark stack, black cells have had their
//! complete edge list scanned. Nursery cells are never colored; marking
//! traverses them through `nursery_visited` so that tenured cells reachable
//! only through young ones are still found.
//!
//! A zone's bitmaps are reset when its next cycle starts, so the colors of
//! the last cycle stay readable in between.

use crate::cell::{CellPtr, MarkColor};
use crate::gc::incremental::BudgetTracker;
use crate::runtime::GcRuntime;
use crate::trace::TraceMode;
use crate::zone::CrossZoneEdge;

impl GcRuntime {
    /// Runs marking until the graph is exhausted (returns `true`) or the
    /// budget runs out.
    pub(crate) fn mark_slice(&mut self, budget: &mut BudgetTracker) -> bool {
        loop {
            self.drain_barrier_log();
            if !self.drain_mark_stack(budget) {
                return false;
            }

            // Roots may have been added or re-pointed since the last slice.
            self.mark_roots();
            self.drain_barrier_log();
            if !self.incremental.mark_stack.is_empty() {
                continue;
            }

            if self.mark_ephemerons() {
                continue;
            }
            return true;
        }
    }

    /// Pushes every root, every implicit cross-zone root and, when atoms are
    /// collected, the atom marks of uncollected zones.
    pub(crate) fn mark_roots(&mut self) {
        let mut roots: Vec<CellPtr> = self.roots.iter().collect();
        roots.extend(self.cross_zone.implicit_roots(&self.incremental.zones));
        if self.incremental.zones.contains(&self.atoms) {
            roots.extend(
                self.zones
                    .iter()
                    .filter(|z| !self.incremental.zones.contains(&z.id()))
                    .flat_map(|z| z.atom_marks.iter().copied()),
            );
        }
        for root in roots {
            self.shade(root);
        }
    }

    fn drain_barrier_log(&mut self) {
        while let Some(ptr) = self.barrier_log.pop() {
            self.incremental.mark_stack.push(ptr);
        }
    }

    /// Scans gray cells until the stack is empty. Returns `false` if the
    /// budget ran out first.
    fn drain_mark_stack(&mut self, budget: &mut BudgetTracker) -> bool {
        while let Some(ptr) = self.incremental.mark_stack.pop() {
            let work = self.scan_cell(ptr);
            budget.step(work);
            if budget.is_over() && !self.incremental.mark_stack.is_empty() {
                return false;
            }
        }
        true
    }

    /// Blackens one cell and shades everything it points to.
    fn scan_cell(&mut self, ptr: CellPtr) -> usize {
        if ptr.is_tenured() {
            if self.zones.color(ptr) != Some(MarkColor::Gray) {
                return 0;
            }
            self.zones.set_color(ptr, MarkColor::Black);
        } else if !self.nursery.contains(ptr) {
            return 0;
        }

        let edges = self.edges_of(ptr, TraceMode::Marking);
        self.incremental.stats.cells_marked += 1;
        for &target in &edges {
            self.mark_edge(ptr, target);
        }
        1 + edges.len()
    }

    /// Shades `target`, recording the edge if it crosses zones.
    pub(crate) fn mark_edge(&mut self, holder: CellPtr, target: CellPtr) {
        self.observe_edge(holder, target);
        self.shade(target);
    }

    /// Records a cross-zone edge or atom use of a holder in a collected zone.
    pub(crate) fn observe_edge(&mut self, holder: CellPtr, target: CellPtr) {
        let (Some(from), Some(to)) = (self.zone_of_ptr(holder), self.zone_of_ptr(target)) else {
            return;
        };
        if from == to {
            return;
        }
        if to == self.atoms {
            if let Some(atoms) = self.incremental.observed_atoms.get_mut(&from) {
                atoms.insert(target);
            }
        } else if let Some(edges) = self.incremental.observed_edges.get_mut(&from) {
            edges.insert(CrossZoneEdge {
                from: holder,
                to: target,
                to_zone: to,
            });
        }
    }

    /// Makes `target` gray if it is an unvisited cell of a collected zone,
    /// or queues an unvisited nursery cell for traversal.
    pub(crate) fn shade(&mut self, target: CellPtr) {
        if target.is_nursery() {
            if self.nursery.contains(target) && self.incremental.nursery_visited.insert(target) {
                self.incremental.mark_stack.push(target);
            }
            return;
        }
        let collecting = target
            .tenured_zone()
            .is_some_and(|z| self.incremental.zones.contains(&z));
        if collecting && self.zones.color(target) == Some(MarkColor::White) {
            self.zones.set_color(target, MarkColor::Gray);
            self.incremental.mark_stack.push(target);
        }
    }

    /// Whether the current cycle considers `ptr` live. Cells of zones that
    /// are not being collected always are.
    pub(crate) fn is_marked_live(&self, ptr: CellPtr) -> bool {
        let Some(zone) = self.zone_of_ptr(ptr) else {
            return false;
        };
        if !self.incremental.zones.contains(&zone) {
            return self.is_alive(ptr);
        }
        if ptr.is_nursery() {
            return self.incremental.nursery_visited.contains(&ptr);
        }
        self.zones
            .color(ptr)
            .is_some_and(|c| c != MarkColor::White)
    }
}
