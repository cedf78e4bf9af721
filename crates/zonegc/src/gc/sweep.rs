//! Sweeping.
//!
//! Everything that depends on mark colors is decided at the Mark -> Sweep
//! transition, before any slot can be reused: dead weak map entries, the
//! store buffer, cross-zone edges, atom marks and mark observers. The sweep
//! itself then frees white cells one arena at a time.

use std::collections::BTreeSet;
use std::ops::AddAssign;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell::{CellPtr, Header, KindRegistry, WORD_SIZE};
use crate::gc::incremental::BudgetTracker;
use crate::heap::PagePool;
use crate::runtime::GcRuntime;
use crate::zone::{Zone, ZoneGcState, ZoneId};

/// What sweeping one or more arenas reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SweepResult {
    pub(crate) cells: usize,
    pub(crate) bytes: usize,
    pub(crate) finalizers: usize,
    pub(crate) arenas_released: usize,
}

impl AddAssign for SweepResult {
    fn add_assign(&mut self, rhs: Self) {
        self.cells += rhs.cells;
        self.bytes += rhs.bytes;
        self.finalizers += rhs.finalizers;
        self.arenas_released += rhs.arenas_released;
    }
}

/// Finalizes and frees every white cell of one arena, releasing the arena
/// if it ends up empty.
pub(crate) fn sweep_arena(
    zone: &mut Zone,
    idx: u32,
    kinds: &KindRegistry,
    pool: &Mutex<PagePool>,
) -> SweepResult {
    let mut result = SweepResult::default();
    let Some(arena) = zone.arena_mut(idx) else {
        return result;
    };
    let cell_bytes = arena.cell_words() * WORD_SIZE;
    for slot in arena.white_slots() {
        if let Some(cell) = arena.cell(slot) {
            let header = Header::from_value(cell[0]);
            if let (Some(finalize), Some(slots)) = (
                kinds.finalizer(header.kind()),
                cell.get(1..=header.slot_count()),
            ) {
                finalize(slots);
                result.finalizers += 1;
            }
        }
        arena.release(slot);
        result.cells += 1;
        result.bytes += cell_bytes;
    }
    if arena.is_empty() {
        zone.release_arena(idx, pool);
        result.arenas_released += 1;
    }
    result
}

impl GcRuntime {
    /// Mark -> Sweep bookkeeping.
    pub(crate) fn begin_sweep(&mut self) {
        self.sweep_weak_maps();

        let dead_holders: FxHashSet<CellPtr> = self
            .store_buffer
            .iter()
            .filter(|&holder| !self.is_marked_live(holder))
            .collect();
        self.store_buffer.retain(|holder| !dead_holders.contains(holder));

        for (zone, edges) in std::mem::take(&mut self.incremental.observed_edges) {
            self.cross_zone.replace_outgoing(zone, edges);
        }

        let mut observed_atoms = std::mem::take(&mut self.incremental.observed_atoms);
        let atoms_collected = self.incremental.zones.contains(&self.atoms);
        let dead_atoms: FxHashSet<CellPtr> = if atoms_collected {
            self.zones
                .iter()
                .flat_map(|z| z.atom_marks.iter().copied())
                .filter(|&atom| !self.is_marked_live(atom))
                .collect()
        } else {
            FxHashSet::default()
        };
        for zone in self.zones.iter_mut() {
            if let Some(atoms) = observed_atoms.remove(&zone.id()) {
                zone.atom_marks = atoms;
            }
            zone.atom_marks.retain(|atom| !dead_atoms.contains(atom));
        }

        let dead_observers: Vec<usize> = self
            .observers
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_some_and(|p| !self.is_marked_live(p)))
            .map(|(i, _)| i)
            .collect();
        for i in dead_observers {
            self.observers[i] = None;
        }

        let mut queue = std::collections::VecDeque::new();
        for zone in self.zones.iter_mut() {
            if self.incremental.zones.contains(&zone.id()) {
                zone.gc_state = ZoneGcState::Sweep;
                queue.extend(zone.arena_ids().into_iter().map(|idx| (zone.id(), idx)));
            }
        }
        self.incremental.sweep_queue = queue;
    }

    /// Sweeps queued arenas until the queue is empty (returns `true`) or the
    /// budget runs out.
    pub(crate) fn sweep_slice(&mut self, budget: &mut BudgetTracker) -> bool {
        if budget.is_unlimited() && self.config.helper_threads > 0 {
            let zones: BTreeSet<ZoneId> = self.incremental.sweep_queue.iter().map(|&(z, _)| z).collect();
            if zones.len() > 1 {
                self.sweep_parallel();
                return true;
            }
        }

        while let Some((zone, idx)) = self.incremental.sweep_queue.pop_front() {
            if let Some(zone) = self.zones.get_mut(zone) {
                let result = sweep_arena(zone, idx, &self.kinds, &self.pool);
                self.absorb_sweep(result);
            }
            budget.step(1);
            if budget.is_over() && !self.incremental.sweep_queue.is_empty() {
                return false;
            }
        }
        true
    }

    /// Sweeps the remaining queue with zones spread across helper threads.
    fn sweep_parallel(&mut self) {
        let mut work: FxHashMap<ZoneId, Vec<u32>> = FxHashMap::default();
        for (zone, idx) in self.incremental.sweep_queue.drain(..) {
            work.entry(zone).or_default().push(idx);
        }

        let kinds = &self.kinds;
        let pool = &self.pool;
        let jobs: Vec<(&mut Zone, Vec<u32>)> = self
            .zones
            .iter_mut()
            .filter_map(|zone| {
                let arenas = work.remove(&zone.id())?;
                Some((zone, arenas))
            })
            .collect();
        let threads = self.config.helper_threads.min(jobs.len()).max(1);
        let mut buckets: Vec<Vec<(&mut Zone, Vec<u32>)>> = (0..threads).map(|_| Vec::new()).collect();
        for (i, job) in jobs.into_iter().enumerate() {
            buckets[i % threads].push(job);
        }

        let outcome = crossbeam::thread::scope(|scope| {
            let handles: Vec<_> = buckets
                .into_iter()
                .map(|bucket| {
                    scope.spawn(move |_| {
                        let mut total = SweepResult::default();
                        for (zone, arenas) in bucket {
                            for idx in arenas {
                                total += sweep_arena(zone, idx, kinds, pool);
                            }
                        }
                        total
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join())
                .collect::<Vec<_>>()
        });

        let results = match outcome {
            Ok(results) => results,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        for result in results {
            match result {
                Ok(result) => self.absorb_sweep(result),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
    }

    fn absorb_sweep(&mut self, result: SweepResult) {
        let stats = &mut self.incremental.stats;
        stats.cells_reclaimed += result.cells;
        stats.bytes_reclaimed += result.bytes;
        stats.finalizers_run += result.finalizers;
        stats.arenas_released += result.arenas_released;
    }

    /// Sweep -> next state: allocation restarts from the first arena so
    /// freed cells are reused before new pages are taken.
    pub(crate) fn end_sweep(&mut self) {
        for zone in self.zones.iter_mut() {
            if self.incremental.zones.contains(&zone.id()) {
                zone.reset_alloc_cursors();
            }
        }
    }
}
