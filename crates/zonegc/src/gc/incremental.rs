//! Incremental collection scheduler.
//!
//! A major collection is a resumable state machine:
//!
//! ```text
//! NotActive -> Prepare -> Mark -> Sweep -> (Compact) -> Finalize -> NotActive
//! ```
//!
//! [`GcRuntime::run_slice`] advances it by a bounded amount of work and
//! returns to the mutator. Everything needed to resume (mark stack, nursery
//! visited set, sweep cursor) lives in [`IncrementalState`]. Budgets are only
//! checked between atomic steps: one cell's complete edge list while marking,
//! one arena while sweeping. Compaction runs within a single slice.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::cell::CellPtr;
use crate::error::GcError;
use crate::metrics::{CollectionType, GcMetrics, GcReason, PhaseTimer, TimedPhase};
use crate::runtime::GcRuntime;
use crate::tracing::{next_gc_id, GcId};
use crate::zone::{CrossZoneEdge, ZoneGcState, ZoneId, ZoneSet};

// ============================================================================
// State machine
// ============================================================================

/// Collector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcState {
    /// No collection in progress.
    #[default]
    NotActive,
    /// Zones selected, roots snapshotted.
    Prepare,
    /// Tracing the live graph.
    Mark,
    /// Reclaiming white cells.
    Sweep,
    /// Relocating cells out of sparse arenas.
    Compact,
    /// Clearing marks and recording metrics.
    Finalize,
}

impl GcState {
    /// Display name, as reported by `gcstate()`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotActive => "NotActive",
            Self::Prepare => "Prepare",
            Self::Mark => "Mark",
            Self::Sweep => "Sweep",
            Self::Compact => "Compact",
            Self::Finalize => "Finalize",
        }
    }

    /// Whether a collection is in progress.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::NotActive)
    }

    /// Whether the machine may move from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::NotActive, Self::Prepare)
                | (Self::Prepare, Self::Mark)
                | (Self::Mark, Self::Sweep)
                | (Self::Sweep, Self::Compact | Self::Finalize)
                | (Self::Compact, Self::Finalize)
                | (Self::Finalize, Self::NotActive)
        )
    }
}

impl std::fmt::Display for GcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Budgets
// ============================================================================

/// How much work one slice may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceBudget {
    /// Run to completion.
    Unlimited,
    /// Stop after this many work units (cells scanned plus edges, arenas
    /// swept).
    Work(usize),
    /// Stop once this much time has passed.
    Time(Duration),
}

impl Default for SliceBudget {
    fn default() -> Self {
        Self::Work(crate::config::DEFAULT_SLICE_WORK)
    }
}

/// Tracks budget consumption within one slice.
#[derive(Debug)]
pub(crate) struct BudgetTracker {
    budget: SliceBudget,
    work: usize,
    start: Instant,
}

impl BudgetTracker {
    pub(crate) fn new(budget: SliceBudget) -> Self {
        Self {
            budget,
            work: 0,
            start: Instant::now(),
        }
    }

    pub(crate) fn step(&mut self, units: usize) {
        self.work += units;
    }

    pub(crate) fn is_over(&self) -> bool {
        match self.budget {
            SliceBudget::Unlimited => false,
            SliceBudget::Work(limit) => self.work >= limit,
            SliceBudget::Time(limit) => self.start.elapsed() >= limit,
        }
    }

    pub(crate) const fn is_unlimited(&self) -> bool {
        matches!(self.budget, SliceBudget::Unlimited)
    }

    pub(crate) const fn work(&self) -> usize {
        self.work
    }
}

/// Result of [`GcRuntime::run_slice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// No collection was in progress.
    Idle,
    /// The budget ran out; the collection continues in a later slice.
    Pending(GcState),
    /// The collection completed.
    Finished,
}

impl SliceOutcome {
    /// Whether the collection completed in this slice.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Which zones a collection covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcScope {
    /// Let the zone policy decide.
    Auto,
    /// Every zone, atoms included.
    Full,
    /// These zones. The atoms zone is only collected when every zone is.
    Zones(Vec<ZoneId>),
}

// ============================================================================
// IncrementalState
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct CycleStats {
    pub(crate) started: Option<Instant>,
    pub(crate) slices: usize,
    pub(crate) cells_marked: usize,
    pub(crate) cells_reclaimed: usize,
    pub(crate) bytes_reclaimed: usize,
    pub(crate) arenas_released: usize,
    pub(crate) finalizers_run: usize,
    pub(crate) cells_relocated: usize,
    pub(crate) pause_total: Duration,
    pub(crate) max_pause: Duration,
    pub(crate) aborted_forward: bool,
}

/// Collector state preserved between slices.
#[derive(Debug, Default)]
pub(crate) struct IncrementalState {
    pub(crate) state: GcState,
    pub(crate) zones: ZoneSet,
    pub(crate) full: bool,
    pub(crate) shrinking: bool,
    pub(crate) reason: GcReason,
    pub(crate) gc_id: GcId,
    pub(crate) mark_stack: Vec<CellPtr>,
    /// Nursery cells traversed this cycle. Young cells are never colored.
    pub(crate) nursery_visited: FxHashSet<CellPtr>,
    /// Cross-zone edges seen while marking, per holder zone.
    pub(crate) observed_edges: FxHashMap<ZoneId, FxHashSet<CrossZoneEdge>>,
    /// Atoms referenced by marked cells, per zone.
    pub(crate) observed_atoms: FxHashMap<ZoneId, FxHashSet<CellPtr>>,
    pub(crate) sweep_queue: VecDeque<(ZoneId, u32)>,
    pub(crate) compact_zones: Vec<ZoneId>,
    pub(crate) stats: CycleStats,
    pub(crate) timer: PhaseTimer,
}

impl IncrementalState {
    /// Moves the machine to `to`. Invalid transitions are refused.
    pub(crate) fn transition_to(&mut self, to: GcState) -> bool {
        if !self.state.can_transition_to(to) {
            debug_assert!(false, "invalid GC transition {} -> {}", self.state, to);
            return false;
        }
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_state_transition(self.state, to, self.stats.cells_marked);
        self.state = to;
        true
    }

    /// Whether cells and edges of `zone` are being collected.
    pub(crate) fn is_collecting(&self, zone: ZoneId) -> bool {
        self.state.is_active() && self.zones.contains(&zone)
    }

    /// Whether marking has not yet finished.
    pub(crate) const fn is_marking(&self) -> bool {
        matches!(self.state, GcState::Prepare | GcState::Mark)
    }

    pub(crate) fn remap(&mut self, mut resolve: impl FnMut(CellPtr) -> Option<CellPtr>) {
        self.mark_stack = self.mark_stack.drain(..).filter_map(&mut resolve).collect();
        for edges in self.observed_edges.values_mut() {
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
        for atoms in self.observed_atoms.values_mut() {
            *atoms = atoms.drain().filter_map(&mut resolve).collect();
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

impl GcRuntime {
    /// Current collector state.
    #[must_use]
    pub fn state(&self) -> GcState {
        self.incremental.state
    }

    /// Zones being collected by the active cycle.
    #[must_use]
    pub fn collecting_zones(&self) -> Vec<ZoneId> {
        if self.incremental.state.is_active() {
            self.incremental.zones.iter().copied().collect()
        } else {
            Vec::new()
        }
    }

    /// Starts a major collection and runs its first slice.
    ///
    /// # Errors
    ///
    /// `CollectionInProgress` if a cycle is already active, `NoSuchZone`
    /// for an unknown zone in `scope`.
    pub fn start_collection(
        &mut self,
        scope: GcScope,
        budget: SliceBudget,
    ) -> Result<SliceOutcome, GcError> {
        self.begin_collection(scope, GcReason::Api)?;
        Ok(self.run_slice(budget))
    }

    /// Runs a full collection to completion, finishing any active one first.
    pub fn gc(&mut self) {
        self.collect_atomic(GcScope::Full, GcReason::Api);
    }

    /// Runs a collection of `zones` to completion.
    ///
    /// # Errors
    ///
    /// `NoSuchZone` for an unknown zone.
    pub fn gc_zones(&mut self, zones: &[ZoneId]) -> Result<(), GcError> {
        self.validate_zones(zones)?;
        self.collect_atomic(GcScope::Zones(zones.to_vec()), GcReason::Api);
        Ok(())
    }

    /// Full collection that compacts every zone.
    pub fn shrinking_gc(&mut self) {
        self.finish_collection();
        if self.begin_collection(GcScope::Full, GcReason::Api).is_ok() {
            self.incremental.shrinking = true;
            self.run_slice(SliceBudget::Unlimited);
        }
    }

    /// Finishes the active collection in one go ("abort forward"). Work is
    /// never rolled back.
    pub fn finish_collection(&mut self) {
        if !self.incremental.state.is_active() {
            return;
        }
        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_abort_forward(self.incremental.state, self.incremental.reason.as_str());
        self.incremental.stats.aborted_forward = true;
        self.run_slice(SliceBudget::Unlimited);
    }

    pub(crate) fn collect_atomic(&mut self, scope: GcScope, reason: GcReason) {
        self.finish_collection();
        if self.begin_collection(scope, reason).is_ok() {
            self.run_slice(SliceBudget::Unlimited);
        }
    }

    fn validate_zones(&self, zones: &[ZoneId]) -> Result<(), GcError> {
        match zones.iter().find(|&&z| self.zones.get(z).is_none()) {
            Some(&missing) => Err(GcError::NoSuchZone(missing)),
            None => Ok(()),
        }
    }

    fn select_zones(&self, scope: GcScope) -> Result<ZoneSet, GcError> {
        let all: ZoneSet = self.zones.ids().into_iter().collect();
        let requested = match scope {
            GcScope::Full => return Ok(all),
            GcScope::Zones(zones) => {
                self.validate_zones(&zones)?;
                zones
            }
            GcScope::Auto => match self.policy.select(&self.zone_usage()) {
                GcScope::Zones(zones) => zones,
                GcScope::Full | GcScope::Auto => return Ok(all),
            },
        };
        let mut set: ZoneSet = requested
            .into_iter()
            .filter(|z| all.contains(z))
            .collect();
        if set != all {
            set.remove(&self.atoms);
        }
        Ok(set)
    }

    /// `NotActive -> Prepare`: select zones, clear their marks, arm the
    /// barrier and snapshot the roots onto the mark stack.
    pub(crate) fn begin_collection(&mut self, scope: GcScope, reason: GcReason) -> Result<(), GcError> {
        if self.incremental.state.is_active() {
            return Err(GcError::CollectionInProgress);
        }
        let zones = self.select_zones(scope)?;
        let full = zones.len() == self.zones.len();

        let mut timer = PhaseTimer::new();
        timer.start(TimedPhase::Prepare);
        crate::tracing::log_phase_start(crate::tracing::GcPhase::Prepare, self.heap_bytes_in_use());

        self.incremental = IncrementalState {
            zones: zones.clone(),
            full,
            reason,
            gc_id: next_gc_id(),
            stats: CycleStats {
                started: Some(Instant::now()),
                ..CycleStats::default()
            },
            ..IncrementalState::default()
        };
        self.incremental.transition_to(GcState::Prepare);

        for zone in self.zones.iter_mut() {
            zone.scheduled = false;
            if zones.contains(&zone.id()) {
                zone.clear_marks();
                zone.needs_barrier = true;
                zone.gc_state = ZoneGcState::Mark;
                self.incremental
                    .observed_edges
                    .insert(zone.id(), FxHashSet::default());
                if !zone.is_atoms() {
                    self.incremental
                        .observed_atoms
                        .insert(zone.id(), FxHashSet::default());
                }
            }
        }

        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_collection_start(
            zones.len(),
            full,
            reason.as_str(),
            self.incremental.gc_id,
        );

        self.mark_roots();
        timer.end();
        self.incremental.timer = timer;
        Ok(())
    }

    /// Advances the active collection by at most `budget` work.
    pub fn run_slice(&mut self, budget: SliceBudget) -> SliceOutcome {
        if !self.incremental.state.is_active() {
            return SliceOutcome::Idle;
        }
        let budget = if self.config.incremental {
            budget
        } else {
            SliceBudget::Unlimited
        };
        let slice_start = Instant::now();
        let mut tracker = BudgetTracker::new(budget);
        self.incremental.stats.slices += 1;

        #[cfg(feature = "tracing")]
        let _span = crate::tracing::trace_gc_collection(
            if self.incremental.full { "full" } else { "zones" },
            self.incremental.gc_id,
        );
        #[cfg(feature = "tracing")]
        let _slice =
            crate::gc::tracing::span_slice(self.incremental.state, self.incremental.gc_id).entered();

        let finished = loop {
            match self.incremental.state {
                GcState::NotActive => break true,
                GcState::Prepare => {
                    self.incremental.transition_to(GcState::Mark);
                }
                GcState::Mark => {
                    let _phase = crate::tracing::trace_phase(crate::tracing::GcPhase::Mark);
                    self.incremental.timer.start(TimedPhase::Mark);
                    let done = self.mark_slice(&mut tracker);
                    self.incremental.timer.end();
                    if !done {
                        break false;
                    }
                    self.validate_marking_if_zealous();
                    self.begin_sweep();
                    self.incremental.transition_to(GcState::Sweep);
                    if tracker.is_over() {
                        break false;
                    }
                }
                GcState::Sweep => {
                    let _phase = crate::tracing::trace_phase(crate::tracing::GcPhase::Sweep);
                    self.incremental.timer.start(TimedPhase::Sweep);
                    let done = self.sweep_slice(&mut tracker);
                    self.incremental.timer.end();
                    if !done {
                        break false;
                    }
                    self.end_sweep();
                    if self.plan_compaction() {
                        self.incremental.transition_to(GcState::Compact);
                    } else {
                        self.incremental.transition_to(GcState::Finalize);
                    }
                }
                GcState::Compact => {
                    let _phase = crate::tracing::trace_phase(crate::tracing::GcPhase::Compact);
                    self.incremental.timer.start(TimedPhase::Compact);
                    let relocated = self.compact_zones();
                    self.incremental.stats.cells_relocated += relocated;
                    self.incremental.timer.end();
                    self.incremental.transition_to(GcState::Finalize);
                }
                GcState::Finalize => {
                    self.account_pause(slice_start);
                    self.finalize_collection();
                    break true;
                }
            }
        };

        #[cfg(feature = "tracing")]
        crate::gc::tracing::log_slice(self.incremental.state, tracker.work(), !finished);

        if finished {
            return SliceOutcome::Finished;
        }
        self.account_pause(slice_start);
        if self.incremental.state == GcState::Mark && self.zeal.verifies_slices() {
            if let Err(violation) = self.verify_tri_color() {
                crate::error::fatal(
                    &GcError::InvariantViolation(violation),
                    &self.heap_dump(),
                );
            }
        }
        SliceOutcome::Pending(self.incremental.state)
    }

    fn account_pause(&mut self, slice_start: Instant) {
        let pause = slice_start.elapsed();
        let stats = &mut self.incremental.stats;
        stats.pause_total += pause;
        stats.max_pause = stats.max_pause.max(pause);
    }

    fn plan_compaction(&mut self) -> bool {
        let forced = self.incremental.shrinking || self.zeal.always_compacts();
        let threshold = self.config.compaction_threshold;
        let zones: Vec<ZoneId> = self
            .zones
            .iter()
            .filter(|z| self.incremental.zones.contains(&z.id()))
            .filter(|z| {
                forced || threshold.is_some_and(|t| z.arena_count() > 1 && z.fragmentation() >= t)
            })
            .map(|z| z.id())
            .collect();
        for &id in &zones {
            if let Some(zone) = self.zones.get_mut(id) {
                zone.gc_state = ZoneGcState::Compact;
            }
        }
        self.incremental.compact_zones = zones;
        !self.incremental.compact_zones.is_empty()
    }

    /// `Finalize -> NotActive`: disarm barriers, bump generations, record
    /// metrics.
    fn finalize_collection(&mut self) {
        let mut cells_surviving = 0;
        let mut bytes_surviving = 0;
        for zone in self.zones.iter_mut() {
            if !self.incremental.zones.contains(&zone.id()) {
                continue;
            }
            zone.needs_barrier = false;
            zone.gc_state = ZoneGcState::Idle;
            zone.gc_generation += 1;
            zone.allocated_since_gc = 0;
            cells_surviving += zone.live_cells();
            bytes_surviving += zone.live_bytes();
        }
        while self.barrier_log.pop().is_some() {}

        let state = &mut self.incremental;
        state.mark_stack.clear();
        state.nursery_visited.clear();
        state.observed_edges.clear();
        state.observed_atoms.clear();
        state.compact_zones.clear();
        state.timer.end();

        let stats = &state.stats;
        let metrics = GcMetrics {
            duration: stats.started.map_or(Duration::ZERO, |s| s.elapsed()),
            pause_total: stats.pause_total,
            max_pause: stats.max_pause,
            bytes_reclaimed: stats.bytes_reclaimed,
            bytes_surviving,
            cells_reclaimed: stats.cells_reclaimed,
            cells_surviving,
            collection_type: if stats.slices > 1 {
                CollectionType::IncrementalMajor
            } else {
                CollectionType::Major
            },
            reason: state.reason,
            zones_collected: state.zones.len(),
            prepare_duration: state.timer.prepare,
            mark_duration: state.timer.mark,
            sweep_duration: state.timer.sweep,
            compact_duration: state.timer.compact,
            cells_marked: stats.cells_marked,
            slices_executed: stats.slices,
            cells_relocated: stats.cells_relocated,
            arenas_released: stats.arenas_released,
            finalizers_run: stats.finalizers_run,
            aborted_forward: stats.aborted_forward,
            ..GcMetrics::new()
        };
        crate::tracing::log_phase_end(crate::tracing::GcPhase::Finalize, metrics.bytes_reclaimed);
        self.metrics.record(metrics);
        self.incremental.transition_to(GcState::NotActive);
        self.incremental.shrinking = false;

        if self.zeal.checks_heap() {
            self.check_heap_or_abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(GcState::NotActive.as_str(), "NotActive");
        assert_eq!(GcState::Prepare.as_str(), "Prepare");
        assert_eq!(GcState::Mark.as_str(), "Mark");
        assert_eq!(GcState::Sweep.as_str(), "Sweep");
        assert_eq!(GcState::Compact.as_str(), "Compact");
        assert_eq!(GcState::Finalize.as_str(), "Finalize");
    }

    #[test]
    fn test_valid_transitions() {
        use GcState::*;
        assert!(NotActive.can_transition_to(Prepare));
        assert!(Prepare.can_transition_to(Mark));
        assert!(Mark.can_transition_to(Sweep));
        assert!(Sweep.can_transition_to(Compact));
        assert!(Sweep.can_transition_to(Finalize));
        assert!(Compact.can_transition_to(Finalize));
        assert!(Finalize.can_transition_to(NotActive));

        assert!(!NotActive.can_transition_to(Mark));
        assert!(!Mark.can_transition_to(Prepare));
        assert!(!Sweep.can_transition_to(Mark));
        assert!(!Compact.can_transition_to(Sweep));
        assert!(!Finalize.can_transition_to(Prepare));
    }

    #[test]
    fn test_transition_to_updates_state() {
        let mut state = IncrementalState::default();
        assert!(state.transition_to(GcState::Prepare));
        assert!(state.transition_to(GcState::Mark));
        assert_eq!(state.state, GcState::Mark);
        assert!(state.is_marking());
    }

    #[test]
    fn test_budget_tracker() {
        let mut work = BudgetTracker::new(SliceBudget::Work(10));
        work.step(9);
        assert!(!work.is_over());
        work.step(1);
        assert!(work.is_over());

        let unlimited = BudgetTracker::new(SliceBudget::Unlimited);
        assert!(!unlimited.is_over());
        assert!(unlimited.is_unlimited());

        let time = BudgetTracker::new(SliceBudget::Time(Duration::ZERO));
        assert!(time.is_over());
    }
}
