//! Testing hooks.
//!
//! The collector's debugging surface: zeal modes that force collections and
//! verification at chosen points, and the shell-style functions used to
//! drive a collection by hand (`startgc`, `gcslice`, `gcstate`) and watch
//! individual cells change color (`add_mark_observers`, `get_marks`).

use crate::cell::{CellPtr, MarkColor};
use crate::error::{GcError, Violation};
use crate::gc::incremental::{GcScope, SliceBudget, SliceOutcome};
use crate::metrics::GcReason;
use crate::runtime::GcRuntime;
use crate::zone::ZoneId;

/// Work budget of the slices forced by
/// [`ZealMode::IncrementalMultipleSlices`].
pub const ZEAL_SLICE_WORK: usize = 100;

/// Debug modes selected with [`GcRuntime::gczeal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ZealMode {
    /// Nothing forced.
    #[default]
    Off = 0,
    /// Full collection every `frequency` allocations.
    Alloc = 2,
    /// Check the tri-color invariant at every incremental slice boundary.
    VerifierPre = 4,
    /// Minor collection every `frequency` young allocations.
    GenerationalGc = 7,
    /// Every `frequency` allocations, start an incremental collection or
    /// advance the active one by a small slice.
    IncrementalMultipleSlices = 10,
    /// Recompute reachability when marking finishes and compare.
    IncrementalMarkingValidator = 11,
    /// Compact every collected zone.
    Compact = 14,
    /// Check for dangling edges after every collection.
    CheckHeapAfterGc = 15,
}

impl ZealMode {
    /// The mode with number `mode`.
    #[must_use]
    pub const fn from_u8(mode: u8) -> Option<Self> {
        Some(match mode {
            0 => Self::Off,
            2 => Self::Alloc,
            4 => Self::VerifierPre,
            7 => Self::GenerationalGc,
            10 => Self::IncrementalMultipleSlices,
            11 => Self::IncrementalMarkingValidator,
            14 => Self::Compact,
            15 => Self::CheckHeapAfterGc,
            _ => return None,
        })
    }
}

/// What an allocation triggers under the current zeal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZealAction {
    FullGc,
    MinorGc,
    Slice(usize),
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Zeal {
    mode: ZealMode,
    frequency: u32,
    counter: u32,
}

impl Zeal {
    pub(crate) fn set(&mut self, mode: ZealMode, frequency: u32) {
        self.mode = mode;
        self.frequency = frequency.max(1);
        self.counter = 0;
    }

    pub(crate) const fn mode(&self) -> ZealMode {
        self.mode
    }

    /// Counts one allocation and returns the action it triggers, if any.
    pub(crate) fn tick(&mut self, young: bool) -> Option<ZealAction> {
        let action = match self.mode {
            ZealMode::Alloc => ZealAction::FullGc,
            ZealMode::GenerationalGc if young => ZealAction::MinorGc,
            ZealMode::IncrementalMultipleSlices => ZealAction::Slice(ZEAL_SLICE_WORK),
            _ => return None,
        };
        self.counter += 1;
        if self.counter < self.frequency {
            return None;
        }
        self.counter = 0;
        Some(action)
    }

    pub(crate) const fn verifies_slices(&self) -> bool {
        matches!(self.mode, ZealMode::VerifierPre)
    }

    pub(crate) const fn validates_marking(&self) -> bool {
        matches!(self.mode, ZealMode::IncrementalMarkingValidator)
    }

    pub(crate) const fn always_compacts(&self) -> bool {
        matches!(self.mode, ZealMode::Compact)
    }

    pub(crate) const fn checks_heap(&self) -> bool {
        matches!(self.mode, ZealMode::CheckHeapAfterGc)
    }

    /// Any mode that turns on barrier instrumentation.
    pub(crate) const fn verifies(&self) -> bool {
        matches!(
            self.mode,
            ZealMode::VerifierPre
                | ZealMode::IncrementalMarkingValidator
                | ZealMode::CheckHeapAfterGc
        )
    }
}

impl GcRuntime {
    /// Allocation hook: runs whatever the zeal mode asks for.
    pub(crate) fn run_zeal(&mut self, young: bool) -> Result<(), GcError> {
        match self.zeal.tick(young) {
            None => Ok(()),
            Some(ZealAction::FullGc) => {
                self.collect_atomic(GcScope::Full, GcReason::Zeal);
                Ok(())
            }
            Some(ZealAction::MinorGc) => self.collect_minor(GcReason::Zeal),
            Some(ZealAction::Slice(work)) => {
                if !self.incremental.state.is_active() {
                    self.begin_collection(GcScope::Auto, GcReason::Zeal)?;
                }
                self.run_slice(SliceBudget::Work(work));
                Ok(())
            }
        }
    }

    /// Sets the zeal mode by number. `frequency` is clamped to at least 1.
    ///
    /// # Errors
    ///
    /// `UnknownZealMode` for a number with no mode.
    pub fn gczeal(&mut self, mode: u8, frequency: u32) -> Result<(), GcError> {
        let mode = ZealMode::from_u8(mode).ok_or(GcError::UnknownZealMode(mode))?;
        self.zeal.set(mode, frequency);
        Ok(())
    }

    /// The current zeal mode.
    #[must_use]
    pub const fn zeal_mode(&self) -> ZealMode {
        self.zeal.mode()
    }

    /// Starts an incremental collection of the policy's zones and runs a
    /// first slice of `work` units.
    ///
    /// # Errors
    ///
    /// `CollectionInProgress` if a cycle is already active.
    pub fn startgc(&mut self, work: usize) -> Result<SliceOutcome, GcError> {
        self.start_collection(GcScope::Auto, SliceBudget::Work(work))
    }

    /// Runs one slice of `work` units (the configured default budget when
    /// `None`), starting a collection first if none is active.
    ///
    /// # Errors
    ///
    /// As [`startgc`](Self::startgc).
    pub fn gcslice(&mut self, work: Option<usize>) -> Result<SliceOutcome, GcError> {
        let budget = work.map_or(self.config.default_slice_budget, SliceBudget::Work);
        if self.incremental.state.is_active() {
            Ok(self.run_slice(budget))
        } else {
            self.start_collection(GcScope::Auto, budget)
        }
    }

    /// Name of the collector state: `"NotActive"`, `"Prepare"`, `"Mark"`,
    /// `"Sweep"`, `"Compact"` or `"Finalize"`.
    #[must_use]
    pub const fn gcstate(&self) -> &'static str {
        self.incremental.state.as_str()
    }

    /// Asks the zone policy to include `zone` in the next automatic
    /// collection.
    ///
    /// # Errors
    ///
    /// `NoSuchZone`.
    pub fn schedulezone(&mut self, zone: ZoneId) -> Result<(), GcError> {
        let z = self.zones.get_mut(zone).ok_or(GcError::NoSuchZone(zone))?;
        z.scheduled = true;
        Ok(())
    }

    /// Starts watching the mark colors of `cells`, in order after any
    /// already watched. The nursery is evicted first so every observed cell
    /// has a color.
    ///
    /// # Errors
    ///
    /// `StaleCell` for a dead cell; `OutOfMemory` if the eviction fails.
    pub fn add_mark_observers(&mut self, cells: &[CellPtr]) -> Result<(), GcError> {
        if let Some(&dead) = cells.iter().find(|&&c| !self.is_alive(c)) {
            return Err(GcError::StaleCell(dead));
        }
        self.observers.extend(cells.iter().copied().map(Some));
        self.collect_minor(GcReason::Eviction)
    }

    /// Colors of the observed cells: `"white"`, `"gray"`, `"black"`, or
    /// `"dead"` once a collection freed them.
    #[must_use]
    pub fn get_marks(&self) -> Vec<&'static str> {
        self.observers
            .iter()
            .map(|observer| match *observer {
                Some(ptr) if self.is_alive(ptr) => self.mark_color(ptr).as_str(),
                _ => "dead",
            })
            .collect()
    }

    /// Stops watching every cell.
    pub fn clear_mark_observers(&mut self) {
        self.observers.clear();
    }

    /// Mark color of a live cell. Young cells read black once marking has
    /// reached them.
    #[must_use]
    pub fn mark_color(&self, ptr: CellPtr) -> MarkColor {
        if ptr.is_nursery() {
            return if self.incremental.nursery_visited.contains(&ptr) {
                MarkColor::Black
            } else {
                MarkColor::White
            };
        }
        self.zones.color(ptr).unwrap_or(MarkColor::White)
    }

    /// Runs every heap check that applies in the current state.
    ///
    /// # Errors
    ///
    /// The first violation found.
    pub fn verify_heap(&self) -> Result<(), Violation> {
        self.verify_tri_color()?;
        self.check_heap()
    }
}
