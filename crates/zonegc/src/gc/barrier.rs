//! Write barriers.
//!
//! Every pointer store the mutator makes goes through [`GcRuntime::store`]:
//!
//! - the incremental barrier ([`GcRuntime::on_store`]) keeps the tri-color
//!   invariant while a collection is marking;
//! - the generational post-barrier remembers tenured cells that now point
//!   into the nursery;
//! - cross-zone stores are registered so zone collections can treat them
//!   as roots, and stores of atoms update the holder zone's atom marks.
//!
//! [`GcRuntime::store_unbarriered`] skips all of that and is only valid for
//! initializing stores that need none of it.

use crate::cell::{CellPtr, Header, MarkColor, Value};
use crate::config::BarrierStrategy;
use crate::error::GcError;
use crate::runtime::GcRuntime;
use crate::zone::{CrossZoneEdge, ZoneGcState};

impl GcRuntime {
    /// Incremental barrier for a store of `target` into `holder`.
    ///
    /// Does nothing unless a collection is marking. Nursery holders are
    /// treated as black since they are never colored.
    pub fn on_store(&mut self, holder: CellPtr, target: CellPtr) {
        if !self.incremental.is_marking() {
            return;
        }
        let holder_black = if holder.is_nursery() {
            true
        } else {
            self.in_marked_zone(holder) && self.zones.color(holder) == Some(MarkColor::Black)
        };
        if !holder_black {
            return;
        }

        match self.config.barrier_strategy {
            BarrierStrategy::ShadeTarget => self.shade_into_log(target),
            BarrierStrategy::RescanHolder if holder.is_tenured() => {
                self.zones.set_color(holder, MarkColor::Gray);
                self.barrier_log.push(holder);
            }
            BarrierStrategy::RescanHolder => self.shade_into_log(target),
        }
    }

    fn shade_into_log(&mut self, target: CellPtr) {
        if target.is_nursery() {
            if self.nursery.contains(target) && self.incremental.nursery_visited.insert(target) {
                self.barrier_log.push(target);
            }
            return;
        }
        let Some(zone) = target.tenured_zone().and_then(|z| self.zones.get(z)) else {
            return;
        };
        if !zone.needs_barrier() || zone.gc_state() != ZoneGcState::Mark {
            return;
        }
        if self.zones.color(target) == Some(MarkColor::White) {
            self.zones.set_color(target, MarkColor::Gray);
            self.barrier_log.push(target);
        }
    }

    /// Barriered store of `value` into slot `slot` of `holder`.
    ///
    /// # Errors
    ///
    /// `StaleCell` if the holder or the stored cell is dead,
    /// `SlotOutOfBounds` for a bad slot index.
    pub fn store(&mut self, holder: CellPtr, slot: usize, value: Value) -> Result<(), GcError> {
        if let Some(target) = value.as_cell() {
            if !self.is_alive(target) {
                return Err(GcError::StaleCell(target));
            }
        }
        self.write_slot(holder, slot, value)?;
        if let Some(target) = value.as_cell() {
            self.on_store(holder, target);
            self.post_write(holder, target);
        }
        Ok(())
    }

    /// Store without barriers, for initializing fresh cells.
    ///
    /// In debug builds, and whenever a verifying zeal mode is set, a store
    /// that needed a barrier aborts the process with `BarrierMisuse`.
    ///
    /// # Errors
    ///
    /// As [`store`](Self::store).
    pub fn store_unbarriered(
        &mut self,
        holder: CellPtr,
        slot: usize,
        value: Value,
    ) -> Result<(), GcError> {
        if let Some(target) = value.as_cell() {
            if !self.is_alive(target) {
                return Err(GcError::StaleCell(target));
            }
            if (cfg!(debug_assertions) || self.zeal.verifies()) && self.store_needs_barrier(holder, target) {
                crate::error::fatal(&GcError::BarrierMisuse { holder, target }, &self.heap_dump());
            }
        }
        self.write_slot(holder, slot, value)
    }

    /// Whether storing `target` into `holder` requires any barrier work.
    pub(crate) fn store_needs_barrier(&self, holder: CellPtr, target: CellPtr) -> bool {
        if holder.is_tenured() && target.is_nursery() {
            return true;
        }
        if self.zone_of_ptr(holder) != self.zone_of_ptr(target) {
            return true;
        }
        self.incremental.is_marking()
            && self.in_marked_zone(holder)
            && self.zones.color(holder) == Some(MarkColor::Black)
            && self.in_marked_zone(target)
            && self.zones.color(target) == Some(MarkColor::White)
    }

    /// Whether `ptr` is tenured in a zone whose marking is in progress.
    /// Colors elsewhere are left over from an earlier cycle.
    fn in_marked_zone(&self, ptr: CellPtr) -> bool {
        ptr.tenured_zone()
            .and_then(|z| self.zones.get(z))
            .is_some_and(|z| z.needs_barrier() && z.gc_state() == ZoneGcState::Mark)
    }

    fn write_slot(&mut self, holder: CellPtr, slot: usize, value: Value) -> Result<(), GcError> {
        let cell = self
            .cell_words_mut(holder)
            .ok_or(GcError::StaleCell(holder))?;
        let len = Header::from_value(cell[0]).slot_count();
        if slot >= len {
            return Err(GcError::SlotOutOfBounds {
                cell: holder,
                slot,
                len,
            });
        }
        cell[slot + 1] = value;
        Ok(())
    }

    /// Generational and cross-zone bookkeeping for a completed store.
    fn post_write(&mut self, holder: CellPtr, target: CellPtr) {
        if holder.is_tenured() && target.is_nursery() {
            self.store_buffer.record(holder);
        }
        let (Some(from), Some(to)) = (self.zone_of_ptr(holder), self.zone_of_ptr(target)) else {
            return;
        };
        if from == to {
            return;
        }

        if to == self.atoms {
            if let Some(zone) = self.zones.get_mut(from) {
                zone.atom_marks.insert(target);
            }
        } else {
            self.cross_zone.register(
                from,
                CrossZoneEdge {
                    from: holder,
                    to: target,
                    to_zone: to,
                },
            );
        }
        if self.incremental.is_marking() {
            self.observe_edge(holder, target);
        }
    }

    /// Records `from -> to` as a cross-zone edge without storing anything.
    ///
    /// # Errors
    ///
    /// `StaleCell` if either cell is dead.
    pub fn register_cross_zone_edge(&mut self, from: CellPtr, to: CellPtr) -> Result<(), GcError> {
        for ptr in [from, to] {
            if !self.is_alive(ptr) {
                return Err(GcError::StaleCell(ptr));
            }
        }
        self.post_write(from, to);
        Ok(())
    }
}
