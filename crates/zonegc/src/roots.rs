//! Root tracking.
//!
//! Roots are cells the embedder holds directly (stack slots, globals, handles).
//! They are registered in a [`RootTable`] and identified by a [`RootId`]; the
//! table is updated in place when a minor collection or compaction moves a
//! rooted cell, so embedders read the current location back through the id.

use crate::cell::CellPtr;

// ============================================================================
// RootTable - Root tracking structure
// ============================================================================

/// Handle to a registered root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(u32);

/// Table of all registered roots.
///
/// Supports frame markers for scope-based rooting: [`RootTable::push_frame`]
/// remembers the current position and [`RootTable::pop_frame`] unregisters
/// every root added since.
#[derive(Debug, Default)]
pub struct RootTable {
    slots: Vec<Option<CellPtr>>,
    free: Vec<u32>,
    /// Registration order, for frame popping.
    order: Vec<RootId>,
    frame_markers: Vec<usize>,
}

impl RootTable {
    /// Create an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    /// Register a new root.
    pub fn add(&mut self, ptr: CellPtr) -> RootId {
        let id = if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(ptr);
            RootId(index)
        } else {
            let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
            self.slots.push(Some(ptr));
            RootId(index)
        };
        self.order.push(id);
        id
    }

    /// Unregister a root, returning the cell it pointed to.
    pub fn remove(&mut self, id: RootId) -> Option<CellPtr> {
        let ptr = self.slots.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        if let Some(pos) = self.order.iter().rposition(|&r| r == id) {
            self.order.remove(pos);
            for marker in &mut self.frame_markers {
                if *marker > pos {
                    *marker -= 1;
                }
            }
        }
        Some(ptr)
    }

    /// Current location of a rooted cell.
    #[must_use]
    pub fn get(&self, id: RootId) -> Option<CellPtr> {
        self.slots.get(id.0 as usize).copied().flatten()
    }

    /// Point an existing root at another cell.
    pub fn set(&mut self, id: RootId, ptr: CellPtr) -> bool {
        match self.slots.get_mut(id.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = Some(ptr);
                true
            }
            _ => false,
        }
    }

    /// Get the number of roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if there are no roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate over all rooted cells.
    pub fn iter(&self) -> impl Iterator<Item = CellPtr> + '_ {
        self.slots.iter().flatten().copied()
    }

    /// Rewrite every root. Roots that resolve to `None` keep their value.
    pub(crate) fn remap(&mut self, mut resolve: impl FnMut(CellPtr) -> Option<CellPtr>) {
        for ptr in self.slots.iter_mut().flatten() {
            if let Some(to) = resolve(*ptr) {
                *ptr = to;
            }
        }
    }

    /// Clear all roots.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.order.clear();
        self.frame_markers.clear();
    }

    /// Push a frame marker (for scope-based rooting).
    pub fn push_frame(&mut self) {
        self.frame_markers.push(self.order.len());
    }

    /// Pop a frame marker and remove all roots added since.
    pub fn pop_frame(&mut self) {
        if let Some(marker) = self.frame_markers.pop() {
            for id in self.order.split_off(marker) {
                if let Some(slot) = self.slots.get_mut(id.0 as usize) {
                    if slot.take().is_some() {
                        self.free.push(id.0);
                    }
                }
            }
        }
    }
}
