//! Weak maps.
//!
//! A weak map is a tenured cell of kind [`KindId::WEAK_MAP`] whose entries
//! live in the runtime's [`EphemeronTable`] rather than in its slots. An
//! entry's value is kept alive only while both the map and the key are:
//! marking resolves entries to a fixed point once the ordinary graph is
//! exhausted, and entries with a dead key or map are dropped when marking
//! ends.

use rustc_hash::FxHashMap;

use crate::cell::{CellPtr, KindId, Value};
use crate::error::GcError;
use crate::runtime::GcRuntime;
use crate::zone::ZoneId;

/// Entries of every weak map, keyed by map cell.
#[derive(Debug, Default)]
pub struct EphemeronTable {
    maps: FxHashMap<CellPtr, FxHashMap<CellPtr, Value>>,
}

impl EphemeronTable {
    pub(crate) fn insert_map(&mut self, map: CellPtr) {
        self.maps.entry(map).or_default();
    }

    pub(crate) fn remove_map(&mut self, map: CellPtr) -> bool {
        self.maps.remove(&map).is_some()
    }

    /// Whether `map` is a registered weak map.
    #[must_use]
    pub fn contains_map(&self, map: CellPtr) -> bool {
        self.maps.contains_key(&map)
    }

    pub(crate) fn set(&mut self, map: CellPtr, key: CellPtr, value: Value) -> bool {
        match self.maps.get_mut(&map) {
            Some(entries) => {
                entries.insert(key, value);
                true
            }
            None => false,
        }
    }

    /// Value stored under `key`.
    #[must_use]
    pub fn get(&self, map: CellPtr, key: CellPtr) -> Option<Value> {
        self.maps.get(&map)?.get(&key).copied()
    }

    pub(crate) fn delete(&mut self, map: CellPtr, key: CellPtr) -> bool {
        self.maps
            .get_mut(&map)
            .is_some_and(|entries| entries.remove(&key).is_some())
    }

    /// Entries of one map.
    #[must_use]
    pub fn entries(&self, map: CellPtr) -> usize {
        self.maps.get(&map).map_or(0, FxHashMap::len)
    }

    /// Number of registered maps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// No maps registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Entries across all maps.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.maps.values().map(FxHashMap::len).sum()
    }

    /// Registered map cells.
    pub fn maps(&self) -> impl Iterator<Item = CellPtr> + '_ {
        self.maps.keys().copied()
    }

    /// Every `(map, key, value)` entry.
    pub fn iter(&self) -> impl Iterator<Item = (CellPtr, CellPtr, Value)> + '_ {
        self.maps
            .iter()
            .flat_map(|(&map, entries)| entries.iter().map(move |(&k, &v)| (map, k, v)))
    }

    pub(crate) fn remove_entries(&mut self, dead: &[(CellPtr, CellPtr)]) {
        for &(map, key) in dead {
            self.delete(map, key);
        }
    }

    /// Rewrites maps, keys and values. A map that does not resolve is
    /// dropped with its entries; an entry whose key or value does not
    /// resolve is dropped.
    pub(crate) fn remap(&mut self, mut resolve: impl FnMut(CellPtr) -> Option<CellPtr>) {
        let old = std::mem::take(&mut self.maps);
        for (map, entries) in old {
            let Some(map) = resolve(map) else {
                continue;
            };
            let entries = entries
                .into_iter()
                .filter_map(|(key, value)| {
                    let key = resolve(key)?;
                    let value = match value.as_cell() {
                        Some(cell) => Value::cell(resolve(cell)?),
                        None => value,
                    };
                    Some((key, value))
                })
                .collect();
            self.maps.insert(map, entries);
        }
    }
}

impl GcRuntime {
    /// Allocates an empty weak map in `zone`.
    ///
    /// # Errors
    ///
    /// `NoSuchZone`, or `OutOfMemory` if the map cell cannot be allocated.
    pub fn new_weak_map(&mut self, zone: ZoneId) -> Result<CellPtr, GcError> {
        let map = self.allocate(zone, KindId::WEAK_MAP, 0)?;
        self.weak_maps.insert_map(map);
        Ok(map)
    }

    fn check_weak_map(&self, map: CellPtr) -> Result<(), GcError> {
        let kind = self.kind_of(map)?;
        if kind == KindId::WEAK_MAP && self.weak_maps.contains_map(map) {
            Ok(())
        } else {
            Err(GcError::UnknownKind(kind.index()))
        }
    }

    /// Sets `map[key] = value`.
    ///
    /// # Errors
    ///
    /// `StaleCell` if the map, key or value cell is dead, `UnknownKind` if
    /// `map` is not a weak map.
    pub fn weak_map_set(&mut self, map: CellPtr, key: CellPtr, value: Value) -> Result<(), GcError> {
        self.check_weak_map(map)?;
        if !self.is_alive(key) {
            return Err(GcError::StaleCell(key));
        }
        if let Some(cell) = value.as_cell() {
            if !self.is_alive(cell) {
                return Err(GcError::StaleCell(cell));
            }
        }
        self.weak_maps.set(map, key, value);
        Ok(())
    }

    /// Reads `map[key]`.
    ///
    /// # Errors
    ///
    /// As [`weak_map_set`](Self::weak_map_set) for the map.
    pub fn weak_map_get(&self, map: CellPtr, key: CellPtr) -> Result<Option<Value>, GcError> {
        self.check_weak_map(map)?;
        Ok(self.weak_maps.get(map, key))
    }

    /// Whether `map` has an entry for `key`.
    ///
    /// # Errors
    ///
    /// As [`weak_map_set`](Self::weak_map_set) for the map.
    pub fn weak_map_has(&self, map: CellPtr, key: CellPtr) -> Result<bool, GcError> {
        Ok(self.weak_map_get(map, key)?.is_some())
    }

    /// Removes `map[key]`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// As [`weak_map_set`](Self::weak_map_set) for the map.
    pub fn weak_map_delete(&mut self, map: CellPtr, key: CellPtr) -> Result<bool, GcError> {
        self.check_weak_map(map)?;
        Ok(self.weak_maps.delete(map, key))
    }

    /// Number of entries in `map`.
    ///
    /// # Errors
    ///
    /// As [`weak_map_set`](Self::weak_map_set) for the map.
    pub fn weak_map_len(&self, map: CellPtr) -> Result<usize, GcError> {
        self.check_weak_map(map)?;
        Ok(self.weak_maps.entries(map))
    }

    /// All weak map entries.
    #[must_use]
    pub const fn weak_maps(&self) -> &EphemeronTable {
        &self.weak_maps
    }

    /// Shades the values of entries whose map and key are live. Returns
    /// whether new gray cells were produced.
    pub(crate) fn mark_ephemerons(&mut self) -> bool {
        let values: Vec<CellPtr> = self
            .weak_maps
            .iter()
            .filter_map(|(map, key, value)| Some((map, key, value.as_cell()?)))
            .filter(|&(map, key, value)| {
                self.is_marked_live(map) && self.is_marked_live(key) && !self.is_marked_live(value)
            })
            .map(|(_, _, value)| value)
            .collect();
        for value in values {
            self.shade(value);
        }
        !self.incremental.mark_stack.is_empty()
    }

    /// Drops maps that died and entries whose key died this cycle.
    pub(crate) fn sweep_weak_maps(&mut self) {
        let dead_maps: Vec<CellPtr> = self
            .weak_maps
            .maps()
            .filter(|&map| !self.is_marked_live(map))
            .collect();
        for map in dead_maps {
            self.weak_maps.remove_map(map);
        }
        let dead_entries: Vec<(CellPtr, CellPtr)> = self
            .weak_maps
            .iter()
            .filter(|&(_, key, _)| !self.is_marked_live(key))
            .map(|(map, key, _)| (map, key))
            .collect();
        self.weak_maps.remove_entries(&dead_entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(slot: u16) -> CellPtr {
        CellPtr::tenured(ZoneId(1), 0, slot)
    }

    #[test]
    fn test_table_set_get_delete() {
        let mut table = EphemeronTable::default();
        assert!(!table.set(cell(0), cell(1), Value::int(5)));
        table.insert_map(cell(0));
        assert!(table.set(cell(0), cell(1), Value::int(5)));
        assert_eq!(table.get(cell(0), cell(1)), Some(Value::int(5)));
        assert_eq!(table.entries(cell(0)), 1);
        assert!(table.delete(cell(0), cell(1)));
        assert!(!table.delete(cell(0), cell(1)));
        assert_eq!(table.entry_count(), 0);
    }

    #[test]
    fn test_remap_drops_dead_keys_and_values() {
        let mut table = EphemeronTable::default();
        table.insert_map(cell(0));
        table.set(cell(0), cell(1), Value::cell(cell(2)));
        table.set(cell(0), cell(3), Value::int(1));
        table.set(cell(0), cell(4), Value::cell(cell(5)));

        table.remap(|p| match p {
            p if p == cell(3) || p == cell(5) => None,
            p if p == cell(2) => Some(cell(9)),
            p => Some(p),
        });

        assert_eq!(table.entries(cell(0)), 1);
        assert_eq!(table.get(cell(0), cell(1)), Some(Value::cell(cell(9))));
    }

    #[test]
    fn test_remap_drops_dead_map() {
        let mut table = EphemeronTable::default();
        table.insert_map(cell(0));
        table.set(cell(0), cell(1), Value::NULL);
        table.remap(|p| (p != cell(0)).then_some(p));
        assert!(table.is_empty());
    }
}
