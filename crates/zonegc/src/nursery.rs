//! The nursery: a bump-allocated region for young cells.
//!
//! Young cells are allocated by advancing a cursor through one contiguous
//! mapping. A minor collection copies the reachable ones into their zones'
//! arenas and resets the cursor; the nursery epoch is bumped at the same time
//! so pointers into the previous generation of young cells are detectably
//! stale.
//!
//! Tenured cells that may point into the nursery are remembered in the
//! [`StoreBuffer`], which the minor collector treats as extra roots.

use std::fmt;
use std::io;
use std::ptr::NonNull;

use rustc_hash::FxHashSet;
use sys_alloc::Mapping;

use crate::cell::{cell_words, CellPtr, Header, KindId, Value, MAX_NURSERY_EPOCH, WORD_SIZE};
use crate::zone::ZoneId;

/// Bump-allocated young generation.
pub struct Nursery {
    region: Option<(Mapping, NonNull<Value>)>,
    capacity_words: usize,
    cursor: usize,
    epoch: u32,
    cells: usize,
}

// SAFETY: the nursery exclusively owns its mapping.
unsafe impl Send for Nursery {}

impl Nursery {
    /// A nursery of `bytes` bytes. Zero disables young allocation.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the region cannot be mapped.
    pub fn new(bytes: usize) -> io::Result<Self> {
        let capacity_words = bytes / WORD_SIZE;
        let region = if capacity_words == 0 {
            None
        } else {
            let mapping = Mapping::anonymous(capacity_words * WORD_SIZE)?;
            let base = NonNull::new(mapping.ptr().cast::<Value>())
                .ok_or_else(|| io::Error::other("null nursery mapping"))?;
            Some((mapping, base))
        };
        Ok(Self {
            region,
            capacity_words,
            cursor: 0,
            epoch: 0,
            cells: 0,
        })
    }

    /// Whether young allocation is possible at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.region.is_some()
    }

    /// Current epoch; bumped on every reset.
    #[must_use]
    pub const fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Bytes handed out since the last reset.
    #[must_use]
    pub const fn used_bytes(&self) -> usize {
        self.cursor * WORD_SIZE
    }

    /// Total nursery size.
    #[must_use]
    pub const fn capacity_bytes(&self) -> usize {
        self.capacity_words * WORD_SIZE
    }

    /// Cells allocated since the last reset.
    #[must_use]
    pub const fn cell_count(&self) -> usize {
        self.cells
    }

    /// Nothing allocated since the last reset.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    fn words(&self) -> &[Value] {
        match &self.region {
            // SAFETY: the mapping spans `capacity_words` words and lives as
            // long as `self`.
            Some((_, base)) => unsafe {
                std::slice::from_raw_parts(base.as_ptr(), self.capacity_words)
            },
            None => &[],
        }
    }

    fn words_mut(&mut self) -> &mut [Value] {
        match &self.region {
            // SAFETY: as in `words`; `&mut self` guarantees exclusivity.
            Some((_, base)) => unsafe {
                std::slice::from_raw_parts_mut(base.as_ptr(), self.capacity_words)
            },
            None => &mut [],
        }
    }

    /// Bump-allocates a cell, or returns `None` when the nursery is full.
    pub(crate) fn alloc(&mut self, zone: ZoneId, kind: KindId, slots: usize) -> Option<CellPtr> {
        let slot_count = u16::try_from(slots).ok()?;
        let words = cell_words(slots);
        if !self.is_enabled() || self.cursor + words > self.capacity_words {
            return None;
        }
        let offset = u32::try_from(self.cursor).ok()?;
        let start = self.cursor;
        let cell = &mut self.words_mut()[start..start + words];
        cell.fill(Value::NULL);
        cell[0] = Header::new(kind, slot_count, zone).to_value();
        self.cursor += words;
        self.cells += 1;
        Some(CellPtr::nursery(self.epoch, offset))
    }

    /// Word offset of a cell of the current epoch.
    fn offset_of(&self, ptr: CellPtr) -> Option<usize> {
        let (epoch, offset) = ptr.nursery_parts()?;
        let offset = offset as usize;
        (epoch == self.epoch && offset < self.cursor).then_some(offset)
    }

    /// Header of a current-epoch cell, forwarded or not.
    pub(crate) fn header(&self, ptr: CellPtr) -> Option<Header> {
        self.offset_of(ptr)
            .map(|offset| Header::from_value(self.words()[offset]))
    }

    /// Whether `ptr` names a live (current epoch, not forwarded) cell.
    pub(crate) fn contains(&self, ptr: CellPtr) -> bool {
        self.header(ptr).is_some_and(|h| !h.is_forwarded())
    }

    /// Words of a live young cell, header included.
    pub(crate) fn cell(&self, ptr: CellPtr) -> Option<&[Value]> {
        let offset = self.offset_of(ptr)?;
        let header = Header::from_value(self.words()[offset]);
        if header.is_forwarded() {
            return None;
        }
        Some(&self.words()[offset..offset + header.words()])
    }

    pub(crate) fn cell_mut(&mut self, ptr: CellPtr) -> Option<&mut [Value]> {
        let offset = self.offset_of(ptr)?;
        let header = Header::from_value(self.words()[offset]);
        if header.is_forwarded() {
            return None;
        }
        Some(&mut self.words_mut()[offset..offset + header.words()])
    }

    /// Zone a young cell will be promoted into.
    pub(crate) fn zone_of(&self, ptr: CellPtr) -> Option<ZoneId> {
        self.header(ptr).map(Header::zone)
    }

    /// Marks a cell as moved and records its new location in word 1.
    pub(crate) fn forward(&mut self, ptr: CellPtr, to: CellPtr) {
        if let Some(offset) = self.offset_of(ptr) {
            let words = self.words_mut();
            let header = Header::from_value(words[offset]);
            words[offset] = header.forwarded().to_value();
            words[offset + 1] = Value::cell(to);
        }
    }

    /// Live cells of the current epoch in allocation order.
    pub(crate) fn live_cells(&self) -> Vec<CellPtr> {
        let words = self.words();
        let mut cells = Vec::with_capacity(self.cells);
        let mut offset = 0;
        while offset < self.cursor {
            let header = Header::from_value(words[offset]);
            if !header.is_forwarded() {
                if let Ok(off) = u32::try_from(offset) {
                    cells.push(CellPtr::nursery(self.epoch, off));
                }
            }
            offset += header.words();
        }
        cells
    }

    /// Empties the nursery and starts a new epoch.
    pub(crate) fn reset(&mut self) {
        self.cursor = 0;
        self.cells = 0;
        self.epoch = if self.epoch == MAX_NURSERY_EPOCH {
            0
        } else {
            self.epoch + 1
        };
    }
}

impl fmt::Debug for Nursery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nursery")
            .field("enabled", &self.is_enabled())
            .field("used_bytes", &self.used_bytes())
            .field("capacity_bytes", &self.capacity_bytes())
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Tenured cells that may hold pointers into the nursery.
#[derive(Debug, Default)]
pub struct StoreBuffer {
    holders: FxHashSet<CellPtr>,
}

impl StoreBuffer {
    pub(crate) fn record(&mut self, holder: CellPtr) {
        if holder.is_tenured() {
            self.holders.insert(holder);
        }
    }

    /// Whether `holder` is remembered.
    #[must_use]
    pub fn contains(&self, holder: CellPtr) -> bool {
        self.holders.contains(&holder)
    }

    /// Remembered holders.
    pub fn iter(&self) -> impl Iterator<Item = CellPtr> + '_ {
        self.holders.iter().copied()
    }

    /// Number of remembered holders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.holders.len()
    }

    /// Nothing remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.holders.clear();
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&CellPtr) -> bool) {
        self.holders.retain(f);
    }

    pub(crate) fn remap(&mut self, mut resolve: impl FnMut(CellPtr) -> Option<CellPtr>) {
        self.holders = self.holders.drain().filter_map(&mut resolve).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_allocation_and_full() {
        let mut nursery = Nursery::new(64).expect("nursery");
        let a = nursery.alloc(ZoneId(1), KindId::OBJECT, 3).expect("a");
        let b = nursery.alloc(ZoneId(1), KindId::OBJECT, 3).expect("b");
        assert_eq!(nursery.used_bytes(), 64);
        assert!(nursery.alloc(ZoneId(1), KindId::OBJECT, 0).is_none());
        assert_eq!(nursery.live_cells(), vec![a, b]);
        assert_eq!(nursery.zone_of(a), Some(ZoneId(1)));
    }

    #[test]
    fn test_disabled_nursery() {
        let mut nursery = Nursery::new(0).expect("nursery");
        assert!(!nursery.is_enabled());
        assert!(nursery.alloc(ZoneId(1), KindId::OBJECT, 1).is_none());
    }

    #[test]
    fn test_reset_makes_pointers_stale() {
        let mut nursery = Nursery::new(1024).expect("nursery");
        let a = nursery.alloc(ZoneId(1), KindId::OBJECT, 1).expect("a");
        nursery.cell_mut(a).expect("cell")[1] = Value::int(7);
        assert!(nursery.contains(a));

        nursery.reset();
        assert!(!nursery.contains(a));
        assert!(nursery.cell(a).is_none());

        let b = nursery.alloc(ZoneId(1), KindId::OBJECT, 1).expect("b");
        assert_ne!(a, b);
        assert_eq!(nursery.cell(b).map(|c| c[1]), Some(Value::NULL));
    }

    #[test]
    fn test_pointer_stays_stale_past_u16_epochs() {
        let mut nursery = Nursery::new(1024).expect("nursery");
        let old = nursery.alloc(ZoneId(1), KindId::OBJECT, 1).expect("old");
        for _ in 0..=u32::from(u16::MAX) {
            nursery.reset();
        }
        assert_eq!(nursery.epoch(), 0x1_0000);

        let new = nursery.alloc(ZoneId(1), KindId::OBJECT, 1).expect("new");
        assert_ne!(old, new);
        assert!(!nursery.contains(old));
        assert!(nursery.contains(new));
    }

    #[test]
    fn test_epoch_wraps_at_encoding_limit() {
        let mut nursery = Nursery::new(1024).expect("nursery");
        nursery.epoch = MAX_NURSERY_EPOCH;
        let last = nursery.alloc(ZoneId(1), KindId::OBJECT, 0).expect("last");
        assert_eq!(last.nursery_parts(), Some((MAX_NURSERY_EPOCH, 0)));
        nursery.reset();
        assert_eq!(nursery.epoch(), 0);
        assert!(!nursery.contains(last));
    }

    #[test]
    fn test_forwarding() {
        let mut nursery = Nursery::new(1024).expect("nursery");
        let a = nursery.alloc(ZoneId(2), KindId::OBJECT, 2).expect("a");
        let b = nursery.alloc(ZoneId(2), KindId::OBJECT, 0).expect("b");
        let to = CellPtr::tenured(ZoneId(2), 0, 5);
        nursery.forward(a, to);
        assert!(!nursery.contains(a));
        assert!(nursery.header(a).is_some_and(Header::is_forwarded));
        assert_eq!(nursery.header(a).map(Header::zone), Some(ZoneId(2)));
        assert!(nursery.cell(a).is_none());
        assert_eq!(nursery.live_cells(), vec![b]);
    }

    #[test]
    fn test_store_buffer_ignores_nursery_holders() {
        let mut buffer = StoreBuffer::default();
        buffer.record(CellPtr::nursery(0, 0));
        assert!(buffer.is_empty());
        let holder = CellPtr::tenured(ZoneId(1), 0, 0);
        buffer.record(holder);
        buffer.record(holder);
        assert_eq!(buffer.len(), 1);
        buffer.remap(|_| None);
        assert!(buffer.is_empty());
    }
}
