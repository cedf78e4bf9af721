//! `BiBOP` (Big Bag of Pages) arena memory.
//!
//! Tenured memory is divided into 4KB arenas. Each arena holds cells of a
//! single size class, so a cell is addressed by `(arena, slot)` and its mark
//! bits live in the arena's side bitmaps. Arenas are carved out of chunks of
//! pages obtained from the OS through [`sys_alloc::Mapping`]; cells too big
//! for the largest size class get a dedicated mapping.
//!
//! # Layout
//!
//! ```text
//! PagePool ── chunk (Mapping) ── page 0 ── Arena (class 32B: 128 cells)
//!                             ├─ page 1 ── Arena (class 64B: 64 cells)
//!                             └─ ...
//!          ── large Mapping ───────────── Arena (1 cell)
//! ```

use std::fmt;
use std::ptr::NonNull;

use sys_alloc::Mapping;

use crate::cell::{MarkColor, Value, WORD_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// Size of each arena (4KB).
pub const ARENA_SIZE: usize = 4096;

/// Words in one arena.
pub const ARENA_WORDS: usize = ARENA_SIZE / WORD_SIZE;

/// Size classes for cell allocation.
/// Cells are routed to the smallest size class that fits them.
pub const SIZE_CLASSES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Number of small size classes.
pub const NUM_SIZE_CLASSES: usize = SIZE_CLASSES.len();

/// Cells larger than this get a dedicated large arena.
pub const MAX_SMALL_OBJECT_SIZE: usize = 2048;

/// Enough bits for the smallest size class (256 cells of 16 bytes).
const BITMAP_WORDS: usize = ARENA_SIZE / SIZE_CLASSES[0] / 64;

/// Index into [`SIZE_CLASSES`] for a cell of `bytes`, or `None` for large
/// cells.
#[must_use]
pub const fn size_class_for(bytes: usize) -> Option<usize> {
    let mut i = 0;
    while i < NUM_SIZE_CLASSES {
        if bytes <= SIZE_CLASSES[i] {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Cells per arena for size class `class`.
#[must_use]
pub const fn cells_per_arena(class: usize) -> usize {
    ARENA_SIZE / SIZE_CLASSES[class]
}

// ============================================================================
// Bitmap
// ============================================================================

/// One bit per cell of an arena.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Bitmap([u64; BITMAP_WORDS]);

impl Bitmap {
    pub(crate) const fn get(&self, index: usize) -> bool {
        (self.0[index / 64] >> (index % 64)) & 1 == 1
    }

    pub(crate) const fn set(&mut self, index: usize) {
        self.0[index / 64] |= 1 << (index % 64);
    }

    pub(crate) const fn clear(&mut self, index: usize) {
        self.0[index / 64] &= !(1 << (index % 64));
    }

    pub(crate) const fn clear_all(&mut self) {
        self.0 = [0; BITMAP_WORDS];
    }

    pub(crate) fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub(crate) fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().enumerate().flat_map(|(i, &word)| {
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + tz)
            })
        })
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap({} set)", self.count())
    }
}

// ============================================================================
// Arena
// ============================================================================

/// Location of a pooled page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageId {
    chunk: u32,
    page: u32,
}

#[derive(Debug)]
enum Backing {
    Page(PageId),
    Large(Mapping),
}

/// A page of same-sized cells with its allocation and mark bitmaps.
///
/// Free cells are threaded through a free list: word 0 holds the reserved
/// free kind (all zero) and word 1 the index of the next free cell.
pub struct Arena {
    base: NonNull<Value>,
    backing: Backing,
    class: Option<usize>,
    cell_words: usize,
    capacity: usize,
    bump: usize,
    free_head: Option<usize>,
    live: usize,
    allocated: Bitmap,
    black: Bitmap,
    gray: Bitmap,
}

// SAFETY: an arena exclusively owns the memory behind `base`; the page pool
// never hands the same page to two arenas.
unsafe impl Send for Arena {}

impl Arena {
    pub(crate) fn new_small(page: PageId, base: NonNull<Value>, class: usize) -> Self {
        let cell_words = SIZE_CLASSES[class] / WORD_SIZE;
        Self {
            base,
            backing: Backing::Page(page),
            class: Some(class),
            cell_words,
            capacity: cells_per_arena(class),
            bump: 0,
            free_head: None,
            live: 0,
            allocated: Bitmap::default(),
            black: Bitmap::default(),
            gray: Bitmap::default(),
        }
    }

    pub(crate) fn new_large(mapping: Mapping, words: usize) -> Option<Self> {
        let base = NonNull::new(mapping.ptr().cast::<Value>())?;
        Some(Self {
            base,
            backing: Backing::Large(mapping),
            class: None,
            cell_words: words,
            capacity: 1,
            bump: 0,
            free_head: None,
            live: 0,
            allocated: Bitmap::default(),
            black: Bitmap::default(),
            gray: Bitmap::default(),
        })
    }

    /// Size class index, `None` for a large arena.
    #[must_use]
    pub const fn size_class(&self) -> Option<usize> {
        self.class
    }

    /// Words per cell.
    #[must_use]
    pub const fn cell_words(&self) -> usize {
        self.cell_words
    }

    /// Cells this arena can hold.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocated cells.
    #[must_use]
    pub const fn live(&self) -> usize {
        self.live
    }

    /// Unallocated cells.
    #[must_use]
    pub const fn free(&self) -> usize {
        self.capacity - self.live
    }

    /// No allocated cells.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// No room for another cell.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.live == self.capacity
    }

    /// Bytes the arena occupies.
    #[must_use]
    pub fn footprint(&self) -> usize {
        match &self.backing {
            Backing::Page(_) => ARENA_SIZE,
            Backing::Large(mapping) => mapping.len(),
        }
    }

    fn words(&self) -> &[Value] {
        // SAFETY: `base` points at `capacity * cell_words` words owned by this
        // arena for its whole lifetime.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.capacity * self.cell_words) }
    }

    fn words_mut(&mut self) -> &mut [Value] {
        // SAFETY: as in `words`, and `&mut self` guarantees exclusivity.
        unsafe {
            std::slice::from_raw_parts_mut(self.base.as_ptr(), self.capacity * self.cell_words)
        }
    }

    /// Whether `slot` holds an allocated cell.
    #[must_use]
    pub fn is_allocated(&self, slot: usize) -> bool {
        slot < self.capacity && self.allocated.get(slot)
    }

    /// Words of an allocated cell, header included.
    pub(crate) fn cell(&self, slot: usize) -> Option<&[Value]> {
        if !self.is_allocated(slot) {
            return None;
        }
        let start = slot * self.cell_words;
        Some(&self.words()[start..start + self.cell_words])
    }

    pub(crate) fn cell_mut(&mut self, slot: usize) -> Option<&mut [Value]> {
        if !self.is_allocated(slot) {
            return None;
        }
        let start = slot * self.cell_words;
        let words = self.cell_words;
        Some(&mut self.words_mut()[start..start + words])
    }

    /// Takes a free cell, zero-filled. Free-list cells are reused before the
    /// bump cursor advances.
    pub(crate) fn try_alloc(&mut self) -> Option<usize> {
        let slot = if let Some(head) = self.free_head {
            let next = self.words()[head * self.cell_words + 1];
            self.free_head = next
                .as_int()
                .and_then(|n| usize::try_from(n).ok());
            head
        } else if self.bump < self.capacity {
            self.bump += 1;
            self.bump - 1
        } else {
            return None;
        };

        let start = slot * self.cell_words;
        let words = self.cell_words;
        self.words_mut()[start..start + words].fill(Value::NULL);
        self.allocated.set(slot);
        self.black.clear(slot);
        self.gray.clear(slot);
        self.live += 1;
        Some(slot)
    }

    /// Returns a cell to the free list.
    pub(crate) fn release(&mut self, slot: usize) {
        if !self.is_allocated(slot) {
            return;
        }
        let start = slot * self.cell_words;
        let link = self
            .free_head
            .and_then(|h| i64::try_from(h).ok())
            .map_or(Value::NULL, Value::int);
        let cell = &mut self.words_mut()[start..start + 2];
        cell[0] = Value::NULL;
        cell[1] = link;
        self.allocated.clear(slot);
        self.black.clear(slot);
        self.gray.clear(slot);
        self.free_head = Some(slot);
        self.live -= 1;
    }

    /// Mark color of `slot`. Unallocated slots read as white.
    #[must_use]
    pub fn color(&self, slot: usize) -> MarkColor {
        if slot >= self.capacity {
            MarkColor::White
        } else if self.black.get(slot) {
            MarkColor::Black
        } else if self.gray.get(slot) {
            MarkColor::Gray
        } else {
            MarkColor::White
        }
    }

    pub(crate) fn set_color(&mut self, slot: usize, color: MarkColor) {
        match color {
            MarkColor::White => {
                self.black.clear(slot);
                self.gray.clear(slot);
            }
            MarkColor::Gray => {
                self.black.clear(slot);
                self.gray.set(slot);
            }
            MarkColor::Black => {
                self.gray.clear(slot);
                self.black.set(slot);
            }
        }
    }

    /// Clear all mark bits.
    pub(crate) fn clear_marks(&mut self) {
        self.black.clear_all();
        self.gray.clear_all();
    }

    /// Allocated slots in address order.
    pub(crate) fn allocated_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.allocated.iter_ones()
    }

    /// Allocated slots whose mark is white, collected up front so the
    /// caller can release them.
    pub(crate) fn white_slots(&self) -> Vec<usize> {
        self.allocated
            .iter_ones()
            .filter(|&s| !self.black.get(s) && !self.gray.get(s))
            .collect()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("class", &self.class)
            .field("cell_words", &self.cell_words)
            .field("live", &self.live)
            .field("capacity", &self.capacity)
            .field("black", &self.black)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// PagePool
// ============================================================================

struct Chunk {
    mapping: Mapping,
    free: usize,
    decommitted: bool,
}

/// Source of arena pages, bounded by the configured heap limit.
///
/// Pages come from chunks of `chunk_pages` contiguous pages. A chunk whose
/// pages are all free can be decommitted while idle; it is committed again
/// the next time one of its pages is handed out.
pub struct PagePool {
    chunks: Vec<Chunk>,
    free_pages: Vec<PageId>,
    chunk_pages: usize,
    max_bytes: usize,
    reserved_bytes: usize,
    pages_in_use: usize,
    large_bytes: usize,
}

impl PagePool {
    /// An empty pool that reserves at most `max_bytes`.
    #[must_use]
    pub fn new(chunk_pages: usize, max_bytes: usize) -> Self {
        Self {
            chunks: Vec::new(),
            free_pages: Vec::new(),
            chunk_pages: chunk_pages.max(1),
            max_bytes,
            reserved_bytes: 0,
            pages_in_use: 0,
            large_bytes: 0,
        }
    }

    const fn chunk_bytes(&self) -> usize {
        self.chunk_pages * ARENA_SIZE
    }

    fn reserve_chunk(&mut self) -> Option<()> {
        let bytes = self.chunk_bytes();
        if self.reserved_bytes + bytes > self.max_bytes {
            return None;
        }
        let mapping = Mapping::anonymous(bytes).ok()?;
        let chunk = u32::try_from(self.chunks.len()).ok()?;
        self.chunks.push(Chunk {
            mapping,
            free: self.chunk_pages,
            decommitted: false,
        });
        self.reserved_bytes += bytes;
        for page in (0..self.chunk_pages).rev() {
            let page = u32::try_from(page).ok()?;
            self.free_pages.push(PageId { chunk, page });
        }
        Some(())
    }

    /// Hands out one page, growing the pool if the limit allows.
    pub(crate) fn acquire_page(&mut self) -> Option<(PageId, NonNull<Value>)> {
        if self.free_pages.is_empty() {
            self.reserve_chunk()?;
        }
        let id = self.free_pages.pop()?;
        let chunk = &mut self.chunks[id.chunk as usize];
        if chunk.decommitted {
            if chunk.mapping.commit(0, chunk.mapping.len()).is_err() {
                self.free_pages.push(id);
                return None;
            }
            chunk.decommitted = false;
        }
        chunk.free -= 1;
        self.pages_in_use += 1;
        // SAFETY: `page < chunk_pages`, and the mapping spans at least
        // `chunk_pages * ARENA_SIZE` bytes.
        let ptr = unsafe { chunk.mapping.ptr().add(id.page as usize * ARENA_SIZE) };
        NonNull::new(ptr.cast::<Value>()).map(|p| (id, p))
    }

    pub(crate) fn release_page(&mut self, id: PageId) {
        if let Some(chunk) = self.chunks.get_mut(id.chunk as usize) {
            chunk.free += 1;
            self.pages_in_use -= 1;
            self.free_pages.push(id);
        }
    }

    /// Maps a dedicated region for a large cell.
    pub(crate) fn acquire_large(&mut self, bytes: usize) -> Option<Mapping> {
        let rounded = sys_alloc::round_to_granularity(bytes);
        if self.reserved_bytes + rounded > self.max_bytes {
            return None;
        }
        let mapping = Mapping::anonymous(bytes).ok()?;
        self.reserved_bytes += mapping.len();
        self.large_bytes += mapping.len();
        Some(mapping)
    }

    fn release_large(&mut self, mapping: Mapping) {
        self.reserved_bytes -= mapping.len();
        self.large_bytes -= mapping.len();
        drop(mapping);
    }

    /// Gives an arena's memory back to the pool.
    pub(crate) fn release_arena(&mut self, arena: Arena) {
        match arena.backing {
            Backing::Page(id) => self.release_page(id),
            Backing::Large(mapping) => self.release_large(mapping),
        }
    }

    /// Decommits every chunk with no pages in use. Returns the bytes
    /// handed back to the OS.
    pub fn decommit_idle(&mut self) -> usize {
        let chunk_pages = self.chunk_pages;
        let mut released = 0;
        for chunk in &mut self.chunks {
            if chunk.free == chunk_pages && !chunk.decommitted {
                // SAFETY: every page of the chunk is free, so no arena
                // references its memory.
                if unsafe { chunk.mapping.decommit(0, chunk.mapping.len()) }.is_ok() {
                    chunk.decommitted = true;
                    released += chunk.mapping.len();
                }
            }
        }
        released
    }

    /// Pages that can still be handed out without exceeding the limit.
    #[must_use]
    pub fn available_pages(&self) -> usize {
        let headroom = self.max_bytes.saturating_sub(self.reserved_bytes);
        self.free_pages.len() + (headroom / self.chunk_bytes()) * self.chunk_pages
    }

    /// Pages currently backing arenas.
    #[must_use]
    pub const fn pages_in_use(&self) -> usize {
        self.pages_in_use
    }

    /// Bytes held by arenas, pooled pages and large cells together.
    #[must_use]
    pub const fn bytes_in_use(&self) -> usize {
        self.pages_in_use * ARENA_SIZE + self.large_bytes
    }

    /// Bytes reserved from the OS.
    #[must_use]
    pub const fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// The configured limit.
    #[must_use]
    pub const fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Chunks currently decommitted.
    #[must_use]
    pub fn decommitted_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.decommitted).count()
    }
}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("chunks", &self.chunks.len())
            .field("free_pages", &self.free_pages.len())
            .field("pages_in_use", &self.pages_in_use)
            .field("reserved_bytes", &self.reserved_bytes)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_arena(pool: &mut PagePool, class: usize) -> Arena {
        let (id, base) = pool.acquire_page().expect("page");
        Arena::new_small(id, base, class)
    }

    #[test]
    fn test_size_class_routing() {
        assert_eq!(size_class_for(1), Some(0));
        assert_eq!(size_class_for(16), Some(0));
        assert_eq!(size_class_for(17), Some(1));
        assert_eq!(size_class_for(2048), Some(7));
        assert_eq!(size_class_for(2049), None);
        assert_eq!(cells_per_arena(0), 256);
        assert_eq!(cells_per_arena(7), 2);
    }

    #[test]
    fn test_bitmap_ops() {
        let mut bm = Bitmap::default();
        bm.set(0);
        bm.set(63);
        bm.set(64);
        bm.set(255);
        assert!(bm.get(63));
        assert_eq!(bm.count(), 4);
        assert_eq!(bm.iter_ones().collect::<Vec<_>>(), vec![0, 63, 64, 255]);
        bm.clear(63);
        assert!(!bm.get(63));
        bm.clear_all();
        assert_eq!(bm.count(), 0);
    }

    #[test]
    fn test_arena_fills_then_reuses_freed_slots() {
        let mut pool = PagePool::new(4, 1 << 20);
        let mut arena = small_arena(&mut pool, 7);
        assert_eq!(arena.capacity(), 2);

        let a = arena.try_alloc().expect("slot");
        let b = arena.try_alloc().expect("slot");
        assert!(arena.is_full());
        assert_eq!(arena.try_alloc(), None);

        arena.release(a);
        assert_eq!(arena.live(), 1);
        assert!(!arena.is_allocated(a));
        assert_eq!(arena.try_alloc(), Some(a));
        assert!(arena.is_allocated(b));
    }

    #[test]
    fn test_arena_alloc_zeroes_cell() {
        let mut pool = PagePool::new(4, 1 << 20);
        let mut arena = small_arena(&mut pool, 1);
        let slot = arena.try_alloc().expect("slot");
        arena.cell_mut(slot).expect("cell")[2] = Value::int(9);
        arena.release(slot);
        let again = arena.try_alloc().expect("slot");
        assert_eq!(again, slot);
        assert!(arena.cell(again).expect("cell").iter().all(|v| v.is_null()));
    }

    #[test]
    fn test_arena_colors() {
        let mut pool = PagePool::new(4, 1 << 20);
        let mut arena = small_arena(&mut pool, 0);
        let a = arena.try_alloc().expect("slot");
        let b = arena.try_alloc().expect("slot");
        assert_eq!(arena.color(a), MarkColor::White);
        arena.set_color(a, MarkColor::Gray);
        assert_eq!(arena.color(a), MarkColor::Gray);
        arena.set_color(a, MarkColor::Black);
        assert_eq!(arena.color(a), MarkColor::Black);
        assert_eq!(arena.white_slots(), vec![b]);
        arena.clear_marks();
        assert_eq!(arena.color(a), MarkColor::White);
    }

    #[test]
    fn test_pool_respects_limit() {
        let mut pool = PagePool::new(2, 2 * ARENA_SIZE);
        assert_eq!(pool.available_pages(), 2);
        let first = pool.acquire_page().expect("page");
        let _second = pool.acquire_page().expect("page");
        assert!(pool.acquire_page().is_none());
        assert_eq!(pool.available_pages(), 0);

        pool.release_page(first.0);
        assert_eq!(pool.available_pages(), 1);
        assert!(pool.acquire_page().is_some());
    }

    #[test]
    fn test_pool_decommits_idle_chunks() {
        let mut pool = PagePool::new(2, 1 << 20);
        let (a, _) = pool.acquire_page().expect("page");
        assert_eq!(pool.decommit_idle(), 0);
        pool.release_page(a);
        assert!(pool.decommit_idle() > 0);
        assert_eq!(pool.decommitted_chunks(), 1);

        let (_, base) = pool.acquire_page().expect("page after decommit");
        assert_eq!(pool.decommitted_chunks(), 0);
        // SAFETY: the page was just handed out and is writable.
        unsafe {
            base.as_ptr().write(Value::int(1));
            assert_eq!(base.as_ptr().read(), Value::int(1));
        }
    }

    #[test]
    fn test_large_arena_accounting() {
        let mut pool = PagePool::new(1, 1 << 20);
        let mapping = pool.acquire_large(3 * ARENA_SIZE).expect("large");
        let reserved = pool.reserved_bytes();
        assert!(reserved >= 3 * ARENA_SIZE);

        let mut arena = Arena::new_large(mapping, 3 * ARENA_WORDS).expect("arena");
        assert_eq!(arena.capacity(), 1);
        assert_eq!(arena.size_class(), None);
        let slot = arena.try_alloc().expect("slot");
        assert_eq!(arena.cell(slot).expect("cell").len(), 3 * ARENA_WORDS);

        pool.release_arena(arena);
        assert_eq!(pool.reserved_bytes(), 0);
    }
}
