//! Cell identity, slot values and the kind registry.
//!
//! A cell is a run of 64-bit words. Word 0 is the [`Header`]; the remaining
//! words are slots holding [`Value`]s. What the slots mean is decided by the
//! cell's kind: every kind registers a [`TraceFn`] that reports the slots
//! holding strong edges, and optionally a [`FinalizeFn`] that runs before the
//! cell's memory is reclaimed.

use std::fmt;
use std::num::NonZeroU64;

use crate::trace::{trace_all_slots, trace_nothing, Tracer};
use crate::zone::ZoneId;

/// Size of one cell word in bytes.
pub const WORD_SIZE: usize = 8;

/// Smallest cell: a header plus one word that can hold a forwarding pointer.
pub const MIN_CELL_WORDS: usize = 2;

/// Largest number of slots a single cell can carry.
pub const MAX_SLOTS: usize = u16::MAX as usize;

/// Number of words a cell with `slots` slots occupies.
#[must_use]
pub const fn cell_words(slots: usize) -> usize {
    let words = slots + 1;
    if words < MIN_CELL_WORDS {
        MIN_CELL_WORDS
    } else {
        words
    }
}

// ============================================================================
// CellPtr encoding
// ============================================================================
//
// bit 0        always 0 (distinguishes cells from integers inside a Value)
// tenured:     bits 1..17 slot, 17..41 arena, 41..57 zone
// nursery:     bits 1..33 word offset, 33..62 epoch
// bits 62..64  space tag

const SPACE_SHIFT: u32 = 62;
const SPACE_NURSERY: u64 = 1;
const SPACE_TENURED: u64 = 2;

const SLOT_SHIFT: u32 = 1;
const SLOT_MASK: u64 = 0xFFFF;
const ARENA_SHIFT: u32 = 17;
const ARENA_MASK: u64 = 0x00FF_FFFF;
const ZONE_SHIFT: u32 = 41;
const ZONE_MASK: u64 = 0xFFFF;

const OFFSET_SHIFT: u32 = 1;
const OFFSET_MASK: u64 = 0xFFFF_FFFF;
const EPOCH_SHIFT: u32 = 33;
const EPOCH_MASK: u64 = 0x1FFF_FFFF;

/// Largest nursery epoch; the next reset wraps to zero.
#[allow(clippy::cast_possible_truncation)]
pub(crate) const MAX_NURSERY_EPOCH: u32 = EPOCH_MASK as u32;

/// Largest arena index a zone can address.
pub const MAX_ARENAS_PER_ZONE: usize = ARENA_MASK as usize;

/// Which part of the heap a cell lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    /// Young cell in the bump-allocated nursery.
    Nursery,
    /// Cell in one of its zone's arenas.
    Tenured,
}

/// Opaque identity of a heap cell.
///
/// Tenured pointers encode `(zone, arena, slot)`; nursery pointers encode the
/// nursery epoch and a word offset, so a pointer that survived a minor
/// collection without being updated is recognized as stale instead of
/// silently reading another cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellPtr(NonZeroU64);

impl CellPtr {
    #[must_use]
    pub(crate) const fn tenured(zone: ZoneId, arena: u32, slot: u16) -> Self {
        let bits = (SPACE_TENURED << SPACE_SHIFT)
            | ((zone.0 as u64 & ZONE_MASK) << ZONE_SHIFT)
            | ((arena as u64 & ARENA_MASK) << ARENA_SHIFT)
            | ((slot as u64 & SLOT_MASK) << SLOT_SHIFT);
        // SAFETY: the space tag is non-zero, so `bits` is non-zero.
        Self(unsafe { NonZeroU64::new_unchecked(bits) })
    }

    #[must_use]
    pub(crate) const fn nursery(epoch: u32, offset: u32) -> Self {
        let bits = (SPACE_NURSERY << SPACE_SHIFT)
            | ((epoch as u64 & EPOCH_MASK) << EPOCH_SHIFT)
            | ((offset as u64 & OFFSET_MASK) << OFFSET_SHIFT);
        // SAFETY: the space tag is non-zero, so `bits` is non-zero.
        Self(unsafe { NonZeroU64::new_unchecked(bits) })
    }

    /// Raw encoding, suitable for storing in a [`Value`].
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0.get()
    }

    /// Decodes a raw pointer, rejecting anything that is not a well-formed
    /// cell encoding.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Option<Self> {
        if bits & 1 != 0 {
            return None;
        }
        match bits >> SPACE_SHIFT {
            SPACE_NURSERY | SPACE_TENURED => match NonZeroU64::new(bits) {
                Some(nz) => Some(Self(nz)),
                None => None,
            },
            _ => None,
        }
    }

    /// The space this cell lives in.
    #[must_use]
    pub const fn space(self) -> Space {
        if self.0.get() >> SPACE_SHIFT == SPACE_NURSERY {
            Space::Nursery
        } else {
            Space::Tenured
        }
    }

    /// Whether this is a young (nursery) cell.
    #[must_use]
    pub const fn is_nursery(self) -> bool {
        matches!(self.space(), Space::Nursery)
    }

    /// Whether this is a tenured cell.
    #[must_use]
    pub const fn is_tenured(self) -> bool {
        matches!(self.space(), Space::Tenured)
    }

    /// Zone of a tenured cell. Nursery cells record their zone in the header.
    #[must_use]
    pub const fn tenured_zone(self) -> Option<ZoneId> {
        match self.tenured_parts() {
            Some((zone, _, _)) => Some(zone),
            None => None,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn tenured_parts(self) -> Option<(ZoneId, u32, u16)> {
        if !self.is_tenured() {
            return None;
        }
        let bits = self.0.get();
        Some((
            ZoneId(((bits >> ZONE_SHIFT) & ZONE_MASK) as u16),
            ((bits >> ARENA_SHIFT) & ARENA_MASK) as u32,
            ((bits >> SLOT_SHIFT) & SLOT_MASK) as u16,
        ))
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn nursery_parts(self) -> Option<(u32, u32)> {
        if !self.is_nursery() {
            return None;
        }
        let bits = self.0.get();
        Some((
            ((bits >> EPOCH_SHIFT) & EPOCH_MASK) as u32,
            ((bits >> OFFSET_SHIFT) & OFFSET_MASK) as u32,
        ))
    }
}

impl fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((zone, arena, slot)) = self.tenured_parts() {
            write!(f, "Tenured({zone}:{arena}:{slot})")
        } else if let Some((epoch, offset)) = self.nursery_parts() {
            write!(f, "Nursery(e{epoch}+{offset})")
        } else {
            write!(f, "CellPtr({:#x})", self.0)
        }
    }
}

impl fmt::Display for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Value
// ============================================================================

/// A slot value: `null`, a 63-bit integer, or a cell pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// The null value. Freshly allocated cells hold only nulls.
    pub const NULL: Self = Self(0);

    /// An integer value. The top bit of `i` is lost.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn int(i: i64) -> Self {
        Self(((i as u64) << 1) | 1)
    }

    /// A strong reference to a cell.
    #[must_use]
    pub const fn cell(ptr: CellPtr) -> Self {
        Self(ptr.to_bits())
    }

    /// Raw bits; only meaningful for kinds that store opaque data.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits of this value.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Whether this is the null value.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The integer held by this value, if any.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_int(self) -> Option<i64> {
        if self.0 & 1 == 1 {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    /// The cell referenced by this value, if any.
    #[must_use]
    pub const fn as_cell(self) -> Option<CellPtr> {
        if self.0 == 0 {
            None
        } else {
            CellPtr::from_bits(self.0)
        }
    }
}

impl From<CellPtr> for Value {
    fn from(ptr: CellPtr) -> Self {
        Self::cell(ptr)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::int(i)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Null")
        } else if let Some(i) = self.as_int() {
            write!(f, "Int({i})")
        } else if let Some(ptr) = self.as_cell() {
            write!(f, "Cell({ptr:?})")
        } else {
            write!(f, "Raw({:#x})", self.0)
        }
    }
}

// ============================================================================
// Header
// ============================================================================

const KIND_SHIFT: u32 = 0;
const SLOTS_SHIFT: u32 = 16;
const HEADER_ZONE_SHIFT: u32 = 32;
const FORWARDED_BIT: u64 = 1 << 63;

/// Word 0 of every cell: kind, slot count, zone, and the forwarded flag used
/// while a cell is being moved.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header(u64);

impl Header {
    pub(crate) const fn new(kind: KindId, slots: u16, zone: ZoneId) -> Self {
        Self(
            ((kind.0 as u64) << KIND_SHIFT)
                | ((slots as u64) << SLOTS_SHIFT)
                | ((zone.0 as u64) << HEADER_ZONE_SHIFT),
        )
    }

    pub(crate) const fn from_value(value: Value) -> Self {
        Self(value.0)
    }

    pub(crate) const fn to_value(self) -> Value {
        Value(self.0)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn kind(self) -> KindId {
        KindId((self.0 >> KIND_SHIFT) as u16)
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn slot_count(self) -> usize {
        ((self.0 >> SLOTS_SHIFT) as u16) as usize
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn zone(self) -> ZoneId {
        ZoneId((self.0 >> HEADER_ZONE_SHIFT) as u16)
    }

    pub(crate) const fn is_forwarded(self) -> bool {
        self.0 & FORWARDED_BIT != 0
    }

    pub(crate) const fn forwarded(self) -> Self {
        Self(self.0 | FORWARDED_BIT)
    }

    pub(crate) const fn words(self) -> usize {
        cell_words(self.slot_count())
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("kind", &self.kind())
            .field("slots", &self.slot_count())
            .field("zone", &self.zone())
            .field("forwarded", &self.is_forwarded())
            .finish()
    }
}

// ============================================================================
// Mark colors
// ============================================================================

/// Tri-color mark state of a tenured cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkColor {
    /// Not (yet) found reachable.
    White,
    /// Found reachable, edges not yet scanned.
    Gray,
    /// Found reachable and fully scanned.
    Black,
}

impl MarkColor {
    /// Name used by the diagnostics hooks.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::White => "white",
            Self::Gray => "gray",
            Self::Black => "black",
        }
    }
}

// ============================================================================
// Kinds
// ============================================================================

/// Reports the strong edges held in a cell's slots.
///
/// Implementations must hand every slot that holds a strong cell reference
/// to the tracer, in a stable order, and must let the tracer rewrite it.
pub type TraceFn = fn(slots: &mut [Value], tracer: &mut dyn Tracer);

/// Releases external resources owned by a dying cell. Runs during sweep,
/// before the cell's memory is reused. With helper threads configured it may
/// run off the mutator thread.
pub type FinalizeFn = fn(slots: &[Value]);

/// Tag stored in every cell header selecting its trace and finalize hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindId(pub(crate) u16);

impl KindId {
    pub(crate) const FREE: Self = Self(0);
    /// Every slot is a traced value.
    pub const OBJECT: Self = Self(1);
    /// Opaque data; slots are never traced.
    pub const BLOB: Self = Self(2);
    /// Holder of an ephemeron table. Its slots are unused.
    pub const WEAK_MAP: Self = Self(3);

    /// Registry index of this kind.
    #[must_use]
    pub const fn index(self) -> u16 {
        self.0
    }
}

/// Hooks for one cell kind.
#[derive(Debug, Clone, Copy)]
pub struct KindInfo {
    /// Name shown in diagnostics.
    pub name: &'static str,
    /// Edge enumeration.
    pub trace: TraceFn,
    /// Optional finalizer.
    pub finalize: Option<FinalizeFn>,
}

impl KindInfo {
    /// A kind with the given trace hook and no finalizer.
    #[must_use]
    pub const fn new(name: &'static str, trace: TraceFn) -> Self {
        Self {
            name,
            trace,
            finalize: None,
        }
    }

    /// Attaches a finalizer.
    #[must_use]
    pub const fn with_finalizer(mut self, finalize: FinalizeFn) -> Self {
        self.finalize = Some(finalize);
        self
    }
}

/// Table of kind hooks, indexed by [`KindId`].
#[derive(Debug, Clone)]
pub struct KindRegistry {
    kinds: Vec<KindInfo>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KindRegistry {
    /// A registry holding the built-in kinds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            kinds: vec![
                KindInfo::new("free", trace_nothing),
                KindInfo::new("object", trace_all_slots),
                KindInfo::new("blob", trace_nothing),
                KindInfo::new("weakmap", trace_nothing),
            ],
        }
    }

    /// Adds a kind and returns its id, or `None` once the id space is full.
    pub fn register(&mut self, info: KindInfo) -> Option<KindId> {
        let index = u16::try_from(self.kinds.len()).ok()?;
        self.kinds.push(info);
        Some(KindId(index))
    }

    /// Hooks for `kind`. The reserved free-cell kind is not exposed.
    #[must_use]
    pub fn get(&self, kind: KindId) -> Option<&KindInfo> {
        if kind == KindId::FREE {
            return None;
        }
        self.kinds.get(kind.0 as usize)
    }

    /// Number of registered kinds, including the reserved one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Always false: built-in kinds are registered on creation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub(crate) fn trace_fn(&self, kind: KindId) -> TraceFn {
        self.kinds
            .get(kind.0 as usize)
            .map_or(trace_nothing as TraceFn, |info| info.trace)
    }

    pub(crate) fn finalizer(&self, kind: KindId) -> Option<FinalizeFn> {
        self.kinds.get(kind.0 as usize).and_then(|info| info.finalize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenured_ptr_roundtrip_parts() {
        let ptr = CellPtr::tenured(ZoneId(7), 1234, 99);
        assert!(ptr.is_tenured());
        assert_eq!(ptr.tenured_parts(), Some((ZoneId(7), 1234, 99)));
        assert_eq!(ptr.tenured_zone(), Some(ZoneId(7)));
        assert_eq!(ptr.to_bits() & 1, 0);
    }

    #[test]
    fn test_nursery_ptr_parts() {
        let ptr = CellPtr::nursery(3, 4096);
        assert!(ptr.is_nursery());
        assert_eq!(ptr.nursery_parts(), Some((3, 4096)));
        assert_eq!(ptr.tenured_zone(), None);
        assert_ne!(ptr, CellPtr::nursery(4, 4096));
    }

    #[test]
    fn test_nursery_epoch_keeps_high_bits() {
        let low = CellPtr::nursery(1, 8);
        let high = CellPtr::nursery(1 + 0x1_0000, 8);
        assert_ne!(low, high);
        assert_eq!(high.nursery_parts(), Some((0x1_0001, 8)));

        let last = CellPtr::nursery(MAX_NURSERY_EPOCH, 8);
        assert_eq!(last.nursery_parts(), Some((MAX_NURSERY_EPOCH, 8)));
        assert_eq!(last.space(), Space::Nursery);
        assert_eq!(CellPtr::from_bits(last.to_bits()), Some(last));
    }

    #[test]
    fn test_from_bits_rejects_garbage() {
        assert_eq!(CellPtr::from_bits(0), None);
        assert_eq!(CellPtr::from_bits(1), None);
        assert_eq!(CellPtr::from_bits(42 << 1), None);
        let ptr = CellPtr::tenured(ZoneId(1), 2, 3);
        assert_eq!(CellPtr::from_bits(ptr.to_bits()), Some(ptr));
    }

    #[test]
    fn test_value_variants() {
        assert!(Value::NULL.is_null());
        assert_eq!(Value::NULL.as_cell(), None);
        assert_eq!(Value::int(-5).as_int(), Some(-5));
        assert_eq!(Value::int(-5).as_cell(), None);

        let ptr = CellPtr::tenured(ZoneId(2), 0, 1);
        let v = Value::cell(ptr);
        assert_eq!(v.as_cell(), Some(ptr));
        assert_eq!(v.as_int(), None);
    }

    #[test]
    fn test_header_fields() {
        let header = Header::new(KindId::OBJECT, 5, ZoneId(9));
        assert_eq!(header.kind(), KindId::OBJECT);
        assert_eq!(header.slot_count(), 5);
        assert_eq!(header.zone(), ZoneId(9));
        assert_eq!(header.words(), 6);
        assert!(!header.is_forwarded());

        let fwd = header.forwarded();
        assert!(fwd.is_forwarded());
        assert_eq!(fwd.kind(), KindId::OBJECT);
        assert_eq!(fwd.zone(), ZoneId(9));
        assert_eq!(fwd.words(), header.words());
    }

    #[test]
    fn test_min_cell_words() {
        assert_eq!(cell_words(0), MIN_CELL_WORDS);
        assert_eq!(cell_words(1), 2);
        assert_eq!(cell_words(7), 8);
    }

    #[test]
    fn test_registry_builtins_and_register() {
        let mut registry = KindRegistry::new();
        assert!(registry.get(KindId::FREE).is_none());
        assert_eq!(registry.get(KindId::OBJECT).map(|k| k.name), Some("object"));

        fn finalize(_slots: &[Value]) {}
        let id = registry
            .register(KindInfo::new("resource", trace_nothing).with_finalizer(finalize))
            .expect("room for kinds");
        assert_eq!(id.index(), 4);
        assert!(registry.finalizer(id).is_some());
        assert!(registry.finalizer(KindId::OBJECT).is_none());
    }
}
