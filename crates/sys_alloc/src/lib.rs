//! Low-level virtual memory primitives for the collector's page pool.
//!
//! A [`Mapping`] is an anonymous, read/write region obtained straight from the
//! operating system. The page pool carves arenas out of mappings, hands fully
//! free mappings back to the OS with [`Mapping::decommit`] while idle, and
//! re-arms them with [`Mapping::commit`] before reuse.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
/// Mapping lengths are rounded up to this value.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a multiple of [`allocation_granularity`].
#[must_use]
pub fn round_to_granularity(len: usize) -> usize {
    let gran = allocation_granularity();
    len.div_ceil(gran) * gran
}

/// An anonymous memory mapping.
///
/// The region is zero-filled when created and unmapped when dropped.
pub struct Mapping {
    inner: os::MappingInner,
}

impl Mapping {
    /// Maps `len` bytes of fresh, zeroed, read/write memory.
    ///
    /// `len` is rounded up to the allocation granularity.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping cannot be created, or
    /// `InvalidInput` for a zero length.
    pub fn anonymous(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let inner = os::MappingInner::map_anon(round_to_granularity(len))?;
        Ok(Self { inner })
    }

    /// Returns a pointer to the start of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty (never the case for a live mapping).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Releases the physical memory backing `[offset, offset + len)` while
    /// keeping the address range reserved.
    ///
    /// # Safety
    ///
    /// The contents of the range are discarded. No live reference into the
    /// range may exist, and the range must be [`commit`](Self::commit)ted
    /// again before it is written.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the range could not be decommitted.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: range checked above; caller guarantees no live references.
        unsafe { self.inner.decommit(offset, len) }
    }

    /// Makes `[offset, offset + len)` usable again after a decommit.
    ///
    /// Recommitted memory reads as zero on every supported platform except
    /// where the OS lazily reuses pages; callers must not rely on the
    /// previous contents.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the range could not be committed.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        self.inner.commit(offset, len)
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range outside of mapping",
            )),
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: the mapping is plain memory owned by this handle; the handle never
// hands out references, only raw pointers whose use is the caller's concern.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_round_to_granularity() {
        let ag = allocation_granularity();
        assert_eq!(round_to_granularity(1), ag);
        assert_eq!(round_to_granularity(ag), ag);
        assert_eq!(round_to_granularity(ag + 1), 2 * ag);
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = Mapping::anonymous(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_basic_map_is_zeroed() {
        let len = page_size();
        let mapping = Mapping::anonymous(len).expect("failed to map");

        let ptr = mapping.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);
        assert!(mapping.len() >= len);

        unsafe {
            assert_eq!(ptr::read_volatile(ptr), 0);
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_decommit_then_commit() {
        let len = allocation_granularity() * 2;
        let mapping = Mapping::anonymous(len).expect("failed to map");
        let ptr = mapping.ptr();

        unsafe {
            ptr::write_volatile(ptr, 7);
            mapping.decommit(0, mapping.len()).expect("decommit");
        }
        mapping.commit(0, mapping.len()).expect("commit");

        unsafe {
            ptr::write_volatile(ptr, 9);
            assert_eq!(ptr::read_volatile(ptr), 9);
        }
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mapping = Mapping::anonymous(page_size()).expect("failed to map");
        let err = mapping.commit(mapping.len(), 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
