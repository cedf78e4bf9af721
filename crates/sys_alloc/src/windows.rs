use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

fn system_info() -> SYSTEM_INFO {
    // SAFETY: GetSystemInfo only writes into the provided struct.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity.
///
/// `VirtualAlloc` reservations are aligned to this value (typically 64KB),
/// which is larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    match system_info().dwAllocationGranularity as usize {
        0 => 65536,
        gran => gran,
    }
}

pub fn page_size() -> usize {
    match system_info().dwPageSize as usize {
        0 => 4096,
        size => size,
    }
}

pub struct MappingInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MappingInner {
    /// Reserves and commits a read/write region.
    pub fn map_anon(len: usize) -> io::Result<Self> {
        // SAFETY: no address hint, so the OS picks a fresh region.
        let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };

        if ptr.is_null() {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Decommits the range; the reservation stays in place.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        // SAFETY: caller checked the range lies inside the mapping.
        let ok = unsafe { VirtualFree(self.ptr.cast::<u8>().add(offset).cast(), len, MEM_DECOMMIT) };
        if ok == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Commits a previously decommitted range. Fresh commits are zero-filled.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        // SAFETY: caller checked the range lies inside our reservation.
        let ptr = unsafe {
            VirtualAlloc(
                self.ptr.cast::<u8>().add(offset).cast::<std::ffi::c_void>(),
                len,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MappingInner {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: MEM_RELEASE requires dwSize to be 0 and the base address
            // returned by the original reservation.
            unsafe {
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for MappingInner {}
unsafe impl Sync for MappingInner {}
