use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MappingInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MappingInner {
    /// Creates a private anonymous read/write mapping.
    pub fn map_anon(len: usize) -> io::Result<Self> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        // SAFETY: a fresh anonymous mapping with no address hint cannot alias
        // any existing memory.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Drops the physical pages behind the range. Private anonymous pages
    /// read back as zero after `MADV_DONTNEED` on Linux; elsewhere the
    /// contents are unspecified.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        // SAFETY: caller checked the range lies inside the mapping.
        let rc = unsafe {
            libc::madvise(
                self.ptr.cast::<u8>().add(offset).cast::<libc::c_void>(),
                len,
                libc::MADV_DONTNEED,
            )
        };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    /// Unix keeps decommitted ranges accessible; pages fault back in on touch.
    #[allow(clippy::unnecessary_wraps, clippy::unused_self)]
    pub const fn commit(&self, _offset: usize, _len: usize) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MappingInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MappingInner {}
unsafe impl Sync for MappingInner {}
