use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct ReservationInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl ReservationInner {
    /// Reserves `len` bytes of inaccessible address space, optionally at
    /// an exact address.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn reserve(at_addr: usize, len: usize) -> io::Result<ReservationInner> {
        let addr = if at_addr == 0 {
            ptr::null_mut()
        } else {
            at_addr as *mut libc::c_void
        };

        // PROT_NONE keeps the range reserved without backing storage;
        // MAP_NORESERVE avoids charging swap for the whole span.
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | MAP_NORESERVE;

        let ptr = unsafe { libc::mmap(addr, len, libc::PROT_NONE, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        // Exact-placement enforcement happens in the caller; it needs the
        // returned pointer either way.
        Ok(ReservationInner { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let ret = unsafe {
            libc::mprotect(
                self.ptr.cast::<u8>().add(offset).cast::<libc::c_void>(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let start = unsafe { self.ptr.cast::<u8>().add(offset).cast::<libc::c_void>() };

        // Drop the physical pages first, then seal the range so stray
        // accesses fault instead of silently re-faulting zero pages.
        let ret = unsafe { libc::madvise(start, len, libc::MADV_DONTNEED) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        let ret = unsafe { libc::mprotect(start, len, libc::PROT_NONE) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ReservationInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for ReservationInner {}
unsafe impl Sync for ReservationInner {}
