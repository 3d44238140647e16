//! Virtual-memory primitives for address-space management.
//!
//! This crate exposes the narrow capability set an address-space manager
//! needs: reserve a large, inaccessible virtual range (optionally at an
//! exact address), then `commit` and `decommit` page-aligned sub-ranges
//! of it on demand. The reservation is unmapped when dropped.
//!
//! Reserved-but-uncommitted pages consume no physical storage and fault
//! on access; `commit` makes them readable and writable; `decommit`
//! returns their physical storage to the OS while keeping the virtual
//! range reserved.

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
/// On Windows, this is typically 64KB. On Unix, this is typically the
/// system page size. Reservation addresses must be aligned to this
/// granularity.
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

/// An owned reservation of virtual address space.
///
/// The whole range starts out inaccessible. Sub-ranges become usable
/// through [`Reservation::commit`] and give their physical storage back
/// through [`Reservation::decommit`]. The virtual range is released when
/// this handle is dropped.
pub struct Reservation {
    inner: os::ReservationInner,
}

impl Reservation {
    /// Returns a pointer to the start of the reserved range.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the reserved range in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the reservation is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Makes the pages in `[offset, offset + len)` readable and writable.
    ///
    /// Both `offset` and `len` must be multiples of [`page_size()`] and
    /// the range must lie within the reservation.
    pub fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        self.inner.commit(offset, len)
    }

    /// Releases the physical storage behind `[offset, offset + len)`.
    ///
    /// The virtual range stays reserved and inaccessible until committed
    /// again. Both `offset` and `len` must be multiples of
    /// [`page_size()`] and the range must lie within the reservation.
    pub fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        self.inner.decommit(offset, len)
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let ps = page_size();
        if offset % ps != 0 || len % ps != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "offset and len must be page aligned",
            ));
        }
        let end = offset
            .checked_add(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "range overflow"))?;
        if end > self.inner.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range outside reservation",
            ));
        }
        Ok(())
    }
}

unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

/// Configuration for creating a reservation.
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    len: usize,
    at_addr: usize,
}

impl ReserveOptions {
    /// Creates a new `ReserveOptions` with default settings (length 0).
    /// You must set a length before reserving.
    pub fn new() -> Self {
        Self { len: 0, at_addr: 0 }
    }

    /// Sets the length of the reservation in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requests the reservation to be placed at this exact virtual
    /// address.
    ///
    /// Unlike a plain hint, placement is strict: [`Self::reserve`]
    /// returns an error if the OS cannot map the range at exactly this
    /// address. The address should be aligned to
    /// [`allocation_granularity()`].
    pub fn at_addr(mut self, addr: usize) -> Self {
        self.at_addr = addr;
        self
    }

    /// Reserves the configured range of virtual address space.
    ///
    /// # Safety
    ///
    /// Reserving at an exact address interacts with the rest of the
    /// process's address-space layout; the caller must pick a range that
    /// no other component expects to own. The returned [`Reservation`]
    /// owns the mapping, but raw pointers derived from it must not
    /// outlive it.
    pub unsafe fn reserve(&self) -> io::Result<Reservation> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe { os::ReservationInner::reserve(self.at_addr, self.len)? };

        if self.at_addr != 0 {
            let got = inner.ptr() as usize;
            if got != self.at_addr {
                // ReservationInner's drop unmaps the misplaced range.
                return Err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!(
                        "exact placement failed: requested {:#x}, got {:#x}",
                        self.at_addr, got
                    ),
                ));
            }
        }

        Ok(Reservation { inner })
    }
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self::new()
    }
}
