//! The process-wide global address space.
//!
//! [`GasSpace`] maps the node geometry onto one large virtual-address
//! reservation: node `i` owns the superpage interval
//! `[i * superpages_per_node, (i + 1) * superpages_per_node)`. Acquiring
//! a run reserves it in the [`SuperpageTracker`] and commits its pages
//! through the VM layer; releasing decommits first, so a racing acquire
//! never observes stale page contents.
//!
//! The space is a singleton constructed once by [`crate::init`].

use std::ops::Range;
use std::ptr::NonNull;
use std::sync::OnceLock;

use sys_vm::ReserveOptions;

use crate::layout::{PAGE_SIZE, SUPERPAGE_SIZE};
use crate::tracker::SuperpageTracker;
use crate::AllocError;

/// Geometry and placement of the global address space.
#[derive(Debug, Clone)]
pub struct GasConfig {
    /// Virtual address of the start of the space; must be aligned to
    /// the superpage size and the OS allocation granularity.
    pub base_addr: usize,
    /// Number of nodes sharing the space.
    pub node_count: usize,
    /// This process's node.
    pub node_id: usize,
    /// Superpages in each node's interval.
    pub superpages_per_node: usize,
}

static SPACE: OnceLock<GasSpace> = OnceLock::new();

/// The singleton address-space manager.
pub struct GasSpace {
    reservation: sys_vm::Reservation,
    tracker: SuperpageTracker,
    superpages_per_node: usize,
    local_superpages: Range<usize>,
}

impl GasSpace {
    /// Constructs the singleton. Fails if called twice, if the
    /// configuration is inconsistent, or if the OS cannot reserve the
    /// space at the requested base.
    pub(crate) fn init(config: &GasConfig) -> Result<(), AllocError> {
        if config.node_count == 0 || config.superpages_per_node == 0 {
            return Err(AllocError::InvalidConfig(
                "node count and superpages per node must be non-zero",
            ));
        }
        if config.node_id >= config.node_count {
            return Err(AllocError::InvalidConfig("node id out of range"));
        }
        if config.base_addr == 0 || config.base_addr % SUPERPAGE_SIZE != 0 {
            return Err(AllocError::InvalidConfig(
                "base address must be non-null and superpage aligned",
            ));
        }
        if sys_vm::page_size() != PAGE_SIZE {
            return Err(AllocError::InvalidConfig("unsupported OS page size"));
        }
        let total_superpages = config
            .node_count
            .checked_mul(config.superpages_per_node)
            .ok_or(AllocError::InvalidConfig("address space too large"))?;
        let len = total_superpages
            .checked_mul(SUPERPAGE_SIZE)
            .ok_or(AllocError::InvalidConfig("address space too large"))?;

        // SAFETY: the caller designates this range for the allocator's
        // exclusive use; placement failures surface as errors.
        let reservation = unsafe {
            ReserveOptions::new()
                .len(len)
                .at_addr(config.base_addr)
                .reserve()
        }
        .map_err(AllocError::Vm)?;

        let local_start = config.node_id * config.superpages_per_node;
        let space = GasSpace {
            reservation,
            tracker: SuperpageTracker::new(total_superpages),
            superpages_per_node: config.superpages_per_node,
            local_superpages: local_start..local_start + config.superpages_per_node,
        };
        SPACE.set(space).map_err(|_| AllocError::AlreadyInitialized)
    }

    /// The singleton, or [`AllocError::Uninitialized`] before
    /// [`crate::init`] ran.
    pub fn global() -> Result<&'static GasSpace, AllocError> {
        SPACE.get().ok_or(AllocError::Uninitialized)
    }

    fn base_addr(&self) -> usize {
        self.reservation.ptr() as usize
    }

    /// The tracker backing this space.
    pub fn tracker(&self) -> &SuperpageTracker {
        &self.tracker
    }

    /// Whether `ptr` points into the global address space.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.base_addr() && addr < self.base_addr() + self.reservation.len()
    }

    fn superpage_index(&self, ptr: *const u8) -> usize {
        debug_assert!(self.contains(ptr));
        (ptr as usize - self.base_addr()) / SUPERPAGE_SIZE
    }

    /// Whether `ptr` points into this node's interval.
    pub fn in_local_interval(&self, ptr: *const u8) -> bool {
        self.contains(ptr) && self.local_superpages.contains(&self.superpage_index(ptr))
    }

    /// The node owning the interval `ptr` falls in.
    pub fn node_of(&self, ptr: *const u8) -> usize {
        self.superpage_index(ptr) / self.superpages_per_node
    }

    /// Reserves and commits `n` contiguous superpages in the local
    /// interval.
    pub(crate) fn reserve_local_run(&self, n: usize) -> Result<NonNull<u8>, AllocError> {
        let first = self
            .tracker
            .acquire(n, self.local_superpages.clone())
            .map_err(|_| AllocError::AddressSpaceExhausted)?;
        let offset = first * SUPERPAGE_SIZE;
        if let Err(err) = self.reservation.commit(offset, n * SUPERPAGE_SIZE) {
            self.tracker.release(first..first + n);
            return Err(AllocError::Vm(err));
        }
        // SAFETY: the reservation base is non-null.
        Ok(unsafe { NonNull::new_unchecked((self.base_addr() + offset) as *mut u8) })
    }

    /// Decommits and releases a run previously returned by
    /// [`Self::reserve_local_run`].
    ///
    /// # Panics
    ///
    /// Panics when the VM layer fails to decommit; the core does not
    /// attempt recovery from VM failures.
    pub(crate) fn release_run(&self, base: *mut u8, n: usize) {
        let first = self.superpage_index(base);
        self.reservation
            .decommit(first * SUPERPAGE_SIZE, n * SUPERPAGE_SIZE)
            .expect("decommit of a released superpage run failed");
        self.tracker.release(first..first + n);
    }

    /// Shrinks a run to its first superpage, decommitting and releasing
    /// the rest.
    ///
    /// # Panics
    ///
    /// Panics when the VM layer fails to decommit.
    pub(crate) fn trim_run(&self, base: *mut u8, n: usize) {
        debug_assert!(n >= 1);
        if n == 1 {
            return;
        }
        let first = self.superpage_index(base);
        self.reservation
            .decommit((first + 1) * SUPERPAGE_SIZE, (n - 1) * SUPERPAGE_SIZE)
            .expect("decommit of a trimmed superpage run failed");
        self.tracker.trim(first..first + n);
    }

    /// Base address of the superpage block containing `ptr`, resolved
    /// through the sequence table.
    pub fn superpage_base(&self, ptr: *const u8) -> NonNull<u8> {
        let start = self.tracker.sequence_start(self.superpage_index(ptr));
        // SAFETY: the reservation base is non-null.
        unsafe { NonNull::new_unchecked((self.base_addr() + start * SUPERPAGE_SIZE) as *mut u8) }
    }
}
