//! A per-thread memory allocator over a distributed global address
//! space.
//!
//! `gas-heap` reserves one large virtual-address region — the global
//! address space (GAS) — sliced into per-node intervals of 2 MiB
//! superpages, and serves allocations of any size from the local
//! node's slice. It is the node-local core of a distributed
//! shared-memory runtime.
//!
//! # Architecture
//!
//! - A lock-free [`tracker::SuperpageTracker`] reserves contiguous runs
//!   of superpages through two atomic bitmaps.
//! - [`superpage::SuperpageBlockHeader`]s live inside the superpages
//!   they manage and subdivide the first superpage into page blocks,
//!   coalescing free neighbors.
//! - Per-thread [`heap::ThreadLocalHeap`]s serve small (sub-page),
//!   medium (multi-page) and huge (multi-superpage) allocations.
//! - Cross-thread frees travel through a lock-free **mailbox**; blocks
//!   of an exited thread are **adopted** by the next thread that frees
//!   into them, via a compare-and-swap on the block's owner field.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::ptr::NonNull;
//!
//! let config = gas_heap::GasConfig {
//!     base_addr: 0x6000_0000_0000,
//!     node_count: 1,
//!     node_id: 0,
//!     superpages_per_node: 256,
//! };
//! gas_heap::init(config).expect("reserve the address space");
//!
//! let block = gas_heap::allocate(64, 16).expect("allocate");
//! // Interior pointers are fine: any address inside the allocation
//! // resolves to it.
//! let interior = unsafe { NonNull::new_unchecked(block.ptr.as_ptr().add(10)) };
//! gas_heap::deallocate(interior).expect("deallocate");
//! ```
//!
//! # Threading
//!
//! Every thread allocates from its own heap; any thread may free any
//! pointer. No allocator operation blocks: contention on the shared
//! tracker and mailboxes is resolved by CAS retries.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

use std::fmt;
use std::io;
use std::ptr::NonNull;

pub mod bits;
pub mod heap;
pub mod layout;
pub mod list;
mod metrics;
pub mod space;
pub mod superpage;
pub mod tracker;
mod tracing;

pub use heap::with_heap;
pub use metrics::{heap_metrics, HeapMetrics};
pub use space::GasConfig;

/// A successful allocation: the pointer and the actual usable size,
/// which is at least what was asked for.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    /// Start of the allocation.
    pub ptr: NonNull<u8>,
    /// Usable size in bytes.
    pub size: usize,
}

/// Errors surfaced by the allocator.
///
/// There are no retryable cases: exhaustion and VM failures are fatal
/// for typical clients, and the remaining variants are setup mistakes.
#[derive(Debug)]
pub enum AllocError {
    /// [`init`] was called more than once.
    AlreadyInitialized,
    /// An allocator call ran before [`init`].
    Uninitialized,
    /// The configuration passed to [`init`] is inconsistent.
    InvalidConfig(&'static str),
    /// No free superpage run of the needed length exists in this
    /// node's interval.
    AddressSpaceExhausted,
    /// The pointer belongs to another node; freeing it requires the
    /// coherence layer, which is not part of the node-local core.
    RemoteNode,
    /// The VM layer failed to reserve, commit or decommit memory.
    Vm(io::Error),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => f.write_str("the global address space is already initialized"),
            Self::Uninitialized => f.write_str("the global address space is not initialized"),
            Self::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            Self::AddressSpaceExhausted => f.write_str("local address-space interval exhausted"),
            Self::RemoteNode => f.write_str("pointer belongs to a remote node"),
            Self::Vm(err) => write!(f, "virtual-memory operation failed: {err}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Vm(err) => Some(err),
            _ => None,
        }
    }
}

/// Reserves the global address space and fixes the node geometry.
///
/// Must be called exactly once per process, before any allocation.
pub fn init(config: GasConfig) -> Result<(), AllocError> {
    space::GasSpace::init(&config)
}

/// Allocates `size` bytes aligned to `align` from the calling thread's
/// heap.
///
/// `align` must be a power of two no larger than a page. The returned
/// block's usable size is at least `size`.
pub fn allocate(size: usize, align: usize) -> Result<Block, AllocError> {
    with_heap(|heap| heap.allocate(size, align))
}

/// Frees the allocation containing `ptr`.
///
/// `ptr` may point anywhere inside a live allocation. Frees of blocks
/// owned by another thread are forwarded to that thread's mailbox.
pub fn deallocate(ptr: NonNull<u8>) -> Result<(), AllocError> {
    with_heap(|heap| heap.deallocate(ptr))
}

/// Frees a block returned by [`allocate`]. The size is advisory.
pub fn deallocate_sized(block: Block) -> Result<(), AllocError> {
    with_heap(|heap| heap.deallocate(block.ptr))
}
