//! Per-thread heaps.
//!
//! Every thread reaching the allocator gets a [`ThreadLocalHeap`]
//! through thread-local storage. A heap owns superpage blocks and
//! serves three allocation paths:
//!
//! - **small** (below one page): size-class blocks carved from small
//!   page blocks, with per-class lists of page blocks that still have
//!   free blocks;
//! - **medium** (up to the usable pages of one superpage block): one
//!   page block per allocation;
//! - **huge**: a dedicated multi-superpage block.
//!
//! Frees route by ownership. The owning thread frees locally; any other
//! thread writes an [`UnusedBlock`] node into the dead allocation and
//! pushes it onto the owner's mailbox, which the owner drains on its
//! next allocator call. An ownerless block is claimed by an adoption
//! CAS first.
//!
//! A heap's lists are touched only by its own thread. The shared part —
//! the mailbox behind the owner pointer — lives in a [`HeapHandle`]
//! kept alive in a process-wide registry, so a remote free racing a
//! thread's exit never pushes onto freed memory.

use std::cell::RefCell;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use intrusive_collections::{LinkedList, UnsafeRef};
use parking_lot::Mutex;

use crate::layout::{class_index, CLASS_COUNT, PAGES_PER_SUPERPAGE, PAGE_SIZE, SIZE_CLASSES};
use crate::list::{MailboxStack, UnusedBlock};
use crate::metrics;
use crate::space::GasSpace;
use crate::superpage::{
    ActivePbAdapter, MemoryType, OwnedSpbAdapter, PageBlockHeader, SuperpageBlockHeader,
    AVAILABLE_PAGES, HEADER_PAGES,
};
use crate::tracing;
use crate::{AllocError, Block};

/// Largest size served by the medium path; anything at or above goes to
/// a dedicated multi-superpage block.
pub const MEDIUM_LIMIT: usize = AVAILABLE_PAGES * PAGE_SIZE;

/// The shared, adoption-visible identity of a heap: what other threads
/// reach through a superpage block's owner pointer.
///
/// Handles are kept alive for the life of the process by the registry,
/// so an owner pointer loaded concurrently with the owning thread's
/// exit still refers to valid memory.
pub struct HeapHandle {
    mailbox: MailboxStack,
    live: AtomicBool,
}

impl HeapHandle {
    /// `true` while the owning thread is alive. A dead handle's mailbox
    /// stays valid for racing pushes; the entries are picked up when
    /// the enclosing superpage block is adopted and emptied.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

static REGISTRY: Mutex<Vec<Arc<HeapHandle>>> = Mutex::new(Vec::new());

/// Number of heaps created so far in this process.
pub fn heap_count() -> usize {
    REGISTRY.lock().len()
}

/// Number of heaps whose owning thread is still alive.
pub fn live_heap_count() -> usize {
    REGISTRY.lock().iter().filter(|h| h.is_live()).count()
}

/// The per-thread allocator state.
pub struct ThreadLocalHeap {
    shared: Arc<HeapHandle>,
    owned: LinkedList<OwnedSpbAdapter>,
    active: [LinkedList<ActivePbAdapter>; CLASS_COUNT],
}

thread_local! {
    static HEAP: RefCell<ThreadLocalHeap> = RefCell::new(ThreadLocalHeap::new());
}

/// Execute a function with access to the calling thread's heap.
pub fn with_heap<F, R>(f: F) -> R
where
    F: FnOnce(&mut ThreadLocalHeap) -> R,
{
    HEAP.with(|heap| f(&mut heap.borrow_mut()))
}

impl ThreadLocalHeap {
    fn new() -> Self {
        let shared = Arc::new(HeapHandle {
            mailbox: MailboxStack::new(),
            live: AtomicBool::new(true),
        });
        REGISTRY.lock().push(Arc::clone(&shared));
        Self {
            shared,
            owned: LinkedList::new(OwnedSpbAdapter::new()),
            active: std::array::from_fn(|_| LinkedList::new(ActivePbAdapter::new())),
        }
    }

    fn handle_ptr(&self) -> *mut HeapHandle {
        Arc::as_ptr(&self.shared).cast_mut()
    }

    /// Serves an allocation of `size` bytes aligned to `align`.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or exceeds the page
    /// size.
    pub fn allocate(&mut self, size: usize, align: usize) -> Result<Block, AllocError> {
        assert!(
            align.is_power_of_two() && align <= PAGE_SIZE,
            "alignment must be a power of two no larger than a page"
        );
        self.drain_mailbox();
        // Rounding the size up to the alignment makes every path's
        // natural placement sufficient: small blocks are aligned to
        // their power-of-two size, page blocks to the page.
        let size = size.max(align).max(1);
        if size < PAGE_SIZE {
            self.allocate_small(class_index(size))
        } else if size < MEDIUM_LIMIT {
            self.allocate_medium(size)
        } else {
            self.allocate_huge(size)
        }
    }

    fn allocate_small(&mut self, class: usize) -> Result<Block, AllocError> {
        let info = &SIZE_CLASSES[class];
        let front = self.active[class]
            .front()
            .get()
            .map(|pb| ptr::from_ref(pb).cast_mut());
        let pb = match front {
            Some(pb) => pb,
            None => {
                let pb = self.create_page_block(info.page_count, MemoryType::Small, class as u8)?;
                self.active[class].push_front(unsafe { UnsafeRef::from_raw(pb.as_ptr()) });
                pb.as_ptr()
            }
        };
        // SAFETY: headers of owned superpage blocks are exclusively ours.
        let pbr = unsafe { &mut *pb };
        let ptr = pbr.take_small_block();
        if pbr.available(info) == 0 {
            // Full page blocks leave the active list until a block of
            // theirs is freed.
            let removed = unsafe { self.active[class].cursor_mut_from_ptr(pb).remove() };
            debug_assert!(removed.is_some());
        }
        metrics::update(|m| m.small_allocs += 1);
        Ok(Block {
            ptr,
            size: info.block_size,
        })
    }

    fn allocate_medium(&mut self, size: usize) -> Result<Block, AllocError> {
        let pages = size.div_ceil(PAGE_SIZE);
        let pb = self.create_page_block(pages, MemoryType::Medium, 0)?;
        // SAFETY: a page block's data pages are inside a mapped superpage.
        let ptr = unsafe { NonNull::new_unchecked(pb.as_ref().data_ptr()) };
        metrics::update(|m| m.medium_allocs += 1);
        Ok(Block {
            ptr,
            size: pages * PAGE_SIZE,
        })
    }

    fn allocate_huge(&mut self, size: usize) -> Result<Block, AllocError> {
        let pages = size.div_ceil(PAGE_SIZE);
        let count = (HEADER_PAGES + pages).div_ceil(PAGES_PER_SUPERPAGE);
        let spb = self.create_superpage_block(count, pages)?;
        let spbr = unsafe { spb.as_ref() };
        // SAFETY: the huge region is inside the committed run.
        let ptr = unsafe { NonNull::new_unchecked(spbr.huge_ptr()) };
        metrics::update(|m| m.huge_allocs += 1);
        Ok(Block {
            ptr,
            size: pages * PAGE_SIZE,
        })
    }

    /// Carves a page block out of an owned superpage block, reserving a
    /// fresh one when none has room.
    fn create_page_block(
        &mut self,
        pages: usize,
        kind: MemoryType,
        class: u8,
    ) -> Result<NonNull<PageBlockHeader>, AllocError> {
        let mut cursor = self.owned.front();
        while let Some(spb) = cursor.get() {
            let spb = ptr::from_ref(spb).cast_mut();
            // SAFETY: owned blocks are mutated only by this thread.
            if let Some(pb) = unsafe { (*spb).allocate_page_block(pages, kind, class) } {
                return Ok(pb);
            }
            cursor.move_next();
        }
        let spb = self.create_superpage_block(1, 0)?;
        unsafe { (*spb.as_ptr()).allocate_page_block(pages, kind, class) }
            .ok_or(AllocError::AddressSpaceExhausted)
    }

    fn create_superpage_block(
        &mut self,
        count: usize,
        huge_pages: usize,
    ) -> Result<NonNull<SuperpageBlockHeader>, AllocError> {
        let _span = tracing::superpage_reserve(count);
        let space = GasSpace::global()?;
        let base = space.reserve_local_run(count)?;
        // SAFETY: the run was just committed and is exclusively ours.
        let spb = unsafe { SuperpageBlockHeader::format(base, count, huge_pages, self.handle_ptr()) };
        self.owned
            .push_front(unsafe { UnsafeRef::from_raw(spb.as_ptr()) });
        metrics::update(|m| m.superpages_reserved += count as u64);
        Ok(spb)
    }

    /// Frees the allocation containing `ptr`, which may point anywhere
    /// inside it.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is outside the global address space.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        self.drain_mailbox();
        let space = GasSpace::global()?;
        assert!(
            space.contains(ptr.as_ptr()),
            "pointer outside the global address space"
        );
        if !space.in_local_interval(ptr.as_ptr()) {
            // Freeing another node's memory needs the coherence layer.
            return Err(AllocError::RemoteNode);
        }
        let spb = space.superpage_base(ptr.as_ptr()).cast::<SuperpageBlockHeader>();
        let my = self.handle_ptr();
        // SAFETY: a live allocation keeps its superpage block mapped.
        let mut owner = unsafe { spb.as_ref() }.owner();
        loop {
            if owner == my {
                unsafe { self.local_free(spb, ptr.as_ptr()) };
                return Ok(());
            }
            if owner.is_null() {
                match unsafe { spb.as_ref() }.adopt(my) {
                    Ok(()) => {
                        unsafe { self.adopt_superpage_block(spb) };
                        unsafe { self.local_free(spb, ptr.as_ptr()) };
                        return Ok(());
                    }
                    Err(actual) => owner = actual,
                }
            } else {
                unsafe { self.remote_free(ptr.as_ptr(), spb.as_ptr(), owner) };
                return Ok(());
            }
        }
    }

    /// Hands a block back to its owning thread by parking an
    /// [`UnusedBlock`] node inside the allocation and pushing it onto
    /// the owner's mailbox.
    unsafe fn remote_free(
        &mut self,
        ptr: *mut u8,
        spb: *mut SuperpageBlockHeader,
        owner: *mut HeapHandle,
    ) {
        // First node-aligned slot of the allocation: every allocation
        // base is at least node-aligned, so this stays inside it.
        let node = ((ptr as usize) & !(size_of::<UnusedBlock>() - 1)) as *mut UnusedBlock;
        unsafe {
            node.write(UnusedBlock {
                next: AtomicPtr::new(ptr::null_mut()),
                spb,
            });
            (*owner).mailbox.push(NonNull::new_unchecked(node));
        }
        metrics::update(|m| m.remote_frees += 1);
    }

    /// Takes the whole mailbox and frees every entry locally.
    fn drain_mailbox(&mut self) {
        let mut node = self.shared.mailbox.take_all();
        if node.is_null() {
            return;
        }
        let _span = tracing::mailbox_drain();
        let mut drained = 0u64;
        while let Some(current) = NonNull::new(node) {
            // Read the links out before freeing: the node lives inside
            // the block being freed and is reused immediately.
            let (next, spb) = {
                let r = unsafe { current.as_ref() };
                (r.next.load(Ordering::Relaxed), r.spb)
            };
            debug_assert!(!spb.is_null());
            unsafe {
                self.local_free(NonNull::new_unchecked(spb), current.as_ptr().cast());
            }
            node = next;
            drained += 1;
        }
        metrics::update(|m| m.mailbox_drained += drained);
    }

    /// Frees `ptr` inside an owned superpage block.
    ///
    /// # Safety
    ///
    /// `spb` must be owned by this heap and `ptr` must point into a
    /// live allocation of it.
    unsafe fn local_free(&mut self, spb: NonNull<SuperpageBlockHeader>, ptr: *mut u8) {
        let spbr = unsafe { &mut *spb.as_ptr() };
        if spbr.in_huge_region(ptr) {
            let base = spbr.base_ptr();
            let count = spbr.superpage_count();
            if spbr.used_blocks() == 0 {
                // Nothing else lives here; release the whole block.
                unsafe { self.release_superpage_block(spb) };
            } else {
                spbr.destroy_huge_alloc();
                let space = GasSpace::global()
                    .expect("the space outlives every superpage block");
                space.trim_run(base, count);
                metrics::update(|m| m.superpages_released += (count - 1) as u64);
            }
            return;
        }

        let pb = spbr.page_block_at(ptr);
        let pbr = unsafe { &mut *pb.as_ptr() };
        match pbr.kind() {
            MemoryType::Small => {
                let class = &SIZE_CLASSES[pbr.class_index()];
                let was_full = pbr.available(class) == 0;
                unsafe { pbr.put_small_block(ptr, spb.as_ptr()) };
                if pbr.is_all_free() {
                    if pbr.active_link.is_linked() {
                        let removed = unsafe {
                            self.active[class.index]
                                .cursor_mut_from_ptr(pb.as_ptr())
                                .remove()
                        };
                        debug_assert!(removed.is_some());
                    }
                    spbr.free_page_block(pb);
                    if spbr.is_fully_unused() {
                        unsafe { self.release_superpage_block(spb) };
                    }
                } else if was_full {
                    self.active[class.index]
                        .push_front(unsafe { UnsafeRef::from_raw(pb.as_ptr()) });
                }
            }
            MemoryType::Medium => {
                spbr.free_page_block(pb);
                if spbr.is_fully_unused() {
                    unsafe { self.release_superpage_block(spb) };
                }
            }
            kind => debug_assert!(false, "free of a {kind:?} page block"),
        }
    }

    /// Unlinks a fully unused superpage block and returns its
    /// superpages to the space.
    unsafe fn release_superpage_block(&mut self, spb: NonNull<SuperpageBlockHeader>) {
        let (base, count) = {
            let r = unsafe { spb.as_ref() };
            debug_assert!(r.is_fully_unused());
            (r.base_ptr(), r.superpage_count())
        };
        let removed = unsafe { self.owned.cursor_mut_from_ptr(spb.as_ptr()).remove() };
        debug_assert!(removed.is_some());
        let space = GasSpace::global().expect("the space outlives every superpage block");
        space.release_run(base, count);
        tracing::superpage_released(base as usize, count);
        metrics::update(|m| m.superpages_released += count as u64);
    }

    /// Links a freshly adopted superpage block into this heap: the
    /// block joins the owned list and its small page blocks with free
    /// blocks re-enter the active lists.
    unsafe fn adopt_superpage_block(&mut self, spb: NonNull<SuperpageBlockHeader>) {
        self.owned
            .push_front(unsafe { UnsafeRef::from_raw(spb.as_ptr()) });
        let spbr = unsafe { &mut *spb.as_ptr() };
        let mut page = HEADER_PAGES;
        while page < spbr.avail_end() {
            let pb = spbr.page_block_head_at(page);
            let pbr = unsafe { pb.as_ref() };
            if pbr.kind() == MemoryType::Small {
                let class = &SIZE_CLASSES[pbr.class_index()];
                if pbr.available(class) > 0 {
                    debug_assert!(!pbr.active_link.is_linked());
                    self.active[class.index]
                        .push_front(unsafe { UnsafeRef::from_raw(pb.as_ptr()) });
                }
            }
            page += pbr.run_pages();
        }
        tracing::adopted(spb.as_ptr() as usize);
        metrics::update(|m| m.adoptions += 1);
    }
}

impl Drop for ThreadLocalHeap {
    fn drop(&mut self) {
        // Return every pending remote free while the lists still work,
        // then orphan the surviving blocks. Their memory stays mapped;
        // the next thread to free into one wins the adoption CAS.
        self.drain_mailbox();
        for list in &mut self.active {
            while list.pop_front().is_some() {}
        }
        while let Some(spb) = self.owned.pop_front() {
            let spb = UnsafeRef::into_raw(spb);
            unsafe { (*spb).disown() };
            tracing::disowned(spb as usize);
        }
        self.shared.live.store(false, Ordering::Release);
    }
}
