//! Frees through interior pointers on all three allocation paths.

use std::ptr::NonNull;

use gas_heap::layout::PAGE_SIZE;
use gas_heap::{allocate, deallocate};

mod common;

fn interior(base: NonNull<u8>, offset: usize) -> NonNull<u8> {
    NonNull::new(unsafe { base.as_ptr().add(offset) }).unwrap()
}

#[test]
fn test_small_interior_free() {
    common::setup();
    let block = allocate(100, 1).expect("small allocation");
    assert_eq!(block.size, 128);
    unsafe { block.ptr.as_ptr().write_bytes(0x11, block.size) };

    // Free through a pointer into the middle of the block; the
    // allocator aligns it down to the block boundary.
    deallocate(interior(block.ptr, 60)).expect("interior free");

    // The slot is back on the free list: the next allocation of the
    // class reuses it.
    let again = allocate(100, 1).expect("reallocation");
    assert_eq!(again.ptr.as_ptr(), block.ptr.as_ptr());
    deallocate(again.ptr).expect("free");
}

#[test]
fn test_medium_interior_free() {
    common::setup();
    let block = allocate(3 * PAGE_SIZE, PAGE_SIZE).expect("medium allocation");
    unsafe { block.ptr.as_ptr().write_bytes(0x22, block.size) };

    // A pointer into the third page still resolves to the page block.
    deallocate(interior(block.ptr, 2 * PAGE_SIZE + 7)).expect("interior free");

    let again = allocate(3 * PAGE_SIZE, PAGE_SIZE).expect("reallocation");
    assert_eq!(again.ptr.as_ptr(), block.ptr.as_ptr());
    deallocate(again.ptr).expect("free");
}

#[test]
fn test_exact_base_free_matches_interior_free() {
    common::setup();
    // Freeing by the exact base and by an interior pointer must be
    // equivalent; alternate the two over the same slot.
    let block = allocate(256, 1).expect("allocation");
    deallocate(block.ptr).expect("exact free");

    let block2 = allocate(256, 1).expect("reallocation");
    assert_eq!(block2.ptr.as_ptr(), block.ptr.as_ptr());
    deallocate(interior(block2.ptr, 255)).expect("last-byte free");

    let block3 = allocate(256, 1).expect("reallocation");
    assert_eq!(block3.ptr.as_ptr(), block.ptr.as_ptr());
    deallocate(block3.ptr).expect("free");
}
