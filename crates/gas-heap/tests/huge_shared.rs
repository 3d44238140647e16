//! A huge block's first superpage keeps serving page blocks, and
//! freeing the huge region trims the block instead of destroying it.

use gas_heap::layout::PAGE_SIZE;
use gas_heap::{allocate, deallocate, heap_metrics};

mod common;

#[test]
fn test_huge_block_shares_first_superpage_with_small_blocks() {
    common::setup();
    let huge = allocate(3 * 1024 * 1024, PAGE_SIZE).expect("huge");
    // The freshest owned superpage block is the huge one; its first
    // superpage has unused pages, so the small block lands there.
    let small = allocate(64, 1).expect("small");
    unsafe {
        huge.ptr.as_ptr().write_bytes(0x77, PAGE_SIZE);
        small.ptr.as_ptr().write_bytes(0x88, small.size);
    }

    // Freeing the huge region while the small allocation lives trims
    // the block to one superpage instead of destroying it.
    let before = heap_metrics();
    deallocate(huge.ptr).expect("free huge");
    let after = heap_metrics();
    assert_eq!(after.superpages_released, before.superpages_released + 1);

    unsafe {
        assert_eq!(*small.ptr.as_ptr(), 0x88);
    }
    deallocate(small.ptr).expect("free small");
}
