//! An orphaned superpage block keeps its reservation until the thread
//! that empties it releases the superpages.

use std::ptr::NonNull;

use gas_heap::space::GasSpace;
use gas_heap::{allocate, deallocate};

mod common;

#[test]
fn test_orphan_superpages_stay_mapped_until_freed() {
    common::setup();
    let space = GasSpace::global().expect("initialized");
    let tracker = space.tracker();

    let addr = std::thread::spawn(|| {
        common::setup();
        let block = allocate(1024, 1).expect("allocation");
        block.ptr.as_ptr() as usize
    })
    .join()
    .unwrap();

    // The orphaned superpage block still holds its reservation.
    let base = space.superpage_base(addr as *const u8);
    let index =
        (base.as_ptr() as usize - common::BASE_ADDR) / gas_heap::layout::SUPERPAGE_SIZE;
    assert!(tracker.is_mapped(index));

    // Freeing the last allocation adopts the block, empties it, and
    // releases the superpage.
    deallocate(NonNull::new(addr as *mut u8).unwrap()).expect("free orphan block");
    assert!(!tracker.is_mapped(index));
}
