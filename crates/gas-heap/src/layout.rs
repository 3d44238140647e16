//! Address-space geometry and small-allocation size classes.
//!
//! The global address space is carved into 2 MiB superpages, each of
//! which is subdivided into 4 KiB pages. Small allocations are served
//! from pages partitioned into power-of-two blocks; the ladder of block
//! sizes is fixed at compile time.

use std::mem::size_of;

use crate::list::UnusedBlock;

/// Size of each memory page.
pub const PAGE_SIZE: usize = 4096;

/// Size of each superpage, the unit of address-space reservation.
pub const SUPERPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Mask for extracting the superpage base from a pointer.
pub const SUPERPAGE_MASK: usize = !(SUPERPAGE_SIZE - 1);

/// Number of pages in one superpage.
pub const PAGES_PER_SUPERPAGE: usize = SUPERPAGE_SIZE / PAGE_SIZE;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(SUPERPAGE_SIZE.is_power_of_two());
const _: () = assert!(PAGES_PER_SUPERPAGE == 512);

/// Smallest block size handed out by the small path. Every free small
/// block doubles as a [`UnusedBlock`] free-list node, so it cannot be
/// smaller than one.
pub const SMALLEST_BLOCK: usize = size_of::<UnusedBlock>().next_power_of_two();

const MIN_LOG: u32 = SMALLEST_BLOCK.trailing_zeros();
const MAX_LOG: u32 = PAGE_SIZE.trailing_zeros();

/// Number of small size classes (powers of two from [`SMALLEST_BLOCK`]
/// up to [`PAGE_SIZE`] inclusive).
pub const CLASS_COUNT: usize = (MAX_LOG - MIN_LOG + 1) as usize;

/// Description of one small size class.
#[derive(Debug, Clone, Copy)]
pub struct SizeClass {
    /// Size of each block in bytes (a power of two).
    pub block_size: usize,
    /// Pages per small page block of this class.
    pub page_count: usize,
    /// Number of blocks carved from one page block.
    pub block_count: usize,
    /// Index of this class in [`SIZE_CLASSES`].
    pub index: usize,
}

/// The compile-time size-class table.
pub const SIZE_CLASSES: [SizeClass; CLASS_COUNT] = build_classes();

const fn build_classes() -> [SizeClass; CLASS_COUNT] {
    let mut table = [SizeClass {
        block_size: 0,
        page_count: 0,
        block_count: 0,
        index: 0,
    }; CLASS_COUNT];
    let mut k = 0;
    while k < CLASS_COUNT {
        let block_size = 1usize << (MIN_LOG as usize + k);
        table[k] = SizeClass {
            block_size,
            page_count: 1,
            block_count: PAGE_SIZE / block_size,
            index: k,
        };
        k += 1;
    }
    table
}

/// Returns the index of the smallest size class whose blocks fit `size`.
///
/// `size` must be non-zero and at most [`PAGE_SIZE`]; the small path
/// guarantees both.
pub fn class_index(size: usize) -> usize {
    debug_assert!(size > 0 && size <= PAGE_SIZE);
    let rounded = size.next_power_of_two().max(SMALLEST_BLOCK);
    (rounded.trailing_zeros() - MIN_LOG) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_table_shape() {
        assert_eq!(SIZE_CLASSES[0].block_size, SMALLEST_BLOCK);
        assert_eq!(SIZE_CLASSES[CLASS_COUNT - 1].block_size, PAGE_SIZE);
        for (k, class) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(class.index, k);
            assert!(class.block_size.is_power_of_two());
            assert_eq!(class.page_count, 1);
            assert_eq!(class.block_count, PAGE_SIZE / class.block_size);
        }
    }

    #[test]
    fn test_class_index_routing() {
        assert_eq!(SIZE_CLASSES[class_index(1)].block_size, SMALLEST_BLOCK);
        assert_eq!(
            SIZE_CLASSES[class_index(SMALLEST_BLOCK)].block_size,
            SMALLEST_BLOCK
        );
        assert_eq!(
            SIZE_CLASSES[class_index(SMALLEST_BLOCK + 1)].block_size,
            2 * SMALLEST_BLOCK
        );
        assert_eq!(SIZE_CLASSES[class_index(100)].block_size, 128);
        assert_eq!(SIZE_CLASSES[class_index(4000)].block_size, PAGE_SIZE);
        assert_eq!(SIZE_CLASSES[class_index(PAGE_SIZE)].block_size, PAGE_SIZE);
    }

    #[test]
    fn test_block_fits_requested_size() {
        for size in 1..=PAGE_SIZE {
            let class = &SIZE_CLASSES[class_index(size)];
            assert!(class.block_size >= size, "size {size}");
        }
    }
}
