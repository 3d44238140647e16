//! Allocation metrics.

use std::cell::Cell;

/// Counters for the calling thread's allocator activity.
#[derive(Debug, Clone, Copy)]
pub struct HeapMetrics {
    /// Small-path allocations served.
    pub small_allocs: u64,
    /// Medium-path allocations served.
    pub medium_allocs: u64,
    /// Huge-path allocations served.
    pub huge_allocs: u64,
    /// Superpages reserved from the space.
    pub superpages_reserved: u64,
    /// Superpages returned to the space.
    pub superpages_released: u64,
    /// Blocks this thread pushed onto other heaps' mailboxes.
    pub remote_frees: u64,
    /// Mailbox entries this thread drained.
    pub mailbox_drained: u64,
    /// Orphaned superpage blocks this thread adopted.
    pub adoptions: u64,
}

impl Default for HeapMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapMetrics {
    /// Create a new `HeapMetrics` with all counters at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            small_allocs: 0,
            medium_allocs: 0,
            huge_allocs: 0,
            superpages_reserved: 0,
            superpages_released: 0,
            remote_frees: 0,
            mailbox_drained: 0,
            adoptions: 0,
        }
    }
}

thread_local! {
    static METRICS: Cell<HeapMetrics> = const { Cell::new(HeapMetrics::new()) };
}

/// Get the calling thread's allocation metrics.
#[must_use]
pub fn heap_metrics() -> HeapMetrics {
    METRICS.with(Cell::get)
}

/// Apply an update to the calling thread's metrics.
pub(crate) fn update(f: impl FnOnce(&mut HeapMetrics)) {
    METRICS.with(|m| {
        let mut value = m.get();
        f(&mut value);
        m.set(value);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_accumulate_per_thread() {
        let before = heap_metrics();
        update(|m| m.small_allocs += 3);
        update(|m| m.remote_frees += 1);
        let after = heap_metrics();
        assert_eq!(after.small_allocs, before.small_allocs + 3);
        assert_eq!(after.remote_frees, before.remote_frees + 1);

        std::thread::spawn(|| {
            assert_eq!(heap_metrics().small_allocs, 0);
        })
        .join()
        .unwrap();
    }
}
