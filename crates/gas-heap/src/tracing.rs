//! Allocator tracing support.
//!
//! When the `tracing` feature is enabled, this module provides
//! structured spans bracketing superpage reservation and mailbox
//! drains, plus events for ownership transfer and release. Without the
//! feature the same entry points compile to no-ops, so call sites stay
//! unconditional.

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use tracing::{span, Level};

    /// Create a span bracketing the reservation, commit and formatting
    /// of a superpage run.
    pub fn superpage_reserve(count: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "superpage_reserve", count).entered()
    }

    /// Create a span bracketing a mailbox drain.
    pub fn mailbox_drain() -> span::EnteredSpan {
        span!(Level::TRACE, "mailbox_drain").entered()
    }

    /// A run of superpages was decommitted and released.
    pub fn superpage_released(base: usize, count: usize) {
        tracing::debug!(base, count, "superpage_released");
    }

    /// An orphaned superpage block was claimed by this thread.
    pub fn adopted(spb: usize) {
        tracing::debug!(spb, "superpage_block_adopted");
    }

    /// A superpage block was orphaned by its exiting owner.
    pub fn disowned(spb: usize) {
        tracing::debug!(spb, "superpage_block_disowned");
    }
}

#[cfg(not(feature = "tracing"))]
pub(crate) mod internal {
    pub fn superpage_reserve(_count: usize) {}
    pub fn mailbox_drain() {}
    pub fn superpage_released(_base: usize, _count: usize) {}
    pub fn adopted(_spb: usize) {}
    pub fn disowned(_spb: usize) {}
}

pub(crate) use internal::{adopted, disowned, mailbox_drain, superpage_released, superpage_reserve};
