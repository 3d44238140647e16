//! Lock-free tracker of reserved superpage runs.
//!
//! Two atomic bitmaps cover the whole global address space, one bit per
//! superpage:
//!
//! - the **mapping** table: bit set ⇔ superpage reserved;
//! - the **sequence** table: bit set ⇔ superpage continues the run of
//!   its predecessor (a run's first superpage keeps a clear bit).
//!
//! Walking the sequence table backward from any superpage of a live run
//! until the first clear bit yields the run's base, which is how an
//! interior pointer finds its superpage block.
//!
//! Reservation is a pure CAS protocol: a run confined to one word
//! commits with a single CAS; a run spilling over word boundaries
//! commits head word, interior words, then tail word in order and
//! undoes its own writes when a word is contended. Progress is
//! lock-free — a failed CAS means another acquire succeeded.
//!
//! All operations use sequentially consistent ordering; the tables are
//! the cross-thread source of truth for address-space ownership.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

use crossbeam::utils::{Backoff, CachePadded};

use crate::bits::{self, WORD_BITS};

/// Error returned when no free run of the requested length exists in
/// the search range. Callers treat this as fatal address-space
/// exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceExhausted;

impl fmt::Display for SpaceExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no free superpage run in the search range")
    }
}

impl std::error::Error for SpaceExhausted {}

enum Commit {
    Done,
    /// The head word changed under us; retry with the observed value.
    HeadRaced(usize),
    /// A later word of the span is taken; resume scanning from it.
    Blocked(usize),
}

/// The process-wide superpage reservation tables.
pub struct SuperpageTracker {
    mapping: Box<[CachePadded<AtomicUsize>]>,
    sequence: Box<[CachePadded<AtomicUsize>]>,
    bit_count: usize,
}

fn new_table(words: usize) -> Box<[CachePadded<AtomicUsize>]> {
    (0..words)
        .map(|_| CachePadded::new(AtomicUsize::new(0)))
        .collect()
}

impl SuperpageTracker {
    /// Creates tables covering `superpage_count` superpages, all free.
    pub fn new(superpage_count: usize) -> Self {
        let words = superpage_count.div_ceil(WORD_BITS);
        Self {
            mapping: new_table(words),
            sequence: new_table(words),
            bit_count: superpage_count,
        }
    }

    /// Number of superpages covered by the tables.
    pub fn superpage_count(&self) -> usize {
        self.bit_count
    }

    /// Reserves `n` consecutive superpages inside `search` and returns
    /// the index of the first.
    pub fn acquire(&self, n: usize, search: Range<usize>) -> Result<usize, SpaceExhausted> {
        assert!(n >= 1, "cannot acquire an empty run");
        debug_assert!(search.start <= search.end && search.end <= self.bit_count);
        if n > search.end.saturating_sub(search.start) {
            return Err(SpaceExhausted);
        }

        let mut word = search.start / WORD_BITS;
        'scan: loop {
            let word_base = word * WORD_BITS;
            if word_base >= search.end {
                return Err(SpaceExhausted);
            }
            let lo = search.start.saturating_sub(word_base).min(WORD_BITS);
            let hi = (search.end - word_base).min(WORD_BITS);
            // Earliest start still reachable from this word onward.
            if word_base + lo + n > search.end {
                return Err(SpaceExhausted);
            }

            let backoff = Backoff::new();
            let mut cur = self.mapping[word].load(SeqCst);
            loop {
                // A run confined to this word commits with one CAS.
                if n <= WORD_BITS {
                    let i = bits::find_zero_run(cur, n, lo, hi);
                    if i < WORD_BITS {
                        let mask = bits::window(i, i + n);
                        match self.mapping[word].compare_exchange(cur, cur | mask, SeqCst, SeqCst)
                        {
                            Ok(_) => {
                                let base = word_base + i;
                                self.set_range(&self.sequence, base + 1, base + n);
                                return Ok(base);
                            }
                            Err(actual) => {
                                cur = actual;
                                backoff.spin();
                                continue;
                            }
                        }
                    }
                }

                // A run spilling into the next words must occupy the
                // top of this word.
                if hi == WORD_BITS {
                    let head_start = (WORD_BITS - cur.leading_zeros() as usize).max(lo);
                    if head_start < WORD_BITS {
                        let head_len = WORD_BITS - head_start;
                        debug_assert!(head_len < n);
                        let base = word_base + head_start;
                        if base + n > search.end {
                            return Err(SpaceExhausted);
                        }
                        match self.try_acquire_spilled(word, head_start, n, cur) {
                            Commit::Done => {
                                self.set_range(&self.sequence, base + 1, base + n);
                                return Ok(base);
                            }
                            Commit::HeadRaced(actual) => {
                                cur = actual;
                                backoff.spin();
                                continue;
                            }
                            Commit::Blocked(w) => {
                                word = w;
                                continue 'scan;
                            }
                        }
                    }
                }

                // No run starts in this word.
                word += 1;
                continue 'scan;
            }
        }
    }

    /// Attempts to commit a run starting at bit `head_start` of `word`
    /// and spilling into the following words. `cur` is the expected
    /// value of the head word.
    fn try_acquire_spilled(
        &self,
        word: usize,
        head_start: usize,
        n: usize,
        cur: usize,
    ) -> Commit {
        let head_len = WORD_BITS - head_start;
        let rest = n - head_len;
        let interior = rest / WORD_BITS;
        let tail_bits = rest % WORD_BITS;
        let tail_word = word + 1 + interior;

        // Probe the whole span before writing anything.
        for w in word + 1..tail_word {
            if self.mapping[w].load(SeqCst) != 0 {
                return Commit::Blocked(w);
            }
        }
        if tail_bits > 0 && self.mapping[tail_word].load(SeqCst) & bits::low_mask(tail_bits) != 0 {
            return Commit::Blocked(tail_word);
        }

        let head_mask = bits::window(head_start, WORD_BITS);
        if let Err(actual) = self.mapping[word].compare_exchange(cur, cur | head_mask, SeqCst, SeqCst)
        {
            return Commit::HeadRaced(actual);
        }
        for w in word + 1..tail_word {
            if self.mapping[w]
                .compare_exchange(0, usize::MAX, SeqCst, SeqCst)
                .is_err()
            {
                // Undo this attempt's writes: interior words were taken
                // whole, the head bits are ours alone.
                for undo in word + 1..w {
                    self.mapping[undo].store(0, SeqCst);
                }
                self.mapping[word].fetch_and(!head_mask, SeqCst);
                return Commit::Blocked(w);
            }
        }
        if tail_bits > 0 {
            let tail_mask = bits::low_mask(tail_bits);
            let backoff = Backoff::new();
            let mut t = self.mapping[tail_word].load(SeqCst);
            loop {
                if t & tail_mask != 0 {
                    for undo in word + 1..tail_word {
                        self.mapping[undo].store(0, SeqCst);
                    }
                    self.mapping[word].fetch_and(!head_mask, SeqCst);
                    return Commit::Blocked(tail_word);
                }
                match self.mapping[tail_word].compare_exchange(t, t | tail_mask, SeqCst, SeqCst) {
                    Ok(_) => break,
                    Err(actual) => {
                        t = actual;
                        backoff.spin();
                    }
                }
            }
        }
        Commit::Done
    }

    /// Releases a previously acquired run. Sequence bits are cleared
    /// before mapping bits, so an observer that still sees a mapped bit
    /// also sees consistent sequence information.
    pub fn release(&self, range: Range<usize>) {
        debug_assert!(!range.is_empty() && range.end <= self.bit_count);
        self.clear_range(&self.sequence, range.start + 1, range.end);
        self.clear_range(&self.mapping, range.start, range.end);
    }

    /// Shrinks a run to its first superpage, releasing the rest.
    pub fn trim(&self, range: Range<usize>) {
        debug_assert!(!range.is_empty() && range.end <= self.bit_count);
        self.clear_range(&self.sequence, range.start + 1, range.end);
        self.clear_range(&self.mapping, range.start + 1, range.end);
    }

    /// Index of the first superpage of the run containing `index`,
    /// found by walking the sequence table backward to the first clear
    /// bit. The mapping table is not consulted; the caller must keep
    /// the run live.
    pub fn sequence_start(&self, index: usize) -> usize {
        debug_assert!(index < self.bit_count);
        let mut word = index / WORD_BITS;
        let mut pos = index % WORD_BITS;
        loop {
            let value = self.sequence[word].load(SeqCst);
            let i = bits::find_previous_zero(value, pos);
            if i < WORD_BITS {
                return word * WORD_BITS + i;
            }
            debug_assert!(word > 0, "a run's first superpage has a clear sequence bit");
            word -= 1;
            pos = WORD_BITS - 1;
        }
    }

    /// Whether `index` is currently reserved.
    pub fn is_mapped(&self, index: usize) -> bool {
        debug_assert!(index < self.bit_count);
        self.mapping[index / WORD_BITS].load(SeqCst) & (1 << (index % WORD_BITS)) != 0
    }

    /// Whether `index` continues the run of its predecessor.
    pub fn is_continuation(&self, index: usize) -> bool {
        debug_assert!(index < self.bit_count);
        self.sequence[index / WORD_BITS].load(SeqCst) & (1 << (index % WORD_BITS)) != 0
    }

    fn set_range(&self, table: &[CachePadded<AtomicUsize>], from: usize, to: usize) {
        let mut bit = from;
        while bit < to {
            let word = bit / WORD_BITS;
            let lo = bit % WORD_BITS;
            let hi = (to - word * WORD_BITS).min(WORD_BITS);
            table[word].fetch_or(bits::window(lo, hi), SeqCst);
            bit = (word + 1) * WORD_BITS;
        }
    }

    fn clear_range(&self, table: &[CachePadded<AtomicUsize>], from: usize, to: usize) {
        let mut bit = from;
        while bit < to {
            let word = bit / WORD_BITS;
            let lo = bit % WORD_BITS;
            let hi = (to - word * WORD_BITS).min(WORD_BITS);
            table[word].fetch_and(!bits::window(lo, hi), SeqCst);
            bit = (word + 1) * WORD_BITS;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn assert_run(tracker: &SuperpageTracker, base: usize, n: usize) {
        assert!(tracker.is_mapped(base));
        assert!(!tracker.is_continuation(base));
        for i in base + 1..base + n {
            assert!(tracker.is_mapped(i), "superpage {i} should be mapped");
            assert!(tracker.is_continuation(i), "superpage {i} should continue the run");
            assert_eq!(tracker.sequence_start(i), base);
        }
        assert_eq!(tracker.sequence_start(base), base);
    }

    #[test]
    fn test_acquire_single() {
        let tracker = SuperpageTracker::new(24);
        let a = tracker.acquire(1, 0..24).unwrap();
        let b = tracker.acquire(1, 0..24).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_run(&tracker, a, 1);
        assert_run(&tracker, b, 1);
    }

    #[test]
    fn test_acquire_runs_until_exhausted() {
        let tracker = SuperpageTracker::new(24);
        for k in 0..8 {
            let base = tracker.acquire(3, 0..24).unwrap();
            assert_eq!(base, 3 * k);
            assert_run(&tracker, base, 3);
        }
        assert_eq!(tracker.acquire(3, 0..24), Err(SpaceExhausted));
        assert_eq!(tracker.acquire(1, 0..24), Err(SpaceExhausted));
    }

    #[test]
    fn test_release_clears_all_bits() {
        let tracker = SuperpageTracker::new(24);
        let base = tracker.acquire(4, 0..24).unwrap();
        tracker.release(base..base + 4);
        for i in 0..4 {
            assert!(!tracker.is_mapped(base + i));
            assert!(!tracker.is_continuation(base + i));
        }
        // The range is reusable.
        assert_eq!(tracker.acquire(4, 0..24).unwrap(), base);
    }

    #[test]
    fn test_trim_keeps_first_superpage() {
        let tracker = SuperpageTracker::new(24);
        let base = tracker.acquire(5, 0..24).unwrap();
        tracker.trim(base..base + 5);
        assert!(tracker.is_mapped(base));
        assert!(!tracker.is_continuation(base));
        for i in 1..5 {
            assert!(!tracker.is_mapped(base + i));
            assert!(!tracker.is_continuation(base + i));
        }
        assert_eq!(tracker.sequence_start(base), base);
        // The trimmed-off superpages can be reacquired.
        assert_eq!(tracker.acquire(4, 0..24).unwrap(), base + 1);
    }

    #[test]
    fn test_acquire_respects_search_range() {
        let tracker = SuperpageTracker::new(128);
        let base = tracker.acquire(4, 64..128).unwrap();
        assert_eq!(base, 64);
        assert_eq!(tracker.acquire(65, 64..128), Err(SpaceExhausted));
        assert!(!tracker.is_mapped(0));
    }

    #[test]
    fn test_acquire_spilling_word_boundary() {
        let tracker = SuperpageTracker::new(256);
        // Occupy most of the first word, leaving its top 4 bits free.
        let low = tracker.acquire(WORD_BITS - 4, 0..256).unwrap();
        assert_eq!(low, 0);
        // A 10-superpage run must start in the first word's tail and
        // spill into the second.
        let base = tracker.acquire(10, 0..256).unwrap();
        assert_eq!(base, WORD_BITS - 4);
        assert_run(&tracker, base, 10);
        assert_eq!(tracker.sequence_start(base + 9), base);
    }

    #[test]
    fn test_acquire_multi_word_run() {
        let tracker = SuperpageTracker::new(4 * WORD_BITS);
        let n = 2 * WORD_BITS + 7;
        let base = tracker.acquire(n, 0..4 * WORD_BITS).unwrap();
        assert_eq!(base, 0);
        assert_run(&tracker, base, n);

        tracker.release(base..base + n);
        for i in 0..n {
            assert!(!tracker.is_mapped(i));
            assert!(!tracker.is_continuation(i));
        }
    }

    #[test]
    fn test_concurrent_acquires_are_disjoint() {
        let tracker = Arc::new(SuperpageTracker::new(24));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || tracker.acquire(3, 0..24).unwrap()));
        }
        let mut bases: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        bases.sort_unstable();
        assert_eq!(bases, vec![0, 3, 6, 9, 12, 15, 18, 21]);
        for &base in &bases {
            assert_run(&tracker, base, 3);
        }
    }

    #[test]
    fn test_concurrent_spilling_acquires() {
        // Runs of 24 force acquires across word boundaries; the range
        // has slack so contention cannot exhaust it.
        let total = 24 * 24;
        let tracker = Arc::new(SuperpageTracker::new(total));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || tracker.acquire(24, 0..total).unwrap()));
        }
        let mut bases: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        bases.sort_unstable();
        for pair in bases.windows(2) {
            assert!(pair[0] + 24 <= pair[1], "overlapping runs: {pair:?}");
        }
        for &base in &bases {
            assert_run(&tracker, base, 24);
        }
    }
}
