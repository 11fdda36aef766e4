//! Access-Pattern Strategies for Prefetching
//!
//! A [`FetchingStrategy`] watches the block indices that are actually
//! requested and predicts which indices to decode ahead of time. The block
//! fetcher feeds every real access through [`FetchingStrategy::fetch`] and
//! asks [`FetchingStrategy::prefetch`] for candidates whenever the thread
//! pool has spare capacity.

use std::collections::VecDeque;

pub trait FetchingStrategy: Send + 'static {
    /// Observe a real access to `index`.
    fn fetch(&mut self, index: usize);

    /// Up to `max_amount` predicted indices, highest priority first.
    fn prefetch(&self, max_amount: usize) -> Vec<usize>;

    /// Whether the recent access pattern looks like a straight sequential
    /// read. The fetcher clears its main cache on sequential access so a
    /// linear scan cannot pollute it.
    fn is_sequential(&self) -> bool;
}

/// Always predicts the blocks directly following the last access. Useful as
/// a baseline and for purely sequential consumers.
#[derive(Default)]
pub struct FetchNextFixed {
    last: Option<usize>,
}

impl FetchNextFixed {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FetchingStrategy for FetchNextFixed {
    fn fetch(&mut self, index: usize) {
        self.last = Some(index);
    }

    fn prefetch(&self, max_amount: usize) -> Vec<usize> {
        match self.last {
            Some(last) => (1..=max_amount).map(|i| last + i).collect(),
            None => Vec::new(),
        }
    }

    fn is_sequential(&self) -> bool {
        true
    }
}

/// Remembers the last few accesses and ramps the prediction amount up with
/// the length of the sequential streak. A seek collapses the ramp so random
/// access patterns do not flood the pool with decodes that will never be
/// consumed.
pub struct FetchNextAdaptive {
    history: VecDeque<usize>,
    /// Count of consecutive +1 accesses, saturating.
    streak: u32,
}

/// How many past accesses are kept for the sequential classification.
const HISTORY_SIZE: usize = 3;

impl FetchNextAdaptive {
    pub fn new() -> Self {
        FetchNextAdaptive {
            history: VecDeque::with_capacity(HISTORY_SIZE),
            streak: 0,
        }
    }
}

impl Default for FetchNextAdaptive {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchingStrategy for FetchNextAdaptive {
    fn fetch(&mut self, index: usize) {
        let sequential = match self.history.back() {
            // The very first access starts a streak; a cold sequential read
            // should prefetch from the first get.
            None => true,
            Some(&last) => index == last + 1,
        };
        self.streak = if sequential {
            self.streak.saturating_add(1)
        } else {
            0
        };

        if self.history.len() == HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(index);
    }

    fn prefetch(&self, max_amount: usize) -> Vec<usize> {
        let Some(&last) = self.history.back() else {
            return Vec::new();
        };
        let amount = match self.streak {
            0 => 1,
            streak => (1usize << streak.min(16)).min(max_amount),
        };
        (1..=amount.min(max_amount)).map(|i| last + i).collect()
    }

    fn is_sequential(&self) -> bool {
        if self.history.len() < 2 {
            return !self.history.is_empty();
        }
        self.history
            .iter()
            .zip(self.history.iter().skip(1))
            .all(|(a, b)| *b == *a + 1)
    }
}
