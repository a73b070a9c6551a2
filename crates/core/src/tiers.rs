//! Geometric tier layout.
//!
//! Tier `i` owns `2^(i+2)` consecutive ranks and polls every `base * 2^i`.
//! The last tier has no upper bound and absorbs the tail of the list.

use std::fmt;
use std::time::Duration;

/// Smallest range size, as a power of two.
const FIRST_RANGE_EXPONENT: u32 = 2;

/// Upper bound keeps `base * 2^index` and the range sizes far from overflow.
pub const MAX_TIERS: usize = 32;

/// Half-open index bounds into the ranked list. `end == None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerRange {
    pub start: usize,
    pub end: Option<usize>,
}

impl WorkerRange {
    pub fn new(start: usize, end: Option<usize>) -> Self {
        Self { start, end }
    }

    /// Number of ranks covered, `None` when unbounded.
    pub fn size(&self) -> Option<usize> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && self.end.map_or(true, |end| index < end)
    }
}

impl fmt::Display for WorkerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, ∞)", self.start),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityTier {
    pub index: usize,
    pub poll_interval: Duration,
    pub range: WorkerRange,
}

/// Fixed partition of `[0, ∞)` assigned once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierLayout {
    tiers: Vec<PriorityTier>,
}

impl TierLayout {
    /// Build `count` tiers. `count` is clamped to `1..=MAX_TIERS`; a single
    /// tier owns the whole list.
    pub fn geometric(count: usize, base_interval: Duration) -> Self {
        let count = count.clamp(1, MAX_TIERS);
        let mut tiers = Vec::with_capacity(count);
        let mut start = 0usize;

        for index in 0..count {
            let scale = 1u32 << index;
            let poll_interval = base_interval.saturating_mul(scale);

            let range = if index + 1 == count {
                WorkerRange::new(start, None)
            } else {
                let size = 1usize << (index as u32 + FIRST_RANGE_EXPONENT);
                let end = start + size;
                let range = WorkerRange::new(start, Some(end));
                start = end;
                range
            };

            tiers.push(PriorityTier {
                index,
                poll_interval,
                range,
            });
        }

        Self { tiers }
    }

    pub fn tiers(&self) -> &[PriorityTier] {
        &self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}
