//! Adaptive block-range sizing for catch-up fetches.

use serde::{Deserialize, Serialize};

/// Bounds for [`AdaptiveRange`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    /// Size of the first range requested.
    pub initial: u64,
    pub min: u64,
    pub max: u64,
    /// Consecutive successful ranges before the size doubles.
    pub grow_after: u32,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            initial: 100,
            min: 1,
            max: 2_000,
            grow_after: 5,
        }
    }
}

/// Halves on `RangeTooLarge`, doubles after a streak of successes.
#[derive(Debug, Clone)]
pub struct AdaptiveRange {
    size: u64,
    min: u64,
    max: u64,
    grow_after: u32,
    streak: u32,
}

impl AdaptiveRange {
    pub fn new(config: &RangeConfig) -> Self {
        let min = config.min.max(1);
        let max = config.max.max(min);
        Self {
            size: config.initial.clamp(min, max),
            min,
            max,
            grow_after: config.grow_after.max(1),
            streak: 0,
        }
    }

    /// Current number of blocks per range.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Inclusive end of a range starting at `start`.
    pub fn end_for(&self, start: u64) -> u64 {
        start.saturating_add(self.size - 1)
    }

    /// Halve the range. Returns `false` if it is already at the minimum.
    pub fn shrink(&mut self) -> bool {
        self.streak = 0;
        if self.size <= self.min {
            return false;
        }
        self.size = (self.size / 2).max(self.min);
        true
    }

    pub fn record_success(&mut self) {
        self.streak += 1;
        if self.streak >= self.grow_after {
            self.streak = 0;
            self.size = self.size.saturating_mul(2).min(self.max);
        }
    }
}
