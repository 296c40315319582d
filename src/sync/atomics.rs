//! Relaxed atomic counters for runtime statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A monotonically increasing event counter.
pub struct StatCounter(AtomicU64);

impl StatCounter {
    /// Create a counter at zero.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Count one event.
    #[inline]
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Count `n` events.
    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for StatCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A level that moves both ways and remembers its high-water mark.
pub struct StatGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl StatGauge {
    /// Create a gauge at zero.
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Raise the level, updating the peak.
    pub fn add(&self, value: usize) {
        let now = self.current.fetch_add(value, Ordering::Relaxed) + value;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    /// Lower the level; saturates at zero.
    pub fn sub(&self, value: usize) {
        let _ = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                Some(c.saturating_sub(value))
            });
    }

    /// Current level.
    pub fn get(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Highest level observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

impl Default for StatGauge {
    fn default() -> Self {
        Self::new()
    }
}
