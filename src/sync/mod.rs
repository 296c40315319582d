//! Synchronization primitives.
//!
//! Provides thin wrappers over std or parking_lot locks, plus the relaxed
//! counters used for runtime statistics.

pub(crate) mod atomics;
pub(crate) mod mutex;
