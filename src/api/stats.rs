//! Runtime statistics.

use crate::util::size::format_bytes;

/// Aggregated runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Heap proxies created since start-up.
    pub heaps_created: u64,

    /// Heap proxies currently registered.
    pub live_heaps: usize,

    /// Successful proxy allocations.
    pub allocations: u64,

    /// Successful proxy frees.
    pub frees: u64,

    /// Frees refused as invalid or double.
    pub invalid_frees: u64,

    /// Blocks currently quarantined, across all heaps.
    pub quarantined_blocks: usize,

    /// Bytes currently quarantined, across all heaps.
    pub quarantined_bytes: usize,

    /// Blocks evicted from quarantine and released.
    pub evictions: u64,

    /// Errors dispatched.
    pub errors_reported: u64,

    /// Errors dropped by the ignore set.
    pub errors_suppressed: u64,

    /// Errors dropped because the thread was already reporting.
    pub nested_errors: u64,

    /// Distinct allocation and free stacks held.
    pub cached_stacks: usize,
}

impl RuntimeStats {
    /// Create empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks allocated and not yet freed.
    pub fn live_allocations(&self) -> u64 {
        self.allocations.saturating_sub(self.frees)
    }
}

impl std::fmt::Display for RuntimeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Runtime Statistics:")?;
        writeln!(f, "  Heaps:           {} live, {} created", self.live_heaps, self.heaps_created)?;
        writeln!(f, "  Allocations:     {}", self.allocations)?;
        writeln!(f, "  Frees:           {}", self.frees)?;
        writeln!(f, "  Invalid frees:   {}", self.invalid_frees)?;
        writeln!(f, "  Live:            {}", self.live_allocations())?;
        writeln!(
            f,
            "  Quarantine:      {} blocks, {}",
            self.quarantined_blocks,
            format_bytes(self.quarantined_bytes)
        )?;
        writeln!(f, "  Evictions:       {}", self.evictions)?;
        writeln!(
            f,
            "  Errors:          {} reported, {} suppressed, {} nested",
            self.errors_reported, self.errors_suppressed, self.nested_errors
        )?;
        writeln!(f, "  Cached stacks:   {}", self.cached_stacks)?;
        Ok(())
    }
}
