//! FIFO quarantine of freed blocks.

use std::collections::VecDeque;

/// A quarantined block, identified by its native base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantineEntry {
    pub base: usize,
    /// Padded size; counts toward the byte cap.
    pub size: usize,
}

/// Freed blocks awaiting native release, oldest first.
///
/// Bounded by both total bytes and block count; pushing past either cap
/// evicts from the front.
#[derive(Debug)]
pub struct Quarantine {
    entries: VecDeque<QuarantineEntry>,
    size: usize,
    max_size: usize,
    max_blocks: usize,
}

impl Quarantine {
    pub fn new(max_size: usize, max_blocks: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
            max_blocks,
        }
    }

    /// Admit a block and return whatever had to leave to respect the caps.
    ///
    /// A block larger than the byte cap on its own is evicted immediately.
    pub fn push(&mut self, entry: QuarantineEntry) -> Vec<QuarantineEntry> {
        self.entries.push_back(entry);
        self.size += entry.size;

        let mut evicted = Vec::new();
        while self.size > self.max_size || self.entries.len() > self.max_blocks {
            match self.entries.pop_front() {
                Some(oldest) => {
                    self.size -= oldest.size;
                    evicted.push(oldest);
                }
                None => break,
            }
        }
        evicted
    }

    /// Empty the quarantine, oldest first.
    pub fn drain(&mut self) -> Vec<QuarantineEntry> {
        self.size = 0;
        self.entries.drain(..).collect()
    }

    /// Aggregate bytes held.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Blocks held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }
}
