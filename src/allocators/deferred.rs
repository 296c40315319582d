//! Deferred release queue for evicted blocks.
//!
//! Quarantine eviction happens under the proxy lock, but the native heap
//! must never be called with that lock held. Evicted blocks are pushed
//! here and released by whichever thread drains the queue next.

use crossbeam_queue::SegQueue;

use crate::allocators::block::BlockInfo;

/// Lock-free queue of blocks awaiting native release.
pub struct ReleaseQueue {
    queue: SegQueue<BlockInfo>,
}

impl ReleaseQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    /// Queue an evicted block.
    pub fn push(&self, block: BlockInfo) {
        self.queue.push(block);
    }

    /// Hand every pending block to `release`.
    pub fn drain(&self, mut release: impl FnMut(BlockInfo)) -> usize {
        let mut released = 0;
        while let Some(block) = self.queue.pop() {
            release(block);
            released += 1;
        }
        released
    }

    /// Check if there are pending releases.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get approximate number of pending releases.
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Default for ReleaseQueue {
    fn default() -> Self {
        Self::new()
    }
}
