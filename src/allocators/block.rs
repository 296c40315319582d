//! Heap block records.
//!
//! A block is one native allocation split into three sub-ranges:
//!
//! ```text
//! base            user                user + size     base + padded
//!  | left redzone  | payload           | right redzone |
//! ```
//!
//! The right redzone also absorbs the padding that rounds the payload up to
//! a granule, so only the user pointer is ever exposed.

use std::sync::Arc;

use crate::core::shadow::GRANULE_SIZE;
use crate::stack::StackCapture;
use crate::util::layout::checked_align_up;

/// Lifecycle of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Handed out and not yet freed.
    Allocated,
    /// Freed and poisoned; native release is deferred.
    Quarantined,
    /// Evicted from quarantine; kept only by in-flight reports.
    Freed,
}

/// Which part of a block an address falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRegion {
    LeftRedzone,
    Payload,
    RightRedzone,
}

/// Offsets of a block's sub-ranges relative to its native base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Bytes asked for by the caller.
    pub requested_size: usize,
    /// Left redzone length.
    pub left_redzone: usize,
    /// Right redzone length, including the granule padding.
    pub right_redzone: usize,
}

impl BlockLayout {
    /// Lay out a block, or `None` if the padded size overflows.
    ///
    /// Both redzones are rounded up to whole granules and are at least one
    /// granule long.
    pub fn new(requested_size: usize, left_redzone: usize, right_redzone: usize) -> Option<Self> {
        let left = checked_align_up(left_redzone.max(GRANULE_SIZE), GRANULE_SIZE)?;
        let right = checked_align_up(right_redzone.max(GRANULE_SIZE), GRANULE_SIZE)?;
        let payload = checked_align_up(requested_size, GRANULE_SIZE)?;
        let right_redzone = right.checked_add(payload - requested_size)?;
        let layout = Self {
            requested_size,
            left_redzone: left,
            right_redzone,
        };
        layout.padded_size()?;
        Some(layout)
    }

    /// Total native bytes.
    pub fn padded_size(&self) -> Option<usize> {
        self.left_redzone
            .checked_add(self.requested_size)?
            .checked_add(self.right_redzone)
    }
}

/// One tracked allocation.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    /// Native pointer returned by the wrapped heap.
    pub base: usize,
    pub layout: BlockLayout,
    pub state: BlockState,
    pub alloc_stack: Arc<StackCapture>,
    pub free_stack: Option<Arc<StackCapture>>,
}

impl BlockInfo {
    /// The user-visible pointer.
    pub fn user(&self) -> usize {
        self.base + self.layout.left_redzone
    }

    /// Bytes the caller asked for.
    pub fn requested_size(&self) -> usize {
        self.layout.requested_size
    }

    /// Native size of the whole block.
    pub fn padded_size(&self) -> usize {
        self.layout.left_redzone + self.layout.requested_size + self.layout.right_redzone
    }

    /// One past the block's last byte.
    pub fn end(&self) -> usize {
        self.base + self.padded_size()
    }

    /// Whether `address` is anywhere in the block, redzones included.
    pub fn contains(&self, address: usize) -> bool {
        (self.base..self.end()).contains(&address)
    }

    /// The sub-range holding `address`.
    pub fn region_of(&self, address: usize) -> Option<BlockRegion> {
        if !self.contains(address) {
            None
        } else if address < self.user() {
            Some(BlockRegion::LeftRedzone)
        } else if address < self.user() + self.layout.requested_size {
            Some(BlockRegion::Payload)
        } else {
            Some(BlockRegion::RightRedzone)
        }
    }

    /// Snapshot for error reports.
    pub fn describe(&self, address: usize) -> BlockDescription {
        BlockDescription {
            user: self.user(),
            requested_size: self.layout.requested_size,
            offset: address as isize - self.user() as isize,
            region: self.region_of(address),
            state: self.state,
            alloc_stack: Arc::clone(&self.alloc_stack),
            free_stack: self.free_stack.clone(),
        }
    }
}

/// Provenance of an address inside a tracked block.
#[derive(Debug, Clone)]
pub struct BlockDescription {
    pub user: usize,
    pub requested_size: usize,
    /// Signed distance from the user pointer.
    pub offset: isize,
    pub region: Option<BlockRegion>,
    pub state: BlockState,
    pub alloc_stack: Arc<StackCapture>,
    pub free_stack: Option<Arc<StackCapture>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(requested: usize) -> BlockInfo {
        BlockInfo {
            base: 0x1000,
            layout: BlockLayout::new(requested, 32, 32).unwrap(),
            state: BlockState::Allocated,
            alloc_stack: Arc::new(StackCapture::from_frames(&[0x10])),
            free_stack: None,
        }
    }

    #[test]
    fn test_layout_rounds_redzones() {
        let layout = BlockLayout::new(10, 5, 0).unwrap();
        assert_eq!(layout.left_redzone, 8);
        assert_eq!(layout.right_redzone, 8 + 6);
        assert_eq!(layout.padded_size(), Some(32));
    }

    #[test]
    fn test_layout_overflow() {
        assert!(BlockLayout::new(usize::MAX - 16, 32, 32).is_none());
        assert!(BlockLayout::new(16, usize::MAX, 32).is_none());
    }

    #[test]
    fn test_regions() {
        let info = block(10);
        let user = info.user();
        assert_eq!(user, 0x1000 + 32);
        assert_eq!(info.region_of(0x1000), Some(BlockRegion::LeftRedzone));
        assert_eq!(info.region_of(user), Some(BlockRegion::Payload));
        assert_eq!(info.region_of(user + 9), Some(BlockRegion::Payload));
        assert_eq!(info.region_of(user + 10), Some(BlockRegion::RightRedzone));
        assert_eq!(info.region_of(info.end()), None);
        assert_eq!(info.describe(user + 10).offset, 10);
        assert_eq!(info.describe(0x1000).offset, -32);
    }
}
