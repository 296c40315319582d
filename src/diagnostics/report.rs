//! Error reports.

use std::fmt;
use std::sync::Arc;

use crate::allocators::block::{BlockDescription, BlockRegion, BlockState};
use crate::check::AccessMode;
use crate::core::shadow::ShadowMarker;
use crate::stack::{StackCapture, StackId};

use super::kind::BadAccessKind;

/// One detected error, handed synchronously to the callback.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub kind: BadAccessKind,
    /// Start of the faulting access (or the pointer passed to free).
    pub location: usize,
    /// First inaccessible byte of the access.
    pub fault_address: usize,
    pub mode: AccessMode,
    pub size: usize,
    /// Shadow marker at `fault_address`, if any.
    pub marker: Option<ShadowMarker>,
    /// Where the error happened.
    pub crash_stack: Arc<StackCapture>,
    /// Owning block, when `fault_address` lies in a tracked block's extent.
    pub block: Option<BlockDescription>,
}

impl ErrorReport {
    /// Identity of the faulting stack.
    pub fn crash_stack_id(&self) -> StackId {
        self.crash_stack.stack_id()
    }

    /// Identity of the allocation stack of the owning block.
    pub fn alloc_stack_id(&self) -> Option<StackId> {
        self.block.as_ref().map(|block| block.alloc_stack.stack_id())
    }

    /// Identity of the free stack of the owning block.
    pub fn free_stack_id(&self) -> Option<StackId> {
        self.block
            .as_ref()
            .and_then(|block| block.free_stack.as_ref())
            .map(|stack| stack.stack_id())
    }

    /// The C view handed to a registered C callback.
    pub fn to_ffi(&self) -> AsanErrorInfo {
        let (user, requested_size, offset) = self
            .block
            .as_ref()
            .map_or((0, 0, 0), |block| (block.user, block.requested_size, block.offset));
        AsanErrorInfo {
            location: self.location,
            error_type: self.kind as u32,
            access_mode: self.mode as u32,
            access_size: self.size,
            crash_stack_id: self.crash_stack_id().as_u64(),
            alloc_stack_id: self.alloc_stack_id().map_or(0, StackId::as_u64),
            free_stack_id: self.free_stack_id().map_or(0, StackId::as_u64),
            block_address: user,
            block_size: requested_size,
            block_offset: offset,
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on address {:#x}: {} of size {}",
            self.kind, self.location, self.mode, self.size
        )?;
        if let Some(block) = &self.block {
            let relation = match block.region {
                Some(BlockRegion::LeftRedzone) => format!("{} bytes before", -block.offset),
                Some(BlockRegion::RightRedzone) => {
                    format!("{} bytes after", block.offset as usize - block.requested_size)
                }
                _ => format!("{} bytes inside", block.offset),
            };
            let state = match block.state {
                BlockState::Allocated => "allocated",
                BlockState::Quarantined => "freed",
                BlockState::Freed => "released",
            };
            write!(
                f,
                "; {:#x} is {} the {}-byte {} block at {:#x}",
                self.fault_address, relation, block.requested_size, state, block.user
            )?;
        }
        Ok(())
    }
}

/// C layout of [`ErrorReport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct AsanErrorInfo {
    pub location: usize,
    /// [`BadAccessKind`] discriminant.
    pub error_type: u32,
    /// [`AccessMode`] discriminant.
    pub access_mode: u32,
    pub access_size: usize,
    pub crash_stack_id: u64,
    /// `0` when unknown.
    pub alloc_stack_id: u64,
    /// `0` when unknown or not freed.
    pub free_stack_id: u64,
    pub block_address: usize,
    pub block_size: usize,
    pub block_offset: isize,
}
