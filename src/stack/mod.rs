//! Stack capture and identity.
//!
//! Allocation sites, free sites and faulting sites are captured as raw
//! return addresses, then reduced to a [`StackId`] computed from
//! module-relative offsets, so the same logical call chain hashes the same
//! across runs regardless of where modules were loaded.

mod cache;
mod capture;

pub use cache::StackCaptureCache;
pub use capture::{StackCapture, StackId, MAX_STACK_DEPTH};
