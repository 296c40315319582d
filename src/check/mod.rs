//! Access-check protocol.
//!
//! Every instrumented load, store and string instruction lands here. The
//! fast path is a shadow load and compare per touched granule; only a
//! non-zero shadow byte takes the out-of-line slow path, which tests every byte of the access
//! and hands confirmed violations to the error pipeline.

use std::fmt;

use crate::core::global::RuntimeState;
use crate::core::shadow::SHADOW_SHIFT;

/// Direction of an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AccessMode {
    Read = 0,
    Write = 1,
    /// Not applicable; string checks skip operands in this mode.
    Unknown = 2,
}

impl AccessMode {
    /// Decode a raw mode, mapping anything unrecognised to `Unknown`.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Read,
            1 => Self::Write,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Unknown => "access",
        })
    }
}

/// Which entry-point flavour ran the check.
///
/// Both leave the caller's registers intact; `NoFlags` sites have declared
/// that condition codes are dead after the check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckVariant {
    PreserveFlags,
    NoFlags,
}

/// Check one access of `size` bytes at `address`.
///
/// Returns `true` when the access is valid. The fast path passes when every
/// granule the access touches has shadow `0`, one load for most accesses;
/// otherwise every byte is tested and a violation is reported once, at
/// `address`.
#[inline(always)]
pub fn check_access(
    state: &RuntimeState,
    address: usize,
    mode: AccessMode,
    size: usize,
    variant: CheckVariant,
) -> bool {
    let shadow = state.shadow();
    let first = address >> SHADOW_SHIFT;
    let last = address.saturating_add(size.max(1) - 1) >> SHADOW_SHIFT;
    if (first..=last).all(|granule| shadow.shadow_byte(granule << SHADOW_SHIFT) == 0) {
        return true;
    }
    check_access_slow(state, address, mode, size, variant)
}

#[cold]
#[inline(never)]
fn check_access_slow(
    state: &RuntimeState,
    address: usize,
    mode: AccessMode,
    size: usize,
    variant: CheckVariant,
) -> bool {
    match state.shadow().first_poisoned_byte(address, size.max(1)) {
        None => true,
        Some(fault) => {
            state.report_bad_access(address, fault, mode, size, variant);
            false
        }
    }
}

/// Parameters of a string-instruction check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringAccess {
    pub dst: usize,
    pub dst_mode: AccessMode,
    pub src: usize,
    pub src_mode: AccessMode,
    /// Number of elements.
    pub count: usize,
    /// Bytes per element.
    pub access_size: usize,
    /// Byte step between elements; negative when the direction flag is set.
    pub stride: isize,
    /// Compare semantics: stop at the first differing element.
    pub compare: bool,
}

/// Check the accesses of a repeated string instruction.
///
/// Each element checks `src`, then `dst`, skipping operands whose mode is
/// [`AccessMode::Unknown`]. With `compare` set, element contents are
/// compared once both operands pass, and the scan stops at the first
/// difference, or at an element whose operands failed a check since their
/// contents cannot be read safely. Returns the number of elements examined.
///
/// # Safety
///
/// With `compare` set, every element the scan reaches that passes its
/// checks must be readable for `access_size` bytes at both addresses.
pub unsafe fn check_strings(state: &RuntimeState, access: &StringAccess, variant: CheckVariant) -> usize {
    let mut offset: isize = 0;

    for i in 0..access.count {
        let src = access.src.wrapping_add_signed(offset);
        let dst = access.dst.wrapping_add_signed(offset);

        let src_ok = access.src_mode == AccessMode::Unknown
            || check_access(state, src, access.src_mode, access.access_size, variant);
        let dst_ok = access.dst_mode == AccessMode::Unknown
            || check_access(state, dst, access.dst_mode, access.access_size, variant);

        if access.compare {
            if !(src_ok && dst_ok) {
                return i + 1;
            }
            let a = std::slice::from_raw_parts(src as *const u8, access.access_size);
            let b = std::slice::from_raw_parts(dst as *const u8, access.access_size);
            if a != b {
                return i + 1;
            }
        }

        offset = offset.wrapping_add(access.stride);
    }
    access.count
}
