//! Access-check entry points.
//!
//! One symbol per access width, mode and variant, matching what the
//! instrumenter emits. Widths are 1, 2, 4, 8, 10, 16 and 32 bytes; the
//! `_no_flags` variants are used at sites where condition codes are dead.

use std::ffi::c_void;

use crate::check::{self, AccessMode, CheckVariant, StringAccess};

use super::with_rtl;

#[inline(always)]
fn check(address: *const c_void, mode: AccessMode, size: usize, variant: CheckVariant) {
    with_rtl(|state| check::check_access(state, address as usize, mode, size, variant));
}

macro_rules! access_checks {
    ($($size:literal => $read:ident, $read_nf:ident, $write:ident, $write_nf:ident;)*) => {
        $(
            #[no_mangle]
            pub extern "C" fn $read(address: *const c_void) {
                check(address, AccessMode::Read, $size, CheckVariant::PreserveFlags)
            }

            #[no_mangle]
            pub extern "C" fn $read_nf(address: *const c_void) {
                check(address, AccessMode::Read, $size, CheckVariant::NoFlags)
            }

            #[no_mangle]
            pub extern "C" fn $write(address: *const c_void) {
                check(address, AccessMode::Write, $size, CheckVariant::PreserveFlags)
            }

            #[no_mangle]
            pub extern "C" fn $write_nf(address: *const c_void) {
                check(address, AccessMode::Write, $size, CheckVariant::NoFlags)
            }
        )*
    };
}

access_checks! {
    1 => asan_check_1_byte_read_access, asan_check_1_byte_read_access_no_flags,
         asan_check_1_byte_write_access, asan_check_1_byte_write_access_no_flags;
    2 => asan_check_2_byte_read_access, asan_check_2_byte_read_access_no_flags,
         asan_check_2_byte_write_access, asan_check_2_byte_write_access_no_flags;
    4 => asan_check_4_byte_read_access, asan_check_4_byte_read_access_no_flags,
         asan_check_4_byte_write_access, asan_check_4_byte_write_access_no_flags;
    8 => asan_check_8_byte_read_access, asan_check_8_byte_read_access_no_flags,
         asan_check_8_byte_write_access, asan_check_8_byte_write_access_no_flags;
    10 => asan_check_10_byte_read_access, asan_check_10_byte_read_access_no_flags,
          asan_check_10_byte_write_access, asan_check_10_byte_write_access_no_flags;
    16 => asan_check_16_byte_read_access, asan_check_16_byte_read_access_no_flags,
          asan_check_16_byte_write_access, asan_check_16_byte_write_access_no_flags;
    32 => asan_check_32_byte_read_access, asan_check_32_byte_read_access_no_flags,
          asan_check_32_byte_write_access, asan_check_32_byte_write_access_no_flags;
}

/// Check an access of any width. Returns 1 if it was valid, 0 otherwise
/// (including when no runtime is installed).
#[no_mangle]
pub extern "C" fn asan_check_access(address: *const c_void, mode: u32, size: usize) -> i32 {
    let valid = with_rtl(|state| {
        check::check_access(
            state,
            address as usize,
            AccessMode::from_raw(mode),
            size,
            CheckVariant::NoFlags,
        )
    });
    i32::from(valid == Some(true))
}

// =============================================================================
// String instructions
// =============================================================================

#[allow(clippy::too_many_arguments)]
#[inline(always)]
unsafe fn check_string(
    dst: *const c_void,
    dst_mode: AccessMode,
    src: *const c_void,
    src_mode: AccessMode,
    count: usize,
    access_size: usize,
    direction: u32,
    compare: bool,
) -> usize {
    let step = access_size as isize;
    let access = StringAccess {
        dst: dst as usize,
        dst_mode,
        src: src as usize,
        src_mode,
        count,
        access_size,
        stride: if direction != 0 { -step } else { step },
        compare,
    };
    with_rtl(|state| check::check_strings(state, &access, CheckVariant::PreserveFlags)).unwrap_or(0)
}

macro_rules! string_checks {
    ($($size:literal => $cmps:ident, $repz_cmps:ident, $movs:ident, $repz_movs:ident,
                        $stos:ident, $repz_stos:ident;)*) => {
        $(
            /// # Safety
            ///
            /// Both operands must be readable wherever their checks pass.
            #[no_mangle]
            pub unsafe extern "C" fn $cmps(
                dst: *const c_void,
                src: *const c_void,
                direction: u32,
            ) -> usize {
                check_string(dst, AccessMode::Read, src, AccessMode::Read, 1, $size, direction, true)
            }

            /// # Safety
            ///
            /// Both operands must be readable wherever their checks pass.
            #[no_mangle]
            pub unsafe extern "C" fn $repz_cmps(
                dst: *const c_void,
                src: *const c_void,
                count: usize,
                direction: u32,
            ) -> usize {
                check_string(dst, AccessMode::Read, src, AccessMode::Read, count, $size, direction, true)
            }

            #[no_mangle]
            pub extern "C" fn $movs(dst: *mut c_void, src: *const c_void, direction: u32) -> usize {
                // SAFETY: without compare no operand is dereferenced.
                unsafe {
                    check_string(dst, AccessMode::Write, src, AccessMode::Read, 1, $size, direction, false)
                }
            }

            #[no_mangle]
            pub extern "C" fn $repz_movs(
                dst: *mut c_void,
                src: *const c_void,
                count: usize,
                direction: u32,
            ) -> usize {
                // SAFETY: without compare no operand is dereferenced.
                unsafe {
                    check_string(dst, AccessMode::Write, src, AccessMode::Read, count, $size, direction, false)
                }
            }

            #[no_mangle]
            pub extern "C" fn $stos(dst: *mut c_void, direction: u32) -> usize {
                // SAFETY: without compare no operand is dereferenced.
                unsafe {
                    check_string(dst, AccessMode::Write, std::ptr::null(), AccessMode::Unknown, 1, $size, direction, false)
                }
            }

            #[no_mangle]
            pub extern "C" fn $repz_stos(dst: *mut c_void, count: usize, direction: u32) -> usize {
                // SAFETY: without compare no operand is dereferenced.
                unsafe {
                    check_string(dst, AccessMode::Write, std::ptr::null(), AccessMode::Unknown, count, $size, direction, false)
                }
            }
        )*
    };
}

string_checks! {
    1 => asan_check_1_byte_cmps_access, asan_check_repz_1_byte_cmps_access,
         asan_check_1_byte_movs_access, asan_check_repz_1_byte_movs_access,
         asan_check_1_byte_stos_access, asan_check_repz_1_byte_stos_access;
    2 => asan_check_2_byte_cmps_access, asan_check_repz_2_byte_cmps_access,
         asan_check_2_byte_movs_access, asan_check_repz_2_byte_movs_access,
         asan_check_2_byte_stos_access, asan_check_repz_2_byte_stos_access;
    4 => asan_check_4_byte_cmps_access, asan_check_repz_4_byte_cmps_access,
         asan_check_4_byte_movs_access, asan_check_repz_4_byte_movs_access,
         asan_check_4_byte_stos_access, asan_check_repz_4_byte_stos_access;
}

/// General string check for widths and modes the fixed symbols do not
/// cover. Returns the number of elements examined.
///
/// # Safety
///
/// With `compare` non-zero, both operands must be readable wherever their
/// checks pass.
#[allow(clippy::too_many_arguments)]
#[no_mangle]
pub unsafe extern "C" fn asan_check_strings_access(
    dst: *const c_void,
    dst_mode: u32,
    src: *const c_void,
    src_mode: u32,
    count: usize,
    access_size: usize,
    stride: isize,
    compare: u32,
) -> usize {
    let access = StringAccess {
        dst: dst as usize,
        dst_mode: AccessMode::from_raw(dst_mode),
        src: src as usize,
        src_mode: AccessMode::from_raw(src_mode),
        count,
        access_size,
        stride,
        compare: compare != 0,
    };
    with_rtl(|state| check::check_strings(state, &access, CheckVariant::NoFlags)).unwrap_or(0)
}
