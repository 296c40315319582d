//! Heap API entry points.
//!
//! Drop-in replacements for the native heap functions, with the same
//! argument order and failure values. Handles are the runtime's
//! [`HeapHandle`] values cast to pointers.

#![allow(non_snake_case)]

use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use crate::allocators::native::{
    HeapFlags, HeapHandle, HeapInformationClass, HeapOptions, HeapWalkEntry,
};
use crate::diagnostics::{AsanContext, AsanErrorInfo, ErrorContext, ErrorReport, ReportSink};
use crate::stack::StackId;

use super::installed_runtime;

#[allow(clippy::upper_case_acronyms)]
pub type HANDLE = *mut c_void;
#[allow(clippy::upper_case_acronyms)]
pub type BOOL = i32;

const TRUE: BOOL = 1;
const FALSE: BOOL = 0;

fn handle(heap: HANDLE) -> HeapHandle {
    HeapHandle(heap as usize)
}

fn to_bool(value: bool) -> BOOL {
    if value {
        TRUE
    } else {
        FALSE
    }
}

/// The process heap handle, forwarded untouched by every entry point.
#[no_mangle]
pub extern "C" fn asan_GetProcessHeap() -> HANDLE {
    HeapHandle::PROCESS.0 as HANDLE
}

#[no_mangle]
pub extern "C" fn asan_HeapCreate(options: u32, initial_size: usize, maximum_size: usize) -> HANDLE {
    let options = HeapOptions {
        flags: HeapFlags(options),
        initial_size,
        max_size: maximum_size,
    };
    installed_runtime()
        .and_then(|runtime| runtime.heap_create(options))
        .map_or(ptr::null_mut(), |heap| heap.0 as HANDLE)
}

#[no_mangle]
pub extern "C" fn asan_HeapDestroy(heap: HANDLE) -> BOOL {
    to_bool(installed_runtime().is_some_and(|runtime| runtime.heap_destroy(handle(heap))))
}

#[no_mangle]
pub extern "C" fn asan_HeapAlloc(heap: HANDLE, flags: u32, bytes: usize) -> *mut c_void {
    installed_runtime().map_or(ptr::null_mut(), |runtime| {
        runtime.heap_alloc(handle(heap), HeapFlags(flags), bytes).cast()
    })
}

/// # Safety
///
/// `mem` must be null or a block returned by this heap.
#[no_mangle]
pub unsafe extern "C" fn asan_HeapReAlloc(
    heap: HANDLE,
    flags: u32,
    mem: *mut c_void,
    bytes: usize,
) -> *mut c_void {
    installed_runtime().map_or(ptr::null_mut(), |runtime| {
        runtime
            .heap_realloc(handle(heap), HeapFlags(flags), mem.cast(), bytes)
            .cast()
    })
}

/// # Safety
///
/// On the process heap, `mem` must be null or a live block of that heap.
/// Proxied heaps report bad pointers instead of trusting them.
#[no_mangle]
pub unsafe extern "C" fn asan_HeapFree(heap: HANDLE, flags: u32, mem: *mut c_void) -> BOOL {
    to_bool(
        installed_runtime()
            .is_some_and(|runtime| runtime.heap_free(handle(heap), HeapFlags(flags), mem.cast())),
    )
}

/// Requested size of a block, `usize::MAX` on failure.
#[no_mangle]
pub extern "C" fn asan_HeapSize(heap: HANDLE, flags: u32, mem: *const c_void) -> usize {
    installed_runtime()
        .and_then(|runtime| runtime.heap_size(handle(heap), HeapFlags(flags), mem.cast()))
        .unwrap_or(usize::MAX)
}

#[no_mangle]
pub extern "C" fn asan_HeapValidate(heap: HANDLE, flags: u32, mem: *const c_void) -> BOOL {
    to_bool(
        installed_runtime()
            .is_some_and(|runtime| runtime.heap_validate(handle(heap), HeapFlags(flags), mem.cast())),
    )
}

#[no_mangle]
pub extern "C" fn asan_HeapCompact(heap: HANDLE, flags: u32) -> usize {
    installed_runtime().map_or(0, |runtime| runtime.heap_compact(handle(heap), HeapFlags(flags)))
}

#[no_mangle]
pub extern "C" fn asan_HeapLock(heap: HANDLE) -> BOOL {
    to_bool(installed_runtime().is_some_and(|runtime| runtime.heap_lock(handle(heap))))
}

#[no_mangle]
pub extern "C" fn asan_HeapUnlock(heap: HANDLE) -> BOOL {
    to_bool(installed_runtime().is_some_and(|runtime| runtime.heap_unlock(handle(heap))))
}

/// # Safety
///
/// `entry` must point to a valid, writable walk entry.
#[no_mangle]
pub unsafe extern "C" fn asan_HeapWalk(heap: HANDLE, entry: *mut HeapWalkEntry) -> BOOL {
    let Some(entry) = entry.as_mut() else {
        return FALSE;
    };
    to_bool(installed_runtime().is_some_and(|runtime| runtime.heap_walk(handle(heap), entry)))
}

/// # Safety
///
/// `information` must be null or readable for `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn asan_HeapSetInformation(
    heap: HANDLE,
    class: u32,
    information: *const c_void,
    length: usize,
) -> BOOL {
    let Some(class) = HeapInformationClass::from_raw(class) else {
        return FALSE;
    };
    let payload: &[u8] = if information.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(information.cast(), length)
    };
    to_bool(
        installed_runtime()
            .is_some_and(|runtime| runtime.heap_set_information(handle(heap), class, payload)),
    )
}

/// # Safety
///
/// `information` must be null or writable for `length` bytes;
/// `return_length` must be null or writable.
#[no_mangle]
pub unsafe extern "C" fn asan_HeapQueryInformation(
    heap: HANDLE,
    class: u32,
    information: *mut c_void,
    length: usize,
    return_length: *mut usize,
) -> BOOL {
    let Some(class) = HeapInformationClass::from_raw(class) else {
        return FALSE;
    };
    let Some(runtime) = installed_runtime() else {
        return FALSE;
    };
    let out: &mut [u8] = if information.is_null() {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(information.cast(), length)
    };
    let (ok, needed) = match runtime.heap_query_information(handle(heap), class, out) {
        Ok(written) => (true, written),
        Err(needed) => (false, needed),
    };
    if let Some(return_length) = return_length.as_mut() {
        *return_length = needed;
    }
    to_bool(ok)
}

// =============================================================================
// Reporting
// =============================================================================

/// C error callback: receives the captured context and the report.
pub type AsanErrorCallBack = unsafe extern "C" fn(*const AsanContext, *mut AsanErrorInfo);

struct CallbackAdapter(AsanErrorCallBack);

impl ReportSink for CallbackAdapter {
    fn on_error(&self, context: &ErrorContext, report: &ErrorReport) {
        let context = context.to_ffi();
        let mut info = report.to_ffi();
        // SAFETY: the callback was registered for exactly this signature and
        // both records outlive the call.
        unsafe { (self.0)(&context, &mut info) };
    }
}

/// Install the error callback; null clears it.
#[no_mangle]
pub extern "C" fn asan_SetCallBack(callback: Option<AsanErrorCallBack>) {
    let Some(runtime) = installed_runtime() else {
        return;
    };
    match callback {
        Some(callback) => runtime.set_error_callback(Arc::new(CallbackAdapter(callback))),
        None => runtime.clear_error_callback(),
    }
}

/// Suppress further errors from a crash stack.
#[no_mangle]
pub extern "C" fn asan_AddIgnoredStackId(id: u64) {
    if let Some(runtime) = installed_runtime() {
        runtime.add_ignored_stack_id(StackId(id));
    }
}
