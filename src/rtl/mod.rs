//! C entry points for instrumented code.
//!
//! Rewritten binaries call these symbols instead of the native heap API and
//! before every guarded memory reference. They resolve the runtime through
//! a single installed pointer; [`set_up_rtl`] and [`tear_down_rtl`] bracket
//! its lifetime.
//!
//! The runtime itself is an ordinary [`AsanRuntime`]; installing it here is
//! the only process-wide state the crate keeps.

pub mod checks;
pub mod heap;

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use crate::api::runtime::AsanRuntime;
use crate::core::global::RuntimeState;

static RTL: AtomicPtr<RuntimeState> = AtomicPtr::new(ptr::null_mut());
static WARNED_UNINSTALLED: AtomicBool = AtomicBool::new(false);

/// Install `runtime` as the target of the C entry points.
///
/// Fails if a runtime is already installed.
pub fn set_up_rtl(runtime: &AsanRuntime) -> bool {
    let raw = Arc::into_raw(Arc::clone(runtime.state())) as *mut RuntimeState;
    match RTL.compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            WARNED_UNINSTALLED.store(false, Ordering::Relaxed);
            log::debug!("runtime installed for C entry points");
            true
        }
        Err(_) => {
            // SAFETY: `raw` came from `Arc::into_raw` above and was never
            // published.
            drop(unsafe { Arc::from_raw(raw) });
            log::warn!("a runtime is already installed");
            false
        }
    }
}

/// Uninstall the runtime and hand it back.
///
/// # Safety
///
/// No thread may be executing a C entry point, or call one until the next
/// [`set_up_rtl`].
pub unsafe fn tear_down_rtl() -> Option<AsanRuntime> {
    let raw = RTL.swap(ptr::null_mut(), Ordering::AcqRel);
    if raw.is_null() {
        return None;
    }
    log::debug!("runtime uninstalled from C entry points");
    Some(AsanRuntime::from_state(Arc::from_raw(raw)))
}

/// Whether a runtime is installed.
pub fn is_installed() -> bool {
    !RTL.load(Ordering::Acquire).is_null()
}

/// Run `f` against the installed runtime, or return `None` if there is none.
#[inline(always)]
pub(crate) fn with_rtl<R>(f: impl FnOnce(&RuntimeState) -> R) -> Option<R> {
    let raw = RTL.load(Ordering::Acquire);
    if raw.is_null() {
        warn_uninstalled();
        return None;
    }
    // SAFETY: the pointer stays valid until `tear_down_rtl`, whose contract
    // excludes concurrent entry-point calls.
    Some(f(unsafe { &*raw }))
}

/// A handle on the installed runtime, for entry points that need the full
/// heap API.
pub(crate) fn installed_runtime() -> Option<AsanRuntime> {
    let raw = RTL.load(Ordering::Acquire);
    if raw.is_null() {
        warn_uninstalled();
        return None;
    }
    // SAFETY: as in `with_rtl`; the extra strong count keeps the state alive
    // for the returned handle.
    unsafe {
        Arc::increment_strong_count(raw);
        Some(AsanRuntime::from_state(Arc::from_raw(raw)))
    }
}

#[cold]
fn warn_uninstalled() {
    if !WARNED_UNINSTALLED.swap(true, Ordering::Relaxed) {
        log::warn!("C entry point called with no runtime installed");
    }
}
