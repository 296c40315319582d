//! Thread-local state management.
//!
//! Each thread gets a small ordinal for error contexts, and a flag marking
//! that it is inside the error pipeline so a fault raised while building a
//! report cannot recurse back into it.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ORDINAL: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ORDINAL: Cell<u64> = const { Cell::new(0) };
    static IN_ERROR_PATH: Cell<bool> = const { Cell::new(false) };
}

/// A stable, process-unique number for the calling thread.
pub fn thread_ordinal() -> u64 {
    THREAD_ORDINAL
        .try_with(|ordinal| {
            if ordinal.get() == 0 {
                ordinal.set(NEXT_THREAD_ORDINAL.fetch_add(1, Ordering::Relaxed));
            }
            ordinal.get()
        })
        .unwrap_or(0)
}

/// Marks the current thread as inside the error pipeline.
///
/// Dropping the guard clears the mark, including on unwind out of a
/// panicking callback.
pub struct ErrorPathGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ErrorPathGuard {
    /// Enter the error pipeline. Returns `None` if this thread is already in
    /// it, or if thread-local storage is being torn down.
    pub fn enter() -> Option<Self> {
        let entered = IN_ERROR_PATH
            .try_with(|flag| !flag.replace(true))
            .unwrap_or(false);
        entered.then(|| Self {
            _not_send: std::marker::PhantomData,
        })
    }

    /// Whether the calling thread is currently reporting an error.
    pub fn is_active() -> bool {
        IN_ERROR_PATH.try_with(Cell::get).unwrap_or(false)
    }
}

impl Drop for ErrorPathGuard {
    fn drop(&mut self) {
        let _ = IN_ERROR_PATH.try_with(|flag| flag.set(false));
    }
}
