//! The error callback slot.

use std::sync::Arc;

use crate::sync::mutex::Mutex;

use super::context::ErrorContext;
use super::report::ErrorReport;

/// Receiver of error reports.
///
/// Invoked synchronously on the faulting thread, with no runtime lock held.
pub trait ReportSink: Send + Sync {
    /// Handle one report.
    fn on_error(&self, context: &ErrorContext, report: &ErrorReport);
}

impl<F> ReportSink for F
where
    F: Fn(&ErrorContext, &ErrorReport) + Send + Sync,
{
    fn on_error(&self, context: &ErrorContext, report: &ErrorReport) {
        self(context, report)
    }
}

/// A shared error callback.
pub type ErrorCallback = Arc<dyn ReportSink>;

/// Process-wide single callback slot, replaceable at any time.
pub struct CallbackSlot {
    inner: Mutex<Option<ErrorCallback>>,
}

impl CallbackSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install a callback, returning the previous one.
    pub fn set(&self, callback: ErrorCallback) -> Option<ErrorCallback> {
        self.inner.lock().replace(callback)
    }

    /// Remove the callback.
    pub fn clear(&self) -> Option<ErrorCallback> {
        self.inner.lock().take()
    }

    /// The current callback.
    pub fn get(&self) -> Option<ErrorCallback> {
        self.inner.lock().clone()
    }

    /// Whether a callback is installed.
    pub fn is_set(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Hand `report` to the current callback, if any. The slot's lock is
    /// released before the call.
    pub fn dispatch(&self, context: &ErrorContext, report: &ErrorReport) -> bool {
        match self.get() {
            Some(callback) => {
                callback.on_error(context, report);
                true
            }
            None => false,
        }
    }
}

impl Default for CallbackSlot {
    fn default() -> Self {
        Self::new()
    }
}
