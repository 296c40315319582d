//! Diagnostic emission backend.
//!
//! Reports go to the `log` facade; embedders choose the logger. A
//! [`CollectingSink`] keeps reports in memory instead.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::sync::mutex::Mutex;

use super::context::ErrorContext;
use super::hooks::ReportSink;
use super::kind::{Diagnostic, DiagnosticKind};
use super::report::ErrorReport;

/// Global flag to suppress diagnostic output (for testing).
static DIAGNOSTICS_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Suppress all diagnostic output.
pub fn suppress_diagnostics(suppress: bool) {
    DIAGNOSTICS_SUPPRESSED.store(suppress, Ordering::Relaxed);
}

/// Check if diagnostics are suppressed.
pub fn is_suppressed() -> bool {
    DIAGNOSTICS_SUPPRESSED.load(Ordering::Relaxed)
}

/// Emit a diagnostic with runtime context.
pub fn emit(diag: &Diagnostic, context: &str) {
    if is_suppressed() {
        return;
    }

    match diag.kind {
        DiagnosticKind::Error => {
            log::error!("[heapguard][{}] error: {}", diag.code, diag.message)
        }
        DiagnosticKind::Warning => {
            log::warn!("[heapguard][{}] warning: {}", diag.code, diag.message)
        }
        DiagnosticKind::Note | DiagnosticKind::Help => {
            log::info!("[heapguard][{}] {}: {}", diag.code, diag.kind.prefix(), diag.message)
        }
    }
    if !context.is_empty() {
        log::info!("  context: {}", context);
    }
    if let Some(note) = diag.note {
        log::info!("  note: {}", note);
    }
}

/// Emit a detected error.
pub fn emit_report(report: &ErrorReport, context: &ErrorContext) {
    if is_suppressed() {
        return;
    }

    log::error!("[heapguard][{}] error: {}", report.kind.code(), report);
    log::error!("  context: {}", context);
    log::error!("  note: crash stack {}", report.crash_stack_id());
    if let Some(id) = report.alloc_stack_id() {
        log::error!("  note: allocated by stack {}", id);
    }
    if let Some(id) = report.free_stack_id() {
        log::error!("  note: freed by stack {}", id);
    }
    if let Some(marker) = report.marker {
        log::error!("  note: shadow marks {:#x} as {}", report.fault_address, marker.description());
    }
    log::debug!("{}", report.crash_stack);
}

/// A sink that keeps every report it receives.
#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<(ErrorContext, ErrorReport)>>,
}

impl CollectingSink {
    /// Create a new collecting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected reports.
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .iter()
            .map(|(_, report)| report.clone())
            .collect()
    }

    /// Get all collected contexts, in report order.
    pub fn contexts(&self) -> Vec<ErrorContext> {
        self.reports
            .lock()
            .iter()
            .map(|(context, _)| context.clone())
            .collect()
    }

    /// Number of reports collected.
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// Whether nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The most recent report.
    pub fn last(&self) -> Option<ErrorReport> {
        self.reports.lock().last().map(|(_, report)| report.clone())
    }

    /// Clear collected reports.
    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl ReportSink for CollectingSink {
    fn on_error(&self, context: &ErrorContext, report: &ErrorReport) {
        self.reports.lock().push((context.clone(), report.clone()));
    }
}
