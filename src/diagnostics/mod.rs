//! Error reporting.
//!
//! This module provides:
//! - **Error kinds**: classified memory errors with stable codes
//! - **Reports**: the structured record of one error, plus its C layout
//! - **Callback slot**: the single process-wide receiver of reports
//! - **Emission**: `log` output and an in-memory collecting sink
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | HG001 | heap-buffer-overflow           |
//! | HG002 | heap-buffer-underflow          |
//! | HG003 | heap-use-after-free            |
//! | HG004 | unknown-bad-access             |
//! | HG005 | wild-access                    |
//! | HG9xx | Internal errors                |

pub mod context;
pub mod emit;
pub mod hooks;
pub mod kind;
pub mod report;

pub use context::{AsanContext, ErrorContext};
pub use emit::{emit, emit_report, is_suppressed, suppress_diagnostics, CollectingSink};
pub use hooks::{CallbackSlot, ErrorCallback, ReportSink};
pub use kind::{BadAccessKind, Diagnostic, DiagnosticKind};
pub use kind::{HG001, HG002, HG003, HG004, HG005, HG901};
pub use report::{AsanErrorInfo, ErrorReport};
