//! Diagnostic kinds and core types.
//!
//! Mirrors rustc's diagnostic levels for familiar UX.

use crate::allocators::block::{BlockDescription, BlockRegion, BlockState};
use crate::core::shadow::ShadowMarker;

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard error - something is definitely wrong.
    Error,
    /// A warning - something is probably wrong or suboptimal.
    Warning,
    /// Additional context about another diagnostic.
    Note,
    /// Actionable suggestion to fix the issue.
    Help,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
            DiagnosticKind::Help => "help",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `HG0xx` - Detected memory errors
/// - `HG9xx` - Internal errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "HG001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }
}

// =============================================================================
// Predefined diagnostics (HG0xx - Memory errors)
// =============================================================================

/// HG001: Access past the end of a heap block.
pub const HG001: Diagnostic = Diagnostic::error("HG001", "heap-buffer-overflow")
    .with_note("the access touches the right redzone of a heap block");

/// HG002: Access before the start of a heap block.
pub const HG002: Diagnostic = Diagnostic::error("HG002", "heap-buffer-underflow")
    .with_note("the access touches the left redzone of a heap block");

/// HG003: Access to a freed block.
pub const HG003: Diagnostic = Diagnostic::error("HG003", "heap-use-after-free")
    .with_note("the block was freed and is held in quarantine");

/// HG004: Invalid free or unclassifiable access.
pub const HG004: Diagnostic = Diagnostic::error("HG004", "unknown-bad-access")
    .with_note("the address was not returned by this heap, or was already freed");

/// HG005: Access to memory marked as non-heap.
pub const HG005: Diagnostic = Diagnostic::error("HG005", "wild-access")
    .with_note("the address is poisoned but belongs to no heap block");

// =============================================================================
// Predefined diagnostics (HG9xx - Internal)
// =============================================================================

/// HG901: Violation raised while already reporting one.
pub const HG901: Diagnostic = Diagnostic::warning("HG901", "nested error report dropped")
    .with_note("a bad access was detected inside the error pipeline on the same thread");

/// Classification of a detected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BadAccessKind {
    HeapBufferOverflow = 1,
    HeapBufferUnderflow = 2,
    UseAfterFree = 3,
    UnknownBadAccess = 4,
    WildAccess = 5,
}

impl BadAccessKind {
    /// Classify a poisoned byte from its owning block, or from its shadow
    /// marker when no block owns it.
    pub fn classify(block: Option<&BlockDescription>, marker: Option<ShadowMarker>) -> Self {
        if let Some(block) = block {
            return match (block.state, block.region) {
                (BlockState::Quarantined | BlockState::Freed, _) => Self::UseAfterFree,
                (_, Some(BlockRegion::LeftRedzone)) => Self::HeapBufferUnderflow,
                (_, Some(BlockRegion::RightRedzone | BlockRegion::Payload)) => {
                    Self::HeapBufferOverflow
                }
                (_, None) => Self::UnknownBadAccess,
            };
        }
        match marker {
            Some(ShadowMarker::HeapFreed) => Self::UseAfterFree,
            Some(ShadowMarker::HeapLeftRedzone) => Self::HeapBufferUnderflow,
            Some(ShadowMarker::HeapRightRedzone) => Self::HeapBufferOverflow,
            Some(ShadowMarker::NonHeap) => Self::WildAccess,
            None => Self::UnknownBadAccess,
        }
    }

    /// The diagnostic describing this kind.
    pub fn diagnostic(&self) -> &'static Diagnostic {
        match self {
            Self::HeapBufferOverflow => &HG001,
            Self::HeapBufferUnderflow => &HG002,
            Self::UseAfterFree => &HG003,
            Self::UnknownBadAccess => &HG004,
            Self::WildAccess => &HG005,
        }
    }

    /// Stable diagnostic code.
    pub fn code(&self) -> &'static str {
        self.diagnostic().code
    }

    /// Short name, as printed in reports.
    pub fn description(&self) -> &'static str {
        self.diagnostic().message
    }
}

impl std::fmt::Display for BadAccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}
