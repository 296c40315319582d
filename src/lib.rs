//! # heapguard
//!
//! A runtime heap-error detector for binary-instrumented programs.
//!
//! ## Features
//!
//! - Radix shadow memory with 8-byte granules and partial-granule precision
//! - Heap proxies with redzones and a bounded FIFO quarantine
//! - One-load fast path for access checks, precise slow path on violation
//! - String-instruction checks with repeat-while-equal semantics
//! - Error reports with allocation, free and crash stack identities
//! - Ignore set of crash stacks for known bugs
//! - `extern "C"` entry points matching the native heap API
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use heapguard::{AccessMode, AsanConfig, AsanRuntime, HeapFlags, HeapOptions};
//!
//! let runtime = AsanRuntime::new(AsanConfig::default());
//! runtime.on_error(|context, report| eprintln!("{} [{}]", report, context));
//!
//! let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
//! let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 10);
//!
//! // One past the end lands in the right redzone.
//! runtime.check_access(ptr as usize + 10, AccessMode::Write, 1);
//!
//! unsafe { runtime.heap_free(heap, HeapFlags::NONE, ptr) };
//! runtime.heap_destroy(heap);
//! ```

pub mod api;
pub mod check;
pub mod diagnostics;
pub mod rtl;
pub mod stack;

#[allow(dead_code)]
mod allocators;
#[allow(dead_code)]
mod core;
#[allow(dead_code)]
mod sync;
#[allow(dead_code)]
mod util;

// Re-export public API at crate root for convenience
pub use api::config::{AsanConfig, ConfigError, OPTIONS_ENV_VAR};
pub use api::runtime::AsanRuntime;
pub use api::stats::RuntimeStats;

// Access checks
pub use check::{AccessMode, CheckVariant, StringAccess};

// Shadow memory
pub use crate::core::shadow::{Shadow, ShadowMarker, GRANULE_SIZE};

// Heap API types
pub use allocators::block::{BlockDescription, BlockRegion, BlockState};
pub use allocators::heap::{SystemHeap, SystemHeapProvider};
pub use allocators::native::{
    HeapFlags, HeapHandle, HeapInformationClass, HeapOptions, HeapWalkEntry, NativeHeap,
    NativeHeapProvider, PROCESS_HEAP_ENTRY_BUSY,
};

// Stacks
pub use stack::{StackCapture, StackCaptureCache, StackId};

// Diagnostics - Core types and predefined codes
pub use diagnostics::{BadAccessKind, Diagnostic, DiagnosticKind};
pub use diagnostics::{CollectingSink, ErrorCallback, ErrorContext, ErrorReport, ReportSink};
pub use diagnostics::{HG001, HG002, HG003, HG004, HG005, HG901};

// C entry points
pub use rtl::{is_installed, set_up_rtl, tear_down_rtl};
