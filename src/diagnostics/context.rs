//! Error context - the faulting thread and check site.
//!
//! Registers are not observable from Rust; the context records what the
//! check site does know: which variant ran, who called it, and on which
//! thread.

use crate::check::CheckVariant;
use crate::core::tls::thread_ordinal;

/// Context captured on the faulting thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Process-unique thread number.
    pub thread_ordinal: u64,
    /// Thread name (if available).
    pub thread_name: Option<String>,
    /// The check variant that caught the error; `None` for heap API calls.
    pub variant: Option<CheckVariant>,
    /// Innermost frame of the faulting stack, `0` if unknown.
    pub pc: usize,
}

impl ErrorContext {
    /// Capture the current thread's context.
    pub fn capture(variant: Option<CheckVariant>, pc: usize) -> Self {
        Self {
            thread_ordinal: thread_ordinal(),
            thread_name: std::thread::current().name().map(String::from),
            variant,
            pc,
        }
    }

    /// Format context for diagnostic output.
    pub fn format(&self) -> String {
        let mut parts = Vec::new();

        if let Some(ref name) = self.thread_name {
            parts.push(format!("thread=\"{}\"", name));
        } else {
            parts.push(format!("thread=#{}", self.thread_ordinal));
        }

        match self.variant {
            Some(CheckVariant::PreserveFlags) => parts.push("check=preserve_flags".to_string()),
            Some(CheckVariant::NoFlags) => parts.push("check=no_flags".to_string()),
            None => parts.push("check=heap_api".to_string()),
        }

        if self.pc != 0 {
            parts.push(format!("pc={:#x}", self.pc));
        }

        parts.join(", ")
    }

    /// The C view handed to a registered C callback.
    pub fn to_ffi(&self) -> AsanContext {
        AsanContext {
            thread_ordinal: self.thread_ordinal,
            pc: self.pc,
            flags_preserved: u32::from(self.variant == Some(CheckVariant::PreserveFlags)),
            from_heap_api: u32::from(self.variant.is_none()),
        }
    }
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.format())
    }
}

/// C layout of [`ErrorContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct AsanContext {
    pub thread_ordinal: u64,
    pub pc: usize,
    pub flags_preserved: u32,
    pub from_heap_api: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_format() {
        let ctx = ErrorContext {
            thread_ordinal: 3,
            thread_name: None,
            variant: Some(CheckVariant::NoFlags),
            pc: 0x40,
        };
        assert_eq!(ctx.format(), "thread=#3, check=no_flags, pc=0x40");

        let ffi = ctx.to_ffi();
        assert_eq!(ffi.flags_preserved, 0);
        assert_eq!(ffi.from_heap_api, 0);
    }

    #[test]
    fn test_capture_names_thread() {
        let ctx = std::thread::Builder::new()
            .name("worker".into())
            .spawn(|| ErrorContext::capture(None, 0))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(ctx.thread_name.as_deref(), Some("worker"));
        assert!(ctx.format().contains("check=heap_api"));
    }
}
