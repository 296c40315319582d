//! Global shared state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::allocators::heap::SystemHeapProvider;
use crate::allocators::native::{HeapHandle, NativeHeapProvider};
use crate::allocators::proxy::{HeapCounters, HeapProxy, InvalidFree};
use crate::api::config::AsanConfig;
use crate::api::stats::RuntimeStats;
use crate::check::{AccessMode, CheckVariant};
use crate::core::shadow::Shadow;
use crate::core::tls::ErrorPathGuard;
use crate::diagnostics::{
    emit, emit_report, BadAccessKind, CallbackSlot, ErrorContext, ErrorReport, HG901,
};
use crate::stack::{StackCapture, StackCaptureCache, StackId};
use crate::sync::atomics::StatCounter;
use crate::sync::mutex::Mutex;

const FIRST_HEAP_HANDLE: usize = 0x1_0000;
const HEAP_HANDLE_STRIDE: usize = 0x10;

/// State shared by every component of one runtime.
///
/// This is wrapped in an `Arc` by `AsanRuntime` for thread-safe sharing.
pub struct RuntimeState {
    /// Configuration
    config: AsanConfig,

    shadow: Arc<Shadow>,
    stacks: Arc<StackCaptureCache>,
    provider: Arc<dyn NativeHeapProvider>,

    /// Live heap proxies by handle
    heaps: Mutex<HashMap<HeapHandle, Arc<HeapProxy>>>,
    next_handle: AtomicUsize,

    /// Suppressed crash stacks
    ignored: Mutex<HashSet<StackId>>,
    callbacks: CallbackSlot,

    counters: Arc<HeapCounters>,
    heaps_created: StatCounter,
    errors_reported: StatCounter,
    errors_suppressed: StatCounter,
    nested_errors: StatCounter,
}

impl RuntimeState {
    /// Create runtime state over the system heap.
    pub fn new(config: AsanConfig) -> Self {
        Self::with_provider(config, Arc::new(SystemHeapProvider::new()))
    }

    /// Create runtime state over a custom native heap provider.
    pub fn with_provider(config: AsanConfig, provider: Arc<dyn NativeHeapProvider>) -> Self {
        let ignored = config.ignored_stack_ids.iter().copied().collect();
        Self {
            config,
            shadow: Arc::new(Shadow::new()),
            stacks: Arc::new(StackCaptureCache::new()),
            provider,
            heaps: Mutex::new(HashMap::new()),
            next_handle: AtomicUsize::new(FIRST_HEAP_HANDLE),
            ignored: Mutex::new(ignored),
            callbacks: CallbackSlot::new(),
            counters: Arc::new(HeapCounters::default()),
            heaps_created: StatCounter::new(),
            errors_reported: StatCounter::new(),
            errors_suppressed: StatCounter::new(),
            nested_errors: StatCounter::new(),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &AsanConfig {
        &self.config
    }

    #[inline(always)]
    pub fn shadow(&self) -> &Shadow {
        &self.shadow
    }

    pub fn stacks(&self) -> &StackCaptureCache {
        &self.stacks
    }

    pub fn provider(&self) -> &dyn NativeHeapProvider {
        &*self.provider
    }

    pub fn callbacks(&self) -> &CallbackSlot {
        &self.callbacks
    }

    /// Build a proxy sharing this runtime's shadow, stack cache and
    /// counters.
    pub fn create_proxy(&self, options: crate::allocators::native::HeapOptions) -> Option<HeapProxy> {
        HeapProxy::create(
            &*self.provider,
            options,
            Arc::clone(&self.shadow),
            Arc::clone(&self.stacks),
            Arc::clone(&self.counters),
            &self.config,
        )
    }

    /// Register a proxy and issue its handle.
    pub fn add_heap(&self, proxy: Arc<HeapProxy>) -> HeapHandle {
        let handle = HeapHandle(self.next_handle.fetch_add(HEAP_HANDLE_STRIDE, Ordering::Relaxed));
        self.heaps.lock().insert(handle, proxy);
        self.heaps_created.increment();
        handle
    }

    /// Unregister a proxy.
    pub fn remove_heap(&self, handle: HeapHandle) -> Option<Arc<HeapProxy>> {
        self.heaps.lock().remove(&handle)
    }

    /// Resolve a handle to its proxy.
    pub fn heap(&self, handle: HeapHandle) -> Option<Arc<HeapProxy>> {
        self.heaps.lock().get(&handle).cloned()
    }

    /// Handles of every registered proxy.
    pub fn heap_handles(&self) -> Vec<HeapHandle> {
        self.heaps.lock().keys().copied().collect()
    }

    fn live_heaps(&self) -> Vec<Arc<HeapProxy>> {
        self.heaps.lock().values().cloned().collect()
    }

    /// Add a crash stack to the ignore set.
    pub fn add_ignored_stack_id(&self, id: StackId) {
        self.ignored.lock().insert(id);
    }

    /// Whether errors from this crash stack are suppressed.
    pub fn is_ignored(&self, id: StackId) -> bool {
        self.ignored.lock().contains(&id)
    }

    /// Find the tracked block around `address` in any live heap.
    pub fn describe(&self, address: usize) -> Option<crate::allocators::block::BlockDescription> {
        self.live_heaps()
            .iter()
            .find_map(|heap| heap.describe(address))
    }

    /// Run the error pipeline: capture, filter, build, log, dispatch.
    ///
    /// Returns whether a report was dispatched.
    fn report(
        &self,
        variant: Option<CheckVariant>,
        build: impl FnOnce(Arc<StackCapture>) -> ErrorReport,
    ) -> bool {
        let Some(_guard) = ErrorPathGuard::enter() else {
            self.nested_errors.increment();
            emit(&HG901, "");
            return false;
        };

        let stack = StackCapture::capture(2, self.config.max_stack_depth);
        if self.is_ignored(stack.stack_id()) {
            self.errors_suppressed.increment();
            return false;
        }

        let pc = stack.frames().first().copied().unwrap_or(0);
        let report = build(Arc::new(stack));
        let context = ErrorContext::capture(variant, pc);

        self.errors_reported.increment();
        if self.config.log_reports {
            emit_report(&report, &context);
        }
        self.callbacks.dispatch(&context, &report);
        true
    }

    /// Report a bad access found by the check protocol. `fault` is the first
    /// inaccessible byte of the access starting at `location`.
    #[inline(never)]
    pub fn report_bad_access(
        &self,
        location: usize,
        fault: usize,
        mode: AccessMode,
        size: usize,
        variant: CheckVariant,
    ) -> bool {
        self.report(Some(variant), |crash_stack| {
            let block = self.describe(fault);
            let marker = self.shadow.marker_at(fault);
            ErrorReport {
                kind: BadAccessKind::classify(block.as_ref(), marker),
                location,
                fault_address: fault,
                mode,
                size,
                marker,
                crash_stack,
                block,
            }
        })
    }

    /// Report a free the proxy refused.
    #[inline(never)]
    pub fn report_invalid_free(&self, invalid: InvalidFree) -> bool {
        self.report(None, |crash_stack| ErrorReport {
            kind: BadAccessKind::UnknownBadAccess,
            location: invalid.address,
            fault_address: invalid.address,
            mode: AccessMode::Unknown,
            size: 0,
            marker: self.shadow.marker_at(invalid.address),
            crash_stack,
            block: invalid.block,
        })
    }

    /// Get current statistics.
    pub fn stats(&self) -> RuntimeStats {
        let heaps = self.live_heaps();
        RuntimeStats {
            heaps_created: self.heaps_created.get(),
            live_heaps: heaps.len(),
            allocations: self.counters.allocations.get(),
            frees: self.counters.frees.get(),
            invalid_frees: self.counters.invalid_frees.get(),
            quarantined_blocks: heaps.iter().map(|heap| heap.quarantine_len()).sum(),
            quarantined_bytes: heaps.iter().map(|heap| heap.quarantine_size()).sum(),
            evictions: self.counters.evictions.get(),
            errors_reported: self.errors_reported.get(),
            errors_suppressed: self.errors_suppressed.get(),
            nested_errors: self.nested_errors.get(),
            cached_stacks: self.stacks.len(),
        }
    }
}

impl Drop for RuntimeState {
    fn drop(&mut self) {
        let heaps = std::mem::take(&mut *self.heaps.lock());
        for (handle, heap) in heaps {
            if !heap.destroy() {
                log::warn!("failed to destroy {} during shutdown", handle);
            }
        }
    }
}
