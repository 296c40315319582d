//! The runtime context object.

use std::sync::Arc;

use crate::allocators::block::BlockDescription;
use crate::allocators::native::{
    HeapFlags, HeapHandle, HeapInformationClass, HeapOptions, HeapWalkEntry, NativeHeap,
    NativeHeapProvider,
};
use crate::allocators::proxy::{HeapProxy, InvalidFree};
use crate::api::config::{AsanConfig, ConfigError};
use crate::api::stats::RuntimeStats;
use crate::check::{self, AccessMode, CheckVariant, StringAccess};
use crate::core::global::RuntimeState;
use crate::core::shadow::Shadow;
use crate::diagnostics::{ErrorCallback, ErrorContext, ErrorReport};
use crate::stack::StackId;

/// How a heap handle resolved.
enum Target {
    Process,
    Proxy(Arc<HeapProxy>),
    Unknown,
}

/// The detector runtime.
///
/// Owns the shadow memory, the live-heap set, the ignore set and the error
/// callback. It is cheap to clone (internally uses `Arc`) and thread-safe;
/// independent runtimes do not share any state.
///
/// # Example
///
/// ```rust,no_run
/// use heapguard::{AsanConfig, AsanRuntime, HeapFlags, HeapOptions};
///
/// let runtime = AsanRuntime::new(AsanConfig::default());
/// let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
///
/// let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 10);
/// assert!(runtime.check_access(ptr as usize + 9, heapguard::AccessMode::Read, 1));
/// assert!(!runtime.check_access(ptr as usize + 10, heapguard::AccessMode::Write, 1));
///
/// unsafe { runtime.heap_free(heap, HeapFlags::NONE, ptr) };
/// runtime.heap_destroy(heap);
/// ```
#[derive(Clone)]
pub struct AsanRuntime {
    inner: Arc<RuntimeState>,
}

impl AsanRuntime {
    /// Create a runtime over the system heap.
    pub fn new(config: AsanConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeState::new(config)),
        }
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(AsanConfig::default())
    }

    /// Create a runtime configured from `HEAPGUARD_OPTIONS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        AsanConfig::from_env().map(Self::new)
    }

    /// Create a runtime over a custom native heap provider.
    pub fn with_provider(config: AsanConfig, provider: Arc<dyn NativeHeapProvider>) -> Self {
        Self {
            inner: Arc::new(RuntimeState::with_provider(config, provider)),
        }
    }

    pub(crate) fn state(&self) -> &Arc<RuntimeState> {
        &self.inner
    }

    pub(crate) fn from_state(inner: Arc<RuntimeState>) -> Self {
        Self { inner }
    }

    /// Get the configuration.
    pub fn config(&self) -> &AsanConfig {
        self.inner.config()
    }

    /// The shadow memory, for explicit poisoning.
    pub fn shadow(&self) -> &Shadow {
        self.inner.shadow()
    }

    fn resolve(&self, handle: HeapHandle) -> Target {
        if handle == HeapHandle::PROCESS {
            return Target::Process;
        }
        match self.inner.heap(handle) {
            Some(proxy) => Target::Proxy(proxy),
            None => {
                log::warn!("unknown heap handle {}", handle);
                Target::Unknown
            }
        }
    }

    fn process_heap(&self) -> &dyn NativeHeap {
        self.inner.provider().process_heap()
    }

    // =========================================================================
    // Heap API
    // =========================================================================

    /// Create a proxied heap. Returns `None` if the native heap could not be
    /// created.
    pub fn heap_create(&self, options: HeapOptions) -> Option<HeapHandle> {
        let proxy = self.inner.create_proxy(options)?;
        let handle = self.inner.add_heap(Arc::new(proxy));
        log::debug!("created {} ({:?})", handle, options);
        Some(handle)
    }

    /// Destroy a heap. The proxy leaves the live set before it is torn down.
    pub fn heap_destroy(&self, handle: HeapHandle) -> bool {
        match self.resolve(handle) {
            Target::Process => self.process_heap().destroy(),
            Target::Proxy(_) => match self.inner.remove_heap(handle) {
                Some(proxy) => {
                    log::debug!("destroying {}", handle);
                    proxy.destroy()
                }
                None => false,
            },
            Target::Unknown => false,
        }
    }

    /// Allocate from a heap.
    pub fn heap_alloc(&self, handle: HeapHandle, flags: HeapFlags, size: usize) -> *mut u8 {
        match self.resolve(handle) {
            Target::Process => self.process_heap().alloc(flags, size),
            Target::Proxy(proxy) => proxy.alloc(flags, size),
            Target::Unknown => std::ptr::null_mut(),
        }
    }

    /// Reallocate a block.
    ///
    /// On a proxied heap, a pointer that is not a live block is reported as
    /// an unknown bad access and the call returns null.
    ///
    /// # Safety
    ///
    /// On the process heap, `ptr` must be null or a live block of that heap.
    pub unsafe fn heap_realloc(
        &self,
        handle: HeapHandle,
        flags: HeapFlags,
        ptr: *mut u8,
        size: usize,
    ) -> *mut u8 {
        match self.resolve(handle) {
            Target::Process if ptr.is_null() => self.process_heap().alloc(flags, size),
            Target::Process => self.process_heap().realloc(flags, ptr, size),
            Target::Proxy(proxy) => match proxy.realloc(flags, ptr, size) {
                Ok(fresh) => fresh,
                Err(invalid) => {
                    self.inner.report_invalid_free(invalid);
                    std::ptr::null_mut()
                }
            },
            Target::Unknown => std::ptr::null_mut(),
        }
    }

    /// Free a block.
    ///
    /// A pointer the proxy does not recognise, or any pointer on an unknown
    /// handle, is reported as an unknown bad access and the call fails.
    ///
    /// # Safety
    ///
    /// On the process heap, `ptr` must be null or a live block of that heap.
    pub unsafe fn heap_free(&self, handle: HeapHandle, flags: HeapFlags, ptr: *mut u8) -> bool {
        match self.resolve(handle) {
            Target::Process => self.process_heap().free(flags, ptr),
            Target::Proxy(proxy) => match proxy.free(flags, ptr) {
                Ok(()) => true,
                Err(invalid) => {
                    self.inner.report_invalid_free(invalid);
                    false
                }
            },
            Target::Unknown => {
                self.inner.report_invalid_free(InvalidFree {
                    address: ptr as usize,
                    block: None,
                });
                false
            }
        }
    }

    /// Requested size of a live block.
    pub fn heap_size(&self, handle: HeapHandle, flags: HeapFlags, ptr: *const u8) -> Option<usize> {
        match self.resolve(handle) {
            Target::Process => self.process_heap().size(flags, ptr),
            Target::Proxy(proxy) => proxy.size(flags, ptr),
            Target::Unknown => None,
        }
    }

    /// Validate a block, or the whole heap for a null pointer.
    pub fn heap_validate(&self, handle: HeapHandle, flags: HeapFlags, ptr: *const u8) -> bool {
        match self.resolve(handle) {
            Target::Process => self.process_heap().validate(flags, ptr),
            Target::Proxy(proxy) => proxy.validate(flags, ptr),
            Target::Unknown => false,
        }
    }

    /// Largest committed free region, `0` on failure.
    pub fn heap_compact(&self, handle: HeapHandle, flags: HeapFlags) -> usize {
        match self.resolve(handle) {
            Target::Process => self.process_heap().compact(flags),
            Target::Proxy(proxy) => proxy.compact(flags),
            Target::Unknown => 0,
        }
    }

    /// Acquire a heap's explicit lock.
    pub fn heap_lock(&self, handle: HeapHandle) -> bool {
        match self.resolve(handle) {
            Target::Process => self.process_heap().lock(),
            Target::Proxy(proxy) => proxy.lock(),
            Target::Unknown => false,
        }
    }

    /// Release a heap's explicit lock.
    pub fn heap_unlock(&self, handle: HeapHandle) -> bool {
        match self.resolve(handle) {
            Target::Process => self.process_heap().unlock(),
            Target::Proxy(proxy) => proxy.unlock(),
            Target::Unknown => false,
        }
    }

    /// Advance a heap walk.
    pub fn heap_walk(&self, handle: HeapHandle, entry: &mut HeapWalkEntry) -> bool {
        match self.resolve(handle) {
            Target::Process => self.process_heap().walk(entry),
            Target::Proxy(proxy) => proxy.walk(entry),
            Target::Unknown => false,
        }
    }

    /// Apply a heap setting. A null handle addresses the process heap.
    pub fn heap_set_information(
        &self,
        handle: HeapHandle,
        class: HeapInformationClass,
        payload: &[u8],
    ) -> bool {
        if handle.is_null() {
            return self.process_heap().set_information(class, payload);
        }
        match self.resolve(handle) {
            Target::Process => self.process_heap().set_information(class, payload),
            Target::Proxy(proxy) => proxy.set_information(class, payload),
            Target::Unknown => false,
        }
    }

    /// Read a heap setting into `out`. A null handle addresses the process
    /// heap.
    ///
    /// `Ok` carries the bytes written; `Err` the bytes needed, or `0` for an
    /// unknown handle.
    pub fn heap_query_information(
        &self,
        handle: HeapHandle,
        class: HeapInformationClass,
        out: &mut [u8],
    ) -> Result<usize, usize> {
        if handle.is_null() {
            return self.process_heap().query_information(class, out);
        }
        match self.resolve(handle) {
            Target::Process => self.process_heap().query_information(class, out),
            Target::Proxy(proxy) => proxy.query_information(class, out),
            Target::Unknown => Err(0),
        }
    }

    /// Release every quarantined block of every heap.
    pub fn flush_quarantines(&self) {
        for handle in self.heap_handles() {
            if let Some(proxy) = self.inner.heap(handle) {
                proxy.flush_quarantine();
            }
        }
    }

    /// Handles of the live proxied heaps.
    pub fn heap_handles(&self) -> Vec<HeapHandle> {
        self.inner.heap_handles()
    }

    // =========================================================================
    // Access checks
    // =========================================================================

    /// Check one access, reporting a violation. Returns whether it was valid.
    #[inline]
    pub fn check_access(&self, address: usize, mode: AccessMode, size: usize) -> bool {
        check::check_access(&self.inner, address, mode, size, CheckVariant::NoFlags)
    }

    /// [`check_access`](Self::check_access) with an explicit entry-point
    /// variant.
    #[inline]
    pub fn check_access_with(
        &self,
        address: usize,
        mode: AccessMode,
        size: usize,
        variant: CheckVariant,
    ) -> bool {
        check::check_access(&self.inner, address, mode, size, variant)
    }

    /// Check a string instruction; see [`check::check_strings`].
    ///
    /// # Safety
    ///
    /// With `compare` set, elements that pass their checks are read.
    pub unsafe fn check_strings(&self, access: &StringAccess) -> usize {
        check::check_strings(&self.inner, access, CheckVariant::NoFlags)
    }

    // =========================================================================
    // Error reporting
    // =========================================================================

    /// Install the error callback, replacing any previous one.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        self.inner.callbacks().set(callback);
    }

    /// Install a closure as the error callback.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&ErrorContext, &ErrorReport) + Send + Sync + 'static,
    {
        self.set_error_callback(Arc::new(callback));
    }

    /// Remove the error callback. Reports are still built and logged.
    pub fn clear_error_callback(&self) {
        self.inner.callbacks().clear();
    }

    /// Suppress further errors raised from this crash stack.
    pub fn add_ignored_stack_id(&self, id: StackId) {
        self.inner.add_ignored_stack_id(id);
    }

    /// Whether errors from this crash stack are suppressed.
    pub fn is_ignored(&self, id: StackId) -> bool {
        self.inner.is_ignored(id)
    }

    /// Provenance of an address inside any tracked block.
    pub fn describe(&self, address: usize) -> Option<BlockDescription> {
        self.inner.describe(address)
    }

    /// Get current statistics.
    pub fn stats(&self) -> RuntimeStats {
        self.inner.stats()
    }
}

impl std::fmt::Debug for AsanRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsanRuntime")
            .field("config", self.config())
            .finish_non_exhaustive()
    }
}
