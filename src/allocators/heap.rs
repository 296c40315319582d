//! System heap: the default native heap, built on the global allocator.

use std::alloc::{alloc, alloc_zeroed, dealloc, realloc, Layout};
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::allocators::native::{
    HeapFlags, HeapInformation, HeapInformationClass, HeapOptions, HeapWalkEntry, NativeHeap,
    NativeHeapProvider, PROCESS_HEAP_ENTRY_BUSY,
};
use crate::sync::atomics::{StatCounter, StatGauge};
use crate::sync::mutex::{ExplicitLock, Mutex};

/// Alignment of every block handed out.
pub const NATIVE_ALIGNMENT: usize = 16;

struct NativeBlock {
    layout: Layout,
    size: usize,
}

/// Native heap over `std::alloc`.
///
/// Uses a mutex around its block table; the proxy never calls it with its
/// own lock held.
pub struct SystemHeap {
    blocks: Mutex<BTreeMap<usize, NativeBlock>>,
    info: Mutex<HeapInformation>,
    explicit: ExplicitLock,
    max_size: usize,
    is_process_heap: bool,

    /// Bytes currently allocated
    allocated_bytes: StatGauge,

    /// Total allocation count
    allocation_count: StatCounter,
}

impl SystemHeap {
    /// Create a private heap.
    pub fn new(options: HeapOptions) -> Self {
        Self {
            blocks: Mutex::new(BTreeMap::new()),
            info: Mutex::new(HeapInformation::default()),
            explicit: ExplicitLock::new(),
            max_size: options.max_size,
            is_process_heap: false,
            allocated_bytes: StatGauge::new(),
            allocation_count: StatCounter::new(),
        }
    }

    /// Create the process heap. It grows without limit and cannot be
    /// destroyed.
    pub fn process() -> Self {
        let mut heap = Self::new(HeapOptions::growable());
        heap.is_process_heap = true;
        heap
    }

    fn layout_for(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.max(1), NATIVE_ALIGNMENT).ok()
    }

    fn within_limit(&self, extra: usize) -> bool {
        self.max_size == 0
            || self
                .allocated_bytes
                .get()
                .checked_add(extra)
                .map_or(false, |total| total <= self.max_size)
    }

    /// Bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.get()
    }

    /// Total successful allocations.
    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.get()
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    fn alloc_locked(&self, flags: HeapFlags, size: usize) -> *mut u8 {
        let Some(layout) = Self::layout_for(size) else {
            return std::ptr::null_mut();
        };
        if !self.within_limit(size) {
            return std::ptr::null_mut();
        }

        // SAFETY: layout has a non-zero size.
        let ptr = unsafe {
            if flags.contains(HeapFlags::ZERO_MEMORY) {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };

        if !ptr.is_null() {
            self.blocks.lock().insert(ptr as usize, NativeBlock { layout, size });
            self.allocated_bytes.add(size);
            self.allocation_count.increment();
        }
        ptr
    }

    unsafe fn realloc_locked(&self, flags: HeapFlags, ptr: *mut u8, size: usize) -> *mut u8 {
        let mut blocks = self.blocks.lock();
        let Some(old) = blocks.get(&(ptr as usize)) else {
            return std::ptr::null_mut();
        };
        let (old_layout, old_size) = (old.layout, old.size);

        if flags.contains(HeapFlags::REALLOC_IN_PLACE_ONLY) {
            if size > old_layout.size() {
                return std::ptr::null_mut();
            }
            if flags.contains(HeapFlags::ZERO_MEMORY) && size > old_size {
                std::ptr::write_bytes(ptr.add(old_size), 0, size - old_size);
            }
            if let Some(block) = blocks.get_mut(&(ptr as usize)) {
                block.size = size;
            }
            self.allocated_bytes.sub(old_size);
            self.allocated_bytes.add(size);
            return ptr;
        }

        let Some(new_layout) = Self::layout_for(size) else {
            return std::ptr::null_mut();
        };
        if size > old_size && !self.within_limit(size - old_size) {
            return std::ptr::null_mut();
        }
        let moved = realloc(ptr, old_layout, new_layout.size());
        if moved.is_null() {
            return moved;
        }
        if flags.contains(HeapFlags::ZERO_MEMORY) && size > old_size {
            std::ptr::write_bytes(moved.add(old_size), 0, size - old_size);
        }

        blocks.remove(&(ptr as usize));
        blocks.insert(
            moved as usize,
            NativeBlock {
                layout: new_layout,
                size,
            },
        );
        self.allocated_bytes.sub(old_size);
        self.allocated_bytes.add(size);
        moved
    }

    unsafe fn free_locked(&self, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return true;
        }
        let Some(block) = self.blocks.lock().remove(&(ptr as usize)) else {
            return false;
        };
        dealloc(ptr, block.layout);
        self.allocated_bytes.sub(block.size);
        true
    }

    fn release_all(&self) {
        let blocks = std::mem::take(&mut *self.blocks.lock());
        for (address, block) in blocks {
            // SAFETY: every entry was allocated here with this layout.
            unsafe { dealloc(address as *mut u8, block.layout) };
            self.allocated_bytes.sub(block.size);
        }
    }
}

impl NativeHeap for SystemHeap {
    fn alloc(&self, flags: HeapFlags, size: usize) -> *mut u8 {
        self.explicit.hold(|| self.alloc_locked(flags, size))
    }

    unsafe fn realloc(&self, flags: HeapFlags, ptr: *mut u8, size: usize) -> *mut u8 {
        self.explicit.hold(|| self.realloc_locked(flags, ptr, size))
    }

    unsafe fn free(&self, _flags: HeapFlags, ptr: *mut u8) -> bool {
        self.explicit.hold(|| self.free_locked(ptr))
    }

    fn size(&self, _flags: HeapFlags, ptr: *const u8) -> Option<usize> {
        self.blocks.lock().get(&(ptr as usize)).map(|block| block.size)
    }

    fn validate(&self, _flags: HeapFlags, ptr: *const u8) -> bool {
        ptr.is_null() || self.blocks.lock().contains_key(&(ptr as usize))
    }

    fn compact(&self, _flags: HeapFlags) -> usize {
        if self.max_size == 0 {
            isize::MAX as usize - self.allocated_bytes.get()
        } else {
            self.max_size.saturating_sub(self.allocated_bytes.get())
        }
    }

    fn lock(&self) -> bool {
        self.explicit.lock();
        true
    }

    fn unlock(&self) -> bool {
        self.explicit.unlock()
    }

    fn walk(&self, entry: &mut HeapWalkEntry) -> bool {
        let blocks = self.blocks.lock();
        let next = if entry.data.is_null() {
            blocks.iter().next()
        } else {
            blocks
                .range((Bound::Excluded(entry.data as usize), Bound::Unbounded))
                .next()
        };
        match next {
            Some((&address, block)) => {
                *entry = HeapWalkEntry {
                    data: address as *mut u8,
                    data_size: block.size,
                    overhead: (block.layout.size() - block.size).min(u8::MAX as usize) as u8,
                    region_index: 0,
                    flags: PROCESS_HEAP_ENTRY_BUSY,
                };
                true
            }
            None => false,
        }
    }

    fn set_information(&self, class: HeapInformationClass, payload: &[u8]) -> bool {
        self.info.lock().set(class, payload)
    }

    fn query_information(&self, class: HeapInformationClass, out: &mut [u8]) -> Result<usize, usize> {
        self.info.lock().query(class, out)
    }

    fn destroy(&self) -> bool {
        if self.is_process_heap {
            return false;
        }
        self.release_all();
        true
    }
}

impl Default for SystemHeap {
    fn default() -> Self {
        Self::new(HeapOptions::growable())
    }
}

impl Drop for SystemHeap {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Provider of [`SystemHeap`]s.
pub struct SystemHeapProvider {
    process: SystemHeap,
}

impl SystemHeapProvider {
    /// Create a provider with a fresh process heap.
    pub fn new() -> Self {
        Self {
            process: SystemHeap::process(),
        }
    }
}

impl Default for SystemHeapProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeHeapProvider for SystemHeapProvider {
    fn create(&self, options: HeapOptions) -> Option<Box<dyn NativeHeap>> {
        if options.max_size != 0 && options.initial_size > options.max_size {
            return None;
        }
        Some(Box::new(SystemHeap::new(options)))
    }

    fn process_heap(&self) -> &dyn NativeHeap {
        &self.process
    }
}
