//! Heap proxy: redzones and quarantine around a native heap.
//!
//! Every block the proxy hands out is surrounded by poisoned redzones, and
//! every freed block stays poisoned in a bounded quarantine before the
//! native heap gets it back. Metadata lives under one mutex per proxy; the
//! native heap is never called while it is held.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::allocators::block::{BlockDescription, BlockInfo, BlockLayout, BlockState};
use crate::allocators::deferred::ReleaseQueue;
use crate::allocators::native::{
    HeapFlags, HeapInformationClass, HeapOptions, HeapWalkEntry, NativeHeap, NativeHeapProvider,
};
use crate::allocators::quarantine::{Quarantine, QuarantineEntry};
use crate::api::config::AsanConfig;
use crate::core::shadow::{Shadow, ShadowMarker};
use crate::stack::{StackCapture, StackCaptureCache};
use crate::sync::atomics::StatCounter;
use crate::sync::mutex::Mutex;

/// Counters shared by every proxy of a runtime.
#[derive(Default)]
pub struct HeapCounters {
    pub allocations: StatCounter,
    pub frees: StatCounter,
    pub evictions: StatCounter,
    pub invalid_frees: StatCounter,
}

/// A free the proxy refused.
#[derive(Debug, Clone)]
pub struct InvalidFree {
    pub address: usize,
    /// The tracked block around `address`, if any (double free, interior
    /// pointer).
    pub block: Option<BlockDescription>,
}

struct HeapState {
    /// Keyed by native base.
    blocks: BTreeMap<usize, BlockInfo>,
    quarantine: Quarantine,
}

impl HeapState {
    fn find(&self, address: usize) -> Option<&BlockInfo> {
        self.blocks
            .range(..=address)
            .next_back()
            .map(|(_, block)| block)
            .filter(|block| block.contains(address))
    }
}

/// The proxy around one native heap.
pub struct HeapProxy {
    native: Box<dyn NativeHeap>,
    shadow: Arc<Shadow>,
    stacks: Arc<StackCaptureCache>,
    counters: Arc<HeapCounters>,
    state: Mutex<HeapState>,
    releases: ReleaseQueue,
    left_redzone: usize,
    right_redzone: usize,
    max_stack_depth: usize,
}

impl HeapProxy {
    /// Wrap an existing native heap.
    pub fn new(
        native: Box<dyn NativeHeap>,
        shadow: Arc<Shadow>,
        stacks: Arc<StackCaptureCache>,
        counters: Arc<HeapCounters>,
        config: &AsanConfig,
    ) -> Self {
        // Normalise the redzones once so every block shares the same left
        // offset.
        let left_redzone = BlockLayout::new(0, config.left_redzone_size, 0)
            .map_or(crate::core::shadow::GRANULE_SIZE, |layout| layout.left_redzone);
        let right_redzone = BlockLayout::new(0, 0, config.right_redzone_size)
            .map_or(crate::core::shadow::GRANULE_SIZE, |layout| layout.right_redzone);

        Self {
            native,
            shadow,
            stacks,
            counters,
            state: Mutex::new(HeapState {
                blocks: BTreeMap::new(),
                quarantine: Quarantine::new(
                    config.quarantine_max_size,
                    config.quarantine_max_blocks,
                ),
            }),
            releases: ReleaseQueue::new(),
            left_redzone,
            right_redzone,
            max_stack_depth: config.max_stack_depth,
        }
    }

    /// Create a native heap through `provider` and wrap it.
    pub fn create(
        provider: &dyn NativeHeapProvider,
        options: HeapOptions,
        shadow: Arc<Shadow>,
        stacks: Arc<StackCaptureCache>,
        counters: Arc<HeapCounters>,
        config: &AsanConfig,
    ) -> Option<Self> {
        let native = provider.create(options)?;
        Some(Self::new(native, shadow, stacks, counters, config))
    }

    /// Release every block and destroy the native heap.
    ///
    /// The caller must already have unregistered the proxy.
    pub fn destroy(&self) -> bool {
        self.drain_releases();

        let blocks = {
            let mut state = self.state.lock();
            state.quarantine.drain();
            std::mem::take(&mut state.blocks)
        };
        for block in blocks.into_values() {
            self.shadow.unpoison(block.base, block.padded_size());
            self.release_stacks(block);
        }

        self.native.destroy()
    }

    fn capture_stack(&self) -> Arc<StackCapture> {
        self.stacks.save(StackCapture::capture(2, self.max_stack_depth))
    }

    fn release_stacks(&self, block: BlockInfo) {
        let BlockInfo {
            alloc_stack,
            free_stack,
            ..
        } = block;
        self.stacks.release(alloc_stack);
        if let Some(stack) = free_stack {
            self.stacks.release(stack);
        }
    }

    /// Allocate `size` bytes between two redzones.
    ///
    /// Returns null if the padded size overflows or the native heap fails.
    pub fn alloc(&self, flags: HeapFlags, size: usize) -> *mut u8 {
        let Some(layout) = BlockLayout::new(size, self.left_redzone, self.right_redzone) else {
            return std::ptr::null_mut();
        };
        let Some(padded) = layout.padded_size() else {
            return std::ptr::null_mut();
        };

        let base = self.native.alloc(flags, padded);
        if base.is_null() {
            return base;
        }

        let block = BlockInfo {
            base: base as usize,
            layout,
            state: BlockState::Allocated,
            alloc_stack: self.capture_stack(),
            free_stack: None,
        };
        let user = block.user();

        self.shadow
            .poison(block.base, layout.left_redzone, ShadowMarker::HeapLeftRedzone);
        self.shadow.unpoison(user, size);
        self.shadow
            .poison(user + size, layout.right_redzone, ShadowMarker::HeapRightRedzone);

        self.state.lock().blocks.insert(block.base, block);
        self.counters.allocations.increment();
        user as *mut u8
    }

    /// Move a block to a new size.
    ///
    /// Never resizes in place: with [`HeapFlags::REALLOC_IN_PLACE_ONLY`] the
    /// call fails. A pointer that is not a live block is refused like a bad
    /// free, including with a zero size.
    pub fn realloc(
        &self,
        flags: HeapFlags,
        ptr: *mut u8,
        size: usize,
    ) -> Result<*mut u8, InvalidFree> {
        if ptr.is_null() {
            return Ok(self.alloc(flags, size));
        }
        if size == 0 {
            return self.free(flags, ptr).map(|()| std::ptr::null_mut());
        }

        let old_size = self.size(flags, ptr).ok_or_else(|| self.refuse(ptr as usize))?;
        if flags.contains(HeapFlags::REALLOC_IN_PLACE_ONLY) {
            return Ok(std::ptr::null_mut());
        }
        let fresh = self.alloc(flags, size);
        if fresh.is_null() {
            return Ok(fresh);
        }

        // SAFETY: both payloads are live, unpoisoned and at least this long.
        unsafe { std::ptr::copy_nonoverlapping(ptr, fresh, old_size.min(size)) };
        self.free(flags, ptr)?;
        Ok(fresh)
    }

    fn refuse(&self, address: usize) -> InvalidFree {
        self.counters.invalid_frees.increment();
        let state = self.state.lock();
        InvalidFree {
            address,
            block: state.find(address).map(|block| block.describe(address)),
        }
    }

    /// Free a block into quarantine.
    ///
    /// Freeing null succeeds. Any pointer that is not the start of a live
    /// block is refused and described for error reporting.
    pub fn free(&self, _flags: HeapFlags, ptr: *mut u8) -> Result<(), InvalidFree> {
        if ptr.is_null() {
            return Ok(());
        }
        let address = ptr as usize;
        let base = address.wrapping_sub(self.left_redzone);
        let free_stack = self.capture_stack();

        let refused = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let live = state.blocks.get_mut(&base).filter(|block| {
                block.user() == address && block.state == BlockState::Allocated
            });
            match live {
                Some(block) => {
                    block.state = BlockState::Quarantined;
                    block.free_stack = Some(Arc::clone(&free_stack));
                    let size = block.padded_size();
                    self.shadow.poison(base, size, ShadowMarker::HeapFreed);

                    for evicted in state.quarantine.push(QuarantineEntry { base, size }) {
                        if let Some(mut block) = state.blocks.remove(&evicted.base) {
                            block.state = BlockState::Freed;
                            self.releases.push(block);
                        }
                    }
                    None
                }
                None => Some(InvalidFree {
                    address,
                    block: state.find(address).map(|block| block.describe(address)),
                }),
            }
        };

        match refused {
            None => {
                self.counters.frees.increment();
                self.drain_releases();
                Ok(())
            }
            Some(invalid) => {
                self.stacks.release(free_stack);
                self.counters.invalid_frees.increment();
                Err(invalid)
            }
        }
    }

    fn drain_releases(&self) {
        let evicted = self.releases.drain(|block| {
            self.shadow.unpoison(block.base, block.padded_size());
            // SAFETY: the block left the table under the lock, so nothing
            // else can release it.
            unsafe { self.native.free(HeapFlags::NONE, block.base as *mut u8) };
            log::debug!("evicted block at {:#x} ({} bytes)", block.user(), block.requested_size());
            self.release_stacks(block);
        });
        self.counters.evictions.add(evicted as u64);
    }

    /// Requested size of a live block.
    pub fn size(&self, _flags: HeapFlags, ptr: *const u8) -> Option<usize> {
        let address = ptr as usize;
        let state = self.state.lock();
        state
            .blocks
            .get(&address.wrapping_sub(self.left_redzone))
            .filter(|block| block.user() == address && block.state == BlockState::Allocated)
            .map(BlockInfo::requested_size)
    }

    /// Check a live block, or the whole heap for null.
    pub fn validate(&self, flags: HeapFlags, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return self.native.validate(flags, ptr);
        }
        if self.size(flags, ptr).is_none() {
            return false;
        }
        let base = (ptr as usize).wrapping_sub(self.left_redzone);
        self.native.validate(flags, base as *const u8)
    }

    pub fn compact(&self, flags: HeapFlags) -> usize {
        self.native.compact(flags)
    }

    pub fn lock(&self) -> bool {
        self.native.lock()
    }

    pub fn unlock(&self) -> bool {
        self.native.unlock()
    }

    /// Step a heap walk over live blocks, in user terms.
    ///
    /// Quarantined blocks are skipped.
    pub fn walk(&self, entry: &mut HeapWalkEntry) -> bool {
        let mut cursor = *entry;
        if !cursor.data.is_null() {
            cursor.data = (cursor.data as usize).wrapping_sub(self.left_redzone) as *mut u8;
        }

        while self.native.walk(&mut cursor) {
            let state = self.state.lock();
            match state.blocks.get(&(cursor.data as usize)) {
                Some(block) if block.state == BlockState::Allocated => {
                    *entry = HeapWalkEntry {
                        data: block.user() as *mut u8,
                        data_size: block.requested_size(),
                        overhead: (block.padded_size() - block.requested_size())
                            .min(u8::MAX as usize) as u8,
                        ..cursor
                    };
                    return true;
                }
                _ => continue,
            }
        }
        false
    }

    pub fn set_information(&self, class: HeapInformationClass, payload: &[u8]) -> bool {
        self.native.set_information(class, payload)
    }

    pub fn query_information(
        &self,
        class: HeapInformationClass,
        out: &mut [u8],
    ) -> Result<usize, usize> {
        self.native.query_information(class, out)
    }

    /// Provenance of `address` if it lies in a tracked block, redzones
    /// included.
    pub fn describe(&self, address: usize) -> Option<BlockDescription> {
        self.state
            .lock()
            .find(address)
            .map(|block| block.describe(address))
    }

    /// Release every quarantined block now.
    pub fn flush_quarantine(&self) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for entry in state.quarantine.drain() {
                if let Some(mut block) = state.blocks.remove(&entry.base) {
                    block.state = BlockState::Freed;
                    self.releases.push(block);
                }
            }
        }
        self.drain_releases();
    }

    /// Bytes held in quarantine.
    pub fn quarantine_size(&self) -> usize {
        self.state.lock().quarantine.size()
    }

    /// Blocks held in quarantine.
    pub fn quarantine_len(&self) -> usize {
        self.state.lock().quarantine.len()
    }

    /// Live (allocated, not freed) blocks.
    pub fn live_blocks(&self) -> usize {
        self.state
            .lock()
            .blocks
            .values()
            .filter(|block| block.state == BlockState::Allocated)
            .count()
    }

    /// Left redzone length applied to every block.
    pub fn left_redzone(&self) -> usize {
        self.left_redzone
    }
}

impl Drop for HeapProxy {
    fn drop(&mut self) {
        self.drain_releases();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocators::heap::SystemHeapProvider;
    use crate::core::shadow::GRANULE_SIZE;

    fn proxy_with(config: AsanConfig) -> (HeapProxy, Arc<Shadow>) {
        let shadow = Arc::new(Shadow::new());
        let proxy = HeapProxy::create(
            &SystemHeapProvider::new(),
            HeapOptions::growable(),
            Arc::clone(&shadow),
            Arc::new(StackCaptureCache::new()),
            Arc::new(HeapCounters::default()),
            &config,
        )
        .unwrap();
        (proxy, shadow)
    }

    fn proxy() -> (HeapProxy, Arc<Shadow>) {
        proxy_with(AsanConfig::default())
    }

    #[test]
    fn test_alloc_poisons_redzones() {
        let (proxy, shadow) = proxy();
        let ptr = proxy.alloc(HeapFlags::NONE, 10) as usize;
        assert_ne!(ptr, 0);

        for offset in 0..10 {
            assert!(shadow.is_accessible(ptr + offset), "payload byte {}", offset);
        }
        for offset in 1..=proxy.left_redzone() {
            assert!(!shadow.is_accessible(ptr - offset));
        }
        for offset in 10..10 + 32 {
            assert!(!shadow.is_accessible(ptr + offset));
        }
        assert_eq!(shadow.marker_at(ptr - 1), Some(ShadowMarker::HeapLeftRedzone));
        assert_eq!(shadow.marker_at(ptr + 16), Some(ShadowMarker::HeapRightRedzone));
        assert_eq!(proxy.size(HeapFlags::NONE, ptr as *const u8), Some(10));
    }

    #[test]
    fn test_free_poisons_and_quarantines() {
        let (proxy, shadow) = proxy();
        let ptr = proxy.alloc(HeapFlags::NONE, 16);
        proxy.free(HeapFlags::NONE, ptr).unwrap();

        let user = ptr as usize;
        for address in user - proxy.left_redzone()..user + 16 + 32 {
            assert!(!shadow.is_accessible(address));
        }
        assert_eq!(shadow.marker_at(user), Some(ShadowMarker::HeapFreed));
        assert_eq!(proxy.quarantine_len(), 1);
        assert_eq!(proxy.size(HeapFlags::NONE, ptr), None);

        let description = proxy.describe(user).unwrap();
        assert_eq!(description.state, BlockState::Quarantined);
        assert!(description.free_stack.is_some());
    }

    #[test]
    fn test_double_free_is_refused_with_provenance() {
        let (proxy, _) = proxy();
        let ptr = proxy.alloc(HeapFlags::NONE, 8);
        proxy.free(HeapFlags::NONE, ptr).unwrap();

        let err = proxy.free(HeapFlags::NONE, ptr).unwrap_err();
        assert_eq!(err.address, ptr as usize);
        assert_eq!(err.block.unwrap().state, BlockState::Quarantined);
    }

    #[test]
    fn test_unknown_free_is_refused() {
        let (proxy, _) = proxy();
        let mut local = 0u64;
        let err = proxy
            .free(HeapFlags::NONE, &mut local as *mut u64 as *mut u8)
            .unwrap_err();
        assert!(err.block.is_none());
        assert!(proxy.free(HeapFlags::NONE, std::ptr::null_mut()).is_ok());
    }

    #[test]
    fn test_quarantine_evicts_oldest_and_unpoisons() {
        let config = AsanConfig::default().with_quarantine_max_size(3 * (32 + 16 + 32));
        let (proxy, shadow) = proxy_with(config);

        let ptrs: Vec<_> = (0..4).map(|_| proxy.alloc(HeapFlags::NONE, 16)).collect();
        for &ptr in &ptrs[..3] {
            proxy.free(HeapFlags::NONE, ptr).unwrap();
        }
        assert_eq!(proxy.quarantine_len(), 3);
        assert!(proxy.describe(ptrs[0] as usize).is_some());

        proxy.free(HeapFlags::NONE, ptrs[3]).unwrap();
        assert_eq!(proxy.quarantine_len(), 3);
        assert!(proxy.quarantine_size() <= 3 * 80);
        assert!(proxy.describe(ptrs[0] as usize).is_none());
        assert!(proxy.describe(ptrs[1] as usize).is_some());
        assert!(!shadow.is_accessible(ptrs[1] as usize));
    }

    #[test]
    fn test_realloc_moves_and_copies() {
        let (proxy, shadow) = proxy();
        let ptr = proxy.alloc(HeapFlags::NONE, 8);
        unsafe { std::ptr::copy_nonoverlapping(b"abcdefgh".as_ptr(), ptr, 8) };

        let grown = proxy.realloc(HeapFlags::NONE, ptr, 24).unwrap();
        assert!(!grown.is_null());
        assert_ne!(grown, ptr);
        assert_eq!(unsafe { std::slice::from_raw_parts(grown, 8) }, b"abcdefgh");
        assert!(!shadow.is_accessible(ptr as usize));
        assert!(shadow.is_accessible(grown as usize + 23));
        assert!(!shadow.is_accessible(grown as usize + 24));

        assert!(proxy
            .realloc(HeapFlags::REALLOC_IN_PLACE_ONLY, grown, 4)
            .unwrap()
            .is_null());
        assert!(proxy.realloc(HeapFlags::NONE, grown, 0).unwrap().is_null());
        assert_eq!(proxy.size(HeapFlags::NONE, grown), None);

        let fresh = proxy
            .realloc(HeapFlags::NONE, std::ptr::null_mut(), 4)
            .unwrap();
        assert_eq!(proxy.size(HeapFlags::NONE, fresh), Some(4));
    }

    #[test]
    fn test_realloc_refuses_freed_and_foreign_pointers() {
        let (proxy, _) = proxy();
        let ptr = proxy.alloc(HeapFlags::NONE, 16);
        proxy.free(HeapFlags::NONE, ptr).unwrap();

        let grow = proxy.realloc(HeapFlags::NONE, ptr, 32).unwrap_err();
        assert_eq!(grow.address, ptr as usize);
        assert_eq!(grow.block.map(|block| block.state), Some(BlockState::Quarantined));

        let shrink = proxy.realloc(HeapFlags::NONE, ptr, 0).unwrap_err();
        assert!(shrink.block.is_some());

        let foreign = [0u8; 16];
        let err = proxy
            .realloc(HeapFlags::NONE, foreign.as_ptr() as *mut u8, 8)
            .unwrap_err();
        assert!(err.block.is_none());
        assert_eq!(proxy.live_blocks(), 0);
    }

    #[test]
    fn test_alloc_overflow_fails() {
        let (proxy, _) = proxy();
        assert!(proxy.alloc(HeapFlags::NONE, usize::MAX - 8).is_null());
    }

    #[test]
    fn test_zero_sized_alloc() {
        let (proxy, shadow) = proxy();
        let ptr = proxy.alloc(HeapFlags::NONE, 0) as usize;
        assert_ne!(ptr, 0);
        assert!(!shadow.is_accessible(ptr));
        assert_eq!(proxy.size(HeapFlags::NONE, ptr as *const u8), Some(0));
    }

    #[test]
    fn test_walk_reports_user_blocks() {
        let (proxy, _) = proxy();
        let a = proxy.alloc(HeapFlags::NONE, 8);
        let b = proxy.alloc(HeapFlags::NONE, 24);
        let c = proxy.alloc(HeapFlags::NONE, 40);
        proxy.free(HeapFlags::NONE, b).unwrap();

        let mut entry = HeapWalkEntry::start();
        let mut seen = Vec::new();
        while proxy.walk(&mut entry) {
            seen.push((entry.data, entry.data_size));
        }
        seen.sort();
        let mut expected = vec![(a, 8), (c, 40)];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_validate_and_destroy() {
        let (proxy, shadow) = proxy();
        let ptr = proxy.alloc(HeapFlags::NONE, 32);
        assert!(proxy.validate(HeapFlags::NONE, ptr));
        assert!(proxy.validate(HeapFlags::NONE, std::ptr::null()));
        assert!(!proxy.validate(HeapFlags::NONE, unsafe { ptr.add(GRANULE_SIZE) }));

        let user = ptr as usize;
        assert!(proxy.destroy());
        assert!(shadow.is_accessible(user - 1));
        assert!(shadow.is_accessible(user + 32));
    }
}
