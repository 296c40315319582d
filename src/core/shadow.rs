//! Shadow memory.
//!
//! One shadow byte describes one 8-byte granule of the address space:
//!
//! | Shadow value | Meaning                                         |
//! |--------------|-------------------------------------------------|
//! | `0`          | all 8 bytes addressable                         |
//! | `1..=7`      | only the first N bytes addressable              |
//! | `0xF0..`     | nothing addressable (see [`ShadowMarker`])      |
//!
//! The granule index is `address >> 3`. The index is split into three radix
//! levels; the top table exists from construction, mid tables and leaves are
//! installed on first write with a compare-and-swap. Reads never lock, and a
//! granule whose leaf was never written reads as `0`.

use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

use crate::util::layout::align_down;

/// log2 of the granule size.
pub const SHADOW_SHIFT: u32 = 3;

/// Bytes of address space described by one shadow byte.
pub const GRANULE_SIZE: usize = 1 << SHADOW_SHIFT;

pub(crate) const GRANULE_MASK: usize = GRANULE_SIZE - 1;

/// Shadow values with any of these bits set are fully inaccessible.
pub const NON_ACCESSIBLE_MASK: u8 = 0xF0;

const LEAF_BITS: u32 = 16;
const MID_BITS: u32 = 14;
const TOP_BITS: u32 = 15;
const INDEX_BITS: u32 = LEAF_BITS + MID_BITS + TOP_BITS;

const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const TOP_LEN: usize = 1 << TOP_BITS;

/// Number of address bits the shadow covers. Higher addresses are never
/// poisoned and always read as accessible.
pub const SHADOW_ADDRESS_BITS: u32 = INDEX_BITS + SHADOW_SHIFT;

/// Why a granule is inaccessible. Diagnostic only: every marker fails the
/// accessibility test the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShadowMarker {
    /// Memory the runtime knows is not heap memory.
    NonHeap = 0xF1,
    /// Padding before a heap block's payload.
    HeapLeftRedzone = 0xFA,
    /// Padding after a heap block's payload.
    HeapRightRedzone = 0xFB,
    /// A freed block sitting in quarantine.
    HeapFreed = 0xFD,
}

impl ShadowMarker {
    /// Decode a shadow byte, `None` for accessible and partial values.
    pub fn from_shadow_byte(value: u8) -> Option<Self> {
        match value {
            0xF1 => Some(Self::NonHeap),
            0xFA => Some(Self::HeapLeftRedzone),
            0xFB => Some(Self::HeapRightRedzone),
            0xFD => Some(Self::HeapFreed),
            _ => None,
        }
    }

    /// Short human-readable name.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NonHeap => "non-heap",
            Self::HeapLeftRedzone => "heap left redzone",
            Self::HeapRightRedzone => "heap right redzone",
            Self::HeapFreed => "freed heap memory",
        }
    }
}

#[repr(transparent)]
struct Leaf([AtomicU8; LEAF_LEN]);

#[repr(transparent)]
struct Mid([AtomicPtr<Leaf>; MID_LEN]);

#[repr(transparent)]
struct Top([AtomicPtr<Mid>; TOP_LEN]);

/// Allocate a zero-filled `T` on the heap.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid `T`.
unsafe fn zeroed_box<T>() -> Box<T> {
    let layout = Layout::new::<T>();
    let raw = alloc_zeroed(layout) as *mut T;
    if raw.is_null() {
        handle_alloc_error(layout);
    }
    Box::from_raw(raw)
}

/// Return the table behind `slot`, installing a zeroed one if absent.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid `T`, and anything stored in
/// `slot` must come from `Box::into_raw` and outlive the returned borrow.
unsafe fn install<T>(slot: &AtomicPtr<T>) -> &T {
    let current = slot.load(Ordering::Acquire);
    if !current.is_null() {
        return &*current;
    }

    let fresh = Box::into_raw(zeroed_box::<T>());
    match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => &*fresh,
        Err(winner) => {
            drop(Box::from_raw(fresh));
            &*winner
        }
    }
}

/// The shadow table for one runtime.
pub struct Shadow {
    top: Box<Top>,
}

impl Shadow {
    /// Create a shadow in which every address is accessible.
    pub fn new() -> Self {
        Self {
            // SAFETY: a table of null pointers is all zeroes.
            top: unsafe { zeroed_box() },
        }
    }

    #[inline(always)]
    fn in_range(index: usize) -> bool {
        (index as u64) >> INDEX_BITS == 0
    }

    #[inline(always)]
    fn leaf(&self, index: usize) -> Option<&Leaf> {
        if !Self::in_range(index) {
            return None;
        }
        let mid = self.top.0[index >> (LEAF_BITS + MID_BITS)].load(Ordering::Acquire);
        if mid.is_null() {
            return None;
        }
        // SAFETY: installed tables are only freed when `self` drops.
        let leaf = unsafe { &*mid }.0[(index >> LEAF_BITS) & (MID_LEN - 1)].load(Ordering::Acquire);
        if leaf.is_null() {
            return None;
        }
        // SAFETY: as above.
        Some(unsafe { &*leaf })
    }

    fn leaf_for_write(&self, index: usize) -> Option<&Leaf> {
        if !Self::in_range(index) {
            return None;
        }
        // SAFETY: Mid and Leaf are arrays of atomics, valid when zeroed, and
        // every table pointer is installed through `install`.
        unsafe {
            let mid = install(&self.top.0[index >> (LEAF_BITS + MID_BITS)]);
            Some(install(&mid.0[(index >> LEAF_BITS) & (MID_LEN - 1)]))
        }
    }

    #[inline(always)]
    fn load(&self, index: usize) -> u8 {
        match self.leaf(index) {
            Some(leaf) => leaf.0[index & (LEAF_LEN - 1)].load(Ordering::Relaxed),
            None => 0,
        }
    }

    fn store(&self, index: usize, value: u8) {
        if value == 0 && self.leaf(index).is_none() {
            return;
        }
        if let Some(leaf) = self.leaf_for_write(index) {
            leaf.0[index & (LEAF_LEN - 1)].store(value, Ordering::Relaxed);
        }
    }

    /// Set granules `first..last` to `value`, a leaf at a time.
    fn fill(&self, first: usize, last: usize, value: u8) {
        let mut index = first;
        while index < last && Self::in_range(index) {
            let stop = (((index >> LEAF_BITS) + 1) << LEAF_BITS).min(last);
            let leaf = if value == 0 {
                self.leaf(index)
            } else {
                self.leaf_for_write(index)
            };
            if let Some(leaf) = leaf {
                for cell in &leaf.0[index & (LEAF_LEN - 1)..=((stop - 1) & (LEAF_LEN - 1))] {
                    cell.store(value, Ordering::Relaxed);
                }
            }
            index = stop;
        }
    }

    /// Grow the accessible prefix of a granule to at least `valid` bytes.
    fn widen(&self, index: usize, valid: u8) {
        let current = self.load(index);
        let value = if current == 0 {
            0
        } else if current & NON_ACCESSIBLE_MASK == 0 {
            current.max(valid)
        } else {
            valid
        };
        if value != current {
            self.store(index, value);
        }
    }

    /// The raw shadow byte of the granule holding `address`.
    #[inline(always)]
    pub fn shadow_byte(&self, address: usize) -> u8 {
        self.load(address >> SHADOW_SHIFT)
    }

    /// Test a shadow byte that is known to be non-zero.
    #[inline(always)]
    pub(crate) fn partial_accessible(address: usize, shadow: u8) -> bool {
        shadow & NON_ACCESSIBLE_MASK == 0 && ((address & GRANULE_MASK) as u8) < shadow
    }

    /// Whether the byte at `address` may be accessed.
    #[inline(always)]
    pub fn is_accessible(&self, address: usize) -> bool {
        let shadow = self.shadow_byte(address);
        shadow == 0 || Self::partial_accessible(address, shadow)
    }

    /// The marker of the granule holding `address`, if it carries one.
    pub fn marker_at(&self, address: usize) -> Option<ShadowMarker> {
        ShadowMarker::from_shadow_byte(self.shadow_byte(address))
    }

    /// First inaccessible byte in `address..address + size`.
    pub fn first_poisoned_byte(&self, address: usize, size: usize) -> Option<usize> {
        let end = address.saturating_add(size);
        let mut cursor = address;
        while cursor < end {
            let shadow = self.shadow_byte(cursor);
            if shadow == 0 {
                cursor = align_down(cursor, GRANULE_SIZE).saturating_add(GRANULE_SIZE);
                continue;
            }
            if !Self::partial_accessible(cursor, shadow) {
                return Some(cursor);
            }
            cursor += 1;
        }
        None
    }

    /// Mark `address..address + size` inaccessible.
    ///
    /// Bytes before `address` in its granule keep whatever prefix validity
    /// they had. A range ending inside a granule poisons that whole granule,
    /// since the encoding can only describe a valid prefix.
    pub fn poison(&self, address: usize, size: usize, marker: ShadowMarker) {
        if size == 0 {
            return;
        }
        let end = address.saturating_add(size);
        let mut index = address >> SHADOW_SHIFT;

        let head = (address & GRANULE_MASK) as u8;
        if head != 0 {
            let current = self.load(index);
            let value = if current == 0 {
                head
            } else if current & NON_ACCESSIBLE_MASK == 0 {
                current.min(head)
            } else {
                current
            };
            self.store(index, value);
            index += 1;
        }

        let last = (end >> SHADOW_SHIFT) + usize::from(end & GRANULE_MASK != 0);
        self.fill(index, last, marker as u8);
    }

    /// Mark `address..address + size` accessible.
    ///
    /// A range ending inside a granule leaves that granule with a partial
    /// value equal to the number of leading bytes covered. Unpoisoning never
    /// shrinks what was already accessible.
    pub fn unpoison(&self, address: usize, size: usize) {
        if size == 0 {
            return;
        }
        let end = address.saturating_add(size);
        let first = address >> SHADOW_SHIFT;
        let tail_index = end >> SHADOW_SHIFT;
        let tail = (end & GRANULE_MASK) as u8;

        if first == tail_index {
            self.widen(first, tail);
            return;
        }

        self.fill(first, tail_index, 0);
        if tail != 0 {
            self.widen(tail_index, tail);
        }
    }
}

impl Default for Shadow {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Shadow {
    fn drop(&mut self) {
        for mid_slot in self.top.0.iter_mut() {
            let mid = *mid_slot.get_mut();
            if mid.is_null() {
                continue;
            }
            // SAFETY: every non-null slot was produced by `Box::into_raw` in
            // `install`, and `&mut self` means no reader is left.
            let mut mid = unsafe { Box::from_raw(mid) };
            for leaf_slot in mid.0.iter_mut() {
                let leaf = *leaf_slot.get_mut();
                if !leaf.is_null() {
                    // SAFETY: as above.
                    drop(unsafe { Box::from_raw(leaf) });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const BASE: usize = 0x7f00_0000_0000;

    #[test]
    fn test_fresh_shadow_is_accessible() {
        let shadow = Shadow::new();
        for addr in [0usize, 1, BASE, BASE + 7, usize::MAX] {
            assert!(shadow.is_accessible(addr));
            assert_eq!(shadow.shadow_byte(addr), 0);
        }
    }

    #[test]
    fn test_poison_aligned_range() {
        let shadow = Shadow::new();
        shadow.poison(BASE, 32, ShadowMarker::HeapLeftRedzone);

        for addr in BASE..BASE + 32 {
            assert!(!shadow.is_accessible(addr));
        }
        assert!(shadow.is_accessible(BASE - 1));
        assert!(shadow.is_accessible(BASE + 32));
        assert_eq!(shadow.marker_at(BASE + 8), Some(ShadowMarker::HeapLeftRedzone));
    }

    #[test]
    fn test_partial_granule_encoding() {
        let shadow = Shadow::new();
        shadow.poison(BASE, 16, ShadowMarker::HeapRightRedzone);
        shadow.unpoison(BASE, 10);

        assert_eq!(shadow.shadow_byte(BASE), 0);
        assert_eq!(shadow.shadow_byte(BASE + 8), 2);
        assert!(shadow.is_accessible(BASE + 9));
        assert!(!shadow.is_accessible(BASE + 10));
        assert!(!shadow.is_accessible(BASE + 15));
        assert_eq!(shadow.marker_at(BASE + 8), None);
    }

    #[test]
    fn test_poison_unpoison_round_trip_unaligned() {
        let shadow = Shadow::new();
        let start = BASE + 3;
        let size = 45;

        shadow.poison(start, size, ShadowMarker::HeapFreed);
        assert!(shadow.first_poisoned_byte(start, size).is_some());
        assert!(shadow.is_accessible(BASE + 2));

        shadow.unpoison(start, size);
        for addr in start..start + size {
            assert!(shadow.is_accessible(addr), "byte {:#x} still poisoned", addr);
        }
        assert_eq!(shadow.first_poisoned_byte(start, size), None);
    }

    #[test]
    fn test_round_trip_within_one_granule() {
        let shadow = Shadow::new();
        shadow.poison(BASE + 2, 3, ShadowMarker::NonHeap);
        assert!(shadow.is_accessible(BASE + 1));
        assert!(!shadow.is_accessible(BASE + 2));

        shadow.unpoison(BASE + 2, 3);
        for addr in BASE..BASE + 5 {
            assert!(shadow.is_accessible(addr));
        }
    }

    #[test]
    fn test_first_poisoned_byte() {
        let shadow = Shadow::new();
        shadow.poison(BASE, 64, ShadowMarker::HeapRightRedzone);
        shadow.unpoison(BASE, 20);

        assert_eq!(shadow.first_poisoned_byte(BASE, 20), None);
        assert_eq!(shadow.first_poisoned_byte(BASE, 21), Some(BASE + 20));
        assert_eq!(shadow.first_poisoned_byte(BASE + 16, 8), Some(BASE + 20));
    }

    #[test]
    fn test_range_across_leaf_boundary() {
        let shadow = Shadow::new();
        let leaf_span = LEAF_LEN * GRANULE_SIZE;
        let start = BASE + leaf_span - 16;

        shadow.poison(start, 32, ShadowMarker::HeapFreed);
        assert!(!shadow.is_accessible(start));
        assert!(!shadow.is_accessible(start + 31));
        assert!(shadow.is_accessible(start + 32));

        shadow.unpoison(start, 32);
        assert_eq!(shadow.first_poisoned_byte(start, 32), None);
    }

    #[test]
    fn test_addresses_beyond_coverage_are_ignored() {
        let shadow = Shadow::new();
        let high = 1usize << (SHADOW_ADDRESS_BITS - 1) << 1;
        shadow.poison(high, 64, ShadowMarker::NonHeap);
        assert!(shadow.is_accessible(high));
    }

    #[test]
    fn test_disjoint_ranges_from_many_threads() {
        let shadow = Arc::new(Shadow::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let shadow = Arc::clone(&shadow);
                std::thread::spawn(move || {
                    let start = BASE + t * 4096;
                    for _ in 0..100 {
                        shadow.poison(start, 4096, ShadowMarker::HeapFreed);
                        shadow.unpoison(start, 4000);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for t in 0..8 {
            let start = BASE + t * 4096;
            assert_eq!(shadow.first_poisoned_byte(start, 4000), None);
            assert_eq!(shadow.first_poisoned_byte(start, 4096), Some(start + 4000));
        }
    }
}
