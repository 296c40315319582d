//! The native heap interface the proxy decorates.
//!
//! These types mirror the platform heap API closely enough that the
//! `extern "C"` layer can forward arguments unchanged.

use std::fmt;

/// Opaque heap handle as seen by instrumented code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HeapHandle(pub usize);

impl HeapHandle {
    /// The null handle.
    pub const NULL: Self = Self(0);

    /// The distinguished process heap, always forwarded untouched.
    pub const PROCESS: Self = Self(1);

    /// Whether this is the null handle.
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap@{:#x}", self.0)
    }
}

/// Heap API flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct HeapFlags(pub u32);

impl HeapFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Skip the heap's internal serialisation.
    pub const NO_SERIALIZE: Self = Self(0x0000_0001);
    /// Raise an exception instead of returning null. Accepted but not
    /// honoured: failures always return null.
    pub const GENERATE_EXCEPTIONS: Self = Self(0x0000_0004);
    /// Zero-fill new memory.
    pub const ZERO_MEMORY: Self = Self(0x0000_0008);
    /// Realloc must not move the block.
    pub const REALLOC_IN_PLACE_ONLY: Self = Self(0x0000_0010);

    /// Whether every bit of `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// `self` with the bits of `other` cleared.
    pub const fn without(&self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for HeapFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Creation parameters for a native heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapOptions {
    /// Creation flags.
    pub flags: HeapFlags,
    /// Bytes to reserve up front.
    pub initial_size: usize,
    /// Growth limit in bytes; `0` means growable without limit.
    pub max_size: usize,
}

impl HeapOptions {
    /// Options for a growable heap with no reservation.
    pub const fn growable() -> Self {
        Self {
            flags: HeapFlags::NONE,
            initial_size: 0,
            max_size: 0,
        }
    }
}

/// Walk entry flag: the entry is a live allocation.
pub const PROCESS_HEAP_ENTRY_BUSY: u16 = 0x0004;

/// Cursor and result of one step of a heap walk.
///
/// Start with `data` null; each successful step overwrites the entry with
/// the next block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct HeapWalkEntry {
    pub data: *mut u8,
    pub data_size: usize,
    pub overhead: u8,
    pub region_index: u8,
    pub flags: u16,
}

impl HeapWalkEntry {
    /// A cursor positioned before the first block.
    pub const fn start() -> Self {
        Self {
            data: std::ptr::null_mut(),
            data_size: 0,
            overhead: 0,
            region_index: 0,
            flags: 0,
        }
    }
}

impl Default for HeapWalkEntry {
    fn default() -> Self {
        Self::start()
    }
}

/// Heap information classes understood by set/query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HeapInformationClass {
    /// Front-end compatibility mode (a `u32`).
    Compatibility = 0,
    /// Terminate the process on heap corruption (no payload).
    EnableTerminationOnCorruption = 1,
}

impl HeapInformationClass {
    /// Decode a raw class value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Compatibility),
            1 => Some(Self::EnableTerminationOnCorruption),
            _ => None,
        }
    }
}

/// Per-heap settings reachable through set/query information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapInformation {
    pub compatibility: u32,
    pub terminate_on_corruption: bool,
}

impl HeapInformation {
    /// Apply a set-information call. `payload` is the caller's buffer.
    pub fn set(&mut self, class: HeapInformationClass, payload: &[u8]) -> bool {
        match class {
            HeapInformationClass::Compatibility => match <[u8; 4]>::try_from(payload) {
                Ok(bytes) => {
                    self.compatibility = u32::from_ne_bytes(bytes);
                    true
                }
                Err(_) => false,
            },
            HeapInformationClass::EnableTerminationOnCorruption => {
                self.terminate_on_corruption = true;
                true
            }
        }
    }

    /// Serve a query-information call into `out`, returning the byte count
    /// the class needs. Fails when `out` is too small.
    pub fn query(&self, class: HeapInformationClass, out: &mut [u8]) -> Result<usize, usize> {
        match class {
            HeapInformationClass::Compatibility => {
                let bytes = self.compatibility.to_ne_bytes();
                match out.get_mut(..bytes.len()) {
                    Some(dst) => {
                        dst.copy_from_slice(&bytes);
                        Ok(bytes.len())
                    }
                    None => Err(bytes.len()),
                }
            }
            HeapInformationClass::EnableTerminationOnCorruption => Ok(0),
        }
    }
}

/// A real heap, wrapped but never reimplemented by the proxy.
///
/// Methods follow native conventions: null, `false` or `None` on failure.
pub trait NativeHeap: Send + Sync {
    /// Allocate `size` bytes aligned to at least 16.
    fn alloc(&self, flags: HeapFlags, size: usize) -> *mut u8;

    /// Resize a block, possibly moving it.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    unsafe fn realloc(&self, flags: HeapFlags, ptr: *mut u8, size: usize) -> *mut u8;

    /// Release a block.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live block of this heap, not used afterwards.
    unsafe fn free(&self, flags: HeapFlags, ptr: *mut u8) -> bool;

    /// Size of a live block.
    fn size(&self, flags: HeapFlags, ptr: *const u8) -> Option<usize>;

    /// Check one block, or the whole heap when `ptr` is null.
    fn validate(&self, flags: HeapFlags, ptr: *const u8) -> bool;

    /// Largest committed free region, `0` on failure.
    fn compact(&self, flags: HeapFlags) -> usize;

    /// Acquire the heap's explicit lock.
    fn lock(&self) -> bool;

    /// Release the heap's explicit lock.
    fn unlock(&self) -> bool;

    /// Advance `entry` to the next block. `false` when the walk is over.
    fn walk(&self, entry: &mut HeapWalkEntry) -> bool;

    /// Apply a heap setting.
    fn set_information(&self, class: HeapInformationClass, payload: &[u8]) -> bool;

    /// Read a heap setting; see [`HeapInformation::query`].
    fn query_information(&self, class: HeapInformationClass, out: &mut [u8]) -> Result<usize, usize>;

    /// Tear the heap down, releasing all of its blocks.
    fn destroy(&self) -> bool;
}

/// Source of native heaps.
pub trait NativeHeapProvider: Send + Sync {
    /// Create a private heap.
    fn create(&self, options: HeapOptions) -> Option<Box<dyn NativeHeap>>;

    /// The process heap.
    fn process_heap(&self) -> &dyn NativeHeap;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = HeapFlags::ZERO_MEMORY | HeapFlags::REALLOC_IN_PLACE_ONLY;
        assert!(flags.contains(HeapFlags::ZERO_MEMORY));
        assert!(!flags.contains(HeapFlags::NO_SERIALIZE));
        assert_eq!(flags.without(HeapFlags::ZERO_MEMORY), HeapFlags::REALLOC_IN_PLACE_ONLY);
    }

    #[test]
    fn test_information_round_trip() {
        let mut info = HeapInformation::default();
        assert!(info.set(HeapInformationClass::Compatibility, &2u32.to_ne_bytes()));
        assert!(!info.set(HeapInformationClass::Compatibility, &[1, 2]));

        let mut out = [0u8; 4];
        assert_eq!(info.query(HeapInformationClass::Compatibility, &mut out), Ok(4));
        assert_eq!(u32::from_ne_bytes(out), 2);
        assert_eq!(info.query(HeapInformationClass::Compatibility, &mut [0u8; 2]), Err(4));
    }
}
