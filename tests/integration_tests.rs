//! Integration tests for heapguard.

use heapguard::{
    AccessMode, AsanConfig, AsanRuntime, BadAccessKind, BlockRegion, CollectingSink, HeapFlags,
    HeapHandle, HeapInformationClass, HeapOptions, HeapWalkEntry, ShadowMarker, StringAccess,
    GRANULE_SIZE,
};
use std::sync::Arc;
use std::thread;

fn runtime_with(config: AsanConfig) -> (AsanRuntime, Arc<CollectingSink>) {
    let runtime = AsanRuntime::new(config.with_log_reports(false));
    let sink = Arc::new(CollectingSink::new());
    runtime.set_error_callback(sink.clone());
    (runtime, sink)
}

fn runtime() -> (AsanRuntime, Arc<CollectingSink>) {
    runtime_with(AsanConfig::default())
}

#[test]
fn test_payload_accessible_redzones_not() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();

    for size in [1usize, 7, 8, 13, 64, 100] {
        let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, size) as usize;
        assert_ne!(ptr, 0);
        assert_eq!(ptr % GRANULE_SIZE, 0);

        let shadow = runtime.shadow();
        for offset in 0..size {
            assert!(shadow.is_accessible(ptr + offset), "size {} offset {}", size, offset);
        }
        for offset in 1..=32 {
            assert!(!shadow.is_accessible(ptr - offset));
            assert!(!shadow.is_accessible(ptr + size + offset - 1));
        }
    }

    assert!(sink.is_empty());
    runtime.heap_destroy(heap);
}

#[inline(never)]
fn write_byte(runtime: &AsanRuntime, address: usize) -> bool {
    runtime.check_access(address, AccessMode::Write, 1)
}

#[inline(never)]
fn read_byte(runtime: &AsanRuntime, address: usize) -> bool {
    runtime.check_access(address, AccessMode::Read, 1)
}

#[test]
fn test_overflow_by_one_reports_right_redzone() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 10) as usize;

    assert!(write_byte(&runtime, ptr + 9));
    assert!(!write_byte(&runtime, ptr + 10));
    assert_eq!(sink.len(), 1);

    let report = sink.last().unwrap();
    assert_eq!(report.kind, BadAccessKind::HeapBufferOverflow);
    assert_eq!(report.kind.code(), "HG001");
    assert_eq!(report.mode, AccessMode::Write);
    assert_eq!(report.size, 1);
    assert_eq!(report.location, ptr + 10);

    let block = report.block.as_ref().unwrap();
    assert_eq!(block.user, ptr);
    assert_eq!(block.requested_size, 10);
    assert_eq!(block.offset, 10);
    assert_eq!(block.region, Some(BlockRegion::RightRedzone));
    assert!(report.free_stack_id().is_none());

    let described = runtime.describe(ptr).unwrap();
    assert_eq!(report.alloc_stack_id(), Some(described.alloc_stack.stack_id()));
    assert!(!report.crash_stack.is_empty());

    let text = report.to_string();
    assert!(text.contains("heap-buffer-overflow"));
    assert!(text.contains("write of size 1"));

    runtime.heap_destroy(heap);
}

#[test]
fn test_underflow_reports_left_redzone() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 24) as usize;

    assert!(!read_byte(&runtime, ptr - 1));
    let report = sink.last().unwrap();
    assert_eq!(report.kind, BadAccessKind::HeapBufferUnderflow);
    assert_eq!(report.block.as_ref().unwrap().offset, -1);

    runtime.heap_destroy(heap);
}

#[test]
fn test_use_after_free_carries_both_stacks() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 16);
    assert!(unsafe { runtime.heap_free(heap, HeapFlags::NONE, ptr) });

    let ptr = ptr as usize;
    for offset in 0..16 {
        assert!(!runtime.shadow().is_accessible(ptr + offset));
    }

    assert!(!read_byte(&runtime, ptr));
    assert_eq!(sink.len(), 1);

    let report = sink.last().unwrap();
    assert_eq!(report.kind, BadAccessKind::UseAfterFree);
    assert_eq!(report.kind.code(), "HG003");
    assert_eq!(report.mode, AccessMode::Read);
    let alloc = report.alloc_stack_id().unwrap();
    let free = report.free_stack_id().unwrap();
    assert_ne!(alloc, free);

    runtime.heap_destroy(heap);
}

#[test]
fn test_retained_reports_do_not_pin_cached_stacks() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 24);
    assert!(unsafe { runtime.heap_free(heap, HeapFlags::NONE, ptr) });
    assert!(runtime.stats().cached_stacks > 0);

    assert!(!read_byte(&runtime, ptr as usize));
    let report = sink.last().unwrap();
    assert!(report.alloc_stack_id().is_some());

    runtime.flush_quarantines();
    assert_eq!(runtime.stats().cached_stacks, 0);
    assert!(sink.last().unwrap().free_stack_id().is_some());

    runtime.heap_destroy(heap);
}

#[test]
fn test_free_of_foreign_pointer_is_unknown_bad_access() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let mut foreign = [0u8; 32];

    assert!(!unsafe { runtime.heap_free(heap, HeapFlags::NONE, foreign.as_mut_ptr()) });
    assert_eq!(sink.len(), 1);

    let report = sink.last().unwrap();
    assert_eq!(report.kind, BadAccessKind::UnknownBadAccess);
    assert_eq!(report.kind.code(), "HG004");
    assert_eq!(report.location, foreign.as_ptr() as usize);
    assert!(report.block.is_none());
    assert!(report.alloc_stack_id().is_none());
    assert!(report.free_stack_id().is_none());
    assert_eq!(runtime.stats().invalid_frees, 1);

    runtime.heap_destroy(heap);
}

#[test]
fn test_double_free_keeps_provenance() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 40);

    assert!(unsafe { runtime.heap_free(heap, HeapFlags::NONE, ptr) });
    assert!(!unsafe { runtime.heap_free(heap, HeapFlags::NONE, ptr) });

    let report = sink.last().unwrap();
    assert_eq!(report.kind, BadAccessKind::UnknownBadAccess);
    assert!(report.alloc_stack_id().is_some());
    assert!(report.free_stack_id().is_some());

    runtime.heap_destroy(heap);
}

#[test]
fn test_ignore_set_suppresses_repeats() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 8) as usize;

    for _ in 0..4 {
        write_byte(&runtime, ptr + 8);
        if let Some(report) = sink.last() {
            runtime.add_ignored_stack_id(report.crash_stack_id());
        }
    }
    assert_eq!(sink.len(), 1);
    assert_eq!(runtime.stats().errors_suppressed, 3);

    // A different site still reports.
    read_byte(&runtime, ptr + 8);
    assert_eq!(sink.len(), 2);

    runtime.heap_destroy(heap);
}

#[test]
fn test_quarantine_is_fifo_and_bounded() {
    // 32-byte payloads between 16-byte redzones: 64 padded bytes each.
    let cap = 3 * 64;
    let (runtime, _) = runtime_with(
        AsanConfig::default()
            .with_redzones(16, 16)
            .with_quarantine_max_size(cap),
    );
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();

    let blocks: Vec<*mut u8> = (0..5)
        .map(|_| runtime.heap_alloc(heap, HeapFlags::NONE, 32))
        .collect();
    for (i, &ptr) in blocks.iter().enumerate() {
        assert!(unsafe { runtime.heap_free(heap, HeapFlags::NONE, ptr) });
        let stats = runtime.stats();
        assert!(stats.quarantined_bytes <= cap);
        assert_eq!(stats.quarantined_blocks, (i + 1).min(3));
    }

    let stats = runtime.stats();
    assert_eq!(stats.evictions, 2);

    // The first two freed are gone; the last three are still poisoned.
    assert!(runtime.describe(blocks[0] as usize).is_none());
    assert!(runtime.describe(blocks[1] as usize).is_none());
    for &ptr in &blocks[2..] {
        assert!(!runtime.shadow().is_accessible(ptr as usize));
    }

    runtime.flush_quarantines();
    assert_eq!(runtime.stats().quarantined_blocks, 0);
    assert!(runtime.shadow().is_accessible(blocks[4] as usize));

    runtime.heap_destroy(heap);
}

#[test]
fn test_quarantine_block_cap() {
    let (runtime, _) = runtime_with(AsanConfig::default().with_quarantine_max_blocks(2));
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();

    for _ in 0..6 {
        let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 8);
        unsafe { runtime.heap_free(heap, HeapFlags::NONE, ptr) };
    }
    let stats = runtime.stats();
    assert_eq!(stats.quarantined_blocks, 2);
    assert_eq!(stats.evictions, 4);

    runtime.heap_destroy(heap);
}

#[test]
fn test_poison_unpoison_round_trip() {
    let (runtime, _) = runtime();
    let shadow = runtime.shadow();
    let base = 0x5000_0003usize;
    let len = 29;

    shadow.poison(base, len, ShadowMarker::HeapLeftRedzone);
    shadow.unpoison(base, len);
    for address in base..base + len {
        assert!(shadow.is_accessible(address), "{:#x}", address);
    }
}

#[test]
fn test_realloc_moves_and_copies() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 8);
    unsafe { std::ptr::copy_nonoverlapping(b"heapguard".as_ptr(), ptr, 8) };

    let grown = unsafe { runtime.heap_realloc(heap, HeapFlags::NONE, ptr, 64) };
    assert!(!grown.is_null());
    assert_ne!(grown, ptr);
    assert_eq!(unsafe { std::slice::from_raw_parts(grown, 8) }, b"heapguar");
    assert_eq!(runtime.heap_size(heap, HeapFlags::NONE, grown), Some(64));
    assert!(!runtime.shadow().is_accessible(ptr as usize));

    assert!(unsafe {
        runtime.heap_realloc(heap, HeapFlags::REALLOC_IN_PLACE_ONLY, grown, 16)
    }
    .is_null());
    assert!(unsafe { runtime.heap_realloc(heap, HeapFlags::NONE, grown, 0) }.is_null());
    assert!(sink.is_empty());

    runtime.heap_destroy(heap);
}

#[test]
fn test_realloc_of_freed_pointer_is_reported() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 16);
    assert!(unsafe { runtime.heap_free(heap, HeapFlags::NONE, ptr) });

    assert!(unsafe { runtime.heap_realloc(heap, HeapFlags::NONE, ptr, 32) }.is_null());
    assert_eq!(sink.len(), 1);
    let report = sink.last().unwrap();
    assert_eq!(report.kind, BadAccessKind::UnknownBadAccess);
    assert_eq!(report.location, ptr as usize);
    assert!(report.alloc_stack_id().is_some());
    assert!(report.free_stack_id().is_some());

    assert!(unsafe { runtime.heap_realloc(heap, HeapFlags::NONE, ptr, 0) }.is_null());
    assert_eq!(sink.len(), 2);
    assert!(sink.last().unwrap().free_stack_id().is_some());
    assert_eq!(runtime.stats().invalid_frees, 2);

    runtime.heap_destroy(heap);
}

#[test]
fn test_realloc_of_foreign_pointer_is_reported() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let mut foreign = [0u8; 32];

    for size in [0, 48] {
        let moved = unsafe { runtime.heap_realloc(heap, HeapFlags::NONE, foreign.as_mut_ptr(), size) };
        assert!(moved.is_null());
    }
    assert_eq!(sink.len(), 2);
    for report in sink.reports() {
        assert_eq!(report.kind, BadAccessKind::UnknownBadAccess);
        assert_eq!(report.location, foreign.as_ptr() as usize);
        assert!(report.block.is_none());
    }
    assert_eq!(runtime.stats().allocations, 0);

    runtime.heap_destroy(heap);
}

#[test]
fn test_heap_walk_reports_user_blocks() {
    let (runtime, _) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let a = runtime.heap_alloc(heap, HeapFlags::NONE, 12);
    let b = runtime.heap_alloc(heap, HeapFlags::NONE, 20);
    let c = runtime.heap_alloc(heap, HeapFlags::NONE, 4);
    unsafe { runtime.heap_free(heap, HeapFlags::NONE, b) };

    let mut seen = Vec::new();
    let mut entry = HeapWalkEntry::start();
    assert!(runtime.heap_lock(heap));
    while runtime.heap_walk(heap, &mut entry) {
        seen.push((entry.data, entry.data_size));
    }
    assert!(runtime.heap_unlock(heap));

    seen.sort();
    let mut expected = vec![(a, 12), (c, 4)];
    expected.sort();
    assert_eq!(seen, expected);

    runtime.heap_destroy(heap);
}

#[test]
fn test_process_heap_passthrough() {
    let (runtime, sink) = runtime();
    let ptr = runtime.heap_alloc(HeapHandle::PROCESS, HeapFlags::ZERO_MEMORY, 24);
    assert!(!ptr.is_null());
    assert_eq!(unsafe { std::slice::from_raw_parts(ptr, 24) }, &[0u8; 24]);

    // No redzones around native blocks.
    assert!(runtime.check_access(ptr as usize + 24, AccessMode::Read, 1));
    assert_eq!(runtime.heap_size(HeapHandle::PROCESS, HeapFlags::NONE, ptr), Some(24));
    assert!(unsafe { runtime.heap_free(HeapHandle::PROCESS, HeapFlags::NONE, ptr) });
    assert!(!runtime.heap_destroy(HeapHandle::PROCESS));

    let compat = 2u32.to_ne_bytes();
    assert!(runtime.heap_set_information(
        HeapHandle::NULL,
        HeapInformationClass::Compatibility,
        &compat
    ));
    let mut out = [0u8; 4];
    assert_eq!(
        runtime.heap_query_information(
            HeapHandle::PROCESS,
            HeapInformationClass::Compatibility,
            &mut out
        ),
        Ok(4)
    );
    assert_eq!(u32::from_ne_bytes(out), 2);

    assert!(sink.is_empty());
    assert_eq!(runtime.stats().allocations, 0);
}

#[test]
fn test_unknown_handle_fails() {
    let (runtime, sink) = runtime();
    let bogus = HeapHandle(0xdead_0000);

    assert!(runtime.heap_alloc(bogus, HeapFlags::NONE, 8).is_null());
    assert_eq!(runtime.heap_size(bogus, HeapFlags::NONE, std::ptr::null()), None);
    assert!(!runtime.heap_lock(bogus));
    assert!(!runtime.heap_destroy(bogus));
    assert_eq!(
        runtime.heap_query_information(bogus, HeapInformationClass::Compatibility, &mut [0; 4]),
        Err(0)
    );
    assert!(sink.is_empty());

    // Only free escalates.
    let mut foreign = [0u8; 8];
    assert!(!unsafe { runtime.heap_free(bogus, HeapFlags::NONE, foreign.as_mut_ptr()) });
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.last().unwrap().kind, BadAccessKind::UnknownBadAccess);
}

#[test]
fn test_destroyed_heap_handle_is_unknown() {
    let (runtime, _) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, 16) as usize;

    assert!(runtime.heap_destroy(heap));
    assert!(runtime.heap_handles().is_empty());
    assert!(runtime.heap_alloc(heap, HeapFlags::NONE, 8).is_null());
    // Destruction clears the shadow of every remaining block.
    assert!(runtime.shadow().is_accessible(ptr - 1));
}

#[test]
fn test_string_compare_through_runtime() {
    let (runtime, sink) = runtime();
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();
    let a = runtime.heap_alloc(heap, HeapFlags::ZERO_MEMORY, 16);
    let b = runtime.heap_alloc(heap, HeapFlags::ZERO_MEMORY, 16);
    unsafe { *b.add(9) = 1 };

    let access = StringAccess {
        dst: b as usize,
        dst_mode: AccessMode::Read,
        src: a as usize,
        src_mode: AccessMode::Read,
        count: 16,
        access_size: 1,
        stride: 1,
        compare: true,
    };
    assert_eq!(unsafe { runtime.check_strings(&access) }, 10);
    assert!(sink.is_empty());

    // A copy that runs two elements past the end reports each of them.
    let copy = StringAccess {
        count: 18,
        compare: false,
        dst_mode: AccessMode::Write,
        ..access
    };
    assert_eq!(unsafe { runtime.check_strings(&copy) }, 18);
    assert_eq!(sink.len(), 4);

    runtime.heap_destroy(heap);
}

#[test]
fn test_concurrent_alloc_free() {
    let (runtime, sink) = runtime_with(AsanConfig::default().with_quarantine_max_blocks(64));
    let heap = runtime.heap_create(HeapOptions::growable()).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let runtime = runtime.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let size = 1 + (t * 31 + i) % 96;
                    let ptr = runtime.heap_alloc(heap, HeapFlags::NONE, size);
                    assert!(!ptr.is_null());
                    assert!(runtime.check_access(ptr as usize, AccessMode::Write, size));
                    unsafe {
                        std::ptr::write_bytes(ptr, t as u8, size);
                        assert!(runtime.heap_free(heap, HeapFlags::NONE, ptr));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = runtime.stats();
    assert_eq!(stats.allocations, 1600);
    assert_eq!(stats.frees, 1600);
    assert_eq!(stats.live_allocations(), 0);
    assert!(stats.quarantined_blocks <= 64);
    assert_eq!(stats.quarantined_blocks as u64 + stats.evictions, 1600);
    assert!(sink.is_empty());

    runtime.heap_destroy(heap);
}

#[test]
fn test_independent_runtimes_do_not_share_state() {
    let (first, first_sink) = runtime();
    let (second, second_sink) = runtime();
    let heap = first.heap_create(HeapOptions::growable()).unwrap();
    let ptr = first.heap_alloc(heap, HeapFlags::NONE, 8) as usize;

    assert!(second.check_access(ptr + 8, AccessMode::Read, 1));
    assert!(!first.check_access(ptr + 8, AccessMode::Read, 1));
    assert_eq!(first_sink.len(), 1);
    assert!(second_sink.is_empty());
    assert!(second.heap_alloc(heap, HeapFlags::NONE, 8).is_null());

    first.heap_destroy(heap);
}
