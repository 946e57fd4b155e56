extern crate std;

use std::{boxed::Box, prelude::v1::*, ptr::NonNull, vec};

use super::*;

/// Leak an aligned region; tests hand ownership to the allocator for the
/// rest of the process.
fn leak_region(bytes: usize) -> NonNull<[u8]> {
    let mem: Box<[u64]> = vec![0u64; (bytes + 7) / 8].into_boxed_slice();
    let ptr = Box::leak(mem).as_mut_ptr() as *mut u8;
    nonnull_slice_from_raw_parts(NonNull::new(ptr).unwrap(), bytes)
}

/// A leaked, initialized shard; the heap placement satisfies the no-move
/// requirement for the rest of the process.
fn new_shard(bytes: usize) -> (&'static mut ShardedTlsf, usize) {
    let shard: &'static mut ShardedTlsf = Box::leak(Box::new(ShardedTlsf::INIT));
    // Safety: The region is leaked; `shard` never moves again
    let usable = unsafe { shard.init(leak_region(bytes)) };
    (shard, usable)
}

#[test]
fn init_splits_into_arenas() {
    let (shard, usable) = new_shard(1 << 20);
    assert!(usable > 0);
    assert_eq!(shard.arena_count(), 4);

    let stats = shard.stats().unwrap();
    assert_eq!(stats.total_free, usable);
    assert_eq!(stats.total_used, 0);
    // No single arena can hold more than its share.
    assert!(stats.largest_free < usable);
    shard.check();
}

#[test]
fn init_halves_arena_count_for_small_regions() {
    let (shard, usable) = new_shard(600);
    assert!(usable > 0);
    assert_eq!(shard.arena_count(), 2);

    let (shard, usable) = new_shard(300);
    assert!(usable > 0);
    assert_eq!(shard.arena_count(), 1);
}

#[test]
fn uninitialized_shard_refuses() {
    let shard: &'static mut ShardedTlsf = Box::leak(Box::new(ShardedTlsf::INIT));
    assert_eq!(shard.arena_count(), 0);
    assert!(shard.allocate(16).is_none());
    assert_eq!(shard.stats().unwrap(), PoolStats::default());
    shard.check();
}

#[test]
fn allocate_and_free_round_trip() {
    let (shard, _) = new_shard(1 << 20);

    let mut live = Vec::new();
    for i in 0..64u32 {
        let size = 16 + (i as usize % 7) * 100;
        let ptr = shard.allocate_with_hint(i, size).unwrap();
        // Safety: The allocation holds at least `size` bytes
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), i as u8, size) };
        live.push((ptr, size, i));
    }
    shard.check();

    for (ptr, size, i) in live {
        // Safety: `ptr` is live and this thread owns it
        unsafe {
            for off in 0..size {
                assert_eq!(*ptr.as_ptr().add(off), i as u8);
            }
            shard.deallocate(ptr);
        }
    }

    let stats = shard.stats().unwrap();
    assert_eq!(stats.total_used, 0);
    shard.check();
}

#[test]
fn aligned_allocation_through_shard() {
    let (shard, _) = new_shard(1 << 20);

    let ptr = shard.allocate_aligned(4096, 100).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 4096, 0);
    // Safety: `ptr` is live and this thread owns it
    unsafe { shard.deallocate(ptr) };
    assert_eq!(shard.stats().unwrap().total_used, 0);
}

#[test]
fn fallback_when_preferred_arena_is_full() {
    // Four arenas of ~64 KiB each.
    let (shard, _) = new_shard(1 << 18);

    // Two of these fit per arena. Allocating eight with the same hint
    // exhausts the preferred arena after two; the sweep must spill the
    // rest into the other arenas rather than fail.
    let mut live = Vec::new();
    for _ in 0..8 {
        let ptr = shard.allocate_with_hint(7, 30_000).unwrap();
        live.push(ptr);
    }
    shard.check();

    for ptr in live {
        // Safety: `ptr` is live and this thread owns it
        unsafe { shard.deallocate(ptr) };
    }
    assert_eq!(shard.stats().unwrap().total_used, 0);
}

#[test]
fn realloc_in_place_and_across_arenas() {
    // Four arenas of ~64 KiB each.
    let (shard, _) = new_shard(1 << 18);

    unsafe {
        // `a` then `b` land adjacently in the same arena; `b` pins `a`.
        let a = shard.allocate_with_hint(7, 40_000).unwrap();
        let b = shard.allocate_with_hint(7, 16_000).unwrap();
        core::ptr::write_bytes(a.as_ptr(), 0x42, 40_000);

        // Growing `a` cannot happen in place any more, so the block must
        // move to a different arena with its payload.
        let grown = shard.reallocate_with_hint(7, a, 60_000).unwrap();
        assert_ne!(grown, a);
        for off in 0..40_000 {
            assert_eq!(*grown.as_ptr().add(off), 0x42);
        }
        shard.check();

        // Shrinking stays in place.
        let shrunk = shard.reallocate(grown, 1000).unwrap();
        assert_eq!(shrunk, grown);

        shard.deallocate(shrunk);
        shard.deallocate(b);
    }

    assert_eq!(shard.stats().unwrap().total_used, 0);
    shard.check();
}

#[test]
fn realloc_zero_size_frees() {
    let (shard, _) = new_shard(1 << 18);

    let ptr = shard.allocate(500).unwrap();
    // Safety: `ptr` is live and this thread owns it
    unsafe {
        assert_eq!(shard.reallocate(ptr, 0), None);
    }
    assert_eq!(shard.stats().unwrap().total_used, 0);
}

#[test]
fn reset_invalidates_all_arenas() {
    let (shard, usable) = new_shard(1 << 18);

    for i in 0..32 {
        shard.allocate_with_hint(i, 1000).unwrap();
    }
    assert!(shard.stats().unwrap().total_used > 0);

    shard.reset();

    let stats = shard.stats().unwrap();
    assert_eq!(stats.total_used, 0);
    assert_eq!(stats.total_free, usable);
    shard.check();

    // The arenas are usable again.
    let ptr = shard.allocate(1000).unwrap();
    // Safety: `ptr` is live and this thread owns it
    unsafe { shard.deallocate(ptr) };
}

#[cfg(unix)]
#[test]
fn pthread_mutex_shard() {
    let shard: &'static mut ShardedTlsf<PthreadMutex, 2> = Box::leak(Box::new(ShardedTlsf::INIT));
    // Safety: The region is leaked; `shard` never moves again
    let usable = unsafe { shard.init(leak_region(1 << 16)) };
    assert!(usable > 0);

    let ptr = shard.allocate(100).unwrap();
    // Safety: `ptr` is live and this thread owns it
    unsafe { shard.deallocate(ptr) };
    assert_eq!(shard.stats().unwrap().total_used, 0);
    shard.check();
}
