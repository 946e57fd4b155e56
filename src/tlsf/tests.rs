extern crate std;

use quickcheck_macros::quickcheck;
use std::{mem::MaybeUninit, prelude::v1::*, ptr::NonNull, vec};

use super::map::{mapping, mapping_size, round_block_size};
use super::*;
use crate::{
    source::BufferSource,
    tests::{Align, ShadowAllocator},
    utils::nonnull_slice_from_raw_parts,
};

/// Run `f` against a fixed pool of `bytes` bytes and its usable size.
fn with_pool(bytes: usize, f: impl FnOnce(&mut Tlsf<'_>, usize)) {
    let mut mem: Vec<MaybeUninit<u8>> = vec![MaybeUninit::uninit(); bytes];
    let mut tlsf: Tlsf<'_> = Tlsf::INIT;
    // Safety: `tlsf` stays in place until the end of this function
    let usable = unsafe { tlsf.bind_pool(&mut mem[..]) };
    assert!(usable > 0);
    f(&mut tlsf, usable);
}

#[test]
fn too_small_region_is_rejected() {
    let mut mem = [MaybeUninit::<u8>::uninit(); 16];
    let mut tlsf: Tlsf<'_> = Tlsf::INIT;
    // Safety: `tlsf` stays in place until the end of this function
    assert_eq!(unsafe { tlsf.bind_pool(&mut mem) }, 0);
    assert!(tlsf.allocate(1).is_none());
    assert_eq!(tlsf.stats().unwrap(), PoolStats::default());
}

#[test]
fn deallocation_zeroes_total_used() {
    with_pool(1 << 20, |tlsf, _| {
        let ptr = tlsf.allocate(100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % ALIGN_SIZE, 0);
        // Safety: `ptr` is live and owned by `tlsf`
        unsafe { tlsf.deallocate(ptr) };
        assert_eq!(tlsf.stats().unwrap().total_used, 0);
        tlsf.check();
    });
}

#[test]
fn aligned_allocation() {
    with_pool(1 << 20, |tlsf, _| {
        let ptr = tlsf.allocate_aligned(4096, 100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        // Safety: The allocation is at least 100 bytes
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0x5a, 100) };
        tlsf.check();
        unsafe { tlsf.deallocate(ptr) };
        assert_eq!(tlsf.stats().unwrap().total_used, 0);
        tlsf.check();
    });
}

#[test]
fn zero_size_allocations_are_unique() {
    with_pool(4096, |tlsf, _| {
        let a = tlsf.allocate(0).unwrap();
        let b = tlsf.allocate(0).unwrap();
        assert_ne!(a, b);
        let c = tlsf.allocate_aligned(128, 0).unwrap();
        assert_eq!(c.as_ptr() as usize % 128, 0);
        unsafe {
            tlsf.deallocate(a);
            tlsf.deallocate(b);
            tlsf.deallocate(c);
        }
        assert_eq!(tlsf.stats().unwrap().total_used, 0);
        tlsf.check();
    });
}

#[test]
fn rejects_oversized_and_bad_alignment() {
    with_pool(4096, |tlsf, _| {
        assert!(tlsf.allocate(usize::MAX).is_none());
        assert!(tlsf.allocate(Tlsf::<()>::MAX_ALLOC_SIZE + 1).is_none());
        assert!(tlsf.allocate_aligned(0, 16).is_none());
        assert!(tlsf.allocate_aligned(3, 16).is_none());
        assert!(tlsf.allocate_aligned(48, 16).is_none());
        assert!(tlsf.allocate_aligned(usize::MAX, 16).is_none());
        tlsf.check();
    });
}

#[test]
fn realloc_backward_expansion() {
    with_pool(1 << 20, |tlsf, _| unsafe {
        let a = tlsf.allocate(512).unwrap();
        let b = tlsf.allocate(256).unwrap();
        let c = tlsf.allocate(128).unwrap();

        core::ptr::write_bytes(b.as_ptr(), 0xab, 256);

        // A free block before `b`; `c` keeps the successor used.
        tlsf.deallocate(a);
        tlsf.check();

        let new_b = tlsf.reallocate(b, 512 + 256 - 32).unwrap();
        tlsf.check();

        // The block slid down into the freed predecessor, data first.
        assert_eq!(new_b, a);
        for i in 0..256 {
            assert_eq!(*new_b.as_ptr().add(i), 0xab);
        }

        tlsf.deallocate(new_b);
        tlsf.deallocate(c);
        assert_eq!(tlsf.stats().unwrap().total_used, 0);
        tlsf.check();
    });
}

#[test]
fn realloc_forward_expansion_is_preferred() {
    with_pool(1 << 20, |tlsf, _| unsafe {
        let a = tlsf.allocate(256).unwrap();
        let b = tlsf.allocate(256).unwrap();
        let c = tlsf.allocate(512).unwrap();
        // `d` keeps `c`'s space from coalescing with the pool tail.
        let d = tlsf.allocate(128).unwrap();

        core::ptr::write_bytes(b.as_ptr(), 0xef, 256);

        tlsf.deallocate(a);
        tlsf.deallocate(c);
        tlsf.check();

        // Fits into current + next, so the address must not change.
        let new_b = tlsf.reallocate(b, 256 + 512 - 64).unwrap();
        tlsf.check();
        assert_eq!(new_b, b);
        for i in 0..256 {
            assert_eq!(*new_b.as_ptr().add(i), 0xef);
        }

        tlsf.deallocate(new_b);
        tlsf.deallocate(d);
        assert_eq!(tlsf.stats().unwrap().total_used, 0);
        tlsf.check();
    });
}

#[test]
fn realloc_both_neighbors() {
    with_pool(1 << 20, |tlsf, _| unsafe {
        let a = tlsf.allocate(512).unwrap();
        let b = tlsf.allocate(256).unwrap();
        let c = tlsf.allocate(512).unwrap();
        let d = tlsf.allocate(128).unwrap();

        core::ptr::write_bytes(b.as_ptr(), 0xcd, 256);

        tlsf.deallocate(a);
        tlsf.deallocate(c);
        tlsf.check();

        // Needs the previous and the next free block at once.
        let new_b = tlsf.reallocate(b, 512 + 256 + 512 - 64).unwrap();
        tlsf.check();
        assert_eq!(new_b, a);
        for i in 0..256 {
            assert_eq!(*new_b.as_ptr().add(i), 0xcd);
        }

        tlsf.deallocate(new_b);
        tlsf.deallocate(d);
        tlsf.check();
    });
}

#[test]
fn realloc_shrink_then_backward_grow() {
    with_pool(1 << 20, |tlsf, _| unsafe {
        let a = tlsf.allocate(1024).unwrap();
        let b = tlsf.allocate(512).unwrap();
        let c = tlsf.allocate(64).unwrap();

        core::ptr::write_bytes(b.as_ptr(), 0x77, 512);
        tlsf.deallocate(a);
        tlsf.check();

        let shrunk = tlsf.reallocate(b, 128).unwrap();
        assert_eq!(shrunk, b);
        for i in 0..128 {
            assert_eq!(*shrunk.as_ptr().add(i), 0x77);
        }

        let grown = tlsf.reallocate(shrunk, 1024 + 128).unwrap();
        assert_eq!(grown, a);
        for i in 0..128 {
            assert_eq!(*grown.as_ptr().add(i), 0x77);
        }

        tlsf.deallocate(grown);
        tlsf.deallocate(c);
        tlsf.check();
    });
}

#[test]
fn realloc_same_size_is_a_noop() {
    with_pool(1 << 16, |tlsf, _| unsafe {
        let ptr = tlsf.allocate(300).unwrap();
        let avail = usable_size(ptr);
        assert!(avail >= 300);
        let same = tlsf.reallocate(ptr, avail).unwrap();
        assert_eq!(same, ptr);
        tlsf.deallocate(same);
    });
}

#[test]
fn realloc_zero_size_frees() {
    with_pool(1 << 16, |tlsf, _| unsafe {
        let ptr = tlsf.allocate(300).unwrap();
        assert_eq!(tlsf.reallocate(ptr, 0), None);
        assert_eq!(tlsf.stats().unwrap().total_used, 0);
        tlsf.check();
    });
}

#[test]
fn coalescing_merges_neighbors() {
    with_pool(1 << 20, |tlsf, usable| unsafe {
        let a = tlsf.allocate(1024).unwrap();
        let b = tlsf.allocate(1024).unwrap();
        let c = tlsf.allocate(1024).unwrap();
        assert_eq!(tlsf.stats().unwrap().free_count, 1);

        // Freeing the middle block cannot merge with anything.
        tlsf.deallocate(b);
        assert_eq!(tlsf.stats().unwrap().free_count, 2);

        // Freeing the left block merges rightward into `b`'s space.
        tlsf.deallocate(a);
        assert_eq!(tlsf.stats().unwrap().free_count, 2);

        // Freeing the last used block merges everything back together.
        tlsf.deallocate(c);
        let stats = tlsf.stats().unwrap();
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.total_used, 0);
        assert_eq!(stats.largest_free, usable);
        tlsf.check();
    });
}

#[test]
fn exhaustion_and_full_recovery() {
    with_pool(4096, |tlsf, usable| {
        let mut live = Vec::new();
        while let Some(ptr) = tlsf.allocate(64) {
            live.push(ptr);
        }
        assert!(!live.is_empty());
        tlsf.check();

        for ptr in live {
            // Safety: Each pointer is live and owned by `tlsf`
            unsafe { tlsf.deallocate(ptr) };
        }

        let stats = tlsf.stats().unwrap();
        assert_eq!(stats.total_used, 0);
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.largest_free, usable);
        tlsf.check();
    });
}

#[test]
fn reset_reclaims_everything() {
    // Sized so that the usable span lands exactly on a bin lower bound,
    // which makes it allocatable as a single block.
    let mut mem: Vec<u64> = vec![0; (64512 + 2 * BLOCK_OVERHEAD) / 8];
    let mut tlsf: Tlsf<'_> = Tlsf::INIT;
    // Safety: `tlsf` stays in place until the end of this function
    let usable = unsafe {
        tlsf.init_fixed(nonnull_slice_from_raw_parts(
            NonNull::new(mem.as_mut_ptr() as *mut u8).unwrap(),
            mem.len() * 8,
        ))
    };
    assert_eq!(usable, 64512);

    for _ in 0..10 {
        tlsf.allocate(128).unwrap();
    }
    tlsf.reset();

    let stats = tlsf.stats().unwrap();
    assert_eq!(stats.total_used, 0);
    assert_eq!(stats.total_free, usable);
    assert_eq!(stats.largest_free, usable);
    tlsf.check();

    // The whole pool is a single block again.
    let ptr = tlsf.allocate(usable - BLOCK_OVERHEAD).unwrap();
    assert_eq!(tlsf.stats().unwrap().total_free, 0);
    // Safety: `ptr` is live and owned by `tlsf`
    unsafe { tlsf.deallocate(ptr) };
    assert_eq!(tlsf.stats().unwrap().largest_free, usable);
    tlsf.check();
}

#[test]
fn reset_ignores_dynamic_pools() {
    let mut buf = vec![MaybeUninit::uninit(); 4096];
    let mut tlsf: Tlsf<'_, BufferSource> = Tlsf::new(BufferSource::new(&mut buf));
    let ptr = tlsf.allocate(100).unwrap();
    tlsf.reset();
    // The allocation survived.
    assert!(tlsf.stats().unwrap().total_used > 0);
    // Safety: `ptr` is live and owned by `tlsf`
    unsafe { tlsf.deallocate(ptr) };
}

#[test]
fn append_adjacent_region() {
    let mut mem: Vec<u64> = vec![0; 1024];
    let half = 4096;
    let base = mem.as_mut_ptr() as *mut u8;

    let mut tlsf: Tlsf<'_> = Tlsf::INIT;
    // Safety: `tlsf` stays in place until the end of this function; the
    //         two halves of `mem` are handed over disjointly
    unsafe {
        let usable = tlsf.init_fixed(nonnull_slice_from_raw_parts(
            NonNull::new(base).unwrap(),
            half,
        ));
        assert!(usable > 0);

        // A separate region is not adjacent and must be rejected.
        let mut other: Vec<u64> = vec![0; 512];
        assert_eq!(
            tlsf.append(nonnull_slice_from_raw_parts(
                NonNull::new(other.as_mut_ptr() as *mut u8).unwrap(),
                4096,
            )),
            0
        );

        // The second half of `mem` continues the pool exactly.
        let absorbed = tlsf.append(nonnull_slice_from_raw_parts(
            NonNull::new(base.add(half)).unwrap(),
            half,
        ));
        assert!(absorbed > 0);
        tlsf.check();

        // A block larger than the original pool now fits.
        let big = tlsf.allocate(5000).unwrap();
        tlsf.deallocate(big);
        assert_eq!(tlsf.stats().unwrap().total_used, 0);
        tlsf.check();
    }
}

#[test]
fn append_extends_exhausted_pool() {
    let mut mem: Vec<u64> = vec![0; 1024];
    let half = 4096;
    let base = mem.as_mut_ptr() as *mut u8;

    let mut tlsf: Tlsf<'_> = Tlsf::INIT;
    // Safety: As in `append_adjacent_region`
    unsafe {
        let usable = tlsf.init_fixed(nonnull_slice_from_raw_parts(
            NonNull::new(base).unwrap(),
            half,
        ));
        assert!(usable > 0);

        // Pin down (almost) the whole pool first.
        let mut live = Vec::new();
        while let Some(ptr) = tlsf.allocate(256) {
            live.push(ptr);
        }

        let absorbed = tlsf.append(nonnull_slice_from_raw_parts(
            NonNull::new(base.add(half)).unwrap(),
            half,
        ));
        assert!(absorbed > 0);
        tlsf.check();

        // The appended space is allocatable on its own.
        assert!(tlsf.allocate(2048).is_some());
        tlsf.check();

        for ptr in live {
            tlsf.deallocate(ptr);
        }
        tlsf.check();
    }
}

#[test]
fn internal_fragmentation_bound() {
    with_pool(1 << 20, |tlsf, _| {
        for &request in &[
            257usize, 400, 511, 513, 800, 1000, 1500, 2000, 3000, 5000, 10000, 100000,
        ] {
            let before = tlsf.stats().unwrap().total_used;
            let ptr = tlsf.allocate(request).unwrap();
            let actual = tlsf.stats().unwrap().total_used - before;
            assert!(actual >= request);
            let overhead = (actual - request) as f64 / request as f64;
            assert!(
                overhead < 0.05,
                "request {} got {} bytes ({:.2}% overhead)",
                request,
                actual,
                overhead * 100.0
            );
            // Safety: `ptr` is live and owned by `tlsf`
            unsafe { tlsf.deallocate(ptr) };
        }
        tlsf.check();
    });
}

#[test]
fn dynamic_pool_grows_and_shrinks() {
    let mut buf = vec![MaybeUninit::uninit(); 1 << 16];
    let mut tlsf: Tlsf<'_, BufferSource> = Tlsf::new(BufferSource::new(&mut buf));

    // Nothing is taken from the source before the first allocation.
    assert_eq!(tlsf.stats().unwrap(), PoolStats::default());

    let a = tlsf.allocate(1000).unwrap();
    let b = tlsf.allocate(3000).unwrap();
    tlsf.check();
    assert!(tlsf.stats().unwrap().total_used >= 4000);

    // Safety: Both pointers are live and owned by `tlsf`
    unsafe {
        // `b` borders the end sentinel, so its space is returned to the
        // source rather than a bin; then the same happens to `a`.
        tlsf.deallocate(b);
        tlsf.check();
        tlsf.deallocate(a);
    }
    assert_eq!(tlsf.stats().unwrap(), PoolStats::default());

    // The pool comes back up from empty.
    let c = tlsf.allocate(500).unwrap();
    tlsf.check();
    // Safety: `c` is live and owned by `tlsf`
    unsafe { tlsf.deallocate(c) };
    assert_eq!(tlsf.stats().unwrap().total_used, 0);
}

#[test]
fn dynamic_pool_respects_source_capacity() {
    let mut buf = vec![MaybeUninit::uninit(); 4096];
    let mut tlsf: Tlsf<'_, BufferSource> = Tlsf::new(BufferSource::new(&mut buf));

    assert!(tlsf.allocate(1 << 20).is_none());
    let ptr = tlsf.allocate(2048).unwrap();
    // The remaining capacity cannot hold another block this big.
    assert!(tlsf.allocate(2048).is_none());
    tlsf.check();
    // Safety: `ptr` is live and owned by `tlsf`
    unsafe { tlsf.deallocate(ptr) };
}

#[cfg(unix)]
#[test]
fn mmap_backed_pool() {
    use crate::source::MmapSource;

    let mut tlsf: Tlsf<'_, MmapSource> = Tlsf::new(MmapSource::new(1 << 20));
    let ptr = tlsf.allocate(100_000).unwrap();
    // Safety: The allocation is at least 100 000 bytes
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0x11, 100_000) };
    tlsf.check();
    // Safety: `ptr` is live and owned by `tlsf`
    unsafe { tlsf.deallocate(ptr) };
    assert_eq!(tlsf.stats().unwrap().total_used, 0);

    // The reservation is bounded.
    assert!(tlsf.allocate(2 << 20).is_none());
}

#[quickcheck]
fn bin_floor_round_trips(fl: u32, sl: u32) -> quickcheck::TestResult {
    let fl = fl % FL_COUNT_DEFAULT as u32;
    let sl = sl % SL_COUNT as u32;
    if fl == 0 && (sl as usize) < BLOCK_SIZE_MIN / ALIGN_SIZE {
        return quickcheck::TestResult::discard();
    }

    // A bin's lower bound must map back into the same bin.
    let size = mapping_size(fl, sl);
    assert_eq!(mapping(size), (fl, sl));
    quickcheck::TestResult::passed()
}

#[quickcheck]
fn round_block_size_is_a_bin_floor(size: usize) -> quickcheck::TestResult {
    let size = (size % (1 << 26)) & !(ALIGN_SIZE - 1);
    if size < BLOCK_SIZE_MIN {
        return quickcheck::TestResult::discard();
    }

    let rounded = round_block_size(size);
    assert!(rounded >= size);
    assert!(rounded % ALIGN_SIZE == 0);

    // The rounded size is exactly some bin's lower bound, which is what
    // makes the first-fit bitmap search a good fit.
    let (fl, sl) = mapping(rounded);
    assert_eq!(mapping_size(fl, sl), rounded);

    // Linear-regime sizes pass through unchanged.
    if size < BLOCK_SIZE_SMALL {
        assert_eq!(rounded, size);
    }
    quickcheck::TestResult::passed()
}

macro_rules! gen_test {
    ($mod:ident, $fllen:expr, $split:expr) => {
        mod $mod {
            use super::*;
            type ThePool<'a> = Tlsf<'a, (), { $fllen }, { $split }>;

            #[test]
            fn minimal() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let mut tlsf: ThePool<'_> = Tlsf::INIT;
                // Safety: `tlsf` stays in place until the end of this
                //         function
                let usable = unsafe { tlsf.bind_pool(&mut pool.0) };
                assert!(usable > 0);

                log::trace!("tlsf = {:?}", tlsf);

                let ptr = tlsf.allocate(1);
                log::trace!("ptr = {:?}", ptr);
                if let Some(ptr) = ptr {
                    unsafe { tlsf.deallocate(ptr) };
                }
                tlsf.check();
            }

            #[test]
            fn zero_size_until_exhaustion() {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = Align([MaybeUninit::uninit(); 256]);
                let mut tlsf: ThePool<'_> = Tlsf::INIT;
                // Safety: `tlsf` stays in place until the end of this
                //         function
                let usable = unsafe { tlsf.bind_pool(&mut pool.0) };
                assert!(usable > 0);

                // Every zero-size allocation is a distinct minimum-sized
                // block, so a bounded pool hands out finitely many.
                let mut live = Vec::new();
                while let Some(ptr) = tlsf.allocate(0) {
                    assert!(!live.contains(&ptr));
                    live.push(ptr);
                }
                assert!(live.len() >= 2);
                tlsf.check();

                for ptr in live {
                    // Safety: Each pointer is live and owned by `tlsf`
                    unsafe { tlsf.deallocate(ptr) };
                }
                assert_eq!(tlsf.stats().unwrap().total_used, 0);
            }

            #[quickcheck]
            fn alloc_free_cycle_restores_free_bytes(sizes: Vec<u16>) {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let mut tlsf: ThePool<'_> = Tlsf::INIT;
                // Safety: `tlsf` stays in place until the end of this
                //         function
                let usable = unsafe { tlsf.bind_pool(&mut pool.0) };
                assert!(usable > 0);

                let mut live = Vec::new();
                for size in sizes {
                    if let Some(ptr) = tlsf.allocate(size as usize) {
                        live.push(ptr);
                    }
                }
                tlsf.check();

                for ptr in live {
                    // Safety: Each pointer is live and owned by `tlsf`
                    unsafe { tlsf.deallocate(ptr) };
                }

                let stats = tlsf.stats().unwrap();
                assert_eq!(stats.total_used, 0);
                assert_eq!(stats.total_free, usable);
                assert_eq!(stats.free_count, 1);
                tlsf.check();
            }

            #[quickcheck]
            fn random(pool_start: usize, pool_size: usize, bytecode: Vec<u8>) {
                random_inner(pool_start, pool_size, bytecode);
            }

            fn random_inner(
                pool_start: usize,
                pool_size: usize,
                bytecode: Vec<u8>,
            ) -> Option<()> {
                let _ = env_logger::builder().is_test(true).try_init();

                let mut sa = ShadowAllocator::new();
                let mut tlsf: ThePool<'_> = Tlsf::INIT;

                let mut pool = Align([MaybeUninit::uninit(); 65536]);
                let pool_start = pool_start % 64;
                let pool_size = pool_size % (pool.0.len() - 63);
                let pool = &mut pool.0[pool_start..pool_start + pool_size];
                log::trace!("pool = {:p}: [u8; {}]", pool, pool.len());
                sa.insert_free_block(pool.as_ptr() as usize, pool.len());
                // Safety: `tlsf` stays in place until the end of this
                //         function
                unsafe { tlsf.bind_pool(pool) };

                log::trace!("tlsf = {:?}", tlsf);

                #[derive(Debug)]
                struct Alloc {
                    ptr: NonNull<u8>,
                    len: usize,
                    align: usize,
                }
                let mut allocs: Vec<Alloc> = Vec::new();

                let mut op_count = 0usize;
                let mut it = bytecode.iter().cloned();
                loop {
                    op_count += 1;
                    if op_count % 0x10 == 0 {
                        tlsf.check();
                    }

                    match it.next()? % 8 {
                        0..=2 => {
                            let len = u32::from_le_bytes([it.next()?, it.next()?, it.next()?, 0]);
                            let len = ((len as u64 * pool_size as u64) >> 24) as usize;
                            let align = 1usize << (it.next()? % 8);
                            log::trace!("alloc len = {}, align = {}", len, align);

                            let ptr = if align <= ALIGN_SIZE {
                                tlsf.allocate(len)
                            } else {
                                tlsf.allocate_aligned(align, len)
                            };
                            log::trace!(" → {:?}", ptr);

                            if let Some(ptr) = ptr {
                                sa.allocate(ptr.as_ptr() as usize, len, align);
                                allocs.push(Alloc { ptr, len, align });
                            }
                        }
                        3..=5 => {
                            let alloc_i = it.next()?;
                            if allocs.len() > 0 {
                                let alloc = allocs.swap_remove(alloc_i as usize % allocs.len());
                                log::trace!("dealloc {:?}", alloc);

                                // Safety: `alloc.ptr` is live and owned by
                                //         `tlsf`
                                unsafe { tlsf.deallocate(alloc.ptr) };
                                sa.deallocate(alloc.ptr.as_ptr() as usize, alloc.len, alloc.align);
                            }
                        }
                        6..=7 => {
                            let alloc_i = it.next()?;
                            if allocs.len() > 0 {
                                let len = u32::from_le_bytes([
                                    it.next()?,
                                    it.next()?,
                                    it.next()?,
                                    0,
                                ]);
                                let len =
                                    (((len as u64 * pool_size as u64) >> 24) as usize).max(1);

                                let alloc_i = alloc_i as usize % allocs.len();
                                let alloc = &mut allocs[alloc_i];
                                log::trace!("realloc {:?} to {}", alloc, len);

                                // Safety: `alloc.ptr` is live and owned by
                                //         `tlsf`; `len` is non-zero
                                if let Some(ptr) = unsafe { tlsf.reallocate(alloc.ptr, len) } {
                                    log::trace!(" {:?} → {:?}", alloc.ptr, ptr);
                                    sa.deallocate(
                                        alloc.ptr.as_ptr() as usize,
                                        alloc.len,
                                        alloc.align,
                                    );
                                    // Reallocation only guarantees word
                                    // alignment.
                                    alloc.ptr = ptr;
                                    alloc.len = len;
                                    alloc.align = ALIGN_SIZE;
                                    sa.allocate(ptr.as_ptr() as usize, len, ALIGN_SIZE);
                                } else {
                                    log::trace!(" {:?} → fail", alloc.ptr);
                                }
                            }
                        }
                        _ => unreachable!(),
                    }
                }
            }
        }
    };
}

gen_test!(tlsf_fl10, 10, { BLOCK_SIZE_MIN });
gen_test!(tlsf_fl12, 12, { BLOCK_SIZE_MIN });
gen_test!(tlsf_fl16, 16, { BLOCK_SIZE_MIN });
gen_test!(tlsf_fl25, 25, { BLOCK_SIZE_MIN });
gen_test!(tlsf_fl12_split2, 12, { 2 * BLOCK_SIZE_MIN });
gen_test!(tlsf_fl16_split64, 16, 64);
#[cfg(target_pointer_width = "64")]
gen_test!(tlsf_fl32, 32, { BLOCK_SIZE_MIN });
#[cfg(target_pointer_width = "64")]
gen_test!(tlsf_fl32_split2, 32, { 2 * BLOCK_SIZE_MIN });
