//! The thread-safe shard layer: independent TLSF arenas behind per-arena
//! locks.
//!
//! Instead of a single coarse mutex around one allocator, the managed
//! region is split into `ARENAS` independent sub-pools. Threads are mapped
//! to arenas by a hash of a thread hint, so concurrent allocations from
//! different threads typically hit different locks.
//!
//! The thread-safety contract matches POSIX `malloc`/`free`: any thread
//! may call any method concurrently, but concurrent operations on the
//! *same* pointer are undefined behavior — each live pointer is owned by
//! exactly one thread at a time.
use core::{cell::UnsafeCell, fmt, mem, ptr::NonNull};

use crossbeam_utils::CachePadded;

use crate::{
    init::Init,
    tlsf::{usable_size, PoolStats, Tlsf},
    utils::{nonnull_slice_from_raw_parts, nonnull_slice_len, nonnull_slice_start},
};

/// A mutual-exclusion primitive the shard layer can drive.
///
/// # Safety
///
/// `acquire` must provide mutual exclusion against every other holder
/// until the matching `release`; `try_acquire` returning `true` counts as
/// an acquisition.
pub unsafe trait Lock: Send + Sync {
    /// Block until the lock is held.
    fn acquire(&self);

    /// Take the lock without blocking. Returns `false` when it is
    /// contended.
    fn try_acquire(&self) -> bool;

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock.
    unsafe fn release(&self);
}

/// The default shard lock.
pub type SpinLock = spin::Mutex<()>;

unsafe impl Lock for SpinLock {
    #[inline]
    fn acquire(&self) {
        // The guard is reconstructed by `release`.
        mem::forget(self.lock());
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.try_lock().map(mem::forget).is_some()
    }

    #[inline]
    unsafe fn release(&self) {
        // Safety: The caller holds the lock; its guard was forgotten in
        //         `acquire`
        self.force_unlock();
    }
}

impl Init for SpinLock {
    const INIT: Self = spin::Mutex::new(());
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// A [`Lock`] over a `pthread` mutex.
        ///
        /// `pthread_mutex_t` is unsafe to move while in use; the shard
        /// layer's no-move contract covers this.
        #[cfg_attr(feature = "doc_cfg", doc(cfg(unix)))]
        pub struct PthreadMutex(UnsafeCell<libc::pthread_mutex_t>);

        impl Init for PthreadMutex {
            const INIT: Self = Self(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        }

        // Safety: A `pthread` mutex exists to be shared between threads
        unsafe impl Send for PthreadMutex {}
        unsafe impl Sync for PthreadMutex {}

        unsafe impl Lock for PthreadMutex {
            #[inline]
            fn acquire(&self) {
                // Safety: The mutex is statically initialized and not
                //         moved while in use
                unsafe { libc::pthread_mutex_lock(self.0.get()) };
            }

            #[inline]
            fn try_acquire(&self) -> bool {
                // Safety: Same as `acquire`
                unsafe { libc::pthread_mutex_trylock(self.0.get()) == 0 }
            }

            #[inline]
            unsafe fn release(&self) {
                libc::pthread_mutex_unlock(self.0.get());
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// A thread-specific hint for arena selection: the folded
        /// `pthread_self` handle.
        #[inline]
        fn thread_hint() -> u32 {
            // Sequential handles and page-aligned stacks differ mostly in
            // the low bits; fold the upper half in to retain entropy.
            let id = unsafe { libc::pthread_self() } as usize;
            (id ^ (id >> 16)) as u32
        }
    } else if #[cfg(feature = "std")] {
        /// A thread-specific hint for arena selection: a per-thread
        /// counter.
        fn thread_hint() -> u32 {
            use core::sync::atomic::{AtomicU32, Ordering};
            static NEXT: AtomicU32 = AtomicU32::new(0);
            std::thread_local! {
                static HINT: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
            }
            HINT.with(|hint| *hint)
        }
    } else {
        /// Without a thread identity every thread shares arena 0; the
        /// `*_with_hint` entry points let a custom scheduler spread
        /// threads itself.
        #[inline]
        fn thread_hint() -> u32 {
            0
        }
    }
}

/// Avalanche mixer distributing thread hints across arenas even when they
/// differ only in a few bits.
#[inline]
fn mix_hint(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x45d9f3b);
    h ^= h >> 16;
    h
}

/// The smallest share worth running an arena on; regions below
/// `count * MIN_ARENA_BYTES` get fewer arenas.
const MIN_ARENA_BYTES: usize = 256;

/// Arena shares are rounded down to multiples of this.
const CACHELINE_SIZE: usize = 64;

const _: () = assert!(
    CACHELINE_SIZE.is_power_of_two(),
    "`CACHELINE_SIZE` must be a power of two"
);

struct Arena<L> {
    lock: L,
    pool: UnsafeCell<Tlsf<'static>>,
    /// Sub-region bounds, for pointer-ownership lookup.
    base: *mut u8,
    capacity: usize,
}

impl<L: Init> Arena<L> {
    const INIT: Self = Self {
        lock: L::INIT,
        pool: UnsafeCell::new(Tlsf::INIT),
        base: core::ptr::null_mut(),
        capacity: 0,
    };
}

/// A thread-safe TLSF allocator: `ARENAS` independent fixed pools, each
/// guarded by its own [`Lock`] and padded to a cache line.
///
/// Allocations prefer the calling thread's arena and fall back to the
/// others — first with non-blocking lock attempts, then blocking — when it
/// is exhausted. Deallocation and reallocation find the owning arena by
/// pointer range.
///
/// [`Self::init`] and [`Self::reset`] are not thread-safe; their
/// `&mut self` receivers require external quiescence. Like [`Tlsf`], an
/// initialized instance must not be moved.
pub struct ShardedTlsf<L: Lock = SpinLock, const ARENAS: usize = 4> {
    arenas: [CachePadded<Arena<L>>; ARENAS],
    /// Initialized arena count (`<= ARENAS`).
    count: usize,
}

// Safety: Arena pools are only reached while holding the owning arena's
//         lock; the raw region pointers refer to memory owned by this
//         instance.
unsafe impl<L: Lock, const ARENAS: usize> Send for ShardedTlsf<L, ARENAS> {}
unsafe impl<L: Lock, const ARENAS: usize> Sync for ShardedTlsf<L, ARENAS> {}

impl<L: Lock, const ARENAS: usize> fmt::Debug for ShardedTlsf<L, ARENAS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedTlsf")
            .field("arenas", &ARENAS)
            .field("count", &self.count)
            .finish()
    }
}

impl<L: Lock + Init, const ARENAS: usize> ShardedTlsf<L, ARENAS> {
    const ARENA_INIT: CachePadded<Arena<L>> = CachePadded::new(Arena::INIT);

    /// An uninitialized instance.
    pub const INIT: Self = {
        let () = Self::VALID;
        Self {
            arenas: [Self::ARENA_INIT; ARENAS],
            count: 0,
        }
    };
}

impl<L: Lock + Init, const ARENAS: usize> Init for ShardedTlsf<L, ARENAS> {
    const INIT: Self = Self::INIT;
}

impl<L: Lock, const ARENAS: usize> ShardedTlsf<L, ARENAS> {
    /// Evaluates successfully if the parameters are valid.
    const VALID: () = {
        assert!(ARENAS >= 1, "`ARENAS` must be at least 1");
    };

    /// Split a memory region into up to `ARENAS` sub-pools and bind each
    /// arena to one.
    ///
    /// Per-arena shares are rounded down to cache-line multiples, the last
    /// arena absorbs the remainder, and the arena count is halved while a
    /// share would be too small for a viable pool. Returns the total
    /// usable bytes across all arenas, or 0 on failure.
    ///
    /// # Safety
    ///
    ///  - The memory region will be considered owned by `self`. It must
    ///    outlive `self` and must not be accessed in any other way while
    ///    any arena holds live allocations.
    ///
    ///  - Once this method returns non-zero, `self` must not be moved.
    pub unsafe fn init(&mut self, mem: NonNull<[u8]>) -> usize {
        let bytes = nonnull_slice_len(mem);
        let base = nonnull_slice_start(mem).as_ptr();

        self.count = 0;
        if bytes == 0 {
            return 0;
        }

        let mut count = ARENAS;
        while count > 1 && bytes / count < MIN_ARENA_BYTES {
            count >>= 1;
        }

        let per_arena = (bytes / count) & !(CACHELINE_SIZE - 1);
        let mut total_usable = 0;

        for i in 0..count {
            // The last arena absorbs the remainder of the division.
            let chunk = if i == count - 1 {
                bytes - i * per_arena
            } else {
                per_arena
            };
            let arena_base = base.add(i * per_arena);

            let arena = &mut *self.arenas[i];
            arena.base = arena_base;
            arena.capacity = chunk;

            // Safety: The sub-regions are disjoint slices of a region we
            //         own; the no-move contract is forwarded from this
            //         method
            let usable = (*arena.pool.get()).init_fixed(nonnull_slice_from_raw_parts(
                NonNull::new_unchecked(arena_base),
                chunk,
            ));
            if usable == 0 {
                // Unwind: a partially initialized shard is unusable.
                for j in 0..=i {
                    let arena = &mut *self.arenas[j];
                    arena.base = core::ptr::null_mut();
                    arena.capacity = 0;
                    *arena.pool.get() = Tlsf::INIT;
                }
                return 0;
            }
            total_usable += usable;
        }

        self.count = count;
        total_usable
    }

    /// The number of initialized arenas.
    #[inline]
    pub fn arena_count(&self) -> usize {
        self.count
    }

    /// The calling thread's preferred arena for a given hint.
    #[inline]
    fn arena_select(&self, hint: u32) -> usize {
        debug_assert!(self.count != 0);
        mix_hint(hint) as usize % self.count
    }

    /// Find the arena owning `ptr` by range lookup. Linear in the arena
    /// count, which is small and fixed.
    #[inline]
    fn arena_find(&self, ptr: NonNull<u8>) -> Option<usize> {
        let p = ptr.as_ptr() as usize;
        (0..self.count).find(|&i| {
            let arena = &*self.arenas[i];
            let base = arena.base as usize;
            p >= base && p - base < arena.capacity
        })
    }

    /// Run `f` on an arena's pool while holding its lock.
    #[inline]
    fn with_arena<R>(&self, index: usize, f: impl FnOnce(&mut Tlsf<'static>) -> R) -> R {
        let arena = &*self.arenas[index];
        arena.lock.acquire();
        // Safety: The pool is only reached under the arena's lock
        let result = f(unsafe { &mut *arena.pool.get() });
        // Safety: Acquired above
        unsafe { arena.lock.release() };
        result
    }

    /// Like [`Self::with_arena`] but gives up on a contended lock.
    #[inline]
    fn try_with_arena<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut Tlsf<'static>) -> R,
    ) -> Option<R> {
        let arena = &*self.arenas[index];
        if !arena.lock.try_acquire() {
            return None;
        }
        // Safety: The pool is only reached under the arena's lock
        let result = f(unsafe { &mut *arena.pool.get() });
        // Safety: Acquired above
        unsafe { arena.lock.release() };
        Some(result)
    }

    /// Sweep the arenas other than `skip` with `f`: first with
    /// non-blocking lock attempts, then blocking.
    fn fallback(
        &self,
        skip: usize,
        mut f: impl FnMut(&mut Tlsf<'static>) -> Option<NonNull<u8>>,
    ) -> Option<NonNull<u8>> {
        for i in 1..self.count {
            let index = (skip + i) % self.count;
            if let Some(Some(ptr)) = self.try_with_arena(index, &mut f) {
                return Some(ptr);
            }
        }

        for i in 1..self.count {
            let index = (skip + i) % self.count;
            if let Some(ptr) = self.with_arena(index, &mut f) {
                return Some(ptr);
            }
        }

        None
    }

    /// Attempt to allocate `size` bytes, preferring the calling thread's
    /// arena.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_with_hint(thread_hint(), size)
    }

    /// [`Self::allocate`] with an explicit thread hint.
    pub fn allocate_with_hint(&self, hint: u32, size: usize) -> Option<NonNull<u8>> {
        if self.count == 0 {
            return None;
        }
        let preferred = self.arena_select(hint);

        if let Some(ptr) = self.with_arena(preferred, |pool| pool.allocate(size)) {
            return Some(ptr);
        }
        self.fallback(preferred, |pool| pool.allocate(size))
    }

    /// Attempt to allocate `size` bytes aligned to `align` bytes, which
    /// must be a non-zero power of two.
    pub fn allocate_aligned(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        self.allocate_aligned_with_hint(thread_hint(), align, size)
    }

    /// [`Self::allocate_aligned`] with an explicit thread hint.
    pub fn allocate_aligned_with_hint(
        &self,
        hint: u32,
        align: usize,
        size: usize,
    ) -> Option<NonNull<u8>> {
        if self.count == 0 {
            return None;
        }
        let preferred = self.arena_select(hint);

        if let Some(ptr) = self.with_arena(preferred, |pool| pool.allocate_aligned(align, size)) {
            return Some(ptr);
        }
        self.fallback(preferred, |pool| pool.allocate_aligned(align, size))
    }

    /// Deallocate through the owning arena, found by pointer range.
    /// Pointers owned by no arena are ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously returned by
    /// `self`, and no other thread may concurrently free, reallocate, or
    /// access the same block.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let index = match self.arena_find(ptr) {
            Some(index) => index,
            None => return,
        };
        self.with_arena(index, |pool| unsafe { pool.deallocate(ptr) });
    }

    /// Shrink or grow a previously allocated memory block.
    ///
    /// Tries an in-place reallocation within the owning arena first. When
    /// that arena is exhausted for the new size, allocates from any arena,
    /// copies the payload, and frees the original under the owner's lock.
    /// A zero `new_size` deallocates `ptr` and returns `None`; on failure
    /// the old block stays valid.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::deallocate`].
    pub unsafe fn reallocate(&self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        self.reallocate_with_hint(thread_hint(), ptr, new_size)
    }

    /// [`Self::reallocate`] with an explicit thread hint for the
    /// relocation path.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::deallocate`].
    pub unsafe fn reallocate_with_hint(
        &self,
        hint: u32,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let index = self.arena_find(ptr)?;

        // Try in place first, grabbing the old payload size under the same
        // lock in case the block has to move to another arena.
        let (old_size, in_place) = self.with_arena(index, |pool| unsafe {
            (usable_size(ptr), pool.reallocate(ptr, new_size))
        });
        if let Some(new_ptr) = in_place {
            return Some(new_ptr);
        }

        // The owning arena is exhausted for the new size and the old block
        // is untouched. Allocate anywhere, copy, then free the original.
        let new_ptr = self.allocate_with_hint(hint, new_size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));

        self.with_arena(index, |pool| unsafe { pool.deallocate(ptr) });

        Some(new_ptr)
    }

    /// Aggregate statistics across all arenas. `largest_free` reports the
    /// largest free block in any single arena.
    pub fn stats(&self) -> Option<PoolStats> {
        let mut total = PoolStats::default();
        for i in 0..self.count {
            let arena_stats = self.with_arena(i, |pool| pool.stats())?;
            total.total_free += arena_stats.total_free;
            total.total_used += arena_stats.total_used;
            total.block_count += arena_stats.block_count;
            total.free_count += arena_stats.free_count;
            total.overhead += arena_stats.overhead;
            if arena_stats.largest_free > total.largest_free {
                total.largest_free = arena_stats.largest_free;
            }
        }
        Some(total)
    }

    /// Run the consistency check on every arena, each under its lock.
    pub fn check(&self) {
        for i in 0..self.count {
            self.with_arena(i, |pool| pool.check());
        }
    }

    /// Reset every arena, invalidating all outstanding allocations in
    /// bounded time.
    ///
    /// Not thread-safe; `&mut self` requires external quiescence.
    pub fn reset(&mut self) {
        for i in 0..self.count {
            // Exclusive access stands in for the arena locks here.
            unsafe { &mut *self.arenas[i].pool.get() }.reset();
        }
    }
}

#[cfg(test)]
mod tests;
