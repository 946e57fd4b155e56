//! Backing stores for dynamic pools
use core::{marker::PhantomData, mem::MaybeUninit, ptr::NonNull};

use crate::{tlsf::ALIGN_SIZE, utils::align_ptr};

/// The resize callback backing a dynamic [`Tlsf`] pool.
///
/// A dynamic pool delegates page acquisition to its source. Calls are
/// always made with the new target **total** pool size, including the
/// pool's own sentinel overheads.
///
/// [`Tlsf`]: crate::Tlsf
///
/// # Safety
///
/// Implementations must uphold all of the following; the pool dereferences
/// the returned region based on them.
///
///  - The returned base address is aligned to [`ALIGN_SIZE`] and the
///    region `[base, base + new_size)` is valid for reads and writes and
///    owned by the calling pool until the next `resize` call.
///
///  - The base address does not change while the pool is non-empty;
///    growing and shrinking extend or release the *tail* of the region.
///
///  - A call passing the current size is a query and returns the current
///    base without side effects.
///
///  - `None` may be returned to refuse growth, leaving the region as-is.
///
/// An implementation must not call back into the pool it backs.
pub unsafe trait PoolSource {
    /// Grow, shrink, or query the memory region backing the pool.
    ///
    /// # Safety
    ///
    /// May only be called by the pool that owns this source; `new_size`
    /// reflects that pool's accounting.
    unsafe fn resize(&mut self, new_size: usize) -> Option<NonNull<u8>>;
}

/// The refusing source used by fixed pools: every request is denied.
unsafe impl PoolSource for () {
    #[inline]
    unsafe fn resize(&mut self, _new_size: usize) -> Option<NonNull<u8>> {
        None
    }
}

/// A [`PoolSource`] handing out a caller-provided memory region, "growing"
/// and "shrinking" within its capacity.
///
/// Gives a dynamic pool a hard memory bound on targets without virtual
/// memory. The base never moves, so every contract of [`PoolSource`] holds
/// trivially.
#[derive(Debug)]
pub struct BufferSource<'buf> {
    start: NonNull<u8>,
    capacity: usize,
    _phantom: PhantomData<&'buf mut [MaybeUninit<u8>]>,
}

// Safety: `BufferSource` owns its region exclusively for `'buf`
unsafe impl Send for BufferSource<'_> {}
unsafe impl Sync for BufferSource<'_> {}

impl<'buf> BufferSource<'buf> {
    /// Wrap a memory region. Leading bytes may be lost to alignment.
    pub fn new(buffer: &'buf mut [MaybeUninit<u8>]) -> Self {
        let raw = buffer.as_mut_ptr() as *mut u8;
        let start = align_ptr(raw, ALIGN_SIZE);
        let adjust = start as usize - raw as usize;
        Self {
            // Safety: Aligning a non-null pointer upward keeps it non-null
            start: unsafe { NonNull::new_unchecked(start) },
            capacity: buffer.len().saturating_sub(adjust) & !(ALIGN_SIZE - 1),
            _phantom: PhantomData,
        }
    }

    /// The number of bytes a pool can grow to.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

unsafe impl PoolSource for BufferSource<'_> {
    #[inline]
    unsafe fn resize(&mut self, new_size: usize) -> Option<NonNull<u8>> {
        if new_size <= self.capacity {
            Some(self.start)
        } else {
            None
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use crate::utils::align_up;

        /// A [`PoolSource`] backed by an anonymous memory mapping.
        ///
        /// The whole address range is reserved up front with
        /// `MAP_NORESERVE`, so the base never moves across grow and
        /// shrink; shrinking returns the tail pages to the kernel with
        /// `madvise(MADV_DONTNEED)`.
        #[cfg_attr(feature = "doc_cfg", doc(cfg(unix)))]
        #[derive(Debug)]
        pub struct MmapSource {
            base: *mut u8,
            /// Reservation size; fixed after the first successful `resize`.
            reserved: usize,
            /// Bytes currently committed to the pool, page-aligned.
            committed: usize,
            page_size_m1: usize,
        }

        // Safety: The mapping is owned exclusively by this value
        unsafe impl Send for MmapSource {}
        unsafe impl Sync for MmapSource {}

        impl MmapSource {
            /// Create a source able to back a pool of up to `max_bytes`
            /// bytes. Nothing is mapped until the pool first grows.
            pub const fn new(max_bytes: usize) -> Self {
                Self {
                    base: core::ptr::null_mut(),
                    reserved: max_bytes,
                    committed: 0,
                    page_size_m1: 0,
                }
            }

            #[cold]
            fn map_reservation(&mut self) -> Option<()> {
                // Safety: Querying the page size has no preconditions
                let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
                if !page_size.is_power_of_two() {
                    return None;
                }
                self.page_size_m1 = page_size - 1;

                let len = self.reserved.checked_add(self.page_size_m1)? & !self.page_size_m1;

                // Safety: An anonymous mapping with no address hint
                let ptr = unsafe {
                    libc::mmap(
                        core::ptr::null_mut(),
                        len,
                        libc::PROT_WRITE | libc::PROT_READ,
                        libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                        -1,
                        0,
                    )
                };
                if ptr == libc::MAP_FAILED {
                    return None;
                }

                self.base = ptr as *mut u8;
                self.reserved = len;
                Some(())
            }
        }

        unsafe impl PoolSource for MmapSource {
            unsafe fn resize(&mut self, new_size: usize) -> Option<NonNull<u8>> {
                if self.base.is_null() {
                    self.map_reservation()?;
                }

                let committed = align_up(new_size, self.page_size_m1 + 1);
                if committed > self.reserved {
                    return None;
                }

                if committed < self.committed {
                    // Safety: `[base + committed, base + self.committed)`
                    //         lies inside our reservation
                    libc::madvise(
                        self.base.add(committed) as *mut _,
                        self.committed - committed,
                        libc::MADV_DONTNEED,
                    );
                }
                self.committed = committed;

                // Safety: `mmap` returned a non-null page-aligned base
                Some(NonNull::new_unchecked(self.base))
            }
        }

        impl Drop for MmapSource {
            fn drop(&mut self) {
                if !self.base.is_null() {
                    // Safety: `[base, base + reserved)` is a mapping we own
                    unsafe { libc::munmap(self.base as *mut _, self.reserved) };
                }
            }
        }
    }
}
