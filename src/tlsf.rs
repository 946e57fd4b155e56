//! The TLSF pool core
use core::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    mem,
    mem::MaybeUninit,
    ptr::NonNull,
};

use crate::{
    init::Init,
    source::PoolSource,
    utils::{align_ptr, align_up, nonnull_slice_len, nonnull_slice_start},
};
use const_default1::ConstDefault;

mod map;
use map::{mapping, mapping_size, round_block_size};
mod inspect;
pub use inspect::PoolStats;

/// The alignment of all block addresses and sizes: one machine word.
pub const ALIGN_SIZE: usize = mem::size_of::<usize>();

const ALIGN_SHIFT: u32 = ALIGN_SIZE.trailing_zeros();

const USIZE_BITS: u32 = usize::BITS;

/// Second-level subdivisions per first-level class.
pub const SL_COUNT: usize = 32;

const SL_SHIFT: u32 = 5;

/// The boundary between linear and logarithmic binning, as a shift amount.
const FL_SHIFT: u32 = SL_SHIFT + ALIGN_SHIFT;

/// Header bytes visible across blocks: the header word.
pub const BLOCK_OVERHEAD: usize = mem::size_of::<usize>();

/// The minimum payload of a block that can live on a free list: enough for
/// the two free-list links plus the successor's previous-block slot.
pub const BLOCK_SIZE_MIN: usize = 3 * mem::size_of::<usize>();

/// The size above which binning becomes logarithmic.
pub const BLOCK_SIZE_SMALL: usize = 1 << FL_SHIFT;

/// The default number of first-level classes, covering pools of up to
/// 2³⁹ bytes (64-bit) or 2³¹ bytes (32-bit).
pub const FL_COUNT_DEFAULT: usize = if USIZE_BITS == 64 { 32 } else { 25 };

/// The default minimum remainder for trimming. Raising this above
/// [`BLOCK_SIZE_MIN`] avoids creating tiny free blocks whose metadata
/// overhead is large relative to their usable payload, trading internal
/// fragmentation for fewer unusable fragments.
pub const SPLIT_THRESHOLD_DEFAULT: usize = BLOCK_SIZE_MIN;

/// The bit of [`BlockHdr::header`] indicating that the block is free.
const BLOCK_BIT_FREE: usize = 1;
/// The bit of [`BlockHdr::header`] indicating that the physically
/// preceding block is free.
const BLOCK_BIT_PREV_FREE: usize = 2;
const BLOCK_BITS: usize = BLOCK_BIT_FREE | BLOCK_BIT_PREV_FREE;

const _: () = {
    assert!(ALIGN_SIZE == 4 || ALIGN_SIZE == 8, "usize must be 32 or 64 bit");
    assert!(
        mem::size_of::<usize>() == mem::size_of::<*mut u8>(),
        "usize must equal pointer size"
    );
    assert!(ALIGN_SIZE == BLOCK_SIZE_SMALL / SL_COUNT, "sizes are not properly set");
    assert!(BLOCK_SIZE_MIN < BLOCK_SIZE_SMALL, "min allocation size is wrong");
    assert!(SL_COUNT <= 32, "index too large");
    assert!(mem::size_of::<FreeBlockHdr>() == 3 * mem::size_of::<usize>());
};

/// The header word of a memory block, located immediately before the
/// block's payload.
///
/// A block is always referred to by the address of this word. The word
/// *before* it holds the pointer to the physically preceding block; that
/// slot overlaps the last word of the preceding block's payload and is
/// written only while this block's [`BLOCK_BIT_PREV_FREE`] is set — i.e.
/// while the preceding block is free and cannot write its payload.
#[repr(C)]
struct BlockHdr {
    /// The aligned payload size in the upper bits, [`BLOCK_BIT_FREE`] and
    /// [`BLOCK_BIT_PREV_FREE`] in the lowest two.
    header: usize,
}

/// The view of a free memory block: the header word followed by the
/// free-list links, which overlay the first two payload words.
///
/// This view is only valid for blocks with [`BLOCK_BIT_FREE`] set (whose
/// payload is at least [`BLOCK_SIZE_MIN`] bytes) and for the free-list
/// sentinel embedded in [`Tlsf`]. The end-of-pool sentinel in particular
/// must never be accessed through this type.
#[repr(C)]
struct FreeBlockHdr {
    common: BlockHdr,
    next_free: NonNull<FreeBlockHdr>,
    prev_free: NonNull<FreeBlockHdr>,
}

impl BlockHdr {
    #[inline]
    fn size(&self) -> usize {
        self.header & !BLOCK_BITS
    }

    #[inline]
    fn set_size(&mut self, size: usize) {
        debug_assert!(size % ALIGN_SIZE == 0, "invalid size");
        self.header = size | (self.header & BLOCK_BITS);
    }

    #[inline]
    fn is_free(&self) -> bool {
        (self.header & BLOCK_BIT_FREE) != 0
    }

    #[inline]
    fn is_prev_free(&self) -> bool {
        (self.header & BLOCK_BIT_PREV_FREE) != 0
    }

    #[inline]
    fn set_prev_free(&mut self, free: bool) {
        self.header = if free {
            self.header | BLOCK_BIT_PREV_FREE
        } else {
            self.header & !BLOCK_BIT_PREV_FREE
        };
    }
}

/// Get the payload address of a block.
#[inline]
fn block_payload(block: NonNull<BlockHdr>) -> NonNull<u8> {
    // Safety: A block header is always followed by its payload
    unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(BLOCK_OVERHEAD)) }
}

/// Get the block owning the given payload address.
#[inline]
fn block_from_payload(ptr: NonNull<u8>) -> NonNull<BlockHdr> {
    // Safety: A payload is always preceded by its block header
    unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(BLOCK_OVERHEAD) as *mut BlockHdr) }
}

/// The slot holding the pointer to the physically preceding block. It
/// occupies the last word of the preceding block's payload, so it may only
/// be read while `PREV_FREE` is set and written while the preceding block
/// is free.
#[inline]
fn prev_phys_slot(block: NonNull<BlockHdr>) -> *mut NonNull<BlockHdr> {
    block.as_ptr().cast::<u8>().wrapping_sub(mem::size_of::<usize>()) as _
}

/// Get the next physical block.
///
/// # Safety
///
/// `block` must be a block owned by a pool and must not be the end
/// sentinel.
#[inline]
unsafe fn block_next(block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    debug_assert!(block.as_ref().size() != 0, "block is last");
    NonNull::new_unchecked(
        block
            .as_ptr()
            .cast::<u8>()
            .add(BLOCK_OVERHEAD + block.as_ref().size()) as *mut BlockHdr,
    )
}

/// Get the previous physical block.
///
/// # Safety
///
/// `block.PREV_FREE` must be set, which guarantees the previous-block slot
/// holds a live pointer.
#[inline]
unsafe fn block_prev(block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    debug_assert!(block.as_ref().is_prev_free(), "previous block must be free");
    *prev_phys_slot(block)
}

/// Link a block to its physical successor by writing the successor's
/// previous-block slot. Returns the successor.
///
/// # Safety
///
/// `block`'s header must be up to date, and the block must not be the end
/// sentinel.
#[inline]
unsafe fn block_link_next(block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    let next = block_next(block);
    *prev_phys_slot(next) = block;
    next
}

/// Flip the free state of a block, propagating it to the successor's
/// `PREV_FREE` bit and previous-block slot.
///
/// # Safety
///
/// Same as [`block_link_next`].
#[inline]
unsafe fn block_set_free(mut block: NonNull<BlockHdr>, free: bool) {
    debug_assert!(block.as_ref().is_free() != free, "block free bit unchanged");
    block.as_mut().header ^= BLOCK_BIT_FREE;
    let mut next = block_link_next(block);
    next.as_mut().set_prev_free(free);
}

/// Whether splitting `size` bytes off `block` leaves a usable remainder.
#[inline]
unsafe fn block_can_split(block: NonNull<BlockHdr>, size: usize) -> bool {
    block.as_ref().size() >= size + BLOCK_OVERHEAD + BLOCK_SIZE_MIN
}

/// Split a block in two. The second part is marked free and linked to its
/// physical successor; the first part keeps its flags and shrinks to
/// `size`. Returns the second part.
///
/// # Safety
///
/// `block` must be owned by a pool and [`block_can_split`] must hold.
unsafe fn block_split(mut block: NonNull<BlockHdr>, size: usize) -> NonNull<BlockHdr> {
    let mut rest = NonNull::new_unchecked(
        block.as_ptr().cast::<u8>().add(BLOCK_OVERHEAD + size) as *mut BlockHdr
    );
    let rest_size = block.as_ref().size() - (size + BLOCK_OVERHEAD);
    debug_assert!(rest_size >= BLOCK_SIZE_MIN, "block split with invalid size");
    debug_assert!(rest_size % ALIGN_SIZE == 0, "invalid block size");
    rest.as_mut().header = rest_size;
    block_set_free(rest, true);
    block.as_mut().set_size(size);
    rest
}

/// Fold `block`'s storage into the free block physically preceding it.
/// Leaves the flag bits of `prev` untouched.
///
/// # Safety
///
/// `prev` must physically precede `block`; neither may be the end sentinel.
#[inline]
unsafe fn block_absorb(mut prev: NonNull<BlockHdr>, block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
    debug_assert!(prev.as_ref().size() != 0, "previous block can't be last");
    prev.as_mut().header += block.as_ref().size() + BLOCK_OVERHEAD;
    block_link_next(prev);
    prev
}

/// Assert that `block` is a well-formed end sentinel.
#[inline]
unsafe fn check_sentinel(block: NonNull<BlockHdr>) {
    debug_assert!(block.as_ref().size() == 0, "sentinel should be last");
    debug_assert!(!block.as_ref().is_free(), "sentinel block should not be free");
    let _ = block;
}

/// The payload size of a live allocation.
///
/// # Safety
///
/// `ptr` must denote a memory block previously returned by a [`Tlsf`] pool
/// and not yet deallocated.
#[inline]
pub unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
    let block = block_from_payload(ptr);
    debug_assert!(!block.as_ref().is_free(), "block is not allocated");
    block.as_ref().size()
}

#[cfg_attr(doc, svgbobdoc::transform)]
/// The TLSF pool core: a single-pool Two-Level Segregated Fit allocator.
///
/// # Data Structure Overview
///
/// <center>
/// ```svgbob
///   First level
///                                                                 FLLEN = 8
///                         ,-----+-----+-----+-----+-----+-----+-----+-----,
///   fl_bitmap: u32      = |  0  |  0  |  0  |  1  |  0  |  0  |  0  |  0  |
///                         +-----+-----+-----+-----+-----+-----+-----+-----+
///                min size | 2¹⁴ | 2¹³ | 2¹² | 2¹¹ | 2¹⁰ |  2⁹ |  2⁸ | lin |
///                         '-----+-----+-----+--+--+-----+-----+-----+-----'
///                                              |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Second Level                               |
///                                              v               SL_COUNT = 32
///                        ,------+------+------+------+------+-----+------,
///   "sl_bitmap[4]: u32" =|   0  |  ... |   1  |   0  |  ... |  0  |   0  |
///                        +------+------+------+------+------+-----+------+
///                  heads |      |      |   O  |      |      |     |      |
///                        '------+------+---+--+------+------+-----+------'
///                                          |
/// ╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶|╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶╶
///   Free blocks                            |
///             ,----------------------------'
///             | ,---+---+----,    ,---+---+----,    ,----------,
///             '-+>O | O-+----+----+>O | O-+----+--->| sentinel |
///               +---+---'    |    +---+---'    |    '----------'
///               |            |    |            |
///               '------------'    '------------'
/// ```
/// </center>
///
/// Each bin's doubly-linked free list is terminated by a sentinel block
/// embedded in this structure; inserting and removing write the sentinel's
/// link fields unconditionally instead of branching on list emptiness.
///
/// # Properties
///
/// All addresses and sizes are aligned to [`ALIGN_SIZE`] (one machine
/// word). The maximum pool size is `2^(FLLEN + 7)` bytes on 64-bit
/// platforms; lowering `FLLEN` shrinks this structure proportionally.
/// `SPLIT` is the minimum remainder worth splitting off a block
/// (see [`SPLIT_THRESHOLD_DEFAULT`]).
///
/// A pool is *fixed* once bound to a memory region with
/// [`Self::init_fixed`] and never grows, or *dynamic*, acquiring and
/// releasing memory through its [`PoolSource`].
///
/// Because the bin heads point at the embedded sentinel, a pool **must not
/// be moved** once it owns memory; the binding methods are `unsafe` for
/// this reason.
pub struct Tlsf<
    'pool,
    S: PoolSource = (),
    const FLLEN: usize = { FL_COUNT_DEFAULT },
    const SPLIT: usize = { SPLIT_THRESHOLD_DEFAULT },
> {
    fl_bitmap: u32,
    sl_bitmap: [u32; FLLEN],
    heads: [[NonNull<FreeBlockHdr>; SL_COUNT]; FLLEN],
    /// Terminates every bin's free list. Kept in an `UnsafeCell` because
    /// the free-list hot paths store into it through pointers that outlive
    /// any single `&mut self` borrow; the stored values are never read
    /// back.
    sentinel: UnsafeCell<FreeBlockHdr>,
    /// Base of the fixed memory region, or `None` for source-backed
    /// growth.
    arena: Option<NonNull<u8>>,
    /// Total bytes currently owned, including all block headers and the
    /// end sentinel.
    size: usize,
    source: S,
    _phantom: PhantomData<&'pool mut ()>,
}

// Safety: All memory block headers directly or indirectly referenced by a
//         particular instance of `Tlsf` are logically owned by that `Tlsf`,
//         and the interior mutability of `sentinel` is only exercised
//         through `&mut self`, so these are safe.
unsafe impl<S: PoolSource + Send, const FLLEN: usize, const SPLIT: usize> Send
    for Tlsf<'_, S, FLLEN, SPLIT>
{
}

unsafe impl<S: PoolSource + Sync, const FLLEN: usize, const SPLIT: usize> Sync
    for Tlsf<'_, S, FLLEN, SPLIT>
{
}

impl<'pool, S: PoolSource + Init, const FLLEN: usize, const SPLIT: usize>
    Tlsf<'pool, S, FLLEN, SPLIT>
{
    /// An unbound pool with the source's default value.
    pub const INIT: Self = Self::new(S::INIT);
}

impl<'pool, S: PoolSource + Init, const FLLEN: usize, const SPLIT: usize> Init
    for Tlsf<'pool, S, FLLEN, SPLIT>
{
    const INIT: Self = Self::INIT;
}

impl<'pool, S: PoolSource + ConstDefault, const FLLEN: usize, const SPLIT: usize> ConstDefault
    for Tlsf<'pool, S, FLLEN, SPLIT>
{
    const DEFAULT: Self = Self::new(S::DEFAULT);
}

impl<'pool, S: PoolSource + Default, const FLLEN: usize, const SPLIT: usize> Default
    for Tlsf<'pool, S, FLLEN, SPLIT>
{
    #[inline]
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: PoolSource, const FLLEN: usize, const SPLIT: usize> fmt::Debug
    for Tlsf<'_, S, FLLEN, SPLIT>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tlsf")
            .field("fl_bitmap", &format_args!("{:#034b}", self.fl_bitmap))
            .field("size", &self.size)
            .field("arena", &self.arena)
            .finish()
    }
}

impl<'pool, S: PoolSource, const FLLEN: usize, const SPLIT: usize> Tlsf<'pool, S, FLLEN, SPLIT> {
    /// Evaluates successfully if the parameters are valid.
    const VALID: () = {
        assert!(FLLEN >= 1, "`FLLEN` must not be zero");
        assert!(FLLEN <= 32, "`FLLEN` must fit in the 32-bit first-level bitmap");
        assert!(
            FLLEN as u32 + FL_SHIFT <= USIZE_BITS,
            "the pool bound must be less than the pointer width"
        );
        assert!(
            SPLIT >= BLOCK_SIZE_MIN,
            "`SPLIT` must be at least `BLOCK_SIZE_MIN`"
        );
    };

    /// The inclusive upper bound of `log2` of the pool size.
    const FL_MAX: u32 = FLLEN as u32 + FL_SHIFT - 1;

    /// The maximum total pool size in bytes.
    pub const MAX_POOL_SIZE: usize = 1 << Self::FL_MAX;

    const BLOCK_SIZE_MAX: usize = 1 << (Self::FL_MAX - 1);

    /// The largest request [`Self::allocate`] accepts.
    pub const MAX_ALLOC_SIZE: usize = Self::BLOCK_SIZE_MAX - BLOCK_OVERHEAD;

    /// Construct an unbound pool around the given backing source.
    pub const fn new(source: S) -> Self {
        let () = Self::VALID;
        Self {
            fl_bitmap: 0,
            sl_bitmap: [0; FLLEN],
            heads: [[NonNull::dangling(); SL_COUNT]; FLLEN],
            sentinel: UnsafeCell::new(FreeBlockHdr {
                common: BlockHdr { header: 0 },
                next_free: NonNull::dangling(),
                prev_free: NonNull::dangling(),
            }),
            arena: None,
            size: 0,
            source,
            _phantom: PhantomData,
        }
    }

    /// Borrow the contained source.
    #[inline]
    pub fn source_ref(&self) -> &S {
        &self.source
    }

    /// Pointer to the shared free-list sentinel, re-derived from the
    /// `UnsafeCell` on every use.
    #[inline]
    fn sentinel_ptr(&self) -> NonNull<FreeBlockHdr> {
        // Safety: `UnsafeCell::get` never returns null
        unsafe { NonNull::new_unchecked(self.sentinel.get()) }
    }

    /// Point every bin head at the sentinel so that the free-list insert
    /// and remove paths can write through them unconditionally.
    fn reset_bins(&mut self) {
        self.fl_bitmap = 0;
        self.sl_bitmap = [0; FLLEN];
        let sentinel = self.sentinel_ptr();
        for row in self.heads.iter_mut() {
            for head in row.iter_mut() {
                *head = sentinel;
            }
        }
    }

    /// Round a request up to the alignment and the minimum block size.
    /// Oversized requests pass through unchanged so that the caller's
    /// bounds check fails; rounding first could wrap to zero near
    /// `usize::MAX` and bypass that check.
    #[inline]
    fn adjust_size(size: usize, align: usize) -> usize {
        if size > Self::MAX_ALLOC_SIZE {
            return size;
        }
        let size = align_up(size, align);
        if size < BLOCK_SIZE_MIN {
            BLOCK_SIZE_MIN
        } else {
            size
        }
    }

    /// Whether the remainder left by trimming `block` to `size` is worth
    /// keeping as a separate free block.
    #[inline]
    unsafe fn block_can_trim(block: NonNull<BlockHdr>, size: usize) -> bool {
        block.as_ref().size() >= BLOCK_OVERHEAD + SPLIT + size
    }

    /// Insert `block` into the free list of bin `(fl, sl)` and set the
    /// bitmap bits. The store to the old head's `prev_free` is
    /// unconditional; an empty bin's head is the sentinel, which absorbs
    /// it.
    ///
    /// # Safety
    ///
    /// `block` must be a free block owned by `self`, not currently on any
    /// free list, and `(fl, sl)` must be the bin matching its size.
    #[inline]
    unsafe fn insert_free_block_at(&mut self, block: NonNull<BlockHdr>, fl: u32, sl: u32) {
        debug_assert!((fl as usize) < FLLEN, "wrong first level");
        debug_assert!((sl as usize) < SL_COUNT, "wrong second level");

        let mut block = block.cast::<FreeBlockHdr>();
        let mut current = mem::replace(&mut self.heads[fl as usize][sl as usize], block);
        block.as_mut().next_free = current;
        block.as_mut().prev_free = self.sentinel_ptr();
        current.as_mut().prev_free = block;
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl as usize] |= 1 << sl;
    }

    /// Remove `block` from the free list of bin `(fl, sl)`, clearing the
    /// bitmap bits when the bin becomes empty. The neighbor link stores
    /// are unconditional; either neighbor may be the sentinel.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into bin `(fl, sl)`.
    #[inline]
    unsafe fn remove_free_block_at(&mut self, block: NonNull<BlockHdr>, fl: u32, sl: u32) {
        debug_assert!((fl as usize) < FLLEN, "wrong first level");
        debug_assert!((sl as usize) < SL_COUNT, "wrong second level");

        let block = block.cast::<FreeBlockHdr>();
        let mut prev = block.as_ref().prev_free;
        let mut next = block.as_ref().next_free;
        next.as_mut().prev_free = prev;
        prev.as_mut().next_free = next;

        if self.heads[fl as usize][sl as usize] == block {
            self.heads[fl as usize][sl as usize] = next;

            // The new head being the sentinel means the bin is now empty.
            if next == self.sentinel_ptr() {
                self.sl_bitmap[fl as usize] &= !(1 << sl);
                if self.sl_bitmap[fl as usize] == 0 {
                    self.fl_bitmap &= !(1 << fl);
                }
            }
        }
    }

    /// Insert a free block into the bin matching its size.
    ///
    /// # Safety
    ///
    /// Same as [`Self::insert_free_block_at`].
    unsafe fn link_free_block(&mut self, block: NonNull<BlockHdr>) {
        let (fl, sl) = mapping(block.as_ref().size());
        debug_assert!((fl as usize) < FLLEN, "wrong first level");
        self.insert_free_block_at(block, fl, sl);
    }

    /// Remove a free block from the bin matching its size.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into the bin matching its size.
    unsafe fn unlink_free_block(&mut self, block: NonNull<BlockHdr>) {
        let (fl, sl) = mapping(block.as_ref().size());
        debug_assert!((fl as usize) < FLLEN, "wrong first level");
        self.remove_free_block_at(block, fl, sl);
    }

    /// Search for the first non-empty bin at or above `(fl, sl)` and
    /// return its head block together with the bin found.
    #[inline]
    fn find_suitable_block(&self, mut fl: u32, mut sl: u32) -> Option<(NonNull<BlockHdr>, u32, u32)> {
        debug_assert!((fl as usize) < FLLEN, "wrong first level");
        debug_assert!((sl as usize) < SL_COUNT, "wrong second level");

        let mut sl_map = self.sl_bitmap[fl as usize] & (!0u32 << sl);
        if sl_map == 0 {
            // Nothing left in this class; continue in the next larger one.
            let fl_map = self.fl_bitmap & u32::MAX.checked_shl(fl + 1).unwrap_or(0);
            if fl_map == 0 {
                return None;
            }

            fl = fl_map.trailing_zeros();
            debug_assert!((fl as usize) < FLLEN, "wrong first level");

            sl_map = self.sl_bitmap[fl as usize];
            debug_assert!(sl_map != 0, "second level bitmap is null");
        }

        sl = sl_map.trailing_zeros();
        debug_assert!((sl as usize) < SL_COUNT, "wrong second level");

        Some((self.heads[fl as usize][sl as usize].cast(), fl, sl))
    }

    /// Find and unlink a free block for a rounded request, growing the
    /// pool when the bins are exhausted. Returns the block and the
    /// bin-rounded size the allocation must use.
    ///
    /// # Safety
    ///
    /// `size` must be adjusted and no larger than [`Self::MAX_ALLOC_SIZE`].
    unsafe fn find_free(&mut self, size: usize) -> Option<(NonNull<BlockHdr>, usize)> {
        let size = round_block_size(size);
        let (fl, sl) = mapping(size);
        debug_assert!((fl as usize) < FLLEN, "wrong first level");

        let (block, fl, sl) = match self.find_suitable_block(fl, sl) {
            Some(found) => found,
            None => {
                if !self.grow(size) {
                    return None;
                }
                let found = self.find_suitable_block(fl, sl);
                debug_assert!(found.is_some(), "no block found");
                found?
            }
        };

        // Use the bin's minimum size so that the block returns to the same
        // bin when freed.
        let size = mapping_size(fl, sl);
        debug_assert!(block.as_ref().size() >= size, "insufficient block size");
        self.remove_free_block_at(block, fl, sl);
        Some((block, size))
    }

    /// Trim a drawn free block down to `size`, mark it used, and hand out
    /// its payload.
    ///
    /// # Safety
    ///
    /// `block` must be an unlinked free block owned by `self` with
    /// `block.size() >= size`.
    unsafe fn use_block(&mut self, block: NonNull<BlockHdr>, size: usize) -> NonNull<u8> {
        self.rtrim_free(block, size);
        block_set_free(block, false);
        block_payload(block)
    }

    /// Return the tail of a free block to its bin when the remainder is
    /// worth keeping.
    ///
    /// # Safety
    ///
    /// `block` must be a free block owned by `self`, not on any free list.
    unsafe fn rtrim_free(&mut self, block: NonNull<BlockHdr>, size: usize) {
        debug_assert!(block.as_ref().is_free(), "block must be free");
        if !Self::block_can_trim(block, size) {
            return;
        }
        let mut rest = block_split(block, size);
        block_link_next(block);
        rest.as_mut().set_prev_free(true);
        self.link_free_block(rest);
    }

    /// Return the tail of a used block to the pool, coalescing it with a
    /// free successor.
    ///
    /// # Safety
    ///
    /// `block` must be a used block owned by `self`.
    unsafe fn rtrim_used(&mut self, block: NonNull<BlockHdr>, size: usize) {
        debug_assert!(!block.as_ref().is_free(), "block must be used");
        if !Self::block_can_trim(block, size) {
            return;
        }
        let mut rest = block_split(block, size);
        rest.as_mut().set_prev_free(false);
        let rest = self.merge_next(rest);
        self.link_free_block(rest);
    }

    /// Shave `size` bytes off the front of a free block. The prefix (less
    /// one header word for the remainder) goes back to its bin; the
    /// remainder, still marked free, becomes the working block.
    ///
    /// # Safety
    ///
    /// `block` must be an unlinked free block owned by `self` and
    /// [`block_can_split`] must hold for `size`.
    unsafe fn ltrim_free(&mut self, block: NonNull<BlockHdr>, size: usize) -> NonNull<BlockHdr> {
        debug_assert!(block.as_ref().is_free(), "block must be free");
        debug_assert!(block_can_split(block, size), "block is too small");
        let mut rest = block_split(block, size - BLOCK_OVERHEAD);
        rest.as_mut().set_prev_free(true);
        block_link_next(block);
        self.link_free_block(block);
        rest
    }

    /// Merge a just-freed block with a free physical predecessor.
    ///
    /// # Safety
    ///
    /// `block` must be owned by `self` and not linked into any bin.
    unsafe fn merge_prev(&mut self, block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        if block.as_ref().is_prev_free() {
            let prev = block_prev(block);
            debug_assert!(
                prev.as_ref().is_free(),
                "prev block is not free though marked as such"
            );
            self.unlink_free_block(prev);
            block_absorb(prev, block)
        } else {
            block
        }
    }

    /// Merge a just-freed block with a free physical successor.
    ///
    /// # Safety
    ///
    /// Same as [`Self::merge_prev`].
    unsafe fn merge_next(&mut self, block: NonNull<BlockHdr>) -> NonNull<BlockHdr> {
        let next = block_next(block);
        if next.as_ref().is_free() {
            debug_assert!(block.as_ref().size() != 0, "previous block can't be last");
            self.unlink_free_block(next);
            block_absorb(block, next)
        } else {
            block
        }
    }

    /// Extend a dynamic pool through the resize callback by at least
    /// `grow_size` payload bytes. Fails for fixed pools, when the grown
    /// pool would exceed [`Self::MAX_POOL_SIZE`], or when the source
    /// refuses.
    #[cold]
    fn grow(&mut self, grow_size: usize) -> bool {
        if self.arena.is_some() {
            return false;
        }

        // First use of a dynamic pool: make the bins safe to write
        // through.
        if self.size == 0 {
            self.reset_bins();
        }

        let req_size = if self.size != 0 {
            self.size + BLOCK_OVERHEAD
        } else {
            2 * BLOCK_OVERHEAD
        } + grow_size;

        // A block merged at the pool tail must stay representable in the
        // mapping function.
        if req_size > Self::MAX_POOL_SIZE {
            return false;
        }

        // Safety: `req_size` is non-zero; reentrancy is excluded by
        //         `&mut self`
        let addr = match unsafe { self.source.resize(req_size) } {
            Some(addr) => addr,
            None => return false,
        };
        debug_assert!(
            addr.as_ptr() as usize % ALIGN_SIZE == 0,
            "wrong heap alignment address"
        );

        // Safety: The returned region is owned by us. The old end sentinel
        //         (or, on first use, the base of the region) becomes the
        //         new free block's header.
        unsafe {
            let mut block = NonNull::new_unchecked(if self.size != 0 {
                addr.as_ptr().add(self.size - BLOCK_OVERHEAD) as *mut BlockHdr
            } else {
                addr.as_ptr() as *mut BlockHdr
            });
            if self.size == 0 {
                block.as_mut().header = 0;
            }
            check_sentinel(block);
            block.as_mut().header |= grow_size | BLOCK_BIT_FREE;
            let block = self.merge_prev(block);
            self.link_free_block(block);
            let mut sentinel = block_link_next(block);
            sentinel.as_mut().header = BLOCK_BIT_PREV_FREE;
            self.size = req_size;
            check_sentinel(sentinel);
        }
        true
    }

    /// Release the tail of a dynamic pool when its physically last block
    /// becomes free. Free runs in the middle of the pool are never
    /// released.
    ///
    /// # Safety
    ///
    /// `block` must be the pool's last real block, free and unlinked.
    #[cold]
    unsafe fn shrink(&mut self, mut block: NonNull<BlockHdr>) {
        check_sentinel(block_next(block));
        let size = block.as_ref().size();
        debug_assert!(
            self.size >= size + BLOCK_OVERHEAD,
            "invalid heap size before shrink"
        );
        self.size = self.size - size - BLOCK_OVERHEAD;
        if self.size == BLOCK_OVERHEAD {
            self.size = 0;
        }
        // The callback's return value is not used when shrinking.
        self.source.resize(self.size);
        if self.size != 0 {
            // The freed block's header becomes the new end sentinel. Its
            // physical predecessor is allocated, so PREV_FREE stays clear.
            block.as_mut().header = 0;
            check_sentinel(block);
        }
    }

    /// Attempt to allocate a block of `size` bytes.
    ///
    /// Returns the payload address on success. A zero `size` returns a
    /// unique minimum-sized block; requests beyond
    /// [`Self::MAX_ALLOC_SIZE`] fail.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time (plus one [`PoolSource`]
    /// call when the pool has to grow).
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = Self::adjust_size(size, ALIGN_SIZE);
        if size > Self::MAX_ALLOC_SIZE {
            return None;
        }

        unsafe {
            // Fast path: linear-regime requests search `sl_bitmap[0]`
            // directly, skipping `round_block_size` and the full mapping.
            if size < BLOCK_SIZE_SMALL {
                let sl = (size >> ALIGN_SHIFT) as u32;
                let sl_map = self.sl_bitmap[0] & (!0u32 << sl);
                if sl_map != 0 {
                    let sl = sl_map.trailing_zeros();
                    // Use the bin's minimum size so that the block returns
                    // to the same bin on deallocation.
                    let size = (sl as usize) << ALIGN_SHIFT;
                    let block = self.heads[0][sl as usize].cast::<BlockHdr>();
                    self.remove_free_block_at(block, 0, sl);
                    return Some(self.use_block(block, size));
                }
                // Fall through: search the larger classes generically.
            }

            let (block, size) = self.find_free(size)?;
            Some(self.use_block(block, size))
        }
    }

    /// Attempt to allocate `size` bytes aligned to `align` bytes, which
    /// must be a non-zero power of two. `size` need not be a multiple of
    /// `align`. A zero `size` returns a unique, correctly aligned
    /// minimum-sized block.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time (plus one [`PoolSource`]
    /// call when the pool has to grow).
    pub fn allocate_aligned(&mut self, align: usize, size: usize) -> Option<NonNull<u8>> {
        let adjust = Self::adjust_size(size, ALIGN_SIZE);

        // The worst-case left-trim gap: the metadata view of a block plus
        // the alignment slack.
        let meta = BLOCK_OVERHEAD + mem::size_of::<FreeBlockHdr>();
        if !align.is_power_of_two() || align > Self::MAX_ALLOC_SIZE {
            return None;
        }
        let headroom = Self::MAX_ALLOC_SIZE.checked_sub(align)?.checked_sub(meta)?;
        if adjust > headroom {
            return None;
        }

        if align <= ALIGN_SIZE {
            return self.allocate(size);
        }

        let asize = Self::adjust_size(adjust + align - 1 + meta, align);
        unsafe {
            let (block, _) = self.find_free(asize)?;

            let payload = block_payload(block);
            let aligned = align_ptr(payload.as_ptr().add(meta), align);
            let gap = aligned as usize - payload.as_ptr() as usize;
            let block = self.ltrim_free(block, gap);
            Some(self.use_block(block, adjust))
        }
    }

    /// Deallocate a previously allocated memory block, coalescing it with
    /// free physical neighbors. When the resulting free block borders the
    /// end sentinel of a dynamic pool, the pool tail is released instead
    /// of reinserting the block.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time (plus one [`PoolSource`]
    /// call when the pool shrinks).
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously returned by
    /// `self`.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let block = block_from_payload(ptr);
        debug_assert!(!block.as_ref().is_free(), "block already marked as free");

        block_set_free(block, true);
        let block = self.merge_prev(block);
        let block = self.merge_next(block);

        if block_next(block).as_ref().size() == 0 && self.arena.is_none() {
            self.shrink(block);
        } else {
            self.link_free_block(block);
        }
    }

    /// Shrink or grow a previously allocated memory block.
    ///
    /// Tries, in order: trimming in place, growing into a free successor,
    /// growing backward into a free predecessor (which moves the payload
    /// and returns a new, lower address), and relocating. On failure the
    /// old block is left valid and `None` is returned. A zero `new_size`
    /// deallocates `ptr` and returns `None`.
    ///
    /// # Time Complexity
    ///
    /// Constant for the in-place paths; relocation and backward growth
    /// move up to `old_size` payload bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live memory block previously returned by
    /// `self`.
    pub unsafe fn reallocate(&mut self, ptr: NonNull<u8>, new_size: usize) -> Option<NonNull<u8>> {
        if new_size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let mut block = block_from_payload(ptr);
        let avail = block.as_ref().size();
        let size = Self::adjust_size(new_size, ALIGN_SIZE);
        if size > Self::MAX_ALLOC_SIZE {
            return None;
        }

        debug_assert!(!block.as_ref().is_free(), "block already marked as free");

        let mut ptr = ptr;
        if size > avail {
            let next = block_next(block);
            let next_free = next.as_ref().is_free();
            let next_size = if next_free {
                next.as_ref().size() + BLOCK_OVERHEAD
            } else {
                0
            };

            if next_free && size <= avail + next_size {
                // Forward expansion; no payload movement required.
                self.merge_next(block);
                let mut after = block_next(block);
                after.as_mut().set_prev_free(false);
            } else if block.as_ref().is_prev_free() {
                let mut prev = block_prev(block);
                let prev_size = prev.as_ref().size();
                let mut combined = prev_size + avail + BLOCK_OVERHEAD;
                if next_free {
                    combined += next_size;
                }

                if size > combined {
                    // Both neighbors together are still insufficient.
                    return self.relocate(ptr, avail, new_size);
                }

                self.unlink_free_block(prev);

                // Move the payload down into the predecessor; the regions
                // may overlap.
                core::ptr::copy(ptr.as_ptr(), block_payload(prev).as_ptr(), avail);

                // Merge the predecessor and the current block into one
                // used block, keeping the predecessor's own PREV_FREE bit.
                let merged = prev_size + avail + BLOCK_OVERHEAD;
                prev.as_mut().header = merged | (prev.as_ref().header & BLOCK_BIT_PREV_FREE);
                block_link_next(prev);

                if next_free {
                    self.unlink_free_block(next);
                    prev.as_mut().header += next.as_ref().size() + BLOCK_OVERHEAD;
                    block_link_next(prev);
                }

                let mut after = block_next(prev);
                after.as_mut().set_prev_free(false);

                block = prev;
                ptr = block_payload(block);
            } else {
                // No in-place expansion possible.
                return self.relocate(ptr, avail, new_size);
            }
        }

        self.rtrim_used(block, size);
        Some(ptr)
    }

    /// Allocate a fresh block, copy the payload over, and release the old
    /// block. The old block stays valid when the allocation fails.
    unsafe fn relocate(
        &mut self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let dst = self.allocate(new_size)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_ptr(), old_size);
        self.deallocate(ptr);
        Some(dst)
    }

    /// Bind the pool to a fixed memory region.
    ///
    /// The pool will not grow through the source; exhausted allocations
    /// return `None`. Returns the number of usable payload bytes, or 0
    /// when the region cannot hold one minimum block plus the pool
    /// overhead.
    ///
    /// # Safety
    ///
    ///  - The memory region will be considered owned by `self`. It must
    ///    outlive `self` and must not be accessed in any other way while
    ///    the pool is live.
    ///
    ///  - Once this method returns non-zero, `self` must not be moved:
    ///    the bin heads point at the sentinel stored inside `self`.
    ///
    /// # Panics
    ///
    /// This method never panics.
    pub unsafe fn init_fixed(&mut self, block: NonNull<[u8]>) -> usize {
        let bytes = nonnull_slice_len(block);
        let mem = nonnull_slice_start(block).as_ptr();

        self.arena = None;
        self.size = 0;
        self.reset_bins();

        let start = align_ptr(mem, ALIGN_SIZE);
        let adjust = start as usize - mem as usize;
        if bytes <= adjust {
            return 0;
        }

        let pool_bytes = (bytes - adjust) & !(ALIGN_SIZE - 1);
        if pool_bytes < 2 * BLOCK_OVERHEAD + BLOCK_SIZE_MIN {
            return 0;
        }

        let free_size = (pool_bytes - 2 * BLOCK_OVERHEAD) & !(ALIGN_SIZE - 1);
        if free_size < BLOCK_SIZE_MIN || free_size > Self::BLOCK_SIZE_MAX {
            return 0;
        }

        self.arena = Some(NonNull::new_unchecked(start));

        // The first block's header occupies the first word of the region.
        // Its previous-block slot would precede the region and is never
        // accessed.
        let mut first = NonNull::new_unchecked(start as *mut BlockHdr);
        first.as_mut().header = free_size | BLOCK_BIT_FREE;
        self.link_free_block(first);

        let mut sentinel = block_link_next(first);
        sentinel.as_mut().header = BLOCK_BIT_PREV_FREE;
        check_sentinel(sentinel);

        self.size = free_size + 2 * BLOCK_OVERHEAD;
        free_size
    }

    /// Bind the pool to a fixed memory region borrowed for `'pool`.
    ///
    /// See [`Self::init_fixed`].
    ///
    /// # Safety
    ///
    /// Once this method returns non-zero, `self` must not be moved: the
    /// bin heads point at the sentinel stored inside `self`.
    #[inline]
    pub unsafe fn bind_pool(&mut self, block: &'pool mut [MaybeUninit<u8>]) -> usize {
        // Safety: `block` is a mutable reference, which guarantees the
        // absence of aliasing references. Being `'pool` means it outlives
        // `self`. The no-move contract is forwarded to the caller.
        self.init_fixed(NonNull::new_unchecked(block as *mut [_] as *mut [u8]))
    }

    /// Reset a fixed pool to its initial state, invalidating every
    /// outstanding allocation in bounded time. Does nothing for dynamic
    /// pools and unbound instances.
    ///
    /// Using any previously returned pointer afterwards is undefined
    /// behavior.
    pub fn reset(&mut self) {
        let start = match self.arena {
            Some(arena) => arena.as_ptr(),
            None => return,
        };

        self.reset_bins();

        debug_assert!(self.size >= 2 * BLOCK_OVERHEAD + BLOCK_SIZE_MIN);
        let free_size = self.size - 2 * BLOCK_OVERHEAD;

        // Safety: The region `[start, start + self.size)` is owned by
        //         `self`; all prior allocations in it are invalidated by
        //         contract
        unsafe {
            let mut first = NonNull::new_unchecked(start as *mut BlockHdr);
            first.as_mut().header = free_size | BLOCK_BIT_FREE;
            self.link_free_block(first);

            let mut sentinel = block_link_next(first);
            sentinel.as_mut().header = BLOCK_BIT_PREV_FREE;
            check_sentinel(sentinel);
        }
    }

    /// Extend the pool with a physically adjacent memory region,
    /// coalescing with the pool's last block when it is free.
    ///
    /// Returns the number of payload bytes absorbed, or 0 when the region
    /// is rejected: too small, not immediately adjacent to the pool end,
    /// or the grown pool would exceed [`Self::MAX_POOL_SIZE`]. For fixed
    /// pools the appended region must also carry the relocated end
    /// sentinel's overhead; for dynamic pools the source is asked to
    /// extend the mapping first.
    ///
    /// # Safety
    ///
    /// The memory region will be considered owned by `self`. It must
    /// outlive `self` and must not be accessed in any other way while the
    /// pool is live.
    pub unsafe fn append(&mut self, block: NonNull<[u8]>) -> usize {
        let bytes = nonnull_slice_len(block);
        let mem = nonnull_slice_start(block).as_ptr();

        if self.size == 0 || bytes < 2 * BLOCK_OVERHEAD {
            return 0;
        }

        let start = align_ptr(mem, ALIGN_SIZE);
        let end = mem as usize + bytes;
        let mut aligned_size = (end - start as usize) & !(ALIGN_SIZE - 1);

        // A fixed pool has no backend to supply the relocated sentinel's
        // overhead; it must come out of the appended region itself.
        if self.arena.is_some() {
            if aligned_size <= BLOCK_OVERHEAD {
                return 0;
            }
            aligned_size -= BLOCK_OVERHEAD;
        }

        if aligned_size < 2 * BLOCK_OVERHEAD {
            return 0;
        }

        // Safety: An idempotent query; the source returns the current base
        let pool_start = match self.arena {
            Some(arena) => arena.as_ptr(),
            None => match self.source.resize(self.size) {
                Some(addr) => addr.as_ptr(),
                None => return 0,
            },
        };

        // Only coalescing with immediately adjacent memory is supported.
        if start as usize != pool_start as usize + self.size {
            return 0;
        }

        let old_size = self.size;
        let new_total = self.size + aligned_size + BLOCK_OVERHEAD;
        if new_total > Self::MAX_POOL_SIZE {
            return 0;
        }

        if self.arena.is_none() {
            // Safety: Growing an existing mapping; the base must not move
            if self.source.resize(new_total).is_none() {
                return 0;
            }
        }

        self.size = new_total;

        // The old end sentinel's header is the last word of the old pool
        // span.
        let old_sentinel = NonNull::new_unchecked(
            pool_start.add(old_size - BLOCK_OVERHEAD) as *mut BlockHdr
        );
        check_sentinel(old_sentinel);

        // When the block before the sentinel is free, it is re-created as
        // part of the bigger block.
        let last_block = if old_sentinel.as_ref().is_prev_free() {
            let last = block_prev(old_sentinel);
            debug_assert!(last.as_ref().is_free(), "last block should be free");
            self.unlink_free_block(last);
            Some(last)
        } else {
            None
        };

        let mut new_free_size = aligned_size;
        let mut new_free_block = match last_block {
            Some(last) => {
                // Absorb the last block's payload plus the old sentinel's
                // header word.
                new_free_size += last.as_ref().size() + BLOCK_OVERHEAD;
                last
            }
            // Convert the old sentinel into the new free block's header.
            None => old_sentinel,
        };

        // When there was no free last block, the physical predecessor is
        // allocated: PREV_FREE stays clear, and the previous-block slot is
        // left alone because it overlaps that block's payload tail.
        new_free_block.as_mut().header = new_free_size | BLOCK_BIT_FREE;

        self.link_free_block(new_free_block);

        let mut new_sentinel = block_link_next(new_free_block);
        new_sentinel.as_mut().header = BLOCK_BIT_PREV_FREE;
        check_sentinel(new_sentinel);

        aligned_size
    }
}

#[cfg(test)]
mod tests;
