//! Size-class mapper. Computes the `(fl, sl)` bin for a block size, the bin
//! lower bounds, and the "good-fit" request rounding.
//!
//! All of these sit on the allocate and deallocate fast paths, so the
//! selection between the linear regime (`fl == 0`, bins spaced
//! [`ALIGN_SIZE`] apart) and the logarithmic regime is done with masks
//! rather than branches.
use super::{ALIGN_SHIFT, ALIGN_SIZE, BLOCK_SIZE_MIN, FL_SHIFT, SL_COUNT, SL_SHIFT};

const USIZE_BITS: u32 = usize::BITS;

/// `⌊log₂ x⌋`. `x` must not be zero.
#[inline]
pub(crate) fn log2_floor(x: usize) -> u32 {
    debug_assert!(x > 0, "log2 of zero");
    USIZE_BITS - 1 - x.leading_zeros()
}

/// Map a block size to its `(fl, sl)` bin indices.
///
/// When `size < BLOCK_SIZE_SMALL`, an all-ones mask routes the linear
/// index (`size / ALIGN_SIZE`) through; otherwise the logarithmic index is
/// selected. The wrapping subtractions produce garbage in the inactive arm,
/// which the mask discards.
#[inline]
pub(crate) fn mapping(size: usize) -> (u32, u32) {
    debug_assert!(size >= BLOCK_SIZE_MIN);
    debug_assert!(size % ALIGN_SIZE == 0);

    let t = log2_floor(size);
    let small = ((t < FL_SHIFT) as u32).wrapping_neg();

    let fl = !small & t.wrapping_sub(FL_SHIFT).wrapping_add(1);

    // Clamp the shift so the inactive arm stays defined when `t < SL_SHIFT`.
    let shift = t.wrapping_sub(SL_SHIFT) & (USIZE_BITS - 1);
    let sl_large = ((size >> shift) as u32) ^ SL_COUNT as u32;
    let sl_small = (size >> ALIGN_SHIFT) as u32;
    let sl = (!small & sl_large) | (small & sl_small);

    debug_assert!((sl as usize) < SL_COUNT, "wrong second level");
    (fl, sl)
}

/// The minimum block size that falls in bin `(fl, sl)`.
///
/// Requests drawn from a bin are rounded up to this value so that the block
/// returns to the same bin when freed.
#[inline]
pub(crate) fn mapping_size(fl: u32, sl: u32) -> usize {
    if fl == 0 {
        return (sl as usize) << ALIGN_SHIFT;
    }

    let base = 1usize << (fl + FL_SHIFT - 1);
    base + (sl as usize) * (base >> SL_SHIFT)
}

/// Round a request up to the next bin boundary ("good fit").
///
/// Guarantees that the first non-empty bin at or above `mapping(size)` only
/// holds blocks large enough for the request. For sizes in the linear
/// regime the rounding mask degenerates to zero and the size passes through
/// unchanged.
#[inline]
pub(crate) fn round_block_size(size: usize) -> usize {
    let lg = log2_floor(size);
    let is_large = (lg >= FL_SHIFT) as usize;

    // Clamp the shift to a valid range; a garbage value is masked out below
    // because shifting zero yields zero.
    let shift = lg.wrapping_sub(SL_SHIFT) & (USIZE_BITS - 1);
    let round = is_large << shift;
    let t = round.wrapping_sub(is_large);
    size.wrapping_add(t) & !t
}
