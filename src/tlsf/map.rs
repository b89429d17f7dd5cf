//! Size-class mapper: request size → (first-level, second-level) bin index,
//! and its inverse.
//!
//! The hot-path functions are branch-free: both the linear and logarithmic
//! candidates are computed and selected with a mask derived from the
//! comparison, so the latency is flat on in-order cores where a
//! mispredicted branch stalls the pipeline.
use super::{ALIGN_SHIFT, BLOCK_SIZE_SMALL, FL_COUNT, FL_SHIFT, SL_COUNT, SL_SHIFT};

#[inline]
pub(crate) fn log2_floor(x: usize) -> u32 {
    debug_assert!(x > 0, "log2 of zero");
    usize::BITS - 1 - x.leading_zeros()
}

/// Map a block size to its (fl, sl) bin indices.
#[inline]
pub(crate) fn mapping(size: usize) -> (u32, u32) {
    let t = log2_floor(size);

    // All-ones when the size is in the linear range (< BLOCK_SIZE_SMALL),
    // all-zeros in the logarithmic range.
    let small = ((t < FL_SHIFT) as u32).wrapping_neg();

    // FL: 0 for small sizes, t - FL_SHIFT + 1 for large. The wrapping
    // subtraction when t < FL_SHIFT is masked off by `!small`.
    let fl = !small & t.wrapping_sub(FL_SHIFT).wrapping_add(1);

    // SL: linear index for small, the SL_SHIFT bits below the leading one
    // for large. The shift amount is clamped into range; the garbage value
    // it produces when t < SL_SHIFT is masked off by `small`.
    let shift = t.wrapping_sub(SL_SHIFT) & (usize::BITS - 1);
    let sl_large = (size >> shift) as u32 ^ SL_COUNT as u32;
    let sl_small = (size >> ALIGN_SHIFT) as u32;
    let sl = (!small & sl_large) | (small & sl_small);

    debug_assert!((fl as usize) < FL_COUNT, "wrong first level");
    debug_assert!((sl as usize) < SL_COUNT, "wrong second level");
    (fl, sl)
}

/// The bin floor: the smallest block size mapping to bin `(fl, sl)`.
#[inline]
pub(crate) fn mapping_size(fl: u32, sl: u32) -> usize {
    if fl == 0 {
        return sl as usize * (BLOCK_SIZE_SMALL / SL_COUNT);
    }

    let size = 1usize << (fl + FL_SHIFT - 1);
    size + sl as usize * (size >> SL_SHIFT)
}

/// Round a request up so that every block in its mapped bin can satisfy it.
/// Identity below `BLOCK_SIZE_SMALL`; otherwise rounds up to the next
/// second-level bin boundary.
#[inline]
pub(crate) fn round_block_size(size: usize) -> usize {
    let lg = log2_floor(size);
    let is_large = (lg >= FL_SHIFT) as usize;

    // Clamp the shift into range; when is_large is zero the garbage shift
    // is harmless because shifting zero yields zero.
    let shift = lg.wrapping_sub(SL_SHIFT) & (usize::BITS - 1);
    let round = is_large << shift;

    // Large: (1 << shift) - 1, the second-level rounding mask. Small: 0.
    let t = round.wrapping_sub(is_large);
    (size + t) & !t
}
