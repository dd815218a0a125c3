//! Size-class indexing.
//!
//! Four branch-light maps from a padded chunk size to a container index:
//! fast bins, small bins, large bins (piecewise-logarithmic, 64-bit
//! thresholds), and the per-thread cache. The bin boundaries are part of
//! the layout contract; tests below pin them.

use crate::chunk::{MALLOC_ALIGNMENT, MINSIZE, SIZE_SZ, request2size};

/// Total bins per arena: unsorted (1) + small (62) + large (63) + spare.
pub const NBINS: usize = 128;

/// Number of small-bin slots (the first two indices are unused).
pub const NSMALLBINS: usize = 64;

/// Small bins advance by one alignment quantum per index.
pub const SMALLBIN_WIDTH: usize = MALLOC_ALIGNMENT;

/// First size handled by the large bins.
pub const MIN_LARGE_SIZE: usize = NSMALLBINS * SMALLBIN_WIDTH;

/// Hard ceiling of the tunable fast-bin limit (chunk bytes).
pub const MAX_FAST_SIZE: usize = 80 * SIZE_SZ / 4;

/// Number of fast-bin stacks.
pub const NFASTBINS: usize = fastbin_index(request2size(MAX_FAST_SIZE)) + 1;

/// Default fast-bin ceiling in request bytes before padding.
pub const DEFAULT_MXFAST: usize = 64 * SIZE_SZ / 4;

/// A combined free block at or above this size triggers fast-bin
/// consolidation on release.
pub const FASTBIN_CONSOLIDATION_THRESHOLD: usize = 65536;

/// Thread-cache class count.
pub const TCACHE_MAX_BINS: usize = 64;

/// Default per-class thread-cache depth.
pub const TCACHE_FILL_COUNT: usize = 7;

/// Bits per binmap word.
pub const BITS_PER_MAP: usize = usize::BITS as usize;

/// Binmap words per arena.
pub const BINMAP_WORDS: usize = NBINS / BITS_PER_MAP;

/// Fast-bin index for a padded size at or below the fast ceiling.
#[inline]
pub const fn fastbin_index(size: usize) -> usize {
    (size >> 4) - 2
}

/// Whether a padded size is served by the exact-fit small bins.
#[inline]
pub const fn in_smallbin_range(size: usize) -> bool {
    size < MIN_LARGE_SIZE
}

/// Small-bin index for a padded size inside the small range.
#[inline]
pub const fn smallbin_index(size: usize) -> usize {
    size >> 4
}

/// Large-bin index: 32 bins spaced 64 apart, then 16 spaced 512, 8 spaced
/// 4096, 4 spaced 32768, 2 spaced 262144, and one catch-all.
#[inline]
pub const fn largebin_index(size: usize) -> usize {
    if (size >> 6) <= 48 {
        48 + (size >> 6)
    } else if (size >> 9) <= 20 {
        91 + (size >> 9)
    } else if (size >> 12) <= 10 {
        110 + (size >> 12)
    } else if (size >> 15) <= 4 {
        119 + (size >> 15)
    } else if (size >> 18) <= 2 {
        124 + (size >> 18)
    } else {
        126
    }
}

/// Bin index for any padded size.
#[inline]
pub const fn bin_index(size: usize) -> usize {
    if in_smallbin_range(size) {
        smallbin_index(size)
    } else {
        largebin_index(size)
    }
}

/// Thread-cache index for a padded chunk size.
#[inline]
pub const fn csize2tidx(size: usize) -> usize {
    (size - MINSIZE + MALLOC_ALIGNMENT - 1) / MALLOC_ALIGNMENT
}

/// Thread-cache index for an unpadded request size.
#[inline]
pub fn usize2tidx(bytes: usize) -> usize {
    csize2tidx(request2size(bytes))
}

/// Largest request bytes a tcache class index can hold.
#[inline]
pub const fn tidx2usize(idx: usize) -> usize {
    idx * MALLOC_ALIGNMENT + MINSIZE - SIZE_SZ
}

/// Rounds a user-facing fast-ceiling request the way the tuning surface
/// does: zero disables fast bins entirely. Range validation happens at the
/// tuning entry, not here.
#[inline]
pub fn round_max_fast(request: usize) -> usize {
    if request == 0 {
        SMALLBIN_WIDTH
    } else {
        (request + SIZE_SZ) & !(MALLOC_ALIGNMENT - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fastbin_boundaries() {
        assert_eq!(fastbin_index(32), 0);
        assert_eq!(fastbin_index(48), 1);
        assert_eq!(fastbin_index(176), 9);
        assert_eq!(NFASTBINS, 10);
    }

    #[test]
    fn smallbin_boundaries() {
        assert!(in_smallbin_range(MIN_LARGE_SIZE - 16));
        assert!(!in_smallbin_range(MIN_LARGE_SIZE));
        assert_eq!(smallbin_index(32), 2);
        assert_eq!(smallbin_index(1008), 63);
        assert_eq!(MIN_LARGE_SIZE, 1024);
    }

    #[test]
    fn largebin_thresholds_match_layout_contract() {
        assert_eq!(largebin_index(1024), 64);
        assert_eq!(largebin_index(1024 + 63), 64);
        assert_eq!(largebin_index(1024 + 64), 65);
        assert_eq!(largebin_index(3072), 96);
        // last of the 64-step range
        assert_eq!(largebin_index(48 * 64), 96);
        assert_eq!(largebin_index(48 * 64 + 64), 97);
        // 512-step range
        assert_eq!(largebin_index(10240), 111);
        // 4096-step range
        assert_eq!(largebin_index(10 * 4096), 120);
        // 32768-step range
        assert_eq!(largebin_index(4 * 32768), 123);
        // 262144-step range and the catch-all
        assert_eq!(largebin_index(2 * 262144), 126);
        assert_eq!(largebin_index(usize::MAX >> 8), 126);
    }

    #[test]
    fn largebin_index_is_monotonic() {
        let mut last = largebin_index(MIN_LARGE_SIZE);
        let mut size = MIN_LARGE_SIZE;
        while size < 2 * 1024 * 1024 {
            let idx = largebin_index(size);
            assert!(idx >= last, "index regressed at size {size}");
            assert!(idx < NBINS - 1);
            last = idx;
            size += 16;
        }
    }

    #[test]
    fn tcache_index_round_trip() {
        assert_eq!(csize2tidx(MINSIZE), 0);
        assert_eq!(csize2tidx(MINSIZE + MALLOC_ALIGNMENT), 1);
        assert_eq!(usize2tidx(24), 0);
        assert_eq!(usize2tidx(25), 1);
        for idx in 0..TCACHE_MAX_BINS {
            assert_eq!(usize2tidx(tidx2usize(idx)), idx);
        }
    }

    #[test]
    fn max_fast_rounding() {
        assert_eq!(round_max_fast(0), SMALLBIN_WIDTH);
        // Default ceiling admits chunks up to 128 bytes (requests to 120).
        assert_eq!(round_max_fast(DEFAULT_MXFAST), 128);
        assert_eq!(round_max_fast(MAX_FAST_SIZE), 160);
    }
}
