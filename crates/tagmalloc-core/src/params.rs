//! Process-wide tunable parameters.
//!
//! One record of atomics shared by every arena: thresholds, caps, the
//! perturb byte, and the page-map counters. Defaults match the 64-bit
//! layout; the `TAGMALLOC_*` environment can override a subset at context
//! creation, and the tuning entry point mutates the rest at runtime.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::size_class::{
    DEFAULT_MXFAST, TCACHE_FILL_COUNT, TCACHE_MAX_BINS, round_max_fast, tidx2usize,
};

/// Default residual-top size above which release-triggered trim fires.
pub const DEFAULT_TRIM_THRESHOLD: usize = 128 * 1024;

/// Default size at which allocations leave the arenas for page mappings.
pub const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;

/// Ceiling of the self-adjusting mmap threshold.
pub const DEFAULT_MMAP_THRESHOLD_MAX: usize = 4 * 1024 * 1024 * std::mem::size_of::<usize>();

/// Default cap on simultaneously live page-mapped chunks.
pub const DEFAULT_MMAP_MAX: usize = 65536;

/// Arena-count threshold below which creation is always allowed.
pub const DEFAULT_ARENA_TEST: usize = 8;

/// Recognized tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneParam {
    /// Upper bound in request bytes for fast-bin eligibility; 0 disables.
    FastCeiling,
    /// Residual top-chunk size that triggers automatic trim on release.
    TrimThreshold,
    /// Extra bytes added to every heap-extension request.
    TopPad,
    /// Request size at which allocations are served by page mapping.
    MmapThreshold,
    /// Cap on live page-mapped chunks; 0 disables mapping.
    MmapMax,
    /// Fill byte for allocation/release scribbling; 0 disables.
    Perturb,
    /// Arena count under which creation is unconditional.
    ArenaTest,
    /// Hard cap on arena count; 0 derives it from the CPU count.
    ArenaMax,
    /// Per-class thread-cache depth.
    TcacheCount,
    /// Largest request bytes eligible for the thread cache.
    TcacheMax,
    /// Chunks examined per unsorted drain before a cached exact fit is
    /// returned; 0 means unlimited.
    TcacheUnsortedLimit,
}

/// The shared parameter record.
pub struct MallocParams {
    pub(crate) trim_threshold: AtomicUsize,
    pub(crate) top_pad: AtomicUsize,
    pub(crate) mmap_threshold: AtomicUsize,
    pub(crate) n_mmaps_max: AtomicUsize,
    pub(crate) no_dyn_threshold: AtomicBool,
    pub(crate) perturb_byte: AtomicUsize,
    pub(crate) arena_test: AtomicUsize,
    pub(crate) arena_max: AtomicUsize,
    pub(crate) tcache_bins: AtomicUsize,
    pub(crate) tcache_count: AtomicUsize,
    pub(crate) tcache_unsorted_limit: AtomicUsize,
    pub(crate) global_max_fast: AtomicUsize,
    // page-map statistics
    pub(crate) n_mmaps: AtomicUsize,
    pub(crate) max_n_mmaps: AtomicUsize,
    pub(crate) mmapped_mem: AtomicUsize,
    pub(crate) max_mmapped_mem: AtomicUsize,
}

impl Default for MallocParams {
    fn default() -> Self {
        Self {
            trim_threshold: AtomicUsize::new(DEFAULT_TRIM_THRESHOLD),
            top_pad: AtomicUsize::new(0),
            mmap_threshold: AtomicUsize::new(DEFAULT_MMAP_THRESHOLD),
            n_mmaps_max: AtomicUsize::new(DEFAULT_MMAP_MAX),
            no_dyn_threshold: AtomicBool::new(false),
            perturb_byte: AtomicUsize::new(0),
            arena_test: AtomicUsize::new(DEFAULT_ARENA_TEST),
            arena_max: AtomicUsize::new(0),
            tcache_bins: AtomicUsize::new(TCACHE_MAX_BINS),
            tcache_count: AtomicUsize::new(TCACHE_FILL_COUNT),
            tcache_unsorted_limit: AtomicUsize::new(0),
            global_max_fast: AtomicUsize::new(round_max_fast(DEFAULT_MXFAST)),
            n_mmaps: AtomicUsize::new(0),
            max_n_mmaps: AtomicUsize::new(0),
            mmapped_mem: AtomicUsize::new(0),
            max_mmapped_mem: AtomicUsize::new(0),
        }
    }
}

impl MallocParams {
    /// Builds the default record, then applies `TAGMALLOC_*` environment
    /// overrides. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let params = Self::default();
        let read = |name: &str| -> Option<usize> {
            std::env::var(name).ok()?.trim().parse().ok()
        };
        if let Some(v) = read("TAGMALLOC_TRIM_THRESHOLD") {
            params.trim_threshold.store(v, Ordering::Relaxed);
            params.no_dyn_threshold.store(true, Ordering::Relaxed);
        }
        if let Some(v) = read("TAGMALLOC_MMAP_THRESHOLD") {
            params.mmap_threshold.store(v, Ordering::Relaxed);
            params.no_dyn_threshold.store(true, Ordering::Relaxed);
        }
        if let Some(v) = read("TAGMALLOC_PERTURB") {
            params.perturb_byte.store(v & 0xff, Ordering::Relaxed);
        }
        if let Some(v) = read("TAGMALLOC_ARENA_MAX") {
            params.arena_max.store(v, Ordering::Relaxed);
        }
        if let Some(v) = read("TAGMALLOC_TCACHE_COUNT") {
            params.tcache_count.store(v.min(u16::MAX as usize), Ordering::Relaxed);
        }
        params
    }

    #[inline]
    pub(crate) fn trim_threshold(&self) -> usize {
        self.trim_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn top_pad(&self) -> usize {
        self.top_pad.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn mmap_threshold(&self) -> usize {
        self.mmap_threshold.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn perturb_byte(&self) -> u8 {
        (self.perturb_byte.load(Ordering::Relaxed) & 0xff) as u8
    }

    #[inline]
    pub(crate) fn max_fast(&self) -> usize {
        self.global_max_fast.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn tcache_bins(&self) -> usize {
        self.tcache_bins.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn tcache_count(&self) -> usize {
        self.tcache_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn tcache_unsorted_limit(&self) -> usize {
        self.tcache_unsorted_limit.load(Ordering::Relaxed)
    }

    /// Records a fresh page mapping of `size` bytes in the counters.
    pub(crate) fn note_mmap(&self, size: usize) {
        let n = self.n_mmaps.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_n_mmaps.fetch_max(n, Ordering::Relaxed);
        let sum = self.mmapped_mem.fetch_add(size, Ordering::Relaxed) + size;
        self.max_mmapped_mem.fetch_max(sum, Ordering::Relaxed);
    }

    /// Records the release of a page mapping.
    pub(crate) fn note_munmap(&self, size: usize) {
        self.n_mmaps.fetch_sub(1, Ordering::Relaxed);
        self.mmapped_mem.fetch_sub(size, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn mmap_allowed(&self) -> bool {
        self.n_mmaps.load(Ordering::Relaxed) < self.n_mmaps_max.load(Ordering::Relaxed)
    }

    /// Adapts the mapping and trim thresholds to a released mapped chunk,
    /// unless the user pinned them.
    pub(crate) fn adjust_dyn_threshold(&self, chunk_size: usize) {
        if self.no_dyn_threshold.load(Ordering::Relaxed) {
            return;
        }
        if chunk_size > self.mmap_threshold() && chunk_size <= DEFAULT_MMAP_THRESHOLD_MAX {
            self.mmap_threshold.store(chunk_size, Ordering::Relaxed);
            self.trim_threshold
                .store(2 * chunk_size, Ordering::Relaxed);
        }
    }

    /// Largest chunk size the thread cache accepts.
    #[inline]
    pub(crate) fn tcache_max_chunk(&self) -> usize {
        tidx2usize(self.tcache_bins().saturating_sub(1))
    }
}
