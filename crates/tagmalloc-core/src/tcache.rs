//! Per-thread chunk cache.
//!
//! Each thread keeps a bounded LIFO of recently freed chunks per size
//! class and serves repeat allocations without touching any arena. A
//! cached chunk stores its `next` link in the first payload word and a
//! `key` stamp in the second; the stamp is the cheap prefilter for the
//! double-free scan. Cached chunks keep the successor's P bit set, so the
//! boundary-tag view still sees them as live.

use crate::chunk::{SIZE_SZ, chunk2mem};
use crate::size_class::TCACHE_MAX_BINS;
use crate::sys::SystemMemory;

/// One thread's cache. Created on first use, flushed on thread exit.
pub(crate) struct Tcache {
    entries: [usize; TCACHE_MAX_BINS],
    counts: [u16; TCACHE_MAX_BINS],
    /// Nonzero stamp identifying this cache in chunk `key` slots.
    key: usize,
}

impl Tcache {
    pub fn new(key: usize) -> Self {
        debug_assert!(key != 0);
        Self {
            entries: [0; TCACHE_MAX_BINS],
            counts: [0; TCACHE_MAX_BINS],
            key,
        }
    }

    #[inline]
    pub fn count(&self, tc_idx: usize) -> usize {
        self.counts[tc_idx] as usize
    }

    #[inline]
    pub fn has_cached(&self, tc_idx: usize) -> bool {
        self.counts[tc_idx] > 0
    }

    /// Caches the chunk at `p`, stamping its key slot.
    pub fn put(&mut self, mem: &SystemMemory, p: usize, tc_idx: usize) {
        let e = chunk2mem(p);
        mem.write(e + SIZE_SZ, self.key);
        mem.write(e, self.entries[tc_idx]);
        self.entries[tc_idx] = e;
        self.counts[tc_idx] += 1;
    }

    /// Pops the most recently cached chunk of the class, clearing its key
    /// stamp. The class must be non-empty.
    pub fn get(&mut self, mem: &SystemMemory, tc_idx: usize) -> usize {
        let e = self.entries[tc_idx];
        debug_assert!(e != 0);
        self.entries[tc_idx] = mem.read(e);
        self.counts[tc_idx] -= 1;
        mem.write(e + SIZE_SZ, 0);
        e
    }

    /// Whether the chunk's key slot carries this cache's stamp. A match is
    /// only probable evidence of a double free; callers confirm with
    /// [`Tcache::bucket_contains`].
    pub fn key_matches(&self, mem: &SystemMemory, p: usize) -> bool {
        mem.read(chunk2mem(p) + SIZE_SZ) == self.key
    }

    /// Exhaustive scan of one class for the entry address of `p`.
    pub fn bucket_contains(&self, mem: &SystemMemory, p: usize, tc_idx: usize) -> bool {
        let e = chunk2mem(p);
        let mut cursor = self.entries[tc_idx];
        while cursor != 0 {
            if cursor == e {
                return true;
            }
            cursor = mem.read(cursor);
        }
        false
    }

    /// Drains every class, yielding user pointers for release through the
    /// normal path. Used at thread shutdown.
    pub fn drain(&mut self, mem: &SystemMemory) -> Vec<usize> {
        let mut out = Vec::new();
        for tc_idx in 0..TCACHE_MAX_BINS {
            while self.has_cached(tc_idx) {
                out.push(self.get(mem, tc_idx));
            }
        }
        out
    }
}
