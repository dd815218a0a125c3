//! The allocation engine.
//!
//! One `Engine` binds an arena to the shared context and implements the
//! tiered search: fast bins, exact small bins, unsorted drain with
//! binning, large-bin best fit over the skip ring, binmap scan, top-chunk
//! split, and finally system acquisition. Release runs the inverse:
//! tcache or fast-bin push without coalescing, otherwise boundary-tag
//! coalescing into the unsorted queue or the top, with trim triggers.
//!
//! Callers hold the arena mutex for every entry except the fast-bin push
//! (`int_free` with `have_lock == false` acquires it on demand) and the
//! page-mapped paths, which touch no arena state.

use crate::arena::{
    HEAP_HDR_BYTES, Shared, delete_heap, grow_heap, heap_for_ptr, heap_prev, heap_size, new_heap,
    set_heap_arena_index, set_heap_prev, shrink_heap,
};
use crate::bins::unlink_chunk;
use crate::chunk::{
    IS_MMAPPED, MALLOC_ALIGN_MASK, MINSIZE, NON_MAIN_ARENA, PREV_INUSE, SIZE_BITS, SIZE_SZ, bk,
    bk_nextsize, checked_request2size, chunk2mem, chunk_is_mmapped, chunksize, chunksize_nomask,
    clear_inuse_bit_at_offset, fd, fd_nextsize, inuse_bit_at_offset, mem2chunk, misaligned_chunk,
    prev_inuse, prev_size, set_bk, set_bk_nextsize, set_fd, set_fd_nextsize, set_fd_release,
    set_foot, set_head, set_head_size, set_inuse_bit_at_offset, set_non_main_arena, set_prev_size,
};
use crate::fatal::malloc_printerr;
use crate::size_class::{
    BINMAP_WORDS, BITS_PER_MAP, FASTBIN_CONSOLIDATION_THRESHOLD, NBINS, NFASTBINS, bin_index,
    csize2tidx, fastbin_index, in_smallbin_range, largebin_index, smallbin_index,
};
use crate::state::{ArenaState, next_bin};
use crate::sys::{MMAP_AS_MORECORE_SIZE, SystemMemory, align_up};
use crate::tcache::Tcache;

/// Unsorted-drain iteration cap per allocation.
const MAX_ITERS: usize = 10_000;

/// Size of the full chunk bookkeeping overlay, used by the page-advise
/// walk to keep headers resident.
const CHUNK_OVERLAY: usize = 6 * SIZE_SZ;

pub(crate) struct Engine<'a> {
    pub sh: &'a Shared,
    pub av: ArenaState,
}

impl<'a> Engine<'a> {
    pub fn new(sh: &'a Shared, av: ArenaState) -> Self {
        Self { sh, av }
    }

    #[inline]
    fn mem(&self) -> &'a SystemMemory {
        &self.sh.mem
    }

    #[inline]
    fn arena_bit(&self) -> usize {
        if self.av.is_primary() { 0 } else { NON_MAIN_ARENA }
    }

    fn alloc_perturb(&self, mem_ptr: usize, bytes: usize) {
        let b = self.sh.params.perturb_byte();
        if b != 0 {
            self.mem().fill_bytes(mem_ptr, b ^ 0xff, bytes);
        }
    }

    fn free_perturb(&self, mem_ptr: usize, len: usize) {
        let b = self.sh.params.perturb_byte();
        if b != 0 {
            self.mem().fill_bytes(mem_ptr, b, len);
        }
    }

    /// Pops the head of fast bin `fb` with the acquire CAS loop. Returns 0
    /// when the bin is empty.
    fn fastbin_pop(&self, fb: usize) -> usize {
        let mem = self.mem();
        let mut victim = mem.read_acquire(fb);
        while victim != 0 {
            let next = fd(mem, victim);
            match mem.cas(fb, victim, next) {
                Ok(_) => break,
                Err(seen) => victim = seen,
            }
        }
        victim
    }

    // =================================================================
    // Allocation
    // =================================================================

    /// Core allocation. The arena mutex is held by the caller. Returns the
    /// user pointer, or `None` for resource exhaustion.
    pub fn int_malloc(&self, mut tcache: Option<&mut Tcache>, bytes: usize) -> Option<usize> {
        let mem = self.mem();
        let av = self.av;
        let params = &self.sh.params;
        let nb = checked_request2size(bytes)?;

        // Tier 1: fast bins.
        if nb <= params.max_fast() {
            let fb_idx = fastbin_index(nb);
            let fb = av.fastbin_addr(fb_idx);
            let victim = self.fastbin_pop(fb);
            if victim != 0 {
                if fastbin_index(chunksize(mem, victim)) != fb_idx {
                    malloc_printerr("malloc(): memory corruption (fast)");
                }
                // Prewarm the thread cache with further same-size chunks.
                if let Some(tc) = tcache.as_deref_mut() {
                    let tc_idx = csize2tidx(nb);
                    if tc_idx < params.tcache_bins() {
                        while tc.count(tc_idx) < params.tcache_count() {
                            let stash = self.fastbin_pop(fb);
                            if stash == 0 {
                                break;
                            }
                            tc.put(mem, stash, tc_idx);
                        }
                    }
                }
                let p = chunk2mem(victim);
                self.alloc_perturb(p, bytes);
                return Some(p);
            }
        }

        // Tier 2: exact-size small bins.
        let mut idx;
        if in_smallbin_range(nb) {
            idx = smallbin_index(nb);
            let bin = av.bin_at(idx);
            let victim = bk(mem, bin);
            if victim != bin {
                let bck = bk(mem, victim);
                if fd(mem, bck) != victim {
                    malloc_printerr("malloc(): smallbin double linked list corrupted");
                }
                set_inuse_bit_at_offset(mem, victim, nb);
                set_bk(mem, bin, bck);
                set_fd(mem, bck, bin);
                if !av.is_primary() {
                    set_non_main_arena(mem, victim);
                }
                if let Some(tc) = tcache.as_deref_mut() {
                    let tc_idx = csize2tidx(nb);
                    if tc_idx < params.tcache_bins() {
                        while tc.count(tc_idx) < params.tcache_count() {
                            let stash = bk(mem, bin);
                            if stash == bin {
                                break;
                            }
                            let stash_bck = bk(mem, stash);
                            set_inuse_bit_at_offset(mem, stash, nb);
                            if !av.is_primary() {
                                set_non_main_arena(mem, stash);
                            }
                            set_bk(mem, bin, stash_bck);
                            set_fd(mem, stash_bck, bin);
                            tc.put(mem, stash, tc_idx);
                        }
                    }
                }
                let p = chunk2mem(victim);
                self.alloc_perturb(p, bytes);
                return Some(p);
            }
        } else {
            idx = largebin_index(nb);
            if av.have_fastchunks(mem) {
                self.consolidate();
            }
        }

        let tc_idx = csize2tidx(nb);
        let mut return_cached = false;
        let mut tcache_unsorted_count = 0usize;

        loop {
            // Tier 3: drain the unsorted queue from the tail, binning what
            // does not fit exactly.
            let mut iters = 0usize;
            loop {
                let unsorted = av.unsorted();
                let victim = bk(mem, unsorted);
                if victim == unsorted {
                    break;
                }
                let bck = bk(mem, victim);
                let size = chunksize(mem, victim);
                let next = victim + size;

                if size <= 2 * SIZE_SZ || size > av.system_mem(mem) {
                    malloc_printerr("malloc(): invalid size (unsorted)");
                }
                let next_nomask = chunksize_nomask(mem, next);
                if next_nomask < 2 * SIZE_SZ || next_nomask > av.system_mem(mem) {
                    malloc_printerr("malloc(): invalid next size (unsorted)");
                }
                if prev_size(mem, next) & !SIZE_BITS != size {
                    malloc_printerr("malloc(): mismatching next->prev_size (unsorted)");
                }
                if fd(mem, bck) != victim || fd(mem, victim) != unsorted {
                    malloc_printerr("malloc(): unsorted double linked list corrupted");
                }
                if prev_inuse(mem, next) {
                    malloc_printerr("malloc(): invalid next->prev_inuse (unsorted)");
                }

                // Last-remainder locality path for small requests.
                if in_smallbin_range(nb)
                    && bck == unsorted
                    && victim == av.last_remainder(mem)
                    && size > nb + MINSIZE
                {
                    let remainder_size = size - nb;
                    let remainder = victim + nb;
                    set_bk(mem, unsorted, remainder);
                    set_fd(mem, unsorted, remainder);
                    av.set_last_remainder(mem, remainder);
                    set_bk(mem, remainder, unsorted);
                    set_fd(mem, remainder, unsorted);
                    if !in_smallbin_range(remainder_size) {
                        set_fd_nextsize(mem, remainder, 0);
                        set_bk_nextsize(mem, remainder, 0);
                    }
                    set_head(mem, victim, nb | PREV_INUSE | self.arena_bit());
                    set_head(mem, remainder, remainder_size | PREV_INUSE);
                    set_foot(mem, remainder, remainder_size);
                    let p = chunk2mem(victim);
                    self.alloc_perturb(p, bytes);
                    return Some(p);
                }

                if fd(mem, bck) != victim {
                    malloc_printerr("malloc(): corrupted unsorted chunks 3");
                }
                set_bk(mem, unsorted, bck);
                set_fd(mem, bck, unsorted);

                // Exact fit: stash in the thread cache while room remains,
                // otherwise take it now.
                if size == nb {
                    set_inuse_bit_at_offset(mem, victim, size);
                    if !av.is_primary() {
                        set_non_main_arena(mem, victim);
                    }
                    let mut stashed = false;
                    if let Some(tc) = tcache.as_deref_mut() {
                        if tc_idx < params.tcache_bins() && tc.count(tc_idx) < params.tcache_count()
                        {
                            tc.put(mem, victim, tc_idx);
                            return_cached = true;
                            stashed = true;
                        }
                    }
                    if !stashed {
                        let p = chunk2mem(victim);
                        self.alloc_perturb(p, bytes);
                        return Some(p);
                    }
                    continue;
                }

                // Bin the chunk.
                let victim_index;
                let link_bck;
                let link_fwd;
                if in_smallbin_range(size) {
                    victim_index = smallbin_index(size);
                    link_bck = av.bin_at(victim_index);
                    link_fwd = fd(mem, link_bck);
                } else {
                    victim_index = largebin_index(size);
                    let bin = av.bin_at(victim_index);
                    let size_key = size | PREV_INUSE;
                    if fd(mem, bin) != bin {
                        if size_key < chunksize_nomask(mem, bk(mem, bin)) {
                            // Smaller than the smallest: append at the tail.
                            let first = fd(mem, bin);
                            link_fwd = bin;
                            link_bck = bk(mem, bin);
                            set_fd_nextsize(mem, victim, first);
                            let last_rep = bk_nextsize(mem, first);
                            set_bk_nextsize(mem, victim, last_rep);
                            set_bk_nextsize(mem, first, victim);
                            set_fd_nextsize(mem, last_rep, victim);
                        } else {
                            let mut fwd = fd(mem, bin);
                            while size_key < chunksize_nomask(mem, fwd) {
                                fwd = fd_nextsize(mem, fwd);
                            }
                            if size_key == chunksize_nomask(mem, fwd) {
                                // Duplicate size: slot in behind the
                                // representative, skip ring untouched.
                                fwd = fd(mem, fwd);
                            } else {
                                set_fd_nextsize(mem, victim, fwd);
                                let prev_rep = bk_nextsize(mem, fwd);
                                set_bk_nextsize(mem, victim, prev_rep);
                                if fd_nextsize(mem, prev_rep) != fwd {
                                    malloc_printerr(
                                        "malloc(): largebin double linked list corrupted (nextsize)",
                                    );
                                }
                                set_bk_nextsize(mem, fwd, victim);
                                set_fd_nextsize(mem, prev_rep, victim);
                            }
                            link_bck = bk(mem, fwd);
                            if fd(mem, link_bck) != fwd {
                                malloc_printerr(
                                    "malloc(): largebin double linked list corrupted (bk)",
                                );
                            }
                            link_fwd = fwd;
                        }
                    } else {
                        set_fd_nextsize(mem, victim, victim);
                        set_bk_nextsize(mem, victim, victim);
                        link_bck = bin;
                        link_fwd = bin;
                    }
                }
                av.mark_bin(mem, victim_index);
                set_bk(mem, victim, link_bck);
                set_fd(mem, victim, link_fwd);
                set_bk(mem, link_fwd, victim);
                set_fd(mem, link_bck, victim);

                tcache_unsorted_count += 1;
                if return_cached
                    && params.tcache_unsorted_limit() > 0
                    && tcache_unsorted_count > params.tcache_unsorted_limit()
                {
                    if let Some(tc) = tcache.as_deref_mut() {
                        return Some(tc.get(mem, tc_idx));
                    }
                }

                iters += 1;
                if iters >= MAX_ITERS {
                    break;
                }
            }

            if return_cached {
                if let Some(tc) = tcache.as_deref_mut() {
                    return Some(tc.get(mem, tc_idx));
                }
            }

            // Tier 4: best fit from the request's own large bin.
            if !in_smallbin_range(nb) {
                let bin = av.bin_at(idx);
                let first = fd(mem, bin);
                if first != bin && chunksize_nomask(mem, first) >= nb {
                    // Walk representatives upward from the smallest size.
                    let mut victim = bk_nextsize(mem, first);
                    let mut size = chunksize(mem, victim);
                    while size < nb {
                        victim = bk_nextsize(mem, victim);
                        size = chunksize(mem, victim);
                    }
                    // Prefer a duplicate so the skip ring needs no rewiring.
                    if victim != bk(mem, bin)
                        && chunksize_nomask(mem, victim) == chunksize_nomask(mem, fd(mem, victim))
                    {
                        victim = fd(mem, victim);
                    }
                    let remainder_size = size - nb;
                    unlink_chunk(mem, victim);

                    if remainder_size < MINSIZE {
                        set_inuse_bit_at_offset(mem, victim, size);
                        if !av.is_primary() {
                            set_non_main_arena(mem, victim);
                        }
                    } else {
                        let remainder = victim + nb;
                        let bck = av.unsorted();
                        let fwd = fd(mem, bck);
                        if bk(mem, fwd) != bck {
                            malloc_printerr("malloc(): corrupted unsorted chunks");
                        }
                        set_bk(mem, remainder, bck);
                        set_fd(mem, remainder, fwd);
                        set_fd(mem, bck, remainder);
                        set_bk(mem, fwd, remainder);
                        if !in_smallbin_range(remainder_size) {
                            set_fd_nextsize(mem, remainder, 0);
                            set_bk_nextsize(mem, remainder, 0);
                        }
                        set_head(mem, victim, nb | PREV_INUSE | self.arena_bit());
                        set_head(mem, remainder, remainder_size | PREV_INUSE);
                        set_foot(mem, remainder, remainder_size);
                    }
                    let p = chunk2mem(victim);
                    self.alloc_perturb(p, bytes);
                    return Some(p);
                }
            }

            // Tier 5: binmap scan for the first non-empty larger bin.
            idx += 1;
            let mut bin = av.bin_at(idx);
            let mut block = idx / BITS_PER_MAP;
            let mut map = av.binmap(mem, block);
            let mut bit = 1usize.wrapping_shl((idx % BITS_PER_MAP) as u32);
            let mut scanned: Option<(usize, usize)> = None;
            'scan: loop {
                if bit > map || bit == 0 {
                    loop {
                        block += 1;
                        if block >= BINMAP_WORDS {
                            break 'scan; // nothing left; fall through to top
                        }
                        map = av.binmap(mem, block);
                        if map != 0 {
                            break;
                        }
                    }
                    bin = av.bin_at(block * BITS_PER_MAP);
                    bit = 1;
                }
                while bit & map == 0 {
                    bin = next_bin(bin);
                    bit = bit.wrapping_shl(1);
                }
                let victim = bk(mem, bin);
                if victim == bin {
                    // Stale map bit; clear it and move on.
                    map &= !bit;
                    av.set_binmap(mem, block, map);
                    bin = next_bin(bin);
                    bit = bit.wrapping_shl(1);
                } else {
                    scanned = Some((victim, chunksize(mem, victim)));
                    break 'scan;
                }
            }

            if let Some((victim, size)) = scanned {
                let remainder_size = size - nb;
                unlink_chunk(mem, victim);

                if remainder_size < MINSIZE {
                    set_inuse_bit_at_offset(mem, victim, size);
                    if !av.is_primary() {
                        set_non_main_arena(mem, victim);
                    }
                } else {
                    let remainder = victim + nb;
                    let bck = av.unsorted();
                    let fwd = fd(mem, bck);
                    if bk(mem, fwd) != bck {
                        malloc_printerr("malloc(): corrupted unsorted chunks 2");
                    }
                    set_bk(mem, remainder, bck);
                    set_fd(mem, remainder, fwd);
                    set_fd(mem, bck, remainder);
                    set_bk(mem, fwd, remainder);
                    if in_smallbin_range(nb) {
                        av.set_last_remainder(mem, remainder);
                    }
                    if !in_smallbin_range(remainder_size) {
                        set_fd_nextsize(mem, remainder, 0);
                        set_bk_nextsize(mem, remainder, 0);
                    }
                    set_head(mem, victim, nb | PREV_INUSE | self.arena_bit());
                    set_head(mem, remainder, remainder_size | PREV_INUSE);
                    set_foot(mem, remainder, remainder_size);
                }
                let p = chunk2mem(victim);
                self.alloc_perturb(p, bytes);
                return Some(p);
            }

            // Tier 6: the top chunk, then consolidation retry, then the OS.
            let victim = av.top(mem);
            let size = chunksize(mem, victim);
            if size > av.system_mem(mem) {
                malloc_printerr("malloc(): corrupted top size");
            }
            if size >= nb + MINSIZE {
                let remainder_size = size - nb;
                let remainder = victim + nb;
                av.set_top(mem, remainder);
                set_head(mem, victim, nb | PREV_INUSE | self.arena_bit());
                set_head(mem, remainder, remainder_size | PREV_INUSE);
                let p = chunk2mem(victim);
                self.alloc_perturb(p, bytes);
                return Some(p);
            } else if av.have_fastchunks(mem) {
                self.consolidate();
                idx = if in_smallbin_range(nb) {
                    smallbin_index(nb)
                } else {
                    largebin_index(nb)
                };
            } else {
                let p = self.sysmalloc(nb)?;
                self.alloc_perturb(p, bytes);
                return Some(p);
            }
        }
    }

    // =================================================================
    // Release
    // =================================================================

    /// Core release. `have_lock` says whether the caller already holds
    /// this arena's mutex; the fast-bin push never needs it.
    pub fn int_free(&self, mut tcache: Option<&mut Tcache>, p: usize, have_lock: bool) {
        let mem = self.mem();
        let av = self.av;
        let params = &self.sh.params;
        let mut size = chunksize(mem, p);

        if p > usize::MAX - size || misaligned_chunk(p) {
            malloc_printerr("free(): invalid pointer");
        }
        if size < MINSIZE || size & MALLOC_ALIGN_MASK != 0 {
            malloc_printerr("free(): invalid size");
        }

        if let Some(tc) = tcache.as_deref_mut() {
            let tc_idx = csize2tidx(size);
            if tc_idx < params.tcache_bins() {
                if tc.key_matches(mem, p) && tc.bucket_contains(mem, p, tc_idx) {
                    malloc_printerr("free(): double free detected in tcache 2");
                }
                if tc.count(tc_idx) < params.tcache_count() {
                    tc.put(mem, p, tc_idx);
                    return;
                }
            }
        }

        if size <= params.max_fast() {
            let next_nomask = chunksize_nomask(mem, p + size);
            if next_nomask <= 2 * SIZE_SZ || chunksize(mem, p + size) >= av.system_mem(mem) {
                // Re-test under the lock: a concurrent extension may have
                // moved system_mem.
                let fail = if have_lock {
                    true
                } else {
                    let arena = self.sh.arena(av.index);
                    let _guard = arena.lock();
                    chunksize_nomask(mem, p + size) <= 2 * SIZE_SZ
                        || chunksize(mem, p + size) >= av.system_mem(mem)
                };
                if fail {
                    malloc_printerr("free(): invalid next size (fast)");
                }
            }
            self.free_perturb(chunk2mem(p), size - 2 * SIZE_SZ);

            av.set_have_fastchunks(mem, true);
            let fb_idx = fastbin_index(size);
            let fb = av.fastbin_addr(fb_idx);
            let mut old = mem.read_acquire(fb);
            loop {
                if old == p {
                    malloc_printerr("double free or corruption (fasttop)");
                }
                set_fd_release(mem, p, old);
                match mem.cas(fb, old, p) {
                    Ok(_) => break,
                    Err(seen) => old = seen,
                }
            }
            if have_lock && old != 0 && fastbin_index(chunksize(mem, old)) != fb_idx {
                malloc_printerr("invalid fastbin entry (free)");
            }
            return;
        }

        if chunk_is_mmapped(mem, p) {
            munmap_chunk(self.sh, p);
            return;
        }

        let _guard = if have_lock {
            None
        } else {
            Some(self.sh.arena(av.index).lock())
        };

        let nextchunk = p + size;
        if p == av.top(mem) {
            malloc_printerr("double free or corruption (top)");
        }
        if av.contiguous(mem) && nextchunk >= av.top(mem) + chunksize(mem, av.top(mem)) {
            malloc_printerr("double free or corruption (out)");
        }
        if !prev_inuse(mem, nextchunk) {
            malloc_printerr("double free or corruption (!prev)");
        }
        let nextsize = chunksize(mem, nextchunk);
        if chunksize_nomask(mem, nextchunk) <= 2 * SIZE_SZ || nextsize >= av.system_mem(mem) {
            malloc_printerr("free(): invalid next size (normal)");
        }
        self.free_perturb(chunk2mem(p), size - 2 * SIZE_SZ);

        let mut p = p;
        if !prev_inuse(mem, p) {
            let prevsize = prev_size(mem, p);
            size += prevsize;
            p -= prevsize;
            if chunksize(mem, p) != prevsize {
                malloc_printerr("corrupted size vs. prev_size while consolidating");
            }
            unlink_chunk(mem, p);
        }

        if nextchunk != av.top(mem) {
            let nextinuse = inuse_bit_at_offset(mem, nextchunk, nextsize);
            if !nextinuse {
                unlink_chunk(mem, nextchunk);
                size += nextsize;
            } else {
                clear_inuse_bit_at_offset(mem, nextchunk, 0);
            }

            let bck = av.unsorted();
            let fwd = fd(mem, bck);
            if bk(mem, fwd) != bck {
                malloc_printerr("free(): corrupted unsorted chunks");
            }
            set_fd(mem, p, fwd);
            set_bk(mem, p, bck);
            if !in_smallbin_range(size) {
                set_fd_nextsize(mem, p, 0);
                set_bk_nextsize(mem, p, 0);
            }
            set_fd(mem, bck, p);
            set_bk(mem, fwd, p);
            set_head(mem, p, size | PREV_INUSE);
            set_foot(mem, p, size);
        } else {
            size += nextsize;
            set_head(mem, p, size | PREV_INUSE);
            av.set_top(mem, p);
        }

        if size >= FASTBIN_CONSOLIDATION_THRESHOLD {
            if av.have_fastchunks(mem) {
                self.consolidate();
            }
            if av.is_primary() {
                if chunksize(mem, av.top(mem)) >= params.trim_threshold() {
                    self.systrim(params.top_pad());
                }
            } else {
                self.heap_trim(heap_for_ptr(av.top(mem)), params.top_pad());
            }
        }
    }

    /// Detaches every fast bin and folds each chunk, coalesced with its
    /// free neighbors, into the unsorted queue or the top.
    pub fn consolidate(&self) {
        let mem = self.mem();
        let av = self.av;
        av.set_have_fastchunks(mem, false);
        let unsorted = av.unsorted();

        for fb_idx in 0..NFASTBINS {
            let fb = av.fastbin_addr(fb_idx);
            let mut p = mem.swap(fb, 0);
            while p != 0 {
                if fastbin_index(chunksize(mem, p)) != fb_idx {
                    malloc_printerr("malloc_consolidate(): invalid chunk size");
                }
                let nextp = fd(mem, p);

                let mut cp = p;
                let mut size = chunksize(mem, cp);
                let nextchunk = cp + size;
                let nextsize = chunksize(mem, nextchunk);

                if !prev_inuse(mem, cp) {
                    let prevsize = prev_size(mem, cp);
                    size += prevsize;
                    cp -= prevsize;
                    if chunksize(mem, cp) != prevsize {
                        malloc_printerr("corrupted size vs. prev_size in fastbins");
                    }
                    unlink_chunk(mem, cp);
                }

                if nextchunk != av.top(mem) {
                    let nextinuse = inuse_bit_at_offset(mem, nextchunk, nextsize);
                    if !nextinuse {
                        size += nextsize;
                        unlink_chunk(mem, nextchunk);
                    } else {
                        clear_inuse_bit_at_offset(mem, nextchunk, 0);
                    }

                    let first = fd(mem, unsorted);
                    set_fd(mem, unsorted, cp);
                    set_bk(mem, first, cp);
                    if !in_smallbin_range(size) {
                        set_fd_nextsize(mem, cp, 0);
                        set_bk_nextsize(mem, cp, 0);
                    }
                    set_head(mem, cp, size | PREV_INUSE);
                    set_bk(mem, cp, unsorted);
                    set_fd(mem, cp, first);
                    set_foot(mem, cp, size);
                } else {
                    size += nextsize;
                    set_head(mem, cp, size | PREV_INUSE);
                    av.set_top(mem, cp);
                }

                p = nextp;
            }
        }
    }

    // =================================================================
    // System acquisition
    // =================================================================

    /// Page-maps an isolated oversize chunk.
    fn sysmalloc_mmap(&self, nb: usize) -> Option<usize> {
        let mem = self.mem();
        let pagesize = mem.page_size();
        // One extra word of overhead: no successor exists whose prev_size
        // slot the payload could borrow.
        let size = align_up(nb + SIZE_SZ, pagesize);
        if size <= nb {
            return None;
        }
        let mm = mem.map(size, pagesize)?;
        // Mapped segments are page aligned, so the user pointer meets the
        // alignment quantum with no front correction.
        set_prev_size(mem, mm, 0);
        set_head(mem, mm, size | IS_MMAPPED);
        self.sh.params.note_mmap(size);
        Some(chunk2mem(mm))
    }

    /// Obtains memory from the system when the top cannot cover `nb`.
    pub fn sysmalloc(&self, nb: usize) -> Option<usize> {
        let mem = self.mem();
        let av = self.av;
        let params = &self.sh.params;
        let pagesize = mem.page_size();

        let mut tried_mmap = false;
        if nb >= params.mmap_threshold() && params.mmap_allowed() {
            tried_mmap = true;
            if let Some(p) = self.sysmalloc_mmap(nb) {
                return Some(p);
            }
        }

        let old_top = av.top(mem);
        let old_size = chunksize(mem, old_top);
        debug_assert!(old_size < nb + MINSIZE);

        if !av.is_primary() {
            // Extend the current heap, else chain a fresh one, else fall
            // back to an isolated mapping.
            let old_heap = heap_for_ptr(old_top);
            let old_heap_size = heap_size(mem, old_heap);
            if nb + MINSIZE > old_size && grow_heap(mem, old_heap, MINSIZE + nb - old_size) {
                av.add_system_mem(mem, heap_size(mem, old_heap) - old_heap_size);
                set_head(
                    mem,
                    old_top,
                    (old_heap + heap_size(mem, old_heap) - old_top) | PREV_INUSE,
                );
            } else if let Some(heap) =
                new_heap(mem, nb + MINSIZE + HEAP_HDR_BYTES, params.top_pad())
            {
                set_heap_arena_index(mem, heap, av.index);
                set_heap_prev(mem, heap, old_heap);
                let committed = heap_size(mem, heap);
                av.add_system_mem(mem, committed);
                let top = heap + HEAP_HDR_BYTES;
                av.set_top(mem, top);
                set_head(mem, top, (committed - HEAP_HDR_BYTES) | PREV_INUSE);

                // Close the old top with a fencepost pair and release what
                // remains through the normal path.
                let fence = (old_size - MINSIZE) & !MALLOC_ALIGN_MASK;
                set_head(mem, old_top + fence + 2 * SIZE_SZ, PREV_INUSE);
                if fence >= MINSIZE {
                    set_head(mem, old_top + fence, (2 * SIZE_SZ) | PREV_INUSE);
                    set_foot(mem, old_top + fence, 2 * SIZE_SZ);
                    set_head(mem, old_top, fence | PREV_INUSE | NON_MAIN_ARENA);
                    self.int_free(None, old_top, true);
                } else {
                    set_head(mem, old_top, (fence + 2 * SIZE_SZ) | PREV_INUSE);
                    set_foot(mem, old_top, fence + 2 * SIZE_SZ);
                }
            } else if !tried_mmap {
                if let Some(p) = self.sysmalloc_mmap(nb) {
                    return Some(p);
                }
            }
        } else {
            let old_end = old_top + old_size;
            let mut size = nb + params.top_pad() + MINSIZE;
            if av.contiguous(mem) {
                size -= old_size;
            }
            size = align_up(size, pagesize);

            let mut brk = mem.morecore(size as isize);
            let mut snd_brk = None;
            if brk.is_some() {
                self.sh.hooks.fire_after_morecore();
            } else {
                // The contiguous primitive is exhausted; page-map a large
                // unit and abandon contiguity.
                let mut msize = if av.contiguous(mem) {
                    align_up(size + old_size, pagesize)
                } else {
                    size
                };
                msize = msize.max(MMAP_AS_MORECORE_SIZE);
                if msize > nb {
                    if let Some(base) = mem.map(msize, pagesize) {
                        brk = Some(base);
                        snd_brk = Some(base + msize);
                        av.set_noncontiguous(mem);
                        size = msize;
                    }
                }
            }

            let brk = brk?;
            av.add_system_mem(mem, size);

            if brk == old_end && snd_brk.is_none() {
                // The extension abuts the old top; just widen it.
                set_head(mem, old_top, (size + old_size) | PREV_INUSE);
            } else if av.contiguous(mem) && old_size != 0 && brk < old_end {
                malloc_printerr("break adjusted to free malloc space");
            } else {
                let end = match snd_brk {
                    Some(e) => e,
                    None => mem.morecore(0)?,
                };
                av.set_top(mem, brk);
                set_head(mem, brk, (end - brk) | PREV_INUSE);

                if old_size != 0 {
                    // Insert a double fencepost at the old top so nothing
                    // coalesces across the gap.
                    let fence = (old_size - 4 * SIZE_SZ) & !MALLOC_ALIGN_MASK;
                    set_head(mem, old_top, fence | PREV_INUSE);
                    set_head(mem, old_top + fence, (2 * SIZE_SZ) | PREV_INUSE);
                    set_head(mem, old_top + fence + 2 * SIZE_SZ, (2 * SIZE_SZ) | PREV_INUSE);
                    if fence >= MINSIZE {
                        self.int_free(None, old_top, true);
                    }
                }
            }
        }

        let p = av.top(mem);
        let size = chunksize(mem, p);
        if size >= nb + MINSIZE {
            let remainder_size = size - nb;
            let remainder = p + nb;
            av.set_top(mem, remainder);
            set_head(mem, p, nb | PREV_INUSE | self.arena_bit());
            set_head(mem, remainder, remainder_size | PREV_INUSE);
            return Some(chunk2mem(p));
        }
        None
    }

    // =================================================================
    // Trim
    // =================================================================

    /// Returns the tail of the primary top to the system via negative
    /// extension. True when anything was released.
    pub fn systrim(&self, pad: usize) -> bool {
        let mem = self.mem();
        let av = self.av;
        let pagesize = mem.page_size();
        let top = av.top(mem);
        let top_size = chunksize(mem, top);

        let top_area = match top_size.checked_sub(MINSIZE + 1) {
            Some(a) if a > pad => a,
            _ => return false,
        };
        let extra = (top_area - pad) & !(pagesize - 1);
        if extra == 0 {
            return false;
        }

        // Only trim when the break still sits where this arena left it;
        // anything else means a foreign actor moved it.
        let current_brk = match mem.morecore(0) {
            Some(b) => b,
            None => return false,
        };
        if current_brk != top + top_size {
            return false;
        }

        let _ = mem.morecore(-(extra as isize));
        self.sh.hooks.fire_after_morecore();
        let new_brk = match mem.morecore(0) {
            Some(b) => b,
            None => return false,
        };
        let released = current_brk - new_brk;
        if released == 0 {
            return false;
        }
        av.sub_system_mem(mem, released);
        set_head(mem, top, (top_size - released) | PREV_INUSE);
        true
    }

    /// Unmaps whole trailing heaps the top covers, then shrinks the
    /// committed span of the heap the top lands in.
    pub fn heap_trim(&self, mut heap: usize, pad: usize) -> bool {
        let mem = self.mem();
        let av = self.av;
        let pagesize = mem.page_size();
        let mut top = av.top(mem);

        // A heap whose only content is the top chunk can go away entirely:
        // the fencepost pair closing the previous heap becomes the new top.
        while top == heap + HEAP_HDR_BYTES {
            let prev = heap_prev(mem, heap);
            if prev == 0 {
                break;
            }
            let prev_committed = heap_size(mem, prev);
            let fence2 = prev + prev_committed - (MINSIZE - 2 * SIZE_SZ);
            let misalign = fence2 & MALLOC_ALIGN_MASK;
            let fence2 = fence2 - misalign;
            if chunksize_nomask(mem, fence2) != PREV_INUSE {
                break;
            }
            let fence1 = fence2 - prev_size(mem, fence2);
            let mut new_size = chunksize(mem, fence1) + (MINSIZE - 2 * SIZE_SZ) + misalign;
            let mut p = fence1;
            if !prev_inuse(mem, p) {
                new_size += prev_size(mem, p);
            }
            if new_size + (crate::arena::HEAP_MAX_SIZE - prev_committed) < pad + MINSIZE + pagesize
            {
                break;
            }

            av.sub_system_mem(mem, heap_size(mem, heap));
            delete_heap(mem, heap);
            heap = prev;
            if !prev_inuse(mem, p) {
                p -= prev_size(mem, p);
                unlink_chunk(mem, p);
            }
            av.set_top(mem, p);
            set_head(mem, p, new_size | PREV_INUSE);
            top = p;
        }

        let top_size = chunksize(mem, top);
        let top_area = match top_size.checked_sub(MINSIZE + 1) {
            Some(a) if a > pad => a,
            _ => return false,
        };
        let extra = (top_area - pad) & !(pagesize - 1);
        if extra == 0 {
            return false;
        }
        shrink_heap(mem, heap, extra);
        av.sub_system_mem(mem, extra);
        set_head(mem, top, (top_size - extra) | PREV_INUSE);
        true
    }

    /// Public-trim worker: consolidates, advises whole free pages inside
    /// bins, and trims the primary top.
    pub fn mtrim(&self, pad: usize) -> bool {
        let mem = self.mem();
        let av = self.av;
        self.consolidate();

        let pagesize = mem.page_size();
        let psm1 = pagesize - 1;
        let psindex = bin_index(pagesize);
        let mut result = false;

        for i in 1..NBINS {
            if i != 1 && i < psindex {
                continue;
            }
            let bin = av.bin_at(i);
            let mut p = bk(mem, bin);
            while p != bin {
                let size = chunksize(mem, p);
                if size > psm1 + CHUNK_OVERLAY {
                    // Advise only whole pages strictly inside the chunk,
                    // keeping the bookkeeping overlay resident.
                    let paligned = (p + CHUNK_OVERLAY + psm1) & !psm1;
                    let span = size - (paligned - p);
                    if span > psm1 {
                        mem.advise_dontneed(paligned, span & !psm1);
                        result = true;
                    }
                }
                p = bk(mem, p);
            }
        }

        if av.is_primary() {
            result |= self.systrim(pad);
        }
        result
    }

    // =================================================================
    // Reallocate / aligned allocate
    // =================================================================

    /// Resizes a non-mapped chunk under the arena lock.
    pub fn int_realloc(&self, oldp: usize, oldsize: usize, nb: usize) -> Option<usize> {
        let mem = self.mem();
        let av = self.av;

        if chunksize_nomask(mem, oldp) <= 2 * SIZE_SZ || oldsize >= av.system_mem(mem) {
            malloc_printerr("realloc(): invalid old size");
        }

        let next = oldp + oldsize;
        let nextsize = chunksize(mem, next);
        if chunksize_nomask(mem, next) <= 2 * SIZE_SZ || nextsize >= av.system_mem(mem) {
            malloc_printerr("realloc(): invalid next size");
        }

        let newp;
        let newsize;
        if oldsize >= nb {
            // Already big enough; the tail splits off below.
            newp = oldp;
            newsize = oldsize;
        } else if next == av.top(mem) && oldsize + nextsize >= nb + MINSIZE {
            // Expand into the top.
            set_head_size(mem, oldp, nb | self.arena_bit());
            av.set_top(mem, oldp + nb);
            set_head(mem, oldp + nb, (oldsize + nextsize - nb) | PREV_INUSE);
            return Some(chunk2mem(oldp));
        } else if next != av.top(mem)
            && !inuse_bit_at_offset(mem, next, nextsize)
            && oldsize + nextsize >= nb
        {
            // Absorb the free successor.
            newp = oldp;
            newsize = oldsize + nextsize;
            unlink_chunk(mem, next);
        } else {
            // Allocate, copy, release.
            let newmem = self.int_malloc(None, nb - MALLOC_ALIGN_MASK)?;
            let candidate = mem2chunk(newmem);
            if candidate == next {
                // The new chunk landed right after the old one; merge
                // instead of copying.
                newsize = chunksize(mem, candidate) + oldsize;
                newp = oldp;
            } else {
                mem.copy_bytes(chunk2mem(oldp), newmem, oldsize - SIZE_SZ);
                self.int_free(None, oldp, true);
                return Some(newmem);
            }
        }

        debug_assert!(newsize >= nb);
        let remainder_size = newsize - nb;
        if remainder_size < MINSIZE {
            set_head_size(mem, newp, newsize | self.arena_bit());
            set_inuse_bit_at_offset(mem, newp, newsize);
        } else {
            let remainder = newp + nb;
            set_head_size(mem, newp, nb | self.arena_bit());
            set_head(mem, remainder, remainder_size | PREV_INUSE | self.arena_bit());
            set_inuse_bit_at_offset(mem, remainder, remainder_size);
            self.int_free(None, remainder, true);
        }
        Some(chunk2mem(newp))
    }

    /// Aligned allocation: over-allocate, slide to an aligned spot, and
    /// release the leading and trailing slack as ordinary free chunks.
    pub fn int_memalign(&self, alignment: usize, bytes: usize) -> Option<usize> {
        let mem = self.mem();
        let nb = checked_request2size(bytes)?;

        // Worst-case padding to guarantee an aligned spot plus a leader;
        // a wrapping sum fails the padded-size check inside.
        let worst = nb.saturating_add(alignment).saturating_add(MINSIZE);
        let m = self.int_malloc(None, worst)?;
        let mut p = mem2chunk(m);

        if m % alignment != 0 {
            // Find an aligned spot inside the chunk, leaving room for a
            // leader of at least MINSIZE.
            let aligned_mem = (m + alignment - 1) & !(alignment - 1);
            let mut brk = mem2chunk(aligned_mem);
            if brk - p < MINSIZE {
                brk += alignment;
            }
            let newp = brk;
            let leadsize = brk - p;
            let newsize = chunksize(mem, p) - leadsize;

            if chunk_is_mmapped(mem, p) {
                set_prev_size(mem, newp, prev_size(mem, p) + leadsize);
                set_head(mem, newp, newsize | IS_MMAPPED);
                return Some(chunk2mem(newp));
            }

            set_head(mem, newp, newsize | PREV_INUSE | self.arena_bit());
            set_inuse_bit_at_offset(mem, newp, newsize);
            set_head_size(mem, p, leadsize);
            self.int_free(None, p, true);
            p = newp;
        }

        if !chunk_is_mmapped(mem, p) {
            let size = chunksize(mem, p);
            if size > nb + MINSIZE {
                let remainder_size = size - nb;
                let remainder = p + nb;
                set_head(mem, remainder, remainder_size | PREV_INUSE | self.arena_bit());
                set_head_size(mem, p, nb);
                self.int_free(None, remainder, true);
            }
        }
        Some(chunk2mem(p))
    }
}

/// Releases an isolated page-mapped chunk back to the system.
pub(crate) fn munmap_chunk(sh: &Shared, p: usize) {
    let mem = &sh.mem;
    let pagesize = mem.page_size();
    let size = chunksize(mem, p);
    let offset = prev_size(mem, p);
    let block = p - offset;
    let total_size = offset + size;
    let user = chunk2mem(p) & (pagesize - 1);

    if (block | total_size) & (pagesize - 1) != 0 || user & user.wrapping_sub(1) != 0 {
        malloc_printerr("munmap_chunk(): invalid pointer");
    }

    sh.params.note_munmap(total_size);
    if !mem.unmap(block, total_size) {
        malloc_printerr("munmap_chunk(): invalid pointer");
    }
}
