//! Arena state block.
//!
//! Each arena's bookkeeping lives inside its own memory as a block of
//! words: flags, the `have_fastchunks` hint, the fast-bin heads, the top
//! and last-remainder pointers, the 127-bin table of (fd, bk) pairs, the
//! binmap, and the system-memory counters. A bin header is addressed as a
//! pseudo-chunk two words before its fd slot, so ring links through bins
//! and chunks use identical accessors.
//!
//! The primary arena's block sits in a small dedicated mapping; a
//! non-primary arena's block sits at the start of its first heap.

use crate::chunk::{SIZE_SZ, set_bk, set_fd};
use crate::size_class::{BINMAP_WORDS, BITS_PER_MAP, NBINS, NFASTBINS};
use crate::sys::{SystemMemory, WORD_SIZE};

const FLAGS: usize = 0;
const HAVE_FASTCHUNKS: usize = 1;
const FASTBINS: usize = 2;
const TOP: usize = FASTBINS + NFASTBINS;
const LAST_REMAINDER: usize = TOP + 1;
const BINS: usize = LAST_REMAINDER + 1;
const BINMAP: usize = BINS + (NBINS - 1) * 2;
const SYSTEM_MEM: usize = BINMAP + BINMAP_WORDS;
const MAX_SYSTEM_MEM: usize = SYSTEM_MEM + 1;

/// Words in one arena state block.
pub const STATE_WORDS: usize = MAX_SYSTEM_MEM + 1;

/// Bytes in one arena state block (a multiple of the alignment quantum).
pub const STATE_BYTES: usize = STATE_WORDS * WORD_SIZE;

/// The arena's contiguous-heap assumption has been abandoned.
const NONCONTIGUOUS_BIT: usize = 0x1;

/// Handle to one arena's state block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArenaState {
    /// Address of the state block.
    pub base: usize,
    /// Arena number; 0 is the primary arena.
    pub index: usize,
}

impl ArenaState {
    #[inline]
    fn word(self, off: usize) -> usize {
        self.base + off * WORD_SIZE
    }

    #[inline]
    pub fn is_primary(self) -> bool {
        self.index == 0
    }

    /// Initializes bins to empty rings and the top to the bin-1 pseudo
    /// chunk, so the first allocation takes the system path.
    pub fn init(self, mem: &SystemMemory) {
        mem.write(self.word(FLAGS), if self.is_primary() { 0 } else { NONCONTIGUOUS_BIT });
        mem.write(self.word(HAVE_FASTCHUNKS), 0);
        for i in 0..NFASTBINS {
            mem.write(self.word(FASTBINS + i), 0);
        }
        for i in 1..NBINS {
            let b = self.bin_at(i);
            set_fd(mem, b, b);
            set_bk(mem, b, b);
        }
        for i in 0..BINMAP_WORDS {
            mem.write(self.word(BINMAP + i), 0);
        }
        mem.write(self.word(LAST_REMAINDER), 0);
        mem.write(self.word(SYSTEM_MEM), 0);
        mem.write(self.word(MAX_SYSTEM_MEM), 0);
        self.set_top(mem, self.initial_top());
    }

    // -- flags ---------------------------------------------------------

    pub fn contiguous(self, mem: &SystemMemory) -> bool {
        mem.read(self.word(FLAGS)) & NONCONTIGUOUS_BIT == 0
    }

    pub fn set_noncontiguous(self, mem: &SystemMemory) {
        let v = mem.read(self.word(FLAGS));
        mem.write(self.word(FLAGS), v | NONCONTIGUOUS_BIT);
    }

    pub fn have_fastchunks(self, mem: &SystemMemory) -> bool {
        mem.read(self.word(HAVE_FASTCHUNKS)) != 0
    }

    pub fn set_have_fastchunks(self, mem: &SystemMemory, value: bool) {
        mem.write(self.word(HAVE_FASTCHUNKS), usize::from(value));
    }

    // -- fast bins -----------------------------------------------------

    /// Address of the fast-bin head word for CAS operations.
    #[inline]
    pub fn fastbin_addr(self, idx: usize) -> usize {
        self.word(FASTBINS + idx)
    }

    // -- top and last remainder ---------------------------------------

    #[inline]
    pub fn top(self, mem: &SystemMemory) -> usize {
        mem.read(self.word(TOP))
    }

    #[inline]
    pub fn set_top(self, mem: &SystemMemory, p: usize) {
        mem.write(self.word(TOP), p);
    }

    /// The placeholder top before the first extension.
    #[inline]
    pub fn initial_top(self) -> usize {
        self.unsorted()
    }

    #[inline]
    pub fn last_remainder(self, mem: &SystemMemory) -> usize {
        mem.read(self.word(LAST_REMAINDER))
    }

    #[inline]
    pub fn set_last_remainder(self, mem: &SystemMemory, p: usize) {
        mem.write(self.word(LAST_REMAINDER), p);
    }

    // -- bins ----------------------------------------------------------

    /// Pseudo-chunk address of bin `i` (1-based; bin 1 is unsorted).
    #[inline]
    pub fn bin_at(self, i: usize) -> usize {
        self.word(BINS + (i - 1) * 2) - 2 * SIZE_SZ
    }

    /// The unsorted staging queue.
    #[inline]
    pub fn unsorted(self) -> usize {
        self.bin_at(1)
    }

    // -- binmap --------------------------------------------------------

    #[inline]
    fn binmap_word(self, block: usize) -> usize {
        self.word(BINMAP + block)
    }

    pub fn mark_bin(self, mem: &SystemMemory, i: usize) {
        let addr = self.binmap_word(i / BITS_PER_MAP);
        let v = mem.read(addr);
        mem.write(addr, v | (1usize << (i % BITS_PER_MAP)));
    }

    pub fn unmark_bin(self, mem: &SystemMemory, i: usize) {
        let addr = self.binmap_word(i / BITS_PER_MAP);
        let v = mem.read(addr);
        mem.write(addr, v & !(1usize << (i % BITS_PER_MAP)));
    }

    pub fn binmap(self, mem: &SystemMemory, block: usize) -> usize {
        mem.read(self.binmap_word(block))
    }

    /// Write-through of a whole binmap word during bit-scan cleanup.
    pub fn set_binmap(self, mem: &SystemMemory, block: usize, value: usize) {
        mem.write(self.binmap_word(block), value);
    }

    pub fn get_binmap(self, mem: &SystemMemory, i: usize) -> bool {
        self.binmap(mem, i / BITS_PER_MAP) & (1usize << (i % BITS_PER_MAP)) != 0
    }

    // -- counters ------------------------------------------------------

    #[inline]
    pub fn system_mem(self, mem: &SystemMemory) -> usize {
        mem.read(self.word(SYSTEM_MEM))
    }

    pub fn add_system_mem(self, mem: &SystemMemory, delta: usize) {
        let v = self.system_mem(mem) + delta;
        mem.write(self.word(SYSTEM_MEM), v);
        if v > mem.read(self.word(MAX_SYSTEM_MEM)) {
            mem.write(self.word(MAX_SYSTEM_MEM), v);
        }
    }

    pub fn sub_system_mem(self, mem: &SystemMemory, delta: usize) {
        let v = self.system_mem(mem).saturating_sub(delta);
        mem.write(self.word(SYSTEM_MEM), v);
    }

    pub fn max_system_mem(self, mem: &SystemMemory) -> usize {
        mem.read(self.word(MAX_SYSTEM_MEM))
    }
}

/// The bin header following `b` in the flat table.
#[inline]
pub fn next_bin(b: usize) -> usize {
    b + 2 * SIZE_SZ
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{bk, fd};
    use crate::sys::{SystemConfig, SystemMemory, align_up};

    fn fresh_state() -> (SystemMemory, ArenaState) {
        let mem = SystemMemory::new(SystemConfig::default());
        let base = mem
            .map(align_up(STATE_BYTES, 4096), 4096)
            .expect("state mapping");
        let av = ArenaState { base, index: 0 };
        av.init(&mem);
        (mem, av)
    }

    #[test]
    fn init_builds_empty_rings() {
        let (mem, av) = fresh_state();
        for i in 1..NBINS {
            let b = av.bin_at(i);
            assert_eq!(fd(&mem, b), b, "bin {i} fd must self-link");
            assert_eq!(bk(&mem, b), b, "bin {i} bk must self-link");
        }
        assert_eq!(av.top(&mem), av.initial_top());
        assert!(av.contiguous(&mem));
        assert!(!av.have_fastchunks(&mem));
    }

    #[test]
    fn bin_headers_are_adjacent_pseudo_chunks() {
        let (_mem, av) = fresh_state();
        let b1 = av.bin_at(1);
        let b2 = av.bin_at(2);
        assert_eq!(next_bin(b1), b2);
        assert_eq!(av.unsorted(), b1);
    }

    #[test]
    fn binmap_marks_and_scans() {
        let (mem, av) = fresh_state();
        av.mark_bin(&mem, 65);
        assert!(av.get_binmap(&mem, 65));
        assert_eq!(av.binmap(&mem, 65 / BITS_PER_MAP), 1 << (65 % BITS_PER_MAP));
        av.unmark_bin(&mem, 65);
        assert!(!av.get_binmap(&mem, 65));
    }

    #[test]
    fn system_mem_tracks_peak() {
        let (mem, av) = fresh_state();
        av.add_system_mem(&mem, 4096);
        av.add_system_mem(&mem, 4096);
        av.sub_system_mem(&mem, 8192);
        assert_eq!(av.system_mem(&mem), 0);
        assert_eq!(av.max_system_mem(&mem), 8192);
    }

    #[test]
    fn non_primary_arena_starts_noncontiguous() {
        let mem = SystemMemory::new(SystemConfig::default());
        let base = mem.map(4096, 4096).expect("map");
        let av = ArenaState { base, index: 3 };
        av.init(&mem);
        assert!(!av.contiguous(&mem));
        assert!(!av.is_primary());
    }
}
