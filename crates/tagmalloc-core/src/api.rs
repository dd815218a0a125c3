//! Public entry wrappers.
//!
//! [`MallocContext`] owns one allocator instance; [`ThreadContext`] is a
//! per-thread handle carrying the thread cache and the arena affinity.
//! Entries follow one discipline: consult hooks, validate the request,
//! try the thread cache before any lock, acquire an arena, delegate to
//! the engine, and retry once on a different arena before reporting
//! exhaustion.
//!
//! Addresses returned here are real word-aligned addresses inside the
//! context's segments; callers that need raw pointers cast them directly.

use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::allocator::{Engine, munmap_chunk};
use crate::arena::{ArenaGuard, Shared};
use crate::chunk::{
    MALLOC_ALIGNMENT, MINSIZE, SIZE_SZ, checked_request2size, chunk_is_mmapped, chunksize, inuse,
    mem2chunk, misaligned_chunk, request2size,
};
use crate::error::AllocError;
use crate::fatal::malloc_printerr;
use crate::hooks::HookTable;
use crate::params::{MallocParams, TuneParam};
use crate::size_class::{MAX_FAST_SIZE, csize2tidx, round_max_fast, tidx2usize};
use crate::sys::{DEFAULT_BRK_RESERVE, SystemConfig};
use crate::tcache::Tcache;
use crate::trace::TraceEvent;

/// Construction-time configuration of one allocator context.
#[derive(Debug, Clone, Copy)]
pub struct MallocConfig {
    /// Bytes reserved for each contiguous primary-heap segment.
    pub brk_reserve: usize,
    /// Total byte budget for the context; `usize::MAX` means unlimited.
    pub byte_limit: usize,
    /// Start with lifecycle tracing enabled.
    pub trace: bool,
    /// Apply `TAGMALLOC_*` environment overrides to the parameters.
    pub read_env: bool,
}

impl Default for MallocConfig {
    fn default() -> Self {
        Self {
            brk_reserve: DEFAULT_BRK_RESERVE,
            byte_limit: usize::MAX,
            trace: false,
            read_env: true,
        }
    }
}

/// Counters describing a context's footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Live arenas (primary included).
    pub arenas: usize,
    /// Sum of per-arena system memory.
    pub system_bytes: usize,
    /// Peak of the per-arena system memory sums.
    pub peak_system_bytes: usize,
    /// Bytes in live individual page mappings.
    pub mapped_bytes: usize,
    /// Count of live individual page mappings.
    pub mapped_count: usize,
    /// Bytes currently reserved from the substrate.
    pub held_bytes: usize,
    /// Bytes notionally returned via trim or advise.
    pub advised_bytes: usize,
}

/// Holds every arena mutex of a context, in list order. Exists so a
/// process can serialize allocator state across `fork`.
pub struct ForkGuard {
    guards: Vec<ArenaGuard>,
}

impl ForkGuard {
    /// Arenas covered by this guard.
    pub fn arena_count(&self) -> usize {
        self.guards.len()
    }
}

/// One allocator instance.
pub struct MallocContext {
    sh: Arc<Shared>,
}

impl Default for MallocContext {
    fn default() -> Self {
        Self::new()
    }
}

impl MallocContext {
    pub fn new() -> Self {
        Self::with_config(MallocConfig::default())
    }

    pub fn with_config(config: MallocConfig) -> Self {
        let params = if config.read_env {
            MallocParams::from_env()
        } else {
            MallocParams::default()
        };
        let sys = SystemConfig {
            brk_reserve: config.brk_reserve,
            limit: config.byte_limit,
        };
        Self {
            sh: Arc::new(Shared::new(sys, params, config.trace)),
        }
    }

    /// A handle for the calling thread. Carries the thread cache; dropping
    /// it flushes the cache through the normal release path.
    pub fn thread(&self) -> ThreadContext {
        let key = self.sh.tcache_key_seq.fetch_add(1, Ordering::Relaxed);
        ThreadContext {
            sh: Arc::clone(&self.sh),
            tcache: RefCell::new(Tcache::new(key)),
            arena_hint: Cell::new(None),
            attached: Cell::new(None),
        }
    }

    /// Installs the hook table, returning the previous one.
    pub fn install_hooks(&self, table: HookTable) -> HookTable {
        self.sh.hooks.install(table)
    }

    /// Trims every arena: consolidate, advise free pages, shrink the
    /// primary top. True when anything was released.
    pub fn trim(&self, pad: usize) -> bool {
        let mut result = false;
        for index in 0..self.sh.arena_count() {
            let arena = self.sh.arena(index);
            let _guard = arena.lock();
            result |= Engine::new(&self.sh, arena.state).mtrim(pad);
        }
        self.sh.trace.record("trim", "context", None, Some(pad), None);
        result
    }

    /// The tuning surface. Mirrors the classical semantics: every call
    /// first consolidates the primary arena under its lock.
    pub fn tune(&self, param: TuneParam, value: usize) -> Result<(), AllocError> {
        let main = self.sh.main_arena();
        let _guard = main.lock();
        Engine::new(&self.sh, main.state).consolidate();
        let params = &self.sh.params;
        match param {
            TuneParam::FastCeiling => {
                if value > MAX_FAST_SIZE {
                    return Err(AllocError::InvalidTuning);
                }
                params
                    .global_max_fast
                    .store(round_max_fast(value), Ordering::Relaxed);
            }
            TuneParam::TrimThreshold => {
                params.trim_threshold.store(value, Ordering::Relaxed);
                params.no_dyn_threshold.store(true, Ordering::Relaxed);
            }
            TuneParam::TopPad => {
                params.top_pad.store(value, Ordering::Relaxed);
            }
            TuneParam::MmapThreshold => {
                params.mmap_threshold.store(value, Ordering::Relaxed);
                params.no_dyn_threshold.store(true, Ordering::Relaxed);
            }
            TuneParam::MmapMax => {
                params.n_mmaps_max.store(value, Ordering::Relaxed);
            }
            TuneParam::Perturb => {
                params.perturb_byte.store(value & 0xff, Ordering::Relaxed);
            }
            TuneParam::ArenaTest => {
                if value == 0 {
                    return Err(AllocError::InvalidTuning);
                }
                params.arena_test.store(value, Ordering::Relaxed);
            }
            TuneParam::ArenaMax => {
                if value == 0 {
                    return Err(AllocError::InvalidTuning);
                }
                params.arena_max.store(value, Ordering::Relaxed);
            }
            TuneParam::TcacheCount => {
                if value > u16::MAX as usize {
                    return Err(AllocError::InvalidTuning);
                }
                params.tcache_count.store(value, Ordering::Relaxed);
            }
            TuneParam::TcacheMax => {
                if value > tidx2usize(crate::size_class::TCACHE_MAX_BINS - 1) {
                    return Err(AllocError::InvalidTuning);
                }
                let bins = csize2tidx(request2size(value)) + 1;
                params.tcache_bins.store(bins, Ordering::Relaxed);
            }
            TuneParam::TcacheUnsortedLimit => {
                params
                    .tcache_unsorted_limit
                    .store(value, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Acquires every arena mutex in list order (pre-fork discipline).
    /// Dropping the guard releases them (post-fork in the parent).
    pub fn lock_all_arenas(&self) -> ForkGuard {
        ForkGuard {
            guards: self.sh.lock_all(),
        }
    }

    pub fn set_trace_enabled(&self, on: bool) {
        self.sh.trace.set_enabled(on);
    }

    /// Drains collected lifecycle events.
    pub fn trace_events(&self) -> Vec<TraceEvent> {
        self.sh.trace.drain()
    }

    /// Caps the substrate byte budget (out-of-memory injection).
    pub fn set_memory_limit(&self, bytes: usize) {
        self.sh.mem.set_limit(bytes);
    }

    pub fn stats(&self) -> AllocatorStats {
        let mut system_bytes = 0;
        let mut peak_system_bytes = 0;
        let arenas = self.sh.arena_count();
        for index in 0..arenas {
            let arena = self.sh.arena(index);
            system_bytes += arena.state.system_mem(&self.sh.mem);
            peak_system_bytes += arena.state.max_system_mem(&self.sh.mem);
        }
        AllocatorStats {
            arenas,
            system_bytes,
            peak_system_bytes,
            mapped_bytes: self.sh.params.mmapped_mem.load(Ordering::Relaxed),
            mapped_count: self.sh.params.n_mmaps.load(Ordering::Relaxed),
            held_bytes: self.sh.mem.held_bytes(),
            advised_bytes: self.sh.mem.advised_bytes(),
        }
    }

    /// Whether the chunk behind a returned pointer is an isolated page
    /// mapping.
    pub fn chunk_is_mapped(&self, ptr: usize) -> bool {
        chunk_is_mmapped(&self.sh.mem, mem2chunk(ptr))
    }

    /// Chunk capacity behind a returned pointer, header excluded.
    pub fn usable_size(&self, ptr: usize) -> usize {
        usable_size_impl(&self.sh, ptr)
    }

    /// Writes caller data into an allocation (test and FFI support).
    pub fn write_bytes(&self, ptr: usize, data: &[u8]) {
        self.sh.mem.write_bytes(ptr, data);
    }

    /// Reads allocation content (test and FFI support).
    pub fn read_bytes(&self, ptr: usize, buf: &mut [u8]) {
        self.sh.mem.read_bytes(ptr, buf);
    }
}

fn usable_size_impl(sh: &Shared, ptr: usize) -> usize {
    if ptr == 0 {
        return 0;
    }
    let p = mem2chunk(ptr);
    if chunk_is_mmapped(&sh.mem, p) {
        chunksize(&sh.mem, p) - 2 * SIZE_SZ
    } else if inuse(&sh.mem, p) {
        chunksize(&sh.mem, p) - SIZE_SZ
    } else {
        0
    }
}

/// Per-thread allocator handle.
pub struct ThreadContext {
    sh: Arc<Shared>,
    tcache: RefCell<Tcache>,
    arena_hint: Cell<Option<usize>>,
    attached: Cell<Option<usize>>,
}

impl ThreadContext {
    fn note_arena(&self, index: usize) {
        if self.attached.get() != Some(index) {
            if let Some(old) = self.attached.get() {
                self.sh.detach_thread(old);
            }
            self.sh.attach_thread(index);
            self.attached.set(Some(index));
        }
        self.arena_hint.set(Some(index));
    }

    fn acquire_arena(&self, bytes: usize) -> (Arc<crate::arena::Arena>, ArenaGuard) {
        let (arena, guard) = self.sh.arena_get(self.arena_hint.get(), bytes);
        self.note_arena(arena.index);
        (arena, guard)
    }

    /// The engine path shared by allocate and the zeroing allocate:
    /// thread cache first, then an arena with one retry.
    fn allocate_engine(&self, bytes: usize) -> Result<usize, AllocError> {
        let nb = checked_request2size(bytes).ok_or(AllocError::OutOfMemory)?;

        let tc_idx = csize2tidx(nb);
        if tc_idx < self.sh.params.tcache_bins() && self.tcache.borrow().has_cached(tc_idx) {
            let p = self.tcache.borrow_mut().get(&self.sh.mem, tc_idx);
            self.sh
                .trace
                .record("malloc", "tcache", Some(p), Some(bytes), None);
            return Ok(p);
        }

        let (arena, guard) = self.acquire_arena(bytes);
        let mut tc = self.tcache.borrow_mut();
        let engine = Engine::new(&self.sh, arena.state);
        let mut victim = engine.int_malloc(Some(&mut tc), bytes);
        let mut served_by = arena.index;
        drop(guard);

        if victim.is_none() {
            let (retry, guard) = self.sh.arena_get_retry(arena.index, bytes);
            self.note_arena(retry.index);
            let engine = Engine::new(&self.sh, retry.state);
            victim = engine.int_malloc(Some(&mut tc), bytes);
            served_by = retry.index;
            drop(guard);
        }
        drop(tc);

        match victim {
            Some(p) => {
                let path = if chunk_is_mmapped(&self.sh.mem, mem2chunk(p)) {
                    "mmap"
                } else {
                    "engine"
                };
                self.sh
                    .trace
                    .record("malloc", path, Some(p), Some(bytes), Some(served_by));
                Ok(p)
            }
            None => Err(AllocError::OutOfMemory),
        }
    }

    /// Allocate at least `bytes` bytes, aligned to the quantum.
    pub fn malloc(&self, bytes: usize) -> Result<usize, AllocError> {
        if let Some(hook) = self.sh.hooks.get().malloc {
            return hook(bytes).ok_or(AllocError::OutOfMemory);
        }
        self.allocate_engine(bytes)
    }

    /// Allocate zeroed storage for `count` items of `size` bytes.
    ///
    /// A hook result is returned as-is; zeroing it is the hook's contract.
    pub fn calloc(&self, count: usize, size: usize) -> Result<usize, AllocError> {
        let bytes = count.checked_mul(size).ok_or(AllocError::OutOfMemory)?;
        if let Some(hook) = self.sh.hooks.get().malloc {
            return hook(bytes).ok_or(AllocError::OutOfMemory);
        }
        let p = self.allocate_engine(bytes)?;
        // Fresh mappings are already zero; everything else may be recycled.
        if !chunk_is_mmapped(&self.sh.mem, mem2chunk(p)) {
            self.sh.mem.fill_bytes(p, 0, bytes);
        }
        Ok(p)
    }

    /// Release a pointer. Null is a no-op.
    pub fn free(&self, ptr: usize) {
        if let Some(hook) = self.sh.hooks.get().free {
            hook(ptr);
            return;
        }
        if ptr == 0 {
            return;
        }
        let p = mem2chunk(ptr);
        if misaligned_chunk(p) {
            malloc_printerr("free(): invalid pointer");
        }

        if chunk_is_mmapped(&self.sh.mem, p) {
            self.sh
                .params
                .adjust_dyn_threshold(chunksize(&self.sh.mem, p));
            munmap_chunk(&self.sh, p);
            self.sh
                .trace
                .record("free", "munmap", Some(ptr), None, None);
            return;
        }

        let arena = self.sh.arena_for_chunk(p);
        let engine = Engine::new(&self.sh, arena.state);
        engine.int_free(Some(&mut self.tcache.borrow_mut()), p, false);
        self.sh
            .trace
            .record("free", "engine", Some(ptr), None, Some(arena.index));
    }

    /// Resize an allocation, preserving the prefix.
    ///
    /// `realloc(0, n)` allocates; `realloc(p, 0)` releases and reports
    /// the null pointer as `Ok(0)`.
    pub fn realloc(&self, ptr: usize, bytes: usize) -> Result<usize, AllocError> {
        if let Some(hook) = self.sh.hooks.get().realloc {
            return hook(ptr, bytes).ok_or(AllocError::OutOfMemory);
        }
        if ptr == 0 {
            return self.malloc(bytes);
        }
        if bytes == 0 {
            self.free(ptr);
            return Ok(0);
        }

        let mem = &self.sh.mem;
        let oldp = mem2chunk(ptr);
        if misaligned_chunk(oldp) {
            malloc_printerr("realloc(): invalid pointer");
        }
        let oldsize = chunksize(mem, oldp);
        if oldp > usize::MAX - oldsize {
            malloc_printerr("realloc(): invalid pointer");
        }
        let nb = checked_request2size(bytes).ok_or(AllocError::OutOfMemory)?;

        if chunk_is_mmapped(mem, oldp) {
            // No in-place remap in the substrate: keep the mapping when it
            // still covers the request, otherwise allocate-copy-release.
            if oldsize - SIZE_SZ >= nb {
                return Ok(ptr);
            }
            let newmem = self.malloc(bytes)?;
            mem.copy_bytes(ptr, newmem, oldsize - 2 * SIZE_SZ);
            munmap_chunk(&self.sh, oldp);
            self.sh
                .trace
                .record("realloc", "munmap-move", Some(newmem), Some(bytes), None);
            return Ok(newmem);
        }

        let arena = self.sh.arena_for_chunk(oldp);
        let newp = {
            let _guard = arena.lock();
            Engine::new(&self.sh, arena.state).int_realloc(oldp, oldsize, nb)
        };

        match newp {
            Some(p) => {
                self.sh
                    .trace
                    .record("realloc", "engine", Some(p), Some(bytes), Some(arena.index));
                Ok(p)
            }
            None => {
                // One more try through the full allocate path, then copy.
                let newmem = self.malloc(bytes)?;
                mem.copy_bytes(ptr, newmem, oldsize - SIZE_SZ);
                let engine = Engine::new(&self.sh, arena.state);
                engine.int_free(Some(&mut self.tcache.borrow_mut()), oldp, false);
                Ok(newmem)
            }
        }
    }

    /// Allocate with an alignment of at least `alignment` (rounded up to a
    /// power of two).
    pub fn memalign(&self, alignment: usize, bytes: usize) -> Result<usize, AllocError> {
        if let Some(hook) = self.sh.hooks.get().memalign {
            return hook(alignment, bytes).ok_or(AllocError::OutOfMemory);
        }
        if alignment <= MALLOC_ALIGNMENT {
            return self.malloc(bytes);
        }
        let mut alignment = alignment.max(MINSIZE);
        if alignment > usize::MAX / 2 + 1 {
            return Err(AllocError::InvalidAlignment);
        }
        if !alignment.is_power_of_two() {
            let mut a = MALLOC_ALIGNMENT * 2;
            while a < alignment {
                a <<= 1;
            }
            alignment = a;
        }

        let padded = bytes.saturating_add(alignment).saturating_add(MINSIZE);
        let (arena, guard) = self.acquire_arena(padded);
        let engine = Engine::new(&self.sh, arena.state);
        let mut p = engine.int_memalign(alignment, bytes);
        drop(guard);

        if p.is_none() {
            let (retry, guard) = self.sh.arena_get_retry(arena.index, bytes);
            self.note_arena(retry.index);
            let engine = Engine::new(&self.sh, retry.state);
            p = engine.int_memalign(alignment, bytes);
            drop(guard);
        }

        match p {
            Some(p) => {
                self.sh
                    .trace
                    .record("memalign", "engine", Some(p), Some(bytes), Some(arena.index));
                Ok(p)
            }
            None => Err(AllocError::OutOfMemory),
        }
    }

    /// Chunk capacity behind a returned pointer, header excluded.
    pub fn usable_size(&self, ptr: usize) -> usize {
        usable_size_impl(&self.sh, ptr)
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        // Flush the cache through the normal release path; each chunk goes
        // back to its owning arena.
        let drained = self.tcache.borrow_mut().drain(&self.sh.mem);
        for e in drained {
            let p = mem2chunk(e);
            let arena = self.sh.arena_for_chunk(p);
            Engine::new(&self.sh, arena.state).int_free(None, p, false);
        }
        if let Some(index) = self.attached.get() {
            self.sh.detach_thread(index);
        }
    }
}
