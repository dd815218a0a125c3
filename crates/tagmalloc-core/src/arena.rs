//! Arena and heap management.
//!
//! One primary arena grows through the contiguous-heap primitive; further
//! arenas are created on demand, each backed by a chain of power-of-two
//! aligned heaps so the owning arena of any chunk is recoverable by
//! masking its address. A detached arena (last attached thread exited) is
//! parked on a free list and handed out before any new arena is created.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::chunk::{MINSIZE, PREV_INUSE, chunk_non_main_arena, set_head};
use crate::fatal::malloc_printerr;
use crate::hooks::Hooks;
use crate::params::MallocParams;
use crate::state::{ArenaState, STATE_BYTES};
use crate::sys::{SystemConfig, SystemMemory, WORD_SIZE, align_up};
use crate::trace::TraceRing;

/// Reserved size of every non-primary heap; must be a power of two so the
/// owning heap of a chunk is `addr & !(HEAP_MAX_SIZE - 1)`.
pub(crate) const HEAP_MAX_SIZE: usize = 4 * 1024 * 1024;

/// Smallest committed span of a fresh heap.
pub(crate) const HEAP_MIN_SIZE: usize = 32 * 1024;

/// Bytes of the heap header (owning arena, previous heap, committed size).
pub(crate) const HEAP_HDR_BYTES: usize = 4 * WORD_SIZE;

const HEAP_ARENA: usize = 0;
const HEAP_PREV: usize = 1;
const HEAP_SIZE: usize = 2;

/// Base address of the heap containing a non-primary chunk.
#[inline]
pub(crate) fn heap_for_ptr(p: usize) -> usize {
    p & !(HEAP_MAX_SIZE - 1)
}

#[inline]
pub(crate) fn heap_arena_index(mem: &SystemMemory, heap: usize) -> usize {
    mem.read(heap + HEAP_ARENA * WORD_SIZE)
}

#[inline]
pub(crate) fn heap_prev(mem: &SystemMemory, heap: usize) -> usize {
    mem.read(heap + HEAP_PREV * WORD_SIZE)
}

#[inline]
pub(crate) fn set_heap_arena_index(mem: &SystemMemory, heap: usize, index: usize) {
    mem.write(heap + HEAP_ARENA * WORD_SIZE, index);
}

#[inline]
pub(crate) fn set_heap_prev(mem: &SystemMemory, heap: usize, prev: usize) {
    mem.write(heap + HEAP_PREV * WORD_SIZE, prev);
}

#[inline]
pub(crate) fn heap_size(mem: &SystemMemory, heap: usize) -> usize {
    mem.read(heap + HEAP_SIZE * WORD_SIZE)
}

#[inline]
pub(crate) fn set_heap_size(mem: &SystemMemory, heap: usize, size: usize) {
    mem.write(heap + HEAP_SIZE * WORD_SIZE, size);
}

/// Maps a fresh aligned heap committing at least `size` bytes (plus the
/// configured pad when it fits). Fails when `size` cannot fit any heap.
pub(crate) fn new_heap(mem: &SystemMemory, size: usize, top_pad: usize) -> Option<usize> {
    let pagesize = mem.page_size();
    let committed = if size + top_pad < HEAP_MIN_SIZE {
        HEAP_MIN_SIZE
    } else if size + top_pad <= HEAP_MAX_SIZE {
        size + top_pad
    } else if size > HEAP_MAX_SIZE {
        return None;
    } else {
        HEAP_MAX_SIZE
    };
    let committed = align_up(committed, pagesize);
    let heap = mem.map(HEAP_MAX_SIZE, HEAP_MAX_SIZE)?;
    set_heap_size(mem, heap, committed);
    Some(heap)
}

/// Extends a heap's committed span by at least `diff` bytes.
pub(crate) fn grow_heap(mem: &SystemMemory, heap: usize, diff: usize) -> bool {
    let pagesize = mem.page_size();
    let new_size = heap_size(mem, heap) + align_up(diff, pagesize);
    if new_size > HEAP_MAX_SIZE {
        return false;
    }
    set_heap_size(mem, heap, new_size);
    true
}

/// Shrinks a heap's committed span, advising the tail pages away.
pub(crate) fn shrink_heap(mem: &SystemMemory, heap: usize, diff: usize) {
    let size = heap_size(mem, heap);
    set_heap_size(mem, heap, size - diff);
    mem.advise_dontneed(heap + size - diff, diff);
}

/// Unmaps a whole heap.
pub(crate) fn delete_heap(mem: &SystemMemory, heap: usize) -> bool {
    mem.unmap(heap, HEAP_MAX_SIZE)
}

/// Token guarded by each arena mutex; counts engine entries for the
/// statistics surface.
#[derive(Debug, Default)]
pub(crate) struct ArenaLock {
    pub ops: u64,
}

pub(crate) type ArenaGuard = ArcMutexGuard<RawMutex, ArenaLock>;

/// One allocator instance: state block plus its exclusion lock.
pub(crate) struct Arena {
    pub index: usize,
    pub state: ArenaState,
    mutex: Arc<Mutex<ArenaLock>>,
    pub attached: AtomicUsize,
}

impl Arena {
    pub fn lock(&self) -> ArenaGuard {
        let mut guard = Mutex::lock_arc(&self.mutex);
        guard.ops += 1;
        guard
    }

    pub fn try_lock(&self) -> Option<ArenaGuard> {
        let mut guard = Mutex::try_lock_arc(&self.mutex)?;
        guard.ops += 1;
        Some(guard)
    }
}

/// Everything the arenas of one context share.
pub(crate) struct Shared {
    pub mem: SystemMemory,
    pub params: MallocParams,
    pub hooks: Hooks,
    pub trace: TraceRing,
    arenas: RwLock<Vec<Arc<Arena>>>,
    free_arenas: Mutex<Vec<usize>>,
    next_rr: AtomicUsize,
    pub tcache_key_seq: AtomicUsize,
}

impl Shared {
    /// Builds the context core and its primary arena. The byte budget is
    /// applied after the primary state block exists, so construction
    /// itself cannot fail.
    pub fn new(sys_config: SystemConfig, params: MallocParams, trace_enabled: bool) -> Self {
        let limit = sys_config.limit;
        let mem = SystemMemory::new(SystemConfig {
            limit: usize::MAX,
            ..sys_config
        });
        let pagesize = mem.page_size();
        let base = match mem.map(align_up(STATE_BYTES, pagesize), pagesize) {
            Some(base) => base,
            None => malloc_printerr("arena state allocation failed"),
        };
        let state = ArenaState { base, index: 0 };
        state.init(&mem);
        mem.set_limit(limit);

        let primary = Arc::new(Arena {
            index: 0,
            state,
            mutex: Arc::new(Mutex::new(ArenaLock::default())),
            attached: AtomicUsize::new(1),
        });

        Self {
            mem,
            params,
            hooks: Hooks::new(),
            trace: TraceRing::new(trace_enabled),
            arenas: RwLock::new(vec![primary]),
            free_arenas: Mutex::new(Vec::new()),
            next_rr: AtomicUsize::new(0),
            tcache_key_seq: AtomicUsize::new(1),
        }
    }

    pub fn arena_count(&self) -> usize {
        self.arenas.read().len()
    }

    pub fn arena(&self, index: usize) -> Arc<Arena> {
        match self.arenas.read().get(index) {
            Some(a) => Arc::clone(a),
            None => malloc_printerr("invalid pointer (unmapped address)"),
        }
    }

    pub fn main_arena(&self) -> Arc<Arena> {
        self.arena(0)
    }

    /// The arena owning a non-mapped chunk: primary unless the A flag
    /// routes through the containing heap's header.
    pub fn arena_for_chunk(&self, p: usize) -> Arc<Arena> {
        if chunk_non_main_arena(&self.mem, p) {
            let heap = heap_for_ptr(p);
            self.arena(heap_arena_index(&self.mem, heap))
        } else {
            self.main_arena()
        }
    }

    fn narenas_limit(&self) -> usize {
        let max = self.params.arena_max.load(Ordering::Relaxed);
        if max > 0 {
            return max;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.params
            .arena_test
            .load(Ordering::Relaxed)
            .max(cores * 8)
    }

    /// Creates and registers a fresh arena sized for a pending request of
    /// `nb` bytes. Returns it unlocked.
    fn create_arena(&self, nb: usize) -> Option<Arc<Arena>> {
        let mut arenas = self.arenas.write();
        let index = arenas.len();
        let heap = new_heap(
            &self.mem,
            nb + STATE_BYTES + HEAP_HDR_BYTES + MINSIZE,
            self.params.top_pad(),
        )?;
        set_heap_arena_index(&self.mem, heap, index);
        set_heap_prev(&self.mem, heap, 0);

        let state = ArenaState {
            base: heap + HEAP_HDR_BYTES,
            index,
        };
        state.init(&self.mem);
        let committed = heap_size(&self.mem, heap);
        let top = heap + HEAP_HDR_BYTES + STATE_BYTES;
        set_head(
            &self.mem,
            top,
            (committed - HEAP_HDR_BYTES - STATE_BYTES) | PREV_INUSE,
        );
        state.set_top(&self.mem, top);
        state.add_system_mem(&self.mem, committed);

        let arena = Arc::new(Arena {
            index,
            state,
            mutex: Arc::new(Mutex::new(ArenaLock::default())),
            attached: AtomicUsize::new(0),
        });
        arenas.push(Arc::clone(&arena));
        Some(arena)
    }

    /// Selects and locks an arena for a request of `nb` bytes.
    ///
    /// Order: the caller's affine arena by trylock, then a parked arena,
    /// then every live arena by trylock, then creation below the cap, and
    /// finally a blocking round-robin acquire.
    pub fn arena_get(&self, hint: Option<usize>, nb: usize) -> (Arc<Arena>, ArenaGuard) {
        if let Some(index) = hint {
            let arena = self.arena(index);
            if let Some(guard) = arena.try_lock() {
                return (arena, guard);
            }
        }

        if let Some(index) = self.free_arenas.lock().pop() {
            let arena = self.arena(index);
            let guard = arena.lock();
            return (arena, guard);
        }

        let candidates: Vec<Arc<Arena>> = self.arenas.read().iter().cloned().collect();
        for arena in &candidates {
            if let Some(guard) = arena.try_lock() {
                return (Arc::clone(arena), guard);
            }
        }

        if candidates.len() < self.narenas_limit() {
            if let Some(arena) = self.create_arena(nb) {
                let guard = arena.lock();
                return (arena, guard);
            }
        }

        let index = self.next_rr.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let arena = Arc::clone(&candidates[index]);
        let guard = arena.lock();
        (arena, guard)
    }

    /// One retry on a different arena after an allocation failure.
    pub fn arena_get_retry(&self, failed: usize, nb: usize) -> (Arc<Arena>, ArenaGuard) {
        let count = self.arena_count();
        if count > 1 {
            let index = (failed + 1) % count;
            let arena = self.arena(index);
            let guard = arena.lock();
            return (arena, guard);
        }
        if count < self.narenas_limit() {
            if let Some(arena) = self.create_arena(nb) {
                let guard = arena.lock();
                return (arena, guard);
            }
        }
        let arena = self.arena(failed);
        let guard = arena.lock();
        (arena, guard)
    }

    pub fn attach_thread(&self, index: usize) {
        self.arena(index).attached.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops a thread's attachment; a fully detached non-primary arena is
    /// parked for reuse.
    pub fn detach_thread(&self, index: usize) {
        let arena = self.arena(index);
        let mut cur = arena.attached.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return;
            }
            match arena.attached.compare_exchange(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }
        if cur == 1 && index != 0 {
            self.free_arenas.lock().push(index);
        }
    }

    /// Acquires every arena mutex in list order; the fork discipline.
    pub fn lock_all(&self) -> Vec<ArenaGuard> {
        let arenas = self.arenas.read();
        arenas.iter().map(|a| a.lock()).collect()
    }
}
