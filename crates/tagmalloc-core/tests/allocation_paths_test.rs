//! End-to-end allocation-path scenarios: recycling through each tier,
//! coalescing, best-fit splitting, mapping isolation, and realloc
//! strategies.

use tagmalloc_core::{MallocConfig, MallocContext, TuneParam};

fn quiet_ctx() -> MallocContext {
    MallocContext::with_config(MallocConfig {
        read_env: false,
        ..MallocConfig::default()
    })
}

/// Context with the thread cache and fast bins disabled, so releases land
/// in the coalescing tiers immediately.
fn coalescing_ctx() -> MallocContext {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    ctx.tune(TuneParam::FastCeiling, 0).expect("fastbins off");
    ctx
}

#[test]
fn tcache_recycles_same_size_lifo() {
    let ctx = quiet_ctx();
    let t = ctx.thread();
    let p1 = t.malloc(24).expect("p1");
    let p2 = t.malloc(24).expect("p2");
    t.free(p1);
    t.free(p2);
    let p3 = t.malloc(24).expect("p3");
    assert_eq!(p3, p2, "most recently freed chunk comes back first");
}

#[test]
fn fastbin_recycles_same_size_lifo() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    let t = ctx.thread();
    let p1 = t.malloc(24).expect("p1");
    let p2 = t.malloc(24).expect("p2");
    t.free(p1);
    t.free(p2);
    let p3 = t.malloc(24).expect("p3");
    assert_eq!(p3, p2, "fast bin is LIFO");
    let p4 = t.malloc(24).expect("p4");
    assert_eq!(p4, p1);
}

#[test]
fn adjacent_frees_coalesce_and_serve_double_request() {
    let ctx = coalescing_ctx();
    let t = ctx.thread();
    // Two adjacent 256-byte chunks plus a guard keeping them off the top.
    let p1 = t.malloc(248).expect("p1");
    let p2 = t.malloc(248).expect("p2");
    let _guard = t.malloc(24).expect("guard");
    assert_eq!(p2, p1 + 256, "chunks carved back to back");

    t.free(p1);
    t.free(p2);

    // 504 pads to 512, exactly the coalesced block.
    let p3 = t.malloc(504).expect("p3");
    assert_eq!(p3, p1.min(p2), "combined chunk starts at the lower address");
    assert!(t.usable_size(p3) >= 504);
}

#[test]
fn large_best_fit_splits_and_reuses_remainder() {
    let ctx = coalescing_ctx();
    let t = ctx.thread();
    let big = t.malloc(0x10000 - 8).expect("big");
    let _guard = t.malloc(24).expect("guard");
    t.free(big);

    // First cut comes off the front of the freed block.
    let a = t.malloc(1016).expect("first cut");
    assert_eq!(a, big);
    assert!(t.usable_size(a) >= 1016);

    // The remainder went through the unsorted queue into a large bin and
    // serves the next cut right behind the first.
    let b = t.malloc(1016).expect("second cut");
    assert_eq!(b, a + 1024);
}

#[test]
fn oversize_requests_are_isolated_mappings() {
    let ctx = quiet_ctx();
    let t = ctx.thread();
    let n = 256 * 1024;
    let p = t.malloc(n).expect("mapped");
    assert!(ctx.chunk_is_mapped(p), "above the threshold means mapped");
    let usable = t.usable_size(p);
    assert!(usable >= n);
    // Mapped chunks pay one extra header word: capacity plus both header
    // words is the page-rounded mapping length.
    assert_eq!((usable + 16) % 4096, 0);

    let before = ctx.stats();
    t.free(p);
    let after = ctx.stats();
    assert_eq!(after.mapped_count, before.mapped_count - 1);
}

#[test]
fn tcache_depth_is_bounded_then_fastbins_take_over() {
    let ctx = quiet_ctx();
    let t = ctx.thread();
    let ptrs: Vec<usize> = (0..10).map(|_| t.malloc(24).expect("alloc")).collect();
    for &p in &ptrs {
        t.free(p);
    }

    // The first seven sit in the thread cache and return in LIFO order.
    for i in (0..7).rev() {
        assert_eq!(t.malloc(24).expect("tcache pop"), ptrs[i]);
    }
    // The overflow went to the fast bin; its head comes back next, and the
    // prewarm pass migrates the rest through the cache.
    let rest: Vec<usize> = (0..3).map(|_| t.malloc(24).expect("fastbin pop")).collect();
    assert_eq!(rest[0], ptrs[9], "fast bin is LIFO");
    let mut expected = vec![ptrs[7], ptrs[8]];
    let mut seen = vec![rest[1], rest[2]];
    expected.sort_unstable();
    seen.sort_unstable();
    assert_eq!(seen, expected);
}

#[test]
fn realloc_extends_forward_into_free_neighbor() {
    let ctx = coalescing_ctx();
    let t = ctx.thread();
    let p1 = t.malloc(64).expect("p1");
    let p2 = t.malloc(64).expect("p2");
    let _guard = t.malloc(24).expect("guard");
    ctx.write_bytes(p1, &[0x42; 64]);
    t.free(p2);

    let p3 = t.realloc(p1, 120).expect("grow");
    assert_eq!(p3, p1, "growth absorbs the freed neighbor in place");
    let mut buf = [0u8; 64];
    ctx.read_bytes(p3, &mut buf);
    assert!(buf.iter().all(|&b| b == 0x42), "content untouched");
}

#[test]
fn realloc_extends_into_top_when_adjacent() {
    let ctx = coalescing_ctx();
    let t = ctx.thread();
    let p = t.malloc(64).expect("p");
    let grown = t.realloc(p, 4096).expect("grow into top");
    assert_eq!(grown, p);
}

#[test]
fn aligned_allocation_returns_slack_to_the_heap() {
    let ctx = coalescing_ctx();
    let t = ctx.thread();
    // Size the heap first so the aligned request carves from the top.
    let warmup = t.malloc(8000).expect("warmup");
    t.free(warmup);
    let before = ctx.stats();
    let p = t.memalign(4096, 128).expect("aligned");
    assert_eq!(p % 4096, 0);
    assert!(t.usable_size(p) >= 128);

    // The leading slack is an ordinary free chunk again: a small request
    // is served below the aligned block, not from fresh memory.
    let small = t.malloc(200).expect("slack reuse");
    assert!(small < p, "slack below the aligned chunk is reusable");
    assert_eq!(ctx.stats().system_bytes, before.system_bytes);

    t.free(p);
    t.free(small);
}

#[test]
fn fast_ceiling_boundary_switches_tiers() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    let t = ctx.thread();

    // Request 120 pads to the 128-byte default ceiling: fast-bin path.
    let fast = t.malloc(120).expect("fast");
    let _guard = t.malloc(24).expect("guard");
    t.free(fast);
    assert_ne!(
        t.usable_size(fast),
        0,
        "fast chunks stay marked in use in the boundary-tag view"
    );
    assert_eq!(t.malloc(120).expect("refast"), fast);

    // One byte more pads past the ceiling: coalescing path clears the
    // successor's P bit.
    let slow = t.malloc(121).expect("slow");
    let _guard2 = t.malloc(24).expect("guard2");
    t.free(slow);
    assert_eq!(t.usable_size(slow), 0, "released chunk is genuinely free");
}

#[test]
fn released_chunk_adjacent_to_top_merges_into_top() {
    let ctx = coalescing_ctx();
    let t = ctx.thread();
    let warmup = t.malloc(2048).expect("warmup");
    t.free(warmup);
    let before = ctx.stats();
    let p = t.malloc(2048).expect("p");
    t.free(p);
    // The same region is handed straight back out of the top.
    let q = t.malloc(2048).expect("q");
    assert_eq!(q, p);
    t.free(q);
    assert_eq!(ctx.stats().system_bytes, before.system_bytes);
}

#[test]
fn release_after_allocate_restores_counters() {
    let ctx = quiet_ctx();
    let t = ctx.thread();
    // Warm up so the heap exists.
    let w = t.malloc(64).expect("warmup");
    t.free(w);

    let before = ctx.stats();
    let p = t.malloc(64).expect("p");
    t.free(p);
    let after = ctx.stats();
    assert_eq!(before, after, "allocate/release round trip is neutral");
}

#[test]
fn exhausted_contiguous_heap_falls_back_to_mapped_extension() {
    // A tiny primary reservation forces the discontiguous-extension path
    // with its fencepost insertion.
    let ctx = MallocContext::with_config(MallocConfig {
        brk_reserve: 64 * 1024,
        read_env: false,
        ..MallocConfig::default()
    });
    ctx.tune(TuneParam::MmapThreshold, 8 * 1024 * 1024)
        .expect("keep big requests on the heap");
    let t = ctx.thread();

    let small = t.malloc(1000).expect("fits the reservation");
    let big = t.malloc(100 * 1024).expect("forces a mapped extension");
    assert!(!ctx.chunk_is_mapped(big));
    ctx.write_bytes(big, &[0x77; 1024]);

    let bigger = t.malloc(300 * 1024).expect("second mapped extension");
    t.free(big);
    t.free(small);
    t.free(bigger);

    let again = t.malloc(1000).expect("heap still serviceable");
    t.free(again);
}

#[test]
fn second_arena_serves_contended_threads() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::ArenaMax, 4).expect("cap arenas");
    let held = ctx.lock_all_arenas();

    let p = std::thread::scope(|s| {
        s.spawn(|| {
            let t = ctx.thread();
            t.malloc(256).expect("allocation under contention")
        })
        .join()
        .expect("thread")
    });
    drop(held);

    assert_eq!(ctx.stats().arenas, 2, "contention created a second arena");
    assert!(!ctx.chunk_is_mapped(p));

    // Cross-thread release routes to the owning arena.
    let t = ctx.thread();
    t.free(p);
    let q = t.malloc(64).expect("primary arena still healthy");
    t.free(q);
}
