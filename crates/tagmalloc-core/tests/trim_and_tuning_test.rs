//! Trim semantics, the tuning surface, and resource-exhaustion behavior.

use tagmalloc_core::{AllocError, MallocConfig, MallocContext, TuneParam};

fn quiet_ctx() -> MallocContext {
    MallocContext::with_config(MallocConfig {
        read_env: false,
        ..MallocConfig::default()
    })
}

#[test]
fn trim_releases_once_then_reports_nothing() {
    let ctx = quiet_ctx();
    let t = ctx.thread();
    let p = t.malloc(100_000).expect("alloc");
    t.free(p);

    assert!(ctx.trim(0), "first trim returns tail pages");
    assert!(!ctx.trim(0), "second trim finds nothing left");
}

#[test]
fn trim_respects_the_requested_pad() {
    let ctx = quiet_ctx();
    let t = ctx.thread();
    let p = t.malloc(50_000).expect("alloc");
    t.free(p);
    assert!(!ctx.trim(1 << 20), "pad larger than the top means no trim");
}

#[test]
fn trim_accounts_released_bytes() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::MmapThreshold, 1 << 20)
        .expect("keep the request on the heap");
    ctx.tune(TuneParam::TrimThreshold, usize::MAX)
        .expect("no automatic trim on release");
    let t = ctx.thread();
    let p = t.malloc(200_000).expect("alloc");
    t.free(p);
    let before = ctx.stats();
    assert!(ctx.trim(0));
    let after = ctx.stats();
    assert!(after.advised_bytes > before.advised_bytes);
    assert!(after.system_bytes < before.system_bytes);
}

#[test]
fn mapped_release_adapts_the_thresholds() {
    let ctx = quiet_ctx();
    let t = ctx.thread();
    let n = 256 * 1024;

    let p = t.malloc(n).expect("first is mapped");
    assert!(ctx.chunk_is_mapped(p));
    t.free(p);

    // The threshold followed the released mapping; the same request now
    // stays on the heap.
    let q = t.malloc(n).expect("second comes from the arena");
    assert!(!ctx.chunk_is_mapped(q));
    assert_eq!(ctx.stats().mapped_count, 0);
    t.free(q);
}

#[test]
fn user_pinned_thresholds_do_not_adapt() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::MmapThreshold, 128 * 1024).expect("pin");
    let t = ctx.thread();
    let n = 256 * 1024;

    let p = t.malloc(n).expect("first is mapped");
    t.free(p);
    let q = t.malloc(n).expect("still mapped");
    assert!(ctx.chunk_is_mapped(q), "pinned threshold must not move");
    t.free(q);
}

#[test]
fn mmap_max_zero_disables_mapping() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::MmapMax, 0).expect("disable mapping");
    let t = ctx.thread();
    let p = t.malloc(256 * 1024).expect("served from the heap");
    assert!(!ctx.chunk_is_mapped(p));
    t.free(p);
}

#[test]
fn top_pad_inflates_heap_extensions() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::TopPad, 1 << 20).expect("pad");
    let t = ctx.thread();
    let p = t.malloc(1000).expect("alloc");
    assert!(
        ctx.stats().system_bytes >= 1 << 20,
        "every extension carries the pad"
    );
    t.free(p);
}

#[test]
fn tcache_count_cap_is_honored() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::TcacheCount, 2).expect("cap tcache");
    let t = ctx.thread();
    let ptrs: Vec<usize> = (0..5).map(|_| t.malloc(24).expect("alloc")).collect();
    for &p in &ptrs {
        t.free(p);
    }
    // Two cached entries, LIFO; the rest went to the fast bin.
    assert_eq!(t.malloc(24).expect("a"), ptrs[1]);
    assert_eq!(t.malloc(24).expect("b"), ptrs[0]);
    assert_eq!(t.malloc(24).expect("c"), ptrs[4], "fast bin head next");
}

#[test]
fn fast_ceiling_zero_disables_fast_bins() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    ctx.tune(TuneParam::FastCeiling, 0).expect("fast off");
    let t = ctx.thread();
    let p = t.malloc(24).expect("alloc");
    let _guard = t.malloc(24).expect("guard");
    t.free(p);
    // With fast bins off the release really frees the chunk.
    assert_eq!(t.usable_size(p), 0);
}

#[test]
fn exhaustion_is_reported_and_recoverable() {
    let ctx = MallocContext::with_config(MallocConfig {
        brk_reserve: 256 * 1024,
        byte_limit: 1 << 20,
        read_env: false,
        ..MallocConfig::default()
    });
    let t = ctx.thread();

    let a = t.malloc(600 * 1024).expect("fits the budget");
    assert_eq!(
        t.malloc(600 * 1024),
        Err(AllocError::OutOfMemory),
        "budget exhausted"
    );
    t.free(a);
    let b = t.malloc(600 * 1024).expect("budget returned on release");
    t.free(b);
}

#[test]
fn tuning_while_fast_chunks_exist_consolidates_them() {
    let ctx = quiet_ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    let t = ctx.thread();
    let p = t.malloc(24).expect("alloc");
    let _guard = t.malloc(24).expect("guard");
    t.free(p);
    assert_ne!(t.usable_size(p), 0, "held in a fast bin");

    // Any tuning call folds the fast bins first.
    ctx.tune(TuneParam::TopPad, 0).expect("tune");
    assert_eq!(t.usable_size(p), 0, "consolidation freed the chunk");
}
