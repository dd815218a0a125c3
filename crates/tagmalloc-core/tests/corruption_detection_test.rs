//! Integrity-check behavior: every detected inconsistency aborts with a
//! stable single-line tag. The tests install a panicking reporter so the
//! tag can be observed instead of the process dying.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Once;

use tagmalloc_core::fatal::set_fatal_handler;
use tagmalloc_core::{MallocConfig, MallocContext, TuneParam};

fn panicking_handler(tag: &'static str) {
    panic!("fatal malloc error: {tag}");
}

fn install_handler() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        set_fatal_handler(Some(panicking_handler));
    });
}

fn ctx() -> MallocContext {
    install_handler();
    MallocContext::with_config(MallocConfig {
        read_env: false,
        ..MallocConfig::default()
    })
}

fn expect_tag(tag: &str, f: impl FnOnce()) {
    let err = catch_unwind(AssertUnwindSafe(f)).expect_err("operation must abort");
    let msg = err
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_default();
    assert!(
        msg.contains(tag),
        "expected diagnostic containing {tag:?}, got {msg:?}"
    );
}

#[test]
fn double_free_is_caught_by_the_thread_cache() {
    let ctx = ctx();
    let t = ctx.thread();
    let p = t.malloc(24).expect("alloc");
    t.free(p);
    expect_tag("free(): double free detected in tcache 2", || t.free(p));
}

#[test]
fn double_free_is_caught_at_the_fastbin_head() {
    let ctx = ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    let t = ctx.thread();
    let p = t.malloc(24).expect("alloc");
    t.free(p);
    expect_tag("double free or corruption (fasttop)", || t.free(p));
}

#[test]
fn misaligned_release_is_rejected() {
    let ctx = ctx();
    let t = ctx.thread();
    let p = t.malloc(64).expect("alloc");
    expect_tag("free(): invalid pointer", || t.free(p + 1));
    t.free(p);
}

#[test]
fn corrupted_size_word_is_rejected_on_release() {
    let ctx = ctx();
    let t = ctx.thread();
    let p = t.malloc(64).expect("alloc");
    // Scribble an unaligned size into the chunk header.
    ctx.write_bytes(p - 8, &17usize.to_ne_bytes());
    expect_tag("free(): invalid size", || t.free(p));
}

#[test]
fn fastbin_size_class_mismatch_aborts_allocation() {
    let ctx = ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    let t = ctx.thread();
    let p = t.malloc(24).expect("alloc");
    let _guard = t.malloc(24).expect("guard");
    t.free(p);
    // Rewrite the cached chunk's size to a different fast class.
    ctx.write_bytes(p - 8, &(64usize | 1).to_ne_bytes());
    expect_tag("malloc(): memory corruption (fast)", || {
        let _ = t.malloc(24);
    });
}

#[test]
fn unsorted_chunk_with_impossible_size_aborts_allocation() {
    let ctx = ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    ctx.tune(TuneParam::FastCeiling, 0).expect("fastbins off");
    let t = ctx.thread();
    let p = t.malloc(200).expect("alloc");
    let _guard = t.malloc(24).expect("guard");
    t.free(p);
    // The freed chunk now sits in the unsorted queue; shrink its size
    // below the minimum.
    ctx.write_bytes(p - 8, &(8usize | 1).to_ne_bytes());
    expect_tag("malloc(): invalid size (unsorted)", || {
        let _ = t.malloc(200);
    });
}

#[test]
fn boundary_tag_disagreement_aborts_backward_coalesce() {
    let ctx = ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    ctx.tune(TuneParam::FastCeiling, 0).expect("fastbins off");
    let t = ctx.thread();
    let p1 = t.malloc(200).expect("p1");
    let p2 = t.malloc(200).expect("p2");
    let _guard = t.malloc(24).expect("guard");
    t.free(p1);
    // Corrupt the free chunk's recorded size; its boundary tag in p2's
    // prev_size slot still carries the original value.
    ctx.write_bytes(p1 - 8, &(192usize | 1).to_ne_bytes());
    expect_tag("corrupted size vs. prev_size while consolidating", || {
        t.free(p2);
    });
}

#[test]
fn broken_unsorted_backlink_aborts_allocation() {
    let ctx = ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    ctx.tune(TuneParam::FastCeiling, 0).expect("fastbins off");
    let t = ctx.thread();
    let p = t.malloc(200).expect("alloc");
    let _guard = t.malloc(24).expect("guard");
    t.free(p);
    // Break the unsorted ring: the chunk's forward link no longer points
    // back at the queue head.
    ctx.write_bytes(p, &0xdead_beefusize.to_ne_bytes());
    expect_tag("malloc(): unsorted double linked list corrupted", || {
        let _ = t.malloc(504);
    });
}

#[test]
fn releasing_the_top_chunk_is_rejected() {
    let ctx = ctx();
    ctx.tune(TuneParam::TcacheCount, 0).expect("tcache off");
    ctx.tune(TuneParam::FastCeiling, 0).expect("fastbins off");
    let t = ctx.thread();
    let p = t.malloc(200).expect("alloc");
    // The chunk right past p is the top; forge a pointer into it.
    let top_mem = p + 208;
    expect_tag("double free or corruption (top)", || t.free(top_mem));
    t.free(p);
}
