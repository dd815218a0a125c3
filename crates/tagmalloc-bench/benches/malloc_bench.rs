//! Allocator benchmarks: tier hit paths against the system allocator.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use tagmalloc_core::{MallocConfig, MallocContext};

fn bench_ctx() -> MallocContext {
    MallocContext::with_config(MallocConfig {
        read_env: false,
        ..MallocConfig::default()
    })
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let mut group = c.benchmark_group("alloc_free_cycle");

    let ctx = bench_ctx();
    let t = ctx.thread();
    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("tagmalloc", size), &size, |b, &sz| {
            b.iter(|| {
                let p = t.malloc(sz).expect("bench allocation");
                criterion::black_box(p);
                t.free(p);
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            b.iter(|| {
                let v = vec![0u8; sz];
                criterion::black_box(v);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    let ctx = bench_ctx();
    let t = ctx.thread();
    group.bench_function("tagmalloc_1000x64B", |b| {
        b.iter(|| {
            let ptrs: Vec<usize> = (0..1000)
                .map(|_| t.malloc(64).expect("bench allocation"))
                .collect();
            for p in &ptrs {
                t.free(*p);
            }
            criterion::black_box(ptrs);
        });
    });
    group.bench_function("system_1000x64B", |b| {
        b.iter(|| {
            let allocs: Vec<Vec<u8>> = (0..1000).map(|_| vec![0u8; 64]).collect();
            criterion::black_box(allocs);
        });
    });

    group.finish();
}

fn bench_realloc_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("realloc_growth");

    let ctx = bench_ctx();
    let t = ctx.thread();
    group.bench_function("tagmalloc_doubling_to_64k", |b| {
        b.iter(|| {
            let mut p = t.malloc(32).expect("seed");
            let mut size = 32usize;
            while size < 64 * 1024 {
                size *= 2;
                p = t.realloc(p, size).expect("growth");
            }
            t.free(p);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_realloc_growth
);
criterion_main!(benches);
