use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use notes_ratelimit::rate_limit::{
    local::LocalStore, LimiterSettings, Policy, RateLimiter,
};

fn benchmark_local_store_hit(c: &mut Criterion) {
    let store = LocalStore::new();

    c.bench_function("local_store_hit_same_key", |b| {
        let mut now = 0u64;
        b.iter(|| {
            now += 1;
            black_box(store.hit("rl:203.0.113.1", 60_000, now))
        })
    });
}

fn benchmark_local_store_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_store_sweep");

    for records in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(records), &records, |b, &records| {
            b.iter_batched(
                || {
                    let store = LocalStore::new();
                    for i in 0..records {
                        // Half expired, half live at sweep time
                        store.hit(&format!("rl:client-{}", i), 1_000, (i % 2) as u64 * 5_000);
                    }
                    store
                },
                |store| black_box(store.sweep(5_500)),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn benchmark_limiter_check(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("Failed to build runtime");
    let limiter = runtime.block_on(async { RateLimiter::local_only(LimiterSettings::default()) });
    let policy = Policy::standard();

    c.bench_function("limiter_check_local", |b| {
        b.to_async(&runtime)
            .iter(|| async { black_box(limiter.check("203.0.113.1", &policy).await) })
    });
}

criterion_group!(
    benches,
    benchmark_local_store_hit,
    benchmark_local_store_sweep,
    benchmark_limiter_check
);
criterion_main!(benches);
