//! Hot-path latency benchmarks for the control-plane components, run
//! directly against each component rather than the full [`Controller`]
//! ticker, so a regression can be attributed to a single stage.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowmesh_governor::aggregator::MetricsAggregator;
use flowmesh_governor::bus::EventBus;
use flowmesh_governor::cache::IntelligentCache;
use flowmesh_governor::clock::VirtualClock;
use flowmesh_governor::correlation::CorrelationEngine;
use flowmesh_governor::expr;
use tokio::runtime::Runtime;

fn bench_aggregator_record_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let clock = Arc::new(VirtualClock::new(0));
    let bus = Arc::new(EventBus::new(clock.clone()));
    let agg = MetricsAggregator::new(clock, bus);

    c.bench_function("aggregator_record_latency", |b| {
        b.to_async(&rt).iter(|| async {
            agg.record_latency("qflow", 42.0).await.unwrap();
            black_box(())
        });
    });
}

fn bench_aggregator_percentile(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let clock = Arc::new(VirtualClock::new(0));
    let bus = Arc::new(EventBus::new(clock.clone()));
    let agg = MetricsAggregator::new(clock, bus);

    let mut group = c.benchmark_group("aggregator_snapshot");
    for size in [10, 100, 1_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&rt).iter(|| async move {
                for i in 0..size {
                    agg.record_latency("qflow", i as f64).await.unwrap();
                }
                black_box(agg.snapshot("qflow").await.unwrap())
            });
        });
    }
    group.finish();
}

fn bench_cache_put_get(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let clock = Arc::new(VirtualClock::new(0));
    let bus = Arc::new(EventBus::new(clock.clone()));
    let cache = IntelligentCache::new(clock, bus);

    c.bench_function("cache_put_get_roundtrip", |b| {
        b.to_async(&rt).iter(|| async {
            cache.put("bench", "k", serde_json::json!(1), None, vec![]).await;
            black_box(cache.get("bench", "k").await)
        });
    });
}

fn bench_expr_eval(c: &mut Criterion) {
    let expr = expr::parse("latency_p99 > 2000 AND error_rate > 0.05").unwrap();
    let mut ctx = hashbrown::HashMap::new();
    ctx.insert("latency_p99".to_string(), 3000.0);
    ctx.insert("error_rate".to_string(), 0.1);

    c.bench_function("expr_eval", |b| {
        b.iter(|| black_box(expr.eval(&ctx)));
    });
}

fn bench_correlation_recompute(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("correlation_recompute");
    for modules in [2, 5, 10].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(modules), modules, |b, &modules| {
            b.to_async(&rt).iter(|| async move {
                let clock = Arc::new(VirtualClock::new(0));
                let bus = Arc::new(EventBus::new(clock.clone()));
                let engine = CorrelationEngine::new(clock, bus);
                for m in 0..modules {
                    let name = format!("module-{m}");
                    for v in 0..10 {
                        engine.record_sample(&name, v as f64, v as f64, 0.0).await;
                    }
                }
                engine.recompute().await;
                black_box(())
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_aggregator_record_latency,
    bench_aggregator_percentile,
    bench_cache_put_get,
    bench_expr_eval,
    bench_correlation_recompute,
);

criterion_main!(benches);
