//! Benchmarks for upstream selection.
//!
//! Run with: cargo bench --bench load_balancer_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use llm_gateway::services::load_balancer::{create_balancer, LoadBalancerFactory, Strategy};
use llm_gateway::store::UpstreamConfig;

fn create_candidates(count: usize) -> Vec<UpstreamConfig> {
    (0..count)
        .map(|i| UpstreamConfig {
            id: format!("upstream-{}", i),
            kind: "openai".to_string(),
            base_url: format!("http://localhost:{}", 8000 + i),
            api_key: format!("key{}", i),
            models: vec!["gpt-4".to_string()],
            priority: 0,
            weight: (i % 10 + 1) as i32,
            is_active: true,
            timeout_secs: 30,
        })
        .collect()
}

fn bench_strategies(c: &mut Criterion) {
    let strategies = [
        Strategy::RoundRobin,
        Strategy::WeightedRoundRobin,
        Strategy::LeastConnections,
        Strategy::Random,
    ];

    for strategy in strategies {
        let mut group = c.benchmark_group(format!("select_{}", strategy));

        for count in [2, 5, 10, 20, 50].iter() {
            let candidates = create_candidates(*count);
            let balancer = create_balancer(strategy);

            group.throughput(Throughput::Elements(1));
            group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
                b.iter(|| {
                    let selected = balancer
                        .select_config(black_box(&candidates))
                        .expect("select_config failed");
                    balancer.release_connection(&selected.id);
                    black_box(selected);
                });
            });
        }

        group.finish();
    }
}

fn bench_factory_lookup(c: &mut Criterion) {
    let factory = LoadBalancerFactory::new();
    let models: Vec<String> = (0..100).map(|i| format!("model-{}", i)).collect();
    for model in &models {
        factory.get(model, "round_robin");
    }

    c.bench_function("factory_get_cached", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % models.len();
            black_box(factory.get(&models[i], "round_robin"));
        });
    });
}

criterion_group!(benches, bench_strategies, bench_factory_lookup);
criterion_main!(benches);
