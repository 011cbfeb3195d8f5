//! Benchmarks for chain traversal.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use middleflow::prelude::*;
use serde_json::{json, Value};

fn build_chain(depth: usize) -> ExecutionChain {
    let chain = ExecutionChain::new(ExecutionConfig::new("bench"));
    for i in 0..depth {
        chain.add_middleware(Arc::new(FnMiddleware::new(
            format!("m{i}"),
            |ctx, req: Value, next: Next| async move { next.run(&ctx, req).await },
        )));
    }
    chain
}

fn chain_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");
    let ctx = ExecutionContext::background();

    let mut group = c.benchmark_group("execute");
    for depth in [0_usize, 1, 8, 32] {
        let chain = build_chain(depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                let response: ChainResult<Value> =
                    runtime.block_on(chain.execute(&ctx, black_box(json!({"id": 1}))));
                black_box(response)
            });
        });
    }
    group.finish();
}

fn parallel_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");
    let ctx = ExecutionContext::background();
    let chains: Vec<Arc<dyn Chain>> = (0..4).map(|_| Arc::new(build_chain(4)) as Arc<dyn Chain>).collect();
    let parallel = ParallelChain::new(ExecutionConfig::new("fanout"), chains);

    c.bench_function("parallel_4x4", |b| {
        b.iter(|| {
            let response = runtime.block_on(parallel.execute(&ctx, black_box(json!("req"))));
            black_box(response)
        });
    });
}

criterion_group!(benches, chain_benchmark, parallel_benchmark);
criterion_main!(benches);
