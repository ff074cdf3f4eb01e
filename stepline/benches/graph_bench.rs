//! Benchmarks for dependency graph building.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stepline::pipeline::{PipelineDefinition, PipelineGraph, StepSpec};

/// A layered pipeline where each step depends on two earlier ones.
fn layered(steps: usize) -> PipelineDefinition {
    let mut def = PipelineDefinition::new("bench").step(StepSpec::new("s0", "t"));
    for i in 1..steps {
        let mut deps = vec![format!("s{}", i / 2), format!("s{}", i - 1)];
        deps.dedup();
        let refs: Vec<&str> = deps.iter().map(String::as_str).collect();
        def = def.step(StepSpec::new(format!("s{i}"), "t").depends_on(&refs));
    }
    def
}

fn graph_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_build");
    for size in [10, 100, 1_000] {
        let def = layered(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &def, |b, def| {
            b.iter(|| PipelineGraph::build(black_box(def)));
        });
    }
    group.finish();

    let graph = PipelineGraph::build(&layered(1_000)).ok();
    c.bench_function("transitive_dependents_1000", |b| {
        b.iter(|| graph.as_ref().map(|g| g.transitive_dependents(black_box("s1"))));
    });
}

criterion_group!(benches, graph_benchmark);
criterion_main!(benches);
