//! Segment Firing Benchmarks

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ringpipe::prelude::*;

/// One segment: a never-ending source followed by `stages` pass-through kernels.
fn chain(stages: usize, depth: usize) -> Segment {
    let mut builder = SegmentBuilder::new(SegmentId::new(0)).kernel(
        KernelSpec::new(KernelId::new(0), 0, 1)
            .chained_output()
            .with_fn(|firing: &mut Firing<'_>| {
                firing.outputs.get(0).unwrap().fill(1);
                Flow::Continue
            }),
    );

    for i in 1..=stages {
        let last = i == stages;
        let mut spec = KernelSpec::new(KernelId::from(i), 1, usize::from(!last)).chained_input();
        if !last {
            spec = spec.chained_output().with_fn(|firing: &mut Firing<'_>| {
                let value = firing.inputs.get(0).unwrap().to_vec();
                firing.outputs.get(0).unwrap().copy_from_slice(&value);
                Flow::Continue
            });
        } else {
            spec = spec.with_fn(|firing: &mut Firing<'_>| {
                black_box(firing.inputs.get(0).unwrap().len());
                Flow::Continue
            });
        }
        builder = builder
            .edge(ChainEdge::new(EdgeId::from(i - 1), depth, 8))
            .kernel(spec);
    }

    builder.build().unwrap()
}

fn bench_fire(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_fire");

    for stages in [1usize, 4, 16].iter() {
        group.throughput(Throughput::Elements(*stages as u64 + 1));
        group.bench_with_input(BenchmarkId::new("chain", stages), stages, |b, &stages| {
            let mut segment = chain(stages, 64);
            b.iter(|| black_box(segment.fire().unwrap()));
        });
    }

    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("segment_build");

    group.bench_function("chain_16_depth_256", |b| {
        b.iter(|| black_box(chain(16, 256)));
    });

    group.finish();
}

criterion_group!(benches, bench_fire, bench_build);
criterion_main!(benches);
