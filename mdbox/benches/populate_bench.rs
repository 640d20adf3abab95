//! Population and flat codec benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mdbox::{
    flatten, BoxControllerConfig, BoxTree, DetectorInfo, Extents, FnConverter, NoProgress,
    PipelineConfig, PopulationPipeline, RowContext, Spectrum, Workspace2D,
};
use std::hint::black_box;

fn table(rows: usize, bins: usize) -> Workspace2D {
    (0..rows)
        .map(|row| {
            let x: Vec<f64> = (0..=bins).map(|b| b as f64 / bins as f64).collect();
            let y: Vec<f64> = (0..bins).map(|b| 1.0 + ((row + b) % 7) as f64).collect();
            let e = vec![0.5; bins];
            Spectrum::new(x, y, e).with_detector(DetectorInfo::new(
                row as i64,
                [row as f64 / rows as f64, 0.0, 1.0],
            ))
        })
        .collect()
}

fn empty_tree() -> BoxTree {
    BoxTree::new(
        BoxControllerConfig::new(2).with_split_threshold(500),
        Extents::new([(0.0, 1.0), (0.0, 1.0)]).unwrap(),
    )
    .unwrap()
}

fn converter() -> FnConverter<impl Fn(&RowContext<'_>, f64, &mut [f64]) -> bool + Send + Sync> {
    FnConverter::new(2, |row: &RowContext<'_>, value: f64, out: &mut [f64]| {
        out[0] = value;
        out[1] = row.detector.position[0];
        true
    })
}

fn bench_populate(c: &mut Criterion) {
    let mut group = c.benchmark_group("Populate");
    let converter = converter();

    for workers in [1, 2, 4].iter() {
        let ws = table(2000, 100);
        group.bench_with_input(BenchmarkId::from_parameter(workers), workers, |b, &workers| {
            let pipeline = PopulationPipeline::new(PipelineConfig::for_workers(workers, 1_000_000))
                .with_progress(NoProgress);
            b.iter(|| {
                let populated = pipeline.run(empty_tree(), &ws, &converter).unwrap();
                black_box(populated.report.samples_added)
            });
        });
    }

    group.finish();
}

fn bench_flatten(c: &mut Criterion) {
    let mut group = c.benchmark_group("Flatten");

    let ws = table(2000, 100);
    let populated = PopulationPipeline::new(PipelineConfig::for_workers(4, 1_000_000))
        .with_progress(NoProgress)
        .run(empty_tree(), &ws, &converter())
        .unwrap();

    group.bench_function("flatten_200k", |b| {
        b.iter(|| black_box(flatten(&populated.tree)));
    });

    group.finish();
}

criterion_group!(benches, bench_populate, bench_flatten);
criterion_main!(benches);
