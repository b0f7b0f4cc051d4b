// ========================================================================================
//
//                      MULTIFACTOR LONG-TABLE PIVOT BENCHMARK
//
// ========================================================================================
//
// Measures how long ingestion takes to pivot a long table into the view × group block
// grid as the table grows, and compares it with ingesting the same values as wide
// per-view matrices.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use multifactor::ingest::{MatrixInput, ViewMatrix};
use multifactor::{IngestInput, ingest};
use ndarray::Array2;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// --- Benchmark Tuning Parameters ---

const NUM_VIEWS: usize = 3;
const NUM_GROUPS: usize = 4;
const FEATURES_PER_VIEW: usize = 200;
/// Samples per group. This array defines the x-axis of the benchmark.
const SAMPLES_PER_GROUP: [usize; 4] = [25, 50, 100, 200];
/// Fraction of cells left unobserved.
const MISSING_RATE: f64 = 0.2;

fn sample_name(group: usize, n: usize) -> String {
    format!("g{group}_s{n}")
}

fn long_table(samples_per_group: usize, rng: &mut StdRng) -> DataFrame {
    let mut samples = Vec::new();
    let mut features = Vec::new();
    let mut views = Vec::new();
    let mut groups = Vec::new();
    let mut values = Vec::new();
    for m in 0..NUM_VIEWS {
        for g in 0..NUM_GROUPS {
            for d in 0..FEATURES_PER_VIEW {
                for n in 0..samples_per_group {
                    if d > 0 && rng.gen_bool(MISSING_RATE) {
                        continue;
                    }
                    samples.push(sample_name(g, n));
                    features.push(format!("v{m}_f{d}"));
                    views.push(format!("view{m}"));
                    groups.push(format!("group{g}"));
                    values.push(rng.gen_range(-3.0..3.0));
                }
            }
        }
    }
    DataFrame::new(vec![
        Column::new("sample".into(), samples),
        Column::new("feature".into(), features),
        Column::new("view".into(), views),
        Column::new("group".into(), groups),
        Column::new("value".into(), values),
    ])
    .expect("benchmark table")
}

fn wide_views(samples_per_group: usize, rng: &mut StdRng) -> MatrixInput {
    let n_samples = samples_per_group * NUM_GROUPS;
    let sample_names: Vec<String> = (0..NUM_GROUPS)
        .flat_map(|g| (0..samples_per_group).map(move |n| sample_name(g, n)))
        .collect();
    let views = (0..NUM_VIEWS)
        .map(|m| {
            let values = Array2::from_shape_fn((FEATURES_PER_VIEW, n_samples), |_| {
                if rng.gen_bool(MISSING_RATE) { f64::NAN } else { rng.gen_range(-3.0..3.0) }
            });
            ViewMatrix::dense(values)
                .named(format!("view{m}"))
                .with_features((0..FEATURES_PER_VIEW).map(|d| format!("v{m}_f{d}")))
                .with_samples(sample_names.clone())
        })
        .collect();
    let labels: Vec<String> = (0..NUM_GROUPS)
        .flat_map(|g| std::iter::repeat_n(format!("group{g}"), samples_per_group))
        .collect();
    MatrixInput::new(views).with_groups(labels)
}

fn bench_ingestion(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut group = c.benchmark_group("ingest");
    group.sample_size(10);

    for &samples_per_group in &SAMPLES_PER_GROUP {
        let cells = (NUM_VIEWS * NUM_GROUPS * FEATURES_PER_VIEW * samples_per_group) as u64;
        group.throughput(Throughput::Elements(cells));

        let table = long_table(samples_per_group, &mut rng);
        group.bench_with_input(
            BenchmarkId::new("long_table", samples_per_group),
            &table,
            |b, table| {
                b.iter(|| {
                    let ingested = ingest(IngestInput::LongTable(table.clone())).expect("ingest");
                    black_box(ingested.dataset.missing_count())
                })
            },
        );

        let matrices = wide_views(samples_per_group, &mut rng);
        group.bench_with_input(
            BenchmarkId::new("matrices", samples_per_group),
            &matrices,
            |b, matrices| {
                b.iter(|| {
                    let ingested = ingest(IngestInput::Matrices(matrices.clone())).expect("ingest");
                    black_box(ingested.dataset.missing_count())
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_ingestion);
criterion_main!(benches);
