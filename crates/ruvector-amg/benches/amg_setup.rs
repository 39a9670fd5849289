//! Benchmarks for hierarchy setup.
//!
//! Setup is dominated by aggregation and the Galerkin triple product; these
//! benchmarks measure how both scale with the number of unknowns.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use ruvector_amg::aggregates::{AggregateBuilder, PlainAggregates};
use ruvector_amg::hierarchy::{AmgParams, Hierarchy};
use ruvector_amg::types::CsrMatrix;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Five-point Laplacian on an `m x m` grid.
fn poisson_2d(m: usize) -> CsrMatrix<f64> {
    let n = m * m;
    let mut entries = Vec::with_capacity(5 * n);
    for y in 0..m {
        for x in 0..m {
            let i = y * m + x;
            entries.push((i, i, 4.0));
            if x > 0 {
                entries.push((i, i - 1, -1.0));
            }
            if x + 1 < m {
                entries.push((i, i + 1, -1.0));
            }
            if y > 0 {
                entries.push((i, i - m, -1.0));
            }
            if y + 1 < m {
                entries.push((i, i + m, -1.0));
            }
        }
    }
    CsrMatrix::<f64>::from_coo(n, n, entries)
}

// ---------------------------------------------------------------------------
// Benchmark: aggregation alone
// ---------------------------------------------------------------------------

fn aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("amg_aggregation");
    group.warm_up_time(Duration::from_secs(2));

    let builder = PlainAggregates::default();
    for &m in &[32, 128, 256] {
        let a = poisson_2d(m);
        group.throughput(Throughput::Elements(a.nnz() as u64));
        group.bench_with_input(BenchmarkId::new("grid", m), &m, |b, _| {
            b.iter(|| builder.aggregates(criterion::black_box(&a)))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark: full hierarchy setup
// ---------------------------------------------------------------------------

fn hierarchy_setup(c: &mut Criterion) {
    let mut group = c.benchmark_group("amg_setup");
    group.warm_up_time(Duration::from_secs(3));

    let params = AmgParams::default();
    for &m in &[32, 128, 256] {
        let a = poisson_2d(m);
        group.sample_size(if m >= 256 { 20 } else { 60 });
        group.throughput(Throughput::Elements(a.nnz() as u64));
        group.bench_with_input(BenchmarkId::new("grid", m), &m, |b, _| {
            b.iter(|| Hierarchy::from_matrix(criterion::black_box(a.clone()), &params))
        });
    }
    group.finish();
}

criterion_group!(setup, aggregation, hierarchy_setup);
criterion_main!(setup);
