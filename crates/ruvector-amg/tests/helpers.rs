//! Shared test helpers for the ruvector-amg integration test suite.
//!
//! Provides model problems, seeded random systems, a dense reference solver
//! and vector utilities used across all test modules.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ruvector_amg::types::CsrMatrix;
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Metadata, Subscriber};

// ---------------------------------------------------------------------------
// Model problems
// ---------------------------------------------------------------------------

/// Tridiagonal `[-1, 2, -1]` matrix of dimension `n`.
pub fn poisson_1d(n: usize) -> CsrMatrix<f64> {
    let mut entries = Vec::with_capacity(3 * n);
    for i in 0..n {
        entries.push((i, i, 2.0));
        if i > 0 {
            entries.push((i, i - 1, -1.0));
        }
        if i + 1 < n {
            entries.push((i, i + 1, -1.0));
        }
    }
    CsrMatrix::<f64>::from_coo(n, n, entries)
}

/// Five-point Laplacian on an `m x m` grid with Dirichlet boundaries.
pub fn poisson_2d(m: usize) -> CsrMatrix<f64> {
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

/// Random sparse SPD matrix: a weighted graph Laplacian over a chain plus
/// `extra` random edges per row, shifted by `shift` on the diagonal.
pub fn random_spd_csr(n: usize, extra: usize, shift: f64, seed: u64) -> CsrMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut entries = Vec::new();
    let mut degree = vec![0.0f64; n];
    let mut edge = |i: usize, j: usize, w: f64, entries: &mut Vec<(usize, usize, f64)>| {
        entries.push((i, j, -w));
        entries.push((j, i, -w));
        degree[i] += w;
        degree[j] += w;
    };
    for i in 0..n.saturating_sub(1) {
        let w = rng.gen_range(0.5..2.0);
        edge(i, i + 1, w, &mut entries);
    }
    for i in 0..n {
        for _ in 0..extra {
            let j = rng.gen_range(0..n);
            if j != i {
                let w = rng.gen_range(0.1..1.0);
                edge(i, j, w, &mut entries);
            }
        }
    }
    for (i, d) in degree.into_iter().enumerate() {
        entries.push((i, i, d + shift));
    }
    CsrMatrix::<f64>::from_coo(n, n, entries)
}

/// Seeded random vector with entries in `[-1, 1)`.
pub fn random_vector(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

// ---------------------------------------------------------------------------
// Dense reference solver
// ---------------------------------------------------------------------------

/// Solve `Ax = b` using dense Gaussian elimination with partial pivoting.
///
/// # Panics
///
/// Panics if the matrix is singular or dimensions are inconsistent.
pub fn dense_solve(matrix: &CsrMatrix<f64>, rhs: &[f64]) -> Vec<f64> {
    let n = matrix.rows;
    assert_eq!(n, matrix.cols, "dense_solve requires a square matrix");
    assert_eq!(rhs.len(), n, "rhs length must match matrix dimension");

    let mut aug = vec![vec![0.0f64; n + 1]; n];
    for i in 0..n {
        aug[i][n] = rhs[i];
        for (j, &v) in matrix.row_entries(i) {
            aug[i][j] = v;
        }
    }

    for col in 0..n {
        let max_row = (col..n)
            .max_by(|&a, &b| aug[a][col].abs().total_cmp(&aug[b][col].abs()))
            .unwrap();
        assert!(aug[max_row][col].abs() > 1e-15, "matrix is singular");
        aug.swap(col, max_row);
        let pivot = aug[col][col];
        for row in (col + 1)..n {
            let factor = aug[row][col] / pivot;
            for j in col..=n {
                aug[row][j] -= factor * aug[col][j];
            }
        }
    }

    let mut x = vec![0.0f64; n];
    for i in (0..n).rev() {
        let s: f64 = ((i + 1)..n).map(|j| aug[i][j] * x[j]).sum();
        x[i] = (aug[i][n] - s) / aug[i][i];
    }
    x
}

// ---------------------------------------------------------------------------
// Vector utilities
// ---------------------------------------------------------------------------

/// L2 norm of a vector.
pub fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|&x| x * x).sum::<f64>().sqrt()
}

/// `||approx - exact|| / ||exact||`, or the absolute error for a zero
/// `exact`.
pub fn relative_error(approx: &[f64], exact: &[f64]) -> f64 {
    assert_eq!(approx.len(), exact.len(), "vectors must have same length");
    let err = approx
        .iter()
        .zip(exact)
        .map(|(a, e)| (a - e) * (a - e))
        .sum::<f64>()
        .sqrt();
    let norm = l2_norm(exact);
    if norm > 1e-15 {
        err / norm
    } else {
        err
    }
}

/// `b - A x`.
pub fn compute_residual(matrix: &CsrMatrix<f64>, x: &[f64], rhs: &[f64]) -> Vec<f64> {
    let mut ax = vec![0.0f64; matrix.rows];
    matrix.spmv(x, &mut ax);
    rhs.iter().zip(&ax).map(|(b, y)| b - y).collect()
}

/// `A x` for a known `x`, giving a right-hand side with known solution.
pub fn rhs_for(matrix: &CsrMatrix<f64>, x: &[f64]) -> Vec<f64> {
    let mut b = vec![0.0f64; matrix.rows];
    matrix.spmv(x, &mut b);
    b
}

/// Split `0..n` into `parts` contiguous ranges of nearly equal length.
pub fn block_ranges(n: usize, parts: usize) -> Vec<(usize, usize)> {
    (0..parts)
        .map(|p| (p * n / parts, (p + 1) * n / parts))
        .collect()
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Subscriber that records the name of every span created while it is the
/// thread's default.
#[derive(Clone, Default)]
pub struct SpanNames {
    names: Arc<Mutex<Vec<&'static str>>>,
    next_id: Arc<AtomicU64>,
}

impl SpanNames {
    /// Run `f` with this recorder installed as the default subscriber.
    pub fn capture<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::subscriber::with_default(self.clone(), f)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.names.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|n| **n == name).count()
    }
}

impl Subscriber for SpanNames {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, span: &Attributes<'_>) -> Id {
        self.names.lock().unwrap().push(span.metadata().name());
        Id::from_u64(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn record(&self, _: &Id, _: &Record<'_>) {}

    fn record_follows_from(&self, _: &Id, _: &Id) {}

    fn event(&self, _: &Event<'_>) {}

    fn enter(&self, _: &Id) {}

    fn exit(&self, _: &Id) {}
}
