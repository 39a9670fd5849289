//! Core types for the multigrid solver.
//!
//! Provides [`CsrMatrix`] for compressed sparse row storage, the sparse
//! kernels the hierarchy builder needs (transpose, sparse product, scaling),
//! and result types for solver convergence tracking.

use std::time::Duration;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ---------------------------------------------------------------------------
// CsrMatrix<T>
// ---------------------------------------------------------------------------

/// Compressed Sparse Row (CSR) matrix.
///
/// # Layout
///
/// For a matrix with `m` rows and `nnz` non-zeros:
/// - `row_ptr` has length `m + 1`, starts at 0 and never decreases
/// - `col_indices` and `values` each have length `nnz`
/// - Row `i` spans indices `row_ptr[i]..row_ptr[i+1]`
///
/// Constructors in this module never produce a row with a repeated column.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    /// Row pointers: `row_ptr[i]` is the start index in `col_indices`/`values`
    /// for row `i`.
    pub row_ptr: Vec<usize>,
    /// Column indices for each non-zero entry.
    pub col_indices: Vec<usize>,
    /// Values for each non-zero entry.
    pub values: Vec<T>,
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
}

impl<T: Copy + Default + std::ops::Mul<Output = T> + std::ops::AddAssign> CsrMatrix<T> {
    /// Sparse matrix-vector multiply: `y = A * x`.
    ///
    /// # Panics
    ///
    /// Debug-asserts that `x.len() >= self.cols` and `y.len() >= self.rows`.
    #[inline]
    pub fn spmv(&self, x: &[T], y: &mut [T]) {
        debug_assert!(
            x.len() >= self.cols,
            "spmv: x.len()={} < cols={}",
            x.len(),
            self.cols,
        );
        debug_assert!(
            y.len() >= self.rows,
            "spmv: y.len()={} < rows={}",
            y.len(),
            self.rows,
        );

        for (i, yi) in y.iter_mut().enumerate().take(self.rows) {
            let mut sum = T::default();
            for (c, &v) in self.row_entries(i) {
                sum += v * x[c];
            }
            *yi = sum;
        }
    }
}

impl<T> CsrMatrix<T> {
    /// Number of non-zero entries.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Number of stored entries in a specific row.
    #[inline]
    pub fn row_degree(&self, row: usize) -> usize {
        self.row_ptr[row + 1] - self.row_ptr[row]
    }

    /// Iterate over `(col_index, &value)` pairs for the given row.
    #[inline]
    pub fn row_entries(&self, row: usize) -> impl Iterator<Item = (usize, &T)> {
        let start = self.row_ptr[row];
        let end = self.row_ptr[row + 1];
        self.col_indices[start..end]
            .iter()
            .copied()
            .zip(self.values[start..end].iter())
    }

    /// Release all storage, leaving a `0 x 0` matrix behind.
    ///
    /// Used when ownership of a matrix moves into the hierarchy and the
    /// host copy must not keep its memory alive.
    pub fn clear(&mut self) {
        self.row_ptr = vec![0];
        self.col_indices = Vec::new();
        self.values = Vec::new();
        self.rows = 0;
        self.cols = 0;
    }
}

impl<T: Copy + Default> CsrMatrix<T> {
    /// Transpose: produces `A^T` in CSR form.
    ///
    /// Two-pass counting sort in O(nnz + rows + cols) time. Column indices in
    /// every output row come out sorted because input rows are scanned in
    /// order.
    pub fn transpose(&self) -> CsrMatrix<T> {
        let nnz = self.nnz();
        let t_rows = self.cols;
        let t_cols = self.rows;

        let mut row_ptr = vec![0usize; t_rows + 1];
        for &c in &self.col_indices {
            row_ptr[c + 1] += 1;
        }
        for i in 1..=t_rows {
            row_ptr[i] += row_ptr[i - 1];
        }

        let mut col_indices = vec![0usize; nnz];
        let mut values = vec![T::default(); nnz];
        let mut cursor = row_ptr.clone();

        for row in 0..self.rows {
            for idx in self.row_ptr[row]..self.row_ptr[row + 1] {
                let c = self.col_indices[idx];
                let dest = cursor[c];
                col_indices[dest] = row;
                values[dest] = self.values[idx];
                cursor[c] += 1;
            }
        }

        CsrMatrix {
            row_ptr,
            col_indices,
            values,
            rows: t_rows,
            cols: t_cols,
        }
    }
}

impl<T: Copy + Default + std::ops::AddAssign> CsrMatrix<T> {
    /// Build a CSR matrix from COO (coordinate) triplets.
    ///
    /// Entries are sorted by (row, col); entries sharing a position are
    /// summed into one.
    ///
    /// # Panics
    ///
    /// Panics if a row or column index is out of bounds.
    pub fn from_coo_generic(
        rows: usize,
        cols: usize,
        entries: impl IntoIterator<Item = (usize, usize, T)>,
    ) -> Self {
        let mut sorted: Vec<_> = entries.into_iter().collect();
        sorted.sort_by_key(|&(r, c, _)| (r, c));

        let mut row_ptr = vec![0usize; rows + 1];
        let mut col_indices: Vec<usize> = Vec::with_capacity(sorted.len());
        let mut values: Vec<T> = Vec::with_capacity(sorted.len());
        let mut last: Option<(usize, usize)> = None;

        for (r, c, v) in sorted {
            assert!(r < rows, "row index {} out of bounds (rows={})", r, rows);
            assert!(c < cols, "col index {} out of bounds (cols={})", c, cols);
            if last == Some((r, c)) {
                if let Some(acc) = values.last_mut() {
                    *acc += v;
                }
                continue;
            }
            last = Some((r, c));
            row_ptr[r + 1] += 1;
            col_indices.push(c);
            values.push(v);
        }
        for i in 1..=rows {
            row_ptr[i] += row_ptr[i - 1];
        }

        Self {
            row_ptr,
            col_indices,
            values,
            rows,
            cols,
        }
    }
}

impl CsrMatrix<f64> {
    /// Build a CSR matrix from COO (coordinate) triplets, summing duplicates.
    pub fn from_coo(
        rows: usize,
        cols: usize,
        entries: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Self {
        Self::from_coo_generic(rows, cols, entries)
    }

    /// Build a square identity matrix of dimension `n`.
    pub fn identity(n: usize) -> Self {
        Self {
            row_ptr: (0..=n).collect(),
            col_indices: (0..n).collect(),
            values: vec![1.0; n],
            rows: n,
            cols: n,
        }
    }

    /// Scaled sparse matrix-vector multiply: `y = alpha * A * x + beta * y`.
    ///
    /// With `beta == 0` the previous content of `y` is ignored entirely, so
    /// uninitialised or non-finite garbage in `y` does not leak through.
    /// Row-parallel with the `parallel` feature.
    pub fn spmv_scaled(&self, alpha: f64, x: &[f64], beta: f64, y: &mut [f64]) {
        debug_assert!(x.len() >= self.cols);
        debug_assert!(y.len() >= self.rows);

        let row = |i: usize, yi: &mut f64| {
            let mut sum = 0.0;
            for (c, &v) in self.row_entries(i) {
                sum += v * x[c];
            }
            *yi = if beta == 0.0 {
                alpha * sum
            } else {
                alpha * sum + beta * *yi
            };
        };

        #[cfg(feature = "parallel")]
        y[..self.rows]
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, yi)| row(i, yi));

        #[cfg(not(feature = "parallel"))]
        y[..self.rows]
            .iter_mut()
            .enumerate()
            .for_each(|(i, yi)| row(i, yi));
    }

    /// Sparse matrix-matrix product `self * b`.
    ///
    /// Row-by-row (Gustavson) accumulation: the sparsity pattern is exactly
    /// the structural product, no entry is dropped by magnitude, and no
    /// symmetry is assumed.
    ///
    /// # Panics
    ///
    /// Panics if `self.cols != b.rows`.
    pub fn product(&self, b: &CsrMatrix<f64>) -> CsrMatrix<f64> {
        assert_eq!(
            self.cols, b.rows,
            "product: inner dimensions differ ({} vs {})",
            self.cols, b.rows
        );

        let mut out = CsrBuilder::new(self.rows, b.cols);
        for i in 0..self.rows {
            for (k, &a_ik) in self.row_entries(i) {
                for (j, &b_kj) in b.row_entries(k) {
                    out.add(j, a_ik * b_kj);
                }
            }
            out.finish_row();
        }
        out.build()
    }

    /// Multiply every stored value by `alpha`.
    pub fn scale(&mut self, alpha: f64) {
        for v in &mut self.values {
            *v *= alpha;
        }
    }

    /// Diagonal of the matrix; a row without a stored diagonal yields 0.
    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.rows)
            .map(|i| {
                self.row_entries(i)
                    .find(|&(c, _)| c == i)
                    .map_or(0.0, |(_, &v)| v)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Row-wise CSR assembly
// ---------------------------------------------------------------------------

/// Incremental CSR assembly with per-row accumulation of repeated columns.
///
/// A marker array remembers where each column was last written; a marker
/// pointing before the start of the current row is stale. Rows are sorted by
/// column when finished.
pub(crate) struct CsrBuilder {
    marker: Vec<usize>,
    row_ptr: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
    cols: usize,
}

impl CsrBuilder {
    pub(crate) fn new(rows_hint: usize, cols: usize) -> Self {
        let mut row_ptr = Vec::with_capacity(rows_hint + 1);
        row_ptr.push(0);
        Self {
            marker: vec![usize::MAX; cols],
            row_ptr,
            col_indices: Vec::new(),
            values: Vec::new(),
            cols,
        }
    }

    /// Add `v` at column `j` of the current row.
    #[inline]
    pub(crate) fn add(&mut self, j: usize, v: f64) {
        let row_start = self.row_ptr[self.row_ptr.len() - 1];
        let pos = self.marker[j];
        if pos != usize::MAX && pos >= row_start {
            self.values[pos] += v;
        } else {
            self.marker[j] = self.col_indices.len();
            self.col_indices.push(j);
            self.values.push(v);
        }
    }

    /// Close the current row.
    pub(crate) fn finish_row(&mut self) {
        let start = self.row_ptr[self.row_ptr.len() - 1];
        let cols = &self.col_indices[start..];
        if cols.windows(2).any(|w| w[0] > w[1]) {
            let mut row: Vec<(usize, f64)> = cols
                .iter()
                .copied()
                .zip(self.values[start..].iter().copied())
                .collect();
            row.sort_unstable_by_key(|&(c, _)| c);
            for (k, (c, v)) in row.into_iter().enumerate() {
                self.col_indices[start + k] = c;
                self.values[start + k] = v;
            }
        }
        self.row_ptr.push(self.col_indices.len());
    }

    pub(crate) fn build(self) -> CsrMatrix<f64> {
        CsrMatrix {
            rows: self.row_ptr.len() - 1,
            row_ptr: self.row_ptr,
            col_indices: self.col_indices,
            values: self.values,
            cols: self.cols,
        }
    }
}

// ---------------------------------------------------------------------------
// Solver result types
// ---------------------------------------------------------------------------

/// Solve method used by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SolveMethod {
    /// Stationary iteration: repeated multigrid cycles.
    Amg,
    /// Conjugate gradient preconditioned by one multigrid cycle.
    AmgPcg,
}

impl std::fmt::Display for SolveMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolveMethod::Amg => write!(f, "amg"),
            SolveMethod::AmgPcg => write!(f, "amg-pcg"),
        }
    }
}

/// Budget constraints for solver execution.
#[derive(Debug, Clone)]
pub struct ComputeBudget {
    /// Maximum wall-clock time allowed.
    pub max_time: Duration,
    /// Maximum number of iterations.
    pub max_iterations: usize,
    /// Target relative residual tolerance `||b - Ax|| / ||b||`.
    pub tolerance: f64,
}

impl Default for ComputeBudget {
    fn default() -> Self {
        Self {
            max_time: Duration::from_secs(30),
            max_iterations: 1000,
            tolerance: 1e-6,
        }
    }
}

/// Per-iteration convergence snapshot.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    /// Iteration index (0-based).
    pub iteration: usize,
    /// Relative residual L2 norm after this iteration.
    pub residual_norm: f64,
}

/// Convergence report of a driver run on backend vectors.
#[derive(Debug, Clone)]
pub struct SolveReport {
    /// Number of iterations performed.
    pub iterations: usize,
    /// Final relative residual L2 norm.
    pub residual_norm: f64,
    /// Wall-clock time taken.
    pub wall_time: Duration,
    /// Per-iteration convergence history.
    pub convergence_history: Vec<ConvergenceInfo>,
}

/// Result returned by a successful [`SolverEngine`](crate::traits::SolverEngine)
/// invocation.
#[derive(Debug, Clone)]
pub struct SolverResult {
    /// Solution vector x.
    pub solution: Vec<f64>,
    /// Number of iterations performed.
    pub iterations: usize,
    /// Final relative residual L2 norm.
    pub residual_norm: f64,
    /// Wall-clock time taken, hierarchy setup included.
    pub wall_time: Duration,
    /// Per-iteration convergence history.
    pub convergence_history: Vec<ConvergenceInfo>,
    /// Method used.
    pub method: SolveMethod,
}
