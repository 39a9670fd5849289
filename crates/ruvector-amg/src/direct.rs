//! Dense LU factorisation for the coarsest level.
//!
//! The coarsest operator is small by construction (at most `coarse_enough`
//! rows unless the level cap stops coarsening early), so a dense factorisation
//! with partial pivoting is factorised once during setup and reused by every
//! cycle.

use tracing::warn;

use crate::error::SolverError;
use crate::types::CsrMatrix;

/// Row count above which a dense coarsest factorisation is logged as costly.
const DENSE_WARN_ROWS: usize = 5_000;

/// LU factors of a square matrix with row pivoting, `P A = L U`.
#[derive(Debug, Clone)]
pub struct DenseLu {
    n: usize,
    /// Row-major packed factors: strict lower part is `L` (unit diagonal),
    /// upper part including the diagonal is `U`.
    lu: Vec<f64>,
    /// `piv[k]` is the original row placed at position `k`.
    piv: Vec<usize>,
}

impl DenseLu {
    /// Factorise `a`.
    ///
    /// # Errors
    ///
    /// [`SolverError::DegenerateInput`] if `a` is not square or a pivot is
    /// negligible relative to the largest entry (singular or numerically
    /// singular matrix).
    pub fn factorize(a: &CsrMatrix<f64>) -> Result<Self, SolverError> {
        if a.rows != a.cols {
            return Err(SolverError::degenerate(format!(
                "coarsest operator is not square ({}x{})",
                a.rows, a.cols
            )));
        }
        let n = a.rows;
        if n > DENSE_WARN_ROWS {
            warn!(rows = n, "dense coarsest factorisation on a large operator");
        }

        let mut lu = vec![0.0; n * n];
        let mut max_abs: f64 = 0.0;
        for i in 0..n {
            for (j, &v) in a.row_entries(i) {
                lu[i * n + j] += v;
                max_abs = max_abs.max(v.abs());
            }
        }
        let tiny = f64::EPSILON * n as f64 * max_abs;
        let mut piv: Vec<usize> = (0..n).collect();

        for k in 0..n {
            let mut p = k;
            let mut best = lu[k * n + k].abs();
            for i in (k + 1)..n {
                let v = lu[i * n + k].abs();
                if v > best {
                    best = v;
                    p = i;
                }
            }
            if best <= tiny {
                return Err(SolverError::degenerate(format!(
                    "coarsest operator is singular (pivot {best:.3e} in column {k})"
                )));
            }
            if p != k {
                for j in 0..n {
                    lu.swap(k * n + j, p * n + j);
                }
                piv.swap(k, p);
            }

            let pivot = lu[k * n + k];
            for i in (k + 1)..n {
                let factor = lu[i * n + k] / pivot;
                lu[i * n + k] = factor;
                if factor != 0.0 {
                    for j in (k + 1)..n {
                        lu[i * n + j] -= factor * lu[k * n + j];
                    }
                }
            }
        }

        Ok(Self { n, lu, piv })
    }

    /// Dimension of the factorised matrix.
    pub fn rows(&self) -> usize {
        self.n
    }

    /// Solve `A x = rhs`.
    pub fn solve(&self, rhs: &[f64], x: &mut [f64]) {
        let n = self.n;
        debug_assert!(rhs.len() >= n && x.len() >= n);

        for (k, &p) in self.piv.iter().enumerate() {
            x[k] = rhs[p];
        }
        for i in 0..n {
            let row = &self.lu[i * n..i * n + i];
            let s: f64 = row.iter().zip(&x[..i]).map(|(l, xj)| l * xj).sum();
            x[i] -= s;
        }
        for i in (0..n).rev() {
            let row = &self.lu[i * n + i + 1..(i + 1) * n];
            let s: f64 = row.iter().zip(&x[i + 1..n]).map(|(u, xj)| u * xj).sum();
            x[i] = (x[i] - s) / self.lu[i * n + i];
        }
    }
}
