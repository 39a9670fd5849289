//! Linear-algebra backends.
//!
//! The hierarchy is built on host matrices ([`Backend::Host`]) and then moved
//! into backend storage. The cycle engine only ever touches backend matrices
//! and vectors through the operations below, so the same engine runs on a
//! single process ([`Builtin`]) or across ranks
//! ([`DistributedBackend`](crate::distributed::DistributedBackend)).

use crate::direct::DenseLu;
use crate::error::SolverError;
use crate::types::CsrMatrix;

/// Operations the hierarchy builder and the cycle engine need from a
/// linear-algebra backend.
///
/// Vector operations work on the rank-local part of a vector; reductions
/// ([`inner_product`](Backend::inner_product), [`norm`](Backend::norm)) and
/// matrix products are global. In a distributed backend every method that
/// talks to other ranks is collective and must be called by all ranks in the
/// same order.
pub trait Backend {
    /// Host-side matrix the hierarchy is built from.
    type Host;
    /// Backend matrix used during cycles.
    type Matrix;
    /// Backend vector.
    type Vector;
    /// Factorised coarsest-level solver.
    type DirectSolver;

    /// Rows of `a` stored on this rank.
    fn host_rows(&self, a: &Self::Host) -> usize;

    /// Rows of `a` over all ranks.
    fn global_rows(&self, a: &Self::Host) -> usize;

    /// Non-zeros of `a` over all ranks.
    fn global_nnz(&self, a: &Self::Host) -> usize;

    /// Diagonal of `a` for relaxation.
    ///
    /// # Errors
    ///
    /// [`SolverError::DegenerateInput`] if any diagonal entry is zero.
    fn relaxation_diagonal(&self, a: &Self::Host) -> Result<Self::Vector, SolverError>;

    /// Move a host matrix into backend storage.
    fn copy_matrix(&self, a: Self::Host) -> Result<Self::Matrix, SolverError>;

    /// Factorise the coarsest operator. The hierarchy moves `a` into
    /// [`copy_matrix`](Backend::copy_matrix) afterwards, so no copy of the
    /// host matrix is taken.
    fn direct_solver(&self, a: &Self::Host) -> Result<Self::DirectSolver, SolverError>;

    /// Zero vector of the given local length.
    fn create_vector(&self, len: usize) -> Self::Vector;

    /// `y = x`.
    fn copy_vector(&self, x: &Self::Vector, y: &mut Self::Vector);

    /// `x = 0`.
    fn clear(&self, x: &mut Self::Vector);

    /// `y = alpha * A * x + beta * y`.
    fn spmv(
        &self,
        alpha: f64,
        a: &Self::Matrix,
        x: &Self::Vector,
        beta: f64,
        y: &mut Self::Vector,
    );

    /// `r = rhs - A * x`.
    fn residual(&self, rhs: &Self::Vector, a: &Self::Matrix, x: &Self::Vector, r: &mut Self::Vector);

    /// `y = a * x + b * y`.
    fn axpby(&self, a: f64, x: &Self::Vector, b: f64, y: &mut Self::Vector);

    /// `x += alpha * t / d`, element-wise.
    fn scaled_diag_update(&self, alpha: f64, t: &Self::Vector, d: &Self::Vector, x: &mut Self::Vector);

    /// Global inner product.
    fn inner_product(&self, x: &Self::Vector, y: &Self::Vector) -> f64;

    /// Global Euclidean norm.
    fn norm(&self, x: &Self::Vector) -> f64 {
        self.inner_product(x, x).sqrt()
    }

    /// `x = A^{-1} rhs` on the coarsest level.
    fn direct_solve(&self, solver: &Self::DirectSolver, rhs: &Self::Vector, x: &mut Self::Vector);

    /// Whether `flag` holds on any rank. Drivers use it so that every rank
    /// takes the same branch on rank-local decisions such as timeouts.
    fn any_rank(&self, flag: bool) -> bool {
        flag
    }
}

/// Single-process backend: CSR matrices and `Vec<f64>` vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Builtin;

impl Backend for Builtin {
    type Host = CsrMatrix<f64>;
    type Matrix = CsrMatrix<f64>;
    type Vector = Vec<f64>;
    type DirectSolver = DenseLu;

    fn host_rows(&self, a: &CsrMatrix<f64>) -> usize {
        a.rows
    }

    fn global_rows(&self, a: &CsrMatrix<f64>) -> usize {
        a.rows
    }

    fn global_nnz(&self, a: &CsrMatrix<f64>) -> usize {
        a.nnz()
    }

    fn relaxation_diagonal(&self, a: &CsrMatrix<f64>) -> Result<Vec<f64>, SolverError> {
        let diag = a.diagonal();
        if let Some(row) = diag.iter().position(|&d| d == 0.0) {
            return Err(SolverError::degenerate(format!(
                "zero diagonal entry in row {row}"
            )));
        }
        Ok(diag)
    }

    fn copy_matrix(&self, a: CsrMatrix<f64>) -> Result<CsrMatrix<f64>, SolverError> {
        Ok(a)
    }

    fn direct_solver(&self, a: &CsrMatrix<f64>) -> Result<DenseLu, SolverError> {
        DenseLu::factorize(a)
    }

    fn create_vector(&self, len: usize) -> Vec<f64> {
        vec![0.0; len]
    }

    fn copy_vector(&self, x: &Vec<f64>, y: &mut Vec<f64>) {
        y.copy_from_slice(x);
    }

    fn clear(&self, x: &mut Vec<f64>) {
        x.fill(0.0);
    }

    fn spmv(&self, alpha: f64, a: &CsrMatrix<f64>, x: &Vec<f64>, beta: f64, y: &mut Vec<f64>) {
        a.spmv_scaled(alpha, x, beta, y);
    }

    fn residual(&self, rhs: &Vec<f64>, a: &CsrMatrix<f64>, x: &Vec<f64>, r: &mut Vec<f64>) {
        r.copy_from_slice(rhs);
        a.spmv_scaled(-1.0, x, 1.0, r);
    }

    fn axpby(&self, a: f64, x: &Vec<f64>, b: f64, y: &mut Vec<f64>) {
        if b == 0.0 {
            for (yi, &xi) in y.iter_mut().zip(x) {
                *yi = a * xi;
            }
        } else {
            for (yi, &xi) in y.iter_mut().zip(x) {
                *yi = a * xi + b * *yi;
            }
        }
    }

    fn scaled_diag_update(&self, alpha: f64, t: &Vec<f64>, d: &Vec<f64>, x: &mut Vec<f64>) {
        for ((xi, &ti), &di) in x.iter_mut().zip(t).zip(d) {
            *xi += alpha * ti / di;
        }
    }

    fn inner_product(&self, x: &Vec<f64>, y: &Vec<f64>) -> f64 {
        x.iter().zip(y).map(|(a, b)| a * b).sum()
    }

    fn direct_solve(&self, solver: &DenseLu, rhs: &Vec<f64>, x: &mut Vec<f64>) {
        solver.solve(rhs, x);
    }
}
