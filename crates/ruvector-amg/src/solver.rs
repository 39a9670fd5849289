//! Solve drivers built on a multigrid hierarchy.
//!
//! - [`AmgSolver`]: stationary iteration, one cycle per iteration.
//! - [`PcgSolver`]: conjugate gradients preconditioned by one cycle from a
//!   zero initial guess.
//!
//! ```text
//! r = b - A*x
//! z = M^{-1} r
//! p = z
//! for k in 0..max_iterations:
//!     q     = A p
//!     alpha = (r.z) / (p.q)
//!     x    += alpha p
//!     r    -= alpha q
//!     if ||r|| <= tol * ||b||: converged
//!     z     = M^{-1} r
//!     beta  = (r.z)_new / (r.z)
//!     p     = z + beta p
//! ```
//!
//! Both drivers work on any [`Backend`] through `solve_with`; the
//! [`SolverEngine`] implementations are the single-process shortcut that
//! builds the hierarchy on the fly.
//!
//! Convergence is relative: `||b - A x|| <= budget.tolerance * ||b||`.
//! Every reduction is global, so all ranks of a distributed solve take the
//! same branches.

use std::time::Instant;

use tracing::{debug, instrument, trace, warn};

use crate::backend::{Backend, Builtin};
use crate::budget::BudgetEnforcer;
use crate::error::SolverError;
use crate::hierarchy::{AmgParams, Hierarchy};
use crate::traits::{Preconditioner, SolverEngine};
use crate::types::{
    ComputeBudget, ConvergenceInfo, CsrMatrix, SolveMethod, SolveReport, SolverResult,
};
use crate::validation::{validate_budget, validate_rhs};

// ═══════════════════════════════════════════════════════════════════════════
// Stationary AMG iteration
// ═══════════════════════════════════════════════════════════════════════════

/// Repeated multigrid cycles until the relative residual is small enough.
#[derive(Debug, Clone, Default)]
pub struct AmgSolver {
    params: AmgParams,
}

impl AmgSolver {
    /// Create a driver whose [`SolverEngine::solve`] builds hierarchies with
    /// `params`.
    pub fn new(params: AmgParams) -> Self {
        Self { params }
    }

    /// The hierarchy parameters.
    pub fn params(&self) -> &AmgParams {
        &self.params
    }

    /// Iterate cycles of `hierarchy` on `x` until convergence.
    ///
    /// # Errors
    ///
    /// * [`SolverError::Configuration`] -- invalid budget.
    /// * [`SolverError::NumericalInstability`] -- non-finite residual.
    /// * [`SolverError::NonConvergence`] -- iteration limit reached.
    /// * [`SolverError::BudgetExhausted`] -- wall-time limit exceeded.
    #[instrument(skip_all, fields(levels = hierarchy.num_levels()))]
    pub fn solve_with<B: Backend>(
        &self,
        hierarchy: &Hierarchy<B>,
        rhs: &B::Vector,
        x: &mut B::Vector,
        budget: &ComputeBudget,
    ) -> Result<SolveReport, SolverError> {
        validate_budget(budget)?;
        let backend = hierarchy.backend();
        let mut enforcer = BudgetEnforcer::new(budget.clone());
        let tol = budget.tolerance;

        let b_norm = backend.norm(rhs);
        if b_norm == 0.0 {
            debug!("zero rhs; returning zero solution");
            backend.clear(x);
            return Ok(report(&enforcer, 0.0, Vec::new()));
        }

        let mut workspace = hierarchy.workspace();
        let mut history = Vec::new();
        let mut rel = hierarchy.residual_norm(rhs, x) / b_norm;
        if rel <= tol {
            return Ok(report(&enforcer, rel, history));
        }

        while enforcer.has_iterations_left() {
            if backend.any_rank(enforcer.over_time()) {
                warn!(iterations = enforcer.iterations_used(), "wall-time budget exhausted");
                return Err(enforcer.time_exhausted());
            }
            let iteration = enforcer.next_iteration();

            hierarchy.cycle_with(&mut workspace, rhs, x);
            rel = hierarchy.residual_norm(rhs, x) / b_norm;
            history.push(ConvergenceInfo {
                iteration,
                residual_norm: rel,
            });
            trace!(iteration, residual = rel, "amg iteration");

            if !rel.is_finite() {
                return Err(SolverError::NumericalInstability {
                    iteration,
                    detail: format!("relative residual became {rel}"),
                });
            }
            if rel <= tol {
                debug!(iterations = iteration + 1, residual = rel, "amg converged");
                return Ok(report(&enforcer, rel, history));
            }
        }

        debug!(iterations = enforcer.iterations_used(), residual = rel, "amg did not converge");
        Err(SolverError::NonConvergence {
            iterations: enforcer.iterations_used(),
            residual: rel,
            tolerance: tol,
        })
    }
}

impl SolverEngine for AmgSolver {
    fn solve(
        &self,
        matrix: &CsrMatrix<f64>,
        rhs: &[f64],
        budget: &ComputeBudget,
    ) -> Result<SolverResult, SolverError> {
        let start = Instant::now();
        validate_rhs(rhs, matrix.rows)?;
        let hierarchy = Hierarchy::from_matrix(matrix.clone(), &self.params)?;
        let rhs = rhs.to_vec();
        let mut x = vec![0.0; matrix.rows];
        let report = self.solve_with(&hierarchy, &rhs, &mut x, budget)?;
        Ok(into_result(report, x, start, SolveMethod::Amg))
    }

    fn method(&self) -> SolveMethod {
        SolveMethod::Amg
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Preconditioned conjugate gradients
// ═══════════════════════════════════════════════════════════════════════════

/// Conjugate gradients preconditioned by a multigrid cycle.
///
/// Requires a symmetric positive-definite system. The preconditioner is
/// symmetric when `npre == npost` and `ncycle == 1`; K-cycles make it
/// nonlinear, which plain CG tolerates for a few levels but not in general.
#[derive(Debug, Clone, Default)]
pub struct PcgSolver {
    params: AmgParams,
}

impl PcgSolver {
    /// Create a driver whose [`SolverEngine::solve`] builds hierarchies with
    /// `params`.
    pub fn new(params: AmgParams) -> Self {
        Self { params }
    }

    /// The hierarchy parameters.
    pub fn params(&self) -> &AmgParams {
        &self.params
    }

    /// Run preconditioned CG on `x`, starting from its current content.
    ///
    /// # Errors
    ///
    /// * [`SolverError::Configuration`] -- invalid budget.
    /// * [`SolverError::NumericalInstability`] -- `p.Ap <= 0` or a
    ///   non-finite residual.
    /// * [`SolverError::NonConvergence`] -- iteration limit reached.
    /// * [`SolverError::BudgetExhausted`] -- wall-time limit exceeded.
    #[instrument(skip_all)]
    pub fn solve_with<B, P>(
        &self,
        precond: &P,
        rhs: &B::Vector,
        x: &mut B::Vector,
        budget: &ComputeBudget,
    ) -> Result<SolveReport, SolverError>
    where
        B: Backend,
        P: Preconditioner<B>,
    {
        validate_budget(budget)?;
        let backend = precond.backend();
        let a = precond.system_matrix();
        let n = precond.local_rows();
        let mut enforcer = BudgetEnforcer::new(budget.clone());
        let tol = budget.tolerance;

        let b_norm = backend.norm(rhs);
        if b_norm == 0.0 {
            debug!("zero rhs; returning zero solution");
            backend.clear(x);
            return Ok(report(&enforcer, 0.0, Vec::new()));
        }

        let mut r = backend.create_vector(n);
        backend.residual(rhs, a, x, &mut r);
        let mut rel = backend.norm(&r) / b_norm;
        let mut history = Vec::new();
        if rel <= tol {
            return Ok(report(&enforcer, rel, history));
        }

        let mut workspace = precond.workspace();
        let mut z = backend.create_vector(n);
        let mut p = backend.create_vector(n);
        let mut q = backend.create_vector(n);

        precond.apply(&mut workspace, &r, &mut z);
        backend.copy_vector(&z, &mut p);
        let mut rz = backend.inner_product(&r, &z);

        while enforcer.has_iterations_left() {
            if backend.any_rank(enforcer.over_time()) {
                warn!(iterations = enforcer.iterations_used(), "wall-time budget exhausted");
                return Err(enforcer.time_exhausted());
            }
            let k = enforcer.next_iteration();

            backend.spmv(1.0, a, &p, 0.0, &mut q);
            let pq = backend.inner_product(&p, &q);
            if pq <= 0.0 || pq.is_nan() {
                warn!(iteration = k, pq, "non-positive p.Ap");
                return Err(SolverError::NumericalInstability {
                    iteration: k,
                    detail: format!("p.Ap = {pq:.6e} <= 0; matrix or preconditioner may not be SPD"),
                });
            }
            let alpha = rz / pq;
            backend.axpby(alpha, &p, 1.0, x);
            backend.axpby(-alpha, &q, 1.0, &mut r);

            rel = backend.norm(&r) / b_norm;
            history.push(ConvergenceInfo {
                iteration: k,
                residual_norm: rel,
            });
            trace!(iteration = k, residual = rel, "pcg iteration");

            if !rel.is_finite() {
                return Err(SolverError::NumericalInstability {
                    iteration: k,
                    detail: format!("relative residual became {rel}"),
                });
            }
            if rel <= tol {
                debug!(iterations = k + 1, residual = rel, "pcg converged");
                return Ok(report(&enforcer, rel, history));
            }

            precond.apply(&mut workspace, &r, &mut z);
            let rz_new = backend.inner_product(&r, &z);
            let beta = rz_new / rz;
            backend.axpby(1.0, &z, beta, &mut p);
            rz = rz_new;
        }

        debug!(iterations = enforcer.iterations_used(), residual = rel, "pcg did not converge");
        Err(SolverError::NonConvergence {
            iterations: enforcer.iterations_used(),
            residual: rel,
            tolerance: tol,
        })
    }
}

impl SolverEngine for PcgSolver {
    fn solve(
        &self,
        matrix: &CsrMatrix<f64>,
        rhs: &[f64],
        budget: &ComputeBudget,
    ) -> Result<SolverResult, SolverError> {
        let start = Instant::now();
        validate_rhs(rhs, matrix.rows)?;
        let hierarchy = Hierarchy::from_matrix(matrix.clone(), &self.params)?;
        let rhs = rhs.to_vec();
        let mut x = vec![0.0; matrix.rows];
        let report = self.solve_with::<Builtin, _>(&hierarchy, &rhs, &mut x, budget)?;
        Ok(into_result(report, x, start, SolveMethod::AmgPcg))
    }

    fn method(&self) -> SolveMethod {
        SolveMethod::AmgPcg
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn report(
    enforcer: &BudgetEnforcer,
    residual_norm: f64,
    convergence_history: Vec<ConvergenceInfo>,
) -> SolveReport {
    SolveReport {
        iterations: convergence_history.len(),
        residual_norm,
        wall_time: enforcer.elapsed(),
        convergence_history,
    }
}

fn into_result(
    report: SolveReport,
    solution: Vec<f64>,
    start: Instant,
    method: SolveMethod,
) -> SolverResult {
    SolverResult {
        solution,
        iterations: report.iterations,
        residual_norm: report.residual_norm,
        wall_time: start.elapsed(),
        convergence_history: report.convergence_history,
        method,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poisson_1d(n: usize) -> CsrMatrix<f64> {
        let mut entries = Vec::new();
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

    #[test]
    fn zero_rhs_gives_zero_solution() {
        let a = poisson_1d(20);
        let result = PcgSolver::default()
            .solve(&a, &vec![0.0; 20], &ComputeBudget::default())
            .unwrap();
        assert_eq!(result.iterations, 0);
        assert!(result.solution.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn single_level_stationary_solve_is_direct() {
        // 30 rows is below coarse_enough: one cycle is an exact solve.
        let a = poisson_1d(30);
        let rhs = vec![1.0; 30];
        let result = AmgSolver::default()
            .solve(&a, &rhs, &ComputeBudget::default())
            .unwrap();
        assert_eq!(result.iterations, 1);
        assert!(result.residual_norm < 1e-12);
        assert_eq!(result.method, SolveMethod::Amg);
    }

    #[test]
    fn rhs_length_mismatch_is_invalid_input() {
        let a = poisson_1d(10);
        let err = AmgSolver::default()
            .solve(&a, &[1.0; 3], &ComputeBudget::default())
            .unwrap_err();
        assert!(matches!(err, SolverError::InvalidInput(_)));
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let a = poisson_1d(2000);
        let rhs = vec![1.0; 2000];
        let params = AmgParams {
            coarse_enough: 10,
            ..AmgParams::default()
        };
        let budget = ComputeBudget {
            max_iterations: 1,
            tolerance: 1e-12,
            ..ComputeBudget::default()
        };
        let err = AmgSolver::new(params).solve(&a, &rhs, &budget).unwrap_err();
        assert!(matches!(
            err,
            SolverError::NonConvergence { iterations: 1, .. }
        ));
    }
}
