//! Solver and preconditioner traits.
//!
//! [`SolverEngine`] is the one-call interface on single-process CSR systems.
//! [`Preconditioner`] is the seam between a Krylov driver and anything that
//! approximates `A^{-1}` on a [`Backend`], a multigrid [`Hierarchy`] first of
//! all.

use crate::backend::Backend;
use crate::cycle::Workspace;
use crate::error::SolverError;
use crate::hierarchy::Hierarchy;
use crate::types::{ComputeBudget, CsrMatrix, SolveMethod, SolverResult};

/// Core trait that every solve driver implements.
pub trait SolverEngine: Send + Sync {
    /// Solve the linear system `A x = b` subject to the given compute budget,
    /// starting from `x = 0`.
    ///
    /// # Errors
    ///
    /// Returns [`SolverError`] on invalid input, setup failure,
    /// non-convergence, numerical breakdown, or budget exhaustion.
    fn solve(
        &self,
        matrix: &CsrMatrix<f64>,
        rhs: &[f64],
        budget: &ComputeBudget,
    ) -> Result<SolverResult, SolverError>;

    /// Return the method identifier for this engine.
    fn method(&self) -> SolveMethod;
}

/// An approximate inverse of the system matrix.
pub trait Preconditioner<B: Backend> {
    /// Per-caller scratch state.
    type Workspace;

    /// Backend the preconditioner operates on.
    fn backend(&self) -> &B;

    /// The matrix being preconditioned.
    fn system_matrix(&self) -> &B::Matrix;

    /// Local length of vectors this preconditioner accepts.
    fn local_rows(&self) -> usize;

    /// Allocate scratch state.
    fn workspace(&self) -> Self::Workspace;

    /// `x = M^{-1} rhs`; the previous content of `x` is discarded.
    fn apply(&self, workspace: &mut Self::Workspace, rhs: &B::Vector, x: &mut B::Vector);
}

impl<B: Backend> Preconditioner<B> for Hierarchy<B> {
    type Workspace = Workspace<B>;

    fn backend(&self) -> &B {
        Hierarchy::backend(self)
    }

    fn system_matrix(&self) -> &B::Matrix {
        Hierarchy::system_matrix(self)
    }

    fn local_rows(&self) -> usize {
        self.levels()[0].info().local_rows
    }

    fn workspace(&self) -> Workspace<B> {
        Hierarchy::workspace(self)
    }

    /// One cycle from a zero initial guess.
    fn apply(&self, workspace: &mut Workspace<B>, rhs: &B::Vector, x: &mut B::Vector) {
        Hierarchy::backend(self).clear(x);
        self.cycle_with(workspace, rhs, x);
    }
}
