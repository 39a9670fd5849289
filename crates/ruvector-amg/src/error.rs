//! Error types for the multigrid crate.
//!
//! Setup failures are split into three families: bad configuration values,
//! degenerate matrices discovered while building a level, and failures of an
//! external collaborator such as the graph partitioner.
//! The solve drivers add convergence and budget errors on top. All errors
//! implement `std::error::Error` via `thiserror`.

use std::fmt;
use std::time::Duration;

/// Primary error type for hierarchy setup and solve operations.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    /// A configuration parameter is outside its admissible range.
    #[error("invalid configuration: {name} = {value} (expected {expected})")]
    Configuration {
        /// Parameter name, dotted for nested parameter blocks.
        name: String,
        /// The rejected value, rendered as a string.
        value: String,
        /// Human-readable description of the valid range.
        expected: String,
    },

    /// The input (or a coarse operator derived from it) cannot be processed,
    /// e.g. a zero diagonal on a relaxed level or a singular coarsest
    /// operator.
    #[error("degenerate input at level {level} (rank {rank}): {detail}")]
    DegenerateInput {
        /// Hierarchy level at which the problem was found.
        level: usize,
        /// Rank that detected the problem.
        rank: usize,
        /// Human-readable explanation.
        detail: String,
    },

    /// An external collaborator reported a failure.
    #[error("{collaborator} failed at level {level} (rank {rank}): {detail}")]
    Collaborator {
        /// Which collaborator failed.
        collaborator: Collaborator,
        /// Hierarchy level being built when the failure happened.
        level: usize,
        /// Rank reporting the failure.
        rank: usize,
        /// Collaborator-specific diagnostic.
        detail: String,
    },

    /// The caller supplied a malformed matrix, vector, or aggregate map.
    #[error("invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    /// The iterative driver did not converge within its iteration budget.
    #[error(
        "solver did not converge after {iterations} iterations (residual={residual:.2e}, tol={tolerance:.2e})"
    )]
    NonConvergence {
        /// Number of iterations completed.
        iterations: usize,
        /// Final relative residual norm.
        residual: f64,
        /// Target tolerance that was not reached.
        tolerance: f64,
    },

    /// NaN, infinity, or a Krylov breakdown was detected during a solve.
    #[error("numerical instability at iteration {iteration}: {detail}")]
    NumericalInstability {
        /// Iteration at which the instability was detected.
        iteration: usize,
        /// Human-readable explanation.
        detail: String,
    },

    /// The wall-clock budget of a solve was exhausted.
    #[error("compute budget exhausted: {reason}")]
    BudgetExhausted {
        /// Which budget limit was hit.
        reason: String,
        /// Wall-clock time elapsed before the budget was hit.
        elapsed: Duration,
    },
}

impl SolverError {
    /// Shorthand for [`SolverError::Configuration`].
    pub fn configuration(
        name: impl Into<String>,
        value: impl ToString,
        expected: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            name: name.into(),
            value: value.to_string(),
            expected: expected.into(),
        }
    }

    /// A [`SolverError::DegenerateInput`] on level 0, rank 0.
    ///
    /// Level and rank are filled in by the caller that knows them, see
    /// [`at_level`](Self::at_level) and [`on_rank`](Self::on_rank).
    pub fn degenerate(detail: impl Into<String>) -> Self {
        Self::DegenerateInput {
            level: 0,
            rank: 0,
            detail: detail.into(),
        }
    }

    /// A [`SolverError::Collaborator`] on level 0, rank 0.
    pub fn collaborator(collaborator: Collaborator, detail: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            level: 0,
            rank: 0,
            detail: detail.into(),
        }
    }

    /// Attach the hierarchy level to a setup error.
    ///
    /// Errors without level context are returned unchanged.
    pub fn at_level(mut self, at: usize) -> Self {
        match &mut self {
            Self::DegenerateInput { level, .. } | Self::Collaborator { level, .. } => *level = at,
            _ => {}
        }
        self
    }

    /// Attach the reporting rank to a setup error.
    pub fn on_rank(mut self, at: usize) -> Self {
        match &mut self {
            Self::DegenerateInput { rank, .. } | Self::Collaborator { rank, .. } => *rank = at,
            _ => {}
        }
        self
    }
}

/// External collaborators whose failures surface as
/// [`SolverError::Collaborator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collaborator {
    /// The graph partitioner used for repartitioning.
    GraphPartitioner,
}

impl fmt::Display for Collaborator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collaborator::GraphPartitioner => write!(f, "graph partitioner"),
        }
    }
}

/// Validation errors for matrices, vectors, and aggregate maps.
///
/// Raised eagerly before any setup work so that callers get clear
/// diagnostics rather than numerical garbage several levels down.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Dimensions are inconsistent (row_ptr length, rhs length, non-square).
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// A value is NaN or infinite where a finite number is required.
    #[error("non-finite value detected: {0}")]
    NonFiniteValue(String),

    /// A column index is out of bounds for the declared number of columns.
    #[error("column index {index} out of bounds for {cols} columns (row {row})")]
    IndexOutOfBounds {
        /// Offending column index.
        index: usize,
        /// Row containing the offending entry.
        row: usize,
        /// Declared column count.
        cols: usize,
    },

    /// The `row_ptr` array is not monotonically non-decreasing.
    #[error("row_ptr is not monotonically non-decreasing at position {position}")]
    NonMonotonicRowPtrs {
        /// Position in `row_ptr` where the violation was detected.
        position: usize,
    },

    /// A row lists the same column twice.
    #[error("duplicate column {col} in row {row}")]
    DuplicateColumn {
        /// Row containing the duplicate.
        row: usize,
        /// Repeated column index.
        col: usize,
    },

    /// Aggregate ids are not dense in `[0, count)`.
    #[error("aggregate ids are not dense: {0}")]
    SparseAggregates(String),
}
