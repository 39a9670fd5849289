//! Compute budget enforcement for the solve drivers.
//!
//! [`BudgetEnforcer`] tracks wall-clock time and iteration count against a
//! [`ComputeBudget`]. Drivers loop while
//! [`has_iterations_left`](BudgetEnforcer::has_iterations_left) holds and
//! start each pass with [`next_iteration`](BudgetEnforcer::next_iteration).
//! Running out of iterations is reported by the driver as non-convergence;
//! running out of time is a [`SolverError::BudgetExhausted`].
//!
//! The time check is split from the error so a distributed driver can agree
//! on it across ranks before bailing out (see
//! [`Backend::any_rank`](crate::backend::Backend::any_rank)).

use std::time::{Duration, Instant};

use crate::error::SolverError;
use crate::types::ComputeBudget;

/// Enforces wall-time and iteration budgets during one solve.
///
/// Non-`Clone`: each solve owns exactly one.
///
/// # Example
///
/// ```
/// use ruvector_amg::budget::BudgetEnforcer;
/// use ruvector_amg::types::ComputeBudget;
///
/// let mut enforcer = BudgetEnforcer::new(ComputeBudget::default());
/// while enforcer.has_iterations_left() {
///     if enforcer.over_time() {
///         return;
///     }
///     if enforcer.next_iteration() == 3 {
///         break;
///     }
/// }
/// assert_eq!(enforcer.iterations_used(), 4);
/// ```
pub struct BudgetEnforcer {
    start_time: Instant,
    budget: ComputeBudget,
    iterations_used: usize,
}

impl BudgetEnforcer {
    /// Create a new enforcer; the wall-clock timer starts immediately.
    pub fn new(budget: ComputeBudget) -> Self {
        Self {
            start_time: Instant::now(),
            budget,
            iterations_used: 0,
        }
    }

    /// Whether another iteration fits in the iteration budget.
    #[inline]
    pub fn has_iterations_left(&self) -> bool {
        self.iterations_used < self.budget.max_iterations
    }

    /// Start the next iteration and return its 0-based index.
    #[inline]
    pub fn next_iteration(&mut self) -> usize {
        let iteration = self.iterations_used;
        self.iterations_used += 1;
        iteration
    }

    /// Whether the wall-clock limit has been exceeded.
    #[inline]
    pub fn over_time(&self) -> bool {
        self.start_time.elapsed() > self.budget.max_time
    }

    /// The error describing an exhausted wall-clock budget.
    pub fn time_exhausted(&self) -> SolverError {
        let elapsed = self.start_time.elapsed();
        SolverError::BudgetExhausted {
            reason: format!(
                "wall-clock time limit reached ({:.2?} > {:.2?}) after {} iterations",
                elapsed, self.budget.max_time, self.iterations_used,
            ),
            elapsed,
        }
    }

    /// Iterations started so far.
    #[inline]
    pub fn iterations_used(&self) -> usize {
        self.iterations_used
    }

    /// Wall-clock time since the enforcer was created.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// The budget being enforced.
    #[inline]
    pub fn budget(&self) -> &ComputeBudget {
        &self.budget
    }
}
