//! Aggregation-based algebraic multigrid for sparse linear systems.
//!
//! This crate builds a multigrid hierarchy from a sparse matrix in CSR format
//! by non-smoothed aggregation and applies V- or K-cycles with damped Jacobi
//! relaxation. A hierarchy can be used as a stand-alone iterative solver or
//! as a preconditioner for conjugate gradients.
//!
//! # Components
//!
//! | Module | Feature gate | Role |
//! |--------|-------------|------|
//! | [`aggregates`] | | Strength of connection and plain aggregation |
//! | [`coarsening`] | | Transfer operators and scaled Galerkin products |
//! | [`hierarchy`] | | Level construction and coarsest-level factorisation |
//! | [`cycle`] | | V-cycle and K-cycle engine |
//! | [`solver`] | | Stationary AMG and AMG-preconditioned CG drivers |
//! | [`distributed`] | `distributed` | Row-distributed matrices and repartitioning |
//!
//! # Example
//!
//! ```rust
//! use ruvector_amg::solver::AmgSolver;
//! use ruvector_amg::hierarchy::AmgParams;
//! use ruvector_amg::traits::SolverEngine;
//! use ruvector_amg::types::{ComputeBudget, CsrMatrix};
//!
//! // 1D Poisson problem.
//! let n = 200;
//! let mut entries = Vec::new();
//! for i in 0..n {
//!     entries.push((i, i, 2.0));
//!     if i > 0 {
//!         entries.push((i, i - 1, -1.0));
//!     }
//!     if i + 1 < n {
//!         entries.push((i, i + 1, -1.0));
//!     }
//! }
//! let matrix = CsrMatrix::<f64>::from_coo(n, n, entries);
//! let rhs = vec![1.0; n];
//!
//! let solver = AmgSolver::new(AmgParams { coarse_enough: 20, ..AmgParams::default() });
//! let result = solver.solve(&matrix, &rhs, &ComputeBudget::default()).unwrap();
//! assert!(result.residual_norm < 1e-4);
//! ```

pub mod aggregates;
pub mod backend;
pub mod budget;
pub mod coarsening;
pub mod cycle;
pub mod direct;
pub mod error;
pub mod hierarchy;
pub mod solver;
pub mod traits;
pub mod types;
pub mod validation;

#[cfg(feature = "distributed")]
pub mod distributed;
