//! Non-smoothed aggregation coarsening.
//!
//! A coarsening strategy takes a level's system matrix and returns
//!
//! 1. a prolongation `P` that interpolates a coarse correction to the fine
//!    level,
//! 2. a restriction `R` that moves a fine residual to the coarse level,
//! 3. the coarse system matrix, a rescaled Galerkin product `(1/alpha) R A P`.
//!
//! With aggregation `P` is piecewise constant, which under-corrects smooth
//! error. Multiplying the correction by an over-interpolation factor
//! `alpha > 1`, or equivalently scaling the Galerkin operator by `1/alpha`,
//! compensates for that.

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span};

use crate::aggregates::{AggregateBuilder, Aggregates, AggregationParams, PlainAggregates};
use crate::error::SolverError;
use crate::types::CsrMatrix;

/// Coarsening parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoarseningParams {
    /// Aggregation parameters.
    pub aggr: AggregationParams,
    /// Over-interpolation factor `alpha`.
    pub over_interp: f64,
}

impl Default for CoarseningParams {
    fn default() -> Self {
        Self {
            aggr: AggregationParams::default(),
            over_interp: 1.5,
        }
    }
}

impl CoarseningParams {
    /// Check that `over_interp` is finite and positive and that the
    /// aggregation parameters are valid.
    pub fn validate(&self) -> Result<(), SolverError> {
        if !self.over_interp.is_finite() || self.over_interp <= 0.0 {
            return Err(SolverError::configuration(
                "over_interp",
                self.over_interp,
                "finite and > 0",
            ));
        }
        self.aggr.validate()
    }
}

/// Prolongation and restriction between two adjacent levels.
#[derive(Debug, Clone)]
pub struct TransferOperators<M> {
    /// Fine-by-coarse interpolation.
    pub prolongation: M,
    /// Coarse-by-fine restriction.
    pub restriction: M,
}

/// Coarsening strategy over a host matrix type `M`.
///
/// The hierarchy builder calls the methods in order for every level:
/// `transfer_operators`, `coarse_operator`, then `rebalance`.
pub trait Coarsening<M> {
    /// Build `P` and `R` for `a`, or `None` when `a` cannot be coarsened
    /// (no aggregates were formed).
    fn transfer_operators(&self, a: &M) -> Result<Option<TransferOperators<M>>, SolverError>;

    /// Build the coarse system matrix from `a` and its transfer operators.
    fn coarse_operator(&self, a: &M, ops: &TransferOperators<M>) -> Result<M, SolverError>;

    /// Global number of rows of `a`.
    fn global_rows(&self, a: &M) -> usize;

    /// Redistribute a freshly built coarse level. The default keeps it as is.
    fn rebalance(
        &self,
        level: usize,
        coarse: M,
        ops: TransferOperators<M>,
    ) -> Result<(M, TransferOperators<M>), SolverError> {
        let _ = level;
        Ok((coarse, ops))
    }
}

/// Piecewise-constant interpolation from an aggregate map.
///
/// Row `i` of `P` holds a single `1.0` at column `id[i]`, or nothing when row
/// `i` is excluded.
pub fn prolongation(aggregates: &Aggregates) -> CsrMatrix<f64> {
    let n = aggregates.rows();
    let mut row_ptr = Vec::with_capacity(n + 1);
    let mut col_indices = Vec::with_capacity(n);
    row_ptr.push(0);
    for id in aggregates.ids() {
        if let Some(a) = *id {
            col_indices.push(a);
        }
        row_ptr.push(col_indices.len());
    }
    CsrMatrix {
        values: vec![1.0; col_indices.len()],
        row_ptr,
        col_indices,
        rows: n,
        cols: aggregates.count(),
    }
}

/// `P` from the aggregate map and `R = P^T`.
pub fn transfer_operators(aggregates: &Aggregates) -> TransferOperators<CsrMatrix<f64>> {
    let prolongation = prolongation(aggregates);
    let restriction = prolongation.transpose();
    TransferOperators {
        prolongation,
        restriction,
    }
}

/// `scale * R * (A * P)`.
pub fn scaled_galerkin(
    a: &CsrMatrix<f64>,
    p: &CsrMatrix<f64>,
    r: &CsrMatrix<f64>,
    scale: f64,
) -> CsrMatrix<f64> {
    let ap = a.product(p);
    let mut rap = r.product(&ap);
    rap.scale(scale);
    rap
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Non-smoothed aggregation over single-process CSR matrices.
#[derive(Debug, Clone)]
pub struct Aggregation<G = PlainAggregates> {
    params: CoarseningParams,
    builder: G,
}

impl Aggregation<PlainAggregates> {
    /// Aggregation with [`PlainAggregates`] configured from `params.aggr`.
    ///
    /// # Errors
    ///
    /// [`SolverError::Configuration`] if `over_interp` is not finite and
    /// positive or the aggregation parameters are invalid.
    pub fn new(params: CoarseningParams) -> Result<Self, SolverError> {
        params.validate()?;
        let builder = PlainAggregates::new(params.aggr.clone())?;
        Ok(Self { params, builder })
    }
}

impl<G: AggregateBuilder> Aggregation<G> {
    /// Aggregation with a custom aggregate builder. `params.aggr` is only
    /// validated; the builder carries its own configuration.
    pub fn with_builder(params: CoarseningParams, builder: G) -> Result<Self, SolverError> {
        params.validate()?;
        Ok(Self { params, builder })
    }

    /// The parameters in use.
    pub fn params(&self) -> &CoarseningParams {
        &self.params
    }

    /// The aggregate builder in use.
    pub fn builder(&self) -> &G {
        &self.builder
    }
}

impl<G: AggregateBuilder> Coarsening<CsrMatrix<f64>> for Aggregation<G> {
    fn transfer_operators(
        &self,
        a: &CsrMatrix<f64>,
    ) -> Result<Option<TransferOperators<CsrMatrix<f64>>>, SolverError> {
        let aggregates = {
            let _span = debug_span!("aggregates", rows = a.rows).entered();
            self.builder.aggregates(a)?
        };
        if aggregates.count() == 0 {
            debug!(rows = a.rows, "no aggregates formed");
            return Ok(None);
        }
        let _span = debug_span!("transfer", aggregates = aggregates.count()).entered();
        Ok(Some(transfer_operators(&aggregates)))
    }

    fn coarse_operator(
        &self,
        a: &CsrMatrix<f64>,
        ops: &TransferOperators<CsrMatrix<f64>>,
    ) -> Result<CsrMatrix<f64>, SolverError> {
        let _span = debug_span!("galerkin", rows = a.rows).entered();
        Ok(scaled_galerkin(
            a,
            &ops.prolongation,
            &ops.restriction,
            1.0 / self.params.over_interp,
        ))
    }

    fn global_rows(&self, a: &CsrMatrix<f64>) -> usize {
        a.rows
    }
}
