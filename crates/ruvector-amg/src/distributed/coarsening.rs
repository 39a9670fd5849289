//! Aggregation coarsening over distributed matrices.
//!
//! Aggregates are formed independently on every rank from the block of the
//! local rows that couples locally owned columns, so an aggregate never spans
//! ranks. Coarse unknowns are numbered rank by rank, which keeps the coarse
//! level distributed like the fine one.

use tracing::{debug, debug_span};

use super::comm::Communicator;
use super::matrix::DistributedMatrix;
use super::repartition::{BlockPartitioner, GraphPartitioner, Repartitioner};
use crate::aggregates::{AggregateBuilder, PlainAggregates};
use crate::coarsening::{Coarsening, CoarseningParams, TransferOperators};
use crate::error::SolverError;
use crate::types::CsrMatrix;

/// Non-smoothed aggregation over [`DistributedMatrix`] levels, optionally
/// rebalancing coarse levels with a [`Repartitioner`].
#[derive(Debug, Clone)]
pub struct DistributedAggregation<G = PlainAggregates, P = BlockPartitioner> {
    params: CoarseningParams,
    builder: G,
    repartitioner: Option<Repartitioner<P>>,
}

impl DistributedAggregation<PlainAggregates, BlockPartitioner> {
    /// Distributed aggregation with [`PlainAggregates`] and no repartitioning.
    pub fn new(params: CoarseningParams) -> Result<Self, SolverError> {
        params.validate()?;
        let builder = PlainAggregates::new(params.aggr.clone())?;
        Ok(Self {
            params,
            builder,
            repartitioner: None,
        })
    }
}

impl<G: AggregateBuilder> DistributedAggregation<G, BlockPartitioner> {
    /// Distributed aggregation with a custom aggregate builder.
    pub fn with_builder(params: CoarseningParams, builder: G) -> Result<Self, SolverError> {
        params.validate()?;
        Ok(Self {
            params,
            builder,
            repartitioner: None,
        })
    }
}

impl<G: AggregateBuilder, P: GraphPartitioner> DistributedAggregation<G, P> {
    /// Rebalance coarse levels with `repartitioner`.
    pub fn with_repartitioner<Q: GraphPartitioner>(
        self,
        repartitioner: Repartitioner<Q>,
    ) -> DistributedAggregation<G, Q> {
        DistributedAggregation {
            params: self.params,
            builder: self.builder,
            repartitioner: Some(repartitioner),
        }
    }

    /// The parameters in use.
    pub fn params(&self) -> &CoarseningParams {
        &self.params
    }

    /// The repartitioner, if any.
    pub fn repartitioner(&self) -> Option<&Repartitioner<P>> {
        self.repartitioner.as_ref()
    }
}

impl<C, G, P> Coarsening<DistributedMatrix<C>> for DistributedAggregation<G, P>
where
    C: Communicator,
    G: AggregateBuilder,
    P: GraphPartitioner,
{
    fn transfer_operators(
        &self,
        a: &DistributedMatrix<C>,
    ) -> Result<Option<TransferOperators<DistributedMatrix<C>>>, SolverError> {
        let comm = a.comm();
        let aggregates = {
            let _span = debug_span!("aggregates", rows = a.loc_rows()).entered();
            self.builder.aggregates(&a.local_block())
        };
        if comm.all_reduce_any(aggregates.is_err()) {
            return Err(match aggregates {
                Err(e) => e,
                Ok(_) => SolverError::degenerate("aggregation failed on another rank"),
            }
            .on_rank(comm.rank()));
        }
        let aggregates = aggregates?;

        let offsets = comm.exclusive_sum(aggregates.count());
        let total = offsets[comm.size()];
        if total == 0 {
            debug!(rows = a.glob_rows(), "no aggregates formed on any rank");
            return Ok(None);
        }

        let _span = debug_span!("transfer", aggregates = total).entered();
        let first = offsets[comm.rank()];
        let local = CsrMatrix::from_coo(
            a.loc_rows(),
            total,
            aggregates
                .ids()
                .iter()
                .enumerate()
                .filter_map(|(i, id)| id.map(|k| (i, first + k, 1.0))),
        );
        let prolongation =
            DistributedMatrix::from_parts(comm.clone(), a.row_offsets().to_vec(), offsets, local);
        let restriction = prolongation.transpose();
        Ok(Some(TransferOperators {
            prolongation,
            restriction,
        }))
    }

    fn coarse_operator(
        &self,
        a: &DistributedMatrix<C>,
        ops: &TransferOperators<DistributedMatrix<C>>,
    ) -> Result<DistributedMatrix<C>, SolverError> {
        let _span = debug_span!("galerkin", rows = a.loc_rows()).entered();
        let ap = a.product(&ops.prolongation);
        let mut rap = ops.restriction.product(&ap);
        rap.scale(1.0 / self.params.over_interp);
        Ok(rap)
    }

    fn global_rows(&self, a: &DistributedMatrix<C>) -> usize {
        a.glob_rows()
    }

    fn rebalance(
        &self,
        level: usize,
        coarse: DistributedMatrix<C>,
        ops: TransferOperators<DistributedMatrix<C>>,
    ) -> Result<(DistributedMatrix<C>, TransferOperators<DistributedMatrix<C>>), SolverError> {
        let Some(repartitioner) = &self.repartitioner else {
            return Ok((coarse, ops));
        };
        if !repartitioner.is_needed(&coarse) {
            return Ok((coarse, ops));
        }
        let _span = debug_span!("repartition", level).entered();
        let q = repartitioner.permutation(&coarse)?;
        let coarse = repartitioner.apply(&coarse, &q);
        let prolongation = ops.prolongation.product(&q);
        let restriction = q.transpose().product(&ops.restriction);
        debug!(level, local_rows = coarse.loc_rows(), "level rebalanced");
        Ok((
            coarse,
            TransferOperators {
                prolongation,
                restriction,
            },
        ))
    }
}
