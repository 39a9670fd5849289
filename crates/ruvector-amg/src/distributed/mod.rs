//! Multigrid over row-distributed matrices.
//!
//! Ranks are abstracted by a [`Communicator`]. Each rank owns a contiguous
//! block of rows of every level; transfer operators and coarse operators are
//! built with collective sparse products, and coarse levels can be moved onto
//! fewer ranks by a [`Repartitioner`] once they become too thin.
//!
//! [`ThreadComm`] runs ranks as threads of one process, which is what the
//! tests use; any message-passing layer can be plugged in by implementing
//! [`Communicator::all_to_all`].
//!
//! ```
//! use ruvector_amg::distributed::{Communicator, DistributedMatrix, ThreadComm};
//! use ruvector_amg::hierarchy::{AmgParams, Hierarchy};
//! use ruvector_amg::types::CsrMatrix;
//!
//! let n = 40;
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
//! let a = CsrMatrix::<f64>::from_coo(n, n, entries);
//! let params = AmgParams { coarse_enough: 8, ..AmgParams::default() };
//!
//! let levels = ThreadComm::run(2, |comm| {
//!     let lo = 20 * comm.rank();
//!     let local = DistributedMatrix::from_global_rows(comm, &a, lo, lo + 20);
//!     let h = Hierarchy::from_distributed(local, &params, None).unwrap();
//!     h.num_levels()
//! });
//! assert_eq!(levels[0], levels[1]);
//! ```

mod backend;
mod coarsening;
mod comm;
mod matrix;
mod repartition;

pub use backend::{DistributedBackend, DistributedOperator, GatheredDirectSolver};
pub use coarsening::DistributedAggregation;
pub use comm::{Communicator, SingleProcessComm, ThreadComm};
pub use matrix::DistributedMatrix;
pub use repartition::{
    graph_perm_index, BlockPartitioner, DistributedGraph, GraphPartitioner, PartitionError,
    RepartitionParams, Repartitioner,
};

use crate::error::{SolverError, ValidationError};
use crate::hierarchy::{AmgParams, Hierarchy};
use crate::validation::validate_csr_matrix;

impl<C: Communicator> Hierarchy<DistributedBackend<C>> {
    /// Distributed hierarchy with plain aggregation configured from
    /// `params.coarsening`, rebalancing coarse levels when `repartition` is
    /// given. Collective.
    ///
    /// # Errors
    ///
    /// [`SolverError::InvalidInput`] on every rank if any rank's rows are
    /// malformed, plus everything [`new`](Hierarchy::new) reports.
    pub fn from_distributed(
        a: DistributedMatrix<C>,
        params: &AmgParams,
        repartition: Option<RepartitionParams>,
    ) -> Result<Self, SolverError> {
        let comm = a.comm().clone();
        let checked = validate_csr_matrix(a.local());
        if comm.all_reduce_any(checked.is_err()) {
            let e = checked.err().unwrap_or_else(|| {
                ValidationError::DimensionMismatch("malformed rows on another rank".into())
            });
            return Err(e.into());
        }
        if a.glob_rows() != a.glob_cols() {
            return Err(ValidationError::DimensionMismatch(format!(
                "distributed matrix is {}x{}, expected square",
                a.glob_rows(),
                a.glob_cols()
            ))
            .into());
        }

        let backend = DistributedBackend::new(comm);
        let coarsening = DistributedAggregation::new(params.coarsening.clone())?;
        match repartition {
            Some(rp) => {
                let coarsening = coarsening.with_repartitioner(Repartitioner::new(rp)?);
                Self::new(a, &coarsening, backend, params)
            }
            None => Self::new(a, &coarsening, backend, params),
        }
    }
}
