//! Backend over row-distributed matrices.
//!
//! Vectors are plain `Vec<f64>` holding the locally owned entries. Matrices
//! are converted into [`DistributedOperator`]s, which know which remote
//! entries of `x` a product needs and exchange them with one `all_to_all`
//! per product.

use std::collections::BTreeSet;

use tracing::debug;

use super::comm::Communicator;
use super::matrix::{owner, DistributedMatrix};
use crate::backend::Backend;
use crate::direct::DenseLu;
use crate::error::SolverError;
use crate::types::CsrMatrix;

/// Backend whose collectives run over the communicator `C`.
#[derive(Debug, Clone)]
pub struct DistributedBackend<C: Communicator> {
    comm: C,
}

impl<C: Communicator> DistributedBackend<C> {
    /// Backend over `comm`.
    pub fn new(comm: C) -> Self {
        Self { comm }
    }

    /// The communicator.
    pub fn comm(&self) -> &C {
        &self.comm
    }
}

/// A distributed matrix prepared for repeated products.
///
/// Columns are renumbered so that locally owned columns come first, followed
/// by the ghost columns this rank reads from other ranks in increasing global
/// order. Since ownership ranges are ordered by rank, the ghosts of each
/// source rank form one contiguous run.
#[derive(Debug, Clone)]
pub struct DistributedOperator<C: Communicator> {
    comm: C,
    local: CsrMatrix<f64>,
    own_cols: usize,
    /// Local column indices each rank reads from this one.
    send: Vec<Vec<usize>>,
}

impl<C: Communicator> DistributedOperator<C> {
    /// Analyse the communication pattern of `a`. Collective.
    pub fn new(a: DistributedMatrix<C>) -> Self {
        let comm = a.comm().clone();
        let rank = comm.rank();
        let col_offsets = a.col_offsets().to_vec();
        let (cb, ce) = (col_offsets[rank], col_offsets[rank + 1]);
        let own_cols = ce - cb;
        let mut local = a.into_local();

        let ghosts: Vec<usize> = local
            .col_indices
            .iter()
            .copied()
            .filter(|c| !(cb..ce).contains(c))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut requests: Vec<Vec<usize>> = vec![Vec::new(); comm.size()];
        for &g in &ghosts {
            requests[owner(&col_offsets, g)].push(g);
        }
        let send: Vec<Vec<usize>> = comm
            .all_to_all(requests)
            .into_iter()
            .map(|cols| cols.into_iter().map(|g| g - cb).collect())
            .collect();

        for c in &mut local.col_indices {
            *c = if (cb..ce).contains(c) {
                *c - cb
            } else {
                // Present by construction.
                own_cols + ghosts.binary_search(c).unwrap_or_default()
            };
        }
        local.cols = own_cols + ghosts.len();
        // Renumbering may break the per-row column order.
        sort_rows(&mut local);
        debug!(
            rows = local.rows,
            own_cols,
            ghosts = ghosts.len(),
            "distributed operator ready"
        );

        Self {
            comm,
            local,
            own_cols,
            send,
        }
    }

    /// Rows stored on this rank.
    pub fn loc_rows(&self) -> usize {
        self.local.rows
    }

    /// Number of remote entries read per product.
    pub fn ghost_count(&self) -> usize {
        self.local.cols - self.own_cols
    }

    /// `y = alpha * A * x + beta * y`. Collective.
    pub fn spmv(&self, alpha: f64, x: &[f64], beta: f64, y: &mut [f64]) {
        let outgoing: Vec<Vec<f64>> = self
            .send
            .iter()
            .map(|cols| cols.iter().map(|&k| x[k]).collect())
            .collect();
        let incoming = self.comm.all_to_all(outgoing);

        let mut ext = Vec::with_capacity(self.local.cols);
        ext.extend_from_slice(&x[..self.own_cols]);
        for buf in incoming {
            ext.extend(buf);
        }
        self.local.spmv_scaled(alpha, &ext, beta, y);
    }
}

fn sort_rows(a: &mut CsrMatrix<f64>) {
    for i in 0..a.rows {
        let (start, end) = (a.row_ptr[i], a.row_ptr[i + 1]);
        if a.col_indices[start..end].windows(2).all(|w| w[0] < w[1]) {
            continue;
        }
        let mut row: Vec<(usize, f64)> = a.col_indices[start..end]
            .iter()
            .copied()
            .zip(a.values[start..end].iter().copied())
            .collect();
        row.sort_unstable_by_key(|&(c, _)| c);
        for (k, (c, v)) in row.into_iter().enumerate() {
            a.col_indices[start + k] = c;
            a.values[start + k] = v;
        }
    }
}

/// Coarsest-level solver: the operator is gathered on rank 0 and factorised
/// there; every solve gathers the right-hand side and scatters the solution.
#[derive(Debug)]
pub struct GatheredDirectSolver<C: Communicator> {
    comm: C,
    row_offsets: Vec<usize>,
    lu: Option<DenseLu>,
}

const ROOT: usize = 0;

impl<C: Communicator> GatheredDirectSolver<C> {
    /// Gather and factorise `a`. Collective.
    ///
    /// # Errors
    ///
    /// [`SolverError::DegenerateInput`] on every rank if the gathered
    /// operator is singular.
    pub fn new(a: &DistributedMatrix<C>) -> Result<Self, SolverError> {
        let comm = a.comm().clone();
        let lu = a.gather(ROOT).map(|global| DenseLu::factorize(&global)).transpose();
        if comm.all_reduce_any(lu.is_err()) {
            return Err(match lu {
                Err(e) => e,
                Ok(_) => SolverError::degenerate("coarsest operator is singular"),
            }
            .on_rank(ROOT));
        }
        Ok(Self {
            comm,
            row_offsets: a.row_offsets().to_vec(),
            lu: lu?,
        })
    }

    /// `x = A^{-1} rhs`, with `rhs` and `x` holding local entries. Collective.
    pub fn solve(&self, rhs: &[f64], x: &mut [f64]) {
        let size = self.comm.size();
        let mut outgoing: Vec<Vec<f64>> = vec![Vec::new(); size];
        outgoing[ROOT] = rhs.to_vec();
        let gathered = self.comm.all_to_all(outgoing);

        let mut replies: Vec<Vec<f64>> = vec![Vec::new(); size];
        if let Some(lu) = &self.lu {
            let global_rhs: Vec<f64> = gathered.into_iter().flatten().collect();
            let mut global_x = vec![0.0; global_rhs.len()];
            lu.solve(&global_rhs, &mut global_x);
            for (r, reply) in replies.iter_mut().enumerate() {
                *reply = global_x[self.row_offsets[r]..self.row_offsets[r + 1]].to_vec();
            }
        }
        let incoming = self.comm.all_to_all(replies);
        x.copy_from_slice(&incoming[ROOT]);
    }
}

impl<C: Communicator> Backend for DistributedBackend<C> {
    type Host = DistributedMatrix<C>;
    type Matrix = DistributedOperator<C>;
    type Vector = Vec<f64>;
    type DirectSolver = GatheredDirectSolver<C>;

    fn host_rows(&self, a: &DistributedMatrix<C>) -> usize {
        a.loc_rows()
    }

    fn global_rows(&self, a: &DistributedMatrix<C>) -> usize {
        a.glob_rows()
    }

    fn global_nnz(&self, a: &DistributedMatrix<C>) -> usize {
        a.glob_nnz()
    }

    fn relaxation_diagonal(&self, a: &DistributedMatrix<C>) -> Result<Vec<f64>, SolverError> {
        let diag = a.local_diagonal();
        let zero = diag.iter().position(|&d| d == 0.0);
        if self.comm.all_reduce_any(zero.is_some()) {
            let detail = match zero {
                Some(i) => format!("zero diagonal entry in row {}", a.row_begin() + i),
                None => "zero diagonal entry on another rank".to_string(),
            };
            return Err(SolverError::degenerate(detail).on_rank(self.comm.rank()));
        }
        Ok(diag)
    }

    fn copy_matrix(&self, a: DistributedMatrix<C>) -> Result<DistributedOperator<C>, SolverError> {
        Ok(DistributedOperator::new(a))
    }

    fn direct_solver(
        &self,
        a: &DistributedMatrix<C>,
    ) -> Result<GatheredDirectSolver<C>, SolverError> {
        GatheredDirectSolver::new(a)
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

    fn spmv(
        &self,
        alpha: f64,
        a: &DistributedOperator<C>,
        x: &Vec<f64>,
        beta: f64,
        y: &mut Vec<f64>,
    ) {
        a.spmv(alpha, x, beta, y);
    }

    fn residual(&self, rhs: &Vec<f64>, a: &DistributedOperator<C>, x: &Vec<f64>, r: &mut Vec<f64>) {
        r.copy_from_slice(rhs);
        a.spmv(-1.0, x, 1.0, r);
    }

    fn axpby(&self, a: f64, x: &Vec<f64>, b: f64, y: &mut Vec<f64>) {
        for (yi, &xi) in y.iter_mut().zip(x) {
            *yi = if b == 0.0 { a * xi } else { a * xi + b * *yi };
        }
    }

    fn scaled_diag_update(&self, alpha: f64, t: &Vec<f64>, d: &Vec<f64>, x: &mut Vec<f64>) {
        for ((xi, &ti), &di) in x.iter_mut().zip(t).zip(d) {
            *xi += alpha * ti / di;
        }
    }

    fn inner_product(&self, x: &Vec<f64>, y: &Vec<f64>) -> f64 {
        let local: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
        self.comm.all_reduce_sum(local)
    }

    fn direct_solve(&self, solver: &GatheredDirectSolver<C>, rhs: &Vec<f64>, x: &mut Vec<f64>) {
        solver.solve(rhs, x);
    }

    fn any_rank(&self, flag: bool) -> bool {
        self.comm.all_reduce_any(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::super::comm::ThreadComm;
    use super::*;
    use approx::assert_relative_eq;

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

    const RANGES: [(usize, usize); 3] = [(0, 3), (3, 3), (3, 8)];

    #[test]
    fn distributed_spmv_matches_serial() {
        let a = poisson_1d(8);
        let x: Vec<f64> = (0..8).map(|i| (i * i) as f64).collect();
        let mut expected = vec![0.0; 8];
        a.spmv(&x, &mut expected);

        let pieces = ThreadComm::run(3, |comm| {
            let (lo, hi) = RANGES[comm.rank()];
            let backend = DistributedBackend::new(comm.clone());
            let op = backend
                .copy_matrix(DistributedMatrix::from_global_rows(comm, &a, lo, hi))
                .unwrap();
            let mut y = vec![0.0; hi - lo];
            backend.spmv(1.0, &op, &x[lo..hi].to_vec(), 0.0, &mut y);
            y
        });
        let y: Vec<f64> = pieces.into_iter().flatten().collect();
        assert_eq!(y, expected);
    }

    #[test]
    fn gathered_solver_solves_across_ranks() {
        let a = poisson_1d(8);
        let x_true: Vec<f64> = (0..8).map(|i| 1.0 + i as f64).collect();
        let mut rhs = vec![0.0; 8];
        a.spmv(&x_true, &mut rhs);

        let pieces = ThreadComm::run(3, |comm| {
            let (lo, hi) = RANGES[comm.rank()];
            let backend = DistributedBackend::new(comm.clone());
            let solver = backend
                .direct_solver(&DistributedMatrix::from_global_rows(comm, &a, lo, hi))
                .unwrap();
            let mut x = vec![0.0; hi - lo];
            backend.direct_solve(&solver, &rhs[lo..hi].to_vec(), &mut x);
            x
        });
        let x: Vec<f64> = pieces.into_iter().flatten().collect();
        for (xi, ti) in x.iter().zip(&x_true) {
            assert_relative_eq!(*xi, *ti, epsilon = 1e-10);
        }
    }

    #[test]
    fn zero_diagonal_fails_on_every_rank() {
        let a = CsrMatrix::<f64>::from_coo(
            4,
            4,
            vec![(0, 0, 1.0), (1, 1, 1.0), (2, 3, 1.0), (3, 3, 1.0)],
        );
        let results = ThreadComm::run(2, |comm| {
            let lo = 2 * comm.rank();
            let backend = DistributedBackend::new(comm.clone());
            let host = DistributedMatrix::from_global_rows(comm, &a, lo, lo + 2);
            backend.relaxation_diagonal(&host).is_err()
        });
        assert_eq!(results, vec![true, true]);
    }

    #[test]
    fn inner_product_is_global() {
        let dots = ThreadComm::run(4, |comm| {
            let backend = DistributedBackend::new(comm.clone());
            let x = vec![comm.rank() as f64 + 1.0];
            backend.inner_product(&x, &x)
        });
        assert!(dots.iter().all(|&d| d == 30.0));
    }
}
