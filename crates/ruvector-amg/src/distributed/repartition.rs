//! Load rebalancing of coarse levels.
//!
//! Aggregation shrinks every rank's share of the problem by roughly the same
//! factor, so deep levels end up with a handful of rows per rank and
//! communication dominates. When that happens the coarse operator is moved
//! onto fewer ranks: a graph partitioner assigns rows to `npart` parts, part
//! `p` goes to rank `p`, and the level is permuted with `Q^T A Q`.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::comm::Communicator;
use super::matrix::{owner, DistributedMatrix};
use crate::error::{Collaborator, SolverError};
use crate::types::CsrMatrix;

/// Repartitioning parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepartitionParams {
    /// Whether coarse levels may be redistributed at all.
    pub enable: bool,
    /// Redistribute once some non-empty rank holds at most this many rows.
    pub min_per_proc: usize,
    /// Active ranks are reduced by this factor.
    pub shrink_ratio: usize,
}

impl Default for RepartitionParams {
    fn default() -> Self {
        Self {
            enable: false,
            min_per_proc: 10_000,
            shrink_ratio: 8,
        }
    }
}

impl RepartitionParams {
    /// `shrink_ratio` must be at least 1.
    pub fn validate(&self) -> Result<(), SolverError> {
        if self.shrink_ratio == 0 {
            return Err(SolverError::configuration("shrink_ratio", 0, ">= 1"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Graph partitioning
// ---------------------------------------------------------------------------

/// Failure reported by a [`GraphPartitioner`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("partitioner returned code {code}: {message}")]
pub struct PartitionError {
    /// Partitioner-specific status code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

/// Adjacency graph of a distributed matrix, in the `xadj`/`adjncy` layout
/// graph partitioners take. Vertices are distributed like the matrix rows;
/// neighbour ids are global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedGraph {
    vertex_offsets: Vec<usize>,
    xadj: Vec<usize>,
    adjncy: Vec<usize>,
}

impl DistributedGraph {
    /// Graph of `A + A^T` without self loops. Collective.
    ///
    /// Every off-diagonal entry `(i, j)` contributes the edges `i - j` and
    /// `j - i`; the mirrored edge is sent to the owner of `j`.
    pub fn symmetrized<C: Communicator>(a: &DistributedMatrix<C>) -> Self {
        let comm = a.comm();
        let begin = a.row_begin();
        let offsets = a.row_offsets();
        let local = a.local();

        let mut adjacency: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); local.rows];
        let mut mirrored: Vec<Vec<(usize, usize)>> = vec![Vec::new(); comm.size()];
        for i in 0..local.rows {
            let gi = begin + i;
            for (j, _) in local.row_entries(i) {
                if j == gi {
                    continue;
                }
                adjacency[i].insert(j);
                mirrored[owner(offsets, j)].push((j, gi));
            }
        }
        for (j, gi) in comm.all_to_all(mirrored).into_iter().flatten() {
            adjacency[j - begin].insert(gi);
        }

        let mut xadj = Vec::with_capacity(local.rows + 1);
        let mut adjncy = Vec::new();
        xadj.push(0);
        for row in adjacency {
            adjncy.extend(row);
            xadj.push(adjncy.len());
        }
        Self {
            vertex_offsets: offsets.to_vec(),
            xadj,
            adjncy,
        }
    }

    /// Vertex ownership offsets.
    pub fn vertex_offsets(&self) -> &[usize] {
        &self.vertex_offsets
    }

    /// Vertices stored on this rank.
    pub fn local_vertices(&self) -> usize {
        self.xadj.len() - 1
    }

    /// Vertices over all ranks.
    pub fn global_vertices(&self) -> usize {
        self.vertex_offsets.last().copied().unwrap_or(0)
    }

    /// Neighbours of local vertex `i`, sorted, as global ids.
    pub fn neighbours(&self, i: usize) -> &[usize] {
        &self.adjncy[self.xadj[i]..self.xadj[i + 1]]
    }

    /// Offsets into [`adjncy`](Self::adjncy) per local vertex.
    pub fn xadj(&self) -> &[usize] {
        &self.xadj
    }

    /// Concatenated neighbour lists.
    pub fn adjncy(&self) -> &[usize] {
        &self.adjncy
    }
}

/// Assigns every vertex of a distributed graph to one of `parts` parts.
pub trait GraphPartitioner: Send + Sync {
    /// Part of each local vertex, in `0..parts`. Collective.
    fn partition<C: Communicator>(
        &self,
        comm: &C,
        graph: &DistributedGraph,
        parts: usize,
    ) -> Result<Vec<usize>, PartitionError>;
}

/// Splits the global vertex range into `parts` contiguous blocks of nearly
/// equal size, ignoring the edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockPartitioner;

impl GraphPartitioner for BlockPartitioner {
    fn partition<C: Communicator>(
        &self,
        comm: &C,
        graph: &DistributedGraph,
        parts: usize,
    ) -> Result<Vec<usize>, PartitionError> {
        if parts == 0 {
            return Err(PartitionError {
                code: -1,
                message: "zero parts requested".into(),
            });
        }
        let n = graph.global_vertices();
        let begin = graph.vertex_offsets()[comm.rank()];
        Ok((0..graph.local_vertices())
            .map(|i| (begin + i) * parts / n)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Repartitioner
// ---------------------------------------------------------------------------

/// Decides when a coarse level should move to fewer ranks and builds the
/// permutation that does it.
#[derive(Debug, Clone)]
pub struct Repartitioner<P = BlockPartitioner> {
    params: RepartitionParams,
    partitioner: P,
}

impl Repartitioner<BlockPartitioner> {
    /// Repartitioner using [`BlockPartitioner`].
    pub fn new(params: RepartitionParams) -> Result<Self, SolverError> {
        Self::with_partitioner(params, BlockPartitioner)
    }
}

impl<P: GraphPartitioner> Repartitioner<P> {
    /// Repartitioner using a custom graph partitioner.
    pub fn with_partitioner(params: RepartitionParams, partitioner: P) -> Result<Self, SolverError> {
        params.validate()?;
        Ok(Self {
            params,
            partitioner,
        })
    }

    /// The parameters in use.
    pub fn params(&self) -> &RepartitionParams {
        &self.params
    }

    /// Whether `a` is spread too thin. Uses the row offsets, which every rank
    /// holds, so all ranks reach the same answer.
    pub fn is_needed<C: Communicator>(&self, a: &DistributedMatrix<C>) -> bool {
        if !self.params.enable {
            return false;
        }
        let (non_empty, min_rows) = a
            .row_offsets()
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|&rows| rows > 0)
            .fold((0usize, usize::MAX), |(count, min), rows| {
                (count + 1, min.min(rows))
            });
        non_empty > 1 && min_rows <= self.params.min_per_proc
    }

    /// Number of parts `a` should be split into. Collective.
    pub fn target_partitions<C: Communicator>(&self, a: &DistributedMatrix<C>) -> usize {
        let active = a.comm().all_reduce_sum_usize(usize::from(a.loc_rows() > 0));
        (active / self.params.shrink_ratio).max(1)
    }

    /// The permutation operator `Q` (old rows by new columns) for `a`.
    /// Collective.
    ///
    /// # Errors
    ///
    /// [`SolverError::Collaborator`] on every rank if the partitioner fails
    /// or returns an invalid assignment on any rank.
    pub fn permutation<C: Communicator>(
        &self,
        a: &DistributedMatrix<C>,
    ) -> Result<DistributedMatrix<C>, SolverError> {
        let comm = a.comm();
        let n = a.glob_rows();
        let npart = self.target_partitions(a);

        let (perm, new_begin, new_end) = if npart == 1 {
            debug!(rows = n, "gathering level onto rank 0");
            let perm = (0..a.loc_rows()).map(|i| a.row_begin() + i).collect();
            let range = if comm.rank() == 0 { (0, n) } else { (n, n) };
            (perm, range.0, range.1)
        } else {
            let graph = DistributedGraph::symmetrized(a);
            let parts = self.checked_partition(comm, &graph, npart)?;
            graph_perm_index(comm, npart, &parts)
        };
        info!(rows = n, parts = npart, "repartitioning level");

        let col_offsets = comm.exclusive_sum(new_end - new_begin);
        let local = CsrMatrix::from_coo(
            a.loc_rows(),
            n,
            perm.iter().enumerate().map(|(i, &p)| (i, p, 1.0)),
        );
        Ok(DistributedMatrix::from_parts(
            comm.clone(),
            a.row_offsets().to_vec(),
            col_offsets,
            local,
        ))
    }

    /// `Q^T A Q`. Collective.
    pub fn apply<C: Communicator>(
        &self,
        a: &DistributedMatrix<C>,
        q: &DistributedMatrix<C>,
    ) -> DistributedMatrix<C> {
        q.transpose().product(&a.product(q))
    }

    fn checked_partition<C: Communicator>(
        &self,
        comm: &C,
        graph: &DistributedGraph,
        npart: usize,
    ) -> Result<Vec<usize>, SolverError> {
        let local = match self.partitioner.partition(comm, graph, npart) {
            Ok(parts) if parts.len() != graph.local_vertices() => Err(format!(
                "partitioner returned {} parts for {} vertices",
                parts.len(),
                graph.local_vertices()
            )),
            Ok(parts) => match parts.iter().find(|&&p| p >= npart) {
                Some(p) => Err(format!("partitioner returned part {p} >= {npart}")),
                None => Ok(parts),
            },
            Err(e) => Err(e.to_string()),
        };
        if comm.all_reduce_any(local.is_err()) {
            let detail = local
                .err()
                .unwrap_or_else(|| "partitioning failed on another rank".into());
            return Err(
                SolverError::collaborator(Collaborator::GraphPartitioner, detail)
                    .on_rank(comm.rank()),
            );
        }
        local.map_err(|detail| SolverError::collaborator(Collaborator::GraphPartitioner, detail))
    }
}

impl fmt::Display for RepartitionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "repartition(enable={}, min_per_proc={}, shrink_ratio={})",
            self.enable, self.min_per_proc, self.shrink_ratio
        )
    }
}

/// New global index of every local row plus this rank's new ownership range,
/// given a part per local row. Part `p` is owned by rank `p`; rows are
/// numbered part by part, then by current rank, then by local order.
/// Collective.
pub fn graph_perm_index<C: Communicator>(
    comm: &C,
    npart: usize,
    parts: &[usize],
) -> (Vec<usize>, usize, usize) {
    let mut counts = vec![0usize; npart];
    for &p in parts {
        counts[p] += 1;
    }
    let all = comm.all_gather(counts);

    let mut part_start = vec![0usize; npart + 1];
    for p in 0..npart {
        part_start[p + 1] = part_start[p] + all.iter().map(|c| c[p]).sum::<usize>();
    }

    let mut next: Vec<usize> = (0..npart)
        .map(|p| part_start[p] + all[..comm.rank()].iter().map(|c| c[p]).sum::<usize>())
        .collect();
    let perm = parts
        .iter()
        .map(|&p| {
            let g = next[p];
            next[p] += 1;
            g
        })
        .collect();

    let total = part_start[npart];
    let rank = comm.rank();
    let (begin, end) = if rank < npart {
        (part_start[rank], part_start[rank + 1])
    } else {
        (total, total)
    };
    (perm, begin, end)
}
