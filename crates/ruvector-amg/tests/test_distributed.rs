//! Integration tests for distributed hierarchies on in-process rank worlds.

#![cfg(feature = "distributed")]

mod helpers;

use approx::assert_relative_eq;
use ruvector_amg::distributed::{
    Communicator, DistributedAggregation, DistributedBackend, DistributedGraph, DistributedMatrix,
    GraphPartitioner, PartitionError, RepartitionParams, Repartitioner, SingleProcessComm,
    ThreadComm,
};
use ruvector_amg::coarsening::CoarseningParams;
use ruvector_amg::error::{Collaborator, SolverError};
use ruvector_amg::hierarchy::{AmgParams, Hierarchy};
use ruvector_amg::solver::PcgSolver;
use ruvector_amg::types::{ComputeBudget, CsrMatrix};

use helpers::{block_ranges, dense_solve, poisson_2d, random_vector, relative_error, SpanNames};

fn params(coarse_enough: usize) -> AmgParams {
    AmgParams {
        coarse_enough,
        ..AmgParams::default()
    }
}

fn eager_repartition(shrink_ratio: usize) -> RepartitionParams {
    RepartitionParams {
        enable: true,
        min_per_proc: 1_000_000,
        shrink_ratio,
    }
}

fn budget() -> ComputeBudget {
    ComputeBudget {
        tolerance: 1e-10,
        max_iterations: 500,
        ..ComputeBudget::default()
    }
}

/// Distributed PCG on `ranks` ranks; returns the assembled solution and the
/// per-rank local row counts of every level.
fn distributed_pcg(
    a: &CsrMatrix<f64>,
    b: &[f64],
    ranks: usize,
    repartition: Option<RepartitionParams>,
) -> (Vec<f64>, Vec<Vec<usize>>) {
    let ranges = block_ranges(a.rows, ranks);
    let per_rank = ThreadComm::run(ranks, |comm| {
        let (lo, hi) = ranges[comm.rank()];
        let local = DistributedMatrix::from_global_rows(comm, a, lo, hi);
        let h = Hierarchy::from_distributed(local, &params(10), repartition.clone()).unwrap();
        let mut x = vec![0.0; hi - lo];
        PcgSolver::new(params(10))
            .solve_with::<DistributedBackend<ThreadComm>, _>(&h, &b[lo..hi].to_vec(), &mut x, &budget())
            .unwrap();
        let local_rows = h.levels().iter().map(|l| l.info().local_rows).collect();
        (x, local_rows)
    });
    let (pieces, rows): (Vec<Vec<f64>>, Vec<Vec<usize>>) = per_rank.into_iter().unzip();
    (pieces.into_iter().flatten().collect(), rows)
}

// ---------------------------------------------------------------------------
// Equivalence with the single-process hierarchy
// ---------------------------------------------------------------------------

#[test]
fn test_one_rank_hierarchy_matches_serial() {
    let a = poisson_2d(20);
    let b = random_vector(a.rows, 1);

    let mut serial = Hierarchy::from_matrix(a.clone(), &params(30)).unwrap();
    let local = DistributedMatrix::new(SingleProcessComm, a.clone());
    let mut dist = Hierarchy::from_distributed(local, &params(30), None).unwrap();

    assert_eq!(serial.num_levels(), dist.num_levels());
    for (s, d) in serial.levels().iter().zip(dist.levels()) {
        assert_eq!(s.info(), d.info());
    }

    let mut xs = vec![0.0; a.rows];
    let mut xd = vec![0.0; a.rows];
    for _ in 0..3 {
        serial.cycle(&b, &mut xs);
        dist.cycle(&b, &mut xd);
    }
    for (s, d) in xs.iter().zip(&xd) {
        assert_relative_eq!(*s, *d, epsilon = 1e-12);
    }
}

#[test]
fn test_levels_agree_across_ranks() {
    let a = poisson_2d(16);
    let ranges = block_ranges(a.rows, 3);
    let infos = ThreadComm::run(3, |comm| {
        let (lo, hi) = ranges[comm.rank()];
        let local = DistributedMatrix::from_global_rows(comm, &a, lo, hi);
        let h = Hierarchy::from_distributed(local, &params(10), None).unwrap();
        h.levels()
            .iter()
            .map(|l| (l.info().rows, l.info().nnz))
            .collect::<Vec<_>>()
    });
    assert!(infos[0].len() >= 2);
    assert!(infos.iter().all(|i| i == &infos[0]));
    assert_eq!(infos[0][0], (a.rows, a.nnz()));
}

// ---------------------------------------------------------------------------
// Distributed solves
// ---------------------------------------------------------------------------

#[test]
fn test_three_rank_pcg_converges_to_the_solution() {
    let a = poisson_2d(16);
    let b = random_vector(a.rows, 2);
    let (x, _) = distributed_pcg(&a, &b, 3, None);
    let exact = dense_solve(&a, &b);
    assert!(relative_error(&x, &exact) < 1e-7);
}

#[test]
fn test_four_rank_pcg_with_repartitioning() {
    let a = poisson_2d(16);
    let b = random_vector(a.rows, 3);
    let (x, rows) = distributed_pcg(&a, &b, 4, Some(eager_repartition(2)));
    let exact = dense_solve(&a, &b);
    assert!(relative_error(&x, &exact) < 1e-7);

    // Level 1 moved onto two ranks.
    assert!(rows[0][1] > 0 && rows[1][1] > 0);
    assert_eq!(rows[2][1], 0);
    assert_eq!(rows[3][1], 0);
}

// ---------------------------------------------------------------------------
// Repartitioning
// ---------------------------------------------------------------------------

#[test]
fn test_single_part_gathers_onto_rank_zero() {
    let a = poisson_2d(16);
    let ranges = block_ranges(a.rows, 4);
    let rows = ThreadComm::run(4, |comm| {
        let (lo, hi) = ranges[comm.rank()];
        let local = DistributedMatrix::from_global_rows(comm, &a, lo, hi);
        let h = Hierarchy::from_distributed(local, &params(10), Some(eager_repartition(8))).unwrap();
        let level = h.levels()[1].info();
        (level.local_rows, level.rows)
    });
    assert_eq!(rows[0].0, rows[0].1);
    assert!(rows[1..].iter().all(|&(local, _)| local == 0));
}

#[test]
fn test_single_rank_never_repartitions() {
    let r = Repartitioner::new(eager_repartition(1)).unwrap();
    let a = DistributedMatrix::new(SingleProcessComm, poisson_2d(4));
    assert!(!r.is_needed(&a));
}

#[test]
fn test_repartition_preserves_the_operator() {
    let a = poisson_2d(8);
    let ranges = block_ranges(a.rows, 4);
    let gathered = ThreadComm::run(4, |comm| {
        let (lo, hi) = ranges[comm.rank()];
        let local = DistributedMatrix::from_global_rows(comm, &a, lo, hi);
        let r = Repartitioner::new(eager_repartition(2)).unwrap();
        assert!(r.is_needed(&local));
        let q = r.permutation(&local).unwrap();
        let moved = r.apply(&local, &q);
        // Block partitioning keeps the global order, so Q is the identity.
        (moved.loc_rows(), moved.gather(0))
    });
    assert_eq!(gathered[0].0 + gathered[1].0, a.rows);
    assert_eq!(gathered[2].0, 0);
    assert_eq!(gathered[0].1.as_ref(), Some(&a));
}

/// Deals global vertex `g` to part `g % parts`, scattering every rank's rows
/// across all parts.
#[derive(Clone)]
struct RoundRobin;

impl GraphPartitioner for RoundRobin {
    fn partition<C: Communicator>(
        &self,
        comm: &C,
        graph: &DistributedGraph,
        parts: usize,
    ) -> Result<Vec<usize>, PartitionError> {
        let begin = graph.vertex_offsets()[comm.rank()];
        Ok((0..graph.local_vertices()).map(|i| (begin + i) % parts).collect())
    }
}

#[test]
fn test_pcg_converges_after_scattering_repartition() {
    let a = poisson_2d(16);
    let b = random_vector(a.rows, 9);
    // Rank 0 starts without rows.
    let ranges = [(0, 0), (0, 100), (100, 180), (180, 256)];

    let per_rank = ThreadComm::run(4, |comm| {
        let (lo, hi) = ranges[comm.rank()];
        let local = DistributedMatrix::from_global_rows(comm.clone(), &a, lo, hi);
        let repartitioner =
            Repartitioner::with_partitioner(eager_repartition(1), RoundRobin).unwrap();
        let coarsening = DistributedAggregation::new(CoarseningParams::default())
            .unwrap()
            .with_repartitioner(repartitioner);
        let h = Hierarchy::new(local, &coarsening, DistributedBackend::new(comm), &params(10))
            .unwrap();
        let mut x = vec![0.0; hi - lo];
        PcgSolver::new(params(10))
            .solve_with::<DistributedBackend<ThreadComm>, _>(&h, &b[lo..hi].to_vec(), &mut x, &budget())
            .unwrap();
        let level = h.levels()[1].info();
        (x, level.rows, level.local_rows)
    });

    let x: Vec<f64> = per_rank.iter().flat_map(|(x, _, _)| x.clone()).collect();
    let exact = dense_solve(&a, &b);
    assert!(relative_error(&x, &exact) < 1e-7);

    // Three ranks held level 1 before repartitioning, so it is dealt into
    // three parts owned by ranks 0..3.
    let n1 = per_rank[0].1;
    assert!(n1 > 3);
    for (rank, &(_, _, local_rows)) in per_rank.iter().enumerate() {
        let expected = if rank < 3 {
            (0..n1).filter(|g| g % 3 == rank).count()
        } else {
            0
        };
        assert_eq!(local_rows, expected, "rank {rank}");
    }
}

#[test]
fn test_repartition_span_only_when_rows_move() {
    let a = poisson_2d(16);
    let ranges = block_ranges(a.rows, 4);
    let spans = |repartition: Option<RepartitionParams>| {
        ThreadComm::run(4, |comm| {
            let (lo, hi) = ranges[comm.rank()];
            let local = DistributedMatrix::from_global_rows(comm, &a, lo, hi);
            let recorder = SpanNames::default();
            recorder.capture(|| {
                Hierarchy::from_distributed(local, &params(10), repartition.clone()).unwrap()
            });
            (recorder.count("repartition"), recorder.count("galerkin"))
        })
    };

    for (repartitions, galerkins) in spans(Some(eager_repartition(2))) {
        assert!(galerkins >= 1);
        assert!(repartitions >= 1);
    }
    for (repartitions, galerkins) in spans(None) {
        assert!(galerkins >= 1);
        assert_eq!(repartitions, 0);
    }

    // One rank never needs to move rows.
    let recorder = SpanNames::default();
    let local = DistributedMatrix::new(SingleProcessComm, a.clone());
    recorder.capture(|| {
        Hierarchy::from_distributed(local, &params(10), Some(eager_repartition(1))).unwrap()
    });
    assert!(recorder.count("galerkin") >= 1);
    assert_eq!(recorder.count("repartition"), 0);
}

#[derive(Clone)]
struct FailsOnRank(usize);

impl GraphPartitioner for FailsOnRank {
    fn partition<C: Communicator>(
        &self,
        comm: &C,
        graph: &DistributedGraph,
        parts: usize,
    ) -> Result<Vec<usize>, PartitionError> {
        if comm.rank() == self.0 {
            return Err(PartitionError {
                code: -2,
                message: "out of memory".into(),
            });
        }
        Ok(vec![parts - 1; graph.local_vertices()])
    }
}

#[derive(Clone)]
struct OutOfRange;

impl GraphPartitioner for OutOfRange {
    fn partition<C: Communicator>(
        &self,
        _comm: &C,
        graph: &DistributedGraph,
        parts: usize,
    ) -> Result<Vec<usize>, PartitionError> {
        Ok(vec![parts; graph.local_vertices()])
    }
}

fn build_with<P: GraphPartitioner + Clone>(partitioner: P) -> Vec<Option<SolverError>> {
    let a = poisson_2d(16);
    let ranges = block_ranges(a.rows, 4);
    ThreadComm::run(4, |comm| {
        let (lo, hi) = ranges[comm.rank()];
        let local = DistributedMatrix::from_global_rows(comm.clone(), &a, lo, hi);
        let repartitioner =
            Repartitioner::with_partitioner(eager_repartition(2), partitioner.clone()).unwrap();
        let coarsening = DistributedAggregation::new(CoarseningParams::default())
            .unwrap()
            .with_repartitioner(repartitioner);
        Hierarchy::new(local, &coarsening, DistributedBackend::new(comm), &params(10)).err()
    })
}

#[test]
fn test_partitioner_failure_is_reported_on_every_rank() {
    let errors = build_with(FailsOnRank(1));
    for (rank, err) in errors.into_iter().enumerate() {
        match err {
            Some(SolverError::Collaborator {
                collaborator: Collaborator::GraphPartitioner,
                level,
                rank: reported,
                ..
            }) => {
                assert_eq!(level, 1);
                assert_eq!(reported, rank);
            }
            other => panic!("rank {rank}: unexpected result {other:?}"),
        }
    }
}

#[test]
fn test_invalid_assignment_is_a_partitioner_failure() {
    let errors = build_with(OutOfRange);
    assert!(errors.iter().all(|e| matches!(
        e,
        Some(SolverError::Collaborator {
            collaborator: Collaborator::GraphPartitioner,
            ..
        })
    )));
}

#[test]
fn test_repartition_params_from_partial_json() {
    let p: RepartitionParams = serde_json::from_str(r#"{ "enable": true }"#).unwrap();
    assert!(p.enable);
    assert_eq!(p.min_per_proc, 10_000);
    assert_eq!(p.shrink_ratio, 8);
}
