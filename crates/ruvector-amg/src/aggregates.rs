//! Aggregate formation for non-smoothed aggregation coarsening.
//!
//! Rows of the system matrix are grouped into disjoint aggregates along
//! strong connections. Each aggregate becomes one unknown on the next coarser
//! level.
//!
//! # Strength of connection
//!
//! Off-diagonal entry `a_ij` is strong when it is non-zero and
//!
//! ```text
//! a_ij^2 >= eps^2 * |a_ii * a_jj|
//! ```
//!
//! which is `|a_ij| >= eps * sqrt(|a_ii * a_jj|)` without the square root.
//!
//! # Plain aggregation
//!
//! [`PlainAggregates`] scans rows in order. A row that is not yet assigned
//! seeds a new aggregate, claims every strong neighbour that is not isolated
//! (possibly taking it from an earlier aggregate), then provisionally claims
//! unassigned strong neighbours of those neighbours. Aggregates left empty by
//! later claims are removed and the remaining ids are renumbered densely.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{SolverError, ValidationError};
use crate::types::CsrMatrix;

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

/// Assignment of rows to aggregates.
///
/// `None` marks a row excluded from every aggregate. Ids are dense: every id
/// in `[0, count)` is used by at least one row and no larger id occurs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregates {
    id: Vec<Option<usize>>,
    count: usize,
}

impl Aggregates {
    /// Wrap an assignment, checking the density invariant.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::SparseAggregates`] if an id is `>= count`
    /// or some id in `[0, count)` has no row.
    pub fn new(id: Vec<Option<usize>>, count: usize) -> Result<Self, ValidationError> {
        let mut used = vec![false; count];
        for (row, slot) in id.iter().enumerate() {
            if let Some(a) = *slot {
                if a >= count {
                    return Err(ValidationError::SparseAggregates(format!(
                        "row {row} has aggregate id {a} >= count {count}"
                    )));
                }
                used[a] = true;
            }
        }
        if let Some(empty) = used.iter().position(|&u| !u) {
            return Err(ValidationError::SparseAggregates(format!(
                "aggregate {empty} has no rows"
            )));
        }
        Ok(Self { id, count })
    }

    /// Number of aggregates.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Per-row aggregate id.
    #[inline]
    pub fn ids(&self) -> &[Option<usize>] {
        &self.id
    }

    /// Number of rows covered (aggregated or not).
    #[inline]
    pub fn rows(&self) -> usize {
        self.id.len()
    }

    /// Number of rows excluded from every aggregate.
    pub fn excluded(&self) -> usize {
        self.id.iter().filter(|a| a.is_none()).count()
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Treatment of rows without any strong off-diagonal connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolatedRows {
    /// Leave isolated rows out of every aggregate. They still take part in
    /// fine-level relaxation but have no coarse representative.
    #[default]
    Exclude,
    /// Give every isolated row with a non-zero diagonal its own aggregate.
    Singleton,
}

/// Aggregation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationParams {
    /// Strong-connection threshold `eps`.
    pub eps_strong: f64,
    /// Policy for rows without strong connections.
    pub isolated: IsolatedRows,
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self {
            eps_strong: 0.1,
            isolated: IsolatedRows::Exclude,
        }
    }
}

impl AggregationParams {
    /// Check that `eps_strong` is finite and non-negative.
    pub fn validate(&self) -> Result<(), SolverError> {
        if !self.eps_strong.is_finite() || self.eps_strong < 0.0 {
            return Err(SolverError::configuration(
                "aggr.eps_strong",
                self.eps_strong,
                "finite and >= 0",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// Aggregation strategy used by coarsening.
pub trait AggregateBuilder: Send + Sync {
    /// Partition the rows of `a` into aggregates.
    ///
    /// `a` is square; in the distributed setting it is the rank-local
    /// diagonal block.
    fn aggregates(&self, a: &CsrMatrix<f64>) -> Result<Aggregates, SolverError>;
}

/// Greedy plain aggregation over the strong-connection graph.
#[derive(Debug, Clone, Default)]
pub struct PlainAggregates {
    params: AggregationParams,
}

impl PlainAggregates {
    /// Create the strategy, validating its parameters.
    pub fn new(params: AggregationParams) -> Result<Self, SolverError> {
        params.validate()?;
        Ok(Self { params })
    }

    /// The parameters in use.
    pub fn params(&self) -> &AggregationParams {
        &self.params
    }
}

const UNDEFINED: isize = -1;
const REMOVED: isize = -2;

impl AggregateBuilder for PlainAggregates {
    fn aggregates(&self, a: &CsrMatrix<f64>) -> Result<Aggregates, SolverError> {
        let n = a.rows;
        let strong = strong_connections(a, self.params.eps_strong);

        let mut id = vec![UNDEFINED; n];
        for (i, slot) in id.iter_mut().enumerate() {
            let has_strong = (a.row_ptr[i]..a.row_ptr[i + 1]).any(|k| strong[k]);
            if !has_strong {
                *slot = REMOVED;
            }
        }

        let mut count: usize = 0;
        let mut neighbours = Vec::new();
        for i in 0..n {
            if id[i] != UNDEFINED {
                continue;
            }
            let cur = count as isize;
            count += 1;
            id[i] = cur;

            neighbours.clear();
            for k in a.row_ptr[i]..a.row_ptr[i + 1] {
                let c = a.col_indices[k];
                if strong[k] && id[c] != REMOVED {
                    id[c] = cur;
                    neighbours.push(c);
                }
            }

            for &c in &neighbours {
                for k in a.row_ptr[c]..a.row_ptr[c + 1] {
                    let cc = a.col_indices[k];
                    if strong[k] && id[cc] == UNDEFINED {
                        id[cc] = cur;
                    }
                }
            }
        }

        // Claims may have emptied earlier aggregates.
        let mut remap = vec![usize::MAX; count];
        for &a_id in &id {
            if a_id >= 0 {
                remap[a_id as usize] = 0;
            }
        }
        let mut live = 0usize;
        for slot in remap.iter_mut() {
            if *slot == 0 {
                *slot = live;
                live += 1;
            }
        }
        if live < count {
            trace!(vanished = count - live, "dropped empty aggregates");
        }

        let mut ids: Vec<Option<usize>> = id
            .iter()
            .map(|&a_id| (a_id >= 0).then(|| remap[a_id as usize]))
            .collect();

        if self.params.isolated == IsolatedRows::Singleton {
            let diag = a.diagonal();
            for (row, slot) in ids.iter_mut().enumerate() {
                if slot.is_none() && diag[row] != 0.0 {
                    *slot = Some(live);
                    live += 1;
                }
            }
        }

        let aggregates = Aggregates::new(ids, live)?;
        debug!(
            rows = n,
            aggregates = aggregates.count(),
            excluded = aggregates.excluded(),
            "plain aggregation"
        );
        Ok(aggregates)
    }
}

/// Per-nonzero strong-connection flags; diagonal entries are never strong.
pub fn strong_connections(a: &CsrMatrix<f64>, eps_strong: f64) -> Vec<bool> {
    let diag = a.diagonal();
    let eps_sq = eps_strong * eps_strong;
    let mut strong = vec![false; a.nnz()];
    for i in 0..a.rows {
        let eps_dia_i = eps_sq * diag[i];
        for k in a.row_ptr[i]..a.row_ptr[i + 1] {
            let c = a.col_indices[k];
            let v = a.values[k];
            strong[k] = c != i && v != 0.0 && v * v >= (eps_dia_i * diag[c]).abs();
        }
    }
    strong
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn poisson_rows_group_into_few_aggregates() {
        let agg = PlainAggregates::default()
            .aggregates(&poisson_1d(9))
            .unwrap();
        assert_eq!(agg.rows(), 9);
        assert!(agg.count() >= 2 && agg.count() <= 5, "count = {}", agg.count());
        assert_eq!(agg.excluded(), 0);
        // Ids follow the seeding order.
        assert_eq!(agg.ids()[0], Some(0));
    }

    #[test]
    fn steal_leaves_contiguous_aggregates() {
        let agg = PlainAggregates::default()
            .aggregates(&poisson_1d(9))
            .unwrap();
        let ids: Vec<usize> = agg.ids().iter().map(|a| a.unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] <= w[1]), "ids = {ids:?}");
    }

    #[test]
    fn diagonal_matrix_has_no_aggregates() {
        let agg = PlainAggregates::default()
            .aggregates(&CsrMatrix::<f64>::identity(5))
            .unwrap();
        assert_eq!(agg.count(), 0);
        assert_eq!(agg.excluded(), 5);
    }

    #[test]
    fn weak_connections_are_ignored() {
        // Row 2 only couples weakly: 0.01^2 < 0.01 * |1 * 1|.
        let a = CsrMatrix::<f64>::from_coo(
            3,
            3,
            vec![
                (0, 0, 1.0),
                (0, 1, -1.0),
                (1, 0, -1.0),
                (1, 1, 1.0),
                (1, 2, 0.01),
                (2, 1, 0.01),
                (2, 2, 1.0),
            ],
        );
        let agg = PlainAggregates::default().aggregates(&a).unwrap();
        assert_eq!(agg.ids(), &[Some(0), Some(0), None]);
        assert_eq!(agg.count(), 1);
    }

    #[test]
    fn singleton_policy_keeps_isolated_rows() {
        let params = AggregationParams {
            isolated: IsolatedRows::Singleton,
            ..AggregationParams::default()
        };
        let agg = PlainAggregates::new(params)
            .unwrap()
            .aggregates(&CsrMatrix::<f64>::identity(3))
            .unwrap();
        assert_eq!(agg.ids(), &[Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn sparse_ids_are_rejected() {
        assert!(Aggregates::new(vec![Some(0), Some(2)], 3).is_err());
        assert!(Aggregates::new(vec![Some(0), Some(3)], 3).is_err());
        assert!(Aggregates::new(vec![Some(1), None, Some(0)], 2).is_ok());
    }

    #[test]
    fn negative_threshold_is_a_configuration_error() {
        let params = AggregationParams {
            eps_strong: -0.5,
            ..AggregationParams::default()
        };
        assert!(matches!(
            PlainAggregates::new(params),
            Err(SolverError::Configuration { .. })
        ));
    }
}
