//! Row-distributed sparse matrices.
//!
//! Each rank stores a contiguous block of rows as a CSR matrix whose column
//! indices are global. Row and column ownership are described by offset
//! arrays of length `size + 1`: rank `r` owns rows
//! `row_offsets[r]..row_offsets[r + 1]` and columns
//! `col_offsets[r]..col_offsets[r + 1]`. Ranks may own nothing.

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use super::comm::Communicator;
use crate::types::{CsrBuilder, CsrMatrix};

/// Rank owning global index `j` under `offsets`.
///
/// Empty ranks share their start offset with the next rank; the search picks
/// the last rank starting at or before `j`, which is the non-empty one.
pub(crate) fn owner(offsets: &[usize], j: usize) -> usize {
    offsets.partition_point(|&o| o <= j) - 1
}

/// A sparse matrix whose rows are distributed over the ranks of `C`.
#[derive(Debug, Clone)]
pub struct DistributedMatrix<C: Communicator> {
    comm: C,
    row_offsets: Vec<usize>,
    col_offsets: Vec<usize>,
    local: CsrMatrix<f64>,
}

impl<C: Communicator> DistributedMatrix<C> {
    /// Wrap this rank's rows of a square matrix. Column ownership follows
    /// row ownership.
    ///
    /// Collective: derives the row offsets from every rank's row count.
    pub fn new(comm: C, local: CsrMatrix<f64>) -> Self {
        let row_offsets = comm.exclusive_sum(local.rows);
        Self {
            col_offsets: row_offsets.clone(),
            row_offsets,
            comm,
            local,
        }
    }

    /// Wrap this rank's rows with explicit column ownership.
    ///
    /// Collective.
    ///
    /// # Panics
    ///
    /// Panics if `col_offsets` does not have `size + 1` entries or its total
    /// differs from `local.cols`.
    pub fn with_col_offsets(comm: C, local: CsrMatrix<f64>, col_offsets: Vec<usize>) -> Self {
        assert_eq!(col_offsets.len(), comm.size() + 1, "col_offsets length");
        assert_eq!(col_offsets[comm.size()], local.cols, "col_offsets total");
        let row_offsets = comm.exclusive_sum(local.rows);
        Self::from_parts(comm, row_offsets, col_offsets, local)
    }

    /// Rows `begin..end` of a matrix known on every rank, typically for tests
    /// and small drivers.
    ///
    /// Collective. Ranks must pass consecutive, non-overlapping ranges
    /// covering all rows in rank order.
    pub fn from_global_rows(comm: C, a: &CsrMatrix<f64>, begin: usize, end: usize) -> Self {
        let lo = a.row_ptr[begin];
        let hi = a.row_ptr[end];
        let local = CsrMatrix {
            row_ptr: a.row_ptr[begin..=end].iter().map(|&p| p - lo).collect(),
            col_indices: a.col_indices[lo..hi].to_vec(),
            values: a.values[lo..hi].to_vec(),
            rows: end - begin,
            cols: a.cols,
        };
        Self::new(comm, local)
    }

    pub(crate) fn from_parts(
        comm: C,
        row_offsets: Vec<usize>,
        col_offsets: Vec<usize>,
        local: CsrMatrix<f64>,
    ) -> Self {
        debug_assert_eq!(row_offsets.len(), comm.size() + 1);
        debug_assert_eq!(col_offsets.len(), comm.size() + 1);
        debug_assert_eq!(
            local.rows,
            row_offsets[comm.rank() + 1] - row_offsets[comm.rank()]
        );
        Self {
            comm,
            row_offsets,
            col_offsets,
            local,
        }
    }

    /// The communicator.
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Row ownership offsets.
    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    /// Column ownership offsets.
    pub fn col_offsets(&self) -> &[usize] {
        &self.col_offsets
    }

    /// This rank's rows, with global column indices.
    pub fn local(&self) -> &CsrMatrix<f64> {
        &self.local
    }

    /// Consume the matrix and return this rank's rows.
    pub fn into_local(self) -> CsrMatrix<f64> {
        self.local
    }

    /// Rows stored on this rank.
    pub fn loc_rows(&self) -> usize {
        self.local.rows
    }

    /// First global row stored on this rank.
    pub fn row_begin(&self) -> usize {
        self.row_offsets[self.comm.rank()]
    }

    /// Rows over all ranks.
    pub fn glob_rows(&self) -> usize {
        self.row_offsets[self.comm.size()]
    }

    /// Columns over all ranks.
    pub fn glob_cols(&self) -> usize {
        self.col_offsets[self.comm.size()]
    }

    /// Non-zeros over all ranks. Collective.
    pub fn glob_nnz(&self) -> usize {
        self.comm.all_reduce_sum_usize(self.local.nnz())
    }

    /// Whether global column `j` is owned by this rank.
    pub fn is_local_column(&self, j: usize) -> bool {
        let rank = self.comm.rank();
        (self.col_offsets[rank]..self.col_offsets[rank + 1]).contains(&j)
    }

    /// Rank owning global column `j`.
    pub fn column_owner(&self, j: usize) -> usize {
        owner(&self.col_offsets, j)
    }

    /// Diagonal entries of the local rows.
    pub fn local_diagonal(&self) -> Vec<f64> {
        let begin = self.row_begin();
        (0..self.local.rows)
            .map(|i| {
                self.local
                    .row_entries(i)
                    .find(|&(c, _)| c == begin + i)
                    .map_or(0.0, |(_, &v)| v)
            })
            .collect()
    }

    /// Local rows restricted to locally owned columns, renumbered from 0.
    pub fn local_block(&self) -> CsrMatrix<f64> {
        let rank = self.comm.rank();
        let (cb, ce) = (self.col_offsets[rank], self.col_offsets[rank + 1]);
        let mut row_ptr = Vec::with_capacity(self.local.rows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_ptr.push(0);
        for i in 0..self.local.rows {
            for (c, &v) in self.local.row_entries(i) {
                if (cb..ce).contains(&c) {
                    col_indices.push(c - cb);
                    values.push(v);
                }
            }
            row_ptr.push(col_indices.len());
        }
        CsrMatrix {
            row_ptr,
            col_indices,
            values,
            rows: self.local.rows,
            cols: ce - cb,
        }
    }

    /// Multiply every stored value by `alpha`.
    pub fn scale(&mut self, alpha: f64) {
        self.local.scale(alpha);
    }

    /// `A^T`, distributed by the column ownership of `A`. Collective.
    pub fn transpose(&self) -> Self {
        let size = self.comm.size();
        let begin = self.row_begin();
        let mut outgoing: Vec<Vec<(usize, usize, f64)>> = vec![Vec::new(); size];
        for i in 0..self.local.rows {
            for (j, &v) in self.local.row_entries(i) {
                outgoing[owner(&self.col_offsets, j)].push((j, begin + i, v));
            }
        }
        let incoming = self.comm.all_to_all(outgoing);

        let rank = self.comm.rank();
        let my_begin = self.col_offsets[rank];
        let my_rows = self.col_offsets[rank + 1] - my_begin;
        let local = CsrMatrix::from_coo(
            my_rows,
            self.glob_rows(),
            incoming
                .into_iter()
                .flatten()
                .map(|(r, c, v)| (r - my_begin, c, v)),
        );
        Self::from_parts(
            self.comm.clone(),
            self.col_offsets.clone(),
            self.row_offsets.clone(),
            local,
        )
    }

    /// `self * b`. Collective.
    ///
    /// Rows of `b` referenced by local columns of `self` but stored on other
    /// ranks are fetched first; the product itself is row-local.
    ///
    /// # Panics
    ///
    /// Panics if the column ownership of `self` differs from the row
    /// ownership of `b`.
    pub fn product(&self, b: &Self) -> Self {
        assert_eq!(
            self.col_offsets, b.row_offsets,
            "product: column ownership of the left factor must match row ownership of the right"
        );
        let (b_begin, b_end) = (b.row_begin(), b.row_begin() + b.loc_rows());

        let needed: BTreeSet<usize> = self
            .local
            .col_indices
            .iter()
            .copied()
            .filter(|k| !(b_begin..b_end).contains(k))
            .collect();
        let remote = b.fetch_rows(&needed);
        trace!(remote_rows = remote.len(), "fetched remote rows for product");

        let mut out = CsrBuilder::new(self.local.rows, b.glob_cols());
        for i in 0..self.local.rows {
            for (k, &a_ik) in self.local.row_entries(i) {
                if (b_begin..b_end).contains(&k) {
                    for (j, &b_kj) in b.local.row_entries(k - b_begin) {
                        out.add(j, a_ik * b_kj);
                    }
                } else if let Some(row) = remote.get(&k) {
                    for &(j, b_kj) in row {
                        out.add(j, a_ik * b_kj);
                    }
                }
            }
            out.finish_row();
        }

        Self::from_parts(
            self.comm.clone(),
            self.row_offsets.clone(),
            b.col_offsets.clone(),
            out.build(),
        )
    }

    /// Rows `needed` (global indices owned elsewhere) keyed by row. Collective.
    fn fetch_rows(&self, needed: &BTreeSet<usize>) -> HashMap<usize, Vec<(usize, f64)>> {
        let size = self.comm.size();
        let mut requests: Vec<Vec<usize>> = vec![Vec::new(); size];
        for &g in needed {
            requests[owner(&self.row_offsets, g)].push(g);
        }
        let asked = self.comm.all_to_all(requests);

        let begin = self.row_begin();
        let replies: Vec<Vec<(usize, Vec<(usize, f64)>)>> = asked
            .into_iter()
            .map(|rows| {
                rows.into_iter()
                    .map(|g| {
                        let entries = self
                            .local
                            .row_entries(g - begin)
                            .map(|(c, &v)| (c, v))
                            .collect();
                        (g, entries)
                    })
                    .collect()
            })
            .collect();
        self.comm.all_to_all(replies).into_iter().flatten().collect()
    }

    /// Assemble the whole matrix on `root`. Collective; `None` elsewhere.
    pub fn gather(&self, root: usize) -> Option<CsrMatrix<f64>> {
        let size = self.comm.size();
        let begin = self.row_begin();
        let mut outgoing: Vec<Vec<(usize, usize, f64)>> = vec![Vec::new(); size];
        outgoing[root] = (0..self.local.rows)
            .flat_map(|i| {
                self.local
                    .row_entries(i)
                    .map(move |(c, &v)| (begin + i, c, v))
            })
            .collect();
        let incoming = self.comm.all_to_all(outgoing);
        (self.comm.rank() == root).then(|| {
            CsrMatrix::from_coo(
                self.glob_rows(),
                self.glob_cols(),
                incoming.into_iter().flatten(),
            )
        })
    }
}
