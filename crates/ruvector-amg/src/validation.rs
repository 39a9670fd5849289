//! Input validation for hierarchy setup and solves.
//!
//! All checks run eagerly before any setup work begins, so callers receive a
//! precise diagnostic instead of a failure several levels down the
//! hierarchy. Every function returns [`ValidationError`], which converts into
//! [`SolverError::InvalidInput`](crate::error::SolverError::InvalidInput) via
//! `From`.

use crate::error::{SolverError, ValidationError};
use crate::types::{ComputeBudget, CsrMatrix};

// ---------------------------------------------------------------------------
// CSR matrix validation
// ---------------------------------------------------------------------------

/// Validate the structural integrity of a CSR matrix.
///
/// Checks, in order:
///
/// 1. `row_ptr` length equals `rows + 1`, starts at 0 and never decreases.
/// 2. `row_ptr[rows]`, `col_indices.len()` and `values.len()` agree.
/// 3. All column indices are less than `cols`.
/// 4. No column appears twice in one row.
/// 5. No `NaN` or `Inf` values.
///
/// # Errors
///
/// Returns [`ValidationError`] describing the first violation found.
///
/// # Examples
///
/// ```
/// use ruvector_amg::types::CsrMatrix;
/// use ruvector_amg::validation::validate_csr_matrix;
///
/// let m = CsrMatrix::<f64>::from_coo(2, 2, vec![(0, 0, 1.0), (1, 1, 2.0)]);
/// assert!(validate_csr_matrix(&m).is_ok());
/// ```
pub fn validate_csr_matrix(matrix: &CsrMatrix<f64>) -> Result<(), ValidationError> {
    if matrix.row_ptr.len() != matrix.rows + 1 {
        return Err(ValidationError::DimensionMismatch(format!(
            "row_ptr length {} does not equal rows + 1 = {}",
            matrix.row_ptr.len(),
            matrix.rows + 1,
        )));
    }
    if matrix.row_ptr[0] != 0 {
        return Err(ValidationError::DimensionMismatch(format!(
            "row_ptr[0] = {} (expected 0)",
            matrix.row_ptr[0],
        )));
    }
    if let Some(position) = matrix
        .row_ptr
        .windows(2)
        .position(|w| w[1] < w[0])
        .map(|p| p + 1)
    {
        return Err(ValidationError::NonMonotonicRowPtrs { position });
    }

    let nnz = matrix.values.len();
    if matrix.row_ptr[matrix.rows] != nnz || matrix.col_indices.len() != nnz {
        return Err(ValidationError::DimensionMismatch(format!(
            "row_ptr[rows] = {}, col_indices length {}, values length {}",
            matrix.row_ptr[matrix.rows],
            matrix.col_indices.len(),
            nnz,
        )));
    }

    // Marker of the last row that touched each column.
    let mut seen = vec![usize::MAX; matrix.cols];
    for row in 0..matrix.rows {
        for (col, &val) in matrix.row_entries(row) {
            if col >= matrix.cols {
                return Err(ValidationError::IndexOutOfBounds {
                    index: col,
                    row,
                    cols: matrix.cols,
                });
            }
            if seen[col] == row {
                return Err(ValidationError::DuplicateColumn { row, col });
            }
            seen[col] = row;

            if !val.is_finite() {
                return Err(ValidationError::NonFiniteValue(format!(
                    "matrix[{}, {}] = {}",
                    row, col, val,
                )));
            }
        }
    }

    Ok(())
}

/// Validate a matrix that is about to become the finest level of a
/// hierarchy: structurally valid and square.
pub fn validate_system_matrix(matrix: &CsrMatrix<f64>) -> Result<(), ValidationError> {
    validate_csr_matrix(matrix)?;
    if matrix.rows != matrix.cols {
        return Err(ValidationError::DimensionMismatch(format!(
            "system matrix must be square, got {}x{}",
            matrix.rows, matrix.cols,
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Vector validation
// ---------------------------------------------------------------------------

/// Validate a right-hand-side vector for a linear solve.
///
/// An all-zero right-hand side is valid but logged, since it usually means
/// the caller forgot to fill it in.
///
/// # Errors
///
/// Returns [`ValidationError`] on dimension mismatch or non-finite values.
pub fn validate_rhs(rhs: &[f64], expected_len: usize) -> Result<(), ValidationError> {
    if rhs.len() != expected_len {
        return Err(ValidationError::DimensionMismatch(format!(
            "rhs length {} does not match expected {}",
            rhs.len(),
            expected_len,
        )));
    }

    if let Some((i, v)) = rhs.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(ValidationError::NonFiniteValue(format!("rhs[{}] = {}", i, v)));
    }

    if !rhs.is_empty() && rhs.iter().all(|&v| v == 0.0) {
        tracing::warn!("rhs vector is all zeros; solution will be trivially zero");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Budget validation
// ---------------------------------------------------------------------------

/// Validate the convergence parameters of a [`ComputeBudget`].
///
/// - `tolerance` must be finite and in `(0.0, 1.0]`.
/// - `max_iterations` must be at least 1.
pub fn validate_budget(budget: &ComputeBudget) -> Result<(), SolverError> {
    let tol = budget.tolerance;
    if !tol.is_finite() || tol <= 0.0 || tol > 1.0 {
        return Err(SolverError::configuration(
            "budget.tolerance",
            format!("{tol:.2e}"),
            "(0.0, 1.0]",
        ));
    }
    if budget.max_iterations == 0 {
        return Err(SolverError::configuration(
            "budget.max_iterations",
            0,
            ">= 1",
        ));
    }
    Ok(())
}
