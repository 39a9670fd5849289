//! Multigrid hierarchy construction.
//!
//! Starting from the finest system matrix, the builder repeatedly asks a
//! [`Coarsening`] strategy for transfer operators and a coarse operator until
//! the operator is small enough, the level cap is reached, or coarsening
//! stops making progress. Every level but the last keeps its matrix, the
//! diagonal used for relaxation and the transfer operators; the last level is
//! factorised for a direct solve.
//!
//! Levels are stored finest first. A level refers to its neighbours only by
//! index, so the hierarchy owns everything and holds no back references.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, info, instrument, warn};

use crate::backend::{Backend, Builtin};
use crate::coarsening::{Aggregation, Coarsening, CoarseningParams, TransferOperators};
use crate::cycle::{CycleEngine, CycleParams, Workspace};
use crate::error::SolverError;
use crate::types::CsrMatrix;
use crate::validation::validate_system_matrix;

/// Hierarchy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmgParams {
    /// Coarsening parameters, used by the convenience constructors.
    pub coarsening: CoarseningParams,
    /// Cycle parameters.
    pub cycle: CycleParams,
    /// A level with at most this many global rows becomes the coarsest.
    pub coarse_enough: usize,
    /// Maximum number of levels, coarsest included.
    pub max_levels: usize,
}

impl Default for AmgParams {
    fn default() -> Self {
        Self {
            coarsening: CoarseningParams::default(),
            cycle: CycleParams::default(),
            coarse_enough: 300,
            max_levels: usize::MAX,
        }
    }
}

impl AmgParams {
    /// Validate every nested parameter block.
    pub fn validate(&self) -> Result<(), SolverError> {
        self.coarsening.validate()?;
        self.cycle.validate()?;
        if self.max_levels == 0 {
            return Err(SolverError::configuration("max_levels", 0, ">= 1"));
        }
        Ok(())
    }
}

/// Size information of one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelInfo {
    /// Level index, 0 is the finest.
    pub index: usize,
    /// Rows over all ranks.
    pub rows: usize,
    /// Non-zeros over all ranks.
    pub nnz: usize,
    /// Rows stored on this rank.
    pub local_rows: usize,
}

pub(crate) enum LevelKind<B: Backend> {
    Relaxed {
        diag: B::Vector,
        prolongation: B::Matrix,
        restriction: B::Matrix,
    },
    Coarsest(B::DirectSolver),
}

/// One level of the hierarchy.
pub struct Level<B: Backend> {
    pub(crate) a: B::Matrix,
    pub(crate) kind: LevelKind<B>,
    info: LevelInfo,
}

impl<B: Backend> Level<B> {
    fn relaxed(
        backend: &B,
        index: usize,
        a: B::Host,
        ops: TransferOperators<B::Host>,
    ) -> Result<Self, SolverError> {
        let info = Self::describe(backend, index, &a);
        let diag = backend.relaxation_diagonal(&a)?;
        let a = backend.copy_matrix(a)?;
        let prolongation = backend.copy_matrix(ops.prolongation)?;
        let restriction = backend.copy_matrix(ops.restriction)?;
        Ok(Self {
            a,
            kind: LevelKind::Relaxed {
                diag,
                prolongation,
                restriction,
            },
            info,
        })
    }

    fn coarsest(backend: &B, index: usize, a: B::Host) -> Result<Self, SolverError> {
        let info = Self::describe(backend, index, &a);
        let solver = backend.direct_solver(&a)?;
        let matrix = backend.copy_matrix(a)?;
        Ok(Self {
            a: matrix,
            kind: LevelKind::Coarsest(solver),
            info,
        })
    }

    fn describe(backend: &B, index: usize, a: &B::Host) -> LevelInfo {
        LevelInfo {
            index,
            rows: backend.global_rows(a),
            nnz: backend.global_nnz(a),
            local_rows: backend.host_rows(a),
        }
    }

    /// Size information.
    pub fn info(&self) -> &LevelInfo {
        &self.info
    }

    /// The level's system matrix.
    pub fn matrix(&self) -> &B::Matrix {
        &self.a
    }

    /// Whether this level is solved directly.
    pub fn is_coarsest(&self) -> bool {
        matches!(self.kind, LevelKind::Coarsest(_))
    }
}

/// A multigrid hierarchy ready for cycling.
pub struct Hierarchy<B: Backend> {
    backend: B,
    levels: Vec<Level<B>>,
    params: CycleParams,
    workspace: Workspace<B>,
}

impl<B: Backend> Hierarchy<B> {
    /// Build a hierarchy from the finest matrix `a`.
    ///
    /// `coarsening` supplies transfer and coarse operators; `params.coarsening`
    /// is validated but otherwise only used by the convenience constructors.
    /// Ranks must call this collectively when the backend is distributed.
    ///
    /// # Errors
    ///
    /// - [`SolverError::Configuration`] for invalid parameters.
    /// - [`SolverError::DegenerateInput`] for a zero diagonal on a relaxed
    ///   level or a singular coarsest operator.
    /// - [`SolverError::Collaborator`] when the graph partitioner fails.
    ///
    /// No partially built hierarchy is returned.
    #[instrument(skip_all, name = "amg_setup")]
    pub fn new<C>(
        a: B::Host,
        coarsening: &C,
        backend: B,
        params: &AmgParams,
    ) -> Result<Self, SolverError>
    where
        C: Coarsening<B::Host>,
    {
        params.validate()?;

        let mut levels: Vec<Level<B>> = Vec::new();
        let mut a = a;
        loop {
            let index = levels.len();
            let rows = coarsening.global_rows(&a);
            if rows <= params.coarse_enough {
                debug!(level = index, rows, "coarse enough");
                break;
            }
            if index + 1 >= params.max_levels {
                debug!(level = index, rows, "level cap reached");
                break;
            }

            let Some(ops) = coarsening
                .transfer_operators(&a)
                .map_err(|e| e.at_level(index))?
            else {
                debug!(level = index, rows, "no aggregates; stopping");
                break;
            };
            let coarse = coarsening
                .coarse_operator(&a, &ops)
                .map_err(|e| e.at_level(index))?;

            let coarse_rows = coarsening.global_rows(&coarse);
            if coarse_rows >= rows {
                warn!(level = index, rows, coarse_rows, "coarsening stalled");
                break;
            }

            let (coarse, ops) = coarsening
                .rebalance(index + 1, coarse, ops)
                .map_err(|e| e.at_level(index + 1))?;

            levels.push(Level::relaxed(&backend, index, a, ops).map_err(|e| e.at_level(index))?);
            debug!(level = index, rows, coarse_rows, "level built");
            a = coarse;
        }

        let index = levels.len();
        {
            let _span = debug_span!("coarsest", level = index).entered();
            levels.push(Level::coarsest(&backend, index, a).map_err(|e| e.at_level(index))?);
        }

        let workspace = Workspace::new(&backend, &levels, &params.cycle);
        let hierarchy = Self {
            backend,
            levels,
            params: params.cycle.clone(),
            workspace,
        };
        info!(
            levels = hierarchy.levels.len(),
            operator_complexity = hierarchy.operator_complexity(),
            grid_complexity = hierarchy.grid_complexity(),
            "hierarchy ready"
        );
        Ok(hierarchy)
    }

    /// The backend the hierarchy lives on.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Levels, finest first.
    pub fn levels(&self) -> &[Level<B>] {
        &self.levels
    }

    /// Number of levels.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// The finest-level system matrix.
    pub fn system_matrix(&self) -> &B::Matrix {
        &self.levels[0].a
    }

    /// Cycle parameters in use.
    pub fn cycle_params(&self) -> &CycleParams {
        &self.params
    }

    /// Allocate a fresh workspace for [`cycle_with`](Self::cycle_with).
    pub fn workspace(&self) -> Workspace<B> {
        Workspace::new(&self.backend, &self.levels, &self.params)
    }

    /// One cycle from the finest level: improves `x` towards `A^{-1} rhs`.
    pub fn cycle(&mut self, rhs: &B::Vector, x: &mut B::Vector) {
        let engine = CycleEngine {
            backend: &self.backend,
            levels: &self.levels,
            params: &self.params,
        };
        engine.run(&mut self.workspace, rhs, x);
    }

    /// One cycle using caller-owned work vectors.
    ///
    /// # Panics
    ///
    /// Panics if `workspace` was allocated by a hierarchy with a different
    /// number of levels.
    pub fn cycle_with(&self, workspace: &mut Workspace<B>, rhs: &B::Vector, x: &mut B::Vector) {
        let engine = CycleEngine {
            backend: &self.backend,
            levels: &self.levels,
            params: &self.params,
        };
        engine.run(workspace, rhs, x);
    }

    /// `||rhs - A x||_2` on the finest level.
    pub fn residual_norm(&self, rhs: &B::Vector, x: &B::Vector) -> f64 {
        let mut r = self.backend.create_vector(self.levels[0].info.local_rows);
        self.backend.residual(rhs, self.system_matrix(), x, &mut r);
        self.backend.norm(&r)
    }

    /// Total non-zeros over all levels relative to the finest level.
    pub fn operator_complexity(&self) -> f64 {
        let total: usize = self.levels.iter().map(|l| l.info.nnz).sum();
        total as f64 / self.levels[0].info.nnz.max(1) as f64
    }

    /// Total rows over all levels relative to the finest level.
    pub fn grid_complexity(&self) -> f64 {
        let total: usize = self.levels.iter().map(|l| l.info.rows).sum();
        total as f64 / self.levels[0].info.rows.max(1) as f64
    }
}

impl Hierarchy<Builtin> {
    /// Single-process hierarchy with plain aggregation configured from
    /// `params.coarsening`.
    ///
    /// # Errors
    ///
    /// [`SolverError::InvalidInput`] for a malformed or non-square matrix,
    /// plus everything [`new`](Self::new) reports.
    pub fn from_matrix(a: CsrMatrix<f64>, params: &AmgParams) -> Result<Self, SolverError> {
        validate_system_matrix(&a)?;
        let coarsening = Aggregation::new(params.coarsening.clone())?;
        Self::new(a, &coarsening, Builtin, params)
    }
}

impl<B: Backend> fmt::Display for Hierarchy<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_nnz: usize = self.levels.iter().map(|l| l.info.nnz).sum();
        writeln!(f, "Number of levels:    {}", self.levels.len())?;
        writeln!(f, "Operator complexity: {:.2}", self.operator_complexity())?;
        writeln!(f, "Grid complexity:     {:.2}", self.grid_complexity())?;
        writeln!(f)?;
        writeln!(f, "level     unknowns       nonzeros")?;
        writeln!(f, "---------------------------------")?;
        for level in &self.levels {
            let share = 100.0 * level.info.nnz as f64 / total_nnz.max(1) as f64;
            writeln!(
                f,
                "{:>5} {:>12} {:>14} ({:5.2}%)",
                level.info.index, level.info.rows, level.info.nnz, share
            )?;
        }
        Ok(())
    }
}
