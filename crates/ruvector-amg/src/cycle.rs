//! Multigrid cycle engine.
//!
//! One cycle at level `l` (repeated `ncycle` times):
//!
//! ```text
//! relax npre times           x <- x + w D^-1 (b - A x)
//! t       = b - A x
//! f_{l+1} = R t
//! u_{l+1} = 0
//! solve on level l+1         recursive cycle, or K-cycle on K-levels
//! x      += P u_{l+1}
//! relax npost times
//! ```
//!
//! On the coarsest level the cycle is a direct solve. `ncycle = 1` gives the
//! V-cycle and `ncycle = 2` the W-cycle.
//!
//! A K-level (index `l >= 1`, not coarsest, `l % kcycle == 0`) wraps the
//! recursive cycle in two steps of flexible conjugate gradients, using the
//! cycle itself as the preconditioner.
//!
//! The engine never checks convergence and cannot fail: every shape was
//! fixed during setup.

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::SolverError;
use crate::hierarchy::{Level, LevelKind};

/// Cycle parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleParams {
    /// Relaxations before the coarse correction.
    pub npre: usize,
    /// Relaxations after the coarse correction.
    pub npost: usize,
    /// Cycle repetitions per level (1: V-cycle, 2: W-cycle).
    pub ncycle: usize,
    /// K-cycle period; 0 disables K-cycles.
    pub kcycle: usize,
    /// Damping factor of the Jacobi relaxation.
    pub relax_damping: f64,
}

impl Default for CycleParams {
    fn default() -> Self {
        Self {
            npre: 1,
            npost: 1,
            ncycle: 1,
            kcycle: 0,
            relax_damping: 0.72,
        }
    }
}

impl CycleParams {
    /// Check that the repetition counts are positive and the damping is
    /// finite and positive.
    pub fn validate(&self) -> Result<(), SolverError> {
        for (name, value) in [
            ("cycle.npre", self.npre),
            ("cycle.npost", self.npost),
            ("cycle.ncycle", self.ncycle),
        ] {
            if value == 0 {
                return Err(SolverError::configuration(name, value, ">= 1"));
            }
        }
        if !self.relax_damping.is_finite() || self.relax_damping <= 0.0 {
            return Err(SolverError::configuration(
                "cycle.relax_damping",
                self.relax_damping,
                "finite and > 0",
            ));
        }
        Ok(())
    }

    /// Whether level `index` of a hierarchy with `levels` levels runs the
    /// K-cycle.
    pub fn is_kcycle_level(&self, index: usize, levels: usize) -> bool {
        self.kcycle > 0 && index > 0 && index + 1 < levels && index % self.kcycle == 0
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// Per-level work vectors for one caller of the cycle engine.
///
/// A hierarchy owns a default workspace for [`Hierarchy::cycle`]; independent
/// callers sharing a hierarchy each allocate their own with
/// [`Hierarchy::workspace`] and use [`Hierarchy::cycle_with`].
///
/// [`Hierarchy::cycle`]: crate::hierarchy::Hierarchy::cycle
/// [`Hierarchy::workspace`]: crate::hierarchy::Hierarchy::workspace
/// [`Hierarchy::cycle_with`]: crate::hierarchy::Hierarchy::cycle_with
pub struct Workspace<B: Backend> {
    pub(crate) levels: Vec<LevelWorkspace<B>>,
}

pub(crate) struct LevelWorkspace<B: Backend> {
    /// Right-hand side restricted from the finer level (unused on level 0).
    f: B::Vector,
    /// Correction solved for on this level (unused on level 0).
    u: B::Vector,
    scratch: Scratch<B>,
}

pub(crate) struct Scratch<B: Backend> {
    /// Residual buffer.
    t: B::Vector,
    kcycle: Option<KcycleVectors<B>>,
}

pub(crate) struct KcycleVectors<B: Backend> {
    r: B::Vector,
    s: B::Vector,
    p: B::Vector,
    q: B::Vector,
}

impl<B: Backend> Workspace<B> {
    pub(crate) fn new(backend: &B, levels: &[Level<B>], params: &CycleParams) -> Self {
        let nlevels = levels.len();
        let levels = levels
            .iter()
            .enumerate()
            .map(|(index, level)| {
                let n = level.info().local_rows;
                let (f, u) = if index == 0 {
                    (backend.create_vector(0), backend.create_vector(0))
                } else {
                    (backend.create_vector(n), backend.create_vector(n))
                };
                let kcycle = params
                    .is_kcycle_level(index, nlevels)
                    .then(|| KcycleVectors {
                        r: backend.create_vector(n),
                        s: backend.create_vector(n),
                        p: backend.create_vector(n),
                        q: backend.create_vector(n),
                    });
                LevelWorkspace {
                    f,
                    u,
                    scratch: Scratch {
                        t: backend.create_vector(n),
                        kcycle,
                    },
                }
            })
            .collect();
        Self { levels }
    }

    /// Number of levels this workspace was sized for.
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// Whether the workspace is empty.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Indices of the levels carrying K-cycle vectors.
    pub fn kcycle_levels(&self) -> Vec<usize> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, ws)| ws.scratch.kcycle.is_some())
            .map(|(index, _)| index)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub(crate) struct CycleEngine<'a, B: Backend> {
    pub(crate) backend: &'a B,
    pub(crate) levels: &'a [Level<B>],
    pub(crate) params: &'a CycleParams,
}

impl<'a, B: Backend> CycleEngine<'a, B> {
    /// One cycle from the finest level.
    pub(crate) fn run(&self, workspace: &mut Workspace<B>, rhs: &B::Vector, x: &mut B::Vector) {
        assert_eq!(
            workspace.levels.len(),
            self.levels.len(),
            "workspace was allocated for a different hierarchy"
        );
        if let Some((top, deeper)) = workspace.levels.split_first_mut() {
            self.cycle(0, &mut top.scratch.t, deeper, rhs, x);
        }
    }

    /// `deeper` holds the workspaces of levels `l+1..`.
    fn cycle(
        &self,
        l: usize,
        t: &mut B::Vector,
        deeper: &mut [LevelWorkspace<B>],
        rhs: &B::Vector,
        x: &mut B::Vector,
    ) {
        let level = &self.levels[l];
        let (diag, prolongation, restriction) = match &level.kind {
            LevelKind::Coarsest(solver) => {
                self.backend.direct_solve(solver, rhs, x);
                return;
            }
            LevelKind::Relaxed {
                diag,
                prolongation,
                restriction,
            } => (diag, prolongation, restriction),
        };

        let Some((next, rest)) = deeper.split_first_mut() else {
            unreachable!("level {l} has transfer operators but no coarser workspace");
        };
        let LevelWorkspace { f, u, scratch } = next;

        for _ in 0..self.params.ncycle {
            for _ in 0..self.params.npre {
                self.relax(&level.a, diag, rhs, x, t);
            }

            self.backend.residual(rhs, &level.a, x, t);
            self.backend.spmv(1.0, restriction, t, 0.0, f);
            self.backend.clear(u);

            let Scratch { t: next_t, kcycle } = &mut *scratch;
            match kcycle {
                Some(k) => self.kcycle(l + 1, next_t, k, rest, f, u),
                None => self.cycle(l + 1, next_t, rest, f, u),
            }

            self.backend.spmv(1.0, prolongation, u, 1.0, x);

            for _ in 0..self.params.npost {
                self.relax(&level.a, diag, rhs, x, t);
            }
        }
    }

    /// Two steps of flexible CG on level `l`, preconditioned by [`cycle`].
    ///
    /// A zero `<r, s>` or `<q, p>` means the remaining correction is zero, so
    /// the loop stops instead of dividing by it.
    ///
    /// [`cycle`]: Self::cycle
    fn kcycle(
        &self,
        l: usize,
        t: &mut B::Vector,
        k: &mut KcycleVectors<B>,
        deeper: &mut [LevelWorkspace<B>],
        rhs: &B::Vector,
        x: &mut B::Vector,
    ) {
        let a = &self.levels[l].a;
        let KcycleVectors { r, s, p, q } = k;
        let backend = self.backend;

        backend.copy_vector(rhs, r);
        let mut rho = 0.0;

        for iter in 0..2 {
            backend.clear(s);
            self.cycle(l, t, deeper, r, s);

            let rho_prev = rho;
            rho = backend.inner_product(r, s);
            if rho == 0.0 {
                break;
            }

            if iter == 0 {
                backend.copy_vector(s, p);
            } else {
                backend.axpby(1.0, s, rho / rho_prev, p);
            }

            backend.spmv(1.0, a, p, 0.0, q);
            let qp = backend.inner_product(q, p);
            if qp == 0.0 {
                break;
            }
            let alpha = rho / qp;

            backend.axpby(alpha, p, 1.0, x);
            backend.axpby(-alpha, q, 1.0, r);
        }
    }

    /// Damped Jacobi sweep.
    fn relax(
        &self,
        a: &B::Matrix,
        diag: &B::Vector,
        rhs: &B::Vector,
        x: &mut B::Vector,
        t: &mut B::Vector,
    ) {
        self.backend.residual(rhs, a, x, t);
        self.backend
            .scaled_diag_update(self.params.relax_damping, t, diag, x);
    }
}
