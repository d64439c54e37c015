//! Operator-splitting QP solver in OSQP conventions.
//!
//! Solves
//!
//! ```text
//! minimize    ½xᵀPx + qᵀx
//! subject to  l ≤ Ax ≤ u
//! ```
//!
//! on an equilibrated copy of the canonical data. The structure (patterns of P
//! and A, KKT pattern, symbolic factorization) is fixed when the solver is
//! built; every buffer used by a solve is sized at that point, so re-solves
//! after numeric updates do not allocate (polishing excepted).
//!
//! # Modules
//!
//! - [`scaling`]: Ruiz equilibration and cost scaling
//! - [`termination`]: residuals and infeasibility certificates
//! - [`polish`]: active-set refinement of a converged solution
//! - [`diagnostics`]: per-iteration logging switched on from the environment

pub mod diagnostics;
pub(crate) mod polish;
pub(crate) mod scaling;
mod solve;
pub(crate) mod termination;

use crate::linalg::kkt::KktSystem;
use crate::linalg::ldl::FactorError;
use crate::mapper::DirtySet;
use crate::outcome::{Breakdown, SolveInfo};
use crate::settings::SolveOptions;
use crate::template::INFINITY_BOUND;
use crate::workspace::CanonicalQp;

use diagnostics::DiagnosticsConfig;
use polish::Polisher;
use scaling::{ScaledQp, Scaling, MIN_SCALING};
use termination::ResidualScratch;

pub(crate) const RHO_MIN: f64 = 1e-6;
pub(crate) const RHO_MAX: f64 = 1e6;
/// Step size multiplier on equality rows.
const RHO_EQ_FACTOR: f64 = 1e3;
/// Rows with u - l below this are treated as equalities.
const RHO_EQ_TOL: f64 = 1e-4;

const ROW_FREE: i8 = -1;
const ROW_INEQ: i8 = 0;
const ROW_EQ: i8 = 1;
const ROW_UNSET: i8 = 2;

/// Primal/dual solution in unscaled units, owned by the workspace.
#[derive(Debug, Clone)]
pub(crate) struct Solution {
    pub x: Vec<f64>,
    pub z: Vec<f64>,
    pub y: Vec<f64>,
    /// Holds numbers from a solve that may seed the next one.
    pub valid: bool,
}

impl Solution {
    pub fn new(n: usize, m: usize) -> Self {
        Self {
            x: vec![f64::NAN; n],
            z: vec![f64::NAN; m],
            y: vec![f64::NAN; m],
            valid: false,
        }
    }

    pub fn invalidate(&mut self) {
        self.x.fill(f64::NAN);
        self.z.fill(f64::NAN);
        self.y.fill(f64::NAN);
        self.valid = false;
    }
}

pub(crate) struct AdmmSolver {
    n: usize,
    m: usize,

    scaled: ScaledQp,
    scaling: Scaling,
    kkt: KktSystem,

    rho: f64,
    rho_base: f64,
    rho_vec: Vec<f64>,
    rho_inv_vec: Vec<f64>,
    row_kind: Vec<i8>,
    scaling_iters: Option<usize>,
    needs_setup: bool,
    // Changes handed in but not yet folded into the scaled data.
    stale: DirtySet,

    // Scaled iterates
    x: Vec<f64>,
    z: Vec<f64>,
    y: Vec<f64>,
    x_prev: Vec<f64>,
    z_prev: Vec<f64>,
    xz_tilde: Vec<f64>,
    delta_x: Vec<f64>,
    delta_y: Vec<f64>,

    scratch: ResidualScratch,
    work_n: Vec<f64>,
    work_m: Vec<f64>,

    polisher: Option<Polisher>,
    diagnostics: DiagnosticsConfig,
}

impl AdmmSolver {
    /// Build the KKT pattern and its symbolic factorization from the
    /// patterns of `data`. Values are loaded by the first solve.
    pub fn new(data: &CanonicalQp) -> Result<Self, FactorError> {
        let n = data.q.len();
        let m = data.l.len();
        let scaled = ScaledQp::new(data);
        let kkt = KktSystem::new(&scaled.p, &scaled.a)?;

        Ok(Self {
            n,
            m,
            scaled,
            scaling: Scaling::identity(n, m),
            kkt,
            rho: 0.0,
            rho_base: 0.0,
            rho_vec: vec![0.0; m],
            rho_inv_vec: vec![0.0; m],
            row_kind: vec![ROW_UNSET; m],
            scaling_iters: None,
            needs_setup: true,
            stale: DirtySet::all(),
            x: vec![0.0; n],
            z: vec![0.0; m],
            y: vec![0.0; m],
            x_prev: vec![0.0; n],
            z_prev: vec![0.0; m],
            xz_tilde: vec![0.0; n + m],
            delta_x: vec![0.0; n],
            delta_y: vec![0.0; m],
            scratch: ResidualScratch::new(n, m),
            work_n: vec![0.0; n],
            work_m: vec![0.0; m],
            polisher: None,
            diagnostics: DiagnosticsConfig::from_env(),
        })
    }

    /// Nonzeros in the KKT matrix and in its factor.
    pub fn kkt_nnz(&self) -> (usize, usize) {
        (self.kkt.nnz(), self.kkt.factor_nnz())
    }

    /// Bring the scaled data and factorization in line with `data`.
    ///
    /// `warm` selects whether the adapted step size from the last solve is
    /// kept.
    fn setup(
        &mut self,
        data: &CanonicalQp,
        opts: &SolveOptions,
        warm: bool,
        info: &mut SolveInfo,
    ) -> Result<(), Breakdown> {
        let mut rho_changed = false;
        if opts.rho != self.rho_base || !warm {
            rho_changed = self.rho != opts.rho;
            self.rho_base = opts.rho;
            self.rho = opts.rho;
        }

        let full = self.needs_setup
            || self.stale.matrices
            || self.scaling_iters != Some(opts.scaling_iters)
            || self.kkt.sigma() != opts.sigma;

        if full {
            check_data(data)?;
            self.scaling
                .equilibrate(data, &mut self.scaled, opts.scaling_iters);
            self.scaling.load_bounds(data, &mut self.scaled);
            self.scaling_iters = Some(opts.scaling_iters);
            self.update_rho_vec();
            self.kkt.update_values(
                self.scaled.p.data(),
                self.scaled.a.data(),
                opts.sigma,
                &self.rho_inv_vec,
            );
            self.factor(info)?;
            self.needs_setup = false;
        } else {
            if self.stale.vectors {
                if !data.q.iter().all(|v| v.is_finite()) || !data.offset.is_finite() {
                    return Err(Breakdown::NonFiniteData);
                }
                self.scaling.load_q(data, &mut self.scaled);
            }
            if self.stale.bounds {
                self.scaling.load_bounds(data, &mut self.scaled);
            }
            let reclassified = self.update_rho_vec();
            if reclassified || rho_changed {
                self.kkt.update_rho(&self.rho_inv_vec);
                self.factor(info)?;
            }
        }
        self.stale.clear();
        Ok(())
    }

    /// Recompute per-row step sizes from the scaled bounds. Returns whether
    /// any row changed class.
    fn update_rho_vec(&mut self) -> bool {
        let inf = INFINITY_BOUND * MIN_SCALING;
        let mut changed = false;
        for i in 0..self.m {
            let (l, u) = (self.scaled.l[i], self.scaled.u[i]);
            let kind = if l < -inf && u > inf {
                ROW_FREE
            } else if u - l < RHO_EQ_TOL {
                ROW_EQ
            } else {
                ROW_INEQ
            };
            if kind != self.row_kind[i] {
                self.row_kind[i] = kind;
                changed = true;
            }
            self.rho_vec[i] = match kind {
                ROW_FREE => RHO_MIN,
                ROW_EQ => RHO_EQ_FACTOR * self.rho,
                _ => self.rho,
            };
            self.rho_inv_vec[i] = 1.0 / self.rho_vec[i];
        }
        changed
    }

    fn factor(&mut self, info: &mut SolveInfo) -> Result<(), Breakdown> {
        self.kkt.factor().map_err(breakdown_from)?;
        info.factorizations += 1;
        Ok(())
    }
}

fn breakdown_from(err: FactorError) -> Breakdown {
    match err {
        FactorError::ZeroPivot { index } => Breakdown::ZeroPivot { index },
        FactorError::NonFinite => Breakdown::NonFiniteFactor,
        _ => Breakdown::FactorizationFailed,
    }
}

/// Reject NaN/inf in the matrices and cost, and negative diagonals of P.
fn check_data(data: &CanonicalQp) -> Result<(), Breakdown> {
    let finite = data
        .p
        .data()
        .iter()
        .chain(data.a.data())
        .chain(&data.q)
        .all(|v| v.is_finite());
    if !finite || !data.offset.is_finite() {
        return Err(Breakdown::NonFiniteData);
    }

    let colptr = data.p.indptr();
    let colptr = colptr.raw_storage();
    let rowval = data.p.indices();
    let values = data.p.data();
    for col in 0..data.p.cols() {
        for k in colptr[col]..colptr[col + 1] {
            if rowval[k] == col && values[k] < 0.0 {
                return Err(Breakdown::NonConvex { column: col });
            }
        }
    }
    Ok(())
}
