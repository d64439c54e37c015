//! Residuals, convergence test and infeasibility certificates.

use super::scaling::{ScaledQp, Scaling, MIN_SCALING};
use crate::linalg::sparse;
use crate::settings::SolveOptions;
use crate::template::INFINITY_BOUND;

/// Guard against division by zero in ratios.
pub(crate) const DIVISION_TOL: f64 = 1e-30;

/// Residuals of one iterate.
///
/// `prim`/`dual` and the tolerances are in unscaled units; the `*_ratio`
/// fields are the scaled relative residuals used for the step-size estimate.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Residuals {
    pub prim: f64,
    pub dual: f64,
    pub eps_prim: f64,
    pub eps_dual: f64,
    pub prim_ratio: f64,
    pub dual_ratio: f64,
}

impl Residuals {
    pub fn converged(&self) -> bool {
        self.prim <= self.eps_prim && self.dual <= self.eps_dual
    }

    /// Within 10x of tolerance.
    pub fn nearly_converged(&self) -> bool {
        self.prim <= 10.0 * self.eps_prim && self.dual <= 10.0 * self.eps_dual
    }

    pub fn is_finite(&self) -> bool {
        self.prim.is_finite() && self.dual.is_finite()
    }
}

/// Scratch vectors for residual and certificate evaluation.
pub(crate) struct ResidualScratch {
    pub ax: Vec<f64>,
    pub px: Vec<f64>,
    pub aty: Vec<f64>,
}

impl ResidualScratch {
    pub fn new(n: usize, m: usize) -> Self {
        Self {
            ax: vec![0.0; m],
            px: vec![0.0; n],
            aty: vec![0.0; n],
        }
    }
}

/// Evaluate residuals of the scaled iterate (x, z, y).
pub(crate) fn residuals(
    qp: &ScaledQp,
    scaling: &Scaling,
    x: &[f64],
    z: &[f64],
    y: &[f64],
    scratch: &mut ResidualScratch,
    opts: &SolveOptions,
) -> Residuals {
    sparse::spmv(&qp.a, x, &mut scratch.ax, 1.0, 0.0);
    sparse::symv_upper(&qp.p, x, &mut scratch.px, 1.0, 0.0);
    sparse::spmv_transpose(&qp.a, y, &mut scratch.aty, 1.0, 0.0);

    // Primal: ‖E⁻¹(A_s x - z)‖∞
    let (mut prim, mut ax_norm, mut z_norm) = (0.0_f64, 0.0_f64, 0.0_f64);
    let (mut prim_s, mut ax_norm_s, mut z_norm_s) = (0.0_f64, 0.0_f64, 0.0_f64);
    for i in 0..z.len() {
        let e_inv = scaling.e_inv[i];
        let r = scratch.ax[i] - z[i];
        prim = prim.max((e_inv * r).abs());
        ax_norm = ax_norm.max((e_inv * scratch.ax[i]).abs());
        z_norm = z_norm.max((e_inv * z[i]).abs());
        prim_s = prim_s.max(r.abs());
        ax_norm_s = ax_norm_s.max(scratch.ax[i].abs());
        z_norm_s = z_norm_s.max(z[i].abs());
    }

    // Dual: c⁻¹‖D⁻¹(P_s x + q_s + A_sᵀ y)‖∞
    let (mut dual, mut px_norm, mut aty_norm, mut q_norm) = (0.0_f64, 0.0_f64, 0.0_f64, 0.0_f64);
    let (mut dual_s, mut px_norm_s, mut aty_norm_s, mut q_norm_s) =
        (0.0_f64, 0.0_f64, 0.0_f64, 0.0_f64);
    for j in 0..x.len() {
        let d_inv = scaling.d_inv[j];
        let r = scratch.px[j] + qp.q[j] + scratch.aty[j];
        dual = dual.max((d_inv * r).abs());
        px_norm = px_norm.max((d_inv * scratch.px[j]).abs());
        aty_norm = aty_norm.max((d_inv * scratch.aty[j]).abs());
        q_norm = q_norm.max((d_inv * qp.q[j]).abs());
        dual_s = dual_s.max(r.abs());
        px_norm_s = px_norm_s.max(scratch.px[j].abs());
        aty_norm_s = aty_norm_s.max(scratch.aty[j].abs());
        q_norm_s = q_norm_s.max(qp.q[j].abs());
    }
    let c_inv = scaling.c_inv;

    Residuals {
        prim,
        dual: c_inv * dual,
        eps_prim: opts.eps_abs + opts.eps_rel * ax_norm.max(z_norm),
        eps_dual: opts.eps_abs + opts.eps_rel * c_inv * px_norm.max(aty_norm).max(q_norm),
        prim_ratio: prim_s / (ax_norm_s.max(z_norm_s) + DIVISION_TOL),
        dual_ratio: dual_s / (px_norm_s.max(aty_norm_s).max(q_norm_s) + DIVISION_TOL),
    }
}

/// Primal infeasibility certificate from the dual step δy:
/// `uᵀmax(δy, 0) + lᵀmin(δy, 0) < 0` and `Aᵀδy ≈ 0`.
pub(crate) fn primal_infeasible(
    qp: &ScaledQp,
    scaling: &Scaling,
    delta_y: &[f64],
    work_n: &mut [f64],
    eps: f64,
) -> bool {
    let norm = delta_y
        .iter()
        .zip(&scaling.e)
        .fold(0.0_f64, |acc, (dy, e)| acc.max((dy * e).abs()));
    if norm <= DIVISION_TOL {
        return false;
    }

    let mut lhs = 0.0;
    for (i, &dy) in delta_y.iter().enumerate() {
        if dy > 0.0 {
            lhs += qp.u[i] * dy;
        } else if dy < 0.0 {
            lhs += qp.l[i] * dy;
        }
    }
    if !(lhs / norm < eps) {
        return false;
    }

    sparse::spmv_transpose(&qp.a, delta_y, work_n, 1.0, 0.0);
    let at_dy = work_n
        .iter()
        .zip(&scaling.d_inv)
        .fold(0.0_f64, |acc, (v, d)| acc.max((v * d).abs()));
    at_dy / norm < eps
}

/// Dual infeasibility certificate from the primal step δx:
/// `qᵀδx < 0`, `Pδx ≈ 0` and `Aδx` in the recession cone of [l, u].
pub(crate) fn dual_infeasible(
    qp: &ScaledQp,
    scaling: &Scaling,
    delta_x: &[f64],
    work_n: &mut [f64],
    work_m: &mut [f64],
    eps: f64,
) -> bool {
    let norm = delta_x
        .iter()
        .zip(&scaling.d)
        .fold(0.0_f64, |acc, (dx, d)| acc.max((dx * d).abs()));
    if norm <= DIVISION_TOL {
        return false;
    }
    let tol = eps * norm;

    let q_dx: f64 = qp.q.iter().zip(delta_x).map(|(q, dx)| q * dx).sum();
    if !(q_dx < -scaling.c * tol) {
        return false;
    }

    sparse::symv_upper(&qp.p, delta_x, work_n, 1.0, 0.0);
    let p_dx = work_n
        .iter()
        .zip(&scaling.d_inv)
        .fold(0.0_f64, |acc, (v, d)| acc.max((v * d).abs()));
    if !(p_dx < scaling.c * tol) {
        return false;
    }

    sparse::spmv(&qp.a, delta_x, work_m, 1.0, 0.0);
    let inf = INFINITY_BOUND * MIN_SCALING;
    for i in 0..work_m.len() {
        let a_dx = scaling.e_inv[i] * work_m[i];
        if (qp.u[i] < inf && a_dx > tol) || (qp.l[i] > -inf && a_dx < -tol) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse::from_triplets;
    use crate::workspace::CanonicalQp;

    fn unscaled(qp: CanonicalQp) -> (ScaledQp, Scaling) {
        let n = qp.q.len();
        let m = qp.l.len();
        (ScaledQp::new(&qp), Scaling::identity(n, m))
    }

    #[test]
    fn test_residuals_at_known_optimum() {
        // min ½x² - x  s.t. -10 <= x <= 10: optimum x = 1, y = 0.
        let qp = CanonicalQp::new(
            from_triplets(1, 1, vec![(0, 0, 1.0)]),
            vec![-1.0],
            from_triplets(1, 1, vec![(0, 0, 1.0)]),
            vec![-10.0],
            vec![10.0],
            0.0,
        );
        let (scaled, scaling) = unscaled(qp);
        let mut scratch = ResidualScratch::new(1, 1);
        let opts = SolveOptions::embedded();
        let res = residuals(&scaled, &scaling, &[1.0], &[1.0], &[0.0], &mut scratch, &opts);
        assert_eq!(res.prim, 0.0);
        assert_eq!(res.dual, 0.0);
        assert!(res.converged());

        let res = residuals(&scaled, &scaling, &[2.0], &[1.0], &[0.0], &mut scratch, &opts);
        assert_eq!(res.prim, 1.0);
        assert_eq!(res.dual, 1.0);
        assert!(!res.nearly_converged());
    }

    #[test]
    fn test_primal_certificate() {
        // x >= 1 and x <= -1 written as two rows on the same x.
        let qp = CanonicalQp::new(
            from_triplets(1, 1, vec![(0, 0, 1.0)]),
            vec![0.0],
            from_triplets(2, 1, vec![(0, 0, 1.0), (1, 0, 1.0)]),
            vec![1.0, f64::NEG_INFINITY],
            vec![f64::INFINITY, -1.0],
            0.0,
        );
        let (scaled, scaling) = unscaled(qp);
        let mut work = vec![0.0; 1];
        // δy = (-1, 1): uᵀmax + lᵀmin = -1 + -1 < 0 and Aᵀδy = 0.
        assert!(primal_infeasible(&scaled, &scaling, &[-1.0, 1.0], &mut work, 1e-4));
        // Wrong signs hit an infinite bound.
        assert!(!primal_infeasible(&scaled, &scaling, &[1.0, -1.0], &mut work, 1e-4));
    }

    #[test]
    fn test_dual_certificate() {
        // min -x  s.t. x >= 0 (no upper bound): unbounded along δx = 1.
        let qp = CanonicalQp::new(
            from_triplets(1, 1, vec![]),
            vec![-1.0],
            from_triplets(1, 1, vec![(0, 0, 1.0)]),
            vec![0.0],
            vec![f64::INFINITY],
            0.0,
        );
        let (scaled, scaling) = unscaled(qp);
        let mut wn = vec![0.0; 1];
        let mut wm = vec![0.0; 1];
        assert!(dual_infeasible(&scaled, &scaling, &[1.0], &mut wn, &mut wm, 1e-4));
        assert!(!dual_infeasible(&scaled, &scaling, &[-1.0], &mut wn, &mut wm, 1e-4));
    }
}
