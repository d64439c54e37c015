//! ADMM main loop.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::polish::Polisher;
use super::termination::{self, Residuals, DIVISION_TOL};
use super::{breakdown_from, AdmmSolver, Solution, RHO_MAX, RHO_MIN};
use crate::linalg::ldl::FactorError;
use crate::linalg::sparse;
use crate::mapper::DirtySet;
use crate::outcome::{Breakdown, SolveInfo, SolveOutcome, SolveStatus};
use crate::settings::SolveOptions;
use crate::workspace::CanonicalQp;

/// Residuals this small count as zero when judging a polished solution.
const POLISH_ZERO_RES: f64 = 1e-10;

impl AdmmSolver {
    /// Solve the QP held in `data`.
    ///
    /// `dirty` lists the classes of data changed since the previous call;
    /// `solution` is read for warm starting and overwritten with the
    /// unscaled result.
    pub fn solve(
        &mut self,
        data: &CanonicalQp,
        dirty: DirtySet,
        solution: &mut Solution,
        opts: &SolveOptions,
        data_generation: u64,
    ) -> SolveOutcome {
        let start = Instant::now();
        let mut info = SolveInfo {
            data_generation,
            ..SolveInfo::default()
        };
        self.stale.merge(dirty);

        // Empty intervals are reported before touching the solver state.
        if let Some(row) = data.l.iter().zip(&data.u).position(|(l, u)| l > u) {
            debug!("row {} has l = {:e} > u = {:e}", row, data.l[row], data.u[row]);
            solution.invalidate();
            info.objective = f64::INFINITY;
            info.primal_residual = f64::INFINITY;
            info.dual_residual = f64::NAN;
            info.rho = self.rho;
            info.solve_time = start.elapsed().as_secs_f64();
            return self.finish(SolveStatus::Infeasible, info, None, opts);
        }

        let warm = opts.warm_start && solution.valid;
        if let Err(breakdown) = self.setup(data, opts, warm, &mut info) {
            return self.fail(breakdown, solution, info, start, opts);
        }
        info.setup_time = start.elapsed().as_secs_f64();

        if warm {
            for j in 0..self.n {
                self.x[j] = self.scaling.d_inv[j] * solution.x[j];
            }
            for i in 0..self.m {
                self.z[i] = self.scaling.e[i] * solution.z[i];
                self.y[i] = self.scaling.c * self.scaling.e_inv[i] * solution.y[i];
            }
            info.warm_started = true;
        } else {
            self.x.fill(0.0);
            self.z.fill(0.0);
            self.y.fill(0.0);
        }

        let deadline = opts
            .time_limit_ms
            .map(|ms| start + Duration::from_millis(ms));
        let check_every = opts.check_termination.max(1);
        let adapt_every = opts.adaptive_rho_interval.max(1);

        let mut status = None;
        let mut res = Residuals::default();
        let mut timed_out = false;
        let mut iter = 0;

        while iter < opts.max_iter {
            iter += 1;
            std::mem::swap(&mut self.x, &mut self.x_prev);
            std::mem::swap(&mut self.z, &mut self.z_prev);

            if let Err(err) = self.step(opts) {
                return self.fail(breakdown_from(err), solution, info, start, opts);
            }

            let last = iter == opts.max_iter;
            timed_out = deadline.is_some_and(|d| Instant::now() >= d);
            let check = last || timed_out || iter % check_every == 0;
            let adapt = opts.adaptive_rho && !last && iter % adapt_every == 0;

            if check || adapt {
                res = termination::residuals(
                    &self.scaled,
                    &self.scaling,
                    &self.x,
                    &self.z,
                    &self.y,
                    &mut self.scratch,
                    opts,
                );
                if !res.is_finite() {
                    info.iterations = iter;
                    let breakdown = Breakdown::NonFiniteIterate { iteration: iter };
                    return self.fail(breakdown, solution, info, start, opts);
                }
            }

            if check {
                if self.diagnostics.should_log(iter) {
                    debug!(
                        "iter {:5}: prim {:.3e} (eps {:.2e}) dual {:.3e} (eps {:.2e}) rho {:.2e}",
                        iter, res.prim, res.eps_prim, res.dual, res.eps_dual, self.rho
                    );
                }
                if res.converged() {
                    status = Some(SolveStatus::Optimal);
                    break;
                }
                if termination::primal_infeasible(
                    &self.scaled,
                    &self.scaling,
                    &self.delta_y,
                    &mut self.work_n,
                    opts.eps_prim_inf,
                ) {
                    status = Some(SolveStatus::Infeasible);
                    break;
                }
                if termination::dual_infeasible(
                    &self.scaled,
                    &self.scaling,
                    &self.delta_x,
                    &mut self.work_n,
                    &mut self.work_m,
                    opts.eps_dual_inf,
                ) {
                    status = Some(SolveStatus::Unbounded);
                    break;
                }
            }
            if timed_out {
                break;
            }

            if adapt {
                if let Err(breakdown) = self.adapt_rho(&res, opts, &mut info) {
                    info.iterations = iter;
                    return self.fail(breakdown, solution, info, start, opts);
                }
            }
        }

        let status = status.unwrap_or(if res.nearly_converged() {
            SolveStatus::OptimalInaccurate
        } else if timed_out {
            SolveStatus::TimeLimitReached
        } else {
            SolveStatus::MaxIterationsReached
        });

        info.iterations = iter;
        info.rho = self.rho;
        info.primal_residual = res.prim;
        info.dual_residual = res.dual;

        match status {
            SolveStatus::Infeasible | SolveStatus::Unbounded => {
                solution.invalidate();
                info.objective = if status == SolveStatus::Infeasible {
                    f64::INFINITY
                } else {
                    f64::NEG_INFINITY
                };
            }
            _ => {
                if opts.polish && status == SolveStatus::Optimal {
                    let polish_start = Instant::now();
                    if let Some(pol) = self.polish(&res, opts) {
                        info.polished = true;
                        info.primal_residual = pol.prim;
                        info.dual_residual = pol.dual;
                    }
                    info.polish_time = polish_start.elapsed().as_secs_f64();
                }
                self.store(solution);
                info.objective = self.objective(data);
            }
        }

        info.solve_time = start.elapsed().as_secs_f64();
        self.finish(status, info, None, opts)
    }

    /// One ADMM iteration from (x_prev, z_prev, y).
    fn step(&mut self, opts: &SolveOptions) -> Result<(), FactorError> {
        let (n, m) = (self.n, self.m);
        let sigma = self.kkt.sigma();
        let alpha = opts.alpha;

        for j in 0..n {
            self.xz_tilde[j] = sigma * self.x_prev[j] - self.scaled.q[j];
        }
        for i in 0..m {
            self.xz_tilde[n + i] = self.z_prev[i] - self.rho_inv_vec[i] * self.y[i];
        }
        self.kkt.solve_in_place(&mut self.xz_tilde)?;

        // z̃ = z_prev + ρ⁻¹(ν - y)
        for i in 0..m {
            let nu = self.xz_tilde[n + i];
            self.xz_tilde[n + i] = self.z_prev[i] + self.rho_inv_vec[i] * (nu - self.y[i]);
        }

        for j in 0..n {
            self.x[j] = alpha * self.xz_tilde[j] + (1.0 - alpha) * self.x_prev[j];
            self.delta_x[j] = self.x[j] - self.x_prev[j];
        }

        for i in 0..m {
            let z_relax = alpha * self.xz_tilde[n + i] + (1.0 - alpha) * self.z_prev[i];
            let z = (z_relax + self.rho_inv_vec[i] * self.y[i])
                .max(self.scaled.l[i])
                .min(self.scaled.u[i]);
            self.z[i] = z;
            self.delta_y[i] = self.rho_vec[i] * (z_relax - z);
            self.y[i] += self.delta_y[i];
        }
        Ok(())
    }

    /// Rebalance ρ from the ratio of relative residuals; refactor only when
    /// the estimate moved by more than the configured factor.
    fn adapt_rho(
        &mut self,
        res: &Residuals,
        opts: &SolveOptions,
        info: &mut SolveInfo,
    ) -> Result<(), Breakdown> {
        let estimate = self.rho * (res.prim_ratio / (res.dual_ratio + DIVISION_TOL)).sqrt();
        let estimate = estimate.clamp(RHO_MIN, RHO_MAX);
        let tol = opts.adaptive_rho_tolerance;
        if estimate > self.rho * tol || estimate < self.rho / tol {
            self.rho = estimate;
            self.update_rho_vec();
            self.kkt.update_rho(&self.rho_inv_vec);
            self.factor(info)?;
            info.rho_updates += 1;
        }
        Ok(())
    }

    /// Polish the current iterate. Returns the polished residuals if the
    /// result was accepted and copied into the iterate.
    fn polish(&mut self, res: &Residuals, opts: &SolveOptions) -> Option<Residuals> {
        let scaled = &self.scaled;
        let polisher = self.polisher.get_or_insert_with(|| Polisher::new(&scaled.a));
        if let Err(err) = polisher.run(
            scaled,
            &self.z,
            &self.y,
            opts.polish_delta,
            opts.polish_refine_iter,
        ) {
            debug!("polish failed: {}", err);
            return None;
        }

        let pol = termination::residuals(
            scaled,
            &self.scaling,
            &polisher.x,
            &polisher.z,
            &polisher.y,
            &mut self.scratch,
            opts,
        );
        let accept = (pol.prim < res.prim && pol.dual < res.dual)
            || (pol.prim < res.prim && res.dual < POLISH_ZERO_RES)
            || (pol.dual < res.dual && res.prim < POLISH_ZERO_RES);
        debug!(
            "polish: {} active, prim {:.3e} -> {:.3e}, dual {:.3e} -> {:.3e}, {}",
            polisher.active_count(),
            res.prim,
            pol.prim,
            res.dual,
            pol.dual,
            if accept { "accepted" } else { "rejected" }
        );
        if !accept {
            return None;
        }
        self.x.copy_from_slice(&polisher.x);
        self.z.copy_from_slice(&polisher.z);
        self.y.copy_from_slice(&polisher.y);
        Some(pol)
    }

    /// Unscale the iterate into `solution`: x = D x_s, z = E⁻¹ z_s,
    /// y = c⁻¹ E y_s.
    fn store(&self, solution: &mut Solution) {
        for j in 0..self.n {
            solution.x[j] = self.scaling.d[j] * self.x[j];
        }
        for i in 0..self.m {
            solution.z[i] = self.scaling.e_inv[i] * self.z[i];
            solution.y[i] = self.scaling.c_inv * self.scaling.e[i] * self.y[i];
        }
        solution.valid = true;
    }

    fn objective(&self, data: &CanonicalQp) -> f64 {
        let quad = sparse::quad_form_upper(&self.scaled.p, &self.x);
        let lin: f64 = self.scaled.q.iter().zip(&self.x).map(|(q, x)| q * x).sum();
        self.scaling.c_inv * (0.5 * quad + lin) + data.offset
    }

    fn fail(
        &mut self,
        breakdown: Breakdown,
        solution: &mut Solution,
        mut info: SolveInfo,
        start: Instant,
        opts: &SolveOptions,
    ) -> SolveOutcome {
        warn!("numerical breakdown: {}", breakdown);
        self.needs_setup = true;
        solution.invalidate();
        info.objective = f64::NAN;
        info.primal_residual = f64::NAN;
        info.dual_residual = f64::NAN;
        info.rho = self.rho;
        info.solve_time = start.elapsed().as_secs_f64();
        self.finish(SolveStatus::Error, info, Some(breakdown), opts)
    }

    fn finish(
        &self,
        status: SolveStatus,
        info: SolveInfo,
        breakdown: Option<Breakdown>,
        opts: &SolveOptions,
    ) -> SolveOutcome {
        let outcome = SolveOutcome {
            status,
            info,
            breakdown,
        };
        if opts.verbose {
            info!(
                "qpgen: {} ({} factorizations, {} rho updates{})",
                outcome,
                info.factorizations,
                info.rho_updates,
                if info.warm_started { ", warm" } else { "" }
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse::from_triplets;

    fn box_qp(lower: f64, upper: f64) -> CanonicalQp {
        // min x0² + x1² - 2x0 - x1  s.t. lower ≤ x ≤ upper, x0 + x1 = 1
        let p = from_triplets(2, 2, vec![(0, 0, 2.0), (1, 1, 2.0)]);
        let a = from_triplets(3, 2, vec![(0, 0, 1.0), (1, 1, 1.0), (2, 0, 1.0), (2, 1, 1.0)]);
        CanonicalQp::new(
            p,
            vec![-2.0, -1.0],
            a,
            vec![lower, lower, 1.0],
            vec![upper, upper, 1.0],
            0.0,
        )
    }

    fn run(data: &CanonicalQp, opts: &SolveOptions) -> (SolveOutcome, Solution) {
        let mut solver = AdmmSolver::new(data).unwrap();
        let mut solution = Solution::new(2, 3);
        let outcome = solver.solve(data, DirtySet::all(), &mut solution, opts, 1);
        (outcome, solution)
    }

    #[test]
    fn test_equality_constrained_optimum() {
        // Stationarity on x0 + x1 = 1 gives x0 - x1 = 0.5.
        let data = box_qp(-10.0, 10.0);
        let opts = SolveOptions::reference();
        let (outcome, sol) = run(&data, &opts);
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!((sol.x[0] - 0.75).abs() < 1e-4, "x0 = {}", sol.x[0]);
        assert!((sol.x[1] - 0.25).abs() < 1e-4, "x1 = {}", sol.x[1]);
        let expected = 0.75f64.powi(2) + 0.25f64.powi(2) - 2.0 * 0.75 - 0.25;
        assert!((outcome.objective() - expected).abs() < 1e-4);
        assert!(outcome.info.polished);
    }

    #[test]
    fn test_active_bound() {
        let data = box_qp(0.0, 0.6);
        let (outcome, sol) = run(&data, &SolveOptions::reference());
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!((sol.x[0] - 0.6).abs() < 1e-4);
        assert!((sol.x[1] - 0.4).abs() < 1e-4);
        // Upper bound on x0 is active: positive multiplier.
        assert!(sol.y[0] > 0.0);
    }

    #[test]
    fn test_empty_interval_skips_iterations() {
        let data = box_qp(1.0, 0.0);
        let (outcome, sol) = run(&data, &SolveOptions::embedded());
        assert_eq!(outcome.status, SolveStatus::Infeasible);
        assert_eq!(outcome.iterations(), 0);
        assert!(sol.x.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_certificate_infeasible() {
        // x0 + x1 = 1 with both variables in [0, 0.2]
        let data = box_qp(0.0, 0.2);
        let (outcome, sol) = run(&data, &SolveOptions::embedded());
        assert_eq!(outcome.status, SolveStatus::Infeasible);
        assert!(outcome.objective().is_infinite() && outcome.objective() > 0.0);
        assert!(!sol.valid);
    }

    #[test]
    fn test_unbounded_linear_objective() {
        // min -x with x >= 0 only
        let p = from_triplets(1, 1, Vec::<(usize, usize, f64)>::new());
        let a = from_triplets(1, 1, vec![(0, 0, 1.0)]);
        let data = CanonicalQp::new(p, vec![-1.0], a, vec![0.0], vec![f64::INFINITY], 0.0);
        let mut solver = AdmmSolver::new(&data).unwrap();
        let mut solution = Solution::new(1, 1);
        let outcome =
            solver.solve(&data, DirtySet::all(), &mut solution, &SolveOptions::embedded(), 1);
        assert_eq!(outcome.status, SolveStatus::Unbounded);
        assert_eq!(outcome.objective(), f64::NEG_INFINITY);
    }

    #[test]
    fn test_negative_diagonal_is_error_and_recovers() {
        let mut data = box_qp(-10.0, 10.0);
        data.p.data_mut()[0] = -1.0;
        let mut solver = AdmmSolver::new(&data).unwrap();
        let mut solution = Solution::new(2, 3);
        let opts = SolveOptions::embedded();
        let outcome = solver.solve(&data, DirtySet::all(), &mut solution, &opts, 1);
        assert_eq!(outcome.status, SolveStatus::Error);
        assert_eq!(outcome.breakdown, Some(Breakdown::NonConvex { column: 0 }));
        assert!(outcome.objective().is_nan());

        data.p.data_mut()[0] = 2.0;
        let dirty = DirtySet {
            matrices: true,
            ..DirtySet::default()
        };
        let outcome = solver.solve(&data, dirty, &mut solution, &opts, 2);
        assert!(outcome.status.is_optimal());
    }

    #[test]
    fn test_warm_start_needs_fewer_iterations() {
        let data = box_qp(0.0, 0.6);
        let opts = SolveOptions::embedded().with_tolerance(1e-6, 1e-6);
        let mut solver = AdmmSolver::new(&data).unwrap();
        let mut solution = Solution::new(2, 3);
        let cold = solver.solve(&data, DirtySet::all(), &mut solution, &opts, 1);
        let warm = solver.solve(&data, DirtySet::default(), &mut solution, &opts, 1);
        assert!(cold.status.is_optimal());
        assert!(warm.info.warm_started);
        assert!(warm.iterations() <= cold.iterations());
        assert_eq!(warm.info.factorizations, 0);
    }

    #[test]
    fn test_bounds_change_refactors_only_on_reclassification() {
        let mut data = box_qp(0.0, 0.6);
        let opts = SolveOptions::embedded().with_warm_start(false);
        let mut solver = AdmmSolver::new(&data).unwrap();
        let mut solution = Solution::new(2, 3);
        solver.solve(&data, DirtySet::all(), &mut solution, &opts, 1);

        let bounds = DirtySet {
            bounds: true,
            ..DirtySet::default()
        };
        data.u[0] = 0.7;
        let outcome = solver.solve(&data, bounds, &mut solution, &opts, 2);
        assert!(outcome.status.is_optimal());

        // Row 0 collapses to an equality.
        data.l[0] = 0.7;
        let before = solver.row_kind[0];
        solver.solve(&data, bounds, &mut solution, &opts, 3);
        assert_ne!(solver.row_kind[0], before);
    }
}
