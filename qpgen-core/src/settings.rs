//! Solve options and presets.

use std::env;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, EmbedResult};

/// Fixed option record for one solve.
///
/// Two explicit presets exist because the embedded re-solve path and a
/// general-purpose reference solve deliberately use different accuracy
/// targets: [`SolveOptions::embedded`] and [`SolveOptions::reference`].
/// `Default` is the embedded preset with environment overrides applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    /// Iteration cap.
    pub max_iter: usize,
    /// Absolute residual tolerance.
    pub eps_abs: f64,
    /// Relative residual tolerance.
    pub eps_rel: f64,
    /// Primal infeasibility certificate tolerance.
    pub eps_prim_inf: f64,
    /// Dual infeasibility certificate tolerance.
    pub eps_dual_inf: f64,

    /// Initial ADMM step size.
    pub rho: f64,
    /// Primal regularization of the KKT system.
    pub sigma: f64,
    /// Over-relaxation parameter in (0, 2).
    pub alpha: f64,
    pub adaptive_rho: bool,
    /// Iterations between step-size updates.
    pub adaptive_rho_interval: usize,
    /// Minimum change factor before a new step size triggers a refactor.
    pub adaptive_rho_tolerance: f64,

    /// Ruiz equilibration passes (0 disables scaling).
    pub scaling_iters: usize,
    /// Iterations between termination checks.
    pub check_termination: usize,

    /// Seed the iterates from the previous solution when it is compatible.
    pub warm_start: bool,
    /// Run an active-set polishing pass after convergence.
    pub polish: bool,
    /// Regularization of the reduced polishing system.
    pub polish_delta: f64,
    /// Iterative refinement steps in polishing.
    pub polish_refine_iter: usize,

    /// Wall-clock budget in milliseconds (None = no limit).
    pub time_limit_ms: Option<u64>,
    /// Log a summary line per solve at info level.
    pub verbose: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        let mut opts = Self::embedded();

        // MPC controllers tune these per deployment without recompiling.
        if let Some(max_iter) = env_parse::<usize>("QPGEN_MAX_ITER") {
            opts.max_iter = max_iter;
        }
        if let Some(iters) = env_parse::<usize>("QPGEN_SCALING_ITERS") {
            opts.scaling_iters = iters;
        }
        if let Some(rho) = env_parse::<f64>("QPGEN_RHO") {
            opts.rho = rho;
        }
        opts
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

impl SolveOptions {
    /// Embedded re-solve preset: loose tolerances, no polishing, warm start.
    pub fn embedded() -> Self {
        Self {
            max_iter: 4000,
            eps_abs: 1e-3,
            eps_rel: 1e-3,
            eps_prim_inf: 1e-4,
            eps_dual_inf: 1e-4,
            rho: 0.1,
            sigma: 1e-6,
            alpha: 1.6,
            adaptive_rho: true,
            adaptive_rho_interval: 25,
            adaptive_rho_tolerance: 5.0,
            scaling_iters: 10,
            check_termination: 25,
            warm_start: true,
            polish: false,
            polish_delta: 1e-6,
            polish_refine_iter: 3,
            time_limit_ms: None,
            verbose: false,
        }
    }

    /// General-purpose reference preset: tight tolerances, polishing, cold
    /// start.
    pub fn reference() -> Self {
        Self {
            max_iter: 10_000,
            eps_abs: 1e-5,
            eps_rel: 1e-5,
            eps_prim_inf: 1e-5,
            eps_dual_inf: 1e-5,
            warm_start: false,
            polish: true,
            ..Self::embedded()
        }
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set both absolute and relative tolerance.
    pub fn with_tolerance(mut self, eps_abs: f64, eps_rel: f64) -> Self {
        self.eps_abs = eps_abs;
        self.eps_rel = eps_rel;
        self
    }

    pub fn with_warm_start(mut self, warm_start: bool) -> Self {
        self.warm_start = warm_start;
        self
    }

    pub fn with_polish(mut self, polish: bool) -> Self {
        self.polish = polish;
        self
    }

    pub fn with_rho(mut self, rho: f64) -> Self {
        self.rho = rho;
        self
    }

    pub fn with_adaptive_rho(mut self, adaptive_rho: bool) -> Self {
        self.adaptive_rho = adaptive_rho;
        self
    }

    pub fn with_scaling_iters(mut self, iters: usize) -> Self {
        self.scaling_iters = iters;
        self
    }

    pub fn with_time_limit_ms(mut self, ms: u64) -> Self {
        self.time_limit_ms = Some(ms);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Reject option values the solver cannot run with.
    pub fn validate(&self) -> EmbedResult<()> {
        fn bad(msg: String) -> EmbedResult<()> {
            Err(EmbedError::InvalidOptions(msg))
        }
        let nonneg = |v: f64| v.is_finite() && v >= 0.0;
        let positive = |v: f64| v.is_finite() && v > 0.0;

        if self.max_iter == 0 {
            return bad("max_iter must be at least 1".to_string());
        }
        if !nonneg(self.eps_abs) || !nonneg(self.eps_rel) {
            return bad(format!(
                "tolerances must be nonnegative (eps_abs = {}, eps_rel = {})",
                self.eps_abs, self.eps_rel
            ));
        }
        if self.eps_abs == 0.0 && self.eps_rel == 0.0 {
            return bad("eps_abs and eps_rel cannot both be zero".to_string());
        }
        if !positive(self.eps_prim_inf) || !positive(self.eps_dual_inf) {
            return bad("infeasibility tolerances must be positive".to_string());
        }
        if !positive(self.rho) || !positive(self.sigma) {
            return bad(format!(
                "rho and sigma must be positive (rho = {}, sigma = {})",
                self.rho, self.sigma
            ));
        }
        if !(self.alpha > 0.0 && self.alpha < 2.0) {
            return bad(format!("alpha must lie in (0, 2), got {}", self.alpha));
        }
        if self.check_termination == 0 || self.adaptive_rho_interval == 0 {
            return bad("check_termination and adaptive_rho_interval must be at least 1".to_string());
        }
        if !(self.adaptive_rho_tolerance >= 1.0) {
            return bad("adaptive_rho_tolerance must be at least 1".to_string());
        }
        if !positive(self.polish_delta) {
            return bad("polish_delta must be positive".to_string());
        }
        if self.time_limit_ms == Some(0) {
            return bad("time_limit_ms must be positive when set".to_string());
        }
        Ok(())
    }

    /// Log the effective options at info level.
    pub fn log_summary(&self) {
        info!(
            "options: max_iter={} eps_abs={:.1e} eps_rel={:.1e} rho={:.1e} sigma={:.1e} alpha={} scaling_iters={} warm_start={} polish={}",
            self.max_iter,
            self.eps_abs,
            self.eps_rel,
            self.rho,
            self.sigma,
            self.alpha,
            self.scaling_iters,
            self.warm_start,
            self.polish
        );
    }
}
