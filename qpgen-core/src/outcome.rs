//! Solve outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Solution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SolveStatus {
    /// Residuals below tolerance.
    Optimal,

    /// Iteration or time cap hit with residuals within 10x of tolerance.
    OptimalInaccurate,

    /// Iteration cap hit far from tolerance.
    MaxIterationsReached,

    /// Wall-clock budget exhausted far from tolerance.
    TimeLimitReached,

    /// Primal infeasibility certificate found (or a row with l > u).
    Infeasible,

    /// Dual infeasibility certificate found.
    Unbounded,

    /// Numerical breakdown; see [`SolveOutcome::breakdown`].
    Error,
}

impl SolveStatus {
    pub fn is_optimal(self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::OptimalInaccurate)
    }

    /// Whether the stored primal/dual vectors carry numbers (as opposed to
    /// NaN).
    pub fn has_solution(self) -> bool {
        !matches!(
            self,
            SolveStatus::Infeasible | SolveStatus::Unbounded | SolveStatus::Error
        )
    }

    /// Stable integer code used across the C ABI.
    pub fn code(self) -> i32 {
        match self {
            SolveStatus::Optimal => 1,
            SolveStatus::OptimalInaccurate => 2,
            SolveStatus::MaxIterationsReached => -2,
            SolveStatus::TimeLimitReached => -6,
            SolveStatus::Infeasible => -3,
            SolveStatus::Unbounded => -4,
            SolveStatus::Error => -7,
        }
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Optimal => write!(f, "optimal"),
            SolveStatus::OptimalInaccurate => write!(f, "optimal inaccurate"),
            SolveStatus::MaxIterationsReached => write!(f, "maximum iterations reached"),
            SolveStatus::TimeLimitReached => write!(f, "time limit reached"),
            SolveStatus::Infeasible => write!(f, "infeasible"),
            SolveStatus::Unbounded => write!(f, "unbounded"),
            SolveStatus::Error => write!(f, "error"),
        }
    }
}

/// Diagnostic detail for [`SolveStatus::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Breakdown {
    /// P has a negative diagonal entry after an update.
    NonConvex { column: usize },
    /// P, q or A holds a NaN or infinity.
    NonFiniteData,
    /// The KKT factorization hit a zero pivot.
    ZeroPivot { index: usize },
    /// The KKT factor came out with NaN or infinite entries.
    NonFiniteFactor,
    /// Iterates became NaN or infinite.
    NonFiniteIterate { iteration: usize },
    /// The factorization backend rejected the KKT system for another reason.
    FactorizationFailed,
}

impl fmt::Display for Breakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Breakdown::NonConvex { column } => {
                write!(f, "P has a negative diagonal in column {} (non-convex)", column)
            }
            Breakdown::NonFiniteData => write!(f, "problem data contains NaN or infinity"),
            Breakdown::ZeroPivot { index } => {
                write!(f, "KKT factorization failed with a zero pivot at {}", index)
            }
            Breakdown::NonFiniteFactor => write!(f, "KKT factor contains NaN or infinity"),
            Breakdown::NonFiniteIterate { iteration } => {
                write!(f, "iterates became non-finite at iteration {}", iteration)
            }
            Breakdown::FactorizationFailed => write!(f, "KKT factorization failed"),
        }
    }
}

/// Statistics of one solve.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SolveInfo {
    pub iterations: usize,
    /// Objective value ½xᵀPx + qᵀx + d (inf for infeasible, -inf for
    /// unbounded, NaN on error).
    pub objective: f64,
    /// Unscaled primal residual ‖Ax - z‖∞.
    pub primal_residual: f64,
    /// Unscaled dual residual ‖Px + q + Aᵀy‖∞.
    pub dual_residual: f64,
    /// Final step size.
    pub rho: f64,
    /// Rescaling and factorization time before the first iteration (seconds).
    pub setup_time: f64,
    /// Total wall-clock time of the call (seconds).
    pub solve_time: f64,
    pub polish_time: f64,
    /// Numeric factorizations performed during the call.
    pub factorizations: usize,
    pub rho_updates: usize,
    pub warm_started: bool,
    pub polished: bool,
    /// Data generation the solve ran against.
    pub data_generation: u64,
}

/// Immutable result of one solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolveOutcome {
    pub status: SolveStatus,
    pub info: SolveInfo,
    pub breakdown: Option<Breakdown>,
}

impl SolveOutcome {
    pub fn objective(&self) -> f64 {
        self.info.objective
    }

    pub fn iterations(&self) -> usize {
        self.info.iterations
    }

    pub fn solve_time(&self) -> f64 {
        self.info.solve_time
    }
}

impl fmt::Display for SolveOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} iterations, objective {:.6e}, residuals {:.2e}/{:.2e}, {:.3} ms",
            self.status,
            self.info.iterations,
            self.info.objective,
            self.info.primal_residual,
            self.info.dual_residual,
            self.info.solve_time * 1e3
        )?;
        if let Some(b) = self.breakdown {
            write!(f, " ({})", b)?;
        }
        Ok(())
    }
}
