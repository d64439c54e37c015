//! qpgen: fixed-structure QP workspaces for embedded re-solves
//!
//! A parametric convex QP (typically a linear MPC problem) is canonicalized
//! once into a [`CanonicalTemplate`]: fixed sparsity patterns for
//!
//! ```text
//! minimize    ½xᵀPx + qᵀx + d
//! subject to  l ≤ Ax ≤ u
//! ```
//!
//! plus, for every named parameter, the affine map from its value onto the
//! canonical entries it owns. A [`Workspace`] built from the template can then
//! be updated and re-solved many times per second:
//!
//! - **Parameter updates** touch only the entries a parameter owns
//!   (dense blocks, diagonals, identity-scaled and general sparse maps)
//! - **Solves** run an ADMM method in OSQP conventions on a quasi-definite
//!   KKT system whose symbolic factorization is computed once
//! - **Warm starts** reuse the previous solution and step size
//! - **No allocation** in `update`/`commit`/`solve`/`extract_into` once the
//!   workspace is built (polishing excepted)
//!
//! # Example
//!
//! ```ignore
//! use qpgen_core::{embedded_solve, mpc, SolveOptions, Workspace};
//!
//! let template = mpc::MpcTemplate::build(10, 6, 3)?;
//! let mut ws = Workspace::initialize(template)?;
//! let data = mpc::double_integrator(6, 3)?;
//!
//! let sol = embedded_solve(&mut ws, &data.values(), &SolveOptions::embedded())?;
//! println!("{}", sol.outcome);
//! println!("first input: {:?}", sol.variables["U"].column(0));
//! ```
//!
//! # Options
//!
//! [`SolveOptions::embedded`] (loose tolerances, warm start, no polishing) is
//! the re-solve preset; [`SolveOptions::reference`] is the tight
//! general-purpose preset used for cross-checks.

#![allow(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod admm;
pub mod error;
pub mod extract;
pub mod host;
pub mod linalg;
pub mod mapper;
pub mod mpc;
pub mod outcome;
pub mod settings;
pub mod template;
pub mod value;
pub mod workspace;

// Re-export main types
pub use error::{EmbedError, EmbedResult};
pub use extract::{extract, Extraction};
pub use host::{embedded_solve, HostSolution, ParameterValues};
pub use mapper::{AffineMap, DirtySet, ParameterKind, SparseEntry};
pub use outcome::{Breakdown, SolveInfo, SolveOutcome, SolveStatus};
pub use settings::SolveOptions;
pub use template::{
    CanonicalArray, CanonicalTemplate, ConstraintSpec, CscPattern, ParameterSpec, ProblemDims,
    VariableSpec, INFINITY_BOUND,
};
pub use value::{ArrayView, Matrix, Shape};
pub use workspace::{SolverView, Workspace};
