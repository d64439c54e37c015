//! Error types for embedded workspaces.

use thiserror::Error;

use crate::value::Shape;

/// Errors raised by workspace construction, parameter updates, solves and
/// extraction.
///
/// Non-optimal solve outcomes (infeasible, iteration cap, ...) are not errors;
/// they are reported through [`crate::SolveOutcome`].
#[derive(Error, Debug)]
pub enum EmbedError {
    /// A value does not match the declared shape of a parameter or variable.
    #[error("shape mismatch for '{name}': expected {expected}, got {actual}")]
    ShapeMismatch {
        name: String,
        expected: Shape,
        actual: Shape,
    },

    /// An update would change the fixed sparsity pattern or array lengths.
    #[error("structural mismatch: {0}")]
    StructuralMismatch(String),

    /// Extraction requested before any solve since the last initialization.
    #[error("no solve has completed since the workspace was initialized")]
    NotSolved,

    /// Numerical breakdown inside the solver.
    #[error("solver error: {0}")]
    SolverError(String),

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unknown constraint block '{0}'")]
    UnknownConstraint(String),

    /// A value has the right shape but is not usable (NaN, infinity).
    #[error("invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    /// A generation-time template failed validation.
    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for workspace operations.
pub type EmbedResult<T> = Result<T, EmbedError>;
