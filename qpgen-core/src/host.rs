//! Host call surface: update, solve and extract as one call.
//!
//! [`embedded_solve`] is what the Python and C bindings wrap. Caller errors
//! (unknown names, wrong shapes, bad options) fail before anything is written;
//! non-optimal outcomes come back inside [`HostSolution`]; numerical breakdown
//! is the only solver result surfaced as an error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, EmbedResult};
use crate::outcome::{SolveOutcome, SolveStatus};
use crate::settings::SolveOptions;
use crate::value::{ArrayView, Matrix};
use crate::workspace::Workspace;

/// Ordered list of parameter values for one call.
#[derive(Debug, Clone, Default)]
pub struct ParameterValues<'a> {
    entries: Vec<(&'a str, ArrayView<'a>)>,
}

impl<'a> ParameterValues<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'a str, value: ArrayView<'a>) -> Self {
        self.entries.push((name, value));
        self
    }

    pub fn insert(&mut self, name: &'a str, value: ArrayView<'a>) {
        self.entries.push((name, value));
    }

    /// Drop all entries, keeping the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[(&'a str, ArrayView<'a>)] {
        &self.entries
    }
}

impl<'a> FromIterator<(&'a str, ArrayView<'a>)> for ParameterValues<'a> {
    fn from_iter<I: IntoIterator<Item = (&'a str, ArrayView<'a>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Variable values and outcome of one host call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSolution {
    pub variables: BTreeMap<String, Matrix>,
    pub outcome: SolveOutcome,
}

impl HostSolution {
    pub fn variable(&self, name: &str) -> Option<&Matrix> {
        self.variables.get(name)
    }

    pub fn status(&self) -> SolveStatus {
        self.outcome.status
    }
}

/// Apply `params`, solve with `opts` and extract every variable.
///
/// If any parameter is rejected the workspace is left untouched.
pub fn embedded_solve(
    ws: &mut Workspace,
    params: &ParameterValues<'_>,
    opts: &SolveOptions,
) -> EmbedResult<HostSolution> {
    opts.validate()?;
    ws.update_many(params.as_slice())?;
    let outcome = ws.solve(opts)?;
    if outcome.status == SolveStatus::Error {
        let detail = outcome
            .breakdown
            .map_or_else(|| "numerical breakdown".to_string(), |b| b.to_string());
        return Err(EmbedError::SolverError(detail));
    }
    let extraction = ws.extract_all()?;
    Ok(HostSolution {
        variables: extraction.variables,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::MpcTemplate;

    #[test]
    fn test_shape_error_leaves_workspace_alone() {
        let mut ws = Workspace::initialize(MpcTemplate::build(3, 2, 1).unwrap()).unwrap();
        let before = ws.as_solver_view().l.to_vec();
        let params = ParameterValues::new()
            .with("x_init", ArrayView::vector(&[1.0, 2.0]))
            .with("u_max", ArrayView::vector(&[1.0, 1.0]));
        let err = embedded_solve(&mut ws, &params, &SolveOptions::embedded()).unwrap_err();
        assert!(matches!(err, EmbedError::ShapeMismatch { .. }));
        assert_eq!(ws.as_solver_view().l, before.as_slice());
        assert!(ws.outcome().is_none());
    }

    #[test]
    fn test_unknown_parameter() {
        let mut ws = Workspace::initialize(MpcTemplate::build(2, 2, 1).unwrap()).unwrap();
        let params = ParameterValues::new().with("gain", ArrayView::vector(&[1.0]));
        let err = embedded_solve(&mut ws, &params, &SolveOptions::embedded()).unwrap_err();
        assert!(matches!(err, EmbedError::UnknownParameter(name) if name == "gain"));
    }

    #[test]
    fn test_bad_options_rejected_before_update() {
        let mut ws = Workspace::initialize(MpcTemplate::build(2, 2, 1).unwrap()).unwrap();
        let params = ParameterValues::new().with("x_init", ArrayView::vector(&[1.0, 2.0]));
        let opts = SolveOptions::embedded().with_max_iter(0);
        let err = embedded_solve(&mut ws, &params, &opts).unwrap_err();
        assert!(matches!(err, EmbedError::InvalidOptions(_)));
        assert_eq!(ws.parameter_value("x_init").unwrap().data, vec![0.0, 0.0]);
    }

    #[test]
    fn test_returns_all_variables() {
        let mut ws = Workspace::initialize(MpcTemplate::build(4, 2, 1).unwrap()).unwrap();
        let params: ParameterValues = [("x_init", ArrayView::vector(&[1.0, -1.0]))]
            .into_iter()
            .collect();
        let sol = embedded_solve(&mut ws, &params, &SolveOptions::embedded()).unwrap();
        assert!(sol.status().is_optimal());
        assert_eq!(sol.variable("X").unwrap().shape.cols, 5);
        assert_eq!(sol.variable("U").unwrap().shape.rows, 1);
    }
}
