//! Mapping the canonical solution back onto named variables.
//!
//! Each variable carries one canonical primal index per element (column-major)
//! and each constraint block one canonical row per element; extraction is a
//! gather through those tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EmbedError, EmbedResult};
use crate::outcome::SolveOutcome;
use crate::value::{Matrix, Shape};
use crate::workspace::Workspace;

/// Every variable of a workspace together with the outcome that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    pub variables: BTreeMap<String, Matrix>,
    pub outcome: SolveOutcome,
}

/// Extract all variables of the last solve.
pub fn extract(ws: &Workspace) -> EmbedResult<Extraction> {
    ws.extract_all()
}

fn gather(
    name: &str,
    shape: Shape,
    indices: &[usize],
    source: &[f64],
    out: &mut [f64],
) -> EmbedResult<()> {
    if out.len() != shape.numel() {
        return Err(EmbedError::ShapeMismatch {
            name: name.to_string(),
            expected: shape,
            actual: Shape::vector(out.len()),
        });
    }
    for (dst, &idx) in out.iter_mut().zip(indices) {
        *dst = source[idx];
    }
    Ok(())
}

impl Workspace {
    fn last_outcome(&self) -> EmbedResult<SolveOutcome> {
        self.outcome.ok_or(EmbedError::NotSolved)
    }

    /// Copy variable `name` (column-major) into `out` without allocating.
    pub fn extract_into(&self, name: &str, out: &mut [f64]) -> EmbedResult<()> {
        self.last_outcome()?;
        let idx = *self
            .variables
            .get(name)
            .ok_or_else(|| EmbedError::UnknownVariable(name.to_string()))?;
        let spec = &self.template.variables[idx];
        gather(name, spec.shape, &spec.indices, &self.solution.x, out)
    }

    pub fn extract(&self, name: &str) -> EmbedResult<Matrix> {
        let mut out = Matrix::zeros(self.variable_shape(name)?);
        self.extract_into(name, &mut out.data)?;
        Ok(out)
    }

    pub fn extract_all(&self) -> EmbedResult<Extraction> {
        let outcome = self.last_outcome()?;
        let variables = self
            .template
            .variables
            .iter()
            .map(|spec| Ok((spec.name.clone(), self.extract(&spec.name)?)))
            .collect::<EmbedResult<BTreeMap<_, _>>>()?;
        Ok(Extraction { variables, outcome })
    }

    /// Copy the multipliers of constraint block `name` into `out`.
    ///
    /// Positive values mark an active upper bound, negative an active lower
    /// bound.
    pub fn extract_dual_into(&self, name: &str, out: &mut [f64]) -> EmbedResult<()> {
        self.last_outcome()?;
        let idx = *self
            .constraints
            .get(name)
            .ok_or_else(|| EmbedError::UnknownConstraint(name.to_string()))?;
        let spec = &self.template.constraints[idx];
        gather(name, spec.shape, &spec.rows, &self.solution.y, out)
    }

    pub fn extract_dual(&self, name: &str) -> EmbedResult<Matrix> {
        let mut out = Matrix::zeros(self.constraint_shape(name)?);
        self.extract_dual_into(name, &mut out.data)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::sparse::from_triplets;
    use crate::settings::SolveOptions;
    use crate::template::{CanonicalTemplate, ConstraintSpec, VariableSpec};

    /// min ½‖x - c‖² over a 2x2 matrix variable stored in reverse order.
    fn template() -> CanonicalTemplate {
        let p = from_triplets(4, 4, (0..4).map(|i| (i, i, 1.0)));
        let a = from_triplets(4, 4, (0..4).map(|i| (i, i, 1.0)));
        let q = [-1.0, -2.0, -3.0, -4.0];
        let mut t = CanonicalTemplate::from_qp(&p, &q, &a, &[-10.0; 4], &[10.0, 10.0, 10.0, 2.0])
            .unwrap();
        t.variables = vec![VariableSpec {
            name: "W".to_string(),
            shape: Shape::matrix(2, 2),
            indices: vec![3, 2, 1, 0],
        }];
        t.constraints = vec![ConstraintSpec {
            name: "box".to_string(),
            shape: Shape::vector(4),
            rows: vec![0, 1, 2, 3],
        }];
        t
    }

    #[test]
    fn test_extract_before_solve_fails() {
        let ws = Workspace::initialize(template()).unwrap();
        assert!(matches!(ws.extract("W"), Err(EmbedError::NotSolved)));
        assert!(matches!(extract(&ws), Err(EmbedError::NotSolved)));
    }

    #[test]
    fn test_extract_follows_index_table() {
        let mut ws = Workspace::initialize(template()).unwrap();
        ws.solve(&SolveOptions::reference()).unwrap();
        let w = ws.extract("W").unwrap();
        assert_eq!(w.shape, Shape::matrix(2, 2));
        // x = (1, 2, 3, 2) with x3 clipped at its upper bound.
        let expected = [2.0, 3.0, 2.0, 1.0];
        for (got, want) in w.data.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "{} vs {}", got, want);
        }

        let duals = ws.extract_dual("box").unwrap();
        assert!(duals.data[3] > 0.0);
        assert!(duals.data[0].abs() < 1e-4);
    }

    #[test]
    fn test_extract_into_checks_length() {
        let mut ws = Workspace::initialize(template()).unwrap();
        ws.solve(&SolveOptions::embedded()).unwrap();
        let mut short = [0.0; 3];
        let err = ws.extract_into("W", &mut short).unwrap_err();
        assert!(matches!(err, EmbedError::ShapeMismatch { .. }));
        assert!(matches!(
            ws.extract("V"),
            Err(EmbedError::UnknownVariable(_))
        ));
        // Constraint names are looked up separately from variables.
        assert!(matches!(
            ws.extract_dual("W"),
            Err(EmbedError::UnknownConstraint(name)) if name == "W"
        ));
        assert!(matches!(
            ws.extract("box"),
            Err(EmbedError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_extract_all_carries_outcome() {
        let mut ws = Workspace::initialize(template()).unwrap();
        let outcome = ws.solve(&SolveOptions::embedded()).unwrap();
        let all = extract(&ws).unwrap();
        assert_eq!(all.outcome, outcome);
        assert_eq!(all.variables.len(), 1);
        assert!(all.variables.contains_key("W"));
    }
}
