//! Fixed-structure QP workspace.
//!
//! A [`Workspace`] is built once from a [`CanonicalTemplate`] and owns every
//! buffer a re-solve touches: the canonical data, parameter buffers, the
//! solver state and the last solution. After construction the patterns and
//! lengths never change; only values do.

use std::collections::HashMap;
use std::path::Path;

use log::debug;

use crate::admm::{AdmmSolver, Solution};
use crate::error::{EmbedError, EmbedResult};
use crate::linalg::sparse::SparseCsc;
use crate::mapper::{DirtySet, ParameterMapper};
use crate::outcome::SolveOutcome;
use crate::settings::SolveOptions;
use crate::template::{CanonicalArray, CanonicalTemplate, CscPattern, ProblemDims};
use crate::value::{ArrayView, Matrix, Shape};

/// Canonical QP data `min ½xᵀPx + qᵀx + d  s.t. l ≤ Ax ≤ u`.
///
/// P holds the upper triangle only.
#[derive(Debug, Clone)]
pub(crate) struct CanonicalQp {
    pub p: SparseCsc,
    pub q: Vec<f64>,
    pub a: SparseCsc,
    pub l: Vec<f64>,
    pub u: Vec<f64>,
    pub offset: f64,
}

impl CanonicalQp {
    pub fn new(
        p: SparseCsc,
        q: Vec<f64>,
        a: SparseCsc,
        l: Vec<f64>,
        u: Vec<f64>,
        offset: f64,
    ) -> Self {
        Self {
            p,
            q,
            a,
            l,
            u,
            offset,
        }
    }

    fn from_template(template: &CanonicalTemplate) -> EmbedResult<Self> {
        Ok(Self::new(
            template.p.with_values(template.p_values.clone())?,
            template.q.clone(),
            template.a.with_values(template.a_values.clone())?,
            template.l.clone(),
            template.u.clone(),
            template.offset,
        ))
    }

    /// Value array addressed by an affine map target.
    pub fn values_mut(&mut self, target: CanonicalArray) -> &mut [f64] {
        match target {
            CanonicalArray::P => self.p.data_mut(),
            CanonicalArray::Q => &mut self.q,
            CanonicalArray::A => self.a.data_mut(),
            CanonicalArray::L => &mut self.l,
            CanonicalArray::U => &mut self.u,
            CanonicalArray::Offset => std::slice::from_mut(&mut self.offset),
        }
    }
}

/// Borrowed view of the canonical data in solver layout: CSC matrices, P
/// upper-triangular.
#[derive(Debug, Clone, Copy)]
pub struct SolverView<'a> {
    pub p: &'a SparseCsc,
    pub q: &'a [f64],
    pub a: &'a SparseCsc,
    pub l: &'a [f64],
    pub u: &'a [f64],
    pub offset: f64,
}

/// Embedded re-solve workspace.
///
/// Not thread-safe for concurrent use; run one workspace per controller.
pub struct Workspace {
    pub(crate) template: CanonicalTemplate,
    pub(crate) data: CanonicalQp,
    pub(crate) mapper: ParameterMapper,
    pub(crate) solver: AdmmSolver,
    pub(crate) variables: HashMap<String, usize>,
    pub(crate) constraints: HashMap<String, usize>,
    pub(crate) solution: Solution,
    pub(crate) outcome: Option<SolveOutcome>,
    data_generation: u64,
    structure_generation: u64,
    // Direct value writes waiting for commit.
    direct: DirtySet,
    // Committed changes not yet handed to the solver.
    dirty: DirtySet,
}

impl Workspace {
    /// Validate `template` and allocate every buffer.
    pub fn initialize(template: CanonicalTemplate) -> EmbedResult<Self> {
        template.validate()?;
        let mut data = CanonicalQp::from_template(&template)?;
        let mapper = ParameterMapper::new(&template.parameters, &mut data);
        let solver = AdmmSolver::new(&data)
            .map_err(|e| EmbedError::SolverError(format!("KKT analysis failed: {}", e)))?;
        let solution = Solution::new(template.num_vars, template.num_constraints);

        let variables = template
            .variables
            .iter()
            .enumerate()
            .map(|(i, v)| (v.name.clone(), i))
            .collect();
        let constraints = template
            .constraints
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();

        let (kkt_nnz, factor_nnz) = solver.kkt_nnz();
        debug!(
            "workspace '{}': {} variables, {} constraints, {} parameters, KKT nnz {} (factor {})",
            template.name,
            template.num_vars,
            template.num_constraints,
            template.parameters.len(),
            kkt_nnz,
            factor_nnz
        );

        Ok(Self {
            template,
            data,
            mapper,
            solver,
            variables,
            constraints,
            solution,
            outcome: None,
            data_generation: 0,
            structure_generation: 1,
            direct: DirtySet::default(),
            dirty: DirtySet::default(),
        })
    }

    pub fn from_json(json: &str) -> EmbedResult<Self> {
        Self::initialize(CanonicalTemplate::from_json(json)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> EmbedResult<Self> {
        Self::initialize(CanonicalTemplate::load(path)?)
    }

    /// Rebuild from the template: parameter defaults, no solution, cold
    /// solver state.
    pub fn reset(&mut self) -> EmbedResult<()> {
        let structure_generation = self.structure_generation + 1;
        *self = Self::initialize(self.template.clone())?;
        self.structure_generation = structure_generation;
        Ok(())
    }

    pub fn template(&self) -> &CanonicalTemplate {
        &self.template
    }

    pub fn name(&self) -> &str {
        &self.template.name
    }

    pub fn dims(&self) -> ProblemDims {
        self.template.dims
    }

    pub fn num_vars(&self) -> usize {
        self.template.num_vars
    }

    pub fn num_constraints(&self) -> usize {
        self.template.num_constraints
    }

    /// Canonical data in the layout the solver consumes.
    pub fn as_solver_view(&self) -> SolverView<'_> {
        SolverView {
            p: &self.data.p,
            q: &self.data.q,
            a: &self.data.a,
            l: &self.data.l,
            u: &self.data.u,
            offset: self.data.offset,
        }
    }

    /// Bumped on every commit that changed data.
    pub fn data_generation(&self) -> u64 {
        self.data_generation
    }

    /// Bumped on every re-initialization.
    pub fn structure_generation(&self) -> u64 {
        self.structure_generation
    }

    /// Nonzeros of the KKT matrix and of its LDLᵀ factor.
    pub fn kkt_nnz(&self) -> (usize, usize) {
        self.solver.kkt_nnz()
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.mapper.names()
    }

    pub fn parameter_shape(&self, name: &str) -> EmbedResult<Shape> {
        self.mapper.shape(name)
    }

    /// Current value of a parameter (allocates).
    pub fn parameter_value(&self, name: &str) -> EmbedResult<Matrix> {
        self.mapper.value(name)
    }

    /// Canonical entries written by one update of `name`.
    pub fn parameter_footprint(&self, name: &str) -> EmbedResult<usize> {
        self.mapper.touched(name)
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.template.variables.iter().map(|v| v.name.as_str())
    }

    pub fn variable_shape(&self, name: &str) -> EmbedResult<Shape> {
        let idx = self
            .variables
            .get(name)
            .ok_or_else(|| EmbedError::UnknownVariable(name.to_string()))?;
        Ok(self.template.variables[*idx].shape)
    }

    pub fn constraint_names(&self) -> impl Iterator<Item = &str> {
        self.template.constraints.iter().map(|c| c.name.as_str())
    }

    pub fn constraint_shape(&self, name: &str) -> EmbedResult<Shape> {
        let idx = self
            .constraints
            .get(name)
            .ok_or_else(|| EmbedError::UnknownConstraint(name.to_string()))?;
        Ok(self.template.constraints[*idx].shape)
    }

    /// Write one parameter through its affine maps.
    ///
    /// On error nothing is written.
    pub fn update(&mut self, name: &str, value: ArrayView<'_>) -> EmbedResult<()> {
        self.mapper.update(name, value, &mut self.data)
    }

    /// Validate every value, then write them all.
    pub fn update_many(&mut self, values: &[(&str, ArrayView<'_>)]) -> EmbedResult<()> {
        self.mapper.update_many(values, &mut self.data)
    }

    /// Overwrite the values of a canonical matrix. The pattern of `mat` must
    /// equal the fixed pattern.
    pub fn set_matrix(&mut self, target: CanonicalArray, mat: &SparseCsc) -> EmbedResult<()> {
        let fixed = match target {
            CanonicalArray::P => &self.template.p,
            CanonicalArray::A => &self.template.a,
            other => {
                return Err(EmbedError::StructuralMismatch(format!(
                    "'{}' is not a matrix",
                    other.name()
                )))
            }
        };
        let csc;
        let mat = if mat.is_csc() {
            mat
        } else {
            csc = mat.to_csc();
            &csc
        };
        if CscPattern::of(mat) != *fixed {
            return Err(EmbedError::StructuralMismatch(format!(
                "pattern of {} differs from the fixed pattern ({} vs {} nonzeros)",
                target.name(),
                mat.nnz(),
                fixed.nnz()
            )));
        }
        self.set_values(target, mat.data())
    }

    /// Overwrite the value array of one canonical target.
    pub fn set_values(&mut self, target: CanonicalArray, values: &[f64]) -> EmbedResult<()> {
        let expected = self.template.target_len(target);
        if values.len() != expected {
            return Err(EmbedError::StructuralMismatch(format!(
                "{} holds {} values, got {}",
                target.name(),
                expected,
                values.len()
            )));
        }
        let bounds = matches!(target, CanonicalArray::L | CanonicalArray::U);
        if let Some(v) = values
            .iter()
            .find(|v| v.is_nan() || (!bounds && v.is_infinite()))
        {
            return Err(EmbedError::InvalidValue {
                name: target.name().to_string(),
                reason: format!("contains {}", v),
            });
        }
        self.data.values_mut(target).copy_from_slice(values);
        self.direct.mark(target);
        Ok(())
    }

    /// Publish pending updates to the solver. Returns the data generation.
    pub fn commit(&mut self) -> u64 {
        let mut pending = self.mapper.take_pending();
        pending.merge(std::mem::take(&mut self.direct));
        if !pending.is_empty() {
            self.dirty.merge(pending);
            self.data_generation += 1;
        }
        self.data_generation
    }

    /// Changes written but not yet committed.
    pub fn has_pending(&self) -> bool {
        !self.mapper.pending().is_empty() || !self.direct.is_empty()
    }

    /// Commit pending updates and solve.
    ///
    /// Non-optimal outcomes, including numerical breakdown, are returned as
    /// `Ok`; only invalid options fail here.
    pub fn solve(&mut self, opts: &SolveOptions) -> EmbedResult<SolveOutcome> {
        opts.validate()?;
        self.commit();
        let dirty = std::mem::take(&mut self.dirty);
        let outcome = self.solver.solve(
            &self.data,
            dirty,
            &mut self.solution,
            opts,
            self.data_generation,
        );
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// Outcome of the last solve, if any since initialization.
    pub fn outcome(&self) -> Option<&SolveOutcome> {
        self.outcome.as_ref()
    }

    /// Raw canonical primal solution (NaN after infeasible/unbounded/error).
    pub fn primal(&self) -> EmbedResult<&[f64]> {
        self.outcome.ok_or(EmbedError::NotSolved)?;
        Ok(&self.solution.x)
    }

    /// Raw canonical dual solution, one entry per constraint row.
    pub fn dual(&self) -> EmbedResult<&[f64]> {
        self.outcome.ok_or(EmbedError::NotSolved)?;
        Ok(&self.solution.y)
    }

    /// Constraint activity Ax at the last solution.
    pub fn constraint_values(&self) -> EmbedResult<&[f64]> {
        self.outcome.ok_or(EmbedError::NotSolved)?;
        Ok(&self.solution.z)
    }
}
