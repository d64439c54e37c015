//! Linear MPC template generator.
//!
//! Emits the canonical QP of
//!
//! ```text
//! minimize    Σ_{t<H} ‖Q½ x_t‖² + ‖R½ u_t‖²  +  ‖P½ x_H‖²
//! subject to  x_{t+1} = A x_t + B u_t,   x_0 = x_init,
//!             u_min ≤ u_t ≤ u_max
//! ```
//!
//! The squared norms go through auxiliary variables (y = Q½ x and so on) so
//! that every weight enters A linearly and P stays a constant 2I block. Each
//! parameter is then a single affine map: `A`, `B` as dense blocks replicated
//! over the horizon, the square-root weights as diagonal maps.
//!
//! Canonical variable order: X (column-major, n×(H+1)), U (m×H), then the
//! auxiliaries. Row order: initial state, dynamics, auxiliary definitions,
//! input upper bounds, input lower bounds.

use nalgebra::{DMatrix, DVector};

use crate::error::{EmbedError, EmbedResult};
use crate::host::ParameterValues;
use crate::mapper::{AffineMap, ParameterKind};
use crate::template::{
    CanonicalArray, CanonicalTemplate, ConstraintSpec, CscPattern, ParameterSpec, ProblemDims,
    VariableSpec,
};
use crate::value::{ArrayView, Shape};

/// Index layout of the MPC canonical QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpcTemplate {
    pub horizon: usize,
    pub states: usize,
    pub inputs: usize,
}

impl MpcTemplate {
    pub fn new(horizon: usize, states: usize, inputs: usize) -> EmbedResult<Self> {
        if horizon == 0 || states == 0 || inputs == 0 {
            return Err(EmbedError::InvalidTemplate(format!(
                "MPC dimensions must be positive (H = {}, n = {}, m = {})",
                horizon, states, inputs
            )));
        }
        Ok(Self {
            horizon,
            states,
            inputs,
        })
    }

    /// Canonical template for horizon `horizon`, `states` states and `inputs`
    /// inputs.
    pub fn build(horizon: usize, states: usize, inputs: usize) -> EmbedResult<CanonicalTemplate> {
        Self::new(horizon, states, inputs)?.template()
    }

    fn num_x(&self) -> usize {
        self.states * (self.horizon + 1)
    }

    fn num_u(&self) -> usize {
        self.inputs * self.horizon
    }

    pub fn num_vars(&self) -> usize {
        2 * (self.num_x() + self.num_u())
    }

    pub fn num_constraints(&self) -> usize {
        self.states + self.states * self.horizon + self.num_x() + 3 * self.num_u()
    }

    /// Canonical index of X[i, t].
    pub fn x(&self, t: usize, i: usize) -> usize {
        t * self.states + i
    }

    /// Canonical index of U[k, t].
    pub fn u(&self, t: usize, k: usize) -> usize {
        self.num_x() + t * self.inputs + k
    }

    fn yx(&self, t: usize, i: usize) -> usize {
        self.num_x() + self.num_u() + t * self.states + i
    }

    fn yu(&self, t: usize, k: usize) -> usize {
        2 * self.num_x() + self.num_u() + t * self.inputs + k
    }

    fn initial_row(&self, i: usize) -> usize {
        i
    }

    fn dynamics_row(&self, t: usize, i: usize) -> usize {
        self.states + t * self.states + i
    }

    fn state_cost_row(&self, t: usize, i: usize) -> usize {
        self.states * (self.horizon + 1) + t * self.states + i
    }

    fn input_cost_row(&self, t: usize, k: usize) -> usize {
        self.states + self.states * self.horizon + self.num_x() + t * self.inputs + k
    }

    fn upper_row(&self, t: usize, k: usize) -> usize {
        self.input_cost_row(0, 0) + self.num_u() + t * self.inputs + k
    }

    fn lower_row(&self, t: usize, k: usize) -> usize {
        self.upper_row(0, 0) + self.num_u() + t * self.inputs + k
    }

    pub fn template(&self) -> EmbedResult<CanonicalTemplate> {
        let (h, n, m) = (self.horizon, self.states, self.inputs);
        let num_vars = self.num_vars();
        let num_rows = self.num_constraints();

        // Constant entries of A; parameter-owned entries only enter the
        // pattern.
        let mut constants: Vec<(usize, usize, f64)> = Vec::new();
        let mut owned: Vec<(usize, usize)> = Vec::new();

        for i in 0..n {
            constants.push((self.initial_row(i), self.x(0, i), 1.0));
        }
        for t in 0..h {
            for i in 0..n {
                let row = self.dynamics_row(t, i);
                constants.push((row, self.x(t + 1, i), 1.0));
                owned.extend((0..n).map(|j| (row, self.x(t, j))));
                owned.extend((0..m).map(|k| (row, self.u(t, k))));
            }
        }
        for t in 0..=h {
            for i in 0..n {
                let row = self.state_cost_row(t, i);
                constants.push((row, self.yx(t, i), 1.0));
                owned.push((row, self.x(t, i)));
            }
        }
        for t in 0..h {
            for k in 0..m {
                let row = self.input_cost_row(t, k);
                constants.push((row, self.yu(t, k), 1.0));
                owned.push((row, self.u(t, k)));
                constants.push((self.upper_row(t, k), self.u(t, k), 1.0));
                constants.push((self.lower_row(t, k), self.u(t, k), 1.0));
            }
        }

        let mut entries = owned;
        entries.extend(constants.iter().map(|&(r, c, _)| (r, c)));
        let a = CscPattern::from_entries(num_rows, num_vars, &entries);
        let slot = |row: usize, col: usize| -> EmbedResult<usize> {
            a.position(row, col).ok_or_else(|| {
                EmbedError::InvalidTemplate(format!("no entry ({}, {}) in A", row, col))
            })
        };

        let mut a_values = vec![0.0; a.nnz()];
        for &(row, col, v) in &constants {
            a_values[slot(row, col)?] = v;
        }

        // P = 2I on the auxiliaries gives ½yᵀPy = ‖y‖².
        let aux: Vec<(usize, usize)> = (self.num_x() + self.num_u()..num_vars)
            .map(|j| (j, j))
            .collect();
        let p = CscPattern::from_entries(num_vars, num_vars, &aux);
        let p_values = vec![2.0; p.nnz()];

        let mut l = vec![0.0; num_rows];
        let mut u = vec![0.0; num_rows];
        for t in 0..h {
            for k in 0..m {
                l[self.upper_row(t, k)] = f64::NEG_INFINITY;
                u[self.lower_row(t, k)] = f64::INFINITY;
            }
        }

        let mut a_pos = Vec::with_capacity(h * n * n);
        for t in 0..h {
            for j in 0..n {
                for i in 0..n {
                    a_pos.push(slot(self.dynamics_row(t, i), self.x(t, j))?);
                }
            }
        }
        let mut b_pos = Vec::with_capacity(h * n * m);
        for t in 0..h {
            for k in 0..m {
                for i in 0..n {
                    b_pos.push(slot(self.dynamics_row(t, i), self.u(t, k))?);
                }
            }
        }
        let mut q_pos = Vec::with_capacity(h * n);
        for t in 0..h {
            for i in 0..n {
                q_pos.push(slot(self.state_cost_row(t, i), self.x(t, i))?);
            }
        }
        let p_pos = (0..n)
            .map(|i| slot(self.state_cost_row(h, i), self.x(h, i)))
            .collect::<EmbedResult<Vec<_>>>()?;
        let mut r_pos = Vec::with_capacity(h * m);
        let mut upper_rows = Vec::with_capacity(h * m);
        let mut lower_rows = Vec::with_capacity(h * m);
        for t in 0..h {
            for k in 0..m {
                r_pos.push(slot(self.input_cost_row(t, k), self.u(t, k))?);
                upper_rows.push(self.upper_row(t, k));
                lower_rows.push(self.lower_row(t, k));
            }
        }
        let init_rows: Vec<usize> = (0..n).map(|i| self.initial_row(i)).collect();

        let parameters = vec![
            dense(
                "A",
                Shape::matrix(n, n),
                identity(n),
                vec![block(CanonicalArray::A, -1.0, a_pos)],
            ),
            dense(
                "B",
                Shape::matrix(n, m),
                vec![0.0; n * m],
                vec![block(CanonicalArray::A, -1.0, b_pos)],
            ),
            diagonal("P_sqrt", n, p_pos),
            diagonal("Q_sqrt", n, q_pos),
            diagonal("R_sqrt", m, r_pos),
            dense(
                "x_init",
                Shape::vector(n),
                vec![0.0; n],
                vec![
                    block(CanonicalArray::L, 1.0, init_rows.clone()),
                    block(CanonicalArray::U, 1.0, init_rows),
                ],
            ),
            dense(
                "u_min",
                Shape::vector(m),
                vec![-1.0; m],
                vec![block(CanonicalArray::L, 1.0, lower_rows.clone())],
            ),
            dense(
                "u_max",
                Shape::vector(m),
                vec![1.0; m],
                vec![block(CanonicalArray::U, 1.0, upper_rows.clone())],
            ),
        ];

        let variables = vec![
            VariableSpec {
                name: "X".to_string(),
                shape: Shape::matrix(n, h + 1),
                indices: (0..self.num_x()).collect(),
            },
            VariableSpec {
                name: "U".to_string(),
                shape: Shape::matrix(m, h),
                indices: (0..h)
                    .flat_map(|t| (0..m).map(move |k| (t, k)))
                    .map(|(t, k)| self.u(t, k))
                    .collect(),
            },
        ];

        let constraints = vec![
            ConstraintSpec {
                name: "initial_state".to_string(),
                shape: Shape::vector(n),
                rows: (0..n).map(|i| self.initial_row(i)).collect(),
            },
            ConstraintSpec {
                name: "dynamics".to_string(),
                shape: Shape::matrix(n, h),
                rows: (0..h)
                    .flat_map(|t| (0..n).map(move |i| (t, i)))
                    .map(|(t, i)| self.dynamics_row(t, i))
                    .collect(),
            },
            ConstraintSpec {
                name: "input_upper".to_string(),
                shape: Shape::matrix(m, h),
                rows: upper_rows,
            },
            ConstraintSpec {
                name: "input_lower".to_string(),
                shape: Shape::matrix(m, h),
                rows: lower_rows,
            },
        ];

        let template = CanonicalTemplate {
            name: format!("mpc_h{}_n{}_m{}", h, n, m),
            dims: ProblemDims {
                horizon: h,
                states: n,
                inputs: m,
            },
            num_vars,
            num_constraints: num_rows,
            p,
            p_values,
            q: vec![0.0; num_vars],
            a,
            a_values,
            l,
            u,
            offset: 0.0,
            parameters,
            variables,
            constraints,
        };
        template.validate()?;
        Ok(template)
    }
}

fn identity(n: usize) -> Vec<f64> {
    let mut v = vec![0.0; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }
    v
}

fn block(target: CanonicalArray, coeff: f64, positions: Vec<usize>) -> AffineMap {
    AffineMap::DenseBlock {
        target,
        coeff,
        offset: 0.0,
        positions,
    }
}

fn dense(name: &str, shape: Shape, value: Vec<f64>, maps: Vec<AffineMap>) -> ParameterSpec {
    ParameterSpec {
        name: name.to_string(),
        shape,
        kind: ParameterKind::Dense,
        value,
        maps,
    }
}

/// Square-root weight entering A with a minus sign, one entry per diagonal
/// element and replica.
fn diagonal(name: &str, n: usize, positions: Vec<usize>) -> ParameterSpec {
    ParameterSpec {
        name: name.to_string(),
        shape: Shape::matrix(n, n),
        kind: ParameterKind::Diagonal,
        value: identity(n),
        maps: vec![AffineMap::Diagonal {
            target: CanonicalArray::A,
            coeff: -1.0,
            offset: 0.0,
            positions,
        }],
    }
}

/// Parameter values of one MPC instance.
#[derive(Debug, Clone, PartialEq)]
pub struct MpcData {
    pub a: DMatrix<f64>,
    pub b: DMatrix<f64>,
    pub p_sqrt: DMatrix<f64>,
    pub q_sqrt: DMatrix<f64>,
    pub r_sqrt: DMatrix<f64>,
    pub x_init: DVector<f64>,
    pub u_min: DVector<f64>,
    pub u_max: DVector<f64>,
}

impl MpcData {
    /// Borrowed views keyed by template parameter name.
    pub fn values(&self) -> ParameterValues<'_> {
        ParameterValues::new()
            .with("A", view(&self.a))
            .with("B", view(&self.b))
            .with("P_sqrt", view(&self.p_sqrt))
            .with("Q_sqrt", view(&self.q_sqrt))
            .with("R_sqrt", view(&self.r_sqrt))
            .with("x_init", ArrayView::vector(self.x_init.as_slice()))
            .with("u_min", ArrayView::vector(self.u_min.as_slice()))
            .with("u_max", ArrayView::vector(self.u_max.as_slice()))
    }
}

fn view(mat: &DMatrix<f64>) -> ArrayView<'_> {
    // nalgebra storage is column-major, same as ArrayView.
    ArrayView::matrix(mat.nrows(), mat.ncols(), mat.as_slice())
}

const X_INIT_PATTERN: [f64; 6] = [2.0, 2.0, 2.0, -1.0, -1.0, 1.0];

/// Discretized double integrator: `states = 2·inputs` (positions then
/// velocities), time step 0.1.
///
/// A = I + 0.1·A_cont, B = 0.1·B_cont, P½ = Q½ = I, R½ = √0.1·I, inputs in
/// [-1, 1]. The initial state repeats `[2, 2, 2, -1, -1, 1]`.
pub fn double_integrator(states: usize, inputs: usize) -> EmbedResult<MpcData> {
    if inputs == 0 || states != 2 * inputs {
        return Err(EmbedError::InvalidValue {
            name: "double_integrator".to_string(),
            reason: format!("needs states = 2·inputs > 0, got n = {}, m = {}", states, inputs),
        });
    }
    let (n, m) = (states, inputs);
    let dt = 0.1;

    let mut a_cont = DMatrix::<f64>::zeros(n, n);
    let mut b_cont = DMatrix::<f64>::zeros(n, m);
    for i in 0..m {
        a_cont[(i, m + i)] = 1.0;
        b_cont[(m + i, i)] = 1.0;
    }

    Ok(MpcData {
        a: DMatrix::identity(n, n) + a_cont * dt,
        b: b_cont * dt,
        p_sqrt: DMatrix::identity(n, n),
        q_sqrt: DMatrix::identity(n, n),
        r_sqrt: DMatrix::identity(m, m) * 0.1_f64.sqrt(),
        x_init: DVector::from_fn(n, |i, _| X_INIT_PATTERN[i % X_INIT_PATTERN.len()]),
        u_min: DVector::from_element(m, -1.0),
        u_max: DVector::from_element(m, 1.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::SolveStatus;
    use crate::settings::SolveOptions;
    use crate::workspace::Workspace;

    #[test]
    fn test_template_dimensions() {
        let t = MpcTemplate::build(10, 6, 3).unwrap();
        let layout = MpcTemplate::new(10, 6, 3).unwrap();
        assert_eq!(t.num_vars, 2 * (6 * 11 + 3 * 10));
        assert_eq!(t.num_constraints, layout.num_constraints());
        assert_eq!(t.dims.horizon, 10);
        assert_eq!(t.variable("X").unwrap().shape, Shape::matrix(6, 11));
        assert_eq!(t.variable("U").unwrap().shape, Shape::matrix(3, 10));
        assert!(t.p.is_upper_triangular());
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(
            MpcTemplate::build(0, 2, 1),
            Err(EmbedError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_weights_use_diagonal_footprint() {
        let ws = Workspace::initialize(MpcTemplate::build(10, 6, 3).unwrap()).unwrap();
        assert_eq!(ws.parameter_footprint("Q_sqrt").unwrap(), 10 * 6);
        assert_eq!(ws.parameter_footprint("P_sqrt").unwrap(), 6);
        assert_eq!(ws.parameter_footprint("R_sqrt").unwrap(), 10 * 3);
        assert_eq!(ws.parameter_footprint("A").unwrap(), 10 * 36);
        assert_eq!(ws.parameter_footprint("x_init").unwrap(), 12);
    }

    #[test]
    fn test_origin_is_optimal_at_rest() {
        let mut ws = Workspace::initialize(MpcTemplate::build(5, 2, 1).unwrap()).unwrap();
        let outcome = ws.solve(&SolveOptions::embedded()).unwrap();
        assert_eq!(outcome.status, SolveStatus::Optimal);
        assert!(outcome.objective().abs() < 1e-6);
    }

    #[test]
    fn test_double_integrator_data() {
        let data = double_integrator(6, 3).unwrap();
        assert_eq!(data.a[(0, 3)], 0.1);
        assert_eq!(data.a[(0, 0)], 1.0);
        assert_eq!(data.b[(3, 0)], 0.1);
        assert_eq!(data.b[(0, 0)], 0.0);
        assert_eq!(data.x_init.as_slice(), &X_INIT_PATTERN);
        assert!((data.r_sqrt[(1, 1)] - 0.1_f64.sqrt()).abs() < 1e-15);
        assert!(double_integrator(5, 3).is_err());
    }

    #[test]
    fn test_dynamics_follow_parameters() {
        let mut ws = Workspace::initialize(MpcTemplate::build(4, 2, 1).unwrap()).unwrap();
        let data = double_integrator(2, 1).unwrap();
        ws.update_many(data.values().as_slice()).unwrap();
        let outcome = ws.solve(&SolveOptions::reference()).unwrap();
        assert!(outcome.status.is_optimal());

        let x = ws.extract("X").unwrap();
        let u = ws.extract("U").unwrap();
        for t in 0..4 {
            let pred = &data.a * DVector::from_column_slice(x.column(t))
                + &data.b * DVector::from_column_slice(u.column(t));
            for i in 0..2 {
                assert!((pred[i] - x.get(i, t + 1)).abs() < 1e-4);
            }
        }
        assert!((x.get(0, 0) - 2.0).abs() < 1e-4);
        assert!((x.get(1, 0) - 2.0).abs() < 1e-4);
    }
}
