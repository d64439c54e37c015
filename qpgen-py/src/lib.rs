//! Python bindings for qpgen embedded workspaces.
//!
//! Exposes [`EmbeddedSolver`], a thin wrapper over a `qpgen_core::Workspace`,
//! to Python. Parameter values and results travel as numpy arrays; 2-D arrays
//! are mapped to the column-major storage the workspace uses, so callers never
//! see the layout.

use std::borrow::Cow;
use std::collections::BTreeMap;

use numpy::ndarray::{Array1, Array2, ShapeBuilder};
use numpy::{IntoPyArray, PyReadonlyArrayDyn, PyUntypedArray, PyUntypedArrayMethods};
use pyo3::create_exception;
use pyo3::exceptions::{PyException, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use qpgen_core::mpc::MpcTemplate;
use qpgen_core::{
    embedded_solve, ArrayView, EmbedError, HostSolution, Matrix, ParameterValues, Shape,
    SolveOptions, SolveOutcome, Workspace,
};

create_exception!(_native, QpgenError, PyException);
create_exception!(_native, ShapeMismatchError, QpgenError);
create_exception!(_native, StructuralMismatchError, QpgenError);
create_exception!(_native, NotSolvedError, QpgenError);
create_exception!(_native, SolverInternalError, QpgenError);

fn to_py_err(err: EmbedError) -> PyErr {
    let msg = err.to_string();
    match err {
        EmbedError::ShapeMismatch { .. } => ShapeMismatchError::new_err(msg),
        EmbedError::StructuralMismatch(_) => StructuralMismatchError::new_err(msg),
        EmbedError::NotSolved => NotSolvedError::new_err(msg),
        EmbedError::SolverError(_) => SolverInternalError::new_err(msg),
        _ => QpgenError::new_err(msg),
    }
}

/// A parameter value taken from Python.
///
/// Float64 arrays are held as-is so Fortran-ordered data can be passed to the
/// workspace without a copy.
enum HostValue<'py> {
    Array(PyReadonlyArrayDyn<'py, f64>),
    Scalar(f64),
}

impl<'py> HostValue<'py> {
    /// Accept a float64 array, a Python number, or anything numpy can turn
    /// into a float64 array (integer and float32 arrays, nested lists).
    fn extract(value: &Bound<'py, PyAny>) -> PyResult<Self> {
        if let Ok(array) = value.extract::<PyReadonlyArrayDyn<'py, f64>>() {
            return Ok(Self::Array(array));
        }
        if value.cast::<PyUntypedArray>().is_err() {
            if let Ok(scalar) = value.extract::<f64>() {
                return Ok(Self::Scalar(scalar));
            }
        }
        let converted = value
            .py()
            .import("numpy")?
            .call_method1("asarray", (value, "float64"))?;
        Ok(Self::Array(converted.extract()?))
    }

    /// Shape and column-major data.
    ///
    /// 0-d arrays become scalars and 1-d arrays column vectors. Only
    /// C-ordered matrices and strided views are copied.
    fn columns(&self) -> PyResult<(Shape, Cow<'_, [f64]>)> {
        let array = match self {
            Self::Scalar(v) => {
                return Ok((Shape::scalar(), Cow::Borrowed(std::slice::from_ref(v))));
            }
            Self::Array(array) => array,
        };
        let view = array.as_array();
        let shape = match view.ndim() {
            0 => Shape::scalar(),
            1 => Shape::vector(view.len()),
            2 => Shape::matrix(view.shape()[0], view.shape()[1]),
            ndim => {
                return Err(ShapeMismatchError::new_err(format!(
                    "parameter values must have at most 2 dimensions, got {}",
                    ndim
                )))
            }
        };
        if view.ndim() < 2 || array.is_fortran_contiguous() {
            if let Ok(slice) = array.as_slice() {
                return Ok((shape, Cow::Borrowed(slice)));
            }
        }
        // Iterating the transpose in logical order walks the columns.
        Ok((shape, Cow::Owned(view.t().iter().copied().collect())))
    }
}

/// Matrix → numpy; column vectors come back 1-D.
fn to_numpy<'py>(py: Python<'py>, matrix: &Matrix) -> PyResult<Bound<'py, PyAny>> {
    if matrix.shape.cols == 1 {
        return Ok(Array1::from_vec(matrix.data.clone())
            .into_pyarray(py)
            .into_any());
    }
    let array = Array2::from_shape_vec(
        (matrix.shape.rows, matrix.shape.cols).f(),
        matrix.data.clone(),
    )
    .map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok(array.into_pyarray(py).into_any())
}

#[allow(clippy::too_many_arguments)]
fn build_options(
    preset: &str,
    max_iter: Option<usize>,
    eps_abs: Option<f64>,
    eps_rel: Option<f64>,
    warm_start: Option<bool>,
    polish: Option<bool>,
    time_limit_ms: Option<u64>,
    verbose: Option<bool>,
) -> PyResult<SolveOptions> {
    let mut opts = match preset.to_lowercase().as_str() {
        "embedded" => SolveOptions::embedded(),
        "reference" => SolveOptions::reference(),
        "default" => SolveOptions::default(),
        _ => {
            return Err(PyValueError::new_err(format!(
                "Unknown preset: {}. Supported: embedded, reference, default",
                preset
            )))
        }
    };
    if let Some(v) = max_iter {
        opts.max_iter = v;
    }
    if let Some(v) = eps_abs {
        opts.eps_abs = v;
    }
    if let Some(v) = eps_rel {
        opts.eps_rel = v;
    }
    if let Some(v) = warm_start {
        opts.warm_start = v;
    }
    if let Some(v) = polish {
        opts.polish = v;
    }
    if let Some(v) = time_limit_ms {
        opts.time_limit_ms = Some(v);
    }
    if let Some(v) = verbose {
        opts.verbose = v;
    }
    opts.validate().map_err(to_py_err)?;
    Ok(opts)
}

/// Result of one solve.
///
/// Non-optimal statuses (infeasible, iteration cap, ...) are reported here,
/// not raised.
#[pyclass(name = "SolveResult")]
#[derive(Clone)]
pub struct PySolveResult {
    #[pyo3(get)]
    status: String,
    #[pyo3(get)]
    status_code: i32,
    #[pyo3(get)]
    objective: f64,
    #[pyo3(get)]
    iterations: usize,
    #[pyo3(get)]
    setup_time: f64,
    #[pyo3(get)]
    solve_time: f64,
    #[pyo3(get)]
    primal_residual: f64,
    #[pyo3(get)]
    dual_residual: f64,
    #[pyo3(get)]
    factorizations: usize,
    #[pyo3(get)]
    warm_started: bool,
    #[pyo3(get)]
    polished: bool,

    variables: BTreeMap<String, Matrix>,
}

impl PySolveResult {
    fn new(outcome: &SolveOutcome, variables: BTreeMap<String, Matrix>) -> Self {
        Self {
            status: outcome.status.to_string(),
            status_code: outcome.status.code(),
            objective: outcome.info.objective,
            iterations: outcome.info.iterations,
            setup_time: outcome.info.setup_time,
            solve_time: outcome.info.solve_time,
            primal_residual: outcome.info.primal_residual,
            dual_residual: outcome.info.dual_residual,
            factorizations: outcome.info.factorizations,
            warm_started: outcome.info.warm_started,
            polished: outcome.info.polished,
            variables,
        }
    }
}

impl From<HostSolution> for PySolveResult {
    fn from(sol: HostSolution) -> Self {
        Self::new(&sol.outcome, sol.variables)
    }
}

#[pymethods]
impl PySolveResult {
    /// True for "optimal" and "optimal inaccurate".
    #[getter]
    fn is_optimal(&self) -> bool {
        self.status_code > 0
    }

    /// Value of variable `name`.
    fn variable<'py>(&self, py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyAny>> {
        let matrix = self
            .variables
            .get(name)
            .ok_or_else(|| to_py_err(EmbedError::UnknownVariable(name.to_string())))?;
        to_numpy(py, matrix)
    }

    fn __getitem__<'py>(&self, py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyAny>> {
        self.variable(py, name)
    }

    /// All variables as a dict of numpy arrays.
    fn variables<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for (name, matrix) in &self.variables {
            dict.set_item(name, to_numpy(py, matrix)?)?;
        }
        Ok(dict)
    }

    fn __repr__(&self) -> String {
        format!(
            "SolveResult(status='{}', objective={:.6e}, iters={}, time={:.3}ms)",
            self.status,
            self.objective,
            self.iterations,
            self.solve_time * 1e3
        )
    }
}

/// Embedded QP workspace.
///
/// Holds the canonical problem data and solver state between calls; not
/// shareable across threads.
#[pyclass(unsendable)]
pub struct EmbeddedSolver {
    ws: Workspace,
}

#[pymethods]
impl EmbeddedSolver {
    /// Build a workspace from a canonical template serialized as JSON.
    #[staticmethod]
    fn from_json(json: &str) -> PyResult<Self> {
        let ws = Workspace::from_json(json).map_err(to_py_err)?;
        Ok(Self { ws })
    }

    /// Build a workspace from a template file.
    #[staticmethod]
    fn load(path: &str) -> PyResult<Self> {
        let ws = Workspace::load(path).map_err(to_py_err)?;
        Ok(Self { ws })
    }

    /// Build the MPC workspace with horizon `horizon`, `states` states and
    /// `inputs` inputs.
    #[staticmethod]
    fn mpc(horizon: usize, states: usize, inputs: usize) -> PyResult<Self> {
        let template = MpcTemplate::build(horizon, states, inputs).map_err(to_py_err)?;
        let ws = Workspace::initialize(template).map_err(to_py_err)?;
        Ok(Self { ws })
    }

    #[getter]
    fn name(&self) -> String {
        self.ws.name().to_string()
    }

    #[getter]
    fn num_vars(&self) -> usize {
        self.ws.num_vars()
    }

    #[getter]
    fn num_constraints(&self) -> usize {
        self.ws.num_constraints()
    }

    /// Write one parameter value; takes effect at the next `commit`/`solve`.
    fn update(&mut self, name: &str, value: &Bound<'_, PyAny>) -> PyResult<()> {
        let value = HostValue::extract(value)?;
        let (shape, data) = value.columns()?;
        self.ws
            .update(name, ArrayView::new(shape, &data))
            .map_err(to_py_err)
    }

    /// Publish pending updates and return the new data generation.
    fn commit(&mut self) -> u64 {
        self.ws.commit()
    }

    /// Solve with the current parameter values.
    #[pyo3(signature = (
        preset = "embedded",
        max_iter = None,
        eps_abs = None,
        eps_rel = None,
        warm_start = None,
        polish = None,
        time_limit_ms = None,
        verbose = None
    ))]
    #[allow(clippy::too_many_arguments)]
    fn solve(
        &mut self,
        preset: &str,
        max_iter: Option<usize>,
        eps_abs: Option<f64>,
        eps_rel: Option<f64>,
        warm_start: Option<bool>,
        polish: Option<bool>,
        time_limit_ms: Option<u64>,
        verbose: Option<bool>,
    ) -> PyResult<PySolveResult> {
        let opts = build_options(
            preset,
            max_iter,
            eps_abs,
            eps_rel,
            warm_start,
            polish,
            time_limit_ms,
            verbose,
        )?;
        // Reuse the one-call path with no parameters so breakdown is raised
        // the same way.
        let sol = embedded_solve(&mut self.ws, &ParameterValues::new(), &opts)
            .map_err(to_py_err)?;
        Ok(sol.into())
    }

    /// Update every parameter in `params`, solve and return all variables.
    ///
    /// If any value is rejected nothing is written.
    #[pyo3(signature = (
        params,
        preset = "embedded",
        max_iter = None,
        eps_abs = None,
        eps_rel = None,
        warm_start = None,
        polish = None,
        time_limit_ms = None,
        verbose = None
    ))]
    #[allow(clippy::too_many_arguments)]
    fn embedded_solve(
        &mut self,
        params: &Bound<'_, PyDict>,
        preset: &str,
        max_iter: Option<usize>,
        eps_abs: Option<f64>,
        eps_rel: Option<f64>,
        warm_start: Option<bool>,
        polish: Option<bool>,
        time_limit_ms: Option<u64>,
        verbose: Option<bool>,
    ) -> PyResult<PySolveResult> {
        let opts = build_options(
            preset,
            max_iter,
            eps_abs,
            eps_rel,
            warm_start,
            polish,
            time_limit_ms,
            verbose,
        )?;

        // Convert everything first; the views below borrow it.
        let mut names = Vec::with_capacity(params.len());
        let mut held = Vec::with_capacity(params.len());
        for (key, value) in params.iter() {
            names.push(key.extract::<String>()?);
            held.push(HostValue::extract(&value)?);
        }
        let columns = held
            .iter()
            .map(HostValue::columns)
            .collect::<PyResult<Vec<_>>>()?;
        let values: ParameterValues = names
            .iter()
            .zip(&columns)
            .map(|(name, (shape, data))| (name.as_str(), ArrayView::new(*shape, data)))
            .collect();

        let sol = embedded_solve(&mut self.ws, &values, &opts).map_err(to_py_err)?;
        Ok(sol.into())
    }

    /// Value of variable `name` from the last solve.
    fn variable<'py>(&self, py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyAny>> {
        let matrix = self.ws.extract(name).map_err(to_py_err)?;
        to_numpy(py, &matrix)
    }

    /// Multipliers of constraint block `name` from the last solve.
    fn dual<'py>(&self, py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyAny>> {
        let matrix = self.ws.extract_dual(name).map_err(to_py_err)?;
        to_numpy(py, &matrix)
    }

    /// Current value of parameter `name`.
    fn parameter<'py>(&self, py: Python<'py>, name: &str) -> PyResult<Bound<'py, PyAny>> {
        let matrix = self.ws.parameter_value(name).map_err(to_py_err)?;
        to_numpy(py, &matrix)
    }

    fn parameter_names(&self) -> Vec<String> {
        self.ws.parameter_names().map(str::to_string).collect()
    }

    fn variable_names(&self) -> Vec<String> {
        self.ws.variable_names().map(str::to_string).collect()
    }

    fn constraint_names(&self) -> Vec<String> {
        self.ws.constraint_names().map(str::to_string).collect()
    }

    /// Serialize the workspace template back to JSON.
    fn to_json(&self) -> PyResult<String> {
        self.ws.template().to_json().map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "EmbeddedSolver(name='{}', n={}, m={})",
            self.ws.name(),
            self.ws.num_vars(),
            self.ws.num_constraints()
        )
    }
}

/// Get version information.
#[pyfunction]
fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Get the options of a preset as a dict.
#[pyfunction]
#[pyo3(signature = (preset = "embedded"))]
fn default_options<'py>(py: Python<'py>, preset: &str) -> PyResult<Bound<'py, PyDict>> {
    let opts = build_options(preset, None, None, None, None, None, None, None)?;
    let dict = PyDict::new(py);
    dict.set_item("max_iter", opts.max_iter)?;
    dict.set_item("eps_abs", opts.eps_abs)?;
    dict.set_item("eps_rel", opts.eps_rel)?;
    dict.set_item("rho", opts.rho)?;
    dict.set_item("sigma", opts.sigma)?;
    dict.set_item("alpha", opts.alpha)?;
    dict.set_item("adaptive_rho", opts.adaptive_rho)?;
    dict.set_item("scaling_iters", opts.scaling_iters)?;
    dict.set_item("warm_start", opts.warm_start)?;
    dict.set_item("polish", opts.polish)?;
    dict.set_item("time_limit_ms", opts.time_limit_ms)?;
    Ok(dict)
}

/// Python module definition.
#[pymodule]
fn _native(m: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = m.py();
    m.add_class::<EmbeddedSolver>()?;
    m.add_class::<PySolveResult>()?;
    m.add_function(wrap_pyfunction!(version, m)?)?;
    m.add_function(wrap_pyfunction!(default_options, m)?)?;
    m.add("QpgenError", py.get_type::<QpgenError>())?;
    m.add("ShapeMismatchError", py.get_type::<ShapeMismatchError>())?;
    m.add("StructuralMismatchError", py.get_type::<StructuralMismatchError>())?;
    m.add("NotSolvedError", py.get_type::<NotSolvedError>())?;
    m.add("SolverInternalError", py.get_type::<SolverInternalError>())?;
    Ok(())
}
