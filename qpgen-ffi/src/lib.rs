//! C ABI for qpgen embedded workspaces.
//!
//! Workspaces are opaque `QpgenWorkspace*` handles. Every fallible call
//! returns an `int` status (`QPGEN_OK` or a negative error code mirroring
//! `EmbedError`); the message of the last failure on the calling thread is
//! available from [`qpgen_last_error`]. Matrices cross the boundary in
//! column-major order.

#![warn(missing_docs)]

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use log::debug;
use qpgen_core::mpc::MpcTemplate;
use qpgen_core::{
    embedded_solve, ArrayView, EmbedError, ParameterValues, Shape, SolveOptions, SolveOutcome,
    SolveStatus, Workspace,
};

/// Success.
pub const QPGEN_OK: i32 = 0;
/// Value shape does not match the declared shape.
pub const QPGEN_ERR_SHAPE_MISMATCH: i32 = -1;
/// Update would change the sparsity pattern.
pub const QPGEN_ERR_STRUCTURAL_MISMATCH: i32 = -2;
/// Extraction before any solve.
pub const QPGEN_ERR_NOT_SOLVED: i32 = -3;
/// Numerical breakdown inside the solver.
pub const QPGEN_ERR_SOLVER: i32 = -4;
/// No parameter with that name.
pub const QPGEN_ERR_UNKNOWN_PARAMETER: i32 = -5;
/// No variable with that name.
pub const QPGEN_ERR_UNKNOWN_VARIABLE: i32 = -6;
/// NaN or infinite value.
pub const QPGEN_ERR_INVALID_VALUE: i32 = -7;
/// Template failed validation.
pub const QPGEN_ERR_INVALID_TEMPLATE: i32 = -8;
/// Options failed validation.
pub const QPGEN_ERR_INVALID_OPTIONS: i32 = -9;
/// File access failed.
pub const QPGEN_ERR_IO: i32 = -10;
/// Template JSON could not be parsed.
pub const QPGEN_ERR_SERIALIZATION: i32 = -11;
/// A required pointer argument was null.
pub const QPGEN_ERR_NULL_POINTER: i32 = -12;
/// A string argument was not valid UTF-8.
pub const QPGEN_ERR_INVALID_UTF8: i32 = -13;
/// The library panicked; the workspace should be freed.
pub const QPGEN_ERR_PANIC: i32 = -14;
/// A size argument is out of range (`rows * cols` overflows).
pub const QPGEN_ERR_INVALID_ARGUMENT: i32 = -15;
/// No constraint block with that name.
pub const QPGEN_ERR_UNKNOWN_CONSTRAINT: i32 = -16;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: String) {
    debug!("qpgen-ffi error: {}", msg);
    let msg = CString::new(msg.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(msg));
}

fn error_code(err: &EmbedError) -> i32 {
    match err {
        EmbedError::ShapeMismatch { .. } => QPGEN_ERR_SHAPE_MISMATCH,
        EmbedError::StructuralMismatch(_) => QPGEN_ERR_STRUCTURAL_MISMATCH,
        EmbedError::NotSolved => QPGEN_ERR_NOT_SOLVED,
        EmbedError::SolverError(_) => QPGEN_ERR_SOLVER,
        EmbedError::UnknownParameter(_) => QPGEN_ERR_UNKNOWN_PARAMETER,
        EmbedError::UnknownVariable(_) => QPGEN_ERR_UNKNOWN_VARIABLE,
        EmbedError::UnknownConstraint(_) => QPGEN_ERR_UNKNOWN_CONSTRAINT,
        EmbedError::InvalidValue { .. } => QPGEN_ERR_INVALID_VALUE,
        EmbedError::InvalidTemplate(_) => QPGEN_ERR_INVALID_TEMPLATE,
        EmbedError::InvalidOptions(_) => QPGEN_ERR_INVALID_OPTIONS,
        EmbedError::Io(_) => QPGEN_ERR_IO,
        EmbedError::Serialization(_) => QPGEN_ERR_SERIALIZATION,
    }
}

/// Record `err` and return its code.
fn fail(err: EmbedError) -> i32 {
    let code = error_code(&err);
    set_last_error(err.to_string());
    code
}

/// Run `f`, turning a panic into `QPGEN_ERR_PANIC`.
fn guard<F: FnOnce() -> i32>(f: F) -> i32 {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(code) => code,
        Err(_) => {
            set_last_error("panic inside qpgen".to_string());
            QPGEN_ERR_PANIC
        }
    }
}

/// Borrow a C string argument.
///
/// # Safety
/// `s` must be null or point to a NUL-terminated string.
unsafe fn str_arg<'a>(s: *const c_char) -> Result<&'a str, i32> {
    if s.is_null() {
        set_last_error("null string argument".to_string());
        return Err(QPGEN_ERR_NULL_POINTER);
    }
    CStr::from_ptr(s).to_str().map_err(|e| {
        set_last_error(format!("string argument is not UTF-8: {}", e));
        QPGEN_ERR_INVALID_UTF8
    })
}

/// Borrow a column-major `rows × cols` value buffer.
///
/// # Safety
/// `data` must be null or point to `rows * cols` readable doubles.
unsafe fn matrix_arg<'a>(
    data: *const f64,
    rows: usize,
    cols: usize,
) -> Result<ArrayView<'a>, i32> {
    let Some(len) = rows.checked_mul(cols) else {
        set_last_error(format!("{} x {} buffer length overflows", rows, cols));
        return Err(QPGEN_ERR_INVALID_ARGUMENT);
    };
    let values: &[f64] = if len == 0 {
        &[]
    } else if data.is_null() {
        set_last_error("null data buffer".to_string());
        return Err(QPGEN_ERR_NULL_POINTER);
    } else {
        std::slice::from_raw_parts(data, len)
    };
    Ok(ArrayView::new(Shape::matrix(rows, cols), values))
}

/// Borrow a C array of `count` elements.
///
/// # Safety
/// `ptr` must be null or point to `count` readable elements.
unsafe fn array_arg<'a, T>(ptr: *const T, count: usize, what: &str) -> Result<&'a [T], i32> {
    if count == 0 {
        Ok(&[])
    } else if ptr.is_null() {
        set_last_error(format!("null {} array", what));
        Err(QPGEN_ERR_NULL_POINTER)
    } else {
        Ok(std::slice::from_raw_parts(ptr, count))
    }
}

fn write_outcome(out: *mut QpgenOutcome, outcome: &SolveOutcome) {
    // SAFETY: callers pass null or a valid, writable outcome pointer.
    if let Some(out) = unsafe { out.as_mut() } {
        *out = QpgenOutcome::from(outcome);
    }
}

fn breakdown_error(outcome: &SolveOutcome) -> EmbedError {
    let detail = outcome
        .breakdown
        .map_or_else(|| "numerical breakdown".to_string(), |b| b.to_string());
    EmbedError::SolverError(detail)
}

/// Opaque workspace handle.
pub struct QpgenWorkspace {
    ws: Workspace,
}

/// Solve options.
///
/// Obtain defaults from [`qpgen_default_options`] and override fields.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct QpgenOptions {
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
    /// Initial step size.
    pub rho: f64,
    /// Primal regularization.
    pub sigma: f64,
    /// Over-relaxation in (0, 2).
    pub alpha: f64,
    /// Adapt the step size during the solve.
    pub adaptive_rho: bool,
    /// Ruiz equilibration passes.
    pub scaling_iters: usize,
    /// Iterations between termination checks.
    pub check_termination: usize,
    /// Seed from the previous solution when compatible.
    pub warm_start: bool,
    /// Run solution polishing.
    pub polish: bool,
    /// Wall-clock budget in milliseconds; 0 means no limit.
    pub time_limit_ms: u64,
    /// Log a summary line per solve.
    pub verbose: bool,
}

impl From<&SolveOptions> for QpgenOptions {
    fn from(opts: &SolveOptions) -> Self {
        Self {
            max_iter: opts.max_iter,
            eps_abs: opts.eps_abs,
            eps_rel: opts.eps_rel,
            eps_prim_inf: opts.eps_prim_inf,
            eps_dual_inf: opts.eps_dual_inf,
            rho: opts.rho,
            sigma: opts.sigma,
            alpha: opts.alpha,
            adaptive_rho: opts.adaptive_rho,
            scaling_iters: opts.scaling_iters,
            check_termination: opts.check_termination,
            warm_start: opts.warm_start,
            polish: opts.polish,
            time_limit_ms: opts.time_limit_ms.unwrap_or(0),
            verbose: opts.verbose,
        }
    }
}

impl From<&QpgenOptions> for SolveOptions {
    fn from(c: &QpgenOptions) -> Self {
        SolveOptions {
            max_iter: c.max_iter,
            eps_abs: c.eps_abs,
            eps_rel: c.eps_rel,
            eps_prim_inf: c.eps_prim_inf,
            eps_dual_inf: c.eps_dual_inf,
            rho: c.rho,
            sigma: c.sigma,
            alpha: c.alpha,
            adaptive_rho: c.adaptive_rho,
            scaling_iters: c.scaling_iters,
            check_termination: c.check_termination,
            warm_start: c.warm_start,
            polish: c.polish,
            time_limit_ms: (c.time_limit_ms > 0).then_some(c.time_limit_ms),
            verbose: c.verbose,
            ..SolveOptions::embedded()
        }
    }
}

/// Outcome of one solve.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct QpgenOutcome {
    /// Status code: 1 optimal, 2 optimal inaccurate, -2 iteration cap,
    /// -3 infeasible, -4 unbounded, -6 time limit, -7 error.
    pub status: i32,
    /// ADMM iterations.
    pub iterations: usize,
    /// Objective value (inf infeasible, -inf unbounded, NaN error).
    pub objective: f64,
    /// Primal residual ‖Ax - z‖∞.
    pub primal_residual: f64,
    /// Dual residual ‖Px + q + Aᵀy‖∞.
    pub dual_residual: f64,
    /// Setup time in seconds.
    pub setup_time: f64,
    /// Total solve time in seconds.
    pub solve_time: f64,
    /// Numeric factorizations performed.
    pub factorizations: usize,
    /// Data generation the solve ran against.
    pub data_generation: u64,
}

impl From<&SolveOutcome> for QpgenOutcome {
    fn from(outcome: &SolveOutcome) -> Self {
        Self {
            status: outcome.status.code(),
            iterations: outcome.info.iterations,
            objective: outcome.info.objective,
            primal_residual: outcome.info.primal_residual,
            dual_residual: outcome.info.dual_residual,
            setup_time: outcome.info.setup_time,
            solve_time: outcome.info.solve_time,
            factorizations: outcome.info.factorizations,
            data_generation: outcome.info.data_generation,
        }
    }
}

fn into_handle(ws: Result<Workspace, EmbedError>) -> *mut QpgenWorkspace {
    match ws {
        Ok(ws) => Box::into_raw(Box::new(QpgenWorkspace { ws })),
        Err(err) => {
            fail(err);
            ptr::null_mut()
        }
    }
}

/// Create a workspace from a template serialized as JSON.
///
/// Returns null on failure; see [`qpgen_last_error`].
///
/// # Safety
/// `json` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn qpgen_workspace_from_json(json: *const c_char) -> *mut QpgenWorkspace {
    let mut handle = ptr::null_mut();
    guard(|| match str_arg(json) {
        Ok(json) => {
            handle = into_handle(Workspace::from_json(json));
            QPGEN_OK
        }
        Err(code) => code,
    });
    handle
}

/// Create the MPC workspace with the given horizon and dimensions.
///
/// Returns null on failure; see [`qpgen_last_error`].
#[no_mangle]
pub extern "C" fn qpgen_workspace_mpc(
    horizon: usize,
    states: usize,
    inputs: usize,
) -> *mut QpgenWorkspace {
    let mut handle = ptr::null_mut();
    guard(|| {
        handle = into_handle(
            MpcTemplate::build(horizon, states, inputs).and_then(Workspace::initialize),
        );
        QPGEN_OK
    });
    handle
}

/// Release a workspace. Null is ignored.
///
/// # Safety
/// `ws` must be null or a handle returned by this library that has not been
/// freed.
#[no_mangle]
pub unsafe extern "C" fn qpgen_workspace_free(ws: *mut QpgenWorkspace) {
    if !ws.is_null() {
        drop(Box::from_raw(ws));
    }
}

/// Write parameter `name` from a column-major `rows × cols` buffer.
///
/// Vectors pass `cols = 1`, scalars `rows = cols = 1`. The write is staged
/// and lands with the next solve; use [`qpgen_embedded_solve`] to apply
/// several parameters atomically.
///
/// # Safety
/// `ws` must be a live handle, `name` a NUL-terminated string and `data`
/// must point to `rows * cols` readable doubles.
#[no_mangle]
pub unsafe extern "C" fn qpgen_update(
    ws: *mut QpgenWorkspace,
    name: *const c_char,
    data: *const f64,
    rows: usize,
    cols: usize,
) -> i32 {
    guard(|| {
        let Some(handle) = ws.as_mut() else {
            set_last_error("null workspace".to_string());
            return QPGEN_ERR_NULL_POINTER;
        };
        let name = match str_arg(name) {
            Ok(name) => name,
            Err(code) => return code,
        };
        let value = match matrix_arg(data, rows, cols) {
            Ok(value) => value,
            Err(code) => return code,
        };
        match handle.ws.update(name, value) {
            Ok(()) => QPGEN_OK,
            Err(err) => fail(err),
        }
    })
}

/// Solve with the current parameter values.
///
/// `opts` may be null for the embedded defaults. `out` (optional) receives
/// the outcome. Non-optimal statuses return `QPGEN_OK`; numerical breakdown
/// returns `QPGEN_ERR_SOLVER` with the outcome still filled in.
///
/// # Safety
/// `ws` must be a live handle; `opts` and `out` must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn qpgen_solve(
    ws: *mut QpgenWorkspace,
    opts: *const QpgenOptions,
    out: *mut QpgenOutcome,
) -> i32 {
    guard(|| {
        let Some(handle) = ws.as_mut() else {
            set_last_error("null workspace".to_string());
            return QPGEN_ERR_NULL_POINTER;
        };
        let opts = match opts.as_ref() {
            Some(c) => SolveOptions::from(c),
            None => SolveOptions::embedded(),
        };
        let outcome = match handle.ws.solve(&opts) {
            Ok(outcome) => outcome,
            Err(err) => return fail(err),
        };
        write_outcome(out, &outcome);
        if outcome.status == SolveStatus::Error {
            return fail(breakdown_error(&outcome));
        }
        QPGEN_OK
    })
}

/// Apply `count` parameters and solve, as one unit.
///
/// Parameter `k` is `names[k]` with a column-major `rows[k] × cols[k]`
/// buffer at `data[k]`. Every value is checked before any is written: on a
/// name, shape or value error nothing changes, the previous solution and
/// `out` included. Updates staged earlier with [`qpgen_update`] are
/// committed by this call too. Statuses and `out` behave as in
/// [`qpgen_solve`]; read variables afterwards with [`qpgen_extract`].
///
/// # Safety
/// `ws` must be a live handle. With `count > 0`, `names`, `data`, `rows` and
/// `cols` must each point to `count` elements, every name NUL-terminated and
/// every `data[k]` pointing to `rows[k] * cols[k]` readable doubles. `opts`
/// and `out` must be null or valid.
#[no_mangle]
pub unsafe extern "C" fn qpgen_embedded_solve(
    ws: *mut QpgenWorkspace,
    names: *const *const c_char,
    data: *const *const f64,
    rows: *const usize,
    cols: *const usize,
    count: usize,
    opts: *const QpgenOptions,
    out: *mut QpgenOutcome,
) -> i32 {
    guard(|| {
        let Some(handle) = ws.as_mut() else {
            set_last_error("null workspace".to_string());
            return QPGEN_ERR_NULL_POINTER;
        };
        let arrays = (|| {
            Ok::<_, i32>((
                array_arg(names, count, "name")?,
                array_arg(data, count, "data")?,
                array_arg(rows, count, "rows")?,
                array_arg(cols, count, "cols")?,
            ))
        })();
        let (names, data, rows, cols) = match arrays {
            Ok(arrays) => arrays,
            Err(code) => return code,
        };

        let mut params = ParameterValues::new();
        for k in 0..count {
            let name = match str_arg(names[k]) {
                Ok(name) => name,
                Err(code) => return code,
            };
            match matrix_arg(data[k], rows[k], cols[k]) {
                Ok(value) => params.insert(name, value),
                Err(code) => return code,
            }
        }

        let opts = match opts.as_ref() {
            Some(c) => SolveOptions::from(c),
            None => SolveOptions::embedded(),
        };
        match embedded_solve(&mut handle.ws, &params, &opts) {
            Ok(solution) => {
                write_outcome(out, &solution.outcome);
                QPGEN_OK
            }
            Err(err @ EmbedError::SolverError(_)) => {
                if let Some(outcome) = handle.ws.outcome() {
                    write_outcome(out, outcome);
                }
                fail(err)
            }
            Err(err) => fail(err),
        }
    })
}

/// Copy variable `name` (column-major) into `out`, which holds `len` doubles.
///
/// # Safety
/// `ws` must be a live handle, `name` a NUL-terminated string and `out` must
/// point to `len` writable doubles.
#[no_mangle]
pub unsafe extern "C" fn qpgen_extract(
    ws: *const QpgenWorkspace,
    name: *const c_char,
    out: *mut f64,
    len: usize,
) -> i32 {
    guard(|| {
        let Some(handle) = ws.as_ref() else {
            set_last_error("null workspace".to_string());
            return QPGEN_ERR_NULL_POINTER;
        };
        let name = match str_arg(name) {
            Ok(name) => name,
            Err(code) => return code,
        };
        let out: &mut [f64] = if len == 0 {
            &mut []
        } else if out.is_null() {
            set_last_error("null output buffer".to_string());
            return QPGEN_ERR_NULL_POINTER;
        } else {
            std::slice::from_raw_parts_mut(out, len)
        };
        match handle.ws.extract_into(name, out) {
            Ok(()) => QPGEN_OK,
            Err(err) => fail(err),
        }
    })
}

/// Copy the multipliers of constraint block `name` into `out`, which holds
/// `len` doubles.
///
/// # Safety
/// `ws` must be a live handle, `name` a NUL-terminated string and `out` must
/// point to `len` writable doubles.
#[no_mangle]
pub unsafe extern "C" fn qpgen_extract_dual(
    ws: *const QpgenWorkspace,
    name: *const c_char,
    out: *mut f64,
    len: usize,
) -> i32 {
    guard(|| {
        let Some(handle) = ws.as_ref() else {
            set_last_error("null workspace".to_string());
            return QPGEN_ERR_NULL_POINTER;
        };
        let name = match str_arg(name) {
            Ok(name) => name,
            Err(code) => return code,
        };
        let out: &mut [f64] = if len == 0 {
            &mut []
        } else if out.is_null() {
            set_last_error("null output buffer".to_string());
            return QPGEN_ERR_NULL_POINTER;
        } else {
            std::slice::from_raw_parts_mut(out, len)
        };
        match handle.ws.extract_dual_into(name, out) {
            Ok(()) => QPGEN_OK,
            Err(err) => fail(err),
        }
    })
}

/// Embedded preset options.
#[no_mangle]
pub extern "C" fn qpgen_default_options() -> QpgenOptions {
    QpgenOptions::from(&SolveOptions::embedded())
}

/// Message of the last failure on this thread, or null.
///
/// The pointer stays valid until the next failing call on the same thread.
#[no_mangle]
pub extern "C" fn qpgen_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}
