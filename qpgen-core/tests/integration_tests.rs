//! End-to-end tests of the embedded re-solve pipeline.
//!
//! Update, solve and extract run through the public API on the MPC running
//! example and on small hand-checked QPs.

use nalgebra::{DMatrix, DVector};
use qpgen_core::linalg::sparse;
use qpgen_core::mpc::{double_integrator, MpcData, MpcTemplate};
use qpgen_core::{
    embedded_solve, ArrayView, CanonicalArray, CanonicalTemplate, EmbedError, ParameterValues,
    SolveOptions, SolveStatus, Workspace,
};

fn mpc_workspace(h: usize, n: usize, m: usize) -> Workspace {
    Workspace::initialize(MpcTemplate::build(h, n, m).expect("template")).expect("workspace")
}

/// Solve the current canonical data of `ws` in a fresh, parameter-free
/// workspace.
fn reference_solve(ws: &Workspace, opts: &SolveOptions) -> (SolveStatus, f64, Vec<f64>) {
    let view = ws.as_solver_view();
    let mut template =
        CanonicalTemplate::from_qp(view.p, view.q, view.a, view.l, view.u).expect("from_qp");
    template.offset = view.offset;
    let mut reference = Workspace::initialize(template).expect("reference workspace");
    let outcome = reference.solve(opts).expect("reference solve");
    let x = reference.primal().expect("primal").to_vec();
    (outcome.status, outcome.objective(), x)
}

fn rel_err(a: f64, b: f64) -> f64 {
    (a - b).abs() / b.abs().max(1.0)
}

#[test]
fn test_mpc_double_integrator_end_to_end() {
    let mut ws = mpc_workspace(10, 6, 3);
    let data = double_integrator(6, 3).unwrap();
    let opts = SolveOptions::embedded();

    let sol = embedded_solve(&mut ws, &data.values(), &opts).expect("embedded solve");
    println!("embedded: {}", sol.outcome);
    assert_eq!(sol.status(), SolveStatus::Optimal);

    // Same canonical data, same settings, no parameter layer.
    let (status, objective, _) = reference_solve(&ws, &opts);
    assert_eq!(status, SolveStatus::Optimal);
    assert!(
        rel_err(sol.outcome.objective(), objective) <= 1e-3,
        "objective {} vs reference {}",
        sol.outcome.objective(),
        objective
    );

    let u = sol.variable("U").unwrap();
    assert_eq!((u.shape.rows, u.shape.cols), (3, 10));
    let slack = sol.outcome.info.primal_residual + 1e-9;
    for v in &u.data {
        assert!(v.abs() <= 1.0 + slack, "|u| = {} exceeds bound", v.abs());
    }

    // The first state is pinned to x_init.
    let x = sol.variable("X").unwrap();
    for (i, want) in data.x_init.iter().enumerate() {
        assert!((x.get(i, 0) - want).abs() <= 1e-2);
    }
}

#[test]
fn test_embedded_matches_tight_reference_over_samples() {
    let mut ws = mpc_workspace(10, 6, 3);
    let mut data = double_integrator(6, 3).unwrap();
    let opts = SolveOptions::embedded();

    for scale in [1.0, 0.5, -0.25, 2.0] {
        data.x_init = DVector::from_fn(6, |i, _| scale * [2.0, 2.0, 2.0, -1.0, -1.0, 1.0][i]);
        let sol = embedded_solve(&mut ws, &data.values(), &opts).unwrap();
        assert!(sol.status().is_optimal(), "scale {}: {}", scale, sol.outcome);

        let (status, objective, _) = reference_solve(&ws, &SolveOptions::reference());
        assert_eq!(status, SolveStatus::Optimal);
        assert!(
            rel_err(sol.outcome.objective(), objective) <= 1e-2,
            "scale {}: objective {} vs reference {}",
            scale,
            sol.outcome.objective(),
            objective
        );
    }
}

#[test]
fn test_empty_input_interval_is_infeasible() {
    let mut ws = mpc_workspace(10, 6, 3);
    let mut data = double_integrator(6, 3).unwrap();
    data.u_min = DVector::from_element(3, 1.0);
    data.u_max = DVector::from_element(3, -1.0);

    let sol = embedded_solve(&mut ws, &data.values(), &SolveOptions::embedded()).unwrap();
    assert_eq!(sol.status(), SolveStatus::Infeasible);
    assert_eq!(sol.outcome.objective(), f64::INFINITY);
    assert!(sol.variable("U").unwrap().data.iter().all(|v| v.is_nan()));

    // Restoring the bounds recovers a normal solve.
    let data = double_integrator(6, 3).unwrap();
    let sol = embedded_solve(&mut ws, &data.values(), &SolveOptions::embedded()).unwrap();
    assert_eq!(sol.status(), SolveStatus::Optimal);
}

#[test]
fn test_shape_mismatch_leaves_workspace_unchanged() {
    let mut ws = mpc_workspace(10, 6, 3);
    let data = double_integrator(6, 3).unwrap();
    let opts = SolveOptions::embedded().with_warm_start(false);

    let first = embedded_solve(&mut ws, &data.values(), &opts).unwrap();
    let generation = ws.data_generation();

    let wrong = DMatrix::<f64>::identity(5, 5);
    let err = ws
        .update("A", ArrayView::matrix(5, 5, wrong.as_slice()))
        .unwrap_err();
    match err {
        EmbedError::ShapeMismatch { name, expected, actual } => {
            assert_eq!(name, "A");
            assert_eq!((expected.rows, expected.cols), (6, 6));
            assert_eq!((actual.rows, actual.cols), (5, 5));
        }
        other => panic!("expected ShapeMismatch, got {:?}", other),
    }
    assert!(!ws.has_pending());

    let second = ws.solve(&opts).unwrap();
    assert_eq!(ws.data_generation(), generation);
    assert_eq!(second.status, first.outcome.status);
    assert_eq!(second.objective().to_bits(), first.outcome.objective().to_bits());
}

#[test]
fn test_repeat_solve_is_reproducible_without_warm_start() {
    let mut ws = mpc_workspace(10, 6, 3);
    let data = double_integrator(6, 3).unwrap();
    let opts = SolveOptions::embedded().with_warm_start(false);

    let a = embedded_solve(&mut ws, &data.values(), &opts).unwrap();
    let b = embedded_solve(&mut ws, &data.values(), &opts).unwrap();
    assert_eq!(a.outcome.status, b.outcome.status);
    assert_eq!(a.outcome.objective().to_bits(), b.outcome.objective().to_bits());
    assert_eq!(a.outcome.iterations(), b.outcome.iterations());
    assert_eq!(a.variables, b.variables);
    assert!(!b.outcome.info.warm_started);
}

#[test]
fn test_closed_loop_warm_starts() {
    let mut ws = mpc_workspace(10, 6, 3);
    let mut data = double_integrator(6, 3).unwrap();
    let opts = SolveOptions::embedded();

    let mut x = data.x_init.clone();
    for step in 0..8 {
        data.x_init = x.clone();
        let params =
            ParameterValues::new().with("x_init", ArrayView::vector(data.x_init.as_slice()));
        let sol = if step == 0 {
            embedded_solve(&mut ws, &data.values(), &opts).unwrap()
        } else {
            embedded_solve(&mut ws, &params, &opts).unwrap()
        };
        assert!(sol.status().is_optimal(), "step {}: {}", step, sol.outcome);
        assert_eq!(sol.outcome.info.warm_started, step > 0);

        let u0 = DVector::from_column_slice(sol.variable("U").unwrap().column(0));
        x = &data.a * &x + &data.b * u0;
    }
    // The third axis starts moving away from the origin and must be braked.
    assert!(x[5] < 1.0, "velocity {}", x[5]);
}

#[test]
fn test_vector_only_update_skips_refactor() {
    let mut ws = mpc_workspace(10, 6, 3);
    let data = double_integrator(6, 3).unwrap();
    let opts = SolveOptions::embedded().with_adaptive_rho(false);
    embedded_solve(&mut ws, &data.values(), &opts).unwrap();

    let x0 = [1.0, 0.0, -1.0, 0.5, 0.0, 0.0];
    let params = ParameterValues::new().with("x_init", ArrayView::vector(&x0));
    let sol = embedded_solve(&mut ws, &params, &opts).unwrap();
    assert!(sol.status().is_optimal());
    assert_eq!(sol.outcome.info.factorizations, 0);

    // A dynamics change rescales and refactors.
    let params = ParameterValues::new().with("A", ArrayView::matrix(6, 6, data.a.as_slice()));
    let sol = embedded_solve(&mut ws, &params, &opts).unwrap();
    assert!(sol.outcome.info.factorizations >= 1);
}

#[test]
fn test_breakdown_is_solver_error_and_recoverable() {
    let mut ws = mpc_workspace(4, 2, 1);
    let data = double_integrator(2, 1).unwrap();
    let nnz = ws.template().p.nnz();

    ws.set_values(CanonicalArray::P, &vec![-2.0; nnz]).unwrap();
    let err = embedded_solve(&mut ws, &data.values(), &SolveOptions::embedded()).unwrap_err();
    assert!(matches!(err, EmbedError::SolverError(ref msg) if msg.contains("non-convex")));
    assert_eq!(ws.outcome().unwrap().status, SolveStatus::Error);
    assert!(ws.extract("X").unwrap().data.iter().all(|v| v.is_nan()));

    ws.set_values(CanonicalArray::P, &vec![2.0; nnz]).unwrap();
    let sol = embedded_solve(&mut ws, &data.values(), &SolveOptions::embedded()).unwrap();
    assert_eq!(sol.status(), SolveStatus::Optimal);
}

#[test]
fn test_time_limit_is_honored() {
    let mut ws = mpc_workspace(10, 6, 3);
    let data = double_integrator(6, 3).unwrap();
    let opts = SolveOptions::embedded()
        .with_tolerance(1e-14, 1e-14)
        .with_max_iter(usize::MAX)
        .with_time_limit_ms(1);
    let sol = embedded_solve(&mut ws, &data.values(), &opts).unwrap();
    assert_eq!(sol.status(), SolveStatus::TimeLimitReached);
    assert!(sol.outcome.iterations() >= 1);
    assert!(sol.outcome.solve_time() < 1.0);
}

#[test]
fn test_equality_qp_matches_dense_kkt() {
    // min ½xᵀPx + qᵀx  s.t. Ax = b, checked against the dense KKT solution.
    let n = 5;
    let m = 2;
    let mdat = DMatrix::<f64>::from_fn(n, n, |i, j| ((i * 7 + j * 3) % 5) as f64 - 2.0);
    let p_dense = mdat.transpose() * &mdat + DMatrix::identity(n, n);
    let a_dense = DMatrix::<f64>::from_row_slice(
        m,
        n,
        &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, -1.0, 0.0, 2.0, 0.0],
    );
    let q = DVector::from_column_slice(&[1.0, -2.0, 0.5, 0.0, 3.0]);
    let b = DVector::from_column_slice(&[1.0, -0.5]);

    let mut kkt = DMatrix::<f64>::zeros(n + m, n + m);
    kkt.view_mut((0, 0), (n, n)).copy_from(&p_dense);
    kkt.view_mut((0, n), (n, m)).copy_from(&a_dense.transpose());
    kkt.view_mut((n, 0), (m, n)).copy_from(&a_dense);
    let mut rhs = DVector::<f64>::zeros(n + m);
    rhs.rows_mut(0, n).copy_from(&(-&q));
    rhs.rows_mut(n, m).copy_from(&b);
    let exact = kkt.lu().solve(&rhs).expect("nonsingular KKT");

    let triplets = |mat: &DMatrix<f64>| {
        let mut t = Vec::new();
        for j in 0..mat.ncols() {
            for i in 0..mat.nrows() {
                if mat[(i, j)] != 0.0 {
                    t.push((i, j, mat[(i, j)]));
                }
            }
        }
        t
    };
    let p = sparse::from_triplets(n, n, triplets(&p_dense));
    let a = sparse::from_triplets(m, n, triplets(&a_dense));
    let template =
        CanonicalTemplate::from_qp(&p, q.as_slice(), &a, b.as_slice(), b.as_slice()).unwrap();
    let mut ws = Workspace::initialize(template).unwrap();
    let outcome = ws.solve(&SolveOptions::reference()).unwrap();
    assert_eq!(outcome.status, SolveStatus::Optimal);

    let x = ws.extract("x").unwrap();
    for i in 0..n {
        assert!(
            (x.data[i] - exact[i]).abs() < 1e-4,
            "x[{}] = {} vs {}",
            i,
            x.data[i],
            exact[i]
        );
    }
    // OSQP sign convention: Px + q + Aᵀy = 0, same as the KKT system above.
    let y = ws.extract_dual("c").unwrap();
    for i in 0..m {
        assert!((y.data[i] - exact[n + i]).abs() < 1e-3);
    }
}

#[test]
fn test_inequality_qp_matches_analytic_optimum() {
    // min ½‖x‖² - cᵀx, c = (0.5, 2), s.t. x0 + x1 <= 1, x >= 0.
    // Projecting c onto that set gives x* = (0, 1) with multipliers
    // y = (1, -0.5, 0) and f* = ½ - 2.
    let p = sparse::identity(2);
    let a = sparse::from_triplets(3, 2, vec![(0, 0, 1.0), (0, 1, 1.0), (1, 0, 1.0), (2, 1, 1.0)]);
    let template = CanonicalTemplate::from_qp(
        &p,
        &[-0.5, -2.0],
        &a,
        &[f64::NEG_INFINITY, 0.0, 0.0],
        &[1.0, f64::INFINITY, f64::INFINITY],
    )
    .unwrap();
    let mut ws = Workspace::initialize(template).unwrap();

    let outcome = ws.solve(&SolveOptions::reference()).unwrap();
    assert_eq!(outcome.status, SolveStatus::Optimal);
    assert!((outcome.objective() + 1.5).abs() < 1e-5, "f = {}", outcome.objective());
    let x = ws.extract("x").unwrap();
    assert!(x.data[0].abs() < 1e-5, "x0 = {}", x.data[0]);
    assert!((x.data[1] - 1.0).abs() < 1e-5, "x1 = {}", x.data[1]);
    let y = ws.extract_dual("c").unwrap();
    for (got, want) in y.data.iter().zip([1.0, -0.5, 0.0]) {
        assert!((got - want).abs() < 1e-4, "y = {:?}", y.data);
    }

    // The loose preset lands within its own tolerance of the same point.
    let mut ws = Workspace::initialize(
        CanonicalTemplate::from_qp(
            &p,
            &[-0.5, -2.0],
            &a,
            &[f64::NEG_INFINITY, 0.0, 0.0],
            &[1.0, f64::INFINITY, f64::INFINITY],
        )
        .unwrap(),
    )
    .unwrap();
    let outcome = ws.solve(&SolveOptions::embedded()).unwrap();
    assert!(outcome.status.is_optimal());
    let x = ws.extract("x").unwrap();
    assert!(x.data[0].abs() < 1e-2 && (x.data[1] - 1.0).abs() < 1e-2);
}

#[test]
fn test_template_json_round_trip() {
    let template = MpcTemplate::build(5, 4, 2).unwrap();
    let json = template.to_json().unwrap();
    let restored = CanonicalTemplate::from_json(&json).unwrap();
    assert_eq!(restored, template);

    let data = double_integrator(4, 2).unwrap();
    let mut a = Workspace::initialize(template).unwrap();
    let mut b = Workspace::from_json(&json).unwrap();
    let opts = SolveOptions::embedded();
    let sa = embedded_solve(&mut a, &data.values(), &opts).unwrap();
    let sb = embedded_solve(&mut b, &data.values(), &opts).unwrap();
    assert_eq!(sa.outcome.objective().to_bits(), sb.outcome.objective().to_bits());
}

#[test]
fn test_mpc_data_views_cover_every_parameter() {
    let ws = mpc_workspace(3, 4, 2);
    let data: MpcData = double_integrator(4, 2).unwrap();
    let values = data.values();
    let mut names: Vec<&str> = values.as_slice().iter().map(|(n, _)| *n).collect();
    names.sort_unstable();
    let mut expected: Vec<&str> = ws.parameter_names().collect();
    expected.sort_unstable();
    assert_eq!(names, expected);
}
