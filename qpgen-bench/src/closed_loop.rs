//! Closed-loop MPC run: solve, apply the first input, step the plant,
//! re-solve from the new state.

use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, info};
use qpgen_core::mpc::{double_integrator, MpcData, MpcTemplate};
use qpgen_core::{ArrayView, SolveOptions, Workspace};
use serde::{Deserialize, Serialize};

use crate::stats::{compute_summary, SolveRecord, Summary};

/// Full report of one closed-loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedLoopReport {
    pub horizon: usize,
    pub states: usize,
    pub inputs: usize,
    pub steps: usize,
    pub options: SolveOptions,
    /// Template build and workspace initialization.
    pub init_time_ms: f64,
    pub summary: Summary,
    pub records: Vec<SolveRecord>,
    /// ‖x‖∞ after each step.
    pub state_norms: Vec<f64>,
}

/// x ← A x + B u with column-major nalgebra storage.
fn plant_step(data: &MpcData, u: &[f64], x: &mut [f64]) {
    let n = x.len();
    let next: Vec<f64> = (0..n)
        .map(|i| {
            let ax: f64 = (0..n).map(|j| data.a[(i, j)] * x[j]).sum();
            let bu: f64 = u.iter().enumerate().map(|(k, uk)| data.b[(i, k)] * uk).sum();
            ax + bu
        })
        .collect();
    x.copy_from_slice(&next);
}

pub fn run_closed_loop(
    horizon: usize,
    states: usize,
    inputs: usize,
    steps: usize,
    opts: &SolveOptions,
) -> Result<ClosedLoopReport> {
    let data = double_integrator(states, inputs).context("Failed to build example data")?;

    let start = Instant::now();
    let template = MpcTemplate::build(horizon, states, inputs)?;
    let mut ws = Workspace::initialize(template)?;
    let init_time_ms = start.elapsed().as_secs_f64() * 1e3;
    info!(
        "MPC workspace H={} n={} m={}: {} variables, {} constraints, KKT nnz {:?}",
        horizon,
        states,
        inputs,
        ws.num_vars(),
        ws.num_constraints(),
        ws.kkt_nnz()
    );

    // Constant parameters once; only x_init changes inside the loop.
    ws.update_many(data.values().as_slice())?;

    let mut x = data.x_init.as_slice().to_vec();
    let mut u = vec![0.0; inputs * horizon];
    let mut records = Vec::with_capacity(steps);
    let mut state_norms = Vec::with_capacity(steps);

    for step in 0..steps {
        ws.update("x_init", ArrayView::vector(&x))?;
        let outcome = ws.solve(opts)?;
        debug!("step {}: {}", step, outcome);
        records.push(SolveRecord::new(step, &outcome));

        if outcome.status.has_solution() {
            ws.extract_into("U", &mut u)?;
        } else {
            u.fill(0.0);
        }
        plant_step(&data, &u[..inputs], &mut x);
        state_norms.push(x.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())));
    }

    Ok(ClosedLoopReport {
        horizon,
        states,
        inputs,
        steps,
        options: opts.clone(),
        init_time_ms,
        summary: compute_summary(&records),
        records,
        state_norms,
    })
}
