//! Embedded vs reference settings on the same sequence of MPC instances.

use anyhow::{Context, Result};
use log::{info, warn};
use qpgen_core::mpc::{double_integrator, MpcTemplate};
use qpgen_core::{ArrayView, SolveOptions, SolveStatus, Workspace};
use serde::{Deserialize, Serialize};

use crate::stats::{compute_summary, SolveRecord, Summary};

/// One sampled initial state solved both ways.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleResult {
    pub sample: usize,
    pub x_init: Vec<f64>,
    pub embedded_status: SolveStatus,
    pub reference_status: SolveStatus,
    /// ‖U_emb - U_ref‖∞ / max(1, ‖U_ref‖∞).
    pub input_rel_error: f64,
    /// |f_emb - f_ref| / max(1, |f_ref|).
    pub objective_rel_gap: f64,
    pub embedded_time_ms: f64,
    pub reference_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub horizon: usize,
    pub states: usize,
    pub inputs: usize,
    pub tolerance: f64,
    pub embedded: Summary,
    pub reference: Summary,
    pub max_input_rel_error: f64,
    pub mean_input_rel_error: f64,
    /// Reference geometric mean time over embedded.
    pub speedup: f64,
    pub passed: bool,
    pub samples: Vec<SampleResult>,
}

/// Deterministic initial states in [-2, 2].
fn sample_states(states: usize, samples: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng_state = seed;
    let mut rand = || -> f64 {
        rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((rng_state >> 33) as f64) / (u32::MAX as f64)
    };
    (0..samples)
        .map(|_| (0..states).map(|_| 4.0 * rand() - 2.0).collect())
        .collect()
}

fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |acc, x| acc.max(x.abs()))
}

fn rel_error(got: &[f64], want: &[f64]) -> f64 {
    let diff = got
        .iter()
        .zip(want)
        .fold(0.0_f64, |acc, (a, b)| acc.max((a - b).abs()));
    diff / inf_norm(want).max(1.0)
}

fn mpc_workspace(horizon: usize, states: usize, inputs: usize) -> Result<Workspace> {
    let template = MpcTemplate::build(horizon, states, inputs)?;
    let mut ws = Workspace::initialize(template)?;
    let data = double_integrator(states, inputs)?;
    ws.update_many(data.values().as_slice())?;
    Ok(ws)
}

#[allow(clippy::too_many_arguments)]
pub fn run_comparison(
    horizon: usize,
    states: usize,
    inputs: usize,
    samples: usize,
    seed: u64,
    tolerance: f64,
    embedded: &SolveOptions,
    reference: &SolveOptions,
) -> Result<ComparisonReport> {
    let mut emb_ws = mpc_workspace(horizon, states, inputs).context("embedded workspace")?;
    let mut ref_ws = mpc_workspace(horizon, states, inputs).context("reference workspace")?;

    let mut u_emb = vec![0.0; inputs * horizon];
    let mut u_ref = vec![0.0; inputs * horizon];
    let mut results = Vec::with_capacity(samples);
    let mut emb_records = Vec::with_capacity(samples);
    let mut ref_records = Vec::with_capacity(samples);

    for (sample, x_init) in sample_states(states, samples, seed).into_iter().enumerate() {
        emb_ws.update("x_init", ArrayView::vector(&x_init))?;
        ref_ws.update("x_init", ArrayView::vector(&x_init))?;
        let emb = emb_ws.solve(embedded)?;
        let reference_outcome = ref_ws.solve(reference)?;
        emb_records.push(SolveRecord::new(sample, &emb));
        ref_records.push(SolveRecord::new(sample, &reference_outcome));

        let (input_rel_error, objective_rel_gap) =
            if emb.status.has_solution() && reference_outcome.status.has_solution() {
                emb_ws.extract_into("U", &mut u_emb)?;
                ref_ws.extract_into("U", &mut u_ref)?;
                let f_ref = reference_outcome.objective();
                (
                    rel_error(&u_emb, &u_ref),
                    (emb.objective() - f_ref).abs() / f_ref.abs().max(1.0),
                )
            } else {
                warn!(
                    "sample {}: embedded {} / reference {}",
                    sample, emb.status, reference_outcome.status
                );
                (f64::NAN, f64::NAN)
            };

        results.push(SampleResult {
            sample,
            x_init,
            embedded_status: emb.status,
            reference_status: reference_outcome.status,
            input_rel_error,
            objective_rel_gap,
            embedded_time_ms: emb.solve_time() * 1e3,
            reference_time_ms: reference_outcome.solve_time() * 1e3,
        });
    }

    let errors: Vec<f64> = results
        .iter()
        .map(|r| r.input_rel_error)
        .filter(|e| e.is_finite())
        .collect();
    let max_input_rel_error = errors.iter().copied().fold(0.0_f64, f64::max);
    let mean_input_rel_error = if errors.is_empty() {
        f64::NAN
    } else {
        errors.iter().sum::<f64>() / errors.len() as f64
    };

    let embedded_summary = compute_summary(&emb_records);
    let reference_summary = compute_summary(&ref_records);
    let speedup = if embedded_summary.geom_mean_time_ms > 0.0 {
        reference_summary.geom_mean_time_ms / embedded_summary.geom_mean_time_ms
    } else {
        f64::NAN
    };
    let passed = errors.len() == results.len() && max_input_rel_error <= tolerance;
    info!(
        "compared {} samples: max rel error {:.2e}, passed {}",
        results.len(),
        max_input_rel_error,
        passed
    );

    Ok(ComparisonReport {
        horizon,
        states,
        inputs,
        tolerance,
        embedded: embedded_summary,
        reference: reference_summary,
        max_input_rel_error,
        mean_input_rel_error,
        speedup,
        passed,
        samples: results,
    })
}

impl ComparisonReport {
    pub fn print_summary(&self) {
        self.embedded.print("Embedded preset");
        self.reference.print("Reference preset");

        println!("\n{}", "=".repeat(60));
        println!("Embedded vs Reference (H={}, n={}, m={})", self.horizon, self.states, self.inputs);
        println!("{}", "=".repeat(60));
        println!(
            "{:<8} {:>12} {:>12} {:>12} {:>12}",
            "Sample", "Rel err U", "Obj gap", "Emb ms", "Ref ms"
        );
        println!("{}", "-".repeat(60));
        for r in &self.samples {
            println!(
                "{:<8} {:>12.2e} {:>12.2e} {:>12.3} {:>12.3}",
                r.sample, r.input_rel_error, r.objective_rel_gap, r.embedded_time_ms, r.reference_time_ms
            );
        }
        println!("{}", "-".repeat(60));
        println!(
            "Max rel error:    {:.2e} (tolerance {:.1e}) {}",
            self.max_input_rel_error,
            self.tolerance,
            if self.passed { "PASS" } else { "FAIL" }
        );
        println!("Mean rel error:   {:.2e}", self.mean_input_rel_error);
        println!("Speedup:          {:.2}x", self.speedup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_are_deterministic_and_bounded() {
        let a = sample_states(6, 4, 7);
        let b = sample_states(6, 4, 7);
        assert_eq!(a, b);
        assert!(a.iter().flatten().all(|v| (-2.0..=2.0).contains(v)));
        assert_ne!(sample_states(6, 4, 8), a);
    }

    #[test]
    fn test_rel_error_floor() {
        assert_eq!(rel_error(&[0.5], &[0.0]), 0.5);
        assert_eq!(rel_error(&[4.0, 1.0], &[2.0, 1.0]), 1.0);
    }

    #[test]
    fn test_embedded_matches_reference() {
        let report = run_comparison(
            10,
            4,
            2,
            5,
            42,
            1e-2,
            &SolveOptions::embedded(),
            &SolveOptions::reference(),
        )
        .unwrap();
        assert_eq!(report.samples.len(), 5);
        assert_eq!(report.reference.solved, 5);
        assert!(report.passed, "max rel error {}", report.max_input_rel_error);
    }
}
