//! Per-solve records and summary statistics shared by the subcommands.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use qpgen_core::{SolveOutcome, SolveStatus};
use serde::{Deserialize, Serialize};

/// One solve as seen by the benchmark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveRecord {
    pub step: usize,
    pub status: SolveStatus,
    pub iterations: usize,
    pub objective: f64,
    pub setup_time_ms: f64,
    pub solve_time_ms: f64,
    pub factorizations: usize,
    pub warm_started: bool,
}

impl SolveRecord {
    pub fn new(step: usize, outcome: &SolveOutcome) -> Self {
        Self {
            step,
            status: outcome.status,
            iterations: outcome.info.iterations,
            objective: outcome.info.objective,
            setup_time_ms: outcome.info.setup_time * 1e3,
            solve_time_ms: outcome.info.solve_time * 1e3,
            factorizations: outcome.info.factorizations,
            warm_started: outcome.info.warm_started,
        }
    }
}

/// Aggregate over a series of solves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    /// Optimal or optimal-inaccurate solves.
    pub solved: usize,
    /// Count per status name.
    pub statuses: BTreeMap<String, usize>,
    pub mean_iterations: f64,
    pub max_iterations: usize,
    pub total_factorizations: usize,
    /// Shifted geometric mean of solve times (1 ms shift).
    pub geom_mean_time_ms: f64,
    pub p50_time_ms: f64,
    pub p95_time_ms: f64,
    pub max_time_ms: f64,
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

pub fn compute_summary(records: &[SolveRecord]) -> Summary {
    let total = records.len();
    if total == 0 {
        return Summary::default();
    }

    let mut statuses = BTreeMap::new();
    let mut solved = 0;
    let mut iter_sum = 0usize;
    let mut max_iterations = 0;
    let mut total_factorizations = 0;
    let mut log_sum = 0.0;
    let mut times = Vec::with_capacity(total);

    for r in records {
        *statuses.entry(r.status.to_string()).or_insert(0) += 1;
        if r.status.is_optimal() {
            solved += 1;
        }
        iter_sum += r.iterations;
        max_iterations = max_iterations.max(r.iterations);
        total_factorizations += r.factorizations;
        log_sum += (r.solve_time_ms + 1.0).ln();
        times.push(r.solve_time_ms);
    }
    times.sort_by(|a, b| a.total_cmp(b));

    Summary {
        total,
        solved,
        statuses,
        mean_iterations: iter_sum as f64 / total as f64,
        max_iterations,
        total_factorizations,
        geom_mean_time_ms: (log_sum / total as f64).exp() - 1.0,
        p50_time_ms: percentile(&times, 50.0),
        p95_time_ms: percentile(&times, 95.0),
        max_time_ms: times[total - 1],
    }
}

impl Summary {
    pub fn print(&self, title: &str) {
        println!("\n{}", "=".repeat(60));
        println!("{}", title);
        println!("{}", "=".repeat(60));
        println!("Solves:           {} ({} solved)", self.total, self.solved);
        for (status, count) in &self.statuses {
            println!("  {:<22} {}", status, count);
        }
        println!(
            "Iterations:       mean {:.1}, max {}",
            self.mean_iterations, self.max_iterations
        );
        println!("Factorizations:   {}", self.total_factorizations);
        println!(
            "Solve time:       p50 {:.3} ms, p95 {:.3} ms, max {:.3} ms",
            self.p50_time_ms, self.p95_time_ms, self.max_time_ms
        );
        println!("Geom mean time:   {:.3} ms", self.geom_mean_time_ms);
    }
}

/// Write any report as pretty JSON.
pub fn save_json<T: Serialize, P: AsRef<Path>>(report: &T, path: P) -> Result<()> {
    let file = File::create(path.as_ref())
        .with_context(|| format!("Failed to create file {}", path.as_ref().display()))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, report)
        .with_context(|| format!("Failed to write JSON to {}", path.as_ref().display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: SolveStatus, iterations: usize, ms: f64) -> SolveRecord {
        SolveRecord {
            step: 0,
            status,
            iterations,
            objective: 0.0,
            setup_time_ms: 0.0,
            solve_time_ms: ms,
            factorizations: 1,
            warm_started: false,
        }
    }

    #[test]
    fn test_summary_counts_and_percentiles() {
        let records: Vec<_> = (1..=20)
            .map(|i| record(SolveStatus::Optimal, i * 10, i as f64))
            .chain(std::iter::once(record(SolveStatus::MaxIterationsReached, 4000, 50.0)))
            .collect();
        let s = compute_summary(&records);
        assert_eq!(s.total, 21);
        assert_eq!(s.solved, 20);
        assert_eq!(s.statuses["maximum iterations reached"], 1);
        assert_eq!(s.max_iterations, 4000);
        assert_eq!(s.total_factorizations, 21);
        assert_eq!(s.p50_time_ms, 11.0);
        assert_eq!(s.max_time_ms, 50.0);
        assert!(s.geom_mean_time_ms > 1.0 && s.geom_mean_time_ms < 50.0);
    }

    #[test]
    fn test_empty_summary() {
        let s = compute_summary(&[]);
        assert_eq!(s.total, 0);
        assert_eq!(s.p95_time_ms, 0.0);
    }
}
