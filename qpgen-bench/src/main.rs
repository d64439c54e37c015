//! Benchmark CLI for qpgen embedded workspaces.
//!
//! Usage:
//!   qpgen-bench run --horizon 10 --states 6 --inputs 3 --steps 200
//!   qpgen-bench compare --samples 50 --json compare.json
//!   qpgen-bench export mpc.json --horizon 20

mod closed_loop;
mod comparison;
mod preset;
mod stats;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use qpgen_core::mpc::MpcTemplate;

use crate::preset::{options_for, Preset};

#[derive(Parser)]
#[command(about = "Benchmark and comparison CLI for qpgen embedded solves")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Copy)]
struct MpcDims {
    /// Prediction horizon
    #[arg(long, default_value_t = 10)]
    horizon: usize,

    /// State dimension (2 × inputs for the double integrator)
    #[arg(long, default_value_t = 6)]
    states: usize,

    /// Input dimension
    #[arg(long, default_value_t = 3)]
    inputs: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Closed-loop MPC: re-solve from each new state
    Run {
        #[command(flatten)]
        dims: MpcDims,

        /// Closed-loop steps
        #[arg(long, default_value_t = 100)]
        steps: usize,

        /// Option preset
        #[arg(long, value_enum, default_value = "embedded")]
        preset: Preset,

        /// Override the iteration cap
        #[arg(long)]
        max_iter: Option<usize>,

        /// Log a line per solve
        #[arg(long)]
        verbose: bool,

        /// Write the full report here
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Embedded vs reference presets on sampled initial states
    Compare {
        #[command(flatten)]
        dims: MpcDims,

        /// Number of sampled initial states
        #[arg(long, default_value_t = 20)]
        samples: usize,

        /// Sampling seed
        #[arg(long, default_value_t = 12345)]
        seed: u64,

        /// Maximum relative error of U accepted
        #[arg(long, default_value_t = 1e-2)]
        tolerance: f64,

        /// Write the full report here
        #[arg(long)]
        json: Option<PathBuf>,

        /// Exit non-zero when the tolerance is exceeded
        #[arg(long)]
        strict: bool,
    },

    /// Write the MPC canonical template as JSON
    Export {
        /// Output path
        output: PathBuf,

        #[command(flatten)]
        dims: MpcDims,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            dims,
            steps,
            preset,
            max_iter,
            verbose,
            json,
        } => {
            let opts = options_for(preset, max_iter, verbose);
            opts.validate()?;
            opts.log_summary();
            let report =
                closed_loop::run_closed_loop(dims.horizon, dims.states, dims.inputs, steps, &opts)?;
            report.summary.print(&format!(
                "Closed loop {:?} (H={}, n={}, m={}, {} steps)",
                preset, dims.horizon, dims.states, dims.inputs, steps
            ));
            if let Some(last) = report.state_norms.last() {
                println!("Final ‖x‖∞:       {:.4e}", last);
            }
            if let Some(path) = json {
                stats::save_json(&report, &path)?;
                info!("wrote {}", path.display());
            }
        }

        Command::Compare {
            dims,
            samples,
            seed,
            tolerance,
            json,
            strict,
        } => {
            let embedded = options_for(Preset::Embedded, None, false);
            let reference = options_for(Preset::Reference, None, false);
            let report = comparison::run_comparison(
                dims.horizon,
                dims.states,
                dims.inputs,
                samples,
                seed,
                tolerance,
                &embedded,
                &reference,
            )?;
            report.print_summary();
            if let Some(path) = json {
                stats::save_json(&report, &path)?;
                info!("wrote {}", path.display());
            }
            if strict && !report.passed {
                bail!(
                    "embedded solution deviates from reference by {:.2e} (> {:.1e})",
                    report.max_input_rel_error,
                    tolerance
                );
            }
        }

        Command::Export { output, dims } => {
            let template = MpcTemplate::build(dims.horizon, dims.states, dims.inputs)?;
            template
                .save(&output)
                .with_context(|| format!("Failed to write template to {}", output.display()))?;
            println!(
                "Wrote {} ({} variables, {} constraints, {} parameters)",
                output.display(),
                template.num_vars,
                template.num_constraints,
                template.parameters.len()
            );
        }
    }

    Ok(())
}
