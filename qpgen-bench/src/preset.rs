use clap::ValueEnum;
use qpgen_core::SolveOptions;

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum Preset {
    /// Loose tolerances, warm start, no polishing.
    Embedded,
    /// Tight tolerances, cold start, polishing.
    Reference,
    /// Embedded preset with QPGEN_* environment overrides.
    Env,
}

pub fn options_for(preset: Preset, max_iter: Option<usize>, verbose: bool) -> SolveOptions {
    let mut opts = match preset {
        Preset::Embedded => SolveOptions::embedded(),
        Preset::Reference => SolveOptions::reference(),
        Preset::Env => SolveOptions::default(),
    };
    if let Some(max_iter) = max_iter {
        opts.max_iter = max_iter;
    }
    opts.verbose = verbose;
    opts
}
