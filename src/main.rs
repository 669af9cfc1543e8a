//! calc-eff: tag-and-probe efficiency measurement
//!
//!
//! # Introduction (for the physicist)
//!
//! Electron efficiencies (supercluster reconstruction, identification,
//! trigger) are measured on Z⁰ → e⁺e⁻ events: one electron, the tag, passes
//! tight requirements, while the other one, the probe, is tested against the
//! selection under study. The fraction of probes which pass the selection is
//! the efficiency.
//!
//! Probes are binned in transverse energy and pseudorapidity, and optionally
//! in pileup. Since the probe sample is contaminated by non-resonant
//! background, the number of passing and failing probes can be extracted from
//! fits to the tag-probe invariant mass spectra rather than by plain
//! counting. Fits of collision data use mass templates from simulation as
//! the signal shape.
//!
//!
//! # Introduction (for the numerical guy)
//!
//! Counting efficiencies come with Clopper-Pearson confidence intervals.
//! Fits are binned Poisson maximum likelihood fits, minimized with L-BFGS,
//! with uncertainties taken from the inverse Hessian of the likelihood.
//!
//!
//! # Introduction (for the computer guy)
//!
//! The program is a pipeline:
//!
//! * read in the configuration and command-line options
//! * stream the passing and failing probes into per-bin mass histograms
//! * save (simulation) or load (data) the mass templates
//! * extract the efficiency of every bin
//! * display and store the results.
//!
//! Histogram accumulation and per-bin fits are parallelized when the
//! `multi-threading` feature is enabled, without changing the results.

#![warn(missing_docs)]

mod binning;
mod config;
mod error;
mod estimator;
mod evcut;
mod histogram;
mod minimizer;
mod numeric;
mod output;
mod pipeline;
mod probe;
mod random;
mod resacc;
mod resfin;
mod scheduling;
mod shapes;
mod templates;

use crate::{
    config::{Args, Configuration, RunOptions},
    pipeline::ProbeInputs,
};
use clap::Parser;
use eyre::WrapErr;

/// We'll use eyre's type-erased result type throughout the application
type Result<T> = eyre::Result<T>;

/// This will act as our main function, with suitable error handling
fn main() -> Result<()> {
    // Log at info level unless told otherwise through RUST_LOG
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // ### CONFIGURATION READOUT ###

    let args = Args::parse();
    let cfg = Configuration::load(&args.config_file, RunOptions::from(&args))
        .wrap_err("Failed to load the configuration")?;
    let inputs = ProbeInputs::resolve(
        &cfg,
        &args.output_root,
        args.pass_probes.clone(),
        args.fail_probes.clone(),
    );

    // ### MEASUREMENT ###

    pipeline::run(&cfg, &inputs, &args.output_root)
        .wrap_err_with(|| format!("Failed to measure the {} efficiency", cfg.eff_kind))?;

    // ...and we're done
    Ok(())
}
