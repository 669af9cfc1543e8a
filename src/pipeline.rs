//! Orchestration of a measurement, from the selected probe streams to the
//! written reports

use crate::{
    binning::{KinematicBin, PileupStratum},
    config::{Configuration, SampleType},
    error::{Error, Result},
    estimator::{self, EfficiencyResult, EstimationInput, Estimator, StratumResult},
    histogram::MassHistogram,
    output,
    probe::{ProbeOutcome, ProbeReader, ProbeRecord},
    resacc::{ProbeAccumulator, SampleHistograms},
    resfin::{EfficiencyGrid, FinalResults},
    scheduling,
    templates::{TemplateKey, TemplateStore},
};
use log::{info, warn};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Instant,
};

/// Locations of the passing and failing probe streams
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeInputs {
    /// Passing probes
    pub pass: PathBuf,

    /// Failing probes
    pub fail: PathBuf,
}
//
impl ProbeInputs {
    /// Use the given files, or the default locations derived from the
    /// configuration
    pub fn resolve(
        cfg: &Configuration,
        root: &Path,
        pass: Option<PathBuf>,
        fail: Option<PathBuf>,
    ) -> Self {
        Self {
            pass: pass.unwrap_or_else(|| cfg.default_probe_file(root, ProbeOutcome::Pass)),
            fail: fail.unwrap_or_else(|| cfg.default_probe_file(root, ProbeOutcome::Fail)),
        }
    }

    /// Read the passing probes, then the failing ones
    ///
    /// Both files are opened upfront, so that a missing one is reported
    /// before any work is done.
    ///
    pub fn open(&self) -> Result<impl Iterator<Item = Result<ProbeRecord>>> {
        let pass = ProbeReader::open(&self.pass, ProbeOutcome::Pass)?;
        let fail = ProbeReader::open(&self.fail, ProbeOutcome::Fail)?;
        Ok(pass.chain(fail))
    }
}

/// Accumulate a probe stream into the per-bin histograms of a sample
pub fn aggregate(
    cfg: &Configuration,
    probes: impl Iterator<Item = Result<ProbeRecord>>,
) -> Result<SampleHistograms> {
    let accumulator = scheduling::accumulate_probes(probes, || ProbeAccumulator::new(cfg))?;
    Ok(accumulator.finalize())
}

/// Templates of every measurement cell, looked up before any fit is run
pub struct ResolvedTemplates<'store> {
    /// Pass and fail templates, by pileup slot then flat bin index
    slots: Vec<Vec<(&'store MassHistogram, &'store MassHistogram)>>,
}
//
impl<'store> ResolvedTemplates<'store> {
    /// Look up the templates of every cell that the configuration measures
    ///
    /// Any missing template aborts the measurement, as does a template with
    /// another mass window than the one of the measurement.
    ///
    pub fn resolve(cfg: &Configuration, store: &'store TemplateStore) -> Result<Self> {
        let slots = cfg
            .pileup
            .strata()
            .map(|stratum| {
                cfg.binning
                    .bins()
                    .map(|bin| {
                        let key = TemplateKey { stratum, bin };
                        let (pass, fail) = store.load(key)?;
                        for template in [pass, fail] {
                            if !template.axis().same_window(&cfg.mass_axis) {
                                return Err(Error::Input(format!(
                                    "template for {key} covers {}-{} GeV instead of {}-{} GeV",
                                    template.axis().low,
                                    template.axis().high,
                                    cfg.mass_axis.low,
                                    cfg.mass_axis.high
                                )));
                            }
                        }
                        Ok((pass, fail))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { slots })
    }

    fn get(&self, slot: usize, flat: usize) -> (&'store MassHistogram, &'store MassHistogram) {
        self.slots[slot][flat]
    }
}

/// Measure the efficiency of every cell of a sample
pub fn measure(
    cfg: &Configuration,
    sample: &SampleHistograms,
    templates: Option<&ResolvedTemplates>,
) -> Result<FinalResults> {
    let estimator = Estimator::new(cfg.calc_method, &cfg.fit, &[cfg.mass_axis, cfg.template_axis]);
    let binning = sample.binning;

    // This kernel measures one (Et, eta) cell, stratum by stratum if needed
    let measure_cell = |flat: usize| -> Result<EfficiencyResult> {
        let bin = binning.bin_from_flat(flat);
        if !cfg.pileup.is_dependent() {
            let histograms = sample.bin(bin);
            return Ok(estimator.estimate(&EstimationInput {
                bin,
                stratum: PileupStratum::Combined,
                pass: &histograms.pass,
                fail: &histograms.fail,
                templates: templates.map(|templates| templates.get(0, flat)),
            }));
        }
        let strata = cfg
            .pileup
            .strata()
            .enumerate()
            .map(|(slot, stratum)| {
                let histograms = sample
                    .stratum_bin(stratum, bin)
                    .ok_or_else(|| missing_stratum(stratum, bin))?;
                let result = estimator.estimate(&EstimationInput {
                    bin,
                    stratum,
                    pass: &histograms.pass,
                    fail: &histograms.fail,
                    templates: templates.map(|templates| templates.get(slot, flat)),
                });
                Ok(StratumResult { stratum, result })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut combined = estimator::combine_strata(cfg.calc_method, strata);

        // The inclusive histograms also hold the probes of no pileup bin
        let inclusive = sample.bin(bin);
        combined.pileup_excluded = (
            (inclusive.pass.integral() - combined.n_pass).max(0.),
            (inclusive.fail.integral() - combined.n_fail).max(0.),
        );
        Ok(combined)
    };

    let mut grid = EfficiencyGrid::new(binning);
    let cells = scheduling::map_cells(binning.count(), measure_cell);
    for (flat, result) in cells.into_iter().enumerate() {
        grid.insert(binning.bin_from_flat(flat), result?)?;
    }
    grid.complete()
}

fn missing_stratum(stratum: PileupStratum, bin: KinematicBin) -> Error {
    Error::Configuration(format!(
        "no histograms were accumulated for bin {bin} of pileup stratum {stratum}"
    ))
}

/// Run a whole measurement and write its outputs under `root`
pub fn run(cfg: &Configuration, inputs: &ProbeInputs, root: &Path) -> Result<FinalResults> {
    let start = Instant::now();
    let output_dir = cfg.output_dir(root);
    fs::create_dir_all(&output_dir).map_err(Error::io(&output_dir))?;

    // ### HISTOGRAM ACCUMULATION ###

    info!(
        "Reading probes from {} and {}",
        inputs.pass.display(),
        inputs.fail.display()
    );
    let sample = aggregate(cfg, inputs.open()?)?;
    println!();
    sample
        .counters
        .write_summary(
            &mut io::stdout().lock(),
            cfg.eff_kind,
            cfg.probe_cut.et_min,
            &cfg.mass_axis,
        )
        .map_err(Error::io("<stdout>"))?;

    // ### TEMPLATES ###

    let store;
    let templates = match cfg.sample {
        SampleType::Mc => {
            let path = cfg.template_file(root);
            let mc_templates = TemplateStore::from_sample(&sample)?;
            mc_templates.write(&path)?;
            info!(
                "Saved {} template pairs to {}",
                mc_templates.len(),
                path.display()
            );
            None
        }
        SampleType::Data if cfg.uses_templates() => {
            let path = cfg.template_file(root);
            store = TemplateStore::read(&path)?;
            if store.is_empty() {
                warn!("Template file {} holds no template", path.display());
            }
            info!("Loaded {} template pairs from {}", store.len(), path.display());
            Some(ResolvedTemplates::resolve(cfg, &store)?)
        }
        SampleType::Data => None,
    };

    // ### EFFICIENCY MEASUREMENT ###

    info!(
        "Measuring {} cells with {}",
        cfg.binning.count(),
        cfg.calc_method
    );
    let results = measure(cfg, &sample, templates.as_ref())?;
    let (measured, degraded, undetermined) = results.status_counts();
    info!("{measured} cells measured, {degraded} degraded, {undetermined} undetermined");

    // ### RESULTS STORAGE ###

    output::dump_results(
        cfg,
        inputs,
        &sample.counters,
        &results,
        &output_dir,
        start.elapsed(),
    )?;
    info!("Results written to {}", output_dir.display());
    Ok(results)
}
