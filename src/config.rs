//! Mechanism for loading and sharing the measurement configuration

use crate::{
    binning::{EtBinSet, EtaBinSet, KinematicBinning, PileupBinning},
    error::{Error, Result},
    evcut::ProbeCut,
    histogram::MassAxis,
    numeric::Float,
    probe::ProbeOutcome,
};
use clap::Parser;
use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Command-line interface of the efficiency measurement
#[derive(Parser, Debug)]
#[command(name = "calc-eff", about = "Tag-and-probe efficiency measurement")]
pub struct Args {
    /// Analysis configuration file
    pub config_file: PathBuf,

    /// Efficiency to measure (RECO, ID, HLT, HLTleg1 or HLTleg2)
    pub eff_type: EfficiencyKind,

    /// Input probes carry pileup reweighting factors
    #[arg(long)]
    pub pu_reweight: bool,

    /// Measure the efficiency separately in pileup bins, then combine
    #[arg(long)]
    pub pu_dependence: bool,

    /// JSON-lines file of passing probes (default derived from the config)
    #[arg(long)]
    pub pass_probes: Option<PathBuf>,

    /// JSON-lines file of failing probes (default derived from the config)
    #[arg(long)]
    pub fail_probes: Option<PathBuf>,

    /// Directory under which the per-tag output directories live
    #[arg(long, default_value = "tag_and_probe")]
    pub output_root: PathBuf,
}

/// Options given on the command line rather than in the configuration file
#[derive(Clone, Copy, Debug)]
pub struct RunOptions {
    /// Efficiency to measure
    pub eff_kind: EfficiencyKind,

    /// Input probes carry pileup reweighting factors
    pub pileup_reweight: bool,

    /// Measure the efficiency in pileup strata
    pub pileup_dependence: bool,
}
//
impl From<&Args> for RunOptions {
    fn from(args: &Args) -> Self {
        Self {
            eff_kind: args.eff_type,
            pileup_reweight: args.pu_reweight,
            pileup_dependence: args.pu_dependence,
        }
    }
}

/// Kind of sample being processed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleType {
    /// Collision data, fitted with templates from simulation
    Data,
    /// Simulation, from which templates are built
    Mc,
}
//
impl FromStr for SampleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "DATA" => Ok(Self::Data),
            "MC" => Ok(Self::Mc),
            other => Err(Error::Configuration(format!(
                "unrecognized sample type {other:?}, expected DATA or MC"
            ))),
        }
    }
}
//
impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Data => "DATA",
            Self::Mc => "MC",
        })
    }
}

/// Efficiency being measured
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EfficiencyKind {
    /// Supercluster to GSF electron reconstruction
    Reco,
    /// Electron identification
    Id,
    /// Trigger, both legs
    Hlt,
    /// Trigger, leading leg
    HltLeg1,
    /// Trigger, trailing leg
    HltLeg2,
}
//
impl EfficiencyKind {
    const ALL: [Self; 5] = [Self::Reco, Self::Id, Self::Hlt, Self::HltLeg1, Self::HltLeg2];

    /// Name on the command line and in reports
    pub fn name(self) -> &'static str {
        match self {
            Self::Reco => "RECO",
            Self::Id => "ID",
            Self::Hlt => "HLT",
            Self::HltLeg1 => "HLTleg1",
            Self::HltLeg2 => "HLTleg2",
        }
    }

    /// Key of the method line in the configuration file
    ///
    /// All trigger variants share the HLT line.
    pub fn config_key(self) -> &'static str {
        match self {
            Self::Reco => "RECO",
            Self::Id => "ID",
            Self::Hlt | Self::HltLeg1 | Self::HltLeg2 => "HLT",
        }
    }
}
//
impl FromStr for EfficiencyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unrecognized efficiency kind {s:?}, expected RECO, ID or HLT*"
                ))
            })
    }
}
//
impl fmt::Display for EfficiencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Method used to extract the efficiency in each bin
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum CalcMethod {
    /// Count passing and failing probes, no background subtraction
    #[serde(rename = "COUNTnCOUNT")]
    CountNCount,
    /// Count after fitting away the background of each channel
    #[serde(rename = "COUNTnFIT")]
    CountNFit,
    /// Simultaneous fit of the passing and failing channels
    #[serde(rename = "FITnFIT")]
    FitNFit,
}
//
impl CalcMethod {
    /// Name used in configuration files and reports
    pub fn name(self) -> &'static str {
        match self {
            Self::CountNCount => "COUNTnCOUNT",
            Self::CountNFit => "COUNTnFIT",
            Self::FitNFit => "FITnFIT",
        }
    }

    /// Truth that this method fits mass distributions
    pub fn uses_fits(self) -> bool {
        self != Self::CountNCount
    }
}
//
impl FromStr for CalcMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "COUNTnCOUNT" => Ok(Self::CountNCount),
            "COUNTnFIT" => Ok(Self::CountNFit),
            "FITnFIT" => Ok(Self::FitNFit),
            other => Err(Error::Configuration(format!(
                "unrecognized calculation method {other:?}"
            ))),
        }
    }
}
//
impl fmt::Display for CalcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tuning of the mass fits
#[derive(Clone, Debug, PartialEq)]
pub struct FitSettings {
    /// Iteration cap of a single minimization
    pub max_iter: u64,

    /// Convergence threshold on the gradient norm of the likelihood
    pub gradient_tolerance: Float,

    /// Number of correction pairs kept by L-BFGS
    pub lbfgs_memory: usize,

    /// Additional attempts with jittered starting points after a failure
    pub max_retries: usize,

    /// Relative amplitude of the starting point jitter (fraction of range)
    pub jitter: Float,
}
//
impl Default for FitSettings {
    fn default() -> Self {
        Self {
            max_iter: 2000,
            gradient_tolerance: 1e-5,
            lbfgs_memory: 10,
            max_retries: 3,
            jitter: 0.15,
        }
    }
}

/// Measurement configuration
pub struct Configuration {
    /// Data or simulation
    pub sample: SampleType,

    /// Efficiency being measured
    pub eff_kind: EfficiencyKind,

    /// Per-bin efficiency extraction method
    pub calc_method: CalcMethod,

    /// (Et, eta) binning of the measurement
    pub binning: KinematicBinning,

    /// Pileup stratification
    pub pileup: PileupBinning,

    /// Input probes carry pileup reweighting factors
    pub pileup_reweight: bool,

    /// Directory tag of the inputs and outputs
    pub dir_tag: String,

    /// Ntuples that the probe streams were selected from
    pub ntuple_files: Vec<String>,

    /// Cuts applied to probes before histogramming
    pub probe_cut: ProbeCut,

    /// Binning of the per-bin mass histograms
    pub mass_axis: MassAxis,

    /// Binning of the per-stratum histograms, which become templates in MC
    pub template_axis: MassAxis,

    /// Tuning of the mass fits
    pub fit: FitSettings,
}
//
impl Configuration {
    /// Minimal probe Et (GeV)
    pub const ET_MIN: Float = 10.;

    /// Tag-probe mass window (GeV)
    pub const MASS_WINDOW: (Float, Float) = (60., 120.);

    /// Number of bins of the per-bin mass histograms
    pub const MASS_BINS: usize = 30;

    /// Number of bins of the template histograms
    pub const TEMPLATE_BINS: usize = 60;

    /// Load the configuration from a file, check it, and print it out
    pub fn load(file_name: &Path, options: RunOptions) -> Result<Self> {
        let config_str = fs::read_to_string(file_name).map_err(|e| {
            Error::Configuration(format!(
                "cannot read configuration file {}: {e}",
                file_name.display()
            ))
        })?;
        let config = Self::parse(&config_str, options)?;
        config.print();
        Ok(config)
    }

    /// Decode the contents of a configuration file
    ///
    /// The format is line based: `#` starts a comment line and `%` ends the
    /// file. Content lines are, in order, the sample type, three
    /// `KIND:METHOD` lines, the Et binning, the eta binning, the directory
    /// tag, and then any number of ntuple file names.
    ///
    pub fn parse(config_str: &str, options: RunOptions) -> Result<Self> {
        let mut state = ParseState::Sample;
        let mut sample = None;
        let mut calc_method = None;
        let mut et_binning = None;
        let mut eta_binning = None;
        let mut dir_tag = None;
        let mut ntuple_files = Vec::new();

        for (index, line) in config_str.lines().enumerate() {
            let line = line.trim();
            if line.starts_with('%') {
                break;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let item = |name| ConfigItem::new(name, line, index + 1);
            state = match state {
                ParseState::Sample => {
                    sample = Some(item("sample type").parse::<SampleType>()?);
                    ParseState::Methods(0)
                }
                ParseState::Methods(seen) => {
                    let (kind, method) = line.split_once(':').ok_or_else(|| {
                        Error::Configuration(format!(
                            "line {}: expected format is EFFICIENCY:fitting_mode",
                            index + 1
                        ))
                    })?;
                    if kind.trim() == options.eff_kind.config_key() {
                        let method_item = ConfigItem::new("calculation method", method, index + 1);
                        calc_method = Some(method_item.parse::<CalcMethod>()?);
                    }
                    if seen == 2 {
                        ParseState::EtBinning
                    } else {
                        ParseState::Methods(seen + 1)
                    }
                }
                ParseState::EtBinning => {
                    et_binning = Some(item("Et binning").parse::<EtBinSet>()?);
                    ParseState::EtaBinning
                }
                ParseState::EtaBinning => {
                    eta_binning = Some(item("eta binning").parse::<EtaBinSet>()?);
                    ParseState::DirTag
                }
                ParseState::DirTag => {
                    dir_tag = Some(line.to_owned());
                    ParseState::Files
                }
                ParseState::Files => {
                    ntuple_files.push(line.to_owned());
                    ParseState::Files
                }
            };
        }

        if state != ParseState::Files {
            return Err(Error::Configuration(format!(
                "configuration file ended while expecting the {}",
                state.expectation()
            )));
        }
        let (Some(sample), Some(et_binning), Some(eta_binning), Some(dir_tag)) =
            (sample, et_binning, eta_binning, dir_tag)
        else {
            return Err(Error::Configuration(
                "incomplete configuration file".to_owned(),
            ));
        };
        let calc_method = calc_method.ok_or_else(|| {
            Error::Configuration(format!(
                "no calculation method configured for {}",
                options.eff_kind.config_key()
            ))
        })?;

        let (mass_low, mass_high) = Self::MASS_WINDOW;
        let mass_axis = MassAxis::new(mass_low, mass_high, Self::MASS_BINS)?;
        let template_axis = MassAxis::new(mass_low, mass_high, Self::TEMPLATE_BINS)?;
        Ok(Self {
            sample,
            eff_kind: options.eff_kind,
            calc_method,
            binning: KinematicBinning::new(et_binning, eta_binning),
            pileup: PileupBinning::new(options.pileup_dependence),
            pileup_reweight: options.pileup_reweight,
            dir_tag,
            ntuple_files,
            probe_cut: ProbeCut::new(Self::ET_MIN, eta_binning, mass_axis),
            mass_axis,
            template_axis,
            fit: FitSettings::default(),
        })
    }

    /// Display the configuration
    pub fn print(&self) {
        println!("Efficiency calculation method: {}", self.calc_method);
        println!("Efficiency type to measure: {}", self.eff_kind);
        println!("SC ET binning: {}", self.binning.et);
        println!("SC eta binning: {}", self.binning.eta);
        println!("Sample: {}", self.sample);
        println!("Pileup reweighting: {}", self.pileup_reweight);
        println!("Pileup dependence: {}", self.pileup.is_dependent());
    }

    /// Truth that data fits need templates from simulation
    pub fn uses_templates(&self) -> bool {
        self.sample == SampleType::Data && self.calc_method.uses_fits()
    }

    /// Truth that per-stratum histograms must be accumulated
    ///
    /// Simulation always keeps them since they become the templates, data
    /// only needs them to measure the efficiency in pileup bins.
    pub fn keeps_strata(&self) -> bool {
        self.sample == SampleType::Mc || self.pileup.is_dependent()
    }

    /// Suffix telling apart pileup treatments in file names
    fn pileup_tag(&self) -> String {
        let mut tag = String::new();
        if self.pileup_reweight {
            tag.push_str("_PU");
        }
        if self.pileup.is_dependent() {
            tag.push_str("_varPU");
        }
        tag
    }

    /// Label of this measurement, used to name its output files
    pub fn label(&self) -> String {
        format!(
            "{}-{}-{}-{}{}",
            self.sample,
            self.eff_kind,
            self.calc_method,
            self.binning.et,
            self.binning.eta
        ) + &self.pileup_tag()
    }

    /// Label of the templates, shared by the data and simulation runs
    pub fn template_label(&self) -> String {
        format!(
            "{}-{}-{}{}",
            self.eff_kind, self.calc_method, self.binning.et, self.binning.eta
        ) + &self.pileup_tag()
    }

    /// Directory holding the inputs and outputs of this measurement
    pub fn output_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.dir_tag)
    }

    /// Default location of a selected probe stream
    pub fn default_probe_file(&self, root: &Path, outcome: ProbeOutcome) -> PathBuf {
        let reweight = if self.pileup_reweight { "_PU" } else { "" };
        self.output_dir(root).join(format!(
            "selectEvents_{}_{}{}_{}.jsonl",
            self.sample,
            self.eff_kind,
            reweight,
            outcome.name()
        ))
    }

    /// Location of the mass templates
    pub fn template_file(&self, root: &Path) -> PathBuf {
        self.output_dir(root)
            .join(format!("mass_templates_{}.json", self.template_label()))
    }
}

/// What the configuration parser expects next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    Sample,
    Methods(usize),
    EtBinning,
    EtaBinning,
    DirTag,
    Files,
}
//
impl ParseState {
    fn expectation(self) -> &'static str {
        match self {
            Self::Sample => "sample type",
            Self::Methods(_) => "efficiency method lines",
            Self::EtBinning => "Et binning",
            Self::EtaBinning => "eta binning",
            Self::DirTag => "directory tag",
            Self::Files => "ntuple files",
        }
    }
}

/// A value from the configuration file, tagged with the field which it is
/// supposed to fill and its line number for error reporting purposes.
struct ConfigItem<'data> {
    name: &'static str,
    data: &'data str,
    line: usize,
}
//
impl<'data> ConfigItem<'data> {
    /// Build a config item from a field tag and raw line data
    fn new(name: &'static str, data: &'data str, line: usize) -> Self {
        Self { name, data, line }
    }

    /// Parse this data into one of the configuration's closed enums
    fn parse<T: FromStr<Err = Error>>(self) -> Result<T> {
        self.data.parse::<T>().map_err(|e| {
            Error::Configuration(format!(
                "line {}: could not parse the {}: {e}",
                self.line, self.name
            ))
        })
    }
}
