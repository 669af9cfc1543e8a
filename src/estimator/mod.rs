//! Extraction of the efficiency of one measurement cell from its pass and
//! fail mass histograms

mod counting;
mod fitting;

use self::counting::weighted_clopper_pearson;

use self::fitting::Channel;
use crate::{
    binning::{KinematicBin, PileupStratum},
    config::{CalcMethod, FitSettings},
    histogram::{MassAxis, MassHistogram},
    numeric::{floats::NAN, Float},
    random::RandomGenerator,
    shapes::ResonanceShape,
};
use log::warn;
use prefix_num_ops::real::*;
use std::{borrow::Cow, fmt};

/// How trustworthy an efficiency result is
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EfficiencyStatus {
    /// Measured with the requested method
    Measured,

    /// No probe in the cell, the efficiency is unknown
    Undetermined,

    /// The requested method failed and a simpler one was used instead
    Degraded(String),
}
//
impl fmt::Display for EfficiencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measured => f.write_str("measured"),
            Self::Undetermined => f.write_str("undetermined"),
            Self::Degraded(_) => f.write_str("degraded"),
        }
    }
}

/// One fitted parameter
#[derive(Clone, Debug, PartialEq)]
pub struct FitParameter {
    /// Parameter name
    pub name: String,
    /// Best-fit value
    pub value: Float,
    /// Symmetric uncertainty (zero for parameters on a limit)
    pub error: Float,
}

/// Parameters of the fits behind an efficiency
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FitSummary {
    /// Fitted parameters, in model order
    pub parameters: Vec<FitParameter>,

    /// Minimization attempts needed by the slowest fit
    pub attempts: usize,

    /// Negative log-likelihood at the minimum (deviance form), summed over fits
    pub nll: Float,
}
//
impl FitSummary {
    /// Add the parameters of another fit
    pub fn merge(&mut self, other: Self) {
        self.parameters.extend(other.parameters);
        self.attempts = self.attempts.max(other.attempts);
        self.nll += other.nll;
    }
}

/// Efficiency of one pileup stratum of a cell
#[derive(Clone, Debug, PartialEq)]
pub struct StratumResult {
    /// Pileup stratum
    pub stratum: PileupStratum,
    /// Efficiency measured in this stratum
    pub result: EfficiencyResult,
}

/// Efficiency of one measurement cell
#[derive(Clone, Debug, PartialEq)]
pub struct EfficiencyResult {
    /// Efficiency, NaN when undetermined
    pub value: Float,

    /// Lower uncertainty
    pub err_low: Float,

    /// Upper uncertainty
    pub err_high: Float,

    /// Method that produced the value
    pub method: CalcMethod,

    /// Method that was asked for
    pub requested: CalcMethod,

    /// Trustworthiness of the value
    pub status: EfficiencyStatus,

    /// Weighted sum of passing probes
    pub n_pass: Float,

    /// Weighted sum of failing probes
    pub n_fail: Float,

    /// Weighted sums of the passing and failing probes of the cell which fall
    /// outside of every pileup bin, and are thus left out of the strata
    pub pileup_excluded: (Float, Float),

    /// Fitted parameters, for fitting methods
    pub fit: Option<FitSummary>,

    /// Per-stratum results, when measured in pileup bins
    pub strata: Vec<StratumResult>,
}
//
impl EfficiencyResult {
    /// Result of a cell without any probe
    pub fn undetermined(requested: CalcMethod, n_pass: Float, n_fail: Float) -> Self {
        Self {
            value: NAN,
            err_low: NAN,
            err_high: NAN,
            method: requested,
            requested,
            status: EfficiencyStatus::Undetermined,
            n_pass,
            n_fail,
            pileup_excluded: (0., 0.),
            fit: None,
            strata: Vec::new(),
        }
    }

    /// Truth that the efficiency could not be determined
    pub fn is_undetermined(&self) -> bool {
        self.status == EfficiencyStatus::Undetermined
    }

    /// Result obtained by counting probes, `sum_w2` being the sum of their
    /// squared weights
    fn counted(
        requested: CalcMethod,
        (n_pass, n_fail): (Float, Float),
        sum_w2: Float,
        status: EfficiencyStatus,
    ) -> Self {
        match weighted_clopper_pearson(n_pass, n_fail, sum_w2) {
            Some(efficiency) => Self {
                value: efficiency.value,
                err_low: efficiency.err_low,
                err_high: efficiency.err_high,
                method: CalcMethod::CountNCount,
                requested,
                status,
                n_pass,
                n_fail,
                pileup_excluded: (0., 0.),
                fit: None,
                strata: Vec::new(),
            },
            None => Self::undetermined(requested, n_pass, n_fail),
        }
    }
}

/// Everything needed to measure the efficiency of one cell
pub struct EstimationInput<'a> {
    /// Kinematic bin of the cell
    pub bin: KinematicBin,

    /// Pileup stratum of the cell
    pub stratum: PileupStratum,

    /// Mass spectrum of the passing probes
    pub pass: &'a MassHistogram,

    /// Mass spectrum of the failing probes
    pub fail: &'a MassHistogram,

    /// Pass and fail signal templates from simulation, when fitting data
    pub templates: Option<(&'a MassHistogram, &'a MassHistogram)>,
}

/// Efficiency estimator, shared by all cells of a measurement
pub struct Estimator<'cfg> {
    requested: CalcMethod,
    settings: &'cfg FitSettings,
    resonances: Vec<ResonanceShape>,
}
//
impl<'cfg> Estimator<'cfg> {
    /// Set up an estimator, preparing the signal shapes of the mass axes
    /// which fits will be performed on
    pub fn new(requested: CalcMethod, settings: &'cfg FitSettings, axes: &[MassAxis]) -> Self {
        let resonances = if requested.uses_fits() {
            axes.iter().copied().map(ResonanceShape::new).collect()
        } else {
            Vec::new()
        };
        Self {
            requested,
            settings,
            resonances,
        }
    }

    /// Measure the efficiency of one cell
    pub fn estimate(&self, input: &EstimationInput) -> EfficiencyResult {
        let n_pass = input.pass.integral();
        let n_fail = input.fail.integral();
        if !(n_pass + n_fail > 0.) {
            warn!(
                "No probe in bin {} ({}), efficiency is undetermined",
                input.bin, input.stratum
            );
            return EfficiencyResult::undetermined(self.requested, n_pass, n_fail);
        }

        let sum_w2 = input.pass.sum_w2().iter().chain(input.fail.sum_w2()).sum::<Float>();
        let counts = (n_pass, n_fail);

        let empty_template = |(pass, fail): (&MassHistogram, &MassHistogram)| {
            !(pass.integral() > 0. && fail.integral() > 0.)
        };
        let fit = match self.requested {
            CalcMethod::CountNCount => {
                return EfficiencyResult::counted(self.requested, counts, sum_w2, EfficiencyStatus::Measured)
            }
            _ if !(n_pass > 0. && n_fail > 0.) => Err("empty pass or fail channel".to_owned()),
            _ if input.templates.is_some_and(empty_template) => {
                Err("simulation left an empty signal template".to_owned())
            }
            method => self.fit(method, input).map_err(|e| e.to_string()),
        };
        match fit {
            Ok(fitted) => EfficiencyResult {
                value: fitted.efficiency.value,
                err_low: fitted.efficiency.err_low,
                err_high: fitted.efficiency.err_high,
                method: self.requested,
                requested: self.requested,
                status: EfficiencyStatus::Measured,
                n_pass,
                n_fail,
                pileup_excluded: (0., 0.),
                fit: Some(fitted.summary),
                strata: Vec::new(),
            },
            Err(reason) => {
                warn!(
                    "{} failed in bin {} ({}), falling back to {}: {reason}",
                    self.requested,
                    input.bin,
                    input.stratum,
                    CalcMethod::CountNCount
                );
                EfficiencyResult::counted(self.requested, counts, sum_w2, EfficiencyStatus::Degraded(reason))
            }
        }
    }

    /// Run the fits of a fitting method
    fn fit(&self, method: CalcMethod, input: &EstimationInput) -> crate::error::Result<fitting::FitEfficiency> {
        let axis = input.pass.axis();
        debug_assert_eq!(axis, input.fail.axis());
        let resonance = match self.resonances.iter().find(|shape| shape.axis() == axis) {
            Some(shape) => Cow::Borrowed(shape),
            None => Cow::Owned(ResonanceShape::new(*axis)),
        };
        let (pass_template, fail_template) = input.templates.unzip();
        let pass = Channel {
            label: "pass",
            histogram: input.pass,
            template: pass_template,
        };
        let fail = Channel {
            label: "fail",
            histogram: input.fail,
            template: fail_template,
        };
        let mut rng = RandomGenerator::for_cell(input.bin, input.stratum);
        match method {
            CalcMethod::CountNFit => fitting::count_n_fit(pass, fail, &resonance, self.settings, &mut rng),
            CalcMethod::FitNFit => fitting::fit_n_fit(pass, fail, &resonance, self.settings, &mut rng),
            CalcMethod::CountNCount => Err(crate::error::Error::Configuration(
                "COUNTnCOUNT does not fit".to_owned(),
            )),
        }
    }
}

/// Combine the efficiencies of the pileup strata of a cell
///
/// Strata are weighted by their weighted number of probes, undetermined
/// strata carry no weight. Uncertainties are combined in quadrature with the
/// same weights.
///
/// Probes outside of every pileup bin belong to no stratum: they are missing
/// from the combined counts, and must be reported separately through
/// `pileup_excluded`.
///
pub fn combine_strata(requested: CalcMethod, strata: Vec<StratumResult>) -> EfficiencyResult {
    let n_pass = strata.iter().map(|stratum| stratum.result.n_pass).sum::<Float>();
    let n_fail = strata.iter().map(|stratum| stratum.result.n_fail).sum::<Float>();
    let determined = || strata.iter().filter(|stratum| !stratum.result.is_undetermined());

    let weight = |result: &EfficiencyResult| result.n_pass + result.n_fail;
    let total_weight = determined().map(|stratum| weight(&stratum.result)).sum::<Float>();
    if !(total_weight > 0.) {
        let mut result = EfficiencyResult::undetermined(requested, n_pass, n_fail);
        result.strata = strata;
        return result;
    }

    let mut value = 0.;
    let mut var_low = 0.;
    let mut var_high = 0.;
    for stratum in determined() {
        let share = weight(&stratum.result) / total_weight;
        value += share * stratum.result.value;
        var_low += powi(share * stratum.result.err_low, 2);
        var_high += powi(share * stratum.result.err_high, 2);
    }

    let degraded = determined()
        .filter(|stratum| matches!(stratum.result.status, EfficiencyStatus::Degraded(_)))
        .map(|stratum| stratum.stratum.to_string())
        .collect::<Vec<_>>();
    let (status, method) = if degraded.is_empty() {
        (EfficiencyStatus::Measured, requested)
    } else {
        let method = if degraded.len() == determined().count() {
            CalcMethod::CountNCount
        } else {
            requested
        };
        let reason = format!("{} fell back to {}", degraded.join(", "), CalcMethod::CountNCount);
        (EfficiencyStatus::Degraded(reason), method)
    };

    EfficiencyResult {
        value,
        err_low: sqrt(var_low),
        err_high: sqrt(var_high),
        method,
        requested,
        status,
        n_pass,
        n_fail,
        pileup_excluded: (0., 0.),
        fit: None,
        strata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn axis() -> MassAxis {
        MassAxis::new(60., 120., 30).unwrap()
    }

    fn peaked(total: Float) -> MassHistogram {
        let mut contents = vec![0.; 30];
        contents[15] = total;
        MassHistogram::from_contents(axis(), contents)
    }

    fn input<'a>(pass: &'a MassHistogram, fail: &'a MassHistogram) -> EstimationInput<'a> {
        EstimationInput {
            bin: KinematicBin { et: 0, eta: 0 },
            stratum: PileupStratum::Combined,
            pass,
            fail,
            templates: None,
        }
    }

    #[test]
    fn counting_the_reference_scenario() {
        let settings = FitSettings::default();
        let estimator = Estimator::new(CalcMethod::CountNCount, &settings, &[axis()]);
        let (pass, fail) = (peaked(100.), peaked(50.));
        let result = estimator.estimate(&input(&pass, &fail));
        assert_relative_eq!(result.value, 100. / 150.);
        assert_eq!(result.status, EfficiencyStatus::Measured);
        assert_eq!(result.method, CalcMethod::CountNCount);
        assert_eq!((result.n_pass, result.n_fail), (100., 50.));
        assert!(result.err_low > 0. && result.err_high > 0.);
    }

    #[test]
    fn empty_cells_are_undetermined_without_fitting() {
        let settings = FitSettings::default();
        let estimator = Estimator::new(CalcMethod::FitNFit, &settings, &[axis()]);
        let empty = MassHistogram::new(axis());
        let result = estimator.estimate(&input(&empty, &empty));
        assert!(result.is_undetermined());
        assert!(result.value.is_nan());
        assert!(result.fit.is_none());
    }

    #[test]
    fn fits_fall_back_to_counting_on_empty_channels() {
        let settings = FitSettings::default();
        let estimator = Estimator::new(CalcMethod::CountNFit, &settings, &[axis()]);
        let (pass, fail) = (peaked(40.), MassHistogram::new(axis()));
        let result = estimator.estimate(&input(&pass, &fail));
        assert!(matches!(result.status, EfficiencyStatus::Degraded(_)));
        assert_eq!(result.method, CalcMethod::CountNCount);
        assert_eq!(result.requested, CalcMethod::CountNFit);
        assert_eq!(result.value, 1.);
    }

    #[test]
    fn unfittable_spectra_fall_back_to_counting() {
        // Zero iterations allowed: no attempt can ever converge
        let settings = FitSettings {
            max_iter: 0,
            max_retries: 1,
            ..FitSettings::default()
        };
        let estimator = Estimator::new(CalcMethod::FitNFit, &settings, &[axis()]);
        let (pass, fail) = (peaked(90.), peaked(10.));
        let result = estimator.estimate(&input(&pass, &fail));
        assert!(matches!(result.status, EfficiencyStatus::Degraded(_)), "{:?}", result.status);
        assert_relative_eq!(result.value, 0.9);
        assert!(result.fit.is_none());
    }

    #[test]
    fn counting_errors_ignore_the_weight_normalization() {
        let settings = FitSettings::default();
        let estimator = Estimator::new(CalcMethod::CountNCount, &settings, &[axis()]);
        let filled = |count: usize, weight: Float| {
            let mut histogram = MassHistogram::new(axis());
            for _ in 0..count {
                histogram.fill(91., weight);
            }
            histogram
        };
        let (pass, fail) = (filled(100, 1.), filled(50, 1.));
        let unit = estimator.estimate(&input(&pass, &fail));
        let (pass, fail) = (filled(100, 0.01), filled(50, 0.01));
        let scaled = estimator.estimate(&input(&pass, &fail));
        assert_relative_eq!(scaled.value, unit.value, epsilon = 1e-12);
        assert_relative_eq!(scaled.err_low, unit.err_low, epsilon = 1e-9);
        assert_relative_eq!(scaled.err_high, unit.err_high, epsilon = 1e-9);
        assert_relative_eq!(scaled.n_pass, 1., epsilon = 1e-12);
    }

    #[test]
    fn empty_templates_fall_back_to_counting() {
        let settings = FitSettings::default();
        let template_axis = MassAxis::new(60., 120., 60).unwrap();
        let estimator = Estimator::new(CalcMethod::FitNFit, &settings, &[axis(), template_axis]);
        let (pass, fail) = (peaked(900.), peaked(100.));
        let (pass_template, fail_template) = (MassHistogram::new(template_axis), peaked(10.));
        let result = estimator.estimate(&EstimationInput {
            templates: Some((&pass_template, &fail_template)),
            ..input(&pass, &fail)
        });
        assert_eq!(
            result.status,
            EfficiencyStatus::Degraded("simulation left an empty signal template".to_owned())
        );
        assert_eq!(result.method, CalcMethod::CountNCount);
        assert_eq!(result.requested, CalcMethod::FitNFit);
        assert_relative_eq!(result.value, 0.9);
        assert!(result.fit.is_none());
    }

    fn stratum(index: usize, pass: Float, fail: Float) -> StratumResult {
        StratumResult {
            stratum: PileupStratum::Bin(index),
            result: EfficiencyResult::counted(
                CalcMethod::CountNCount,
                (pass, fail),
                pass + fail,
                EfficiencyStatus::Measured,
            ),
        }
    }

    #[test]
    fn strata_are_combined_by_weighted_count() {
        let strata = vec![
            stratum(0, 54., 6.),
            stratum(1, 32., 8.),
            StratumResult {
                stratum: PileupStratum::Bin(2),
                result: EfficiencyResult::undetermined(CalcMethod::CountNCount, 0., 0.),
            },
        ];
        let expected_low = ((0.6 * strata[0].result.err_low).powi(2)
            + (0.4 * strata[1].result.err_low).powi(2))
        .sqrt();
        let combined = combine_strata(CalcMethod::CountNCount, strata);
        assert_relative_eq!(combined.value, 0.86, epsilon = 1e-12);
        assert_relative_eq!(combined.err_low, expected_low, epsilon = 1e-12);
        assert_eq!(combined.status, EfficiencyStatus::Measured);
        assert_eq!((combined.n_pass, combined.n_fail), (86., 14.));
        assert_eq!(combined.strata.len(), 3);
    }

    #[test]
    fn degraded_strata_degrade_the_combination() {
        let mut fallback = stratum(0, 9., 1.);
        fallback.result.status = EfficiencyStatus::Degraded("test".to_owned());
        let combined = combine_strata(CalcMethod::FitNFit, vec![fallback, stratum(1, 5., 5.)]);
        assert_eq!(
            combined.status,
            EfficiencyStatus::Degraded("pu0 fell back to COUNTnCOUNT".to_owned())
        );
        assert_eq!(combined.method, CalcMethod::FitNFit);

        let nothing = combine_strata(CalcMethod::FitNFit, Vec::new());
        assert!(nothing.is_undetermined());
    }
}
