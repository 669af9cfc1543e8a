//! Binned maximum likelihood fits of the pass and fail mass spectra

use super::{counting, FitParameter, FitSummary};
use crate::{
    config::FitSettings,
    error::{Error, Result},
    histogram::{MassAxis, MassHistogram},
    minimizer::{self, Bounds, Minimizer, ObjectiveFunction},
    numeric::Float,
    random::RandomGenerator,
    shapes::{self, CrystalBall, ResonanceShape},
};
use log::debug;
use nalgebra::DMatrix;
use prefix_num_ops::real::*;

/// Smallest expected bin content, keeps the likelihood finite
const MIN_EXPECTED: Float = 1e-12;

/// Ranges and nominal values of the per-channel parameters
const SIGNAL: (Float, Bounds) = (0.9, Bounds::new(0., 1.5));
const BACKGROUND: (Float, Bounds) = (0.1, Bounds::new(0., 1.5));
const SLOPE: (Float, Bounds) = (-0.02, Bounds::new(-0.2, 0.2));

/// Ranges and nominal values of the resolution parameters
const MEAN_SHIFT: (Float, Bounds) = (0., Bounds::new(-5., 5.));
const SIGMA: (Float, Bounds) = (1.5, Bounds::new(0.3, 8.));
const ALPHA: (Float, Bounds) = (1.5, Bounds::new(0.3, 10.));

/// Number of parameters specific to one channel
const CHANNEL_PARAMS: usize = 3;

/// One mass spectrum entering a fit
pub struct Channel<'a> {
    /// Name of the channel, used to name its parameters
    pub label: &'static str,

    /// Observed spectrum
    pub histogram: &'a MassHistogram,

    /// Fixed signal shape from simulation, if any
    pub template: Option<&'a MassHistogram>,
}

/// Signal plus exponential background model of one or more channels
///
/// Yields are parametrized as fractions of the observed channel totals, so
/// that all parameters have similar magnitudes. Channels without a template
/// share one resolution function, applied to the Z lineshape.
///
struct SpectrumModel<'a> {
    channels: Vec<ModelChannel<'a>>,
    resonance: Option<&'a ResonanceShape>,
}
//
struct ModelChannel<'a> {
    label: &'static str,
    axis: MassAxis,
    counts: &'a [Float],
    scale: Float,
    template: Option<Vec<Float>>,
}
//
impl<'a> SpectrumModel<'a> {
    fn new(channels: &[Channel<'a>], resonance: &'a ResonanceShape) -> Self {
        let channels = channels
            .iter()
            .map(|channel| {
                let axis = *channel.histogram.axis();
                ModelChannel {
                    label: channel.label,
                    axis,
                    counts: channel.histogram.contents(),
                    scale: channel.histogram.integral().max(1.),
                    template: channel
                        .template
                        .map(|template| shapes::template_fractions(template, &axis)),
                }
            })
            .collect::<Vec<_>>();
        let needs_resonance = channels.iter().any(|channel| channel.template.is_none());
        Self {
            channels,
            resonance: needs_resonance.then_some(resonance),
        }
    }

    /// Names, nominal values and bounds of the parameters
    fn parameters(&self) -> Vec<(String, Float, Bounds)> {
        let mut parameters = Vec::new();
        for channel in &self.channels {
            for (name, (nominal, bounds)) in [("signal", SIGNAL), ("background", BACKGROUND), ("slope", SLOPE)] {
                parameters.push((format!("{}_{name}", channel.label), nominal, bounds));
            }
        }
        if self.resonance.is_some() {
            let prefix = match &self.channels[..] {
                [single] => format!("{}_", single.label),
                _ => String::new(),
            };
            for (name, (nominal, bounds)) in [("mean_shift", MEAN_SHIFT), ("sigma", SIGMA), ("alpha", ALPHA)] {
                parameters.push((format!("{prefix}{name}"), nominal, bounds));
            }
        }
        parameters
    }

    /// Index of the first resolution parameter
    fn resolution_offset(&self) -> usize {
        CHANNEL_PARAMS * self.channels.len()
    }

    /// Signal yield of a channel, in number of events
    fn signal_yield(&self, params: &[Float], channel: usize) -> Float {
        params[CHANNEL_PARAMS * channel] * self.channels[channel].scale
    }

    /// Background yield of a channel, in number of events
    fn background_yield(&self, params: &[Float], channel: usize) -> Float {
        params[CHANNEL_PARAMS * channel + 1] * self.channels[channel].scale
    }
}
//
impl ObjectiveFunction for SpectrumModel<'_> {
    fn eval(&self, params: &[Float]) -> Float {
        let offset = self.resolution_offset();
        let resonance = self.resonance.map(|shape| {
            shape.fractions(&CrystalBall {
                mean: params[offset],
                sigma: params[offset + 1],
                alpha: params[offset + 2],
                n: CrystalBall::TAIL_POWER,
            })
        });

        let mut nll = 0.;
        for (index, channel) in self.channels.iter().enumerate() {
            // Channels without a template always come with a resonance
            let Some(signal_shape) = channel.template.as_deref().or(resonance.as_deref()) else {
                return Float::INFINITY;
            };
            let background_shape = shapes::exponential_fractions(&channel.axis, params[CHANNEL_PARAMS * index + 2]);
            let signal = self.signal_yield(params, index);
            let background = self.background_yield(params, index);
            for ((&observed, &sig), &bkg) in channel.counts.iter().zip(signal_shape).zip(&background_shape) {
                let expected = (signal * sig + background * bkg).max(MIN_EXPECTED);
                // Deviance form of the Poisson likelihood, which is zero for a
                // perfect fit and thus keeps the minimizer tolerances meaningful
                nll += expected - observed;
                if observed > 0. {
                    nll += observed * ln(observed / expected);
                }
            }
        }
        nll
    }
}

/// Outcome of a successful fit
struct FittedModel {
    params: Vec<Float>,
    covariance: DMatrix<Float>,
    nll: Float,
    attempts: usize,
}

/// Fit a model, retrying from jittered starting points on failure
fn fit(model: &SpectrumModel, settings: &FitSettings, rng: &mut RandomGenerator) -> Result<FittedModel> {
    let parameters = model.parameters();
    let nominal = parameters.iter().map(|(_, nominal, _)| *nominal).collect::<Vec<_>>();
    let bounds = parameters.iter().map(|(_, _, bounds)| *bounds).collect::<Vec<_>>();
    minimize_with_retries(model, &nominal, &bounds, settings, rng)
}

/// Minimize from the nominal starting point, then from jittered ones until a
/// minimum with a positive definite Hessian is found
fn minimize_with_retries(
    objective: &dyn ObjectiveFunction,
    nominal: &[Float],
    bounds: &[Bounds],
    settings: &FitSettings,
    rng: &mut RandomGenerator,
) -> Result<FittedModel> {
    let minimizer = Minimizer::new(settings);
    let max_attempts = settings.max_retries + 1;

    let mut reason = String::new();
    for attempt in 1..=max_attempts {
        let start = if attempt == 1 {
            nominal.to_vec()
        } else {
            nominal
                .iter()
                .zip(bounds)
                .map(|(&value, bounds)| bounds.clamp(value + settings.jitter * bounds.width() * rng.symmetric()))
                .collect()
        };

        match minimizer.minimize(objective, &start, bounds) {
            Ok(minimum) if minimum.converged => match minimizer::covariance(objective, &minimum.params, bounds) {
                Some(covariance) => {
                    return Ok(FittedModel {
                        params: minimum.params,
                        covariance,
                        nll: minimum.value,
                        attempts: attempt,
                    })
                }
                None => reason = "Hessian is not positive definite".to_owned(),
            },
            Ok(minimum) => reason = format!("no convergence, {minimum}"),
            Err(Error::FitConvergence { reason: why, .. }) => reason = why,
            Err(other) => return Err(other),
        }
        debug!("Fit attempt {attempt}/{max_attempts} failed: {reason}");
    }
    Err(Error::FitConvergence {
        attempts: max_attempts,
        reason,
    })
}

/// Tabulate the parameters of a fitted model
fn summarize(model: &SpectrumModel, fitted: &FittedModel) -> FitSummary {
    let parameters = model
        .parameters()
        .into_iter()
        .zip(&fitted.params)
        .enumerate()
        .map(|(index, ((name, _, _), &value))| FitParameter {
            name,
            value,
            error: sqrt(fitted.covariance[(index, index)].max(0.)),
        })
        .collect();
    FitSummary {
        parameters,
        attempts: fitted.attempts,
        nll: fitted.nll,
    }
}

/// Efficiency and uncertainties extracted from fits
pub struct FitEfficiency {
    /// Efficiency with its uncertainties
    pub efficiency: counting::CountedEfficiency,
    /// Fitted parameters
    pub summary: FitSummary,
}

/// COUNTnFIT: subtract the fitted background of each channel separately, then
/// count the remaining signal
pub fn count_n_fit(
    pass: Channel,
    fail: Channel,
    resonance: &ResonanceShape,
    settings: &FitSettings,
    rng: &mut RandomGenerator,
) -> Result<FitEfficiency> {
    let mut signal = [0.; 2];
    let mut summary = FitSummary::default();
    for (index, channel) in [pass, fail].into_iter().enumerate() {
        let total = channel.histogram.integral();
        let model = SpectrumModel::new(&[channel], resonance);
        let fitted = fit(&model, settings, rng)?;
        signal[index] = (total - model.background_yield(&fitted.params, 0)).max(0.);
        summary.merge(summarize(&model, &fitted));
    }
    let efficiency = counting::clopper_pearson(signal[0], signal[1]).ok_or_else(|| Error::FitConvergence {
        attempts: summary.attempts,
        reason: "no signal left after background subtraction".to_owned(),
    })?;
    Ok(FitEfficiency { efficiency, summary })
}

/// FITnFIT: fit both channels simultaneously, and derive the efficiency from
/// the correlated signal yields
pub fn fit_n_fit(
    pass: Channel,
    fail: Channel,
    resonance: &ResonanceShape,
    settings: &FitSettings,
    rng: &mut RandomGenerator,
) -> Result<FitEfficiency> {
    let model = SpectrumModel::new(&[pass, fail], resonance);
    let fitted = fit(&model, settings, rng)?;
    let summary = summarize(&model, &fitted);

    let n_pass = model.signal_yield(&fitted.params, 0);
    let n_fail = model.signal_yield(&fitted.params, 1);
    let total = n_pass + n_fail;
    if !(total > 0.) {
        return Err(Error::FitConvergence {
            attempts: fitted.attempts,
            reason: "fitted signal yields are both zero".to_owned(),
        });
    }
    let value = n_pass / total;

    // Linear propagation through eff = Np / (Np + Nf)
    let (i_pass, i_fail) = (0, CHANNEL_PARAMS);
    let d_pass = model.channels[0].scale * n_fail / (total * total);
    let d_fail = -model.channels[1].scale * n_pass / (total * total);
    let cov = &fitted.covariance;
    let variance = d_pass * d_pass * cov[(i_pass, i_pass)]
        + d_fail * d_fail * cov[(i_fail, i_fail)]
        + 2. * d_pass * d_fail * cov[(i_pass, i_fail)];
    let error = sqrt(variance.max(0.));
    Ok(FitEfficiency {
        efficiency: counting::CountedEfficiency {
            value,
            err_low: error.min(value),
            err_high: error.min(1. - value),
        },
        summary,
    })
}
