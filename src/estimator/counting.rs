//! Efficiency from pass and fail counts, with Clopper-Pearson uncertainties

use crate::numeric::{Float, ONE_SIGMA_CL};
use statrs::distribution::{Beta, ContinuousCDF};

/// Efficiency with asymmetric uncertainties
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CountedEfficiency {
    /// Central value
    pub value: Float,
    /// Distance to the lower edge of the confidence interval
    pub err_low: Float,
    /// Distance to the upper edge of the confidence interval
    pub err_high: Float,
}

fn beta_quantile(a: Float, b: Float, probability: Float) -> Option<Float> {
    Beta::new(a, b).ok().map(|beta| beta.inverse_cdf(probability))
}

/// Efficiency `pass / (pass + fail)` with its central Clopper-Pearson
/// interval at one sigma
///
/// Negative sums are treated as empty. Returns `None` when there is nothing
/// to count.
///
pub fn clopper_pearson(pass: Float, fail: Float) -> Option<CountedEfficiency> {
    let (pass, fail) = (pass.max(0.), fail.max(0.));
    let total = pass + fail;
    if !(total > 0.) {
        return None;
    }
    let value = pass / total;
    let tail = 0.5 * (1. - ONE_SIGMA_CL);
    let low = if pass > 0. {
        beta_quantile(pass, fail + 1., tail)?
    } else {
        0.
    };
    let high = if fail > 0. {
        beta_quantile(pass + 1., fail, 1. - tail)?
    } else {
        1.
    };
    Some(CountedEfficiency {
        value,
        err_low: (value - low).max(0.),
        err_high: (high - value).max(0.),
    })
}

/// Clopper-Pearson interval of weighted sums of probes
///
/// The sums are rescaled to the effective number of probes,
/// `(sum w)² / sum w²`, so that the interval does not depend on the overall
/// normalization of the weights. The central value is unchanged.
///
pub fn weighted_clopper_pearson(pass: Float, fail: Float, sum_w2: Float) -> Option<CountedEfficiency> {
    let total = pass.max(0.) + fail.max(0.);
    let scale = if sum_w2 > 0. && total > 0. {
        total / sum_w2
    } else {
        1.
    };
    clopper_pearson(pass * scale, fail * scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn interval_brackets_the_ratio() {
        let eff = clopper_pearson(100., 50.).unwrap();
        assert_relative_eq!(eff.value, 2. / 3., epsilon = 1e-12);
        // Slightly wider than the normal approximation, sqrt(p (1 - p) / n)
        let normal = (eff.value * (1. - eff.value) / 150.).sqrt();
        assert!(eff.err_low > normal && eff.err_low < 1.2 * normal, "{eff:?}");
        assert!(eff.err_high > 0.9 * normal && eff.err_high < 1.2 * normal, "{eff:?}");
    }

    #[test]
    fn extreme_ratios_have_one_sided_intervals() {
        let none_passed = clopper_pearson(0., 10.).unwrap();
        assert_eq!(none_passed.value, 0.);
        assert_eq!(none_passed.err_low, 0.);
        let tail = 0.5 * (1. - ONE_SIGMA_CL);
        assert_relative_eq!(none_passed.err_high, 1. - tail.powf(0.1), epsilon = 1e-8);

        let all_passed = clopper_pearson(10., 0.).unwrap();
        assert_eq!(all_passed.value, 1.);
        assert_eq!(all_passed.err_high, 0.);
        assert_relative_eq!(all_passed.err_low, none_passed.err_high, epsilon = 1e-8);
    }

    #[test]
    fn empty_and_negative_sums_are_undetermined() {
        assert!(clopper_pearson(0., 0.).is_none());
        assert!(clopper_pearson(-1., 0.).is_none());
        assert_eq!(clopper_pearson(-1., 4.).unwrap().value, 0.);
    }

    #[test]
    fn efficiency_is_monotone_in_passing_probes() {
        for fail in [0., 1., 20., 12.5] {
            let mut last_value = 0.;
            for pass in 0..60 {
                let pass = 0.5 * Float::from(pass);
                let Some(eff) = clopper_pearson(pass, fail) else {
                    assert_eq!(pass + fail, 0.);
                    continue;
                };
                assert!((0.0..=1.0).contains(&eff.value));
                assert!(eff.value >= last_value);
                assert!(eff.value - eff.err_low >= 0. && eff.value + eff.err_high <= 1. + 1e-12);
                last_value = eff.value;
            }
        }
    }

    #[test]
    fn weight_normalization_does_not_change_the_interval() {
        let unit = weighted_clopper_pearson(100., 50., 150.).unwrap();
        assert_eq!(unit, clopper_pearson(100., 50.).unwrap());

        // Same probes, every weight multiplied by 0.01
        let scaled = weighted_clopper_pearson(1., 0.5, 150. * 1e-4).unwrap();
        assert_relative_eq!(scaled.value, unit.value, epsilon = 1e-12);
        assert_relative_eq!(scaled.err_low, unit.err_low, epsilon = 1e-9);
        assert_relative_eq!(scaled.err_high, unit.err_high, epsilon = 1e-9);
    }

    #[test]
    fn uneven_weights_widen_the_interval() {
        // 50 probes of weight 1 and 50 of weight 2: 90 effective probes
        let (pass, fail) = (100., 50.);
        let sum_w2 = 50. + 50. * 4.;
        let uneven = weighted_clopper_pearson(pass, fail, sum_w2).unwrap();
        let even = clopper_pearson(pass, fail).unwrap();
        assert_relative_eq!(uneven.value, even.value, epsilon = 1e-12);
        assert!(uneven.err_low > even.err_low && uneven.err_high > even.err_high);
    }
}
