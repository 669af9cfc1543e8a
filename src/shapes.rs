//! Mass shapes of the fit models, expressed as the fraction of the shape
//! which falls into each bin of a mass axis
//!
//! Every shape is normalized to unity over the mass window, so that the
//! expected bin contents of a component are its yield times its fractions.

use crate::{
    histogram::{MassAxis, MassHistogram},
    numeric::{z_boson, Float},
};
use prefix_num_ops::real::*;

/// Bin fractions of a falling (or rising) exponential `exp(slope * mass)`
pub fn exponential_fractions(axis: &MassAxis, slope: Float) -> Vec<Float> {
    let range = axis.high - axis.low;
    // Flat limit, where the closed form loses all precision
    if abs(slope * range) < 1e-8 {
        return vec![1. / (axis.bins as Float); axis.bins];
    }
    // Measured from the window edge that the exponential decreases towards,
    // so that the normalization cannot overflow
    let primitive = |mass: Float| {
        if slope < 0. {
            -exp(slope * (mass - axis.low))
        } else {
            exp(slope * (mass - axis.high))
        }
    };
    let total = primitive(axis.high) - primitive(axis.low);
    (0..axis.bins)
        .map(|bin| {
            let (low, high) = axis.bin_limits(bin);
            (primitive(high) - primitive(low)) / total
        })
        .collect()
}

/// Bin fractions of a template histogram, projected onto another axis
/// covering the same mass window
///
/// Template bins are spread uniformly over their width. Empty bins get a
/// small floor, so that data falling there does not make the likelihood
/// infinite.
///
pub fn template_fractions(template: &MassHistogram, axis: &MassAxis) -> Vec<Float> {
    let source = template.axis();
    debug_assert!(source.same_window(axis));
    let mut fractions = vec![0.; axis.bins];
    for (source_bin, &content) in template.contents().iter().enumerate() {
        let (source_low, source_high) = source.bin_limits(source_bin);
        let source_width = source_high - source_low;
        for (bin, fraction) in fractions.iter_mut().enumerate() {
            let (low, high) = axis.bin_limits(bin);
            let overlap = high.min(source_high) - low.max(source_low);
            if overlap > 0. {
                *fraction += content.max(0.) * overlap / source_width;
            }
        }
    }
    const FLOOR: Float = 1e-6;
    let total = fractions.iter().sum::<Float>();
    let floor = FLOOR * total.max(1.) / (axis.bins as Float);
    fractions.iter_mut().for_each(|fraction| *fraction += floor);
    let total = fractions.iter().sum::<Float>();
    fractions.iter_mut().for_each(|fraction| *fraction /= total);
    fractions
}

/// Detector resolution, modeled as a Crystal Ball function with a power-law
/// tail on the low mass side
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CrystalBall {
    /// Shift of the gaussian core (GeV)
    pub mean: Float,

    /// Width of the gaussian core (GeV)
    pub sigma: Float,

    /// Distance from the core to the tail, in units of sigma
    pub alpha: Float,

    /// Power of the tail
    pub n: Float,
}
//
impl CrystalBall {
    /// Power of the tail, which is not fitted
    pub const TAIL_POWER: Float = 5.;

    /// Unnormalized density at a given mass offset
    pub fn density(&self, offset: Float) -> Float {
        let t = (offset - self.mean) / self.sigma;
        let alpha = abs(self.alpha);
        if t >= -alpha {
            exp(-0.5 * t * t)
        } else {
            let a = (self.n / alpha).powf(self.n) * exp(-0.5 * alpha * alpha);
            let b = self.n / alpha - alpha;
            a / (b - t).powf(self.n)
        }
    }
}

/// Breit-Wigner density of the Z boson lineshape (unnormalized)
fn breit_wigner(mass: Float) -> Float {
    let half_width = 0.5 * z_boson::WIDTH;
    let delta = mass - z_boson::MASS;
    1. / (delta * delta + half_width * half_width)
}

/// Z lineshape convolved with the detector resolution
///
/// The convolution is carried out on a regular lattice which is shared by
/// the true and observed masses: the resolution function then only needs to
/// be evaluated once per lattice offset. The lattice extends beyond the mass
/// window so that resonances just outside of it smear into it.
///
#[derive(Clone)]
pub struct ResonanceShape {
    axis: MassAxis,
    step: Float,
    points_per_bin: usize,
    margin: usize,
    lineshape: Vec<Float>,
}
//
impl ResonanceShape {
    /// Target lattice spacing (GeV)
    const TARGET_STEP: Float = 0.25;

    /// Extent of the lattice beyond each side of the window (GeV)
    const MARGIN: Float = 10.;

    /// Prepare the convolution lattice for a mass axis
    pub fn new(axis: MassAxis) -> Self {
        let points_per_bin = ((axis.width() / Self::TARGET_STEP).ceil() as usize).max(1);
        let step = axis.width() / (points_per_bin as Float);
        let margin = (Self::MARGIN / step).ceil() as usize;
        let num_true = axis.bins * points_per_bin + 2 * margin;
        let lineshape = (0..num_true)
            .map(|j| breit_wigner(Self::lattice_mass(&axis, step, j as Float - margin as Float)))
            .collect();
        Self {
            axis,
            step,
            points_per_bin,
            margin,
            lineshape,
        }
    }

    fn lattice_mass(axis: &MassAxis, step: Float, index: Float) -> Float {
        axis.low + (index + 0.5) * step
    }

    /// Mass axis which the shape is computed for
    pub fn axis(&self) -> &MassAxis {
        &self.axis
    }

    /// Bin fractions for a given resolution
    pub fn fractions(&self, resolution: &CrystalBall) -> Vec<Float> {
        let num_observed = self.axis.bins * self.points_per_bin;
        let num_true = self.lineshape.len();

        // Observed point k and true point j are (k + margin - j) steps apart,
        // offsets are stored from the most negative one upwards
        let first_offset = self.margin as Float - (num_true - 1) as Float;
        let offsets = (0..num_observed + num_true - 1)
            .map(|d| resolution.density((first_offset + d as Float) * self.step))
            .collect::<Vec<_>>();
        let offset_index = |k: usize, j: usize| k + num_true - 1 - j;

        let mut fractions = vec![0.; self.axis.bins];
        for k in 0..num_observed {
            let density = self
                .lineshape
                .iter()
                .enumerate()
                .map(|(j, weight)| weight * offsets[offset_index(k, j)])
                .sum::<Float>();
            fractions[k / self.points_per_bin] += density;
        }
        let total = fractions.iter().sum::<Float>();
        if !(total > 0.) || !total.is_finite() {
            return vec![1. / (self.axis.bins as Float); self.axis.bins];
        }
        fractions.iter_mut().for_each(|fraction| *fraction /= total);
        fractions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn axis() -> MassAxis {
        MassAxis::new(60., 120., 30).unwrap()
    }

    fn resolution(sigma: Float) -> CrystalBall {
        CrystalBall {
            mean: 0.,
            sigma,
            alpha: 1.5,
            n: CrystalBall::TAIL_POWER,
        }
    }

    #[test]
    fn exponential_fractions_are_normalized() {
        for slope in [-0.3, -0.05, 0., 1e-12, 0.02] {
            let fractions = exponential_fractions(&axis(), slope);
            assert_relative_eq!(fractions.iter().sum::<Float>(), 1., epsilon = 1e-12);
            assert!(fractions.iter().all(|&f| f > 0.));
        }
        let falling = exponential_fractions(&axis(), -0.05);
        assert!(falling.windows(2).all(|pair| pair[0] > pair[1]));
        // Ratio of neighbouring bins is exp(slope * width)
        assert_relative_eq!(falling[1] / falling[0], (-0.1 as Float).exp(), epsilon = 1e-12);
    }

    #[test]
    fn template_projection_merges_fine_bins() {
        let fine = MassAxis::new(60., 120., 60).unwrap();
        let contents = (0..60).map(|bin| (bin % 7) as Float).collect::<Vec<_>>();
        let template = MassHistogram::from_contents(fine, contents.clone());
        let fractions = template_fractions(&template, &axis());
        let total = contents.iter().sum::<Float>();
        for bin in 0..30 {
            let expected = (contents[2 * bin] + contents[2 * bin + 1]) / total;
            assert_relative_eq!(fractions[bin], expected, epsilon = 1e-5);
        }
        assert_relative_eq!(fractions.iter().sum::<Float>(), 1., epsilon = 1e-12);
        // Empty bins stay fittable
        assert!(fractions.iter().all(|&f| f > 0.));
    }

    #[test]
    fn crystal_ball_is_continuous_at_the_tail_junction() {
        let cb = resolution(2.);
        let junction = cb.mean - cb.alpha * cb.sigma;
        assert_relative_eq!(cb.density(junction - 1e-9), cb.density(junction + 1e-9), epsilon = 1e-6);
        assert_relative_eq!(cb.density(0.), 1.);
        // Power-law tail is heavier than the gaussian
        assert!(cb.density(-10.) > (-0.5 * 25. as Float).exp());
    }

    #[test]
    fn resonance_peaks_at_the_z_mass() {
        let shape = ResonanceShape::new(axis());
        let fractions = shape.fractions(&resolution(1.5));
        assert_relative_eq!(fractions.iter().sum::<Float>(), 1., epsilon = 1e-12);
        let peak = (0..30)
            .max_by(|&a, &b| fractions[a].total_cmp(&fractions[b]))
            .unwrap();
        assert!(shape.axis().bin_limits(peak).0 <= 91.2 && shape.axis().bin_limits(peak).1 >= 91.2);
        // The low-side tail makes the spectrum asymmetric around the peak
        assert!(fractions[peak - 5] > fractions[peak + 5]);
        // A shift of the resolution moves the peak
        let shifted = shape.fractions(&CrystalBall {
            mean: 4.,
            ..resolution(1.5)
        });
        let shifted_peak = (0..30)
            .max_by(|&a, &b| shifted[a].total_cmp(&shifted[b]))
            .unwrap();
        assert_eq!(shifted_peak, peak + 2);
    }
}
