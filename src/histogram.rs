//! Fixed-width invariant mass histograms

use crate::{
    error::{Error, Result},
    numeric::Float,
};
use serde::{Deserialize, Serialize};

/// Regular binning of the tag-probe invariant mass
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MassAxis {
    /// Lower edge of the mass window (GeV)
    pub low: Float,

    /// Upper edge of the mass window (GeV)
    pub high: Float,

    /// Number of bins
    pub bins: usize,
}
//
impl MassAxis {
    /// Set up a mass axis, checking that it makes sense
    pub fn new(low: Float, high: Float, bins: usize) -> Result<Self> {
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(Error::Configuration(format!(
                "invalid mass window [{low}, {high}]"
            )));
        }
        if bins == 0 {
            return Err(Error::Configuration(
                "mass histograms need at least one bin".to_owned(),
            ));
        }
        Ok(Self { low, high, bins })
    }

    /// Width of each bin
    pub fn width(&self) -> Float {
        (self.high - self.low) / (self.bins as Float)
    }

    /// Truth that a mass lies in the window (both edges included)
    pub fn contains(&self, mass: Float) -> bool {
        mass >= self.low && mass <= self.high
    }

    /// Bin of a mass value, the upper window edge belonging to the last bin
    pub fn find_bin(&self, mass: Float) -> Option<usize> {
        if !self.contains(mass) {
            return None;
        }
        let index = ((mass - self.low) / self.width()) as usize;
        Some(index.min(self.bins - 1))
    }

    /// Lower and upper edge of a bin
    pub fn bin_limits(&self, index: usize) -> (Float, Float) {
        let width = self.width();
        let low = self.low + (index as Float) * width;
        (low, low + width)
    }

    /// Truth that two axes cover the same mass window
    pub fn same_window(&self, other: &Self) -> bool {
        self.low == other.low && self.high == other.high
    }
}

/// Weighted histogram of tag-probe invariant masses
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MassHistogram {
    axis: MassAxis,
    sum_w: Vec<Float>,
    sum_w2: Vec<Float>,
    entries: usize,
}
//
impl MassHistogram {
    /// Create an empty histogram
    pub fn new(axis: MassAxis) -> Self {
        Self {
            axis,
            sum_w: vec![0.; axis.bins],
            sum_w2: vec![0.; axis.bins],
            entries: 0,
        }
    }

    /// Build a histogram from known bin contents (unit weight variances)
    #[cfg(test)]
    pub fn from_contents(axis: MassAxis, contents: Vec<Float>) -> Self {
        assert_eq!(contents.len(), axis.bins);
        let sum_w2 = contents.clone();
        Self {
            axis,
            entries: contents.iter().sum::<Float>().round() as usize,
            sum_w: contents,
            sum_w2,
        }
    }

    /// Mass axis of this histogram
    pub fn axis(&self) -> &MassAxis {
        &self.axis
    }

    /// Record one probe, returns false if its mass is outside the window
    pub fn fill(&mut self, mass: Float, weight: Float) -> bool {
        match self.axis.find_bin(mass) {
            Some(bin) => {
                self.sum_w[bin] += weight;
                self.sum_w2[bin] += weight * weight;
                self.entries += 1;
                true
            }
            None => false,
        }
    }

    /// Sum of weights in each bin
    pub fn contents(&self) -> &[Float] {
        &self.sum_w[..]
    }

    /// Sum of squared weights in each bin
    pub fn sum_w2(&self) -> &[Float] {
        &self.sum_w2[..]
    }

    /// Number of fill operations
    #[allow(dead_code)]
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Sum of weights over the whole window
    pub fn integral(&self) -> Float {
        self.sum_w.iter().sum()
    }

    /// Add the contents of another histogram with the same axis
    pub fn merge(&mut self, other: &Self) {
        assert_eq!(self.axis, other.axis, "Merged histograms must share an axis");
        for (mine, theirs) in self.sum_w.iter_mut().zip(&other.sum_w) {
            *mine += theirs;
        }
        for (mine, theirs) in self.sum_w2.iter_mut().zip(&other.sum_w2) {
            *mine += theirs;
        }
        self.entries += other.entries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis() -> MassAxis {
        MassAxis::new(60., 120., 30).unwrap()
    }

    #[test]
    fn window_edges_are_inclusive() {
        let axis = axis();
        assert_eq!(axis.find_bin(60.), Some(0));
        assert_eq!(axis.find_bin(61.999), Some(0));
        assert_eq!(axis.find_bin(62.), Some(1));
        assert_eq!(axis.find_bin(120.), Some(29));
        assert_eq!(axis.find_bin(59.99), None);
        assert_eq!(axis.find_bin(120.01), None);
        assert_eq!(axis.bin_limits(1), (62., 64.));
    }

    #[test]
    fn fill_accumulates_weights() {
        let mut hist = MassHistogram::new(axis());
        assert!(hist.fill(91., 0.5));
        assert!(hist.fill(91.5, 2.));
        assert!(!hist.fill(130., 1.));
        assert_eq!(hist.entries(), 2);
        assert_eq!(hist.contents()[15], 2.5);
        assert_eq!(hist.sum_w2()[15], 4.25);
        assert_eq!(hist.integral(), 2.5);
    }

    #[test]
    fn merge_is_bin_wise_addition() {
        let mut first = MassHistogram::new(axis());
        first.fill(70., 1.);
        let mut second = MassHistogram::new(axis());
        second.fill(70., 1.);
        second.fill(110., 0.25);
        first.merge(&second);
        assert_eq!(first.contents()[5], 2.);
        assert_eq!(first.contents()[25], 0.25);
        assert_eq!(first.entries(), 3);
    }

    #[test]
    #[should_panic]
    fn merge_rejects_other_axes() {
        let mut first = MassHistogram::new(axis());
        let second = MassHistogram::new(MassAxis::new(60., 120., 60).unwrap());
        first.merge(&second);
    }

    #[test]
    fn bad_axes_are_configuration_errors() {
        assert!(MassAxis::new(120., 60., 30).is_err());
        assert!(MassAxis::new(60., 120., 0).is_err());
    }
}
