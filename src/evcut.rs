//! Mechanism to apply the kinematic cuts to selected probes

use crate::{
    binning::{is_ecal_gap, EtaBinSet},
    histogram::MassAxis,
    numeric::Float,
    probe::ProbeRecord,
};

/// Cuts on tag-probe pairs, applied before histogramming
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbeCut {
    /// Cut on minimum probe transverse energy (GeV)
    pub et_min: Float,

    /// Truth that probes in the ECAL gap must be dropped
    pub exclude_gap: bool,

    /// Cut on the tag-probe invariant mass
    pub mass_window: MassAxis,
}

/// Fate of a probe with respect to the cuts
///
/// The cuts are applied in a fixed order, and the first one which rejects
/// the probe is reported, which is what the sanity counters rely on.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CutOutcome {
    /// Probe Et is below the threshold
    FailedEt,
    /// Probe lies in the excluded ECAL gap
    FailedEta,
    /// Tag-probe mass lies outside the window
    FailedMassWindow,
    /// Probe passes every cut
    Kept,
}
//
impl ProbeCut {
    /// Setup the cuts on probes
    pub fn new(et_min: Float, eta_binning: EtaBinSet, mass_window: MassAxis) -> Self {
        Self {
            et_min,
            exclude_gap: eta_binning.excludes_gap(),
            mass_window,
        }
    }

    /// Decide whether a probe passes the cuts, or which cut rejects it
    pub fn check(&self, probe: &ProbeRecord) -> CutOutcome {
        // NaN Et must not sneak through
        if !(probe.et >= self.et_min) {
            return CutOutcome::FailedEt;
        }
        if self.exclude_gap && is_ecal_gap(probe.eta) {
            return CutOutcome::FailedEta;
        }
        if !self.mass_window.contains(probe.mass) {
            return CutOutcome::FailedMassWindow;
        }
        CutOutcome::Kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binning::ECAL_GAP_HIGH;

    fn probe(mass: Float, et: Float, eta: Float) -> ProbeRecord {
        ProbeRecord {
            mass,
            et,
            eta,
            n_good_pv: 10,
            weight: 1.,
            passed: true,
        }
    }

    fn cut(eta_binning: EtaBinSet) -> ProbeCut {
        ProbeCut::new(10., eta_binning, MassAxis::new(60., 120., 30).unwrap())
    }

    #[test]
    fn cuts_are_applied_in_order() {
        let cut = cut(EtaBinSet::EtaBins2);
        assert_eq!(cut.check(&probe(91., 25., 0.5)), CutOutcome::Kept);
        assert_eq!(cut.check(&probe(91., 9.99, 0.5)), CutOutcome::FailedEt);
        assert_eq!(cut.check(&probe(30., 9.99, 1.5)), CutOutcome::FailedEt);
        assert_eq!(cut.check(&probe(30., 25., 1.5)), CutOutcome::FailedEta);
        assert_eq!(cut.check(&probe(30., 25., 0.5)), CutOutcome::FailedMassWindow);
        assert_eq!(cut.check(&probe(120., 10., 0.5)), CutOutcome::Kept);
        assert_eq!(cut.check(&probe(91., Float::NAN, 0.5)), CutOutcome::FailedEt);
    }

    #[test]
    fn gap_is_only_excluded_by_the_barrel_endcap_split() {
        let on_edge = probe(91., 25., -ECAL_GAP_HIGH);
        assert_eq!(cut(EtaBinSet::EtaBins2).check(&on_edge), CutOutcome::FailedEta);
        assert_eq!(cut(EtaBinSet::EtaBins5).check(&on_edge), CutOutcome::Kept);
        assert_eq!(cut(EtaBinSet::EtaBins1).check(&on_edge), CutOutcome::Kept);
    }
}
