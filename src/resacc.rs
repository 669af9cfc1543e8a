//! This module accumulates selected probes into per-bin mass histograms

use crate::{
    binning::{KinematicBin, KinematicBinning, PileupBinning, PileupStratum},
    config::{Configuration, EfficiencyKind},
    evcut::CutOutcome,
    histogram::{MassAxis, MassHistogram},
    probe::ProbeRecord,
};
use std::{
    io::{self, Write},
    ops::AddAssign,
};

/// Running counters of the probe selection, for data-quality sanity checks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeCounters {
    /// Tag-probe pairs read from either stream
    pub total: usize,

    /// ...with a probe above the Et threshold
    pub pass_et: usize,

    /// ...and a probe within the eta acceptance
    pub pass_eta: usize,

    /// ...and a tag-probe mass within the window
    pub in_mass_window: usize,

    /// Fully selected probes outside of the (Et, eta) binning
    pub outside_binning: usize,

    /// Fully selected probes with a vertex count outside of the pileup bins
    pub pileup_excluded: usize,

    /// Records read from the passing probes stream
    pub passed_probes: usize,

    /// Records read from the failing probes stream
    pub failed_probes: usize,
}
//
impl AddAssign for ProbeCounters {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.pass_et += other.pass_et;
        self.pass_eta += other.pass_eta;
        self.in_mass_window += other.in_mass_window;
        self.outside_binning += other.outside_binning;
        self.pileup_excluded += other.pileup_excluded;
        self.passed_probes += other.passed_probes;
        self.failed_probes += other.failed_probes;
    }
}
//
impl ProbeCounters {
    /// Write the counters down in fixed-width columns
    pub fn write_summary(
        &self,
        out: &mut impl Write,
        eff_kind: EfficiencyKind,
        et_min: f64,
        mass_window: &MassAxis,
    ) -> io::Result<()> {
        let pairs = if eff_kind == EfficiencyKind::Reco {
            "Total tag(electron)-probe(supercluster) pairs"
        } else {
            "Total tag-probe pairs"
        };
        let rows = [
            (pairs.to_owned(), self.total),
            (format!("               probe Et>{et_min}"), self.pass_et),
            ("               probe eta in acceptance".to_owned(), self.pass_eta),
            (
                format!(
                    "               tag-probe mass in {}-{} GeV window",
                    mass_window.low, mass_window.high
                ),
                self.in_mass_window,
            ),
            ("               outside of the Et/eta binning".to_owned(), self.outside_binning),
            ("               outside of the pileup binning".to_owned(), self.pileup_excluded),
        ];
        for (label, count) in rows {
            writeln!(out, "{label:<61}{count:>15}")?;
        }
        writeln!(out)?;
        let probes = [
            ("Number of probes, total", self.passed_probes + self.failed_probes),
            ("Number of probes, passed", self.passed_probes),
            ("Number of probes, failed", self.failed_probes),
        ];
        for (label, count) in probes {
            writeln!(out, "{label:<61}{count:>15}")?;
        }
        Ok(())
    }
}

/// Mass histograms of the passing and failing probes of one bin
#[derive(Clone, Debug, PartialEq)]
pub struct BinHistograms {
    /// Passing probes
    pub pass: MassHistogram,

    /// Failing probes
    pub fail: MassHistogram,
}
//
impl BinHistograms {
    fn new(axis: MassAxis) -> Self {
        Self {
            pass: MassHistogram::new(axis),
            fail: MassHistogram::new(axis),
        }
    }

    fn fill(&mut self, probe: &ProbeRecord) {
        let channel = if probe.passed {
            &mut self.pass
        } else {
            &mut self.fail
        };
        channel.fill(probe.mass, probe.weight);
    }

    fn merge(&mut self, other: &Self) {
        self.pass.merge(&other.pass);
        self.fail.merge(&other.fail);
    }
}

/// Per-bin histograms of one pileup stratum
#[derive(Clone, Debug, PartialEq)]
pub struct StratumHistograms {
    /// Pileup stratum
    pub stratum: PileupStratum,

    /// Histograms of each (Et, eta) bin, in flat index order
    pub bins: Vec<BinHistograms>,
}

/// This struct accumulates probes into histograms, and can be merged with
/// accumulators that processed other chunks of the input.
pub struct ProbeAccumulator<'cfg> {
    /// Configuration of the measurement
    cfg: &'cfg Configuration,

    /// Selection counters
    counters: ProbeCounters,

    /// Pileup-inclusive histograms of each (Et, eta) bin
    bins: Vec<BinHistograms>,

    /// Histograms of each pileup stratum (empty if not needed)
    strata: Vec<StratumHistograms>,
}
//
impl<'cfg> ProbeAccumulator<'cfg> {
    /// Prepare for probe accumulation
    pub fn new(cfg: &'cfg Configuration) -> Self {
        let num_bins = cfg.binning.count();
        let strata = if cfg.keeps_strata() {
            cfg.pileup
                .strata()
                .map(|stratum| StratumHistograms {
                    stratum,
                    bins: vec![BinHistograms::new(cfg.template_axis); num_bins],
                })
                .collect()
        } else {
            Vec::new()
        };
        Self {
            cfg,
            counters: ProbeCounters::default(),
            bins: vec![BinHistograms::new(cfg.mass_axis); num_bins],
            strata,
        }
    }

    /// Integrate one probe into the histograms
    pub fn integrate(&mut self, probe: &ProbeRecord) {
        let counters = &mut self.counters;
        counters.total += 1;
        if probe.passed {
            counters.passed_probes += 1;
        } else {
            counters.failed_probes += 1;
        }

        // Each cut that the probe survives bumps the matching counter
        match self.cfg.probe_cut.check(probe) {
            CutOutcome::FailedEt => return,
            CutOutcome::FailedEta => {
                counters.pass_et += 1;
                return;
            }
            CutOutcome::FailedMassWindow => {
                counters.pass_et += 1;
                counters.pass_eta += 1;
                return;
            }
            CutOutcome::Kept => {
                counters.pass_et += 1;
                counters.pass_eta += 1;
                counters.in_mass_window += 1;
            }
        }

        // The probe is fully selected at this point
        let binning = &self.cfg.binning;
        let Some(bin) = binning.find(probe.et, probe.eta) else {
            counters.outside_binning += 1;
            return;
        };
        let flat = binning.flat_index(bin);
        self.bins[flat].fill(probe);

        // Stratified histograms skip probes which cannot be stratified, but
        // these still count in the inclusive histograms above
        if !self.strata.is_empty() {
            let pileup = self.cfg.pileup;
            match pileup.slot(pileup.stratum(probe.n_good_pv)) {
                Some(slot) => self.strata[slot].bins[flat].fill(probe),
                None => counters.pileup_excluded += 1,
            }
        }
    }

    /// Integrate the results of another accumulator
    #[allow(clippy::needless_pass_by_value)]
    pub fn merge(&mut self, other: Self) {
        self.counters += other.counters;
        for (mine, theirs) in self.bins.iter_mut().zip(&other.bins) {
            mine.merge(theirs);
        }
        for (mine, theirs) in self.strata.iter_mut().zip(&other.strata) {
            debug_assert_eq!(mine.stratum, theirs.stratum);
            for (mine, theirs) in mine.bins.iter_mut().zip(&theirs.bins) {
                mine.merge(theirs);
            }
        }
    }

    /// Freeze the accumulated histograms
    pub fn finalize(self) -> SampleHistograms {
        SampleHistograms {
            binning: self.cfg.binning,
            pileup: self.cfg.pileup,
            counters: self.counters,
            bins: self.bins,
            strata: self.strata,
        }
    }
}

/// Frozen histograms of a whole sample
#[derive(Clone, Debug, PartialEq)]
pub struct SampleHistograms {
    /// (Et, eta) binning of the histograms
    pub binning: KinematicBinning,

    /// Pileup stratification of the histograms
    pub pileup: PileupBinning,

    /// Selection counters
    pub counters: ProbeCounters,

    /// Pileup-inclusive histograms, in flat bin order
    pub bins: Vec<BinHistograms>,

    /// Per-stratum histograms, in slot order (empty if not accumulated)
    pub strata: Vec<StratumHistograms>,
}
//
impl SampleHistograms {
    /// Pileup-inclusive histograms of a bin
    pub fn bin(&self, bin: KinematicBin) -> &BinHistograms {
        &self.bins[self.binning.flat_index(bin)]
    }

    /// Histograms of a bin within a pileup stratum, if they were accumulated
    pub fn stratum_bin(&self, stratum: PileupStratum, bin: KinematicBin) -> Option<&BinHistograms> {
        let slot = self.pileup.slot(stratum)?;
        let strata = self.strata.get(slot)?;
        Some(&strata.bins[self.binning.flat_index(bin)])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        binning::{EtBinSet, EtaBinSet, ECAL_GAP_LOW},
        config::{CalcMethod, FitSettings, SampleType},
        evcut::ProbeCut,
        random::RandomGenerator,
    };

    pub(crate) fn configuration(
        sample: SampleType,
        eta: EtaBinSet,
        pileup_dependence: bool,
    ) -> Configuration {
        let mass_axis = MassAxis::new(60., 120., 30).unwrap();
        Configuration {
            sample,
            eff_kind: EfficiencyKind::Id,
            calc_method: CalcMethod::CountNCount,
            binning: KinematicBinning::new(EtBinSet::EtBins2, eta),
            pileup: PileupBinning::new(pileup_dependence),
            pileup_reweight: false,
            dir_tag: "test".to_owned(),
            ntuple_files: Vec::new(),
            probe_cut: ProbeCut::new(10., eta, mass_axis),
            mass_axis,
            template_axis: MassAxis::new(60., 120., 60).unwrap(),
            fit: FitSettings::default(),
        }
    }

    fn probe(mass: f64, et: f64, eta: f64, n_good_pv: u32, passed: bool) -> ProbeRecord {
        ProbeRecord {
            mass,
            et,
            eta,
            n_good_pv,
            weight: 1.,
            passed,
        }
    }

    #[test]
    fn counters_follow_the_cut_sequence() {
        let cfg = configuration(SampleType::Data, EtaBinSet::EtaBins2, false);
        let mut acc = ProbeAccumulator::new(&cfg);
        acc.integrate(&probe(91., 5., 0.3, 10, true));
        acc.integrate(&probe(91., 25., 1.5, 10, true));
        acc.integrate(&probe(150., 25., 0.3, 10, false));
        acc.integrate(&probe(91., 25., 2.7, 10, false));
        acc.integrate(&probe(91., 25., 0.3, 10, true));
        let sample = acc.finalize();
        let counters = sample.counters;
        assert_eq!(counters.total, 5);
        assert_eq!(counters.pass_et, 4);
        assert_eq!(counters.pass_eta, 3);
        assert_eq!(counters.in_mass_window, 2);
        assert_eq!(counters.outside_binning, 1);
        assert_eq!(counters.passed_probes, 3);
        assert_eq!(counters.failed_probes, 2);
        let bin = sample.bin(KinematicBin { et: 1, eta: 0 });
        assert_eq!(bin.pass.integral(), 1.);
        assert_eq!(bin.fail.integral(), 0.);
        assert!(sample.strata.is_empty());
    }

    #[test]
    fn gap_boundary_probes_are_dropped_everywhere() {
        let cfg = configuration(SampleType::Mc, EtaBinSet::EtaBins2, false);
        let mut acc = ProbeAccumulator::new(&cfg);
        acc.integrate(&probe(91., 25., ECAL_GAP_LOW, 10, true));
        acc.integrate(&probe(91., 25., -ECAL_GAP_LOW, 10, false));
        let sample = acc.finalize();
        let all_empty = |bins: &[BinHistograms]| {
            bins.iter()
                .all(|bin| bin.pass.entries() == 0 && bin.fail.entries() == 0)
        };
        assert!(all_empty(&sample.bins));
        assert_eq!(sample.strata.len(), 1);
        assert!(all_empty(&sample.strata[0].bins));
        assert_eq!(sample.counters.pass_eta, 0);

        // Without gap exclusion, the same probes are kept
        let cfg = configuration(SampleType::Mc, EtaBinSet::EtaBins1, false);
        let mut acc = ProbeAccumulator::new(&cfg);
        acc.integrate(&probe(91., 25., ECAL_GAP_LOW, 10, true));
        let sample = acc.finalize();
        assert_eq!(sample.bin(KinematicBin { et: 1, eta: 0 }).pass.entries(), 1);
        assert_eq!(sample.strata[0].bins[1].pass.entries(), 1);
    }

    #[test]
    fn excluded_pileup_only_skips_stratified_histograms() {
        let cfg = configuration(SampleType::Mc, EtaBinSet::EtaBins1, true);
        let mut acc = ProbeAccumulator::new(&cfg);
        acc.integrate(&probe(91., 15., 0.3, 3, true));
        acc.integrate(&probe(91., 15., 0.3, 250, true));
        let sample = acc.finalize();
        let bin = KinematicBin { et: 0, eta: 0 };
        assert_eq!(sample.bin(bin).pass.entries(), 2);
        let first = sample.stratum_bin(PileupStratum::Bin(0), bin).unwrap();
        assert_eq!(first.pass.entries(), 1);
        let stratified: usize = sample
            .strata
            .iter()
            .map(|stratum| stratum.bins[0].pass.entries())
            .sum();
        assert_eq!(stratified, 1);
        assert_eq!(sample.counters.pileup_excluded, 1);
        assert!(sample.stratum_bin(PileupStratum::Combined, bin).is_none());
    }

    #[test]
    fn accumulation_is_order_independent() {
        let cfg = configuration(SampleType::Mc, EtaBinSet::EtaBins2, true);
        let mut rng = RandomGenerator::new(7);
        let probes = (0..2000)
            .map(|_| {
                let [u_mass, u_et, u_eta, u_pv, u_w] = rng.random_array::<5>();
                ProbeRecord {
                    mass: 50. + 80. * u_mass,
                    et: 5. + 60. * u_et,
                    eta: -3. + 6. * u_eta,
                    n_good_pv: (40. * u_pv) as u32,
                    // Multiples of 1/4 add up exactly in any order
                    weight: (1. + (4. * u_w).floor()) / 4.,
                    passed: u_mass < 0.7,
                }
            })
            .collect::<Vec<_>>();

        let accumulate = |probes: &mut dyn Iterator<Item = &ProbeRecord>| {
            let mut acc = ProbeAccumulator::new(&cfg);
            probes.for_each(|probe| acc.integrate(probe));
            acc.finalize()
        };
        let forward = accumulate(&mut probes.iter());
        let backward = accumulate(&mut probes.iter().rev());
        assert_eq!(forward, backward);

        // Sharding and merging must give the same answer too
        let mut first = ProbeAccumulator::new(&cfg);
        probes[..700].iter().for_each(|probe| first.integrate(probe));
        let mut second = ProbeAccumulator::new(&cfg);
        probes[700..].iter().for_each(|probe| second.integrate(probe));
        second.merge(first);
        assert_eq!(second.finalize(), forward);
    }

    #[test]
    fn counter_summary_is_fixed_width() {
        let counters = ProbeCounters {
            total: 12,
            pass_et: 11,
            pass_eta: 10,
            in_mass_window: 9,
            outside_binning: 1,
            pileup_excluded: 0,
            passed_probes: 8,
            failed_probes: 4,
        };
        let mut out = Vec::new();
        let window = MassAxis::new(60., 120., 30).unwrap();
        counters
            .write_summary(&mut out, EfficiencyKind::Reco, 10., &window)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("Total tag(electron)-probe(supercluster) pairs"));
        assert!(first.ends_with("             12"));
        assert_eq!(first.len(), 76);
        assert!(text.contains("tag-probe mass in 60-120 GeV window"));
    }
}
