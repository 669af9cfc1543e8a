//! Binning of the probe kinematics (Et, eta) and of the pileup

use crate::{
    error::{Error, Result},
    numeric::{floats::INFINITY, Float},
};
use prefix_num_ops::real::*;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Lower edge of the ECAL barrel/endcap transition region in |eta|
pub const ECAL_GAP_LOW: Float = 1.4442;

/// Upper edge of the ECAL barrel/endcap transition region in |eta|
pub const ECAL_GAP_HIGH: Float = 1.566;

/// Truth that a probe lies in the ECAL barrel/endcap gap (edges included)
pub fn is_ecal_gap(eta: Float) -> bool {
    let abs_eta = abs(eta);
    (ECAL_GAP_LOW..=ECAL_GAP_HIGH).contains(&abs_eta)
}

/// Locate a value within an ordered list of bin edges
///
/// Bins are half-open `[low, high)`, except for the topmost one which also
/// contains its upper edge. NaN and values outside of the edges yield `None`.
///
fn find_in_edges(edges: &[Float], value: Float) -> Option<usize> {
    if edges.len() < 2 {
        return None;
    }
    let (first, last) = (edges[0], edges[edges.len() - 1]);
    // Written this way so that NaN is rejected too
    if !(value >= first && value <= last) {
        return None;
    }
    let num_edges_below = edges.partition_point(|&edge| edge <= value);
    Some((num_edges_below - 1).min(edges.len() - 2))
}

/// Common behaviour of one-dimensional binning schemes
pub trait BinningScheme: Copy {
    /// Ordered bin edges of the scheme
    fn edges(self) -> &'static [Float];

    /// Name of the scheme, as used in configuration files
    fn name(self) -> &'static str;

    /// Number of bins
    fn count(self) -> usize {
        self.edges().len() - 1
    }

    /// Bin index of a value, or `None` if it lies outside of the scheme
    fn find_bin(self, value: Float) -> Option<usize> {
        find_in_edges(self.edges(), value)
    }

    /// Lower and upper edge of a bin
    fn limits(self, index: usize) -> (Float, Float) {
        let edges = self.edges();
        (edges[index], edges[index + 1])
    }
}

/// Parse a scheme by its configuration name
fn parse_scheme<S: BinningScheme>(all: &[S], axis: &str, name: &str) -> Result<S> {
    let name = name.trim();
    all.iter()
        .copied()
        .find(|scheme| scheme.name() == name)
        .ok_or_else(|| Error::Configuration(format!("unrecognized {axis} binning {name:?}")))
}

// ### TRANSVERSE ENERGY ###

/// Supercluster Et binning schemes
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EtBinSet {
    EtBins1,
    EtBins2,
    EtBins3,
    EtBins5,
    EtBins6,
}
//
impl EtBinSet {
    /// Every known Et scheme
    pub const ALL: [Self; 5] = [
        Self::EtBins1,
        Self::EtBins2,
        Self::EtBins3,
        Self::EtBins5,
        Self::EtBins6,
    ];
}
//
impl BinningScheme for EtBinSet {
    fn edges(self) -> &'static [Float] {
        match self {
            Self::EtBins1 => &[10., INFINITY],
            Self::EtBins2 => &[10., 20., INFINITY],
            Self::EtBins3 => &[10., 30., 50., INFINITY],
            Self::EtBins5 => &[10., 20., 30., 40., 50., INFINITY],
            Self::EtBins6 => &[10., 15., 20., 30., 40., 50., INFINITY],
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::EtBins1 => "ETBINS1",
            Self::EtBins2 => "ETBINS2",
            Self::EtBins3 => "ETBINS3",
            Self::EtBins5 => "ETBINS5",
            Self::EtBins6 => "ETBINS6",
        }
    }
}
//
impl FromStr for EtBinSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_scheme(&Self::ALL, "Et", s)
    }
}
//
impl fmt::Display for EtBinSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ### PSEUDORAPIDITY ###

/// Supercluster |eta| binning schemes
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EtaBinSet {
    EtaBins1,
    EtaBins2,
    EtaBins3,
    EtaBins5,
}
//
impl EtaBinSet {
    /// Every known eta scheme
    pub const ALL: [Self; 4] = [
        Self::EtaBins1,
        Self::EtaBins2,
        Self::EtaBins3,
        Self::EtaBins5,
    ];

    /// Truth that probes falling in the ECAL gap must be dropped
    ///
    /// Only the barrel/endcap split does this: the other schemes either
    /// ignore the gap or give it a bin of its own.
    pub fn excludes_gap(self) -> bool {
        self == Self::EtaBins2
    }
}
//
impl BinningScheme for EtaBinSet {
    fn edges(self) -> &'static [Float] {
        match self {
            Self::EtaBins1 => &[0., 2.5],
            Self::EtaBins2 => &[0., ECAL_GAP_LOW, 2.5],
            Self::EtaBins3 => &[0., 0.8, ECAL_GAP_LOW, 2.5],
            Self::EtaBins5 => &[0., 0.8, ECAL_GAP_LOW, ECAL_GAP_HIGH, 2., 2.5],
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::EtaBins1 => "ETABINS1",
            Self::EtaBins2 => "ETABINS2",
            Self::EtaBins3 => "ETABINS3",
            Self::EtaBins5 => "ETABINS5",
        }
    }

    // Eta bins are symmetric around zero
    fn find_bin(self, eta: Float) -> Option<usize> {
        find_in_edges(self.edges(), abs(eta))
    }
}
//
impl FromStr for EtaBinSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_scheme(&Self::ALL, "eta", s)
    }
}
//
impl fmt::Display for EtaBinSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ### TWO-DIMENSIONAL KINEMATIC BINS ###

/// One (Et, eta) cell of the efficiency measurement
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KinematicBin {
    /// Index within the Et scheme
    pub et: usize,

    /// Index within the eta scheme
    pub eta: usize,
}
//
impl fmt::Display for KinematicBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(et {}, eta {})", self.et, self.eta)
    }
}

/// Combination of an Et and an eta binning scheme
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KinematicBinning {
    /// Et binning
    pub et: EtBinSet,

    /// Eta binning
    pub eta: EtaBinSet,
}
//
impl KinematicBinning {
    /// Combine an Et and an eta scheme
    pub fn new(et: EtBinSet, eta: EtaBinSet) -> Self {
        Self { et, eta }
    }

    /// Total number of (Et, eta) cells
    pub fn count(&self) -> usize {
        self.et.count() * self.eta.count()
    }

    /// Locate a probe, if it falls within both schemes
    pub fn find(&self, et: Float, eta: Float) -> Option<KinematicBin> {
        Some(KinematicBin {
            et: self.et.find_bin(et)?,
            eta: self.eta.find_bin(eta)?,
        })
    }

    /// Row-major flat index of a cell (Et is the slow axis)
    pub fn flat_index(&self, bin: KinematicBin) -> usize {
        debug_assert!(bin.et < self.et.count() && bin.eta < self.eta.count());
        self.eta.count() * bin.et + bin.eta
    }

    /// Inverse of `flat_index`
    pub fn bin_from_flat(&self, flat: usize) -> KinematicBin {
        debug_assert!(flat < self.count());
        let num_eta = self.eta.count();
        KinematicBin {
            et: flat / num_eta,
            eta: flat % num_eta,
        }
    }

    /// Iterate over every cell in flat index order
    pub fn bins(&self) -> impl Iterator<Item = KinematicBin> + '_ {
        (0..self.count()).map(move |flat| self.bin_from_flat(flat))
    }
}

// ### PILEUP ###

/// Number of pileup bins used when pileup dependence is enabled
pub const NUM_PU_BINS: usize = 7;

/// Edges of the pileup bins, in number of good primary vertices
const PU_BIN_LIMITS: [Float; NUM_PU_BINS + 1] = [0., 5., 10., 15., 20., 25., 30., 100.];

/// Pileup stratum that a probe was assigned to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PileupStratum {
    /// Pileup dependence is disabled, all probes share one stratum
    Combined,

    /// Vertex count falls in this pileup bin
    Bin(usize),

    /// Pileup dependence is enabled, but the vertex count lies outside of
    /// the pileup binning: the probe cannot be stratified
    Excluded,
}
//
impl fmt::Display for PileupStratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Combined => f.write_str("combined"),
            Self::Bin(index) => write!(f, "pu{index}"),
            Self::Excluded => f.write_str("excluded"),
        }
    }
}

/// Assignment of probes to pileup strata
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PileupBinning {
    dependent: bool,
}
//
impl PileupBinning {
    /// Set up pileup stratification, which may be disabled
    pub fn new(dependent: bool) -> Self {
        Self { dependent }
    }

    /// Truth that probes are split by pileup
    pub fn is_dependent(self) -> bool {
        self.dependent
    }

    /// Stratum of a probe with a given number of good primary vertices
    pub fn stratum(self, n_good_pv: u32) -> PileupStratum {
        if !self.dependent {
            return PileupStratum::Combined;
        }
        find_in_edges(&PU_BIN_LIMITS, Float::from(n_good_pv))
            .map_or(PileupStratum::Excluded, PileupStratum::Bin)
    }

    /// Number of strata that histograms must be kept for
    pub fn num_slots(self) -> usize {
        if self.dependent {
            NUM_PU_BINS
        } else {
            1
        }
    }

    /// Storage slot of a stratum, `None` for strata which are not stored
    pub fn slot(self, stratum: PileupStratum) -> Option<usize> {
        match stratum {
            PileupStratum::Combined if !self.dependent => Some(0),
            PileupStratum::Bin(index) if self.dependent && index < NUM_PU_BINS => Some(index),
            _ => None,
        }
    }

    /// Stratum stored in a given slot
    pub fn stratum_of_slot(self, slot: usize) -> PileupStratum {
        debug_assert!(slot < self.num_slots());
        if self.dependent {
            PileupStratum::Bin(slot)
        } else {
            PileupStratum::Combined
        }
    }

    /// Iterate over the stored strata in slot order
    pub fn strata(self) -> impl Iterator<Item = PileupStratum> {
        (0..self.num_slots()).map(move |slot| self.stratum_of_slot(slot))
    }
}
