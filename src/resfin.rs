//! This module contains everything that is needed to collect, store, and
//! analyze the final results: one efficiency per (Et, eta) cell

use crate::{
    binning::{BinningScheme, KinematicBin, KinematicBinning},
    error::{Error, Result},
    estimator::{EfficiencyResult, EfficiencyStatus},
};

/// Efficiency grid being filled, cell by cell
pub struct EfficiencyGrid {
    /// Binning of the measurement
    binning: KinematicBinning,

    /// Results of each cell, in flat index order
    cells: Vec<Option<EfficiencyResult>>,
}
//
impl EfficiencyGrid {
    /// Prepare an empty grid
    pub fn new(binning: KinematicBinning) -> Self {
        Self {
            binning,
            cells: vec![None; binning.count()],
        }
    }

    /// Record the efficiency of a cell, replacing any previous value
    pub fn insert(&mut self, bin: KinematicBin, result: EfficiencyResult) -> Result<()> {
        if bin.et >= self.binning.et.count() || bin.eta >= self.binning.eta.count() {
            return Err(Error::Configuration(format!(
                "bin {bin} lies outside of the {}x{} grid",
                self.binning.et.count(),
                self.binning.eta.count()
            )));
        }
        let flat = self.binning.flat_index(bin);
        self.cells[flat] = Some(result);
        Ok(())
    }

    /// Check that every cell was populated, and freeze the grid
    pub fn complete(self) -> Result<FinalResults> {
        let binning = self.binning;
        let cells = self
            .cells
            .into_iter()
            .enumerate()
            .map(|(flat, cell)| {
                cell.ok_or_else(|| {
                    Error::Configuration(format!(
                        "efficiency grid is incomplete, bin {} was never measured",
                        binning.bin_from_flat(flat)
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(FinalResults { binning, cells })
    }
}

/// Final results of the measurement
#[derive(Clone, Debug, PartialEq)]
pub struct FinalResults {
    /// Binning of the measurement
    pub binning: KinematicBinning,

    /// Efficiency of each cell, in flat index order
    cells: Vec<EfficiencyResult>,
}
//
impl FinalResults {
    /// Efficiency of one cell
    pub fn get(&self, bin: KinematicBin) -> &EfficiencyResult {
        &self.cells[self.binning.flat_index(bin)]
    }

    /// Iterate over the cells in flat index order
    pub fn iter(&self) -> impl Iterator<Item = (KinematicBin, &EfficiencyResult)> + '_ {
        self.binning.bins().zip(&self.cells)
    }

    /// Number of (measured, degraded, undetermined) cells
    pub fn status_counts(&self) -> (usize, usize, usize) {
        self.cells
            .iter()
            .fold((0, 0, 0), |(measured, degraded, undetermined), cell| {
                match cell.status {
                    EfficiencyStatus::Measured => (measured + 1, degraded, undetermined),
                    EfficiencyStatus::Degraded(_) => (measured, degraded + 1, undetermined),
                    EfficiencyStatus::Undetermined => (measured, degraded, undetermined + 1),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binning::{EtBinSet, EtaBinSet},
        config::CalcMethod,
    };

    fn binning() -> KinematicBinning {
        KinematicBinning::new(EtBinSet::EtBins2, EtaBinSet::EtaBins1)
    }

    #[test]
    fn incomplete_grids_name_the_missing_cell() {
        let mut grid = EfficiencyGrid::new(binning());
        let result = EfficiencyResult::undetermined(CalcMethod::CountNCount, 0., 0.);
        grid.insert(KinematicBin { et: 0, eta: 0 }, result).unwrap();
        let error = grid.complete().unwrap_err();
        assert!(matches!(error, Error::Configuration(_)));
        assert!(error.to_string().contains("(et 1, eta 0)"), "{error}");
    }

    #[test]
    fn out_of_grid_cells_are_rejected() {
        let mut grid = EfficiencyGrid::new(binning());
        let result = EfficiencyResult::undetermined(CalcMethod::CountNCount, 0., 0.);
        assert!(grid.insert(KinematicBin { et: 0, eta: 1 }, result).is_err());
    }

    #[test]
    fn complete_grids_keep_cell_order() {
        let mut grid = EfficiencyGrid::new(binning());
        for et in (0..2).rev() {
            let mut result = EfficiencyResult::undetermined(CalcMethod::CountNCount, 0., 0.);
            result.n_pass = et as f64;
            grid.insert(KinematicBin { et, eta: 0 }, result).unwrap();
        }
        let results = grid.complete().unwrap();
        let passes = results.iter().map(|(_, cell)| cell.n_pass).collect::<Vec<_>>();
        assert_eq!(passes, [0., 1.]);
        assert_eq!(results.get(KinematicBin { et: 1, eta: 0 }).n_pass, 1.);
        assert_eq!(results.status_counts(), (0, 0, 2));
    }
}
