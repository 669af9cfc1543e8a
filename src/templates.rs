//! Mass templates built from simulation, used as fixed signal shapes when
//! fitting data

use crate::{
    binning::{KinematicBin, PileupStratum},
    error::{Error, Result},
    histogram::MassHistogram,
    resacc::SampleHistograms,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Location of a template pair: pileup stratum and kinematic bin
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TemplateKey {
    /// Pileup stratum
    pub stratum: PileupStratum,

    /// Kinematic bin
    pub bin: KinematicBin,
}
//
impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bin {} of pileup stratum {}", self.bin, self.stratum)
    }
}

/// Stored templates of one key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct TemplateEntry {
    key: TemplateKey,
    pass: MassHistogram,
    fail: MassHistogram,
}

/// Collection of pass/fail template pairs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TemplateStore {
    templates: BTreeMap<TemplateKey, TemplateEntry>,
}
//
impl TemplateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the templates of every stratum and bin of a simulated sample
    pub fn from_sample(sample: &SampleHistograms) -> Result<Self> {
        let mut store = Self::new();
        for stratum in &sample.strata {
            for (bin, histograms) in sample.binning.bins().zip(&stratum.bins) {
                let key = TemplateKey {
                    stratum: stratum.stratum,
                    bin,
                };
                store.save(key, histograms.pass.clone(), histograms.fail.clone())?;
            }
        }
        Ok(store)
    }

    /// Number of template pairs
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Truth that no template was stored
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Store a template pair, replacing any previous pair with the same key
    pub fn save(&mut self, key: TemplateKey, pass: MassHistogram, fail: MassHistogram) -> Result<()> {
        if key.stratum == PileupStratum::Excluded {
            return Err(Error::Configuration(format!(
                "no template can be stored for {key}"
            )));
        }
        self.templates.insert(key, TemplateEntry { key, pass, fail });
        Ok(())
    }

    /// Fetch the pass and fail templates of a key
    pub fn load(&self, key: TemplateKey) -> Result<(&MassHistogram, &MassHistogram)> {
        self.templates
            .get(&key)
            .map(|entry| (&entry.pass, &entry.fail))
            .ok_or(Error::MissingTemplate(key))
    }

    /// Write the templates down as JSON, sorted by key
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(Error::io(path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.templates.values().collect::<Vec<_>>())?;
        writeln!(writer).map_err(Error::io(path))?;
        writer.flush().map_err(Error::io(path))
    }

    /// Read templates back from a file written by `write`
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Input(format!(
                "cannot open template file {} (was the simulation processed?): {e}",
                path.display()
            ))
        })?;
        let entries: Vec<TemplateEntry> = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Input(format!("malformed template file {}: {e}", path.display())))?;
        let mut store = Self::new();
        for entry in entries {
            let key = entry.key;
            if store.templates.contains_key(&key) {
                return Err(Error::Input(format!(
                    "template file {} has two entries for {key}",
                    path.display()
                )));
            }
            store.save(key, entry.pass, entry.fail)?;
        }
        Ok(store)
    }
}
