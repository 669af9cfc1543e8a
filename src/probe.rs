//! Tag-probe pairs selected upstream, and the streams that they come from

use crate::{
    error::{Error, Result},
    numeric::Float,
};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

/// Outcome of one tag-probe pair
///
/// The pass/fail status is not part of the stored record: it is assigned by
/// the stream which the record was read from, pass and fail probes are never
/// mixed in a single stream.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    /// Tag-probe invariant mass (GeV)
    pub mass: Float,

    /// Probe supercluster transverse energy (GeV)
    pub et: Float,

    /// Probe supercluster pseudorapidity
    pub eta: Float,

    /// Number of good reconstructed primary vertices in the event
    #[serde(rename = "nGoodPV")]
    pub n_good_pv: u32,

    /// Event weight (pileup reweighting, MC normalization...)
    #[serde(default = "unit_weight")]
    pub weight: Float,

    /// Truth that the probe passed the selection under study
    #[serde(skip)]
    pub passed: bool,
}

fn unit_weight() -> Float {
    1.
}

/// Which of the two selection streams a record comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probes which passed the selection under study
    Pass,
    /// Probes which failed it
    Fail,
}
//
impl ProbeOutcome {
    /// Truth that probes of this stream passed
    pub fn passed(self) -> bool {
        self == Self::Pass
    }

    /// Short name, used for file naming and diagnostics
    pub fn name(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

/// Sequential reader of a JSON-lines probe file
///
/// Each non-blank line holds one JSON object with the `mass`, `et`, `eta`,
/// `nGoodPV` and (optionally) `weight` fields.
///
pub struct ProbeReader<R> {
    lines: std::io::Lines<R>,
    outcome: ProbeOutcome,
    source: PathBuf,
    line_number: usize,
}
//
impl ProbeReader<BufReader<File>> {
    /// Open a probe file, flagging its records with the given outcome
    pub fn open(path: &Path, outcome: ProbeOutcome) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Input(format!(
                "cannot open {} probe file {}: {e}",
                outcome.name(),
                path.display()
            ))
        })?;
        Ok(Self::new(BufReader::new(file), outcome, path))
    }
}
//
impl<R: BufRead> ProbeReader<R> {
    /// Read probes from an arbitrary buffered source
    pub fn new(reader: R, outcome: ProbeOutcome, source: impl Into<PathBuf>) -> Self {
        Self {
            lines: reader.lines(),
            outcome,
            source: source.into(),
            line_number: 0,
        }
    }
}
//
impl<R: BufRead> Iterator for ProbeReader<R> {
    type Item = Result<ProbeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(Error::io(self.source.clone())(e))),
            };
            self.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<ProbeRecord>(&line)
                .map(|record| ProbeRecord {
                    passed: self.outcome.passed(),
                    ..record
                })
                .map_err(|e| {
                    Error::Input(format!(
                        "malformed probe at {}:{}: {e}",
                        self.source.display(),
                        self.line_number
                    ))
                });
            return Some(parsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_assigns_outcome_and_default_weight() {
        let text = r#"{"mass": 91.2, "et": 35.0, "eta": -0.3, "nGoodPV": 12}

{"mass": 88.0, "et": 22.5, "eta": 1.9, "nGoodPV": 4, "weight": 0.75}
"#;
        let records = ProbeReader::new(text.as_bytes(), ProbeOutcome::Fail, "mem")
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| !record.passed));
        assert_eq!(records[0].weight, 1.);
        assert_eq!(records[1].weight, 0.75);
        assert_eq!(records[1].n_good_pv, 4);
    }

    #[test]
    fn malformed_line_names_its_location() {
        let text = "{\"mass\": 91.2, \"et\": 35.0, \"eta\": 0.1, \"nGoodPV\": 1}\n{\"mass\": 1}\n";
        let mut reader = ProbeReader::new(text.as_bytes(), ProbeOutcome::Pass, "probes.jsonl");
        assert!(reader.next().unwrap().unwrap().passed);
        let error = reader.next().unwrap().unwrap_err().to_string();
        assert!(error.contains("probes.jsonl:2"), "{error}");
    }

    #[test]
    fn missing_file_is_an_input_error() {
        let error = ProbeReader::open(Path::new("/nonexistent/probes.jsonl"), ProbeOutcome::Pass)
            .err()
            .unwrap();
        assert!(matches!(error, Error::Input(_)));
    }
}
