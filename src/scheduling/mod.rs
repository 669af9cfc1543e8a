//! This module takes care of scheduling the work, encapsulating use of
//! multiple threads for histogram accumulation and per-cell fits

#[cfg(feature = "multi-threading")]
mod multi_threading;
#[cfg(not(feature = "multi-threading"))]
mod sequential;

#[cfg(feature = "multi-threading")]
use self::multi_threading as backend;
#[cfg(not(feature = "multi-threading"))]
use self::sequential as backend;

use crate::{error::Result, probe::ProbeRecord, resacc::ProbeAccumulator};

/// Size of the probe batches
///
/// Probes are grouped in batches of a certain size in order to reduce
/// accumulation error and achieve perfect reproducibility between sequential
/// and parallel runs: each batch goes to a fresh accumulator, and batch
/// results are merged in input order.
///
const PROBE_BATCH_SIZE: usize = 10_000;

/// Number of batches which are read from the input before being processed
///
/// This bounds memory consumption, whatever the size of the input.
///
const BATCHES_PER_WAVE: usize = 64;

/// Accumulate a stream of probes in the manner that was configured at build
/// time.
///
/// Takes as parameters the probe stream and a constructor of empty
/// accumulators. The first input error aborts the accumulation.
///
pub fn accumulate_probes<'cfg>(
    probes: impl Iterator<Item = Result<ProbeRecord>>,
    new_accumulator: impl Fn() -> ProbeAccumulator<'cfg> + Sync,
) -> Result<ProbeAccumulator<'cfg>> {
    let mut accumulator = new_accumulator();
    let mut probes = probes.peekable();
    while probes.peek().is_some() {
        // Read a wave of batches...
        let mut wave = Vec::with_capacity(BATCHES_PER_WAVE);
        while wave.len() < BATCHES_PER_WAVE && probes.peek().is_some() {
            let batch = probes
                .by_ref()
                .take(PROBE_BATCH_SIZE)
                .collect::<Result<Vec<_>>>()?;
            wave.push(batch);
        }

        // ...and integrate it
        accumulator.merge(backend::integrate_wave(wave, &new_accumulator));
    }
    Ok(accumulator)
}

/// Process every measurement cell with a kernel, returning the results in
/// cell order
pub fn map_cells<T: Send>(num_cells: usize, kernel: impl Fn(usize) -> T + Send + Sync) -> Vec<T> {
    backend::map_cells(num_cells, kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binning::EtaBinSet, config::SampleType, error::Error, resacc::tests::configuration,
    };

    fn probe(index: usize) -> ProbeRecord {
        ProbeRecord {
            mass: 60. + (index % 61) as f64,
            et: 10. + (index % 23) as f64,
            eta: (index % 50) as f64 * 0.05 - 1.2,
            n_good_pv: (index % 37) as u32,
            weight: 0.5,
            passed: index % 3 != 0,
        }
    }

    #[test]
    fn batching_matches_direct_accumulation() {
        let cfg = configuration(SampleType::Mc, EtaBinSet::EtaBins2, true);
        let num_probes = 2 * PROBE_BATCH_SIZE + 123;
        let batched = accumulate_probes((0..num_probes).map(|i| Ok(probe(i))), || {
            ProbeAccumulator::new(&cfg)
        })
        .unwrap()
        .finalize();

        let mut direct = ProbeAccumulator::new(&cfg);
        (0..num_probes).for_each(|i| direct.integrate(&probe(i)));
        assert_eq!(batched, direct.finalize());
        assert_eq!(batched.counters.total, num_probes);
    }

    #[test]
    fn input_errors_abort_accumulation() {
        let cfg = configuration(SampleType::Data, EtaBinSet::EtaBins1, false);
        let probes = (0..10).map(|i| {
            if i == 7 {
                Err(Error::Input("broken record".to_owned()))
            } else {
                Ok(probe(i))
            }
        });
        let result = accumulate_probes(probes, || ProbeAccumulator::new(&cfg));
        assert!(matches!(result, Err(Error::Input(_))));
    }

    #[test]
    fn cells_come_back_in_order() {
        assert_eq!(map_cells(5, |cell| cell * cell), vec![0, 1, 4, 9, 16]);
        assert!(map_cells(0, |cell| cell).is_empty());
    }
}
