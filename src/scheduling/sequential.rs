//! Sequential back-end of the scheduling

use crate::{probe::ProbeRecord, resacc::ProbeAccumulator};

/// Integrate a wave of probe batches in sequential mode
///
/// We use batched logic even in sequential mode, in order to achieve
/// reproducibility with respect to multi-threaded runs.
///
/// Note that this is anyways generally a good thing to do when accumulating
/// lots of weights, as otherwise the histogram bins will eventually grow much
/// larger than the accumulated values and numerical accumulation errors
/// will start to blow up.
///
pub fn integrate_wave<'cfg>(
    wave: Vec<Vec<ProbeRecord>>,
    new_accumulator: &(impl Fn() -> ProbeAccumulator<'cfg> + Sync),
) -> ProbeAccumulator<'cfg> {
    let mut wave_accumulator = new_accumulator();
    for batch in wave {
        let mut batch_accumulator = new_accumulator();
        for probe in &batch {
            batch_accumulator.integrate(probe);
        }
        wave_accumulator.merge(batch_accumulator);
    }
    wave_accumulator
}

/// Process measurement cells one after the other
pub fn map_cells<T>(num_cells: usize, kernel: impl Fn(usize) -> T) -> Vec<T> {
    (0..num_cells).map(kernel).collect()
}
