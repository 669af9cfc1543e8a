//! Multi-threaded back-end of the scheduling

use crate::{probe::ProbeRecord, resacc::ProbeAccumulator};
use rayon::prelude::*;
use std::sync::Mutex;

/// Integrate a wave of probe batches in multi-threaded mode
///
/// Each batch is integrated by its own task, and the batch results are then
/// merged in input order, which gives the same answer as sequential mode.
///
pub fn integrate_wave<'cfg>(
    wave: Vec<Vec<ProbeRecord>>,
    new_accumulator: &(impl Fn() -> ProbeAccumulator<'cfg> + Sync),
) -> ProbeAccumulator<'cfg> {
    let accumulator = ReproducibleAccumulator::new(wave.len());

    // This is a synchronization scope: it will only return once all inner
    // tasks have been executed
    rayon::scope(|scope| {
        for (batch_id, batch) in wave.into_iter().enumerate() {
            let accumulator_ref = &accumulator;
            scope.spawn(move |_| {
                let mut result = new_accumulator();
                for probe in &batch {
                    result.integrate(probe);
                }
                accumulator_ref.set_task_result(batch_id, result);
            });
        }
    });

    // Extract the results from the accumulator
    let mut wave_accumulator = new_accumulator();
    for result in accumulator.into_results() {
        wave_accumulator.merge(result);
    }
    wave_accumulator
}

/// Process measurement cells in parallel, keeping the results in cell order
pub fn map_cells<T: Send>(num_cells: usize, kernel: impl Fn(usize) -> T + Send + Sync) -> Vec<T> {
    (0..num_cells).into_par_iter().map(kernel).collect()
}

/// Reproducibility-optimized results accumulation mechanism
struct ReproducibleAccumulator<'cfg> {
    /// Storage for the intermediary results of parallel tasks
    results: Box<[Mutex<Option<ProbeAccumulator<'cfg>>>]>,
}
//
impl<'cfg> ReproducibleAccumulator<'cfg> {
    /// Set up results storage for N parallel tasks
    fn new(num_tasks: usize) -> Self {
        Self {
            results: (0..num_tasks)
                .map(|_| Mutex::new(None))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    /// Record the results of the n-th task
    fn set_task_result(&self, task_id: usize, result: ProbeAccumulator<'cfg>) {
        let mut lock = self.results[task_id]
            .lock()
            .expect("Mutex data should be valid");
        assert!(lock.is_none(), "Tasks should not report results twice");
        *lock = Some(result);
    }

    /// Hand out the task results in task order
    fn into_results(self) -> impl Iterator<Item = ProbeAccumulator<'cfg>> {
        self.results.into_vec().into_iter().map(|entry| {
            entry
                .into_inner()
                .expect("Mutex data should be valid")
                .expect("Result should be ready")
        })
    }
}
