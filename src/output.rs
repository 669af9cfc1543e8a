//! This module is in charge of outputting the measured efficiencies to the
//! standard output and various files

use crate::{
    binning::{BinningScheme, KinematicBin, PileupStratum},
    config::{CalcMethod, Configuration},
    error::{Error, Result},
    estimator::{EfficiencyResult, EfficiencyStatus},
    numeric::Float,
    pipeline::ProbeInputs,
    resacc::ProbeCounters,
    resfin::FinalResults,
};
use serde::Serialize;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    time::Duration,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Number of significant digits of floating-point numbers in text reports
const SIG_DIGITS: usize = 6;

/// Horizontal rule of the text reports
const RULE: &str = "---------------------------------------------";

/// Output the measured efficiencies to the console and to disk
pub fn dump_results(
    cfg: &Configuration,
    inputs: &ProbeInputs,
    counters: &ProbeCounters,
    results: &FinalResults,
    output_dir: &Path,
    elapsed_time: Duration,
) -> Result<()> {
    // Print out the efficiency table on stdout
    println!();
    write_table(&mut io::stdout().lock(), results).map_err(Error::io("<stdout>"))?;

    let base = format!("efficiency_TnP_{}", cfg.label());

    // Write the text summary
    write_file(&output_dir.join(format!("{base}.txt")), |out| {
        write_summary(out, cfg, inputs, counters, results)
    })?;

    // Write the numeric grid
    write_file(&output_dir.join(format!("{base}.json")), |out| {
        serde_json::to_writer_pretty(&mut *out, &GridDocument::new(cfg, results))?;
        writeln!(out)
    })?;

    // Write the parameters of every fit
    write_file(&output_dir.join(format!("{base}_fitlog.dat")), |out| {
        write_fit_log(out, results)
    })?;

    // Write execution timings, which is the only output that changes from
    // one run to the next
    let now = OffsetDateTime::now_utc();
    write_file(&output_dir.join(format!("{base}.times")), |out| {
        write_timings(out, now, elapsed_time, results.binning.count())
    })
}

/// Create a file, fill it, and flush it
fn write_file(
    path: &Path,
    contents: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>,
) -> Result<()> {
    let file = File::create(path).map_err(Error::io(path))?;
    let mut out = BufWriter::new(file);
    contents(&mut out).map_err(Error::io(path))?;
    out.flush().map_err(Error::io(path))
}

/// Write the text summary: metadata, selection counters, efficiency table
pub fn write_summary(
    out: &mut impl Write,
    cfg: &Configuration,
    inputs: &ProbeInputs,
    counters: &ProbeCounters,
    results: &FinalResults,
) -> io::Result<()> {
    writeln_tnp(out, ("Efficiency calculation method", cfg.calc_method.name()))?;
    writeln_tnp(out, ("Efficiency type", cfg.eff_kind.name()))?;
    writeln_tnp(out, ("SC ET binning", cfg.binning.et.name()))?;
    writeln_tnp(out, ("SC eta binning", cfg.binning.eta.name()))?;
    writeln_tnp(out, ("Sample", cfg.sample.to_string().as_str()))?;
    writeln_tnp(out, ("Pileup reweighting", yes_no(cfg.pileup_reweight)))?;
    writeln_tnp(out, ("Pileup dependence", yes_no(cfg.pileup.is_dependent())))?;
    writeln_tnp(out, ("Directory tag", cfg.dir_tag.as_str()))?;
    writeln_tnp(out, ("Ntuple files", cfg.ntuple_files.len()))?;
    for file in &cfg.ntuple_files {
        writeln_tnp(out, ("", file.as_str()))?;
    }
    writeln_tnp(out, ("Passing probes", inputs.pass.display().to_string().as_str()))?;
    writeln_tnp(out, ("Failing probes", inputs.fail.display().to_string().as_str()))?;
    writeln_tnp(out, RULE)?;
    counters.write_summary(out, cfg.eff_kind, cfg.probe_cut.et_min, &cfg.mass_axis)?;
    writeln_tnp(out, RULE)?;
    write_table(out, results)?;
    writeln_tnp(out, RULE)?;
    let (measured, degraded, undetermined) = results.status_counts();
    writeln_tnp(out, ("Measured cells", measured))?;
    writeln_tnp(out, ("Degraded cells", degraded))?;
    writeln_tnp(out, ("Undetermined cells", undetermined))
}

/// Write the per-cell efficiency table, with per-stratum rows when the
/// efficiency was measured in pileup bins
pub fn write_table(out: &mut impl Write, results: &FinalResults) -> io::Result<()> {
    writeln!(
        out,
        "{:>4}{:>5}{:>17}{:>17}{:>12}{:>12}{:>12}{:>12}{:>12}  {:<12} status",
        "iEt", "iEta", "Et (GeV)", "|eta|", "efficiency", "err_low", "err_high", "n_pass", "n_fail", "method"
    )?;
    let binning = &results.binning;
    for (bin, cell) in results.iter() {
        let (et_low, et_high) = binning.et.limits(bin.et);
        let (eta_low, eta_high) = binning.eta.limits(bin.eta);
        write!(
            out,
            "{:>4}{:>5}{:>8.1}-{:<8.1}{:>8.4}-{:<8.4}",
            bin.et, bin.eta, et_low, et_high, eta_low, eta_high
        )?;
        write_cell(out, cell)?;
        for stratum in &cell.strata {
            write!(out, "{:>9}{:>34}", stratum.stratum.to_string(), "")?;
            write_cell(out, &stratum.result)?;
        }
        let (excluded_pass, excluded_fail) = cell.pileup_excluded;
        if excluded_pass + excluded_fail > 0. {
            writeln!(
                out,
                "{:>9}{:>34}{:>36}{:>12.2}{:>12.2}  (not in the efficiency)",
                "no pu bin", "", "", excluded_pass, excluded_fail
            )?;
        }
    }
    Ok(())
}

/// Write the measurement columns of one table row
fn write_cell(out: &mut impl Write, cell: &EfficiencyResult) -> io::Result<()> {
    let status = match &cell.status {
        EfficiencyStatus::Degraded(reason) => format!("{} ({reason})", cell.status),
        other => other.to_string(),
    };
    writeln!(
        out,
        "{:>12}{:>12}{:>12}{:>12.2}{:>12.2}  {:<12} {status}",
        fixed(cell.value),
        fixed(cell.err_low),
        fixed(cell.err_high),
        cell.n_pass,
        cell.n_fail,
        cell.method.name()
    )
}

/// Fixed-point rendition of an efficiency, "-" if it is undetermined
fn fixed(x: Float) -> String {
    if x.is_finite() {
        format!("{x:.6}")
    } else {
        "-".to_owned()
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// Write the parameters of the fits behind every cell
pub fn write_fit_log(out: &mut impl Write, results: &FinalResults) -> io::Result<()> {
    for (bin, cell) in results.iter() {
        if cell.strata.is_empty() {
            write_fit_entry(out, bin, None, cell)?;
        } else {
            for stratum in &cell.strata {
                write_fit_entry(out, bin, Some(stratum.stratum), &stratum.result)?;
            }
        }
    }
    Ok(())
}

fn write_fit_entry(
    out: &mut impl Write,
    bin: KinematicBin,
    stratum: Option<PileupStratum>,
    cell: &EfficiencyResult,
) -> io::Result<()> {
    match stratum {
        Some(stratum) => writeln!(out, "Bin {bin} [{stratum}]")?,
        None => writeln!(out, "Bin {bin}")?,
    }
    writeln_tnp(out, ("Method", cell.method.name()))?;
    writeln_tnp(out, ("Status", cell.status.to_string().as_str()))?;
    match &cell.fit {
        Some(fit) => {
            writeln_tnp(out, ("Attempts", fit.attempts))?;
            writeln_tnp(out, ("Deviance at minimum", fit.nll))?;
            for parameter in &fit.parameters {
                writeln!(
                    out,
                    "   {:<24}{:>14} +/- {:<14}",
                    parameter.name,
                    engineering(parameter.value, SIG_DIGITS),
                    engineering(parameter.error, SIG_DIGITS)
                )?;
            }
        }
        None => writeln_tnp(out, "No fit")?,
    }
    writeln!(out)
}

/// Write execution timings
pub fn write_timings(
    out: &mut impl Write,
    now: OffsetDateTime,
    elapsed_time: Duration,
    num_cells: usize,
) -> io::Result<()> {
    let timestamp = now.format(&Rfc3339).map_err(io::Error::other)?;
    writeln_tnp(out, timestamp.as_str())?;
    writeln_tnp(out, RULE)?;
    let elapsed_secs = elapsed_time.as_secs_f64();
    writeln_tnp(out, ("Elapsed time (s)", elapsed_secs))?;
    writeln_tnp(out, ("Elapsed time per cell (s)", elapsed_secs / (num_cells.max(1) as Float)))
}

/// Numeric efficiency grid, as written in JSON
///
/// Matrices are indexed by Et bin first, then by eta bin. Infinite bin
/// edges and undetermined efficiencies are written as `null`.
///
#[derive(Serialize)]
struct GridDocument {
    label: String,
    sample: String,
    efficiency: &'static str,
    requested_method: CalcMethod,
    pileup_dependent: bool,
    et_binning: &'static str,
    eta_binning: &'static str,
    et_edges: Vec<Option<Float>>,
    eta_edges: Vec<Option<Float>>,
    value: Vec<Vec<Option<Float>>>,
    err_low: Vec<Vec<Option<Float>>>,
    err_high: Vec<Vec<Option<Float>>>,
    n_pass: Vec<Vec<Float>>,
    n_fail: Vec<Vec<Float>>,
    method: Vec<Vec<CalcMethod>>,
    status: Vec<Vec<String>>,
}
//
impl GridDocument {
    fn new(cfg: &Configuration, results: &FinalResults) -> Self {
        let binning = &results.binning;
        let finite = |x: Float| x.is_finite().then_some(x);
        let edges = |edges: &[Float]| -> Vec<Option<Float>> {
            edges.iter().map(|&edge| finite(edge)).collect()
        };
        Self {
            label: cfg.label(),
            sample: cfg.sample.to_string(),
            efficiency: cfg.eff_kind.name(),
            requested_method: cfg.calc_method,
            pileup_dependent: cfg.pileup.is_dependent(),
            et_binning: binning.et.name(),
            eta_binning: binning.eta.name(),
            et_edges: edges(binning.et.edges()),
            eta_edges: edges(binning.eta.edges()),
            value: matrix_of(results, |cell| finite(cell.value)),
            err_low: matrix_of(results, |cell| finite(cell.err_low)),
            err_high: matrix_of(results, |cell| finite(cell.err_high)),
            n_pass: matrix_of(results, |cell| cell.n_pass),
            n_fail: matrix_of(results, |cell| cell.n_fail),
            method: matrix_of(results, |cell| cell.method),
            status: matrix_of(results, |cell| cell.status.to_string()),
        }
    }
}

/// Lay out one quantity of every cell as an (Et, eta) matrix
fn matrix_of<T>(results: &FinalResults, f: impl Fn(&EfficiencyResult) -> T) -> Vec<Vec<T>> {
    let binning = &results.binning;
    (0..binning.et.count())
        .map(|et| {
            (0..binning.eta.count())
                .map(|eta| f(results.get(KinematicBin { et, eta })))
                .collect()
        })
        .collect()
}

/// Text output facility with the key-value styling of the reports
fn writeln_tnp(out: &mut impl Write, data: impl WriteTnp) -> io::Result<()> {
    write!(out, " ")?;
    data.write(out)?;
    writeln!(out)
}

/// Trait implemented by things which can be written in the report style
trait WriteTnp: Sized {
    /// Write down `self` to the output using the report style
    fn write(self, out: &mut dyn Write) -> io::Result<()>;
}

impl WriteTnp for &str {
    // Strings work in the usual way
    fn write(self, out: &mut dyn Write) -> io::Result<()> {
        write!(out, "{self}")
    }
}

impl WriteTnp for usize {
    // Integers work in the usual way too
    fn write(self, out: &mut dyn Write) -> io::Result<()> {
        write!(out, "{self}")
    }
}

impl WriteTnp for Float {
    // Close approximation of printf's %g
    fn write(self, out: &mut dyn Write) -> io::Result<()> {
        write!(out, "{}", engineering(self, SIG_DIGITS))
    }
}

impl<T: WriteTnp> WriteTnp for (&str, T) {
    // Key-value output that uses fixed-size columns for better readability
    fn write(self, out: &mut dyn Write) -> io::Result<()> {
        write!(out, "{:<31}: ", self.0)?;
        self.1.write(out)
    }
}

/// Format a floating-point number using "engineering" notation
///
/// Analogous to the %g format of the C printf function, this switches
/// between naive and scientific notation when the number becomes so small
/// that printing leading zeroes would end up larger than the scientific
/// notation, or so large that more significant digits than requested would
/// have to be printed.
///
fn engineering(x: Float, sig_digits: usize) -> String {
    let precision = sig_digits.saturating_sub(1);
    if x == 0. {
        // Zero is special because you can't take its log
        return "0".to_owned();
    }
    let log_x = x.abs().log10();
    if log_x >= -3. && log_x < (sig_digits as Float) {
        // Rust's precision is a number of digits after the decimal point, so
        // it must be adjusted to the magnitude of the number. Numbers below 1
        // get one extra digit since the leading zero is not significant.
        let magnitude = log_x.floor() as isize;
        let decimals = (precision as isize - magnitude).max(0) as usize;
        let with_zeros = format!("{x:.decimals$}");
        if with_zeros.contains('.') {
            with_zeros
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_owned()
        } else {
            with_zeros
        }
    } else {
        format!("{x:.precision$e}")
    }
}
