//! Basic numerical concepts used throughout the program

#![allow(missing_docs)]

// All computations are carried out in double precision, which is what the
// minimizer and the statistics crates expect
pub type Float = f64;
pub use std::f64 as floats;

/// Physical constants of the Z⁰ resonance used by the signal model
pub mod z_boson {
    use super::Float;

    /// Z⁰ boson mass (GeV)
    pub const MASS: Float = 91.1876;

    /// Z⁰ boson width (GeV)
    pub const WIDTH: Float = 2.4952;
}

/// Two-sided confidence level of a "one sigma" interval
pub const ONE_SIGMA_CL: Float = 0.682_689_492_137_086;
