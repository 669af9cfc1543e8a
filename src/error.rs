//! Error taxonomy of the efficiency pipeline

use crate::templates::TemplateKey;

use std::path::PathBuf;
use thiserror::Error;

/// Everything that can go wrong while measuring efficiencies
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing configuration, unrecognized enum value, or an
    /// internally inconsistent request (e.g. an incomplete results grid)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing or unreadable input resource
    #[error("input error: {0}")]
    Input(String),

    /// A template required to fit data was not found in the template store
    #[error("missing mass template for {0}")]
    MissingTemplate(TemplateKey),

    /// A fit did not converge, even after retrying with other seeds
    #[error("fit did not converge after {attempts} attempt(s): {reason}")]
    FitConvergence {
        /// Number of minimization attempts made
        attempts: usize,
        /// Why the last attempt was rejected
        reason: String,
    },

    /// I/O error on a named file
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File which was being accessed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
//
impl Error {
    /// Tag an I/O error with the path of the file being accessed
    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// Result type used by the library modules
pub type Result<T> = std::result::Result<T, Error>;
