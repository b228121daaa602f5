use std::path::PathBuf;
use thiserror::Error;

/// Error taxonomy for the generation engine.
///
/// Per-cell and per-run failures are represented as `Substitution` but are
/// normally caught close to where they occur and surfaced through log entries
/// or failure counts; `Validation` aborts a batch before any row is processed.
#[derive(Error, Debug)]
pub enum Error {
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),

    #[error("{path}: cannot be opened as a {kind} document: {message}")]
    Format {
        path: PathBuf,
        kind: &'static str,
        message: String,
    },

    #[error("substitution of '{field}' at {location} failed: {message}")]
    Substitution {
        field: String,
        location: String,
        message: String,
    },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, Error>;
