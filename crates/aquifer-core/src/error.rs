//! Library-wide error type.

use std::path::PathBuf;

use thiserror::Error;

use crate::calendar::YearMonth;

pub type Result<T> = std::result::Result<T, AquiferError>;

#[derive(Debug, Error)]
pub enum AquiferError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TIFF error in {path}: {source}")]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },

    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid grid: {0}")]
    InvalidGrid(String),

    #[error("shape mismatch: expected {expected} cells, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("grid mismatch: {0}")]
    GridMismatch(String),

    #[error("time axis mismatch: {0}")]
    TimeAxisMismatch(String),

    #[error("{0} carries no ModelPixelScale/ModelTiepoint georeference")]
    MissingGeoreference(PathBuf),

    #[error("unsupported pixel type in {0}")]
    UnsupportedPixelType(PathBuf),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("variable {variable} has an unfillable gap from {from} to {to}")]
    TimeGap {
        variable: String,
        from: YearMonth,
        to: YearMonth,
    },

    #[error("invalid sequence parameters: {0}")]
    InvalidSequence(String),

    #[error("unknown variable or feature: {0}")]
    UnknownVariable(String),

    #[error("invalid feature specification: {0}")]
    InvalidFeature(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("cell ({row}, {col}) lies outside the {width}x{height} grid")]
    OutOfGrid {
        row: usize,
        col: usize,
        width: usize,
        height: usize,
    },

    #[error("invalid thresholds: {0}")]
    InvalidThresholds(String),
}

impl AquiferError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub(crate) fn tiff(path: impl Into<PathBuf>, source: tiff::TiffError) -> Self {
        Self::Tiff { path: path.into(), source }
    }
}
