//! Error types shared by every detector.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while preparing data, training or scoring.
#[derive(Debug, Error)]
pub enum Error {
    /// The window does not fit into the series.
    #[error("window size {window} exceeds data length {len}")]
    WindowTooLarge { window: usize, len: usize },

    /// `predict`/`detect` was called on a detector that has not been trained.
    #[error("detector has not been trained")]
    NotTrained,

    /// Prediction data does not have the column count seen during training.
    #[error("column count mismatch: trained on {expected}, got {found}")]
    ColumnMismatch { expected: usize, found: usize },

    /// Table without rows or without columns.
    #[error("data is empty")]
    EmptyData,

    /// Series too short for the model's context.
    #[error("series too short: need more than {needed} rows, got {len}")]
    SeriesTooShort { needed: usize, len: usize },

    /// Rejected detector or training parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Index that cannot be completed onto a regular grid.
    #[error("invalid timestamps: {0}")]
    Timestamp(String),

    /// Inconsistent array shapes.
    #[error("shape error: {0}")]
    Shape(String),

    /// A numeric routine could not produce a finite result.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Operation the detector does not provide.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// TOML configuration that failed to parse.
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Shape(err.to_string())
    }
}

#[cfg(feature = "python")]
impl From<Error> for pyo3::PyErr {
    fn from(err: Error) -> Self {
        pyo3::exceptions::PyValueError::new_err(err.to_string())
    }
}
