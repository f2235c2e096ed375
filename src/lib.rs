//! Offline anomaly detectors for multivariate time series.
//!
//! Every detector implements [`BaseDetector`]: `train` on a [`TimeSeries`],
//! then `predict` one score per row or `detect` a 0/1 mask per row. Output
//! is always aligned to the input length; positions a detector cannot score
//! (window warm-up, prediction horizon) hold 0.
//!
//! - [`AutoEncoder`]: dense auto-encoder, reconstruction error.
//! - [`LstmAd`]: multi-step LSTM predictor with a Gaussian residual model.
//! - [`Donut`]: per-column VAE with reconstruction probability.
//! - [`VariationalAutoEncoder`]: dense VAE, reconstruction error.
//!
//! With the `python` feature the crate builds a `sops_anomaly` extension
//! module exposing the same detectors.

pub mod config;
pub mod error;
pub mod models;
pub mod nn;
pub mod table;
pub mod utils;

pub use config::{
    AutoEncoderConfig, ComputeMode, DetectorConfig, DonutConfig, LstmAdConfig, PipelineConfig,
    TrainOptions, VaeConfig,
};
pub use error::{Error, Result};
pub use models::autoencoder::AutoEncoder;
pub use models::base_model::BaseDetector;
pub use models::donut::Donut;
pub use models::error_distribution::ErrorDistribution;
pub use models::lstm_ad::LstmAd;
pub use models::vae::VariationalAutoEncoder;
pub use table::TimeSeries;
pub use utils::evaluation::{DetectionReport, Evaluator};
pub use utils::window::{window_array, window_data};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// A Python module implemented in Rust.
#[cfg(feature = "python")]
#[pymodule]
fn sops_anomaly(_py: Python, m: &PyModule) -> PyResult<()> {
    // Detectors:
    m.add_class::<models::autoencoder::PyAutoEncoder>()?;
    m.add_class::<models::lstm_ad::PyLstmAd>()?;
    m.add_class::<models::donut::PyDonut>()?;
    m.add_class::<models::vae::PyVariationalAutoEncoder>()?;

    // Evaluator:
    m.add_class::<utils::evaluation::PyEvaluator>()?;
    Ok(())
}
