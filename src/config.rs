//! Detector configuration.
//!
//! Every config derives serde with field defaults, so a TOML document only
//! needs the fields it changes:
//!
//! ```toml
//! [detector]
//! kind = "lstm_ad"
//! l_predictions = 5
//! hidden_size = 64
//!
//! [train]
//! epochs = 30
//! learning_rate = 0.001
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::autoencoder::AutoEncoder;
use crate::models::base_model::BaseDetector;
use crate::models::donut::Donut;
use crate::models::lstm_ad::LstmAd;
use crate::models::vae::VariationalAutoEncoder;

/// Where independent work runs. Results do not depend on the mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeMode {
    #[default]
    Serial,
    /// Dedicated rayon pool; `threads` defaults to the number of CPUs.
    Parallel { threads: Option<usize> },
}

/// Arguments shared by every `train` call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Log per-epoch loss at info level instead of debug.
    pub verbose: bool,
}

impl Default for TrainOptions {
    fn default() -> Self {
        TrainOptions {
            epochs: 20,
            learning_rate: 1e-4,
            verbose: false,
        }
    }
}

impl TrainOptions {
    pub fn new(epochs: usize, learning_rate: f64) -> Self {
        TrainOptions {
            epochs,
            learning_rate,
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::invalid_config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoEncoderConfig {
    pub window_size: usize,
    pub latent_size: usize,
    /// Encoder hidden widths; the decoder uses them reversed.
    pub layers: Vec<usize>,
    /// Fraction of the largest training error above which a point is anomalous.
    pub threshold: f64,
    pub seed: Option<u64>,
    pub compute: ComputeMode,
}

impl Default for AutoEncoderConfig {
    fn default() -> Self {
        AutoEncoderConfig {
            window_size: 1,
            latent_size: 100,
            layers: vec![500, 200],
            threshold: 0.8,
            seed: None,
            compute: ComputeMode::Serial,
        }
    }
}

impl AutoEncoderConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        check_positive("window_size", self.window_size)?;
        check_positive("latent_size", self.latent_size)?;
        check_layers(&self.layers)?;
        check_ratio("threshold", self.threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LstmAdConfig {
    /// Prediction horizon `L`.
    pub l_predictions: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f64,
    /// Likelihood below which a point is anomalous.
    pub threshold: f64,
    /// Tail fraction of the training series used to fit the error distribution.
    pub validation_portion: f64,
    pub covariance_regularization: f64,
    pub seed: Option<u64>,
    pub compute: ComputeMode,
}

impl Default for LstmAdConfig {
    fn default() -> Self {
        LstmAdConfig {
            l_predictions: 10,
            hidden_size: 400,
            num_layers: 2,
            dropout: 0.5,
            threshold: 0.9,
            validation_portion: 0.25,
            covariance_regularization: 1e-6,
            seed: None,
            compute: ComputeMode::Serial,
        }
    }
}

impl LstmAdConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        check_positive("l_predictions", self.l_predictions)?;
        check_positive("hidden_size", self.hidden_size)?;
        check_positive("num_layers", self.num_layers)?;
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::invalid_config("dropout must be in [0, 1)"));
        }
        if !(0.0..1.0).contains(&self.validation_portion) {
            return Err(Error::invalid_config("validation_portion must be in [0, 1)"));
        }
        if !(self.covariance_regularization >= 0.0) {
            return Err(Error::invalid_config("covariance_regularization must be >= 0"));
        }
        if !self.threshold.is_finite() {
            return Err(Error::invalid_config("threshold must be finite"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DonutConfig {
    /// Pre-windowing applied to the table before the per-column models.
    pub window_size: usize,
    /// Length of the sliding window each VAE sees.
    pub x_dims: usize,
    pub z_dims: usize,
    pub hidden_layers: Vec<usize>,
    pub l2_regularization: f64,
    pub std_epsilon: f64,
    pub missing_injection_rate: f64,
    pub batch_size: usize,
    pub valid_portion: f64,
    pub lr_anneal_factor: f64,
    pub lr_anneal_epochs: usize,
    pub max_grad_norm: f64,
    /// Posterior samples per window when scoring.
    pub n_z: usize,
    pub mcmc_iterations: usize,
    pub seed: Option<u64>,
    pub compute: ComputeMode,
}

impl Default for DonutConfig {
    fn default() -> Self {
        DonutConfig {
            window_size: 1,
            x_dims: 120,
            z_dims: 5,
            hidden_layers: vec![100, 100],
            l2_regularization: 0.001,
            std_epsilon: 1e-4,
            missing_injection_rate: 0.01,
            batch_size: 256,
            valid_portion: 0.3,
            lr_anneal_factor: 0.75,
            lr_anneal_epochs: 10,
            max_grad_norm: 10.0,
            n_z: 1024,
            mcmc_iterations: 10,
            seed: None,
            compute: ComputeMode::Serial,
        }
    }
}

impl DonutConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        check_positive("window_size", self.window_size)?;
        check_positive("x_dims", self.x_dims)?;
        check_positive("z_dims", self.z_dims)?;
        check_positive("batch_size", self.batch_size)?;
        check_positive("n_z", self.n_z)?;
        check_layers(&self.hidden_layers)?;
        if !(0.0..1.0).contains(&self.missing_injection_rate) {
            return Err(Error::invalid_config("missing_injection_rate must be in [0, 1)"));
        }
        if !(0.0..1.0).contains(&self.valid_portion) {
            return Err(Error::invalid_config("valid_portion must be in [0, 1)"));
        }
        if !(self.std_epsilon > 0.0) {
            return Err(Error::invalid_config("std_epsilon must be positive"));
        }
        if !(self.max_grad_norm > 0.0) {
            return Err(Error::invalid_config("max_grad_norm must be positive"));
        }
        if !(self.lr_anneal_factor > 0.0 && self.lr_anneal_factor <= 1.0) {
            return Err(Error::invalid_config("lr_anneal_factor must be in (0, 1]"));
        }
        if !(self.l2_regularization >= 0.0) {
            return Err(Error::invalid_config("l2_regularization must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaeConfig {
    pub window_size: usize,
    pub latent_size: usize,
    pub layers: Vec<usize>,
    pub threshold: f64,
    pub batch_size: usize,
    pub std_epsilon: f64,
    pub seed: Option<u64>,
    pub compute: ComputeMode,
}

impl Default for VaeConfig {
    fn default() -> Self {
        VaeConfig {
            window_size: 1,
            latent_size: 100,
            layers: vec![500, 200],
            threshold: 0.8,
            batch_size: 32,
            std_epsilon: 1e-4,
            seed: None,
            compute: ComputeMode::Serial,
        }
    }
}

impl VaeConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        check_positive("window_size", self.window_size)?;
        check_positive("latent_size", self.latent_size)?;
        check_positive("batch_size", self.batch_size)?;
        check_layers(&self.layers)?;
        if !(self.std_epsilon > 0.0) {
            return Err(Error::invalid_config("std_epsilon must be positive"));
        }
        check_ratio("threshold", self.threshold)
    }
}

/// One of the detector configurations, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    #[serde(rename = "autoencoder")]
    AutoEncoder(AutoEncoderConfig),
    LstmAd(LstmAdConfig),
    Donut(DonutConfig),
    Vae(VaeConfig),
}

impl DetectorConfig {
    pub fn build(&self) -> Result<Box<dyn BaseDetector>> {
        Ok(match self {
            DetectorConfig::AutoEncoder(c) => Box::new(AutoEncoder::new(c.clone())?),
            DetectorConfig::LstmAd(c) => Box::new(LstmAd::new(c.clone())?),
            DetectorConfig::Donut(c) => Box::new(Donut::new(c.clone())?),
            DetectorConfig::Vae(c) => Box::new(VariationalAutoEncoder::new(c.clone())?),
        })
    }
}

/// A detector together with the options for training it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    #[serde(default)]
    pub train: TrainOptions,
}

impl PipelineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(source)?;
        config.train.validate()?;
        Ok(config)
    }

    pub fn build_detector(&self) -> Result<Box<dyn BaseDetector>> {
        self.detector.build()
    }
}

fn check_positive(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(Error::invalid_config(format!("{} must be at least 1", name)));
    }
    Ok(())
}

fn check_layers(layers: &[usize]) -> Result<()> {
    if layers.iter().any(|&w| w == 0) {
        return Err(Error::invalid_config("hidden layer widths must be at least 1"));
    }
    Ok(())
}

fn check_ratio(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value.is_finite()) {
        return Err(Error::invalid_config(format!("{} must be positive, got {}", name, value)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        AutoEncoderConfig::default().validate().unwrap();
        LstmAdConfig::default().validate().unwrap();
        DonutConfig::default().validate().unwrap();
        VaeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_train_options_builder() {
        let options = TrainOptions::new(3, 0.01).verbose(true);
        assert_eq!(options.epochs, 3);
        assert!(options.verbose);
        assert!(!TrainOptions::new(3, 0.01).verbose);
    }

    #[test]
    fn test_pipeline_from_toml() {
        let source = r#"
            [detector]
            kind = "autoencoder"
            window_size = 3
            layers = [16, 8]

            [train]
            epochs = 5
        "#;
        let config = PipelineConfig::from_toml_str(source).unwrap();
        match &config.detector {
            DetectorConfig::AutoEncoder(c) => {
                assert_eq!(c.window_size, 3);
                assert_eq!(c.layers, vec![16, 8]);
                assert_eq!(c.latent_size, 100);
            }
            other => panic!("unexpected detector {:?}", other),
        }
        assert_eq!(config.train.epochs, 5);
        assert_eq!(config.train.learning_rate, 1e-4);
    }

    #[test]
    fn test_parallel_compute_mode_from_toml() {
        let source = r#"
            [detector]
            kind = "donut"
            x_dims = 30
            compute = { parallel = { threads = 2 } }
        "#;
        let config = PipelineConfig::from_toml_str(source).unwrap();
        match config.detector {
            DetectorConfig::Donut(c) => {
                assert_eq!(c.x_dims, 30);
                assert_eq!(c.compute, ComputeMode::Parallel { threads: Some(2) });
            }
            other => panic!("unexpected detector {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let source = r#"
            [detector]
            kind = "isolation_forest"
        "#;
        assert!(matches!(
            PipelineConfig::from_toml_str(source),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = AutoEncoderConfig {
            layers: vec![10, 0],
            ..AutoEncoderConfig::default()
        };
        assert!(config.validate().is_err());

        let config = LstmAdConfig {
            dropout: 1.0,
            ..LstmAdConfig::default()
        };
        assert!(config.validate().is_err());

        assert!(TrainOptions::new(1, 0.0).validate().is_err());
    }
}
