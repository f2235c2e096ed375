//! Variational auto-encoder detector: a Gaussian VAE over windows, scored by
//! the reconstruction error of the decoded posterior mean.

use ndarray::{s, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::{TrainOptions, VaeConfig};
use crate::error::{Error, Result};
use crate::models::autoencoder::{chunked_errors, last_row_errors};
use crate::models::base_model::{check_columns, mask_at_least, BaseDetector};
use crate::nn::optim::{Adam, Trainable};
use crate::nn::vae::GaussianVae;
use crate::table::TimeSeries;
use crate::utils::window::{left_pad, window_array};

#[derive(Debug, Clone)]
pub struct VariationalAutoEncoder {
    config: VaeConfig,
    model: Option<GaussianVae>,
    n_columns: usize,
    max_error: f64,
}

impl VariationalAutoEncoder {
    pub fn new(config: VaeConfig) -> Result<Self> {
        config.validate()?;
        Ok(VariationalAutoEncoder {
            config,
            model: None,
            n_columns: 0,
            max_error: 0.0,
        })
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    pub fn max_error(&self) -> f64 {
        self.max_error
    }

    pub fn encoder_shapes(&self) -> Option<Vec<(usize, usize)>> {
        self.model.as_ref().map(|m| m.encoder_shapes())
    }

    pub fn decoder_shapes(&self) -> Option<Vec<(usize, usize)>> {
        self.model.as_ref().map(|m| m.decoder_shapes())
    }

    fn transform_data(&self, data: &TimeSeries) -> Result<Array2<f64>> {
        if self.config.window_size > 1 {
            window_array(data.values(), self.config.window_size)
        } else {
            Ok(data.values().to_owned())
        }
    }

    fn trained_model(&self, data: &TimeSeries) -> Result<&GaussianVae> {
        let model = self.model.as_ref().ok_or(Error::NotTrained)?;
        check_columns(self.n_columns, data)?;
        Ok(model)
    }

    fn compute_errors(&self, model: &GaussianVae, samples: &Array2<f64>) -> Vec<f64> {
        chunked_errors(samples, &self.config.compute, |chunk| model.reconstruct(chunk))
    }

    /// Per-feature squared reconstruction error, shape `len(data) x columns`.
    pub fn predict_raw_errors(&self, data: &TimeSeries) -> Result<Array2<f64>> {
        let model = self.trained_model(data)?;
        let samples = self.transform_data(data)?;
        let reconstructed = model.reconstruct(samples.view());
        Ok(last_row_errors(
            &samples,
            &reconstructed,
            self.n_columns,
            self.config.window_size,
        ))
    }
}

impl BaseDetector for VariationalAutoEncoder {
    fn train(&mut self, data: &TimeSeries, options: &TrainOptions) -> Result<()> {
        options.validate()?;
        data.ensure_not_empty()?;
        let samples = self.transform_data(data)?;
        let input_size = samples.ncols();
        let reversed: Vec<usize> = self.config.layers.iter().rev().copied().collect();

        let seed = self.config.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = GaussianVae::new(
            input_size,
            self.config.latent_size,
            &self.config.layers,
            &reversed,
            self.config.std_epsilon,
            &mut rng,
        );
        let mut optimizer = Adam::new(options.learning_rate);
        let mut order: Vec<usize> = (0..samples.nrows()).collect();
        let all_observed = Array2::<f64>::ones((self.config.batch_size, input_size));
        debug!(samples = samples.nrows(), input_size, epochs = options.epochs, "training vae");

        for epoch in 0..options.epochs {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0;
            let mut batches = 0;
            for batch in order.chunks(self.config.batch_size) {
                let x = samples.select(Axis(0), batch);
                let mask = all_observed.slice(s![..batch.len(), ..]);
                model.zero_grad();
                epoch_loss += model.accumulate_gradients(x.view(), mask, 0.0, &mut rng);
                optimizer.step(&mut model);
                batches += 1;
            }
            let loss = epoch_loss / batches.max(1) as f64;
            if options.verbose {
                info!(epoch, loss, "vae epoch");
            } else {
                debug!(epoch, loss, "vae epoch");
            }
        }

        let errors = self.compute_errors(&model, &samples);
        self.max_error = errors.iter().copied().fold(0.0, f64::max);
        self.n_columns = data.n_columns();
        self.model = Some(model);
        Ok(())
    }

    fn predict(&self, data: &TimeSeries) -> Result<Array1<f64>> {
        let model = self.trained_model(data)?;
        let samples = self.transform_data(data)?;
        let errors = self.compute_errors(model, &samples);
        Ok(Array1::from(left_pad(&errors, self.config.window_size - 1)))
    }

    fn detect(&self, data: &TimeSeries) -> Result<Array1<i32>> {
        let scores = self.predict(data)?;
        let cutoff = self.config.threshold * self.max_error;
        Ok(mask_at_least(&scores, cutoff, self.config.window_size - 1))
    }

    fn is_trained(&self) -> bool {
        self.model.is_some()
    }
}

#[cfg(feature = "python")]
mod python {
    use super::*;
    use numpy::{IntoPyArray, PyArray1, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;

    /// Python-exposed wrapper around VariationalAutoEncoder
    #[pyclass(name = "VariationalAutoEncoder")]
    pub struct PyVariationalAutoEncoder {
        inner: VariationalAutoEncoder,
    }

    #[pymethods]
    impl PyVariationalAutoEncoder {
        #[new]
        #[pyo3(signature = (window_size, latent_size=100, layers=None, threshold=0.8, random_state=None))]
        fn new(
            window_size: usize,
            latent_size: usize,
            layers: Option<Vec<usize>>,
            threshold: f64,
            random_state: Option<u64>,
        ) -> PyResult<Self> {
            let config = VaeConfig {
                window_size,
                latent_size,
                layers: layers.unwrap_or_else(|| vec![500, 200]),
                threshold,
                seed: random_state,
                ..VaeConfig::default()
            };
            Ok(PyVariationalAutoEncoder {
                inner: VariationalAutoEncoder::new(config)?,
            })
        }

        #[pyo3(signature = (data, epochs=20, learning_rate=1e-4, verbose=false))]
        fn train(
            &mut self,
            data: PyReadonlyArray2<'_, f64>,
            epochs: usize,
            learning_rate: f64,
            verbose: bool,
        ) -> PyResult<()> {
            let table = TimeSeries::from_values(data.as_array().to_owned());
            let options = TrainOptions::new(epochs, learning_rate).verbose(verbose);
            self.inner.train(&table, &options)?;
            Ok(())
        }

        fn predict<'py>(&self, py: Python<'py>, data: PyReadonlyArray2<'_, f64>) -> PyResult<&'py PyArray1<f64>> {
            let table = TimeSeries::from_values(data.as_array().to_owned());
            Ok(self.inner.predict(&table)?.into_pyarray(py))
        }

        fn predict_raw_errors<'py>(&self, py: Python<'py>, data: PyReadonlyArray2<'_, f64>) -> PyResult<&'py PyArray2<f64>> {
            let table = TimeSeries::from_values(data.as_array().to_owned());
            Ok(self.inner.predict_raw_errors(&table)?.into_pyarray(py))
        }

        fn detect<'py>(&self, py: Python<'py>, data: PyReadonlyArray2<'_, f64>) -> PyResult<&'py PyArray1<i32>> {
            let table = TimeSeries::from_values(data.as_array().to_owned());
            Ok(self.inner.detect(&table)?.into_pyarray(py))
        }
    }
}

#[cfg(feature = "python")]
pub use python::PyVariationalAutoEncoder;
