//! Auto-encoder anomaly detector.
//!
//! Windows of the series are compressed to `latent_size` and reconstructed;
//! the reconstruction error is the anomaly score. Points whose error reaches
//! `threshold` times the largest error seen on the training data are flagged.

use ndarray::{s, Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::{AutoEncoderConfig, ComputeMode, TrainOptions};
use crate::error::{Error, Result};
use crate::models::base_model::{check_columns, mask_at_least, BaseDetector};
use crate::nn::dense::Mlp;
use crate::nn::optim::{Adam, Trainable};
use crate::nn::row_mse;
use crate::table::TimeSeries;
use crate::utils::parallel::map_indexed;
use crate::utils::window::{left_pad, window_array};

pub(crate) const SCORE_CHUNK: usize = 256;

#[derive(Debug, Clone)]
struct AeModel {
    encoder: Mlp,
    decoder: Mlp,
}

impl AeModel {
    fn new(input_size: usize, latent_size: usize, layers: &[usize], rng: &mut StdRng) -> Self {
        let reversed: Vec<usize> = layers.iter().rev().copied().collect();
        AeModel {
            encoder: Mlp::new(&Mlp::schedule(input_size, layers, latent_size), false, rng),
            decoder: Mlp::new(&Mlp::schedule(latent_size, &reversed, input_size), false, rng),
        }
    }

    fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        self.decoder.forward(self.encoder.forward(x).view())
    }

    /// MSE of one batch, accumulating its gradients.
    fn accumulate_gradients(&mut self, x: ArrayView2<'_, f64>) -> f64 {
        let (encoded, enc_cache) = self.encoder.forward_cached(x);
        let (decoded, dec_cache) = self.decoder.forward_cached(encoded.view());
        let n = decoded.len().max(1) as f64;
        let diff = &decoded - &x;
        let loss = diff.iter().map(|d| d * d).sum::<f64>() / n;

        let d_decoded = diff.mapv(|d| 2.0 * d / n);
        let d_encoded = self.decoder.backward(&dec_cache, d_decoded);
        self.encoder.backward(&enc_cache, d_encoded);
        loss
    }
}

impl Trainable for AeModel {
    fn for_each_param(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        self.encoder.for_each_param(f);
        self.decoder.for_each_param(f);
    }

    fn zero_grad(&mut self) {
        self.encoder.zero_grad();
        self.decoder.zero_grad();
    }
}

/// Per-row reconstruction MSE, computed in chunks so the serial and parallel
/// paths perform identical arithmetic.
pub(crate) fn chunked_errors<F>(
    samples: &Array2<f64>,
    compute: &ComputeMode,
    reconstruct: F,
) -> Vec<f64>
where
    F: Fn(ArrayView2<'_, f64>) -> Array2<f64> + Sync + Send,
{
    let n_chunks = (samples.nrows() + SCORE_CHUNK - 1) / SCORE_CHUNK;
    map_indexed(compute, n_chunks, |c| {
        let end = ((c + 1) * SCORE_CHUNK).min(samples.nrows());
        let chunk = samples.slice(s![c * SCORE_CHUNK..end, ..]);
        row_mse(&reconstruct(chunk), &chunk.to_owned())
    })
    .into_iter()
    .flatten()
    .collect()
}

/// Squared error of the last row of every window, one output row per input
/// row with the first `window - 1` rows left at zero.
pub(crate) fn last_row_errors(
    samples: &Array2<f64>,
    reconstructed: &Array2<f64>,
    n_columns: usize,
    window: usize,
) -> Array2<f64> {
    let n = samples.nrows();
    let offset = (window - 1) * n_columns;
    let mut raw = Array2::zeros((n + window - 1, n_columns));
    let diff = &samples.slice(s![.., offset..offset + n_columns])
        - &reconstructed.slice(s![.., offset..offset + n_columns]);
    raw.slice_mut(s![window - 1.., ..]).assign(&diff.mapv(|d| d * d));
    raw
}

#[derive(Debug, Clone)]
pub struct AutoEncoder {
    config: AutoEncoderConfig,
    model: Option<AeModel>,
    input_size: usize,
    n_columns: usize,
    max_error: f64,
}

impl AutoEncoder {
    pub fn new(config: AutoEncoderConfig) -> Result<Self> {
        config.validate()?;
        Ok(AutoEncoder {
            config,
            model: None,
            input_size: 0,
            n_columns: 0,
            max_error: 0.0,
        })
    }

    pub fn config(&self) -> &AutoEncoderConfig {
        &self.config
    }

    /// Width of one (windowed) sample; 0 before training.
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Largest per-sample reconstruction error on the training data.
    pub fn max_error(&self) -> f64 {
        self.max_error
    }

    /// `(in, out)` of each encoder layer, `None` before training.
    pub fn encoder_shapes(&self) -> Option<Vec<(usize, usize)>> {
        self.model.as_ref().map(|m| m.encoder.shapes())
    }

    /// `(in, out)` of each decoder layer, `None` before training.
    pub fn decoder_shapes(&self) -> Option<Vec<(usize, usize)>> {
        self.model.as_ref().map(|m| m.decoder.shapes())
    }

    fn transform_data(&self, data: &TimeSeries) -> Result<Array2<f64>> {
        if self.config.window_size > 1 {
            window_array(data.values(), self.config.window_size)
        } else {
            Ok(data.values().to_owned())
        }
    }

    fn trained_model(&self, data: &TimeSeries) -> Result<&AeModel> {
        let model = self.model.as_ref().ok_or(Error::NotTrained)?;
        check_columns(self.n_columns, data)?;
        Ok(model)
    }

    fn compute_errors(&self, model: &AeModel, samples: &Array2<f64>) -> Vec<f64> {
        chunked_errors(samples, &self.config.compute, |chunk| model.forward(chunk))
    }

    /// Per-feature squared reconstruction error, shape `len(data) x columns`.
    pub fn predict_raw_errors(&self, data: &TimeSeries) -> Result<Array2<f64>> {
        let model = self.trained_model(data)?;
        let samples = self.transform_data(data)?;
        let reconstructed = model.forward(samples.view());
        Ok(last_row_errors(
            &samples,
            &reconstructed,
            self.n_columns,
            self.config.window_size,
        ))
    }
}

impl BaseDetector for AutoEncoder {
    fn train(&mut self, data: &TimeSeries, options: &TrainOptions) -> Result<()> {
        options.validate()?;
        data.ensure_not_empty()?;
        let samples = self.transform_data(data)?;
        let input_size = samples.ncols();

        let seed = self.config.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = AeModel::new(input_size, self.config.latent_size, &self.config.layers, &mut rng);
        let mut optimizer = Adam::new(options.learning_rate);
        debug!(
            samples = samples.nrows(),
            input_size,
            epochs = options.epochs,
            "training auto-encoder"
        );

        for epoch in 0..options.epochs {
            let mut epoch_loss = 0.0;
            for sample in samples.axis_iter(Axis(0)) {
                model.zero_grad();
                epoch_loss += model.accumulate_gradients(sample.insert_axis(Axis(0)));
                optimizer.step(&mut model);
            }
            let loss = epoch_loss / samples.nrows() as f64;
            if options.verbose {
                info!(epoch, loss, "auto-encoder epoch");
            } else {
                debug!(epoch, loss, "auto-encoder epoch");
            }
        }

        let errors = self.compute_errors(&model, &samples);
        self.max_error = errors.iter().copied().fold(0.0, f64::max);
        self.input_size = input_size;
        self.n_columns = data.n_columns();
        self.model = Some(model);
        debug!(max_error = self.max_error, "auto-encoder threshold learned");
        Ok(())
    }

    fn predict(&self, data: &TimeSeries) -> Result<Array1<f64>> {
        let model = self.trained_model(data)?;
        let samples = self.transform_data(data)?;
        let errors = self.compute_errors(model, &samples);
        // Zero padding to match input length.
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

    /// Python-exposed wrapper around AutoEncoder
    #[pyclass(name = "AutoEncoder")]
    pub struct PyAutoEncoder {
        inner: AutoEncoder,
    }

    #[pymethods]
    impl PyAutoEncoder {
        #[new]
        #[pyo3(signature = (window_size, latent_size=100, layers=None, threshold=0.8, random_state=None))]
        fn new(
            window_size: usize,
            latent_size: usize,
            layers: Option<Vec<usize>>,
            threshold: f64,
            random_state: Option<u64>,
        ) -> PyResult<Self> {
            let config = AutoEncoderConfig {
                window_size,
                latent_size,
                layers: layers.unwrap_or_else(|| vec![500, 200]),
                threshold,
                seed: random_state,
                ..AutoEncoderConfig::default()
            };
            Ok(PyAutoEncoder { inner: AutoEncoder::new(config)? })
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

        #[getter]
        fn max_error(&self) -> f64 {
            self.inner.max_error()
        }
    }
}

#[cfg(feature = "python")]
pub use python::PyAutoEncoder;
