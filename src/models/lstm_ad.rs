//! LSTM-based multi-step prediction detector (LSTM-AD).
//!
//! A stacked LSTM predicts the next `L` values of every column from each
//! point. Every point is then predicted `L` times by earlier points; the
//! `L * d` prediction residuals are scored against a Gaussian fitted on
//! held-out data, and low likelihood means anomalous.

use ndarray::{s, Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::{LstmAdConfig, TrainOptions};
use crate::error::{Error, Result};
use crate::models::base_model::{check_columns, BaseDetector};
use crate::models::error_distribution::ErrorDistribution;
use crate::nn::lstm::Lstm;
use crate::nn::optim::{Adam, Trainable};
use crate::table::TimeSeries;
use crate::utils::parallel::map_indexed;

#[derive(Debug, Clone)]
pub struct LstmAd {
    config: LstmAdConfig,
    model: Option<Lstm>,
    distribution: Option<ErrorDistribution>,
    n_columns: usize,
}

/// `L`-step-ahead targets: row `t`, element `j * L + k` holds `x[t + 1 + k][j]`,
/// zero past the end of the series.
fn prediction_targets(values: ArrayView2<'_, f64>, l: usize) -> Array2<f64> {
    let (steps, dims) = values.dim();
    Array2::from_shape_fn((steps, dims * l), |(t, e)| {
        let (j, k) = (e / l, e % l);
        values.get((t + 1 + k, j)).copied().unwrap_or(0.0)
    })
}

/// Residuals for every `t` in `[L, T - L)`: element `j * L + k` is
/// `x[t][j]` minus its prediction made `k + 1` steps earlier.
fn prediction_residuals(values: ArrayView2<'_, f64>, outputs: &Array2<f64>, l: usize) -> Array2<f64> {
    let (steps, dims) = values.dim();
    let rows = steps.saturating_sub(2 * l);
    Array2::from_shape_fn((rows, dims * l), |(r, e)| {
        let t = r + l;
        let (j, k) = (e / l, e % l);
        values[[t, j]] - outputs[[t - 1 - k, e]]
    })
}

impl LstmAd {
    pub fn new(config: LstmAdConfig) -> Result<Self> {
        config.validate()?;
        Ok(LstmAd {
            config,
            model: None,
            distribution: None,
            n_columns: 0,
        })
    }

    pub fn config(&self) -> &LstmAdConfig {
        &self.config
    }

    /// Fitted residual distribution, `None` before training.
    pub fn error_distribution(&self) -> Option<&ErrorDistribution> {
        self.distribution.as_ref()
    }

    fn check_length(&self, len: usize) -> Result<()> {
        let needed = 2 * self.config.l_predictions;
        if len <= needed {
            return Err(Error::SeriesTooShort { needed, len });
        }
        Ok(())
    }

    /// Split into (train, fit) rows; `fit` is `None` when the tail is too
    /// short and the training residuals have to be used instead.
    fn split(&self, len: usize) -> (usize, Option<usize>) {
        let l = self.config.l_predictions;
        let tail = (len as f64 * self.config.validation_portion).floor() as usize;
        let head = len - tail;
        if tail > 2 * l && head > l {
            (head, Some(head))
        } else {
            (len, None)
        }
    }

    fn fit_epoch(
        &self,
        model: &mut Lstm,
        optimizer: &mut Adam,
        inputs: ArrayView2<'_, f64>,
        targets: &Array2<f64>,
        rng: &mut StdRng,
    ) -> f64 {
        let usable = inputs.nrows() - self.config.l_predictions;
        model.zero_grad();
        let (outputs, cache) = model.forward_train(inputs, rng);

        let count = (usable * targets.ncols()).max(1) as f64;
        let diff = &outputs.slice(s![..usable, ..]) - &targets.slice(s![..usable, ..]);
        let loss = diff.iter().map(|d| d * d).sum::<f64>() / count;

        let mut d_outputs = Array2::zeros(outputs.raw_dim());
        d_outputs
            .slice_mut(s![..usable, ..])
            .assign(&diff.mapv(|d| 2.0 * d / count));
        model.backward(&cache, d_outputs);
        optimizer.step(model);
        loss
    }

    fn residuals(&self, model: &Lstm, values: ArrayView2<'_, f64>) -> Array2<f64> {
        let outputs = model.forward(values);
        prediction_residuals(values, &outputs, self.config.l_predictions)
    }

    fn trained(&self, data: &TimeSeries) -> Result<(&Lstm, &ErrorDistribution)> {
        match (&self.model, &self.distribution) {
            (Some(model), Some(distribution)) => {
                check_columns(self.n_columns, data)?;
                self.check_length(data.len())?;
                Ok((model, distribution))
            }
            _ => Err(Error::NotTrained),
        }
    }
}

impl BaseDetector for LstmAd {
    fn train(&mut self, data: &TimeSeries, options: &TrainOptions) -> Result<()> {
        options.validate()?;
        data.ensure_not_empty()?;
        self.check_length(data.len())?;

        let l = self.config.l_predictions;
        let dims = data.n_columns();
        let values = data.values();
        let (train_rows, fit_from) = self.split(data.len());
        let train_values = values.slice(s![..train_rows, ..]);
        let targets = prediction_targets(train_values, l);

        let seed = self.config.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = Lstm::new(
            dims,
            self.config.hidden_size,
            dims * l,
            self.config.num_layers,
            self.config.dropout,
            &mut rng,
        );
        let mut optimizer = Adam::new(options.learning_rate);
        debug!(
            train_rows,
            fit_rows = data.len() - fit_from.unwrap_or(0),
            l_predictions = l,
            epochs = options.epochs,
            "training lstm-ad"
        );

        for epoch in 0..options.epochs {
            let loss = self.fit_epoch(&mut model, &mut optimizer, train_values, &targets, &mut rng);
            if options.verbose {
                info!(epoch, loss, "lstm-ad epoch");
            } else {
                debug!(epoch, loss, "lstm-ad epoch");
            }
        }

        let residuals = match fit_from {
            Some(start) => self.residuals(&model, values.slice(s![start.., ..])),
            None => {
                warn!(
                    len = data.len(),
                    validation_portion = self.config.validation_portion,
                    "validation split too short, fitting errors on training data"
                );
                self.residuals(&model, train_values)
            }
        };
        let distribution = ErrorDistribution::fit(residuals.view(), self.config.covariance_regularization)?;

        self.n_columns = dims;
        self.model = Some(model);
        self.distribution = Some(distribution);
        Ok(())
    }

    fn predict(&self, data: &TimeSeries) -> Result<Array1<f64>> {
        let (model, distribution) = self.trained(data)?;
        let l = self.config.l_predictions;
        let residuals = self.residuals(model, data.values());
        let likelihood = map_indexed(&self.config.compute, residuals.nrows(), |r| {
            distribution.pdf(residuals.row(r))
        });

        let mut scores = Array1::zeros(data.len());
        scores
            .slice_mut(s![l..l + likelihood.len()])
            .assign(&Array1::from(likelihood));
        Ok(scores)
    }

    fn detect(&self, data: &TimeSeries) -> Result<Array1<i32>> {
        let scores = self.predict(data)?;
        let l = self.config.l_predictions;
        let end = data.len() - l;
        Ok(Array1::from_iter(scores.iter().enumerate().map(|(t, &p)| {
            i32::from(t >= l && t < end && p < self.config.threshold)
        })))
    }

    fn is_trained(&self) -> bool {
        self.model.is_some() && self.distribution.is_some()
    }
}

#[cfg(feature = "python")]
mod python {
    use super::*;
    use numpy::{IntoPyArray, PyArray1, PyReadonlyArray2};
    use pyo3::prelude::*;

    /// Python-exposed wrapper around LstmAd
    #[pyclass(name = "LSTM_AD")]
    pub struct PyLstmAd {
        inner: LstmAd,
    }

    #[pymethods]
    impl PyLstmAd {
        #[new]
        #[pyo3(signature = (l_predictions=10, hidden_size=400, num_layers=2, dropout=0.5, threshold=0.9, random_state=None))]
        fn new(
            l_predictions: usize,
            hidden_size: usize,
            num_layers: usize,
            dropout: f64,
            threshold: f64,
            random_state: Option<u64>,
        ) -> PyResult<Self> {
            let config = LstmAdConfig {
                l_predictions,
                hidden_size,
                num_layers,
                dropout,
                threshold,
                seed: random_state,
                ..LstmAdConfig::default()
            };
            Ok(PyLstmAd { inner: LstmAd::new(config)? })
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

        fn detect<'py>(&self, py: Python<'py>, data: PyReadonlyArray2<'_, f64>) -> PyResult<&'py PyArray1<i32>> {
            let table = TimeSeries::from_values(data.as_array().to_owned());
            Ok(self.inner.detect(&table)?.into_pyarray(py))
        }
    }
}

#[cfg(feature = "python")]
pub use python::PyLstmAd;
