//! Donut: per-column VAE anomaly detection on seasonal KPIs.
//!
//! Every column is completed onto a regular time grid, standardised, and
//! modelled by its own [`GaussianVae`] over sliding windows of `x_dims`
//! points. Training maximises the M-ELBO, which ignores missing points;
//! scoring imputes missing points by MCMC and reports the reconstruction
//! log-probability of the last point of each window, so lower scores are
//! more anomalous.

use ndarray::{s, Array1, Array2, ArrayView1, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::config::{DonutConfig, TrainOptions};
use crate::error::{Error, Result};
use crate::models::base_model::{check_columns, BaseDetector};
use crate::nn::optim::{grad_norm, Adam, Trainable};
use crate::nn::vae::{sliding_windows, GaussianVae};
use crate::table::TimeSeries;
use crate::utils::parallel::map_indexed;
use crate::utils::preprocessing::{complete_timestamp, standardize_kpi, CompletedSeries, Standardization};
use crate::utils::window::window_data;

#[derive(Debug, Clone)]
struct ColumnModel {
    vae: GaussianVae,
    standardization: Standardization,
}

/// A column on its grid, standardised, with inserted points zeroed.
struct PreparedColumn {
    completed: CompletedSeries,
    values: Array1<f64>,
    /// 1 for observed points, 0 for inserted ones.
    mask: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct Donut {
    config: DonutConfig,
    models: Option<Vec<ColumnModel>>,
    n_columns: usize,
    seed: u64,
}

impl Donut {
    pub fn new(config: DonutConfig) -> Result<Self> {
        config.validate()?;
        Ok(Donut {
            config,
            models: None,
            n_columns: 0,
            seed: 0,
        })
    }

    pub fn config(&self) -> &DonutConfig {
        &self.config
    }

    fn complete(&self, index: &[i64], values: ArrayView1<'_, f64>) -> Result<CompletedSeries> {
        let completed = complete_timestamp(index, values)?;
        let len = completed.values.len();
        if len < self.config.x_dims {
            return Err(Error::SeriesTooShort {
                needed: self.config.x_dims - 1,
                len,
            });
        }
        Ok(completed)
    }

    fn prepare(completed: CompletedSeries, standardization: &Standardization) -> PreparedColumn {
        let mut values = standardization.apply(completed.values.view());
        let mask = Array1::from_iter(completed.missing.iter().map(|&m| if m { 0.0 } else { 1.0 }));
        Zip::from(&mut values).and(&mask).for_each(|v, &m| {
            if m == 0.0 {
                *v = 0.0;
            }
        });
        PreparedColumn { completed, values, mask }
    }

    fn train_column(
        &self,
        column: usize,
        seed: u64,
        index: &[i64],
        raw: ArrayView1<'_, f64>,
        options: &TrainOptions,
    ) -> Result<ColumnModel> {
        let completed = self.complete(index, raw)?;
        let (_, standardization) = standardize_kpi(completed.values.view(), &completed.missing)?;
        let prepared = Self::prepare(completed, &standardization);
        let cfg = &self.config;
        let len = prepared.values.len();

        let valid_len = (len as f64 * cfg.valid_portion).floor() as usize;
        let split = if valid_len >= cfg.x_dims && len - valid_len >= cfg.x_dims {
            Some(len - valid_len)
        } else {
            if valid_len > 0 {
                warn!(column, len, "series too short for a validation split, training on all points");
            }
            None
        };
        let train_end = split.unwrap_or(len);
        let train_values = prepared.values.slice(s![..train_end]);
        let train_mask = prepared.mask.slice(s![..train_end]);
        let validation = split.map(|start| {
            (
                sliding_windows(prepared.values.slice(s![start..]), cfg.x_dims),
                sliding_windows(prepared.mask.slice(s![start..]), cfg.x_dims),
            )
        });

        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(column as u64));
        let mut vae = GaussianVae::new(
            cfg.x_dims,
            cfg.z_dims,
            &cfg.hidden_layers,
            &cfg.hidden_layers,
            cfg.std_epsilon,
            &mut rng,
        );
        let mut optimizer = Adam::new(options.learning_rate);
        let mut best: Option<(f64, GaussianVae)> = None;
        let n_windows = train_end + 1 - cfg.x_dims;
        let mut order: Vec<usize> = (0..n_windows).collect();
        debug!(column, len, train_points = train_end, windows = n_windows, "training donut column");

        for epoch in 0..options.epochs {
            if cfg.lr_anneal_epochs > 0 && epoch > 0 && epoch % cfg.lr_anneal_epochs == 0 {
                optimizer.set_learning_rate(optimizer.learning_rate() * cfg.lr_anneal_factor);
            }

            // Missing-data injection on observed points.
            let mut values = train_values.to_owned();
            let mut mask = train_mask.to_owned();
            Zip::from(&mut values).and(&mut mask).for_each(|v, m| {
                if *m == 1.0 && rng.gen::<f64>() < cfg.missing_injection_rate {
                    *m = 0.0;
                    *v = 0.0;
                }
            });
            let windows = sliding_windows(values.view(), cfg.x_dims);
            let masks = sliding_windows(mask.view(), cfg.x_dims);

            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0;
            let mut batches = 0;
            for batch in order.chunks(cfg.batch_size) {
                let x = windows.select(Axis(0), batch);
                let m = masks.select(Axis(0), batch);
                vae.zero_grad();
                epoch_loss += vae.accumulate_gradients(x.view(), m.view(), cfg.l2_regularization, &mut rng);
                let norm = grad_norm(&mut vae);
                let scale = if norm > cfg.max_grad_norm { cfg.max_grad_norm / norm } else { 1.0 };
                optimizer.step_scaled(&mut vae, scale);
                batches += 1;
            }
            let loss = epoch_loss / batches.max(1) as f64;

            let valid_loss = validation
                .as_ref()
                .map(|(x, m)| vae.loss(x.view(), m.view(), &mut rng));
            if let Some(valid_loss) = valid_loss {
                if best.as_ref().map_or(true, |(b, _)| valid_loss < *b) {
                    best = Some((valid_loss, vae.clone()));
                }
            }
            if options.verbose {
                info!(column, epoch, loss, valid_loss, lr = optimizer.learning_rate(), "donut epoch");
            } else {
                debug!(column, epoch, loss, valid_loss, "donut epoch");
            }
        }

        if let Some((valid_loss, best_vae)) = best {
            debug!(column, valid_loss, "restoring best donut parameters");
            vae = best_vae;
        }
        Ok(ColumnModel { vae, standardization })
    }

    /// Scores for every row of the (already windowed) input column, in input order.
    fn predict_column(
        &self,
        column: usize,
        model: &ColumnModel,
        index: &[i64],
        raw: ArrayView1<'_, f64>,
    ) -> Result<Vec<f64>> {
        let cfg = &self.config;
        let completed = self.complete(index, raw)?;
        let prepared = Self::prepare(completed, &model.standardization);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(column as u64));

        let mut windows = sliding_windows(prepared.values.view(), cfg.x_dims);
        let masks = sliding_windows(prepared.mask.view(), cfg.x_dims);
        if prepared.mask.iter().any(|&m| m == 0.0) {
            for _ in 0..cfg.mcmc_iterations {
                let reconstructed = model.vae.reconstruct_sampled(windows.view(), &mut rng);
                Zip::from(&mut windows)
                    .and(&masks)
                    .and(&reconstructed)
                    .for_each(|x, &m, &r| {
                        if m == 0.0 {
                            *x = r;
                        }
                    });
            }
        }

        let mut grid_scores = vec![0.0; cfg.x_dims - 1];
        grid_scores.extend(
            windows
                .outer_iter()
                .map(|w| model.vae.last_point_log_prob(w, cfg.n_z, &mut rng)),
        );
        Ok(prepared
            .completed
            .positions
            .iter()
            .map(|&p| grid_scores[p])
            .collect())
    }

    fn trained_models(&self, data: &TimeSeries) -> Result<&[ColumnModel]> {
        let models = self.models.as_deref().ok_or(Error::NotTrained)?;
        check_columns(self.n_columns, data)?;
        Ok(models)
    }

    /// Apply the pre-windowing step, if any.
    fn windowed(&self, data: &TimeSeries) -> Result<Option<TimeSeries>> {
        if self.config.window_size > 1 {
            window_data(data, self.config.window_size).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Per-column scores, `len(data) x columns` (columns of the pre-windowed
    /// table when `window_size > 1`). Lower is more anomalous.
    pub fn predict_per_column(&self, data: &TimeSeries) -> Result<Array2<f64>> {
        let models = self.trained_models(data)?;
        let windowed = self.windowed(data)?;
        let table = windowed.as_ref().unwrap_or(data);
        let pad = self.config.window_size - 1;

        let columns = map_indexed(&self.config.compute, models.len(), |c| {
            self.predict_column(c, &models[c], table.index(), table.column(c))
        })
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        let mut scores = Array2::zeros((data.len(), models.len()));
        for (c, column) in columns.into_iter().enumerate() {
            scores
                .slice_mut(s![pad.., c])
                .assign(&Array1::from(column));
        }
        Ok(scores)
    }
}

impl BaseDetector for Donut {
    fn train(&mut self, data: &TimeSeries, options: &TrainOptions) -> Result<()> {
        options.validate()?;
        data.ensure_not_empty()?;
        let seed = self.config.seed.unwrap_or_else(rand::random);
        let windowed = self.windowed(data)?;
        let table = windowed.as_ref().unwrap_or(data);
        debug!(columns = table.n_columns(), rows = table.len(), "training donut");

        let this = &*self;
        let models = map_indexed(&this.config.compute, table.n_columns(), |c| {
            this.train_column(c, seed, table.index(), table.column(c), options)
        })
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

        self.seed = seed;
        self.n_columns = data.n_columns();
        self.models = Some(models);
        Ok(())
    }

    /// Mean of [`Donut::predict_per_column`] across columns.
    fn predict(&self, data: &TimeSeries) -> Result<Array1<f64>> {
        let per_column = self.predict_per_column(data)?;
        per_column
            .mean_axis(Axis(1))
            .ok_or(Error::EmptyData)
    }

    fn detect(&self, _data: &TimeSeries) -> Result<Array1<i32>> {
        Err(Error::Unsupported(
            "Donut does not provide threshold detection; threshold predict() scores instead".into(),
        ))
    }

    fn is_trained(&self) -> bool {
        self.models.is_some()
    }
}

#[cfg(feature = "python")]
mod python {
    use super::*;
    use numpy::{IntoPyArray, PyArray1, PyArray2, PyReadonlyArray2};
    use pyo3::prelude::*;

    fn to_table(data: PyReadonlyArray2<'_, f64>, index: Option<Vec<i64>>) -> Result<TimeSeries> {
        let values = data.as_array().to_owned();
        match index {
            Some(index) => TimeSeries::with_index(index, values),
            None => Ok(TimeSeries::from_values(values)),
        }
    }

    /// Python-exposed wrapper around Donut
    #[pyclass(name = "Donut")]
    pub struct PyDonut {
        inner: Donut,
    }

    #[pymethods]
    impl PyDonut {
        #[new]
        #[pyo3(signature = (window_size=1, x_dims=120, z_dims=5, n_z=1024, random_state=None))]
        fn new(
            window_size: usize,
            x_dims: usize,
            z_dims: usize,
            n_z: usize,
            random_state: Option<u64>,
        ) -> PyResult<Self> {
            let config = DonutConfig {
                window_size,
                x_dims,
                z_dims,
                n_z,
                seed: random_state,
                ..DonutConfig::default()
            };
            Ok(PyDonut { inner: Donut::new(config)? })
        }

        #[pyo3(signature = (data, index=None, epochs=20, learning_rate=1e-4, verbose=false))]
        fn train(
            &mut self,
            data: PyReadonlyArray2<'_, f64>,
            index: Option<Vec<i64>>,
            epochs: usize,
            learning_rate: f64,
            verbose: bool,
        ) -> PyResult<()> {
            let table = to_table(data, index)?;
            let options = TrainOptions::new(epochs, learning_rate).verbose(verbose);
            self.inner.train(&table, &options)?;
            Ok(())
        }

        #[pyo3(signature = (data, index=None))]
        fn predict<'py>(
            &self,
            py: Python<'py>,
            data: PyReadonlyArray2<'_, f64>,
            index: Option<Vec<i64>>,
        ) -> PyResult<&'py PyArray1<f64>> {
            let table = to_table(data, index)?;
            Ok(self.inner.predict(&table)?.into_pyarray(py))
        }

        #[pyo3(signature = (data, index=None))]
        fn predict_per_column<'py>(
            &self,
            py: Python<'py>,
            data: PyReadonlyArray2<'_, f64>,
            index: Option<Vec<i64>>,
        ) -> PyResult<&'py PyArray2<f64>> {
            let table = to_table(data, index)?;
            Ok(self.inner.predict_per_column(&table)?.into_pyarray(py))
        }
    }
}

#[cfg(feature = "python")]
pub use python::PyDonut;
