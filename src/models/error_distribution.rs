use nalgebra::DVector;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use statrs::distribution::{Continuous, MultivariateNormal};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const MAX_RIDGE_ATTEMPTS: usize = 8;

/// Multivariate Gaussian fitted to prediction residuals.
#[derive(Debug, Clone)]
pub struct ErrorDistribution {
    mean: Array1<f64>,
    normal: MultivariateNormal,
    /// Diagonal term that made the covariance positive definite.
    ridge: f64,
}

impl ErrorDistribution {
    /// Fit from `samples x dim` residuals using the biased covariance plus
    /// `regularization * I`. The ridge grows tenfold until the covariance
    /// factorises.
    pub fn fit(residuals: ArrayView2<'_, f64>, regularization: f64) -> Result<Self> {
        if residuals.nrows() == 0 || residuals.ncols() == 0 {
            return Err(Error::EmptyData);
        }
        if residuals.iter().any(|v| !v.is_finite()) {
            return Err(Error::Numerical("residuals contain non-finite values".into()));
        }
        let mean = residuals
            .mean_axis(Axis(0))
            .ok_or(Error::EmptyData)?;
        let centered = &residuals - &mean;
        let cov = centered.t().dot(&centered) / residuals.nrows() as f64;

        let mut ridge = regularization;
        for attempt in 0..=MAX_RIDGE_ATTEMPTS {
            let mut ridged = cov.clone();
            ridged.diag_mut().mapv_inplace(|v| v + ridge);
            let normal = if ridged.iter().all(|v| v.is_finite()) {
                MultivariateNormal::new(mean.to_vec(), ridged.iter().copied().collect()).ok()
            } else {
                None
            };
            if let Some(normal) = normal {
                if attempt > 0 {
                    warn!(ridge, "covariance was singular, regularised");
                }
                debug!(dim = mean.len(), samples = residuals.nrows(), ridge, "error distribution fitted");
                return Ok(ErrorDistribution { mean, normal, ridge });
            }
            ridge = if ridge > 0.0 { ridge * 10.0 } else { 1e-10 };
        }
        Err(Error::Numerical(format!(
            "covariance is not positive definite after {} ridge increases",
            MAX_RIDGE_ATTEMPTS
        )))
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> ArrayView1<'_, f64> {
        self.mean.view()
    }

    pub fn ridge(&self) -> f64 {
        self.ridge
    }

    pub fn log_pdf(&self, x: ArrayView1<'_, f64>) -> f64 {
        let point = DVector::from_iterator(x.len(), x.iter().copied());
        self.normal.ln_pdf(&point)
    }

    pub fn pdf(&self, x: ArrayView1<'_, f64>) -> f64 {
        self.log_pdf(x).exp()
    }
}
