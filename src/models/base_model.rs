use ndarray::Array1;

use crate::config::TrainOptions;
use crate::error::{Error, Result};
use crate::table::TimeSeries;

/// A common Rust trait for offline anomaly detectors.
pub trait BaseDetector {
    /// Fit the model to `data`, replacing any previous state.
    fn train(&mut self, data: &TimeSeries, options: &TrainOptions) -> Result<()>;

    /// Anomaly score for every row of `data`, aligned to its length.
    fn predict(&self, data: &TimeSeries) -> Result<Array1<f64>>;

    /// 0/1 anomaly mask for every row of `data`, aligned to its length.
    fn detect(&self, data: &TimeSeries) -> Result<Array1<i32>>;

    fn is_trained(&self) -> bool;

    /// Default: train then score the same data.
    fn train_predict(&mut self, data: &TimeSeries, options: &TrainOptions) -> Result<Array1<f64>> {
        self.train(data, options)?;
        self.predict(data)
    }
}

/// Column count check shared by the detectors.
pub(crate) fn check_columns(expected: usize, data: &TimeSeries) -> Result<()> {
    if data.n_columns() != expected {
        return Err(Error::ColumnMismatch {
            expected,
            found: data.n_columns(),
        });
    }
    Ok(())
}

/// `scores >= cutoff` as 0/1, never flagging the first `pad` entries.
pub(crate) fn mask_at_least(scores: &Array1<f64>, cutoff: f64, pad: usize) -> Array1<i32> {
    Array1::from_iter(
        scores
            .iter()
            .enumerate()
            .map(|(i, &s)| i32::from(i >= pad && s >= cutoff)),
    )
}
