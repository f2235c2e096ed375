use ndarray::{s, Array2, ArrayView2};

use crate::error::{Error, Result};
use crate::table::TimeSeries;

/// Flatten every run of `window` consecutive rows into one row.
///
/// A `T x D` matrix becomes `(T - window + 1) x (D * window)`; row `r` holds
/// rows `r..r + window` one after another.
pub fn window_array(values: ArrayView2<'_, f64>, window: usize) -> Result<Array2<f64>> {
    let (rows, cols) = values.dim();
    if window == 0 {
        return Err(Error::invalid_config("window size must be at least 1"));
    }
    if window > rows {
        return Err(Error::WindowTooLarge { window, len: rows });
    }

    let n_windows = rows - window + 1;
    let mut out = Array2::zeros((n_windows, cols * window));
    for (r, mut out_row) in out.outer_iter_mut().enumerate() {
        for k in 0..window {
            out_row
                .slice_mut(s![k * cols..(k + 1) * cols])
                .assign(&values.row(r + k));
        }
    }
    Ok(out)
}

/// Windowed view of a table. Each output row is stamped with the index of the
/// last row of its window, columns are named `"{column}_{offset}"`.
pub fn window_data(data: &TimeSeries, window: usize) -> Result<TimeSeries> {
    let values = window_array(data.values(), window)?;
    let index = data.index()[window - 1..].to_vec();
    let columns = (0..window)
        .flat_map(|k| data.columns().iter().map(move |c| format!("{}_{}", c, k)))
        .collect();
    TimeSeries::new(index, columns, values)
}

/// Left-pad a score vector with `pad` zeros.
pub(crate) fn left_pad(scores: &[f64], pad: usize) -> Vec<f64> {
    let mut padded = vec![0.0; pad];
    padded.extend_from_slice(scores);
    padded
}
