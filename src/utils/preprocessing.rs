//! Donut preprocessing: put a KPI on a regular time grid and standardise it.

use ndarray::{Array1, ArrayView1};
use tracing::warn;

use statrs::statistics::Statistics;

use crate::error::{Error, Result};

/// Upper bound on the number of grid points a completed series may have.
pub const MAX_GRID_LEN: usize = 1 << 24;

/// A series placed on a regular grid.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedSeries {
    /// Grid timestamps from the first to the last observed timestamp.
    pub timestamps: Vec<i64>,
    /// Values on the grid; inserted points are 0.
    pub values: Array1<f64>,
    /// `true` where the point was inserted.
    pub missing: Vec<bool>,
    /// Grid position of each input row, in input order.
    pub positions: Vec<usize>,
}

/// Fill gaps in `timestamps` so the series has a constant interval.
///
/// The interval is the smallest spacing between sorted timestamps. Input
/// order does not matter; duplicates and stamps off the grid are rejected.
pub fn complete_timestamp(timestamps: &[i64], values: ArrayView1<'_, f64>) -> Result<CompletedSeries> {
    if timestamps.len() != values.len() {
        return Err(Error::Shape(format!(
            "{} timestamps for {} values",
            timestamps.len(),
            values.len()
        )));
    }
    if timestamps.is_empty() {
        return Err(Error::EmptyData);
    }

    let mut order: Vec<usize> = (0..timestamps.len()).collect();
    order.sort_by_key(|&i| timestamps[i]);

    let sorted: Vec<i64> = order.iter().map(|&i| timestamps[i]).collect();
    let mut interval: Option<i64> = None;
    for pair in sorted.windows(2) {
        let diff = pair[1]
            .checked_sub(pair[0])
            .ok_or_else(|| Error::Timestamp(format!("spacing between {} and {} overflows", pair[0], pair[1])))?;
        if diff == 0 {
            return Err(Error::Timestamp(format!("duplicated timestamp {}", pair[0])));
        }
        interval = Some(interval.map_or(diff, |i| i.min(diff)));
    }

    let start = sorted[0];
    let Some(interval) = interval else {
        return Ok(CompletedSeries {
            timestamps: vec![start],
            values: values.to_owned(),
            missing: vec![false],
            positions: vec![0],
        });
    };

    let end = sorted[sorted.len() - 1];
    let span = end
        .checked_sub(start)
        .ok_or_else(|| Error::Timestamp(format!("span from {} to {} overflows", start, end)))?;
    let len = usize::try_from(span / interval)
        .ok()
        .and_then(|steps| steps.checked_add(1))
        .filter(|&len| len <= MAX_GRID_LEN)
        .ok_or_else(|| {
            Error::Timestamp(format!(
                "grid from {} to {} with interval {} exceeds {} points",
                start, end, interval, MAX_GRID_LEN
            ))
        })?;
    let mut grid_values = Array1::zeros(len);
    let mut missing = vec![true; len];
    let mut positions = vec![0; timestamps.len()];

    for &i in &order {
        let offset = timestamps[i] - start;
        if offset % interval != 0 {
            return Err(Error::Timestamp(format!(
                "timestamp {} is not on the {}-step grid starting at {}",
                timestamps[i], interval, start
            )));
        }
        let pos = (offset / interval) as usize;
        grid_values[pos] = values[i];
        missing[pos] = false;
        positions[i] = pos;
    }

    Ok(CompletedSeries {
        timestamps: (0..len as i64).map(|k| start + k * interval).collect(),
        values: grid_values,
        missing,
        positions,
    })
}

/// Mean and standard deviation of a KPI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Standardization {
    pub mean: f64,
    pub std: f64,
}

impl Standardization {
    pub fn apply(&self, values: ArrayView1<'_, f64>) -> Array1<f64> {
        values.mapv(|v| (v - self.mean) / self.std)
    }
}

/// Standardise `values`, computing the statistics over points not flagged
/// in `excludes`. A zero deviation is replaced by 1.
pub fn standardize_kpi(
    values: ArrayView1<'_, f64>,
    excludes: &[bool],
) -> Result<(Array1<f64>, Standardization)> {
    if values.len() != excludes.len() {
        return Err(Error::Shape(format!(
            "{} exclusion flags for {} values",
            excludes.len(),
            values.len()
        )));
    }
    let kept: Vec<f64> = values
        .iter()
        .zip(excludes)
        .filter(|(_, &excluded)| !excluded)
        .map(|(&v, _)| v)
        .collect();
    if kept.is_empty() {
        return Err(Error::EmptyData);
    }

    let mean = kept.iter().mean();
    let mut std = kept.iter().population_std_dev();
    if std <= f64::EPSILON {
        warn!(mean, "constant KPI, standardising with unit deviation");
        std = 1.0;
    }

    let stats = Standardization { mean, std };
    Ok((stats.apply(values), stats))
}
