use ndarray::{s, Array2, ArrayView1, ArrayView2};

use crate::error::{Error, Result};

/// Time-indexed table: one row per timestamp, one column per signal.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    index: Vec<i64>,
    columns: Vec<String>,
    values: Array2<f64>,
}

impl TimeSeries {
    /// Build a table, checking that `index` and `columns` match the value matrix.
    pub fn new(index: Vec<i64>, columns: Vec<String>, values: Array2<f64>) -> Result<Self> {
        let (rows, cols) = values.dim();
        if index.len() != rows {
            return Err(Error::Shape(format!(
                "index has {} entries but values have {} rows",
                index.len(),
                rows
            )));
        }
        if columns.len() != cols {
            return Err(Error::Shape(format!(
                "{} column names for {} value columns",
                columns.len(),
                cols
            )));
        }
        Ok(TimeSeries { index, columns, values })
    }

    /// Table over `values` with a `0..T` index and columns named by position.
    pub fn from_values(values: Array2<f64>) -> Self {
        let (rows, cols) = values.dim();
        TimeSeries {
            index: (0..rows as i64).collect(),
            columns: (0..cols).map(|c| c.to_string()).collect(),
            values,
        }
    }

    /// Table over `values` with the given index and positional column names.
    pub fn with_index(index: Vec<i64>, values: Array2<f64>) -> Result<Self> {
        let columns = (0..values.ncols()).map(|c| c.to_string()).collect();
        Self::new(index, columns, values)
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    pub fn n_columns(&self) -> usize {
        self.values.ncols()
    }

    pub fn index(&self) -> &[i64] {
        &self.index
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn column(&self, j: usize) -> ArrayView1<'_, f64> {
        self.values.column(j)
    }

    /// Rows `start..end` as a new table.
    pub fn slice_rows(&self, start: usize, end: usize) -> TimeSeries {
        TimeSeries {
            index: self.index[start..end].to_vec(),
            columns: self.columns.clone(),
            values: self.values.slice(s![start..end, ..]).to_owned(),
        }
    }

    pub(crate) fn ensure_not_empty(&self) -> Result<()> {
        if self.is_empty() || self.n_columns() == 0 {
            return Err(Error::EmptyData);
        }
        Ok(())
    }
}
