use ndarray::ArrayView1;

use crate::error::{Error, Result};

/// Classification metrics of a detection mask against ground-truth labels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionReport {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_negatives: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Evaluator for detector output over labelled series.
///
/// Labels and masks are 0/1; any positive value counts as anomalous.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    skip: usize,
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator::default()
    }

    /// Ignore the first `skip` points, e.g. a detector's padded warm-up.
    pub fn skip_first(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    /// Precision, recall and F1 of a detection mask.
    pub fn evaluate_mask(
        &self,
        labels: ArrayView1<'_, i32>,
        mask: ArrayView1<'_, i32>,
    ) -> Result<DetectionReport> {
        check_lengths(labels.len(), mask.len())?;
        let labels: Vec<f64> = labels.iter().skip(self.skip).map(|&l| l as f64).collect();
        let predicted: Vec<f64> = mask.iter().skip(self.skip).map(|&m| m as f64).collect();
        Ok(calculate_threshold_metrics(&labels, &predicted, 0.5))
    }

    /// Precision, recall and F1 of `scores > threshold`.
    pub fn evaluate_scores(
        &self,
        labels: ArrayView1<'_, i32>,
        scores: ArrayView1<'_, f64>,
        threshold: f64,
    ) -> Result<DetectionReport> {
        check_lengths(labels.len(), scores.len())?;
        let labels: Vec<f64> = labels.iter().skip(self.skip).map(|&l| l as f64).collect();
        let scores: Vec<f64> = scores.iter().skip(self.skip).copied().collect();
        Ok(calculate_threshold_metrics(&labels, &scores, threshold))
    }

    /// Area under the ROC curve; 0.5 when only one class is present.
    pub fn auroc(&self, labels: ArrayView1<'_, i32>, scores: ArrayView1<'_, f64>) -> Result<f64> {
        check_lengths(labels.len(), scores.len())?;
        let labels: Vec<bool> = labels.iter().skip(self.skip).map(|&l| l > 0).collect();
        let scores: Vec<f64> = scores.iter().skip(self.skip).copied().collect();
        Ok(calculate_auroc(&labels, &scores))
    }
}

fn check_lengths(labels: usize, other: usize) -> Result<()> {
    if labels != other {
        return Err(Error::Shape(format!(
            "{} labels for {} predictions",
            labels, other
        )));
    }
    Ok(())
}

fn calculate_threshold_metrics(true_labels: &[f64], scores: &[f64], threshold: f64) -> DetectionReport {
    let mut tp = 0;
    let mut fp = 0;
    let mut fn_count = 0;
    let mut tn = 0;

    for (label, score) in true_labels.iter().zip(scores.iter()) {
        let predicted = *score > threshold;
        let actual = *label > 0.0;
        match (actual, predicted) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (true, false) => fn_count += 1,
            (false, false) => tn += 1,
        }
    }

    let precision = if tp + fp > 0 { tp as f64 / (tp + fp) as f64 } else { 0.0 };
    let recall = if tp + fn_count > 0 { tp as f64 / (tp + fn_count) as f64 } else { 0.0 };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    DetectionReport {
        true_positives: tp,
        false_positives: fp,
        false_negatives: fn_count,
        true_negatives: tn,
        precision,
        recall,
        f1,
    }
}

// Mann-Whitney U statistic with average ranks for ties.
fn calculate_auroc(labels: &[bool], scores: &[f64]) -> f64 {
    let positives = labels.iter().filter(|&&l| l).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = ranks
        .iter()
        .zip(labels)
        .filter(|(_, &l)| l)
        .map(|(r, _)| r)
        .sum();
    let p = positives as f64;
    (positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}

#[cfg(feature = "python")]
mod python {
    use super::*;
    use numpy::PyReadonlyArray1;
    use pyo3::prelude::*;
    use pyo3::types::PyDict;

    /// Python-exposed wrapper around Evaluator
    #[pyclass(name = "Evaluator")]
    pub struct PyEvaluator {
        inner: Evaluator,
    }

    fn report_dict<'py>(py: Python<'py>, report: &DetectionReport) -> PyResult<&'py PyDict> {
        let dict = PyDict::new(py);
        dict.set_item("true_positives", report.true_positives)?;
        dict.set_item("false_positives", report.false_positives)?;
        dict.set_item("false_negatives", report.false_negatives)?;
        dict.set_item("true_negatives", report.true_negatives)?;
        dict.set_item("precision", report.precision)?;
        dict.set_item("recall", report.recall)?;
        dict.set_item("f1", report.f1)?;
        Ok(dict)
    }

    #[pymethods]
    impl PyEvaluator {
        #[new]
        #[pyo3(signature = (skip=0))]
        fn new(skip: usize) -> Self {
            PyEvaluator {
                inner: Evaluator::new().skip_first(skip),
            }
        }

        fn evaluate_mask<'py>(
            &self,
            py: Python<'py>,
            labels: PyReadonlyArray1<'_, i32>,
            mask: PyReadonlyArray1<'_, i32>,
        ) -> PyResult<&'py PyDict> {
            let report = self.inner.evaluate_mask(labels.as_array(), mask.as_array())?;
            report_dict(py, &report)
        }

        #[pyo3(signature = (labels, scores, threshold=0.5))]
        fn evaluate_scores<'py>(
            &self,
            py: Python<'py>,
            labels: PyReadonlyArray1<'_, i32>,
            scores: PyReadonlyArray1<'_, f64>,
            threshold: f64,
        ) -> PyResult<&'py PyDict> {
            let report = self
                .inner
                .evaluate_scores(labels.as_array(), scores.as_array(), threshold)?;
            report_dict(py, &report)
        }

        fn auroc(&self, labels: PyReadonlyArray1<'_, i32>, scores: PyReadonlyArray1<'_, f64>) -> PyResult<f64> {
            Ok(self.inner.auroc(labels.as_array(), scores.as_array())?)
        }
    }
}

#[cfg(feature = "python")]
pub use python::PyEvaluator;
