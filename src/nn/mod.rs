//! Minimal neural-network toolkit over `ndarray`: layers carry their own
//! gradients, `backward` accumulates into them and [`optim::Adam`] applies them.

pub mod dense;
pub mod lstm;
pub mod optim;
pub mod vae;

use ndarray::Array2;
use rand::Rng;

#[inline]
pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[inline]
pub(crate) fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Uniform initialisation in `[-bound, bound)`.
pub(crate) fn uniform<R: Rng + ?Sized>(rows: usize, cols: usize, bound: f64, rng: &mut R) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..bound))
}

/// Mean squared error of each row of `output` against `target`.
pub(crate) fn row_mse(output: &Array2<f64>, target: &Array2<f64>) -> Vec<f64> {
    output
        .outer_iter()
        .zip(target.outer_iter())
        .map(|(o, t)| {
            let n = o.len().max(1) as f64;
            o.iter().zip(t.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f64>() / n
        })
        .collect()
}
