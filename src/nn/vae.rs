//! Gaussian variational auto-encoder with diagonal `q(z|x)` and `p(x|z)`.
//!
//! Training uses the SGVB estimator of a masked ELBO:
//!
//! ```text
//! elbo = sum_i a_i log p(x_i | z) + beta log p(z) - log q(z | x),   beta = mean(a)
//! ```
//!
//! With every `a_i = 1` this is the plain ELBO; Donut passes `a_i = 0` for
//! missing points (the M-ELBO).

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, ArrayViewD, ArrayViewMutD, Axis, Zip};
use rand::Rng;
use rand_distr::{Distribution, Normal as NormalSampler, StandardNormal};
use statrs::distribution::{Continuous, Normal};

use super::dense::{Linear, Mlp, MlpCache};
use super::optim::Trainable;
use super::{sigmoid, softplus};

#[derive(Debug, Clone)]
pub struct GaussianVae {
    h_for_q_z: Mlp,
    z_mean: Linear,
    z_std: Linear,
    h_for_p_x: Mlp,
    x_mean: Linear,
    x_std: Linear,
    std_epsilon: f64,
}

/// Diagonal Gaussian parameters for a batch, one row per sample.
#[derive(Debug, Clone)]
pub struct GaussianParams {
    pub mean: Array2<f64>,
    pub std: Array2<f64>,
    raw_std: Array2<f64>,
}

impl GaussianVae {
    /// `q_hidden`/`p_hidden` are the ReLU hidden widths of the encoder and decoder.
    pub fn new<R: Rng + ?Sized>(
        x_dims: usize,
        z_dims: usize,
        q_hidden: &[usize],
        p_hidden: &[usize],
        std_epsilon: f64,
        rng: &mut R,
    ) -> Self {
        let mut q_sizes = vec![x_dims];
        q_sizes.extend_from_slice(q_hidden);
        let mut p_sizes = vec![z_dims];
        p_sizes.extend_from_slice(p_hidden);

        let h_for_q_z = Mlp::new(&q_sizes, true, rng);
        let q_out = h_for_q_z.output_size();
        let z_mean = Linear::new(q_out, z_dims, rng);
        let z_std = Linear::new(q_out, z_dims, rng);
        let h_for_p_x = Mlp::new(&p_sizes, true, rng);
        let p_out = h_for_p_x.output_size();
        let x_mean = Linear::new(p_out, x_dims, rng);
        let x_std = Linear::new(p_out, x_dims, rng);

        GaussianVae {
            h_for_q_z,
            z_mean,
            z_std,
            h_for_p_x,
            x_mean,
            x_std,
            std_epsilon,
        }
    }

    pub fn x_dims(&self) -> usize {
        self.x_mean.out_features()
    }

    pub fn z_dims(&self) -> usize {
        self.z_mean.out_features()
    }

    /// `(in, out)` of the encoder's hidden layers followed by its mean head.
    pub fn encoder_shapes(&self) -> Vec<(usize, usize)> {
        let mut shapes = self.h_for_q_z.shapes();
        shapes.push((self.z_mean.in_features(), self.z_mean.out_features()));
        shapes
    }

    /// `(in, out)` of the decoder's hidden layers followed by its mean head.
    pub fn decoder_shapes(&self) -> Vec<(usize, usize)> {
        let mut shapes = self.h_for_p_x.shapes();
        shapes.push((self.x_mean.in_features(), self.x_mean.out_features()));
        shapes
    }

    fn gaussian(&self, h: ArrayView2<'_, f64>, mean: &Linear, std: &Linear) -> GaussianParams {
        let raw_std = std.forward(h);
        let eps = self.std_epsilon;
        GaussianParams {
            mean: mean.forward(h),
            std: raw_std.mapv(|v| softplus(v) + eps),
            raw_std,
        }
    }

    pub fn encode(&self, x: ArrayView2<'_, f64>) -> GaussianParams {
        let h = self.h_for_q_z.forward(x);
        self.gaussian(h.view(), &self.z_mean, &self.z_std)
    }

    pub fn decode(&self, z: ArrayView2<'_, f64>) -> GaussianParams {
        let h = self.h_for_p_x.forward(z);
        self.gaussian(h.view(), &self.x_mean, &self.x_std)
    }

    /// Decoded mean of the posterior mean; deterministic reconstruction.
    pub fn reconstruct(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let q = self.encode(x);
        self.decode(q.mean.view()).mean
    }

    /// Draws `z ~ q(z|x)` and then `x ~ p(x|z)` for every row.
    pub fn reconstruct_sampled<R: Rng + ?Sized>(&self, x: ArrayView2<'_, f64>, rng: &mut R) -> Array2<f64> {
        let q = self.encode(x);
        let z = sample(&q, rng);
        let p = self.decode(z.view());
        Zip::from(&p.mean)
            .and(&p.std)
            .map_collect(|&mean, &std| NormalSampler::new(mean, std).map_or(mean, |d| d.sample(rng)))
    }

    /// Monte-Carlo estimate of `E_q(z|x)[log p(x_last | z)]` for one window,
    /// using `n_z` posterior samples.
    pub fn last_point_log_prob<R: Rng + ?Sized>(&self, window: ArrayView1<'_, f64>, n_z: usize, rng: &mut R) -> f64 {
        let x = window.insert_axis(Axis(0));
        let q = self.encode(x);
        let z_dims = self.z_dims();
        let n_z = n_z.max(1);
        let mut z = Array2::<f64>::zeros((n_z, z_dims));
        for mut row in z.outer_iter_mut() {
            for k in 0..z_dims {
                let e: f64 = rng.sample(StandardNormal);
                row[k] = q.mean[[0, k]] + q.std[[0, k]] * e;
            }
        }

        let h = self.h_for_p_x.forward(z.view());
        let last = self.x_dims() - 1;
        let mean_w = self.x_mean.weight().row(last);
        let std_w = self.x_std.weight().row(last);
        let mean_b = self.x_mean.bias()[last];
        let std_b = self.x_std.bias()[last];
        let target = window[last];

        let total: f64 = h
            .outer_iter()
            .map(|hr| {
                let mu = hr.dot(&mean_w) + mean_b;
                let sigma = softplus(hr.dot(&std_w) + std_b) + self.std_epsilon;
                gaussian_log_prob(target, mu, sigma)
            })
            .sum();
        total / n_z as f64
    }

    /// Negative masked ELBO averaged over the batch, without parameter updates.
    pub fn loss<R: Rng + ?Sized>(&self, x: ArrayView2<'_, f64>, mask: ArrayView2<'_, f64>, rng: &mut R) -> f64 {
        let q = self.encode(x);
        let eps = standard_normal(q.mean.dim(), rng);
        let z = &q.mean + &(&q.std * &eps);
        let p = self.decode(z.view());
        let elbo = elbo_terms(x, mask, &q, &z, &p);
        -elbo.mean().unwrap_or(0.0)
    }

    /// Accumulate gradients of `-mean(elbo) + l2 * ||hidden kernels||^2` and
    /// return that loss.
    pub fn accumulate_gradients<R: Rng + ?Sized>(
        &mut self,
        x: ArrayView2<'_, f64>,
        mask: ArrayView2<'_, f64>,
        l2: f64,
        rng: &mut R,
    ) -> f64 {
        let batch = x.nrows().max(1) as f64;

        let (hq, cache_q): (Array2<f64>, MlpCache) = self.h_for_q_z.forward_cached(x);
        let q = self.gaussian(hq.view(), &self.z_mean, &self.z_std);
        let eps = standard_normal(q.mean.dim(), rng);
        let z = &q.mean + &(&q.std * &eps);
        let (hp, cache_p) = self.h_for_p_x.forward_cached(z.view());
        let p = self.gaussian(hp.view(), &self.x_mean, &self.x_std);

        let elbo = elbo_terms(x, mask, &q, &z, &p);
        let penalty = self.h_for_q_z.l2_penalty() + self.h_for_p_x.l2_penalty();
        let loss = -elbo.mean().unwrap_or(0.0) + l2 * penalty;

        // decoder heads
        let mut d_x_mean = Array2::zeros(p.mean.raw_dim());
        let mut d_x_raw = Array2::zeros(p.mean.raw_dim());
        Zip::from(&mut d_x_mean)
            .and(&mut d_x_raw)
            .and(&x)
            .and(&mask)
            .and(&p.mean)
            .and(&p.std)
            .for_each(|dm, dr, &xv, &a, &mu, &sigma| {
                let diff = xv - mu;
                let var = sigma * sigma;
                *dm = -a * diff / var / batch;
                // d sigma; chained through softplus below
                *dr = -a * (diff * diff / (var * sigma) - 1.0 / sigma) / batch;
            });
        Zip::from(&mut d_x_raw)
            .and(&p.raw_std)
            .for_each(|d, &raw| *d *= sigmoid(raw));

        let d_hp = self.x_mean.backward(hp.view(), d_x_mean.view())
            + self.x_std.backward(hp.view(), d_x_raw.view());
        let mut dz = self.h_for_p_x.backward(&cache_p, d_hp);

        // prior term: -beta * log p(z) contributes beta * z
        for (n, mut row) in dz.outer_iter_mut().enumerate() {
            let beta = mask.row(n).mean().unwrap_or(0.0);
            row.scaled_add(beta / batch, &z.row(n));
        }

        let d_z_mean = dz.clone();
        let mut d_z_raw = &dz * &eps;
        Zip::from(&mut d_z_raw)
            .and(&q.std)
            .and(&q.raw_std)
            .for_each(|d, &sigma, &raw| {
                *d = (*d - 1.0 / (sigma * batch)) * sigmoid(raw);
            });

        let d_hq = self.z_mean.backward(hq.view(), d_z_mean.view())
            + self.z_std.backward(hq.view(), d_z_raw.view());
        self.h_for_q_z.backward(&cache_q, d_hq);

        if l2 > 0.0 {
            self.h_for_q_z.add_l2_grad(l2);
            self.h_for_p_x.add_l2_grad(l2);
        }
        loss
    }
}

impl Trainable for GaussianVae {
    fn for_each_param(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        self.h_for_q_z.for_each_param(f);
        self.z_mean.for_each_param(f);
        self.z_std.for_each_param(f);
        self.h_for_p_x.for_each_param(f);
        self.x_mean.for_each_param(f);
        self.x_std.for_each_param(f);
    }

    fn zero_grad(&mut self) {
        self.h_for_q_z.zero_grad();
        self.z_mean.zero_grad();
        self.z_std.zero_grad();
        self.h_for_p_x.zero_grad();
        self.x_mean.zero_grad();
        self.x_std.zero_grad();
    }
}

#[inline]
pub(crate) fn gaussian_log_prob(x: f64, mean: f64, std: f64) -> f64 {
    Normal::new(mean, std).map_or(f64::NAN, |n| n.ln_pdf(x))
}

fn standard_normal<R: Rng + ?Sized>(dim: (usize, usize), rng: &mut R) -> Array2<f64> {
    Array2::from_shape_fn(dim, |_| rng.sample(StandardNormal))
}

fn sample<R: Rng + ?Sized>(q: &GaussianParams, rng: &mut R) -> Array2<f64> {
    let eps = standard_normal(q.mean.dim(), rng);
    &q.mean + &(&q.std * &eps)
}

// Per-row masked ELBO.
fn elbo_terms(
    x: ArrayView2<'_, f64>,
    mask: ArrayView2<'_, f64>,
    q: &GaussianParams,
    z: &Array2<f64>,
    p: &GaussianParams,
) -> Array1<f64> {
    Array1::from_shape_fn(x.nrows(), |n| {
        let log_px: f64 = (0..x.ncols())
            .map(|i| mask[[n, i]] * gaussian_log_prob(x[[n, i]], p.mean[[n, i]], p.std[[n, i]]))
            .sum();
        let log_pz: f64 = z.row(n).iter().map(|&v| gaussian_log_prob(v, 0.0, 1.0)).sum();
        let log_qz: f64 = (0..z.ncols())
            .map(|k| gaussian_log_prob(z[[n, k]], q.mean[[n, k]], q.std[[n, k]]))
            .sum();
        let beta = mask.row(n).mean().unwrap_or(0.0);
        log_px + beta * log_pz - log_qz
    })
}

/// Sliding windows of length `width` over a 1-D series, one per row.
pub(crate) fn sliding_windows(values: ArrayView1<'_, f64>, width: usize) -> Array2<f64> {
    let n = values.len() + 1 - width;
    let mut out = Array2::zeros((n, width));
    for (r, mut row) in out.outer_iter_mut().enumerate() {
        row.assign(&values.slice(s![r..r + width]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::optim::Adam;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy_windows() -> Array2<f64> {
        let series: Vec<f64> = (0..80).map(|t| (t as f64 * 0.3).sin()).collect();
        sliding_windows(Array1::from(series).view(), 8)
    }

    #[test]
    fn test_shapes() {
        let mut rng = StdRng::seed_from_u64(0);
        let vae = GaussianVae::new(12, 3, &[10, 6], &[6, 10], 1e-4, &mut rng);
        assert_eq!(vae.encoder_shapes(), vec![(12, 10), (10, 6), (6, 3)]);
        assert_eq!(vae.decoder_shapes(), vec![(3, 6), (6, 10), (10, 12)]);
        let x = Array2::zeros((5, 12));
        assert_eq!(vae.reconstruct(x.view()).dim(), (5, 12));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut vae = GaussianVae::new(4, 2, &[5], &[5], 1e-4, &mut StdRng::seed_from_u64(1));
        let x = ndarray::array![[0.1, -0.3, 0.5, 0.2], [0.0, 0.4, -0.1, 0.3]];
        let mask = ndarray::array![[1.0, 1.0, 0.0, 1.0], [1.0, 1.0, 1.0, 1.0]];

        vae.zero_grad();
        vae.accumulate_gradients(x.view(), mask.view(), 0.01, &mut StdRng::seed_from_u64(9));

        // same noise for both evaluations
        let objective = |v: &GaussianVae| {
            let mut perturbed = v.clone();
            perturbed.accumulate_gradients(x.view(), mask.view(), 0.01, &mut StdRng::seed_from_u64(9))
        };
        let base = objective(&vae);
        let h = 1e-6;

        let mut grads = Vec::new();
        let mut analytic_vae = vae.clone();
        analytic_vae.for_each_param(&mut |_, g| grads.push(g.to_owned()));
        // first parameter of the encoder: hidden weight (5 x 4)
        let at = [2usize, 1];
        let g00 = grads[0][&at[..]];

        let mut bumped = vae.clone();
        let mut idx = 0;
        bumped.for_each_param(&mut |mut w, _| {
            if idx == 0 {
                w[&at[..]] += h;
            }
            idx += 1;
        });
        let numeric = (objective(&bumped) - base) / h;
        assert!((numeric - g00).abs() < 1e-3, "numeric {} analytic {}", numeric, g00);

        // decoder std head bias
        let last = grads.len() - 1;
        let at = [3usize];
        let g_last = grads[last][&at[..]];
        let mut bumped = vae.clone();
        let mut idx = 0;
        bumped.for_each_param(&mut |mut w, _| {
            if idx == last {
                w[&at[..]] += h;
            }
            idx += 1;
        });
        let numeric = (objective(&bumped) - base) / h;
        assert!((numeric - g_last).abs() < 1e-3, "numeric {} analytic {}", numeric, g_last);
    }

    #[test]
    fn test_training_reduces_loss() {
        let windows = toy_windows();
        let mask = Array2::ones(windows.raw_dim());
        let mut rng = StdRng::seed_from_u64(2);
        let mut vae = GaussianVae::new(8, 2, &[16], &[16], 1e-4, &mut rng);
        let mut adam = Adam::new(1e-2);

        let before = vae.loss(windows.view(), mask.view(), &mut StdRng::seed_from_u64(5));
        for _ in 0..150 {
            vae.zero_grad();
            vae.accumulate_gradients(windows.view(), mask.view(), 0.0, &mut rng);
            adam.step(&mut vae);
        }
        let after = vae.loss(windows.view(), mask.view(), &mut StdRng::seed_from_u64(5));
        assert!(after < before, "loss went from {} to {}", before, after);
    }

    #[test]
    fn test_last_point_log_prob_is_finite() {
        let mut rng = StdRng::seed_from_u64(3);
        let vae = GaussianVae::new(8, 2, &[4], &[4], 1e-4, &mut rng);
        let windows = toy_windows();
        let lp = vae.last_point_log_prob(windows.row(0), 16, &mut rng);
        assert!(lp.is_finite());
    }

    #[test]
    fn test_gaussian_log_prob_matches_closed_form() {
        let expected = -0.5 * (2.0 * std::f64::consts::PI).ln() - 2.0_f64.ln() - 0.125;
        assert!((gaussian_log_prob(2.0, 1.0, 2.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_sampled_reconstruction_draws_from_decoder() {
        let mut rng = StdRng::seed_from_u64(4);
        let vae = GaussianVae::new(8, 2, &[4], &[4], 1e-4, &mut rng);
        let windows = toy_windows();
        let mean = vae.reconstruct(windows.view());
        let a = vae.reconstruct_sampled(windows.view(), &mut StdRng::seed_from_u64(1));
        let b = vae.reconstruct_sampled(windows.view(), &mut StdRng::seed_from_u64(2));
        assert_eq!(a.dim(), mean.dim());
        assert!(a.iter().all(|v| v.is_finite()));
        assert_ne!(a, b);
        assert_ne!(a, mean);
    }

    #[test]
    fn test_sliding_windows() {
        let values = Array1::from(vec![1.0, 2.0, 3.0, 4.0]);
        let w = sliding_windows(values.view(), 3);
        assert_eq!(w, ndarray::array![[1.0, 2.0, 3.0], [2.0, 3.0, 4.0]]);
    }
}
