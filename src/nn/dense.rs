use ndarray::{Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;

use super::optim::Trainable;
use super::uniform;

/// Fully connected layer, `y = x W^T + b`, over row-major batches.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f64>,
    bias: Array1<f64>,
    grad_weight: Array2<f64>,
    grad_bias: Array1<f64>,
}

impl Linear {
    /// Weights and bias drawn uniformly from `±1/sqrt(in_features)`.
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        Linear {
            weight: uniform(out_features, in_features, bound, rng),
            bias: uniform(1, out_features, bound, rng).index_axis_move(Axis(0), 0),
            grad_weight: Array2::zeros((out_features, in_features)),
            grad_bias: Array1::zeros(out_features),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn weight(&self) -> &Array2<f64> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f64> {
        &self.bias
    }

    pub fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// Accumulate parameter gradients for upstream gradient `dy` at input `x`
    /// and return the gradient with respect to `x`.
    pub fn backward(&mut self, x: ArrayView2<'_, f64>, dy: ArrayView2<'_, f64>) -> Array2<f64> {
        self.grad_weight += &dy.t().dot(&x);
        self.grad_bias += &dy.sum_axis(Axis(0));
        dy.dot(&self.weight)
    }

    /// Sum of squared weights (bias excluded).
    pub fn l2_penalty(&self) -> f64 {
        self.weight.iter().map(|w| w * w).sum()
    }

    /// Add the gradient of `lambda * l2_penalty()`.
    pub fn add_l2_grad(&mut self, lambda: f64) {
        self.grad_weight.scaled_add(2.0 * lambda, &self.weight);
    }
}

impl Trainable for Linear {
    fn for_each_param(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        f(self.weight.view_mut().into_dyn(), self.grad_weight.view().into_dyn());
        f(self.bias.view_mut().into_dyn(), self.grad_bias.view().into_dyn());
    }

    fn zero_grad(&mut self) {
        self.grad_weight.fill(0.0);
        self.grad_bias.fill(0.0);
    }
}

/// Stack of [`Linear`] layers with ReLU between them.
///
/// When `activate_output` is set the last layer is followed by a ReLU as well,
/// which is how the Donut hidden networks are built.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    activate_output: bool,
    width: usize,
}

/// Activations recorded by [`Mlp::forward_cached`] for the backward pass.
#[derive(Debug)]
pub struct MlpCache {
    inputs: Vec<Array2<f64>>,
    outputs: Vec<Array2<f64>>,
}

impl Mlp {
    /// Build from a size schedule `[in, h1, ..., out]`. A single-entry
    /// schedule yields an identity network.
    pub fn new<R: Rng + ?Sized>(sizes: &[usize], activate_output: bool, rng: &mut R) -> Self {
        let layers = sizes
            .windows(2)
            .map(|pair| Linear::new(pair[0], pair[1], rng))
            .collect();
        Mlp {
            layers,
            activate_output,
            width: sizes.last().copied().unwrap_or(0),
        }
    }

    /// `[input, hidden..., output]`.
    pub fn schedule(input: usize, hidden: &[usize], output: usize) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(hidden.len() + 2);
        sizes.push(input);
        sizes.extend_from_slice(hidden);
        sizes.push(output);
        sizes
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    /// `(in_features, out_features)` of every layer.
    pub fn shapes(&self) -> Vec<(usize, usize)> {
        self.layers
            .iter()
            .map(|l| (l.in_features(), l.out_features()))
            .collect()
    }

    pub fn output_size(&self) -> usize {
        self.width
    }

    fn activated(&self, i: usize) -> bool {
        self.activate_output || i + 1 < self.layers.len()
    }

    pub fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut h = x.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(h.view());
            if self.activated(i) {
                h.mapv_inplace(|v| v.max(0.0));
            }
        }
        h
    }

    pub fn forward_cached(&self, x: ArrayView2<'_, f64>) -> (Array2<f64>, MlpCache) {
        let mut cache = MlpCache {
            inputs: Vec::with_capacity(self.layers.len()),
            outputs: Vec::with_capacity(self.layers.len()),
        };
        let mut h = x.to_owned();
        for (i, layer) in self.layers.iter().enumerate() {
            let mut out = layer.forward(h.view());
            if self.activated(i) {
                out.mapv_inplace(|v| v.max(0.0));
            }
            cache.inputs.push(h);
            cache.outputs.push(out.clone());
            h = out;
        }
        (h, cache)
    }

    /// Backpropagate `dy` through the stack, returning the input gradient.
    pub fn backward(&mut self, cache: &MlpCache, dy: Array2<f64>) -> Array2<f64> {
        let mut grad = dy;
        for i in (0..self.layers.len()).rev() {
            if self.activated(i) {
                // ReLU passes gradient only where its output was positive.
                grad.zip_mut_with(&cache.outputs[i], |g, &o| {
                    if o <= 0.0 {
                        *g = 0.0;
                    }
                });
            }
            grad = self.layers[i].backward(cache.inputs[i].view(), grad.view());
        }
        grad
    }

    pub fn l2_penalty(&self) -> f64 {
        self.layers.iter().map(Linear::l2_penalty).sum()
    }

    pub fn add_l2_grad(&mut self, lambda: f64) {
        for layer in &mut self.layers {
            layer.add_l2_grad(lambda);
        }
    }
}

impl Trainable for Mlp {
    fn for_each_param(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        for layer in &mut self.layers {
            layer.for_each_param(f);
        }
    }

    fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::optim::{grad_norm, Adam};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::new(3, 2, &mut rng);
        let out = layer.forward(Array2::zeros((4, 3)).view());
        assert_eq!(out.dim(), (4, 2));
        // zero input gives the bias on every row
        assert_eq!(out.row(0), layer.bias().view());
    }

    #[test]
    fn test_linear_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut layer = Linear::new(2, 1, &mut rng);
        let x = array![[0.5, -1.0]];
        // loss = sum(y), so dy = 1
        layer.backward(x.view(), Array2::ones((1, 1)).view());

        let h = 1e-6;
        let base = layer.forward(x.view()).sum();
        let mut bumped = layer.clone();
        bumped.weight[[0, 1]] += h;
        let numeric = (bumped.forward(x.view()).sum() - base) / h;
        assert!((numeric - layer.grad_weight[[0, 1]]).abs() < 1e-4);
    }

    #[test]
    fn test_mlp_shapes_follow_schedule() {
        let mut rng = StdRng::seed_from_u64(2);
        let mlp = Mlp::new(&Mlp::schedule(8, &[6, 4], 2), false, &mut rng);
        assert_eq!(mlp.shapes(), vec![(8, 6), (6, 4), (4, 2)]);
        assert_eq!(mlp.output_size(), 2);
    }

    #[test]
    fn test_identity_mlp() {
        let mut rng = StdRng::seed_from_u64(3);
        let mlp = Mlp::new(&[3], true, &mut rng);
        let x = array![[1.0, -2.0, 3.0]];
        assert_eq!(mlp.forward(x.view()), x);
    }

    #[test]
    fn test_mlp_learns_identity() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut mlp = Mlp::new(&[2, 8, 2], false, &mut rng);
        let mut adam = Adam::new(1e-2);
        let x = array![[0.1, 0.9], [0.8, 0.2], [0.5, 0.5], [0.3, 0.7]];

        let loss = |mlp: &Mlp| {
            let y = mlp.forward(x.view());
            (&y - &x).mapv(|d| d * d).mean().unwrap_or(0.0)
        };
        let before = loss(&mlp);
        for _ in 0..300 {
            mlp.zero_grad();
            let (y, cache) = mlp.forward_cached(x.view());
            let n = y.len() as f64;
            let dy = (&y - &x).mapv(|d| 2.0 * d / n);
            mlp.backward(&cache, dy);
            assert!(grad_norm(&mut mlp).is_finite());
            adam.step(&mut mlp);
        }
        assert!(loss(&mlp) < before * 0.5);
    }
}
