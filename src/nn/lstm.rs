use ndarray::{Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;

use super::optim::Trainable;
use super::{sigmoid, uniform};

/// One LSTM layer with an output projection (`h_t = W_hr (o_t * tanh(c_t))`).
///
/// Gates are stored in `i, f, g, o` order, matching PyTorch's layout.
#[derive(Debug, Clone)]
pub struct LstmLayer {
    hidden: usize,
    w_ih: Array2<f64>,
    w_hh: Array2<f64>,
    bias: Array1<f64>,
    w_hr: Array2<f64>,
    g_w_ih: Array2<f64>,
    g_w_hh: Array2<f64>,
    g_bias: Array1<f64>,
    g_w_hr: Array2<f64>,
}

#[derive(Debug)]
struct StepCache {
    input: Array2<f64>,
    h_prev: Array2<f64>,
    c_prev: Array2<f64>,
    gates: Array2<f64>,
    tanh_c: Array2<f64>,
    m: Array2<f64>,
}

impl LstmLayer {
    pub fn new<R: Rng + ?Sized>(input: usize, hidden: usize, proj: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (hidden.max(1) as f64).sqrt();
        LstmLayer {
            hidden,
            w_ih: uniform(4 * hidden, input, bound, rng),
            w_hh: uniform(4 * hidden, proj, bound, rng),
            bias: uniform(1, 4 * hidden, bound, rng).index_axis_move(Axis(0), 0),
            w_hr: uniform(proj, hidden, bound, rng),
            g_w_ih: Array2::zeros((4 * hidden, input)),
            g_w_hh: Array2::zeros((4 * hidden, proj)),
            g_bias: Array1::zeros(4 * hidden),
            g_w_hr: Array2::zeros((proj, hidden)),
        }
    }

    pub fn input_size(&self) -> usize {
        self.w_ih.ncols()
    }

    pub fn proj_size(&self) -> usize {
        self.w_hr.nrows()
    }

    fn forward(&self, x: ArrayView2<'_, f64>) -> (Array2<f64>, StepCache) {
        let steps = x.nrows();
        let hs = self.hidden;
        let proj = self.proj_size();

        let pre_input = x.dot(&self.w_ih.t()) + &self.bias;
        let mut cache = StepCache {
            input: x.to_owned(),
            h_prev: Array2::zeros((steps, proj)),
            c_prev: Array2::zeros((steps, hs)),
            gates: Array2::zeros((steps, 4 * hs)),
            tanh_c: Array2::zeros((steps, hs)),
            m: Array2::zeros((steps, hs)),
        };
        let mut output = Array2::zeros((steps, proj));
        let mut h = Array1::<f64>::zeros(proj);
        let mut c = Array1::<f64>::zeros(hs);

        for t in 0..steps {
            let a = &pre_input.row(t) + &self.w_hh.dot(&h);
            cache.h_prev.row_mut(t).assign(&h);
            cache.c_prev.row_mut(t).assign(&c);

            let mut m = Array1::zeros(hs);
            for k in 0..hs {
                let i = sigmoid(a[k]);
                let f = sigmoid(a[hs + k]);
                let g = a[2 * hs + k].tanh();
                let o = sigmoid(a[3 * hs + k]);
                c[k] = f * c[k] + i * g;
                let tc = c[k].tanh();
                m[k] = o * tc;

                cache.gates[[t, k]] = i;
                cache.gates[[t, hs + k]] = f;
                cache.gates[[t, 2 * hs + k]] = g;
                cache.gates[[t, 3 * hs + k]] = o;
                cache.tanh_c[[t, k]] = tc;
            }
            h = self.w_hr.dot(&m);
            cache.m.row_mut(t).assign(&m);
            output.row_mut(t).assign(&h);
        }
        (output, cache)
    }

    fn backward(&mut self, cache: &StepCache, dy: ArrayView2<'_, f64>) -> Array2<f64> {
        let steps = dy.nrows();
        let hs = self.hidden;

        let mut d_pre = Array2::zeros((steps, 4 * hs));
        let mut d_h_all = Array2::zeros((steps, self.proj_size()));
        let mut dh_next = Array1::<f64>::zeros(self.proj_size());
        let mut dc_next = Array1::<f64>::zeros(hs);

        for t in (0..steps).rev() {
            let dh = &dy.row(t) + &dh_next;
            let dm = self.w_hr.t().dot(&dh);
            d_h_all.row_mut(t).assign(&dh);

            for k in 0..hs {
                let i = cache.gates[[t, k]];
                let f = cache.gates[[t, hs + k]];
                let g = cache.gates[[t, 2 * hs + k]];
                let o = cache.gates[[t, 3 * hs + k]];
                let tc = cache.tanh_c[[t, k]];

                let d_o = dm[k] * tc;
                let dc = dc_next[k] + dm[k] * o * (1.0 - tc * tc);
                let d_i = dc * g;
                let d_g = dc * i;
                let d_f = dc * cache.c_prev[[t, k]];
                dc_next[k] = dc * f;

                d_pre[[t, k]] = d_i * i * (1.0 - i);
                d_pre[[t, hs + k]] = d_f * f * (1.0 - f);
                d_pre[[t, 2 * hs + k]] = d_g * (1.0 - g * g);
                d_pre[[t, 3 * hs + k]] = d_o * o * (1.0 - o);
            }
            dh_next = self.w_hh.t().dot(&d_pre.row(t));
        }

        self.g_w_hr += &d_h_all.t().dot(&cache.m);
        self.g_w_ih += &d_pre.t().dot(&cache.input);
        self.g_w_hh += &d_pre.t().dot(&cache.h_prev);
        self.g_bias += &d_pre.sum_axis(Axis(0));
        d_pre.dot(&self.w_ih)
    }
}

impl Trainable for LstmLayer {
    fn for_each_param(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>)) {
        f(self.w_ih.view_mut().into_dyn(), self.g_w_ih.view().into_dyn());
        f(self.w_hh.view_mut().into_dyn(), self.g_w_hh.view().into_dyn());
        f(self.bias.view_mut().into_dyn(), self.g_bias.view().into_dyn());
        f(self.w_hr.view_mut().into_dyn(), self.g_w_hr.view().into_dyn());
    }

    fn zero_grad(&mut self) {
        self.g_w_ih.fill(0.0);
        self.g_w_hh.fill(0.0);
        self.g_bias.fill(0.0);
        self.g_w_hr.fill(0.0);
    }
}

/// Stacked, unidirectional LSTM over a single sequence (`steps x features`).
///
/// Every layer projects its hidden state to `proj_size`; during training the
/// output of every layer but the last goes through inverted dropout.
#[derive(Debug, Clone)]
pub struct Lstm {
    layers: Vec<LstmLayer>,
    dropout: f64,
}

/// Per-layer activations and dropout masks from [`Lstm::forward_train`].
#[derive(Debug)]
pub struct LstmCache {
    steps: Vec<StepCache>,
    masks: Vec<Option<Array2<f64>>>,
}

impl Lstm {
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        hidden_size: usize,
        proj_size: usize,
        num_layers: usize,
        dropout: f64,
        rng: &mut R,
    ) -> Self {
        let layers = (0..num_layers.max(1))
            .map(|l| {
                let input = if l == 0 { input_size } else { proj_size };
                LstmLayer::new(input, hidden_size, proj_size, rng)
            })
            .collect();
        Lstm { layers, dropout }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn input_size(&self) -> usize {
        self.layers[0].input_size()
    }

    pub fn output_size(&self) -> usize {
        self.layers[self.layers.len() - 1].proj_size()
    }

    /// Inference pass from a zero initial state.
    pub fn forward(&self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut h = x.to_owned();
        for layer in &self.layers {
            h = layer.forward(h.view()).0;
        }
        h
    }

    pub fn forward_train<R: Rng + ?Sized>(
        &self,
        x: ArrayView2<'_, f64>,
        rng: &mut R,
    ) -> (Array2<f64>, LstmCache) {
        let mut cache = LstmCache {
            steps: Vec::with_capacity(self.layers.len()),
            masks: Vec::with_capacity(self.layers.len()),
        };
        let last = self.layers.len() - 1;
        let mut h = x.to_owned();
        for (l, layer) in self.layers.iter().enumerate() {
            let (mut out, step_cache) = layer.forward(h.view());
            cache.steps.push(step_cache);
            let mask = if l < last && self.dropout > 0.0 {
                let keep = 1.0 - self.dropout;
                let mask = Array2::from_shape_fn(out.raw_dim(), |_| {
                    if rng.gen::<f64>() < keep {
                        1.0 / keep
                    } else {
                        0.0
                    }
                });
                out *= &mask;
                Some(mask)
            } else {
                None
            };
            cache.masks.push(mask);
            h = out;
        }
        (h, cache)
    }

    /// Accumulate gradients for `dy` (same shape as the output).
    pub fn backward(&mut self, cache: &LstmCache, dy: Array2<f64>) {
        let mut grad = dy;
        for l in (0..self.layers.len()).rev() {
            if let Some(mask) = &cache.masks[l] {
                grad *= mask;
            }
            grad = self.layers[l].backward(&cache.steps[l], grad.view());
        }
    }
}

impl Trainable for Lstm {
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
    use crate::nn::optim::Adam;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn loss(lstm: &Lstm, x: &Array2<f64>, target: &Array2<f64>) -> f64 {
        let y = lstm.forward(x.view());
        (&y - target).mapv(|d| d * d).sum()
    }

    #[test]
    fn test_output_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let lstm = Lstm::new(3, 5, 4, 2, 0.5, &mut rng);
        let out = lstm.forward(Array2::zeros((7, 3)).view());
        assert_eq!(out.dim(), (7, 4));
        assert_eq!(lstm.output_size(), 4);
        assert_eq!(lstm.input_size(), 3);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut lstm = Lstm::new(2, 3, 2, 2, 0.0, &mut rng);
        let x = array![[0.1, -0.2], [0.4, 0.3], [-0.5, 0.2], [0.0, 0.1]];
        let target = array![[0.2, 0.1], [0.0, -0.1], [0.3, 0.3], [0.1, 0.0]];

        lstm.zero_grad();
        let (y, cache) = lstm.forward_train(x.view(), &mut rng);
        lstm.backward(&cache, (&y - &target).mapv(|d| 2.0 * d));

        let h = 1e-6;
        let base = loss(&lstm, &x, &target);
        for (layer, (r, c)) in [(0usize, (1usize, 0usize)), (1, (5, 1))] {
            let analytic = lstm.layers[layer].g_w_ih[[r, c]];
            let mut bumped = lstm.clone();
            bumped.layers[layer].w_ih[[r, c]] += h;
            let numeric = (loss(&bumped, &x, &target) - base) / h;
            assert!(
                (numeric - analytic).abs() < 1e-4,
                "layer {} w_ih[{},{}]: numeric {} analytic {}",
                layer,
                r,
                c,
                numeric,
                analytic
            );
        }

        let analytic = lstm.layers[0].g_w_hr[[1, 2]];
        let mut bumped = lstm.clone();
        bumped.layers[0].w_hr[[1, 2]] += h;
        let numeric = (loss(&bumped, &x, &target) - base) / h;
        assert!((numeric - analytic).abs() < 1e-4);

        let analytic = lstm.layers[1].g_w_hh[[0, 1]];
        let mut bumped = lstm.clone();
        bumped.layers[1].w_hh[[0, 1]] += h;
        let numeric = (loss(&bumped, &x, &target) - base) / h;
        assert!((numeric - analytic).abs() < 1e-4);
    }

    #[test]
    fn test_learns_to_shift_sequence() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut lstm = Lstm::new(1, 8, 1, 1, 0.0, &mut rng);
        let series: Vec<f64> = (0..30).map(|t| (t as f64 * 0.4).sin()).collect();
        let x = Array2::from_shape_vec((29, 1), series[..29].to_vec()).unwrap();
        let target = Array2::from_shape_vec((29, 1), series[1..].to_vec()).unwrap();

        let before = loss(&lstm, &x, &target);
        let mut adam = Adam::new(1e-2);
        for _ in 0..200 {
            lstm.zero_grad();
            let (y, cache) = lstm.forward_train(x.view(), &mut rng);
            let n = y.len() as f64;
            lstm.backward(&cache, (&y - &target).mapv(|d| 2.0 * d / n));
            adam.step(&mut lstm);
        }
        assert!(loss(&lstm, &x, &target) < before * 0.5);
    }
}
