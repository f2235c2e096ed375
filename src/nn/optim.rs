use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};

/// Anything holding parameters with accumulated gradients.
pub trait Trainable {
    /// Visit every parameter together with its gradient, always in the same order.
    fn for_each_param(&mut self, f: &mut dyn FnMut(ArrayViewMutD<'_, f64>, ArrayViewD<'_, f64>));

    /// Reset all accumulated gradients to zero.
    fn zero_grad(&mut self);
}

/// Euclidean norm over all gradients of `model`.
pub fn grad_norm<M: Trainable + ?Sized>(model: &mut M) -> f64 {
    let mut total = 0.0;
    model.for_each_param(&mut |_, grad| {
        total += grad.iter().map(|g| g * g).sum::<f64>();
    });
    total.sqrt()
}

/// Adam with PyTorch's bias-corrected update.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: i32,
    moments: Vec<(ArrayD<f64>, ArrayD<f64>)>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Adam {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            moments: Vec::new(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    pub fn step<M: Trainable + ?Sized>(&mut self, model: &mut M) {
        self.step_scaled(model, 1.0);
    }

    /// Update with every gradient multiplied by `grad_scale` (used for norm clipping).
    pub fn step_scaled<M: Trainable + ?Sized>(&mut self, model: &mut M, grad_scale: f64) {
        self.t += 1;
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);
        let bias1 = 1.0 - beta1.powi(self.t);
        let bias2_sqrt = (1.0 - beta2.powi(self.t)).sqrt();
        let step_size = self.lr / bias1;

        let moments = &mut self.moments;
        let mut idx = 0;
        model.for_each_param(&mut |mut value, grad| {
            if moments.len() <= idx {
                moments.push((ArrayD::zeros(grad.raw_dim()), ArrayD::zeros(grad.raw_dim())));
            }
            let (m, v) = &mut moments[idx];
            Zip::from(&mut value)
                .and(m)
                .and(v)
                .and(&grad)
                .for_each(|w, m, v, &g| {
                    let g = g * grad_scale;
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    *w -= step_size * *m / (v.sqrt() / bias2_sqrt + eps);
                });
            idx += 1;
        });
    }
}
