use crate::model::{Gradients, Parameters};
use ndarray::{ArrayD, Zip};

pub(crate) const DEFAULT_LEARNING_RATE: &str = "0.001";

pub(crate) trait Optimizer {
    /// Apply one update to `params` from `grads`.
    fn step(&mut self, params: &mut Parameters, grads: &Gradients);

    fn learning_rate(&self) -> f32;
}

/// Adam with bias-corrected first and second moment estimates.
#[derive(Debug, Clone)]
pub(crate) struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    m: Vec<ArrayD<f32>>,
    v: Vec<ArrayD<f32>>,
    t: i32,
}

impl Adam {
    pub(crate) fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn steps(&self) -> i32 {
        self.t
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(DEFAULT_LEARNING_RATE.parse().unwrap())
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut Parameters, grads: &Gradients) {
        if self.m.is_empty() {
            self.m = grads
                .tensors()
                .iter()
                .map(|g| ArrayD::zeros(g.raw_dim()))
                .collect();
            self.v = self.m.clone();
        }

        self.t += 1;
        let &mut Self {
            lr,
            beta1,
            beta2,
            epsilon,
            t,
            ..
        } = self;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        let mut tensors = params.tensors_mut();
        for (((p, g), m), v) in tensors
            .iter_mut()
            .zip(grads.tensors().iter())
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            Zip::from(p)
                .and(g)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias1;
                    let v_hat = *v / bias2;
                    *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
                });
        }
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }
}
