use crate::{error::Error, filter::FEATURE_WIDTH};
use ndarray::{s, Array1, Array2, ArrayView2, ArrayView3, ArrayViewMutD, ArrayViewD, Axis};
use num_traits::ToPrimitive;
use rand::{distributions::Uniform, rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_HIDDEN_SIZE: &str = "100";
pub(crate) const DEFAULT_NUM_CLASSES: &str = "3";

/// Shape of the classifier. The input width is fixed by the feature layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ModelConfig {
    pub(crate) input_size: usize,
    pub(crate) hidden_size: usize,
    pub(crate) num_classes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_size: FEATURE_WIDTH,
            hidden_size: DEFAULT_HIDDEN_SIZE.parse().unwrap(),
            num_classes: DEFAULT_NUM_CLASSES.parse().unwrap(),
        }
    }
}

impl ModelConfig {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.input_size == 0 || self.hidden_size == 0 || self.num_classes == 0 {
            return Err(Error::ModelConfig(*self));
        }
        Ok(())
    }
}

/// Learned weights of a single-layer LSTM followed by a linear head.
///
/// Gate blocks in the recurrent matrices are stacked input, forget, cell,
/// output, each `hidden_size` rows tall.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Parameters {
    pub(crate) weight_ih: Array2<f32>,
    pub(crate) weight_hh: Array2<f32>,
    pub(crate) bias_ih: Array1<f32>,
    pub(crate) bias_hh: Array1<f32>,
    pub(crate) weight_fc: Array2<f32>,
    pub(crate) bias_fc: Array1<f32>,
}

pub(crate) type Gradients = Parameters;

impl Parameters {
    pub(crate) fn zeros(config: &ModelConfig) -> Self {
        let &ModelConfig {
            input_size,
            hidden_size,
            num_classes,
        } = config;
        let gates = 4 * hidden_size;
        Self {
            weight_ih: Array2::zeros((gates, input_size)),
            weight_hh: Array2::zeros((gates, hidden_size)),
            bias_ih: Array1::zeros(gates),
            bias_hh: Array1::zeros(gates),
            weight_fc: Array2::zeros((num_classes, hidden_size)),
            bias_fc: Array1::zeros(num_classes),
        }
    }

    /// Every weight drawn from `U(-k, k)` with `k = 1 / sqrt(hidden_size)`.
    pub(crate) fn uniform(config: &ModelConfig, rng: &mut StdRng) -> Result<Self, Error> {
        let k = config
            .hidden_size
            .to_f32()
            .ok_or(Error::ConvertToF32)?
            .sqrt()
            .recip();
        let dist = Uniform::new_inclusive(-k, k);
        let mut params = Self::zeros(config);
        for mut tensor in params.tensors_mut() {
            tensor.mapv_inplace(|_| rng.sample(dist));
        }
        Ok(params)
    }

    pub(crate) fn tensors(&self) -> [ArrayViewD<'_, f32>; 6] {
        [
            self.weight_ih.view().into_dyn(),
            self.weight_hh.view().into_dyn(),
            self.bias_ih.view().into_dyn(),
            self.bias_hh.view().into_dyn(),
            self.weight_fc.view().into_dyn(),
            self.bias_fc.view().into_dyn(),
        ]
    }

    pub(crate) fn tensors_mut(&mut self) -> [ArrayViewMutD<'_, f32>; 6] {
        [
            self.weight_ih.view_mut().into_dyn(),
            self.weight_hh.view_mut().into_dyn(),
            self.bias_ih.view_mut().into_dyn(),
            self.bias_hh.view_mut().into_dyn(),
            self.weight_fc.view_mut().into_dyn(),
            self.bias_fc.view_mut().into_dyn(),
        ]
    }

    /// Recover the model shape from the tensor shapes, checking they agree.
    pub(crate) fn config(&self) -> Result<ModelConfig, Error> {
        let (gates, input_size) = self.weight_ih.dim();
        let (num_classes, hidden_size) = self.weight_fc.dim();
        let config = ModelConfig {
            input_size,
            hidden_size,
            num_classes,
        };
        let expected = Self::zeros(&config);
        let consistent = gates == 4 * hidden_size
            && self
                .tensors()
                .iter()
                .zip(expected.tensors().iter())
                .all(|(actual, expected)| actual.shape() == expected.shape());
        if consistent {
            Ok(config)
        } else {
            Err(Error::ParameterShapes)
        }
    }
}

/// Values saved from one time step for back-propagation.
struct StepCache {
    x: Array2<f32>,
    h_prev: Array2<f32>,
    c_prev: Array2<f32>,
    i: Array2<f32>,
    f: Array2<f32>,
    g: Array2<f32>,
    o: Array2<f32>,
    tanh_c: Array2<f32>,
}

/// Everything `backward` needs from a training-mode forward pass.
pub(crate) struct Cache {
    steps: Vec<StepCache>,
    h_last: Array2<f32>,
    activated: Array2<f32>,
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// One-layer LSTM sequence classifier.
///
/// Hidden and cell state start at zero on every call, so nothing is carried
/// between batches.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LstmClassifier {
    config: ModelConfig,
    params: Parameters,
}

impl LstmClassifier {
    pub(crate) fn new(config: ModelConfig, rng: &mut StdRng) -> Result<Self, Error> {
        config.validate()?;
        let params = Parameters::uniform(&config, rng)?;
        Ok(Self { config, params })
    }

    pub(crate) fn from_parameters(params: Parameters) -> Result<Self, Error> {
        let config = params.config()?;
        config.validate()?;
        Ok(Self { config, params })
    }

    pub(crate) fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub(crate) fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub(crate) fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    fn check_input(&self, inputs: &ArrayView3<f32>) -> Result<(), Error> {
        let (batch, steps, width) = inputs.dim();
        if width != self.config.input_size {
            return Err(Error::InputWidth(self.config.input_size, width));
        }
        if batch == 0 || steps == 0 {
            return Err(Error::EmptyInput(batch, steps));
        }
        Ok(())
    }

    /// Advance one time step from `(h, c)`, returning the gates and new state.
    fn step(
        &self,
        x: ArrayView2<f32>,
        h: &Array2<f32>,
        c: &Array2<f32>,
    ) -> (StepCache, Array2<f32>, Array2<f32>) {
        let hidden = self.config.hidden_size;
        let p = &self.params;

        let mut z = x.dot(&p.weight_ih.t()) + h.dot(&p.weight_hh.t());
        z += &p.bias_ih;
        z += &p.bias_hh;

        let i = z.slice(s![.., 0..hidden]).mapv(sigmoid);
        let f = z.slice(s![.., hidden..2 * hidden]).mapv(sigmoid);
        let g = z.slice(s![.., 2 * hidden..3 * hidden]).mapv(f32::tanh);
        let o = z.slice(s![.., 3 * hidden..]).mapv(sigmoid);

        let c_next = &f * c + &i * &g;
        let tanh_c = c_next.mapv(f32::tanh);
        let h_next = &o * &tanh_c;

        let cache = StepCache {
            x: x.to_owned(),
            h_prev: h.clone(),
            c_prev: c.clone(),
            i,
            f,
            g,
            o,
            tanh_c,
        };
        (cache, h_next, c_next)
    }

    fn run(&self, inputs: ArrayView3<f32>) -> Result<(Cache, Array2<f32>), Error> {
        self.check_input(&inputs)?;
        let batch = inputs.len_of(Axis(0));
        let hidden = self.config.hidden_size;

        let mut h = Array2::zeros((batch, hidden));
        let mut c = Array2::zeros((batch, hidden));
        let mut steps = Vec::with_capacity(inputs.len_of(Axis(1)));

        for x in inputs.axis_iter(Axis(1)) {
            let (cache, h_next, c_next) = self.step(x, &h, &c);
            steps.push(cache);
            h = h_next;
            c = c_next;
        }

        let activated = h.mapv(|v| v.max(0.0));
        let mut logits = activated.dot(&self.params.weight_fc.t());
        logits += &self.params.bias_fc;

        Ok((
            Cache {
                steps,
                h_last: h,
                activated,
            },
            logits,
        ))
    }

    /// Evaluation forward pass: `batch x time x features` in, `batch x classes`
    /// unnormalized scores out. Keeps nothing for back-propagation.
    pub(crate) fn forward(&self, inputs: ArrayView3<f32>) -> Result<Array2<f32>, Error> {
        self.run(inputs).map(|(_, logits)| logits)
    }

    /// Training forward pass, keeping activations for [`Self::backward`].
    pub(crate) fn forward_train(
        &self,
        inputs: ArrayView3<f32>,
    ) -> Result<(Array2<f32>, Cache), Error> {
        self.run(inputs).map(|(cache, logits)| (logits, cache))
    }

    /// Back-propagate `d_logits` through the head and every time step.
    pub(crate) fn backward(&self, cache: &Cache, d_logits: ArrayView2<f32>) -> Gradients {
        let hidden = self.config.hidden_size;
        let p = &self.params;
        let mut grads = Parameters::zeros(&self.config);

        grads.weight_fc = d_logits.t().dot(&cache.activated);
        grads.bias_fc = d_logits.sum_axis(Axis(0));

        let relu_mask = cache.h_last.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        let mut dh = d_logits.dot(&p.weight_fc) * &relu_mask;
        let mut dc = Array2::<f32>::zeros(dh.raw_dim());

        for step in cache.steps.iter().rev() {
            let d_o = &dh * &step.tanh_c;
            dc = dc + &dh * &step.o * &step.tanh_c.mapv(|t| 1.0 - t * t);
            let d_i = &dc * &step.g;
            let d_g = &dc * &step.i;
            let d_f = &dc * &step.c_prev;

            let mut dz = Array2::<f32>::zeros((dh.nrows(), 4 * hidden));
            dz.slice_mut(s![.., 0..hidden])
                .assign(&(d_i * &step.i.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![.., hidden..2 * hidden])
                .assign(&(d_f * &step.f.mapv(|v| v * (1.0 - v))));
            dz.slice_mut(s![.., 2 * hidden..3 * hidden])
                .assign(&(d_g * &step.g.mapv(|v| 1.0 - v * v)));
            dz.slice_mut(s![.., 3 * hidden..])
                .assign(&(d_o * &step.o.mapv(|v| v * (1.0 - v))));

            grads.weight_ih += &dz.t().dot(&step.x);
            grads.weight_hh += &dz.t().dot(&step.h_prev);
            let d_bias = dz.sum_axis(Axis(0));
            grads.bias_ih += &d_bias;
            grads.bias_hh += &d_bias;

            dh = dz.dot(&p.weight_hh);
            dc = dc * &step.f;
        }

        grads
    }
}
