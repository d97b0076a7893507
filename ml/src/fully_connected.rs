use crate::{
    activation_functions::{softmax, Activation},
    layer::Layer,
    ImagePrecision, MlError, MlResult, WeightPrecision,
};
use log::trace;
use ndarray::*;
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};

pub const DEFAULT_LEARNING_RATE: WeightPrecision = 0.01;
/// Continuous weight decay of rectified-linear layers
pub const RELU_WEIGHT_DECAY: WeightPrecision = 1e-6;
/// Error added to every active rectified-linear unit, pushing towards sparse codes
pub const RELU_ACTIVATION_COST: ImagePrecision = 1e-4;

/// Layer-local dropout. During training every `compute` draws a fresh mask of active
/// units; at inference outputs are scaled by the keep probability instead.
#[derive(Debug, Clone)]
struct Dropout {
    rate: ImagePrecision,
    active: Vec<bool>,
    rng: StdRng,
}

impl Dropout {
    fn resample(&mut self) {
        let rate = self.rate;
        let rng = &mut self.rng;
        for unit in self.active.iter_mut() {
            *unit = rng.gen::<ImagePrecision>() >= rate;
        }
    }
}

/// Rust implementation of a feed forward layer.
/// The weight matrix shall have dimension (in that order)
/// input units x output units, so `weights[[i, o]]` connects input `i` to output `o`.
///
/// The output is `activation(input · weights + bias)`. The activation variants only differ
/// in the nonlinearity and in the derivative factor used in `back_propagate`; see
/// [`Activation`].
#[derive(Debug, Clone)]
pub struct FeedforwardLayer {
    weights: Array2<WeightPrecision>,
    bias: Array1<WeightPrecision>,
    gradient: Array2<WeightPrecision>,
    bias_gradient: Array1<WeightPrecision>,
    input: Array1<ImagePrecision>,
    weighted_sum: Array1<ImagePrecision>,
    output: Array1<ImagePrecision>,
    error: Array1<ImagePrecision>,
    input_error: Option<Array1<ImagePrecision>>,
    activation: Activation,
    learning_rate: WeightPrecision,
    decay: WeightPrecision,
    activation_cost: ImagePrecision,
    /// Set by `set_expected_class`, switches softmax to the cross-entropy gradient
    expected_class: Option<usize>,
    dropout: Option<Dropout>,
    training: bool,
    input_dimension: usize,
    output_dimension: usize,
}

impl FeedforwardLayer {
    /// Creates a layer with weights drawn uniformly from `±1/sqrt(input_dimension)`
    /// and zero bias.
    pub fn new<R: Rng + ?Sized>(
        input_dimension: usize,
        output_dimension: usize,
        activation: Activation,
        rng: &mut R,
    ) -> FeedforwardLayer {
        assert!(input_dimension > 0 && output_dimension > 0, "Empty layer requested");
        let range = 1.0 / (input_dimension as WeightPrecision).sqrt();
        let dist = Uniform::new_inclusive(-range, range);
        let weights = Array::from_shape_fn((input_dimension, output_dimension), |_| rng.sample(dist));
        FeedforwardLayer::with_parameters(weights, Array::zeros(output_dimension), activation)
    }

    /// Creates a layer from given parameters.
    /// Fails if the bias length does not match the number of weight columns.
    pub fn from_weights(
        weights: Array2<WeightPrecision>,
        bias: Array1<WeightPrecision>,
        activation: Activation,
    ) -> MlResult<FeedforwardLayer> {
        if weights.is_empty() {
            return Err(MlError::shape_mismatch("layer weights", "non-empty matrix", weights.dim()));
        }
        if bias.len() != weights.len_of(Axis(1)) {
            return Err(MlError::shape_mismatch(
                "layer bias",
                weights.len_of(Axis(1)),
                bias.len(),
            ));
        }
        Ok(FeedforwardLayer::with_parameters(weights, bias, activation))
    }

    fn with_parameters(
        weights: Array2<WeightPrecision>,
        bias: Array1<WeightPrecision>,
        activation: Activation,
    ) -> FeedforwardLayer {
        let input_dimension = weights.len_of(Axis(0));
        let output_dimension = weights.len_of(Axis(1));
        let (decay, activation_cost) = match activation {
            Activation::Relu => (RELU_WEIGHT_DECAY, RELU_ACTIVATION_COST),
            _ => (0.0, 0.0),
        };
        FeedforwardLayer {
            gradient: Array::zeros(weights.raw_dim()),
            bias_gradient: Array::zeros(output_dimension),
            input: Array::zeros(input_dimension),
            weighted_sum: Array::zeros(output_dimension),
            output: Array::zeros(output_dimension),
            error: Array::zeros(output_dimension),
            input_error: None,
            weights,
            bias,
            activation,
            learning_rate: DEFAULT_LEARNING_RATE,
            decay,
            activation_cost,
            expected_class: None,
            dropout: None,
            training: true,
            input_dimension,
            output_dimension,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: WeightPrecision) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Multiplicative weight decay applied before every update.
    pub fn with_decay(mut self, decay: WeightPrecision) -> Self {
        self.decay = decay;
        self
    }

    /// Error added to active outputs on every back-propagation.
    pub fn with_activation_cost(mut self, activation_cost: ImagePrecision) -> Self {
        self.activation_cost = activation_cost;
        self
    }

    /// Enables dropout with the given rate. The mask generator is seeded from `rng`.
    pub fn with_dropout<R: Rng + ?Sized>(mut self, rate: ImagePrecision, rng: &mut R) -> Self {
        assert!((0.0..1.0).contains(&rate), "Dropout rate must lie in [0, 1)");
        self.dropout = if rate > 0.0 {
            Some(Dropout {
                rate,
                active: vec![true; self.output_dimension],
                rng: StdRng::seed_from_u64(rng.gen()),
            })
        } else {
            None
        };
        self
    }

    pub fn weights(&self) -> ArrayView2<WeightPrecision> {
        self.weights.view()
    }

    pub fn bias(&self) -> ArrayView1<WeightPrecision> {
        self.bias.view()
    }

    pub fn gradient(&self) -> ArrayView2<WeightPrecision> {
        self.gradient.view()
    }

    pub fn bias_gradient(&self) -> ArrayView1<WeightPrecision> {
        self.bias_gradient.view()
    }

    pub fn weighted_sum(&self) -> ArrayView1<ImagePrecision> {
        self.weighted_sum.view()
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn decay(&self) -> WeightPrecision {
        self.decay
    }

    /// Cross-entropy of the last output against a class, for softmax layers.
    pub fn cross_entropy(&self, class: usize) -> ImagePrecision {
        -self.output[class].max(ImagePrecision::MIN_POSITIVE).ln()
    }

    /// Accumulates the weight gradient of a decoder that reuses these weights transposed:
    /// `gradient[[i, o]] += delta[i] * code[o]`.
    pub(crate) fn accumulate_transposed_gradient(
        &mut self,
        code: ArrayView1<ImagePrecision>,
        delta: ArrayView1<ImagePrecision>,
    ) {
        Zip::from(self.gradient.rows_mut())
            .and(&delta)
            .for_each(|mut row, &d| row.scaled_add(d, &code));
    }

    fn output_deltas(&self) -> Array1<ImagePrecision> {
        match (self.activation, self.expected_class) {
            // softmax with cross-entropy loss: the error already is y - onehot
            (Activation::Softmax, Some(_)) => self.error.clone(),
            (Activation::Softmax, None) => {
                let weighted_error = (&self.error * &self.output).sum();
                Zip::from(&self.output)
                    .and(&self.error)
                    .map_collect(|&y, &e| y * (e - weighted_error))
            }
            (activation, _) => Zip::from(&self.weighted_sum)
                .and(&self.output)
                .and(&self.error)
                .map_collect(|&s, &y, &e| e * activation.derivative(s, y)),
        }
    }
}

impl Layer for FeedforwardLayer {
    fn input_size(&self) -> usize {
        self.input_dimension
    }

    fn output_size(&self) -> usize {
        self.output_dimension
    }

    fn compute(&mut self, input: ArrayView1<ImagePrecision>) {
        assert_eq!(
            input.len(),
            self.input_dimension,
            "Input of length {} passed to layer of input size {}",
            input.len(),
            self.input_dimension
        );
        self.input.assign(&input);
        let weighted_sum = input.dot(&self.weights) + &self.bias;
        match self.activation {
            Activation::Softmax => self.output.assign(&softmax(&weighted_sum)),
            activation => self
                .output
                .assign(&weighted_sum.mapv(|s| activation.activate(s))),
        }
        self.weighted_sum = weighted_sum;

        if let Some(dropout) = self.dropout.as_mut() {
            if self.training {
                dropout.resample();
                for (y, &active) in self.output.iter_mut().zip(dropout.active.iter()) {
                    if !active {
                        *y = 0.0;
                    }
                }
            } else {
                self.output *= 1.0 - dropout.rate;
            }
        }
    }

    fn output(&self) -> ArrayView1<ImagePrecision> {
        self.output.view()
    }

    fn error(&self) -> ArrayView1<ImagePrecision> {
        self.error.view()
    }

    fn add_error(&mut self, index: usize, value: ImagePrecision) {
        self.error[index] += value;
    }

    fn set_expected_class(&mut self, class: usize) {
        assert!(class < self.output_dimension, "Class {} out of range", class);
        self.expected_class = Some(class);
        for (index, (e, &y)) in self.error.iter_mut().zip(self.output.iter()).enumerate() {
            *e += y - if index == class { 1.0 } else { 0.0 };
        }
    }

    fn back_propagate(&mut self) -> ImagePrecision {
        let mean_error = self.error.mapv(|e| e.abs()).mean().unwrap_or(0.0);

        if self.activation_cost != 0.0 {
            let cost = self.activation_cost;
            Zip::from(&mut self.error)
                .and(&self.output)
                .for_each(|e, &y| {
                    if y > 0.0 {
                        *e += cost;
                    }
                });
        }

        let mut delta = self.output_deltas();
        if let (Some(dropout), true) = (self.dropout.as_ref(), self.training) {
            for (d, &active) in delta.iter_mut().zip(dropout.active.iter()) {
                if !active {
                    *d = 0.0;
                }
            }
        }

        Zip::from(self.gradient.rows_mut())
            .and(&self.input)
            .for_each(|mut row, &x| row.scaled_add(x, &delta));
        self.bias_gradient += &delta;

        if let Some(input_error) = self.input_error.as_mut() {
            input_error.assign(&self.weights.dot(&delta));
        }

        trace!(
            "Back-propagated {} -> {} layer, mean error {}",
            self.input_dimension,
            self.output_dimension,
            mean_error
        );
        self.error.fill(0.0);
        self.expected_class = None;
        mean_error
    }

    fn set_propagate_error(&mut self, enabled: bool) {
        self.input_error = if enabled {
            Some(Array::zeros(self.input_dimension))
        } else {
            None
        };
    }

    fn input_error(&self) -> Option<ArrayView1<ImagePrecision>> {
        self.input_error.as_ref().map(|e| e.view())
    }

    fn learn(&mut self) -> MlResult<()> {
        if self.decay != 0.0 {
            self.weights *= 1.0 - self.decay;
        }
        self.weights.scaled_add(-self.learning_rate, &self.gradient);
        self.bias.scaled_add(-self.learning_rate, &self.bias_gradient);
        self.gradient.fill(0.0);
        self.bias_gradient.fill(0.0);

        if self.weights.iter().chain(self.bias.iter()).any(|w| w.is_nan()) {
            return Err(MlError::NumericalDegeneration("feed forward layer weights"));
        }
        Ok(())
    }

    fn learning_rate(&self) -> WeightPrecision {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: WeightPrecision) {
        self.learning_rate = learning_rate;
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn has_binary_output(&self) -> bool {
        self.activation.is_binary()
    }

    fn remove_input(&mut self, index: usize) {
        assert!(index < self.input_dimension, "Input {} out of range", index);
        let keep: Vec<usize> = (0..self.input_dimension).filter(|&i| i != index).collect();
        self.weights = self.weights.select(Axis(0), &keep);
        self.gradient = self.gradient.select(Axis(0), &keep);
        self.input = self.input.select(Axis(0), &keep);
        self.input_dimension -= 1;
        if self.input_error.is_some() {
            self.input_error = Some(Array::zeros(self.input_dimension));
        }
    }

    fn remove_output(&mut self, index: usize) {
        assert!(index < self.output_dimension, "Output {} out of range", index);
        let keep: Vec<usize> = (0..self.output_dimension).filter(|&o| o != index).collect();
        self.weights = self.weights.select(Axis(1), &keep);
        self.gradient = self.gradient.select(Axis(1), &keep);
        self.bias = self.bias.select(Axis(0), &keep);
        self.bias_gradient = self.bias_gradient.select(Axis(0), &keep);
        self.weighted_sum = self.weighted_sum.select(Axis(0), &keep);
        self.output = self.output.select(Axis(0), &keep);
        self.error = self.error.select(Axis(0), &keep);
        if let Some(dropout) = self.dropout.as_mut() {
            dropout.active.remove(index);
        }
        self.output_dimension -= 1;
    }
}
