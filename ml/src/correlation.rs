//! Correlation units.
//!
//! Instead of a weighted sum, every output is the Pearson correlation between the input
//! vector and a learned pattern (one column of the weight matrix). The weighted variant
//! additionally learns a per-element importance, passed through a sigmoid gate, and computes
//! an importance-weighted correlation.
//!
//! With importance `a`, weighted means `x̄ = Σa·x / Σa`, `p̄ = Σa·p / Σa`, deviations
//! `dx = x - x̄`, `dp = p - p̄`, `C = Σa·dx·dp`, `Sx = Σa·dx²`, `Sp = Σa·dp²`:
//!
//! ```text
//! r      = C / sqrt(Sx·Sp)
//! ∂r/∂p  = a·(dx / sqrt(Sx·Sp) - r·dp / Sp)
//! ∂r/∂x  = a·(dp / sqrt(Sx·Sp) - r·dx / Sx)
//! ∂r/∂a  = dx·dp / sqrt(Sx·Sp) - r/2·(dx²/Sx + dp²/Sp)
//! ```
//!
//! The plain variant is the special case `a = 1`.
use crate::{
    activation_functions::Activation, layer::Layer, ImagePrecision, MlError, MlResult,
    WeightPrecision,
};
use ndarray::*;
use rand::{distributions::Uniform, Rng};

use crate::fully_connected::DEFAULT_LEARNING_RATE;

/// Below this product of variances the correlation is treated as 0.
const MIN_VARIANCE: ImagePrecision = 1e-12;

/// Weighted moments of one input/pattern pair.
struct Moments {
    mean_x: ImagePrecision,
    mean_p: ImagePrecision,
    var_x: ImagePrecision,
    var_p: ImagePrecision,
    norm: ImagePrecision,
    r: ImagePrecision,
}

fn moments(
    x: ArrayView1<ImagePrecision>,
    p: ArrayView1<WeightPrecision>,
    a: ArrayView1<WeightPrecision>,
) -> Moments {
    let total = a.sum();
    let mean_x = (&a * &x).sum() / total;
    let mean_p = (&a * &p).sum() / total;
    let mut covariance = 0.0;
    let mut var_x = 0.0;
    let mut var_p = 0.0;
    Zip::from(&x).and(&p).and(&a).for_each(|&xi, &pi, &ai| {
        let dx = xi - mean_x;
        let dp = pi - mean_p;
        covariance += ai * dx * dp;
        var_x += ai * dx * dx;
        var_p += ai * dp * dp;
    });
    let product = var_x * var_p;
    let (norm, r) = if product > MIN_VARIANCE {
        let norm = product.sqrt();
        (norm, covariance / norm)
    } else {
        (0.0, 0.0)
    };
    Moments {
        mean_x,
        mean_p,
        var_x,
        var_p,
        norm,
        r,
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationLayer {
    /// One pattern per output, stored as columns (input units x output units)
    patterns: Array2<WeightPrecision>,
    gradient: Array2<WeightPrecision>,
    /// Raw importance, gated through a sigmoid. `None` for the plain variant
    importance: Option<Array2<WeightPrecision>>,
    importance_gradient: Array2<WeightPrecision>,
    input: Array1<ImagePrecision>,
    output: Array1<ImagePrecision>,
    error: Array1<ImagePrecision>,
    input_error: Option<Array1<ImagePrecision>>,
    learning_rate: WeightPrecision,
    decay: WeightPrecision,
}

impl CorrelationLayer {
    /// Plain correlation layer with patterns drawn uniformly from [-1, 1].
    pub fn new<R: Rng + ?Sized>(input_size: usize, output_size: usize, rng: &mut R) -> Self {
        let dist = Uniform::new_inclusive(-1.0 as WeightPrecision, 1.0);
        let patterns = Array::from_shape_fn((input_size, output_size), |_| rng.sample(dist));
        CorrelationLayer::from_patterns(patterns)
    }

    /// Importance-weighted correlation layer. All importances start at sigmoid(0) = 0.5,
    /// which makes it behave like the plain variant until trained.
    pub fn weighted<R: Rng + ?Sized>(input_size: usize, output_size: usize, rng: &mut R) -> Self {
        let mut layer = CorrelationLayer::new(input_size, output_size, rng);
        layer.importance = Some(Array::zeros((input_size, output_size)));
        layer
    }

    pub fn from_patterns(patterns: Array2<WeightPrecision>) -> Self {
        assert!(patterns.len_of(Axis(0)) > 1, "Correlation needs at least two inputs");
        let (input_size, output_size) = patterns.dim();
        CorrelationLayer {
            gradient: Array::zeros(patterns.raw_dim()),
            importance: None,
            importance_gradient: Array::zeros(patterns.raw_dim()),
            input: Array::zeros(input_size),
            output: Array::zeros(output_size),
            error: Array::zeros(output_size),
            input_error: None,
            patterns,
            learning_rate: DEFAULT_LEARNING_RATE,
            decay: 0.0,
        }
    }

    /// Sets the raw (pre-sigmoid) importance and makes the layer a weighted one.
    pub fn with_importance(mut self, importance: Array2<WeightPrecision>) -> MlResult<Self> {
        if importance.dim() != self.patterns.dim() {
            return Err(MlError::shape_mismatch(
                "correlation importance",
                self.patterns.dim(),
                importance.dim(),
            ));
        }
        self.importance = Some(importance);
        Ok(self)
    }

    pub fn with_learning_rate(mut self, learning_rate: WeightPrecision) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_decay(mut self, decay: WeightPrecision) -> Self {
        self.decay = decay;
        self
    }

    pub fn patterns(&self) -> ArrayView2<WeightPrecision> {
        self.patterns.view()
    }

    pub fn gradient(&self) -> ArrayView2<WeightPrecision> {
        self.gradient.view()
    }

    pub fn importance_gradient(&self) -> ArrayView2<WeightPrecision> {
        self.importance_gradient.view()
    }

    pub fn is_weighted(&self) -> bool {
        self.importance.is_some()
    }

    /// Gated importance of the inputs for one output.
    fn gates(&self, output: usize) -> Array1<WeightPrecision> {
        match &self.importance {
            Some(importance) => importance
                .column(output)
                .mapv(|v| Activation::Sigmoid.activate(v)),
            None => Array::ones(self.patterns.len_of(Axis(0))),
        }
    }
}

impl Layer for CorrelationLayer {
    fn input_size(&self) -> usize {
        self.patterns.len_of(Axis(0))
    }

    fn output_size(&self) -> usize {
        self.patterns.len_of(Axis(1))
    }

    fn compute(&mut self, input: ArrayView1<ImagePrecision>) {
        assert_eq!(input.len(), self.input_size(), "Input has wrong length");
        self.input.assign(&input);
        for o in 0..self.output_size() {
            let gates = self.gates(o);
            self.output[o] = moments(input, self.patterns.column(o), gates.view()).r;
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

    fn back_propagate(&mut self) -> ImagePrecision {
        let mean_error = self.error.mapv(|e| e.abs()).mean().unwrap_or(0.0);
        if let Some(input_error) = self.input_error.as_mut() {
            input_error.fill(0.0);
        }

        for o in 0..self.output_size() {
            let delta = self.error[o];
            if delta == 0.0 {
                continue;
            }
            let gates = self.gates(o);
            let m = moments(self.input.view(), self.patterns.column(o), gates.view());
            if m.norm == 0.0 {
                continue;
            }
            let weighted = self.importance.is_some();
            for i in 0..self.input_size() {
                let a = gates[i];
                let dx = self.input[i] - m.mean_x;
                let dp = self.patterns[[i, o]] - m.mean_p;
                self.gradient[[i, o]] += delta * a * (dx / m.norm - m.r * dp / m.var_p);
                if let Some(input_error) = self.input_error.as_mut() {
                    input_error[i] += delta * a * (dp / m.norm - m.r * dx / m.var_x);
                }
                if weighted {
                    let d_gate =
                        dx * dp / m.norm - 0.5 * m.r * (dx * dx / m.var_x + dp * dp / m.var_p);
                    self.importance_gradient[[i, o]] += delta * d_gate * a * (1.0 - a);
                }
            }
        }

        self.error.fill(0.0);
        mean_error
    }

    fn set_propagate_error(&mut self, enabled: bool) {
        self.input_error = if enabled {
            Some(Array::zeros(self.input_size()))
        } else {
            None
        };
    }

    fn input_error(&self) -> Option<ArrayView1<ImagePrecision>> {
        self.input_error.as_ref().map(|e| e.view())
    }

    fn learn(&mut self) -> MlResult<()> {
        if self.decay != 0.0 {
            self.patterns *= 1.0 - self.decay;
        }
        self.patterns.scaled_add(-self.learning_rate, &self.gradient);
        self.gradient.fill(0.0);
        if let Some(importance) = self.importance.as_mut() {
            importance.scaled_add(-self.learning_rate, &self.importance_gradient);
            self.importance_gradient.fill(0.0);
        }

        let importance_nan = self
            .importance
            .as_ref()
            .map_or(false, |i| i.iter().any(|v| v.is_nan()));
        if importance_nan || self.patterns.iter().any(|v| v.is_nan()) {
            return Err(MlError::NumericalDegeneration("correlation patterns"));
        }
        Ok(())
    }

    fn learning_rate(&self) -> WeightPrecision {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: WeightPrecision) {
        self.learning_rate = learning_rate;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_perfect_correlation() {
        let mut layer = CorrelationLayer::from_patterns(array![[1.0, -1.0], [2.0, -2.0], [3.0, -3.0]]);
        layer.compute(array![10.0, 20.0, 30.0].view());
        assert_abs_diff_eq!(layer.output()[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(layer.output()[1], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_constant_input_has_zero_correlation() {
        let mut layer = CorrelationLayer::from_patterns(array![[1.0], [2.0], [3.0]]);
        layer.set_propagate_error(true);
        layer.compute(array![5.0, 5.0, 5.0].view());
        assert_eq!(layer.output()[0], 0.0);
        layer.set_expected(0, 1.0);
        layer.back_propagate();
        assert_eq!(layer.gradient().sum(), 0.0);
        assert_eq!(layer.input_error().unwrap().sum(), 0.0);
    }

    /// Compares the analytic pattern gradient with central differences.
    fn check_pattern_gradient(mut layer: CorrelationLayer) {
        let input = array![0.3, -1.2, 0.8, 0.1];
        layer.compute(input.view());
        // loss = r, so the error is 1
        layer.add_error(0, 1.0);
        layer.back_propagate();
        let analytic = layer.gradient().to_owned();

        let eps = 1e-3;
        for i in 0..4 {
            let mut plus = layer.clone();
            plus.patterns[[i, 0]] += eps;
            plus.compute(input.view());
            let mut minus = layer.clone();
            minus.patterns[[i, 0]] -= eps;
            minus.compute(input.view());
            let numeric = (plus.output()[0] - minus.output()[0]) / (2.0 * eps);
            assert_abs_diff_eq!(analytic[[i, 0]], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_plain_gradient_matches_numeric() {
        let mut rng = StdRng::seed_from_u64(11);
        check_pattern_gradient(CorrelationLayer::new(4, 1, &mut rng));
    }

    #[test]
    fn test_weighted_gradient_matches_numeric() {
        let layer = CorrelationLayer::from_patterns(array![[0.5], [-0.4], [0.9], [-0.2]])
            .with_importance(array![[1.0], [-0.5], [0.3], [2.0]])
            .unwrap();
        check_pattern_gradient(layer);
    }

    #[test]
    fn test_weighted_importance_gradient_matches_numeric() {
        let input = array![0.3, -1.2, 0.8, 0.1];
        let mut layer = CorrelationLayer::from_patterns(array![[0.5], [-0.4], [0.9], [-0.2]])
            .with_importance(array![[1.0], [-0.5], [0.3], [2.0]])
            .unwrap();
        layer.compute(input.view());
        layer.add_error(0, 1.0);
        layer.back_propagate();
        let analytic = layer.importance_gradient().to_owned();

        let eps = 1e-3;
        for i in 0..4 {
            let mut plus = layer.clone();
            plus.importance.as_mut().unwrap()[[i, 0]] += eps;
            plus.compute(input.view());
            let mut minus = layer.clone();
            minus.importance.as_mut().unwrap()[[i, 0]] -= eps;
            minus.compute(input.view());
            let numeric = (plus.output()[0] - minus.output()[0]) / (2.0 * eps);
            assert_abs_diff_eq!(analytic[[i, 0]], numeric, epsilon = 1e-2);
        }
    }

    #[test]
    fn test_training_increases_correlation() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = CorrelationLayer::weighted(5, 1, &mut rng).with_learning_rate(0.1);
        let input = array![1.0, 0.0, -1.0, 0.5, 2.0];
        layer.compute(input.view());
        let before = layer.output()[0];
        for _ in 0..20 {
            layer.compute(input.view());
            layer.set_expected(0, 1.0);
            layer.back_propagate();
            layer.learn().unwrap();
        }
        layer.compute(input.view());
        assert!(layer.output()[0] > before);
    }

    #[test]
    #[should_panic]
    fn test_pruning_is_unsupported() {
        let mut layer = CorrelationLayer::from_patterns(array![[1.0], [2.0]]);
        layer.remove_output(0);
    }
}
