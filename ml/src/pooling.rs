//! Reduction of spatial windows to single values.
//!
//! A [`PoolerSelector`] reduces one channel of a window and routes errors back into it.
//! [`Pooling`] applies a selector over non-overlapping windows of every channel and can be
//! used as a stage of a [`Stack`](crate::models::Stack).
use crate::{
    config::PoolingKind, convolutions::Stage, tensor::Tensor, ImagePrecision, MlResult,
    WeightPrecision,
};
use log::{debug, trace};
use ndarray::*;

/// Learning rate of the temperature of soft-exponential-log pooling
pub const SOFT_EXP_LOG_LEARNING_RATE: WeightPrecision = 1e-4;

pub trait PoolerSelector {
    /// Reduces a `width x height` window of one channel to a single value.
    fn select(&self, window: ArrayView2<ImagePrecision>) -> ImagePrecision;

    /// Adds the error of the selected value, routed to the cells of the window, into
    /// `gradient`.
    fn back_propagate(
        &mut self,
        error: ImagePrecision,
        window: ArrayView2<ImagePrecision>,
        gradient: ArrayViewMut2<ImagePrecision>,
    );

    /// Adds a reconstruction of the window from its selected value into `target`.
    /// The original window decides where the value goes, if it matters.
    fn reconstruct(
        &self,
        value: ImagePrecision,
        _window: ArrayView2<ImagePrecision>,
        mut target: ArrayViewMut2<ImagePrecision>,
    ) {
        target += value;
    }

    /// Applies accumulated gradients of the selector's own parameters.
    fn learn(&mut self) {}

    fn name(&self) -> &'static str;
}

/// Position of the first cell (in iteration order) maximizing `key`.
fn first_max_by_key<F>(window: ArrayView2<ImagePrecision>, key: F) -> (usize, usize)
where
    F: Fn(ImagePrecision) -> ImagePrecision,
{
    let mut best = (0, 0);
    let mut best_key = ImagePrecision::NEG_INFINITY;
    for (index, &value) in window.indexed_iter() {
        let k = key(value);
        if k > best_key {
            best_key = k;
            best = index;
        }
    }
    best
}

#[derive(Debug, Clone, Default)]
pub struct MaxPooler;

impl PoolerSelector for MaxPooler {
    fn select(&self, window: ArrayView2<ImagePrecision>) -> ImagePrecision {
        window[first_max_by_key(window, |x| x)]
    }

    fn back_propagate(
        &mut self,
        error: ImagePrecision,
        window: ArrayView2<ImagePrecision>,
        mut gradient: ArrayViewMut2<ImagePrecision>,
    ) {
        gradient[first_max_by_key(window, |x| x)] += error;
    }

    fn reconstruct(
        &self,
        value: ImagePrecision,
        window: ArrayView2<ImagePrecision>,
        mut target: ArrayViewMut2<ImagePrecision>,
    ) {
        target[first_max_by_key(window, |x| x)] += value;
    }

    fn name(&self) -> &'static str {
        "max"
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeanPooler;

impl PoolerSelector for MeanPooler {
    fn select(&self, window: ArrayView2<ImagePrecision>) -> ImagePrecision {
        window.mean().unwrap_or(0.0)
    }

    fn back_propagate(
        &mut self,
        error: ImagePrecision,
        window: ArrayView2<ImagePrecision>,
        mut gradient: ArrayViewMut2<ImagePrecision>,
    ) {
        gradient += error / window.len() as ImagePrecision;
    }

    fn name(&self) -> &'static str {
        "mean"
    }
}

/// Selects the value of largest magnitude, keeping its sign. Errors go back to the
/// same cell.
#[derive(Debug, Clone, Default)]
pub struct ExtremumPooler;

impl PoolerSelector for ExtremumPooler {
    fn select(&self, window: ArrayView2<ImagePrecision>) -> ImagePrecision {
        window[first_max_by_key(window, |x| x.abs())]
    }

    fn back_propagate(
        &mut self,
        error: ImagePrecision,
        window: ArrayView2<ImagePrecision>,
        mut gradient: ArrayViewMut2<ImagePrecision>,
    ) {
        gradient[first_max_by_key(window, |x| x.abs())] += error;
    }

    fn reconstruct(
        &self,
        value: ImagePrecision,
        window: ArrayView2<ImagePrecision>,
        mut target: ArrayViewMut2<ImagePrecision>,
    ) {
        target[first_max_by_key(window, |x| x.abs())] += value;
    }

    fn name(&self) -> &'static str {
        "extremum"
    }
}

/// `log(Σ exp(w·x)) / w` with a learned temperature `w`, a smooth maximum that approaches
/// the mean for small `w` and the maximum for large `w`.
#[derive(Debug, Clone)]
pub struct SoftExpLogPooler {
    temperature: WeightPrecision,
    temperature_gradient: WeightPrecision,
}

impl Default for SoftExpLogPooler {
    fn default() -> Self {
        SoftExpLogPooler::new(std::f32::consts::E)
    }
}

impl SoftExpLogPooler {
    pub fn new(temperature: WeightPrecision) -> SoftExpLogPooler {
        assert!(temperature > 0.0, "Temperature must be positive");
        SoftExpLogPooler {
            temperature,
            temperature_gradient: 0.0,
        }
    }

    pub fn temperature(&self) -> WeightPrecision {
        self.temperature
    }

    pub fn temperature_gradient(&self) -> WeightPrecision {
        self.temperature_gradient
    }

    /// `exp(w·x_i) / Σ exp(w·x_j)` for every cell.
    fn shares(&self, window: ArrayView2<ImagePrecision>) -> Array2<ImagePrecision> {
        let w = self.temperature;
        let max = window.fold(ImagePrecision::NEG_INFINITY, |m, &x| m.max(w * x));
        let exp = window.mapv(|x| (w * x - max).exp());
        let sum = exp.sum();
        exp / sum
    }
}

impl PoolerSelector for SoftExpLogPooler {
    fn select(&self, window: ArrayView2<ImagePrecision>) -> ImagePrecision {
        let w = self.temperature;
        let max = window.fold(ImagePrecision::NEG_INFINITY, |m, &x| m.max(w * x));
        let sum: ImagePrecision = window.iter().map(|&x| (w * x - max).exp()).sum();
        (sum.ln() + max) / w
    }

    fn back_propagate(
        &mut self,
        error: ImagePrecision,
        window: ArrayView2<ImagePrecision>,
        mut gradient: ArrayViewMut2<ImagePrecision>,
    ) {
        let w = self.temperature;
        let shares = self.shares(window);
        gradient.scaled_add(error * w, &shares);

        // ∂f/∂w = (Σ p_i x_i - f) / w
        let expected = (&shares * &window).sum();
        let value = self.select(window);
        self.temperature_gradient += error * (expected - value) / w;
    }

    fn learn(&mut self) {
        self.temperature -= SOFT_EXP_LOG_LEARNING_RATE * self.temperature_gradient;
        self.temperature_gradient = 0.0;
        trace!("Soft-exp-log temperature now {}", self.temperature);
    }

    fn name(&self) -> &'static str {
        "soft_exp_log"
    }
}

/// Selector for a configured pooling kind.
pub fn selector(kind: PoolingKind) -> Box<dyn PoolerSelector> {
    match kind {
        PoolingKind::Max => Box::new(MaxPooler),
        PoolingKind::Mean => Box::new(MeanPooler),
        PoolingKind::Extremum => Box::new(ExtremumPooler),
        PoolingKind::SoftExpLog => Box::new(SoftExpLogPooler::default()),
    }
}

/// Pooling stage: every output cell `(ox, oy, z)` is the selection of the
/// `pool_width x pool_height` window of channel `z` at `(ox * pool_width, oy * pool_height)`.
pub struct Pooling {
    selector: Box<dyn PoolerSelector>,
    pool_width: usize,
    pool_height: usize,
    depth: usize,
    out_width: usize,
    out_height: usize,
    input_x: usize,
    input_y: usize,
    /// Input patch of the last `encode`, needed to route reconstructions
    last_input: Tensor,
    output: Tensor,
    error: Tensor,
    binary_output: bool,
}

impl Pooling {
    pub fn new(
        selector: Box<dyn PoolerSelector>,
        pool_width: usize,
        pool_height: usize,
        depth: usize,
    ) -> Pooling {
        assert!(pool_width > 0 && pool_height > 0, "Empty pooling window requested");
        Pooling {
            selector,
            pool_width,
            pool_height,
            depth,
            out_width: 1,
            out_height: 1,
            input_x: 0,
            input_y: 0,
            last_input: Tensor::new(pool_width, pool_height, depth),
            output: Tensor::new(1, 1, depth),
            error: Tensor::new(1, 1, depth),
            binary_output: false,
        }
    }

    /// Declares the pooled values binary, which holds when the input is binary.
    pub fn with_binary_output(mut self, binary_output: bool) -> Self {
        self.binary_output = binary_output;
        self
    }

    pub fn selector(&self) -> &dyn PoolerSelector {
        self.selector.as_ref()
    }

    pub fn pool_size(&self) -> (usize, usize) {
        (self.pool_width, self.pool_height)
    }

    fn check_input(&self, input: &Tensor) {
        let (width, height) = self.input_patch();
        assert!(
            input.fits(self.input_x, self.input_y, width, height),
            "Pooling patch {}x{} at ({}, {}) does not fit into a {}x{} tensor",
            width,
            height,
            self.input_x,
            self.input_y,
            input.width(),
            input.height()
        );
        assert_eq!(input.depth(), self.depth, "Input depth does not match pooling depth");
    }

    fn window_range(&self, x: usize, y: usize, ox: usize, oy: usize) -> (usize, usize, usize, usize) {
        let wx = x + ox * self.pool_width;
        let wy = y + oy * self.pool_height;
        (wx, wy, wx + self.pool_width, wy + self.pool_height)
    }
}

impl Stage for Pooling {
    fn input_patch(&self) -> (usize, usize) {
        (self.out_width * self.pool_width, self.out_height * self.pool_height)
    }

    fn input_depth(&self) -> usize {
        self.depth
    }

    fn output_grid(&self) -> (usize, usize) {
        (self.out_width, self.out_height)
    }

    fn output_depth(&self) -> usize {
        self.depth
    }

    fn resize(&mut self, out_width: usize, out_height: usize) {
        assert!(out_width > 0 && out_height > 0, "Empty output grid requested");
        self.out_width = out_width;
        self.out_height = out_height;
        let (width, height) = self.input_patch();
        self.last_input = Tensor::new(width, height, self.depth);
        self.output = Tensor::new(out_width, out_height, self.depth);
        self.error = Tensor::new(out_width, out_height, self.depth);
        debug!("Resized {} pooling to {}x{}", self.selector.name(), out_width, out_height);
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn output_mut(&mut self) -> &mut Tensor {
        &mut self.output
    }

    fn error_mut(&mut self) -> &mut Tensor {
        &mut self.error
    }

    fn buffers_mut(&mut self) -> (&Tensor, &mut Tensor) {
        (&self.output, &mut self.error)
    }

    fn set_input(&mut self, input: &Tensor, x: usize, y: usize) {
        self.input_x = x;
        self.input_y = y;
        self.check_input(input);
    }

    fn input_origin(&self) -> (usize, usize) {
        (self.input_x, self.input_y)
    }

    fn encode(&mut self, input: &Tensor) {
        self.check_input(input);
        let (width, height) = self.input_patch();
        self.last_input = input.patch(self.input_x, self.input_y, width, height);
        let values = self.last_input.values();
        for ox in 0..self.out_width {
            for oy in 0..self.out_height {
                let (x0, y0, x1, y1) = self.window_range(0, 0, ox, oy);
                for z in 0..self.depth {
                    let window = values.slice(s![x0..x1, y0..y1, z]);
                    self.output.set(ox, oy, z, self.selector.select(window));
                }
            }
        }
    }

    fn rebuild_into(&mut self, target: &mut Tensor, x: usize, y: usize, clear_first: bool) {
        if clear_first {
            target.clear();
        }
        let source = self.last_input.values();
        for ox in 0..self.out_width {
            for oy in 0..self.out_height {
                let (x0, y0, x1, y1) = self.window_range(0, 0, ox, oy);
                let (tx0, ty0, tx1, ty1) = self.window_range(x, y, ox, oy);
                {
                    let mut values = target.values_mut();
                    for z in 0..self.depth {
                        let window = source.slice(s![x0..x1, y0..y1, z]);
                        let cells = values.slice_mut(s![tx0..tx1, ty0..ty1, z]);
                        self.selector.reconstruct(self.output.get(ox, oy, z), window, cells);
                    }
                }
                target.count_window(tx0, ty0, self.pool_width, self.pool_height);
            }
        }
        if clear_first {
            target.normalize_weights();
        }
    }

    /// Pooling has nothing to train without a supervised error, so this only encodes.
    fn train(&mut self, input: &Tensor) -> MlResult<ImagePrecision> {
        self.encode(input);
        Ok(0.0)
    }

    fn back_propagate(&mut self, input: &Tensor, mut input_error: Option<&mut Tensor>) -> ImagePrecision {
        self.check_input(input);
        let mean_error = self.error.values().mapv(|e| e.abs()).mean().unwrap_or(0.0);
        let values = input.values();
        let mut scratch = Array2::zeros((self.pool_width, self.pool_height));
        for ox in 0..self.out_width {
            for oy in 0..self.out_height {
                let (x0, y0, x1, y1) = self.window_range(self.input_x, self.input_y, ox, oy);
                for z in 0..self.depth {
                    let window = values.slice(s![x0..x1, y0..y1, z]);
                    let error = self.error.get(ox, oy, z);
                    match input_error.as_mut() {
                        Some(target) => {
                            let mut cells = target.values_mut();
                            self.selector.back_propagate(
                                error,
                                window,
                                cells.slice_mut(s![x0..x1, y0..y1, z]),
                            );
                        }
                        None => self.selector.back_propagate(error, window, scratch.view_mut()),
                    }
                }
            }
        }
        self.error.clear();
        mean_error
    }

    fn learn(&mut self) -> MlResult<()> {
        self.selector.learn();
        Ok(())
    }

    fn is_trainable(&self) -> bool {
        false
    }

    fn has_binary_output(&self) -> bool {
        self.binary_output
    }

    fn name(&self) -> &'static str {
        "pooling"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_max_first_on_ties() {
        let window = array![[1.0, 3.0], [3.0, 2.0]];
        let mut pooler = MaxPooler;
        assert_eq!(pooler.select(window.view()), 3.0);
        let mut gradient = Array2::zeros((2, 2));
        pooler.back_propagate(0.5, window.view(), gradient.view_mut());
        assert_eq!(gradient, array![[0.0, 0.5], [0.0, 0.0]]);
    }

    #[test]
    fn test_extremum_keeps_sign() {
        let window = array![[1.0, -4.0], [3.0, 4.0]];
        let mut pooler = ExtremumPooler;
        assert_eq!(pooler.select(window.view()), -4.0);
        let mut gradient = Array2::zeros((2, 2));
        pooler.back_propagate(1.0, window.view(), gradient.view_mut());
        assert_eq!(gradient, array![[0.0, 1.0], [0.0, 0.0]]);
    }

    #[test]
    fn test_mean_spreads_error() {
        let window = array![[1.0, 2.0], [3.0, 6.0]];
        let mut pooler = MeanPooler;
        assert_eq!(pooler.select(window.view()), 3.0);
        let mut gradient = Array2::zeros((2, 2));
        pooler.back_propagate(2.0, window.view(), gradient.view_mut());
        assert_eq!(gradient, Array2::from_elem((2, 2), 0.5));
    }

    #[test]
    fn test_soft_exp_log_bounds() {
        let window = array![[0.1, 0.9], [0.4, 0.2]];
        let pooler = SoftExpLogPooler::default();
        let value = pooler.select(window.view());
        // between the maximum and maximum + ln(n) / w
        assert!(value > 0.9);
        assert!(value < 0.9 + 4f32.ln() / std::f32::consts::E);
    }

    #[test]
    fn test_soft_exp_log_routing_and_temperature() {
        let window = array![[0.1, 0.9], [0.4, 0.2]];
        let mut pooler = SoftExpLogPooler::new(2.0);
        let mut gradient = Array2::zeros((2, 2));
        pooler.back_propagate(1.0, window.view(), gradient.view_mut());
        // the shares sum to one, scaled by the temperature
        assert_abs_diff_eq!(gradient.sum(), 2.0, epsilon = 1e-5);
        assert!(gradient[[0, 1]] > gradient[[1, 0]]);

        // numeric derivative of the value with respect to the temperature
        let h = 1e-2;
        let numeric = (SoftExpLogPooler::new(2.0 + h).select(window.view())
            - SoftExpLogPooler::new(2.0 - h).select(window.view()))
            / (2.0 * h);
        assert_abs_diff_eq!(pooler.temperature_gradient(), numeric, epsilon = 1e-3);

        let before = pooler.temperature();
        pooler.learn();
        assert_abs_diff_eq!(
            pooler.temperature(),
            before - SOFT_EXP_LOG_LEARNING_RATE * numeric,
            epsilon = 1e-6
        );
        assert_eq!(pooler.temperature_gradient(), 0.0);
    }

    fn grid_input() -> Tensor {
        Tensor::from_array(Array::from_shape_fn((4, 4, 2), |(x, y, z)| {
            (x * 4 + y) as f32 * if z == 0 { 1.0 } else { -1.0 }
        }))
    }

    #[test]
    fn test_pooling_stage_encode() {
        let mut pooling = Pooling::new(Box::new(MaxPooler), 2, 2, 2);
        pooling.resize(2, 2);
        assert_eq!(pooling.input_patch(), (4, 4));
        let input = grid_input();
        pooling.set_input(&input, 0, 0);
        pooling.encode(&input);
        assert_eq!(pooling.output().get(0, 0, 0), 5.0);
        assert_eq!(pooling.output().get(1, 1, 0), 15.0);
        assert_eq!(pooling.output().get(1, 1, 1), -10.0);

        assert!(!pooling.is_trainable());
        assert_eq!(pooling.train(&input).unwrap(), 0.0);
        assert_eq!(pooling.output().get(1, 1, 0), 15.0);
    }

    #[test]
    fn test_pooling_stage_routes_errors() {
        let mut pooling = Pooling::new(Box::new(MaxPooler), 2, 2, 2);
        pooling.resize(2, 2);
        let input = grid_input();
        pooling.encode(&input);
        pooling.error_mut().set(1, 0, 0, 1.0);
        let mut input_error = Tensor::new(4, 4, 2);
        let mean = pooling.back_propagate(&input, Some(&mut input_error));
        assert_eq!(mean, 1.0 / 8.0);
        // maximum of the window at (2, 0) is the cell (3, 1)
        assert_eq!(input_error.get(3, 1, 0), 1.0);
        assert_eq!(input_error.values().sum(), 1.0);
    }

    #[test]
    fn test_pooling_stage_rebuild() {
        let mut pooling = Pooling::new(Box::new(MeanPooler), 2, 2, 2);
        pooling.resize(2, 1);
        let input = grid_input();
        pooling.encode(&input);
        let mut target = Tensor::new(4, 2, 2);
        pooling.rebuild_into(&mut target, 0, 0, true);
        // every cell of a window is replaced by the window mean
        assert_eq!(target.get(0, 0, 0), 2.5);
        assert_eq!(target.get(1, 1, 0), 2.5);
        assert_eq!(target.get(3, 0, 1), -10.5);
        assert!(target.weights().iter().all(|&w| w == 1.0));
    }
}
