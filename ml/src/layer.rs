//! The contract every trainable layer satisfies.
//!
//! A training step is `compute` → `set_expected` (or errors handed down from the layer
//! above via `add_errors`) → `back_propagate` → `learn`. `back_propagate` only accumulates
//! gradients, so several samples (or several tile positions sharing one layer) may be
//! back-propagated before a single `learn`.
//!
//! Layers do not alias each other's buffers. A layer with error propagation enabled owns an
//! input-error buffer that `back_propagate` fills; whoever owns the chain adds it into the
//! error of the layer below.
use ndarray::*;

use crate::{ImagePrecision, MlResult, WeightPrecision};

pub trait Layer {
    fn input_size(&self) -> usize;
    fn output_size(&self) -> usize;

    /// Forward pass. The input is copied into the layer, as it is needed again by
    /// `back_propagate`.
    fn compute(&mut self, input: ArrayView1<ImagePrecision>);

    /// Output of the last `compute`.
    fn output(&self) -> ArrayView1<ImagePrecision>;

    /// Pending error of the outputs (`∂Loss/∂output`).
    fn error(&self) -> ArrayView1<ImagePrecision>;

    /// Adds to the pending error of one output.
    fn add_error(&mut self, index: usize, value: ImagePrecision);

    /// Adds a whole error vector, e.g. the input error of the layer above.
    fn add_errors(&mut self, errors: ArrayView1<ImagePrecision>) {
        assert_eq!(errors.len(), self.output_size(), "Error vector has wrong length");
        for (index, &value) in errors.iter().enumerate() {
            self.add_error(index, value);
        }
    }

    /// Accumulates the squared-error derivative `output - expected` for one output.
    /// Must be called after `compute` and before `back_propagate`.
    fn set_expected(&mut self, index: usize, expected: ImagePrecision) {
        let actual = self.output()[index];
        self.add_error(index, actual - expected);
    }

    /// Sets a one-hot target for all outputs.
    fn set_expected_class(&mut self, class: usize) {
        assert!(class < self.output_size(), "Class {} out of range", class);
        for index in 0..self.output_size() {
            self.set_expected(index, if index == class { 1.0 } else { 0.0 });
        }
    }

    /// Turns the pending error into accumulated gradients (and into the input error, if
    /// enabled), clears the pending error and returns its mean absolute value.
    fn back_propagate(&mut self) -> ImagePrecision;

    /// Enables or disables filling the input-error buffer during `back_propagate`.
    fn set_propagate_error(&mut self, enabled: bool);

    /// Error of the inputs computed by the last `back_propagate`, if propagation is enabled.
    fn input_error(&self) -> Option<ArrayView1<ImagePrecision>>;

    /// Applies and resets the accumulated gradients.
    /// Fails if the update produced NaN parameters.
    fn learn(&mut self) -> MlResult<()>;

    fn learning_rate(&self) -> WeightPrecision;
    fn set_learning_rate(&mut self, learning_rate: WeightPrecision);

    /// Switches between training behavior (e.g. dropout masks) and inference behavior.
    fn set_training(&mut self, _training: bool) {}

    /// Whether all outputs lie in [0, 1].
    fn has_binary_output(&self) -> bool {
        false
    }

    /// Structural pruning of one input unit.
    fn remove_input(&mut self, _index: usize) {
        unimplemented!("This layer type does not support removing input units")
    }

    /// Structural pruning of one output unit.
    fn remove_output(&mut self, _index: usize) {
        unimplemented!("This layer type does not support removing output units")
    }
}

/// Index of the largest output, first one on ties.
pub fn arg_max(values: ArrayView1<ImagePrecision>) -> usize {
    let mut best = 0;
    for (index, &value) in values.iter().enumerate() {
        if value > values[best] {
            best = index;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_max_first_on_ties() {
        assert_eq!(arg_max(array![1., 3., 3., 2.].view()), 1);
        assert_eq!(arg_max(array![-1.].view()), 0);
    }
}
