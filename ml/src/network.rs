//! A plain sequential chain of layers, used as classifier head on top of extracted
//! features or as a whole network in non-convolutional settings.
use crate::{
    layer::{arg_max, Layer},
    ImagePrecision, MlResult,
};
use log::debug;
use ndarray::*;

/// Ordered layers, the output of each one being the input of the next.
/// Errors travel down the chain through the input-error buffers of the layers.
#[derive(Default)]
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
}

impl Network {
    pub fn new() -> Network {
        Network { layers: Vec::new() }
    }

    /// Appends a layer. Every layer but the first propagates its error downwards.
    pub fn push(&mut self, mut layer: Box<dyn Layer>) {
        if let Some(top) = self.layers.last() {
            assert_eq!(
                top.output_size(),
                layer.input_size(),
                "Layer input size does not match the output size of the layer below"
            );
            layer.set_propagate_error(true);
        }
        self.layers.push(layer);
    }

    pub fn with_layer(mut self, layer: Box<dyn Layer>) -> Network {
        self.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> &dyn Layer {
        self.layers[index].as_ref()
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map_or(0, |l| l.input_size())
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map_or(0, |l| l.output_size())
    }

    /// Makes the first layer produce an input error as well, so the chain can hand
    /// errors to whatever produced its input (e.g. a stacked feature extractor).
    pub fn set_propagate_input_error(&mut self, enabled: bool) {
        if let Some(first) = self.layers.first_mut() {
            first.set_propagate_error(enabled);
        }
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in self.layers.iter_mut() {
            layer.set_training(training);
        }
    }

    /// Forward pass through all layers.
    pub fn compute(&mut self, input: ArrayView1<ImagePrecision>) -> ArrayView1<ImagePrecision> {
        assert!(!self.layers.is_empty(), "Empty network");
        self.layers[0].compute(input);
        for k in 1..self.layers.len() {
            let (below, above) = self.layers.split_at_mut(k);
            above[0].compute(below[k - 1].output());
        }
        self.output()
    }

    pub fn output(&self) -> ArrayView1<ImagePrecision> {
        self.layers[self.layers.len() - 1].output()
    }

    pub fn set_expected(&mut self, index: usize, expected: ImagePrecision) {
        let last = self.layers.len() - 1;
        self.layers[last].set_expected(index, expected);
    }

    pub fn set_expected_class(&mut self, class: usize) {
        let last = self.layers.len() - 1;
        self.layers[last].set_expected_class(class);
    }

    /// Back-propagates the pending error of the top layer through the whole chain.
    /// Returns the mean absolute error of the top layer.
    pub fn back_propagate(&mut self) -> ImagePrecision {
        let top = self.layers.len() - 1;
        let mut top_error = 0.0;
        for k in (0..self.layers.len()).rev() {
            let error = self.layers[k].back_propagate();
            if k == top {
                top_error = error;
            }
            if k > 0 {
                let (below, above) = self.layers.split_at_mut(k);
                if let Some(input_error) = above[0].input_error() {
                    below[k - 1].add_errors(input_error);
                }
            }
        }
        top_error
    }

    /// Input error of the first layer, if enabled.
    pub fn input_error(&self) -> Option<ArrayView1<ImagePrecision>> {
        self.layers.first().and_then(|l| l.input_error())
    }

    pub fn learn(&mut self) -> MlResult<()> {
        for layer in self.layers.iter_mut() {
            layer.learn()?;
        }
        Ok(())
    }

    /// Index of the strongest output for the given input.
    pub fn classify(&mut self, input: ArrayView1<ImagePrecision>) -> usize {
        arg_max(self.compute(input))
    }

    /// One supervised step on a single labeled sample.
    pub fn train_sample(&mut self, input: ArrayView1<ImagePrecision>, class: usize) -> MlResult<ImagePrecision> {
        self.compute(input);
        self.set_expected_class(class);
        let error = self.back_propagate();
        self.learn()?;
        debug!("Trained sample of class {}, error {}", class, error);
        Ok(error)
    }
}
