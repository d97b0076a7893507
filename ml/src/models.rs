use crate::{
    autoencoder::TileUnit,
    convolutions::{Convolution, Stage},
    pooling::{Pooling, PoolerSelector},
    reconstruction::{
        correlation_distance, euclidean_distance, invariant_distance, ReconstructionScore,
        ScoreMask,
    },
    tensor::Tensor,
    ImagePrecision, MlError, MlResult,
};
use log::{debug, info};
use ndarray::*;

/// Stacked composition of stages, the base reading the external input and every other
/// stage reading the output of the stage below it.
///
/// The stack owns its stages. Stages above the base always read their input at `(0, 0)`,
/// since the cascading resize in [`add_layer`](Stack::add_layer) makes every output exactly
/// as large as the input patch of the stage above.
pub struct Stack {
    stages: Vec<Box<dyn Stage>>,
    /// Reconstruction of the base input patch
    reconstruction: Tensor,
}

impl Default for Stack {
    fn default() -> Self {
        Stack::new()
    }
}

impl Stack {
    pub fn new() -> Stack {
        Stack {
            stages: Vec::new(),
            reconstruction: Tensor::new(0, 0, 0),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, index: usize) -> &dyn Stage {
        self.stages[index].as_ref()
    }

    pub fn stage_mut(&mut self, index: usize) -> &mut dyn Stage {
        self.stages[index].as_mut()
    }

    fn top(&self) -> &dyn Stage {
        self.stages[self.stages.len() - 1].as_ref()
    }

    /// Input patch of the base stage.
    pub fn base_patch(&self) -> (usize, usize) {
        self.stages.first().map_or((0, 0), |s| s.input_patch())
    }

    pub fn input_depth(&self) -> usize {
        self.stages.first().map_or(0, |s| s.input_depth())
    }

    /// Length of `central_multilayer_features`.
    pub fn feature_len(&self) -> usize {
        self.stages.iter().map(|s| s.output_depth()).sum()
    }

    /// Appends a convolution of `unit` as new top stage and regrows all stages below.
    /// Fails if the unit needs binary input that the current top does not produce, or if
    /// its input depth does not match the top's output depth.
    pub fn add_layer(&mut self, unit: Box<dyn TileUnit>, offset_x: usize, offset_y: usize) -> MlResult<()> {
        if let Some(top) = self.stages.last() {
            if unit.needs_binary_input() && !top.has_binary_output() {
                return Err(MlError::IncompatibleUnits);
            }
            let depth = unit.input_shape().depth;
            if depth != top.output_depth() {
                return Err(MlError::shape_mismatch(
                    "stacked unit input depth",
                    top.output_depth(),
                    depth,
                ));
            }
        }
        let stage = Convolution::new(unit, 1, 1, offset_x, offset_y);
        self.push_stage(Box::new(stage));
        Ok(())
    }

    /// Appends a pooling stage reducing `pool_width x pool_height` windows of the top.
    /// Pooling cannot be the base of a stack.
    pub fn add_pooling(
        &mut self,
        selector: Box<dyn PoolerSelector>,
        pool_width: usize,
        pool_height: usize,
    ) -> MlResult<()> {
        let (depth, binary) = match self.stages.last() {
            Some(top) => (top.output_depth(), top.has_binary_output()),
            None => {
                return Err(MlError::InvalidConfig(
                    "pooling cannot be the base stage".to_string(),
                ))
            }
        };
        let stage = Pooling::new(selector, pool_width, pool_height, depth).with_binary_output(binary);
        self.push_stage(Box::new(stage));
        Ok(())
    }

    fn push_stage(&mut self, stage: Box<dyn Stage>) {
        info!(
            "Adding {} stage {} with input patch {:?}",
            stage.name(),
            self.stages.len(),
            stage.input_patch()
        );
        self.stages.push(stage);
        let mut required = self.top().input_patch();
        for stage in self.stages.iter_mut().rev().skip(1) {
            stage.resize(required.0, required.1);
            required = stage.input_patch();
        }
        let (width, height) = self.base_patch();
        self.reconstruction = Tensor::new(width, height, self.input_depth());
        info!("Stack base patch is now {}x{}", width, height);
    }

    /// Places the base input patch at `(x, y)` of `input`.
    pub fn set_input(&mut self, input: &Tensor, x: usize, y: usize) {
        assert!(!self.stages.is_empty(), "Empty stack");
        self.stages[0].set_input(input, x, y);
    }

    /// Places the base input patch centered at `(center_x, center_y)` of `input`.
    pub fn center_input(&mut self, input: &Tensor, center_x: usize, center_y: usize) {
        let (width, height) = self.base_patch();
        assert!(
            center_x >= width / 2 && center_y >= height / 2,
            "Patch centered at ({}, {}) starts outside of the input",
            center_x,
            center_y
        );
        self.set_input(input, center_x - width / 2, center_y - height / 2);
    }

    /// Encodes all stages bottom-to-top. Returns the top output at `(0, 0)`, which is the
    /// whole output when the top grid is 1x1.
    pub fn forward(&mut self, input: &Tensor) -> ArrayView1<ImagePrecision> {
        assert!(!self.stages.is_empty(), "Empty stack");
        self.stages[0].encode(input);
        for k in 1..self.stages.len() {
            let (below, above) = self.stages.split_at_mut(k);
            above[0].encode(below[k - 1].output());
        }
        self.top().output().column(0, 0)
    }

    /// Reconstructs every stage top-to-bottom, each one into the output of the stage below
    /// and the base into the stack's reconstruction buffer. The external input is never
    /// touched.
    pub fn backward(&mut self) -> &Tensor {
        assert!(!self.stages.is_empty(), "Empty stack");
        for k in (1..self.stages.len()).rev() {
            let (below, above) = self.stages.split_at_mut(k);
            above[0].rebuild_into(below[k - 1].output_mut(), 0, 0, true);
        }
        self.stages[0].rebuild_into(&mut self.reconstruction, 0, 0, true);
        &self.reconstruction
    }

    pub fn reconstruction(&self) -> &Tensor {
        &self.reconstruction
    }

    /// Encodes the stages below the top and trains the top on their output.
    /// Returns the mean error of the top.
    pub fn train_top(&mut self, input: &Tensor) -> MlResult<ImagePrecision> {
        assert!(!self.stages.is_empty(), "Empty stack");
        let top = self.stages.len() - 1;
        if top == 0 {
            return self.stages[0].train(input);
        }
        self.stages[0].encode(input);
        for k in 1..top {
            let (below, above) = self.stages.split_at_mut(k);
            above[0].encode(below[k - 1].output());
        }
        let (below, above) = self.stages.split_at_mut(top);
        let error = above[0].train(below[top - 1].output())?;
        debug!("Trained top stage {}, mean error {}", top, error);
        Ok(error)
    }

    /// Back-propagates an error of the top output at `(0, 0)` through all stages, using the
    /// activations of the last `forward` on the same input. Gradients are only accumulated;
    /// `learn` applies them. Returns the mean error of the top.
    pub fn back_propagate(&mut self, input: &Tensor, top_error: ArrayView1<ImagePrecision>) -> ImagePrecision {
        assert_eq!(self.top().output_grid(), (1, 1), "Top stage has more than one position");
        let top = self.stages.len() - 1;
        self.stages[top].error_mut().set_column(0, 0, top_error);
        let mut top_mean = 0.0;
        for k in (1..self.stages.len()).rev() {
            let (below, above) = self.stages.split_at_mut(k);
            let (output, error) = below[k - 1].buffers_mut();
            let mean = above[0].back_propagate(output, Some(error));
            if k == top {
                top_mean = mean;
            }
        }
        let base_mean = self.stages[0].back_propagate(input, None);
        if top == 0 {
            top_mean = base_mean;
        }
        top_mean
    }

    pub fn learn(&mut self) -> MlResult<()> {
        for stage in self.stages.iter_mut() {
            stage.learn()?;
        }
        Ok(())
    }

    pub fn set_training(&mut self, training: bool) {
        for stage in self.stages.iter_mut() {
            stage.set_training(training);
        }
    }

    /// Concatenation of the central output column of every stage, base first.
    pub fn central_multilayer_features(&self) -> Array1<ImagePrecision> {
        let mut features = Vec::with_capacity(self.feature_len());
        for stage in self.stages.iter() {
            let (width, height) = stage.output_grid();
            features.extend(stage.output().column(width / 2, height / 2).iter().cloned());
        }
        Array::from(features)
    }

    /// Slides the base patch over `tensor` with the given stride and compares every
    /// reconstruction with the original patch, using the distances selected by `mask`.
    pub fn reconstruction_score(&mut self, tensor: &Tensor, stride: usize, mask: ScoreMask) -> ReconstructionScore {
        assert!(stride > 0, "Stride of 0 passed");
        let (width, height) = self.base_patch();
        assert!(
            tensor.width() >= width && tensor.height() >= height,
            "Tensor smaller than the base patch"
        );
        self.set_training(false);
        let mut score = ReconstructionScore::new(mask);
        for x in (0..=tensor.width() - width).step_by(stride) {
            for y in (0..=tensor.height() - height).step_by(stride) {
                self.set_input(tensor, x, y);
                self.forward(tensor);
                let original = tensor.patch(x, y, width, height);
                let reconstruction = self.backward();
                let (a, b) = (original.values(), reconstruction.values());
                score.record(
                    mask.contains(ScoreMask::EUCLIDEAN).then(|| euclidean_distance(a, b)),
                    mask.contains(ScoreMask::INVARIANT).then(|| invariant_distance(a, b)),
                    mask.contains(ScoreMask::CORRELATION).then(|| correlation_distance(a, b)),
                );
            }
        }
        self.set_training(true);
        debug!("Reconstruction score over {} positions", score.positions());
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        activation_functions::Activation,
        autoencoder::AutoEncoder,
        pooling::{MaxPooler, SoftExpLogPooler},
        tensor::PatchShape,
    };
    use rand::{rngs::StdRng, SeedableRng};

    fn unit(rng: &mut StdRng, size: usize, depth: usize, hidden: usize) -> Box<dyn TileUnit> {
        Box::new(AutoEncoder::new(
            PatchShape::new(size, size, depth),
            hidden,
            Activation::Sigmoid,
            Activation::Linear,
            rng,
        ))
    }

    fn ramp(width: usize, height: usize, depth: usize) -> Tensor {
        Tensor::from_array(Array::from_shape_fn((width, height, depth), |(x, y, z)| {
            ((x + 2 * y + z) % 7) as f32 / 7.0
        }))
    }

    #[test]
    fn test_adding_layers_resizes_below() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut stack = Stack::new();
        stack.add_layer(unit(&mut rng, 3, 1, 4), 1, 1).unwrap();
        assert_eq!(stack.base_patch(), (3, 3));
        stack.add_layer(unit(&mut rng, 2, 4, 5), 1, 1).unwrap();
        assert_eq!(stack.stage(0).output_grid(), (2, 2));
        assert_eq!(stack.base_patch(), (4, 4));
        assert_eq!(stack.feature_len(), 9);
    }

    #[test]
    fn test_offsets_in_cascade() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut stack = Stack::new();
        stack.add_layer(unit(&mut rng, 2, 1, 2), 2, 2).unwrap();
        stack.add_layer(unit(&mut rng, 3, 2, 2), 1, 1).unwrap();
        // base grid 3x3 with offset 2 and unit width 2
        assert_eq!(stack.base_patch(), (6, 6));
    }

    #[test]
    fn test_binary_compatibility() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut stack = Stack::new();
        let real = AutoEncoder::new(
            PatchShape::new(2, 2, 1),
            3,
            Activation::SoftSign,
            Activation::Linear,
            &mut rng,
        );
        stack.add_layer(Box::new(real), 1, 1).unwrap();
        let binary = AutoEncoder::new(
            PatchShape::new(1, 1, 3),
            2,
            Activation::Sigmoid,
            Activation::Sigmoid,
            &mut rng,
        )
        .with_binary_input(true);
        assert!(matches!(
            stack.add_layer(Box::new(binary), 1, 1),
            Err(MlError::IncompatibleUnits)
        ));
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_depth_mismatch_is_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut stack = Stack::new();
        stack.add_layer(unit(&mut rng, 2, 1, 3), 1, 1).unwrap();
        let result = stack.add_layer(unit(&mut rng, 2, 2, 3), 1, 1);
        assert!(matches!(result, Err(MlError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_forward_backward_and_features() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut stack = Stack::new();
        stack.add_layer(unit(&mut rng, 2, 1, 3), 1, 1).unwrap();
        stack.add_layer(unit(&mut rng, 2, 3, 2), 1, 1).unwrap();
        let input = ramp(5, 5, 1);
        let before = input.clone();
        stack.set_input(&input, 1, 1);
        assert_eq!(stack.forward(&input).len(), 2);

        let features = stack.central_multilayer_features();
        assert_eq!(features.len(), 5);
        assert_eq!(features[3], stack.stage(1).output().get(0, 0, 0));
        assert_eq!(features[0], stack.stage(0).output().get(1, 1, 0));

        let reconstruction = stack.backward();
        assert_eq!(reconstruction.shape(), PatchShape::new(3, 3, 1));
        // overlapping 2x2 tiles on a 3x3 patch cover the center four times
        assert_eq!(reconstruction.weight(1, 1, 0), 4.0);
        assert_eq!(input, before);
    }

    #[test]
    fn test_pooling_stage_in_stack() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut stack = Stack::new();
        assert!(stack.add_pooling(Box::new(MaxPooler), 2, 2).is_err());
        stack.add_layer(unit(&mut rng, 2, 1, 3), 1, 1).unwrap();
        stack.add_pooling(Box::new(MaxPooler), 2, 2).unwrap();
        assert!(stack.stage(0).is_trainable());
        assert!(!stack.stage(1).is_trainable());
        assert_eq!(stack.stage(0).output_grid(), (2, 2));
        assert_eq!(stack.base_patch(), (3, 3));
        assert!(stack.stage(1).has_binary_output());

        let input = ramp(3, 3, 1);
        stack.set_input(&input, 0, 0);
        let pooled = stack.forward(&input).to_owned();
        let below = stack.stage(0).output();
        for z in 0..3 {
            let max = (0..2)
                .flat_map(|x| (0..2).map(move |y| (x, y)))
                .map(|(x, y)| below.get(x, y, z))
                .fold(f32::NEG_INFINITY, f32::max);
            assert_eq!(pooled[z], max);
        }
        stack.backward();
    }

    #[test]
    fn test_center_input() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut stack = Stack::new();
        stack.add_layer(unit(&mut rng, 3, 1, 2), 1, 1).unwrap();
        let input = ramp(7, 7, 1);

        stack.center_input(&input, 3, 3);
        assert_eq!(stack.stage(0).input_origin(), (2, 2));
        let centered = stack.forward(&input).to_owned();

        stack.set_input(&input, 2, 2);
        assert_eq!(stack.forward(&input).to_owned(), centered);

        // even patches put the center right of the middle
        stack.add_layer(unit(&mut rng, 2, 2, 2), 1, 1).unwrap();
        assert_eq!(stack.base_patch(), (4, 4));
        stack.center_input(&input, 2, 3);
        assert_eq!(stack.stage(0).input_origin(), (0, 1));
    }

    #[test]
    #[should_panic]
    fn test_center_input_outside() {
        let mut rng = StdRng::seed_from_u64(10);
        let mut stack = Stack::new();
        stack.add_layer(unit(&mut rng, 3, 1, 2), 1, 1).unwrap();
        stack.center_input(&ramp(7, 7, 1), 0, 3);
    }

    #[test]
    fn test_back_propagation_learns_pooling_temperature() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut stack = Stack::new();
        let mut base = AutoEncoder::new(
            PatchShape::new(2, 2, 1),
            3,
            Activation::Sigmoid,
            Activation::Linear,
            &mut rng,
        );
        // frozen, so only the temperature can change the pooled output
        base.set_learning_rate(0.0);
        stack.add_layer(Box::new(base), 1, 1).unwrap();
        stack
            .add_pooling(Box::new(SoftExpLogPooler::default()), 2, 2)
            .unwrap();
        assert_eq!(stack.base_patch(), (3, 3));

        let input = ramp(3, 3, 1);
        stack.set_input(&input, 0, 0);
        let before = stack.forward(&input).sum();
        for _ in 0..5 {
            let output = stack.forward(&input).to_owned();
            // pull every channel towards a far away target
            stack.back_propagate(&input, output.mapv(|o| o - 100.0).view());
            stack.learn().unwrap();
        }
        let after = stack.forward(&input).sum();
        // a lower temperature moves the soft maximum up, away from the window maximum
        assert!(after > before, "{} !> {}", after, before);
    }

    #[test]
    fn test_greedy_training_reduces_error() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut stack = Stack::new();
        let mut base = AutoEncoder::new(
            PatchShape::new(2, 2, 1),
            4,
            Activation::SoftSign,
            Activation::Linear,
            &mut rng,
        );
        base.set_learning_rate(0.05);
        stack.add_layer(Box::new(base), 1, 1).unwrap();
        let input = ramp(3, 3, 1);
        stack.set_input(&input, 0, 0);
        let first = stack.train_top(&input).unwrap();
        let mut last = first;
        for _ in 0..100 {
            last = stack.train_top(&input).unwrap();
        }
        assert!(last < first, "{} !< {}", last, first);
    }

    #[test]
    fn test_supervised_back_propagation_moves_output() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut stack = Stack::new();
        stack.add_layer(unit(&mut rng, 2, 1, 3), 1, 1).unwrap();
        stack.add_layer(unit(&mut rng, 2, 3, 1), 1, 1).unwrap();
        let input = ramp(3, 3, 1);
        stack.set_input(&input, 0, 0);
        let before = stack.forward(&input)[0];
        for _ in 0..20 {
            let output = stack.forward(&input)[0];
            // squared error towards 1
            stack.back_propagate(&input, array![output - 1.0].view());
            stack.learn().unwrap();
        }
        let after = stack.forward(&input)[0];
        assert!(after > before, "{} !> {}", after, before);
    }

    #[test]
    fn test_reconstruction_score_positions() {
        let mut rng = StdRng::seed_from_u64(8);
        let mut stack = Stack::new();
        stack.add_layer(unit(&mut rng, 2, 1, 3), 1, 1).unwrap();
        let input = ramp(6, 5, 1);
        let score = stack.reconstruction_score(&input, 2, ScoreMask::EUCLIDEAN | ScoreMask::CORRELATION);
        // x in {0, 2, 4}, y in {0, 2}
        assert_eq!(score.positions(), 6);
        assert!(score.euclidean().is_some());
        assert!(score.invariant().is_none());
        assert!(score.correlation().is_some());
    }
}
