use crate::{
    autoencoder::TileUnit,
    tensor::{PatchShape, Tensor},
    ImagePrecision, MlResult,
};
use log::{debug, info, trace, warn};
use ndarray::*;

/// One spatial stage of a stack: reads windows of an input tensor and writes a grid of
/// output columns. Implemented by [`Convolution`] and by
/// [`Pooling`](crate::pooling::Pooling).
///
/// Stages never hold on to their input. Every pass that reads the input takes it as an
/// argument, together with the placement set by `set_input`.
pub trait Stage {
    /// Spatial extent of the input read by one `encode`.
    fn input_patch(&self) -> (usize, usize);
    fn input_depth(&self) -> usize;
    /// Number of output positions in x and y.
    fn output_grid(&self) -> (usize, usize);
    fn output_depth(&self) -> usize;

    /// Regrows the output grid, replacing the output tensor and its error buffer.
    fn resize(&mut self, out_width: usize, out_height: usize);

    fn output(&self) -> &Tensor;
    fn output_mut(&mut self) -> &mut Tensor;
    /// Pending error of the output, same shape as the output.
    fn error_mut(&mut self) -> &mut Tensor;
    /// Output and output error at once, for handing errors down a stack.
    fn buffers_mut(&mut self) -> (&Tensor, &mut Tensor);

    /// Placement of the input patch on the tensors passed to later calls.
    /// Panics if the patch does not fit.
    fn set_input(&mut self, input: &Tensor, x: usize, y: usize);
    fn input_origin(&self) -> (usize, usize);

    /// Forward pass over all output positions.
    fn encode(&mut self, input: &Tensor);

    /// Reconstructs the input patch from the current output into `target`, with the patch
    /// origin at `(x, y)`. With `clear_first` the target is zeroed before and overlap
    /// normalized after.
    fn rebuild_into(&mut self, target: &mut Tensor, x: usize, y: usize, clear_first: bool);

    /// One unsupervised training pass over all positions, including the update.
    /// Returns the mean error over the positions.
    fn train(&mut self, input: &Tensor) -> MlResult<ImagePrecision>;

    /// Back-propagates the pending output error through every position and clears it.
    /// When `input_error` is given (a tensor shaped like the input) the error of the
    /// input is added into it. Returns the mean error over the positions.
    fn back_propagate(&mut self, input: &Tensor, input_error: Option<&mut Tensor>) -> ImagePrecision;

    fn learn(&mut self) -> MlResult<()>;

    /// Whether `train` updates anything. Stages without unsupervised parameters only
    /// encode there.
    fn is_trainable(&self) -> bool {
        true
    }

    fn needs_binary_input(&self) -> bool {
        false
    }

    fn has_binary_output(&self) -> bool {
        false
    }

    fn set_training(&mut self, _training: bool) {}

    fn name(&self) -> &'static str;
}

/// Tiles one trainable unit across its input. All output positions share the unit, and
/// with it one set of weights.
///
/// The input window of position `(ox, oy)` starts at
/// `(input_x + ox * offset_x, input_y + oy * offset_y)`, so the stage reads an input patch of
/// `(out_width - 1) * offset_x + unit width` by `(out_height - 1) * offset_y + unit height`.
pub struct Convolution {
    unit: Box<dyn TileUnit>,
    out_width: usize,
    out_height: usize,
    offset_x: usize,
    offset_y: usize,
    input_x: usize,
    input_y: usize,
    output: Tensor,
    error: Tensor,
}

impl Convolution {
    pub fn new(
        unit: Box<dyn TileUnit>,
        out_width: usize,
        out_height: usize,
        offset_x: usize,
        offset_y: usize,
    ) -> Convolution {
        assert!(offset_x > 0 && offset_y > 0, "Offsets of 0 passed");
        assert!(out_width > 0 && out_height > 0, "Empty output grid requested");
        let depth = unit.output_size();
        Convolution {
            unit,
            out_width,
            out_height,
            offset_x,
            offset_y,
            input_x: 0,
            input_y: 0,
            output: Tensor::new(out_width, out_height, depth),
            error: Tensor::new(out_width, out_height, depth),
        }
    }

    pub fn unit(&self) -> &dyn TileUnit {
        self.unit.as_ref()
    }

    pub fn unit_mut(&mut self) -> &mut dyn TileUnit {
        self.unit.as_mut()
    }

    pub fn offsets(&self) -> (usize, usize) {
        (self.offset_x, self.offset_y)
    }

    pub fn input_patch_width(&self) -> usize {
        (self.out_width - 1) * self.offset_x + self.unit.input_shape().width
    }

    pub fn input_patch_height(&self) -> usize {
        (self.out_height - 1) * self.offset_y + self.unit.input_shape().height
    }

    /// Places the input patch centered at `(center_x, center_y)`.
    pub fn center_input(&mut self, input: &Tensor, center_x: usize, center_y: usize) {
        let (width, height) = self.input_patch();
        assert!(
            center_x >= width / 2 && center_y >= height / 2,
            "Patch centered at ({}, {}) starts outside of the input",
            center_x,
            center_y
        );
        self.set_input(input, center_x - width / 2, center_y - height / 2);
    }

    fn window_origin(&self, x: usize, y: usize, ox: usize, oy: usize) -> (usize, usize) {
        (x + ox * self.offset_x, y + oy * self.offset_y)
    }

    fn check_input(&self, input: &Tensor) {
        let (width, height) = self.input_patch();
        assert!(
            input.fits(self.input_x, self.input_y, width, height),
            "Input patch {}x{} at ({}, {}) does not fit into a {}x{} tensor",
            width,
            height,
            self.input_x,
            self.input_y,
            input.width(),
            input.height()
        );
        assert_eq!(
            input.depth(),
            self.input_depth(),
            "Input depth does not match the unit's input depth"
        );
    }

    fn positions(&self) -> impl Iterator<Item = (usize, usize)> {
        let out_height = self.out_height;
        (0..self.out_width).flat_map(move |ox| (0..out_height).map(move |oy| (ox, oy)))
    }

    /// Reconstructs the input from the current output into `target` at the placement
    /// set by `set_input`.
    pub fn rebuild_input(&mut self, target: &mut Tensor, clear_first: bool) {
        let (x, y) = (self.input_x, self.input_y);
        self.rebuild_into(target, x, y, clear_first);
    }

    /// One supervised training pass: every position trains on the same label.
    pub fn train_labeled(&mut self, input: &Tensor, label: usize) -> MlResult<ImagePrecision> {
        self.check_input(input);
        let shape = self.unit.input_shape();
        let mut total = 0.0;
        for (ox, oy) in self.positions().collect::<Vec<_>>() {
            let (wx, wy) = self.window_origin(self.input_x, self.input_y, ox, oy);
            let window = input.patch_vector(wx, wy, shape);
            total += self.unit.train_labeled(window.view(), label);
            self.output.set_column(ox, oy, self.unit.encoded());
        }
        self.unit.learn()?;
        let error = total / (self.out_width * self.out_height) as ImagePrecision;
        debug!("Labeled convolution training pass, label {}, mean error {}", label, error);
        Ok(error)
    }
}

impl Stage for Convolution {
    fn input_patch(&self) -> (usize, usize) {
        (self.input_patch_width(), self.input_patch_height())
    }

    fn input_depth(&self) -> usize {
        self.unit.input_shape().depth
    }

    fn output_grid(&self) -> (usize, usize) {
        (self.out_width, self.out_height)
    }

    fn output_depth(&self) -> usize {
        self.unit.output_size()
    }

    fn resize(&mut self, out_width: usize, out_height: usize) {
        assert!(out_width > 0 && out_height > 0, "Empty output grid requested");
        if (out_width, out_height) != (self.out_width, self.out_height) {
            info!(
                "Resizing convolution output grid from {}x{} to {}x{}",
                self.out_width, self.out_height, out_width, out_height
            );
        }
        let depth = self.unit.output_size();
        self.out_width = out_width;
        self.out_height = out_height;
        self.output = Tensor::new(out_width, out_height, depth);
        self.error = Tensor::new(out_width, out_height, depth);
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
        let shape = self.unit.input_shape();
        for (ox, oy) in self.positions().collect::<Vec<_>>() {
            let (wx, wy) = self.window_origin(self.input_x, self.input_y, ox, oy);
            let window = input.patch_vector(wx, wy, shape);
            self.unit.encode(window.view());
            self.output.set_column(ox, oy, self.unit.encoded());
            trace!("Encoded tile ({}, {}) from window at ({}, {})", ox, oy, wx, wy);
        }
    }

    fn rebuild_into(&mut self, target: &mut Tensor, x: usize, y: usize, clear_first: bool) {
        let shape = self.unit.input_shape();
        if clear_first {
            target.clear();
        }
        for (ox, oy) in self.positions().collect::<Vec<_>>() {
            let code = self.output.column(ox, oy).to_owned();
            let (wx, wy) = self.window_origin(x, y, ox, oy);
            let reconstruction = self.unit.decode(code.view());
            if reconstruction.iter().any(|v| !v.is_finite()) {
                warn!("Non-finite reconstruction of tile ({}, {})", ox, oy);
            }
            target.add_patch(wx, wy, shape, reconstruction);
        }
        if clear_first {
            target.normalize_weights();
        }
    }

    fn train(&mut self, input: &Tensor) -> MlResult<ImagePrecision> {
        self.check_input(input);
        let shape = self.unit.input_shape();
        let mut total = 0.0;
        for (ox, oy) in self.positions().collect::<Vec<_>>() {
            let (wx, wy) = self.window_origin(self.input_x, self.input_y, ox, oy);
            let window = input.patch_vector(wx, wy, shape);
            let error = self.unit.train(window.view());
            self.output.set_column(ox, oy, self.unit.encoded());
            trace!("Trained tile ({}, {}), error {}", ox, oy, error);
            total += error;
        }
        self.unit.learn()?;
        let error = total / (self.out_width * self.out_height) as ImagePrecision;
        debug!("Convolution training pass, mean error {}", error);
        Ok(error)
    }

    fn back_propagate(&mut self, input: &Tensor, mut input_error: Option<&mut Tensor>) -> ImagePrecision {
        self.check_input(input);
        let shape = self.unit.input_shape();
        let mut total = 0.0;
        for (ox, oy) in self.positions().collect::<Vec<_>>() {
            let (wx, wy) = self.window_origin(self.input_x, self.input_y, ox, oy);
            // the unit only remembers the last tile, so each tile is recomputed first
            let window = input.patch_vector(wx, wy, shape);
            self.unit.encode(window.view());
            let error = self.error.column(ox, oy).to_owned();
            total += self.unit.back_propagate(error.view());
            if let Some(target) = input_error.as_mut() {
                target.accumulate_patch(wx, wy, shape, self.unit.input_error());
            }
        }
        self.error.clear();
        total / (self.out_width * self.out_height) as ImagePrecision
    }

    fn learn(&mut self) -> MlResult<()> {
        self.unit.learn()
    }

    fn needs_binary_input(&self) -> bool {
        self.unit.needs_binary_input()
    }

    fn has_binary_output(&self) -> bool {
        self.unit.has_binary_output()
    }

    fn set_training(&mut self, training: bool) {
        self.unit.set_training(training);
    }

    fn name(&self) -> &'static str {
        "convolution"
    }
}
