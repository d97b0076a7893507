//! Units that a convolution stage tiles across its input.
//!
//! [`TileUnit`] is what a [`Convolution`](crate::convolutions::Convolution) needs from the
//! thing it repeats: a patch shape, a forward pass and, depending on the unit, reconstruction
//! and training. [`AutoEncoder`] implements all of it; [`LayerUnit`] wraps any [`Layer`] and
//! only supports encoding and back-propagation.
use crate::{
    activation_functions::Activation,
    config::UnitConfig,
    fully_connected::FeedforwardLayer,
    layer::Layer,
    tensor::PatchShape,
    ImagePrecision, MlError, MlResult, WeightPrecision,
};
use log::trace;
use ndarray::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

pub trait TileUnit {
    /// Shape of the input window.
    fn input_shape(&self) -> PatchShape;
    fn output_size(&self) -> usize;

    /// Forward pass on a flattened window.
    fn encode(&mut self, input: ArrayView1<ImagePrecision>);
    /// Output of the last `encode`.
    fn encoded(&self) -> ArrayView1<ImagePrecision>;

    /// Reconstructs a flattened window from a code.
    fn decode(&mut self, _code: ArrayView1<ImagePrecision>) -> ArrayView1<ImagePrecision> {
        unimplemented!("This unit cannot reconstruct its input")
    }

    /// Accumulates the gradients of one unsupervised step on a window and returns the
    /// reconstruction error. Parameters only change in `learn`.
    fn train(&mut self, _input: ArrayView1<ImagePrecision>) -> ImagePrecision {
        unimplemented!("This unit does not support unsupervised training")
    }

    /// As `train`, with an additional label-aware loss.
    fn train_labeled(&mut self, _input: ArrayView1<ImagePrecision>, _label: usize) -> ImagePrecision {
        unimplemented!("This unit does not support supervised training")
    }

    /// Back-propagates an error on the output of the last `encode` and returns its mean
    /// absolute value. Afterwards `input_error` holds the error of the window.
    fn back_propagate(&mut self, output_error: ArrayView1<ImagePrecision>) -> ImagePrecision;
    fn input_error(&self) -> ArrayView1<ImagePrecision>;

    fn learn(&mut self) -> MlResult<()>;

    fn needs_binary_input(&self) -> bool {
        false
    }

    fn has_binary_output(&self) -> bool {
        false
    }

    fn set_training(&mut self, _training: bool) {}
}

/// Any layer used as tiled unit.
pub struct LayerUnit {
    layer: Box<dyn Layer>,
    shape: PatchShape,
}

impl LayerUnit {
    pub fn new(mut layer: Box<dyn Layer>, shape: PatchShape) -> LayerUnit {
        assert_eq!(
            layer.input_size(),
            shape.len(),
            "Layer input size does not match the patch shape"
        );
        layer.set_propagate_error(true);
        LayerUnit { layer, shape }
    }

    pub fn layer(&self) -> &dyn Layer {
        self.layer.as_ref()
    }
}

impl TileUnit for LayerUnit {
    fn input_shape(&self) -> PatchShape {
        self.shape
    }

    fn output_size(&self) -> usize {
        self.layer.output_size()
    }

    fn encode(&mut self, input: ArrayView1<ImagePrecision>) {
        self.layer.compute(input);
    }

    fn encoded(&self) -> ArrayView1<ImagePrecision> {
        self.layer.output()
    }

    fn back_propagate(&mut self, output_error: ArrayView1<ImagePrecision>) -> ImagePrecision {
        self.layer.add_errors(output_error);
        self.layer.back_propagate()
    }

    fn input_error(&self) -> ArrayView1<ImagePrecision> {
        self.layer
            .input_error()
            .expect("error propagation is enabled on construction")
    }

    fn learn(&mut self) -> MlResult<()> {
        self.layer.learn()
    }

    fn has_binary_output(&self) -> bool {
        self.layer.has_binary_output()
    }

    fn set_training(&mut self, training: bool) {
        self.layer.set_training(training);
    }
}

/// Decoder reusing the encoder weights transposed, with its own bias.
#[derive(Debug, Clone)]
struct TiedDecoder {
    bias: Array1<WeightPrecision>,
    bias_gradient: Array1<WeightPrecision>,
    activation: Activation,
    code: Array1<ImagePrecision>,
    weighted_sum: Array1<ImagePrecision>,
    output: Array1<ImagePrecision>,
    error: Array1<ImagePrecision>,
}

impl TiedDecoder {
    fn new(size: usize, code_size: usize, activation: Activation) -> TiedDecoder {
        assert!(
            activation != Activation::Softmax,
            "Tied decoders do not support softmax"
        );
        TiedDecoder {
            bias: Array::zeros(size),
            bias_gradient: Array::zeros(size),
            activation,
            code: Array::zeros(code_size),
            weighted_sum: Array::zeros(size),
            output: Array::zeros(size),
            error: Array::zeros(size),
        }
    }

    fn compute(&mut self, encoder: &FeedforwardLayer, code: ArrayView1<ImagePrecision>) {
        self.code.assign(&code);
        self.weighted_sum = encoder.weights().dot(&code) + &self.bias;
        let activation = self.activation;
        self.output = self.weighted_sum.mapv(|s| activation.activate(s));
    }

    /// Accumulates gradients into the shared weights and returns the error of the code.
    fn back_propagate(&mut self, encoder: &mut FeedforwardLayer) -> (ImagePrecision, Array1<ImagePrecision>) {
        let mean_error = self.error.mapv(|e| e.abs()).mean().unwrap_or(0.0);
        let activation = self.activation;
        let delta = Zip::from(&self.weighted_sum)
            .and(&self.output)
            .and(&self.error)
            .map_collect(|&s, &y, &e| e * activation.derivative(s, y));
        encoder.accumulate_transposed_gradient(self.code.view(), delta.view());
        self.bias_gradient += &delta;
        let code_error = delta.dot(&encoder.weights());
        self.error.fill(0.0);
        (mean_error, code_error)
    }

    fn learn(&mut self, learning_rate: WeightPrecision) -> MlResult<()> {
        self.bias.scaled_add(-learning_rate, &self.bias_gradient);
        self.bias_gradient.fill(0.0);
        if self.bias.iter().any(|b| b.is_nan()) {
            return Err(MlError::NumericalDegeneration("tied decoder bias"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Decoder {
    Separate(FeedforwardLayer),
    Tied(TiedDecoder),
}

/// Input corruption of denoising auto-encoders: every input is zeroed with probability `rate`.
#[derive(Debug, Clone)]
struct Denoising {
    rate: ImagePrecision,
    rng: StdRng,
}

/// Auto-encoder trained to reconstruct its input window through a hidden code.
///
/// The first `num_classes` code units can additionally be trained towards a one-hot label
/// (`train_labeled`), which makes the unsupervised code label-aware.
#[derive(Debug, Clone)]
pub struct AutoEncoder {
    shape: PatchShape,
    encoder: FeedforwardLayer,
    decoder: Decoder,
    denoising: Option<Denoising>,
    needs_binary_input: bool,
    num_classes: usize,
    label_weight: ImagePrecision,
    training: bool,
    /// Input error of the last back-propagation
    input_error: Array1<ImagePrecision>,
}

impl AutoEncoder {
    /// Auto-encoder with separate encoder and decoder layers.
    pub fn new<R: Rng + ?Sized>(
        shape: PatchShape,
        hidden: usize,
        encoder_activation: Activation,
        decoder_activation: Activation,
        rng: &mut R,
    ) -> AutoEncoder {
        let encoder = FeedforwardLayer::new(shape.len(), hidden, encoder_activation, rng);
        let mut decoder = FeedforwardLayer::new(hidden, shape.len(), decoder_activation, rng);
        decoder.set_propagate_error(true);
        AutoEncoder::from_layers(shape, encoder, Decoder::Separate(decoder))
    }

    /// Auto-encoder using one weight matrix in both directions.
    pub fn tied<R: Rng + ?Sized>(
        shape: PatchShape,
        hidden: usize,
        encoder_activation: Activation,
        decoder_activation: Activation,
        rng: &mut R,
    ) -> AutoEncoder {
        let encoder = FeedforwardLayer::new(shape.len(), hidden, encoder_activation, rng);
        let decoder = TiedDecoder::new(shape.len(), hidden, decoder_activation);
        AutoEncoder::from_layers(shape, encoder, Decoder::Tied(decoder))
    }

    /// Auto-encoder from existing encoder and decoder layers.
    pub fn from_encoder_decoder(
        shape: PatchShape,
        encoder: FeedforwardLayer,
        mut decoder: FeedforwardLayer,
    ) -> MlResult<AutoEncoder> {
        if encoder.input_size() != shape.len() || decoder.output_size() != shape.len() {
            return Err(MlError::shape_mismatch(
                "auto-encoder layers",
                shape.len(),
                (encoder.input_size(), decoder.output_size()),
            ));
        }
        if encoder.output_size() != decoder.input_size() {
            return Err(MlError::shape_mismatch(
                "auto-encoder code",
                encoder.output_size(),
                decoder.input_size(),
            ));
        }
        decoder.set_propagate_error(true);
        Ok(AutoEncoder::from_layers(shape, encoder, Decoder::Separate(decoder)))
    }

    fn from_layers(shape: PatchShape, mut encoder: FeedforwardLayer, decoder: Decoder) -> AutoEncoder {
        encoder.set_propagate_error(true);
        AutoEncoder {
            shape,
            encoder,
            decoder,
            denoising: None,
            needs_binary_input: false,
            num_classes: 0,
            label_weight: 1.0,
            training: true,
            input_error: Array::zeros(shape.len()),
        }
    }

    /// Builds an auto-encoder from its configuration.
    pub fn from_config<R: Rng + ?Sized>(config: &UnitConfig, rng: &mut R) -> AutoEncoder {
        let shape = PatchShape::new(config.patch_width, config.patch_height, config.depth);
        let mut unit = if config.tied {
            AutoEncoder::tied(shape, config.hidden, config.encoder, config.decoder, rng)
        } else {
            AutoEncoder::new(shape, config.hidden, config.encoder, config.decoder, rng)
        };
        let layer = &config.layer;
        let decay = layer.decay.unwrap_or_else(|| unit.encoder.decay());
        unit.encoder = unit.encoder.with_decay(decay).with_dropout(layer.dropout, rng);
        if let Some(cost) = layer.activation_cost {
            unit.encoder = unit.encoder.with_activation_cost(cost);
        }
        unit.set_learning_rate(layer.learning_rate);
        if config.denoising > 0.0 {
            unit = unit.with_denoising(config.denoising, rng);
        }
        unit.with_binary_input(config.binary_input)
            .with_classes(config.num_classes, config.label_weight)
    }

    /// Makes this a denoising auto-encoder, corrupting inputs with the given rate.
    pub fn with_denoising<R: Rng + ?Sized>(mut self, rate: ImagePrecision, rng: &mut R) -> Self {
        assert!((0.0..1.0).contains(&rate), "Corruption rate must lie in [0, 1)");
        self.denoising = Some(Denoising {
            rate,
            rng: StdRng::seed_from_u64(rng.gen()),
        });
        self
    }

    pub fn with_binary_input(mut self, needs_binary_input: bool) -> Self {
        self.needs_binary_input = needs_binary_input;
        self
    }

    /// Reserves the first `num_classes` code units for label-aware training.
    pub fn with_classes(mut self, num_classes: usize, label_weight: ImagePrecision) -> Self {
        assert!(
            num_classes <= self.encoder.output_size(),
            "More classes than code units"
        );
        self.num_classes = num_classes;
        self.label_weight = label_weight;
        self
    }

    pub fn set_learning_rate(&mut self, learning_rate: WeightPrecision) {
        self.encoder.set_learning_rate(learning_rate);
        if let Decoder::Separate(decoder) = &mut self.decoder {
            decoder.set_learning_rate(learning_rate);
        }
    }

    pub fn encoder(&self) -> &FeedforwardLayer {
        &self.encoder
    }

    /// The separate decoder layer, `None` for tied auto-encoders.
    pub fn decoder(&self) -> Option<&FeedforwardLayer> {
        match &self.decoder {
            Decoder::Separate(decoder) => Some(decoder),
            Decoder::Tied(_) => None,
        }
    }

    pub fn is_tied(&self) -> bool {
        matches!(self.decoder, Decoder::Tied(_))
    }

    pub fn is_denoising(&self) -> bool {
        self.denoising.is_some()
    }

    /// Last reconstruction.
    pub fn reconstruction(&self) -> ArrayView1<ImagePrecision> {
        match &self.decoder {
            Decoder::Separate(decoder) => decoder.output(),
            Decoder::Tied(decoder) => decoder.output.view(),
        }
    }

    fn corrupt(&mut self, input: ArrayView1<ImagePrecision>) -> Array1<ImagePrecision> {
        match (self.denoising.as_mut(), self.training) {
            (Some(denoising), true) => {
                let rate = denoising.rate;
                let rng = &mut denoising.rng;
                input.mapv(|x| if rng.gen::<ImagePrecision>() < rate { 0.0 } else { x })
            }
            _ => input.to_owned(),
        }
    }

    fn run_decoder(&mut self) {
        let encoder = &self.encoder;
        match &mut self.decoder {
            Decoder::Separate(decoder) => decoder.compute(encoder.output()),
            Decoder::Tied(decoder) => decoder.compute(encoder, encoder.output()),
        }
    }

    /// Reconstruction step shared by both training modes: encodes a (possibly corrupted)
    /// input, decodes it and back-propagates the error against the clean input into the
    /// decoder. Leaves the code error pending in the encoder.
    fn reconstruct_and_propagate(&mut self, input: ArrayView1<ImagePrecision>) -> ImagePrecision {
        let corrupted = self.corrupt(input);
        self.encoder.compute(corrupted.view());
        self.run_decoder();

        match &mut self.decoder {
            Decoder::Separate(decoder) => {
                for (index, &expected) in input.iter().enumerate() {
                    decoder.set_expected(index, expected);
                }
                let error = decoder.back_propagate();
                let code_error = decoder
                    .input_error()
                    .expect("decoder propagates its error");
                self.encoder.add_errors(code_error);
                error
            }
            Decoder::Tied(decoder) => {
                decoder.error.assign(&(&decoder.output - &input));
                let (error, code_error) = decoder.back_propagate(&mut self.encoder);
                self.encoder.add_errors(code_error.view());
                error
            }
        }
    }

    fn finish_encoder(&mut self) {
        self.encoder.back_propagate();
        if let Some(input_error) = self.encoder.input_error() {
            self.input_error.assign(&input_error);
        }
    }

    /// One unsupervised step including the parameter update.
    pub fn train_step(&mut self, input: ArrayView1<ImagePrecision>) -> MlResult<ImagePrecision> {
        let error = self.train(input);
        self.learn()?;
        Ok(error)
    }
}

impl TileUnit for AutoEncoder {
    fn input_shape(&self) -> PatchShape {
        self.shape
    }

    fn output_size(&self) -> usize {
        self.encoder.output_size()
    }

    fn encode(&mut self, input: ArrayView1<ImagePrecision>) {
        self.encoder.compute(input);
    }

    fn encoded(&self) -> ArrayView1<ImagePrecision> {
        self.encoder.output()
    }

    fn decode(&mut self, code: ArrayView1<ImagePrecision>) -> ArrayView1<ImagePrecision> {
        match &mut self.decoder {
            Decoder::Separate(decoder) => decoder.compute(code),
            Decoder::Tied(decoder) => decoder.compute(&self.encoder, code),
        }
        self.reconstruction()
    }

    fn train(&mut self, input: ArrayView1<ImagePrecision>) -> ImagePrecision {
        let error = self.reconstruct_and_propagate(input);
        self.finish_encoder();
        trace!("Auto-encoder reconstruction error {}", error);
        error
    }

    fn train_labeled(&mut self, input: ArrayView1<ImagePrecision>, label: usize) -> ImagePrecision {
        assert!(
            label < self.num_classes,
            "Label {} outside of the {} reserved code units",
            label,
            self.num_classes
        );
        let error = self.reconstruct_and_propagate(input);
        let code = self.encoder.output().to_owned();
        for class in 0..self.num_classes {
            let target = if class == label { 1.0 } else { 0.0 };
            self.encoder
                .add_error(class, self.label_weight * (code[class] - target));
        }
        self.finish_encoder();
        error
    }

    fn back_propagate(&mut self, output_error: ArrayView1<ImagePrecision>) -> ImagePrecision {
        self.encoder.add_errors(output_error);
        let error = self.encoder.back_propagate();
        if let Some(input_error) = self.encoder.input_error() {
            self.input_error.assign(&input_error);
        }
        error
    }

    fn input_error(&self) -> ArrayView1<ImagePrecision> {
        self.input_error.view()
    }

    fn learn(&mut self) -> MlResult<()> {
        self.encoder.learn()?;
        match &mut self.decoder {
            Decoder::Separate(decoder) => decoder.learn(),
            Decoder::Tied(decoder) => decoder.learn(self.encoder.learning_rate()),
        }
    }

    fn needs_binary_input(&self) -> bool {
        self.needs_binary_input
    }

    fn has_binary_output(&self) -> bool {
        self.encoder.has_binary_output()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.encoder.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> Array1<f32> {
        array![0.2, -0.4, 0.6, 0.1, -0.3, 0.5]
    }

    fn train_error(unit: &mut AutoEncoder, steps: usize) -> (f32, f32) {
        let input = sample_input();
        let first = unit.train_step(input.view()).unwrap();
        let mut last = first;
        for _ in 0..steps {
            last = unit.train_step(input.view()).unwrap();
        }
        (first, last)
    }

    #[test]
    fn test_reconstruction_improves() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut unit = AutoEncoder::new(
            PatchShape::new(3, 2, 1),
            4,
            Activation::SoftSign,
            Activation::Linear,
            &mut rng,
        );
        unit.set_learning_rate(0.05);
        let (first, last) = train_error(&mut unit, 200);
        assert!(last < first, "{} !< {}", last, first);
    }

    #[test]
    fn test_tied_reconstruction_improves() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut unit = AutoEncoder::tied(
            PatchShape::new(3, 2, 1),
            4,
            Activation::SoftSign,
            Activation::Linear,
            &mut rng,
        );
        unit.set_learning_rate(0.05);
        assert!(unit.is_tied());
        let (first, last) = train_error(&mut unit, 200);
        assert!(last < first, "{} !< {}", last, first);
    }

    #[test]
    fn test_decode_matches_training_reconstruction() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut unit = AutoEncoder::new(
            PatchShape::new(6, 1, 1),
            3,
            Activation::Sigmoid,
            Activation::Linear,
            &mut rng,
        );
        let input = sample_input();
        unit.encode(input.view());
        let code = unit.encoded().to_owned();
        let decoded = unit.decode(code.view()).to_owned();
        assert_eq!(decoded.len(), 6);
        assert!(unit.has_binary_output());
    }

    #[test]
    fn test_label_units_move_towards_label() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut unit = AutoEncoder::new(
            PatchShape::new(6, 1, 1),
            4,
            Activation::Sigmoid,
            Activation::Linear,
            &mut rng,
        )
        .with_classes(2, 2.0);
        unit.set_learning_rate(0.2);
        let input = sample_input();
        unit.encode(input.view());
        let before = unit.encoded()[1] - unit.encoded()[0];
        for _ in 0..100 {
            unit.train_labeled(input.view(), 1);
            unit.learn().unwrap();
        }
        unit.encode(input.view());
        let after = unit.encoded()[1] - unit.encoded()[0];
        assert!(after > before);
    }

    #[test]
    fn test_denoising_corrupts_only_while_training() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut unit = AutoEncoder::new(
            PatchShape::new(6, 1, 1),
            2,
            Activation::SoftSign,
            Activation::Linear,
            &mut rng,
        )
        .with_denoising(0.5, &mut rng);
        assert!(unit.is_denoising());
        let input = Array::ones(6);
        unit.set_training(false);
        assert_eq!(unit.corrupt(input.view()), input);
        unit.set_training(true);
        let corrupted = unit.corrupt(input.view());
        assert!(corrupted.iter().all(|&x| x == 0.0 || x == 1.0));
    }

    #[test]
    fn test_back_propagate_fills_input_error() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut unit = AutoEncoder::new(
            PatchShape::new(2, 1, 1),
            1,
            Activation::Linear,
            Activation::Linear,
            &mut rng,
        );
        unit.encode(array![1.0, 1.0].view());
        unit.back_propagate(array![1.0].view());
        let expected = unit.encoder().weights().column(0).to_owned();
        assert_eq!(unit.input_error(), expected);
    }

    #[test]
    #[should_panic]
    fn test_layer_unit_cannot_decode() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = FeedforwardLayer::new(2, 1, Activation::Linear, &mut rng);
        let mut unit = LayerUnit::new(Box::new(layer), PatchShape::new(2, 1, 1));
        unit.decode(array![1.0].view());
    }

    #[test]
    fn test_tied_decoder_reports_nan_bias() {
        let mut decoder = TiedDecoder::new(2, 1, Activation::Linear);
        decoder.bias_gradient[1] = f32::NAN;
        assert!(matches!(
            decoder.learn(0.1),
            Err(MlError::NumericalDegeneration(_))
        ));

        let mut decoder = TiedDecoder::new(2, 1, Activation::Linear);
        decoder.bias_gradient.fill(1.0);
        decoder.learn(0.1).unwrap();
        assert_eq!(decoder.bias, array![-0.1, -0.1]);
    }
}
