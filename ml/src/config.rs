//! Declarative description of stacks, read from JSON.
//!
//! ```json
//! {
//!   "seed": 7,
//!   "stages": [
//!     { "type": "convolution", "offset_x": 1, "offset_y": 1,
//!       "unit": { "patch_width": 5, "patch_height": 5, "depth": 1, "hidden": 16 } },
//!     { "type": "pooling", "kind": "max", "width": 2, "height": 2 }
//!   ],
//!   "training": { "epochs": 10, "samples_per_epoch": 200 }
//! }
//! ```
use crate::{
    activation_functions::Activation, autoencoder::AutoEncoder, fully_connected::DEFAULT_LEARNING_RATE,
    models::Stack, pooling::selector, ImagePrecision, MlError, MlResult, WeightPrecision,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Training hyperparameters of a single layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub learning_rate: WeightPrecision,
    /// Overrides the activation's default decay
    pub decay: Option<WeightPrecision>,
    /// Overrides the activation's default activation cost
    pub activation_cost: Option<ImagePrecision>,
    pub dropout: ImagePrecision,
}

impl Default for LayerConfig {
    fn default() -> Self {
        LayerConfig {
            learning_rate: DEFAULT_LEARNING_RATE,
            decay: None,
            activation_cost: None,
            dropout: 0.0,
        }
    }
}

/// An auto-encoder tiled by a convolution stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    pub patch_width: usize,
    pub patch_height: usize,
    pub depth: usize,
    pub hidden: usize,
    pub encoder: Activation,
    pub decoder: Activation,
    pub tied: bool,
    /// Input corruption rate, 0 for a plain auto-encoder
    pub denoising: ImagePrecision,
    pub binary_input: bool,
    /// Code units reserved for label-aware training
    pub num_classes: usize,
    pub label_weight: ImagePrecision,
    pub layer: LayerConfig,
}

impl Default for UnitConfig {
    fn default() -> Self {
        UnitConfig {
            patch_width: 5,
            patch_height: 5,
            depth: 1,
            hidden: 16,
            encoder: Activation::SoftSign,
            decoder: Activation::Linear,
            tied: false,
            denoising: 0.0,
            binary_input: false,
            num_classes: 0,
            label_weight: 1.0,
            layer: LayerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingKind {
    Max,
    Mean,
    Extremum,
    SoftExpLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingConfig {
    pub kind: PoolingKind,
    pub width: usize,
    pub height: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageConfig {
    Convolution {
        unit: UnitConfig,
        #[serde(default = "default_offset")]
        offset_x: usize,
        #[serde(default = "default_offset")]
        offset_y: usize,
    },
    Pooling(PoolingConfig),
}

fn default_offset() -> usize {
    1
}

impl StageConfig {
    /// Appends the described stage to `stack`.
    pub fn add_to<R: Rng + ?Sized>(&self, stack: &mut Stack, rng: &mut R) -> MlResult<()> {
        match self {
            StageConfig::Convolution {
                unit,
                offset_x,
                offset_y,
            } => stack.add_layer(
                Box::new(AutoEncoder::from_config(unit, rng)),
                *offset_x,
                *offset_y,
            ),
            StageConfig::Pooling(pooling) => {
                stack.add_pooling(selector(pooling.kind), pooling.width, pooling.height)
            }
        }
    }

    fn validate(&self, index: usize) -> MlResult<()> {
        let invalid = |reason: &str| Err(MlError::InvalidConfig(format!("stage {}: {}", index, reason)));
        match self {
            StageConfig::Convolution {
                unit,
                offset_x,
                offset_y,
            } => {
                if *offset_x == 0 || *offset_y == 0 {
                    return invalid("offsets must be at least 1");
                }
                if unit.patch_width == 0 || unit.patch_height == 0 || unit.depth == 0 || unit.hidden == 0 {
                    return invalid("unit dimensions must be positive");
                }
                if unit.layer.learning_rate <= 0.0 {
                    return invalid("learning rate must be positive");
                }
                if !(0.0..1.0).contains(&unit.layer.dropout) || !(0.0..1.0).contains(&unit.denoising) {
                    return invalid("dropout and corruption rates must lie in [0, 1)");
                }
                if unit.num_classes > unit.hidden {
                    return invalid("more classes than code units");
                }
                if unit.tied && unit.decoder == Activation::Softmax {
                    return invalid("tied decoders do not support softmax");
                }
            }
            StageConfig::Pooling(pooling) => {
                if index == 0 {
                    return invalid("pooling cannot be the base stage");
                }
                if pooling.width == 0 || pooling.height == 0 {
                    return invalid("pooling window must not be empty");
                }
            }
        }
        Ok(())
    }
}

/// Greedy training schedule: every stage is trained for `epochs` epochs after it was added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub samples_per_epoch: usize,
    /// Stride of the reconstruction score computed after training
    pub score_stride: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epochs: 10,
            samples_per_epoch: 100,
            score_stride: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub seed: u64,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl StackConfig {
    pub fn from_json_str(json: &str) -> MlResult<StackConfig> {
        let config: StackConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> MlResult<StackConfig> {
        StackConfig::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn to_json_string(&self) -> MlResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> MlResult<()> {
        if self.stages.is_empty() {
            return Err(MlError::InvalidConfig("no stages given".to_string()));
        }
        if self.training.score_stride == 0 {
            return Err(MlError::InvalidConfig("score stride must be at least 1".to_string()));
        }
        for (index, stage) in self.stages.iter().enumerate() {
            stage.validate(index)?;
        }
        Ok(())
    }

    /// Random generator all stages of this configuration are initialized from.
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Builds the whole stack at once.
    pub fn build(&self) -> MlResult<Stack> {
        self.validate()?;
        let mut rng = self.rng();
        let mut stack = Stack::new();
        for stage in self.stages.iter() {
            stage.add_to(&mut stack, &mut rng)?;
        }
        Ok(stack)
    }
}
