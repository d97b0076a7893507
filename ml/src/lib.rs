//! Training engine for tiled auto-encoders.
//!
//! A small trainable unit (an auto-encoder or a plain layer) is convolved across a spatial
//! grid, sharing its weights at every grid position. Several such convolution stages are
//! chained into a stacked, hierarchical feature extractor. Gradients are routed by hand
//! through the tiling, the overlap reconstruction and the pooling reduction.
//!
//! Leaves first:
//! - [`tensor`]: dense width x height x depth blocks with overlap counters
//! - [`layer`], [`fully_connected`], [`correlation`]: the trainable layers
//! - [`network`]: a plain chain of layers, usable as classifier head
//! - [`autoencoder`]: the units that get tiled
//! - [`convolutions`], [`pooling`]: the stages
//! - [`models`]: the stacked composition
pub mod activation_functions;
pub mod autoencoder;
pub mod config;
pub mod convolutions;
pub mod correlation;
pub mod error;
pub mod fully_connected;
pub mod layer;
pub mod models;
pub mod network;
pub mod persistence;
pub mod pooling;
pub mod reconstruction;
pub mod tensor;

pub use error::{MlError, MlResult};

pub type WeightPrecision = f32;
pub type ImagePrecision = f32;
