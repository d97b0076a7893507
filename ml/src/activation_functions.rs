//! This module provides the nonlinearities of the weighted-sum layers,
//! namely linear, soft-sign, sigmoid, rectified-linear and softmax.
//!
//! All activation functions are exposed as a variant of [`Activation`] (used by the layers,
//! together with the derivative factor used in back-propagation) as well as a free function.
use ndarray::*;
use serde_derive::{Deserialize, Serialize};

use crate::ImagePrecision;

/// Derivative factor of the rectified-linear unit for inactive inputs.
pub const RELU_LEAK: ImagePrecision = 1e-3;

/// Nonlinearity applied by a weighted-sum layer.
///
/// Softmax acts on the whole output vector jointly, so [`Activation::activate`] only
/// yields its unnormalized numerator; the layer does the normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    SoftSign,
    Sigmoid,
    Relu,
    Softmax,
}

impl Activation {
    /// Applies the nonlinearity to one weighted sum.
    pub fn activate(self, s: ImagePrecision) -> ImagePrecision {
        match self {
            Activation::Linear => s,
            Activation::SoftSign => s / (1.0 + s.abs()),
            Activation::Sigmoid => 1.0 / (1.0 + (-s).exp()),
            Activation::Relu => s.max(0.0),
            Activation::Softmax => s.exp(),
        }
    }

    /// Factor by which an output error is multiplied to get the error of the weighted sum `s`,
    /// given the output `y` the layer produced for it.
    /// Softmax has no elementwise derivative and is handled by the layer.
    pub fn derivative(self, s: ImagePrecision, y: ImagePrecision) -> ImagePrecision {
        match self {
            Activation::Linear => 1.0,
            Activation::SoftSign => {
                let d = 1.0 + s.abs();
                1.0 / (d * d)
            }
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Relu => {
                if s > 0.0 {
                    1.0
                } else {
                    RELU_LEAK
                }
            }
            Activation::Softmax => unimplemented!("Softmax has no elementwise derivative"),
        }
    }

    /// Whether outputs lie in [0, 1] and can feed units requiring binary input.
    pub fn is_binary(self) -> bool {
        matches!(self, Activation::Sigmoid | Activation::Softmax)
    }
}

/// Soft-sign implementation
pub fn softsign<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| Activation::SoftSign.activate(x))
}

/// Logistic sigmoid implementation
pub fn sigmoid<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| Activation::Sigmoid.activate(x))
}

/// Relu implementation
pub fn relu<D: Dimension>(data: &Array<ImagePrecision, D>) -> Array<ImagePrecision, D> {
    data.mapv(|x| if x > 0. { x } else { 0. })
}

/// Softmax over a vector. The maximum is subtracted before exponentiating,
/// which leaves the result unchanged but keeps the exponentials finite.
pub fn softmax<'a, V>(data: V) -> Array1<ImagePrecision>
where
    V: AsArray<'a, ImagePrecision, Ix1>,
{
    let data: ArrayView1<ImagePrecision> = data.into();
    let max = data.fold(ImagePrecision::NEG_INFINITY, |m, &x| m.max(x));
    let exps = data.mapv(|x| (x - max).exp());
    let sum = exps.sum();
    exps / sum
}
