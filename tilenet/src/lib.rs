//! Input handling of the tilenet command line interface.
use image::{io::Reader as ImageReader, DynamicImage, ImageError};
use ml::{tensor::Tensor, MlError};
use ndarray::{Array3, Axis};
use ndarray_npy::{read_npy, ReadNpyError};
use nshare::ToNdarray3;
use rand::Rng;
use std::{ffi::OsStr, path::Path};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TilenetError {
    #[error("Image could not be read:\n {0}.")]
    Image(#[from] ImageError),
    #[error("Array could not be read:\n {0}.")]
    Npy(#[from] ReadNpyError),
    #[error("Input had unrecognized type {0:?}. Only .jpg, .png and .npy are supported.")]
    UnsupportedFormat(String),
    #[error("Input of size {width}x{height} is smaller than the {patch_width}x{patch_height} patch of the stack")]
    InputTooSmall {
        width: usize,
        height: usize,
        patch_width: usize,
        patch_height: usize,
    },
    #[error("Input has {actual} channels, the base stage of the stack reads {expected}. Use --grayscale for single channel stacks")]
    DepthMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Ml(#[from] MlError),
}

/// Returns the image as pre-scaled tensor, ready to be put into a stack
pub fn image_to_tensor(img: &DynamicImage) -> Tensor {
    Tensor::from_chw(&img.to_rgb8().into_ndarray3().map(|x| *x as f32 / 255.0))
}

/// Loads an input tensor. Arrays in `.npy` files are expected in (channels, height, width)
/// layout, images are scaled to [0, 1].
pub fn load_tensor(path: &Path) -> Result<Tensor, TilenetError> {
    match path.extension().and_then(OsStr::to_str) {
        Some("npy") => {
            let chw: Array3<f32> = read_npy(path)?;
            Ok(Tensor::from_chw(&chw))
        }
        Some("png") | Some("jpg") | Some("jpeg") => {
            let img = ImageReader::open(path)
                .map_err(ImageError::IoError)?
                .decode()?;
            Ok(image_to_tensor(&img))
        }
        other => Err(TilenetError::UnsupportedFormat(
            other.unwrap_or_default().to_string(),
        )),
    }
}

/// Averages all channels into a single one.
pub fn to_grayscale(tensor: &Tensor) -> Tensor {
    match tensor.values().mean_axis(Axis(2)) {
        Some(mean) => Tensor::from_array(mean.insert_axis(Axis(2))),
        None => tensor.clone(),
    }
}

/// Checks that a patch of `depth` channels fits into the input at all.
pub fn check_fits(input: &Tensor, patch: (usize, usize), depth: usize) -> Result<(), TilenetError> {
    if input.depth() != depth {
        return Err(TilenetError::DepthMismatch {
            expected: depth,
            actual: input.depth(),
        });
    }
    if input.width() < patch.0 || input.height() < patch.1 {
        return Err(TilenetError::InputTooSmall {
            width: input.width(),
            height: input.height(),
            patch_width: patch.0,
            patch_height: patch.1,
        });
    }
    Ok(())
}

/// Uniformly drawn origin of a patch that lies completely inside the input.
pub fn random_position<R: Rng + ?Sized>(rng: &mut R, input: &Tensor, patch: (usize, usize)) -> (usize, usize) {
    let x = rng.gen_range(0..=input.width() - patch.0);
    let y = rng.gen_range(0..=input.height() - patch.1);
    (x, y)
}
