//! Binary layer streams: input size, output size, the weight matrix (row-major, input
//! units x output units) and the bias, in that order.
use crate::{
    activation_functions::Activation, fully_connected::FeedforwardLayer, layer::Layer, MlError,
    MlResult, WeightPrecision,
};
use ndarray::*;
use serde_derive::{Deserialize, Serialize};
use std::io::{Read, Write};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LayerRecord {
    input_size: u32,
    output_size: u32,
    weights: Vec<WeightPrecision>,
    bias: Vec<WeightPrecision>,
}

/// Appends the parameters of `layer` to `writer`.
pub fn write_layer<W: Write>(writer: W, layer: &FeedforwardLayer) -> MlResult<()> {
    let record = LayerRecord {
        input_size: layer.input_size() as u32,
        output_size: layer.output_size() as u32,
        weights: layer.weights().iter().cloned().collect(),
        bias: layer.bias().to_vec(),
    };
    bincode::serialize_into(writer, &record)?;
    Ok(())
}

/// Reads the next layer from `reader`. The activation is not part of the stream.
pub fn read_layer<R: Read>(reader: R, activation: Activation) -> MlResult<FeedforwardLayer> {
    let record: LayerRecord = bincode::deserialize_from(reader)?;
    let shape = (record.input_size as usize, record.output_size as usize);
    if record.bias.len() != shape.1 {
        return Err(MlError::shape_mismatch("stored bias", shape.1, record.bias.len()));
    }
    let weights = Array::from_shape_vec(shape, record.weights)
        .map_err(|_| MlError::shape_mismatch("stored weights", shape, "different length"))?;
    FeedforwardLayer::from_weights(weights, Array::from(record.bias), activation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::fs::File;
    use std::io::{BufReader, BufWriter};
    use tempfile::tempdir;

    #[test]
    fn test_layers_survive_a_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("layers.bin");
        let mut rng = StdRng::seed_from_u64(9);
        let first = FeedforwardLayer::new(3, 2, Activation::SoftSign, &mut rng);
        let second = FeedforwardLayer::new(2, 4, Activation::Sigmoid, &mut rng);
        {
            let mut writer = BufWriter::new(File::create(&path).unwrap());
            write_layer(&mut writer, &first).unwrap();
            write_layer(&mut writer, &second).unwrap();
        }

        let mut reader = BufReader::new(File::open(&path).unwrap());
        let mut read_first = read_layer(&mut reader, Activation::SoftSign).unwrap();
        let read_second = read_layer(&mut reader, Activation::Sigmoid).unwrap();
        assert_eq!(read_first.weights(), first.weights());
        assert_eq!(read_second.bias(), second.bias());
        assert_eq!(read_second.output_size(), 4);

        let mut original = first.clone();
        let input = array![0.3, -0.1, 0.8];
        original.compute(input.view());
        read_first.compute(input.view());
        assert_eq!(original.output(), read_first.output());
        dir.close().unwrap();
    }

    #[test]
    fn test_stream_order() {
        let layer = FeedforwardLayer::from_weights(array![[1.0, 2.0]], array![3.0, 4.0], Activation::Linear)
            .unwrap();
        let mut buffer = Vec::new();
        write_layer(&mut buffer, &layer).unwrap();
        // sizes as u32 little endian, then length-prefixed weight and bias vectors
        assert_eq!(&buffer[0..8], &[1, 0, 0, 0, 2, 0, 0, 0]);
        let weights_len = u64::from_le_bytes([
            buffer[8], buffer[9], buffer[10], buffer[11], buffer[12], buffer[13], buffer[14], buffer[15],
        ]);
        assert_eq!(weights_len, 2);
        assert_eq!(buffer.len(), 8 + 8 + 2 * 4 + 8 + 2 * 4);
    }

    #[test]
    fn test_truncated_stream_fails() {
        let layer = FeedforwardLayer::from_weights(array![[1.0]], array![0.0], Activation::Linear).unwrap();
        let mut buffer = Vec::new();
        write_layer(&mut buffer, &layer).unwrap();
        buffer.truncate(buffer.len() - 2);
        let result = read_layer(buffer.as_slice(), Activation::Linear);
        assert!(matches!(result, Err(MlError::Persistence(_))));
    }
}
