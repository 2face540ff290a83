use crate::*;
use burn::prelude::*;

#[derive(Config, Debug)]
pub struct PositionalEncoderConfig {
    pub encoding_factor: usize,
    #[config(default = 3)]
    pub input_size: usize,
}

/// Maps coordinates to `[x, sin(2^k x), cos(2^k x), ...]` for `k < encoding_factor`.
#[derive(Debug, Module)]
pub struct PositionalEncoder<B: Backend> {
    freqs: Tensor<B, 3>,
    phases: Tensor<B, 3>,
    input_size: usize,
}

impl PositionalEncoderConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<PositionalEncoder<B>> {
        let encoding_factor = self.encoding_factor;
        if encoding_factor == 0 {
            return Err(Error::InvalidConfig(
                "Encoding factor must be greater than 0".into(),
            ));
        }
        if self.input_size == 0 {
            return Err(Error::InvalidConfig(
                "Encoder input size must be greater than 0".into(),
            ));
        }

        let shape = [1, 2 * encoding_factor, 1];
        let freqs = Tensor::<B, 1>::from_floats(
            (0..encoding_factor)
                .map(|level| (level as f32).exp2())
                .collect::<Vec<_>>()
                .as_slice(),
            device,
        )
        .unsqueeze_dim::<2>(1)
        .repeat_dim(1, 2)
        .reshape(shape);
        let phases = Tensor::<B, 1>::from_floats(
            [0.0, std::f32::consts::FRAC_PI_2],
            device,
        )
        .unsqueeze_dim::<2>(0)
        .repeat_dim(0, encoding_factor)
        .reshape(shape);

        Ok(PositionalEncoder {
            freqs,
            phases,
            input_size: self.input_size,
        })
    }

    pub fn get_output_size(&self) -> usize {
        self.input_size * (2 * self.encoding_factor + 1)
    }
}

impl<B: Backend> PositionalEncoder<B> {
    pub fn forward(&self, coordinates: Tensor<B, 2>) -> Tensor<B, 2> {
        let coordinates = coordinates.unsqueeze_dim::<3>(1);
        let features_shape = [coordinates.dims()[0] as i32, -1];
        let features = (coordinates.clone() * self.freqs.clone()
            + self.phases.clone())
        .sin();

        Tensor::cat(vec![coordinates, features], 1).reshape(features_shape)
    }

    /// Pulls a gradient on the encoded features back onto the coordinates.
    pub fn backward(
        &self,
        coordinates: Tensor<B, 2>,
        features_grad: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let [size, input_size] = coordinates.dims();
        let levels = self.freqs.dims()[1];
        let features_grad =
            features_grad.reshape([size, levels + 1, input_size]);

        let derivatives = (coordinates.unsqueeze_dim::<3>(1)
            * self.freqs.clone()
            + self.phases.clone())
        .cos()
            * self.freqs.clone();

        let identity_grad = features_grad
            .clone()
            .slice([0..size, 0..1, 0..input_size]);
        let encoded_grad = (features_grad
            .slice([0..size, 1..levels + 1, 0..input_size])
            * derivatives)
            .sum_dim(1);

        (identity_grad + encoded_grad).squeeze::<2>(1)
    }

    pub fn get_output_size(&self) -> usize {
        self.input_size * (self.freqs.dims()[1] + 1)
    }
}
