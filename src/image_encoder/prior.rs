use crate::*;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::{
        activation::relu,
        module::{adaptive_avg_pool2d, interpolate},
        ops::{InterpolateMode, InterpolateOptions},
    },
};

#[derive(Config, Debug)]
pub struct PriorNetworkConfig {
    pub latent_size: usize,
    #[config(default = 1)]
    pub in_channels: usize,
    #[config(default = 32)]
    pub hidden_size: usize,
}

/// Small convolutional network turning a depth or diffusion prior image
/// into a latent map.
#[derive(Debug, Module)]
pub struct PriorNetwork<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    head: Conv2d<B>,
}

impl PriorNetworkConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<PriorNetwork<B>> {
        if self.latent_size == 0 || self.in_channels == 0 || self.hidden_size == 0
        {
            return Err(Error::InvalidConfig(
                "Prior network sizes must be greater than 0".into(),
            ));
        }

        let hidden_size = self.hidden_size;
        Ok(PriorNetwork {
            conv1: Conv2dConfig::new([self.in_channels, hidden_size], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            conv2: Conv2dConfig::new([hidden_size, hidden_size], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            head: Conv2dConfig::new([hidden_size, self.latent_size], [1, 1])
                .init(device),
        })
    }
}

impl<B: Backend> PriorNetwork<B> {
    /// Maps `[B, C, H, W]` priors to `[B, L, target_height, target_width]`.
    pub fn forward(
        &self,
        prior: Tensor<B, 4>,
        target_size: [usize; 2],
    ) -> Tensor<B, 4> {
        let x = relu(self.conv1.forward(prior));
        let x = relu(self.conv2.forward(x));
        let x = self.head.forward(x);

        resize(x, target_size)
    }

    pub fn latent_size(&self) -> usize {
        self.head.weight.dims()[0]
    }
}

/// Resizes `[B, C, H, W]` maps, skipped when the size already matches.
///
/// Shrinking averages over areas, growing is bilinear.
pub(crate) fn resize<B: Backend>(
    features: Tensor<B, 4>,
    size: [usize; 2],
) -> Tensor<B, 4> {
    let [_, _, height, width] = features.dims();
    if [height, width] == size {
        return features;
    }

    let shrunk = [height.min(size[0]), width.min(size[1])];
    let features = if shrunk != [height, width] {
        adaptive_avg_pool2d(features, shrunk)
    } else {
        features
    };
    if shrunk == size {
        return features;
    }

    interpolate(
        features,
        size,
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
}
