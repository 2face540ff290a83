use crate::*;
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{
            AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d,
            MaxPool2dConfig,
        },
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Number of feature levels a backbone can produce.
pub const PYRAMID_LEVELS: usize = 5;

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    Resnet18,
    #[default]
    Resnet34,
    Custom,
}

impl BackboneKind {
    fn stage_depths(&self) -> Result<[usize; 4]> {
        match self {
            Self::Resnet18 => Ok([2, 2, 2, 2]),
            Self::Resnet34 => Ok([3, 4, 6, 3]),
            Self::Custom => {
                log::error!("Custom backbones are experimental and not available");
                Err(Error::UnsupportedBackbone("custom".into()))
            }
        }
    }
}

impl FromStr for BackboneKind {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self> {
        match kind {
            "resnet18" => Ok(Self::Resnet18),
            "resnet34" => Ok(Self::Resnet34),
            "custom" => Ok(Self::Custom),
            _ => Err(Error::UnsupportedBackbone(kind.into())),
        }
    }
}

#[derive(Config, Debug)]
pub struct BackboneConfig {
    #[config(default = "BackboneKind::Resnet34")]
    pub kind: BackboneKind,
    #[config(default = 64)]
    pub width: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = true)]
    pub use_first_pool: bool,
}

/// Residual image backbone producing a feature pyramid.
///
/// Level 0 is the stem output at half resolution, levels 1 to 4 are the
/// residual stages with `[w, 2w, 4w, 8w]` channels.
#[derive(Debug, Module)]
pub struct Backbone<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: BatchNorm<B, 2>,
    first_pool: Option<MaxPool2d>,
    stages: Vec<Stage<B>>,
    average_pool: AdaptiveAvgPool2d,
    width: usize,
}

#[derive(Debug, Module)]
pub struct Stage<B: Backend> {
    blocks: Vec<BasicBlock<B>>,
}

#[derive(Debug, Module)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

#[derive(Debug, Module)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl BackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Backbone<B>> {
        let depths = self.kind.stage_depths()?;
        if self.width == 0 || self.in_channels == 0 {
            return Err(Error::InvalidConfig(
                "Backbone width and input channels must be greater than 0"
                    .into(),
            ));
        }

        let width = self.width;
        let stem = Conv2dConfig::new([self.in_channels, width], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let first_pool = self.use_first_pool.then(|| {
            MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init()
        });

        let mut input_size = width;
        let stages = depths
            .iter()
            .enumerate()
            .map(|(index, depth)| {
                let output_size = width << index;
                let stride = if index == 0 { 1 } else { 2 };
                let blocks = (0..*depth)
                    .map(|block| match block {
                        0 => init_block(input_size, output_size, stride, device),
                        _ => init_block(output_size, output_size, 1, device),
                    })
                    .collect();
                input_size = output_size;
                Stage { blocks }
            })
            .collect();

        Ok(Backbone {
            stem,
            stem_norm: BatchNormConfig::new(width).init(device),
            first_pool,
            stages,
            average_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            width,
        })
    }
}

fn conv3x3<B: Backend>(
    input_size: usize,
    output_size: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([input_size, output_size], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

fn init_block<B: Backend>(
    input_size: usize,
    output_size: usize,
    stride: usize,
    device: &B::Device,
) -> BasicBlock<B> {
    let downsample = (stride != 1 || input_size != output_size).then(|| {
        Downsample {
            conv: Conv2dConfig::new([input_size, output_size], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(output_size).init(device),
        }
    });

    BasicBlock {
        conv1: conv3x3(input_size, output_size, stride, device),
        norm1: BatchNormConfig::new(output_size).init(device),
        conv2: conv3x3(output_size, output_size, 1, device),
        norm2: BatchNormConfig::new(output_size).init(device),
        downsample,
    }
}

impl<B: Backend> Backbone<B> {
    /// Returns the first `levels` pyramid levels, finest first.
    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        levels: usize,
    ) -> Vec<Tensor<B, 4>> {
        let levels = levels.min(PYRAMID_LEVELS);
        let mut features = Vec::with_capacity(levels);
        if levels == 0 {
            return features;
        }

        let mut x = relu(self.stem_norm.forward(self.stem.forward(images)));
        features.push(x.clone());
        if let Some(pool) = &self.first_pool {
            x = pool.forward(x);
        }

        for stage in self.stages.iter().take(levels - 1) {
            x = stage.forward(x);
            features.push(x.clone());
        }

        features
    }

    /// Average-pooled deepest features of `[B, 8w]`.
    pub fn pooled(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = relu(self.stem_norm.forward(self.stem.forward(images)));
        if let Some(pool) = &self.first_pool {
            x = pool.forward(x);
        }
        for stage in &self.stages {
            x = stage.forward(x);
        }

        self.average_pool.forward(x).flatten::<2>(1, 3)
    }

    /// Channel count of every pyramid level.
    pub fn channels(&self) -> [usize; PYRAMID_LEVELS] {
        let width = self.width;
        [width, width, width * 2, width * 4, width * 8]
    }

    pub fn output_size(&self) -> usize {
        self.width * 8
    }
}

impl<B: Backend> Stage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }
}

impl<B: Backend> BasicBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => {
                downsample.norm.forward(downsample.conv.forward(x.clone()))
            }
            None => x.clone(),
        };
        let out = relu(self.norm1.forward(self.conv1.forward(x)));
        let out = self.norm2.forward(self.conv2.forward(out));

        relu(out + identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type Backend = burn::backend::NdArray;

    #[test]
    fn backbone_pyramid_shapes() {
        let device = Default::default();
        let backbone = BackboneConfig::new()
            .with_kind(BackboneKind::Resnet18)
            .with_width(8)
            .init::<Backend>(&device)
            .unwrap();
        assert_eq!(backbone.channels(), [8, 8, 16, 32, 64]);

        let images =
            Tensor::random([1, 3, 64, 64], Distribution::Default, &device);
        let shapes = backbone
            .forward(images.clone(), PYRAMID_LEVELS)
            .iter()
            .map(|level| level.dims())
            .collect::<Vec<_>>();
        assert_eq!(
            shapes,
            [
                [1, 8, 32, 32],
                [1, 8, 16, 16],
                [1, 16, 8, 8],
                [1, 32, 4, 4],
                [1, 64, 2, 2],
            ]
        );

        assert_eq!(backbone.forward(images.clone(), 2).len(), 2);
        assert_eq!(backbone.pooled(images).dims(), [1, 64]);
    }

    #[test]
    fn backbone_without_first_pool_keeps_resolution() {
        let device = Default::default();
        let backbone = BackboneConfig::new()
            .with_kind(BackboneKind::Resnet18)
            .with_width(4)
            .with_use_first_pool(false)
            .init::<Backend>(&device)
            .unwrap();

        let images = Tensor::zeros([2, 3, 32, 32], &device);
        let levels = backbone.forward(images, 2);
        assert_eq!(levels[0].dims(), [2, 4, 16, 16]);
        assert_eq!(levels[1].dims(), [2, 4, 16, 16]);
    }

    #[test]
    fn backbone_kind_parsing() {
        assert_eq!(
            "resnet18".parse::<BackboneKind>().unwrap(),
            BackboneKind::Resnet18
        );
        assert!(matches!(
            "mambavision".parse::<BackboneKind>(),
            Err(Error::UnsupportedBackbone(_))
        ));
    }

    #[test]
    fn custom_backbone_fails_fast() {
        let device = Default::default();
        let backbone = BackboneConfig::new()
            .with_kind(BackboneKind::Custom)
            .init::<Backend>(&device);
        assert!(matches!(backbone, Err(Error::UnsupportedBackbone(_))));
    }
}
