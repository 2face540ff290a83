use super::{
    backbone::{Backbone, BackboneConfig, BackboneKind, PYRAMID_LEVELS},
    prior::{resize, PriorNetwork, PriorNetworkConfig},
};
use crate::{sampling::*, *};
use burn::{
    module::{Ignored, Param},
    prelude::*,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How a processed prior is combined with the backbone latent.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PriorFusion {
    /// The prior latent is used in place of the backbone latent.
    #[default]
    Replace,
    /// `w * prior + (1 - w) * latent` with a learned weight `w`.
    Blend,
}

impl FromStr for PriorFusion {
    type Err = Error;

    fn from_str(fusion: &str) -> Result<Self> {
        match fusion {
            "replace" => Ok(Self::Replace),
            "blend" => Ok(Self::Blend),
            _ => Err(Error::UnsupportedPriorFusion(fusion.into())),
        }
    }
}

#[derive(Config, Debug)]
pub struct SpatialEncoderConfig {
    #[config(default = "BackboneKind::Resnet34")]
    pub backbone: BackboneKind,
    #[config(default = 64)]
    pub backbone_width: usize,
    /// Pyramid levels concatenated into the latent when `feature_level` is unset.
    #[config(default = 4)]
    pub num_layers: usize,
    /// Single pyramid level used as the latent, or all of the first
    /// `num_layers` levels when unset.
    #[config(default = "Some(1)")]
    pub feature_level: Option<usize>,
    /// Latent resolution as `[height, width]`.
    #[config(default = "Some([242, 324])")]
    pub target_size: Option<[usize; 2]>,
    #[config(default = "SampleInterpolation::Bilinear")]
    pub index_interp: SampleInterpolation,
    #[config(default = "SamplePadding::Border")]
    pub index_padding: SamplePadding,
    #[config(default = 1.0)]
    pub feature_scale: f64,
    #[config(default = true)]
    pub use_first_pool: bool,
    #[config(default = false)]
    pub use_diffu_prior: bool,
    #[config(default = 1)]
    pub prior_channels: usize,
    #[config(default = "PriorFusion::Replace")]
    pub prior_fusion: PriorFusion,
}

/// Pixel-aligned image encoder.
#[derive(Debug, Module)]
pub struct SpatialEncoder<B: Backend> {
    backbone: Backbone<B>,
    prior: Option<PriorNetwork<B>>,
    prior_weight: Option<Param<Tensor<B, 1>>>,
    config: Ignored<SpatialEncoderConfig>,
    latent_size: usize,
}

/// Latent map of one `forward` call together with its scaling record.
#[derive(Clone, Debug)]
pub struct SpatialLatent<B: Backend> {
    /// `[B, L, H, W]`
    pub latent: Tensor<B, 4>,
    /// `[W, H] / ([W, H] - 1) * 2`, or 0 along an axis of size 1
    pub scaling: [f32; 2],
}

impl SpatialEncoderConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<SpatialEncoder<B>> {
        if self.num_layers == 0 || self.num_layers > PYRAMID_LEVELS {
            return Err(Error::InvalidConfig(format!(
                "Number of layers must be in 1..={PYRAMID_LEVELS}, got {}",
                self.num_layers
            )));
        }
        if let Some(level) = self.feature_level {
            if level >= PYRAMID_LEVELS {
                return Err(Error::InvalidConfig(format!(
                    "Feature level must be less than {PYRAMID_LEVELS}, got {level}"
                )));
            }
        }
        if self.feature_scale.is_nan() || self.feature_scale <= 0.0 {
            return Err(Error::InvalidConfig(
                "Feature scale must be positive".into(),
            ));
        }
        if let Some([height, width]) = self.target_size {
            if height < 2 || width < 2 {
                return Err(Error::InvalidConfig(
                    "Target size must be at least 2 pixels on each side"
                        .into(),
                ));
            }
        }

        let backbone = BackboneConfig::new()
            .with_kind(self.backbone)
            .with_width(self.backbone_width)
            .with_use_first_pool(self.use_first_pool)
            .init(device)?;

        let latent_size = self.get_latent_size();

        let prior = if self.use_diffu_prior {
            Some(
                PriorNetworkConfig::new(latent_size)
                    .with_in_channels(self.prior_channels)
                    .init(device)?,
            )
        } else {
            None
        };
        let prior_weight = self
            .use_diffu_prior
            .then(|| Param::from_tensor(Tensor::from_floats([0.5], device)));

        log::info!(
            "Spatial encoder: {:?} backbone, latent size {latent_size}, prior {}",
            self.backbone,
            if self.use_diffu_prior { "enabled" } else { "disabled" },
        );

        Ok(SpatialEncoder {
            backbone,
            prior,
            prior_weight,
            config: Ignored(self.clone()),
            latent_size,
        })
    }
}

impl SpatialEncoderConfig {
    /// Channel count of the latent map.
    pub fn get_latent_size(&self) -> usize {
        let channels =
            [1, 1, 2, 4, 8].map(|factor| factor * self.backbone_width);
        match self.feature_level {
            Some(level) => channels.get(level).copied().unwrap_or(0),
            None => channels.iter().take(self.num_layers).sum(),
        }
    }
}

impl<B: Backend> SpatialEncoder<B> {
    /// Encodes `[B, C, H, W]` images into a latent map.
    pub fn forward(&self, images: Tensor<B, 4>) -> SpatialLatent<B> {
        let config = &self.config.0;

        let images = if config.feature_scale != 1.0 {
            let [_, _, height, width] = images.dims();
            let scale = |size: usize| {
                ((size as f64 * config.feature_scale).round() as usize).max(1)
            };
            resize(images, [scale(height), scale(width)])
        } else {
            images
        };

        let depth = match config.feature_level {
            Some(level) => level + 1,
            None => config.num_layers,
        };
        let mut levels = self.backbone.forward(images, depth);

        let latent = match config.feature_level {
            Some(_) => {
                let level = levels.split_off(depth - 1);
                let level = Tensor::cat(level, 1);
                let size = config.target_size.unwrap_or_else(|| spatial_size(&level));
                resize(level, size)
            }
            None => {
                let size = config
                    .target_size
                    .or_else(|| levels.first().map(spatial_size))
                    .unwrap_or([1, 1]);
                Tensor::cat(
                    levels.into_iter().map(|level| resize(level, size)).collect(),
                    1,
                )
            }
        };
        log::debug!("Spatial latent shape: {:?}", latent.dims());

        SpatialLatent::new(latent)
    }

    /// Passes the prior through the prior network and fuses it with the latent.
    ///
    /// Without a prior network the prior is ignored.
    pub fn fuse_prior(
        &self,
        latent: &SpatialLatent<B>,
        prior: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let Some(network) = &self.prior else {
            log::warn!("Ignoring prior on an encoder built without prior support");
            return latent.latent.clone();
        };

        let size = spatial_size(&latent.latent);
        let prior_latent = network.forward(prior, size);

        match (self.config.0.prior_fusion, &self.prior_weight) {
            (PriorFusion::Blend, Some(weight)) => {
                let weight = weight.val().reshape([1, 1, 1, 1]);
                prior_latent * weight.clone()
                    + latent.latent.clone() * (-weight + 1.0)
            }
            _ => prior_latent,
        }
    }

    /// Samples pixel-aligned features at `uv` of `[B, N, 2]`, returning `[B, L, N]`.
    ///
    /// With `image_size` as `[width, height]` the coordinates are pixels,
    /// otherwise they are already normalized to `[-1, 1]`. A supplied `roi`
    /// map is sampled instead of the latent.
    pub fn index(
        &self,
        latent: &SpatialLatent<B>,
        uv: Tensor<B, 3>,
        image_size: Option<[f32; 2]>,
        prior: Option<Tensor<B, 4>>,
        roi: Option<Tensor<B, 4>>,
    ) -> Result<Tensor<B, 3>> {
        let features = match roi {
            Some(roi) => roi,
            None => match prior {
                Some(prior) => self.fuse_prior(latent, prior),
                None if self.prior.is_some() => return Err(Error::MissingPrior),
                None => latent.latent.clone(),
            },
        };

        let batch = features.dims()[0];
        let [uv_batch, size, _] = uv.dims();
        let uv = if uv_batch == 1 && batch > 1 {
            uv.expand([batch, size, 2])
        } else if uv_batch == batch {
            uv
        } else {
            return Err(Error::GroupSize {
                points: uv_batch,
                groups: batch,
            });
        };

        let grid = latent.normalize(uv, image_size);
        let config = &self.config.0;

        Ok(grid_sample(
            features,
            grid,
            config.index_interp,
            config.index_padding,
        ))
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    pub fn with_backbone(mut self, backbone: Backbone<B>) -> Self {
        self.backbone = backbone;
        self
    }

    pub fn latent_size(&self) -> usize {
        self.latent_size
    }

    pub fn has_prior(&self) -> bool {
        self.prior.is_some()
    }
}

impl<B: Backend> SpatialLatent<B> {
    pub fn new(latent: Tensor<B, 4>) -> Self {
        let [height, width] = spatial_size(&latent);
        // A single pixel row or column maps every coordinate onto itself.
        let scale = |size: usize| match size {
            0 | 1 => 0.0,
            _ => size as f32 / (size - 1) as f32 * 2.0,
        };

        Self {
            latent,
            scaling: [scale(width), scale(height)],
        }
    }

    /// Maps pixel coordinates of an image with `[width, height]` into the
    /// sampling range.
    pub fn normalize(
        &self,
        uv: Tensor<B, 3>,
        image_size: Option<[f32; 2]>,
    ) -> Tensor<B, 3> {
        match image_size {
            Some([width, height]) => {
                let scale = Tensor::<B, 1>::from_floats(
                    [self.scaling[0] / width, self.scaling[1] / height],
                    &uv.device(),
                )
                .reshape([1, 1, 2]);
                uv * scale - 1.0
            }
            None => uv,
        }
    }
}

fn spatial_size<B: Backend>(features: &Tensor<B, 4>) -> [usize; 2] {
    let [_, _, height, width] = features.dims();
    [height, width]
}
