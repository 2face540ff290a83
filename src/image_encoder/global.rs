use super::backbone::{Backbone, BackboneConfig, BackboneKind};
use crate::*;
use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
};

#[derive(Config, Debug)]
pub struct GlobalEncoderConfig {
    #[config(default = "BackboneKind::Resnet34")]
    pub backbone: BackboneKind,
    #[config(default = 64)]
    pub backbone_width: usize,
    #[config(default = 128)]
    pub latent_size: usize,
}

/// Image encoder producing one latent vector per image.
#[derive(Debug, Module)]
pub struct GlobalEncoder<B: Backend> {
    backbone: Backbone<B>,
    projection: Option<Linear<B>>,
    latent_size: usize,
}

#[derive(Clone, Debug)]
pub struct GlobalLatent<B: Backend> {
    /// `[B, L]`
    pub latent: Tensor<B, 2>,
}

impl GlobalEncoderConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<GlobalEncoder<B>> {
        if self.latent_size == 0 {
            return Err(Error::InvalidConfig(
                "Latent size must be greater than 0".into(),
            ));
        }

        let backbone = BackboneConfig::new()
            .with_kind(self.backbone)
            .with_width(self.backbone_width)
            .init(device)?;
        let pooled_size = backbone.output_size();
        let projection = (pooled_size != self.latent_size).then(|| {
            LinearConfig::new(pooled_size, self.latent_size).init(device)
        });

        log::info!(
            "Global encoder: {:?} backbone, pooled size {pooled_size}, latent size {}",
            self.backbone, self.latent_size,
        );

        Ok(GlobalEncoder {
            backbone,
            projection,
            latent_size: self.latent_size,
        })
    }
}

impl<B: Backend> GlobalEncoder<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> GlobalLatent<B> {
        let latent = self.backbone.pooled(images);
        let latent = match &self.projection {
            Some(projection) => projection.forward(latent),
            None => latent,
        };

        GlobalLatent { latent }
    }

    /// Broadcasts the latent to every coordinate of `uv` of `[B, N, 2]`,
    /// returning `[B, L, N]`.
    pub fn index(
        &self,
        latent: &GlobalLatent<B>,
        uv: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [batch, size] = latent.latent.dims();
        let count = uv.dims()[1];

        latent
            .latent
            .clone()
            .unsqueeze_dim::<3>(2)
            .expand([batch, size, count])
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

    pub fn has_projection(&self) -> bool {
        self.projection.is_some()
    }
}
