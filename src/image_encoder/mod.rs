pub mod backbone;
pub mod global;
pub mod prior;
pub mod spatial;

pub use backbone::*;
pub use global::*;
pub use prior::*;
pub use spatial::*;

use crate::*;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[default]
    Spatial,
    Global,
}

impl FromStr for EncoderKind {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self> {
        match kind {
            "spatial" => Ok(Self::Spatial),
            "global" => Ok(Self::Global),
            _ => Err(Error::UnsupportedEncoder(kind.into())),
        }
    }
}

#[derive(Config, Debug)]
pub struct ImageEncoderConfig {
    #[config(default = "EncoderKind::Spatial")]
    pub encoder_type: EncoderKind,
    #[config(default = "SpatialEncoderConfig::new()")]
    pub spatial: SpatialEncoderConfig,
    #[config(default = "GlobalEncoderConfig::new()")]
    pub global: GlobalEncoderConfig,
    /// File path or URL of a backbone record.
    #[config(default = "None")]
    pub pretrained: Option<String>,
}

#[derive(Clone, Debug)]
pub enum ImageEncoder<B: Backend> {
    Spatial(SpatialEncoder<B>),
    Global(GlobalEncoder<B>),
}

/// Output of [`ImageEncoder::forward`], consumed by [`ImageEncoder::index`].
#[derive(Clone, Debug)]
pub enum ImageEncoding<B: Backend> {
    Spatial(SpatialLatent<B>),
    Global(GlobalLatent<B>),
}

impl ImageEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ImageEncoder<B>> {
        Ok(match self.encoder_type {
            EncoderKind::Spatial => {
                ImageEncoder::Spatial(self.spatial.init(device)?)
            }
            EncoderKind::Global => {
                ImageEncoder::Global(self.global.init(device)?)
            }
        })
    }

    pub fn get_latent_size(&self) -> usize {
        match self.encoder_type {
            EncoderKind::Spatial => self.spatial.get_latent_size(),
            EncoderKind::Global => self.global.latent_size,
        }
    }

    /// Builds the encoder and loads the backbone record named by `pretrained`.
    pub fn init_pretrained<B: Backend>(
        &self,
        device: &B::Device,
    ) -> anyhow::Result<ImageEncoder<B>> {
        let encoder = self.init(device)?;
        let Some(file_path_or_url) = &self.pretrained else {
            return Ok(encoder);
        };

        log::info!("Loading pretrained backbone from {file_path_or_url}");
        let backbone = io::load_record(
            encoder.backbone().clone(),
            file_path_or_url,
            device,
        )?;

        Ok(encoder.with_backbone(backbone))
    }
}

impl<B: Backend> ImageEncoder<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> ImageEncoding<B> {
        match self {
            Self::Spatial(encoder) => {
                ImageEncoding::Spatial(encoder.forward(images))
            }
            Self::Global(encoder) => {
                ImageEncoding::Global(encoder.forward(images))
            }
        }
    }

    /// Looks up `[B, L, N]` features at `uv` of `[B, N, 2]`.
    ///
    /// The prior and the region-of-interest map only apply to spatial encoders.
    pub fn index(
        &self,
        encoding: &ImageEncoding<B>,
        uv: Tensor<B, 3>,
        image_size: Option<[f32; 2]>,
        prior: Option<Tensor<B, 4>>,
        roi: Option<Tensor<B, 4>>,
    ) -> Result<Tensor<B, 3>> {
        match (self, encoding) {
            (Self::Spatial(encoder), ImageEncoding::Spatial(latent)) => {
                encoder.index(latent, uv, image_size, prior, roi)
            }
            (Self::Global(encoder), ImageEncoding::Global(latent)) => {
                if prior.is_some() || roi.is_some() {
                    log::warn!("Global encoders ignore priors and region features");
                }
                Ok(encoder.index(latent, uv))
            }
            (Self::Spatial(_), _) => Err(Error::EncodingMismatch("spatial")),
            (Self::Global(_), _) => Err(Error::EncodingMismatch("global")),
        }
    }

    pub fn kind(&self) -> EncoderKind {
        match self {
            Self::Spatial(_) => EncoderKind::Spatial,
            Self::Global(_) => EncoderKind::Global,
        }
    }

    pub fn latent_size(&self) -> usize {
        match self {
            Self::Spatial(encoder) => encoder.latent_size(),
            Self::Global(encoder) => encoder.latent_size(),
        }
    }

    pub fn backbone(&self) -> &Backbone<B> {
        match self {
            Self::Spatial(encoder) => encoder.backbone(),
            Self::Global(encoder) => encoder.backbone(),
        }
    }

    pub fn with_backbone(self, backbone: Backbone<B>) -> Self {
        match self {
            Self::Spatial(encoder) => {
                Self::Spatial(encoder.with_backbone(backbone))
            }
            Self::Global(encoder) => {
                Self::Global(encoder.with_backbone(backbone))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type Backend = burn::backend::NdArray;

    fn small_config(encoder_type: EncoderKind) -> ImageEncoderConfig {
        ImageEncoderConfig::new()
            .with_encoder_type(encoder_type)
            .with_spatial(
                SpatialEncoderConfig::new()
                    .with_backbone(BackboneKind::Resnet18)
                    .with_backbone_width(4)
                    .with_feature_level(None)
                    .with_target_size(Some([6, 8])),
            )
            .with_global(
                GlobalEncoderConfig::new()
                    .with_backbone(BackboneKind::Resnet18)
                    .with_backbone_width(4)
                    .with_latent_size(16),
            )
    }

    #[test]
    fn encoder_kind_parsing() {
        assert_eq!(
            "global".parse::<EncoderKind>().unwrap(),
            EncoderKind::Global
        );
        assert!(matches!(
            "volumetric".parse::<EncoderKind>(),
            Err(Error::UnsupportedEncoder(_))
        ));
    }

    #[test]
    fn image_encoder_dispatch() {
        let device = Default::default();
        let images =
            Tensor::random([2, 3, 32, 32], Distribution::Default, &device);
        let uv = Tensor::zeros([2, 5, 2], &device);

        let spatial = small_config(EncoderKind::Spatial)
            .init::<Backend>(&device)
            .unwrap();
        assert_eq!(spatial.kind(), EncoderKind::Spatial);
        assert_eq!(spatial.latent_size(), 32);
        assert_eq!(
            small_config(EncoderKind::Spatial).get_latent_size(),
            spatial.latent_size()
        );
        let spatial_encoding = spatial.forward(images.clone());
        let samples = spatial
            .index(&spatial_encoding, uv.clone(), None, None, None)
            .unwrap();
        assert_eq!(samples.dims(), [2, 32, 5]);

        let global = small_config(EncoderKind::Global)
            .init::<Backend>(&device)
            .unwrap();
        assert_eq!(global.kind(), EncoderKind::Global);
        let global_encoding = global.forward(images);
        let samples = global
            .index(&global_encoding, uv.clone(), None, None, None)
            .unwrap();
        assert_eq!(samples.dims(), [2, 16, 5]);

        assert!(matches!(
            spatial.index(&global_encoding, uv.clone(), None, None, None),
            Err(Error::EncodingMismatch("spatial"))
        ));
        assert!(matches!(
            global.index(&spatial_encoding, uv, None, None, None),
            Err(Error::EncodingMismatch("global"))
        ));
    }

    #[test]
    fn image_encoder_config_round_trips_through_json() {
        let config = small_config(EncoderKind::Global)
            .with_pretrained(Some("https://example.com/backbone.mpk".into()));
        let json = compact_json(&config);
        assert!(json.contains("\"encoder_type\":\"global\""));
        assert!(json.contains("\"backbone\":\"resnet18\""));

        let loaded = ImageEncoderConfig::load_binary(json.as_bytes()).unwrap();
        assert_eq!(loaded.encoder_type, EncoderKind::Global);
        assert_eq!(loaded.global.latent_size, 16);
        assert_eq!(loaded.pretrained, config.pretrained);
    }

    fn compact_json(config: &ImageEncoderConfig) -> String {
        config.to_string().split_whitespace().collect()
    }

    #[test]
    fn pretrained_backbone_is_loaded_from_file() {
        let device = Default::default();
        let source = small_config(EncoderKind::Spatial)
            .init::<Backend>(&device)
            .unwrap();
        let file_path = std::env::temp_dir().join(format!(
            "pixel-sdf-backbone-{}.mpk",
            std::process::id()
        ));
        io::save_record(source.backbone().clone(), &file_path).unwrap();

        let encoder = small_config(EncoderKind::Spatial)
            .with_pretrained(Some(file_path.to_string_lossy().into_owned()))
            .init_pretrained::<Backend>(&device)
            .unwrap();
        std::fs::remove_file(&file_path).unwrap();

        let images =
            Tensor::random([1, 3, 32, 32], Distribution::Default, &device);
        let expected = source.backbone().pooled(images.clone());
        let actual = encoder.backbone().pooled(images);
        actual
            .into_data()
            .assert_approx_eq(&expected.into_data(), 5);

        let missing = small_config(EncoderKind::Global)
            .with_pretrained(Some("/nonexistent/backbone.mpk".into()))
            .init_pretrained::<Backend>(&device);
        assert!(missing.is_err());
    }
}
