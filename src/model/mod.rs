use crate::{image_encoder::*, implicit::*, rendering::*, *};
use burn::prelude::*;

/// Encoder, signed distance and rendering configuration of one model.
///
/// The encoder output takes the place of the pixel-aligned features of the
/// implicit network.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub encoder: ImageEncoderConfig,
    pub implicit: ImplicitNetworkConfig,
    pub rendering: RenderingNetworkConfig,
}

#[derive(Debug, Module)]
pub struct SurfaceModel<B: Backend> {
    implicit: ImplicitNetwork<B>,
    rendering: RenderingNetwork<B>,
}

#[derive(Clone, Debug)]
pub struct SurfaceOutput<B: Backend> {
    /// `[N, 1]`
    pub sdf: Tensor<B, 2>,
    /// `[N, F]`
    pub features: Tensor<B, 2>,
    /// `[N, 3]`
    pub gradients: Tensor<B, 2>,
    /// `[N, 3]`
    pub rgb: Tensor<B, 2>,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        let latent_size = self.encoder.get_latent_size();
        if self.implicit.pixel_feature_size != latent_size {
            return Err(Error::InvalidConfig(format!(
                "Pixel feature size {} does not match the encoder latent size {}",
                self.implicit.pixel_feature_size, latent_size
            )));
        }
        if self.rendering.feature_vector_size
            != self.implicit.feature_vector_size
        {
            return Err(Error::InvalidConfig(format!(
                "Rendering feature size {} does not match the implicit feature size {}",
                self.rendering.feature_vector_size,
                self.implicit.feature_vector_size
            )));
        }
        Ok(())
    }

    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<SurfaceModel<B>> {
        self.validate()?;

        Ok(SurfaceModel {
            implicit: self.implicit.init(device)?,
            rendering: self.rendering.init(device)?,
        })
    }

    pub fn init_encoder<B: Backend>(
        &self,
        device: &B::Device,
    ) -> anyhow::Result<ImageEncoder<B>> {
        self.validate()?;
        self.encoder.init_pretrained(device)
    }
}

impl<B: Backend> SurfaceModel<B> {
    /// Signed distances, features, normals and colors of one point batch.
    ///
    /// `latent` and `conditions` are grouped over the points as in
    /// [`ImplicitNetwork::forward`]. The view directions hold one row per point.
    pub fn query(
        &self,
        points: Tensor<B, 2>,
        latent: Tensor<B, 2>,
        conditions: Tensor<B, 2>,
        view_dirs: Tensor<B, 2>,
        image_index: usize,
    ) -> Result<SurfaceOutput<B>> {
        let ImplicitOutput {
            sdf,
            features,
            gradients,
        } = self
            .implicit
            .get_outputs(points.clone(), latent, conditions)?;
        let rgb = self.rendering.forward(
            points,
            gradients.clone(),
            view_dirs,
            features.clone(),
            image_index,
        )?;

        Ok(SurfaceOutput {
            sdf,
            features,
            gradients,
            rgb,
        })
    }

    pub fn implicit(&self) -> &ImplicitNetwork<B> {
        &self.implicit
    }

    pub fn rendering(&self) -> &RenderingNetwork<B> {
        &self.rendering
    }
}
