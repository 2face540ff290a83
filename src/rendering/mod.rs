use crate::*;
use burn::{
    nn::{EmbeddingConfig, Embedding, Initializer},
    prelude::*,
    tensor::activation,
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// How the rendering network assembles its input.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderingMode {
    /// Points, view directions, normals and features.
    Idr,
    /// View directions and features.
    Nerf,
}

#[derive(Config, Debug)]
pub struct RenderingNetworkConfig {
    pub feature_vector_size: usize,
    pub mode: RenderingMode,
    pub dims: Vec<usize>,
    #[config(default = 9)]
    pub d_in: usize,
    #[config(default = 3)]
    pub d_out: usize,
    #[config(default = true)]
    pub weight_norm: bool,
    #[config(default = 0)]
    pub multires_view: usize,
    #[config(default = false)]
    pub per_image_code: bool,
    #[config(default = 1024)]
    pub image_code_capacity: usize,
    #[config(default = 32)]
    pub image_code_size: usize,
}

#[derive(Debug, Module)]
pub struct RenderingNetwork<B: Backend> {
    view_embedder: Option<positional_encoder::PositionalEncoder<B>>,
    image_codes: Option<Embedding<B>>,
    layers: Vec<linear::NormalizedLinear<B>>,
    mode: burn::module::Ignored<RenderingMode>,
    input_size: usize,
}

impl RenderingMode {
    pub fn assemble<B: Backend>(
        &self,
        points: Tensor<B, 2>,
        normals: Tensor<B, 2>,
        view_dirs: Tensor<B, 2>,
        features: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        match self {
            Self::Idr => assemble_idr(points, normals, view_dirs, features),
            Self::Nerf => assemble_nerf(view_dirs, features),
        }
    }
}

fn assemble_idr<B: Backend>(
    points: Tensor<B, 2>,
    normals: Tensor<B, 2>,
    view_dirs: Tensor<B, 2>,
    features: Tensor<B, 2>,
) -> Tensor<B, 2> {
    Tensor::cat(vec![points, view_dirs, normals, features], 1)
}

fn assemble_nerf<B: Backend>(
    view_dirs: Tensor<B, 2>,
    features: Tensor<B, 2>,
) -> Tensor<B, 2> {
    Tensor::cat(vec![view_dirs, features], 1)
}

impl FromStr for RenderingMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "idr" => Ok(Self::Idr),
            "nerf" => Ok(Self::Nerf),
            _ => Err(Error::UnsupportedRenderingMode(mode.into())),
        }
    }
}

impl fmt::Display for RenderingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idr => "idr",
            Self::Nerf => "nerf",
        })
    }
}

impl RenderingNetworkConfig {
    fn view_embedder_config(
        &self,
    ) -> Option<positional_encoder::PositionalEncoderConfig> {
        (self.multires_view > 0).then(|| {
            positional_encoder::PositionalEncoderConfig::new(self.multires_view)
        })
    }

    pub fn get_dims(&self) -> Result<Vec<usize>> {
        if self.d_out == 0 || self.dims.iter().any(|&size| size == 0) {
            return Err(Error::InvalidConfig(
                "Rendering layer sizes must be greater than 0".into(),
            ));
        }

        let mut input_size = self.d_in + self.feature_vector_size;
        if let Some(config) = self.view_embedder_config() {
            input_size += config.get_output_size() - 3;
        }
        if self.per_image_code {
            if self.image_code_capacity == 0 || self.image_code_size == 0 {
                return Err(Error::InvalidConfig(
                    "Appearance codes must have a positive capacity and size"
                        .into(),
                ));
            }
            input_size += self.image_code_size;
        }

        let mut dims = Vec::with_capacity(self.dims.len() + 2);
        dims.push(input_size);
        dims.extend_from_slice(&self.dims);
        dims.push(self.d_out);
        Ok(dims)
    }

    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<RenderingNetwork<B>> {
        let dims = self.get_dims()?;
        log::info!(
            "Rendering network in {} mode with dims {:?}",
            self.mode,
            dims
        );

        let view_embedder = self
            .view_embedder_config()
            .map(|config| config.init(device))
            .transpose()?;
        let image_codes = self.per_image_code.then(|| {
            EmbeddingConfig::new(self.image_code_capacity, self.image_code_size)
                .with_initializer(Initializer::Uniform {
                    min: -1e-4,
                    max: 1e-4,
                })
                .init(device)
        });
        let layers = dims
            .windows(2)
            .map(|sizes| {
                linear::NormalizedLinearConfig::new(sizes[0], sizes[1])
                    .with_weight_norm(self.weight_norm)
                    .init(device)
            })
            .collect();

        Ok(RenderingNetwork {
            view_embedder,
            image_codes,
            layers,
            mode: burn::module::Ignored(self.mode),
            input_size: dims[0],
        })
    }
}

impl<B: Backend> RenderingNetwork<B> {
    /// Returns `[N, 3]` colors in `[0, 1]`.
    ///
    /// `image_index` selects the appearance code shared by the whole batch
    /// and is ignored without per-image codes.
    pub fn forward(
        &self,
        points: Tensor<B, 2>,
        normals: Tensor<B, 2>,
        view_dirs: Tensor<B, 2>,
        features: Tensor<B, 2>,
        image_index: usize,
    ) -> Result<Tensor<B, 2>> {
        let view_dirs = match &self.view_embedder {
            Some(embedder) => embedder.forward(view_dirs),
            None => view_dirs,
        };
        let mut inputs =
            self.mode.0.assemble(points, normals, view_dirs, features);

        if let Some(image_codes) = &self.image_codes {
            let [capacity, code_size] = image_codes.weight.dims();
            if image_index >= capacity {
                return Err(Error::ImageIndex {
                    index: image_index,
                    capacity,
                });
            }
            let size = inputs.dims()[0];
            let image_code = image_codes
                .weight
                .val()
                .slice([image_index..image_index + 1, 0..code_size])
                .expand([size, code_size]);
            inputs = Tensor::cat(vec![inputs, image_code], 1);
        }

        let width = inputs.dims()[1];
        if width != self.input_size {
            return Err(Error::InputWidth {
                expected: self.input_size,
                actual: width,
            });
        }

        let last = self.layers.len() - 1;
        let mut outputs = inputs;
        for (index, layer) in self.layers.iter().enumerate() {
            outputs = layer.forward(outputs);
            if index < last {
                outputs = activation::relu(outputs);
            }
        }

        Ok(activation::sigmoid(outputs))
    }

    pub fn mode(&self) -> RenderingMode {
        self.mode.0
    }

    pub fn layers(&self) -> &[linear::NormalizedLinear<B>] {
        &self.layers
    }

    pub fn image_code(&self, image_index: usize) -> Option<Tensor<B, 1>> {
        let image_codes = self.image_codes.as_ref()?;
        let [capacity, code_size] = image_codes.weight.dims();
        (image_index < capacity).then(|| {
            image_codes
                .weight
                .val()
                .slice([image_index..image_index + 1, 0..code_size])
                .squeeze::<1>(0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;

    type Backend = burn::backend::NdArray;

    struct Inputs {
        points: Tensor<Backend, 2>,
        normals: Tensor<Backend, 2>,
        view_dirs: Tensor<Backend, 2>,
        features: Tensor<Backend, 2>,
    }

    fn random_inputs(size: usize, feature_vector_size: usize) -> Inputs {
        let device = Default::default();
        Inputs {
            points: Tensor::random([size, 3], Distribution::Default, &device),
            normals: Tensor::random([size, 3], Distribution::Default, &device),
            view_dirs: Tensor::random(
                [size, 3],
                Distribution::Default,
                &device,
            ),
            features: Tensor::random(
                [size, feature_vector_size],
                Distribution::Default,
                &device,
            ),
        }
    }

    #[test]
    fn rendering_mode_parsing() {
        assert_eq!("idr".parse::<RenderingMode>().unwrap(), RenderingMode::Idr);
        assert_eq!(
            "nerf".parse::<RenderingMode>().unwrap(),
            RenderingMode::Nerf
        );
        assert!(matches!(
            "volsdf".parse::<RenderingMode>(),
            Err(Error::UnsupportedRenderingMode(mode)) if mode == "volsdf"
        ));
        assert_eq!(RenderingMode::Nerf.to_string(), "nerf");
    }

    #[test]
    fn rendering_network_dims() {
        let config =
            RenderingNetworkConfig::new(256, RenderingMode::Idr, vec![256; 4])
                .with_multires_view(4)
                .with_per_image_code(true);
        assert_eq!(
            config.get_dims().unwrap(),
            vec![9 + 256 + 24 + 32, 256, 256, 256, 256, 3]
        );

        let config =
            RenderingNetworkConfig::new(16, RenderingMode::Nerf, vec![8])
                .with_d_in(3);
        assert_eq!(config.get_dims().unwrap(), vec![19, 8, 3]);
    }

    #[test]
    fn rendering_network_idr_output() {
        let device = Default::default();
        let network =
            RenderingNetworkConfig::new(8, RenderingMode::Idr, vec![16, 16])
                .with_multires_view(4)
                .init::<Backend>(&device)
                .unwrap();
        assert_eq!(network.mode(), RenderingMode::Idr);
        assert_eq!(network.layers().len(), 3);

        let inputs = random_inputs(10, 8);
        let colors = network
            .forward(
                inputs.points,
                inputs.normals,
                inputs.view_dirs,
                inputs.features,
                0,
            )
            .unwrap();
        assert_eq!(colors.dims(), [10, 3]);

        let colors = colors.into_data().to_vec::<f32>().unwrap();
        assert!(colors.iter().all(|value| (0.0..=1.0).contains(value)));
    }

    #[test]
    fn rendering_network_nerf_ignores_geometry() {
        let device = Default::default();
        let network =
            RenderingNetworkConfig::new(8, RenderingMode::Nerf, vec![16])
                .with_d_in(3)
                .init::<Backend>(&device)
                .unwrap();

        let inputs = random_inputs(5, 8);
        let others = random_inputs(5, 8);
        let colors = network
            .forward(
                inputs.points,
                inputs.normals,
                inputs.view_dirs.clone(),
                inputs.features.clone(),
                0,
            )
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let colors_other = network
            .forward(
                others.points,
                others.normals,
                inputs.view_dirs,
                inputs.features,
                0,
            )
            .unwrap()
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(colors, colors_other);
    }

    #[test]
    fn rendering_network_image_codes() {
        let device = Default::default();
        let network =
            RenderingNetworkConfig::new(4, RenderingMode::Idr, vec![16])
                .with_per_image_code(true)
                .with_image_code_capacity(8)
                .with_image_code_size(6)
                .init::<Backend>(&device)
                .unwrap();

        let code = network.image_code(7).unwrap();
        assert_eq!(code.dims(), [6]);
        let code = code.into_data().to_vec::<f32>().unwrap();
        assert!(code.iter().all(|value| value.abs() <= 1e-4));
        assert!(network.image_code(8).is_none());

        let inputs = random_inputs(3, 4);
        let colors = network
            .forward(
                inputs.points.clone(),
                inputs.normals.clone(),
                inputs.view_dirs.clone(),
                inputs.features.clone(),
                7,
            )
            .unwrap();
        assert_eq!(colors.dims(), [3, 3]);

        let result = network.forward(
            inputs.points,
            inputs.normals,
            inputs.view_dirs,
            inputs.features,
            8,
        );
        assert!(matches!(
            result,
            Err(Error::ImageIndex {
                index: 8,
                capacity: 8
            })
        ));
    }

    #[test]
    fn rendering_network_input_width() {
        let device = Default::default();
        let network =
            RenderingNetworkConfig::new(4, RenderingMode::Idr, vec![16])
                .init::<Backend>(&device)
                .unwrap();

        let inputs = random_inputs(3, 5);
        let result = network.forward(
            inputs.points,
            inputs.normals,
            inputs.view_dirs,
            inputs.features,
            0,
        );
        assert!(matches!(
            result,
            Err(Error::InputWidth {
                expected: 13,
                actual: 14
            })
        ));
    }
}
