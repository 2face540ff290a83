use crate::*;
use burn::{
    prelude::*,
    tensor::{activation, backend::AutodiffBackend, Distribution},
};
use std::f64::consts::PI;

pub const SOFTPLUS_BETA: f64 = 100.0;

/// Configuration of the signed distance network.
///
/// The first layer width is the (encoded) point size plus the pixel-aligned,
/// global and class feature sizes. The conditioning features and the latent
/// codes given to [`ImplicitNetwork::forward`] must carry those features
/// between them, in that channel order.
#[derive(Config, Debug)]
pub struct ImplicitNetworkConfig {
    pub feature_vector_size: usize,
    pub dims: Vec<usize>,
    #[config(default = 0.0)]
    pub sdf_bounding_sphere: f32,
    #[config(default = 3)]
    pub d_in: usize,
    #[config(default = 1)]
    pub d_out: usize,
    #[config(default = true)]
    pub geometric_init: bool,
    #[config(default = 1.0)]
    pub bias: f32,
    #[config(default = "Some(4)")]
    pub skip_layer: Option<usize>,
    #[config(default = true)]
    pub weight_norm: bool,
    #[config(default = 0)]
    pub multires: usize,
    #[config(default = 1.0)]
    pub sphere_scale: f32,
    #[config(default = false)]
    pub inside_outside: bool,
    #[config(default = 64)]
    pub pixel_feature_size: usize,
    #[config(default = 0)]
    pub global_feature_size: usize,
    #[config(default = 0)]
    pub class_feature_size: usize,
}

#[derive(Debug, Module)]
pub struct ImplicitNetwork<B: Backend> {
    embedder: Option<positional_encoder::PositionalEncoder<B>>,
    layers: Vec<linear::NormalizedLinear<B>>,
    skip_layer: Option<usize>,
    dims: Vec<usize>,
    input_size: usize,
    point_size: usize,
    sdf_bounding_sphere: f32,
    sphere_scale: f32,
}

#[derive(Clone, Debug)]
pub struct ImplicitOutput<B: Backend> {
    /// `[N, 1]`
    pub sdf: Tensor<B, 2>,
    /// `[N, F]`
    pub features: Tensor<B, 2>,
    /// `[N, 3]`
    pub gradients: Tensor<B, 2>,
}

impl ImplicitNetworkConfig {
    fn embedder_config(&self) -> Option<positional_encoder::PositionalEncoderConfig> {
        (self.multires > 0).then(|| {
            positional_encoder::PositionalEncoderConfig::new(self.multires)
                .with_input_size(self.d_in)
        })
    }

    pub fn get_point_size(&self) -> usize {
        self.embedder_config()
            .map_or(self.d_in, |config| config.get_output_size())
    }

    /// Width of every layer boundary, from the network input to its output.
    pub fn get_dims(&self) -> Result<Vec<usize>> {
        if self.d_in == 0 || self.d_out == 0 {
            return Err(Error::InvalidConfig(
                "Input and output sizes must be greater than 0".into(),
            ));
        }
        if self.dims.iter().any(|&size| size == 0) {
            return Err(Error::InvalidConfig(
                "Hidden layer sizes must be greater than 0".into(),
            ));
        }

        let mut dims = Vec::with_capacity(self.dims.len() + 2);
        dims.push(
            self.get_point_size()
                + self.pixel_feature_size
                + self.global_feature_size
                + self.class_feature_size,
        );
        dims.extend_from_slice(&self.dims);
        dims.push(self.d_out + self.feature_vector_size);

        if let Some(skip_layer) = self.skip_layer {
            if skip_layer == 0 || skip_layer >= dims.len() - 1 {
                return Err(Error::InvalidConfig(format!(
                    "Skip layer {} is outside of layers 1..{}",
                    skip_layer,
                    dims.len() - 1
                )));
            }
            dims[skip_layer] = dims[0];
        }

        Ok(dims)
    }

    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<ImplicitNetwork<B>> {
        let dims = self.get_dims()?;
        log::info!(
            "Implicit network with multires {} and dims {:?}",
            self.multires,
            dims
        );

        let embedder = self
            .embedder_config()
            .map(|config| config.init(device))
            .transpose()?;
        let layers = (0..dims.len() - 1)
            .map(|index| self.init_layer(&dims, index, device))
            .collect();

        Ok(ImplicitNetwork {
            embedder,
            layers,
            skip_layer: self.skip_layer,
            input_size: self.d_in,
            point_size: self.get_point_size(),
            dims,
            sdf_bounding_sphere: self.sdf_bounding_sphere,
            sphere_scale: self.sphere_scale,
        })
    }

    /// Geometric initialization, so that the network starts close to the
    /// signed distance of a sphere of radius `bias`.
    fn init_layer<B: Backend>(
        &self,
        dims: &[usize],
        index: usize,
        device: &B::Device,
    ) -> linear::NormalizedLinear<B> {
        let input_size = dims[index];
        let output_size = dims[index + 1];
        let config = linear::NormalizedLinearConfig::new(input_size, output_size)
            .with_weight_norm(self.weight_norm);

        if !self.geometric_init {
            return config.init(device);
        }

        if index == dims.len() - 2 {
            let mean = PI.sqrt() / (input_size as f64).sqrt();
            let (mean, bias) = if self.inside_outside {
                (-mean, self.bias)
            } else {
                (mean, -self.bias)
            };
            return config.init_with(
                Tensor::random(
                    [input_size, output_size],
                    Distribution::Normal(mean, 1e-4),
                    device,
                ),
                Tensor::full([output_size], bias, device),
            );
        }

        let std = 2.0f64.sqrt() / (output_size as f64).sqrt();
        let weight = Tensor::random(
            [input_size, output_size],
            Distribution::Normal(0.0, std),
            device,
        );
        let is_encoded = self.multires > 0;
        let weight = if is_encoded
            && (index == 0 || Some(index) == self.skip_layer)
        {
            // Only the raw coordinates pass through at start.
            zero_rows(weight, self.d_in)
        } else {
            weight
        };

        config.init_with(weight, Tensor::zeros([output_size], device))
    }
}

fn zero_rows<B: Backend>(weight: Tensor<B, 2>, from: usize) -> Tensor<B, 2> {
    let [input_size, output_size] = weight.dims();
    if from >= input_size {
        return weight;
    }
    let zeros =
        Tensor::zeros([input_size - from, output_size], &weight.device());
    weight.slice_assign([from..input_size, 0..output_size], zeros)
}

impl<B: Backend> ImplicitNetwork<B> {
    /// Returns `[N, 1 + F]`, the signed distance followed by the feature vector.
    ///
    /// `latent` and `conditions` hold one row per group of points and are
    /// repeated over the consecutive points of their group.
    pub fn forward(
        &self,
        points: Tensor<B, 2>,
        latent: Tensor<B, 2>,
        conditions: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>> {
        let inputs = self.assemble_inputs(points, latent, conditions)?;
        Ok(self.propagate(inputs).0)
    }

    /// Signed distances clamped by the bounding sphere, without gradients.
    pub fn get_sdf_vals(
        &self,
        points: Tensor<B, 2>,
        latent: Tensor<B, 2>,
        conditions: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>> {
        let size = points.dims()[0];
        let sdf = self
            .forward(points.clone(), latent, conditions)?
            .slice([0..size, 0..1]);

        Ok(match self.sphere_sdf(points) {
            Some(sphere_sdf) => sdf.min_pair(sphere_sdf),
            None => sdf,
        })
    }

    /// Clamped signed distances, features and the gradients of the clamped
    /// distances with respect to the points.
    ///
    /// The gradients are built from tensor operations, so they stay
    /// differentiable on an autodiff backend.
    pub fn get_outputs(
        &self,
        points: Tensor<B, 2>,
        latent: Tensor<B, 2>,
        conditions: Tensor<B, 2>,
    ) -> Result<ImplicitOutput<B>> {
        let inputs =
            self.assemble_inputs(points.clone(), latent, conditions)?;
        let (outputs, pre_activations) = self.propagate(inputs);
        let gradients = self.backpropagate(points.clone(), &pre_activations);

        let [size, width] = outputs.dims();
        let sdf = outputs.clone().slice([0..size, 0..1]);
        let features = outputs.slice([0..size, 1..width]);

        let (sdf, gradients) = match self.sphere_sdf(points.clone()) {
            Some(sphere_sdf) => {
                let clamped = sphere_sdf.clone().lower(sdf.clone()).float();
                let norms = points
                    .clone()
                    .powf_scalar(2.0)
                    .sum_dim(1)
                    .sqrt()
                    .clamp_min(1e-12);
                let sphere_gradients =
                    points / norms * (-self.sphere_scale);
                let gradients = gradients * (-clamped.clone() + 1.0)
                    + sphere_gradients * clamped;
                (sdf.min_pair(sphere_sdf), gradients)
            }
            None => (sdf, gradients),
        };

        Ok(ImplicitOutput {
            sdf,
            features,
            gradients,
        })
    }

    /// Gradient of the unclamped signed distance with respect to the points,
    /// in closed form.
    pub fn analytic_gradient(
        &self,
        points: Tensor<B, 2>,
        latent: Tensor<B, 2>,
        conditions: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>> {
        let inputs =
            self.assemble_inputs(points.clone(), latent, conditions)?;
        let (_, pre_activations) = self.propagate(inputs);
        Ok(self.backpropagate(points, &pre_activations))
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn layers(&self) -> &[linear::NormalizedLinear<B>] {
        &self.layers
    }

    pub fn skip_layer(&self) -> Option<usize> {
        self.skip_layer
    }

    pub fn feature_vector_size(&self) -> usize {
        self.dims[self.dims.len() - 1] - 1
    }

    fn assemble_inputs(
        &self,
        points: Tensor<B, 2>,
        latent: Tensor<B, 2>,
        conditions: Tensor<B, 2>,
    ) -> Result<Tensor<B, 2>> {
        let [size, point_width] = points.dims();
        if size == 0 {
            return Err(Error::EmptyPoints);
        }
        if point_width != self.input_size {
            return Err(Error::InputWidth {
                expected: self.input_size,
                actual: point_width,
            });
        }

        let mut parts = vec![match &self.embedder {
            Some(embedder) => embedder.forward(points),
            None => points,
        }];
        for features in [conditions, latent] {
            if features.dims()[1] > 0 {
                parts.push(repeat_interleave(features, size)?);
            }
        }

        let inputs = Tensor::cat(parts, 1);
        let width = inputs.dims()[1];
        if width != self.dims[0] {
            return Err(Error::InputWidth {
                expected: self.dims[0],
                actual: width,
            });
        }

        Ok(inputs)
    }

    /// Returns the outputs and the pre-activations of every hidden layer.
    fn propagate(
        &self,
        inputs: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Vec<Tensor<B, 2>>) {
        let last = self.layers.len() - 1;
        let mut pre_activations = Vec::with_capacity(last);
        let mut outputs = inputs.clone();

        for (index, layer) in self.layers.iter().enumerate() {
            if Some(index) == self.skip_layer {
                outputs = outputs + inputs.clone();
            }
            outputs = layer.forward(outputs);
            if index < last {
                pre_activations.push(outputs.clone());
                outputs = softplus(outputs, SOFTPLUS_BETA);
            }
        }

        (outputs, pre_activations)
    }

    fn backpropagate(
        &self,
        points: Tensor<B, 2>,
        pre_activations: &[Tensor<B, 2>],
    ) -> Tensor<B, 2> {
        let size = points.dims()[0];
        let last = self.layers.len() - 1;

        let weight = self.layers[last].weight();
        let input_size = weight.dims()[0];
        let mut gradients = Tensor::ones([size, 1], &points.device())
            .matmul(weight.slice([0..input_size, 0..1]).transpose());
        let mut skip_gradients = None;

        for index in (0..last).rev() {
            if Some(index + 1) == self.skip_layer {
                skip_gradients = Some(gradients.clone());
            }
            gradients = gradients
                * activation::sigmoid(
                    pre_activations[index].clone() * SOFTPLUS_BETA,
                );
            gradients =
                gradients.matmul(self.layers[index].weight().transpose());
        }

        if let Some(skip_gradients) = skip_gradients {
            gradients = gradients + skip_gradients;
        }
        let gradients = gradients.slice([0..size, 0..self.point_size]);

        match &self.embedder {
            Some(embedder) => embedder.backward(points, gradients),
            None => gradients,
        }
    }

    fn sphere_sdf(&self, points: Tensor<B, 2>) -> Option<Tensor<B, 2>> {
        (self.sdf_bounding_sphere > 0.0).then(|| {
            (-points.powf_scalar(2.0).sum_dim(1).sqrt()
                + self.sdf_bounding_sphere)
                * self.sphere_scale
        })
    }
}

impl<B: AutodiffBackend> ImplicitNetwork<B> {
    /// Gradient of the unclamped signed distance with respect to the points,
    /// by reverse-mode differentiation.
    ///
    /// The points are differentiated as a fresh tracked leaf, so untracked
    /// points and points derived from other tracked tensors both work.
    pub fn gradient(
        &self,
        points: Tensor<B, 2>,
        latent: Tensor<B, 2>,
        conditions: Tensor<B, 2>,
    ) -> Result<Tensor<B::InnerBackend, 2>> {
        let points = Tensor::<B, 2>::from_inner(points.inner()).require_grad();
        let size = points.dims()[0];

        let sdf = self
            .forward(points.clone(), latent, conditions)?
            .slice([0..size, 0..1]);
        let gradients = sdf.sum().backward();

        points.grad(&gradients).ok_or(Error::GradientUntracked)
    }
}

/// Repeats every row of `tensor` over `size / rows` consecutive rows.
pub fn repeat_interleave<B: Backend>(
    tensor: Tensor<B, 2>,
    size: usize,
) -> Result<Tensor<B, 2>> {
    let [groups, width] = tensor.dims();
    if groups == 0 || size % groups != 0 {
        return Err(Error::GroupSize {
            points: size,
            groups,
        });
    }

    Ok(tensor
        .unsqueeze_dim::<3>(1)
        .repeat_dim(1, size / groups)
        .reshape([size, width]))
}

/// Smooth approximation of ReLU, `log(1 + exp(beta * x)) / beta`.
pub fn softplus<B: Backend, const D: usize>(
    tensor: Tensor<B, D>,
    beta: f64,
) -> Tensor<B, D> {
    let smooth = (tensor.clone() * beta).abs().neg().exp().log1p() / beta;
    activation::relu(tensor) + smooth
}
