use burn::{module::Param, prelude::*, tensor::Distribution};

#[derive(Config, Debug)]
pub struct NormalizedLinearConfig {
    pub input_size: usize,
    pub output_size: usize,
    #[config(default = true)]
    pub weight_norm: bool,
}

/// Linear layer whose weight is optionally split into a direction and a magnitude.
///
/// The weight is laid out as `[input_size, output_size]`.
/// With weight normalization the effective weight of every output unit is
/// `magnitude * direction / ‖direction‖`, the norm taken over the inputs.
#[derive(Debug, Module)]
pub struct NormalizedLinear<B: Backend> {
    direction: Param<Tensor<B, 2>>,
    magnitude: Option<Param<Tensor<B, 2>>>,
    bias: Param<Tensor<B, 1>>,
}

impl NormalizedLinearConfig {
    /// Uniform initialization in `±1/√input_size` for both weight and bias.
    pub fn init<B: Backend>(&self, device: &B::Device) -> NormalizedLinear<B> {
        let bound = 1.0 / (self.input_size.max(1) as f64).sqrt();
        self.init_with(
            Tensor::random(
                [self.input_size, self.output_size],
                Distribution::Uniform(-bound, bound),
                device,
            ),
            Tensor::random(
                [self.output_size],
                Distribution::Uniform(-bound, bound),
                device,
            ),
        )
    }

    pub fn init_with<B: Backend>(
        &self,
        weight: Tensor<B, 2>,
        bias: Tensor<B, 1>,
    ) -> NormalizedLinear<B> {
        let magnitude = self
            .weight_norm
            .then(|| Param::from_tensor(column_norm(weight.clone())));

        NormalizedLinear {
            direction: Param::from_tensor(weight),
            magnitude,
            bias: Param::from_tensor(bias),
        }
    }
}

impl<B: Backend> NormalizedLinear<B> {
    pub fn forward(&self, inputs: Tensor<B, 2>) -> Tensor<B, 2> {
        inputs.matmul(self.weight()) + self.bias.val().unsqueeze::<2>()
    }

    pub fn weight(&self) -> Tensor<B, 2> {
        let direction = self.direction.val();
        match &self.magnitude {
            Some(magnitude) => {
                direction.clone() * (magnitude.val() / column_norm(direction))
            }
            None => direction,
        }
    }

    pub fn bias(&self) -> Tensor<B, 1> {
        self.bias.val()
    }

    pub fn input_size(&self) -> usize {
        self.direction.dims()[0]
    }

    pub fn output_size(&self) -> usize {
        self.direction.dims()[1]
    }

    pub fn is_weight_normalized(&self) -> bool {
        self.magnitude.is_some()
    }
}

fn column_norm<B: Backend>(weight: Tensor<B, 2>) -> Tensor<B, 2> {
    weight.powf_scalar(2.0).sum_dim(0).sqrt()
}
