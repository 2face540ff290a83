use crate::*;
use burn::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SampleInterpolation {
    #[default]
    Bilinear,
    Nearest,
}

/// Handling of sampling coordinates outside of `[-1, 1]`.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SamplePadding {
    Zeros,
    #[default]
    Border,
    Reflection,
}

impl FromStr for SampleInterpolation {
    type Err = Error;

    fn from_str(interpolation: &str) -> Result<Self> {
        match interpolation {
            "bilinear" => Ok(Self::Bilinear),
            "nearest" => Ok(Self::Nearest),
            _ => Err(Error::UnsupportedSampling(interpolation.into())),
        }
    }
}

impl FromStr for SamplePadding {
    type Err = Error;

    fn from_str(padding: &str) -> Result<Self> {
        match padding {
            "zeros" => Ok(Self::Zeros),
            "border" => Ok(Self::Border),
            "reflection" => Ok(Self::Reflection),
            _ => Err(Error::UnsupportedSampling(padding.into())),
        }
    }
}

/// Samples `features` of `[B, C, H, W]` at `grid` of `[B, N, 2]`, returning `[B, C, N]`.
///
/// The grid holds `(x, y)` pairs where `-1` and `1` are the centers of the
/// first and last pixels along each axis.
pub fn grid_sample<B: Backend>(
    features: Tensor<B, 4>,
    grid: Tensor<B, 3>,
    interpolation: SampleInterpolation,
    padding: SamplePadding,
) -> Tensor<B, 3> {
    let [batch, channels, height, width] = features.dims();
    let [grid_batch, size, _] = grid.dims();

    let x = unnormalize(
        grid.clone().slice([0..grid_batch, 0..size, 0..1]).squeeze::<2>(2),
        width,
        padding,
    );
    let y = unnormalize(
        grid.slice([0..grid_batch, 0..size, 1..2]).squeeze::<2>(2),
        height,
        padding,
    );
    let taps = Taps {
        features: features.reshape([batch, channels, height * width]),
        height,
        width,
        padding,
    };

    match interpolation {
        SampleInterpolation::Nearest => {
            // Ties round to the even pixel.
            let x = x.detach().round();
            let y = y.detach().round();
            let weights = x.ones_like();
            taps.sample(x, y, weights)
        }
        SampleInterpolation::Bilinear => {
            let x0 = x.clone().detach().floor();
            let y0 = y.clone().detach().floor();
            let x1 = x0.clone() + 1.0;
            let y1 = y0.clone() + 1.0;
            let wx1 = x - x0.clone();
            let wy1 = y - y0.clone();
            let wx0 = -wx1.clone() + 1.0;
            let wy0 = -wy1.clone() + 1.0;

            taps.sample(x0.clone(), y0.clone(), wx0.clone() * wy0.clone())
                + taps.sample(x1.clone(), y0, wx1.clone() * wy0)
                + taps.sample(x0, y1.clone(), wx0 * wy1.clone())
                + taps.sample(x1, y1, wx1 * wy1)
        }
    }
}

fn unnormalize<B: Backend>(
    coordinates: Tensor<B, 2>,
    size: usize,
    padding: SamplePadding,
) -> Tensor<B, 2> {
    let extent = size.saturating_sub(1) as f64;
    let coordinates = (coordinates + 1.0) * (extent / 2.0);

    match padding {
        SamplePadding::Zeros => coordinates,
        SamplePadding::Border => coordinates.clamp(0.0, extent),
        SamplePadding::Reflection => {
            reflect(coordinates, extent).clamp(0.0, extent)
        }
    }
}

/// Folds coordinates back into `[0, extent]` by mirroring at both ends.
fn reflect<B: Backend>(coordinates: Tensor<B, 2>, extent: f64) -> Tensor<B, 2> {
    if extent == 0.0 {
        return coordinates.zeros_like();
    }
    let period = 2.0 * extent;
    let coordinates = coordinates.abs();
    let folded = coordinates.clone()
        - (coordinates.detach() / period).floor() * period;

    -(folded - extent).abs() + extent
}

struct Taps<B: Backend> {
    features: Tensor<B, 3>,
    height: usize,
    width: usize,
    padding: SamplePadding,
}

impl<B: Backend> Taps<B> {
    fn sample(
        &self,
        x: Tensor<B, 2>,
        y: Tensor<B, 2>,
        weights: Tensor<B, 2>,
    ) -> Tensor<B, 3> {
        let x_max = self.width.saturating_sub(1) as f64;
        let y_max = self.height.saturating_sub(1) as f64;

        let weights = match self.padding {
            SamplePadding::Zeros => {
                let inside = x.clone().greater_equal_elem(0.0).float()
                    * x.clone().lower_equal_elem(x_max).float()
                    * y.clone().greater_equal_elem(0.0).float()
                    * y.clone().lower_equal_elem(y_max).float();
                weights * inside
            }
            _ => weights,
        };

        let x = x.clamp(0.0, x_max);
        let y = y.clamp(0.0, y_max);
        let indices = (y * self.width as f64 + x + 0.5).int();

        let [batch, channels, _] = self.features.dims();
        let size = indices.dims()[1];
        let indices =
            indices.unsqueeze_dim::<3>(1).expand([batch, channels, size]);

        self.features.clone().gather(2, indices)
            * weights.unsqueeze_dim::<3>(1)
    }
}
