extern crate anyhow;
extern crate burn;
extern crate image;
extern crate log;
extern crate npyz;
extern crate regex;
extern crate reqwest;
extern crate serde;
extern crate thiserror;
extern crate zip;

pub mod error;
pub mod image_encoder;
pub mod implicit;
pub mod io;
pub mod linear;
pub mod model;
pub mod positional_encoder;
pub mod rendering;
pub mod sampling;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::*;
    pub use crate::{
        image_encoder::{
            EncoderKind, ImageEncoder, ImageEncoderConfig, ImageEncoding,
        },
        implicit::{ImplicitNetwork, ImplicitNetworkConfig, ImplicitOutput},
        model::{ModelConfig, SurfaceModel, SurfaceOutput},
        rendering::{RenderingMode, RenderingNetwork, RenderingNetworkConfig},
    };

    pub use burn::backend;
    pub use burn::prelude::{Config, Module};
}
