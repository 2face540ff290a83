use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported encoder type: {0}")]
    UnsupportedEncoder(String),

    #[error("Unsupported rendering mode: {0}")]
    UnsupportedRenderingMode(String),

    #[error("Unsupported backbone: {0}")]
    UnsupportedBackbone(String),

    #[error("Unsupported sampling option: {0}")]
    UnsupportedSampling(String),

    #[error("Unsupported prior fusion: {0}")]
    UnsupportedPriorFusion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The point batch cannot be split into equally sized groups.
    #[error("Cannot broadcast {groups} groups over {points} points")]
    GroupSize { points: usize, groups: usize },

    #[error("Expected an input width of {expected}, but got {actual}")]
    InputWidth { expected: usize, actual: usize },

    #[error("The point batch is empty")]
    EmptyPoints,

    #[error("The input points are not tracked for gradients")]
    GradientUntracked,

    #[error("Image index {index} is out of range for {capacity} appearance codes")]
    ImageIndex { index: usize, capacity: usize },

    #[error("The encoder requires a depth prior, but none was given")]
    MissingPrior,

    #[error("The image encoding does not belong to a {0} encoder")]
    EncodingMismatch(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
