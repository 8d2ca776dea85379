//! Error types for the rendiff core types

use thiserror::Error;

/// Result type alias using the rendiff common Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the pure (non-async) layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Comparator precondition: both rasters must share dimensions.
    #[error("Image dimensions differ: reference {reference:?} vs candidate {candidate:?}")]
    DimensionMismatch {
        reference: (u32, u32),
        candidate: (u32, u32),
    },

    #[error("Pixel buffer of {len} bytes does not fit a {width}x{height} RGBA image")]
    BufferSize { width: u32, height: u32, len: usize },

    #[error("Invalid case matrix: {0}")]
    InvalidMatrix(String),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
}
