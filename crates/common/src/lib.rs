//! rendiff common library
//!
//! Synchronous building blocks shared by the rendiff harness: RGBA rasters,
//! the perceptual image comparator and the declarative case matrix.

pub mod case;
pub mod compare;
pub mod error;
pub mod raster;
pub mod spec;

pub use case::{Backend, CaseDescriptor, CaseMatrix, OutputMode};
pub use compare::{CompareOptions, ComparisonResult, ImageComparator};
pub use error::{Error, Result};
pub use raster::RasterImage;
pub use spec::SpecDocument;

/// rendiff version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
